//! Persistent FIFO of undelivered batches using heed (LMDB).
//!
//! Batches that could not be delivered after all attempts are kept here and
//! drained oldest-first once the backend accepts requests again. The spool
//! is bounded; when full, the oldest entry is evicted.

use std::{
   borrow::Cow,
   path::{Path, PathBuf},
   sync::Arc,
};

use heed::{Database, Env, EnvOpenOptions, types::SerdeBincode};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use smol_str::SmolStr;
use thiserror::Error;

use crate::error::Result;

/// Errors that can occur in spool operations.
#[derive(Error, Debug)]
pub enum SpoolError {
   #[error("Failed to create spool directory: {0}")]
   CreateDirectory(#[from] std::io::Error),

   #[error("Failed to open heed environment: {0}")]
   OpenEnvironment(heed::Error),

   #[error("Database transaction error: {0}")]
   Transaction(heed::Error),

   #[error("Database operation error: {0}")]
   DatabaseOperation(heed::Error),

   #[error("Could not find local data directory")]
   DataDirectoryNotFound,
}

/// Big-endian sequence number, so LMDB key order is insertion order.
struct SeqCodec;

impl<'a> heed::BytesEncode<'a> for SeqCodec {
   type EItem = u64;
   fn bytes_encode(item: &'a Self::EItem) -> std::result::Result<Cow<'a, [u8]>, heed::BoxedError> {
      Ok(Cow::Owned(item.to_be_bytes().to_vec()))
   }
}

impl<'a> heed::BytesDecode<'a> for SeqCodec {
   type DItem = u64;
   fn bytes_decode(bytes: &'a [u8]) -> std::result::Result<Self::DItem, heed::BoxedError> {
      let Ok(b) = bytes.try_into() else {
         return Err(heed::BoxedError::from(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            "Invalid spool key",
         )));
      };
      Ok(u64::from_be_bytes(b))
   }
}

/// A batch body waiting for delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpooledBatch {
   pub device: SmolStr,
   pub batch_id: u64,
   pub spooled_at_ms: u64,
   pub body: Vec<u8>,
}

#[derive(Debug)]
struct Db {
   env: Env,
   /// Sequence -> `SpooledBatch`
   batches: Database<SeqCodec, SerdeBincode<SpooledBatch>>,
}

/// Thread-safe handle to the spool database.
#[derive(Clone, Debug)]
pub struct Spool {
   db: Arc<Db>,
   capacity: usize,
}

impl Spool {
   /// Opens or creates the spool at the default location.
   pub fn open(capacity: usize) -> Result<Self> {
      Self::open_at(&Self::db_path()?, capacity)
   }

   pub fn open_at(path: &Path, capacity: usize) -> Result<Self> {
      std::fs::create_dir_all(path).map_err(SpoolError::CreateDirectory)?;

      let env = unsafe {
         EnvOpenOptions::new()
            .map_size(64 * 1024 * 1024)
            .max_dbs(1)
            .open(path)
            .map_err(SpoolError::OpenEnvironment)?
      };

      let mut wtxn = env.write_txn().map_err(SpoolError::Transaction)?;
      let batches = env
         .create_database(&mut wtxn, Some("batches"))
         .map_err(SpoolError::DatabaseOperation)?;
      wtxn.commit().map_err(SpoolError::Transaction)?;

      Ok(Self {
         db: Arc::new(Db { env, batches }),
         capacity: capacity.max(1),
      })
   }

   fn db_path() -> Result<PathBuf> {
      if let Ok(path) = std::env::var("WEARLINK_SPOOL_PATH") {
         return Ok(PathBuf::from(path));
      }

      // ~/.local/share/wearlinkd/spool
      let base = dirs::data_local_dir().ok_or(SpoolError::DataDirectoryNotFound)?;
      Ok(base.join("wearlinkd").join("spool"))
   }

   /// Appends a batch, evicting the oldest entries beyond capacity.
   ///
   /// Returns the number of evicted entries.
   pub fn push(&self, batch: &SpooledBatch) -> Result<usize> {
      let mut wtxn = self.db.env.write_txn().map_err(SpoolError::Transaction)?;
      let next = self
         .db
         .batches
         .last(&wtxn)
         .map_err(SpoolError::DatabaseOperation)?
         .map_or(0, |(seq, _)| seq + 1);
      self
         .db
         .batches
         .put(&mut wtxn, &next, batch)
         .map_err(SpoolError::DatabaseOperation)?;

      let mut evicted = 0;
      let len = self
         .db
         .batches
         .len(&wtxn)
         .map_err(SpoolError::DatabaseOperation)?;
      for _ in self.capacity as u64..len {
         let Some((seq, old)) = self
            .db
            .batches
            .first(&wtxn)
            .map_err(SpoolError::DatabaseOperation)?
         else {
            break;
         };
         warn!(
            "Spool full, dropping batch #{} from {} ({} bytes)",
            old.batch_id,
            old.device,
            old.body.len()
         );
         self
            .db
            .batches
            .delete(&mut wtxn, &seq)
            .map_err(SpoolError::DatabaseOperation)?;
         evicted += 1;
      }

      wtxn.commit().map_err(SpoolError::Transaction)?;
      debug!("Spooled batch #{} from {}", batch.batch_id, batch.device);
      Ok(evicted)
   }

   /// Returns the oldest entry without removing it.
   pub fn peek(&self) -> Result<Option<(u64, SpooledBatch)>> {
      let rtxn = self.db.env.read_txn().map_err(SpoolError::Transaction)?;
      Ok(
         self
            .db
            .batches
            .first(&rtxn)
            .map_err(SpoolError::DatabaseOperation)?,
      )
   }

   /// Removes an entry once it has been delivered.
   pub fn remove(&self, seq: u64) -> Result<bool> {
      let mut wtxn = self.db.env.write_txn().map_err(SpoolError::Transaction)?;
      let removed = self
         .db
         .batches
         .delete(&mut wtxn, &seq)
         .map_err(SpoolError::DatabaseOperation)?;
      wtxn.commit().map_err(SpoolError::Transaction)?;
      Ok(removed)
   }

   pub fn len(&self) -> Result<u64> {
      let rtxn = self.db.env.read_txn().map_err(SpoolError::Transaction)?;
      Ok(
         self
            .db
            .batches
            .len(&rtxn)
            .map_err(SpoolError::DatabaseOperation)?,
      )
   }

   pub fn is_empty(&self) -> Result<bool> {
      Ok(self.len()? == 0)
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   fn entry(batch_id: u64) -> SpooledBatch {
      SpooledBatch {
         device: "AA:BB:CC:DD:EE:01".into(),
         batch_id,
         spooled_at_ms: 1_700_000_000_000,
         body: format!("{{\"batch_id\":{batch_id}}}").into_bytes(),
      }
   }

   #[test]
   fn test_fifo_order() {
      let dir = tempfile::tempdir().unwrap();
      let spool = Spool::open_at(dir.path(), 16).unwrap();
      assert!(spool.is_empty().unwrap());

      for id in 1..=3 {
         spool.push(&entry(id)).unwrap();
      }
      assert_eq!(spool.len().unwrap(), 3);

      let (seq, first) = spool.peek().unwrap().unwrap();
      assert_eq!(first, entry(1));
      assert!(spool.remove(seq).unwrap());
      assert!(!spool.remove(seq).unwrap());

      let (_, next) = spool.peek().unwrap().unwrap();
      assert_eq!(next.batch_id, 2);
   }

   #[test]
   fn test_capacity_evicts_oldest() {
      let dir = tempfile::tempdir().unwrap();
      let spool = Spool::open_at(dir.path(), 2).unwrap();
      assert_eq!(spool.push(&entry(1)).unwrap(), 0);
      assert_eq!(spool.push(&entry(2)).unwrap(), 0);
      assert_eq!(spool.push(&entry(3)).unwrap(), 1);

      assert_eq!(spool.len().unwrap(), 2);
      assert_eq!(spool.peek().unwrap().unwrap().1.batch_id, 2);
   }

   #[test]
   fn test_survives_reopen() {
      let dir = tempfile::tempdir().unwrap();
      {
         let spool = Spool::open_at(dir.path(), 8).unwrap();
         spool.push(&entry(7)).unwrap();
         spool.push(&entry(8)).unwrap();
      }
      let spool = Spool::open_at(dir.path(), 8).unwrap();
      assert_eq!(spool.len().unwrap(), 2);
      let (seq, first) = spool.peek().unwrap().unwrap();
      assert_eq!(first.batch_id, 7);
      spool.remove(seq).unwrap();

      // Sequence numbers continue after the last entry.
      spool.push(&entry(9)).unwrap();
      let (seq2, _) = spool.peek().unwrap().unwrap();
      assert!(seq2 > seq);
   }
}
