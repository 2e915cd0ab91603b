//! Grouping of decoded samples into outbound batches.
//!
//! One [`Batcher`] accumulates samples for one device. A batch is cut when it
//! reaches the size limit or when its oldest sample has waited for the flush
//! interval, whichever comes first.

use std::{
   collections::VecDeque,
   sync::atomic::{AtomicU64, Ordering},
   time::{Duration, Instant},
};

use serde::Serialize;
use smol_str::SmolStr;

use crate::{error::Result, wearable::protocol::Sample, wearable::timebase::unix_now_ms};

static NEXT_BATCH_ID: AtomicU64 = AtomicU64::new(1);

/// A group of samples from one device, delivered as one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Batch {
   pub device: SmolStr,
   pub name: SmolStr,
   pub batch_id: u64,
   pub created_at_ms: u64,
   pub samples: Vec<Sample>,
}

impl Batch {
   /// Encodes the request body.
   pub fn to_body(&self) -> Result<Vec<u8>> {
      Ok(serde_json::to_vec(self)?)
   }
}

#[derive(Debug)]
pub struct Batcher {
   device: SmolStr,
   name: SmolStr,
   max_samples: usize,
   flush_interval: Duration,
   pending: VecDeque<Sample>,
   /// Arrival time of the oldest pending sample.
   oldest: Option<Instant>,
}

impl Batcher {
   pub fn new(device: SmolStr, name: SmolStr, max_samples: usize, flush_interval: Duration) -> Self {
      Self {
         device,
         name,
         max_samples: max_samples.max(1),
         flush_interval,
         pending: VecDeque::new(),
         oldest: None,
      }
   }

   pub fn set_name(&mut self, name: SmolStr) {
      self.name = name;
   }

   pub fn len(&self) -> usize {
      self.pending.len()
   }

   pub fn is_empty(&self) -> bool {
      self.pending.is_empty()
   }

   pub fn push(&mut self, samples: &[Sample], now: Instant) {
      if samples.is_empty() {
         return;
      }
      self.oldest.get_or_insert(now);
      self.pending.extend(samples.iter().cloned());
   }

   pub fn is_full(&self) -> bool {
      self.pending.len() >= self.max_samples
   }

   pub fn is_due(&self, now: Instant) -> bool {
      self
         .oldest
         .is_some_and(|t| now.saturating_duration_since(t) >= self.flush_interval)
   }

   /// Cuts the next batch of at most `max_samples`, oldest samples first.
   ///
   /// Leftover samples keep the original arrival time so they stay due.
   pub fn take(&mut self) -> Option<Batch> {
      if self.pending.is_empty() {
         return None;
      }
      let n = self.pending.len().min(self.max_samples);
      let samples: Vec<Sample> = self.pending.drain(..n).collect();
      if self.pending.is_empty() {
         self.oldest = None;
      }
      Some(Batch {
         device: self.device.clone(),
         name: self.name.clone(),
         batch_id: NEXT_BATCH_ID.fetch_add(1, Ordering::Relaxed),
         created_at_ms: unix_now_ms(),
         samples,
      })
   }
}
