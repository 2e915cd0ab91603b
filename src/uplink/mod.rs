//! Forwarding of decoded samples to the backend.
//!
//! The [`Uplink`] actor accumulates samples per device, cuts batches, and
//! delivers them through a [`Transport`]. Batches that cannot be delivered
//! are kept in the [`Spool`] and retried oldest-first.

pub mod batch;
pub mod client;
pub mod spool;

use std::{
   collections::HashMap,
   sync::Arc,
   time::{Duration, Instant},
};

use hyper::body::Bytes;
use log::{debug, info, warn};
use serde::Serialize;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   time::{self, MissedTickBehavior},
};

use crate::{
   config::UplinkConfig,
   error::{Result, WearLinkError},
   uplink::{
      batch::{Batch, Batcher},
      client::Transport,
      spool::{Spool, SpooledBatch},
   },
   wearable::{protocol::Sample, timebase::unix_now_ms},
};

/// How often due batches are cut and the spool is drained
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Base delay between delivery attempts
const RETRY_BASE_DELAY: Duration = Duration::from_millis(500);
/// Spool entries delivered per drain, so commands are not starved
const DRAIN_LIMIT: usize = 32;
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

/// Delivery counters.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UplinkStats {
   pub batches_sent: u64,
   pub samples_sent: u64,
   pub batches_rejected: u64,
   pub batches_spooled: u64,
   /// Lost for good: evicted from a full spool, or undeliverable without one.
   pub batches_dropped: u64,
   pub pending_samples: u64,
   pub spool_len: u64,
   pub backend_up: bool,
   pub last_error: Option<String>,
}

impl UplinkStats {
   pub fn to_json(&self) -> serde_json::Value {
      serde_json::to_value(self).unwrap_or_default()
   }
}

#[derive(Debug)]
enum UplinkCommand {
   Push {
      device: SmolStr,
      name: SmolStr,
      samples: Arc<[Sample]>,
   },
   Flush(oneshot::Sender<()>),
   Stats(oneshot::Sender<UplinkStats>),
}

/// Handle to the uplink actor.
#[derive(Clone, Debug)]
pub struct Uplink {
   inbox: mpsc::Sender<UplinkCommand>,
}

impl Uplink {
   pub fn new(config: &UplinkConfig, transport: Arc<dyn Transport>, spool: Option<Spool>) -> Self {
      Self::spawn(config, transport, spool, RETRY_BASE_DELAY)
   }

   fn spawn(
      config: &UplinkConfig,
      transport: Arc<dyn Transport>,
      spool: Option<Spool>,
      retry_base: Duration,
   ) -> Self {
      let (tx, rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      let actor = UplinkActor {
         max_batch_samples: config.max_batch_samples,
         flush_interval: config.flush_interval(),
         max_attempts: config.max_attempts.max(1),
         retry_base,
         transport,
         spool,
         inbox: rx,
         batchers: HashMap::new(),
         backend_up: true,
         stats: UplinkStats::default(),
      };
      tokio::spawn(actor.run());
      Self { inbox: tx }
   }

   /// Queues samples of one device for delivery.
   pub async fn push(&self, device: SmolStr, name: SmolStr, samples: Arc<[Sample]>) -> Result<()> {
      self
         .inbox
         .send(UplinkCommand::Push {
            device,
            name,
            samples,
         })
         .await
         .map_err(|_| WearLinkError::UplinkShutdown)
   }

   /// Delivers everything pending, including spooled batches.
   pub async fn flush(&self) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(UplinkCommand::Flush(tx))
         .await
         .map_err(|_| WearLinkError::UplinkShutdown)?;
      rx.await.map_err(|_| WearLinkError::UplinkShutdown)
   }

   pub async fn stats(&self) -> Result<UplinkStats> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(UplinkCommand::Stats(tx))
         .await
         .map_err(|_| WearLinkError::UplinkShutdown)?;
      rx.await.map_err(|_| WearLinkError::UplinkShutdown)
   }
}

struct UplinkActor {
   max_batch_samples: usize,
   flush_interval: Duration,
   max_attempts: u32,
   retry_base: Duration,
   transport: Arc<dyn Transport>,
   spool: Option<Spool>,
   inbox: mpsc::Receiver<UplinkCommand>,

   // State
   batchers: HashMap<SmolStr, Batcher>,
   /// Cleared after a failed delivery; new batches then go to the spool
   /// until a drain succeeds.
   backend_up: bool,
   stats: UplinkStats,
}

impl UplinkActor {
   async fn run(mut self) {
      info!("Uplink starting up");

      // First tick one interval out, not immediately.
      let mut tick = time::interval_at(time::Instant::now() + TICK_INTERVAL, TICK_INTERVAL);
      tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             at = tick.tick() => {
                 self.flush_due(at.into_std()).await;
                 self.drain_spool().await;
             }
             cmd = self.inbox.recv() => {
                 let Some(cmd) = cmd else {
                     break;
                 };
                 self.handle_command(cmd).await;
             }
         }
      }

      // Nothing can be delivered later, so keep what is left on disk.
      self.flush_all_to_spool();
      info!("Uplink shutting down");
   }

   async fn handle_command(&mut self, cmd: UplinkCommand) {
      match cmd {
         UplinkCommand::Push {
            device,
            name,
            samples,
         } => {
            self.handle_push(device, name, &samples).await;
         },
         UplinkCommand::Flush(reply) => {
            let batches = self.take_batches(|_| true);
            for batch in batches {
               self.deliver(batch).await;
            }
            self.drain_spool().await;
            let _ = reply.send(());
         },
         UplinkCommand::Stats(reply) => {
            let mut stats = self.stats.clone();
            stats.pending_samples = self.batchers.values().map(|b| b.len() as u64).sum();
            stats.spool_len = self
               .spool
               .as_ref()
               .and_then(|s| s.len().ok())
               .unwrap_or_default();
            stats.backend_up = self.backend_up;
            let _ = reply.send(stats);
         },
      }
   }

   async fn handle_push(&mut self, device: SmolStr, name: SmolStr, samples: &[Sample]) {
      let batcher = self.batchers.entry(device.clone()).or_insert_with(|| {
         Batcher::new(
            device,
            name.clone(),
            self.max_batch_samples,
            self.flush_interval,
         )
      });
      batcher.set_name(name);
      batcher.push(samples, time::Instant::now().into_std());

      let mut full = Vec::new();
      while batcher.is_full() {
         match batcher.take() {
            Some(batch) => full.push(batch),
            None => break,
         }
      }
      for batch in full {
         self.deliver(batch).await;
      }
   }

   fn take_batches(&mut self, mut pred: impl FnMut(&Batcher) -> bool) -> Vec<Batch> {
      let mut out = Vec::new();
      for batcher in self.batchers.values_mut() {
         while !batcher.is_empty() && pred(batcher) {
            match batcher.take() {
               Some(batch) => out.push(batch),
               None => break,
            }
         }
      }
      out
   }

   async fn flush_due(&mut self, now: Instant) {
      let batches = self.take_batches(|b| b.is_due(now));
      for batch in batches {
         self.deliver(batch).await;
      }
   }

   fn retry_delay(&self, attempt: u32) -> Duration {
      self.retry_base * (1 << attempt.min(4))
   }

   async fn deliver(&mut self, batch: Batch) {
      let body = match batch.to_body() {
         Ok(body) => Bytes::from(body),
         Err(e) => {
            warn!("Failed to encode batch #{}: {e}", batch.batch_id);
            self.stats.batches_dropped += 1;
            return;
         },
      };

      if !self.backend_up && self.spool.is_some() {
         self.spool_batch(&batch, body);
         return;
      }

      let mut attempt = 0;
      loop {
         match self.transport.post(body.clone()).await {
            Ok(()) => {
               debug!(
                  "Delivered batch #{} from {} ({} samples)",
                  batch.batch_id,
                  batch.device,
                  batch.samples.len()
               );
               self.stats.batches_sent += 1;
               self.stats.samples_sent += batch.samples.len() as u64;
               self.backend_up = true;
               self.drain_spool().await;
               return;
            },
            Err(WearLinkError::BatchRejected(status)) => {
               warn!(
                  "Backend rejected batch #{} from {} with status {status}, dropping",
                  batch.batch_id, batch.device
               );
               self.stats.batches_rejected += 1;
               self.stats.last_error = Some(format!("rejected with status {status}"));
               return;
            },
            Err(e) => {
               attempt += 1;
               self.stats.last_error = Some(e.to_string());
               if attempt >= self.max_attempts {
                  warn!(
                     "Failed to deliver batch #{} after {attempt} attempts: {e}",
                     batch.batch_id
                  );
                  break;
               }
               let delay = self.retry_delay(attempt);
               debug!("Delivery of batch #{} failed ({e}), retrying in {delay:?}", batch.batch_id);
               time::sleep(delay).await;
            },
         }
      }

      self.backend_up = false;
      if self.spool.is_some() {
         self.spool_batch(&batch, body);
      } else {
         self.stats.batches_dropped += 1;
      }
   }

   fn spool_batch(&mut self, batch: &Batch, body: Bytes) {
      let Some(spool) = &self.spool else {
         return;
      };
      let entry = SpooledBatch {
         device: batch.device.clone(),
         batch_id: batch.batch_id,
         spooled_at_ms: unix_now_ms(),
         body: body.to_vec(),
      };
      match spool.push(&entry) {
         Ok(evicted) => {
            self.stats.batches_spooled += 1;
            self.stats.batches_dropped += evicted as u64;
         },
         Err(e) => {
            warn!("Failed to spool batch #{}: {e}", batch.batch_id);
            self.stats.batches_dropped += 1;
         },
      }
   }

   async fn drain_spool(&mut self) {
      let Some(spool) = self.spool.clone() else {
         return;
      };

      for _ in 0..DRAIN_LIMIT {
         let (seq, entry) = match spool.peek() {
            Ok(Some(next)) => next,
            Ok(None) => return,
            Err(e) => {
               warn!("Failed to read spool: {e}");
               return;
            },
         };

         match self.transport.post(Bytes::from(entry.body)).await {
            Ok(()) => {
               debug!("Delivered spooled batch #{} from {}", entry.batch_id, entry.device);
               self.stats.batches_sent += 1;
               self.backend_up = true;
            },
            Err(WearLinkError::BatchRejected(status)) => {
               warn!(
                  "Backend rejected spooled batch #{} with status {status}, dropping",
                  entry.batch_id
               );
               self.stats.batches_rejected += 1;
            },
            Err(e) => {
               debug!("Spool drain paused: {e}");
               self.stats.last_error = Some(e.to_string());
               self.backend_up = false;
               return;
            },
         }

         if let Err(e) = spool.remove(seq) {
            warn!("Failed to remove spooled batch #{}: {e}", entry.batch_id);
            return;
         }
      }
   }

   fn flush_all_to_spool(&mut self) {
      let batches = self.take_batches(|_| true);
      for batch in batches {
         match batch.to_body() {
            Ok(body) if self.spool.is_some() => self.spool_batch(&batch, Bytes::from(body)),
            _ => warn!(
               "Dropping {} undelivered samples from {}",
               batch.samples.len(),
               batch.device
            ),
         }
      }
   }
}

#[cfg(test)]
mod tests {
   use std::collections::VecDeque;

   use futures::future::BoxFuture;
   use hyper::StatusCode;

   use super::*;
   use crate::{uplink::client::classify, wearable::protocol::Reading};

   /// Answers with queued status codes, then 200.
   #[derive(Default)]
   struct MockTransport {
      statuses: parking_lot::Mutex<VecDeque<u16>>,
      bodies: parking_lot::Mutex<Vec<serde_json::Value>>,
   }

   impl MockTransport {
      fn with_statuses(statuses: &[u16]) -> Arc<Self> {
         Arc::new(Self {
            statuses: parking_lot::Mutex::new(statuses.iter().copied().collect()),
            ..Default::default()
         })
      }

      fn batch_ids(&self) -> Vec<u64> {
         self
            .bodies
            .lock()
            .iter()
            .filter_map(|b| b["batch_id"].as_u64())
            .collect()
      }
   }

   impl Transport for MockTransport {
      fn post(&self, body: Bytes) -> BoxFuture<'_, Result<()>> {
         let status = self.statuses.lock().pop_front().unwrap_or(200);
         if let Ok(v) = serde_json::from_slice(&body) {
            self.bodies.lock().push(v);
         }
         Box::pin(async move { classify(StatusCode::from_u16(status).unwrap()) })
      }
   }

   fn config(max_batch_samples: usize, max_attempts: u32) -> UplinkConfig {
      UplinkConfig {
         max_batch_samples,
         max_attempts,
         flush_interval_ms: 60_000,
         ..Default::default()
      }
   }

   fn samples(n: u32) -> Arc<[Sample]> {
      (0..n)
         .map(|i| Sample {
            captured_at_ms: 1_700_000_000_000 + u64::from(i),
            reading: Reading::Steps { total: i },
         })
         .collect()
   }

   fn uplink(cfg: &UplinkConfig, t: &Arc<MockTransport>, spool: Option<Spool>) -> Uplink {
      Uplink::spawn(cfg, t.clone(), spool, Duration::from_millis(5))
   }

   #[tokio::test]
   async fn test_full_batches_go_out_immediately() {
      let t = MockTransport::with_statuses(&[]);
      let up = uplink(&config(2, 3), &t, None);

      up.push("AA".into(), "Ring".into(), samples(5)).await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_sent, 2);
      assert_eq!(stats.pending_samples, 1);

      up.flush().await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_sent, 3);
      assert_eq!(stats.samples_sent, 5);
      assert_eq!(stats.pending_samples, 0);

      let bodies = t.bodies.lock();
      assert_eq!(bodies[0]["device"], "AA");
      assert_eq!(bodies[0]["samples"].as_array().unwrap().len(), 2);
      assert_eq!(bodies[2]["samples"].as_array().unwrap().len(), 1);
   }

   #[tokio::test]
   async fn test_devices_are_batched_separately() {
      let t = MockTransport::with_statuses(&[]);
      let up = uplink(&config(10, 3), &t, None);

      up.push("AA".into(), "Ring".into(), samples(3)).await.unwrap();
      up.push("BB".into(), "Buds".into(), samples(2)).await.unwrap();
      up.flush().await.unwrap();

      let mut devices: Vec<_> = t
         .bodies
         .lock()
         .iter()
         .map(|b| (b["device"].as_str().unwrap().to_string(), b["samples"].as_array().unwrap().len()))
         .collect();
      devices.sort();
      assert_eq!(devices, vec![("AA".to_string(), 3), ("BB".to_string(), 2)]);
   }

   #[tokio::test]
   async fn test_rejected_batch_is_dropped() {
      let t = MockTransport::with_statuses(&[422]);
      let up = uplink(&config(1, 3), &t, None);

      up.push("AA".into(), "Ring".into(), samples(1)).await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_rejected, 1);
      assert_eq!(stats.batches_sent, 0);
      assert_eq!(t.bodies.lock().len(), 1);
      assert!(stats.backend_up);
   }

   #[tokio::test]
   async fn test_retry_then_success() {
      let t = MockTransport::with_statuses(&[503, 429]);
      let up = uplink(&config(1, 3), &t, None);

      up.push("AA".into(), "Ring".into(), samples(1)).await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_sent, 1);
      assert_eq!(t.bodies.lock().len(), 3);
   }

   #[tokio::test]
   async fn test_undeliverable_without_spool_is_dropped() {
      let t = MockTransport::with_statuses(&[500, 500]);
      let up = uplink(&config(1, 2), &t, None);

      up.push("AA".into(), "Ring".into(), samples(1)).await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_dropped, 1);
      assert!(!stats.backend_up);
      assert_eq!(stats.last_error.as_deref(), Some("Backend unavailable (status 500)"));
   }

   #[tokio::test(start_paused = true)]
   async fn test_due_batch_is_flushed_on_tick() {
      let t = MockTransport::with_statuses(&[]);
      let cfg = UplinkConfig {
         flush_interval_ms: 1_500,
         ..config(10, 3)
      };
      let up = uplink(&cfg, &t, None);

      up.push("AA".into(), "Ring".into(), samples(2)).await.unwrap();
      assert_eq!(up.stats().await.unwrap().batches_sent, 0);

      // The tick at 1 s finds the batch not yet due.
      time::sleep(Duration::from_millis(1_200)).await;
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_sent, 0);
      assert_eq!(stats.pending_samples, 2);

      // The tick at 2 s cuts it.
      time::sleep(Duration::from_millis(1_000)).await;
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_sent, 1);
      assert_eq!(stats.samples_sent, 2);
      assert_eq!(stats.pending_samples, 0);
      assert_eq!(t.bodies.lock().len(), 1);
   }

   #[tokio::test]
   async fn test_spool_and_drain_in_order() {
      let dir = tempfile::tempdir().unwrap();
      let spool = Spool::open_at(dir.path(), 16).unwrap();
      let t = MockTransport::with_statuses(&[503, 503]);
      let up = uplink(&config(1, 2), &t, Some(spool));

      // Both attempts fail: spooled.
      up.push("AA".into(), "Ring".into(), samples(1)).await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.batches_spooled, 1);
      assert_eq!(stats.spool_len, 1);
      assert!(!stats.backend_up);

      // Backend known down: straight to the spool without a request.
      up.push("AA".into(), "Ring".into(), samples(1)).await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.spool_len, 2);
      assert_eq!(t.bodies.lock().len(), 2);

      up.flush().await.unwrap();
      let stats = up.stats().await.unwrap();
      assert_eq!(stats.spool_len, 0);
      assert_eq!(stats.batches_sent, 2);
      assert!(stats.backend_up);

      let ids = t.batch_ids();
      assert_eq!(ids.len(), 4);
      assert_eq!(ids[0], ids[2]);
      assert!(ids[2] < ids[3]);
   }
}
