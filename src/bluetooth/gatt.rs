//! GATT link to a wearable.
//!
//! This module subscribes to the notification characteristics of a
//! connected wearable and exposes them as a single inbound channel, plus a
//! cheaply cloneable sender for writes to the vendor command characteristic.

use std::{
   pin::pin,
   sync::{
      Arc,
      atomic::{AtomicU8, Ordering},
   },
   time::{Duration, Instant},
};

use bluer::{Address, gatt::remote::Characteristic};
use crossbeam::atomic::AtomicCell;
use futures::StreamExt;
use log::{debug, info, warn};
use smallvec::SmallVec;
use tokio::{
   sync::{mpsc, oneshot},
   task::JoinSet,
   time,
};

use crate::{
   error::{Result, WearLinkError},
   wearable::{
      framer::{Framer, FramerStats},
      protocol::{
         BATTERY_LEVEL_CHAR, Command, Frame, HEART_RATE_MEASUREMENT_CHAR, VENDOR_RX_CHAR,
         VENDOR_TX_CHAR,
      },
   },
};

pub type Packet = SmallVec<[u8; 32]>;

/// Timeout for write operations
const WRITE_TIMEOUT: Duration = Duration::from_secs(25);
/// Timeout for connection and service resolution
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Poll interval while waiting for services to resolve
const RESOLVE_POLL: Duration = Duration::from_millis(100);
const CHANNEL_BUFFER: usize = 128;

/// Data received from the device, tagged by source characteristic.
#[derive(Debug, Clone)]
pub enum Inbound {
   /// A reassembled vendor frame.
   Frame(Frame),
   /// Raw Heart Rate Measurement value.
   HeartRate(Packet),
   /// Raw Battery Level value.
   Battery(Packet),
}

enum Request {
   Write {
      data: Packet,
      then: oneshot::Sender<Result<()>>,
   },
   ReadBattery {
      then: oneshot::Sender<Result<Packet>>,
   },
}

/// Receiver half of a GATT link.
///
/// Each notify pump holds a sender; the link is lost once all of them end.
#[derive(Debug)]
pub struct InboundReceiver {
   rx: mpsc::Receiver<Inbound>,
   stats: Arc<AtomicCell<FramerStats>>,
}

impl InboundReceiver {
   pub async fn recv(&mut self) -> Result<Inbound> {
      self.rx.recv().await.ok_or(WearLinkError::ConnectionLost)
   }

   /// Shared view of the vendor stream counters.
   pub fn stats(&self) -> Arc<AtomicCell<FramerStats>> {
      self.stats.clone()
   }
}

/// Sender half of a GATT link.
///
/// This type is cheaply cloneable.
#[derive(Debug, Clone)]
pub struct CommandSender {
   tx: mpsc::Sender<Request>,
   seq: Arc<AtomicU8>,
   has_vendor: bool,
}

impl CommandSender {
   pub fn is_connected(&self) -> bool {
      !self.tx.is_closed()
   }

   /// Whether the device exposes the vendor command characteristic.
   pub const fn has_vendor(&self) -> bool {
      self.has_vendor
   }

   /// Writes raw bytes to the vendor command characteristic.
   pub async fn send(&self, data: &[u8]) -> Result<()> {
      if !self.is_connected() {
         return Err(WearLinkError::ConnectionClosed);
      }

      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Request::Write {
            data: Packet::from_slice(data),
            then: tx,
         })
         .await
         .map_err(|_| WearLinkError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| WearLinkError::RequestTimeout)?
         .map_err(|_| WearLinkError::ConnectionClosed)?
   }

   /// Frames and sends a command, returning its opcode.
   pub async fn send_command(&self, cmd: Command) -> Result<u8> {
      let seq = self.seq.fetch_add(1, Ordering::Relaxed);
      self.send(&cmd.encode(seq)).await?;
      Ok(cmd.opcode())
   }

   /// Reads the standard Battery Level characteristic.
   pub async fn read_battery(&self) -> Result<Packet> {
      let (tx, rx) = oneshot::channel();
      self
         .tx
         .send(Request::ReadBattery { then: tx })
         .await
         .map_err(|_| WearLinkError::ConnectionClosed)?;

      time::timeout(WRITE_TIMEOUT, rx)
         .await
         .map_err(|_| WearLinkError::RequestTimeout)?
         .map_err(|_| WearLinkError::ConnectionClosed)?
   }
}

#[derive(Debug, Clone, Copy)]
pub enum HookDisposition {
   Discard,
   Retain,
}

/// Callbacks run on every reassembled frame before it is forwarded.
pub struct Hooks {
   hooks: Vec<Hook>,
}

impl Hooks {
   pub const fn new() -> Self {
      Self { hooks: Vec::new() }
   }

   pub fn install(mut self, hook: Hook) -> Self {
      self.hooks.push(hook);
      self
   }

   /// Runs `cb` once, on the first frame of `kind` whose payload starts
   /// with `pfx`.
   pub fn frame_once<F>(self, kind: u8, pfx: &[u8], cb: F) -> Self
   where
      F: FnOnce(&[u8]) + Send + 'static,
   {
      self.install(Hook::once(cb).kind(kind).prefix(pfx))
   }

   pub fn passthrough(&mut self, frame: &Frame) {
      self
         .hooks
         .retain_mut(|hook| matches!(hook.passthrough(frame), HookDisposition::Retain));
   }

   #[cfg(test)]
   fn len(&self) -> usize {
      self.hooks.len()
   }
}

pub type Callback = Box<dyn FnMut(&[u8]) + Send>;

pub struct Hook {
   kind: Option<u8>,
   pfx: heapless::Vec<u8, 8>,
   cb: Callback,
   disposition: HookDisposition,
}

impl Hook {
   pub fn once<F>(cb: F) -> Self
   where
      F: FnOnce(&[u8]) + Send + 'static,
   {
      let mut cb = Some(cb);
      Self {
         kind: None,
         pfx: heapless::Vec::new(),
         cb: Box::new(move |bytes| {
            if let Some(cb) = cb.take() {
               cb(bytes);
            }
         }),
         disposition: HookDisposition::Discard,
      }
   }

   #[cfg(test)]
   fn each<F>(cb: F) -> Self
   where
      F: FnMut(&[u8]) + Send + 'static,
   {
      Self {
         kind: None,
         pfx: heapless::Vec::new(),
         cb: Box::new(cb),
         disposition: HookDisposition::Retain,
      }
   }

   pub const fn kind(mut self, kind: u8) -> Self {
      self.kind = Some(kind);
      self
   }

   /// Restricts the hook to payloads starting with `pfx` (at most 8 bytes).
   pub fn prefix(mut self, pfx: &[u8]) -> Self {
      let take = pfx.len().min(8);
      self.pfx.clear();
      let _ = self.pfx.extend_from_slice(&pfx[..take]);
      self
   }

   pub fn passthrough(&mut self, frame: &Frame) -> HookDisposition {
      if self.kind.is_none_or(|k| k == frame.kind) && frame.payload.starts_with(&self.pfx) {
         (self.cb)(&frame.payload);
         self.disposition
      } else {
         HookDisposition::Retain
      }
   }
}

/// Characteristics of interest on a connected device.
#[derive(Default)]
struct Resolved {
   vendor_tx: Option<Characteristic>,
   vendor_rx: Option<Characteristic>,
   heart_rate: Option<Characteristic>,
   battery: Option<Characteristic>,
}

async fn wait_services_resolved(device: &bluer::Device) -> Result<()> {
   let wait = async {
      while !device.is_services_resolved().await? {
         time::sleep(RESOLVE_POLL).await;
      }
      Ok::<_, WearLinkError>(())
   };
   time::timeout(CONNECT_TIMEOUT, wait)
      .await
      .map_err(|_| WearLinkError::RequestTimeout)?
}

async fn resolve(device: &bluer::Device) -> Result<Resolved> {
   let mut found = Resolved::default();
   for service in device.services().await? {
      for ch in service.characteristics().await? {
         let uuid = ch.uuid().await?;
         let slot = if uuid == VENDOR_TX_CHAR {
            &mut found.vendor_tx
         } else if uuid == VENDOR_RX_CHAR {
            &mut found.vendor_rx
         } else if uuid == HEART_RATE_MEASUREMENT_CHAR {
            &mut found.heart_rate
         } else if uuid == BATTERY_LEVEL_CHAR {
            &mut found.battery
         } else {
            continue;
         };
         slot.get_or_insert(ch);
      }
   }
   Ok(found)
}

/// Opens a GATT link, connecting the device first if needed.
pub async fn open(
   jset: &mut JoinSet<()>,
   hooks: Hooks,
   device: &bluer::Device,
) -> Result<(InboundReceiver, CommandSender)> {
   let address = device.address();
   if !device.is_connected().await? {
      debug!("Connecting to {address}");
      time::timeout(CONNECT_TIMEOUT, device.connect())
         .await
         .map_err(|_| WearLinkError::RequestTimeout)??;
   }
   wait_services_resolved(device).await?;

   let found = resolve(device).await?;
   if found.vendor_tx.is_none() && found.heart_rate.is_none() {
      return Err(WearLinkError::NoDataSource);
   }
   info!(
      "{address}: vendor stream: {}, heart rate: {}, battery: {}",
      found.vendor_tx.is_some(),
      found.heart_rate.is_some(),
      found.battery.is_some()
   );

   let (cmd_tx, cmd_rx) = mpsc::channel(CHANNEL_BUFFER);
   let (in_tx, in_rx) = mpsc::channel(CHANNEL_BUFFER);
   let stats = Arc::new(AtomicCell::new(FramerStats::default()));

   if let Some(ch) = found.vendor_tx {
      jset.spawn(vendor_pump(address, ch, in_tx.clone(), hooks, stats.clone()));
   }
   if let Some(ch) = found.heart_rate {
      jset.spawn(value_pump(address, ch, in_tx.clone(), Inbound::HeartRate));
   }
   if let Some(ch) = found.battery.clone() {
      jset.spawn(value_pump(address, ch, in_tx, Inbound::Battery));
   }
   let has_vendor = found.vendor_rx.is_some();
   jset.spawn(send_thread(address, cmd_rx, found.vendor_rx, found.battery));

   Ok((
      InboundReceiver { rx: in_rx, stats },
      CommandSender {
         tx: cmd_tx,
         seq: Arc::new(AtomicU8::new(0)),
         has_vendor,
      },
   ))
}

async fn vendor_pump(
   adr: Address,
   ch: Characteristic,
   tx: mpsc::Sender<Inbound>,
   mut hooks: Hooks,
   stats: Arc<AtomicCell<FramerStats>>,
) {
   let stream = match ch.notify().await {
      Ok(stream) => stream,
      Err(e) => {
         warn!("{adr}: Failed to subscribe to vendor stream: {e}");
         return;
      },
   };
   let mut stream = pin!(stream);
   let mut framer = Framer::new();

   while let Some(chunk) = stream.next().await {
      debug!("← {adr}: {}", hex::encode(&chunk));
      let frames = framer.push(&chunk, Instant::now());
      stats.store(framer.stats());
      for frame in frames {
         hooks.passthrough(&frame);
         if let Err(e) = tx.send(Inbound::Frame(frame)).await {
            warn!("Failed to forward frame: {e:?}");
            return;
         }
      }
   }
   warn!("{adr}: Vendor notification stream ended");
}

async fn value_pump(
   adr: Address,
   ch: Characteristic,
   tx: mpsc::Sender<Inbound>,
   wrap: fn(Packet) -> Inbound,
) {
   let stream = match ch.notify().await {
      Ok(stream) => stream,
      Err(e) => {
         // Optional characteristics may not support notifications.
         warn!("{adr}: Failed to subscribe: {e}");
         return;
      },
   };
   let mut stream = pin!(stream);

   while let Some(value) = stream.next().await {
      debug!("← {adr}: {}", hex::encode(&value));
      if let Err(e) = tx.send(wrap(Packet::from_vec(value))).await {
         warn!("Failed to forward value: {e:?}");
         return;
      }
   }
   debug!("{adr}: Notification stream ended");
}

async fn send_thread(
   adr: Address,
   mut rx: mpsc::Receiver<Request>,
   command: Option<Characteristic>,
   battery: Option<Characteristic>,
) {
   while let Some(req) = rx.recv().await {
      match req {
         Request::Write { data, then } => {
            let Some(ch) = &command else {
               let _ = then.send(Err(WearLinkError::FeatureNotSupported(
                  "vendor command characteristic".into(),
               )));
               continue;
            };
            debug!("→ {adr}: {}", hex::encode(&data));
            if let Err(e) = ch.write(&data).await {
               warn!("Failed to send data: {e}");
               let _ = then.send(Err(e.into()));
            } else {
               _ = then.send(Ok(()));
            }
         },
         Request::ReadBattery { then } => {
            let res = match &battery {
               Some(ch) => ch
                  .read()
                  .await
                  .map(Packet::from_vec)
                  .map_err(WearLinkError::from),
               None => Err(WearLinkError::FeatureNotSupported(
                  "battery level characteristic".into(),
               )),
            };
            let _ = then.send(res);
         },
      }
   }
   debug!("{adr}: Command channel closed");
}

#[cfg(test)]
mod tests {
   use std::sync::atomic::AtomicUsize;

   use super::*;

   fn frame(kind: u8, payload: &[u8]) -> Frame {
      Frame {
         seq: 0,
         kind,
         payload: Packet::from_slice(payload),
      }
   }

   #[test]
   fn test_frame_once_hook_fires_on_matching_frame_only() {
      let hits = Arc::new(AtomicUsize::new(0));
      let h = hits.clone();
      let mut hooks = Hooks::new().frame_once(0x20, &[0x40], move |payload| {
         assert_eq!(payload, &[0x40, 0x00]);
         h.fetch_add(1, Ordering::Relaxed);
      });

      hooks.passthrough(&frame(0x20, &[0x43, 0x00])); // ack of another command
      hooks.passthrough(&frame(0x01, &[0x40, 0x00])); // wrong kind
      assert_eq!(hits.load(Ordering::Relaxed), 0);
      assert_eq!(hooks.len(), 1);

      hooks.passthrough(&frame(0x20, &[0x40, 0x00]));
      hooks.passthrough(&frame(0x20, &[0x40, 0x00]));
      assert_eq!(hits.load(Ordering::Relaxed), 1);
      assert_eq!(hooks.len(), 0);
   }

   #[tokio::test]
   async fn test_link_survives_until_last_stream_ends() {
      let (tx, rx) = mpsc::channel(4);
      let mut inbound = InboundReceiver {
         rx,
         stats: Arc::new(AtomicCell::new(FramerStats::default())),
      };
      let battery = tx.clone();
      let heart_rate = tx;

      // Battery stream ends; heart rate keeps flowing.
      drop(battery);
      heart_rate
         .send(Inbound::HeartRate(Packet::from_slice(&[0x00, 60])))
         .await
         .unwrap();
      assert!(matches!(inbound.recv().await, Ok(Inbound::HeartRate(_))));

      drop(heart_rate);
      assert!(matches!(inbound.recv().await, Err(WearLinkError::ConnectionLost)));
   }

   #[test]
   fn test_each_hook_is_retained() {
      let hits = Arc::new(AtomicUsize::new(0));
      let h = hits.clone();
      let mut hooks = Hooks::new().install(Hook::each(move |_| {
         h.fetch_add(1, Ordering::Relaxed);
      }));
      for _ in 0..3 {
         hooks.passthrough(&frame(0x01, &[]));
      }
      assert_eq!(hits.load(Ordering::Relaxed), 3);
      assert_eq!(hooks.len(), 1);
   }
}
