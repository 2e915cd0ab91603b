//! Wearable device implementation and state management.
//!
//! This module provides the core [`Wearable`] type which represents one
//! connected wearable: it owns the GATT link, runs inbound data through the
//! decoder and keeps the latest device state.

use core::fmt;
use std::{
   mem,
   sync::{
      Arc, Weak,
      atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering},
   },
   time::Duration,
};

use bluer::Address;
use crossbeam::atomic::AtomicCell;
use log::{debug, error, info, warn};
use serde_json::json;
use smol_str::{SmolStr, ToSmolStr};
use tokio::{
   sync::{RwLock, oneshot},
   task::{JoinHandle, JoinSet},
   time,
};

use crate::{
   bluetooth::gatt::{self, CommandSender, Hooks, Inbound, InboundReceiver},
   error::{Result, WearLinkError},
   event::{EventSender, WearableEvent},
   wearable::{
      framer::FramerStats,
      parser::{self, Decoded},
      protocol::{
         BatteryLevel, Command, DeviceInfo, FrameKind, Profile, Reading, Sample, SensorKind,
         SensorMask,
      },
      timebase::{DeviceClock, unix_now_ms},
   },
};

/// How long to wait for the device to answer a command during setup.
const ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Delays between start-stream retries while no sample has arrived.
const RETRY_SCHEDULE: &[Duration] = &[
   Duration::from_secs(2),
   Duration::from_secs(3),
   Duration::from_secs(5),
   Duration::from_secs(10),
];

/// Internal state for an active GATT link.
#[derive(Debug)]
struct ConnectionState {
   sender: CommandSender,
   jset: JoinSet<()>,
}

impl Drop for ConnectionState {
   fn drop(&mut self) {
      self.jset.abort_all();
   }
}

/// Parameters of a streaming session.
#[derive(Debug, Clone, Copy)]
pub struct SessionOptions {
   pub sensors: SensorMask,
   /// Maximum start-stream retries while no sample has arrived.
   pub start_retries: usize,
}

impl SessionOptions {
   pub fn new(sensors: &[SensorKind], start_retries: u32) -> Self {
      Self {
         sensors: SensorMask::from_sensors(sensors.iter().copied()),
         start_retries: start_retries as usize,
      }
   }
}

/// Internal shared state for a wearable.
#[derive(Debug, Default)]
struct WearableInner {
   address: Address,
   address_str: SmolStr,
   name: parking_lot::Mutex<SmolStr>,
   profile: AtomicCell<Profile>,
   is_connected: AtomicBool,
   battery: AtomicCell<Option<BatteryLevel>>,
   heart_rate: AtomicCell<Option<u16>>,
   info: parking_lot::Mutex<Option<DeviceInfo>>,
   clock: parking_lot::Mutex<DeviceClock>,
   active_sensors: AtomicU8,
   /// Set by the first vendor stream reading of the current session.
   stream_seen: AtomicBool,
   samples_received: AtomicU64,
   decode_errors: AtomicU64,
   last_sample_ms: AtomicU64,
   stream_stats: parking_lot::Mutex<Option<Arc<AtomicCell<FramerStats>>>>,
   conn: RwLock<Option<ConnectionState>>,
}

/// Represents a wearable device.
///
/// This type is cheaply cloneable and thread-safe.
#[derive(Clone)]
pub struct Wearable(Arc<WearableInner>);

/// Weak reference to a wearable.
#[derive(Debug, Clone)]
pub struct WeakWearable(Weak<WearableInner>);

impl WeakWearable {
   pub fn new(wearable: &Wearable) -> Self {
      Self(Arc::downgrade(&wearable.0))
   }

   pub fn upgrade(&self) -> Option<Wearable> {
      self.0.upgrade().map(Wearable)
   }
}

impl fmt::Debug for Wearable {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      fmt::Debug::fmt(&self.0, f)
   }
}

/// Represents the result of an update operation on device state.
#[derive(Debug, Clone, Copy)]
pub enum UpdateOp<T> {
   /// No change occurred
   Noop,
   /// A new value was inserted (None -> Some)
   Inserted,
   /// A value was deleted (Some -> None)
   Deleted(T),
   /// An existing value was updated
   Updated(T),
}

impl<T: PartialEq> UpdateOp<T> {
   fn apply_atomic(dst: &AtomicCell<Option<T>>, new: Option<T>) -> Self
   where
      T: Copy,
   {
      Self::new(dst.swap(new), new)
   }

   fn new(prev: Option<T>, new: Option<T>) -> Self {
      match (prev, new) {
         (Some(p), Some(n)) if p == n => Self::Noop,
         (None, Some(_)) => Self::Inserted,
         (Some(p), None) => Self::Deleted(p),
         (Some(_), Some(n)) => Self::Updated(n),
         (None, None) => Self::Noop,
      }
   }

   const fn is_updated(&self) -> bool {
      matches!(self, Self::Inserted | Self::Updated(_))
   }
}

impl Wearable {
   /// Creates a new wearable instance.
   pub fn new(address: Address, name: String, profile: Profile) -> Self {
      Self(Arc::new(WearableInner {
         address,
         address_str: address.to_smolstr(),
         name: parking_lot::Mutex::new(name.into()),
         profile: AtomicCell::new(profile),
         ..Default::default()
      }))
   }

   pub fn address(&self) -> Address {
      self.0.address
   }

   pub fn address_str(&self) -> &SmolStr {
      &self.0.address_str
   }

   pub fn name(&self) -> SmolStr {
      self.0.name.lock().clone()
   }

   pub fn update_name(&self, name: SmolStr) -> UpdateOp<SmolStr> {
      let mut lock = self.0.name.lock();
      if lock.as_str() == name.as_str() {
         return UpdateOp::Noop;
      }
      UpdateOp::Updated(mem::replace(&mut *lock, name))
   }

   pub fn profile(&self) -> Profile {
      self.0.profile.load()
   }

   pub fn is_connected(&self) -> bool {
      self.0.is_connected.load(Ordering::Relaxed)
   }

   pub fn battery(&self) -> Option<BatteryLevel> {
      self.0.battery.load()
   }

   pub fn update_battery(&self, battery: impl Into<Option<BatteryLevel>>) -> UpdateOp<BatteryLevel> {
      UpdateOp::apply_atomic(&self.0.battery, battery.into())
   }

   pub fn heart_rate(&self) -> Option<u16> {
      self.0.heart_rate.load()
   }

   pub fn info(&self) -> Option<DeviceInfo> {
      self.0.info.lock().clone()
   }

   pub fn samples_received(&self) -> u64 {
      self.0.samples_received.load(Ordering::Relaxed)
   }

   /// Whether the vendor stream produced a reading since the session began.
   pub fn stream_seen(&self) -> bool {
      self.0.stream_seen.load(Ordering::Relaxed)
   }

   fn begin_session(&self) {
      self.0.clock.lock().reset();
      self.0.stream_seen.store(false, Ordering::Relaxed);
   }

   pub fn decode_errors(&self) -> u64 {
      self.0.decode_errors.load(Ordering::Relaxed)
   }

   pub fn active_sensors(&self) -> SensorMask {
      SensorMask::from_bits(self.0.active_sensors.load(Ordering::Relaxed))
   }

   pub fn stream_stats(&self) -> Option<FramerStats> {
      self.0.stream_stats.lock().as_ref().map(|s| s.load())
   }

   /// Converts the device state to a JSON representation.
   pub fn to_json(&self) -> serde_json::Value {
      let mut info = json!({
          "address": self.address_str().as_str(),
          "name": self.name().as_str(),
          "profile": self.profile().to_str(),
          "connected": self.is_connected(),
          "samples_received": self.samples_received(),
          "decode_errors": self.decode_errors(),
          "sensors": self.active_sensors().iter().map(SensorKind::to_str).collect::<Vec<_>>(),
      });

      if let Some(battery) = self.battery() {
         info["battery"] = battery.to_json();
      }

      if let Some(bpm) = self.heart_rate() {
         info["heart_rate"] = json!(bpm);
      }

      match self.0.last_sample_ms.load(Ordering::Relaxed) {
         0 => {},
         ms => info["last_sample_ms"] = json!(ms),
      }

      if let Some(dev) = self.info() {
         info["device_info"] = dev.to_json();
      }

      if let Some(stats) = self.stream_stats() {
         info["stream"] = stats.to_json();
      }

      match self.0.clock.lock().reanchors() {
         0 => {},
         n => info["clock_reanchors"] = json!(n),
      }
      info
   }

   /// Opens a GATT session with the device and starts streaming.
   ///
   /// Returns a join handle that resolves when the session ends.
   pub async fn connect(
      &self,
      device: &bluer::Device,
      event_tx: &EventSender,
      opts: SessionOptions,
   ) -> Result<JoinHandle<Option<WearLinkError>>> {
      info!("Connecting to wearable at {}", self.address());
      let mut conn = self.0.conn.write().await;
      let _ = conn.take();
      self.begin_session();

      let mut jset = JoinSet::new();
      let (receiver, sender) = self.start_connection(&mut jset, device, opts).await?;
      *self.0.stream_stats.lock() = Some(receiver.stats());

      let jhandle = self.start_packet_processor(receiver, event_tx.clone());

      // Standard battery level may only be readable, not notified.
      match sender.read_battery().await {
         Ok(raw) => self.process_inbound(Inbound::Battery(raw), unix_now_ms(), event_tx),
         Err(WearLinkError::FeatureNotSupported(_)) => {},
         Err(e) => debug!("{}: Initial battery read failed: {e}", self.address()),
      }

      *conn = Some(ConnectionState { sender, jset });
      self.0.is_connected.store(true, Ordering::Relaxed);

      info!("Successfully connected to {}", self.address());
      Ok(jhandle)
   }

   pub async fn disconnect(&self) {
      self.0.is_connected.store(false, Ordering::Relaxed);
      if let Some(conn) = self.0.conn.write().await.take()
         && conn.sender.has_vendor()
      {
         let stop = conn.sender.send_command(Command::StopStream);
         if let Err(e) = time::timeout(Duration::from_secs(1), stop).await {
            debug!("{}: Stop stream not confirmed: {e}", self.address());
         }
      }
      self.0.active_sensors.store(0, Ordering::Relaxed);
      info!("Disconnected from {}", self.address());
   }

   async fn notify_disconnected(&self, event_tx: &EventSender) {
      self.0.is_connected.store(false, Ordering::Relaxed);
      let _ = self.0.conn.write().await.take();
      self.0.active_sensors.store(0, Ordering::Relaxed);
      info!("Disconnected from {}", self.address());
      event_tx.emit(self, WearableEvent::DeviceDisconnected);
   }

   async fn start_connection(
      &self,
      jset: &mut JoinSet<()>,
      device: &bluer::Device,
      opts: SessionOptions,
   ) -> Result<(InboundReceiver, CommandSender)> {
      let (info_tx, mut info_rx) = oneshot::channel();
      let (start_ack_tx, mut start_ack_rx) = oneshot::channel();

      async fn wait_for_ack<T>(rx: &mut oneshot::Receiver<T>) -> Result<T> {
         time::timeout(ACK_TIMEOUT, rx)
            .await
            .map_err(|_| WearLinkError::RequestTimeout)?
            .map_err(|_| WearLinkError::ConnectionClosed)
      }

      let hooks = Hooks::new()
         .frame_once(FrameKind::DeviceInfo as u8, &[], |_| {
            let _ = info_tx.send(());
         })
         .frame_once(
            FrameKind::Ack as u8,
            &[FrameKind::StartStream as u8],
            |payload| {
               let _ = start_ack_tx.send(payload.get(1).copied().unwrap_or(u8::MAX));
            },
         );

      let (receiver, sender) = gatt::open(jset, hooks, device).await?;
      let mac = self.address();

      if !sender.has_vendor() {
         info!("{mac}: No vendor stream, using standard characteristics only");
         return Ok((receiver, sender));
      }

      info!("{mac}: Starting stream setup...");

      if let Err(e) = sender.send_command(Command::GetInfo).await {
         error!("{mac}: Failed to request device info: {e:?}");
         return Err(e);
      } else if let Err(e) = wait_for_ack(&mut info_rx).await {
         warn!("{mac}: No device info received ({e:?}), continuing anyway...");
      }

      let start = Command::StartStream(opts.sensors);
      if let Err(e) = sender.send_command(start).await {
         error!("{mac}: Failed to start stream: {e:?}");
         return Err(e);
      }
      match wait_for_ack(&mut start_ack_rx).await {
         Ok(0) => info!("{mac}: Stream acknowledged: {start}"),
         Ok(status) => warn!("{mac}: Device refused {start} with status 0x{status:02x}"),
         Err(e) => warn!("{mac}: No stream acknowledgment received ({e:?}), continuing anyway..."),
      }
      self
         .0
         .active_sensors
         .store(opts.sensors.bits(), Ordering::Relaxed);

      // Some firmwares drop the first start request right after connecting.
      let weak = WeakWearable::new(self);
      let retry_sender = sender.clone();
      jset.spawn(resend_until_streaming(weak, opts.start_retries, move || {
         let sender = retry_sender.clone();
         async move {
            let _ = sender.send_command(start).await;
         }
      }));
      Ok((receiver, sender))
   }

   fn start_packet_processor(
      &self,
      mut rx: InboundReceiver,
      event_tx: EventSender,
   ) -> JoinHandle<Option<WearLinkError>> {
      let addr = self.address();
      let weak = WeakWearable::new(self);
      tokio::spawn(async move {
         let err;
         loop {
            match rx.recv().await {
               Ok(inbound) => {
                  if let Some(this) = weak.upgrade() {
                     this.process_inbound(inbound, unix_now_ms(), &event_tx);
                  } else {
                     warn!("{addr}: Wearable instance was dropped");
                     return None;
                  }
               },
               Err(e) => {
                  if let Some(this) = weak.upgrade() {
                     this.notify_disconnected(&event_tx).await;
                  } else {
                     warn!("{addr}: Connection closed: {e:?}");
                  }
                  err = Some(e);
                  break;
               },
            }
         }
         err
      })
   }

   async fn sender(&self) -> Result<CommandSender> {
      let conn = self.0.conn.read().await;
      conn
         .as_ref()
         .map(|c| c.sender.clone())
         .ok_or(WearLinkError::DeviceNotConnected)
   }

   /// Sends a command over the vendor characteristic.
   pub async fn send_command(&self, cmd: Command) -> Result<()> {
      let sender = self.sender().await?;
      sender.send_command(cmd).await?;
      match cmd {
         Command::StartStream(mask) => {
            self.0.active_sensors.store(mask.bits(), Ordering::Relaxed);
         },
         Command::StopStream => self.0.active_sensors.store(0, Ordering::Relaxed),
         Command::SetRate { .. } | Command::GetInfo => {},
      }
      Ok(())
   }

   pub async fn start_stream(&self, sensors: &[SensorKind]) -> Result<()> {
      let mask = SensorMask::from_sensors(sensors.iter().copied());
      self.send_command(Command::StartStream(mask)).await
   }

   pub async fn set_rate(&self, sensor: SensorKind, rate_hz: u16) -> Result<()> {
      self.send_command(Command::SetRate { sensor, rate_hz }).await
   }

   /// Writes raw bytes to the vendor characteristic.
   pub async fn passthrough(&self, packet: &[u8]) -> Result<()> {
      self.sender().await?.send(packet).await
   }

   /// Decodes one inbound item and updates state, emitting events on change.
   pub fn process_inbound(&self, inbound: Inbound, now_ms: u64, event_tx: &EventSender) {
      let address = self.address();
      match inbound {
         Inbound::Frame(frame) => match parser::decode_frame(&frame) {
            Ok(Decoded::Reading { device_ms, reading }) => {
               let captured_at_ms = self.0.clock.lock().to_unix_ms(device_ms, now_ms);
               self.0.stream_seen.store(true, Ordering::Relaxed);
               self.accept(
                  Sample {
                     captured_at_ms,
                     reading,
                  },
                  event_tx,
               );
            },
            Ok(Decoded::Ack { opcode, status }) => {
               if status == 0 {
                  debug!("{address}: Command 0x{opcode:02x} acknowledged");
               } else {
                  warn!("{address}: Command 0x{opcode:02x} failed with status 0x{status:02x}");
               }
            },
            Ok(Decoded::Info(info)) => self.accept_info(info, event_tx),
            Err(e) => {
               self.0.decode_errors.fetch_add(1, Ordering::Relaxed);
               warn!(
                  "{address}: Failed to decode frame #{} kind 0x{:02x}: {e}",
                  frame.seq, frame.kind
               );
            },
         },
         Inbound::HeartRate(raw) => match parser::parse_heart_rate_measurement(&raw) {
            Ok(reading) => self.accept(
               Sample {
                  captured_at_ms: now_ms,
                  reading,
               },
               event_tx,
            ),
            Err(e) => {
               self.0.decode_errors.fetch_add(1, Ordering::Relaxed);
               warn!("{address}: Failed to parse heart rate: {e}");
            },
         },
         Inbound::Battery(raw) => match parser::parse_battery_level(&raw) {
            Ok(battery) => self.accept(
               Sample {
                  captured_at_ms: now_ms,
                  reading: Reading::Battery {
                     level: battery.level,
                     state: battery.state,
                  },
               },
               event_tx,
            ),
            Err(e) => {
               self.0.decode_errors.fetch_add(1, Ordering::Relaxed);
               warn!("{address}: Failed to parse battery level: {e}");
            },
         },
      }
   }

   fn accept(&self, sample: Sample, event_tx: &EventSender) {
      match sample.reading {
         Reading::HeartRate { bpm, .. } => self.0.heart_rate.store(Some(bpm)),
         Reading::Battery { level, state } => {
            let battery = BatteryLevel { level, state };
            if self.update_battery(battery).is_updated() {
               debug!("Battery updated for {}: {level}% ({state})", self.address());
               event_tx.emit(self, WearableEvent::BatteryUpdated(battery));
            }
         },
         _ => {},
      }
      self.0.samples_received.fetch_add(1, Ordering::Relaxed);
      self
         .0
         .last_sample_ms
         .fetch_max(sample.captured_at_ms, Ordering::Relaxed);
      event_tx.emit(self, WearableEvent::Samples(Arc::from([sample])));
   }

   fn accept_info(&self, info: DeviceInfo, event_tx: &EventSender) {
      debug!("Device info for {}: {info:?}", self.address());
      {
         let mut current = self.0.info.lock();
         if current.as_ref() == Some(&info) {
            return;
         }
         *current = Some(info.clone());
      }
      self.0.profile.store(info.model);
      if !info.name.is_empty() {
         self.update_name(info.name.clone());
      }
      event_tx.emit(self, WearableEvent::InfoUpdated(info));
   }
}

/// Calls `resend` after each delay of [`RETRY_SCHEDULE`] until the device
/// has produced a vendor reading, giving up after `retries` attempts.
async fn resend_until_streaming<F, Fut>(weak: WeakWearable, retries: usize, mut resend: F)
where
   F: FnMut() -> Fut,
   Fut: Future<Output = ()>,
{
   for (i, delay) in RETRY_SCHEDULE.iter().take(retries).enumerate() {
      time::sleep(*delay).await;
      let Some(this) = weak.upgrade() else {
         return;
      };
      if this.stream_seen() {
         info!("{}: Samples flowing after {i} retries", this.address());
         return;
      }
      warn!(
         "{}: [Retry {}] No samples {delay:?} after stream start, resending",
         this.address(),
         i + 1
      );
      resend().await;
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{
      bluetooth::gatt::Packet,
      event::EventBus,
      wearable::protocol::{ChargeState, Frame},
   };

   #[derive(Default)]
   struct Recorder(parking_lot::Mutex<Vec<WearableEvent>>);

   impl EventBus for Recorder {
      fn emit(&self, _device: &Wearable, event: WearableEvent) {
         self.0.lock().push(event);
      }
   }

   impl Recorder {
      fn take(&self) -> Vec<WearableEvent> {
         mem::take(&mut *self.0.lock())
      }
   }

   const NOW: u64 = 1_700_000_000_000;

   fn setup() -> (Wearable, Arc<Recorder>, EventSender) {
      let dev = Wearable::new(Address::any(), "Test Ring".to_string(), Profile::Generic);
      let rec = Arc::new(Recorder::default());
      let tx: EventSender = rec.clone();
      (dev, rec, tx)
   }

   fn frame(seq: u8, kind: FrameKind, payload: &[u8]) -> Inbound {
      Inbound::Frame(Frame {
         seq,
         kind: kind as u8,
         payload: Packet::from_slice(payload),
      })
   }

   #[test]
   fn test_vendor_reading_is_time_mapped() {
      let (dev, rec, tx) = setup();
      dev.process_inbound(
         frame(0, FrameKind::HeartRate, &[0x10, 0x27, 0, 0, 70, 0, 90]),
         NOW,
         &tx,
      );
      dev.process_inbound(
         frame(1, FrameKind::HeartRate, &[0xF8, 0x2A, 0, 0, 71, 0, 90]),
         NOW + 2_000,
         &tx,
      );

      let events = rec.take();
      assert_eq!(events.len(), 2);
      let WearableEvent::Samples(samples) = &events[1] else {
         panic!("expected samples");
      };
      // 11000 - 10000 device ms after the anchor, regardless of delivery time.
      assert_eq!(samples[0].captured_at_ms, NOW + 1_000);
      assert_eq!(dev.heart_rate(), Some(71));
      assert_eq!(dev.samples_received(), 2);
   }

   #[test]
   fn test_battery_event_only_on_change() {
      let (dev, rec, tx) = setup();
      dev.process_inbound(frame(0, FrameKind::Battery, &[0, 0, 0, 0, 80, 0]), NOW, &tx);
      dev.process_inbound(frame(1, FrameKind::Battery, &[0, 0, 0, 0, 80, 0]), NOW, &tx);
      dev.process_inbound(frame(2, FrameKind::Battery, &[0, 0, 0, 0, 80, 1]), NOW, &tx);

      let battery_events: Vec<_> = rec
         .take()
         .into_iter()
         .filter_map(|e| match e {
            WearableEvent::BatteryUpdated(b) => Some(b),
            _ => None,
         })
         .collect();
      assert_eq!(
         battery_events,
         vec![
            BatteryLevel {
               level: 80,
               state: ChargeState::Discharging
            },
            BatteryLevel {
               level: 80,
               state: ChargeState::Charging
            },
         ]
      );
      assert!(dev.battery().unwrap().is_charging());
   }

   #[test]
   fn test_standard_characteristics_use_host_time() {
      let (dev, rec, tx) = setup();
      dev.process_inbound(Inbound::HeartRate(Packet::from_slice(&[0x00, 58])), NOW, &tx);
      dev.process_inbound(Inbound::Battery(Packet::from_slice(&[64])), NOW + 5, &tx);

      let events = rec.take();
      let samples: Vec<_> = events
         .iter()
         .filter_map(|e| match e {
            WearableEvent::Samples(s) => Some(s[0].clone()),
            _ => None,
         })
         .collect();
      assert_eq!(samples.len(), 2);
      assert_eq!(samples[0].captured_at_ms, NOW);
      assert_eq!(samples[1].captured_at_ms, NOW + 5);
      assert_eq!(dev.battery().map(|b| b.level), Some(64));
   }

   #[test]
   fn test_device_info_updates_name_and_profile() {
      let (dev, rec, tx) = setup();
      let mut payload = vec![2, 0, 9, 1];
      payload.extend_from_slice(b"Halo Ring");
      dev.process_inbound(frame(0, FrameKind::DeviceInfo, &payload), NOW, &tx);
      dev.process_inbound(frame(1, FrameKind::DeviceInfo, &payload), NOW, &tx);

      assert_eq!(dev.name(), "Halo Ring");
      assert_eq!(dev.profile(), Profile::Ring);
      let infos = rec
         .take()
         .into_iter()
         .filter(|e| matches!(e, WearableEvent::InfoUpdated(_)))
         .count();
      assert_eq!(infos, 1);
      assert_eq!(dev.to_json()["device_info"]["firmware"], "0.9.1");
   }

   #[test]
   fn test_decode_errors_are_counted_not_emitted() {
      let (dev, rec, tx) = setup();
      dev.process_inbound(frame(0, FrameKind::SpO2, &[0, 0, 0, 0, 140, 10]), NOW, &tx);
      dev.process_inbound(Inbound::HeartRate(Packet::new()), NOW, &tx);
      dev.process_inbound(frame(1, FrameKind::Ack, &[0x41, 0x02]), NOW, &tx);

      assert!(rec.take().is_empty());
      assert_eq!(dev.decode_errors(), 2);
      assert_eq!(dev.samples_received(), 0);
   }

   #[test]
   fn test_only_vendor_readings_mark_stream_seen() {
      let (dev, _rec, tx) = setup();
      dev.process_inbound(Inbound::Battery(Packet::from_slice(&[80])), NOW, &tx);
      dev.process_inbound(Inbound::HeartRate(Packet::from_slice(&[0x00, 60])), NOW, &tx);
      assert_eq!(dev.samples_received(), 2);
      assert!(!dev.stream_seen());

      dev.process_inbound(frame(0, FrameKind::Steps, &[0, 0, 0, 0, 1, 0, 0, 0]), NOW, &tx);
      assert!(dev.stream_seen());

      // A new session starts over even though samples were counted before.
      dev.begin_session();
      assert!(!dev.stream_seen());
      assert_eq!(dev.samples_received(), 3);
   }

   #[tokio::test(start_paused = true)]
   async fn test_start_resent_on_schedule_until_streaming() {
      let (dev, _rec, tx) = setup();
      let sent = Arc::new(parking_lot::Mutex::new(Vec::new()));
      let start = time::Instant::now();

      let task = tokio::spawn(resend_until_streaming(WeakWearable::new(&dev), 4, {
         let sent = sent.clone();
         move || {
            sent.lock().push(start.elapsed().as_secs());
            async {}
         }
      }));

      // First vendor reading lands between the second and third resend.
      time::sleep(Duration::from_secs(6)).await;
      dev.process_inbound(frame(0, FrameKind::Steps, &[0, 0, 0, 0, 1, 0, 0, 0]), NOW, &tx);
      task.await.unwrap();

      assert_eq!(*sent.lock(), vec![2, 5]);
   }

   #[tokio::test(start_paused = true)]
   async fn test_start_resends_are_bounded() {
      let (dev, _rec, _tx) = setup();
      let count = Arc::new(AtomicU64::new(0));
      resend_until_streaming(WeakWearable::new(&dev), 2, {
         let count = count.clone();
         move || {
            count.fetch_add(1, Ordering::Relaxed);
            async {}
         }
      })
      .await;
      assert_eq!(count.load(Ordering::Relaxed), 2);
   }

   #[test]
   fn test_json_snapshot() {
      let (dev, _rec, tx) = setup();
      dev.process_inbound(frame(0, FrameKind::Steps, &[0, 0, 0, 0, 100, 0, 0, 0]), NOW, &tx);
      let v = dev.to_json();
      assert_eq!(v["name"], "Test Ring");
      assert_eq!(v["profile"], "generic");
      assert_eq!(v["connected"], false);
      assert_eq!(v["samples_received"], 1);
      assert_eq!(v["last_sample_ms"], NOW);
      assert!(v.get("battery").is_none());
   }

   #[tokio::test]
   async fn test_commands_require_connection() {
      let (dev, _rec, _tx) = setup();
      assert!(matches!(
         dev.start_stream(&[SensorKind::HeartRate]).await,
         Err(WearLinkError::DeviceNotConnected)
      ));
      assert!(matches!(
         dev.passthrough(&[0xA5]).await,
         Err(WearLinkError::DeviceNotConnected)
      ));
   }
}
