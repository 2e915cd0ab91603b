//! Wearable ingestion D-Bus service
//!
//! This service connects to BLE wearables (earphones, smart rings), decodes
//! their sensor notifications into typed samples and forwards them in
//! batches to an HTTP backend, while exposing device status and control over
//! D-Bus.

use std::{sync::Arc, time::Duration};

use crossbeam::queue::SegQueue;
use log::{info, warn};
use tokio::{signal, sync::Notify, time};
use zbus::{Connection, connection, object_server::InterfaceRef};

use bluetooth::manager::BluetoothManager;
use dbus::WearLinkService;
use event::{EventBus, WearableEvent};

mod bluetooth;
mod config;
mod dbus;
mod error;
mod event;
mod uplink;
mod wearable;

use crate::{
   dbus::WearLinkServiceSignals,
   error::Result,
   uplink::{Uplink, client::HttpTransport, spool::Spool},
   wearable::{device::Wearable, protocol::Reading},
};

const DBUS_NAME: &str = "org.wearlink";
const DBUS_PATH: &str = "/org/wearlink/manager";
/// Time allowed for delivering pending samples on shutdown
const SHUTDOWN_FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
   env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

   info!("Starting wearlinkd D-Bus service...");

   // Load configuration
   let config = config::Config::load()?;
   info!(
      "Loaded configuration with {} known devices",
      config.known_devices.len()
   );

   // Backend uplink
   let transport = HttpTransport::new(&config.uplink.endpoint, config.uplink.request_timeout())?;
   let spool = match Spool::open(config.uplink.spool_capacity) {
      Ok(spool) => Some(spool),
      Err(e) => {
         warn!("Spool unavailable, undeliverable batches will be dropped: {e}");
         None
      },
   };
   info!("Forwarding samples to {}", transport.endpoint());
   let uplink = Uplink::new(&config.uplink, Arc::new(transport), spool);

   // Create event channel
   let event_bus = EventProcessor::new();

   // Create Bluetooth manager with event sender and config
   let bluetooth_manager = BluetoothManager::new(event_bus.clone(), config).await?;

   // Create D-Bus service
   let service = WearLinkService::new(bluetooth_manager, uplink.clone());

   // Build D-Bus connection
   let connection = connection::Builder::session()?
      .name(DBUS_NAME)?
      .serve_at(DBUS_PATH, service)?
      .build()
      .await?;

   info!("wearlinkd D-Bus service started at {DBUS_NAME}");

   // Start event processor
   event_bus.spawn_dispatcher(connection, uplink.clone()).await?;

   // Wait for shutdown signal
   signal::ctrl_c().await?;
   info!("Shutting down wearlinkd...");

   match time::timeout(SHUTDOWN_FLUSH_TIMEOUT, uplink.flush()).await {
      Ok(Ok(())) => {},
      Ok(Err(e)) => warn!("Failed to flush uplink: {e}"),
      Err(_) => warn!("Timed out delivering pending samples"),
   }

   Ok(())
}

struct EventProcessor {
   queue: SegQueue<(Wearable, WearableEvent)>,
   notifier: Notify,
}

impl EventProcessor {
   fn new() -> Arc<Self> {
      Arc::new(Self {
         queue: SegQueue::new(),
         notifier: Notify::new(),
      })
   }
}

impl EventProcessor {
   async fn recv(self: &Arc<Self>) -> Option<(Wearable, WearableEvent)> {
      loop {
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         let notify = self.notifier.notified();
         if let Some(event) = self.queue.pop() {
            return Some(event);
         }
         if Arc::strong_count(self) == 1 {
            return None;
         }
         let _ = time::timeout(Duration::from_secs(1), notify).await;
      }
   }

   async fn dispatch(
      &self,
      iface: &InterfaceRef<WearLinkService>,
      uplink: &Uplink,
      (device, event): (Wearable, WearableEvent),
   ) -> Result<()> {
      let addr_str = device.address_str();
      match event {
         WearableEvent::DeviceConnected => {
            iface.device_connected(addr_str).await?;
         },
         WearableEvent::DeviceDisconnected => {
            iface.device_disconnected(addr_str).await?;
         },
         WearableEvent::BatteryUpdated(battery) => {
            iface
               .battery_updated(addr_str, &battery.to_json().to_string())
               .await?;
         },
         WearableEvent::InfoUpdated(info) => {
            iface
               .device_info_updated(addr_str, &info.to_json().to_string())
               .await?;
         },
         WearableEvent::Samples(samples) => {
            let bpm = samples.iter().rev().find_map(|s| match s.reading {
               Reading::HeartRate { bpm, .. } => Some(bpm),
               _ => None,
            });
            uplink
               .push(addr_str.clone(), device.name(), samples)
               .await?;
            if let Some(bpm) = bpm {
               iface.heart_rate_updated(addr_str, bpm).await?;
            }
         },
         WearableEvent::DeviceError => {
            iface.device_error(addr_str).await?;
         },
      }
      Ok(())
   }

   async fn spawn_dispatcher(self: Arc<Self>, connection: Connection, uplink: Uplink) -> Result<()> {
      let iface = connection
         .object_server()
         .interface::<_, WearLinkService>(DBUS_PATH)
         .await?;
      tokio::spawn(async move {
         while let Some(event) = self.recv().await {
            if let Err(e) = self.dispatch(&iface, &uplink, event).await {
               warn!("Error dispatching event: {e}");
            }
         }
      });

      Ok(())
   }
}

impl EventBus for EventProcessor {
   fn emit(&self, device: &Wearable, event: WearableEvent) {
      self.queue.push((device.clone(), event));
      self.notifier.notify_waiters();
   }
}
