//! Bluetooth device manager for wearables.
//!
//! This module handles Bluetooth adapter management, LE discovery,
//! and the GATT session lifecycle for supported wearables.

use std::{
   collections::{HashMap, HashSet},
   time::Duration,
};

use bluer::{Adapter, AdapterEvent, Address, DiscoveryFilter, DiscoveryTransport, Session};
use futures::stream::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use smol_str::SmolStr;
use tokio::{
   select,
   sync::{mpsc, oneshot},
   task::JoinHandle,
   time::{self, MissedTickBehavior},
};

use crate::{
   config::Config,
   error::{Result, WearLinkError},
   event::{EventSender, WearableEvent},
   wearable::{
      device::{SessionOptions, Wearable},
      protocol::Profile,
      recognition,
   },
};

/// Interval to check session health
const HEALTH_CHECK_INTERVAL: Duration = Duration::from_secs(5);
/// Interval to check for new adapters
const ADAPTER_CHECK_INTERVAL: Duration = Duration::from_secs(10);
/// Delay before retrying adapter operations after failure
const ADAPTER_RECOVERY_DELAY: Duration = Duration::from_secs(5);
/// Maximum time to wait for a GATT session to come up
const SESSION_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);
/// Maximum retry delay
const MAX_RETRY_DELAY: Duration = Duration::from_secs(120);
/// Channel buffer size
const CHANNEL_BUFFER_SIZE: usize = 1000;

// === Adapter Management ===

#[derive(Debug, Clone, PartialEq)]
enum AdapterState {
   Active,
   Lost,
   Failed(String),
}

struct AdapterInfo {
   adapter: Adapter,
   state: AdapterState,
   monitor_handle: Option<JoinHandle<()>>,
   retry_count: u32,
   name: SmolStr,
}

// === Device Management ===

#[derive(Debug, Copy, Clone, PartialEq)]
enum SessionState {
   Disconnected,
   Connecting,
   Connected,
   Failed(&'static str),
   WaitingToReconnect,
}

struct ManagedDevice {
   device: Wearable,
   state: SessionState,
   adapter_name: SmolStr,
   /// Keep the session up, reconnecting when it drops.
   wanted: bool,
   retry_count: u32,
   last_error: Option<String>,
   session_handle: Option<JoinHandle<()>>,
}

// === Commands ===

#[derive(Debug)]
enum ManagerCommand {
   // Adapter events
   AdapterAvailable(SmolStr, Adapter),
   AdapterLost(SmolStr),
   AdapterError(SmolStr, String), // adapter_name, error

   // Device events
   DeviceDiscovered(Address, SmolStr), // address, adapter_name
   DeviceLost(Address),
   SessionConnected(Address),
   SessionClosed(Address, bool), // address, is_error

   // User commands, a missing reply channel marks a scheduled retry
   Connect(Address, Option<oneshot::Sender<Result<()>>>),
   Disconnect(Address, Option<oneshot::Sender<Result<()>>>),
   GetDeviceState(Address, oneshot::Sender<Option<Wearable>>),
   GetAllDeviceStates(oneshot::Sender<Vec<Wearable>>),
   CountDevices(oneshot::Sender<u32>),
}

// === Main Manager ===

/// Main Bluetooth manager that handles device discovery and sessions.
///
/// This type provides a high-level interface for managing wearables
/// across all available Bluetooth adapters.
pub struct BluetoothManager {
   inbox: mpsc::Sender<ManagerCommand>,
}

impl BluetoothManager {
   pub async fn new(event_tx: EventSender, config: Config) -> Result<Self> {
      let session = Session::new().await?;
      let (command_tx, command_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      tokio::spawn(ManagerActor::new(session, config, event_tx, command_rx).run());
      Ok(Self { inbox: command_tx })
   }

   pub async fn connect_device(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Connect(address, Some(tx)))
         .await
         .map_err(|_| WearLinkError::ManagerShutdown)?;
      rx.await.map_err(|_| WearLinkError::ManagerShutdown)?
   }

   pub async fn disconnect_device(&self, address: Address) -> Result<()> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::Disconnect(address, Some(tx)))
         .await
         .map_err(|_| WearLinkError::ManagerShutdown)?;
      rx.await.map_err(|_| WearLinkError::ManagerShutdown)?
   }

   pub async fn get_device(&self, address: Address) -> Result<Wearable> {
      let (tx, rx) = oneshot::channel();
      self
         .inbox
         .send(ManagerCommand::GetDeviceState(address, tx))
         .await
         .map_err(|_| WearLinkError::DeviceNotFound(address))?;

      rx.await
         .ok()
         .flatten()
         .ok_or(WearLinkError::DeviceNotFound(address))
   }

   pub async fn all_devices(&self) -> Vec<Wearable> {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::GetAllDeviceStates(tx))
         .await
         .is_err()
      {
         return Vec::new();
      }
      rx.await.unwrap_or_default()
   }

   /// Number of devices with an active session.
   pub async fn count_devices(&self) -> u32 {
      let (tx, rx) = oneshot::channel();
      if self
         .inbox
         .send(ManagerCommand::CountDevices(tx))
         .await
         .is_err()
      {
         return 0;
      }
      rx.await.unwrap_or_default()
   }
}

// === Manager Actor ===

struct ManagerActor {
   config: Config,
   event_tx: EventSender,
   command_rx: mpsc::Receiver<ManagerCommand>,
   loopback_rx: mpsc::Receiver<ManagerCommand>,
   loopback_tx: mpsc::Sender<ManagerCommand>,
   session: Session,

   // State
   adapters: HashMap<SmolStr, AdapterInfo>,
   devices: HashMap<Address, ManagedDevice>,
   connecting: HashSet<Address>, // Prevent duplicate sessions
}

impl ManagerActor {
   fn new(
      session: Session,
      config: Config,
      event_tx: EventSender,
      command_rx: mpsc::Receiver<ManagerCommand>,
   ) -> Self {
      let (loopback_tx, loopback_rx) = mpsc::channel(CHANNEL_BUFFER_SIZE);
      Self {
         config,
         event_tx,
         command_rx,
         loopback_rx,
         loopback_tx,
         session,
         adapters: HashMap::new(),
         devices: HashMap::new(),
         connecting: HashSet::new(),
      }
   }

   async fn run(mut self) {
      info!("Bluetooth manager starting up");

      self.initialize_adapters().await;

      let mut health_check_interval = time::interval(HEALTH_CHECK_INTERVAL);
      health_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut adapter_check_interval = time::interval(ADAPTER_CHECK_INTERVAL);
      adapter_check_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      let mut poll_interval = time::interval(Duration::from_secs(self.config.poll_interval.max(1)));
      poll_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

      loop {
         select! {
             _ = health_check_interval.tick() => {
                 self.check_connection_health().await;
             }
             _ = adapter_check_interval.tick() => {
                 self.discover_new_adapters().await;
             }
             _ = poll_interval.tick() => {
                 self.scan_for_wearables().await;
             }
             cmd = self.command_rx.recv() => {
                 let Some(cmd) = cmd else {
                     info!("Bluetooth manager shutting down");
                     break;
                 };
                 self.handle_command(cmd).await;
             }
             Some(cmd) = self.loopback_rx.recv() => {
                 self.handle_command(cmd).await;
             }
         }
      }

      self.cleanup().await;
   }

   async fn initialize_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names {
               self.initialize_adapter(name.into()).await;
            }
         },
         Err(e) => {
            error!("Failed to get adapter names: {e}");
         },
      }

      // If no adapters found, try default
      if self.adapters.is_empty() {
         self.initialize_adapter(SmolStr::new_static("hci0")).await;
      }
   }

   async fn initialize_adapter(&mut self, name: SmolStr) {
      let adapter = match self.session.adapter(&name) {
         Ok(adapter) => adapter,
         Err(e) => {
            warn!("Failed to initialize adapter {name}: {e}");
            return;
         },
      };
      info!("Initializing adapter: {name}");

      if let Ok(powered) = adapter.is_powered().await
         && !powered
      {
         if let Err(e) = adapter.set_powered(true).await {
            warn!("Failed to power on adapter {name}: {e}");
            let loopback = self.loopback_tx.clone();
            tokio::spawn(async move {
               time::sleep(ADAPTER_RECOVERY_DELAY).await;
               let _ = loopback
                  .send(ManagerCommand::AdapterAvailable(name, adapter))
                  .await;
            });
            return;
         }
         info!("Powered on adapter: {name}");
      }

      self.adapters.insert(
         name.clone(),
         AdapterInfo {
            state: AdapterState::Active,
            monitor_handle: Some(Self::start_adapter_monitor(
               self.loopback_tx.clone(),
               name.clone(),
               adapter.clone(),
            )),
            adapter,
            retry_count: 0,
            name,
         },
      );
   }

   fn start_adapter_monitor(
      loopback: mpsc::Sender<ManagerCommand>,
      name: SmolStr,
      adapter: Adapter,
   ) -> JoinHandle<()> {
      tokio::spawn(async move {
         let filter = DiscoveryFilter {
            transport: DiscoveryTransport::Le,
            ..Default::default()
         };
         if let Err(e) = adapter.set_discovery_filter(filter).await {
            warn!("Failed to set LE discovery filter on {name}: {e}");
         }

         // Discovery stays active while the stream is alive.
         let mut events = match adapter.discover_devices().await {
            Ok(events) => Box::pin(events),
            Err(e) => {
               if let Err(e) = loopback
                  .send(ManagerCommand::AdapterError(
                     name.clone(),
                     format!("Failed to start discovery: {e}"),
                  ))
                  .await
               {
                  warn!("Channel overflow sending adapter error: {e}");
               }
               return;
            },
         };

         while let Some(event) = events.next().await {
            match event {
               AdapterEvent::DeviceAdded(addr) => {
                  debug!("Device added on {name}: {addr}");
                  let _ = loopback
                     .send(ManagerCommand::DeviceDiscovered(addr, name.clone()))
                     .await;
               },
               AdapterEvent::DeviceRemoved(addr) => {
                  debug!("Device removed on {name}: {addr}");
                  let _ = loopback.send(ManagerCommand::DeviceLost(addr)).await;
               },
               _ => {},
            }
         }

         // If we exit the event loop, adapter is probably gone
         if let Err(e) = loopback.send(ManagerCommand::AdapterLost(name)).await {
            warn!("Channel overflow sending adapter lost: {e}");
         }
      })
   }

   /// Returns the profile and whether to connect automatically, or `None`
   /// if the device is not a supported wearable.
   async fn classify(&self, device: &bluer::Device) -> Option<(Profile, bool)> {
      let addr = device.address().to_string();
      if let Some(known) = self.config.known_device(&addr) {
         return Some((known.profile, true));
      }
      let profile = recognition::recognize(device).await?;
      Some((profile, self.config.auto_connect))
   }

   async fn handle_command(&mut self, cmd: ManagerCommand) {
      match cmd {
         ManagerCommand::AdapterAvailable(name, adapter) => {
            self.handle_adapter_available(name, adapter).await;
         },
         ManagerCommand::AdapterLost(name) => {
            self.handle_adapter_lost(name);
         },
         ManagerCommand::AdapterError(name, error) => {
            self.handle_adapter_error(&name, error);
         },
         ManagerCommand::DeviceDiscovered(addr, adapter_name) => {
            self.handle_device_discovered(addr, adapter_name).await;
         },
         ManagerCommand::DeviceLost(addr) => {
            self.handle_device_lost(addr);
         },
         ManagerCommand::SessionConnected(addr) => {
            self.handle_session_connected(addr);
         },
         ManagerCommand::SessionClosed(addr, is_error) => {
            self.handle_session_closed(addr, is_error);
         },
         ManagerCommand::Connect(addr, Some(reply)) => {
            let result = self.connect_requested(addr).await;
            let _ = reply.send(result);
         },
         ManagerCommand::Connect(addr, None) => {
            if let Err(e) = self.establish_session(addr) {
               debug!("Scheduled reconnect to {addr} skipped: {e}");
               if let Some(device) = self.devices.get_mut(&addr)
                  && device.state == SessionState::WaitingToReconnect
               {
                  device.state = SessionState::Disconnected;
               }
            }
         },
         ManagerCommand::Disconnect(addr, reply) => {
            let result = self.disconnect_session(addr).await;
            if let Some(reply) = reply {
               let _ = reply.send(result);
            }
         },
         ManagerCommand::GetDeviceState(addr, reply) => {
            let state = self.devices.get(&addr).map(|d| d.device.clone());
            let _ = reply.send(state);
         },
         ManagerCommand::GetAllDeviceStates(reply) => {
            let states = self.devices.values().map(|d| d.device.clone()).collect();
            let _ = reply.send(states);
         },
         ManagerCommand::CountDevices(reply) => {
            let _ = reply.send(count_connected(self.devices.values()));
         },
      }
   }

   async fn handle_adapter_available(&mut self, name: SmolStr, adapter: Adapter) {
      info!("Adapter available: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         self.initialize_adapter(name).await;
         return;
      };
      info.adapter = adapter;
      info.state = AdapterState::Active;
      info.retry_count = 0;

      if info.monitor_handle.is_none() {
         info.monitor_handle = Some(Self::start_adapter_monitor(
            self.loopback_tx.clone(),
            name.clone(),
            info.adapter.clone(),
         ));
      }

      // Bring back sessions that died with the adapter
      let to_reconnect: Vec<Address> = self
         .devices
         .iter()
         .filter(|(_, d)| {
            d.adapter_name == name
               && d.wanted
               && matches!(d.state, SessionState::Failed(_) | SessionState::Disconnected)
         })
         .map(|(addr, _)| *addr)
         .collect();

      for addr in to_reconnect {
         if let Err(e) = self.establish_session(addr) {
            warn!("Failed to restore session with {addr}: {e}");
         }
      }
   }

   fn handle_adapter_lost(&mut self, name: SmolStr) {
      warn!("Adapter lost: {name}");

      let Some(info) = self.adapters.get_mut(&name) else {
         return;
      };
      info.state = AdapterState::Lost;
      info.retry_count += 1;

      if let Some(handle) = info.monitor_handle.take() {
         handle.abort();
      }

      for (addr, device) in &mut self.devices {
         if device.adapter_name == name {
            device.state = SessionState::Failed("Adapter lost");
            if let Some(handle) = device.session_handle.take() {
               handle.abort();
            }
            self.connecting.remove(addr);
            self.event_tx.emit(&device.device, WearableEvent::DeviceError);
         }
      }

      // Schedule adapter recovery with exponential backoff
      let loopback = self.loopback_tx.clone();
      let session = self.session.clone();
      let delay = calc_retry_delay(info.retry_count);

      tokio::spawn(async move {
         time::sleep(delay).await;

         let cmd = match session.adapter(&name) {
            Ok(adapter) => ManagerCommand::AdapterAvailable(name, adapter),
            Err(e) => ManagerCommand::AdapterError(name, format!("Recovery failed: {e}")),
         };
         let _ = loopback.send(cmd).await;
      });
   }

   fn handle_adapter_error(&mut self, name: &SmolStr, error: String) {
      error!("Adapter error on {name}: {error}");

      if let Some(info) = self.adapters.get_mut(name) {
         info.state = AdapterState::Failed(error);
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
         }
      }
   }

   /// Looks up a device on any active adapter.
   fn find_on_adapters(&self, addr: Address) -> Option<(SmolStr, bluer::Device)> {
      self
         .adapters
         .values()
         .filter(|info| info.state == AdapterState::Active)
         .find_map(|info| {
            info
               .adapter
               .device(addr)
               .ok()
               .map(|dev| (info.name.clone(), dev))
         })
   }

   async fn track_device(
      &mut self,
      addr: Address,
      adapter_name: SmolStr,
      device: &bluer::Device,
      profile: Profile,
   ) {
      let name = match self.config.known_device(&addr.to_string()) {
         Some(known) => known.name.clone(),
         None => device
            .name()
            .await
            .ok()
            .flatten()
            .unwrap_or_else(|| addr.to_string()),
      };
      info!("Found wearable: {name} ({addr}, {profile})");

      self.devices.insert(
         addr,
         ManagedDevice {
            device: Wearable::new(addr, name, profile),
            state: SessionState::Disconnected,
            adapter_name,
            wanted: false,
            retry_count: 0,
            last_error: None,
            session_handle: None,
         },
      );
   }

   async fn handle_device_discovered(&mut self, addr: Address, adapter_name: SmolStr) {
      if let Some(managed) = self.devices.get_mut(&addr) {
         // Back in range after giving up
         if managed.wanted && managed.state == SessionState::Failed("Retries exhausted") {
            managed.retry_count = 0;
            if let Err(e) = self.establish_session(addr) {
               debug!("Reconnect to rediscovered {addr} failed: {e}");
            }
         }
         return;
      }

      let Some(adapter_info) = self.adapters.get(&adapter_name) else {
         return;
      };
      let Ok(device) = adapter_info.adapter.device(addr) else {
         return;
      };
      let Some((profile, auto)) = self.classify(&device).await else {
         return;
      };

      self.track_device(addr, adapter_name, &device, profile).await;

      if auto {
         if let Some(managed) = self.devices.get_mut(&addr) {
            managed.wanted = true;
         }
         if let Err(e) = self.establish_session(addr) {
            warn!("Failed to start session with {addr}: {e}");
         }
      }
   }

   fn handle_device_lost(&mut self, addr: Address) {
      // An active session outlives the cache entry
      if self
         .devices
         .get(&addr)
         .is_some_and(|d| matches!(d.state, SessionState::Connected | SessionState::Connecting))
      {
         return;
      }
      if let Some(mut device) = self.devices.remove(&addr) {
         if let Some(handle) = device.session_handle.take() {
            handle.abort();
         }
         self
            .event_tx
            .emit(&device.device, WearableEvent::DeviceDisconnected);
      }
      self.connecting.remove(&addr);
   }

   fn handle_session_connected(&mut self, addr: Address) {
      if let Some(device) = self.devices.get_mut(&addr) {
         device.state = SessionState::Connected;
         device.retry_count = 0;
         device.last_error = None;

         self
            .event_tx
            .emit(&device.device, WearableEvent::DeviceConnected);
      }

      self.connecting.remove(&addr);
   }

   fn handle_session_closed(&mut self, addr: Address, is_error: bool) {
      self.connecting.remove(&addr);
      let Some(device) = self.devices.get_mut(&addr) else {
         return;
      };
      device.session_handle = None;

      if !device.wanted {
         device.state = SessionState::Disconnected;
         device.retry_count = 0;
         return;
      }

      if device.retry_count >= self.config.connection_retry_count {
         warn!(
            "Giving up on {addr} after {} attempts: {}",
            device.retry_count,
            device.last_error.as_deref().unwrap_or("unknown error")
         );
         device.state = SessionState::Failed("Retries exhausted");
         self.event_tx.emit(&device.device, WearableEvent::DeviceError);
         return;
      }

      device.state = SessionState::WaitingToReconnect;
      device.retry_count += 1;
      let delay = if is_error {
         calc_retry_delay(device.retry_count)
      } else {
         Duration::from_secs(self.config.reconnect_delay_sec)
      };
      info!("Session with {addr} ended, reconnecting in {delay:?}");

      let loopback = self.loopback_tx.clone();
      tokio::spawn(async move {
         time::sleep(delay).await;
         let _ = loopback.send(ManagerCommand::Connect(addr, None)).await;
      });
   }

   async fn connect_requested(&mut self, addr: Address) -> Result<()> {
      if !self.devices.contains_key(&addr) {
         let (adapter_name, device) = self
            .find_on_adapters(addr)
            .ok_or(WearLinkError::DeviceNotFound(addr))?;
         let profile = self
            .classify(&device)
            .await
            .map_or(Profile::Generic, |(p, _)| p);
         self.track_device(addr, adapter_name, &device, profile).await;
      }

      let device = self
         .devices
         .get_mut(&addr)
         .ok_or(WearLinkError::DeviceNotFound(addr))?;
      device.wanted = true;
      device.retry_count = 0;
      if device.state == SessionState::Connected {
         return Ok(());
      }
      self.establish_session(addr)
   }

   fn establish_session(&mut self, addr: Address) -> Result<()> {
      if self.connecting.contains(&addr) {
         return Err(WearLinkError::AlreadyConnecting);
      }

      let device = self
         .devices
         .get_mut(&addr)
         .ok_or(WearLinkError::DeviceNotFound(addr))?;

      if device.state == SessionState::Connected {
         return Ok(());
      }

      let adapter_info = self
         .adapters
         .get(&device.adapter_name)
         .ok_or(WearLinkError::AdapterNotFound)?;

      if adapter_info.state != AdapterState::Active {
         return Err(WearLinkError::AdapterNotAvailable);
      }

      let bluer_device = adapter_info.adapter.device(addr)?;
      let wearable = device.device.clone();
      let opts = SessionOptions::new(
         &self
            .config
            .sensors_for(wearable.address_str(), wearable.profile()),
         self.config.notification_retries,
      );
      let event_tx = self.event_tx.clone();
      let loopback = self.loopback_tx.clone();

      let handle = tokio::spawn(async move {
         let connect = wearable.connect(&bluer_device, &event_tx, opts);
         let err = match time::timeout(SESSION_CONNECTION_TIMEOUT, connect).await {
            Ok(Err(e)) => {
               warn!("Failed to open session with {addr}: {e}");
               event_tx.emit(&wearable, WearableEvent::DeviceError);
               Some(e)
            },
            Err(_) => {
               warn!("Session with {addr} timed out");
               event_tx.emit(&wearable, WearableEvent::DeviceError);
               Some(WearLinkError::RequestTimeout)
            },
            Ok(Ok(jhandle)) => {
               if let Err(e) = loopback.send(ManagerCommand::SessionConnected(addr)).await {
                  warn!("Channel overflow sending session connected: {e}");
                  return;
               }

               let err = match jhandle.await {
                  Ok(x) => x,
                  Err(x) => Some(WearLinkError::ActorPanicked(x)),
               };

               if let Some(err) = &err {
                  warn!("Session with {addr} terminated: {err:?}");
               } else {
                  info!("Session with {addr} closed cleanly");
               }
               err
            },
         };
         if let Err(e) = loopback
            .send(ManagerCommand::SessionClosed(addr, err.is_some()))
            .await
         {
            warn!("Channel overflow sending session closed: {e}");
         }
      });

      device.session_handle = Some(handle);
      self.connecting.insert(addr);
      device.state = SessionState::Connecting;

      Ok(())
   }

   async fn disconnect_session(&mut self, addr: Address) -> Result<()> {
      let device = self
         .devices
         .get_mut(&addr)
         .ok_or(WearLinkError::DeviceNotFound(addr))?;

      device.wanted = false;
      if let Some(handle) = device.session_handle.take() {
         handle.abort();
      }

      device.state = SessionState::Disconnected;
      device.device.disconnect().await;

      if let Some(info) = self.adapters.get(&device.adapter_name)
         && let Ok(bluer_device) = info.adapter.device(addr)
         && let Err(e) = bluer_device.disconnect().await
      {
         debug!("BlueZ disconnect of {addr} failed: {e}");
      }

      self.connecting.remove(&addr);
      self
         .event_tx
         .emit(&device.device, WearableEvent::DeviceDisconnected);

      Ok(())
   }

   async fn cleanup(&mut self) {
      use tokio::time::timeout;
      info!("Cleaning up Bluetooth manager");

      for info in self.adapters.values_mut() {
         if let Some(handle) = info.monitor_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
      }

      for device in self.devices.values_mut() {
         if let Some(handle) = device.session_handle.take() {
            handle.abort();
            let _ = timeout(Duration::from_secs(1), handle).await;
         }
         device.device.disconnect().await;
      }
   }

   async fn discover_new_adapters(&mut self) {
      match self.session.adapter_names().await {
         Ok(names) => {
            for name in names.into_iter().map(SmolStr::from) {
               if !self.adapters.contains_key(&name)
                  || matches!(
                     self.adapters.get(&name).map(|info| &info.state),
                     Some(AdapterState::Lost | AdapterState::Failed(_))
                  )
               {
                  self.initialize_adapter(name).await;
               }
            }
         },
         Err(e) => {
            warn!("Failed to poll adapter names: {e}. Retrying later.");
         },
      }
   }

   /// Picks up cached devices that never produced a discovery event.
   async fn scan_for_wearables(&self) {
      for adapter_info in self.adapters.values() {
         if adapter_info.state != AdapterState::Active {
            continue;
         }

         let Ok(addresses) = adapter_info.adapter.device_addresses().await else {
            continue;
         };
         for addr in addresses {
            if !self.devices.contains_key(&addr) {
               let _ = self
                  .loopback_tx
                  .send(ManagerCommand::DeviceDiscovered(
                     addr,
                     adapter_info.name.clone(),
                  ))
                  .await;
            }
         }
      }
   }

   async fn check_connection_health(&mut self) {
      let mut dropped = Vec::new();
      for (addr, device) in &self.devices {
         if device.state != SessionState::Connected {
            continue;
         }
         if let Some(adapter_info) = self.adapters.get(&device.adapter_name)
            && let Ok(bluer_device) = adapter_info.adapter.device(*addr)
            && !bluer_device.is_connected().await.unwrap_or(false)
         {
            dropped.push(*addr);
         }
      }

      // The link went away without the notify streams noticing
      for addr in dropped {
         if let Some(device) = self.devices.get_mut(&addr) {
            warn!("Link to {addr} dropped");
            device.last_error = Some("Link dropped".to_string());
            if let Some(handle) = device.session_handle.take() {
               handle.abort();
            }
            device.device.disconnect().await;
            self
               .event_tx
               .emit(&device.device, WearableEvent::DeviceDisconnected);
         }
         let _ = self
            .loopback_tx
            .send(ManagerCommand::SessionClosed(addr, true))
            .await;
      }
   }
}

/// Tracked devices include discovered ones that never connected.
fn count_connected<'a>(devices: impl IntoIterator<Item = &'a ManagedDevice>) -> u32 {
   devices
      .into_iter()
      .filter(|d| d.state == SessionState::Connected)
      .count() as u32
}

fn calc_retry_delay(retry_count: u32) -> Duration {
   let base_delay = Duration::from_secs(2);
   let exponential = base_delay * (1 << retry_count.min(4));
   let delay = exponential.min(MAX_RETRY_DELAY);
   let jitter = rand::thread_rng().gen_range(0..1000);
   delay + Duration::from_millis(jitter)
}
