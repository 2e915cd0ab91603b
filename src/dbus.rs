use std::{collections::HashMap, str::FromStr};

use bluer::Address;
use log::info;
use zbus::{interface, object_server::SignalEmitter, zvariant};

use crate::{
   bluetooth::manager::BluetoothManager,
   uplink::Uplink,
   wearable::{
      device::Wearable,
      protocol::{Command, SensorKind},
   },
};

pub struct WearLinkService {
   bluetooth_manager: BluetoothManager,
   uplink: Uplink,
}

impl WearLinkService {
   pub const fn new(bluetooth_manager: BluetoothManager, uplink: Uplink) -> Self {
      Self {
         bluetooth_manager,
         uplink,
      }
   }

   async fn device(&self, address: &str) -> zbus::fdo::Result<Wearable> {
      let addr =
         Address::from_str(address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .bluetooth_manager
         .get_device(addr)
         .await
         .map_err(|_| zbus::fdo::Error::Failed("Device not found".into()))
   }
}

fn param<'a, 'v>(
   params: &'a HashMap<String, zvariant::Value<'v>>,
   key: &str,
) -> zbus::fdo::Result<&'a zvariant::Value<'v>> {
   params
      .get(key)
      .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Missing '{key}' parameter")))
}

fn parse_sensor(name: &str) -> zbus::fdo::Result<SensorKind> {
   SensorKind::from_str(name.trim())
      .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("Unknown sensor: {name}")))
}

/// Accepts either `"heart_rate,spo2"` or `["heart_rate", "spo2"]`.
fn parse_sensors(value: &zvariant::Value<'_>) -> zbus::fdo::Result<Vec<SensorKind>> {
   match value {
      zvariant::Value::Str(s) => s
         .as_str()
         .split(',')
         .filter(|s| !s.trim().is_empty())
         .map(parse_sensor)
         .collect(),
      zvariant::Value::Array(items) => items
         .iter()
         .map(|item| match item {
            zvariant::Value::Str(s) => parse_sensor(s.as_str()),
            other => Err(zbus::fdo::Error::InvalidArgs(format!(
               "Invalid sensor entry: {other}"
            ))),
         })
         .collect(),
      other => Err(zbus::fdo::Error::InvalidArgs(format!(
         "Invalid 'sensors' parameter: {other}"
      ))),
   }
}

/// Accepts any integer type that fits into a `u16`.
fn parse_u16(key: &str, value: &zvariant::Value<'_>) -> zbus::fdo::Result<u16> {
   let n: Option<u16> = match *value {
      zvariant::Value::U8(n) => Some(n.into()),
      zvariant::Value::U16(n) => Some(n),
      zvariant::Value::I16(n) => n.try_into().ok(),
      zvariant::Value::U32(n) => n.try_into().ok(),
      zvariant::Value::I32(n) => n.try_into().ok(),
      zvariant::Value::U64(n) => n.try_into().ok(),
      zvariant::Value::I64(n) => n.try_into().ok(),
      _ => None,
   };
   n.ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("Invalid '{key}' parameter: {value}")))
}

#[interface(name = "org.wearlink.Manager")]
impl WearLinkService {
   async fn get_devices(&self) -> zbus::fdo::Result<String> {
      let states: Vec<serde_json::Value> = self
         .bluetooth_manager
         .all_devices()
         .await
         .into_iter()
         .map(|d| d.to_json())
         .collect();
      Ok(serde_json::Value::Array(states).to_string())
   }

   async fn get_device(&self, address: String) -> zbus::fdo::Result<String> {
      let dev = self.device(&address).await?;
      Ok(dev.to_json().to_string())
   }

   async fn get_uplink_stats(&self) -> zbus::fdo::Result<String> {
      let stats = self
         .uplink
         .stats()
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
      Ok(stats.to_json().to_string())
   }

   async fn passthrough(&self, address: String, packet: String) -> zbus::fdo::Result<bool> {
      let dev = self.device(&address).await?;

      let packet = hex::decode(packet).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      dev.passthrough(&packet)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn send_command(
      &self,
      address: String,
      action: String,
      params: HashMap<String, zvariant::Value<'_>>,
   ) -> zbus::fdo::Result<bool> {
      let dev = self.device(&address).await?;

      match action.as_str() {
         "start_stream" => {
            let sensors = match params.get("sensors") {
               Some(value) => parse_sensors(value)?,
               None => dev.profile().default_sensors().to_vec(),
            };
            if sensors.is_empty() {
               return Err(zbus::fdo::Error::InvalidArgs("No sensors selected".into()));
            }

            dev.start_stream(&sensors)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Started stream of {sensors:?} for {address}");
         },

         "stop_stream" => {
            dev.send_command(Command::StopStream)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Stopped stream for {address}");
         },

         "set_rate" => {
            let sensor = param(&params, "sensor")?
               .downcast_ref::<String>()
               .map_err(|e| {
                  zbus::fdo::Error::InvalidArgs(format!("Invalid 'sensor' parameter: {e}"))
               })?;
            let sensor = parse_sensor(&sensor)?;
            let rate = parse_u16("rate", param(&params, "rate")?)?;
            if rate == 0 {
               return Err(zbus::fdo::Error::InvalidArgs("Rate must be positive".into()));
            }

            dev.set_rate(sensor, rate)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

            info!("Set {sensor} rate to {rate} Hz for {address}");
         },

         "get_info" => {
            dev.send_command(Command::GetInfo)
               .await
               .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
         },

         _ => {
            return Err(zbus::fdo::Error::InvalidArgs(format!(
               "Unknown action: {action}"
            )));
         },
      }

      Ok(true)
   }

   async fn connect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .bluetooth_manager
         .connect_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   async fn disconnect_device(&self, address: String) -> zbus::fdo::Result<bool> {
      let addr =
         Address::from_str(&address).map_err(|e| zbus::fdo::Error::InvalidArgs(e.to_string()))?;

      self
         .bluetooth_manager
         .disconnect_device(addr)
         .await
         .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;

      Ok(true)
   }

   // Signals
   #[zbus(signal)]
   pub async fn device_connected(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_disconnected(emitter: &SignalEmitter<'_>, address: &str)
   -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn battery_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      battery: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_info_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      info: &str,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn heart_rate_updated(
      emitter: &SignalEmitter<'_>,
      address: &str,
      bpm: u16,
   ) -> zbus::Result<()>;

   #[zbus(signal)]
   pub async fn device_error(emitter: &SignalEmitter<'_>, address: &str) -> zbus::Result<()>;

   // Properties for polling-free updates
   #[zbus(property)]
   async fn devices(&self) -> String {
      self.get_devices().await.unwrap_or_default()
   }

   #[zbus(property)]
   async fn connected_count(&self) -> u32 {
      self.bluetooth_manager.count_devices().await
   }
}
