//! Configuration management for the wearable service.
//!
//! This module handles loading and saving configuration from disk,
//! including known devices, connection parameters and the backend uplink.

use std::{env, fs, path::PathBuf, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
   error::{Result, WearLinkError},
   wearable::protocol::{Profile, SensorKind},
};

/// Main configuration structure for the service.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Config {
   #[serde(default)]
   pub known_devices: Vec<KnownDevice>,

   /// Connect to recognised wearables that are not listed in `known_devices`.
   #[serde(default)]
   pub auto_connect: bool,

   #[serde(default = "default_poll_interval")]
   pub poll_interval: u64,

   #[serde(default = "default_retry_count")]
   pub connection_retry_count: u32,

   #[serde(default = "default_reconnect_delay")]
   pub reconnect_delay_sec: u64,

   #[serde(default = "default_notification_retries")]
   pub notification_retries: u32,

   #[serde(default)]
   pub uplink: UplinkConfig,
}

/// Represents a known wearable.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct KnownDevice {
   pub address: String,
   pub name: String,
   #[serde(default)]
   pub profile: Profile,
   /// Sensors to stream. Empty means the profile defaults.
   #[serde(default)]
   pub sensors: Vec<SensorKind>,
}

/// Backend forwarding parameters.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct UplinkConfig {
   #[serde(default = "default_endpoint")]
   pub endpoint: String,

   #[serde(default = "default_max_batch_samples")]
   pub max_batch_samples: usize,

   #[serde(default = "default_flush_interval_ms")]
   pub flush_interval_ms: u64,

   #[serde(default = "default_request_timeout")]
   pub request_timeout_sec: u64,

   #[serde(default = "default_max_attempts")]
   pub max_attempts: u32,

   #[serde(default = "default_spool_capacity")]
   pub spool_capacity: usize,
}

const fn default_poll_interval() -> u64 {
   30
}

const fn default_retry_count() -> u32 {
   10
}

const fn default_notification_retries() -> u32 {
   4
}

const fn default_reconnect_delay() -> u64 {
   10
}

fn default_endpoint() -> String {
   "http://127.0.0.1:5000/ingest".to_string()
}

const fn default_max_batch_samples() -> usize {
   256
}

const fn default_flush_interval_ms() -> u64 {
   5_000
}

const fn default_request_timeout() -> u64 {
   10
}

const fn default_max_attempts() -> u32 {
   3
}

const fn default_spool_capacity() -> usize {
   4096
}

impl Default for UplinkConfig {
   fn default() -> Self {
      Self {
         endpoint: default_endpoint(),
         max_batch_samples: default_max_batch_samples(),
         flush_interval_ms: default_flush_interval_ms(),
         request_timeout_sec: default_request_timeout(),
         max_attempts: default_max_attempts(),
         spool_capacity: default_spool_capacity(),
      }
   }
}

impl UplinkConfig {
   pub const fn flush_interval(&self) -> Duration {
      Duration::from_millis(self.flush_interval_ms)
   }

   pub const fn request_timeout(&self) -> Duration {
      Duration::from_secs(self.request_timeout_sec)
   }
}

impl Default for Config {
   fn default() -> Self {
      Self {
         known_devices: vec![],
         auto_connect: false,
         poll_interval: default_poll_interval(),
         connection_retry_count: default_retry_count(),
         reconnect_delay_sec: default_reconnect_delay(),
         notification_retries: default_notification_retries(),
         uplink: UplinkConfig::default(),
      }
   }
}

impl Config {
   /// Loads configuration from disk or creates default if not exists.
   pub fn load() -> Result<Self> {
      let config_path = Self::config_path()?;

      if config_path.exists() {
         let contents = fs::read_to_string(&config_path)?;
         Ok(toml::from_str(&contents)?)
      } else {
         let config = Self::default();
         config.save()?;
         Ok(config)
      }
   }

   /// Saves the current configuration to disk.
   pub fn save(&self) -> Result<()> {
      let config_path = Self::config_path()?;

      if let Some(parent) = config_path.parent() {
         fs::create_dir_all(parent)?;
      }

      let contents = toml::to_string_pretty(self)?;
      fs::write(&config_path, contents)?;

      Ok(())
   }

   fn config_path() -> Result<PathBuf> {
      let config_dir = if let Ok(home) = env::var("WEARLINK_HOME") {
         PathBuf::from(home)
      } else if let Ok(config_home) = env::var("XDG_CONFIG_HOME") {
         PathBuf::from(config_home)
      } else if let Ok(home) = env::var("HOME") {
         PathBuf::from(home).join(".config")
      } else {
         return Err(WearLinkError::ConfigDirNotFound);
      };

      Ok(config_dir.join("wearlinkd").join("config.toml"))
   }

   /// Looks up a configured device by its address string.
   pub fn known_device(&self, address: &str) -> Option<&KnownDevice> {
      self
         .known_devices
         .iter()
         .find(|d| d.address.eq_ignore_ascii_case(address))
   }

   /// Sensors to request from a device, falling back to the profile defaults.
   pub fn sensors_for(&self, address: &str, profile: Profile) -> Vec<SensorKind> {
      match self.known_device(address) {
         Some(dev) if !dev.sensors.is_empty() => dev.sensors.clone(),
         Some(dev) => dev.profile.default_sensors().to_vec(),
         None => profile.default_sensors().to_vec(),
      }
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   #[test]
   fn test_empty_config_uses_defaults() {
      let config: Config = toml::from_str("").unwrap();
      assert!(config.known_devices.is_empty());
      assert!(!config.auto_connect);
      assert_eq!(config.poll_interval, 30);
      assert_eq!(config.uplink.max_batch_samples, 256);
      assert_eq!(config.uplink.flush_interval(), Duration::from_secs(5));
      assert_eq!(config.uplink.endpoint, "http://127.0.0.1:5000/ingest");
   }

   #[test]
   fn test_known_device_lookup() {
      let config: Config = toml::from_str(
         r#"
         auto_connect = true

         [[known_devices]]
         address = "AA:BB:CC:DD:EE:01"
         name = "Sleep Ring"
         profile = "ring"
         sensors = ["heart_rate", "spo2"]

         [[known_devices]]
         address = "AA:BB:CC:DD:EE:02"
         name = "Run Buds"
         profile = "earphone"

         [uplink]
         endpoint = "http://10.0.0.2:8080/api/samples"
         max_batch_samples = 64
         "#,
      )
      .unwrap();

      assert!(config.auto_connect);
      assert_eq!(config.uplink.max_batch_samples, 64);
      assert_eq!(config.uplink.max_attempts, 3);

      let ring = config.known_device("aa:bb:cc:dd:ee:01").unwrap();
      assert_eq!(ring.name, "Sleep Ring");
      assert_eq!(ring.profile, Profile::Ring);
      assert_eq!(
         config.sensors_for("AA:BB:CC:DD:EE:01", Profile::Generic),
         vec![SensorKind::HeartRate, SensorKind::SpO2]
      );

      // No explicit sensors: the configured profile wins over the guess.
      assert_eq!(
         config.sensors_for("AA:BB:CC:DD:EE:02", Profile::Ring),
         Profile::Earphone.default_sensors()
      );
      assert!(config.known_device("AA:BB:CC:DD:EE:03").is_none());
   }

   #[test]
   fn test_round_trips_through_toml() {
      let mut config = Config::default();
      config.known_devices.push(KnownDevice {
         address: "AA:BB:CC:DD:EE:01".into(),
         name: "Ring".into(),
         profile: Profile::Ring,
         sensors: vec![SensorKind::Steps],
      });
      let text = toml::to_string_pretty(&config).unwrap();
      let back: Config = toml::from_str(&text).unwrap();
      assert_eq!(back.known_devices.len(), 1);
      assert_eq!(back.known_devices[0].sensors, vec![SensorKind::Steps]);
   }
}
