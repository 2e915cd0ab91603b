//! Wearable protocol definitions and data structures.
//!
//! This module contains the GATT identifiers, frame constants, command
//! definitions and sample types shared by the framer, the parser and the
//! uplink.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::json;
use smallvec::SmallVec;
use smol_str::SmolStr;
use uuid::Uuid;

use crate::{bluetooth::gatt::Packet, wearable::framer::encode_frame};

/// Nordic UART service carrying the framed vendor stream.
pub const VENDOR_SERVICE: Uuid = Uuid::from_u128(0x6e400001_b5a3_f393_e0a9_e50e24dcca9e);
/// Host → device characteristic (write).
pub const VENDOR_RX_CHAR: Uuid = Uuid::from_u128(0x6e400002_b5a3_f393_e0a9_e50e24dcca9e);
/// Device → host characteristic (notify).
pub const VENDOR_TX_CHAR: Uuid = Uuid::from_u128(0x6e400003_b5a3_f393_e0a9_e50e24dcca9e);

pub const HEART_RATE_SERVICE: Uuid = Uuid::from_u128(0x0000180d_0000_1000_8000_00805f9b34fb);
pub const HEART_RATE_MEASUREMENT_CHAR: Uuid =
   Uuid::from_u128(0x00002a37_0000_1000_8000_00805f9b34fb);
pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL_CHAR: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);

// Frame layout
pub const FRAME_SOF: u8 = 0xA5;
pub const FRAME_VERSION: u8 = 0x01;
/// SOF, version, sequence, kind, u16 length.
pub const FRAME_HEADER_LEN: usize = 6;
pub const FRAME_CRC_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = 1024;
pub const MAX_FRAME_LEN: usize = FRAME_HEADER_LEN + MAX_PAYLOAD_LEN + FRAME_CRC_LEN;

/// Kind byte of a vendor frame.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::FromRepr, strum::Display)]
pub enum FrameKind {
   HeartRate = 0x01,
   SpO2 = 0x02,
   Ppg = 0x03,
   Motion = 0x04,
   Temperature = 0x05,
   Battery = 0x06,
   Steps = 0x07,
   Ack = 0x20,
   DeviceInfo = 0x21,
   StartStream = 0x40,
   StopStream = 0x41,
   SetRate = 0x42,
   GetInfo = 0x43,
}

/// A single sensor frame decoded from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
   pub seq: u8,
   pub kind: u8,
   pub payload: Packet,
}

/// Sensors a wearable can stream.
#[repr(u8)]
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Hash,
   Serialize,
   Deserialize,
   strum::FromRepr,
   strum::Display,
   strum::EnumString,
   strum::EnumIter,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum SensorKind {
   HeartRate = 0x01,
   #[serde(rename = "spo2")]
   #[strum(serialize = "spo2")]
   SpO2 = 0x02,
   Ppg = 0x03,
   Motion = 0x04,
   Temperature = 0x05,
   Battery = 0x06,
   Steps = 0x07,
}

impl SensorKind {
   pub const fn bit(self) -> u8 {
      1 << (self as u8 - 1)
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Bitmask of sensors used by the start-stream command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct SensorMask(u8);

impl SensorMask {
   pub const fn bits(self) -> u8 {
      self.0
   }

   pub const fn from_bits(bits: u8) -> Self {
      Self(bits & 0x7F)
   }

   pub fn from_sensors<I>(sensors: I) -> Self
   where
      I: IntoIterator<Item = SensorKind>,
   {
      Self(sensors.into_iter().fold(0, |acc, s| acc | s.bit()))
   }

   pub const fn contains(self, sensor: SensorKind) -> bool {
      self.0 & sensor.bit() != 0
   }

   pub fn iter(self) -> impl Iterator<Item = SensorKind> {
      <SensorKind as strum::IntoEnumIterator>::iter().filter(move |s| self.contains(*s))
   }
}

/// Device class, used to pick default sensors.
#[derive(
   Debug,
   Clone,
   Copy,
   PartialEq,
   Eq,
   Default,
   Serialize,
   Deserialize,
   strum::Display,
   strum::EnumString,
   strum::IntoStaticStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Profile {
   Earphone,
   Ring,
   #[default]
   Generic,
}

impl Profile {
   pub const fn from_model(model: u8) -> Self {
      match model {
         1 => Self::Earphone,
         2 => Self::Ring,
         _ => Self::Generic,
      }
   }

   pub const fn default_sensors(self) -> &'static [SensorKind] {
      match self {
         Self::Earphone => &[
            SensorKind::HeartRate,
            SensorKind::Temperature,
            SensorKind::Motion,
            SensorKind::Battery,
         ],
         Self::Ring => &[
            SensorKind::HeartRate,
            SensorKind::SpO2,
            SensorKind::Temperature,
            SensorKind::Steps,
            SensorKind::Battery,
         ],
         Self::Generic => &[SensorKind::HeartRate, SensorKind::Battery],
      }
   }

   pub fn to_str(self) -> &'static str {
      self.into()
   }
}

/// Optical channel of a PPG block.
#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum PpgChannel {
   Green = 0,
   Red = 1,
   Infrared = 2,
}

/// Charging state reported alongside a battery level.
#[repr(u8)]
#[derive(
   Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::FromRepr, strum::Display,
)]
#[serde(rename_all = "lowercase")]
pub enum ChargeState {
   Discharging = 0,
   Charging = 1,
   Full = 2,
   /// Standard battery characteristic carries no charge state.
   Unknown = 0xFF,
}

/// A decoded sensor value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Reading {
   HeartRate {
      bpm: u16,
      #[serde(default, skip_serializing_if = "Option::is_none")]
      confidence: Option<u8>,
      #[serde(default, skip_serializing_if = "Option::is_none")]
      contact: Option<bool>,
      #[serde(default, skip_serializing_if = "SmallVec::is_empty")]
      rr_intervals_ms: SmallVec<[u16; 4]>,
   },
   #[serde(rename = "spo2")]
   SpO2 { percent: u8, confidence: u8 },
   Ppg {
      channel: PpgChannel,
      rate_hz: u16,
      values: Vec<u32>,
   },
   Motion {
      rate_hz: u16,
      range_g: u8,
      samples: Vec<[f32; 3]>,
   },
   Temperature { celsius: f32 },
   Battery { level: u8, state: ChargeState },
   Steps { total: u32 },
}

impl Reading {
   pub const fn sensor(&self) -> SensorKind {
      match self {
         Self::HeartRate { .. } => SensorKind::HeartRate,
         Self::SpO2 { .. } => SensorKind::SpO2,
         Self::Ppg { .. } => SensorKind::Ppg,
         Self::Motion { .. } => SensorKind::Motion,
         Self::Temperature { .. } => SensorKind::Temperature,
         Self::Battery { .. } => SensorKind::Battery,
         Self::Steps { .. } => SensorKind::Steps,
      }
   }
}

/// A reading stamped with wall-clock capture time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
   pub captured_at_ms: u64,
   #[serde(flatten)]
   pub reading: Reading,
}

/// Battery state of a wearable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryLevel {
   pub level: u8,
   pub state: ChargeState,
}

impl BatteryLevel {
   pub fn is_charging(&self) -> bool {
      self.state == ChargeState::Charging
   }

   pub fn to_json(self) -> serde_json::Value {
      json!({
          "level": u32::from(self.level),
          "charging": self.is_charging(),
          "state": self.state.to_string(),
      })
   }
}

/// Identity reported by the device in a device-info frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
   pub model: Profile,
   pub firmware: [u8; 3],
   pub name: SmolStr,
}

impl DeviceInfo {
   pub fn firmware_str(&self) -> SmolStr {
      let [major, minor, patch] = self.firmware;
      smol_str::format_smolstr!("{major}.{minor}.{patch}")
   }

   pub fn to_json(&self) -> serde_json::Value {
      json!({
          "model": self.model.to_str(),
          "firmware": self.firmware_str().as_str(),
          "name": self.name.as_str(),
      })
   }
}

/// Commands the host can send over the vendor RX characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
   StartStream(SensorMask),
   StopStream,
   SetRate { sensor: SensorKind, rate_hz: u16 },
   GetInfo,
}

impl Command {
   pub const fn kind(self) -> FrameKind {
      match self {
         Self::StartStream(_) => FrameKind::StartStream,
         Self::StopStream => FrameKind::StopStream,
         Self::SetRate { .. } => FrameKind::SetRate,
         Self::GetInfo => FrameKind::GetInfo,
      }
   }

   pub const fn opcode(self) -> u8 {
      self.kind() as u8
   }

   fn payload(self) -> heapless::Vec<u8, 4> {
      let mut buf = heapless::Vec::new();
      match self {
         Self::StartStream(mask) => {
            let _ = buf.push(mask.bits());
         },
         Self::SetRate { sensor, rate_hz } => {
            let _ = buf.push(sensor as u8);
            let _ = buf.extend_from_slice(&rate_hz.to_le_bytes());
         },
         Self::StopStream | Self::GetInfo => {},
      }
      buf
   }

   /// Builds the wire frame for this command.
   pub fn encode(self, seq: u8) -> Packet {
      encode_frame(seq, self.opcode(), &self.payload())
   }
}

impl fmt::Display for Command {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         Self::StartStream(mask) => {
            f.write_str("start_stream(")?;
            for (i, s) in mask.iter().enumerate() {
               if i > 0 {
                  f.write_str(",")?;
               }
               f.write_str(s.to_str())?;
            }
            f.write_str(")")
         },
         Self::StopStream => f.write_str("stop_stream"),
         Self::SetRate { sensor, rate_hz } => write!(f, "set_rate({sensor}, {rate_hz}Hz)"),
         Self::GetInfo => f.write_str("get_info"),
      }
   }
}

#[cfg(test)]
mod tests {
   use std::str::FromStr;

   use super::*;

   #[test]
   fn test_sensor_mask() {
      let mask = SensorMask::from_sensors([SensorKind::HeartRate, SensorKind::Steps]);
      assert_eq!(mask.bits(), 0b0100_0001);
      assert!(mask.contains(SensorKind::HeartRate));
      assert!(!mask.contains(SensorKind::SpO2));
      assert_eq!(
         mask.iter().collect::<Vec<_>>(),
         vec![SensorKind::HeartRate, SensorKind::Steps]
      );
   }

   #[test]
   fn test_sensor_names() {
      assert_eq!(SensorKind::from_str("spo2").unwrap(), SensorKind::SpO2);
      assert_eq!(SensorKind::from_str("Heart_Rate").unwrap(), SensorKind::HeartRate);
      assert_eq!(SensorKind::SpO2.to_str(), "spo2");
      assert!(SensorKind::from_str("glucose").is_err());
   }

   #[test]
   fn test_command_encoding() {
      let cmd = Command::SetRate {
         sensor: SensorKind::Ppg,
         rate_hz: 100,
      };
      let pkt = cmd.encode(7);
      assert_eq!(&pkt[..6], &[FRAME_SOF, FRAME_VERSION, 7, 0x42, 3, 0]);
      assert_eq!(&pkt[6..9], &[0x03, 100, 0]);
      assert_eq!(pkt.len(), FRAME_HEADER_LEN + 3 + FRAME_CRC_LEN);

      let stop = Command::StopStream.encode(0);
      assert_eq!(stop.len(), FRAME_HEADER_LEN + FRAME_CRC_LEN);
      assert_eq!(stop[3], FrameKind::StopStream as u8);
   }

   #[test]
   fn test_sample_json_shape() {
      let sample = Sample {
         captured_at_ms: 1_700_000_000_000,
         reading: Reading::SpO2 {
            percent: 97,
            confidence: 80,
         },
      };
      let v = serde_json::to_value(&sample).unwrap();
      assert_eq!(v["type"], "spo2");
      assert_eq!(v["percent"], 97);
      assert_eq!(v["captured_at_ms"], 1_700_000_000_000u64);

      let hr = Sample {
         captured_at_ms: 1,
         reading: Reading::HeartRate {
            bpm: 61,
            confidence: None,
            contact: Some(true),
            rr_intervals_ms: SmallVec::new(),
         },
      };
      let v = serde_json::to_value(&hr).unwrap();
      assert_eq!(v["type"], "heart_rate");
      assert!(v.get("confidence").is_none());
      assert!(v.get("rr_intervals_ms").is_none());
   }

   #[test]
   fn test_profile_defaults() {
      assert_eq!(Profile::from_model(2), Profile::Ring);
      assert_eq!(Profile::from_model(9), Profile::Generic);
      assert!(Profile::Ring.default_sensors().contains(&SensorKind::SpO2));
      assert!(Profile::Earphone.default_sensors().contains(&SensorKind::Motion));
   }
}
