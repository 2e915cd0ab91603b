//! Packet parsing utilities for the wearable protocol.
//!
//! This module turns reassembled vendor frames and raw values of the
//! standard GATT characteristics into typed readings.

use std::str;

use log::{debug, warn};
use smallvec::SmallVec;
use thiserror::Error;

use crate::{
   error::Result,
   wearable::protocol::{
      BatteryLevel, ChargeState, DeviceInfo, Frame, FrameKind, PpgChannel, Profile, Reading,
   },
};

/// Error type for protocol parsing.
#[derive(Error, Debug)]
pub enum ProtoError {
   /// Frame kind is not known to this implementation
   #[error("Unknown frame kind: 0x{kind:02x}")]
   UnknownKind { kind: u8 },

   /// Frame is a host command, not something a device sends
   #[error("Unexpected {kind} frame from device")]
   UnexpectedKind { kind: FrameKind },

   /// Packet is too short for the expected format
   #[error("Packet too short: expected at least {expected} bytes, got {actual}")]
   PacketTooShort { expected: usize, actual: usize },

   /// Repeated sample block does not divide evenly
   #[error("Packet size mismatch: {actual} bytes is not a multiple of {stride}")]
   PacketSizeMismatch { stride: usize, actual: usize },

   /// A field carries a value outside its legal range
   #[error("Value out of range for {field}: {value}")]
   OutOfRange { field: &'static str, value: i64 },

   /// Unknown PPG channel
   #[error("Unknown PPG channel: 0x{channel:02x}")]
   UnknownChannel { channel: u8 },

   /// Unknown charge state
   #[error("Unknown charge state: 0x{state:02x}")]
   UnknownChargeState { state: u8 },
}

/// Result of decoding a device frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
   /// A reading stamped with the device clock (ms since boot).
   Reading { device_ms: u32, reading: Reading },
   /// Acknowledgement of a host command.
   Ack { opcode: u8, status: u8 },
   /// Device identity.
   Info(DeviceInfo),
}

/// Little-endian cursor over a payload.
struct Reader<'a> {
   data: &'a [u8],
   pos: usize,
   total: usize,
}

impl<'a> Reader<'a> {
   const fn new(data: &'a [u8]) -> Self {
      Self {
         data,
         pos: 0,
         total: data.len(),
      }
   }

   fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
      let Some(bytes) = self.data.get(self.pos..self.pos + N) else {
         return Err(
            ProtoError::PacketTooShort {
               expected: self.pos + N,
               actual: self.total,
            }
            .into(),
         );
      };
      self.pos += N;
      let mut out = [0u8; N];
      out.copy_from_slice(bytes);
      Ok(out)
   }

   fn u8(&mut self) -> Result<u8> {
      Ok(self.take::<1>()?[0])
   }

   fn u16(&mut self) -> Result<u16> {
      Ok(u16::from_le_bytes(self.take()?))
   }

   fn i16(&mut self) -> Result<i16> {
      Ok(i16::from_le_bytes(self.take()?))
   }

   fn u32(&mut self) -> Result<u32> {
      Ok(u32::from_le_bytes(self.take()?))
   }

   fn rest(&mut self) -> &'a [u8] {
      let rest = &self.data[self.pos..];
      self.pos = self.data.len();
      rest
   }

   /// Remaining bytes split into fixed-size records.
   fn records(&mut self, stride: usize) -> Result<std::slice::ChunksExact<'a, u8>> {
      let rest = self.rest();
      if rest.len() % stride != 0 {
         return Err(
            ProtoError::PacketSizeMismatch {
               stride,
               actual: rest.len(),
            }
            .into(),
         );
      }
      Ok(rest.chunks_exact(stride))
   }
}

fn check_range(field: &'static str, value: i64, range: std::ops::RangeInclusive<i64>) -> Result<()> {
   if range.contains(&value) {
      Ok(())
   } else {
      Err(ProtoError::OutOfRange { field, value }.into())
   }
}

/// Decodes one vendor frame.
pub fn decode_frame(frame: &Frame) -> Result<Decoded> {
   let Some(kind) = FrameKind::from_repr(frame.kind) else {
      return Err(ProtoError::UnknownKind { kind: frame.kind }.into());
   };
   let mut r = Reader::new(&frame.payload);

   let (device_ms, reading) = match kind {
      FrameKind::Ack => {
         let opcode = r.u8()?;
         let status = r.u8()?;
         return Ok(Decoded::Ack { opcode, status });
      },
      FrameKind::DeviceInfo => return parse_device_info(&mut r).map(Decoded::Info),
      FrameKind::StartStream | FrameKind::StopStream | FrameKind::SetRate | FrameKind::GetInfo => {
         return Err(ProtoError::UnexpectedKind { kind }.into());
      },
      FrameKind::HeartRate => {
         let t = r.u32()?;
         let bpm = r.u16()?;
         let confidence = r.u8()?;
         check_range("heart_rate.confidence", confidence.into(), 0..=100)?;
         (
            t,
            Reading::HeartRate {
               bpm,
               confidence: Some(confidence),
               contact: None,
               rr_intervals_ms: SmallVec::new(),
            },
         )
      },
      FrameKind::SpO2 => {
         let t = r.u32()?;
         let percent = r.u8()?;
         let confidence = r.u8()?;
         check_range("spo2.percent", percent.into(), 0..=100)?;
         check_range("spo2.confidence", confidence.into(), 0..=100)?;
         (
            t,
            Reading::SpO2 {
               percent,
               confidence,
            },
         )
      },
      FrameKind::Ppg => {
         let t = r.u32()?;
         let raw_channel = r.u8()?;
         let channel = PpgChannel::from_repr(raw_channel).ok_or(ProtoError::UnknownChannel {
            channel: raw_channel,
         })?;
         let rate_hz = r.u16()?;
         check_range("ppg.rate_hz", rate_hz.into(), 1..=i64::from(u16::MAX))?;
         let values = r
            .records(3)?
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], 0]))
            .collect();
         (
            t,
            Reading::Ppg {
               channel,
               rate_hz,
               values,
            },
         )
      },
      FrameKind::Motion => {
         let t = r.u32()?;
         let rate_hz = r.u16()?;
         let range_g = r.u8()?;
         check_range("motion.rate_hz", rate_hz.into(), 1..=i64::from(u16::MAX))?;
         if !matches!(range_g, 2 | 4 | 8 | 16) {
            return Err(
               ProtoError::OutOfRange {
                  field: "motion.range_g",
                  value: range_g.into(),
               }
               .into(),
            );
         }
         let scale = f32::from(range_g) / 32768.0;
         let samples = r
            .records(6)?
            .map(|b| {
               let axis = |i: usize| f32::from(i16::from_le_bytes([b[i], b[i + 1]])) * scale;
               [axis(0), axis(2), axis(4)]
            })
            .collect();
         (
            t,
            Reading::Motion {
               rate_hz,
               range_g,
               samples,
            },
         )
      },
      FrameKind::Temperature => {
         let t = r.u32()?;
         let centi = r.i16()?;
         (
            t,
            Reading::Temperature {
               celsius: f32::from(centi) / 100.0,
            },
         )
      },
      FrameKind::Battery => {
         let t = r.u32()?;
         let level = r.u8()?;
         let raw_state = r.u8()?;
         check_range("battery.level", level.into(), 0..=100)?;
         let state = match ChargeState::from_repr(raw_state) {
            Some(ChargeState::Unknown) | None => {
               return Err(ProtoError::UnknownChargeState { state: raw_state }.into());
            },
            Some(s) => s,
         };
         (t, Reading::Battery { level, state })
      },
      FrameKind::Steps => {
         let t = r.u32()?;
         let total = r.u32()?;
         (t, Reading::Steps { total })
      },
   };

   Ok(Decoded::Reading { device_ms, reading })
}

fn parse_device_info(r: &mut Reader<'_>) -> Result<DeviceInfo> {
   let model = Profile::from_model(r.u8()?);
   let firmware = [r.u8()?, r.u8()?, r.u8()?];
   let raw_name = r.rest();
   let name = match str::from_utf8(raw_name) {
      Ok(s) => s.trim_end_matches('\0').trim().into(),
      Err(e) => {
         warn!("Device name is not valid UTF-8 ({e}): {}", hex::encode(raw_name));
         String::from_utf8_lossy(raw_name).trim().into()
      },
   };
   Ok(DeviceInfo {
      model,
      firmware,
      name,
   })
}

// Heart Rate Measurement flag bits.
const HRM_VALUE_U16: u8 = 1 << 0;
const HRM_CONTACT_DETECTED: u8 = 1 << 1;
const HRM_CONTACT_SUPPORTED: u8 = 1 << 2;
const HRM_ENERGY_EXPENDED: u8 = 1 << 3;
const HRM_RR_INTERVALS: u8 = 1 << 4;

/// Parses a standard Heart Rate Measurement (0x2A37) notification.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Result<Reading> {
   let mut r = Reader::new(data);
   let flags = r.u8()?;

   let bpm = if flags & HRM_VALUE_U16 != 0 {
      r.u16()?
   } else {
      u16::from(r.u8()?)
   };

   let contact = (flags & HRM_CONTACT_SUPPORTED != 0).then_some(flags & HRM_CONTACT_DETECTED != 0);

   if flags & HRM_ENERGY_EXPENDED != 0 {
      let kj = r.u16()?;
      debug!("Energy expended: {kj} kJ");
   }

   let mut rr_intervals_ms = SmallVec::new();
   if flags & HRM_RR_INTERVALS != 0 {
      for rr in r.records(2)? {
         // RR intervals are in 1/1024 s.
         let raw = u32::from(u16::from_le_bytes([rr[0], rr[1]]));
         rr_intervals_ms.push(((raw * 1000 + 512) / 1024) as u16);
      }
   }

   Ok(Reading::HeartRate {
      bpm,
      confidence: None,
      contact,
      rr_intervals_ms,
   })
}

/// Parses a standard Battery Level (0x2A19) value.
pub fn parse_battery_level(data: &[u8]) -> Result<BatteryLevel> {
   let mut r = Reader::new(data);
   let level = r.u8()?;
   check_range("battery.level", level.into(), 0..=100)?;
   Ok(BatteryLevel {
      level,
      state: ChargeState::Unknown,
   })
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::{bluetooth::gatt::Packet, wearable::protocol::FrameKind};

   fn frame(kind: FrameKind, payload: &[u8]) -> Frame {
      Frame {
         seq: 0,
         kind: kind as u8,
         payload: Packet::from_slice(payload),
      }
   }

   fn reading(decoded: Decoded) -> (u32, Reading) {
      match decoded {
         Decoded::Reading { device_ms, reading } => (device_ms, reading),
         other => panic!("expected reading, got {other:?}"),
      }
   }

   fn is_proto_err(res: Result<Decoded>, check: impl FnOnce(&ProtoError) -> bool) -> bool {
      match res {
         Err(crate::error::WearLinkError::Protocol(e)) => check(&e),
         _ => false,
      }
   }

   #[test]
   fn test_heart_rate_frame() {
      let (t, r) = reading(
         decode_frame(&frame(FrameKind::HeartRate, &[0xE8, 0x03, 0, 0, 72, 0, 95])).unwrap(),
      );
      assert_eq!(t, 1000);
      assert_eq!(
         r,
         Reading::HeartRate {
            bpm: 72,
            confidence: Some(95),
            contact: None,
            rr_intervals_ms: SmallVec::new(),
         }
      );
   }

   #[test]
   fn test_heart_rate_without_contact_is_kept() {
      // Devices report 0 bpm while off the skin.
      let (_, r) = reading(
         decode_frame(&frame(FrameKind::HeartRate, &[0, 0, 0, 0, 0, 0, 0])).unwrap(),
      );
      assert!(matches!(r, Reading::HeartRate { bpm: 0, confidence: Some(0), .. }));

      let hot = i16::MAX.to_le_bytes();
      let (_, r) = reading(
         decode_frame(&frame(FrameKind::Temperature, &[0, 0, 0, 0, hot[0], hot[1]])).unwrap(),
      );
      assert_eq!(r, Reading::Temperature { celsius: 327.67 });
   }

   #[test]
   fn test_spo2_out_of_range() {
      let res = decode_frame(&frame(FrameKind::SpO2, &[0, 0, 0, 0, 101, 50]));
      assert!(is_proto_err(res, |e| matches!(
         e,
         ProtoError::OutOfRange {
            field: "spo2.percent",
            value: 101
         }
      )));
   }

   #[test]
   fn test_ppg_frame() {
      let payload = [
         0x10, 0, 0, 0, // t = 16
         1,    // red
         25, 0, // 25 Hz
         0x01, 0x00, 0x00, // 1
         0xFF, 0xFF, 0xFF, // 0xFFFFFF
      ];
      let (t, r) = reading(decode_frame(&frame(FrameKind::Ppg, &payload)).unwrap());
      assert_eq!(t, 16);
      assert_eq!(
         r,
         Reading::Ppg {
            channel: PpgChannel::Red,
            rate_hz: 25,
            values: vec![1, 0x00FF_FFFF],
         }
      );
   }

   #[test]
   fn test_ppg_truncated_record() {
      let payload = [0, 0, 0, 0, 0, 25, 0, 0x01, 0x02];
      let res = decode_frame(&frame(FrameKind::Ppg, &payload));
      assert!(is_proto_err(res, |e| matches!(
         e,
         ProtoError::PacketSizeMismatch {
            stride: 3,
            actual: 2
         }
      )));
   }

   #[test]
   fn test_ppg_unknown_channel() {
      let payload = [0, 0, 0, 0, 7, 25, 0];
      let res = decode_frame(&frame(FrameKind::Ppg, &payload));
      assert!(is_proto_err(res, |e| matches!(
         e,
         ProtoError::UnknownChannel { channel: 7 }
      )));
   }

   #[test]
   fn test_motion_frame_scaling() {
      let mut payload = vec![0, 0, 0, 0, 50, 0, 4];
      for v in [16384i16, -16384, 0] {
         payload.extend_from_slice(&v.to_le_bytes());
      }
      let (_, r) = reading(decode_frame(&frame(FrameKind::Motion, &payload)).unwrap());
      let Reading::Motion {
         rate_hz,
         range_g,
         samples,
      } = r
      else {
         panic!("not motion");
      };
      assert_eq!(rate_hz, 50);
      assert_eq!(range_g, 4);
      assert_eq!(samples, vec![[2.0, -2.0, 0.0]]);
   }

   #[test]
   fn test_motion_bad_range() {
      let payload = [0, 0, 0, 0, 50, 0, 3];
      assert!(decode_frame(&frame(FrameKind::Motion, &payload)).is_err());
   }

   #[test]
   fn test_temperature_and_steps() {
      let centi = (-1250i16).to_le_bytes();
      let (_, r) = reading(
         decode_frame(&frame(FrameKind::Temperature, &[0, 0, 0, 0, centi[0], centi[1]])).unwrap(),
      );
      assert_eq!(r, Reading::Temperature { celsius: -12.5 });

      let (_, r) = reading(
         decode_frame(&frame(FrameKind::Steps, &[0, 0, 0, 0, 0x10, 0x27, 0, 0])).unwrap(),
      );
      assert_eq!(r, Reading::Steps { total: 10_000 });
   }

   #[test]
   fn test_battery_frame() {
      let (_, r) =
         reading(decode_frame(&frame(FrameKind::Battery, &[0, 0, 0, 0, 42, 1])).unwrap());
      assert_eq!(
         r,
         Reading::Battery {
            level: 42,
            state: ChargeState::Charging
         }
      );
      assert!(decode_frame(&frame(FrameKind::Battery, &[0, 0, 0, 0, 42, 0xFF])).is_err());
   }

   #[test]
   fn test_ack_and_info() {
      assert_eq!(
         decode_frame(&frame(FrameKind::Ack, &[0x40, 0])).unwrap(),
         Decoded::Ack {
            opcode: 0x40,
            status: 0
         }
      );

      let mut payload = vec![2, 1, 4, 12];
      payload.extend_from_slice(b"Oura-ish\0");
      let Decoded::Info(info) = decode_frame(&frame(FrameKind::DeviceInfo, &payload)).unwrap()
      else {
         panic!("not info");
      };
      assert_eq!(info.model, Profile::Ring);
      assert_eq!(info.firmware_str(), "1.4.12");
      assert_eq!(info.name, "Oura-ish");
   }

   #[test]
   fn test_rejects_unknown_and_host_frames() {
      let res = decode_frame(&Frame {
         seq: 0,
         kind: 0x99,
         payload: Packet::new(),
      });
      assert!(is_proto_err(res, |e| matches!(e, ProtoError::UnknownKind { kind: 0x99 })));

      let res = decode_frame(&frame(FrameKind::StopStream, &[]));
      assert!(is_proto_err(res, |e| matches!(e, ProtoError::UnexpectedKind { .. })));
   }

   #[test]
   fn test_short_payload() {
      let res = decode_frame(&frame(FrameKind::HeartRate, &[0, 0, 0, 0, 72]));
      assert!(is_proto_err(res, |e| matches!(
         e,
         ProtoError::PacketTooShort {
            expected: 6,
            actual: 5
         }
      )));
   }

   #[test]
   fn test_standard_heart_rate_u8() {
      // Contact supported + detected, 8-bit value.
      let r = parse_heart_rate_measurement(&[0b0000_0110, 64]).unwrap();
      assert_eq!(
         r,
         Reading::HeartRate {
            bpm: 64,
            confidence: None,
            contact: Some(true),
            rr_intervals_ms: SmallVec::new(),
         }
      );
   }

   #[test]
   fn test_standard_heart_rate_u16_energy_rr() {
      // 16-bit value, energy expended, two RR intervals (1024 -> 1000 ms, 512 -> 500 ms).
      let data = [0b0001_1001, 0x2C, 0x01, 0x10, 0x00, 0x00, 0x04, 0x00, 0x02];
      let r = parse_heart_rate_measurement(&data).unwrap();
      let Reading::HeartRate {
         bpm,
         contact,
         rr_intervals_ms,
         ..
      } = r
      else {
         panic!("not heart rate");
      };
      assert_eq!(bpm, 300);
      assert_eq!(contact, None);
      assert_eq!(rr_intervals_ms.as_slice(), &[1000, 500]);
   }

   #[test]
   fn test_standard_heart_rate_truncated() {
      assert!(parse_heart_rate_measurement(&[0x01, 0x40]).is_err());
      assert!(parse_heart_rate_measurement(&[]).is_err());
   }

   #[test]
   fn test_battery_level() {
      assert_eq!(
         parse_battery_level(&[87]).unwrap(),
         BatteryLevel {
            level: 87,
            state: ChargeState::Unknown
         }
      );
      assert!(parse_battery_level(&[101]).is_err());
      assert!(parse_battery_level(&[]).is_err());
   }
}
