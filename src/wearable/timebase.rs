//! Mapping of device timestamps onto wall-clock time.
//!
//! Wearables stamp readings with a millisecond counter that starts at boot.
//! The host anchors that counter to its own clock on the first reading and
//! re-anchors whenever the device counter jumps backwards or runs ahead of
//! the host.

use std::time::SystemTime;

/// Backwards steps larger than this mean the device rebooted or wrapped.
const REWIND_TOLERANCE_MS: u32 = 1_000;
/// Mapped times further than this into the future are not trusted.
const MAX_FUTURE_SKEW_MS: u64 = 5_000;

/// Milliseconds since the Unix epoch.
pub fn unix_now_ms() -> u64 {
   SystemTime::UNIX_EPOCH
      .elapsed()
      .map_or(0, |d| d.as_millis() as u64)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceClock {
   /// `host_ms - device_ms` at the anchor point.
   offset: Option<i64>,
   last_device_ms: u32,
   reanchors: u32,
}

impl DeviceClock {
   pub const fn new() -> Self {
      Self {
         offset: None,
         last_device_ms: 0,
         reanchors: 0,
      }
   }

   /// Number of times the anchor was reset after the first reading.
   pub const fn reanchors(&self) -> u32 {
      self.reanchors
   }

   pub fn reset(&mut self) {
      self.offset = None;
      self.last_device_ms = 0;
   }

   /// Converts a device timestamp into Unix milliseconds.
   pub fn to_unix_ms(&mut self, device_ms: u32, host_now_ms: u64) -> u64 {
      let rewound = self.offset.is_some()
         && device_ms < self.last_device_ms.saturating_sub(REWIND_TOLERANCE_MS);

      let offset = match self.offset {
         Some(offset) if !rewound => {
            let mapped = offset + i64::from(device_ms);
            if mapped > (host_now_ms + MAX_FUTURE_SKEW_MS) as i64 {
               self.anchor(device_ms, host_now_ms)
            } else {
               offset
            }
         },
         Some(_) => self.anchor(device_ms, host_now_ms),
         None => {
            let offset = host_now_ms as i64 - i64::from(device_ms);
            self.offset = Some(offset);
            offset
         },
      };

      self.last_device_ms = device_ms;
      (offset + i64::from(device_ms)).max(0) as u64
   }

   fn anchor(&mut self, device_ms: u32, host_now_ms: u64) -> i64 {
      log::debug!("Re-anchoring device clock at device_ms={device_ms}");
      let offset = host_now_ms as i64 - i64::from(device_ms);
      self.offset = Some(offset);
      self.reanchors += 1;
      offset
   }
}

#[cfg(test)]
mod tests {
   use super::*;

   const HOST: u64 = 1_700_000_000_000;

   #[test]
   fn test_first_reading_anchors() {
      let mut clock = DeviceClock::new();
      assert_eq!(clock.to_unix_ms(5_000, HOST), HOST);
      // A reading 250 ms later on the device lands 250 ms later on the host,
      // even if it is delivered late.
      assert_eq!(clock.to_unix_ms(5_250, HOST + 900), HOST + 250);
      assert_eq!(clock.reanchors(), 0);
   }

   #[test]
   fn test_buffered_older_readings_keep_anchor() {
      let mut clock = DeviceClock::new();
      clock.to_unix_ms(60_000, HOST);
      // Small reorder within tolerance does not re-anchor.
      assert_eq!(clock.to_unix_ms(59_500, HOST + 10), HOST - 500);
      assert_eq!(clock.reanchors(), 0);
   }

   #[test]
   fn test_device_reboot_reanchors() {
      let mut clock = DeviceClock::new();
      clock.to_unix_ms(3_600_000, HOST);
      assert_eq!(clock.to_unix_ms(200, HOST + 30_000), HOST + 30_000);
      assert_eq!(clock.reanchors(), 1);
      assert_eq!(clock.to_unix_ms(1_200, HOST + 31_000), HOST + 31_000);
   }

   #[test]
   fn test_counter_wrap_reanchors() {
      let mut clock = DeviceClock::new();
      clock.to_unix_ms(u32::MAX - 100, HOST);
      assert_eq!(clock.to_unix_ms(50, HOST + 151), HOST + 151);
      assert_eq!(clock.reanchors(), 1);
   }

   #[test]
   fn test_future_skew_reanchors() {
      let mut clock = DeviceClock::new();
      clock.to_unix_ms(0, HOST);
      // Device clock races ahead 10 s while only 1 s passed on the host.
      assert_eq!(clock.to_unix_ms(10_000, HOST + 1_000), HOST + 1_000);
      assert_eq!(clock.reanchors(), 1);
   }

   #[test]
   fn test_reset_forgets_anchor() {
      let mut clock = DeviceClock::new();
      clock.to_unix_ms(1_000, HOST);
      clock.reset();
      assert_eq!(clock.to_unix_ms(1_000, HOST + 60_000), HOST + 60_000);
      assert_eq!(clock.reanchors(), 0);
   }
}
