//! Recognition logic for supported wearables.
//!
//! A device is supported when it advertises the vendor stream service or the
//! standard Heart Rate service, or, as a last resort, when its name looks
//! like a wearable. The name is also used to guess the device profile until
//! the device reports its own model.

use std::collections::HashSet;

use uuid::Uuid;

use crate::wearable::protocol::{HEART_RATE_SERVICE, Profile, VENDOR_SERVICE};

/// Name fragments (lowercase) that identify earphones.
const EARPHONE_PATTERNS: &[&str] = &["buds", "earphone", "earbud", "pods", "headset"];

/// Name fragments (lowercase) that identify rings.
const RING_PATTERNS: &[&str] = &["ring"];

/// Other wearables that still speak one of the supported services.
const GENERIC_PATTERNS: &[&str] = &["band", "watch", "hrm"];

/// Services that carry data this service can ingest.
static DATA_SERVICES: [Uuid; 2] = [VENDOR_SERVICE, HEART_RATE_SERVICE];

/// Checks the advertised service set.
pub fn has_data_service(uuids: &HashSet<Uuid>) -> bool {
   DATA_SERVICES.iter().any(|u| uuids.contains(u))
}

/// Guesses a profile from a device name, `None` if it does not look like a
/// wearable at all.
pub fn profile_from_name(name: &str) -> Option<Profile> {
   let name = name.to_ascii_lowercase();
   let matches = |patterns: &[&str]| patterns.iter().any(|p| name.contains(p));
   if matches(RING_PATTERNS) {
      Some(Profile::Ring)
   } else if matches(EARPHONE_PATTERNS) {
      Some(Profile::Earphone)
   } else if matches(GENERIC_PATTERNS) {
      Some(Profile::Generic)
   } else {
      None
   }
}

/// Returns the guessed profile if the device is a supported wearable.
pub async fn recognize(dev: &bluer::Device) -> Option<Profile> {
   let name = match dev.name().await {
      Ok(Some(name)) => Some(name),
      _ => dev.alias().await.ok(),
   };
   let by_name = name.as_deref().and_then(profile_from_name);

   // 1. Advertised services are definitive
   if let Ok(Some(uuids)) = dev.uuids().await
      && has_data_service(&uuids)
   {
      log::debug!("{}: wearable detected via service UUID", dev.address());
      return Some(by_name.unwrap_or_default());
   }

   // 2. Last-chance name/alias pattern matching
   if let Some(profile) = by_name {
      log::debug!(
         "{}: wearable detected via name {:?} => {profile}",
         dev.address(),
         name.as_deref().unwrap_or_default()
      );
      return Some(profile);
   }
   None
}

#[cfg(test)]
mod tests {
   use super::*;
   use crate::wearable::protocol::BATTERY_SERVICE;

   #[test]
   fn test_profile_from_name() {
      assert_eq!(profile_from_name("Galaxy Ring 7F"), Some(Profile::Ring));
      assert_eq!(profile_from_name("SOUNDPODS Pro"), Some(Profile::Earphone));
      assert_eq!(profile_from_name("Run Buds"), Some(Profile::Earphone));
      assert_eq!(profile_from_name("Polar H10 HRM"), Some(Profile::Generic));
      assert_eq!(profile_from_name("Living Room TV"), None);
   }

   #[test]
   fn test_has_data_service() {
      let mut uuids = HashSet::from([BATTERY_SERVICE]);
      assert!(!has_data_service(&uuids));
      uuids.insert(HEART_RATE_SERVICE);
      assert!(has_data_service(&uuids));
      assert!(has_data_service(&HashSet::from([VENDOR_SERVICE])));
   }
}
