//! Event handling system for wearable status updates.
//!
//! This module provides the event infrastructure for notifying about
//! decoded samples, connection status and device state changes.

use std::sync::Arc;

use crate::wearable::{
   device::Wearable,
   protocol::{BatteryLevel, DeviceInfo, Sample},
};

/// Events that can be emitted by the service.
#[derive(Debug, Clone)]
pub enum WearableEvent {
   DeviceConnected,
   DeviceDisconnected,
   DeviceError,
   BatteryUpdated(BatteryLevel),
   InfoUpdated(DeviceInfo),
   Samples(Arc<[Sample]>),
}

/// Trait for implementing event emission.
pub trait EventBus: Send + Sync {
   /// Emits an event to all registered listeners.
   fn emit(&self, device: &Wearable, event: WearableEvent);
}

/// Type alias for a thread-safe event sender.
pub type EventSender = Arc<dyn EventBus>;
