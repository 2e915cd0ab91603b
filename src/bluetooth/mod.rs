//! Bluetooth communication layer for wearables.
//!
//! This module provides GATT session handling and device
//! discovery/connection management.

pub mod gatt;
pub mod manager;
