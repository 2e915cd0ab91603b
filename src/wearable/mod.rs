//! Wearable device management and protocol implementation.
//!
//! This module contains the device-side half of the pipeline: frame
//! reassembly, decoding into typed samples, clock mapping and per-device
//! session state.

pub mod device;
pub mod framer;
pub mod parser;
pub mod protocol;
pub mod recognition;
pub mod timebase;
