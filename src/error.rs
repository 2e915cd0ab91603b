//! Error types for the wearable ingestion service.
//!
//! This module defines all error types that can occur while talking to
//! wearables over GATT, decoding their data, and forwarding batches to the
//! backend.

use bluer::Address;
use thiserror::Error;
use tokio::task::JoinError;

use crate::{uplink::spool::SpoolError, wearable::parser::ProtoError};

/// Main error type for the service.
#[derive(Error, Debug)]
pub enum WearLinkError {
   #[error("Bluetooth error: {0}")]
   Bluetooth(#[from] bluer::Error),

   #[error("D-Bus error: {0}")]
   DBus(#[from] zbus::Error),

   #[error("D-Bus connection error: {0}")]
   DBusConnection(#[from] zbus::fdo::Error),

   #[error("I/O error: {0}")]
   Io(#[from] std::io::Error),

   #[error("Protocol error: {0}")]
   Protocol(#[from] ProtoError),

   #[error("Spool error: {0}")]
   Spool(#[from] SpoolError),

   #[error("HTTP error: {0}")]
   Http(#[from] hyper::http::Error),

   #[error("HTTP client error: {0}")]
   HttpClient(#[from] hyper_util::client::legacy::Error),

   #[error("JSON error: {0}")]
   Json(#[from] serde_json::Error),

   #[error("Invalid uplink endpoint: {0}")]
   InvalidEndpoint(String),

   #[error("Backend rejected batch with status {0}")]
   BatchRejected(u16),

   #[error("Backend unavailable (status {0})")]
   BackendUnavailable(u16),

   #[error("Device not found: {0}")]
   DeviceNotFound(Address),

   #[error("Device not connected")]
   DeviceNotConnected,

   #[error("Device exposes no supported data characteristic")]
   NoDataSource,

   #[error("Feature not supported: {0}")]
   FeatureNotSupported(String),

   #[error("Connection lost")]
   ConnectionLost,

   #[error("Actor panicked: {0}")]
   ActorPanicked(JoinError),

   #[error("Connection closed")]
   ConnectionClosed,

   #[error("Request timeout")]
   RequestTimeout,

   #[error("Could not determine config directory")]
   ConfigDirNotFound,

   #[error("TOML parsing error: {0}")]
   TomlParse(#[from] toml::de::Error),

   #[error("TOML serialization error: {0}")]
   TomlSerialize(#[from] toml::ser::Error),

   #[error("Manager has been shut down")]
   ManagerShutdown,

   #[error("Uplink has been shut down")]
   UplinkShutdown,

   #[error("Already connecting to device")]
   AlreadyConnecting,

   #[error("Adapter not found")]
   AdapterNotFound,

   #[error("Adapter not available")]
   AdapterNotAvailable,
}

/// Convenience type alias for Results with `WearLinkError`.
pub type Result<T> = std::result::Result<T, WearLinkError>;
