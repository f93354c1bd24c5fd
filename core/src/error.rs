// ── Error taxonomy ──
//
// Connection and protocol failures are expected outcomes of detection and are
// folded into counters; they only surface as values from direct calls such as
// `Device::open`. Configuration errors and use-after-dispose are programmer errors
// and are returned synchronously.

use std::io;
use std::time::Duration;

use thiserror::Error;

/// A channel could not be opened.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("connections are not allowed for this device")]
    NotAllowed,

    #[error("connect timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("transport unavailable: {0}")]
    Unavailable(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Why a detection attempt did not confirm the device.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DetectionFailure {
    #[error("could not open channel: {0}")]
    Connection(String),

    #[error("channel opened but the data did not validate")]
    ProtocolMismatch,
}

/// Errors returned synchronously by device operations.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("device {0} has been disposed")]
    Disposed(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("channel is not open")]
    NotOpen,
}

/// Persistence failures. `AccessDenied` is always swallowed by callers.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache access denied: {0}")]
    AccessDenied(String),

    #[error("cache backend error: {0}")]
    Backend(String),

    #[error("corrupt cache entry {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// An out-of-range configuration value.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{name} must be {expected}, got {value}")]
    OutOfRange {
        name: &'static str,
        expected: &'static str,
        value: String,
    },
}
