//! Driver error types.

use atvlink_protocol::{Capability, DeviceId};

/// Errors returned by the registry and reported as command outcomes.
///
/// Precondition errors (`NotConnected`, `UnsupportedFeature`,
/// `FeatureDisabled`, `InvalidCommand`) are returned before anything is
/// queued or sent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DriverError {
    #[error("device {0} is already registered")]
    DuplicateDevice(DeviceId),

    #[error("unknown device {0}")]
    UnknownDevice(DeviceId),

    #[error("device is not connected")]
    NotConnected,

    #[error("device does not support {0}")]
    UnsupportedFeature(Capability),

    #[error("sound output routing is disabled")]
    FeatureDisabled,

    #[error("command timed out")]
    CommandTimeout,

    #[error("no connected output device")]
    NoOutputAvailable,

    #[error("pairing failed: {0}")]
    PairingFailed(String),

    #[error("pairing expired waiting for the user")]
    PairingExpired,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("cancelled")]
    Cancelled,

    #[error("no pairing is waiting for a PIN")]
    PairingNotInProgress,

    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("device rejected command: {0}")]
    Device(String),

    #[error("config store error: {0}")]
    Store(String),
}

impl From<crate::store::StoreError> for DriverError {
    fn from(err: crate::store::StoreError) -> Self {
        DriverError::Store(err.to_string())
    }
}
