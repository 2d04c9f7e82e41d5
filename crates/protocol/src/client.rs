//! Traits the session core uses to talk to devices.
//!
//! The byte-level codec (pairing cryptography, AirPlay/Companion framing)
//! lives behind these traits. Implementations bridge to a real protocol
//! stack; tests use hand-written doubles.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::commands::RemoteCommand;
use crate::events::DeviceEvent;
use crate::types::{CapabilitySet, Credential, DeviceDescriptor, PowerState, ProtocolCredential, ProtocolKind};

/// Boxed future returned by the protocol traits.
pub type ProtocolFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, ProtocolError>> + Send + 'a>>;

/// Errors reported by a protocol implementation.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProtocolError {
    #[error("operation timed out")]
    Timeout,

    #[error("connection lost: {0}")]
    ConnectionLost(String),

    #[error("device unreachable: {0}")]
    Unreachable(String),

    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("not supported: {0}")]
    NotSupported(String),

    #[error("rejected by device: {0}")]
    Rejected(String),

    #[error("pairing error: {0}")]
    Pairing(String),
}

impl ProtocolError {
    /// Returns true if the error means the link itself is gone.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ProtocolError::ConnectionLost(_) | ProtocolError::Unreachable(_)
        )
    }
}

/// Who shows the PIN during a pairing step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinMode {
    /// The device shows a PIN on screen; the user submits it to us.
    DeviceDisplaysPin,
    /// We pick a PIN; the user types it on the device.
    HostProvidesPin,
}

/// Result of verifying one PIN.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PinVerdict {
    Accepted(ProtocolCredential),
    Rejected,
}

/// Discovers, pairs with and connects to devices.
pub trait DeviceProtocolClient: Send + Sync {
    /// Scans the network. Candidates are streamed until `timeout` elapses,
    /// then the channel closes.
    fn discover(&self, timeout: Duration) -> ProtocolFuture<'_, mpsc::Receiver<DeviceDescriptor>>;

    /// Starts a pairing handshake for one protocol.
    fn pair(
        &self,
        device: &DeviceDescriptor,
        protocol: ProtocolKind,
    ) -> ProtocolFuture<'_, Box<dyn PairingHandle>>;

    /// Opens a session. Push events for the session are sent to `events`;
    /// dropping the connection closes the channel.
    fn connect(
        &self,
        device: &DeviceDescriptor,
        credential: &Credential,
        events: mpsc::Sender<DeviceEvent>,
    ) -> ProtocolFuture<'_, Arc<dyn DeviceConnection>>;
}

/// A live, authenticated session with one device.
pub trait DeviceConnection: Send + Sync {
    /// Sends a command and waits for the device acknowledgement.
    fn send(&self, command: &RemoteCommand) -> ProtocolFuture<'_, ()>;

    /// Capabilities detected during the handshake.
    fn capabilities(&self) -> CapabilitySet;

    /// Power state at handshake time.
    fn power_state(&self) -> PowerState;

    /// Closes the session and releases the underlying link.
    fn close(&self) -> ProtocolFuture<'_, ()>;
}

/// An in-progress pairing handshake for a single protocol.
pub trait PairingHandle: Send {
    /// Starts the exchange and reports who displays the PIN.
    fn begin(&mut self) -> ProtocolFuture<'_, PinMode>;

    /// Verifies `pin`. In host-provided mode this resolves once the user
    /// has typed the PIN on the device.
    fn verify_pin(&mut self, pin: &str) -> ProtocolFuture<'_, PinVerdict>;

    /// Aborts the handshake.
    fn close(&mut self) -> ProtocolFuture<'_, ()>;
}
