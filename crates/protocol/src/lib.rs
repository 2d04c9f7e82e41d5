pub mod client;
pub mod commands;
pub mod constants;
pub mod events;
pub mod types;

// Re-export primary types for convenience.
pub use client::{
    DeviceConnection, DeviceProtocolClient, PairingHandle, PinMode, PinVerdict, ProtocolError,
    ProtocolFuture,
};
pub use commands::{RemoteCommand, RepeatMode, SwipeDirection};
pub use events::DeviceEvent;
pub use types::{
    AppInfo, Capability, CapabilitySet, Credential, DeviceDescriptor, DeviceId, MediaKind,
    PlaybackInfo, PlaybackState, PowerState, ProtocolCredential, ProtocolKind, ServiceEndpoint,
};
