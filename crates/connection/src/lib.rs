//! Session core of the atvlink media-device driver.
//!
//! [`DeviceRegistry`] owns one session task per registered device. Each
//! session runs the connection state machine (discovery, pairing,
//! connecting, reconnecting with backoff), a single-flight command queue,
//! standby wake handling and interactive pairing. Sound output routing is
//! tracked across devices by [`SoundOutputRouter`].

pub mod command;
pub mod device;
mod dispatcher;
pub mod error;
pub mod media;
mod pairing_flow;
pub mod reconnection;
pub mod registry;
mod session;
pub mod sound_output;
pub mod store;
pub mod types;
pub mod wake;

pub use command::{Command, CommandReceipt, CorrelationId};
pub use device::DeviceRecord;
pub use error::DriverError;
pub use media::PlayerState;
pub use reconnection::{Backoff, ReconnectConfig};
pub use registry::DeviceRegistry;
pub use sound_output::SoundOutputRouter;
pub use store::{ConfigStore, JsonFileStore, MemoryStore, StoreError};
pub use types::{
    DeviceSnapshot, DriverEvent, DriverSettings, EventSink, PairingSettings, PairingStep,
    PinOutcome, SessionState,
};
pub use wake::{WakeCoordinator, WakeOutcome};
