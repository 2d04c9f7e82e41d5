//! Protocol helper bridge.
//!
//! The AirPlay/Companion codec runs in an external helper process; this
//! crate speaks to it over a JSON WebSocket link and exposes it as a
//! `DeviceProtocolClient`.

pub mod client;
pub mod constants;
pub mod envelope;
pub mod error;
pub mod link;
mod pumps;

pub use client::BridgeClient;
pub use envelope::{ErrorBody, Message};
pub use error::BridgeError;
pub use link::BridgeLink;
