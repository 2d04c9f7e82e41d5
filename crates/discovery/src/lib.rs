pub mod client;
pub mod types;

// Re-export primary types.
pub use client::Scanner;
pub use types::{
    AIRPLAY_SERVICE, BROWSED_SERVICES, COMPANION_SERVICE, MEDIAREMOTE_SERVICE, RecordMerger,
    ServiceRecord, infer_capabilities,
};

/// Errors for discovery operations.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("mDNS error: {0}")]
    Mdns(String),
}
