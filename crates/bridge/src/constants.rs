use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Read deadline: if nothing arrives within this window (no pong, no
/// response, no push event) the link is considered dead.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(30);

/// How often to send pings. Must be well below [`WS_PONG_WAIT`].
pub const WS_PING_PERIOD: Duration = Duration::from_secs(10);

/// Maximum message size in bytes (1 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Deadline for opening the link, hello exchange included.
pub const LINK_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default timeout for request/response operations.
pub const WS_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Error codes reported by the protocol helper.
pub const ERR_UNAUTHORIZED: i32 = 401;
pub const ERR_NOT_FOUND: i32 = 404;
pub const ERR_TIMEOUT: i32 = 408;
pub const ERR_NOT_IMPLEMENTED: i32 = 501;

/// Link message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    // Link management
    Hello,
    Welcome,

    // Device session
    Connect,
    Connected,
    Disconnect,
    Command,

    // Pairing
    PairBegin,
    PairStarted,
    PairPin,
    PairResult,
    PairClose,

    // Generic replies
    Ack,
    Error,

    /// Unsolicited device event.
    Event,

    #[serde(other)]
    Unknown,
}
