use atvlink_protocol::ProtocolError;
use tokio_tungstenite::tungstenite;

use crate::constants::{ERR_NOT_FOUND, ERR_NOT_IMPLEMENTED, ERR_TIMEOUT, ERR_UNAUTHORIZED};

/// Errors from the protocol helper link.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("WebSocket error: {0}")]
    Ws(#[from] tungstenite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("request timed out")]
    Timeout,

    #[error("link closed")]
    Closed,

    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),

    #[error("helper error {code}: {message}")]
    Remote { code: i32, message: String },
}

impl From<BridgeError> for ProtocolError {
    fn from(err: BridgeError) -> Self {
        match err {
            BridgeError::Timeout => ProtocolError::Timeout,
            BridgeError::Closed | BridgeError::Ws(_) => ProtocolError::ConnectionLost(err.to_string()),
            BridgeError::Json(_) | BridgeError::UnexpectedResponse(_) => {
                ProtocolError::Rejected(err.to_string())
            }
            BridgeError::Remote { code, message } => match code {
                ERR_UNAUTHORIZED => ProtocolError::AuthenticationFailed(message),
                ERR_NOT_FOUND => ProtocolError::Unreachable(message),
                ERR_TIMEOUT => ProtocolError::Timeout,
                ERR_NOT_IMPLEMENTED => ProtocolError::NotSupported(message),
                _ => ProtocolError::Rejected(message),
            },
        }
    }
}
