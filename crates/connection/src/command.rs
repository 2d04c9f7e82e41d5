//! Commands submitted by the hub and the receipts handed back.

use std::fmt;

use atvlink_protocol::RemoteCommand;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::DriverError;

/// Token linking a submitted command to its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Generates a random token.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A request to a device. Never persisted.
#[derive(Debug, Clone)]
pub struct Command {
    pub kind: RemoteCommand,
    pub correlation: CorrelationId,
    pub submitted_at: Instant,
}

impl Command {
    pub fn new(kind: RemoteCommand) -> Self {
        Self {
            kind,
            correlation: CorrelationId::generate(),
            submitted_at: Instant::now(),
        }
    }

    /// Uses a caller-supplied correlation token.
    pub fn with_correlation(mut self, correlation: CorrelationId) -> Self {
        self.correlation = correlation;
        self
    }
}

/// Handle returned once a command is admitted to a device queue.
#[derive(Debug)]
pub struct CommandReceipt {
    pub correlation: CorrelationId,
    pub(crate) outcome: oneshot::Receiver<Result<(), DriverError>>,
}

impl CommandReceipt {
    /// Waits for the device outcome.
    ///
    /// Resolves to `Cancelled` if the session went away before answering.
    pub async fn wait(self) -> Result<(), DriverError> {
        self.outcome.await.unwrap_or(Err(DriverError::Cancelled))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_differ() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }

    #[test]
    fn caller_token_kept() {
        let cmd = Command::new(RemoteCommand::Home).with_correlation(CorrelationId::new("req-7"));
        assert_eq!(cmd.correlation.as_str(), "req-7");
    }

    #[tokio::test]
    async fn dropped_session_resolves_cancelled() {
        let (tx, rx) = oneshot::channel();
        let receipt = CommandReceipt {
            correlation: CorrelationId::new("c"),
            outcome: rx,
        };
        drop(tx);
        assert_eq!(receipt.wait().await, Err(DriverError::Cancelled));
    }
}
