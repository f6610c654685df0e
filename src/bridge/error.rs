use std::time::Duration;

use thiserror::Error;

/// Failures surfaced by `RpcBridge::call`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// The transport has not been started, was stopped, or its channel closed
    #[error("engine channel is not running")]
    NotRunning,

    /// `start` called on a transport that already ran
    #[error("engine channel was already started")]
    AlreadyStarted,

    /// Method name outside the engine whitelist; nothing was sent
    #[error("method '{0}' is not an allowed engine method")]
    MethodNotAllowed(String),

    /// Spawning, writing to, or reading from the channel failed
    #[error("engine transport error: {0}")]
    Transport(String),

    /// No response arrived before the call deadline
    #[error("engine call '{method}' (id {id}) timed out after {}ms", .after.as_millis())]
    Timeout {
        method: String,
        id: u64,
        after: Duration,
    },

    /// The engine answered with an `error` field
    #[error("engine error: {0}")]
    Remote(String),

    /// Request could not be serialized
    #[error("failed to encode engine request: {0}")]
    Encode(String),

    /// Result did not have the expected shape
    #[error("failed to decode engine result: {0}")]
    Decode(String),
}

impl BridgeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, BridgeError::Timeout { .. })
    }
}
