//! Error taxonomy for the orchestration fabric.
//!
//! Every public operation returns a typed [`FabricError`] instead of
//! propagating panics or opaque boxed errors across component boundaries.
//! Background loops absorb errors, record them, and continue.

use thiserror::Error;

/// Result alias used throughout the fabric.
pub type Result<T> = std::result::Result<T, FabricError>;

#[derive(Debug, Error)]
pub enum FabricError {
    /// Socket or broker I/O failure. Connection-level transport failures
    /// transition the connection to CLOSING; everything else is logged and
    /// counted.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed client frame, unknown message type, invalid JSON. Produces
    /// a typed error event on the wire; never closes the connection.
    #[error("protocol error [{code}]: {message}")]
    Protocol { code: &'static str, message: String },

    /// Unknown or expired token, or a filter that had to be rewritten.
    #[error("authorization error: {0}")]
    Authorization(String),

    /// Connection cap reached or a bounded queue refused an entry.
    #[error("capacity exceeded: {0}")]
    Capacity(String),

    /// Operation or workflow aged out and was reaped.
    #[error("stale resource: {0}")]
    Stale(String),

    #[error("unknown operation: {0}")]
    UnknownOperation(String),

    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("broker error: {0}")]
    Broker(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl FabricError {
    /// Stable error code delivered to clients in error events.
    pub fn error_code(&self) -> &'static str {
        match self {
            FabricError::Transport(_) => "TRANSPORT_ERROR",
            FabricError::Protocol { code, .. } => code,
            FabricError::Authorization(_) => "INVALID_TOKEN",
            FabricError::Capacity(_) => "CAPACITY_EXCEEDED",
            FabricError::Stale(_) => "STALE_RESOURCE",
            FabricError::UnknownOperation(_) => "UNKNOWN_OPERATION",
            FabricError::UnknownWorkflow(_) => "UNKNOWN_WORKFLOW",
            FabricError::Configuration(_) => "CONFIGURATION_ERROR",
            FabricError::Broker(_) => "BROKER_ERROR",
            FabricError::Serialization(_) => "INVALID_JSON",
            FabricError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    pub fn protocol(code: &'static str, message: impl Into<String>) -> Self {
        FabricError::Protocol {
            code,
            message: message.into(),
        }
    }
}

/// WebSocket close codes used by the connection manager.
pub mod close {
    /// Clean shutdown.
    pub const NORMAL: u16 = 1000;
    /// Idle or heartbeat timeout.
    pub const TIMEOUT: u16 = 1001;
    /// Authentication failure or capacity refusal.
    pub const POLICY_VIOLATION: u16 = 1008;
    /// Unhandled fault.
    pub const INTERNAL_ERROR: u16 = 1011;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_codes_are_stable() {
        assert_eq!(
            FabricError::Authorization("bad token".into()).error_code(),
            "INVALID_TOKEN"
        );
        assert_eq!(
            FabricError::protocol("UNKNOWN_MESSAGE_TYPE", "nope").error_code(),
            "UNKNOWN_MESSAGE_TYPE"
        );
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        assert_eq!(FabricError::from(json_err).error_code(), "INVALID_JSON");
    }
}
