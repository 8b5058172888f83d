//! Bridge error taxonomy.
//!
//! Configuration, connection and hardware acquisition failures are fatal
//! during startup. Transient operation failures are logged by the caller and
//! the operation is abandoned.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BridgeError>;

#[derive(Debug, Error)]
pub enum BridgeError {
    /// Unknown domain, malformed entity, unreadable config file.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Broker unreachable or rejected the session.
    #[error("broker connection error: {0}")]
    Connection(String),

    /// A hardware binding could not be acquired.
    #[error("hardware unavailable for entity '{entity}': {reason}")]
    HardwareUnavailable { entity: String, reason: String },

    /// A single publish, read or pulse failed during steady state.
    #[error("{operation} failed: {reason}")]
    TransientOperation { operation: String, reason: String },
}

impl BridgeError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl std::fmt::Display) -> Self {
        Self::Connection(msg.to_string())
    }

    pub fn hardware(entity: &str, reason: impl std::fmt::Display) -> Self {
        Self::HardwareUnavailable {
            entity: entity.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn transient(operation: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::TransientOperation {
            operation: operation.into(),
            reason: reason.to_string(),
        }
    }
}
