//! Error types for the proxy protocol.

use tether_core::PathError;
use thiserror::Error;

use crate::object::Thrown;

/// Errors raised by proxy operations, the exposer, and the wire codec.
#[derive(Debug, Clone, Error)]
pub enum RpcError {
    /// A peer sent something the protocol does not allow.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The proxy (or the endpoint it rides on) has been released.
    #[error("proxy has been released")]
    Released,

    /// The other end of the channel is gone.
    #[error("endpoint disconnected")]
    Disconnected,

    /// A value that is neither plain data nor claimed by a wire handler.
    #[error("value cannot be sent: {0}")]
    Unserializable(String),

    /// The remote side threw; the fault is re-raised here.
    #[error("remote threw: {0}")]
    Thrown(Thrown),

    #[error("invalid property name: {0}")]
    Path(#[from] PathError),
}

impl RpcError {
    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError::Protocol(message.into())
    }

    /// The thrown payload, when the remote side raised.
    pub fn thrown(&self) -> Option<&Thrown> {
        match self {
            RpcError::Thrown(t) => Some(t),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
