// Error taxonomy for the agent core
//
// Transient failures (network, timeout, protocol) are retried internally by
// the control client and the session manager. Everything else is either fatal
// to an instance (auth, storage) or scoped to a single network (join, address
// conflict), or is a caller-usage error on the registry API.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors produced by the overlay agent.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    /// Identity persistence failed (directory not writable, corrupt file).
    #[error("storage error: {0}")]
    Storage(String),

    /// Control server rejected the organization / machine credentials.
    #[error("authentication rejected: {0}")]
    Auth(String),

    /// Endpoint unreachable or the connection dropped.
    #[error("network error: {0}")]
    Network(String),

    /// An operation did not complete within its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Malformed or unexpected message from a remote party.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peers or relays refused to admit this device to the network.
    #[error("join rejected for network '{network}': {reason}")]
    Join { network: String, reason: String },

    /// The virtual address collides with another member or local session.
    #[error("address conflict on network '{network}': {address} already in use")]
    AddressConflict { network: String, address: Ipv4Addr },

    /// `start` was called for an instance name that is already active.
    #[error("instance '{0}' is already running")]
    DuplicateInstance(String),

    /// No instance with the given name.
    #[error("instance '{0}' not found")]
    NotFound(String),

    /// Caller-supplied configuration failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// In-flight work was abandoned because of stop/leave.
    #[error("operation cancelled")]
    Cancelled,
}

impl AgentError {
    /// Whether the failure is worth retrying with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AgentError::Network(_) | AgentError::Timeout(_) | AgentError::Protocol(_)
        )
    }

    /// Status code returned across the C boundary.
    pub fn status_code(&self) -> i32 {
        match self {
            AgentError::InvalidConfig(_) => -1,
            AgentError::DuplicateInstance(_) => -2,
            AgentError::NotFound(_) => -3,
            AgentError::Storage(_) => -4,
            _ => -5,
        }
    }
}

impl From<std::io::Error> for AgentError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::TimedOut => AgentError::Timeout(err.to_string()),
            _ => AgentError::Network(err.to_string()),
        }
    }
}

impl From<serde_json::Error> for AgentError {
    fn from(err: serde_json::Error) -> Self {
        AgentError::Protocol(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for AgentError {
    fn from(err: tokio::time::error::Elapsed) -> Self {
        AgentError::Timeout(err.to_string())
    }
}

pub type Result<T, E = AgentError> = std::result::Result<T, E>;
