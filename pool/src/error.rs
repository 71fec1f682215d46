/// Error and close-reason types for the share protocol
///
/// Plumbing (RPC, storage, start-up) uses `anyhow`; these enums are the
/// typed outcomes the per-connection state machine acts on.

use thiserror::Error;

/// WebSocket close code for malformed input or abuse.
pub const CLOSE_POLICY_VIOLATION: u16 = 1008;

/// WebSocket close code used while the pool drains.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// Violations detected before a message reaches the state machine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Message too large ({0} bytes)")]
    TooLarge(usize),

    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Invalid data format in field `{0}`")]
    InvalidField(&'static str),

    #[error("Binary frames are not supported")]
    BinaryFrame,
}

/// Why the pool closed a connection. Every close carries one.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    #[error("{0}")]
    PolicyViolation(String),

    #[error("Server shutting down")]
    ShuttingDown,
}

impl CloseReason {
    pub fn policy(reason: impl Into<String>) -> Self {
        Self::PolicyViolation(reason.into())
    }

    pub fn code(&self) -> u16 {
        match self {
            Self::PolicyViolation(_) => CLOSE_POLICY_VIOLATION,
            Self::ShuttingDown => CLOSE_GOING_AWAY,
        }
    }
}

impl From<ProtocolError> for CloseReason {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::TooLarge(_) => Self::policy("Message too large"),
            ProtocolError::InvalidJson | ProtocolError::BinaryFrame => Self::policy("Invalid JSON"),
            ProtocolError::InvalidField(_) => Self::policy("Invalid data format"),
        }
    }
}
