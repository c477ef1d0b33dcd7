use serde_json::Error as JsonError;
use thiserror::Error;

/// Result type for state resolution and event authorization.
pub type StateResult<T> = std::result::Result<T, StateError>;

/// Represents the various errors that arise when resolving state.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StateError {
    /// A deserialization error.
    #[error(transparent)]
    SerdeJson(#[from] JsonError),

    /// The given option or version is unsupported.
    #[error("unsupported room version: {0}")]
    Unsupported(String),

    /// The given event was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid fields in the given PDU.
    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    /// The event is not allowed by the authorization rules.
    #[error("{0}")]
    Forbidden(String),

    /// Any other error.
    #[error("{0}")]
    Other(String),
}

impl StateError {
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::Forbidden(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
