//! Error types reported across the port boundaries.

use crate::event::ErrorKind;
use thiserror::Error;

/// Failure reported by an [`Agent`](crate::ports::Agent).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AgentError {
    /// Rate limits, dropped connections. Retried under the retry policy.
    #[error("transient agent failure: {0}")]
    Transient(String),
    /// Malformed or unexecutable output. Ends the rollout.
    #[error("fatal agent failure: {0}")]
    Fatal(String),
}

impl AgentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientAgent,
            Self::Fatal(_) => ErrorKind::FatalAgent,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Fatal(message) => message,
        }
    }
}

/// Failure reported by a [`Runtime`](crate::ports::Runtime).
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RuntimeError {
    #[error("transient runtime failure: {0}")]
    Transient(String),
    #[error("fatal runtime failure: {0}")]
    Fatal(String),
}

impl RuntimeError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient(_) => ErrorKind::TransientRuntime,
            Self::Fatal(_) => ErrorKind::FatalRuntime,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Transient(message) | Self::Fatal(message) => message,
        }
    }
}

/// Errors raised by trajectory stores and knowledge providers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for StoreError {
    fn from(error: std::io::Error) -> Self {
        Self::Io(error.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(error: serde_json::Error) -> Self {
        Self::Serialization(error.to_string())
    }
}

pub type StoreResult<T> = Result<T, StoreError>;
