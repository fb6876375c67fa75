//! Error types for channel subscriptions.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::types::ClientId;

/// Main error type for registry and server operations.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("Invalid channel pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("Unknown client: {0}")]
    UnknownClient(ClientId),

    #[error("Subscribe pipelines need a Tokio runtime")]
    NoRuntime,

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Serialization(e.to_string())
    }
}

/// Failure reported by a channel callback (`access`, `load` or `filter`).
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct ChannelError {
    message: String,
}

impl ChannelError {
    pub fn new(message: impl fmt::Display) -> Self {
        Self {
            message: message.to_string(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Why a subscribe request was undone. Sent to the client.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Access check returned false or failed.
    AccessDenied,
    /// Channel name matches no registered pattern.
    NoMatchingChannel,
    /// Load or filter callback failed.
    LoadFailure,
    /// Client already holds the maximum number of subscriptions.
    LimitExceeded,
}

impl ErrorKind {
    /// Whether retrying the same subscribe can ever succeed.
    pub fn is_permanent(self) -> bool {
        matches!(self, ErrorKind::NoMatchingChannel)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::AccessDenied => "access denied",
            ErrorKind::NoMatchingChannel => "no matching channel",
            ErrorKind::LoadFailure => "load failure",
            ErrorKind::LimitExceeded => "subscription limit exceeded",
        };
        f.write_str(s)
    }
}

/// Result type for registry and server operations.
pub type Result<T> = std::result::Result<T, SyncError>;
