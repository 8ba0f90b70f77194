use serde::{Deserialize, Serialize};
use std::fmt;

/// Longest error text persisted alongside a message.
pub const MAX_ERROR_LEN: usize = 500;

/// How a failure on the delivery path should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Connection drops, timeouts, database hiccups. Worth retrying.
    Transient,
    /// Corrupt or undecodable payloads, unknown command types.
    Permanent,
    /// A domain rule refused the work.
    BusinessRejection,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Transient => write!(f, "transient"),
            ErrorKind::Permanent => write!(f, "permanent"),
            ErrorKind::BusinessRejection => write!(f, "business rejection"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} error: {message}")]
pub struct DeliveryError {
    pub kind: ErrorKind,
    pub message: String,
}

impl DeliveryError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn permanent(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Permanent, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BusinessRejection, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

impl From<anyhow::Error> for DeliveryError {
    fn from(err: anyhow::Error) -> Self {
        DeliveryError::transient(format!("{:#}", err))
    }
}

/// Cuts an error message down to what the stores keep.
pub fn truncate_error(message: &str) -> String {
    if message.chars().count() <= MAX_ERROR_LEN {
        return message.to_string();
    }
    message.chars().take(MAX_ERROR_LEN).collect()
}
