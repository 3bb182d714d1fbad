//! Error types for the recovery engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecoveryError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Adapter error in component '{component}': {message}")]
    Adapter { component: String, message: String },

    #[error("Corrupted snapshot for component '{component}': expected checksum {expected}, found {actual}")]
    Corruption {
        component: String,
        expected: String,
        actual: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Recovery procedure error: {0}")]
    Procedure(String),
}

impl RecoveryError {
    /// True for errors that mean "the backup id is invalid or missing".
    pub fn is_not_found(&self) -> bool {
        matches!(self, RecoveryError::NotFound(_))
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, RecoveryError::Validation(_))
    }

    pub fn is_corruption(&self) -> bool {
        matches!(self, RecoveryError::Corruption { .. })
    }
}

pub type Result<T> = std::result::Result<T, RecoveryError>;
