//! Error types for the Tandem engine.

use crate::{CollectionName, LocalId};
use thiserror::Error;

/// All possible errors from the Tandem engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Catalogue errors
    #[error("collection not found: {0}")]
    UnknownCollection(CollectionName),

    // Identity errors
    #[error("duplicate local id in collection: {0}")]
    DuplicateLocalId(LocalId),

    #[error("invalid remote id: {0}")]
    InvalidRemoteId(String),

    // Validation errors
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("missing required field: {0}")]
    MissingRequiredField(String),

    #[error("type mismatch for field '{field}': expected {expected}, got {got}")]
    TypeMismatch {
        field: String,
        expected: String,
        got: String,
    },

    // State errors
    #[error("invalid snapshot: {0}")]
    InvalidSnapshot(String),
}

impl Error {
    /// Whether the error describes record content the remote side would
    /// never accept, as opposed to a misuse of the engine.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::InvalidPayload(_) | Error::MissingRequiredField(_) | Error::TypeMismatch { .. }
        )
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;
