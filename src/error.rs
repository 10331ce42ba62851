//! Error types for the tree engine.

use crate::status::Code;
use thiserror::Error;

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Unknown alias: {0}")]
    UnknownAlias(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already in progress: {0}")]
    AlreadyInProgress(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Stream closed by peer")]
    StreamClosed,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Checksum mismatch: expected {expected}, got {got}")]
    ChecksumMismatch { expected: u32, got: u32 },

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl StoreError {
    /// Status code this error is reported with.
    pub fn code(&self) -> Code {
        match self {
            StoreError::InvalidPath(_)
            | StoreError::TypeMismatch(_)
            | StoreError::UnknownAlias(_)
            | StoreError::InvalidArgument(_)
            | StoreError::InvalidFormat(_) => Code::InvalidArgument,
            StoreError::PermissionDenied(_) => Code::PermissionDenied,
            StoreError::NotFound(_) => Code::NotFound,
            StoreError::AlreadyInProgress(_) => Code::Aborted,
            StoreError::ResourceExhausted(_) => Code::ResourceExhausted,
            StoreError::StreamClosed => Code::Cancelled,
            StoreError::ChecksumMismatch { .. } => Code::DataLoss,
            StoreError::Serialization(_)
            | StoreError::Deserialization(_)
            | StoreError::Internal(_) => Code::Internal,
        }
    }

    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StoreError::AlreadyInProgress(_) | StoreError::Internal(_)
        )
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::encode::Error> for StoreError {
    fn from(e: rmp_serde::encode::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<rmp_serde::decode::Error> for StoreError {
    fn from(e: rmp_serde::decode::Error) -> Self {
        StoreError::Deserialization(e.to_string())
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, StoreError>;
