//! Wire-level status triples reported per path and per stream.

use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Status codes, numbered after the conventional RPC status taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Code {
    Ok = 0,
    Cancelled = 1,
    Unknown = 2,
    InvalidArgument = 3,
    DeadlineExceeded = 4,
    NotFound = 5,
    AlreadyExists = 6,
    PermissionDenied = 7,
    ResourceExhausted = 8,
    FailedPrecondition = 9,
    Aborted = 10,
    OutOfRange = 11,
    Unimplemented = 12,
    Internal = 13,
    Unavailable = 14,
    DataLoss = 15,
    Unauthenticated = 16,
}

impl Code {
    /// Numeric value of the code.
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

/// `(code, message, details)` triple attached to failed paths and streams.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub code: Code,
    pub message: String,
    /// Optional structured detail (e.g. the offending path).
    pub details: Option<serde_json::Value>,
}

impl Status {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn is_ok(&self) -> bool {
        self.code == Code::Ok
    }
}

impl From<&StoreError> for Status {
    fn from(err: &StoreError) -> Self {
        Status::new(err.code(), err.to_string())
    }
}

impl From<StoreError> for Status {
    fn from(err: StoreError) -> Self {
        Status::from(&err)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({}): {}", self.code, self.code.as_i32(), self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_status_from_error() {
        let status = Status::from(StoreError::PermissionDenied("/state is read-only".into()));
        assert_eq!(status.code, Code::PermissionDenied);
        assert_eq!(status.code.as_i32(), 7);
        assert!(status.message.contains("/state"));
        assert!(status.details.is_none());
    }

    #[test]
    fn test_details() {
        let status = Status::new(Code::InvalidArgument, "bad").with_details(json!({"path": "/a"}));
        assert_eq!(status.details, Some(json!({"path": "/a"})));
        assert!(!status.is_ok());
    }
}
