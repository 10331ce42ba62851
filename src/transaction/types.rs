//! Set request and response types.

use crate::status::Status;
use crate::types::{Path, Timestamp, Update};
use serde::{Deserialize, Serialize};

/// One all-or-nothing transaction.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SetRequest {
    /// Prepended to every path; may start with an alias token.
    pub prefix: Option<Path>,
    pub delete: Vec<Path>,
    /// Delete-then-write at the same path.
    pub replace: Vec<Update>,
    pub update: Vec<Update>,
}

impl SetRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_prefix(mut self, prefix: impl Into<Path>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn delete(mut self, path: impl Into<Path>) -> Self {
        self.delete.push(path.into());
        self
    }

    pub fn replace(mut self, update: Update) -> Self {
        self.replace.push(update);
        self
    }

    pub fn update(mut self, update: Update) -> Self {
        self.update.push(update);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.delete.is_empty() && self.replace.is_empty() && self.update.is_empty()
    }
}

/// Kind of mutation a result refers to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Delete,
    Replace,
    Update,
}

/// Outcome for one path of a transaction.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UpdateResult {
    /// Path as given in the request, relative to the request prefix.
    pub path: Path,
    pub op: Operation,
    /// Commit timestamp, set only on success.
    pub timestamp: Option<Timestamp>,
    pub error: Option<Status>,
}

impl UpdateResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SetResponse {
    pub prefix: Option<Path>,
    /// Receipt timestamp of the transaction.
    pub timestamp: Timestamp,
    pub results: Vec<UpdateResult>,
}

impl SetResponse {
    /// True when every path committed.
    pub fn is_ok(&self) -> bool {
        self.results.iter().all(UpdateResult::is_ok)
    }

    /// The shared error of a failed transaction.
    pub fn error(&self) -> Option<&Status> {
        self.results.iter().find_map(|r| r.error.as_ref())
    }
}
