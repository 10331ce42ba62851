//! Transactional writes.
//!
//! A [`SetRequest`] carries deletes, replaces and updates under one
//! optional prefix. The engine applies them in that order with a single
//! receipt timestamp:
//! - deletes remove everything older than the timestamp
//! - replaces delete with a cutoff one nanosecond earlier, then write
//! - updates write (merging subtrees for JSON objects)
//!
//! Either every step commits or none does; on failure every
//! [`UpdateResult`] carries the same status.

mod engine;
mod types;

pub use engine::TransactionEngine;
pub use types::{Operation, SetRequest, SetResponse, UpdateResult};
