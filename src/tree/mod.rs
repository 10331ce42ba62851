//! Path tree store.
//!
//! The tree is kept as a flat, path-ordered map of leaves rather than a
//! linked node graph:
//! - a directory is any path with stored descendants
//! - subtree reads and writes go through a JSON object encoding
//! - deletes carry a cutoff and only remove strictly older leaves
//!
//! # Example
//!
//! ```ignore
//! let store = TreeStore::default();
//! store.write(&Path::parse("/if/eth0"), TypedValue::json(json!({"mtu": 1500})), ts)?;
//! let leaves = store.read(&Path::root(), &[Path::parse("/if")])?;
//! store.delete_older_than(&Path::parse("/if"), cutoff)?;
//! ```

mod shard;
mod store;

pub use shard::Change;
pub(crate) use shard::{Shard, Undo};
pub use store::TreeStore;
