//! All-or-nothing application of Set transactions.

use super::types::{Operation, SetRequest, SetResponse, UpdateResult};
use crate::alias::AliasTable;
use crate::error::{Result, StoreError};
use crate::status::Status;
use crate::tree::{Change, Shard, TreeStore, Undo};
use crate::types::{Clock, Path, Timestamp, TypedValue};
use parking_lot::{RwLock, RwLockWriteGuard};
use serde_json::json;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// One resolved mutation.
struct Step {
    /// Path as the client sent it.
    requested: Path,
    absolute: Path,
    op: Operation,
    value: Option<TypedValue>,
}

/// A failure tied to the path that caused it.
struct Failure {
    path: Option<Path>,
    error: StoreError,
}

impl From<StoreError> for Failure {
    fn from(error: StoreError) -> Self {
        Self { path: None, error }
    }
}

impl Failure {
    fn at(path: &Path, error: StoreError) -> Self {
        Self {
            path: Some(path.clone()),
            error,
        }
    }

    fn status(&self) -> Status {
        let status = Status::from(&self.error);
        match &self.path {
            Some(path) => status.with_details(json!({ "path": path.to_string() })),
            None => status,
        }
    }
}

/// Applies [`SetRequest`]s to the tree store.
///
/// A transaction locks every shard it touches (in key order) for its
/// whole duration and applies its steps in place, capturing each step's
/// path range first. If any step fails the captured ranges are restored
/// before the locks are released. Overlapping transactions therefore
/// serialize, and a failed one leaves no trace.
#[derive(Clone)]
pub struct TransactionEngine {
    store: Arc<TreeStore>,
    aliases: Arc<AliasTable>,
    clock: Arc<Clock>,
}

impl TransactionEngine {
    pub fn new(store: Arc<TreeStore>, aliases: Arc<AliasTable>, clock: Arc<Clock>) -> Self {
        Self {
            store,
            aliases,
            clock,
        }
    }

    /// Apply one transaction.
    pub fn apply(&self, request: SetRequest) -> SetResponse {
        let skeleton = fold(&request);
        let mut timestamp = None;

        let outcome = self
            .resolve(request.prefix.as_ref(), &skeleton)
            .and_then(|steps| self.commit(&steps, &mut timestamp));
        let timestamp = timestamp.unwrap_or_else(|| self.clock.now());

        let results = match outcome {
            Ok(count) => {
                debug!(steps = skeleton.len(), changes = count, ts = timestamp.0, "transaction committed");
                skeleton
                    .into_iter()
                    .map(|(path, op, _)| UpdateResult {
                        path,
                        op,
                        timestamp: Some(timestamp),
                        error: None,
                    })
                    .collect()
            }
            Err(failure) => {
                warn!(error = %failure.error, "transaction aborted");
                let status = failure.status();
                skeleton
                    .into_iter()
                    .map(|(path, op, _)| UpdateResult {
                        path,
                        op,
                        timestamp: None,
                        error: Some(status.clone()),
                    })
                    .collect()
            }
        };

        SetResponse {
            prefix: request.prefix,
            timestamp,
            results,
        }
    }

    /// Expand, validate and permission-check every path before any lock
    /// is taken.
    fn resolve(
        &self,
        prefix: Option<&Path>,
        skeleton: &[(Path, Operation, Option<TypedValue>)],
    ) -> std::result::Result<Vec<Step>, Failure> {
        let prefix = match prefix {
            Some(prefix) => self.aliases.expand(prefix).map_err(|e| Failure::at(prefix, e))?,
            None => Path::root(),
        };

        skeleton
            .iter()
            .map(|(requested, op, value)| {
                let absolute = prefix.join(requested);
                absolute.validate().map_err(|e| Failure::at(requested, e))?;
                if self.store.is_read_only(&absolute) {
                    return Err(Failure::at(
                        requested,
                        StoreError::PermissionDenied(format!("{} is read-only", absolute)),
                    ));
                }
                Ok(Step {
                    requested: requested.clone(),
                    absolute,
                    op: *op,
                    value: value.clone(),
                })
            })
            .collect()
    }

    /// Lock, apply, roll back on failure, publish on success. Returns the
    /// number of changes.
    fn commit(
        &self,
        steps: &[Step],
        timestamp: &mut Option<Timestamp>,
    ) -> std::result::Result<usize, Failure> {
        let mut writes = BTreeSet::new();
        let mut deletes = BTreeSet::new();
        for step in steps {
            if let Some(key) = step.absolute.first() {
                match step.op {
                    Operation::Delete => deletes.insert(key.to_string()),
                    Operation::Replace | Operation::Update => writes.insert(key.to_string()),
                };
            }
        }

        let handles = self.store.shard_handles(&writes, &deletes);
        let outcome = self.apply_locked(&handles, steps, timestamp);
        drop(handles);
        self.store
            .prune(writes.iter().chain(deletes.iter()).map(String::as_str));
        outcome
    }

    fn apply_locked(
        &self,
        handles: &[(String, Arc<RwLock<Shard>>)],
        steps: &[Step],
        timestamp: &mut Option<Timestamp>,
    ) -> std::result::Result<usize, Failure> {
        // Handles arrive sorted by key, so locks are always taken in the
        // same order.
        let mut guards: HashMap<&str, RwLockWriteGuard<'_, Shard>> =
            HashMap::with_capacity(handles.len());
        for (key, shard) in handles {
            guards.insert(key.as_str(), self.store.write_guard(shard)?);
        }

        // Taken under the locks so that commit order matches timestamp order.
        let ts = self.clock.now();
        *timestamp = Some(ts);

        let mut undo: Vec<(&str, Undo)> = Vec::with_capacity(steps.len());
        let mut changes = Vec::new();
        for step in steps {
            let key = step.absolute.first().unwrap_or_default();
            let Some(shard) = guards.get_mut(key) else {
                if step.op == Operation::Delete {
                    // Nothing is stored under this first segment.
                    continue;
                }
                roll_back(&mut guards, undo);
                return Err(Failure::at(
                    &step.requested,
                    StoreError::Internal(format!("no locked shard for {}", step.absolute)),
                ));
            };
            undo.push((key, shard.capture(&step.absolute)));
            if let Err(e) = apply_step(shard, step, ts, &mut changes) {
                roll_back(&mut guards, undo);
                return Err(Failure::at(&step.requested, e));
            }
        }

        self.store.publish(&changes);
        Ok(changes.len())
    }
}

/// Restore captured ranges newest first, leaving every shard as it was
/// before the transaction.
fn roll_back(guards: &mut HashMap<&str, RwLockWriteGuard<'_, Shard>>, undo: Vec<(&str, Undo)>) {
    for (key, entry) in undo.into_iter().rev() {
        if let Some(shard) = guards.get_mut(key) {
            shard.restore(entry);
        }
    }
}

fn apply_step(shard: &mut Shard, step: &Step, ts: Timestamp, changes: &mut Vec<Change>) -> Result<()> {
    match (step.op, &step.value) {
        (Operation::Delete, _) => {
            changes.extend(shard.delete_older_than(&step.absolute, ts));
        }
        (Operation::Replace, Some(value)) => {
            // Clears everything stamped before T, including a value stamped
            // T - 1ns. The write at T lands after the delete, so it stays.
            changes.extend(shard.delete_older_than(&step.absolute, ts));
            changes.extend(shard.write(&step.absolute, value.clone(), ts)?);
        }
        (Operation::Update, Some(value)) => {
            changes.extend(shard.write(&step.absolute, value.clone(), ts)?);
        }
        (_, None) => {
            return Err(StoreError::InvalidArgument(format!(
                "{} carries no value",
                step.absolute
            )))
        }
    }
    Ok(())
}

/// Order steps as deletes, replaces, updates. A path both deleted and
/// updated in one request is folded into a single replace.
fn fold(request: &SetRequest) -> Vec<(Path, Operation, Option<TypedValue>)> {
    let updated: HashSet<&Path> = request.update.iter().map(|u| &u.path).collect();
    let deleted: HashSet<&Path> = request.delete.iter().collect();

    let deletes = request
        .delete
        .iter()
        .filter(|p| !updated.contains(p))
        .map(|p| (p.clone(), Operation::Delete, None));
    let replaces = request
        .replace
        .iter()
        .map(|u| (u.path.clone(), Operation::Replace, Some(u.value.clone())));
    let updates = request.update.iter().map(|u| {
        let op = if deleted.contains(&u.path) {
            Operation::Replace
        } else {
            Operation::Update
        };
        (u.path.clone(), op, Some(u.value.clone()))
    });

    let mut steps: Vec<_> = deletes.chain(replaces).chain(updates).collect();
    // Stable: replaces before plain updates, request order otherwise.
    steps.sort_by_key(|(_, op, _)| match op {
        Operation::Delete => 0,
        Operation::Replace => 1,
        Operation::Update => 2,
    });
    steps
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::Code;
    use crate::types::Update;
    use serde_json::json;

    fn engine() -> (TransactionEngine, Arc<TreeStore>) {
        let store = Arc::new(TreeStore::default());
        let engine = TransactionEngine::new(
            Arc::clone(&store),
            Arc::new(AliasTable::new()),
            Arc::new(Clock::new()),
        );
        (engine, store)
    }

    #[test]
    fn test_update_then_read() {
        let (engine, store) = engine();
        let response = engine.apply(
            SetRequest::new()
                .with_prefix("/sys")
                .update(Update::new("/name", TypedValue::json("r1"))),
        );
        assert!(response.is_ok());
        assert_eq!(response.results[0].timestamp, Some(response.timestamp));
        let leaf = store.get(&Path::parse("/sys/name")).unwrap().unwrap();
        assert_eq!(leaf.value, TypedValue::json("r1"));
        assert_eq!(leaf.timestamp, response.timestamp);
    }

    #[test]
    fn test_delete_and_update_fold_into_replace() {
        let (engine, store) = engine();
        engine.apply(SetRequest::new().update(Update::new(
            "/if/eth0",
            TypedValue::json(json!({"mtu": 1500, "descr": "uplink"})),
        )));

        let response = engine.apply(
            SetRequest::new()
                .delete("/if/eth0")
                .update(Update::new("/if/eth0", TypedValue::json(json!({"mtu": 9000})))),
        );
        assert!(response.is_ok());
        assert_eq!(response.results.len(), 1);
        assert_eq!(response.results[0].op, Operation::Replace);
        assert!(!store.contains(&Path::parse("/if/eth0/descr")));
        assert_eq!(
            store.get(&Path::parse("/if/eth0/mtu")).unwrap().unwrap().value,
            TypedValue::json(9000)
        );
    }

    #[test]
    fn test_replace_scalar_over_directory() {
        let (engine, store) = engine();
        engine.apply(SetRequest::new().update(Update::new("/a/b/c", TypedValue::json(1))));
        let response = engine.apply(SetRequest::new().replace(Update::new("/a/b", TypedValue::json(2))));
        assert!(response.is_ok());
        assert_eq!(store.get(&Path::parse("/a/b")).unwrap().unwrap().value, TypedValue::json(2));
        assert!(!store.contains(&Path::parse("/a/b/c")));
    }

    #[test]
    fn test_replace_clears_value_one_nanosecond_older() {
        // Far ahead of the wall clock, so every reading is the previous + 1.
        let clock = Arc::new(Clock::starting_after(Timestamp(1 << 62)));
        let store = Arc::new(TreeStore::default());
        let engine = TransactionEngine::new(
            Arc::clone(&store),
            Arc::new(AliasTable::new()),
            Arc::clone(&clock),
        );

        let stored = clock.now();
        store.write(&Path::parse("/p/old"), TypedValue::json(1), stored).unwrap();
        store.write(&Path::parse("/q"), TypedValue::json(1), stored).unwrap();

        let response = engine.apply(
            SetRequest::new()
                .replace(Update::new("/p", TypedValue::json(2)))
                .replace(Update::new("/q", TypedValue::json(json!({"a": 1})))),
        );
        assert!(response.is_ok(), "{:?}", response.error());
        assert_eq!(response.timestamp, Timestamp(stored.0 + 1));
        assert_eq!(store.get(&Path::parse("/p")).unwrap().unwrap().value, TypedValue::json(2));
        assert!(!store.contains(&Path::parse("/p/old")));
        assert_eq!(
            store.get(&Path::parse("/q")).unwrap().unwrap().value,
            TypedValue::json(json!({"a": 1}))
        );
    }

    #[test]
    fn test_deletes_of_absent_roots_allocate_nothing() {
        let (engine, store) = engine();
        for i in 0..1000 {
            let response = engine.apply(SetRequest::new().delete(format!("/nope{}", i).as_str()));
            assert!(response.is_ok());
        }
        assert!(store.is_empty());
        assert_eq!(store.shard_count(), 0);
    }

    #[test]
    fn test_rollback_spans_shards_and_steps() {
        let (engine, store) = engine();
        engine.apply(
            SetRequest::new()
                .update(Update::new("/a", TypedValue::json(json!({"x": 1, "y": {"z": 2}}))))
                .update(Update::new("/b/leaf", TypedValue::json(3))),
        );
        let before = store.dump().unwrap();

        let response = engine.apply(
            SetRequest::new()
                .delete("/a/y")
                .replace(Update::new("/a/x", TypedValue::json(json!({"deep": true}))))
                .update(Update::new("/b", TypedValue::json(json!({"other": 4}))))
                .update(Update::new("/fresh/x", TypedValue::json(5)))
                // Beneath the leaf /b/other written two steps earlier.
                .update(Update::new("/b/other/z", TypedValue::json(6))),
        );
        assert!(!response.is_ok());
        assert_eq!(store.dump().unwrap(), before);
        assert!(!store.contains(&Path::parse("/fresh/x")));
        assert_eq!(store.shard_count(), 2);
    }

    #[test]
    fn test_failure_is_atomic_and_shared() {
        let (engine, store) = engine();
        engine.apply(
            SetRequest::new()
                .update(Update::new("/a/dir/x", TypedValue::json(1)))
                .update(Update::new("/a/keep", TypedValue::json(2))),
        );
        let before = store.dump().unwrap();

        let response = engine.apply(
            SetRequest::new()
                .delete("/a/keep")
                .update(Update::new("/b/new", TypedValue::json(5)))
                // Scalar over a directory: type mismatch.
                .update(Update::new("/a/dir", TypedValue::json(7))),
        );
        assert!(!response.is_ok());
        assert!(response.results.iter().all(|r| r.error.as_ref().map(|s| s.code) == Some(Code::InvalidArgument)));
        assert_eq!(
            response.error().and_then(|s| s.details.clone()),
            Some(json!({"path": "/a/dir"}))
        );
        assert_eq!(store.dump().unwrap(), before);
    }

    #[test]
    fn test_read_only_rejected_before_locking() {
        let (engine, store) = engine();
        store.mark_read_only(Path::parse("/state")).unwrap();
        let response = engine.apply(
            SetRequest::new()
                .update(Update::new("/config/x", TypedValue::json(1)))
                .update(Update::new("/state/counters/in", TypedValue::json(1))),
        );
        assert_eq!(response.error().map(|s| s.code), Some(Code::PermissionDenied));
        assert!(store.is_empty());
    }

    #[test]
    fn test_invalid_path() {
        let (engine, _store) = engine();
        let response = engine.apply(SetRequest::new().delete(Path::new(["a", ""])));
        assert_eq!(response.error().map(|s| s.code), Some(Code::InvalidArgument));
    }

    #[test]
    fn test_unknown_alias_prefix() {
        let (engine, _store) = engine();
        let response = engine.apply(
            SetRequest::new()
                .with_prefix(Path::new(["@missing"]))
                .update(Update::new("/x", TypedValue::json(1))),
        );
        assert!(!response.is_ok());
    }

    #[test]
    fn test_fold_order() {
        let request = SetRequest::new()
            .update(Update::new("/u", TypedValue::json(1)))
            .replace(Update::new("/r", TypedValue::json(2)))
            .delete("/d");
        let steps = fold(&request);
        let ops: Vec<Operation> = steps.iter().map(|(_, op, _)| *op).collect();
        assert_eq!(ops, vec![Operation::Delete, Operation::Replace, Operation::Update]);
    }
}
