//! Concurrent path tree store.

use super::shard::{Change, Shard};
use crate::error::{Result, StoreError};
use crate::subscriptions::SubscriptionManager;
use crate::types::{Leaf, Path, Timestamp, TypedValue};
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Hierarchical map from path to timestamped value.
///
/// Sharded by first path segment: writers under `/a` and `/b` never
/// contend, writers sharing a first segment serialize on that shard.
/// Every committed mutation is published to the subscription registry
/// while the shard is still locked, so events for one path are delivered
/// in commit order.
pub struct TreeStore {
    shards: RwLock<HashMap<String, Arc<RwLock<Shard>>>>,
    read_only: RwLock<Vec<Path>>,
    subscriptions: SubscriptionManager,
    lock_timeout: Duration,
}

impl TreeStore {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            shards: RwLock::new(HashMap::new()),
            read_only: RwLock::new(Vec::new()),
            subscriptions: SubscriptionManager::new(),
            lock_timeout,
        }
    }

    /// Registry that receives this store's change events.
    pub fn subscriptions(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    // --- Reads ---

    /// Read `prefix + path` for every requested path.
    ///
    /// Leaves yield their value; directories yield the JSON-encoded
    /// subtree stamped with its newest descendant.
    pub fn read(&self, prefix: &Path, paths: &[Path]) -> Result<Vec<Leaf>> {
        let mut out = Vec::with_capacity(paths.len());
        for path in paths {
            let absolute = prefix.join(path);
            absolute.validate()?;
            let leaf = match self.existing_shard(&absolute) {
                Some(shard) => {
                    let guard = self.read_guard(&shard)?;
                    guard.read(&absolute)
                }
                None => None,
            };
            out.push(leaf.ok_or_else(|| StoreError::NotFound(absolute.to_string()))?);
        }
        Ok(out)
    }

    /// Single-path convenience over [`TreeStore::read`] that maps a missing
    /// path to `None`.
    pub fn get(&self, path: &Path) -> Result<Option<Leaf>> {
        match self.read(&Path::root(), std::slice::from_ref(path)) {
            Ok(mut leaves) => Ok(leaves.pop()),
            Err(StoreError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Every stored leaf at or under `path`, in path order.
    pub fn scan(&self, path: &Path) -> Result<Vec<Leaf>> {
        path.validate()?;
        match self.existing_shard(path) {
            Some(shard) => {
                let guard = self.read_guard(&shard)?;
                Ok(guard.scan(path))
            }
            None => Ok(Vec::new()),
        }
    }

    /// All leaves in the store, in path order.
    pub fn dump(&self) -> Result<Vec<Leaf>> {
        let mut handles: Vec<(String, Arc<RwLock<Shard>>)> = self
            .shards
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), Arc::clone(v)))
            .collect();
        handles.sort_by(|a, b| a.0.cmp(&b.0));

        let mut out = Vec::new();
        for (_, shard) in &handles {
            out.extend(self.read_guard(shard)?.dump());
        }
        Ok(out)
    }

    /// Number of stored leaves.
    pub fn len(&self) -> usize {
        self.shards.read().values().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, path: &Path) -> bool {
        matches!(self.get(path), Ok(Some(_)))
    }

    // --- Writes ---

    /// Set a leaf or merge a subtree at `path`, stamped `timestamp`.
    pub fn write(&self, path: &Path, value: TypedValue, timestamp: Timestamp) -> Result<Vec<Change>> {
        path.validate()?;
        let outcome = self.write_to(&self.shard(path), path, value, timestamp);
        self.prune(path.first());
        outcome
    }

    /// Remove `path` and every descendant stamped strictly before `cutoff`.
    pub fn delete_older_than(&self, path: &Path, cutoff: Timestamp) -> Result<Vec<Change>> {
        path.validate()?;
        let Some(shard) = self.existing_shard(path) else {
            return Ok(Vec::new());
        };
        let changes = {
            let mut guard = self.write_guard(&shard)?;
            let changes = guard.delete_older_than(path, cutoff);
            self.publish(&changes);
            changes
        };
        drop(shard);
        self.prune(path.first());
        Ok(changes)
    }

    // --- Read-only regions ---

    /// Forbid client transactions from modifying anything under `path`.
    pub fn mark_read_only(&self, path: Path) -> Result<()> {
        path.validate()?;
        let mut regions = self.read_only.write();
        if !regions.contains(&path) {
            regions.push(path);
        }
        Ok(())
    }

    /// True if a write or delete at `path` would touch a read-only region.
    pub fn is_read_only(&self, path: &Path) -> bool {
        self.read_only
            .read()
            .iter()
            .any(|region| region.is_prefix_of(path) || path.is_prefix_of(region))
    }

    // --- Crate-internal locking for the transaction engine ---

    /// Handles for the named shards, sorted by key. Shards named in
    /// `create` are made on demand; the rest are returned only if they
    /// already exist, since deleting from nothing needs no lock domain.
    pub(crate) fn shard_handles(
        &self,
        create: &BTreeSet<String>,
        existing: &BTreeSet<String>,
    ) -> Vec<(String, Arc<RwLock<Shard>>)> {
        create
            .union(existing)
            .filter_map(|key| {
                let shard = if create.contains(key) {
                    Some(self.shard_for_key(key))
                } else {
                    self.shards.read().get(key).cloned()
                };
                shard.map(|shard| (key.clone(), shard))
            })
            .collect()
    }

    /// Drop the named shards if they hold no leaves and nobody else holds
    /// a handle to them. Handles are only cloned under the map lock, so a
    /// shard seen unshared under the write lock stays unshared.
    pub(crate) fn prune<'k>(&self, keys: impl IntoIterator<Item = &'k str>) {
        let candidates: Vec<&str> = {
            let shards = self.shards.read();
            keys.into_iter()
                .filter(|key| shards.get(*key).is_some_and(is_unused))
                .collect()
        };
        if candidates.is_empty() {
            return;
        }

        let mut shards = self.shards.write();
        for key in candidates {
            if shards.get(key).is_some_and(is_unused) {
                shards.remove(key);
                debug!(shard = key, "dropping empty tree shard");
            }
        }
    }

    /// Number of lock domains currently allocated.
    #[cfg(test)]
    pub(crate) fn shard_count(&self) -> usize {
        self.shards.read().len()
    }

    pub(crate) fn write_guard<'a>(&self, shard: &'a RwLock<Shard>) -> Result<RwLockWriteGuard<'a, Shard>> {
        shard.try_write_for(self.lock_timeout).ok_or_else(|| {
            StoreError::AlreadyInProgress("conflicting write holds the path range".into())
        })
    }

    pub(crate) fn publish(&self, changes: &[Change]) {
        if !changes.is_empty() {
            self.subscriptions.broadcast_changes(changes);
        }
    }

    fn read_guard<'a>(&self, shard: &'a RwLock<Shard>) -> Result<RwLockReadGuard<'a, Shard>> {
        shard.try_read_for(self.lock_timeout).ok_or_else(|| {
            StoreError::AlreadyInProgress("path range is locked by a writer".into())
        })
    }

    fn write_to(
        &self,
        shard: &RwLock<Shard>,
        path: &Path,
        value: TypedValue,
        timestamp: Timestamp,
    ) -> Result<Vec<Change>> {
        let mut guard = self.write_guard(shard)?;
        let changes = guard.write(path, value, timestamp)?;
        self.publish(&changes);
        Ok(changes)
    }

    fn existing_shard(&self, path: &Path) -> Option<Arc<RwLock<Shard>>> {
        let key = path.first()?;
        self.shards.read().get(key).cloned()
    }

    fn shard(&self, path: &Path) -> Arc<RwLock<Shard>> {
        self.shard_for_key(path.first().unwrap_or_default())
    }

    fn shard_for_key(&self, key: &str) -> Arc<RwLock<Shard>> {
        if let Some(shard) = self.shards.read().get(key) {
            return Arc::clone(shard);
        }
        let mut shards = self.shards.write();
        Arc::clone(shards.entry(key.to_string()).or_insert_with(|| {
            debug!(shard = key, "creating tree shard");
            Arc::new(RwLock::new(Shard::default()))
        }))
    }
}

fn is_unused(shard: &Arc<RwLock<Shard>>) -> bool {
    Arc::strong_count(shard) == 1 && shard.try_read().is_some_and(|s| s.len() == 0)
}

impl Default for TreeStore {
    fn default() -> Self {
        Self::new(Duration::from_millis(500))
    }
}
