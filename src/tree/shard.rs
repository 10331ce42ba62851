//! One lock domain of the tree: a flat, path-ordered map of leaves.
//!
//! Directories are never stored; a directory exists while at least one
//! leaf lives beneath it. No stored leaf is a strict prefix of another.

use crate::error::{Result, StoreError};
use crate::types::{Leaf, Path, Timestamp, TypedValue};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::trace;

/// A single mutation produced by a write or delete.
#[derive(Clone, Debug, PartialEq)]
pub enum Change {
    /// A leaf was created or overwritten.
    Update {
        path: Path,
        value: TypedValue,
        timestamp: Timestamp,
    },
    /// A leaf was removed.
    Delete { path: Path, timestamp: Timestamp },
}

impl Change {
    pub fn path(&self) -> &Path {
        match self {
            Change::Update { path, .. } | Change::Delete { path, .. } => path,
        }
    }

    pub fn timestamp(&self) -> Timestamp {
        match self {
            Change::Update { timestamp, .. } | Change::Delete { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub(crate) struct Entry {
    pub(crate) value: TypedValue,
    pub(crate) timestamp: Timestamp,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NodeKind {
    Leaf,
    Directory,
    Absent,
}

/// Prior contents of one path range, for rolling back a failed step.
#[derive(Debug)]
pub(crate) struct Undo {
    path: Path,
    saved: Vec<(Path, Entry)>,
}

#[derive(Debug, Default)]
pub(crate) struct Shard {
    leaves: BTreeMap<Path, Entry>,
}

impl Shard {
    pub(crate) fn len(&self) -> usize {
        self.leaves.len()
    }

    /// Leaves at or under `path`, in path order.
    fn descendants<'a>(&'a self, path: &'a Path) -> impl Iterator<Item = (&'a Path, &'a Entry)> {
        self.leaves
            .range(path.clone()..)
            .take_while(move |(key, _)| path.is_prefix_of(key))
    }

    /// Nearest strict ancestor of `path` that is stored as a leaf.
    fn leaf_ancestor(&self, path: &Path) -> Option<Path> {
        (1..path.len())
            .map(|n| path.truncated(n))
            .find(|ancestor| self.leaves.contains_key(ancestor))
    }

    fn classify(&self, path: &Path) -> NodeKind {
        if self.leaves.contains_key(path) {
            NodeKind::Leaf
        } else if self.descendants(path).next().is_some() {
            NodeKind::Directory
        } else {
            NodeKind::Absent
        }
    }

    /// Leaf value, or the JSON-encoded subtree for a directory.
    pub(crate) fn read(&self, path: &Path) -> Option<Leaf> {
        if let Some(entry) = self.leaves.get(path) {
            return Some(Leaf {
                path: path.clone(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
            });
        }

        let mut root = Map::new();
        let mut newest: Option<Timestamp> = None;
        for (key, entry) in self.descendants(path) {
            insert_nested(&mut root, &key.segments()[path.len()..], entry.value.to_json());
            newest = Some(newest.map_or(entry.timestamp, |t| t.max(entry.timestamp)));
        }

        newest.map(|timestamp| Leaf {
            path: path.clone(),
            value: TypedValue::json(Value::Object(root)),
            timestamp,
        })
    }

    pub(crate) fn scan(&self, path: &Path) -> Vec<Leaf> {
        self.descendants(path)
            .map(|(key, entry)| Leaf {
                path: key.clone(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
            })
            .collect()
    }

    pub(crate) fn dump(&self) -> Vec<Leaf> {
        self.leaves
            .iter()
            .map(|(key, entry)| Leaf {
                path: key.clone(),
                value: entry.value.clone(),
                timestamp: entry.timestamp,
            })
            .collect()
    }

    /// Write a leaf, or merge a subtree when `value` is a JSON object.
    ///
    /// Last-writer-wins by timestamp: leaves stamped strictly later than
    /// `timestamp` are neither overwritten nor removed.
    pub(crate) fn write(
        &mut self,
        path: &Path,
        value: TypedValue,
        timestamp: Timestamp,
    ) -> Result<Vec<Change>> {
        if let Some(ancestor) = self.leaf_ancestor(path) {
            return Err(StoreError::TypeMismatch(format!(
                "{} is a leaf, cannot write {} beneath it",
                ancestor, path
            )));
        }

        let kind = self.classify(path);
        if value.is_subtree() {
            if kind == NodeKind::Leaf {
                return Err(StoreError::TypeMismatch(format!(
                    "{} is a leaf, cannot replace it with a subtree",
                    path
                )));
            }
            return self.merge_subtree(path, value, timestamp);
        }

        if kind == NodeKind::Directory {
            return Err(StoreError::TypeMismatch(format!(
                "{} is a directory, cannot write a scalar there",
                path
            )));
        }

        if let Some(existing) = self.leaves.get(path) {
            if existing.timestamp > timestamp {
                trace!(path = %path, "write older than stored value, ignored");
                return Ok(Vec::new());
            }
        }

        self.leaves.insert(
            path.clone(),
            Entry {
                value: value.clone(),
                timestamp,
            },
        );
        Ok(vec![Change::Update {
            path: path.clone(),
            value,
            timestamp,
        }])
    }

    fn merge_subtree(
        &mut self,
        path: &Path,
        value: TypedValue,
        timestamp: Timestamp,
    ) -> Result<Vec<Change>> {
        let mut incoming = BTreeMap::new();
        if let Some(json) = value.as_json() {
            flatten(path, json, &mut incoming)?;
        }

        let mut changes = Vec::new();

        let stale: Vec<Path> = self
            .descendants(path)
            .filter(|(key, entry)| !incoming.contains_key(*key) && entry.timestamp <= timestamp)
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            self.leaves.remove(&key);
            changes.push(Change::Delete {
                path: key,
                timestamp,
            });
        }

        for (key, leaf_value) in incoming {
            if let Some(existing) = self.leaves.get(&key) {
                if existing.timestamp > timestamp {
                    continue;
                }
            } else if self.leaf_ancestor(&key).is_some() || self.descendants(&key).next().is_some()
            {
                // A fresher survivor occupies the slot with the other node kind.
                trace!(path = %key, "subtree leaf shadowed by newer data, skipped");
                continue;
            }
            self.leaves.insert(
                key.clone(),
                Entry {
                    value: leaf_value.clone(),
                    timestamp,
                },
            );
            changes.push(Change::Update {
                path: key,
                value: leaf_value,
                timestamp,
            });
        }

        Ok(changes)
    }

    /// Record everything at or under `path`. Writes and deletes at `path`
    /// never touch leaves outside that range.
    pub(crate) fn capture(&self, path: &Path) -> Undo {
        Undo {
            path: path.clone(),
            saved: self
                .descendants(path)
                .map(|(key, entry)| (key.clone(), entry.clone()))
                .collect(),
        }
    }

    /// Put a captured range back exactly as it was.
    pub(crate) fn restore(&mut self, undo: Undo) {
        let current: Vec<Path> = self
            .descendants(&undo.path)
            .map(|(key, _)| key.clone())
            .collect();
        for key in current {
            self.leaves.remove(&key);
        }
        self.leaves.extend(undo.saved);
    }

    /// Remove `path` and its descendants stamped strictly before `cutoff`.
    pub(crate) fn delete_older_than(&mut self, path: &Path, cutoff: Timestamp) -> Vec<Change> {
        let doomed: Vec<Path> = self
            .descendants(path)
            .filter(|(_, entry)| entry.timestamp < cutoff)
            .map(|(key, _)| key.clone())
            .collect();

        doomed
            .into_iter()
            .map(|key| {
                self.leaves.remove(&key);
                Change::Delete {
                    path: key,
                    timestamp: cutoff,
                }
            })
            .collect()
    }
}

/// Flatten a JSON object into absolute leaf paths.
fn flatten(base: &Path, value: &Value, out: &mut BTreeMap<Path, TypedValue>) -> Result<()> {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if key.is_empty() || key.contains('/') {
                    return Err(StoreError::InvalidPath(format!(
                        "malformed member name {:?} under {}",
                        key, base
                    )));
                }
                flatten(&base.child(key.as_str()), child, out)?;
            }
            Ok(())
        }
        scalar => {
            out.insert(base.clone(), TypedValue::json(scalar.clone()));
            Ok(())
        }
    }
}

fn insert_nested(root: &mut Map<String, Value>, segments: &[String], value: Value) {
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut cursor = root;
    for segment in parents {
        let slot = cursor
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        if !slot.is_object() {
            *slot = Value::Object(Map::new());
        }
        match slot {
            Value::Object(map) => cursor = map,
            _ => return,
        }
    }
    cursor.insert(last.clone(), value);
}
