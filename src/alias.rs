//! Alias table: short tokens standing in for path prefixes.
//!
//! Two namespaces exist side by side. Target aliases are defined by the
//! engine and shared by every session of a [`Target`](crate::Target);
//! client aliases are declared in-band by one subscriber and live only in
//! that session's view. When both namespaces claim a token, the target
//! definition wins.

use crate::error::{Result, StoreError};
use crate::types::{Path, ALIAS_MARKER};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Who defined an alias.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AliasOwner {
    Target,
    Client,
}

/// One-to-one token/path mapping.
#[derive(Debug, Default)]
struct Namespace {
    by_alias: HashMap<String, Path>,
    by_path: HashMap<Path, String>,
}

impl Namespace {
    fn insert(&mut self, alias: String, path: Path) {
        if let Some(old_path) = self.by_alias.remove(&alias) {
            self.by_path.remove(&old_path);
        }
        if let Some(old_alias) = self.by_path.remove(&path) {
            self.by_alias.remove(&old_alias);
        }
        self.by_path.insert(path.clone(), alias.clone());
        self.by_alias.insert(alias, path);
    }

    fn remove(&mut self, alias: &str) -> Option<Path> {
        let path = self.by_alias.remove(alias)?;
        self.by_path.remove(&path);
        Some(path)
    }
}

/// Bidirectional alias mapping with target and client namespaces.
#[derive(Debug, Default)]
pub struct AliasTable {
    target: Arc<RwLock<Namespace>>,
    client: RwLock<Namespace>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table sharing this table's target namespace, with an empty
    /// client namespace of its own.
    pub fn session_view(&self) -> Self {
        Self {
            target: Arc::clone(&self.target),
            client: RwLock::new(Namespace::default()),
        }
    }

    /// Define (or redefine) `alias` as a stand-in for `canonical`.
    pub fn define(&self, owner: AliasOwner, alias: &str, canonical: Path) -> Result<()> {
        validate_token(owner, alias)?;
        canonical.validate()?;
        self.namespace(owner).write().insert(alias.to_string(), canonical);
        Ok(())
    }

    /// Remove `alias`, returning the path it stood for.
    pub fn retract(&self, owner: AliasOwner, alias: &str) -> Result<Path> {
        self.namespace(owner)
            .write()
            .remove(alias)
            .ok_or_else(|| StoreError::UnknownAlias(alias.to_string()))
    }

    /// Canonical path of `alias`, target namespace first.
    pub fn resolve(&self, alias: &str) -> Result<Path> {
        if let Some(path) = self.target.read().by_alias.get(alias) {
            return Ok(path.clone());
        }
        self.client
            .read()
            .by_alias
            .get(alias)
            .cloned()
            .ok_or_else(|| StoreError::UnknownAlias(alias.to_string()))
    }

    /// Expand a possibly aliased path.
    ///
    /// Only the first segment is looked up; the rest is appended verbatim
    /// to the resolved path.
    pub fn expand(&self, path: &Path) -> Result<Path> {
        match path.first() {
            Some(first) if first.starts_with(ALIAS_MARKER) => {
                Ok(self.resolve(first)?.join(&path.skip(1)))
            }
            _ => Ok(path.clone()),
        }
    }

    /// Longest aliased ancestor of `path` (itself included).
    ///
    /// Returns the token and the number of segments it covers. Client
    /// aliases are always eligible; target aliases only with
    /// `include_target`.
    pub fn alias_for(&self, path: &Path, include_target: bool) -> Option<(String, usize)> {
        let target = self.target.read();
        let client = self.client.read();
        (1..=path.len()).rev().find_map(|n| {
            let ancestor = path.truncated(n);
            let hit = if include_target {
                target.by_path.get(&ancestor)
            } else {
                None
            };
            hit.or_else(|| client.by_path.get(&ancestor))
                .map(|alias| (alias.clone(), n))
        })
    }

    /// Replace the longest aliased ancestor of `path` by its token.
    pub fn substitute(&self, path: &Path, include_target: bool) -> Path {
        match self.alias_for(path, include_target) {
            Some((alias, covered)) => Path::new([alias]).join(&path.skip(covered)),
            None => path.clone(),
        }
    }

    /// All target definitions.
    pub fn target_aliases(&self) -> Vec<(String, Path)> {
        let mut aliases: Vec<(String, Path)> = self
            .target
            .read()
            .by_alias
            .iter()
            .map(|(a, p)| (a.clone(), p.clone()))
            .collect();
        aliases.sort();
        aliases
    }

    pub fn len(&self, owner: AliasOwner) -> usize {
        self.namespace(owner).read().by_alias.len()
    }

    fn namespace(&self, owner: AliasOwner) -> &RwLock<Namespace> {
        match owner {
            AliasOwner::Target => &*self.target,
            AliasOwner::Client => &self.client,
        }
    }
}

fn validate_token(owner: AliasOwner, alias: &str) -> Result<()> {
    if !alias.starts_with(ALIAS_MARKER) || alias.len() == ALIAS_MARKER.len_utf8() {
        return Err(StoreError::InvalidArgument(format!(
            "alias {:?} must be '{}' followed by a name",
            alias, ALIAS_MARKER
        )));
    }
    // Tokens occupy one path segment, whichever namespace owns them.
    if alias.contains('/') {
        return Err(StoreError::InvalidArgument(format!(
            "{:?} alias {:?} must be a single segment",
            owner, alias
        )));
    }
    Ok(())
}
