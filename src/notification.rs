//! Prefix-compressed notifications.
//!
//! A notification carries one prefix and a batch of updates and deletes
//! expressed relative to it. The same shape doubles as an alias
//! definition (prefix + alias, no data) and an alias retraction (alias
//! only).

use crate::alias::AliasTable;
use crate::error::Result;
use crate::types::{Path, Timestamp, Update};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A batch of changes sharing one timestamp and prefix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub timestamp: Timestamp,
    pub prefix: Option<Path>,
    pub alias: Option<String>,
    pub update: Vec<Update>,
    pub delete: Vec<Path>,
}

/// What a [`Notification`] means.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NotificationKind {
    Data,
    AliasDefinition,
    AliasRetraction,
}

impl Notification {
    /// Announce that `alias` now stands for `prefix`.
    pub fn alias_definition(timestamp: Timestamp, prefix: Path, alias: impl Into<String>) -> Self {
        Self {
            timestamp,
            prefix: Some(prefix),
            alias: Some(alias.into()),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }

    /// Announce that `alias` is no longer defined.
    pub fn alias_retraction(timestamp: Timestamp, alias: impl Into<String>) -> Self {
        Self {
            timestamp,
            prefix: None,
            alias: Some(alias.into()),
            update: Vec::new(),
            delete: Vec::new(),
        }
    }

    pub fn kind(&self) -> NotificationKind {
        match (&self.alias, &self.prefix) {
            (Some(_), Some(_)) => NotificationKind::AliasDefinition,
            (Some(_), None) => NotificationKind::AliasRetraction,
            _ => NotificationKind::Data,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.update.is_empty() && self.delete.is_empty()
    }

    /// Prefix with any alias token expanded.
    pub fn resolved_prefix(&self, aliases: Option<&AliasTable>) -> Result<Path> {
        let prefix = self.prefix.clone().unwrap_or_default();
        match aliases {
            Some(table) => table.expand(&prefix),
            None => Ok(prefix),
        }
    }

    /// Updates with full paths.
    pub fn absolute_updates(&self, aliases: Option<&AliasTable>) -> Result<Vec<Update>> {
        let prefix = self.resolved_prefix(aliases)?;
        Ok(self
            .update
            .iter()
            .map(|u| Update {
                path: prefix.join(&u.path),
                value: u.value.clone(),
                duplicates: u.duplicates,
            })
            .collect())
    }

    /// Deletes with full paths.
    pub fn absolute_deletes(&self, aliases: Option<&AliasTable>) -> Result<Vec<Path>> {
        let prefix = self.resolved_prefix(aliases)?;
        Ok(self.delete.iter().map(|d| prefix.join(d)).collect())
    }
}

/// Builds prefix-compressed notifications, optionally substituting aliases.
#[derive(Clone, Copy, Default)]
pub struct NotificationBuilder<'a> {
    aliases: Option<&'a AliasTable>,
    include_target_aliases: bool,
}

impl<'a> NotificationBuilder<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Substitute the prefix by its longest aliased ancestor. Target
    /// aliases are used only when the receiver accepted them.
    pub fn with_aliases(mut self, table: &'a AliasTable, include_target: bool) -> Self {
        self.aliases = Some(table);
        self.include_target_aliases = include_target;
        self
    }

    /// Build a notification from absolute update and delete paths.
    ///
    /// The emitted prefix is the longest common prefix of `prefix` (when
    /// given) and every path, shortened so that each relative path keeps
    /// at least one segment. Repeated update paths collapse to the last
    /// one, whose `duplicates` counter records how many were folded.
    pub fn build(
        &self,
        timestamp: Timestamp,
        prefix: Option<&Path>,
        updates: Vec<Update>,
        deletes: Vec<Path>,
    ) -> Notification {
        let updates = dedup_updates(updates);

        let mut involved = updates.iter().map(|u| &u.path).chain(deletes.iter());
        let first = prefix.or_else(|| involved.next());
        let Some(first) = first else {
            return Notification {
                timestamp,
                prefix: None,
                alias: None,
                update: updates,
                delete: deletes,
            };
        };

        let mut common = first.len();
        let mut shortest: Option<usize> = None;
        for path in updates.iter().map(|u| &u.path).chain(deletes.iter()) {
            common = common.min(first.common_prefix_len(path));
            shortest = Some(shortest.map_or(path.len(), |s| s.min(path.len())));
        }
        if let Some(shortest) = shortest {
            common = common.min(shortest.saturating_sub(1));
        }

        let base = first.truncated(common);
        let update = updates
            .into_iter()
            .map(|u| Update {
                path: u.path.skip(common),
                value: u.value,
                duplicates: u.duplicates,
            })
            .collect();
        let delete = deletes.into_iter().map(|d| d.skip(common)).collect();

        let prefix = if base.is_root() {
            None
        } else {
            Some(match self.aliases {
                Some(table) => table.substitute(&base, self.include_target_aliases),
                None => base,
            })
        };

        Notification {
            timestamp,
            prefix,
            alias: None,
            update,
            delete,
        }
    }
}

/// Build without alias substitution.
pub fn build(
    timestamp: Timestamp,
    prefix: Option<&Path>,
    updates: Vec<Update>,
    deletes: Vec<Path>,
) -> Notification {
    NotificationBuilder::new().build(timestamp, prefix, updates, deletes)
}

fn dedup_updates(updates: Vec<Update>) -> Vec<Update> {
    let mut positions: HashMap<Path, usize> = HashMap::new();
    let mut out: Vec<Update> = Vec::with_capacity(updates.len());
    for update in updates {
        match positions.get(&update.path) {
            Some(&i) => {
                let folded = out[i].duplicates + 1;
                out[i] = Update {
                    duplicates: folded + update.duplicates,
                    ..update
                };
            }
            None => {
                positions.insert(update.path.clone(), out.len());
                out.push(update);
            }
        }
    }
    out
}
