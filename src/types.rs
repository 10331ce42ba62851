//! Core types for the tree engine.

use crate::error::{Result, StoreError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// First character of every alias token.
pub const ALIAS_MARKER: char = '@';

/// Nanoseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current wall-clock time.
    pub fn now() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as i64)
            .unwrap_or_default();
        Timestamp(nanos)
    }

    /// The timestamp one nanosecond earlier.
    pub fn prev(self) -> Self {
        Timestamp(self.0.saturating_sub(1))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Strictly monotonic engine clock.
///
/// Never hands out the same timestamp twice, even when the wall clock
/// stalls or steps backwards.
#[derive(Debug, Default)]
pub struct Clock {
    last: AtomicI64,
}

impl Clock {
    pub fn new() -> Self {
        Self::default()
    }

    /// A clock whose first reading is later than `last`, e.g. when
    /// resuming after timestamps that ran ahead of the wall clock.
    pub fn starting_after(last: Timestamp) -> Self {
        Self {
            last: AtomicI64::new(last.0),
        }
    }

    pub fn now(&self) -> Timestamp {
        let wall = Timestamp::now().0;
        let mut last = self.last.load(Ordering::Acquire);
        loop {
            let next = wall.max(last + 1);
            match self
                .last
                .compare_exchange_weak(last, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return Timestamp(next),
                Err(observed) => last = observed,
            }
        }
    }
}

/// Ordered sequence of path segments, e.g. `/interfaces/eth0/mtu`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Path(Vec<String>);

impl Path {
    /// The empty path.
    pub fn root() -> Self {
        Path(Vec::new())
    }

    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Path(segments.into_iter().map(Into::into).collect())
    }

    /// Parse the textual form. `""` and `"/"` are the root; empty segments
    /// are preserved so that `validate` can reject them.
    pub fn parse(s: &str) -> Self {
        let trimmed = s.strip_prefix('/').unwrap_or(s);
        if trimmed.is_empty() {
            return Path::root();
        }
        Path(trimmed.split('/').map(str::to_string).collect())
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&str> {
        self.0.first().map(String::as_str)
    }

    pub fn last(&self) -> Option<&str> {
        self.0.last().map(String::as_str)
    }

    /// True if `self` is an initial subsequence of `other` (or equal).
    pub fn is_prefix_of(&self, other: &Path) -> bool {
        other.0.len() >= self.0.len() && other.0[..self.0.len()] == self.0[..]
    }

    pub fn join(&self, other: &Path) -> Path {
        let mut segments = self.0.clone();
        segments.extend(other.0.iter().cloned());
        Path(segments)
    }

    pub fn child(&self, segment: impl Into<String>) -> Path {
        let mut segments = self.0.clone();
        segments.push(segment.into());
        Path(segments)
    }

    /// The path made of the first `n` segments.
    pub fn truncated(&self, n: usize) -> Path {
        Path(self.0[..n.min(self.0.len())].to_vec())
    }

    /// The remainder after the first `n` segments.
    pub fn skip(&self, n: usize) -> Path {
        Path(self.0[n.min(self.0.len())..].to_vec())
    }

    pub fn strip_prefix(&self, prefix: &Path) -> Option<Path> {
        if prefix.is_prefix_of(self) {
            Some(self.skip(prefix.len()))
        } else {
            None
        }
    }

    pub fn common_prefix_len(&self, other: &Path) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// True if the first segment is an alias token.
    pub fn is_aliased(&self) -> bool {
        self.first()
            .map(|s| s.starts_with(ALIAS_MARKER))
            .unwrap_or(false)
    }

    /// Check that this is a well-formed canonical tree path.
    pub fn validate(&self) -> Result<()> {
        if self.0.is_empty() {
            return Err(StoreError::InvalidPath("path is empty".into()));
        }
        if let Some(bad) = self.0.iter().find(|s| s.is_empty() || s.contains('/')) {
            return Err(StoreError::InvalidPath(format!(
                "malformed segment {:?} in {}",
                bad, self
            )));
        }
        if self.is_aliased() {
            return Err(StoreError::InvalidPath(format!(
                "{} starts with an alias token",
                self
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "/");
        }
        for segment in &self.0 {
            write!(f, "/{}", segment)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Path({})", self)
    }
}

impl From<&str> for Path {
    fn from(s: &str) -> Self {
        Path::parse(s)
    }
}

impl From<&String> for Path {
    fn from(s: &String) -> Self {
        Path::parse(s)
    }
}

/// Encoded value carried by a leaf.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Payload {
    /// Opaque bytes.
    Bytes(Vec<u8>),
    /// JSON scalar, array, or (for subtrees) object.
    Json(serde_json::Value),
}

/// A value plus an optional enumerator name.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypedValue {
    pub payload: Payload,
    pub enum_name: Option<String>,
}

impl TypedValue {
    pub fn json(value: impl Into<serde_json::Value>) -> Self {
        Self {
            payload: Payload::Json(value.into()),
            enum_name: None,
        }
    }

    pub fn bytes(data: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: Payload::Bytes(data.into()),
            enum_name: None,
        }
    }

    /// A named enumerator with its encoded value.
    pub fn enumerated(name: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        Self {
            payload: Payload::Json(value.into()),
            enum_name: Some(name.into()),
        }
    }

    /// True if this value encodes a whole subtree.
    pub fn is_subtree(&self) -> bool {
        matches!(self.payload, Payload::Json(serde_json::Value::Object(_)))
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match &self.payload {
            Payload::Json(v) => Some(v),
            Payload::Bytes(_) => None,
        }
    }

    /// JSON rendering used inside subtree encodings. Bytes become an array
    /// of numbers.
    pub fn to_json(&self) -> serde_json::Value {
        match &self.payload {
            Payload::Json(v) => v.clone(),
            Payload::Bytes(b) => serde_json::Value::Array(
                b.iter().map(|byte| serde_json::Value::from(*byte)).collect(),
            ),
        }
    }
}

/// A path/value pair, as carried by requests and notifications.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Update {
    pub path: Path,
    pub value: TypedValue,
    /// Number of earlier updates to the same path folded into this one.
    pub duplicates: u32,
}

impl Update {
    pub fn new(path: impl Into<Path>, value: TypedValue) -> Self {
        Self {
            path: path.into(),
            value,
            duplicates: 0,
        }
    }
}

/// A stored value together with its path and last-modified time.
#[derive(Clone, Debug, PartialEq)]
pub struct Leaf {
    pub path: Path,
    pub value: TypedValue,
    pub timestamp: Timestamp,
}
