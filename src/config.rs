//! Engine configuration.

use crate::types::Path;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for a [`Target`](crate::Target).
///
/// Durations are (de)serialized as whole milliseconds so the struct can be
/// loaded from a plain JSON file.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetConfig {
    /// Per-session bound on queued tree events. A session that falls this
    /// far behind is dropped.
    pub event_buffer_size: usize,
    /// Per-session bound on responses waiting to be received.
    pub response_buffer_size: usize,
    /// Coalesce period used when a subscription asks for interval 0.
    #[serde(with = "millis")]
    pub default_coalesce_interval: Duration,
    /// How long a writer waits for an overlapping path range.
    #[serde(with = "millis")]
    pub lock_timeout: Duration,
    /// Retries of a transient store error during a snapshot.
    pub snapshot_retries: u32,
    /// Originator path stamped on envelopes.
    pub originator: Path,
}

impl Default for TargetConfig {
    fn default() -> Self {
        Self {
            event_buffer_size: 1000,
            response_buffer_size: 256,
            default_coalesce_interval: Duration::ZERO,
            lock_timeout: Duration::from_millis(500),
            snapshot_retries: 1,
            originator: Path::parse("/target"),
        }
    }
}

impl TargetConfig {
    pub fn with_event_buffer_size(mut self, size: usize) -> Self {
        self.event_buffer_size = size;
        self
    }

    pub fn with_response_buffer_size(mut self, size: usize) -> Self {
        self.response_buffer_size = size;
        self
    }

    pub fn with_default_coalesce_interval(mut self, interval: Duration) -> Self {
        self.default_coalesce_interval = interval;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_snapshot_retries(mut self, retries: u32) -> Self {
        self.snapshot_retries = retries;
        self
    }

    pub fn with_originator(mut self, originator: impl Into<Path>) -> Self {
        self.originator = originator.into();
        self
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}
