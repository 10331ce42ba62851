//! Subscription types: control messages, responses and registry events.

use crate::notification::Notification;
use crate::status::Status;
use crate::tree::Change;
use crate::types::Path;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Delivery mode of a subscription stream.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionMode {
    /// Snapshot, sync marker, then live updates.
    Stream,
    /// Snapshot, sync marker, then the stream ends.
    Once,
    /// Snapshot and sync marker on every poll trigger.
    Poll,
}

/// One subscribed path.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    /// Path relative to the list prefix.
    pub path: Path,
    /// Minimum time between streamed updates for this path.
    /// Zero leaves the choice to the engine.
    pub coalesce_interval: Duration,
}

impl Subscription {
    pub fn new(path: impl Into<Path>) -> Self {
        Self {
            path: path.into(),
            coalesce_interval: Duration::ZERO,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.coalesce_interval = interval;
        self
    }
}

/// The first control message of a stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionList {
    pub prefix: Option<Path>,
    pub subscriptions: Vec<Subscription>,
    pub mode: SubscriptionMode,
    /// Emit a heartbeat when nothing else was sent for this long.
    pub heartbeat_interval: Option<Duration>,
    /// Accept target-defined aliases in outbound notifications.
    pub use_aliases: bool,
}

impl SubscriptionList {
    pub fn new(mode: SubscriptionMode, subscriptions: Vec<Subscription>) -> Self {
        Self {
            prefix: None,
            subscriptions,
            mode,
            heartbeat_interval: None,
            use_aliases: false,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Path>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_aliases(mut self) -> Self {
        self.use_aliases = true;
        self
    }
}

/// A client alias declaration; no path means retract.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AliasDeclaration {
    pub alias: String,
    pub path: Option<Path>,
}

/// In-band control messages sent by the client.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum SubscribeRequest {
    Subscribe(SubscriptionList),
    /// Re-snapshot now (poll mode only). A non-zero interval keeps
    /// re-polling at that rate until the next poll message.
    Poll { interval: Duration },
    /// Zero probes liveness with one immediate heartbeat; non-zero
    /// replaces the heartbeat interval.
    Heartbeat { interval: Duration },
    /// Re-snapshot the named paths, purging stale client data first.
    Resync { id: Option<u64>, paths: Vec<Path> },
    Aliases(Vec<AliasDeclaration>),
}

/// Messages emitted on a subscription stream.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SubscribeResponse {
    Update(Notification),
    /// Snapshot complete. `request_id` is 0 for the initial sync and the
    /// resync id otherwise.
    Sync { request_id: u64 },
    Heartbeat,
}

/// Dispatcher state of one session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionState {
    Init,
    Syncing,
    Streaming,
    PollWait,
    Closed,
}

/// Why a registration was dropped by the registry.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DropReason {
    /// Event buffer overflowed (slow consumer).
    BufferOverflow,
    /// Explicitly unsubscribed.
    Unsubscribed,
}

/// Events fed from the registry to a session.
#[derive(Clone, Debug, PartialEq)]
pub enum TreeEvent {
    Change(Change),
    AliasDefined { alias: String, path: Path },
    AliasRetracted { alias: String },
    Dropped { reason: DropReason },
}

/// Unique identifier for a registration (and its session).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

/// Items on a session's response channel. An `Err` is terminal.
pub type StreamItem = Result<SubscribeResponse, Status>;

/// Client side of a subscription session.
///
/// Dropping the handle ends the session and releases its registration,
/// even while the control sender stays open.
pub struct SessionHandle {
    pub id: SubscriptionId,
    /// Channel to receive responses.
    pub receiver: crossbeam_channel::Receiver<StreamItem>,
    pub(crate) state: Arc<RwLock<SessionState>>,
    /// Never sent on; the session watches for its disconnect.
    pub(crate) _cancel: crossbeam_channel::Sender<()>,
}

impl SessionHandle {
    /// Current dispatcher state.
    pub fn state(&self) -> SessionState {
        *self.state.read()
    }

    /// Receive the next response (blocking).
    pub fn recv(&self) -> Result<StreamItem, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a response (non-blocking).
    pub fn try_recv(&self) -> Result<StreamItem, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: Duration,
    ) -> Result<StreamItem, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}
