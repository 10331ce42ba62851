//! Per-session subscription state machine.
//!
//! Each session runs on its own thread, multiplexing with `select!` over
//! client control messages, tree events from the registry, the handle's
//! hang-up signal and its timers (coalesce windows, heartbeats, periodic
//! polls).

use crate::alias::{AliasOwner, AliasTable};
use crate::config::TargetConfig;
use crate::error::{Result, StoreError};
use crate::notification::{Notification, NotificationBuilder};
use crate::status::Status;
use crate::tree::{Change, TreeStore};
use crate::types::{Clock, Leaf, Path, Timestamp, Update};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::coalesce::Coalescer;
use super::manager::SubscriptionManager;
use super::types::{
    AliasDeclaration, SessionHandle, SessionState, StreamItem, SubscribeRequest,
    SubscribeResponse, SubscriptionId, SubscriptionList, SubscriptionMode, TreeEvent,
};

/// Upper bound on a select wait when no timer is armed.
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Shared engine state a session reads from.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub(crate) store: Arc<TreeStore>,
    pub(crate) aliases: Arc<AliasTable>,
    pub(crate) clock: Arc<Clock>,
    pub(crate) config: TargetConfig,
}

/// Register a session and start its thread.
pub(crate) fn spawn(ctx: SessionContext, control: Receiver<SubscribeRequest>) -> Result<SessionHandle> {
    let (id, events) = ctx.store.subscriptions().subscribe(ctx.config.event_buffer_size);
    let (out, receiver) = bounded(ctx.config.response_buffer_size.max(1));
    let (cancel_tx, cancel) = bounded(0);
    let state = Arc::new(RwLock::new(SessionState::Init));

    let session = Session {
        id,
        aliases: ctx.aliases.session_view(),
        ctx: ctx.clone(),
        control,
        events,
        cancel,
        out,
        state: Arc::clone(&state),
        list: None,
        paths: Vec::new(),
        coalescer: Coalescer::new(Vec::new()),
        heartbeat: None,
        last_sent: Instant::now(),
        poll_interval: None,
        next_poll: None,
    };

    thread::Builder::new()
        .name(format!("treesync-session-{}", id.0))
        .spawn(move || session.run())
        .map_err(|e| {
            ctx.store.subscriptions().unsubscribe(id);
            StoreError::Internal(format!("failed to spawn session thread: {}", e))
        })?;

    Ok(SessionHandle {
        id,
        receiver,
        state,
        _cancel: cancel_tx,
    })
}

struct Session {
    id: SubscriptionId,
    ctx: SessionContext,
    /// Target aliases plus this session's client namespace.
    aliases: AliasTable,
    control: Receiver<SubscribeRequest>,
    events: Receiver<TreeEvent>,
    /// Disconnects when the client drops its [`SessionHandle`].
    cancel: Receiver<()>,
    out: Sender<StreamItem>,
    state: Arc<RwLock<SessionState>>,
    list: Option<SubscriptionList>,
    /// Absolute subscribed paths, alias-expanded.
    paths: Vec<Path>,
    coalescer: Coalescer,
    heartbeat: Option<Duration>,
    last_sent: Instant,
    poll_interval: Option<Duration>,
    next_poll: Option<Instant>,
}

impl Session {
    fn run(mut self) {
        info!(session = self.id.0, "subscription session opened");
        let result = self.serve();

        self.registry().unsubscribe(self.id);
        self.set_state(SessionState::Closed);

        match result {
            Ok(()) | Err(StoreError::StreamClosed) => {
                info!(session = self.id.0, "subscription session closed");
            }
            Err(e) => {
                warn!(session = self.id.0, error = %e, "subscription session failed");
                let _ = self.out.send(Err(Status::from(&e)));
            }
        }
    }

    fn serve(&mut self) -> Result<()> {
        let control = self.control.clone();
        let events = self.events.clone();
        let cancel = self.cancel.clone();
        loop {
            if self.state() == SessionState::Closed {
                return Ok(());
            }
            let wait = self.next_wake().map_or(IDLE_WAIT, |at| {
                at.saturating_duration_since(Instant::now()).min(IDLE_WAIT)
            });

            select! {
                recv(control) -> msg => match msg {
                    Ok(request) => self.handle(request)?,
                    Err(_) => {
                        debug!(session = self.id.0, "control channel closed");
                        return Ok(());
                    }
                },
                recv(events) -> event => match event {
                    Ok(event) => self.on_event(event)?,
                    Err(_) => {
                        return Err(StoreError::ResourceExhausted(
                            "subscription dropped by the registry".into(),
                        ))
                    }
                },
                recv(cancel) -> _ => {
                    debug!(session = self.id.0, "session handle dropped");
                    return Ok(());
                },
                default(wait) => {}
            }

            self.on_timers()?;
        }
    }

    // --- Control messages ---

    fn handle(&mut self, request: SubscribeRequest) -> Result<()> {
        debug!(session = self.id.0, state = ?self.state(), request = ?request, "control message");
        match request {
            SubscribeRequest::Subscribe(list) => self.on_subscribe(list),
            SubscribeRequest::Poll { interval } => self.on_poll(interval),
            SubscribeRequest::Heartbeat { interval } => self.on_heartbeat(interval),
            SubscribeRequest::Resync { id, paths } => self.on_resync(id, paths),
            SubscribeRequest::Aliases(declarations) => self.on_aliases(declarations),
        }
    }

    fn on_subscribe(&mut self, list: SubscriptionList) -> Result<()> {
        if self.list.is_some() {
            return Err(StoreError::InvalidArgument(
                "subscription list already received on this stream".into(),
            ));
        }
        if list.subscriptions.is_empty() && list.prefix.is_none() {
            return Err(StoreError::InvalidArgument(
                "subscription list names no paths and no prefix".into(),
            ));
        }

        let prefix = list.prefix.clone().unwrap_or_default();
        let default_interval = self.ctx.config.default_coalesce_interval;
        let requested: Vec<(Path, Duration)> = if list.subscriptions.is_empty() {
            vec![(prefix.clone(), default_interval)]
        } else {
            list.subscriptions
                .iter()
                .map(|s| {
                    let interval = if s.coalesce_interval.is_zero() {
                        default_interval
                    } else {
                        s.coalesce_interval
                    };
                    (prefix.join(&s.path), interval)
                })
                .collect()
        };

        let mut windows = Vec::with_capacity(requested.len());
        for (raw, interval) in requested {
            let path = self.aliases.expand(&raw)?;
            path.validate()?;
            windows.push((path, interval));
        }

        self.paths = windows.iter().map(|(p, _)| p.clone()).collect();
        self.coalescer = Coalescer::new(windows);
        self.heartbeat = list.heartbeat_interval.filter(|i| !i.is_zero());
        let mode = list.mode;
        let use_aliases = list.use_aliases;
        self.list = Some(list);

        info!(session = self.id.0, mode = ?mode, paths = self.paths.len(), "subscription started");

        // Register before reading so nothing committed after the snapshot
        // is missed.
        if !self.registry().configure(self.id, self.paths.clone(), use_aliases) {
            return Err(StoreError::ResourceExhausted(
                "subscription dropped before snapshot".into(),
            ));
        }

        self.set_state(SessionState::Syncing);
        if use_aliases {
            let now = self.ctx.clock.now();
            for (alias, path) in self.ctx.aliases.target_aliases() {
                self.emit(SubscribeResponse::Update(Notification::alias_definition(
                    now, path, alias,
                )))?;
            }
        }
        let seen = self.snapshot()?;

        match mode {
            SubscriptionMode::Stream => {
                self.set_state(SessionState::Streaming);
                self.emit(SubscribeResponse::Sync { request_id: 0 })?;
                self.absorb_queued(&seen)?;
            }
            SubscriptionMode::Once => {
                self.emit(SubscribeResponse::Sync { request_id: 0 })?;
                self.set_state(SessionState::Closed);
            }
            SubscriptionMode::Poll => {
                self.registry().set_active(self.id, false);
                self.set_state(SessionState::PollWait);
                self.emit(SubscribeResponse::Sync { request_id: 0 })?;
                self.absorb_queued(&seen)?;
            }
        }
        Ok(())
    }

    fn on_poll(&mut self, interval: Duration) -> Result<()> {
        let polling = matches!(&self.list, Some(list) if list.mode == SubscriptionMode::Poll);
        if !polling {
            return Err(StoreError::InvalidArgument(
                "poll received outside a poll-mode subscription".into(),
            ));
        }

        self.poll()?;
        self.poll_interval = Some(interval).filter(|i| !i.is_zero());
        self.next_poll = self.poll_interval.map(|i| Instant::now() + i);
        Ok(())
    }

    fn poll(&mut self) -> Result<()> {
        self.set_state(SessionState::Syncing);
        self.snapshot()?;
        self.set_state(SessionState::PollWait);
        self.emit(SubscribeResponse::Sync { request_id: 0 })
    }

    fn on_heartbeat(&mut self, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return self.emit(SubscribeResponse::Heartbeat);
        }
        self.heartbeat = Some(interval);
        self.last_sent = Instant::now();
        Ok(())
    }

    fn on_resync(&mut self, id: Option<u64>, paths: Vec<Path>) -> Result<()> {
        let Some(request_id) = id else {
            return Err(StoreError::InvalidArgument("resync without request id".into()));
        };

        let targets = if paths.is_empty() {
            self.paths.clone()
        } else {
            let prefix = self
                .list
                .as_ref()
                .and_then(|l| l.prefix.clone())
                .unwrap_or_default();
            let mut resolved = Vec::with_capacity(paths.len());
            for path in &paths {
                let absolute = self.aliases.expand(&prefix.join(path))?;
                absolute.validate()?;
                resolved.push(absolute);
            }
            resolved
        };

        for path in &targets {
            let leaves = self.scan(path)?;
            let ts = self.ctx.clock.now();
            let purge = self.builder().build(ts.prev(), None, Vec::new(), vec![path.clone()]);
            self.emit(SubscribeResponse::Update(purge))?;
            if !leaves.is_empty() {
                let updates = leaves
                    .into_iter()
                    .map(|leaf| Update::new(leaf.path, leaf.value))
                    .collect();
                let notification = self.builder().build(ts, Some(path), updates, Vec::new());
                self.emit(SubscribeResponse::Update(notification))?;
            }
        }
        self.emit(SubscribeResponse::Sync { request_id })
    }

    fn on_aliases(&mut self, declarations: Vec<AliasDeclaration>) -> Result<()> {
        for declaration in declarations {
            match declaration.path {
                Some(path) => {
                    let canonical = self.aliases.expand(&path)?;
                    self.aliases
                        .define(AliasOwner::Client, &declaration.alias, canonical)?;
                }
                None => {
                    // Retracting an alias the session never declared is harmless.
                    if self
                        .aliases
                        .retract(AliasOwner::Client, &declaration.alias)
                        .is_err()
                    {
                        debug!(session = self.id.0, alias = %declaration.alias, "retract of unknown client alias");
                    }
                }
            }
        }
        Ok(())
    }

    // --- Tree events ---

    fn on_event(&mut self, event: TreeEvent) -> Result<()> {
        match event {
            TreeEvent::Change(change) => {
                if self.state() == SessionState::Streaming {
                    self.coalescer.push(change);
                }
                Ok(())
            }
            TreeEvent::AliasDefined { alias, path } => {
                if !self.use_aliases() {
                    return Ok(());
                }
                let now = self.ctx.clock.now();
                self.emit(SubscribeResponse::Update(Notification::alias_definition(
                    now, path, alias,
                )))
            }
            TreeEvent::AliasRetracted { alias } => {
                if !self.use_aliases() {
                    return Ok(());
                }
                let now = self.ctx.clock.now();
                self.emit(SubscribeResponse::Update(Notification::alias_retraction(
                    now, alias,
                )))
            }
            TreeEvent::Dropped { reason } => Err(StoreError::ResourceExhausted(format!(
                "subscription dropped: {:?}",
                reason
            ))),
        }
    }

    /// Process events queued while the snapshot was taken, skipping
    /// changes the snapshot already reflected.
    fn absorb_queued(&mut self, seen: &HashMap<Path, Timestamp>) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            if let TreeEvent::Change(change) = &event {
                let stale = seen
                    .get(change.path())
                    .is_some_and(|ts| *ts >= change.timestamp());
                if stale {
                    continue;
                }
            }
            self.on_event(event)?;
        }
        Ok(())
    }

    // --- Timers ---

    fn next_wake(&self) -> Option<Instant> {
        let coalesce = match self.state() {
            SessionState::Streaming => self.coalescer.next_deadline(),
            _ => None,
        };
        let poll = match self.state() {
            SessionState::PollWait => self.next_poll,
            _ => None,
        };
        let heartbeat = self.heartbeat.map(|i| self.last_sent + i);
        [coalesce, poll, heartbeat].into_iter().flatten().min()
    }

    fn on_timers(&mut self) -> Result<()> {
        let now = Instant::now();
        match self.state() {
            SessionState::Streaming => self.flush(now)?,
            SessionState::PollWait => {
                if let (Some(at), Some(interval)) = (self.next_poll, self.poll_interval) {
                    if at <= now {
                        self.poll()?;
                        self.next_poll = Some(now + interval);
                    }
                }
            }
            _ => {}
        }
        if let Some(interval) = self.heartbeat {
            if self.last_sent + interval <= now && self.state() != SessionState::Closed {
                self.emit(SubscribeResponse::Heartbeat)?;
            }
        }
        Ok(())
    }

    /// Emit coalesced changes, one notification per timestamp.
    fn flush(&mut self, now: Instant) -> Result<()> {
        let changes = self.coalescer.due(now);
        if changes.is_empty() {
            return Ok(());
        }

        let mut batches: BTreeMap<Timestamp, (Vec<Update>, Vec<Path>)> = BTreeMap::new();
        for change in changes {
            match change {
                Change::Update {
                    path,
                    value,
                    timestamp,
                } => batches
                    .entry(timestamp)
                    .or_default()
                    .0
                    .push(Update::new(path, value)),
                Change::Delete { path, timestamp } => {
                    batches.entry(timestamp).or_default().1.push(path)
                }
            }
        }

        for (timestamp, (updates, deletes)) in batches {
            let notification = self.builder().build(timestamp, None, updates, deletes);
            self.emit(SubscribeResponse::Update(notification))?;
        }
        Ok(())
    }

    // --- Snapshots ---

    /// Send one notification per subscribed path holding data. Returns
    /// the timestamp of every leaf sent.
    fn snapshot(&mut self) -> Result<HashMap<Path, Timestamp>> {
        let mut seen = HashMap::new();
        for path in self.paths.clone() {
            let leaves = self.scan(&path)?;
            let Some(newest) = leaves.iter().map(|l| l.timestamp).max() else {
                continue;
            };
            let mut updates = Vec::with_capacity(leaves.len());
            for leaf in leaves {
                seen.insert(leaf.path.clone(), leaf.timestamp);
                updates.push(Update::new(leaf.path, leaf.value));
            }
            let notification = self.builder().build(newest, Some(&path), updates, Vec::new());
            self.emit(SubscribeResponse::Update(notification))?;
        }
        Ok(seen)
    }

    fn scan(&self, path: &Path) -> Result<Vec<Leaf>> {
        with_retry(self.ctx.config.snapshot_retries, || self.ctx.store.scan(path))
    }

    // --- Helpers ---

    fn emit(&mut self, response: SubscribeResponse) -> Result<()> {
        self.out
            .send(Ok(response))
            .map_err(|_| StoreError::StreamClosed)?;
        self.last_sent = Instant::now();
        Ok(())
    }

    fn builder(&self) -> NotificationBuilder<'_> {
        NotificationBuilder::new().with_aliases(&self.aliases, self.use_aliases())
    }

    fn use_aliases(&self) -> bool {
        self.list.as_ref().is_some_and(|l| l.use_aliases)
    }

    fn registry(&self) -> &SubscriptionManager {
        self.ctx.store.subscriptions()
    }

    fn state(&self) -> SessionState {
        *self.state.read()
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.write();
        if *state != next {
            debug!(session = self.id.0, from = ?*state, to = ?next, "session state");
            *state = next;
        }
    }
}

/// Run `op`, retrying up to `retries` times while it fails transiently.
fn with_retry<T>(retries: u32, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut attempt = 0;
    loop {
        match op() {
            Err(e) if e.is_transient() && attempt < retries => {
                attempt += 1;
                warn!(attempt, error = %e, "transient store error, retrying");
            }
            other => return other,
        }
    }
}
