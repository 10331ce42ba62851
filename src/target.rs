//! Target: one engine instance tying all components together.

use crate::alias::{AliasOwner, AliasTable};
use crate::config::TargetConfig;
use crate::encap::EnvelopeWriter;
use crate::error::{Result, StoreError};
use crate::notification::{Notification, NotificationBuilder};
use crate::subscriptions::dispatcher::{self, SessionContext};
use crate::subscriptions::{SessionHandle, SubscribeRequest};
use crate::transaction::{SetRequest, SetResponse, TransactionEngine};
use crate::tree::TreeStore;
use crate::types::{Clock, Path, Timestamp, TypedValue, Update};
use crossbeam_channel::{bounded, Receiver};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, trace};

/// Point-in-time read.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct GetRequest {
    pub prefix: Option<Path>,
    /// Paths relative to the prefix; empty reads the prefix itself.
    pub paths: Vec<Path>,
    /// How stale a cached answer may be. Reads always hit the store.
    pub cache_interval_hint: Option<Duration>,
}

impl GetRequest {
    pub fn new<I, P>(paths: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<Path>,
    {
        Self {
            prefix: None,
            paths: paths.into_iter().map(Into::into).collect(),
            cache_interval_hint: None,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<Path>) -> Self {
        self.prefix = Some(prefix.into());
        self
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GetResponse {
    /// One notification per requested path.
    pub notifications: Vec<Notification>,
}

/// The engine behind one logical device.
///
/// Owns the tree store, the target alias namespace and the subscription
/// registry. Cloning is cheap and yields a handle to the same engine;
/// separate `Target::new` calls share nothing.
#[derive(Clone)]
pub struct Target {
    config: TargetConfig,
    clock: Arc<Clock>,
    store: Arc<TreeStore>,
    aliases: Arc<AliasTable>,
    transactions: TransactionEngine,
}

impl Target {
    pub fn new(config: TargetConfig) -> Self {
        let clock = Arc::new(Clock::new());
        let store = Arc::new(TreeStore::new(config.lock_timeout));
        let aliases = Arc::new(AliasTable::new());
        let transactions =
            TransactionEngine::new(Arc::clone(&store), Arc::clone(&aliases), Arc::clone(&clock));
        info!(originator = %config.originator, "target created");
        Self {
            config,
            clock,
            store,
            aliases,
            transactions,
        }
    }

    pub fn config(&self) -> &TargetConfig {
        &self.config
    }

    pub fn store(&self) -> &TreeStore {
        &self.store
    }

    pub fn aliases(&self) -> &AliasTable {
        &self.aliases
    }

    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    // --- Device side ---

    /// Write a value as the device, stamped by the engine clock.
    /// Read-only regions do not apply.
    pub fn publish(&self, path: impl Into<Path>, value: TypedValue) -> Result<Timestamp> {
        let path = path.into();
        let ts = self.clock.now();
        self.store.write(&path, value, ts)?;
        Ok(ts)
    }

    /// Remove a path and everything beneath it as the device.
    pub fn retract(&self, path: impl Into<Path>) -> Result<Timestamp> {
        let path = path.into();
        let ts = self.clock.now();
        self.store.delete_older_than(&path, ts)?;
        Ok(ts)
    }

    /// Reject client transactions under `path`.
    pub fn mark_read_only(&self, path: impl Into<Path>) -> Result<()> {
        self.store.mark_read_only(path.into())
    }

    /// Define a target alias and announce it to alias-aware sessions.
    pub fn define_alias(&self, alias: &str, path: impl Into<Path>) -> Result<()> {
        let path = path.into();
        self.aliases.define(AliasOwner::Target, alias, path.clone())?;
        debug!(alias, path = %path, "target alias defined");
        self.store.subscriptions().broadcast_alias_defined(alias, &path);
        Ok(())
    }

    /// Retract a target alias and announce it to alias-aware sessions.
    pub fn retract_alias(&self, alias: &str) -> Result<Path> {
        let path = self.aliases.retract(AliasOwner::Target, alias)?;
        debug!(alias, "target alias retracted");
        self.store.subscriptions().broadcast_alias_retracted(alias);
        Ok(path)
    }

    // --- Get ---

    /// Snapshot the requested paths: one notification per path, stamped
    /// with its newest leaf. Directories come back as JSON subtrees.
    pub fn get(&self, request: GetRequest) -> Result<GetResponse> {
        if let Some(hint) = request.cache_interval_hint {
            trace!(hint_ms = hint.as_millis() as u64, "cache interval hint ignored");
        }

        let prefix = match &request.prefix {
            Some(prefix) => self.aliases.expand(prefix)?,
            None => Path::root(),
        };
        let paths = if request.paths.is_empty() {
            vec![Path::root()]
        } else {
            request.paths
        };

        let builder = NotificationBuilder::new();
        let mut notifications = Vec::with_capacity(paths.len());
        for leaf in self.store.read(&prefix, &paths)? {
            let path = leaf.path.clone();
            notifications.push(builder.build(
                leaf.timestamp,
                Some(&path),
                vec![Update::new(leaf.path, leaf.value)],
                Vec::new(),
            ));
        }
        Ok(GetResponse { notifications })
    }

    // --- Set ---

    /// Apply one transaction.
    pub fn set(&self, request: SetRequest) -> SetResponse {
        self.transactions.apply(request)
    }

    /// Apply a stream of transactions, each independently, on a worker
    /// thread. The response stream ends when the request stream does.
    pub fn set_stream(&self, requests: Receiver<SetRequest>) -> Result<Receiver<SetResponse>> {
        let (out, responses) = bounded(self.config.response_buffer_size.max(1));
        let engine = self.transactions.clone();
        thread::Builder::new()
            .name("treesync-set".into())
            .spawn(move || {
                for request in requests.iter() {
                    if out.send(engine.apply(request)).is_err() {
                        break;
                    }
                }
                debug!("set stream closed");
            })
            .map_err(|e| StoreError::Internal(format!("failed to spawn set stream: {}", e)))?;
        Ok(responses)
    }

    // --- Subscribe ---

    /// Open a subscription session driven by `control`.
    ///
    /// The first control message must be a subscription list. Dropping
    /// the control sender ends the session.
    pub fn subscribe(&self, control: Receiver<SubscribeRequest>) -> Result<SessionHandle> {
        let ctx = SessionContext {
            store: Arc::clone(&self.store),
            aliases: Arc::clone(&self.aliases),
            clock: Arc::clone(&self.clock),
            config: self.config.clone(),
        };
        dispatcher::spawn(ctx, control)
    }

    /// Number of live subscription registrations.
    pub fn subscription_count(&self) -> usize {
        self.store.subscriptions().subscription_count()
    }

    // --- Encapsulation ---

    /// A writer stamping this target's originator path.
    pub fn envelope_writer(&self) -> EnvelopeWriter {
        EnvelopeWriter::new(self.config.originator.clone())
    }
}

impl Default for Target {
    fn default() -> Self {
        Self::new(TargetConfig::default())
    }
}
