//! Subscription registry for broadcasting tree events.

use crate::tree::Change;
use crate::types::Path;
use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

use super::types::{DropReason, SubscriptionId, TreeEvent};

/// Internal registration state.
struct Registration {
    paths: Vec<Path>,
    sender: Sender<TreeEvent>,
    /// Poll-mode sessions park their registration between polls.
    active: bool,
    wants_aliases: bool,
}

impl Registration {
    /// Try to send an event. Returns false if the buffer is full or the
    /// session is gone; either way the registration is dropped.
    fn try_send(&self, event: TreeEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(crossbeam_channel::TrySendError::Full(_)) => false,
            Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
        }
    }

    /// Check if a change falls under one of the subscribed paths.
    fn matches(&self, change: &Change) -> bool {
        self.active && self.paths.iter().any(|p| p.is_prefix_of(change.path()))
    }
}

/// Tracks live subscriptions and fans tree events out to them.
pub struct SubscriptionManager {
    /// Registrations by ID.
    registrations: RwLock<HashMap<SubscriptionId, Registration>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
}

impl SubscriptionManager {
    /// Create a new subscription manager.
    pub fn new() -> Self {
        Self {
            registrations: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Create an inactive registration with a bounded event buffer.
    ///
    /// Nothing is delivered until [`SubscriptionManager::configure`] names
    /// the paths of interest.
    pub fn subscribe(&self, buffer_size: usize) -> (SubscriptionId, Receiver<TreeEvent>) {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(buffer_size.max(1));

        let registration = Registration {
            paths: Vec::new(),
            sender,
            active: false,
            wants_aliases: false,
        };
        self.registrations.write().insert(id, registration);

        (id, receiver)
    }

    /// Set the subscribed paths and start delivering matching changes.
    /// Returns false if the registration was already dropped.
    pub fn configure(&self, id: SubscriptionId, paths: Vec<Path>, wants_aliases: bool) -> bool {
        let mut regs = self.registrations.write();
        match regs.get_mut(&id) {
            Some(reg) => {
                debug!(subscription = id.0, paths = paths.len(), "subscription configured");
                reg.paths = paths;
                reg.wants_aliases = wants_aliases;
                reg.active = true;
                true
            }
            None => false,
        }
    }

    /// Pause or resume change delivery. Alias events are unaffected.
    pub fn set_active(&self, id: SubscriptionId, active: bool) -> bool {
        match self.registrations.write().get_mut(&id) {
            Some(reg) => {
                reg.active = active;
                true
            }
            None => false,
        }
    }

    /// Unsubscribe and clean up.
    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut regs = self.registrations.write();
        if let Some(reg) = regs.remove(&id) {
            // Best effort; the session may already be gone.
            let _ = reg.sender.try_send(TreeEvent::Dropped {
                reason: DropReason::Unsubscribed,
            });
        }
    }

    pub fn is_registered(&self, id: SubscriptionId) -> bool {
        self.registrations.read().contains_key(&id)
    }

    /// Get subscription count.
    pub fn subscription_count(&self) -> usize {
        self.registrations.read().len()
    }

    // --- Broadcasting ---

    /// Deliver each change to every active registration whose paths
    /// cover it, preserving the order of `changes`.
    pub fn broadcast_changes(&self, changes: &[Change]) {
        let mut to_remove = Vec::new();

        {
            let regs = self.registrations.read();
            for (id, reg) in regs.iter() {
                let delivered = changes
                    .iter()
                    .filter(|change| reg.matches(change))
                    .all(|change| reg.try_send(TreeEvent::Change(change.clone())));
                if !delivered {
                    to_remove.push(*id);
                }
            }
        }

        self.drop_overflowed(to_remove);
    }

    /// Announce a new target alias to sessions that accept aliases.
    pub fn broadcast_alias_defined(&self, alias: &str, path: &Path) {
        let event = TreeEvent::AliasDefined {
            alias: alias.to_string(),
            path: path.clone(),
        };
        self.broadcast(|reg| reg.wants_aliases, event);
    }

    /// Announce a retracted target alias to sessions that accept aliases.
    pub fn broadcast_alias_retracted(&self, alias: &str) {
        let event = TreeEvent::AliasRetracted {
            alias: alias.to_string(),
        };
        self.broadcast(|reg| reg.wants_aliases, event);
    }

    /// Internal broadcast helper. Drops registrations that fail to receive.
    fn broadcast<F>(&self, filter: F, event: TreeEvent)
    where
        F: Fn(&Registration) -> bool,
    {
        let mut to_remove = Vec::new();

        {
            let regs = self.registrations.read();
            for (id, reg) in regs.iter() {
                if filter(reg) && !reg.try_send(event.clone()) {
                    to_remove.push(*id);
                }
            }
        }

        self.drop_overflowed(to_remove);
    }

    fn drop_overflowed(&self, ids: Vec<SubscriptionId>) {
        if ids.is_empty() {
            return;
        }
        let mut regs = self.registrations.write();
        for id in ids {
            if let Some(reg) = regs.remove(&id) {
                warn!(subscription = id.0, "dropping slow subscriber");
                // Might fail on a full buffer; the session also notices the
                // disconnected channel.
                let _ = reg.sender.try_send(TreeEvent::Dropped {
                    reason: DropReason::BufferOverflow,
                });
            }
        }
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Timestamp, TypedValue};
    use std::time::Duration;

    fn update(path: &str, v: i64) -> Change {
        Change::Update {
            path: Path::parse(path),
            value: TypedValue::json(v),
            timestamp: Timestamp(v),
        }
    }

    #[test]
    fn test_subscribe_unsubscribe() {
        let manager = SubscriptionManager::new();

        let (id, receiver) = manager.subscribe(16);
        assert_eq!(manager.subscription_count(), 1);

        manager.unsubscribe(id);
        assert_eq!(manager.subscription_count(), 0);
        assert!(matches!(
            receiver.recv_timeout(Duration::from_millis(100)),
            Ok(TreeEvent::Dropped {
                reason: DropReason::Unsubscribed
            })
        ));
    }

    #[test]
    fn test_broadcast_to_matching() {
        let manager = SubscriptionManager::new();
        let (id, receiver) = manager.subscribe(16);
        manager.configure(id, vec![Path::parse("/if")], false);

        manager.broadcast_changes(&[update("/if/eth0/mtu", 1), update("/sys/name", 2)]);

        let event = receiver.recv_timeout(Duration::from_millis(100)).unwrap();
        match event {
            TreeEvent::Change(change) => assert_eq!(change.path(), &Path::parse("/if/eth0/mtu")),
            other => panic!("Expected change event, got {:?}", other),
        }
        assert!(receiver.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_inactive_doesnt_receive() {
        let manager = SubscriptionManager::new();
        let (id, receiver) = manager.subscribe(16);

        // Not yet configured
        manager.broadcast_changes(&[update("/a", 1)]);
        assert!(receiver.try_recv().is_err());

        manager.configure(id, vec![Path::parse("/a")], false);
        manager.set_active(id, false);
        manager.broadcast_changes(&[update("/a", 2)]);
        assert!(receiver.try_recv().is_err());

        manager.set_active(id, true);
        manager.broadcast_changes(&[update("/a", 3)]);
        assert!(receiver.try_recv().is_ok());
    }

    #[test]
    fn test_drop_slow_subscriber() {
        let manager = SubscriptionManager::new();
        let (id, _receiver) = manager.subscribe(2);
        manager.configure(id, vec![Path::parse("/a")], false);

        for i in 0..10 {
            manager.broadcast_changes(&[update("/a/x", i)]);
        }

        assert_eq!(manager.subscription_count(), 0);
        assert!(!manager.is_registered(id));
    }

    #[test]
    fn test_alias_events_only_for_alias_sessions() {
        let manager = SubscriptionManager::new();
        let (plain, plain_rx) = manager.subscribe(16);
        let (aliased, aliased_rx) = manager.subscribe(16);
        manager.configure(plain, vec![Path::parse("/a")], false);
        manager.configure(aliased, vec![Path::parse("/a")], true);

        manager.broadcast_alias_defined("@a", &Path::parse("/a"));
        manager.broadcast_alias_retracted("@a");

        assert!(plain_rx.try_recv().is_err());
        assert!(matches!(
            aliased_rx.try_recv(),
            Ok(TreeEvent::AliasDefined { .. })
        ));
        assert!(matches!(
            aliased_rx.try_recv(),
            Ok(TreeEvent::AliasRetracted { .. })
        ));
    }
}
