//! Per-subscription coalescing windows.

use crate::tree::Change;
use crate::types::Path;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

struct Slot {
    path: Path,
    interval: Duration,
    /// Latest change per leaf since the last flush.
    pending: BTreeMap<Path, Change>,
    last_flush: Option<Instant>,
}

impl Slot {
    fn ready_at(&self) -> Option<Instant> {
        if self.pending.is_empty() {
            return None;
        }
        Some(match self.last_flush {
            Some(at) => at + self.interval,
            // Nothing sent yet: the first change goes out right away.
            None => Instant::now(),
        })
    }
}

/// Holds back streamed changes so that no subscribed path emits faster
/// than its interval. A change arriving after a quiet period is released
/// immediately; changes within the window collapse per leaf.
pub(crate) struct Coalescer {
    slots: Vec<Slot>,
}

impl Coalescer {
    pub(crate) fn new(subscriptions: impl IntoIterator<Item = (Path, Duration)>) -> Self {
        Self {
            slots: subscriptions
                .into_iter()
                .map(|(path, interval)| Slot {
                    path,
                    interval,
                    pending: BTreeMap::new(),
                    last_flush: None,
                })
                .collect(),
        }
    }

    /// Index of the most specific subscription covering `path`.
    fn route(&self, path: &Path) -> Option<usize> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.path.is_prefix_of(path))
            .max_by_key(|(_, slot)| slot.path.len())
            .map(|(i, _)| i)
    }

    /// Queue a change. Returns false if no subscription covers it.
    pub(crate) fn push(&mut self, change: Change) -> bool {
        match self.route(change.path()) {
            Some(i) => {
                self.slots[i].pending.insert(change.path().clone(), change);
                true
            }
            None => false,
        }
    }

    /// Drain every slot whose window has elapsed at `now`.
    pub(crate) fn due(&mut self, now: Instant) -> Vec<Change> {
        let mut out = Vec::new();
        for slot in &mut self.slots {
            let ready = matches!(slot.ready_at(), Some(at) if at <= now)
                || (!slot.pending.is_empty() && slot.last_flush.is_none());
            if ready {
                out.extend(std::mem::take(&mut slot.pending).into_values());
                slot.last_flush = Some(now);
            }
        }
        out
    }

    /// Earliest instant at which [`Coalescer::due`] will release something.
    pub(crate) fn next_deadline(&self) -> Option<Instant> {
        self.slots.iter().filter_map(Slot::ready_at).min()
    }

    #[cfg(test)]
    fn pending(&self) -> usize {
        self.slots.iter().map(|s| s.pending.len()).sum()
    }
}
