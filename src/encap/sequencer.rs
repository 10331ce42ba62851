//! Sequence numbering and gap detection.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Hands out 1, 2, 3, ... one per outgoing batch.
#[derive(Debug)]
pub struct Sequencer {
    next: AtomicU64,
}

impl Sequencer {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    pub fn next(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The value the next call to [`Sequencer::next`] will return.
    pub fn peek(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

impl Default for Sequencer {
    fn default() -> Self {
        Self::new()
    }
}

/// A discontinuity seen by a [`GapDetector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Gap {
    pub last: u64,
    pub observed: u64,
}

impl Gap {
    /// Batches missing between the two observations. Zero for a
    /// duplicate or a reordered batch.
    pub fn missing(&self) -> u64 {
        self.observed.saturating_sub(self.last).saturating_sub(1)
    }
}

/// Receiver-side loss detection. Advisory only: it never blocks, buffers
/// or reorders.
#[derive(Debug, Default)]
pub struct GapDetector {
    last: Option<u64>,
    gaps: u64,
}

impl GapDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `seq`. Reports a gap when it is not exactly one more than
    /// the previous observation; the first observation sets the baseline.
    pub fn observe(&mut self, seq: u64) -> Option<Gap> {
        let gap = match self.last {
            Some(last) if seq != last.wrapping_add(1) => Some(Gap {
                last,
                observed: seq,
            }),
            _ => None,
        };
        self.last = Some(seq);
        if gap.is_some() {
            self.gaps += 1;
        }
        gap
    }

    pub fn last(&self) -> Option<u64> {
        self.last
    }

    /// Gaps reported so far.
    pub fn gaps(&self) -> u64 {
        self.gaps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequencer_starts_at_one() {
        let seq = Sequencer::new();
        assert_eq!(seq.next(), 1);
        assert_eq!(seq.next(), 2);
        assert_eq!(seq.peek(), 3);
    }

    #[test]
    fn test_gap_reported_once() {
        let mut detector = GapDetector::new();
        let gaps: Vec<Gap> = [1, 2, 4].into_iter().filter_map(|s| detector.observe(s)).collect();
        assert_eq!(gaps, vec![Gap { last: 2, observed: 4 }]);
        assert_eq!(gaps[0].missing(), 1);
        assert_eq!(detector.gaps(), 1);
    }

    #[test]
    fn test_first_observation_is_baseline() {
        let mut detector = GapDetector::new();
        assert!(detector.observe(17).is_none());
        assert!(detector.observe(18).is_none());
    }

    #[test]
    fn test_duplicate_and_reorder_are_gaps() {
        let mut detector = GapDetector::new();
        detector.observe(5);
        assert_eq!(detector.observe(5).map(|g| g.missing()), Some(0));
        assert!(detector.observe(3).is_some());
        assert!(detector.observe(4).is_none());
    }
}
