//! # Commit Ledger
//!
//! Discrete companion to the GCRA leg: the timestamps of calls that the
//! caller *confirmed* succeeded, inside the current burst window.
//!
//! ```text
//!     acquire ──► real call ──► ok?  ──yes──► commit ──► ledger.record(now)
//!                                 │
//!                                 no
//!                                 ▼
//!                           (nothing recorded)
//! ```
//!
//! A call that was admitted but failed never occupies a window slot.

use super::utils::saturating_add;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Committed-call timestamps for one group, oldest first.
#[derive(Debug, Clone, Default)]
pub struct CommitLedger {
    entries: VecDeque<Instant>,
}

impl CommitLedger {
    /// Creates an empty ledger sized for `capacity` entries.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
        }
    }

    /// Records a confirmed call at `at`.
    ///
    /// Entries are kept in non-decreasing order; a timestamp older than the
    /// newest entry is clamped up to it.
    pub fn record(&mut self, at: Instant) {
        let at = match self.entries.back() {
            Some(&last) if last > at => last,
            _ => at,
        };
        self.entries.push_back(at);
    }

    /// Drops entries that left the window `(now - window, now]`.
    ///
    /// An entry exactly `window` old is already out.
    pub fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(&oldest) = self.entries.front() {
            if now.saturating_duration_since(oldest) >= window {
                self.entries.pop_front();
            } else {
                break;
            }
        }
    }

    /// Number of entries currently held.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when no committed calls are held.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Time until the oldest entry leaves the window, measured from `now`.
    /// Zero when the ledger is empty.
    pub fn time_until_slot(&self, now: Instant, window: Duration) -> Duration {
        match self.entries.front() {
            Some(&oldest) => saturating_add(oldest, window).saturating_duration_since(now),
            None => Duration::ZERO,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(1);

    #[test]
    fn test_record_and_prune() {
        let t0 = Instant::now();
        let mut ledger = CommitLedger::with_capacity(4);

        ledger.record(t0);
        ledger.record(t0 + Duration::from_millis(400));
        ledger.record(t0 + Duration::from_millis(800));
        assert_eq!(ledger.len(), 3);

        ledger.prune(t0 + Duration::from_millis(999), WINDOW);
        assert_eq!(ledger.len(), 3);

        // Half-open window: the boundary entry leaves
        ledger.prune(t0 + WINDOW, WINDOW);
        assert_eq!(ledger.len(), 2);

        ledger.prune(t0 + Duration::from_millis(1_500), WINDOW);
        assert_eq!(ledger.len(), 1);

        ledger.prune(t0 + Duration::from_secs(5), WINDOW);
        assert!(ledger.is_empty());
    }

    #[test]
    fn test_time_until_slot() {
        let t0 = Instant::now();
        let mut ledger = CommitLedger::default();
        assert_eq!(ledger.time_until_slot(t0, WINDOW), Duration::ZERO);

        ledger.record(t0);
        assert_eq!(
            ledger.time_until_slot(t0 + Duration::from_millis(300), WINDOW),
            Duration::from_millis(700)
        );
        assert_eq!(ledger.time_until_slot(t0 + WINDOW * 2, WINDOW), Duration::ZERO);
    }

    #[test]
    fn test_out_of_order_record_is_clamped() {
        let t0 = Instant::now();
        let mut ledger = CommitLedger::default();
        ledger.record(t0 + Duration::from_millis(500));
        ledger.record(t0);

        // Both entries share the later timestamp
        ledger.prune(t0 + Duration::from_millis(1_400), WINDOW);
        assert_eq!(ledger.len(), 2);
    }
}
