//! # Dynamic Rate Adjustment
//!
//! Feedback loop driven by the exchange's own rejections. A rejection means
//! the published quota was wrong for us *right now*, so the group slows down
//! immediately and only earns its rate back slowly.
//!
//! ```text
//!   rate_ratio
//!     1.00 ┤━━━━━━┓                                    ┏━━━━━━━
//!     0.95 ┤      ┃                              ┏━━━━━┛
//!     0.90 ┤      ┃                        ┏━━━━━┛
//!     0.85 ┤      ┃                  ┏━━━━━┛
//!     0.80 ┤      ┗━━━━━━━━━━━━━━━━━━┛
//!          └──────┬──────────────────┬─────┬─────┬─────┬──────► time
//!             rejection        +recovery_delay   +recovery_interval …
//! ```
//!
//! Reductions are multiplicative and floored at `min_rate_ratio`; recovery is
//! additive and capped at `1.0`. Any new reduction restarts the quiet period.

use super::config::GroupConfig;
use super::core::AdmissionState;
use super::utils::saturating_add;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, warn};

/// Ratios this close to 1.0 are treated as fully recovered.
const FULL_RATIO_EPSILON: f64 = 1e-9;

/// Provider metadata attached to a rejection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectionHint {
    /// `Retry-After` as reported by the exchange; nothing in the group is
    /// admitted before it elapses.
    pub retry_after: Option<Duration>,
}

impl RejectionHint {
    /// Hint carrying a `Retry-After` value.
    pub fn retry_after(delay: Duration) -> Self {
        Self {
            retry_after: Some(delay),
        }
    }
}

/// A reduction applied by [`DynamicAdjuster::on_rejection`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reduction {
    /// Ratio before the reduction.
    pub from: f64,
    /// Ratio after the reduction.
    pub to: f64,
}

/// Rate-ratio controller for one group.
#[derive(Debug, Clone, Copy)]
pub struct DynamicAdjuster<'a> {
    config: &'a GroupConfig,
}

impl<'a> DynamicAdjuster<'a> {
    /// Binds the adjuster to a group's policy.
    #[inline]
    pub fn new(config: &'a GroupConfig) -> Self {
        Self { config }
    }

    /// Drops history entries older than `rejection_window`.
    pub fn prune_history(&self, state: &mut AdmissionState, now: Instant) {
        let window = self.config.rejection_window;
        while let Some(&oldest) = state.rejection_history.front() {
            if now.saturating_duration_since(oldest) > window {
                state.rejection_history.pop_front();
            } else {
                break;
            }
        }
    }

    /// Records a rejection and reduces the ratio once the threshold is met.
    ///
    /// Returns the reduction applied, if any. A `retry_after` hint defers the
    /// whole group regardless of the threshold. Any rejection restarts an
    /// ongoing recovery from `now`.
    pub fn on_rejection(
        &self,
        state: &mut AdmissionState,
        now: Instant,
        hint: Option<RejectionHint>,
    ) -> Option<Reduction> {
        self.prune_history(state, now);
        state.rejection_history.push_back(now);

        if let Some(retry_after) = hint.and_then(|h| h.retry_after) {
            state.defer_until(saturating_add(now, retry_after));
            info!(
                group = %self.config.group,
                retry_after_ms = retry_after.as_millis() as u64,
                "deferring group on retry-after hint"
            );
        }

        if state.recovery_anchor.is_some() {
            state.recovery_anchor = Some(now);
            state.recovery_ticks = 0;
        }

        if state.rejection_history.len() < self.config.rejection_threshold as usize {
            return None;
        }

        let from = state.rate_ratio;
        let to = (from * self.config.reduction_ratio).max(self.config.min_rate_ratio);
        state.rate_ratio = to;
        state.recovery_anchor = Some(now);
        state.recovery_ticks = 0;

        warn!(
            group = %self.config.group,
            "rejection threshold reached ({} in {:?}): rate ratio {:.3} -> {:.3} ({:.2} req/s)",
            state.rejection_history.len(),
            self.config.rejection_window,
            from,
            to,
            self.config.effective_rate(to)
        );

        Some(Reduction { from, to })
    }

    /// Instant of the next recovery tick, or `None` when fully recovered.
    pub fn next_recovery_at(&self, state: &AdmissionState) -> Option<Instant> {
        let anchor = state.recovery_anchor?;
        let gap = if state.recovery_ticks == 0 {
            self.config.recovery_delay
        } else {
            self.config.recovery_interval
        };
        Some(saturating_add(anchor, gap))
    }

    /// Applies every recovery tick due at `now`.
    ///
    /// Ticks are anchored on their scheduled instants, so a late call
    /// catches up without shifting the cadence. Returns the new ratio when at
    /// least one tick was applied.
    pub fn recover(&self, state: &mut AdmissionState, now: Instant) -> Option<f64> {
        let mut ticked = false;

        while let Some(due) = self.next_recovery_at(state) {
            if due > now {
                break;
            }

            let mut next = (state.rate_ratio + self.config.recovery_step).min(1.0);
            if next >= 1.0 - FULL_RATIO_EPSILON {
                next = 1.0;
            }
            state.rate_ratio = next;
            state.recovery_ticks = state.recovery_ticks.saturating_add(1);
            state.recovery_anchor = if next < 1.0 { Some(due) } else { None };
            ticked = true;
        }

        if !ticked {
            return None;
        }

        if state.recovery_anchor.is_none() {
            info!(group = %self.config.group, "rate fully recovered");
            state.recovery_ticks = 0;
        } else {
            info!(
                group = %self.config.group,
                "rate recovering: ratio {:.3} ({:.2} req/s)",
                state.rate_ratio,
                self.config.effective_rate(state.rate_ratio)
            );
        }

        Some(state.rate_ratio)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::group::RateLimitGroup;

    fn config() -> GroupConfig {
        GroupConfig::new(RateLimitGroup::PrivateOrder, 10.0, 10)
    }

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[test]
    fn test_single_rejection_reduces_rate() {
        let config = config();
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);

        let reduction = adjuster.on_rejection(&mut state, t0, None).unwrap();
        assert_eq!(reduction.from, 1.0);
        assert!((reduction.to - 0.8).abs() < 1e-12);
        assert_eq!(config.increment(state.rate_ratio()), Duration::from_millis(125));
        assert_eq!(state.recovery_anchor, Some(t0));
    }

    #[test]
    fn test_reduction_floors_at_min_ratio() {
        let config = config();
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);

        for i in 0..20 {
            adjuster.on_rejection(&mut state, t0 + Duration::from_millis(i), None);
        }
        assert!((state.rate_ratio() - 0.3).abs() < 1e-12);
    }

    #[test]
    fn test_threshold_counts_within_window() {
        let config = config()
            .with_rejection_threshold(3)
            .with_rejection_window(secs(10));
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);

        assert!(adjuster.on_rejection(&mut state, t0, None).is_none());
        assert!(adjuster.on_rejection(&mut state, t0 + secs(1), None).is_none());
        // First one has aged out by now
        let aged = t0 + Duration::from_millis(10_500);
        assert!(adjuster.on_rejection(&mut state, aged, None).is_none());
        assert_eq!(state.rejection_history().len(), 2);

        assert!(adjuster.on_rejection(&mut state, t0 + secs(11), None).is_some());
    }

    #[test]
    fn test_recovery_schedule() {
        // 8/s after one rejection, 8.5/s after 300s, 10/s four ticks later
        let config = config();
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        adjuster.on_rejection(&mut state, t0, None);

        assert_eq!(adjuster.next_recovery_at(&state), Some(t0 + secs(300)));
        assert!(adjuster.recover(&mut state, t0 + secs(299)).is_none());

        let ratio = adjuster.recover(&mut state, t0 + secs(300)).unwrap();
        assert!((config.effective_rate(ratio) - 8.5).abs() < 1e-9);

        for tick in 2..=4u64 {
            adjuster.recover(&mut state, t0 + secs(300 * tick));
        }
        assert_eq!(state.rate_ratio(), 1.0);
        assert_eq!(adjuster.next_recovery_at(&state), None);
        assert!(adjuster.recover(&mut state, t0 + secs(5000)).is_none());
    }

    #[test]
    fn test_recovery_is_monotonic_and_bounded() {
        let config = config()
            .with_recovery(secs(1), 0.07)
            .with_recovery_interval(Duration::from_millis(500));
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        for _ in 0..5 {
            adjuster.on_rejection(&mut state, t0, None);
        }

        let mut last = state.rate_ratio();
        let mut now = t0;
        for _ in 0..100 {
            now += Duration::from_millis(250);
            adjuster.recover(&mut state, now);
            let ratio = state.rate_ratio();
            assert!(ratio >= last);
            assert!(ratio <= 1.0);
            assert!(ratio >= config.min_rate_ratio);
            last = ratio;
        }
        assert_eq!(last, 1.0);
    }

    #[test]
    fn test_late_recovery_catches_up() {
        let config = config();
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        adjuster.on_rejection(&mut state, t0, None);

        // Two ticks due: at 300s and 600s
        adjuster.recover(&mut state, t0 + secs(650));
        assert!((state.rate_ratio() - 0.9).abs() < 1e-9);
        assert_eq!(adjuster.next_recovery_at(&state), Some(t0 + secs(900)));
    }

    #[test]
    fn test_new_rejection_restarts_recovery() {
        let config = config();
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        adjuster.on_rejection(&mut state, t0, None);
        adjuster.recover(&mut state, t0 + secs(300));

        let later = t0 + secs(400);
        adjuster.on_rejection(&mut state, later, None);
        assert_eq!(adjuster.next_recovery_at(&state), Some(later + secs(300)));
    }

    #[test]
    fn test_sub_threshold_rejection_restarts_recovery() {
        let config = config().with_rejection_threshold(2);
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);

        assert!(adjuster.on_rejection(&mut state, t0, None).is_none());
        assert!(adjuster.on_rejection(&mut state, t0 + secs(1), None).is_some());
        assert!((state.rate_ratio() - 0.8).abs() < 1e-9);

        // Alone in the rejection window, so no reduction, but the quiet period restarts
        let fresh = t0 + secs(299);
        assert!(adjuster.on_rejection(&mut state, fresh, None).is_none());
        assert!(adjuster.recover(&mut state, t0 + secs(302)).is_none());
        assert!((state.rate_ratio() - 0.8).abs() < 1e-9);
        assert_eq!(adjuster.next_recovery_at(&state), Some(fresh + secs(300)));
    }

    #[test]
    fn test_rejection_at_full_rate_leaves_recovery_idle() {
        let config = config().with_rejection_threshold(3);
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);

        adjuster.on_rejection(&mut state, t0, None);
        assert_eq!(adjuster.next_recovery_at(&state), None);
    }

    #[test]
    fn test_retry_after_hint_defers_group() {
        let config = config().with_rejection_threshold(5);
        let adjuster = DynamicAdjuster::new(&config);
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);

        let hint = RejectionHint::retry_after(secs(2));
        assert!(adjuster.on_rejection(&mut state, t0, Some(hint)).is_none());
        assert_eq!(state.tat(), t0 + secs(2));
        assert_eq!(state.rate_ratio(), 1.0);
    }
}
