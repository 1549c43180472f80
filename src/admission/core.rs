//! # Hybrid Admission Engine
//!
//! This module is the heart of the controller: for one group at one instant
//! it decides whether a request may go now, and if not, for how long it
//! must wait. Two algorithms are evaluated side by side and reconciled.
//!
//! ## GCRA Leg (continuous pacing)
//!
//! ```text
//!     I = 1 / (base_rate × rate_ratio)          emission interval
//!
//!     now ≥ tat  ──► allow, tat' = now + I
//!     now < tat  ──► gcra_delay = tat − now
//!
//!     time ─────────────────────────────────────────────►
//!              │         │         │
//!             tat      tat+I     tat+2I     (one admission per I)
//! ```
//!
//! ## Window Leg (discrete burst slots)
//!
//! ```text
//!     burst_window = 1s, burst_capacity = 3
//!
//!     [now-1s ·········· now]
//!        ✓     ✓            ✓       3/3 committed  ──► full
//!        └── oldest leaves the window in window_delay
//! ```
//!
//! ## Reconciliation (burst priority)
//!
//! ```text
//!     window free? ──yes──► debt ≤ horizon? ──yes──► ADMIT (tat still advances)
//!          │                     │
//!          no                    no ──► wait debt − horizon
//!          │
//!          └──► wait max(gcra_delay, window_delay)
//!
//!     debt    = tat − now
//!     horizon = (burst_capacity − 1) × I
//! ```
//!
//! The horizon bounds how far a burst may run ahead of the GCRA schedule, so
//! the sustained admission rate never exceeds `1 / I` even when callers
//! never commit.
//!
//! The decision and the state mutation it implies happen in one call, made
//! while the caller holds the group's serialization point.

use super::config::GroupConfig;
use super::ledger::CommitLedger;
use super::utils::saturating_add;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Smallest wait ever reported for a denied request.
///
/// Keeps a denied caller from spinning when a window entry sits exactly on
/// the window boundary.
pub(crate) const MIN_WAIT: Duration = Duration::from_millis(1);

/// Mutable pacing state of one group.
///
/// Owned exclusively by the group's serialization point; every read and
/// write happens with that lock held.
#[derive(Debug, Clone)]
pub struct AdmissionState {
    /// Theoretical arrival time (non-decreasing)
    pub(crate) tat: Instant,
    /// Multiplier on the base rate, in `[min_rate_ratio, 1.0]`
    pub(crate) rate_ratio: f64,
    /// Recent external rejections, oldest first
    pub(crate) rejection_history: VecDeque<Instant>,
    /// Committed calls in the current burst window
    pub(crate) ledger: CommitLedger,
    /// Last reduction or recovery tick; `None` once fully recovered
    pub(crate) recovery_anchor: Option<Instant>,
    /// Recovery ticks applied since the last reduction
    pub(crate) recovery_ticks: u32,
    /// Hard stop set by a provider `Retry-After`; bursts cannot bypass it
    pub(crate) blocked_until: Option<Instant>,
}

impl AdmissionState {
    /// Fresh state at full trust with an idle schedule.
    pub fn new(config: &GroupConfig, now: Instant) -> Self {
        Self {
            tat: now,
            rate_ratio: 1.0,
            rejection_history: VecDeque::new(),
            ledger: CommitLedger::with_capacity(config.burst_capacity as usize),
            recovery_anchor: None,
            recovery_ticks: 0,
            blocked_until: None,
        }
    }

    /// Current theoretical arrival time.
    #[inline]
    pub fn tat(&self) -> Instant {
        self.tat
    }

    /// Current rate ratio.
    #[inline]
    pub fn rate_ratio(&self) -> f64 {
        self.rate_ratio
    }

    /// Committed calls still inside the burst window (as of the last prune).
    #[inline]
    pub fn window_occupancy(&self) -> usize {
        self.ledger.len()
    }

    /// Recent rejection timestamps, oldest first.
    #[inline]
    pub fn rejection_history(&self) -> &VecDeque<Instant> {
        &self.rejection_history
    }

    /// Records a confirmed successful call.
    pub(crate) fn commit(&mut self, config: &GroupConfig, now: Instant) {
        self.ledger.prune(now, config.burst_window);
        self.ledger.record(now);
    }

    /// Blocks the group until `not_before` and moves the schedule there.
    pub(crate) fn defer_until(&mut self, not_before: Instant) {
        if not_before > self.tat {
            self.tat = not_before;
        }
        if self.blocked_until.map_or(true, |until| not_before > until) {
            self.blocked_until = Some(not_before);
        }
    }

    /// Instant before which nothing is admitted, if one is set.
    #[inline]
    pub fn blocked_until(&self) -> Option<Instant> {
        self.blocked_until
    }
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// The request may proceed now.
    Admit,
    /// The request must wait at least this long before asking again.
    Wait(Duration),
}

impl Decision {
    /// True for [`Decision::Admit`].
    #[inline]
    pub fn is_admit(&self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Wait duration, zero when admitted.
    #[inline]
    pub fn wait(&self) -> Duration {
        match self {
            Self::Admit => Duration::ZERO,
            Self::Wait(d) => *d,
        }
    }
}

/// Both legs of a decision, kept for logging and status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Evaluation {
    /// Final verdict.
    pub decision: Decision,
    /// Pure GCRA delay (`tat − now`, zero when on schedule).
    pub gcra_delay: Duration,
    /// Delay until a window slot frees up (zero when one is free).
    pub window_delay: Duration,
    /// Whether the window leg had a free slot.
    pub window_free: bool,
    /// Admitted ahead of the GCRA schedule on burst priority.
    pub burst: bool,
}

/// Stateless decision procedure over one group's config and state.
///
/// # Example
///
/// ```rust
/// use zero429::{AdmissionState, Decision, GroupConfig, HybridAdmissionEngine, RateLimitGroup};
/// use tokio::time::Instant;
/// use std::time::Duration;
///
/// let config = GroupConfig::new(RateLimitGroup::PrivateOrder, 10.0, 10);
/// let engine = HybridAdmissionEngine::new(&config);
/// let t0 = Instant::now();
/// let mut state = AdmissionState::new(&config, t0);
///
/// // A burst of 10 goes straight through
/// for _ in 0..10 {
///     assert!(engine.try_admit(&mut state, t0).decision.is_admit());
/// }
/// // The 11th is paced one interval behind
/// assert_eq!(
///     engine.try_admit(&mut state, t0).decision,
///     Decision::Wait(Duration::from_millis(100))
/// );
/// ```
#[derive(Debug, Clone, Copy)]
pub struct HybridAdmissionEngine<'a> {
    config: &'a GroupConfig,
}

impl<'a> HybridAdmissionEngine<'a> {
    /// Binds the engine to a group's policy.
    #[inline]
    pub fn new(config: &'a GroupConfig) -> Self {
        Self { config }
    }

    /// Current emission interval for `state`.
    #[inline]
    pub fn increment(&self, state: &AdmissionState) -> Duration {
        self.config.increment(state.rate_ratio)
    }

    /// How far ahead of the GCRA schedule a burst may run.
    #[inline]
    fn horizon(&self, increment: Duration) -> Duration {
        increment.saturating_mul(self.config.burst_capacity.saturating_sub(1))
    }

    /// Evaluates both legs without advancing the schedule.
    ///
    /// Only prunes expired window entries.
    pub fn evaluate(&self, state: &mut AdmissionState, now: Instant) -> Evaluation {
        let increment = self.increment(state);
        let horizon = self.horizon(increment);

        // GCRA leg
        let gcra_delay = state.tat.saturating_duration_since(now);

        // Window leg
        state.ledger.prune(now, self.config.burst_window);
        let window_free = state.ledger.len() < self.config.burst_capacity as usize;
        let window_delay = if window_free {
            Duration::ZERO
        } else {
            state.ledger.time_until_slot(now, self.config.burst_window)
        };

        let mut decision = if window_free {
            if gcra_delay <= horizon {
                Decision::Admit
            } else {
                Decision::Wait((gcra_delay - horizon).max(MIN_WAIT))
            }
        } else {
            Decision::Wait(gcra_delay.max(window_delay).max(MIN_WAIT))
        };

        match state.blocked_until {
            Some(until) if now < until => {
                decision = Decision::Wait(decision.wait().max(until - now));
            }
            Some(_) => state.blocked_until = None,
            None => {}
        }

        Evaluation {
            decision,
            gcra_delay,
            window_delay,
            window_free,
            burst: decision.is_admit() && !gcra_delay.is_zero(),
        }
    }

    /// Evaluates and, on admission, advances the schedule in the same step.
    pub fn try_admit(&self, state: &mut AdmissionState, now: Instant) -> Evaluation {
        let evaluation = self.evaluate(state, now);

        if evaluation.decision.is_admit() {
            let increment = self.increment(state);
            state.tat = saturating_add(state.tat.max(now), increment);
        }

        debug!(
            group = %self.config.group,
            admitted = evaluation.decision.is_admit(),
            burst = evaluation.burst,
            gcra_delay_ms = evaluation.gcra_delay.as_secs_f64() * 1000.0,
            window_delay_ms = evaluation.window_delay.as_secs_f64() * 1000.0,
            window_occupancy = state.ledger.len(),
            rate_ratio = state.rate_ratio,
            "admission decision"
        );

        evaluation
    }
}
