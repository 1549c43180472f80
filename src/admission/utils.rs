//! # Utility Types (utils.rs)
//!
//! Time source and retry helpers shared by the admission engine and the
//! supervisor.
//!
//! ## Monotonic Time
//!
//! ```text
//!     Wall clock:   10:00:00 ── NTP step ──► 09:59:58   ✗ goes backwards
//!     Monotonic:    t0 ─────────────────────► t0 + 2s   ✓ never decreases
//! ```
//!
//! Every admission decision is taken against a monotonic instant. The clock
//! is injected through the [`Clock`] trait so that embedding applications
//! (and tests) control where "now" comes from. The default [`TokioClock`]
//! reads `tokio::time::Instant`, which follows paused/advanced time inside
//! `#[tokio::test(start_paused = true)]`.

use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// Source of monotonic time for the controller.
///
/// Implementations must never go backwards. The controller only reads the
/// clock; it never sleeps through it, so any implementation must stay in
/// step with the tokio timer that drives sleeps (the default does).
pub trait Clock: Send + Sync + fmt::Debug + 'static {
    /// Returns the current instant.
    fn now(&self) -> Instant;
}

/// Default clock backed by `tokio::time::Instant::now()`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioClock;

impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Exponential backoff schedule for restarting failed background loops.
///
/// ```text
///     failure 1: base
///     failure 2: base × 2
///     failure 3: base × 4
///     ...        capped at max
/// ```
#[derive(Debug, Clone)]
pub(crate) struct RestartBackoff {
    /// Consecutive failures seen so far
    step: u32,
    base: Duration,
    max: Duration,
}

impl RestartBackoff {
    pub(crate) fn new(base: Duration, max: Duration) -> Self {
        Self { step: 0, base, max }
    }

    /// Returns the delay for the next restart and advances the schedule.
    pub(crate) fn next_delay(&mut self) -> Duration {
        let factor = 1u32.checked_shl(self.step.min(31)).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.step = self.step.saturating_add(1);
        delay
    }

    /// Starts the schedule over after a loop proved stable.
    pub(crate) fn reset(&mut self) {
        self.step = 0;
    }
}

/// Converts a non-negative fractional number of seconds into a `Duration`,
/// saturating instead of panicking on huge or non-finite inputs.
#[inline]
pub(crate) fn secs_f64(secs: f64) -> Duration {
    if !secs.is_finite() || secs <= 0.0 {
        if secs.is_infinite() && secs > 0.0 {
            return Duration::MAX;
        }
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs).unwrap_or(Duration::MAX)
}

/// Horizon used in place of an instant that would overflow.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// `at + d`, capped at roughly thirty years ahead instead of panicking.
#[inline]
pub(crate) fn saturating_add(at: Instant, d: Duration) -> Instant {
    at.checked_add(d.min(FAR_FUTURE)).unwrap_or(at)
}

/// Locks a mutex, recovering the data if a previous holder panicked.
///
/// Every critical section in this crate leaves its data consistent at each
/// step, so a poisoned lock carries no torn state.
#[inline]
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokio_clock_is_monotonic() {
        let clock = TokioClock;
        let mut last = clock.now();
        for _ in 0..100 {
            let now = clock.now();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_backoff_progression() {
        let mut backoff =
            RestartBackoff::new(Duration::from_millis(100), Duration::from_millis(700));

        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(400));
        // Capped at max
        assert_eq!(backoff.next_delay(), Duration::from_millis(700));
        assert_eq!(backoff.next_delay(), Duration::from_millis(700));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_does_not_overflow() {
        let mut backoff = RestartBackoff::new(Duration::from_secs(1), Duration::from_secs(30));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(30));
        }
    }

    #[test]
    fn test_secs_f64_edge_cases() {
        assert_eq!(secs_f64(0.125), Duration::from_millis(125));
        assert_eq!(secs_f64(-1.0), Duration::ZERO);
        assert_eq!(secs_f64(f64::NAN), Duration::ZERO);
        assert_eq!(secs_f64(f64::INFINITY), Duration::MAX);
        assert_eq!(secs_f64(1e300), Duration::MAX);
    }

    #[test]
    fn test_saturating_add_never_panics() {
        let t0 = Instant::now();
        assert_eq!(saturating_add(t0, Duration::from_millis(5)), t0 + Duration::from_millis(5));
        assert_eq!(saturating_add(t0, Duration::MAX), t0 + FAR_FUTURE);
        let huge = Duration::from_secs(u64::MAX / 2);
        assert!(saturating_add(t0, huge) > t0 + Duration::from_secs(86_400));
    }

    #[test]
    fn test_lock_recovers_from_poison() {
        let mutex = std::sync::Arc::new(Mutex::new(1));
        let poisoner = mutex.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.lock().unwrap();
            panic!("poison");
        })
        .join();

        assert!(mutex.is_poisoned());
        *lock(&mutex) += 1;
        assert_eq!(*lock(&mutex), 2);
    }
}
