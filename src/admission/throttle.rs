//! # Preventive Throttling
//!
//! Soft brake applied *before* the admission decision while a group has
//! recent rejections on record. Each rejection contributes a risk weight that
//! decays linearly to zero over `rejection_window`:
//!
//! ```text
//!     weight
//!       1 ┤╲
//!         │  ╲
//!         │    ╲
//!       0 ┤──────╲──────────► age
//!         0    rejection_window
//!
//!     delay = min(preventive_base_delay × Σ weight, preventive_max_delay)
//! ```

use super::config::GroupConfig;
use super::core::AdmissionState;
use super::utils::secs_f64;
use std::time::Duration;
use tokio::time::Instant;

/// Computes the preventive delay for one group.
#[derive(Debug, Clone, Copy)]
pub struct PreventiveThrottler<'a> {
    config: &'a GroupConfig,
}

impl<'a> PreventiveThrottler<'a> {
    /// Binds the throttler to a group's policy.
    #[inline]
    pub fn new(config: &'a GroupConfig) -> Self {
        Self { config }
    }

    /// Sum of the decayed rejection weights at `now`.
    pub fn risk(&self, state: &AdmissionState, now: Instant) -> f64 {
        let window = self.config.rejection_window.as_secs_f64();
        if window <= 0.0 {
            return 0.0;
        }

        state
            .rejection_history
            .iter()
            .map(|&at| {
                let age = now.saturating_duration_since(at).as_secs_f64();
                (1.0 - age / window).max(0.0)
            })
            .sum()
    }

    /// Extra delay to impose before deciding, zero when there is no risk.
    pub fn extra_delay(&self, state: &AdmissionState, now: Instant) -> Duration {
        let risk = self.risk(state, now);
        if risk <= 0.0 {
            return Duration::ZERO;
        }
        secs_f64(self.config.preventive_base_delay.as_secs_f64() * risk)
            .min(self.config.preventive_max_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::group::RateLimitGroup;

    fn config() -> GroupConfig {
        GroupConfig::new(RateLimitGroup::PrivateOrder, 10.0, 10)
            .with_rejection_window(Duration::from_secs(10))
            .with_preventive_delay(Duration::from_millis(100), Duration::from_millis(250))
    }

    #[test]
    fn test_no_history_no_delay() {
        let config = config();
        let t0 = Instant::now();
        let state = AdmissionState::new(&config, t0);
        let throttler = PreventiveThrottler::new(&config);

        assert_eq!(throttler.risk(&state, t0), 0.0);
        assert_eq!(throttler.extra_delay(&state, t0), Duration::ZERO);
    }

    #[test]
    fn test_risk_decays_linearly() {
        let config = config();
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        state.rejection_history.push_back(t0);
        let throttler = PreventiveThrottler::new(&config);

        assert!((throttler.risk(&state, t0) - 1.0).abs() < 1e-9);
        assert_eq!(throttler.extra_delay(&state, t0), Duration::from_millis(100));

        let half = t0 + Duration::from_secs(5);
        assert!((throttler.risk(&state, half) - 0.5).abs() < 1e-9);
        assert_eq!(throttler.extra_delay(&state, half), Duration::from_millis(50));

        let expired = t0 + Duration::from_secs(11);
        assert_eq!(throttler.extra_delay(&state, expired), Duration::ZERO);
    }

    #[test]
    fn test_delay_is_capped() {
        let config = config();
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        for _ in 0..5 {
            state.rejection_history.push_back(t0);
        }
        let throttler = PreventiveThrottler::new(&config);

        assert!((throttler.risk(&state, t0) - 5.0).abs() < 1e-9);
        assert_eq!(throttler.extra_delay(&state, t0), Duration::from_millis(250));
    }

    #[test]
    fn test_huge_base_delay_saturates_to_cap() {
        let config = config().with_preventive_delay(Duration::MAX, Duration::from_secs(2));
        let t0 = Instant::now();
        let mut state = AdmissionState::new(&config, t0);
        for _ in 0..3 {
            state.rejection_history.push_back(t0);
        }
        let throttler = PreventiveThrottler::new(&config);

        assert_eq!(throttler.extra_delay(&state, t0), Duration::from_secs(2));
    }
}
