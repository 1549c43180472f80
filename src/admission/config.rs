//! # Admission Controller Configuration
//!
//! Static policy for every rate-limit group plus the classifier table and the
//! settings of the waiting/supervision machinery. Loaded once at startup and
//! never mutated afterwards.
//!
//! ## Group Policy
//!
//! ```text
//!     GroupConfig (private_order):
//!     ┌──────────────────────────────────────┐
//!     │ base_rate_per_second: 10             │ ← GCRA ceiling
//!     │ burst_capacity:       10             │ ← committed calls per window
//!     │ burst_window:         1s             │
//!     │                                      │
//!     │ rejection_threshold:  1              │ ← zero tolerance
//!     │ reduction_ratio:      0.8            │ ← ×0.8 on rejection
//!     │ min_rate_ratio:       0.3            │ ← never below 30%
//!     │                                      │
//!     │ recovery_delay:       300s           │ ← quiet period
//!     │ recovery_step:        0.05           │ ← +5% per tick
//!     └──────────────────────────────────────┘
//! ```
//!
//! ## TOML Layout
//!
//! Durations are written as fractional seconds.
//!
//! ```toml
//! [[groups]]
//! group = "private_order"
//! base_rate_per_second = 10.0
//! burst_capacity = 10
//! recovery_delay = 300.0
//!
//! [classifier]
//! default_group = "private_order"
//!
//! [[classifier.rules]]
//! prefix = "/private/"
//! group = "private_order"
//!
//! [supervisor]
//! health_check_interval = 1.0
//! ```

use super::group::{ClassifierConfig, RateLimitGroup};
use super::utils::secs_f64;
use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

/// Serde adapter storing a `Duration` as fractional seconds.
mod secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub(super) fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_f64(d.as_secs_f64())
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(d)?;
        if !secs.is_finite() || secs < 0.0 {
            return Err(serde::de::Error::custom(format!(
                "duration must be a non-negative number of seconds, got {secs}"
            )));
        }
        Ok(super::secs_f64(secs))
    }
}

mod defaults {
    use std::time::Duration;

    pub(super) fn min_rate_ratio() -> f64 {
        0.3
    }
    pub(super) fn rejection_threshold() -> u32 {
        1
    }
    pub(super) fn reduction_ratio() -> f64 {
        0.8
    }
    pub(super) fn recovery_delay() -> Duration {
        Duration::from_secs(300)
    }
    pub(super) fn recovery_interval() -> Duration {
        Duration::from_secs(300)
    }
    pub(super) fn recovery_step() -> f64 {
        0.05
    }
    pub(super) fn burst_window() -> Duration {
        Duration::from_secs(1)
    }
    pub(super) fn rejection_window() -> Duration {
        Duration::from_secs(30)
    }
    pub(super) fn preventive_base_delay() -> Duration {
        Duration::from_millis(100)
    }
    pub(super) fn preventive_max_delay() -> Duration {
        Duration::from_secs(2)
    }
}

/// Static policy for one rate-limit group.
///
/// # Example
///
/// ```rust
/// use zero429::{GroupConfig, RateLimitGroup};
/// use std::time::Duration;
///
/// let config = GroupConfig::per_second(RateLimitGroup::PrivateOrder, 10.0)
///     .with_burst_capacity(5)
///     .with_reduction_ratio(0.5)
///     .with_recovery(Duration::from_secs(60), 0.1);
///
/// assert!(config.validate().is_ok());
/// assert_eq!(config.increment(1.0), Duration::from_millis(100));
/// assert_eq!(config.increment(0.5), Duration::from_millis(200));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    /// Group this policy applies to.
    pub group: RateLimitGroup,

    /// Long-run request ceiling at full trust (`rate_ratio == 1.0`).
    pub base_rate_per_second: f64,

    /// Committed calls allowed inside one `burst_window`.
    pub burst_capacity: u32,

    /// Floor for the dynamic rate ratio.
    #[serde(default = "defaults::min_rate_ratio")]
    pub min_rate_ratio: f64,

    /// Rejections within `rejection_window` that trigger a reduction.
    #[serde(default = "defaults::rejection_threshold")]
    pub rejection_threshold: u32,

    /// Multiplier applied to the rate ratio on each reduction.
    #[serde(default = "defaults::reduction_ratio")]
    pub reduction_ratio: f64,

    /// Quiet period after a reduction before recovery starts.
    #[serde(default = "defaults::recovery_delay", with = "secs")]
    pub recovery_delay: Duration,

    /// Spacing between recovery ticks once recovery has started.
    #[serde(default = "defaults::recovery_interval", with = "secs")]
    pub recovery_interval: Duration,

    /// Amount added to the rate ratio per recovery tick.
    #[serde(default = "defaults::recovery_step")]
    pub recovery_step: f64,

    /// Width of the discrete burst window.
    #[serde(default = "defaults::burst_window", with = "secs")]
    pub burst_window: Duration,

    /// Lookback for the rejection history (threshold and preventive risk).
    #[serde(default = "defaults::rejection_window", with = "secs")]
    pub rejection_window: Duration,

    /// Preventive delay per unit of risk.
    #[serde(default = "defaults::preventive_base_delay", with = "secs")]
    pub preventive_base_delay: Duration,

    /// Cap on the preventive delay.
    #[serde(default = "defaults::preventive_max_delay", with = "secs")]
    pub preventive_max_delay: Duration,
}

impl GroupConfig {
    /// Creates a policy with the given rate and burst capacity; everything
    /// else takes the zero-tolerance defaults.
    pub fn new(group: RateLimitGroup, base_rate_per_second: f64, burst_capacity: u32) -> Self {
        Self {
            group,
            base_rate_per_second,
            burst_capacity,
            min_rate_ratio: defaults::min_rate_ratio(),
            rejection_threshold: defaults::rejection_threshold(),
            reduction_ratio: defaults::reduction_ratio(),
            recovery_delay: defaults::recovery_delay(),
            recovery_interval: defaults::recovery_interval(),
            recovery_step: defaults::recovery_step(),
            burst_window: defaults::burst_window(),
            rejection_window: defaults::rejection_window(),
            preventive_base_delay: defaults::preventive_base_delay(),
            preventive_max_delay: defaults::preventive_max_delay(),
        }
    }

    /// Policy for `rate` requests per second with a one-second burst of the
    /// same size (rounded up, at least 1).
    pub fn per_second(group: RateLimitGroup, rate: f64) -> Self {
        let burst = if rate.is_finite() && rate > 0.0 {
            rate.ceil().min(u32::MAX as f64) as u32
        } else {
            1
        };
        Self::new(group, rate, burst.max(1))
    }

    /// Sets the burst capacity.
    pub fn with_burst_capacity(mut self, burst_capacity: u32) -> Self {
        self.burst_capacity = burst_capacity;
        self
    }

    /// Sets the burst window width.
    pub fn with_burst_window(mut self, window: Duration) -> Self {
        self.burst_window = window;
        self
    }

    /// Sets the rejection threshold.
    pub fn with_rejection_threshold(mut self, threshold: u32) -> Self {
        self.rejection_threshold = threshold;
        self
    }

    /// Sets the reduction multiplier.
    pub fn with_reduction_ratio(mut self, ratio: f64) -> Self {
        self.reduction_ratio = ratio;
        self
    }

    /// Sets the rate-ratio floor.
    pub fn with_min_rate_ratio(mut self, ratio: f64) -> Self {
        self.min_rate_ratio = ratio;
        self
    }

    /// Sets the recovery quiet period and step. The tick interval follows
    /// the delay; use [`with_recovery_interval`](Self::with_recovery_interval)
    /// to change it.
    pub fn with_recovery(mut self, delay: Duration, step: f64) -> Self {
        self.recovery_delay = delay;
        self.recovery_interval = delay.max(Duration::from_millis(1));
        self.recovery_step = step;
        self
    }

    /// Sets the spacing between recovery ticks.
    pub fn with_recovery_interval(mut self, interval: Duration) -> Self {
        self.recovery_interval = interval;
        self
    }

    /// Sets the rejection lookback window.
    pub fn with_rejection_window(mut self, window: Duration) -> Self {
        self.rejection_window = window;
        self
    }

    /// Sets the preventive delay per unit of risk and its cap.
    pub fn with_preventive_delay(mut self, base: Duration, max: Duration) -> Self {
        self.preventive_base_delay = base;
        self.preventive_max_delay = max;
        self
    }

    /// Effective requests per second at the given rate ratio.
    #[inline]
    pub fn effective_rate(&self, rate_ratio: f64) -> f64 {
        self.base_rate_per_second * rate_ratio
    }

    /// GCRA emission interval `1 / (base_rate × rate_ratio)`.
    #[inline]
    pub fn increment(&self, rate_ratio: f64) -> Duration {
        secs_f64(1.0 / self.effective_rate(rate_ratio))
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: non-positive rate, zero burst,
    /// ratios outside `(0, 1]`, a zero threshold, or zero-width windows.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let group = self.group;

        if !self.base_rate_per_second.is_finite() || self.base_rate_per_second <= 0.0 {
            return Err(ConfigError::InvalidRate {
                group,
                value: self.base_rate_per_second,
            });
        }

        if self.burst_capacity == 0 {
            return Err(ConfigError::ZeroBurstCapacity { group });
        }

        for (field, value) in [
            ("min_rate_ratio", self.min_rate_ratio),
            ("reduction_ratio", self.reduction_ratio),
            ("recovery_step", self.recovery_step),
        ] {
            if !value.is_finite() || value <= 0.0 || value > 1.0 {
                return Err(ConfigError::RatioOutOfRange {
                    group,
                    field,
                    range: "(0, 1]",
                    value,
                });
            }
        }

        if self.rejection_threshold == 0 {
            return Err(ConfigError::ZeroRejectionThreshold { group });
        }

        for (field, value) in [
            ("burst_window", self.burst_window),
            ("rejection_window", self.rejection_window),
            ("recovery_interval", self.recovery_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    scope: format!("group {group}"),
                    field,
                });
            }
        }

        Ok(())
    }
}

/// Settings for parked callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    /// Deadline applied by `acquire` when the caller gives none.
    #[serde(with = "secs")]
    pub default_timeout: Duration,

    /// How long a parked caller waits for a wake before re-checking on its
    /// own (only when it heads the queue).
    #[serde(with = "secs")]
    pub park_poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            park_poll_interval: Duration::from_secs(1),
        }
    }
}

/// Settings for the self-healing supervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorConfig {
    /// How often background loops are checked.
    #[serde(with = "secs")]
    pub health_check_interval: Duration,

    /// First restart delay.
    #[serde(with = "secs")]
    pub restart_backoff_base: Duration,

    /// Cap on the restart delay.
    #[serde(with = "secs")]
    pub restart_backoff_max: Duration,

    /// A restarted loop that survives this long is considered stable again.
    #[serde(with = "secs")]
    pub stable_after: Duration,

    /// Consecutive failed restarts before a loop is reported unhealthy.
    pub max_consecutive_failures: u32,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            health_check_interval: Duration::from_secs(1),
            restart_backoff_base: Duration::from_millis(100),
            restart_backoff_max: Duration::from_secs(5),
            stable_after: Duration::from_secs(30),
            max_consecutive_failures: 5,
        }
    }
}

impl SupervisorConfig {
    /// Validates the supervisor settings.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.health_check_interval.is_zero() {
            return Err(ConfigError::ZeroDuration {
                scope: "supervisor".to_string(),
                field: "health_check_interval",
            });
        }
        if self.restart_backoff_max < self.restart_backoff_base {
            return Err(ConfigError::BackoffRange {
                base: self.restart_backoff_base,
                max: self.restart_backoff_max,
            });
        }
        if self.max_consecutive_failures == 0 {
            return Err(ConfigError::ZeroFailureBudget);
        }
        Ok(())
    }
}

/// Complete controller configuration.
///
/// # Example
///
/// ```rust
/// use zero429::LimiterConfig;
///
/// let config = LimiterConfig::from_toml_str(r#"
///     [[groups]]
///     group = "public_read"
///     base_rate_per_second = 20.0
///     burst_capacity = 20
///
///     [classifier]
///     default_group = "public_read"
/// "#).unwrap();
///
/// assert_eq!(config.groups.len(), 1);
/// assert_eq!(config.groups[0].recovery_step, 0.05);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// One policy per group the classifier can produce.
    pub groups: Vec<GroupConfig>,

    /// Endpoint classification table.
    #[serde(default)]
    pub classifier: ClassifierConfig,

    /// Parked-caller settings.
    #[serde(default)]
    pub wait: WaitConfig,

    /// Background-loop supervision settings.
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

impl Default for LimiterConfig {
    /// Conservative policies for every group with the built-in classifier.
    fn default() -> Self {
        use RateLimitGroup::*;
        Self {
            groups: vec![
                GroupConfig::per_second(PublicRead, 20.0),
                GroupConfig::per_second(PrivateDefault, 10.0),
                GroupConfig::per_second(PrivateOrder, 10.0),
                GroupConfig::new(PrivateCancelAll, 1.0, 1),
                GroupConfig::new(StreamConnect, 1.0, 3),
            ],
            classifier: ClassifierConfig::default(),
            wait: WaitConfig::default(),
            supervisor: SupervisorConfig::default(),
        }
    }
}

impl LimiterConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Parse`] for malformed input, otherwise whatever
    /// [`validate`](Self::validate) reports.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        Self::from_toml_str(&text)
    }

    /// Replaces (or adds) the policy for one group.
    pub fn with_group(mut self, config: GroupConfig) -> Self {
        self.groups.retain(|g| g.group != config.group);
        self.groups.push(config);
        self
    }

    /// Replaces the classifier table.
    pub fn with_classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.classifier = classifier;
        self
    }

    /// Replaces the supervisor settings.
    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    /// Replaces the wait settings.
    pub fn with_wait(mut self, wait: WaitConfig) -> Self {
        self.wait = wait;
        self
    }

    /// Policy for a group, if configured.
    pub fn group(&self, group: RateLimitGroup) -> Option<&GroupConfig> {
        self.groups.iter().find(|g| g.group == group)
    }

    /// Validates every section and their consistency.
    ///
    /// # Errors
    ///
    /// - any group policy error
    /// - a group configured twice
    /// - a classifier rule with an empty prefix/endpoint
    /// - a classifier target with no group policy
    /// - invalid supervisor or wait settings
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for group in &self.groups {
            group.validate()?;
            if !seen.insert(group.group) {
                return Err(ConfigError::DuplicateGroup(group.group));
            }
        }

        for (index, rule) in self.classifier.rules.iter().enumerate() {
            if rule.prefix.is_empty() {
                return Err(ConfigError::EmptyPattern { index });
            }
        }
        for (offset, o) in self.classifier.overrides.iter().enumerate() {
            if o.endpoint.is_empty() || o.method.is_empty() {
                return Err(ConfigError::EmptyPattern {
                    index: self.classifier.rules.len() + offset,
                });
            }
        }

        if let Some(missing) = self
            .classifier
            .referenced_groups()
            .find(|g| !seen.contains(g))
        {
            return Err(ConfigError::UnconfiguredGroup(missing));
        }

        self.supervisor.validate()?;

        for (field, value) in [
            ("default_timeout", self.wait.default_timeout),
            ("park_poll_interval", self.wait.park_poll_interval),
        ] {
            if value.is_zero() {
                return Err(ConfigError::ZeroDuration {
                    scope: "wait".to_string(),
                    field,
                });
            }
        }

        Ok(())
    }
}
