//! # Error Types
//!
//! Callers of the controller only ever see two failure modes at runtime:
//! their wait ran past its deadline, or the controller was shut down while
//! they were parked. Configuration problems surface once, at construction.
//!
//! ```text
//!     AdmissionError
//!     ├─ WaitTimeout    ◄── deadline passed, waiter already cleaned up
//!     ├─ Shutdown       ◄── controller stopped while parked
//!     └─ Configuration  ◄── invalid group/classifier/supervisor settings
//! ```

use crate::admission::RateLimitGroup;
use std::time::Duration;
use thiserror::Error;

/// Invalid configuration detected while loading or validating a
/// [`LimiterConfig`](crate::LimiterConfig).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A group was configured with a non-positive or non-finite rate.
    #[error("group {group}: base_rate_per_second must be finite and > 0 (got {value})")]
    InvalidRate {
        /// Offending group.
        group: RateLimitGroup,
        /// Configured value.
        value: f64,
    },

    /// A group was configured with a zero burst capacity.
    #[error("group {group}: burst_capacity must be greater than 0")]
    ZeroBurstCapacity {
        /// Offending group.
        group: RateLimitGroup,
    },

    /// A ratio field fell outside its allowed range.
    #[error("group {group}: {field} must be in {range} (got {value})")]
    RatioOutOfRange {
        /// Offending group.
        group: RateLimitGroup,
        /// Field name as it appears in configuration.
        field: &'static str,
        /// Human-readable allowed range.
        range: &'static str,
        /// Configured value.
        value: f64,
    },

    /// A duration field that must be non-zero was zero.
    #[error("{scope}: {field} must be greater than zero")]
    ZeroDuration {
        /// Group name or `supervisor`/`wait`.
        scope: String,
        /// Field name as it appears in configuration.
        field: &'static str,
    },

    /// The same group was configured twice.
    #[error("group {0} is configured more than once")]
    DuplicateGroup(RateLimitGroup),

    /// `rejection_threshold` was zero.
    #[error("group {group}: rejection_threshold must be at least 1")]
    ZeroRejectionThreshold {
        /// Offending group.
        group: RateLimitGroup,
    },

    /// The classifier table references a group that has no configuration.
    #[error("classifier references group {0} which has no configuration")]
    UnconfiguredGroup(RateLimitGroup),

    /// A classifier rule had an empty endpoint pattern.
    #[error("classifier rule #{index} has an empty endpoint pattern")]
    EmptyPattern {
        /// Position of the rule in the table.
        index: usize,
    },

    /// Supervisor restart backoff settings are inconsistent.
    #[error("supervisor: restart_backoff_max ({max:?}) is smaller than restart_backoff_base ({base:?})")]
    BackoffRange {
        /// Configured base delay.
        base: Duration,
        /// Configured cap.
        max: Duration,
    },

    /// `max_consecutive_failures` was zero.
    #[error("supervisor: max_consecutive_failures must be at least 1")]
    ZeroFailureBudget,

    /// The configuration file could not be read.
    #[error("failed to read configuration file {path}: {message}")]
    Io {
        /// Path that was being read.
        path: String,
        /// Underlying I/O error message.
        message: String,
    },

    /// The configuration text was not valid TOML for this schema.
    #[error("failed to parse configuration: {0}")]
    Parse(String),
}

/// Errors surfaced to callers of [`AdmissionController`](crate::AdmissionController).
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AdmissionError {
    /// The caller waited past its deadline. The waiter has been removed from
    /// the queue and no quota was consumed.
    #[error("admission wait timed out for group {group} after {waited:?}")]
    WaitTimeout {
        /// Group the caller was waiting on.
        group: RateLimitGroup,
        /// How long the caller waited before giving up.
        waited: Duration,
    },

    /// The controller was shut down while the caller was waiting.
    #[error("admission controller is shut down")]
    Shutdown,

    /// The controller could not be built from its configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigError),
}

impl AdmissionError {
    /// Returns true for [`AdmissionError::WaitTimeout`].
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::WaitTimeout { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_messages() {
        let err = ConfigError::InvalidRate {
            group: RateLimitGroup::PublicRead,
            value: -1.0,
        };
        assert!(err.to_string().contains("public_read"));
        assert!(err.to_string().contains("-1"));

        let err = ConfigError::ZeroDuration {
            scope: "supervisor".to_string(),
            field: "health_check_interval",
        };
        assert_eq!(
            err.to_string(),
            "supervisor: health_check_interval must be greater than zero"
        );
    }

    #[test]
    fn test_admission_error_conversion() {
        let err: AdmissionError = ConfigError::ZeroFailureBudget.into();
        assert!(matches!(err, AdmissionError::Configuration(_)));
        assert!(!err.is_timeout());

        let timeout = AdmissionError::WaitTimeout {
            group: RateLimitGroup::PrivateOrder,
            waited: Duration::from_millis(250),
        };
        assert!(timeout.is_timeout());
        assert!(timeout.to_string().contains("private_order"));
    }
}
