//! # Zero429 - Adaptive Admission Control for Exchange API Clients
//!
//! Exchanges publish request quotas and punish clients that exceed them with
//! HTTP 429 responses, temporary bans, or worse. This crate sits in front of
//! every outbound call and decides *when* each call may go, so that a client
//! stays under the published quota while using as much of it as it safely can.
//!
//! ## How It Decides
//!
//! Every request is classified into a rate-limit group (public reads, order
//! placement, bulk cancels, ...). Each group is paced by two algorithms at
//! once:
//!
//! ```text
//!     GCRA (continuous)           Burst window (discrete)
//!     ─────────────────           ───────────────────────
//!     one slot every I            N committed calls per window
//!
//!     ┌───┬───┬───┬───┐           [ ✓ ✓ ✓ · · · · · · · ]  3/10
//!     │ I │ I │ I │ I │ ──►
//!     └───┴───┴───┴───┘           free slot ──► burst may run ahead of GCRA
//!                                 full      ──► wait for the slower leg
//! ```
//!
//! When the exchange still rejects a call, the group slows down right away
//! and only earns its rate back after a quiet period:
//!
//! ```text
//!     10/s ━━━━┓                       ┏━━━━
//!      8/s     ┗━━━━━━━━━━━┳━━━━┳━━━━━━┛      +5% every recovery tick
//!              ▲ 429      300s
//! ```
//!
//! ## Quick Start
//!
//! ```rust
//! use zero429::{AdmissionController, LimiterConfig};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), zero429::AdmissionError> {
//! let controller = AdmissionController::new(LimiterConfig::default())?;
//! controller.start();
//!
//! // Wait for a slot, make the call, report the outcome
//! let admission = controller.acquire("/public/v1/ticker", "GET").await?;
//! println!("admitted under {} after {:?}", admission.group, admission.waited);
//! controller.commit("/public/v1/ticker", "GET");
//!
//! println!("{}", controller.get_status());
//! controller.shutdown().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Builder
//!
//! ```rust
//! use zero429::{ControllerBuilder, GroupConfig, RateLimitGroup};
//! use std::time::Duration;
//!
//! let controller = ControllerBuilder::new()
//!     .group(GroupConfig::per_second(RateLimitGroup::PrivateOrder, 5.0))
//!     .default_timeout(Duration::from_secs(10))
//!     .try_build()
//!     .unwrap();
//!
//! assert_eq!(controller.classify("/private/v1/order", "POST"), RateLimitGroup::PrivateOrder);
//! ```
//!
//! ## Architecture Overview
//!
//! ```text
//!                    ┌─────────────────────────┐
//!                    │   Your Exchange Client  │
//!                    └──────────┬──────────────┘
//!                               │
//!                    ┌──────────▼──────────────┐
//!                    │  AdmissionController    │
//!                    ├─────────────────────────┤
//!                    │  • acquire()            │
//!                    │  • commit()             │
//!                    │  • notify_rejection()   │
//!                    │  • get_status()         │
//!                    └──────────┬──────────────┘
//!                               │ one slot per group
//!                ┌──────────────┴───────────────┐
//!                │                              │
//!     ┌──────────▼──────────┐       ┌───────────▼──────────┐
//!     │   Admission Engine  │       │   Background Loops   │
//!     ├─────────────────────┤       ├──────────────────────┤
//!     │ • GCRA + window     │       │ • Queue notifier     │
//!     │ • Rate adjuster     │       │ • Recovery scheduler │
//!     │ • FIFO wait queue   │       │ • Supervisor         │
//!     └─────────────────────┘       └──────────────────────┘
//! ```
//!
//! ## Caller Contract
//!
//! - `commit` exactly once per call the exchange accepted
//! - `notify_rejection` for every quota rejection, ideally with `Retry-After`
//! - nothing for calls that failed for other reasons
//!
//! ## Concurrency
//!
//! Built on tokio. Waiting callers are parked on a oneshot channel and never
//! hold a worker thread. Each group is serialized by its own short critical
//! section; groups never block each other.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    missing_debug_implementations
)]
#![forbid(unsafe_code)]

// Internal module
mod admission;

pub mod error;

// Public re-exports
pub use admission::{
    Admission, AdmissionController, AdmissionState, ClassifierConfig, Clock, CommitLedger,
    ControllerStatus, Decision, DynamicAdjuster, Evaluation, GroupClassifier, GroupConfig,
    GroupStatus, HealthStatus, HybridAdmissionEngine, LimiterConfig, LoopKind, LoopState,
    LoopStatus, MethodOverride, PrefixRule, PreventiveThrottler, RateLimitGroup, Reduction,
    RejectionHint, SelfHealingSupervisor, SupervisorConfig, Ticket, TokioClock, WaitConfig,
    WaitQueue, Waiter, Wake,
};
pub use error::{AdmissionError, ConfigError};

/// A controller wrapped in `Arc`, for applications that prefer to share it
/// explicitly rather than clone the handle.
pub type SharedController = std::sync::Arc<AdmissionController>;

/// Version information for the crate.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Minimum supported Rust version.
pub const MSRV: &str = "1.75.0";

/// Prelude module for convenient imports.
///
/// ```rust
/// use zero429::prelude::*;
/// ```
pub mod prelude {
    //! Common imports for typical exchange clients.
    //!
    //! # Example
    //! ```rust
    //! use zero429::prelude::*;
    //!
    //! let config = LimiterConfig::default();
    //! let group = RateLimitGroup::PublicRead;
    //! let status = HealthStatus::Healthy;
    //! ```

    pub use crate::{
        Admission, AdmissionController, AdmissionError, ControllerBuilder, ControllerStatus,
        GroupConfig, HealthStatus, LimiterConfig, RateLimitGroup, RejectionHint,
        SharedController,
    };
}

/// Fluent construction of an [`AdmissionController`].
///
/// Starts from [`LimiterConfig::default`]; every setter replaces one piece.
///
/// # Example
///
/// ```rust
/// use zero429::{ControllerBuilder, GroupConfig, RateLimitGroup};
///
/// let result = ControllerBuilder::new()
///     .group(GroupConfig::new(RateLimitGroup::PublicRead, 0.0, 1))  // Invalid!
///     .try_build();
///
/// assert!(result.is_err());
/// ```
#[derive(Debug, Clone)]
pub struct ControllerBuilder {
    config: LimiterConfig,
    clock: Option<std::sync::Arc<dyn Clock>>,
}

impl ControllerBuilder {
    /// Creates a builder with the default configuration.
    pub fn new() -> Self {
        Self {
            config: LimiterConfig::default(),
            clock: None,
        }
    }

    /// Starts from an existing configuration.
    pub fn from_config(config: LimiterConfig) -> Self {
        Self { config, clock: None }
    }

    /// Replaces (or adds) the policy of one group.
    pub fn group(mut self, group: GroupConfig) -> Self {
        self.config = self.config.with_group(group);
        self
    }

    /// Replaces the classification table.
    pub fn classifier(mut self, classifier: ClassifierConfig) -> Self {
        self.config.classifier = classifier;
        self
    }

    /// Replaces the supervisor settings.
    pub fn supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.config.supervisor = supervisor;
        self
    }

    /// Sets the deadline `acquire` applies when the caller gives none.
    pub fn default_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.config.wait.default_timeout = timeout;
        self
    }

    /// Sets how often a parked head caller re-checks on its own.
    pub fn park_poll_interval(mut self, interval: std::time::Duration) -> Self {
        self.config.wait.park_poll_interval = interval;
        self
    }

    /// Uses `clock` instead of the tokio clock.
    pub fn clock(mut self, clock: std::sync::Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validates the configuration and builds the controller.
    ///
    /// # Errors
    ///
    /// [`AdmissionError::Configuration`] describing the first problem found.
    pub fn try_build(self) -> Result<AdmissionController, AdmissionError> {
        match self.clock {
            Some(clock) => AdmissionController::with_clock(self.config, clock),
            None => AdmissionController::new(self.config),
        }
    }
}

impl Default for ControllerBuilder {
    fn default() -> Self {
        Self::new()
    }
}
