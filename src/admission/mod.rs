//! # Admission Module
//!
//! Internal implementation of the controller, one submodule per concern.
//!
//! ## Module Structure
//!
//! ```text
//!     admission/
//!     ├── mod.rs          (You are here - Module organization)
//!     ├── group.rs        (Rate-limit groups and endpoint classification)
//!     ├── config.rs       (Policies, TOML loading and validation)
//!     ├── utils.rs        (Clock, restart backoff, lock helper)
//!     ├── ledger.rs       (Committed calls inside the burst window)
//!     ├── core.rs         (Hybrid GCRA/window admission engine)
//!     ├── adjuster.rs     (Rate reduction on rejections, slow recovery)
//!     ├── throttle.rs     (Preventive delay while rejections are recent)
//!     ├── queue.rs        (FIFO of parked callers)
//!     ├── supervisor.rs   (Restarts crashed background loops)
//!     ├── metrics.rs      (Status snapshots and health)
//!     └── manager.rs      (AdmissionController facade)
//! ```
//!
//! ## Architecture Flow
//!
//! ```text
//!     Caller
//!        │
//!        ▼
//!     ┌─────────┐
//!     │ Manager │ ◄── classify, park, wake, commit, reject
//!     └────┬────┘
//!          │
//!          ▼
//!     ┌─────────┐      ┌──────────┐      ┌──────────┐
//!     │  Core   │ ◄─── │ Adjuster │ ◄─── │ Throttle │  rate ratio / risk
//!     └────┬────┘      └──────────┘      └──────────┘
//!          │
//!          ▼
//!     ┌─────────┐      ┌────────────┐
//!     │  Queue  │ ◄─── │ Supervisor │  notifier + recovery loops
//!     └─────────┘      └────────────┘
//! ```

mod adjuster;
mod config;
mod core;
mod group;
mod ledger;
mod manager;
mod metrics;
mod queue;
mod supervisor;
mod throttle;
mod utils;

/// Groups and endpoint classification
pub use group::{ClassifierConfig, GroupClassifier, MethodOverride, PrefixRule, RateLimitGroup};

/// Configuration types
pub use config::{GroupConfig, LimiterConfig, SupervisorConfig, WaitConfig};

/// Time source
pub use utils::{Clock, TokioClock};

/// Admission engine and its building blocks
pub use self::core::{AdmissionState, Decision, Evaluation, HybridAdmissionEngine};
pub use adjuster::{DynamicAdjuster, Reduction, RejectionHint};
pub use ledger::CommitLedger;
pub use queue::{Ticket, WaitQueue, Waiter, Wake};
pub use throttle::PreventiveThrottler;

/// Supervision
pub use supervisor::{LoopKind, LoopState, SelfHealingSupervisor};

/// Status reporting
pub use metrics::{ControllerStatus, GroupStatus, HealthStatus, LoopStatus};

/// Public facade
pub use manager::{Admission, AdmissionController};
