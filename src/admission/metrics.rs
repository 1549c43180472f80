//! # Status Reporting
//!
//! Point-in-time snapshots of every group and every background loop, for
//! dashboards, health checks and logs.
//!
//! ```text
//!     Controller Status:
//!     ┌─────────────────────────────────────────┐
//!     │  private_order   ratio 0.80  (8.0/s)    │
//!     │  window 3/10   queue 2   rejections 1   │
//!     │                                         │
//!     │  private_order/queue_notifier  Running  │
//!     │  private_order/recovery_sched. Running  │
//!     │                                         │
//!     │  Health: ⚠️ Degraded                    │
//!     └─────────────────────────────────────────┘
//! ```
//!
//! Snapshots serialize with `serde`, so they can be exposed as JSON as-is.

use super::group::RateLimitGroup;
use super::supervisor::{LoopKind, LoopState};
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Snapshot of one group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupStatus {
    /// Group reported on.
    pub group: RateLimitGroup,

    /// Current multiplier on the base rate.
    pub rate_ratio: f64,

    /// `base_rate_per_second × rate_ratio`.
    pub effective_rate: f64,

    /// How far the GCRA schedule runs ahead of now (zero when idle).
    pub schedule_lead: Duration,

    /// Committed calls inside the burst window.
    pub window_occupancy: usize,

    /// Configured burst capacity.
    pub burst_capacity: u32,

    /// Callers currently parked.
    pub queue_depth: usize,

    /// Wait of the longest-parked caller.
    pub oldest_wait: Duration,

    /// Parked callers already past their deadline.
    pub overdue_waiters: usize,

    /// Rejections still inside the rejection window.
    pub recent_rejections: usize,

    /// Delay the preventive throttler would impose right now.
    pub preventive_delay: Duration,

    /// Time until the next recovery tick, `None` at full rate.
    pub next_recovery_in: Option<Duration>,

    /// Requests admitted since start.
    pub total_admitted: u64,

    /// Calls committed since start.
    pub total_committed: u64,

    /// Rejections reported since start.
    pub total_rejections: u64,

    /// Callers that gave up on their deadline.
    pub total_timeouts: u64,

    /// Re-checks that ended with the caller parked again.
    pub total_requeues: u64,

    /// Longest wait observed before admission, in nanoseconds.
    pub max_wait_ns: u64,
}

impl GroupStatus {
    /// Fraction of the burst window in use (0.0 to 1.0).
    #[inline]
    pub fn window_utilization(&self) -> f64 {
        if self.burst_capacity == 0 {
            0.0
        } else {
            (self.window_occupancy as f64 / self.burst_capacity as f64).min(1.0)
        }
    }

    /// True while the group runs below its base rate.
    #[inline]
    pub fn is_reduced(&self) -> bool {
        self.rate_ratio < 1.0
    }

    /// Longest observed wait in milliseconds.
    #[inline]
    pub fn max_wait_ms(&self) -> f64 {
        self.max_wait_ns as f64 / 1_000_000.0
    }

    /// Degraded while reduced or with rejections on record.
    pub fn health_status(&self) -> HealthStatus {
        if self.is_reduced() || self.recent_rejections > 0 {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }
}

/// Snapshot of one supervised background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LoopStatus {
    /// Group the loop serves.
    pub group: RateLimitGroup,
    /// Which loop.
    pub kind: LoopKind,
    /// Lifecycle state.
    pub state: LoopState,
    /// Restarts since start.
    pub restarts: u64,
    /// Failed restarts in a row.
    pub consecutive_failures: u32,
}

/// Snapshot of the whole controller, returned by
/// [`AdmissionController::get_status`](crate::AdmissionController::get_status).
///
/// # Example
///
/// ```rust
/// use zero429::{AdmissionController, HealthStatus, LimiterConfig};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let controller = AdmissionController::new(LimiterConfig::default()).unwrap();
/// let status = controller.get_status();
///
/// assert_eq!(status.groups.len(), 5);
/// assert_eq!(status.health_status(), HealthStatus::Healthy);
/// println!("{}", status.summary());
/// # }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControllerStatus {
    /// Whether background loops have been started and not shut down.
    pub running: bool,
    /// Time since `start()`, zero before it.
    pub uptime: Duration,
    /// One entry per configured group, ordered by group.
    pub groups: Vec<GroupStatus>,
    /// One entry per supervised loop, ordered by group then kind.
    pub loops: Vec<LoopStatus>,
}

impl ControllerStatus {
    /// Status of one group.
    pub fn group(&self, group: RateLimitGroup) -> Option<&GroupStatus> {
        self.groups.iter().find(|g| g.group == group)
    }

    /// Loops escalated to unhealthy.
    pub fn unhealthy_loops(&self) -> impl Iterator<Item = &LoopStatus> + '_ {
        self.loops.iter().filter(|l| l.state == LoopState::Unhealthy)
    }

    /// Total callers parked across all groups.
    pub fn total_queued(&self) -> usize {
        self.groups.iter().map(|g| g.queue_depth).sum()
    }

    /// Overall health.
    ///
    /// - **Unhealthy**: a loop was given up on
    /// - **Degraded**: a loop is restarting, or a group runs reduced
    /// - **Healthy**: otherwise
    pub fn health_status(&self) -> HealthStatus {
        if self.unhealthy_loops().next().is_some() {
            HealthStatus::Unhealthy
        } else if self.loops.iter().any(|l| l.state == LoopState::Restarting)
            || self.groups.iter().any(|g| g.health_status().is_unhealthy())
        {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Human-readable report.
    ///
    /// # Example Output
    ///
    /// ```text
    /// Admission Controller Status:
    /// ├─ Running: true (uptime 12.0s)
    /// ├─ Groups:
    /// │  ├─ private_order: ratio 0.800 (8.00/s), window 3/10, queue 2, rejections 1
    /// │  └─ public_read: ratio 1.000 (20.00/s), window 0/20, queue 0, rejections 0
    /// ├─ Loops:
    /// │  ├─ private_order/queue_notifier: Running (restarts 0)
    /// │  └─ private_order/recovery_scheduler: Running (restarts 0)
    /// └─ Health: ⚠️ Degraded
    /// ```
    pub fn summary(&self) -> String {
        let mut out = format!(
            "Admission Controller Status:\n\
             ├─ Running: {} (uptime {:.1}s)\n\
             ├─ Groups:\n",
            self.running,
            self.uptime.as_secs_f64()
        );

        for (i, g) in self.groups.iter().enumerate() {
            let branch = if i + 1 == self.groups.len() { "└─" } else { "├─" };
            out.push_str(&format!(
                "│  {} {}: ratio {:.3} ({:.2}/s), window {}/{}, queue {}, rejections {}\n",
                branch,
                g.group,
                g.rate_ratio,
                g.effective_rate,
                g.window_occupancy,
                g.burst_capacity,
                g.queue_depth,
                g.recent_rejections
            ));
        }

        out.push_str("├─ Loops:\n");
        for (i, l) in self.loops.iter().enumerate() {
            let branch = if i + 1 == self.loops.len() { "└─" } else { "├─" };
            out.push_str(&format!(
                "│  {} {}/{}: {:?} (restarts {})\n",
                branch, l.group, l.kind, l.state, l.restarts
            ));
        }

        out.push_str(&format!("└─ Health: {}", self.health_status()));
        out
    }
}

impl fmt::Display for ControllerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.summary())
    }
}

/// Three-level health assessment.
///
/// ```text
///     Healthy ──────► every loop running, every group at full rate
///        │
///     Degraded ─────► reduced rate or a loop restarting; still serving
///        │
///     Unhealthy ────► a loop ran out of restarts
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Operating normally.
    Healthy,
    /// Serving, but adapting to rejections or recovering a loop.
    Degraded,
    /// A background loop is down for good; callers rely on the poll fallback.
    Unhealthy,
}

impl HealthStatus {
    /// Returns true for anything but [`HealthStatus::Healthy`].
    pub fn is_unhealthy(&self) -> bool {
        !matches!(self, Self::Healthy)
    }

    /// Suggested operator action.
    pub fn suggested_action(&self) -> &'static str {
        match self {
            Self::Healthy => "No action needed",
            Self::Degraded => "Monitor closely: the exchange is pushing back or a loop is restarting",
            Self::Unhealthy => "Immediate action required: restart the controller",
        }
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => write!(f, "✅ Healthy"),
            Self::Degraded => write!(f, "⚠️ Degraded"),
            Self::Unhealthy => write!(f, "🔴 Unhealthy"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group_status(group: RateLimitGroup) -> GroupStatus {
        GroupStatus {
            group,
            rate_ratio: 1.0,
            effective_rate: 10.0,
            schedule_lead: Duration::ZERO,
            window_occupancy: 3,
            burst_capacity: 10,
            queue_depth: 2,
            oldest_wait: Duration::from_millis(40),
            overdue_waiters: 0,
            recent_rejections: 0,
            preventive_delay: Duration::ZERO,
            next_recovery_in: None,
            total_admitted: 100,
            total_committed: 90,
            total_rejections: 0,
            total_timeouts: 1,
            total_requeues: 4,
            max_wait_ns: 1_500_000,
        }
    }

    fn loop_status(kind: LoopKind, state: LoopState) -> LoopStatus {
        LoopStatus {
            group: RateLimitGroup::PrivateOrder,
            kind,
            state,
            restarts: 0,
            consecutive_failures: 0,
        }
    }

    fn status() -> ControllerStatus {
        ControllerStatus {
            running: true,
            uptime: Duration::from_secs(12),
            groups: vec![
                group_status(RateLimitGroup::PublicRead),
                group_status(RateLimitGroup::PrivateOrder),
            ],
            loops: vec![
                loop_status(LoopKind::QueueNotifier, LoopState::Running),
                loop_status(LoopKind::RecoveryScheduler, LoopState::Running),
            ],
        }
    }

    #[test]
    fn test_group_calculations() {
        let g = group_status(RateLimitGroup::PrivateOrder);
        assert!((g.window_utilization() - 0.3).abs() < 1e-12);
        assert!(!g.is_reduced());
        assert_eq!(g.max_wait_ms(), 1.5);
        assert_eq!(g.health_status(), HealthStatus::Healthy);

        let reduced = GroupStatus {
            rate_ratio: 0.8,
            ..g
        };
        assert!(reduced.is_reduced());
        assert_eq!(reduced.health_status(), HealthStatus::Degraded);
    }

    #[test]
    fn test_controller_health() {
        let mut s = status();
        assert_eq!(s.health_status(), HealthStatus::Healthy);
        assert_eq!(s.total_queued(), 4);

        s.loops[0].state = LoopState::Restarting;
        assert_eq!(s.health_status(), HealthStatus::Degraded);

        s.loops[1].state = LoopState::Unhealthy;
        assert_eq!(s.health_status(), HealthStatus::Unhealthy);
        assert_eq!(s.unhealthy_loops().count(), 1);
    }

    #[test]
    fn test_summary() {
        let s = status();
        let summary = s.summary();
        assert!(summary.contains("Admission Controller Status"));
        assert!(summary.contains("private_order: ratio 1.000"));
        assert!(summary.contains("private_order/queue_notifier: Running"));
        assert!(summary.contains("Healthy"));
        assert_eq!(format!("{}", s), summary);
    }

    #[test]
    fn test_status_serializes() {
        let json = serde_json::to_value(status()).unwrap();
        assert_eq!(json["groups"][1]["group"], "private_order");
        assert_eq!(json["loops"][0]["kind"], "queue_notifier");
        assert_eq!(json["loops"][0]["state"], "running");
    }

    #[test]
    fn test_health_status_methods() {
        assert!(!HealthStatus::Healthy.is_unhealthy());
        assert!(HealthStatus::Degraded.is_unhealthy());
        assert!(HealthStatus::Unhealthy.is_unhealthy());
        assert!(HealthStatus::Unhealthy.suggested_action().contains("Immediate"));
        assert!(format!("{}", HealthStatus::Degraded).contains("Degraded"));
    }
}
