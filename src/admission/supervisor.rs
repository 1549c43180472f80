//! # Self-Healing Supervisor
//!
//! Every group runs two background loops: the queue notifier (wakes the head
//! waiter when it can go) and the recovery scheduler (restores the rate ratio
//! after reductions). The supervisor watches both and restarts whichever
//! finishes, whether it panicked, was aborted or returned.
//!
//! ```text
//!                 health check (every health_check_interval)
//!                              │
//!           ┌──────────────────┴──────────────────┐
//!           ▼                                     ▼
//!       Running ── finished? ──► wake all waiters, schedule restart
//!           ▲                              │ backoff: base, 2×base, … max
//!           │                              ▼
//!           └─────── respawn ────────── Restarting
//!                                          │
//!           died again within stable_after, max_consecutive_failures times
//!                                          ▼
//!                                      Unhealthy  (reported, not restarted)
//! ```
//!
//! While a notifier is down, parked callers keep progressing through their
//! own poll fallback; the forced wake makes every one of them re-check as
//! soon as the failure is noticed.

use super::config::SupervisorConfig;
use super::group::RateLimitGroup;
use super::metrics::LoopStatus;
use super::utils::{lock, saturating_add, RestartBackoff};
use serde::Serialize;
use std::fmt;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// Kind of per-group background loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopKind {
    /// Wakes the head waiter when the engine would admit it.
    QueueNotifier,
    /// Applies recovery ticks to the rate ratio.
    RecoveryScheduler,
}

impl LoopKind {
    /// Both kinds.
    pub const ALL: [LoopKind; 2] = [Self::QueueNotifier, Self::RecoveryScheduler];

    /// Snake-case name used in logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::QueueNotifier => "queue_notifier",
            Self::RecoveryScheduler => "recovery_scheduler",
        }
    }
}

impl fmt::Display for LoopKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a supervised loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    /// Task is alive.
    Running,
    /// Task finished; a restart is scheduled.
    Restarting,
    /// Gave up after too many consecutive failed restarts.
    Unhealthy,
    /// Stopped by shutdown.
    Stopped,
}

#[derive(Debug)]
struct SupervisedLoop {
    group: RateLimitGroup,
    kind: LoopKind,
    handle: Option<JoinHandle<()>>,
    state: LoopState,
    started_at: Instant,
    restart_at: Option<Instant>,
    backoff: RestartBackoff,
    /// Set after a restart until the loop survives `stable_after`
    probation: bool,
    consecutive_failures: u32,
    restarts: u64,
}

impl SupervisedLoop {
    fn status(&self) -> LoopStatus {
        LoopStatus {
            group: self.group,
            kind: self.kind,
            state: self.state,
            restarts: self.restarts,
            consecutive_failures: self.consecutive_failures,
        }
    }
}

/// Watches and restarts the per-group background loops.
#[derive(Debug)]
pub struct SelfHealingSupervisor {
    config: SupervisorConfig,
    loops: Mutex<Vec<SupervisedLoop>>,
}

impl SelfHealingSupervisor {
    pub(crate) fn new(config: SupervisorConfig) -> Self {
        Self {
            config,
            loops: Mutex::new(Vec::new()),
        }
    }

    /// Supervisor settings.
    pub fn config(&self) -> &SupervisorConfig {
        &self.config
    }

    /// Starts supervising a freshly spawned loop, replacing any previous
    /// registration for the same `(group, kind)`.
    pub(crate) fn register(
        &self,
        group: RateLimitGroup,
        kind: LoopKind,
        handle: JoinHandle<()>,
        now: Instant,
    ) {
        let mut loops = lock(&self.loops);
        if let Some(old) = loops.iter_mut().find(|l| l.group == group && l.kind == kind) {
            if let Some(previous) = old.handle.replace(handle) {
                previous.abort();
            }
            old.state = LoopState::Running;
            old.started_at = now;
            old.restart_at = None;
            return;
        }

        loops.push(SupervisedLoop {
            group,
            kind,
            handle: Some(handle),
            state: LoopState::Running,
            started_at: now,
            restart_at: None,
            backoff: RestartBackoff::new(
                self.config.restart_backoff_base,
                self.config.restart_backoff_max,
            ),
            probation: false,
            consecutive_failures: 0,
            restarts: 0,
        });
    }

    /// Aborts one loop, as if it had crashed. The next health check treats
    /// it like any other failure.
    ///
    /// Returns false when no such loop is running.
    pub fn abort_loop(&self, group: RateLimitGroup, kind: LoopKind) -> bool {
        let loops = lock(&self.loops);
        match loops
            .iter()
            .find(|l| l.group == group && l.kind == kind && l.state == LoopState::Running)
            .and_then(|l| l.handle.as_ref())
        {
            Some(handle) => {
                warn!(%group, loop_kind = %kind, "aborting background loop on request");
                handle.abort();
                true
            }
            None => false,
        }
    }

    /// Runs one health check.
    ///
    /// Detects finished loops, schedules or performs their restarts through
    /// `spawn`, and escalates loops that keep dying. Returns the groups whose
    /// waiters must be force-woken (deduplicated).
    pub(crate) fn check<F>(&self, now: Instant, mut spawn: F) -> Vec<RateLimitGroup>
    where
        F: FnMut(RateLimitGroup, LoopKind) -> JoinHandle<()>,
    {
        let mut wake = Vec::new();
        let mut loops = lock(&self.loops);

        for entry in loops.iter_mut() {
            match entry.state {
                LoopState::Running => {
                    let finished = entry.handle.as_ref().map_or(true, |h| h.is_finished());
                    if finished {
                        self.on_loop_finished(entry, now);
                        wake.push(entry.group);
                    } else if entry.probation
                        && now.saturating_duration_since(entry.started_at) >= self.config.stable_after
                    {
                        info!(
                            group = %entry.group,
                            loop_kind = %entry.kind,
                            "background loop stable again after {} restart(s)",
                            entry.restarts
                        );
                        entry.probation = false;
                        entry.consecutive_failures = 0;
                        entry.backoff.reset();
                    }
                }
                LoopState::Restarting | LoopState::Unhealthy | LoopState::Stopped => {}
            }

            if entry.state == LoopState::Restarting && entry.restart_at.map_or(false, |at| at <= now) {
                entry.handle = Some(spawn(entry.group, entry.kind));
                entry.state = LoopState::Running;
                entry.started_at = now;
                entry.restart_at = None;
                entry.probation = true;
                entry.restarts += 1;
                info!(
                    group = %entry.group,
                    loop_kind = %entry.kind,
                    "restarted background loop (restart #{})",
                    entry.restarts
                );
                wake.push(entry.group);
            }
        }

        wake.sort();
        wake.dedup();
        wake
    }

    fn on_loop_finished(&self, entry: &mut SupervisedLoop, now: Instant) {
        let alive_for = now.saturating_duration_since(entry.started_at);
        entry.handle = None;

        if entry.probation && alive_for < self.config.stable_after {
            entry.consecutive_failures += 1;
        } else {
            entry.consecutive_failures = 0;
            entry.backoff.reset();
        }

        if entry.consecutive_failures >= self.config.max_consecutive_failures {
            entry.state = LoopState::Unhealthy;
            entry.restart_at = None;
            error!(
                group = %entry.group,
                loop_kind = %entry.kind,
                "background loop failed {} consecutive restarts; giving up",
                entry.consecutive_failures
            );
            return;
        }

        let delay = entry.backoff.next_delay();
        entry.state = LoopState::Restarting;
        entry.restart_at = Some(saturating_add(now, delay));
        warn!(
            group = %entry.group,
            loop_kind = %entry.kind,
            "background loop stopped after {:?}; restarting in {:?}",
            alive_for,
            delay
        );
    }

    /// When the supervisor should run its next check.
    pub(crate) fn next_check_at(&self, now: Instant) -> Instant {
        let periodic = saturating_add(now, self.config.health_check_interval);
        lock(&self.loops)
            .iter()
            .filter_map(|l| l.restart_at)
            .fold(periodic, Instant::min)
    }

    /// Snapshot of every supervised loop, ordered by group then kind.
    pub fn statuses(&self) -> Vec<LoopStatus> {
        let mut statuses: Vec<_> = lock(&self.loops).iter().map(SupervisedLoop::status).collect();
        statuses.sort_by_key(|s| (s.group, s.kind));
        statuses
    }

    /// Aborts every loop and marks it stopped.
    pub(crate) fn stop_all(&self) {
        for entry in lock(&self.loops).iter_mut() {
            if let Some(handle) = entry.handle.take() {
                handle.abort();
            }
            entry.state = LoopState::Stopped;
            entry.restart_at = None;
        }
    }

    /// Delay before the next restart of `(group, kind)`, if one is pending.
    pub fn pending_restart(&self, group: RateLimitGroup, kind: LoopKind, now: Instant) -> Option<Duration> {
        lock(&self.loops)
            .iter()
            .find(|l| l.group == group && l.kind == kind)
            .and_then(|l| l.restart_at)
            .map(|at| at.saturating_duration_since(now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: RateLimitGroup = RateLimitGroup::PrivateOrder;

    fn config() -> SupervisorConfig {
        SupervisorConfig {
            health_check_interval: Duration::from_secs(1),
            restart_backoff_base: Duration::from_millis(100),
            restart_backoff_max: Duration::from_millis(400),
            stable_after: Duration::from_secs(10),
            max_consecutive_failures: 3,
        }
    }

    fn forever() -> JoinHandle<()> {
        tokio::spawn(std::future::pending::<()>())
    }

    fn dies_immediately() -> JoinHandle<()> {
        tokio::spawn(async {})
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    fn state_of(supervisor: &SelfHealingSupervisor, kind: LoopKind) -> LoopState {
        supervisor
            .statuses()
            .into_iter()
            .find(|s| s.kind == kind)
            .map(|s| s.state)
            .unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_healthy_loops_are_left_alone() {
        let supervisor = SelfHealingSupervisor::new(config());
        let now = Instant::now();
        supervisor.register(GROUP, LoopKind::QueueNotifier, forever(), now);
        supervisor.register(GROUP, LoopKind::RecoveryScheduler, forever(), now);

        let woken = supervisor.check(Instant::now(), |_, _| panic!("nothing to restart"));
        assert!(woken.is_empty());
        assert_eq!(supervisor.statuses().len(), 2);
        assert!(supervisor
            .statuses()
            .iter()
            .all(|s| s.state == LoopState::Running));
    }

    #[tokio::test(start_paused = true)]
    async fn test_aborted_loop_is_restarted_after_backoff() {
        let supervisor = SelfHealingSupervisor::new(config());
        supervisor.register(GROUP, LoopKind::QueueNotifier, forever(), Instant::now());

        assert!(supervisor.abort_loop(GROUP, LoopKind::QueueNotifier));
        settle().await;

        let t1 = Instant::now();
        let woken = supervisor.check(t1, |_, _| panic!("restart is delayed"));
        assert_eq!(woken, vec![GROUP]);
        assert_eq!(state_of(&supervisor, LoopKind::QueueNotifier), LoopState::Restarting);
        assert_eq!(
            supervisor.pending_restart(GROUP, LoopKind::QueueNotifier, t1),
            Some(Duration::from_millis(100))
        );
        assert_eq!(supervisor.next_check_at(t1), t1 + Duration::from_millis(100));

        let mut spawned = 0;
        let woken = supervisor.check(t1 + Duration::from_millis(100), |group, kind| {
            assert_eq!((group, kind), (GROUP, LoopKind::QueueNotifier));
            spawned += 1;
            forever()
        });
        assert_eq!(spawned, 1);
        assert_eq!(woken, vec![GROUP]);

        let status = supervisor.statuses()[0];
        assert_eq!(status.state, LoopState::Running);
        assert_eq!(status.restarts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_failures_escalate() {
        let supervisor = SelfHealingSupervisor::new(config());
        supervisor.register(GROUP, LoopKind::RecoveryScheduler, dies_immediately(), Instant::now());

        let mut restarts = 0;
        for _ in 0..20 {
            settle().await;
            supervisor.check(Instant::now(), |_, _| {
                restarts += 1;
                dies_immediately()
            });
            if state_of(&supervisor, LoopKind::RecoveryScheduler) == LoopState::Unhealthy {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        assert_eq!(state_of(&supervisor, LoopKind::RecoveryScheduler), LoopState::Unhealthy);
        assert_eq!(restarts, 3);

        // No further restarts once unhealthy
        settle().await;
        supervisor.check(Instant::now(), |_, _| panic!("unhealthy loops stay down"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stable_loop_resets_failure_count() {
        let supervisor = SelfHealingSupervisor::new(config());
        supervisor.register(GROUP, LoopKind::QueueNotifier, dies_immediately(), Instant::now());

        // Restarts that die right away
        for _ in 0..2 {
            settle().await;
            supervisor.check(Instant::now(), |_, _| dies_immediately());
            tokio::time::sleep(Duration::from_millis(500)).await;
            supervisor.check(Instant::now(), |_, _| dies_immediately());
        }
        settle().await;
        supervisor.check(Instant::now(), |_, _| forever());
        tokio::time::sleep(Duration::from_millis(500)).await;
        supervisor.check(Instant::now(), |_, _| forever());
        assert_eq!(state_of(&supervisor, LoopKind::QueueNotifier), LoopState::Running);
        assert!(supervisor.statuses()[0].consecutive_failures > 0);

        // Survives stable_after
        tokio::time::sleep(Duration::from_secs(11)).await;
        supervisor.check(Instant::now(), |_, _| forever());
        assert_eq!(supervisor.statuses()[0].consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_all() {
        let supervisor = SelfHealingSupervisor::new(config());
        supervisor.register(GROUP, LoopKind::QueueNotifier, forever(), Instant::now());
        supervisor.stop_all();

        assert_eq!(state_of(&supervisor, LoopKind::QueueNotifier), LoopState::Stopped);
        assert!(!supervisor.abort_loop(GROUP, LoopKind::QueueNotifier));
        settle().await;
        assert!(supervisor.check(Instant::now(), |_, _| forever()).is_empty());
    }
}
