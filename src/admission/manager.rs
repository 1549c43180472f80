//! # Admission Controller
//!
//! Public facade tying the pieces together. One controller serves every
//! group; each group lives in its own slot with a single lock over its pacing
//! state and wait queue.
//!
//! ## Request Lifecycle
//!
//! ```text
//!     acquire(endpoint, method)
//!          │
//!          ▼
//!     classify ──► preventive delay (only with recent rejections)
//!          │
//!          ▼
//!     ┌──────────────────────────── group lock ───┐
//!     │ queue empty && engine admits?             │──yes──► Admission
//!     │ otherwise park at the tail                │
//!     └───────────────────────────────────────────┘
//!          │
//!          ▼                     ┌─────────────────┐
//!     await wake ◄───────────────│ queue notifier  │ sleeps until the head
//!          │                     └─────────────────┘ could go, then wakes it
//!          ▼
//!     head && engine admits? ──yes──► Admission
//!          │ no
//!          └──► re-armed in place, notifier recomputes
//!
//!     real call ──► ok ──► commit()       (fills a window slot)
//!               └─► 429 ──► notify_rejection()  (slows the group down)
//! ```
//!
//! ## Slots
//!
//! ```text
//!     DashMap<RateLimitGroup, Arc<GroupSlot>>
//!     ┌──────────────────┬──────────────────────────────────────────┐
//!     │ public_read      │ Mutex{state, queue} + kick + counters    │
//!     │ private_order    │ Mutex{state, queue} + kick + counters    │
//!     │ …                │                                          │
//!     └──────────────────┴──────────────────────────────────────────┘
//! ```
//!
//! The lock is a plain `std::sync::Mutex`, only ever held for a handful of
//! arithmetic steps and never across an `.await`.

use super::adjuster::{DynamicAdjuster, RejectionHint};
use super::config::{GroupConfig, LimiterConfig, WaitConfig};
use super::core::{AdmissionState, Decision, HybridAdmissionEngine};
use super::group::{GroupClassifier, RateLimitGroup};
use super::metrics::{ControllerStatus, GroupStatus};
use super::queue::{Ticket, WaitQueue, Wake};
use super::supervisor::{LoopKind, SelfHealingSupervisor};
use super::throttle::PreventiveThrottler;
use super::utils::{lock, saturating_add, Clock, TokioClock};
use crate::error::{AdmissionError, ConfigError};
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, error, info, warn};

/// Successful admission handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Admission {
    /// Group the request was paced under.
    pub group: RateLimitGroup,
    /// Total time spent before admission, preventive delay included.
    pub waited: Duration,
    /// Times the caller was woken, denied and parked again.
    pub requeues: u32,
}

/// State guarded by a group's lock.
#[derive(Debug)]
struct GroupInner {
    state: AdmissionState,
    queue: WaitQueue,
}

/// Result of a fresh caller's first look at the group.
enum Entry {
    Admitted(Instant),
    Parked(Ticket, oneshot::Receiver<Wake>),
}

/// Result of a parked caller's re-check.
enum Recheck {
    Admitted(Instant),
    /// Denied or not at the head yet; wait on the new receiver.
    Rearmed(oneshot::Receiver<Wake>, bool),
    /// Not at the head; keep waiting on the current receiver.
    KeepWaiting,
    TimedOut(Instant),
    Closed,
}

/// Everything the controller keeps for one group.
#[derive(Debug)]
pub(crate) struct GroupSlot {
    config: GroupConfig,
    inner: Mutex<GroupInner>,
    /// Wakes the queue notifier
    kick: Notify,
    /// Wakes the recovery scheduler after a reduction
    rate_changed: Notify,
    closed: AtomicBool,

    total_admitted: AtomicU64,
    total_committed: AtomicU64,
    total_rejections: AtomicU64,
    total_timeouts: AtomicU64,
    total_requeues: AtomicU64,
    max_wait_ns: AtomicU64,
}

impl GroupSlot {
    fn new(config: GroupConfig, now: Instant) -> Self {
        let inner = GroupInner {
            state: AdmissionState::new(&config, now),
            queue: WaitQueue::new(config.group),
        };
        Self {
            config,
            inner: Mutex::new(inner),
            kick: Notify::new(),
            rate_changed: Notify::new(),
            closed: AtomicBool::new(false),
            total_admitted: AtomicU64::new(0),
            total_committed: AtomicU64::new(0),
            total_rejections: AtomicU64::new(0),
            total_timeouts: AtomicU64::new(0),
            total_requeues: AtomicU64::new(0),
            max_wait_ns: AtomicU64::new(0),
        }
    }

    #[inline]
    fn group(&self) -> RateLimitGroup {
        self.config.group
    }

    #[inline]
    fn engine(&self) -> HybridAdmissionEngine<'_> {
        HybridAdmissionEngine::new(&self.config)
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Prunes stale rejections and returns the preventive delay.
    fn preventive_delay(&self, now: Instant) -> Duration {
        let mut inner = lock(&self.inner);
        DynamicAdjuster::new(&self.config).prune_history(&mut inner.state, now);
        PreventiveThrottler::new(&self.config).extra_delay(&inner.state, now)
    }

    /// Admits a fresh caller or parks it behind everyone already waiting.
    fn enter(&self, now: Instant, deadline: Instant) -> Entry {
        let mut inner = lock(&self.inner);
        if inner.queue.is_empty() && self.engine().try_admit(&mut inner.state, now).decision.is_admit() {
            return Entry::Admitted(now);
        }
        let (ticket, rx) = inner.queue.enqueue(now, deadline);
        Entry::Parked(ticket, rx)
    }

    /// Re-check for a parked caller, under the group lock.
    ///
    /// `woken` is false when the caller got here through its poll timer.
    fn recheck(
        &self,
        ticket: Ticket,
        enqueued_at: Instant,
        deadline: Instant,
        woken: bool,
        now: Instant,
    ) -> Recheck {
        let mut inner = lock(&self.inner);

        if self.is_closed() {
            inner.queue.remove(ticket);
            return Recheck::Closed;
        }

        if !woken {
            if now >= deadline {
                inner.queue.remove(ticket);
                return Recheck::TimedOut(now);
            }
            if !inner.queue.is_head(ticket) {
                return Recheck::KeepWaiting;
            }
            debug!(
                group = %self.group(),
                ticket = ticket.get(),
                "head waiter re-checking without a wake"
            );
        }

        if !inner.queue.contains(ticket) {
            // Entry vanished without a message; put it back where it was
            let rx = inner.queue.rearm(ticket, enqueued_at, deadline);
            return Recheck::Rearmed(rx, false);
        }

        if !inner.queue.is_head(ticket) {
            let rx = inner.queue.rearm(ticket, enqueued_at, deadline);
            return Recheck::Rearmed(rx, false);
        }

        let evaluation = self.engine().try_admit(&mut inner.state, now);
        match evaluation.decision {
            Decision::Admit => {
                inner.queue.remove(ticket);
                Recheck::Admitted(now)
            }
            Decision::Wait(wait) => {
                debug!(
                    group = %self.group(),
                    ticket = ticket.get(),
                    wait_ms = wait.as_secs_f64() * 1000.0,
                    "woken waiter denied; re-armed at its position"
                );
                let rx = inner.queue.rearm(ticket, enqueued_at, deadline);
                Recheck::Rearmed(rx, true)
            }
        }
    }

    fn remove_waiter(&self, ticket: Ticket) {
        lock(&self.inner).queue.remove(ticket);
        self.kick.notify_one();
    }

    /// Forces every parked caller to re-check.
    fn force_wake(&self) -> usize {
        let woken = lock(&self.inner).queue.wake_all();
        self.kick.notify_one();
        woken
    }

    /// Closes the slot and fails every parked caller.
    fn close(&self) -> usize {
        self.closed.store(true, Ordering::Release);
        lock(&self.inner).queue.drain()
    }

    fn admitted(&self, started: Instant, now: Instant, requeues: u32) -> Admission {
        let waited = now.saturating_duration_since(started);
        self.total_admitted.fetch_add(1, Ordering::Relaxed);
        self.total_requeues.fetch_add(requeues as u64, Ordering::Relaxed);
        let waited_ns = u64::try_from(waited.as_nanos()).unwrap_or(u64::MAX);
        self.max_wait_ns.fetch_max(waited_ns, Ordering::Relaxed);
        Admission {
            group: self.group(),
            waited,
            requeues,
        }
    }

    fn timed_out(&self, started: Instant, now: Instant) -> AdmissionError {
        let waited = now.saturating_duration_since(started);
        self.total_timeouts.fetch_add(1, Ordering::Relaxed);
        debug!(group = %self.group(), waited_ms = waited.as_millis() as u64, "admission wait timed out");
        AdmissionError::WaitTimeout {
            group: self.group(),
            waited,
        }
    }

    fn status(&self, now: Instant) -> GroupStatus {
        let mut inner = lock(&self.inner);
        let adjuster = DynamicAdjuster::new(&self.config);
        adjuster.prune_history(&mut inner.state, now);
        inner.state.ledger.prune(now, self.config.burst_window);

        let state = &inner.state;
        GroupStatus {
            group: self.group(),
            rate_ratio: state.rate_ratio(),
            effective_rate: self.config.effective_rate(state.rate_ratio()),
            schedule_lead: state.tat().saturating_duration_since(now),
            window_occupancy: state.window_occupancy(),
            burst_capacity: self.config.burst_capacity,
            queue_depth: inner.queue.len(),
            oldest_wait: inner.queue.oldest_wait(now),
            overdue_waiters: inner.queue.overdue(now),
            recent_rejections: state.rejection_history().len(),
            preventive_delay: PreventiveThrottler::new(&self.config).extra_delay(state, now),
            next_recovery_in: adjuster
                .next_recovery_at(state)
                .map(|at| at.saturating_duration_since(now)),
            total_admitted: self.total_admitted.load(Ordering::Relaxed),
            total_committed: self.total_committed.load(Ordering::Relaxed),
            total_rejections: self.total_rejections.load(Ordering::Relaxed),
            total_timeouts: self.total_timeouts.load(Ordering::Relaxed),
            total_requeues: self.total_requeues.load(Ordering::Relaxed),
            max_wait_ns: self.max_wait_ns.load(Ordering::Relaxed),
        }
    }
}

/// RAII guard removing a parked caller from its queue.
///
/// Covers cancellation: if the `acquire` future is dropped mid-wait, the
/// entry is removed under the group lock and the notifier re-targets.
struct WaiterGuard<'a> {
    slot: &'a GroupSlot,
    ticket: Ticket,
    armed: bool,
}

impl<'a> WaiterGuard<'a> {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl<'a> Drop for WaiterGuard<'a> {
    fn drop(&mut self) {
        if self.armed {
            self.slot.remove_waiter(self.ticket);
        }
    }
}

/// State shared between the controller handles and its background tasks.
struct Shared {
    slots: DashMap<RateLimitGroup, Arc<GroupSlot>, ahash::RandomState>,
    classifier: GroupClassifier,
    wait: WaitConfig,
    supervisor: SelfHealingSupervisor,
    clock: Arc<dyn Clock>,
    running: AtomicBool,
    shut_down: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    supervisor_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    fn slot(&self, group: RateLimitGroup) -> Result<Arc<GroupSlot>, AdmissionError> {
        self.slots
            .get(&group)
            .map(|slot| Arc::clone(slot.value()))
            .ok_or(AdmissionError::Configuration(ConfigError::UnconfiguredGroup(group)))
    }

    fn spawn_loop(&self, group: RateLimitGroup, kind: LoopKind) -> JoinHandle<()> {
        let Some(slot) = self.slots.get(&group).map(|s| Arc::clone(s.value())) else {
            // Unreachable for configured groups; exits so the supervisor escalates
            error!(%group, loop_kind = %kind, "no slot for background loop");
            return tokio::spawn(async {});
        };
        let clock = Arc::clone(&self.clock);
        match kind {
            LoopKind::QueueNotifier => tokio::spawn(queue_notifier(slot, clock)),
            LoopKind::RecoveryScheduler => tokio::spawn(recovery_scheduler(slot, clock)),
        }
    }

    fn stop_background(&self) {
        self.supervisor.stop_all();
        if let Some(task) = lock(&self.supervisor_task).take() {
            task.abort();
        }
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.stop_background();
    }
}

/// Adaptive admission controller for an exchange API client.
///
/// Cheap to clone; all clones share the same groups and background loops.
///
/// # Example
///
/// ```rust
/// use zero429::{AdmissionController, LimiterConfig, RejectionHint};
/// use std::time::Duration;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), zero429::AdmissionError> {
/// let controller = AdmissionController::new(LimiterConfig::default())?;
/// controller.start();
///
/// let admission = controller.acquire("/private/v1/order", "POST").await?;
/// // ... perform the real call ...
/// let accepted = true;
/// if accepted {
///     controller.commit("/private/v1/order", "POST");
/// } else {
///     controller.notify_rejection(
///         "/private/v1/order",
///         "POST",
///         Some(RejectionHint::retry_after(Duration::from_secs(1))),
///     );
/// }
///
/// println!("waited {:?} in {}", admission.waited, admission.group);
/// controller.shutdown().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct AdmissionController {
    shared: Arc<Shared>,
}

impl AdmissionController {
    /// Builds a controller on the tokio clock.
    ///
    /// Background loops are not running until [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// [`AdmissionError::Configuration`] when the configuration is invalid.
    pub fn new(config: LimiterConfig) -> Result<Self, AdmissionError> {
        Self::with_clock(config, Arc::new(TokioClock))
    }

    /// Builds a controller reading time from `clock`.
    pub fn with_clock(config: LimiterConfig, clock: Arc<dyn Clock>) -> Result<Self, AdmissionError> {
        config.validate()?;

        let now = clock.now();
        let slots = DashMap::with_capacity_and_hasher(config.groups.len(), ahash::RandomState::new());
        for group in &config.groups {
            slots.insert(group.group, Arc::new(GroupSlot::new(group.clone(), now)));
        }

        info!(
            "Created admission controller ({} groups, default group {})",
            config.groups.len(),
            config.classifier.default_group
        );

        Ok(Self {
            shared: Arc::new(Shared {
                slots,
                classifier: GroupClassifier::new(&config.classifier),
                wait: config.wait,
                supervisor: SelfHealingSupervisor::new(config.supervisor),
                clock,
                running: AtomicBool::new(false),
                shut_down: AtomicBool::new(false),
                started_at: Mutex::new(None),
                supervisor_task: Mutex::new(None),
            }),
        })
    }

    /// Spawns the per-group loops and the supervisor.
    ///
    /// Idempotent; does nothing after shutdown.
    ///
    /// # Panics
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) {
        let shared = &self.shared;
        if shared.shut_down.load(Ordering::Acquire) || shared.running.swap(true, Ordering::AcqRel) {
            return;
        }

        let now = shared.clock.now();
        *lock(&shared.started_at) = Some(now);

        for group in RateLimitGroup::ALL {
            if !shared.slots.contains_key(&group) {
                continue;
            }
            for kind in LoopKind::ALL {
                let handle = shared.spawn_loop(group, kind);
                shared.supervisor.register(group, kind, handle, now);
            }
        }

        let task = tokio::spawn(supervise(Arc::downgrade(shared)));
        *lock(&shared.supervisor_task) = Some(task);

        info!(
            "Started admission controller (health check every {:?})",
            shared.supervisor.config().health_check_interval
        );
    }

    /// Stops every background loop and fails parked callers with
    /// [`AdmissionError::Shutdown`]. Later calls to `acquire` fail the same
    /// way.
    pub async fn shutdown(&self) {
        let shared = &self.shared;
        if shared.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        shared.running.store(false, Ordering::Release);

        shared.supervisor.stop_all();
        let task = lock(&shared.supervisor_task).take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }

        let mut drained = 0;
        for slot in shared.slots.iter() {
            drained += slot.value().close();
        }
        info!("Admission controller shut down ({} parked callers released)", drained);
    }

    /// Waits for admission under the default timeout.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::WaitTimeout`] when `wait.default_timeout` passes
    /// - [`AdmissionError::Shutdown`] when the controller stops meanwhile
    pub async fn acquire(&self, endpoint: &str, method: &str) -> Result<Admission, AdmissionError> {
        let deadline = saturating_add(self.shared.clock.now(), self.shared.wait.default_timeout);
        self.acquire_until(endpoint, method, deadline).await
    }

    /// Waits for admission for at most `timeout`.
    pub async fn acquire_timeout(
        &self,
        endpoint: &str,
        method: &str,
        timeout: Duration,
    ) -> Result<Admission, AdmissionError> {
        let deadline = saturating_add(self.shared.clock.now(), timeout);
        self.acquire_until(endpoint, method, deadline).await
    }

    /// Waits for admission until an absolute deadline.
    ///
    /// Dropping the returned future before it resolves cancels the wait and
    /// removes the caller from its queue.
    pub async fn acquire_until(
        &self,
        endpoint: &str,
        method: &str,
        deadline: Instant,
    ) -> Result<Admission, AdmissionError> {
        let shared = &self.shared;
        let group = shared.classifier.classify(endpoint, method);
        let slot = shared.slot(group)?;
        if slot.is_closed() {
            return Err(AdmissionError::Shutdown);
        }

        let started = shared.clock.now();

        let extra = slot.preventive_delay(started);
        if !extra.is_zero() {
            debug!(%group, delay_ms = extra.as_millis() as u64, "preventive delay");
            let until = saturating_add(started, extra);
            if until >= deadline {
                sleep_until(deadline).await;
                return Err(slot.timed_out(started, shared.clock.now()));
            }
            sleep_until(until).await;
            if slot.is_closed() {
                return Err(AdmissionError::Shutdown);
            }
        }

        let enqueued_at = shared.clock.now();
        let (ticket, mut rx) = match slot.enter(enqueued_at, deadline) {
            Entry::Admitted(now) => return Ok(slot.admitted(started, now, 0)),
            Entry::Parked(ticket, rx) => (ticket, rx),
        };
        slot.kick.notify_one();

        let mut guard = WaiterGuard {
            slot: &slot,
            ticket,
            armed: true,
        };
        let mut requeues = 0u32;

        loop {
            let poll_at =
                saturating_add(shared.clock.now(), shared.wait.park_poll_interval).min(deadline);
            let woken = match timeout_at(poll_at, &mut rx).await {
                Ok(Ok(Wake::Recheck)) => true,
                Ok(Ok(Wake::Shutdown)) => {
                    guard.disarm();
                    return Err(AdmissionError::Shutdown);
                }
                // Sender dropped without a message; the re-check re-arms
                Ok(Err(_)) => true,
                Err(_) => false,
            };

            match slot.recheck(ticket, enqueued_at, deadline, woken, shared.clock.now()) {
                Recheck::Admitted(now) => {
                    guard.disarm();
                    slot.kick.notify_one();
                    return Ok(slot.admitted(started, now, requeues));
                }
                Recheck::Rearmed(next, denied) => {
                    rx = next;
                    if denied {
                        requeues += 1;
                    }
                    slot.kick.notify_one();
                }
                Recheck::KeepWaiting => {}
                Recheck::TimedOut(now) => {
                    guard.disarm();
                    slot.kick.notify_one();
                    return Err(slot.timed_out(started, now));
                }
                Recheck::Closed => {
                    guard.disarm();
                    return Err(AdmissionError::Shutdown);
                }
            }
        }
    }

    /// Reports that an admitted call succeeded, occupying a window slot.
    ///
    /// Calls that were admitted but failed must not be committed. There is
    /// no deduplication: commit each successful call exactly once.
    pub fn commit(&self, endpoint: &str, method: &str) {
        let group = self.shared.classifier.classify(endpoint, method);
        let Ok(slot) = self.shared.slot(group) else {
            return;
        };
        let now = self.shared.clock.now();
        lock(&slot.inner).state.commit(&slot.config, now);
        slot.total_committed.fetch_add(1, Ordering::Relaxed);
    }

    /// Reports that the exchange rejected a call for exceeding its quota.
    pub fn notify_rejection(&self, endpoint: &str, method: &str, hint: Option<RejectionHint>) {
        let group = self.shared.classifier.classify(endpoint, method);
        let Ok(slot) = self.shared.slot(group) else {
            return;
        };
        let now = self.shared.clock.now();

        let (reduction, rescheduled) = {
            let mut inner = lock(&slot.inner);
            let anchor = inner.state.recovery_anchor;
            let reduction =
                DynamicAdjuster::new(&slot.config).on_rejection(&mut inner.state, now, hint);
            (reduction, inner.state.recovery_anchor != anchor)
        };
        slot.total_rejections.fetch_add(1, Ordering::Relaxed);

        // The recovery loop may be sleeping toward a tick that just moved
        if reduction.is_some() || rescheduled {
            slot.rate_changed.notify_one();
        }
        slot.kick.notify_one();
    }

    /// Snapshot of every group and background loop.
    pub fn get_status(&self) -> ControllerStatus {
        let shared = &self.shared;
        let now = shared.clock.now();

        let groups = RateLimitGroup::ALL
            .into_iter()
            .filter_map(|group| shared.slots.get(&group).map(|slot| slot.status(now)))
            .collect();

        let uptime = lock(&shared.started_at)
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or(Duration::ZERO);

        ControllerStatus {
            running: shared.running.load(Ordering::Acquire),
            uptime,
            groups,
            loops: shared.supervisor.statuses(),
        }
    }

    /// Group a request would be paced under.
    pub fn classify(&self, endpoint: &str, method: &str) -> RateLimitGroup {
        self.shared.classifier.classify(endpoint, method)
    }

    /// Stops one background loop as if it had crashed; the supervisor
    /// restarts it on its next health check.
    pub fn abort_loop(&self, group: RateLimitGroup, kind: LoopKind) -> bool {
        self.shared.supervisor.abort_loop(group, kind)
    }

    /// Whether background loops are running.
    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Policy of a configured group.
    pub fn group_config(&self, group: RateLimitGroup) -> Option<GroupConfig> {
        self.shared.slots.get(&group).map(|slot| slot.config.clone())
    }
}

impl fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionController")
            .field("groups", &self.shared.slots.len())
            .field("running", &self.is_running())
            .field("clock", &self.shared.clock)
            .finish()
    }
}

/// Per-group loop waking the head waiter once the engine would admit it.
async fn queue_notifier(slot: Arc<GroupSlot>, clock: Arc<dyn Clock>) {
    debug!(group = %slot.group(), "queue notifier started");
    loop {
        let next_wake = {
            let mut inner = lock(&slot.inner);
            let now = clock.now();
            let head_armed = inner.queue.head().map(|w| !w.is_woken());
            if head_armed == Some(true) {
                let decision = slot.engine().evaluate(&mut inner.state, now).decision;
                match decision {
                    Decision::Admit => {
                        inner.queue.wake_next();
                        None
                    }
                    Decision::Wait(wait) => Some(saturating_add(now, wait)),
                }
            } else {
                // Empty queue, or the head is busy re-checking
                None
            }
        };

        match next_wake {
            Some(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = slot.kick.notified() => {}
                }
            }
            None => slot.kick.notified().await,
        }
    }
}

/// Per-group loop applying recovery ticks.
async fn recovery_scheduler(slot: Arc<GroupSlot>, clock: Arc<dyn Clock>) {
    debug!(group = %slot.group(), "recovery scheduler started");
    loop {
        let (recovered, next_tick) = {
            let mut inner = lock(&slot.inner);
            let adjuster = DynamicAdjuster::new(&slot.config);
            let recovered = adjuster.recover(&mut inner.state, clock.now());
            (recovered.is_some(), adjuster.next_recovery_at(&inner.state))
        };

        if recovered {
            // Faster pace; the head may be admissible earlier
            slot.kick.notify_one();
        }

        match next_tick {
            Some(at) => {
                tokio::select! {
                    _ = sleep_until(at) => {}
                    _ = slot.rate_changed.notified() => {}
                }
            }
            None => slot.rate_changed.notified().await,
        }
    }
}

/// Supervisor task: periodic health checks until the controller goes away.
async fn supervise(shared: Weak<Shared>) {
    loop {
        let next_check = {
            let Some(shared) = shared.upgrade() else {
                return;
            };
            if shared.shut_down.load(Ordering::Acquire) {
                return;
            }

            let now = shared.clock.now();
            let groups = shared
                .supervisor
                .check(now, |group, kind| shared.spawn_loop(group, kind));

            for group in groups {
                if let Some(slot) = shared.slots.get(&group) {
                    let woken = slot.force_wake();
                    if woken > 0 {
                        warn!(%group, "force-woke {} parked caller(s) after loop failure", woken);
                    }
                }
            }

            shared.supervisor.next_check_at(now)
        };

        sleep_until(next_check).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> LimiterConfig {
        LimiterConfig::default().with_group(GroupConfig::new(RateLimitGroup::PrivateOrder, 10.0, 10))
    }

    const ORDER: &str = "/private/v1/order";

    #[tokio::test(start_paused = true)]
    async fn test_fast_path_admits_burst() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.start();

        for _ in 0..10 {
            let admission = controller.acquire(ORDER, "POST").await.unwrap();
            assert_eq!(admission.group, RateLimitGroup::PrivateOrder);
            assert_eq!(admission.waited, Duration::ZERO);
        }

        let status = controller.get_status();
        let order = status.group(RateLimitGroup::PrivateOrder).unwrap();
        assert_eq!(order.total_admitted, 10);
        assert_eq!(order.queue_depth, 0);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_parked_caller_is_paced() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.start();

        for _ in 0..10 {
            controller.acquire(ORDER, "POST").await.unwrap();
        }
        let admission = controller.acquire(ORDER, "POST").await.unwrap();
        assert_eq!(admission.waited, Duration::from_millis(100));
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_commit_and_rejection_counters() {
        let controller = AdmissionController::new(config()).unwrap();

        controller.acquire(ORDER, "POST").await.unwrap();
        controller.commit(ORDER, "POST");
        controller.notify_rejection(ORDER, "POST", None);

        let status = controller.get_status();
        let order = status.group(RateLimitGroup::PrivateOrder).unwrap();
        assert_eq!(order.total_committed, 1);
        assert_eq!(order.window_occupancy, 1);
        assert_eq!(order.total_rejections, 1);
        assert_eq!(order.recent_rejections, 1);
        assert!((order.rate_ratio - 0.8).abs() < 1e-12);
        assert_eq!(order.next_recovery_in, Some(Duration::from_secs(300)));
        assert_eq!(status.health_status(), crate::HealthStatus::Degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_waiter() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.start();

        for _ in 0..10 {
            controller.acquire(ORDER, "POST").await.unwrap();
        }
        let err = controller
            .acquire_timeout(ORDER, "POST", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_timeout());

        let status = controller.get_status();
        let order = status.group(RateLimitGroup::PrivateOrder).unwrap();
        assert_eq!(order.queue_depth, 0);
        assert_eq!(order.total_timeouts, 1);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_future_cleans_up() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.start();
        for _ in 0..10 {
            controller.acquire(ORDER, "POST").await.unwrap();
        }

        let pending = tokio::time::timeout(
            Duration::from_millis(10),
            controller.acquire(ORDER, "POST"),
        )
        .await;
        assert!(pending.is_err());

        let status = controller.get_status();
        assert_eq!(status.group(RateLimitGroup::PrivateOrder).unwrap().queue_depth, 0);
        controller.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_reports_overdue_waiters() {
        let controller = AdmissionController::new(config()).unwrap();
        for _ in 0..10 {
            controller.acquire(ORDER, "POST").await.unwrap();
        }

        let pending = controller.acquire_timeout(ORDER, "POST", Duration::from_millis(50));
        tokio::pin!(pending);
        // Park the caller, then stop polling it
        tokio::select! {
            biased;
            _ = &mut pending => panic!("group should be saturated"),
            _ = tokio::task::yield_now() => {}
        }

        tokio::time::advance(Duration::from_millis(60)).await;
        let status = controller.get_status();
        let order = status.group(RateLimitGroup::PrivateOrder).unwrap();
        assert_eq!(order.queue_depth, 1);
        assert_eq!(order.overdue_waiters, 1);

        assert!(pending.await.unwrap_err().is_timeout());
        let status = controller.get_status();
        let order = status.group(RateLimitGroup::PrivateOrder).unwrap();
        assert_eq!(order.queue_depth, 0);
        assert_eq!(order.overdue_waiters, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_after_shutdown_fails() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.start();
        controller.shutdown().await;

        assert_eq!(
            controller.acquire(ORDER, "POST").await,
            Err(AdmissionError::Shutdown)
        );
        assert!(!controller.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preventive_delay_counts_against_deadline() {
        let controller = AdmissionController::new(config()).unwrap();
        controller.notify_rejection(ORDER, "POST", None);

        // 100ms preventive delay
        let admission = controller.acquire(ORDER, "POST").await.unwrap();
        assert_eq!(admission.waited, Duration::from_millis(100));

        let err = controller
            .acquire_timeout(ORDER, "POST", Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = LimiterConfig::default()
            .with_group(GroupConfig::new(RateLimitGroup::PrivateOrder, 0.0, 10));
        assert!(matches!(
            AdmissionController::new(config),
            Err(AdmissionError::Configuration(ConfigError::InvalidRate { .. }))
        ));
    }
}
