//! # Wait Queue
//!
//! Strict FIFO of callers parked on one group. Each waiter holds a ticket
//! handed out in arrival order; the queue is always sorted by ticket.
//!
//! ```text
//!     head                                      tail
//!     ┌──────┐   ┌──────┐   ┌──────┐   ┌──────┐
//!     │ #17  │──►│ #18  │──►│ #21  │──►│ #22  │
//!     │ woken│   │armed │   │armed │   │armed │
//!     └──────┘   └──────┘   └──────┘   └──────┘
//!        │
//!        └─ re-checks the engine:
//!             admitted ──► removed from the queue
//!             denied   ──► re-armed in place (still ahead of #18)
//! ```
//!
//! Only the head may be admitted. A woken waiter keeps its position while it
//! re-checks, so a caller that arrives in between can never overtake it.
//! Every entry is removed on admission, timeout, cancellation or shutdown.

use super::group::RateLimitGroup;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;

/// Position of a waiter in its group's queue. Lower tickets go first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ticket(u64);

impl Ticket {
    /// Raw sequence number.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Message delivered to a parked caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    /// Re-run the admission check.
    Recheck,
    /// The controller is shutting down.
    Shutdown,
}

/// A parked caller.
#[derive(Debug)]
pub struct Waiter {
    ticket: Ticket,
    enqueued_at: Instant,
    deadline: Instant,
    /// `None` once woken, until the caller re-arms
    notify: Option<oneshot::Sender<Wake>>,
}

impl Waiter {
    /// Queue position.
    #[inline]
    pub fn ticket(&self) -> Ticket {
        self.ticket
    }

    /// When the caller first parked.
    #[inline]
    pub fn enqueued_at(&self) -> Instant {
        self.enqueued_at
    }

    /// Absolute deadline of the caller.
    #[inline]
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// True while the caller holds a wake it has not acted on yet.
    #[inline]
    pub fn is_woken(&self) -> bool {
        self.notify.is_none()
    }

    fn send(&mut self, wake: Wake) -> bool {
        match self.notify.take() {
            Some(tx) => tx.send(wake).is_ok(),
            None => false,
        }
    }
}

/// FIFO of waiters for one group.
#[derive(Debug)]
pub struct WaitQueue {
    group: RateLimitGroup,
    next_ticket: u64,
    entries: VecDeque<Waiter>,
}

impl WaitQueue {
    /// Creates an empty queue.
    pub fn new(group: RateLimitGroup) -> Self {
        Self {
            group,
            next_ticket: 0,
            entries: VecDeque::new(),
        }
    }

    /// Parks a new caller at the tail.
    ///
    /// Returns its ticket and the receiver it must await.
    pub fn enqueue(&mut self, now: Instant, deadline: Instant) -> (Ticket, oneshot::Receiver<Wake>) {
        let ticket = Ticket(self.next_ticket);
        self.next_ticket += 1;

        let (tx, rx) = oneshot::channel();
        self.entries.push_back(Waiter {
            ticket,
            enqueued_at: now,
            deadline,
            notify: Some(tx),
        });

        debug!(group = %self.group, ticket = ticket.0, depth = self.entries.len(), "waiter parked");
        (ticket, rx)
    }

    /// Gives a woken caller a fresh receiver without moving it.
    ///
    /// If the entry is gone it is re-inserted at its ticket position, ahead
    /// of everyone who arrived later.
    pub fn rearm(&mut self, ticket: Ticket, enqueued_at: Instant, deadline: Instant) -> oneshot::Receiver<Wake> {
        let (tx, rx) = oneshot::channel();

        match self.position(ticket) {
            Ok(index) => {
                self.entries[index].notify = Some(tx);
            }
            Err(index) => {
                self.entries.insert(
                    index,
                    Waiter {
                        ticket,
                        enqueued_at,
                        deadline,
                        notify: Some(tx),
                    },
                );
            }
        }

        rx
    }

    /// Wakes the head if it is still armed.
    ///
    /// Returns the woken ticket. A head that already holds an unprocessed
    /// wake is left alone; its re-check will kick the notifier again.
    pub fn wake_next(&mut self) -> Option<Ticket> {
        let head = self.entries.front_mut()?;
        if head.is_woken() {
            return None;
        }
        let ticket = head.ticket;
        if !head.send(Wake::Recheck) {
            // Receiver dropped: the caller's guard is about to remove it
            debug!(group = %self.group, ticket = ticket.0, "head waiter no longer listening");
        }
        Some(ticket)
    }

    /// Wakes every armed waiter so each runs its re-check.
    ///
    /// Returns how many were woken.
    pub fn wake_all(&mut self) -> usize {
        self.entries
            .iter_mut()
            .filter(|w| !w.is_woken())
            .map(|w| w.send(Wake::Recheck))
            .filter(|sent| *sent)
            .count()
    }

    /// Removes every waiter, telling each that the controller stopped.
    ///
    /// Returns how many were parked.
    pub fn drain(&mut self) -> usize {
        let count = self.entries.len();
        for mut waiter in self.entries.drain(..) {
            waiter.send(Wake::Shutdown);
        }
        count
    }

    /// Removes a waiter. Returns false when it was not queued.
    pub fn remove(&mut self, ticket: Ticket) -> bool {
        match self.position(ticket) {
            Ok(index) => {
                self.entries.remove(index);
                true
            }
            Err(_) => false,
        }
    }

    /// True when `ticket` heads the queue.
    #[inline]
    pub fn is_head(&self, ticket: Ticket) -> bool {
        self.entries.front().map(|w| w.ticket) == Some(ticket)
    }

    /// The head waiter, if any.
    #[inline]
    pub fn head(&self) -> Option<&Waiter> {
        self.entries.front()
    }

    /// Whether `ticket` is currently queued.
    #[inline]
    pub fn contains(&self, ticket: Ticket) -> bool {
        self.position(ticket).is_ok()
    }

    /// Number of parked callers.
    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nobody is parked.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// How long the oldest parked caller has been waiting.
    pub fn oldest_wait(&self, now: Instant) -> Duration {
        self.entries
            .iter()
            .map(|w| now.saturating_duration_since(w.enqueued_at))
            .max()
            .unwrap_or(Duration::ZERO)
    }

    /// Waiters whose deadline has passed but who have not yet collected
    /// their timeout. Nonzero for long means callers are not being polled.
    pub fn overdue(&self, now: Instant) -> usize {
        self.entries.iter().filter(|w| w.deadline <= now).count()
    }

    /// Tickets in queue order.
    pub fn tickets(&self) -> impl Iterator<Item = Ticket> + '_ {
        self.entries.iter().map(|w| w.ticket)
    }

    fn position(&self, ticket: Ticket) -> Result<usize, usize> {
        self.entries.binary_search_by(|w| w.ticket.cmp(&ticket))
    }
}
