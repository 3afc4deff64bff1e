//! Prioritized admission gate for connection and download scheduling
//!
//! A counting semaphore with two priority classes. When both classes have
//! waiters, a freed permit goes to the high-priority queue with a configured
//! probability instead of strictly — the low-priority queue keeps draining
//! and cannot starve.

use rand::Rng;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::Mutex;
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Scheduling class for a permit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Interactive work (stream reads, BODY/ARTICLE leases)
    High,
    /// Background work (metadata probes, integrity checks)
    Low,
}

/// Probability weighting between the two waiter queues
#[derive(Debug, Clone, Copy)]
pub struct PriorityOdds {
    /// Percent chance (0-100) that a freed permit serves a waiting
    /// high-priority request when both queues are non-empty
    pub high: u8,
}

impl Default for PriorityOdds {
    fn default() -> Self {
        Self { high: 80 }
    }
}

struct State {
    permits: usize,
    high: VecDeque<oneshot::Sender<()>>,
    low: VecDeque<oneshot::Sender<()>>,
}

/// Counting semaphore with probability-weighted priority classes
///
/// `acquire` and `release` are deliberately unpaired: a permit acquired here
/// is often released from a completion hook on another task once a transfer
/// finishes. Dropping a pending `acquire` future aborts the wait without
/// consuming a permit.
pub struct PrioritizedSemaphore {
    state: Mutex<State>,
    odds: PriorityOdds,
}

impl std::fmt::Debug for PrioritizedSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrioritizedSemaphore")
            .field("available", &self.available())
            .field("odds", &self.odds)
            .finish()
    }
}

impl PrioritizedSemaphore {
    /// Create a semaphore with `permits` initial permits
    pub fn new(permits: usize, odds: PriorityOdds) -> Self {
        Self {
            state: Mutex::new(State {
                permits,
                high: VecDeque::new(),
                low: VecDeque::new(),
            }),
            odds,
        }
    }

    /// Wait for a permit in the given priority class
    ///
    /// Cancellation-safe: dropping the returned future before it resolves
    /// leaves the permit count unchanged, even if a permit was handed to
    /// this waiter in the meantime (it is re-released).
    pub async fn acquire(&self, priority: Priority) {
        let rx = {
            let mut state = self.lock();
            // Take the fast path only when nobody is queued, so a new
            // arrival cannot overtake existing waiters.
            if state.permits > 0 && state.high.is_empty() && state.low.is_empty() {
                state.permits -= 1;
                return;
            }
            let (tx, rx) = oneshot::channel();
            match priority {
                Priority::High => state.high.push_back(tx),
                Priority::Low => state.low.push_back(tx),
            }
            rx
        };

        PendingAcquire {
            semaphore: self,
            rx,
            granted: false,
        }
        .await;
    }

    /// Return one permit, handing it directly to a waiter if any are queued
    pub fn release(&self) {
        let mut state = self.lock();
        loop {
            let pick_high = match (state.high.is_empty(), state.low.is_empty()) {
                (true, true) => {
                    state.permits += 1;
                    return;
                }
                (false, true) => true,
                (true, false) => false,
                (false, false) => {
                    rand::thread_rng().gen_range(0..100u8) < self.odds.high
                }
            };

            let waiter = if pick_high {
                state.high.pop_front()
            } else {
                state.low.pop_front()
            };

            // A send failure means the waiter was cancelled; keep looking.
            match waiter {
                Some(tx) => {
                    if tx.send(()).is_ok() {
                        return;
                    }
                    continue;
                }
                None => continue,
            }
        }
    }

    /// Number of immediately available permits
    pub fn available(&self) -> usize {
        self.lock().permits
    }

    /// Number of queued waiters across both classes
    pub fn waiters(&self) -> usize {
        let state = self.lock();
        state.high.len() + state.low.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Future for a queued permit request; re-releases a permit that arrives
/// after the waiter was dropped.
struct PendingAcquire<'a> {
    semaphore: &'a PrioritizedSemaphore,
    rx: oneshot::Receiver<()>,
    granted: bool,
}

impl Future for PendingAcquire<'_> {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match Pin::new(&mut this.rx).poll(cx) {
            Poll::Ready(Ok(())) => {
                this.granted = true;
                Poll::Ready(())
            }
            // The semaphore never drops a queued sender without sending.
            Poll::Ready(Err(_)) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.granted {
            return;
        }
        // The race window: a permit was sent to us after we stopped polling.
        if self.rx.try_recv().is_ok() {
            self.semaphore.release();
        }
    }
}
