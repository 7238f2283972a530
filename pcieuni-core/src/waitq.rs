// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Change-notification primitive shared by the buffer pool and the
//! channel reservation.
//!
//! Waiters snapshot the notification generation *before* testing their
//! predicate and go to sleep only if no notification happened in between,
//! so a wakeup raised from the completion context between predicate check
//! and sleep is never lost. The notify side bumps the generation under
//! the queue's own lock — held only across that store, the same bounded
//! hand-off a kernel waitqueue's internal spinlock gives `wake_up` — and
//! never sleeps on any caller-visible state.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

/// How often a sleeping waiter re-checks its cancellation token.
const CANCEL_POLL_SLICE: Duration = Duration::from_millis(10);

/// Outcome of a single bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The queue was notified (or the wait raced a notification); the
    /// caller must re-check its predicate.
    Notified,
    /// The deadline passed without a notification.
    TimedOut,
    /// The caller's cancellation token fired.
    Interrupted,
}

/// Cooperative cancellation handle for blocking engine operations.
///
/// The userspace stand-in for a signal delivered to a thread sleeping in
/// the driver: waits observe the token within one poll slice and return
/// `Interrupted`.
#[derive(Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A wait queue in the style of a kernel `wait_queue_head_t`.
pub struct WaitQueue {
    lock: Mutex<()>,
    cv: Condvar,
    generation: AtomicU64,
}

impl WaitQueue {
    pub fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cv: Condvar::new(),
            generation: AtomicU64::new(0),
        }
    }

    /// Snapshot the generation. Must be taken before the caller tests the
    /// predicate it intends to sleep on.
    pub fn prepare(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Wake all waiters. Safe from the completion context: the queue lock
    /// is held only for the generation bump, so the hand-off is bounded
    /// by a waiter finishing its park, never by caller code.
    pub fn notify(&self) {
        {
            let _guard = self.lock.lock();
            self.generation.fetch_add(1, Ordering::Release);
        }
        self.cv.notify_all();
    }

    /// Sleep until a notification newer than `seen` arrives, the deadline
    /// passes, or `cancel` fires.
    pub fn wait(
        &self,
        seen: u64,
        deadline: Instant,
        cancel: Option<&CancelToken>,
    ) -> WaitOutcome {
        let mut guard = self.lock.lock();
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return WaitOutcome::Interrupted;
                }
            }
            if self.generation.load(Ordering::Acquire) != seen {
                return WaitOutcome::Notified;
            }
            let now = Instant::now();
            if now >= deadline {
                return WaitOutcome::TimedOut;
            }
            let until = if cancel.is_some() {
                deadline.min(now + CANCEL_POLL_SLICE)
            } else {
                deadline
            };
            self.cv.wait_until(&mut guard, until);
        }
    }
}

impl Default for WaitQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_notify_wakes_waiter() {
        let q = Arc::new(WaitQueue::new());
        let seen = q.prepare();

        let q2 = Arc::clone(&q);
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            q2.notify();
        });

        let outcome = q.wait(seen, Instant::now() + Duration::from_secs(2), None);
        assert_eq!(outcome, WaitOutcome::Notified);
        t.join().unwrap();
    }

    #[test]
    fn test_wait_times_out() {
        let q = WaitQueue::new();
        let seen = q.prepare();
        let outcome = q.wait(seen, Instant::now() + Duration::from_millis(30), None);
        assert_eq!(outcome, WaitOutcome::TimedOut);
    }

    #[test]
    fn test_notification_between_prepare_and_wait_is_not_lost() {
        let q = WaitQueue::new();
        let seen = q.prepare();
        q.notify();
        let outcome = q.wait(seen, Instant::now() + Duration::from_secs(2), None);
        assert_eq!(outcome, WaitOutcome::Notified);
    }

    #[test]
    fn test_cancel_interrupts_wait() {
        let q = Arc::new(WaitQueue::new());
        let token = CancelToken::new();
        let seen = q.prepare();

        let t2 = token.clone();
        let t = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            t2.cancel();
        });

        let outcome = q.wait(seen, Instant::now() + Duration::from_secs(5), Some(&token));
        assert_eq!(outcome, WaitOutcome::Interrupted);
        t.join().unwrap();
    }
}
