// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Exclusive claim on the single hardware DMA channel.
//!
//! A sleeping gate serializes ordinary threads trying to reserve; the idle
//! flag and the current-buffer slot are plain atomics so `release` stays
//! legal from the completion context. Buffer exhaustion and channel
//! busy-ness fail independently: this component only ever reports `Busy`
//! or `Interrupted`, never anything about buffers.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::{debug, trace};
use parking_lot::Mutex;

use crate::buffer::BufferTicket;
use crate::error::{Error, Result};
use crate::waitq::{CancelToken, WaitOutcome, WaitQueue};

const NO_BUFFER: usize = usize::MAX;

pub struct DmaReservation {
    /// Serializes reservers only; never touched by `release`.
    gate: Mutex<()>,
    /// True while the hardware channel is free.
    idle: AtomicBool,
    /// Pool index of the buffer the in-flight transfer targets.
    current: AtomicUsize,
    idle_changed: WaitQueue,
}

impl DmaReservation {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            idle: AtomicBool::new(true),
            current: AtomicUsize::new(NO_BUFFER),
            idle_changed: WaitQueue::new(),
        }
    }

    /// Claim the channel for a transfer into `buffer`, waiting up to
    /// `timeout` for it to go idle. A timeout is reported as `Busy` (the
    /// channel stayed occupied), distinct from buffer exhaustion.
    pub fn reserve(
        &self,
        buffer: &BufferTicket,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.gate.lock();
        loop {
            let seen = self.idle_changed.prepare();
            if self.idle.load(Ordering::Acquire) {
                break;
            }
            drop(guard);
            trace!("DMA channel occupied, waiting");
            match self.idle_changed.wait(seen, deadline, cancel) {
                WaitOutcome::Notified => {}
                WaitOutcome::TimedOut => {
                    debug!("DMA channel still busy after {:?}", timeout);
                    return Err(Error::Busy);
                }
                WaitOutcome::Interrupted => return Err(Error::Interrupted),
            }
            guard = self.gate.lock();
        }
        self.idle.store(false, Ordering::Release);
        self.current.store(buffer.index, Ordering::Release);
        trace!("DMA channel reserved for buffer {}", buffer.index);
        Ok(())
    }

    /// Free the channel. Plain flag writes plus a notification; must stay
    /// non-blocking and allocation-free for the completion context.
    pub fn release(&self) {
        self.current.store(NO_BUFFER, Ordering::Release);
        self.idle.store(true, Ordering::Release);
        self.idle_changed.notify();
    }

    /// Free the channel only if it is still bound to `index`. Used by the
    /// missed-interrupt recovery so a stale waiter cannot release a
    /// reservation that has since moved on to another transfer.
    pub(crate) fn release_for(&self, index: usize) -> bool {
        if self
            .current
            .compare_exchange(index, NO_BUFFER, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.idle.store(true, Ordering::Release);
            self.idle_changed.notify();
            true
        } else {
            false
        }
    }

    /// Pool index of the buffer the channel is currently bound to.
    pub(crate) fn current(&self) -> Option<usize> {
        match self.current.load(Ordering::Acquire) {
            NO_BUFFER => None,
            index => Some(index),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.idle.load(Ordering::Acquire)
    }
}

impl Default for DmaReservation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn ticket(index: usize) -> BufferTicket {
        BufferTicket {
            index,
            driver_offset: 0,
            size: 4096,
            device_address: 0x4000_0000,
        }
    }

    #[test]
    fn test_reserve_and_release() {
        let r = DmaReservation::new();
        assert!(r.is_idle());
        r.reserve(&ticket(0), Duration::from_millis(50), None).unwrap();
        assert!(!r.is_idle());
        assert_eq!(r.current(), Some(0));
        r.release();
        assert!(r.is_idle());
        assert_eq!(r.current(), None);
    }

    #[test]
    fn test_second_reserve_reports_busy() {
        let r = DmaReservation::new();
        r.reserve(&ticket(0), Duration::from_millis(50), None).unwrap();
        let err = r.reserve(&ticket(1), Duration::from_millis(50), None).unwrap_err();
        assert_eq!(err, Error::Busy);
        // The failed attempt must not have disturbed the holder.
        assert_eq!(r.current(), Some(0));
    }

    #[test]
    fn test_release_unblocks_waiter() {
        let r = Arc::new(DmaReservation::new());
        r.reserve(&ticket(0), Duration::from_millis(50), None).unwrap();

        let r2 = Arc::clone(&r);
        let waiter =
            thread::spawn(move || r2.reserve(&ticket(1), Duration::from_secs(2), None));

        thread::sleep(Duration::from_millis(20));
        r.release();

        waiter.join().unwrap().unwrap();
        assert_eq!(r.current(), Some(1));
    }

    #[test]
    fn test_concurrent_reserve_single_winner() {
        let r = Arc::new(DmaReservation::new());
        let mut handles = Vec::new();
        for i in 0..4 {
            let r = Arc::clone(&r);
            handles.push(thread::spawn(move || {
                r.reserve(&ticket(i), Duration::from_millis(100), None).is_ok()
            }));
        }
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&ok| ok)
            .count();
        // Nobody releases, so exactly one reserver may win; the rest time
        // out with Busy.
        assert_eq!(winners, 1);
        assert!(!r.is_idle());
    }

    #[test]
    fn test_cancel_interrupts_reserve() {
        let r = DmaReservation::new();
        r.reserve(&ticket(0), Duration::from_millis(50), None).unwrap();
        let token = CancelToken::new();
        token.cancel();
        let err = r
            .reserve(&ticket(1), Duration::from_secs(5), Some(&token))
            .unwrap_err();
        assert_eq!(err, Error::Interrupted);
    }
}
