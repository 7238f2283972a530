// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! The shared pool of pre-allocated DMA buffers.
//!
//! All buffer state lives behind one non-sleeping spin lock so the
//! completion path may transition buffers without ever blocking; ordinary
//! threads that find nothing free sleep on the pool's change notification
//! and re-scan on every wakeup.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};
use spin::Mutex as SpinMutex;

use crate::buffer::{BufferState, BufferTicket, DmaBuffer, DmaRegion};
use crate::error::{Error, Result};
use crate::waitq::{CancelToken, WaitOutcome, WaitQueue};

struct PoolInner {
    buffers: Vec<DmaBuffer>,
    /// Scan order: head is the least-recently-returned slot. Rotated on
    /// contention so a buffer still in use by the most recent transfer is
    /// not re-checked first.
    order: VecDeque<usize>,
}

pub struct BufferPool {
    inner: SpinMutex<PoolInner>,
    changed: WaitQueue,
    region: Arc<DmaRegion>,
    buffer_size: usize,
}

impl BufferPool {
    /// Carve `count` buffers of `buffer_size` bytes out of `region`.
    /// `bus_base` is the device-visible address of the region's start.
    pub fn new(
        region: Arc<DmaRegion>,
        count: usize,
        buffer_size: usize,
        bus_base: u64,
    ) -> Result<Self> {
        if count == 0 || buffer_size == 0 {
            return Err(Error::InvalidArgument("buffer pool geometry"));
        }
        if count * buffer_size > region.len() {
            return Err(Error::InvalidArgument("buffer pool exceeds DMA region"));
        }

        let buffers = (0..count)
            .map(|i| {
                let driver_offset = i * buffer_size;
                DmaBuffer::new(driver_offset, buffer_size, bus_base + driver_offset as u64)
            })
            .collect();

        debug!(
            "buffer pool created: {} buffers of {} bytes",
            count, buffer_size
        );

        Ok(Self {
            inner: SpinMutex::new(PoolInner {
                buffers,
                order: (0..count).collect(),
            }),
            changed: WaitQueue::new(),
            region,
            buffer_size,
        })
    }

    pub fn buffer_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    pub fn region(&self) -> &Arc<DmaRegion> {
        &self.region
    }

    /// The pool's change notification: signalled on release and on
    /// completion so both free-waiters and done-waiters re-scan.
    pub(crate) fn changed(&self) -> &WaitQueue {
        &self.changed
    }

    fn ticket(buf: &DmaBuffer, index: usize) -> BufferTicket {
        BufferTicket {
            index,
            driver_offset: buf.driver_offset,
            size: buf.size,
            device_address: buf.device_address,
        }
    }

    /// Claim the least-recently-returned free buffer, blocking up to
    /// `timeout` for one to appear. The claimed buffer comes back with a
    /// cleared transfer window.
    pub fn acquire_free(
        &self,
        timeout: Duration,
        cancel: Option<&CancelToken>,
    ) -> Result<BufferTicket> {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.changed.prepare();
            {
                let mut inner = self.inner.lock();

                // A busy head is most likely the most recent transfer;
                // rotate it out of the way before scanning.
                let head = inner.order.front().copied();
                if let Some(head) = head {
                    if inner.buffers[head].state != BufferState::Free && inner.order.len() > 1 {
                        inner.order.rotate_left(1);
                    }
                }

                let found = inner
                    .order
                    .iter()
                    .copied()
                    .find(|&i| inner.buffers[i].state == BufferState::Free);
                if let Some(index) = found {
                    let buf = &mut inner.buffers[index];
                    buf.state = BufferState::Reserved;
                    buf.reset_window();
                    trace!("acquired buffer {} (offset {:#x})", index, buf.driver_offset);
                    return Ok(Self::ticket(buf, index));
                }
            }

            match self.changed.wait(seen, deadline, cancel) {
                WaitOutcome::Notified => continue,
                WaitOutcome::TimedOut => {
                    debug!("no free buffer within {:?}", timeout);
                    return Err(Error::NoFreeBuffer);
                }
                WaitOutcome::Interrupted => return Err(Error::Interrupted),
            }
        }
    }

    /// Return a buffer to the pool. Safe from the completion context.
    pub fn release(&self, ticket: BufferTicket) {
        let mut inner = self.inner.lock();
        let buf = &mut inner.buffers[ticket.index];
        if buf.state == BufferState::Free {
            debug!("buffer {} released twice", ticket.index);
            return;
        }
        trace!("buffer {} {:?} -> Free", ticket.index, buf.state);
        buf.state = BufferState::Free;
        buf.reset_window();
        drop(inner);
        self.changed.notify();
    }

    /// Record the device-memory window a reserved buffer will carry.
    pub(crate) fn set_transfer_window(
        &self,
        index: usize,
        offset: u64,
        size: usize,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        let buf = &mut inner.buffers[index];
        if buf.state != BufferState::Reserved {
            return Err(Error::InvalidArgument("buffer not reserved"));
        }
        buf.transfer_offset = offset;
        buf.transfer_size = size;
        Ok(())
    }

    /// Reserved -> Waiting, once the hardware has been programmed.
    pub(crate) fn mark_waiting(&self, index: usize) -> Result<()> {
        let mut inner = self.inner.lock();
        let buf = &mut inner.buffers[index];
        if buf.state != BufferState::Reserved {
            return Err(Error::InvalidArgument("buffer not reserved"));
        }
        buf.state = BufferState::Waiting;
        Ok(())
    }

    /// Waiting -> Done, from the completion context. Returns the actual
    /// state on a mismatch so the caller can log the spurious interrupt.
    pub(crate) fn complete(&self, index: usize) -> core::result::Result<(), BufferState> {
        let mut inner = self.inner.lock();
        let buf = &mut inner.buffers[index];
        if buf.state != BufferState::Waiting {
            return Err(buf.state);
        }
        buf.state = BufferState::Done;
        drop(inner);
        self.changed.notify();
        Ok(())
    }

    pub(crate) fn state(&self, index: usize) -> BufferState {
        self.inner.lock().buffers[index].state
    }

    pub(crate) fn window(&self, index: usize) -> (u64, usize) {
        let inner = self.inner.lock();
        let buf = &inner.buffers[index];
        (buf.transfer_offset, buf.transfer_size)
    }

    /// Locate the in-flight or completed buffer carrying this window.
    pub fn find_by_transfer_window(&self, offset: u64, size: usize) -> Option<BufferTicket> {
        let inner = self.inner.lock();
        inner
            .buffers
            .iter()
            .enumerate()
            .find(|(_, b)| {
                matches!(b.state, BufferState::Waiting | BufferState::Done)
                    && b.transfer_offset == offset
                    && b.transfer_size == size
            })
            .map(|(i, b)| Self::ticket(b, i))
    }

    /// Locate a buffer by its slot offset in the driver region.
    pub fn find_by_driver_offset(&self, driver_offset: usize) -> Option<BufferTicket> {
        let inner = self.inner.lock();
        inner
            .buffers
            .iter()
            .enumerate()
            .find(|(_, b)| b.driver_offset == driver_offset)
            .map(|(i, b)| Self::ticket(b, i))
    }

    /// Driver offsets of all slots, in region order.
    pub fn driver_offsets(&self) -> Vec<usize> {
        let inner = self.inner.lock();
        inner.buffers.iter().map(|b| b.driver_offset).collect()
    }

    /// Block until no buffer is waiting on the hardware. Called on detach;
    /// gives up after `timeout` rather than wedging teardown forever.
    pub fn drain(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let seen = self.changed.prepare();
            let waiting = {
                let inner = self.inner.lock();
                inner
                    .buffers
                    .iter()
                    .filter(|b| b.state == BufferState::Waiting)
                    .count()
            };
            if waiting == 0 {
                return;
            }
            match self.changed.wait(seen, deadline, None) {
                WaitOutcome::Notified => continue,
                WaitOutcome::TimedOut | WaitOutcome::Interrupted => {
                    warn!("pool drain timed out with {} buffer(s) still waiting", waiting);
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const BUF: usize = crate::hw::DMA_QUANTUM;

    fn pool(count: usize) -> BufferPool {
        let region = DmaRegion::new(count * BUF).unwrap();
        BufferPool::new(region, count, BUF, 0x4000_0000).unwrap()
    }

    #[test]
    fn test_rejects_bad_geometry() {
        let region = DmaRegion::new(BUF).unwrap();
        assert!(BufferPool::new(Arc::clone(&region), 0, BUF, 0).is_err());
        assert!(BufferPool::new(Arc::clone(&region), 1, 0, 0).is_err());
        assert!(BufferPool::new(region, 4, BUF, 0).is_err());
    }

    #[test]
    fn test_acquire_release_is_idempotent() {
        let p = pool(2);
        let first = p.acquire_free(Duration::from_millis(50), None).unwrap();
        p.release(first);
        let second = p.acquire_free(Duration::from_millis(50), None).unwrap();
        // Releasing without a transfer leaves the same candidate up next.
        assert_eq!(first.index, second.index);
        assert_eq!(first.driver_offset, second.driver_offset);
    }

    #[test]
    fn test_window_cleared_on_reacquire() {
        let p = pool(1);
        let t = p.acquire_free(Duration::from_millis(50), None).unwrap();
        p.set_transfer_window(t.index, 0x8000, 1234).unwrap();
        p.mark_waiting(t.index).unwrap();
        p.complete(t.index).unwrap();
        p.release(t);

        let t = p.acquire_free(Duration::from_millis(50), None).unwrap();
        assert_eq!(p.window(t.index), (0, 0));
    }

    #[test]
    fn test_exhaustion_times_out() {
        let p = pool(2);
        let _a = p.acquire_free(Duration::from_millis(50), None).unwrap();
        let _b = p.acquire_free(Duration::from_millis(50), None).unwrap();
        let err = p.acquire_free(Duration::from_millis(50), None).unwrap_err();
        assert_eq!(err, Error::NoFreeBuffer);
    }

    #[test]
    fn test_release_wakes_blocked_acquirer() {
        let p = Arc::new(pool(1));
        let held = p.acquire_free(Duration::from_millis(50), None).unwrap();

        let p2 = Arc::clone(&p);
        let waiter = thread::spawn(move || p2.acquire_free(Duration::from_secs(2), None));

        thread::sleep(Duration::from_millis(20));
        p.release(held);

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got.index, held.index);
    }

    #[test]
    fn test_acquire_skips_busy_head() {
        let p = pool(2);
        let a = p.acquire_free(Duration::from_millis(50), None).unwrap();
        let b = p.acquire_free(Duration::from_millis(50), None).unwrap();
        assert_ne!(a.index, b.index);
        p.release(b);
        // a is still busy; the pool must hand out b again, not block.
        let again = p.acquire_free(Duration::from_millis(50), None).unwrap();
        assert_eq!(again.index, b.index);
    }

    #[test]
    fn test_find_by_transfer_window() {
        let p = pool(2);
        let t = p.acquire_free(Duration::from_millis(50), None).unwrap();
        p.set_transfer_window(t.index, 0x2_0000, 4096).unwrap();
        // Reserved buffers are not findable; only in-flight or done ones.
        assert!(p.find_by_transfer_window(0x2_0000, 4096).is_none());
        p.mark_waiting(t.index).unwrap();
        let found = p.find_by_transfer_window(0x2_0000, 4096).unwrap();
        assert_eq!(found.index, t.index);
        assert!(p.find_by_transfer_window(0x2_0000, 4095).is_none());
    }

    #[test]
    fn test_find_by_driver_offset() {
        let p = pool(2);
        let t = p.find_by_driver_offset(BUF).unwrap();
        assert_eq!(t.driver_offset, BUF);
        assert!(p.find_by_driver_offset(BUF / 2).is_none());
    }

    #[test]
    fn test_double_release_is_harmless() {
        let p = pool(1);
        let t = p.acquire_free(Duration::from_millis(50), None).unwrap();
        p.release(t);
        p.release(t);
        assert!(p.acquire_free(Duration::from_millis(50), None).is_ok());
    }
}
