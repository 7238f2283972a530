// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA transfer orchestration: start, wait, and the depth-2 pipelined
//! streaming read.
//!
//! One `DmaEngine` drives one board's single DMA channel. Multiple caller
//! threads may stream concurrently; they contend for the buffer pool and
//! the channel reservation, while the completion path runs on the board's
//! interrupt dispatch context.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use log::{debug, error, trace, warn};
use spin::Mutex as SpinMutex;

use crate::buffer::{BufferState, BufferTicket};
use crate::error::{Error, Result};
use crate::hw::{
    quantum_round_up, BoardIo, DMA_BAR, DMA_BOARD_ADDRESS, DMA_CPU_ADDRESS, DMA_SIZE_ADDRESS,
    DMA_STATUS_ADDRESS,
};
use crate::pool::BufferPool;
use crate::reservation::DmaReservation;
use crate::waitq::{CancelToken, WaitOutcome};

/// Start/stop wall-clock timestamps of the most recent DMA transfer.
#[derive(Debug, Clone, Copy, Default)]
pub struct DmaTimes {
    pub start: Option<SystemTime>,
    pub stop: Option<SystemTime>,
}

/// Blocking-operation timeouts. The defaults match the one second the
/// board is given to raise its end-of-transfer interrupt.
#[derive(Debug, Clone, Copy)]
pub struct EngineTimeouts {
    /// Waiting for a free buffer.
    pub acquire: Duration,
    /// Waiting for the DMA channel to go idle.
    pub reserve: Duration,
    /// Waiting for the end-of-DMA interrupt.
    pub completion: Duration,
}

impl Default for EngineTimeouts {
    fn default() -> Self {
        Self {
            acquire: Duration::from_secs(1),
            reserve: Duration::from_secs(1),
            completion: Duration::from_secs(1),
        }
    }
}

pub struct DmaEngine {
    hw: Arc<dyn BoardIo>,
    pool: Arc<BufferPool>,
    reservation: DmaReservation,
    timeouts: EngineTimeouts,
    times: SpinMutex<DmaTimes>,
}

impl DmaEngine {
    pub fn new(hw: Arc<dyn BoardIo>, pool: Arc<BufferPool>, timeouts: EngineTimeouts) -> Self {
        Self {
            hw,
            pool,
            reservation: DmaReservation::new(),
            timeouts,
            times: SpinMutex::new(DmaTimes::default()),
        }
    }

    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    pub fn reservation(&self) -> &DmaReservation {
        &self.reservation
    }

    pub fn dma_times(&self) -> DmaTimes {
        *self.times.lock()
    }

    /// Program a DMA read of up to one buffer's worth of board memory and
    /// return the window size actually requested. Returns as soon as the
    /// hardware is kicked.
    ///
    /// On any failure the buffer goes back to the pool as free and the
    /// channel reservation (if taken) is dropped; a buffer is never left
    /// reserved behind an error.
    pub fn start_dma_read(
        &self,
        ticket: BufferTicket,
        device_offset: u64,
        byte_count: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        if byte_count == 0 {
            self.pool.release(ticket);
            return Err(Error::InvalidArgument("zero-length DMA read"));
        }
        if device_offset > u32::MAX as u64 {
            self.pool.release(ticket);
            return Err(Error::InvalidArgument("device offset beyond DMA range"));
        }

        let window = byte_count.min(ticket.size);
        if let Err(err) = self
            .pool
            .set_transfer_window(ticket.index, device_offset, window)
        {
            self.pool.release(ticket);
            return Err(err);
        }

        trace!(
            "start DMA read: offset={:#x} window={} buffer={}",
            device_offset,
            window,
            ticket.index
        );

        // Hand the window to the device before it may write it.
        self.pool.region().sync_for_device();

        if let Err(err) = self.reservation.reserve(&ticket, self.timeouts.reserve, cancel) {
            self.pool.region().sync_for_cpu();
            self.pool.release(ticket);
            return Err(err);
        }

        if let Err(err) = self.program_transfer(&ticket, device_offset, window) {
            error!(
                "DMA register programming failed for offset {:#x}: {}",
                device_offset, err
            );
            self.reservation.release();
            self.pool.region().sync_for_cpu();
            self.pool.release(ticket);
            return Err(err);
        }

        Ok(window)
    }

    fn program_transfer(
        &self,
        ticket: &BufferTicket,
        device_offset: u64,
        window: usize,
    ) -> Result<()> {
        self.hw
            .write32(DMA_BAR, DMA_BOARD_ADDRESS, device_offset as u32)?;
        self.hw.write32(
            DMA_BAR,
            DMA_CPU_ADDRESS,
            (ticket.device_address & 0xFFFF_FFFF) as u32,
        )?;
        // Read back before touching the size register so the address
        // writes are posted to the device first.
        self.hw.read32(DMA_BAR, DMA_STATUS_ADDRESS)?;

        self.times.lock().start = Some(SystemTime::now());

        // The buffer must already be waiting when the size write kicks
        // the transfer; the interrupt can fire immediately after it.
        self.pool.mark_waiting(ticket.index)?;

        let dma_size = quantum_round_up(window);
        if let Err(err) = self.hw.write32(DMA_BAR, DMA_SIZE_ADDRESS, dma_size as u32) {
            // The kick never reached the board; take the buffer back out
            // of the waiting state before unwinding.
            let _ = self.pool.complete(ticket.index);
            return Err(err);
        }
        Ok(())
    }

    /// Block until the buffer's transfer completes. On timeout the
    /// channel reservation is force-released on the assumption that the
    /// interrupt was missed, so the channel is never wedged; if the
    /// transfer actually completes late it can clobber the next one — a
    /// known risk inherited from the board's recovery protocol.
    pub fn wait_dma_read(
        &self,
        ticket: BufferTicket,
        cancel: Option<&CancelToken>,
    ) -> Result<()> {
        let deadline = Instant::now() + self.timeouts.completion;
        loop {
            let seen = self.pool.changed().prepare();
            match self.pool.state(ticket.index) {
                BufferState::Done => break,
                BufferState::Waiting => {}
                state => {
                    debug!("wait on buffer {} in state {:?}", ticket.index, state);
                    return Err(Error::NotFound);
                }
            }
            match self.pool.changed().wait(seen, deadline, cancel) {
                WaitOutcome::Notified => continue,
                WaitOutcome::TimedOut => {
                    if self.pool.state(ticket.index) == BufferState::Done {
                        // The interrupt landed while we were timing out.
                        break;
                    }
                    let (offset, size) = self.pool.window(ticket.index);
                    error!(
                        "timeout waiting for DMA to buffer (offset={:#x}, size={:#x})",
                        offset, size
                    );
                    // Assume the interrupt was missed and recover the
                    // channel. If the transfer actually completes late it
                    // can clobber whatever runs on the channel next; the
                    // board gives no way to cancel an in-flight DMA.
                    self.reservation.release_for(ticket.index);
                    return Err(Error::Timeout);
                }
                WaitOutcome::Interrupted => {
                    let (offset, size) = self.pool.window(ticket.index);
                    warn!(
                        "interrupted waiting for DMA to buffer (offset={:#x}, size={:#x})",
                        offset, size
                    );
                    self.reservation.release_for(ticket.index);
                    return Err(Error::Interrupted);
                }
            }
        }
        self.pool.region().sync_for_cpu();
        Ok(())
    }

    /// End-of-DMA interrupt entry point. Bounded and non-blocking: spin
    /// lock transitions, atomic stores and wait-queue notifications only.
    pub(crate) fn complete_dma(&self) {
        let Some(index) = self.reservation.current() else {
            warn!("unexpected DMA interrupt: no transfer in flight");
            return;
        };
        match self.pool.complete(index) {
            Ok(()) => {
                self.times.lock().stop = Some(SystemTime::now());
                self.reservation.release();
                trace!("DMA complete: buffer {}", index);
            }
            Err(state) => {
                warn!(
                    "unexpected DMA interrupt: buffer {} in state {:?}",
                    index, state
                );
            }
        }
    }

    /// Acquire a buffer and start the next chunk of a stream.
    fn issue_chunk(
        &self,
        device_offset: u64,
        remaining: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<BufferTicket> {
        let ticket = self.pool.acquire_free(self.timeouts.acquire, cancel)?;
        self.start_dma_read(ticket, device_offset, remaining, cancel)?;
        Ok(ticket)
    }

    /// Pipelined streaming read of `total_bytes` of board memory starting
    /// at `device_offset` into `sink`.
    ///
    /// The next chunk's DMA overlaps the previous chunk's copy-out, so
    /// with the usual two-buffer pool one transfer is always in flight
    /// while the previous one drains. Either the full byte count is
    /// delivered or the first error is returned with delivery stopped at
    /// the last completed chunk boundary.
    pub fn read_stream(
        &self,
        device_offset: u64,
        total_bytes: usize,
        sink: &mut [u8],
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        if total_bytes == 0 {
            return Err(Error::InvalidArgument("zero-length stream read"));
        }
        if sink.len() < total_bytes {
            return Err(Error::TransferFault);
        }

        let target = quantum_round_up(total_bytes);
        let mut requested = 0usize;
        let mut delivered = 0usize;
        let mut copied = 0usize;
        let mut prev: Option<BufferTicket> = None;
        let mut result: Result<()> = Ok(());

        debug!(
            "stream read: offset={:#x} bytes={} (rounded {})",
            device_offset, total_bytes, target
        );

        loop {
            // Issue the next chunk while the previous one is in flight.
            let next = if result.is_ok() && requested < target {
                match self.issue_chunk(device_offset + requested as u64, target - requested, cancel)
                {
                    Ok(ticket) => {
                        let (_, window) = self.pool.window(ticket.index);
                        requested += window;
                        Some(ticket)
                    }
                    Err(err) => {
                        result = Err(err);
                        None
                    }
                }
            } else {
                None
            };

            // Drain the chunk issued one iteration ago. It was started
            // before any failure above, so it must be waited for and
            // returned to the pool either way.
            if let Some(ticket) = prev.take() {
                match self.wait_dma_read(ticket, cancel) {
                    Ok(()) => {
                        let (_, window) = self.pool.window(ticket.index);
                        let n = window.min(total_bytes - copied);
                        // SAFETY: the buffer is Done; the device is no
                        // longer writing this window.
                        let data = unsafe {
                            self.pool.region().slice(ticket.driver_offset, n)
                        };
                        sink[copied..copied + n].copy_from_slice(data);
                        copied += n;
                        delivered += window;
                    }
                    Err(err) => {
                        if result.is_ok() {
                            result = Err(err);
                        }
                    }
                }
                self.pool.release(ticket);
            }

            prev = next;
            if prev.is_none() && (result.is_err() || delivered >= target) {
                break;
            }
        }

        match result {
            Ok(()) => {
                trace!("stream read done: {} bytes delivered", copied);
                Ok(copied)
            }
            Err(err) => {
                debug!(
                    "stream read aborted after {} of {} bytes: {}",
                    copied, total_bytes, err
                );
                Err(err)
            }
        }
    }

    /// Let in-flight transfers settle; used by detach.
    pub(crate) fn quiesce(&self, timeout: Duration) {
        self.pool.drain(timeout);
    }
}
