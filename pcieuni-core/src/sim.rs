// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Software model of the board.
//!
//! Implements [`BoardIo`] with loopback register files, a deterministic
//! board-memory pattern and a completion thread standing in for the DMA
//! master plus its end-of-transfer interrupt. Fault switches cover the
//! failure modes the engine has to recover from: a lost interrupt and
//! rejected register writes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use log::{debug, error, trace, warn};
use parking_lot::Mutex;
use spin::Mutex as SpinMutex;

use crate::buffer::DmaRegion;
use crate::error::{Error, Result};
use crate::hw::{BoardIo, IrqHandler, DMA_BAR, DMA_BOARD_ADDRESS, DMA_CPU_ADDRESS,
    DMA_SIZE_ADDRESS, DMA_STATUS_ADDRESS};
use crate::waitq::{WaitOutcome, WaitQueue};

/// Bus address the simulated board sees the DMA region at.
const SIM_BUS_BASE: u64 = 0x4000_0000;

/// Register file sizes per BAR.
const BAR_SIZES: [usize; 3] = [4096, 16384, 4096];

/// Depth of the descriptor queue feeding the completion thread. The
/// engine serializes transfers, so anything beyond a couple is headroom.
const DESCRIPTOR_QUEUE_DEPTH: usize = 8;

bitflags::bitflags! {
    /// Bits of the DMA status register (BAR2 offset 0x0).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DmaStatus: u32 {
        const IDLE    = 1 << 0;
        const RUNNING = 1 << 1;
    }
}

/// The byte the board's memory holds at `offset`. Deterministic so every
/// consumer can verify transfers independently.
pub fn pattern_byte(offset: u64) -> u8 {
    (offset.wrapping_mul(0x9E37_79B9_7F4A_7C15) >> 56) as u8
}

#[derive(Debug, Clone, Copy)]
pub struct SimConfig {
    /// Simulated transfer latency per DMA descriptor.
    pub completion_delay: Duration,
    pub firmware_version: u32,
    pub slot_number: u8,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            completion_delay: Duration::from_micros(200),
            firmware_version: 0x0203_0001,
            slot_number: 5,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    board_offset: u32,
    bus_addr: u32,
    size: u32,
}

struct SimInner {
    config: SimConfig,
    bars: [SpinMutex<Box<[u8]>>; 3],
    dma: SpinMutex<Option<(Arc<DmaRegion>, u64)>>,
    irq: SpinMutex<Option<Weak<dyn IrqHandler>>>,
    pending: ArrayQueue<Descriptor>,
    work: WaitQueue,
    shutdown: AtomicBool,
    running: AtomicBool,
    lose_next_irq: AtomicBool,
    fail_register_writes: AtomicBool,
    transfers_completed: AtomicU64,
}

impl SimInner {
    fn bar_slice(&self, bar: u8, offset: usize, len: usize) -> Result<()> {
        if bar as usize >= BAR_SIZES.len() || offset + len > BAR_SIZES[bar as usize] {
            return Err(Error::RegisterIo { bar, offset });
        }
        Ok(())
    }

    fn read_reg(&self, bar: u8, offset: usize, len: usize) -> Result<u64> {
        self.bar_slice(bar, offset, len)?;
        if bar == DMA_BAR && offset == DMA_STATUS_ADDRESS && len == 4 {
            let status = if self.running.load(Ordering::Acquire) || !self.pending.is_empty() {
                DmaStatus::RUNNING
            } else {
                DmaStatus::IDLE
            };
            return Ok(u64::from(status.bits()));
        }
        let file = self.bars[bar as usize].lock();
        let mut value = 0u64;
        for i in (0..len).rev() {
            value = (value << 8) | u64::from(file[offset + i]);
        }
        Ok(value)
    }

    fn write_reg(&self, bar: u8, offset: usize, len: usize, value: u64) -> Result<()> {
        if self.fail_register_writes.load(Ordering::Acquire) {
            return Err(Error::RegisterIo { bar, offset });
        }
        self.bar_slice(bar, offset, len)?;
        {
            let mut file = self.bars[bar as usize].lock();
            for i in 0..len {
                file[offset + i] = (value >> (8 * i)) as u8;
            }
        }
        if bar == DMA_BAR && offset == DMA_SIZE_ADDRESS && len == 4 {
            self.kick_dma(value as u32)?;
        }
        Ok(())
    }

    /// Writing the size register starts a transfer: snapshot the address
    /// registers and queue a descriptor for the completion thread.
    fn kick_dma(&self, size: u32) -> Result<()> {
        let (board_offset, bus_addr) = {
            let file = self.bars[DMA_BAR as usize].lock();
            let rd = |off: usize| {
                u32::from_le_bytes([file[off], file[off + 1], file[off + 2], file[off + 3]])
            };
            (rd(DMA_BOARD_ADDRESS), rd(DMA_CPU_ADDRESS))
        };
        let desc = Descriptor {
            board_offset,
            bus_addr,
            size,
        };
        trace!(
            "sim: DMA kick src={:#x} dst={:#x} size={:#x}",
            board_offset,
            bus_addr,
            size
        );
        if self.pending.push(desc).is_err() {
            error!("sim: descriptor queue overflow, transfer dropped");
            return Err(Error::RegisterIo {
                bar: DMA_BAR,
                offset: DMA_SIZE_ADDRESS,
            });
        }
        self.work.notify();
        Ok(())
    }

    /// Completion thread body: drain descriptors, write the pattern into
    /// the destination window, raise the interrupt.
    fn run(&self) {
        debug!("sim: completion thread up");
        while !self.shutdown.load(Ordering::Acquire) {
            let seen = self.work.prepare();
            let Some(desc) = self.pending.pop() else {
                match self.work.wait(seen, Instant::now() + Duration::from_millis(100), None) {
                    WaitOutcome::Notified | WaitOutcome::TimedOut => continue,
                    WaitOutcome::Interrupted => break,
                }
            };

            self.running.store(true, Ordering::Release);
            thread::sleep(self.config.completion_delay);
            self.execute(desc);
            self.running.store(false, Ordering::Release);

            if self.lose_next_irq.swap(false, Ordering::AcqRel) {
                warn!("sim: dropping end-of-DMA interrupt (fault injection)");
                continue;
            }
            self.raise_irq();
        }
        debug!("sim: completion thread down");
    }

    fn execute(&self, desc: Descriptor) {
        let guard = self.dma.lock();
        let Some((region, bus_base)) = guard.as_ref() else {
            error!("sim: DMA kick with no mapped region");
            return;
        };
        let dst = u64::from(desc.bus_addr);
        if dst < *bus_base || dst + u64::from(desc.size) > *bus_base + region.len() as u64 {
            error!(
                "sim: DMA destination {:#x}+{:#x} outside mapped region",
                dst, desc.size
            );
            return;
        }
        let offset = (dst - *bus_base) as usize;
        // SAFETY: the engine keeps the destination buffer Waiting for the
        // whole transfer, so this window has no other accessor.
        let window = unsafe { region.slice_mut(offset, desc.size as usize) };
        for (i, byte) in window.iter_mut().enumerate() {
            *byte = pattern_byte(u64::from(desc.board_offset) + i as u64);
        }
        region.sync_for_device();
        self.transfers_completed.fetch_add(1, Ordering::Relaxed);
    }

    fn raise_irq(&self) {
        let handler = self.irq.lock().clone();
        match handler.and_then(|weak| weak.upgrade()) {
            Some(handler) => handler.handle_irq(),
            None => debug!("sim: end-of-DMA interrupt with no handler wired"),
        }
    }
}

/// A simulated board instance. Dropping it stops the completion thread.
pub struct SimBoard {
    inner: Arc<SimInner>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl SimBoard {
    pub fn new(config: SimConfig) -> Arc<Self> {
        let inner = Arc::new(SimInner {
            config,
            bars: [
                SpinMutex::new(vec![0u8; BAR_SIZES[0]].into_boxed_slice()),
                SpinMutex::new(vec![0u8; BAR_SIZES[1]].into_boxed_slice()),
                SpinMutex::new(vec![0u8; BAR_SIZES[2]].into_boxed_slice()),
            ],
            dma: SpinMutex::new(None),
            irq: SpinMutex::new(None),
            pending: ArrayQueue::new(DESCRIPTOR_QUEUE_DEPTH),
            work: WaitQueue::new(),
            shutdown: AtomicBool::new(false),
            running: AtomicBool::new(false),
            lose_next_irq: AtomicBool::new(false),
            fail_register_writes: AtomicBool::new(false),
            transfers_completed: AtomicU64::new(0),
        });

        // Firmware version register, as the board's boot code would.
        inner.bars[0].lock()[0..4].copy_from_slice(&config.firmware_version.to_le_bytes());

        let worker_inner = Arc::clone(&inner);
        let worker = thread::Builder::new()
            .name("sim-dma".to_string())
            .spawn(move || worker_inner.run())
            .expect("sim: failed to spawn completion thread");

        Arc::new(Self {
            inner,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Drop the next end-of-DMA interrupt on the floor. Exercises the
    /// engine's missed-interrupt recovery.
    pub fn lose_next_irq(&self) {
        self.inner.lose_next_irq.store(true, Ordering::Release);
    }

    /// Make every register write fail until cleared.
    pub fn fail_register_writes(&self, fail: bool) {
        self.inner.fail_register_writes.store(fail, Ordering::Release);
    }

    pub fn transfers_completed(&self) -> u64 {
        self.inner.transfers_completed.load(Ordering::Relaxed)
    }
}

impl Drop for SimBoard {
    fn drop(&mut self) {
        self.inner.shutdown.store(true, Ordering::Release);
        self.inner.work.notify();
        if let Some(worker) = self.worker.lock().take() {
            let _ = worker.join();
        }
    }
}

impl BoardIo for SimBoard {
    fn bar_count(&self) -> u8 {
        BAR_SIZES.len() as u8
    }

    fn bar_size(&self, bar: u8) -> usize {
        BAR_SIZES.get(bar as usize).copied().unwrap_or(0)
    }

    fn read8(&self, bar: u8, offset: usize) -> Result<u8> {
        self.inner.read_reg(bar, offset, 1).map(|v| v as u8)
    }

    fn read16(&self, bar: u8, offset: usize) -> Result<u16> {
        self.inner.read_reg(bar, offset, 2).map(|v| v as u16)
    }

    fn read32(&self, bar: u8, offset: usize) -> Result<u32> {
        self.inner.read_reg(bar, offset, 4).map(|v| v as u32)
    }

    fn write8(&self, bar: u8, offset: usize, value: u8) -> Result<()> {
        self.inner.write_reg(bar, offset, 1, u64::from(value))
    }

    fn write16(&self, bar: u8, offset: usize, value: u16) -> Result<()> {
        self.inner.write_reg(bar, offset, 2, u64::from(value))
    }

    fn write32(&self, bar: u8, offset: usize, value: u32) -> Result<()> {
        self.inner.write_reg(bar, offset, 4, u64::from(value))
    }

    fn dma_map(&self, region: &Arc<DmaRegion>) -> Result<u64> {
        *self.inner.dma.lock() = Some((Arc::clone(region), SIM_BUS_BASE));
        Ok(SIM_BUS_BASE)
    }

    fn set_irq_handler(&self, handler: Weak<dyn IrqHandler>) {
        *self.inner.irq.lock() = Some(handler);
    }

    fn slot_number(&self) -> u8 {
        self.inner.config.slot_number
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_loopback() {
        let board = SimBoard::new(SimConfig::default());
        board.write32(0, 0x200, 1).unwrap();
        assert_eq!(board.read32(0, 0x200).unwrap(), 1);

        board.write16(1, 0x10, 0xBEEF).unwrap();
        assert_eq!(board.read16(1, 0x10).unwrap(), 0xBEEF);

        board.write8(0, 0x201, 0x7F).unwrap();
        // Byte write must not clobber its neighbours.
        assert_eq!(board.read32(0, 0x200).unwrap(), 0x7F01);
    }

    #[test]
    fn test_out_of_range_access_rejected() {
        let board = SimBoard::new(SimConfig::default());
        assert!(board.read32(7, 0).is_err());
        assert!(board.write32(0, BAR_SIZES[0], 0).is_err());
    }

    #[test]
    fn test_write_fault_injection() {
        let board = SimBoard::new(SimConfig::default());
        board.fail_register_writes(true);
        assert!(board.write32(0, 0x200, 1).is_err());
        board.fail_register_writes(false);
        assert!(board.write32(0, 0x200, 1).is_ok());
    }

    #[test]
    fn test_firmware_version_register() {
        let config = SimConfig {
            firmware_version: 0xCAFE_0042,
            ..SimConfig::default()
        };
        let board = SimBoard::new(config);
        assert_eq!(board.read32(0, 0).unwrap(), 0xCAFE_0042);
    }

    #[test]
    fn test_pattern_is_deterministic() {
        assert_eq!(pattern_byte(1234), pattern_byte(1234));
        // A realistic spread: adjacent offsets rarely collide.
        let distinct = (0..256u64)
            .map(pattern_byte)
            .collect::<std::collections::BTreeSet<_>>()
            .len();
        assert!(distinct > 64);
    }
}
