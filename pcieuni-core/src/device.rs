// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! One attached board: register access, the streaming read contract and
//! the introspection queries, all built on the DMA engine.

use std::sync::Arc;

use log::{debug, info};

use crate::buffer::DmaRegion;
use crate::engine::{DmaEngine, DmaTimes, EngineTimeouts};
use crate::error::{Error, Result};
use crate::hw::{BoardIo, IrqHandler, RegWidth, FIRMWARE_VERSION_ADDRESS};
use crate::pool::BufferPool;
use crate::waitq::CancelToken;

/// Identity of an attached board, assigned by whoever probes the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DeviceId(pub u32);

impl std::fmt::Display for DeviceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "board{}", self.0)
    }
}

/// Attach-time configuration of one board's DMA resources.
#[derive(Debug, Clone, Copy)]
pub struct DeviceConfig {
    /// Number of pre-allocated DMA buffers.
    pub buffer_count: usize,
    /// Size of each buffer in bytes; rounded up to the DMA quantum.
    pub buffer_size: usize,
    pub timeouts: EngineTimeouts,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            buffer_size: 64 * 1024,
            timeouts: EngineTimeouts::default(),
        }
    }
}

/// Static facts about an attached board.
#[derive(Debug, Clone, Copy)]
pub struct DeviceInfo {
    pub driver_version: (u32, u32),
    pub firmware_version: u32,
    pub slot_number: u8,
    /// Bit `n` set when BAR `n` is present.
    pub bar_mask: u8,
}

pub struct BoardDevice {
    id: DeviceId,
    hw: Arc<dyn BoardIo>,
    engine: DmaEngine,
    config: DeviceConfig,
}

impl std::fmt::Debug for BoardDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoardDevice")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

impl BoardDevice {
    /// Build the device around its hardware handle: allocate the DMA
    /// region, map it for the board, carve the buffer pool. The caller
    /// (the registry) wires the interrupt afterwards, once the device
    /// sits behind an `Arc`.
    pub(crate) fn new(id: DeviceId, hw: Arc<dyn BoardIo>, config: DeviceConfig) -> Result<Self> {
        if config.buffer_count == 0 {
            return Err(Error::InvalidArgument("buffer count"));
        }
        let buffer_size = crate::hw::quantum_round_up(config.buffer_size);
        if buffer_size == 0 {
            return Err(Error::InvalidArgument("buffer size"));
        }

        let region = DmaRegion::new(config.buffer_count * buffer_size)?;
        let bus_base = hw.dma_map(&region)?;
        let pool = Arc::new(BufferPool::new(
            region,
            config.buffer_count,
            buffer_size,
            bus_base,
        )?);

        info!(
            "{}: attached with {} x {} KiB DMA buffers at bus {:#x}",
            id,
            config.buffer_count,
            buffer_size / 1024,
            bus_base
        );

        Ok(Self {
            id,
            engine: DmaEngine::new(Arc::clone(&hw), pool, config.timeouts),
            hw,
            config,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.id
    }

    pub fn engine(&self) -> &DmaEngine {
        &self.engine
    }

    fn check_register_access(&self, bar: u8, offset: usize, width: RegWidth) -> Result<()> {
        if bar >= self.hw.bar_count() {
            return Err(Error::InvalidArgument("BAR out of range"));
        }
        if offset % width.bytes() != 0 {
            return Err(Error::InvalidArgument("unaligned register offset"));
        }
        if offset + width.bytes() > self.hw.bar_size(bar) {
            return Err(Error::InvalidArgument("register offset beyond BAR"));
        }
        Ok(())
    }

    /// Width-checked register read.
    pub fn reg_read(&self, bar: u8, offset: usize, width: RegWidth) -> Result<u32> {
        self.check_register_access(bar, offset, width)?;
        match width {
            RegWidth::Byte => self.hw.read8(bar, offset).map(u32::from),
            RegWidth::Word => self.hw.read16(bar, offset).map(u32::from),
            RegWidth::Dword => self.hw.read32(bar, offset),
        }
    }

    /// Width-checked register write.
    pub fn reg_write(&self, bar: u8, offset: usize, width: RegWidth, value: u32) -> Result<()> {
        self.check_register_access(bar, offset, width)?;
        match width {
            RegWidth::Byte => {
                if value > u8::MAX as u32 {
                    return Err(Error::InvalidArgument("value wider than register"));
                }
                self.hw.write8(bar, offset, value as u8)
            }
            RegWidth::Word => {
                if value > u16::MAX as u32 {
                    return Err(Error::InvalidArgument("value wider than register"));
                }
                self.hw.write16(bar, offset, value as u16)
            }
            RegWidth::Dword => self.hw.write32(bar, offset, value),
        }
    }

    /// Phase one of the two-phase streaming protocol: claim a buffer and
    /// kick the DMA for one chunk (at most one buffer's worth). Returns
    /// the window size actually requested from the board.
    pub fn request_transfer(
        &self,
        device_offset: u64,
        byte_count: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        if byte_count == 0 {
            return Err(Error::InvalidArgument("zero-length transfer"));
        }
        let pool = self.engine.pool();
        let ticket = pool.acquire_free(self.config.timeouts.acquire, cancel)?;
        self.engine
            .start_dma_read(ticket, device_offset, byte_count, cancel)
    }

    /// Phase two: wait for the chunk previously requested at this window
    /// and copy it out. The window is identified the same way it was
    /// requested, by `(device_offset, min(byte_count, buffer size))`.
    pub fn wait_transfer(
        &self,
        device_offset: u64,
        byte_count: usize,
        sink: &mut [u8],
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let pool = self.engine.pool();
        let window = byte_count.min(pool.buffer_size());
        let ticket = pool
            .find_by_transfer_window(device_offset, window)
            .ok_or(Error::NotFound)?;

        if let Err(err) = self.engine.wait_dma_read(ticket, cancel) {
            pool.release(ticket);
            return Err(err);
        }

        let n = window.min(sink.len());
        if n < window {
            pool.release(ticket);
            return Err(Error::TransferFault);
        }
        // SAFETY: the buffer is Done; the device is no longer writing it.
        let data = unsafe { pool.region().slice(ticket.driver_offset, n) };
        sink[..n].copy_from_slice(data);
        pool.release(ticket);
        Ok(n)
    }

    /// Single-call synchronous read: the pipelined stream in one shot.
    pub fn read_transfer(
        &self,
        device_offset: u64,
        byte_count: usize,
        sink: &mut [u8],
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        self.engine.read_stream(device_offset, byte_count, sink, cancel)
    }

    /// Buffer count and size, for callers sizing their chunking.
    pub fn pool_info(&self) -> (usize, usize) {
        let pool = self.engine.pool();
        (pool.buffer_count(), pool.buffer_size())
    }

    /// Wall-clock start/stop of the most recent DMA transfer.
    pub fn dma_time(&self) -> DmaTimes {
        self.engine.dma_times()
    }

    pub fn device_info(&self) -> Result<DeviceInfo> {
        let firmware_version = self.hw.read32(0, FIRMWARE_VERSION_ADDRESS)?;
        let mut bar_mask = 0u8;
        for bar in 0..self.hw.bar_count().min(8) {
            if self.hw.bar_size(bar) > 0 {
                bar_mask |= 1 << bar;
            }
        }
        Ok(DeviceInfo {
            driver_version: driver_version(),
            firmware_version,
            slot_number: self.hw.slot_number(),
            bar_mask,
        })
    }

    /// Wait out in-flight transfers before the pool goes away.
    pub(crate) fn shutdown(&self) {
        debug!("{}: shutting down", self.id);
        self.engine.quiesce(self.config.timeouts.completion * 2);
    }
}

impl IrqHandler for BoardDevice {
    fn handle_irq(&self) {
        self.engine.complete_dma();
    }
}

fn driver_version() -> (u32, u32) {
    let major = env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0);
    let minor = env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0);
    (major, minor)
}
