// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Zero-copy exposure of the DMA buffers.
//!
//! Instead of copying completed chunks out, a caller maps the buffer
//! region once and then follows the wait/acknowledge protocol: wait for
//! the chunk at a window, read it straight out of the mapping, then
//! release the buffer explicitly. The release is a separate call here —
//! unlike the copy path there is no copy after which the engine could
//! free the buffer on the caller's behalf.

use std::sync::Arc;

use log::trace;

use crate::buffer::DmaRegion;
use crate::device::BoardDevice;
use crate::error::{Error, Result};
use crate::waitq::CancelToken;

/// Read-only view of every DMA buffer, one block per buffer, addressed by
/// driver offset. Holds the region alive independent of the device.
pub struct MappedRegion {
    region: Arc<DmaRegion>,
    block_size: usize,
    offsets: Vec<usize>,
}

impl std::fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedRegion")
            .field("block_size", &self.block_size)
            .field("offsets", &self.offsets)
            .finish()
    }
}

impl MappedRegion {
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.offsets.len()
    }

    /// Driver offsets of the mapped blocks, in region order.
    pub fn driver_offsets(&self) -> &[usize] {
        &self.offsets
    }

    /// The mapped block at `driver_offset`.
    ///
    /// Only meaningful between `wait_mapped` returning this offset and
    /// the matching `release_mapped`; outside that span the device may be
    /// rewriting the block.
    pub fn block(&self, driver_offset: usize) -> Result<&[u8]> {
        if !self.offsets.contains(&driver_offset) {
            return Err(Error::NotFound);
        }
        // SAFETY: in-protocol reads happen while the buffer is Done and
        // the device is quiescent for this window.
        Ok(unsafe { self.region.slice(driver_offset, self.block_size) })
    }
}

impl BoardDevice {
    /// Establish the zero-copy mapping: one read-only block per buffer.
    /// `block_size` must match the pool's buffer size exactly.
    pub fn map_region(&self, block_size: usize) -> Result<MappedRegion> {
        let pool = self.engine().pool();
        if block_size != pool.buffer_size() {
            return Err(Error::InvalidArgument("mapping size != buffer size"));
        }
        trace!("{}: mapping {} buffer blocks", self.id(), pool.buffer_count());
        Ok(MappedRegion {
            region: Arc::clone(pool.region()),
            block_size,
            offsets: pool.driver_offsets(),
        })
    }

    /// Wait until the chunk requested at `(device_offset, byte_count)` is
    /// complete and return the driver offset of the buffer holding it.
    /// The buffer stays out of the pool until `release_mapped`.
    pub fn wait_mapped(
        &self,
        device_offset: u64,
        byte_count: usize,
        cancel: Option<&CancelToken>,
    ) -> Result<usize> {
        let pool = self.engine().pool();
        let window = byte_count.min(pool.buffer_size());
        let ticket = pool
            .find_by_transfer_window(device_offset, window)
            .ok_or(Error::NotFound)?;

        if let Err(err) = self.engine().wait_dma_read(ticket, cancel) {
            pool.release(ticket);
            return Err(err);
        }
        Ok(ticket.driver_offset)
    }

    /// Acknowledge a mapped chunk: hand its buffer back to the pool.
    pub fn release_mapped(&self, driver_offset: usize) -> Result<()> {
        let pool = self.engine().pool();
        let ticket = pool
            .find_by_driver_offset(driver_offset)
            .ok_or(Error::NotFound)?;
        pool.release(ticket);
        Ok(())
    }
}
