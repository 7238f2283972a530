// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Pre-allocated DMA buffers and their backing memory region.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{fence, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::hw::DMA_QUANTUM;

/// Lifecycle state of one DMA buffer.
///
/// `Free` buffers belong to the pool; `Reserved` and `Waiting` buffers are
/// borrowed by exactly one in-flight transfer; `Done` buffers hold data the
/// consumer has not yet collected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    Free,
    Reserved,
    Waiting,
    Done,
}

/// One page-aligned allocation backing the whole buffer pool.
///
/// The region is shared between the CPU side (the pool and the copy-out
/// path) and the device side (the DMA master writing completed transfers),
/// so raw accessors are used instead of a `&mut` to the whole block. The
/// buffer state machine is the aliasing discipline: the device only writes
/// a window while its buffer is `Waiting`, the CPU only reads it once it
/// is `Done`.
pub struct DmaRegion {
    base: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// The raw pointer is only dereferenced through the checked accessors
// below, under the buffer state discipline described above.
unsafe impl Send for DmaRegion {}
unsafe impl Sync for DmaRegion {}

impl DmaRegion {
    /// Allocate a zeroed, quantum-aligned region of `len` bytes.
    pub fn new(len: usize) -> Result<Arc<Self>> {
        if len == 0 {
            return Err(Error::InvalidArgument("DMA region size"));
        }
        let layout = Layout::from_size_align(len, DMA_QUANTUM)
            .map_err(|_| Error::InvalidArgument("DMA region size"))?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let base = NonNull::new(ptr).ok_or(Error::OutOfMemory)?;
        Ok(Arc::new(Self { base, len, layout }))
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Read-only view of a window.
    ///
    /// # Safety
    /// The caller must ensure the device is not concurrently writing the
    /// window, i.e. the owning buffer is not `Waiting`.
    pub unsafe fn slice(&self, offset: usize, len: usize) -> &[u8] {
        assert!(offset + len <= self.len, "window outside DMA region");
        std::slice::from_raw_parts(self.base.as_ptr().add(offset), len)
    }

    /// Mutable view of a window.
    ///
    /// # Safety
    /// The caller must be the window's only accessor; for the device side
    /// that means the owning buffer is `Waiting`.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn slice_mut(&self, offset: usize, len: usize) -> &mut [u8] {
        assert!(offset + len <= self.len, "window outside DMA region");
        std::slice::from_raw_parts_mut(self.base.as_ptr().add(offset), len)
    }

    /// Hand a window to the device (analogue of syncing a mapping for
    /// device access).
    pub fn sync_for_device(&self) {
        fence(Ordering::Release);
    }

    /// Take a window back for CPU reads after the device finished writing.
    pub fn sync_for_cpu(&self) {
        fence(Ordering::Acquire);
    }
}

impl Drop for DmaRegion {
    fn drop(&mut self) {
        // SAFETY: allocated with this exact layout in `new`.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

/// One buffer slot. Geometry is fixed at pool creation; only the transfer
/// window and the state mutate, and only under the pool's lock.
#[derive(Debug)]
pub(crate) struct DmaBuffer {
    pub driver_offset: usize,
    pub size: usize,
    pub device_address: u64,
    pub transfer_offset: u64,
    pub transfer_size: usize,
    pub state: BufferState,
}

impl DmaBuffer {
    pub(crate) fn new(driver_offset: usize, size: usize, device_address: u64) -> Self {
        Self {
            driver_offset,
            size,
            device_address,
            transfer_offset: 0,
            transfer_size: 0,
            state: BufferState::Free,
        }
    }

    /// Clear the transfer window so a re-acquired buffer never leaks the
    /// previous transfer's offset or size.
    pub(crate) fn reset_window(&mut self) {
        self.transfer_offset = 0;
        self.transfer_size = 0;
    }
}

/// Caller-side handle to a pool buffer: geometry by value, no ownership.
/// Ownership of the slot always traces back to the pool.
#[derive(Debug, Clone, Copy)]
pub struct BufferTicket {
    pub(crate) index: usize,
    pub driver_offset: usize,
    pub size: usize,
    pub device_address: u64,
}
