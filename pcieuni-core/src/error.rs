// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver error taxonomy.
//!
//! Callers need to tell "wait for a buffer" apart from "wait for the
//! hardware", so buffer exhaustion and channel busy-ness are separate
//! variants even though both are recoverable by retry.

use thiserror::Error;

/// Errors surfaced by the DMA engine and the register access path.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// No pre-allocated DMA buffer became free within the timeout.
    #[error("no free DMA buffer available")]
    NoFreeBuffer,

    /// The single hardware DMA channel stayed occupied for the whole
    /// reservation timeout.
    #[error("DMA channel busy")]
    Busy,

    /// A blocking wait was cancelled externally.
    #[error("operation interrupted")]
    Interrupted,

    /// The end-of-DMA interrupt never arrived; the channel was forcibly
    /// recovered and the transfer's data must be discarded.
    #[error("timed out waiting for DMA completion")]
    Timeout,

    /// Malformed request (width, alignment, BAR range, sizes).
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// A device register access was rejected by the hardware.
    #[error("register access failed (bar {bar}, offset {offset:#x})")]
    RegisterIo { bar: u8, offset: usize },

    /// Data could not be moved to or from the caller's memory.
    #[error("data transfer fault")]
    TransferFault,

    /// No buffer matches the requested transfer window or driver offset.
    #[error("no buffer matches the request")]
    NotFound,

    /// The DMA buffer region could not be allocated.
    #[error("out of memory allocating DMA buffers")]
    OutOfMemory,

    /// A device with this identity is already registered.
    #[error("device {0} already attached")]
    AlreadyAttached(u32),

    /// The addressed device is not (or no longer) attached.
    #[error("device not attached")]
    Detached,
}

pub type Result<T> = core::result::Result<T, Error>;
