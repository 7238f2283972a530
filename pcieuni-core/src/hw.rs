// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Hardware access seam.
//!
//! The engine talks to the board exclusively through [`BoardIo`]; the
//! simulated board implements it for tests and benchmarks, a PCI-backed
//! implementation would map the BARs for real.

use std::sync::{Arc, Weak};

use crate::buffer::DmaRegion;
use crate::error::Result;

/// Granularity of the board's DMA engine. Transfer sizes programmed into
/// the size register are rounded up to this quantum; partial trailing
/// data still occupies a full quantum on the wire.
pub const DMA_QUANTUM: usize = 4096;

/// BAR carrying the DMA engine registers.
pub const DMA_BAR: u8 = 2;

/// DMA engine status register (also used as the post-write read-back).
pub const DMA_STATUS_ADDRESS: usize = 0x0;
/// Source offset in board memory.
pub const DMA_BOARD_ADDRESS: usize = 0x4;
/// Bus address of the destination buffer (low 32 bits).
pub const DMA_CPU_ADDRESS: usize = 0x8;
/// Transfer size in bytes; writing this register starts the transfer.
pub const DMA_SIZE_ADDRESS: usize = 0xC;

/// Firmware version register in BAR0.
pub const FIRMWARE_VERSION_ADDRESS: usize = 0x0;

/// Round a transfer size up to the DMA quantum.
pub const fn quantum_round_up(bytes: usize) -> usize {
    (bytes + DMA_QUANTUM - 1) / DMA_QUANTUM * DMA_QUANTUM
}

/// Register access width of the user-facing read/write contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegWidth {
    Byte,
    Word,
    Dword,
}

impl RegWidth {
    pub const fn bytes(self) -> usize {
        match self {
            RegWidth::Byte => 1,
            RegWidth::Word => 2,
            RegWidth::Dword => 4,
        }
    }
}

impl TryFrom<u8> for RegWidth {
    type Error = crate::error::Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(RegWidth::Byte),
            2 => Ok(RegWidth::Word),
            4 => Ok(RegWidth::Dword),
            _ => Err(crate::error::Error::InvalidArgument("register width")),
        }
    }
}

/// End-of-DMA interrupt sink. Implementations must be bounded and
/// non-blocking; they run on the board's interrupt dispatch context.
pub trait IrqHandler: Send + Sync {
    fn handle_irq(&self);
}

/// Memory-mapped access to one board.
pub trait BoardIo: Send + Sync {
    /// Number of BARs this board exposes.
    fn bar_count(&self) -> u8;

    /// Size in bytes of the given BAR's register file.
    fn bar_size(&self, bar: u8) -> usize;

    fn read8(&self, bar: u8, offset: usize) -> Result<u8>;
    fn read16(&self, bar: u8, offset: usize) -> Result<u16>;
    fn read32(&self, bar: u8, offset: usize) -> Result<u32>;

    fn write8(&self, bar: u8, offset: usize, value: u8) -> Result<()>;
    fn write16(&self, bar: u8, offset: usize, value: u16) -> Result<()>;
    fn write32(&self, bar: u8, offset: usize, value: u32) -> Result<()>;

    /// Make `region` visible to the board's DMA master and return the bus
    /// base address the board must be programmed with.
    fn dma_map(&self, region: &Arc<DmaRegion>) -> Result<u64>;

    /// Wire the end-of-DMA interrupt to `handler`. Held weakly so a
    /// detached device does not keep the board alive.
    fn set_irq_handler(&self, handler: Weak<dyn IrqHandler>);

    /// Physical slot this board sits in, as reported by the carrier.
    fn slot_number(&self) -> u8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quantum_round_up() {
        assert_eq!(quantum_round_up(0), 0);
        assert_eq!(quantum_round_up(1), DMA_QUANTUM);
        assert_eq!(quantum_round_up(DMA_QUANTUM), DMA_QUANTUM);
        assert_eq!(quantum_round_up(DMA_QUANTUM + 1), 2 * DMA_QUANTUM);
        assert_eq!(quantum_round_up(200000), 49 * DMA_QUANTUM);
    }

    #[test]
    fn test_reg_width_try_from() {
        assert_eq!(RegWidth::try_from(1).unwrap(), RegWidth::Byte);
        assert_eq!(RegWidth::try_from(2).unwrap(), RegWidth::Word);
        assert_eq!(RegWidth::try_from(4).unwrap(), RegWidth::Dword);
        assert!(RegWidth::try_from(3).is_err());
        assert!(RegWidth::try_from(8).is_err());
    }
}
