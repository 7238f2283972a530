// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! DMA streaming engine for universal PCIe data acquisition boards.
//!
//! The board exposes its memory through a single DMA read channel; this
//! crate turns that channel into a concurrent streaming service built on
//! a small pool of pre-allocated, device-addressable buffers.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                     Caller threads                        │
//! └───────┬──────────────────┬───────────────────┬───────────┘
//!         │ read_transfer    │ request/wait      │ mapped
//! ┌───────▼──────────────────▼───────────────────▼───────────┐
//! │                     BoardDevice                           │
//! │   ┌───────────────────────────────────────────────────┐   │
//! │   │                  DmaEngine                         │   │
//! │   │  start ──► reserve channel ──► program registers   │   │
//! │   │  wait  ◄── pool notification ◄── completion (IRQ)  │   │
//! │   └─────────┬───────────────────────────┬─────────────┘   │
//! │             │                           │                 │
//! │      ┌──────▼──────┐            ┌───────▼────────┐        │
//! │      │ BufferPool  │            │ DmaReservation │        │
//! │      │ (spin lock) │            │ (idle flag)    │        │
//! │      └─────────────┘            └────────────────┘        │
//! └───────────────────────────┬──────────────────────────────┘
//!                             │ BoardIo (BAR reads/writes)
//! ┌───────────────────────────▼──────────────────────────────┐
//! │            PCIe board  /  simulated board                 │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! Two execution contexts share the buffer state: ordinary caller
//! threads, which may sleep on bounded waits, and the completion context,
//! which may not sleep at all. They meet only through the pool's spin
//! lock, a pair of atomic flags and the change-notification queues.

pub mod buffer;
pub mod device;
pub mod engine;
pub mod error;
pub mod hw;
pub mod mapped;
pub mod pool;
pub mod registry;
pub mod reservation;
pub mod sim;
pub mod waitq;

pub use buffer::{BufferState, BufferTicket, DmaRegion};
pub use device::{BoardDevice, DeviceConfig, DeviceId, DeviceInfo};
pub use engine::{DmaEngine, DmaTimes, EngineTimeouts};
pub use error::{Error, Result};
pub use hw::{BoardIo, IrqHandler, RegWidth, DMA_QUANTUM};
pub use mapped::MappedRegion;
pub use pool::BufferPool;
pub use registry::DeviceRegistry;
pub use reservation::DmaReservation;
pub use sim::{pattern_byte, SimBoard, SimConfig};
pub use waitq::{CancelToken, WaitQueue};
