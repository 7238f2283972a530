// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Driver daemon shell for universal PCIe data acquisition boards.
//!
//! Wires a board into the device registry, runs a functional pass over
//! every request path the driver exposes (registers, two-phase streaming,
//! zero-copy mapping, introspection) and then a throughput benchmark of
//! the pipelined read engine. Hardware probing is a separate concern; the
//! board model behind [`pcieuni::BoardIo`] here is the simulated one,
//! the same contract a PCI-backed implementation plugs into.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{ensure, Context};
use log::info;

use pcieuni::{
    BoardDevice, DeviceConfig, DeviceId, DeviceRegistry, EngineTimeouts, RegWidth, SimBoard,
    SimConfig,
};

mod benchmark;
mod logger;
mod stats;

use crate::benchmark::BenchmarkConfig;

/// Daemon configuration, environment-driven.
#[derive(Debug, Clone)]
struct DaemonConfig {
    /// Pre-allocated DMA buffers per board.
    buffer_count: usize,
    /// Size of each DMA buffer in bytes.
    buffer_size: usize,
    /// Benchmark worker threads (0 = one per CPU, capped at 4).
    workers: usize,
    /// Bytes each benchmark worker reads.
    bytes_per_worker: usize,
    /// Bytes per streaming call.
    bytes_per_call: usize,
    /// Simulated completion latency in microseconds.
    completion_delay_us: u64,
    /// Verify delivered data against the board pattern.
    verify: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            buffer_count: 2,
            buffer_size: 64 * 1024,
            workers: 0,
            bytes_per_worker: 16 * 1024 * 1024,
            bytes_per_call: 1024 * 1024,
            completion_delay_us: 50,
            verify: true,
        }
    }
}

fn parse_config() -> DaemonConfig {
    let mut config = DaemonConfig::default();

    if let Ok(val) = std::env::var("PCIEUNI_BUFFER_COUNT") {
        if let Ok(n) = val.parse() {
            config.buffer_count = n;
        }
    }

    if let Ok(val) = std::env::var("PCIEUNI_BUFFER_SIZE") {
        if let Ok(n) = val.parse() {
            config.buffer_size = n;
        }
    }

    if let Ok(val) = std::env::var("PCIEUNI_WORKERS") {
        if let Ok(n) = val.parse() {
            config.workers = n;
        }
    }

    if let Ok(val) = std::env::var("PCIEUNI_BENCH_BYTES") {
        if let Ok(n) = val.parse() {
            config.bytes_per_worker = n;
        }
    }

    if let Ok(val) = std::env::var("PCIEUNI_BYTES_PER_CALL") {
        if let Ok(n) = val.parse() {
            config.bytes_per_call = n;
        }
    }

    if let Ok(val) = std::env::var("PCIEUNI_COMPLETION_DELAY_US") {
        if let Ok(n) = val.parse() {
            config.completion_delay_us = n;
        }
    }

    if let Ok(val) = std::env::var("PCIEUNI_VERIFY") {
        config.verify = val == "1" || val.to_lowercase() == "true";
    }

    config
}

fn main() -> anyhow::Result<()> {
    logger::init();
    info!("starting pcieuni driver v{}", env!("CARGO_PKG_VERSION"));

    let config = parse_config();
    info!("configuration: {:?}", config);

    let registry = DeviceRegistry::new();
    let board = SimBoard::new(SimConfig {
        completion_delay: Duration::from_micros(config.completion_delay_us),
        ..SimConfig::default()
    });

    let device_config = DeviceConfig {
        buffer_count: config.buffer_count,
        buffer_size: config.buffer_size,
        timeouts: EngineTimeouts::default(),
    };
    let device = registry
        .attach(DeviceId(0), board, device_config)
        .context("failed to attach board")?;

    let (count, size) = device.pool_info();
    info!("pool: {} buffers x {} KiB", count, size / 1024);

    functional_pass(&device).context("functional pass failed")?;
    info!("functional pass ok");

    let bench = BenchmarkConfig {
        bytes_per_worker: config.bytes_per_worker,
        bytes_per_call: config.bytes_per_call,
        workers: if config.workers == 0 {
            num_cpus::get().min(4)
        } else {
            config.workers
        },
        verify: config.verify,
    };
    let results = benchmark::run(&device, &bench)?;
    benchmark::print_results(&results);

    if let (Some(start), Some(stop)) = (device.dma_time().start, device.dma_time().stop) {
        if let Ok(span) = stop.duration_since(start) {
            info!("last transfer spanned {:?}", span);
        }
    }

    registry.detach(DeviceId(0))?;
    info!("pcieuni driver exiting");
    Ok(())
}

/// One pass over every request path the driver serves.
fn functional_pass(device: &Arc<BoardDevice>) -> anyhow::Result<()> {
    let info = device.device_info()?;
    info!(
        "board: driver v{}.{}, firmware {:#010x}, slot {}, BARs {:#05b}",
        info.driver_version.0,
        info.driver_version.1,
        info.firmware_version,
        info.slot_number,
        info.bar_mask
    );

    // Register loopback through the width-checked contract.
    device.reg_write(0, 0x200, RegWidth::Dword, 0x1234_5678)?;
    let value = device.reg_read(0, 0x200, RegWidth::Dword)?;
    ensure!(value == 0x1234_5678, "register loopback mismatch: {value:#x}");

    let (_, buffer_size) = device.pool_info();

    // Two-phase streaming: request one chunk, then collect it.
    let mut chunk = vec![0u8; buffer_size];
    let requested = device.request_transfer(0, buffer_size, None)?;
    let delivered = device.wait_transfer(0, buffer_size, &mut chunk, None)?;
    ensure!(
        requested == delivered,
        "two-phase delivery mismatch: {requested} != {delivered}"
    );

    // Zero-copy: map, request, wait, read in place, acknowledge.
    let mapped = device.map_region(buffer_size)?;
    device.request_transfer(0x10_0000, buffer_size, None)?;
    let driver_offset = device.wait_mapped(0x10_0000, buffer_size, None)?;
    let block = mapped.block(driver_offset)?;
    ensure!(
        block[0] == pcieuni::pattern_byte(0x10_0000),
        "mapped block holds wrong data"
    );
    device.release_mapped(driver_offset)?;

    Ok(())
}
