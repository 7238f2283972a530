// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Streaming read benchmark against an attached board.
//!
//! Several worker threads issue pipelined reads over disjoint slices of
//! board memory and optionally verify the data against the board's known
//! pattern.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use log::{info, warn};
use pcieuni::{pattern_byte, BoardDevice};

use crate::stats::{StatsReport, TransferStats};

#[derive(Debug, Clone)]
pub struct BenchmarkConfig {
    /// Bytes each worker reads in total.
    pub bytes_per_worker: usize,
    /// Bytes per streaming call.
    pub bytes_per_call: usize,
    /// Number of concurrent workers.
    pub workers: usize,
    /// Verify delivered data against the board pattern.
    pub verify: bool,
}

impl Default for BenchmarkConfig {
    fn default() -> Self {
        Self {
            bytes_per_worker: 16 * 1024 * 1024,
            bytes_per_call: 1024 * 1024,
            workers: num_cpus::get().min(4),
            verify: true,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BenchmarkResults {
    pub stats: StatsReport,
    pub elapsed: Duration,
    pub throughput_mbps: f64,
}

pub fn run(device: &Arc<BoardDevice>, config: &BenchmarkConfig) -> anyhow::Result<BenchmarkResults> {
    if config.workers == 0 || config.bytes_per_call == 0 {
        bail!("benchmark misconfigured: {:?}", config);
    }

    info!(
        "benchmark: {} workers x {} MiB in {} KiB calls",
        config.workers,
        config.bytes_per_worker / (1024 * 1024),
        config.bytes_per_call / 1024
    );

    let stats = Arc::new(TransferStats::new());
    let started = Instant::now();

    let mut handles = Vec::new();
    for worker in 0..config.workers {
        let device = Arc::clone(device);
        let stats = Arc::clone(&stats);
        let config = config.clone();

        let handle = thread::Builder::new()
            .name(format!("pcieuni-bench-{}", worker))
            .spawn(move || worker_loop(worker, &device, &stats, &config))
            .context("failed to spawn benchmark worker")?;
        handles.push(handle);
    }

    let mut failed = 0usize;
    for handle in handles {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!("benchmark worker failed: {err}");
                failed += 1;
            }
            Err(_) => bail!("benchmark worker panicked"),
        }
    }

    let elapsed = started.elapsed();
    let report = stats.snapshot();
    let throughput_mbps =
        report.bytes as f64 / elapsed.as_secs_f64() / (1024.0 * 1024.0);

    if failed > 0 {
        bail!("{failed} benchmark worker(s) reported errors");
    }

    Ok(BenchmarkResults {
        stats: report,
        elapsed,
        throughput_mbps,
    })
}

fn worker_loop(
    worker: usize,
    device: &BoardDevice,
    stats: &TransferStats,
    config: &BenchmarkConfig,
) -> anyhow::Result<()> {
    // Disjoint per-worker slice of board memory.
    let base = worker as u64 * config.bytes_per_worker as u64;
    let mut sink = vec![0u8; config.bytes_per_call];
    let mut done = 0usize;

    while done < config.bytes_per_worker {
        let call = config.bytes_per_call.min(config.bytes_per_worker - done);
        let offset = base + done as u64;

        let call_started = Instant::now();
        match device.read_transfer(offset, call, &mut sink[..call], None) {
            Ok(n) => {
                stats.record_transfer(n, call_started.elapsed());
            }
            Err(pcieuni::Error::Timeout) => {
                stats.record_timeout();
                bail!("transfer at {offset:#x} timed out");
            }
            Err(err) => {
                stats.record_error();
                bail!("transfer at {offset:#x} failed: {err}");
            }
        }

        if config.verify {
            verify_chunk(offset, &sink[..call])?;
        }
        done += call;
    }
    Ok(())
}

fn verify_chunk(offset: u64, data: &[u8]) -> anyhow::Result<()> {
    for (i, &byte) in data.iter().enumerate() {
        let want = pattern_byte(offset + i as u64);
        if byte != want {
            bail!(
                "data mismatch at board offset {:#x}: got {:#04x}, want {:#04x}",
                offset + i as u64,
                byte,
                want
            );
        }
    }
    Ok(())
}

pub fn print_results(results: &BenchmarkResults) {
    let s = &results.stats;
    println!("pcieuni-bench:");
    println!("  transfers:   {:>12}", s.transfers);
    println!("  bytes:       {:>12}", s.bytes);
    println!("  elapsed:     {:>12.3?}", results.elapsed);
    println!("  throughput:  {:>9.2} MiB/s", results.throughput_mbps);
    println!("  latency avg: {:>12?}", s.avg_latency);
    println!("  latency min: {:>12?}", s.min_latency);
    println!("  latency max: {:>12?}", s.max_latency);
    println!("  errors:      {:>12}", s.errors);
    println!("  timeouts:    {:>12}", s.timeouts);
}
