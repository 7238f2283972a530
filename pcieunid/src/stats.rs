// SPDX-FileCopyrightText: 2024 Redox OS Developers
// SPDX-License-Identifier: MIT

//! Transfer statistics for the daemon's workers and the benchmark.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counters shared by all worker threads.
pub struct TransferStats {
    transfers: AtomicU64,
    bytes: AtomicU64,
    total_latency_ns: AtomicU64,
    min_latency_ns: AtomicU64,
    max_latency_ns: AtomicU64,
    errors: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time view of the counters.
#[derive(Debug, Clone, Copy)]
pub struct StatsReport {
    pub transfers: u64,
    pub bytes: u64,
    pub avg_latency: Duration,
    pub min_latency: Duration,
    pub max_latency: Duration,
    pub errors: u64,
    pub timeouts: u64,
}

impl TransferStats {
    pub const fn new() -> Self {
        Self {
            transfers: AtomicU64::new(0),
            bytes: AtomicU64::new(0),
            total_latency_ns: AtomicU64::new(0),
            min_latency_ns: AtomicU64::new(u64::MAX),
            max_latency_ns: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
        }
    }

    pub fn record_transfer(&self, bytes: usize, latency: Duration) {
        self.transfers.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);

        let latency_ns = latency.as_nanos() as u64;
        self.total_latency_ns
            .fetch_add(latency_ns, Ordering::Relaxed);

        let mut current_min = self.min_latency_ns.load(Ordering::Relaxed);
        while latency_ns < current_min {
            match self.min_latency_ns.compare_exchange_weak(
                current_min,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_min = x,
            }
        }

        let mut current_max = self.max_latency_ns.load(Ordering::Relaxed);
        while latency_ns > current_max {
            match self.max_latency_ns.compare_exchange_weak(
                current_max,
                latency_ns,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => current_max = x,
            }
        }
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsReport {
        let transfers = self.transfers.load(Ordering::Relaxed);
        let total_latency = self.total_latency_ns.load(Ordering::Relaxed);
        let min_latency = self.min_latency_ns.load(Ordering::Relaxed);

        StatsReport {
            transfers,
            bytes: self.bytes.load(Ordering::Relaxed),
            avg_latency: if transfers > 0 {
                Duration::from_nanos(total_latency / transfers)
            } else {
                Duration::ZERO
            },
            min_latency: if min_latency == u64::MAX {
                Duration::ZERO
            } else {
                Duration::from_nanos(min_latency)
            },
            max_latency: Duration::from_nanos(self.max_latency_ns.load(Ordering::Relaxed)),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
