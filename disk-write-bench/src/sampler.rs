//! Rate-gated CPU utilization sampling shared by all workers.
//!
//! At most one snapshot is produced per [`SAMPLE_INTERVAL_US`] across the whole process.
//! Callers never block: whoever wins the compare-and-exchange on the shared timestamp
//! computes the snapshot, everyone else gets `None` for that call.
//! Quiet periods produce no samples at all.

use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;
use tracing::warn;

use crate::clock;

pub const SAMPLE_INTERVAL_US: u64 = 100_000;

/// Source of the utilization string handed to the sampling winner.
pub trait CpuUsageProbe: Send + Sync {
    fn snapshot(&self, now_us: u64) -> Option<String>;
}

/// Process CPU usage in cores, averaged since the previous snapshot.
pub struct ProcessCpuUsage {
    last_cpu_ns: AtomicU64,
    last_wall_us: AtomicU64,
}

impl ProcessCpuUsage {
    pub fn new() -> Self {
        ProcessCpuUsage {
            last_cpu_ns: AtomicU64::new(clock::process_cpu_time_ns().unwrap_or(0)),
            last_wall_us: AtomicU64::new(clock::monotonic_now_us()),
        }
    }
}

impl Default for ProcessCpuUsage {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuUsageProbe for ProcessCpuUsage {
    fn snapshot(&self, now_us: u64) -> Option<String> {
        let cpu_ns = match clock::process_cpu_time_ns() {
            Ok(ns) => ns,
            Err(e) => {
                warn!("cannot read process cpu time: {e}");
                return None;
            }
        };
        let prev_cpu_ns = self.last_cpu_ns.swap(cpu_ns, Ordering::Relaxed);
        let prev_wall_us = self.last_wall_us.swap(now_us, Ordering::Relaxed);
        let wall_ns = now_us.checked_sub(prev_wall_us)?.checked_mul(1000)?;
        if wall_ns == 0 {
            return None;
        }
        let busy_ns = cpu_ns.saturating_sub(prev_cpu_ns);
        Some(format!("{:.3}", busy_ns as f64 / wall_ns as f64))
    }
}

pub struct UtilizationSampler<P = ProcessCpuUsage> {
    last_sample_us: CachePadded<AtomicU64>,
    probe: P,
}

impl UtilizationSampler<ProcessCpuUsage> {
    pub fn new() -> Self {
        Self::with_probe(ProcessCpuUsage::new())
    }
}

impl Default for UtilizationSampler<ProcessCpuUsage> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: CpuUsageProbe> UtilizationSampler<P> {
    pub fn with_probe(probe: P) -> Self {
        UtilizationSampler {
            last_sample_us: CachePadded::new(AtomicU64::new(0)),
            probe,
        }
    }

    /// Emit a snapshot if `now_us` is at least [`SAMPLE_INTERVAL_US`] past the last one
    /// and this caller wins the race for the current window.
    pub fn try_sample(&self, now_us: u64) -> Option<String> {
        let last = self.last_sample_us.load(Ordering::Acquire);
        if now_us <= last || now_us - last < SAMPLE_INTERVAL_US {
            return None;
        }
        match self.last_sample_us.compare_exchange(
            last,
            now_us,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => self.probe.snapshot(now_us),
            Err(_) => None,
        }
    }

    pub fn last_sample_us(&self) -> u64 {
        self.last_sample_us.load(Ordering::Relaxed)
    }
}
