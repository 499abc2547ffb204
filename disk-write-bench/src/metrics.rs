use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::RequestError;

#[non_exhaustive]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub requests: u64,
    pub samples_emitted: u64,
    pub writes_completed: u64,
    pub bytes_written: u64,
    pub device_not_ready: u64,
    pub allocation_failures: u64,
    pub range_too_small: u64,
    pub write_failures: u64,
}

impl Metrics {
    pub fn failures(&self) -> u64 {
        self.device_not_ready + self.allocation_failures + self.range_too_small + self.write_failures
    }
}

#[derive(Default)]
pub(crate) struct MetricsStorage {
    requests: CachePadded<AtomicU64>,
    samples_emitted: AtomicU64,
    writes_completed: CachePadded<AtomicU64>,
    bytes_written: AtomicU64,
    device_not_ready: AtomicU64,
    allocation_failures: AtomicU64,
    range_too_small: AtomicU64,
    write_failures: AtomicU64,
}

impl MetricsStorage {
    pub(crate) fn on_request(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_sample(&self) {
        self.samples_emitted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn on_write(&self, bytes: usize) {
        self.writes_completed.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub(crate) fn on_error(&self, err: &RequestError) {
        let counter = match err {
            RequestError::DeviceNotReady => &self.device_not_ready,
            RequestError::Allocation { .. } => &self.allocation_failures,
            RequestError::RangeTooSmall { .. } => &self.range_too_small,
            RequestError::WriteIo { .. } => &self.write_failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn make_pub(&self) -> Metrics {
        Metrics {
            requests: self.requests.load(Ordering::Relaxed),
            samples_emitted: self.samples_emitted.load(Ordering::Relaxed),
            writes_completed: self.writes_completed.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            device_not_ready: self.device_not_ready.load(Ordering::Relaxed),
            allocation_failures: self.allocation_failures.load(Ordering::Relaxed),
            range_too_small: self.range_too_small.load(Ordering::Relaxed),
            write_failures: self.write_failures.load(Ordering::Relaxed),
        }
    }
}
