//! The per-request write path: sample, validate, stage, pick offset, commit.

use std::fs::File;

use once_cell::sync::OnceCell;
use tracing::{error, trace};

use crate::{
    buffer::with_thread_local_pool,
    clock,
    device::{DeviceRange, PositionedWrite},
    error::RequestError,
    metrics::{Metrics, MetricsStorage},
    sampler::{CpuUsageProbe, ProcessCpuUsage, UtilizationSampler},
};

/// What the caller gets back regardless of the outcome of the write.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TestResponse {
    /// Empty unless this call won the sampling window.
    pub cpu_usage: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOutcome {
    pub offset: u64,
    pub bytes_written: usize,
}

/// Handles `Test` calls from any number of worker threads.
///
/// The device is installed once at startup and only read afterwards.
/// Each worker stages payloads in its own thread-local buffer.
pub struct WriteBenchmarkHandler<D = File, P = ProcessCpuUsage> {
    device: OnceCell<DeviceRange<D>>,
    sampler: UtilizationSampler<P>,
    metrics: MetricsStorage,
}

impl WriteBenchmarkHandler<File, ProcessCpuUsage> {
    pub fn new() -> Self {
        Self::with_sampler(UtilizationSampler::new())
    }
}

impl Default for WriteBenchmarkHandler<File, ProcessCpuUsage> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: PositionedWrite, P: CpuUsageProbe> WriteBenchmarkHandler<D, P> {
    pub fn with_sampler(sampler: UtilizationSampler<P>) -> Self {
        WriteBenchmarkHandler {
            device: OnceCell::new(),
            sampler,
            metrics: MetricsStorage::default(),
        }
    }

    /// A handler that is ready to serve from the start.
    pub fn with_device(device: DeviceRange<D>, sampler: UtilizationSampler<P>) -> Self {
        WriteBenchmarkHandler {
            device: OnceCell::with_value(device),
            sampler,
            metrics: MetricsStorage::default(),
        }
    }

    /// Make the handler ready to serve. Hands the range back if one is already installed.
    pub fn install_device(&self, device: DeviceRange<D>) -> Result<(), DeviceRange<D>> {
        self.device.set(device)
    }

    pub fn device(&self) -> Option<&DeviceRange<D>> {
        self.device.get()
    }

    pub fn metrics(&self) -> Metrics {
        self.metrics.make_pub()
    }

    pub fn test(&self, payload: &[u8]) -> (TestResponse, Result<WriteOutcome, RequestError>) {
        self.test_at(payload, clock::monotonic_now_us())
    }

    /// [`Self::test`] with an explicit sampling timestamp.
    pub fn test_at(
        &self,
        payload: &[u8],
        now_us: u64,
    ) -> (TestResponse, Result<WriteOutcome, RequestError>) {
        self.metrics.on_request();

        let mut response = TestResponse::default();
        if let Some(cpu_usage) = self.sampler.try_sample(now_us) {
            self.metrics.on_sample();
            response.cpu_usage = cpu_usage;
        }

        let res = self.write_payload(payload);
        match &res {
            Ok(outcome) => {
                trace!(offset = outcome.offset, size = outcome.bytes_written, "write done");
                self.metrics.on_write(outcome.bytes_written);
            }
            Err(e) => {
                error!(code = e.code(), "request failed: {e}");
                self.metrics.on_error(e);
            }
        }
        (response, res)
    }

    fn write_payload(&self, payload: &[u8]) -> Result<WriteOutcome, RequestError> {
        let device = self.device.get().ok_or(RequestError::DeviceNotReady)?;
        with_thread_local_pool(|pool| -> Result<WriteOutcome, RequestError> {
            let staged = pool.acquire(payload.len())?.stage(payload);
            let offset = device.random_aligned_offset(payload.len() as u64)?;
            let bytes_written = device.write(staged, offset)?;
            Ok(WriteOutcome {
                offset,
                bytes_written,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{
        path::PathBuf,
        sync::{Arc, Barrier, Mutex},
    };

    use super::*;
    use crate::{
        buffer::BUFFER_ALIGNMENT,
        device::{DeviceConfig, IO_ALIGNMENT},
        error::WriteFailure,
    };

    const GB: u64 = 1_000_000_000;
    const NOW: u64 = 10 * GB;

    struct FixedUsage;

    impl CpuUsageProbe for FixedUsage {
        fn snapshot(&self, _now_us: u64) -> Option<String> {
            Some("0.500".to_owned())
        }
    }

    #[derive(Default)]
    struct RecordingDevice {
        writes: Mutex<Vec<(u64, Vec<u8>, usize)>>,
    }

    impl PositionedWrite for RecordingDevice {
        fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
            let addr = buf.as_ptr() as usize;
            self.writes
                .lock()
                .unwrap()
                .push((offset, buf.to_vec(), addr));
            Ok(buf.len())
        }
    }

    struct ShortDevice;

    impl PositionedWrite for ShortDevice {
        fn write_at(&self, buf: &[u8], _offset: u64) -> std::io::Result<usize> {
            Ok(buf.len() - 1)
        }
    }

    struct FailingDevice;

    impl PositionedWrite for FailingDevice {
        fn write_at(&self, _buf: &[u8], _offset: u64) -> std::io::Result<usize> {
            Err(std::io::Error::from_raw_os_error(libc::EIO))
        }
    }

    fn handler_with<D: PositionedWrite>(
        device: D,
        physical: u64,
        fixed: u64,
        ratio: f64,
    ) -> WriteBenchmarkHandler<D, FixedUsage> {
        let handler = WriteBenchmarkHandler::with_sampler(UtilizationSampler::with_probe(FixedUsage));
        let range = DeviceRange::from_parts(PathBuf::from("test"), device, physical, fixed, ratio)
            .unwrap();
        assert!(handler.install_device(range).is_ok());
        handler
    }

    #[test]
    fn device_not_ready() {
        let handler: WriteBenchmarkHandler<RecordingDevice, FixedUsage> =
            WriteBenchmarkHandler::with_sampler(UtilizationSampler::with_probe(FixedUsage));
        let (response, res) = handler.test_at(&[1; 4096], NOW);
        assert!(matches!(res, Err(RequestError::DeviceNotReady)));
        assert_eq!(response.cpu_usage, "0.500");
        let metrics = handler.metrics();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.device_not_ready, 1);
        assert_eq!(metrics.writes_completed, 0);
    }

    #[test]
    fn device_installed_once() {
        let handler = handler_with(RecordingDevice::default(), GB, 0, 0.1);
        let second =
            DeviceRange::from_parts(PathBuf::from("second"), RecordingDevice::default(), GB, 0, 0.5)
                .unwrap();
        assert!(handler.install_device(second).is_err());
        assert_eq!(handler.device().unwrap().test_max_offset(), 100_000_000);
    }

    #[test]
    fn constructed_with_device() {
        let range =
            DeviceRange::from_parts(PathBuf::from("test"), RecordingDevice::default(), GB, 0, 0.1)
                .unwrap();
        let handler =
            WriteBenchmarkHandler::with_device(range, UtilizationSampler::with_probe(FixedUsage));
        let (_, res) = handler.test_at(&[7; 4096], NOW);
        assert_eq!(res.unwrap().bytes_written, 4096);

        let second =
            DeviceRange::from_parts(PathBuf::from("second"), RecordingDevice::default(), GB, 0, 0.5)
                .unwrap();
        assert!(handler.install_device(second).is_err());
        assert_eq!(handler.device().unwrap().path(), std::path::Path::new("test"));
    }

    #[test]
    fn writes_payload_at_aligned_offset() {
        let handler = handler_with(RecordingDevice::default(), GB, 0, 0.1);
        let payload: Vec<u8> = (0..4096u32).map(|i| i as u8).collect();

        let (response, res) = handler.test_at(&payload, NOW);
        let outcome = res.unwrap();
        assert_eq!(response.cpu_usage, "0.500");
        assert_eq!(outcome.bytes_written, 4096);
        assert_eq!(outcome.offset % IO_ALIGNMENT, 0);
        assert!(outcome.offset <= 99_995_904);

        // within the same sampling window
        let (response, res) = handler.test_at(&payload, NOW + 1);
        assert!(res.is_ok());
        assert_eq!(response.cpu_usage, "");

        let writes = handler.device().unwrap().get_ref().writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        for (offset, data, addr) in writes.iter() {
            assert_eq!(offset % IO_ALIGNMENT, 0);
            assert_eq!(data, &payload);
            assert_eq!(addr % BUFFER_ALIGNMENT, 0);
        }
        let metrics = handler.metrics();
        assert_eq!(metrics.requests, 2);
        assert_eq!(metrics.samples_emitted, 1);
        assert_eq!(metrics.writes_completed, 2);
        assert_eq!(metrics.bytes_written, 8192);
        assert_eq!(metrics.failures(), 0);
    }

    #[test]
    fn fixed_size_scenario() {
        let handler = handler_with(RecordingDevice::default(), GB, 50_000_000, 0.1);
        assert_eq!(handler.device().unwrap().test_max_offset(), 50_000_000);
        for i in 0..100 {
            let (_, res) = handler.test_at(&[7; 8192], NOW + i);
            let outcome = res.unwrap();
            assert!(outcome.offset + 8192 <= 50_000_000);
        }
    }

    #[test]
    fn payload_not_smaller_than_range() {
        let handler = handler_with(RecordingDevice::default(), GB, 8192, 0.1);
        for size in [8192, 16384] {
            let (_, res) = handler.test_at(&vec![0; size], NOW);
            assert!(matches!(res, Err(RequestError::RangeTooSmall { .. })));
        }
        assert!(handler.device().unwrap().get_ref().writes.lock().unwrap().is_empty());
        assert_eq!(handler.metrics().range_too_small, 2);
    }

    #[test]
    fn short_write_keeps_cpu_usage() {
        let handler = handler_with(ShortDevice, GB, 0, 0.1);
        let (response, res) = handler.test_at(&[0; 4096], NOW);
        assert!(matches!(
            res,
            Err(RequestError::WriteIo {
                requested: 4096,
                kind: WriteFailure::Short(4095),
                ..
            })
        ));
        assert_eq!(response.cpu_usage, "0.500");
        assert_eq!(handler.metrics().write_failures, 1);
    }

    #[test]
    fn os_error_is_write_io() {
        let handler = handler_with(FailingDevice, GB, 0, 0.1);
        let (_, res) = handler.test_at(&[0; 4096], NOW);
        let err = res.unwrap_err();
        assert_eq!(err.code(), "write_io");
        assert!(matches!(
            err,
            RequestError::WriteIo {
                kind: WriteFailure::Os(_),
                ..
            }
        ));
    }

    #[test]
    fn worker_buffer_reused_then_grown() {
        let handler = Arc::new(handler_with(RecordingDevice::default(), GB, 0, 0.1));
        std::thread::spawn(move || {
            let pool_state = || with_thread_local_pool(|pool| (pool.capacity(), pool.allocations()));
            assert_eq!(pool_state(), (0, 0));
            handler.test_at(&[1; 100], NOW).1.unwrap();
            assert_eq!(pool_state(), (100, 1));
            handler.test_at(&[2; 50], NOW).1.unwrap();
            assert_eq!(pool_state(), (100, 1));
            handler.test_at(&[3; 500], NOW).1.unwrap();
            let (capacity, allocations) = pool_state();
            assert!(capacity >= 500);
            assert_eq!(allocations, 2);

            // only the staged prefix reaches the device
            let writes = handler.device().unwrap().get_ref().writes.lock().unwrap();
            assert_eq!(writes[1].1, vec![2; 50]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn concurrent_workers_single_sample() {
        const WORKERS: usize = 16;
        let handler = Arc::new(handler_with(RecordingDevice::default(), GB, 0, 0.1));
        let barrier = Arc::new(Barrier::new(WORKERS));
        let handles: Vec<_> = (0..WORKERS)
            .map(|_| {
                let handler = Arc::clone(&handler);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    let (response, res) = handler.test_at(&[9; 4096], NOW);
                    res.unwrap();
                    response.cpu_usage
                })
            })
            .collect();
        let usages: Vec<String> = handles.into_iter().map(|jh| jh.join().unwrap()).collect();
        assert_eq!(usages.iter().filter(|u| !u.is_empty()).count(), 1);
        assert_eq!(handler.metrics().writes_completed, WORKERS as u64);
    }

    #[test]
    fn end_to_end_regular_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        file.as_file().set_len(4 << 20).unwrap();
        let config = DeviceConfig {
            fixed_size_bytes: 1 << 20,
            direct_io: false,
            ..DeviceConfig::new(file.path())
        };
        let handler = WriteBenchmarkHandler::new();
        assert!(handler
            .install_device(DeviceRange::open(&config).unwrap())
            .is_ok());
        for _ in 0..32 {
            let (_, res) = handler.test(&[0x5a; 4096]);
            let outcome = res.unwrap();
            assert!(outcome.offset + 4096 <= 1 << 20);
        }
        let contents = std::fs::read(file.path()).unwrap();
        assert_eq!(contents.len(), 4 << 20);
        assert!(contents[1 << 20..].iter().all(|b| *b == 0));
        assert!(contents[..1 << 20].iter().any(|b| *b == 0x5a));
    }
}
