//! This crate is the core of a request-triggered disk write benchmark.
//!
//! Every call to [`WriteBenchmarkHandler::test`] writes the caller's payload to a raw block device
//! at a random, 4096-aligned offset inside a configured test window, using `O_DIRECT` so that the
//! page cache is bypassed. Roughly every 100ms one caller also gets a snapshot of process CPU
//! utilization back, so that load generators can correlate throughput with server-side CPU cost.
//!
//! # Usage
//!
//! 1. Open the device with [`DeviceRange::open`]. This discovers the device size and computes
//!    the test window, either a fixed number of bytes or a ratio of the device.
//! 2. Create a [`WriteBenchmarkHandler`] and [`install`](WriteBenchmarkHandler::install_device)
//!    the range into it.
//! 3. Call [`WriteBenchmarkHandler::test`] from as many worker threads as you like.
//!    Each worker stages payloads in its own aligned buffer (see [`buffer`]).
//! 4. Inspect the returned [`TestResponse`] and result.
//!
//! ```no_run
//! use disk_write_bench::{DeviceConfig, DeviceRange, WriteBenchmarkHandler};
//!
//! let range = DeviceRange::open(&DeviceConfig::new("/dev/nvme0n1")).unwrap();
//! let handler = WriteBenchmarkHandler::new();
//! assert!(handler.install_device(range).is_ok());
//!
//! let payload = vec![0xab; 4096];
//! let (response, res) = handler.test(&payload);
//! println!("cpu usage {:?}, result {:?}", response.cpu_usage, res);
//! ```
//!
//! The handler performs exactly one positioned write per call and never retries.
//! Failures are returned as [`RequestError`] and never affect other calls.

pub mod buffer;
pub mod clock;
pub mod device;
mod error;
mod handler;
mod metrics;
pub mod sampler;

pub use buffer::{AlignedBuffer, AlignedBufferPool};
pub use device::{DeviceConfig, DeviceRange, PositionedWrite};
pub use error::{DeviceError, RequestError, WriteFailure};
pub use handler::{TestResponse, WriteBenchmarkHandler, WriteOutcome};
pub use metrics::Metrics;
pub use sampler::{CpuUsageProbe, ProcessCpuUsage, UtilizationSampler};
