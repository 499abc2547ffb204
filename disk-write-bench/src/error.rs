use std::path::PathBuf;

/// Failures while bringing up the [`crate::DeviceRange`].
///
/// All of these are fatal for the process: it must not start serving.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("failed to open {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to query size of {path:?}: {source}")]
    SizeQuery {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid test range: physical_size={physical_size_bytes} fixed_size={fixed_size_bytes} ratio={ratio}: {reason}")]
    InvalidRange {
        physical_size_bytes: u64,
        fixed_size_bytes: u64,
        ratio: f64,
        reason: &'static str,
    },
}

/// Failures of a single `Test` call.
///
/// None of these affect other requests or the serving process.
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("device not initialized")]
    DeviceNotReady,
    #[error("aligned allocation of {size} bytes failed")]
    Allocation { size: usize },
    #[error("io size {io_size} does not fit into test range of {test_max_offset} bytes")]
    RangeTooSmall { io_size: u64, test_max_offset: u64 },
    #[error("write of {requested} bytes at offset {offset} failed: {kind}")]
    WriteIo {
        offset: u64,
        requested: usize,
        kind: WriteFailure,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum WriteFailure {
    #[error("{0}")]
    Os(#[source] std::io::Error),
    #[error("short write of {0} bytes")]
    Short(usize),
}

impl RequestError {
    /// Stable identifier for reporting the failure over a channel.
    pub fn code(&self) -> &'static str {
        match self {
            RequestError::DeviceNotReady => "device_not_ready",
            RequestError::Allocation { .. } => "allocation",
            RequestError::RangeTooSmall { .. } => "range_too_small",
            RequestError::WriteIo { .. } => "write_io",
        }
    }
}
