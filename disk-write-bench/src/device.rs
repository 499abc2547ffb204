//! The block device under test and the byte range eligible for test writes.

use std::{
    fs::File,
    os::{
        fd::AsRawFd,
        unix::fs::{FileTypeExt, OpenOptionsExt},
    },
    path::{Path, PathBuf},
};

use rand::Rng;
use tracing::info;

use crate::error::{DeviceError, RequestError, WriteFailure};

/// Alignment of every offset handed out by [`DeviceRange::random_aligned_offset`].
pub const IO_ALIGNMENT: u64 = 4096;

pub const DEFAULT_TEST_RATIO: f64 = 0.1;

mod ioctl {
    // BLKGETSIZE64, from linux/fs.h
    nix::ioctl_read!(blkgetsize64, 0x12, 114, u64);
}

/// Startup inputs for [`DeviceRange::open`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    pub path: PathBuf,
    /// Use this many bytes of the device. `0` disables the override and `ratio` applies.
    pub fixed_size_bytes: u64,
    /// Fraction of the device to use, in `(0, 1]`.
    pub ratio: f64,
    /// Open with `O_DIRECT`. Only turned off for stand-in devices that can't do direct I/O.
    pub direct_io: bool,
}

impl DeviceConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        DeviceConfig {
            path: path.into(),
            fixed_size_bytes: 0,
            ratio: DEFAULT_TEST_RATIO,
            direct_io: true,
        }
    }
}

/// Something that supports a single positioned write.
pub trait PositionedWrite: Send + Sync {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize>;
}

impl PositionedWrite for File {
    fn write_at(&self, buf: &[u8], offset: u64) -> std::io::Result<usize> {
        std::os::unix::fs::FileExt::write_at(self, buf, offset)
    }
}

/// An opened device plus the immutable `[0, test_max_offset)` window we write into.
///
/// Read-only after construction, so it can be shared between workers without locking.
pub struct DeviceRange<D = File> {
    path: PathBuf,
    device: D,
    physical_size_bytes: u64,
    test_max_offset: u64,
}

impl DeviceRange<File> {
    pub fn open(config: &DeviceConfig) -> Result<Self, DeviceError> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true).write(true);
        if config.direct_io {
            options.custom_flags(libc::O_DIRECT);
        }
        let file = options.open(&config.path).map_err(|source| DeviceError::Open {
            path: config.path.clone(),
            source,
        })?;

        let physical_size_bytes =
            query_size(&file).map_err(|source| DeviceError::SizeQuery {
                path: config.path.clone(),
                source,
            })?;

        if config.fixed_size_bytes > 0 {
            info!(
                "test mode: fixed size ({} GiB)",
                config.fixed_size_bytes / 1024 / 1024 / 1024
            );
        } else {
            info!("test mode: ratio ({}%)", config.ratio * 100.0);
        }

        let range = Self::from_parts(
            config.path.clone(),
            file,
            physical_size_bytes,
            config.fixed_size_bytes,
            config.ratio,
        )?;
        info!(
            path = ?range.path,
            direct_io = config.direct_io,
            physical_size_bytes,
            "device init success"
        );
        info!("max offset: {} bytes", range.test_max_offset);
        Ok(range)
    }
}

fn query_size(file: &File) -> std::io::Result<u64> {
    let md = file.metadata()?;
    let file_type = md.file_type();
    if file_type.is_block_device() {
        let mut size: u64 = 0;
        // SAFETY: the fd is open for the duration of the call and `size` outlives it.
        unsafe { ioctl::blkgetsize64(file.as_raw_fd(), &mut size) }?;
        Ok(size)
    } else if file_type.is_file() {
        Ok(md.len())
    } else {
        Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "neither a block device nor a regular file",
        ))
    }
}

/// Derive the end of the test window from the device size and the configured policy.
pub fn compute_test_max_offset(
    physical_size_bytes: u64,
    fixed_size_bytes: u64,
    ratio: f64,
) -> Result<u64, DeviceError> {
    let invalid = |reason| DeviceError::InvalidRange {
        physical_size_bytes,
        fixed_size_bytes,
        ratio,
        reason,
    };
    let wanted = if fixed_size_bytes > 0 {
        fixed_size_bytes
    } else {
        // also rejects NaN
        if !(ratio > 0.0 && ratio <= 1.0) {
            return Err(invalid("ratio must be in (0, 1]"));
        }
        scale_floor(physical_size_bytes, ratio)
    };
    let test_max_offset = wanted.min(physical_size_bytes);
    if test_max_offset == 0 {
        return Err(invalid("test range is empty"));
    }
    Ok(test_max_offset)
}

/// Exact `floor(value * ratio)` for `ratio` in `(0, 1]`.
///
/// Going through `f64` would drop the low bits of sizes above 2^53.
fn scale_floor(value: u64, ratio: f64) -> u64 {
    let bits = ratio.to_bits();
    let biased_exp = (bits >> 52) & 0x7ff;
    let fraction = bits & ((1 << 52) - 1);
    // ratio == mantissa * 2^-shift
    let (mantissa, shift) = if biased_exp == 0 {
        (fraction, 1074)
    } else {
        (fraction | (1 << 52), 1075u64.saturating_sub(biased_exp))
    };
    if shift >= 128 {
        return 0;
    }
    // fits: ratio <= 1 keeps the result within value
    ((u128::from(value) * u128::from(mantissa)) >> shift) as u64
}

impl<D: PositionedWrite> DeviceRange<D> {
    /// Build a range over an already-opened device whose size is known.
    pub fn from_parts(
        path: PathBuf,
        device: D,
        physical_size_bytes: u64,
        fixed_size_bytes: u64,
        ratio: f64,
    ) -> Result<Self, DeviceError> {
        let test_max_offset =
            compute_test_max_offset(physical_size_bytes, fixed_size_bytes, ratio)?;
        Ok(DeviceRange {
            path,
            device,
            physical_size_bytes,
            test_max_offset,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn physical_size_bytes(&self) -> u64 {
        self.physical_size_bytes
    }

    pub fn test_max_offset(&self) -> u64 {
        self.test_max_offset
    }

    pub fn get_ref(&self) -> &D {
        &self.device
    }

    /// A uniformly drawn, [`IO_ALIGNMENT`]-aligned offset `o` with `o + io_size <= test_max_offset`.
    pub fn random_aligned_offset(&self, io_size: u64) -> Result<u64, RequestError> {
        if io_size >= self.test_max_offset {
            return Err(RequestError::RangeTooSmall {
                io_size,
                test_max_offset: self.test_max_offset,
            });
        }
        let offset = rand::thread_rng().gen_range(0..self.test_max_offset - io_size);
        Ok(offset / IO_ALIGNMENT * IO_ALIGNMENT)
    }

    /// Write all of `buf` at `offset` with a single syscall. Short writes are errors.
    pub fn write(&self, buf: &[u8], offset: u64) -> Result<usize, RequestError> {
        let fail = |kind| RequestError::WriteIo {
            offset,
            requested: buf.len(),
            kind,
        };
        match self.device.write_at(buf, offset) {
            Ok(n) if n == buf.len() => Ok(n),
            Ok(n) => Err(fail(WriteFailure::Short(n))),
            Err(e) => Err(fail(WriteFailure::Os(e))),
        }
    }
}
