//! Worker-local, grow-only staging buffers that satisfy `O_DIRECT` alignment.

use std::{alloc::Layout, cell::RefCell, ptr::NonNull};

use tracing::debug;

use crate::{device::IO_ALIGNMENT, error::RequestError};

/// Alignment of every [`AlignedBuffer`] allocation, the same as the device offset alignment.
pub const BUFFER_ALIGNMENT: usize = IO_ALIGNMENT as usize;

/// A heap allocation aligned to [`BUFFER_ALIGNMENT`].
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    layout: Layout,
    capacity: usize,
}

// SAFETY: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}

impl AlignedBuffer {
    pub fn new(capacity: usize) -> Result<Self, RequestError> {
        // zero-sized allocations are UB, but a zero-capacity buffer is fine
        let layout = Layout::from_size_align(capacity.max(1), BUFFER_ALIGNMENT)
            .map_err(|_| RequestError::Allocation { size: capacity })?;
        // SAFETY: layout has non-zero size.
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(RequestError::Allocation { size: capacity })?;
        Ok(AlignedBuffer {
            ptr,
            layout,
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid and zero-initialized for `capacity` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.capacity) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: see `as_slice`; `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }

    /// Copy `src` to the start of the buffer and return the staged prefix.
    ///
    /// Panics if `src` is larger than the capacity.
    pub fn stage(&mut self, src: &[u8]) -> &[u8] {
        let dst = &mut self.as_mut_slice()[..src.len()];
        dst.copy_from_slice(src);
        dst
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { std::alloc::dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// A single grow-only [`AlignedBuffer`] owned by one worker.
#[derive(Default)]
pub struct AlignedBufferPool {
    buf: Option<AlignedBuffer>,
    allocations: u64,
}

impl AlignedBufferPool {
    pub const fn new() -> Self {
        AlignedBufferPool {
            buf: None,
            allocations: 0,
        }
    }

    /// Return a buffer with at least `min_size` bytes of capacity.
    ///
    /// Reuses the current buffer if it is large enough. Otherwise the current buffer is
    /// freed first and a new one of exactly `min_size` bytes takes its place.
    /// If that allocation fails the pool is left empty.
    pub fn acquire(&mut self, min_size: usize) -> Result<&mut AlignedBuffer, RequestError> {
        let buf = match self.buf.take() {
            Some(buf) if buf.capacity() >= min_size => buf,
            old => {
                if let Some(old) = old {
                    debug!(old = old.capacity(), new = min_size, "growing staging buffer");
                    drop(old);
                }
                let buf = AlignedBuffer::new(min_size)?;
                self.allocations += 1;
                buf
            }
        };
        Ok(self.buf.insert(buf))
    }

    /// Capacity of the current buffer, `0` if none has been allocated yet.
    pub fn capacity(&self) -> usize {
        self.buf.as_ref().map(AlignedBuffer::capacity).unwrap_or(0)
    }

    /// Number of allocations this pool has made over its lifetime.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }
}

thread_local! {
    static THREAD_LOCAL_POOL: RefCell<AlignedBufferPool> = const { RefCell::new(AlignedBufferPool::new()) };
}

/// Run `f` with the calling thread's [`AlignedBufferPool`].
///
/// Must not be called re-entrantly from within `f`.
pub fn with_thread_local_pool<F, R>(f: F) -> R
where
    F: FnOnce(&mut AlignedBufferPool) -> R,
{
    THREAD_LOCAL_POOL.with(|pool| f(&mut pool.borrow_mut()))
}
