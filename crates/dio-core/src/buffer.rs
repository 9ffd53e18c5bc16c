//! Aligned buffers and the buffer management abstraction.
//!
//! Direct I/O requires the buffer address, the file offset and the
//! transfer length to be multiples of the device's alignment boundary
//! (commonly the page size). `AlignedBuffer` owns memory that satisfies
//! the address part of that contract for its whole lifetime.
//!
//! A `BufferProvider` manages a population of such buffers.
//!
//! # Implementors
//!
//! - `AlignedPool` (default, dio-module): fixed block size, lock-free
//!   free list, on-demand allocation for oversized requests.

use std::alloc::{self, Layout};
use std::fmt;
use std::ptr::NonNull;
use std::sync::OnceLock;

use nix::unistd::{sysconf, SysconfVar};

use crate::error::{DioError, Result};

/// Used when `sysconf(_SC_PAGESIZE)` is unavailable.
const FALLBACK_PAGE_SIZE: usize = 4096;

/// System page size, queried once.
pub fn page_size() -> usize {
    static PAGE_SIZE: OnceLock<usize> = OnceLock::new();
    *PAGE_SIZE.get_or_init(|| match sysconf(SysconfVar::PAGE_SIZE) {
        Ok(Some(n)) if n > 0 => n as usize,
        _ => FALLBACK_PAGE_SIZE,
    })
}

/// Rounds `value` up to the nearest multiple of `alignment` (a power of two).
#[inline]
pub fn round_up(value: usize, alignment: usize) -> usize {
    debug_assert!(alignment.is_power_of_two(), "alignment must be a power of two");
    (value + alignment - 1) & !(alignment - 1)
}

/// Heap memory whose start address is a multiple of `alignment`.
///
/// `capacity` is always a non-zero multiple of `alignment`. `len` is the
/// number of meaningful bytes: what a read filled in, or what a write
/// will send. The whole capacity is initialized (zeroed at allocation),
/// so growing `len` never exposes uninitialized memory.
///
/// `origin` tags the pool that issued the buffer (0 = standalone), so a
/// pool can refuse buffers that are not its own.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    len: usize,
    capacity: usize,
    alignment: usize,
    origin: u32,
}

// Safety: the buffer exclusively owns its allocation.
unsafe impl Send for AlignedBuffer {}
// Safety: no interior mutability; mutation needs &mut.
unsafe impl Sync for AlignedBuffer {}

impl AlignedBuffer {
    /// Allocate a standalone buffer of at least `capacity` bytes.
    pub fn new(capacity: usize, alignment: usize) -> Result<Self> {
        Self::with_origin(capacity, alignment, 0)
    }

    /// Allocate a buffer tagged with a pool identity.
    pub fn with_origin(capacity: usize, alignment: usize, origin: u32) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(DioError::InvalidState("alignment must be a power of two"));
        }
        let size = round_up(capacity.max(1), alignment);
        let layout = Layout::from_size_align(size, alignment)
            .map_err(|_| DioError::OutOfMemory { size, align: alignment })?;

        // Safety: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(DioError::OutOfMemory { size, align: alignment })?;

        Ok(Self {
            ptr,
            len: 0,
            capacity: size,
            alignment,
            origin,
        })
    }

    /// Allocate a standalone buffer holding a copy of `data`.
    ///
    /// `len()` is `data.len()`; call [`pad_to_alignment`](Self::pad_to_alignment)
    /// before a direct write if `data` is not a whole number of blocks.
    pub fn from_slice(data: &[u8], alignment: usize) -> Result<Self> {
        let mut buf = Self::new(data.len(), alignment)?;
        buf.copy_from(data)?;
        Ok(buf)
    }

    #[inline]
    pub fn alignment(&self) -> usize {
        self.alignment
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Identity of the issuing pool, 0 for standalone buffers.
    #[inline]
    pub fn origin(&self) -> u32 {
        self.origin
    }

    /// Start address, for alignment checks and diagnostics.
    #[inline]
    pub fn address(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    /// The filled part of the buffer.
    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        // Safety: ptr is valid and initialized for capacity >= len bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    #[inline]
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // Safety: as above, and &mut self gives exclusive access.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    /// Set the filled length. Bytes past the old length keep whatever the
    /// memory held (zeroes, or data the kernel wrote).
    pub fn set_len(&mut self, len: usize) -> Result<()> {
        if len > self.capacity {
            return Err(DioError::InvalidState("length exceeds buffer capacity"));
        }
        self.len = len;
        Ok(())
    }

    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Replace the contents with `data`.
    pub fn copy_from(&mut self, data: &[u8]) -> Result<()> {
        if data.len() > self.capacity {
            return Err(DioError::InvalidState("data exceeds buffer capacity"));
        }
        // Safety: bounds checked above; source and destination cannot overlap
        // because we hold &mut self.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr(), data.len());
        }
        self.len = data.len();
        Ok(())
    }

    /// Append `data` after the filled part.
    pub fn extend_from_slice(&mut self, data: &[u8]) -> Result<()> {
        let new_len = self.len + data.len();
        if new_len > self.capacity {
            return Err(DioError::InvalidState("data exceeds buffer capacity"));
        }
        // Safety: bounds checked above.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.ptr.as_ptr().add(self.len), data.len());
        }
        self.len = new_len;
        Ok(())
    }

    /// Zero-fill up to the next alignment boundary.
    pub fn pad_to_alignment(&mut self) {
        let aligned = round_up(self.len, self.alignment);
        if aligned > self.len {
            // Safety: aligned <= capacity because capacity is a multiple of
            // alignment and len <= capacity.
            unsafe {
                std::ptr::write_bytes(self.ptr.as_ptr().add(self.len), 0, aligned - self.len);
            }
            self.len = aligned;
        }
    }

    fn layout(&self) -> Layout {
        // Safety: validated at construction.
        unsafe { Layout::from_size_align_unchecked(self.capacity, self.alignment) }
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // Safety: allocated in with_origin() with this exact layout.
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout()) }
    }
}

impl AsRef<[u8]> for AlignedBuffer {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsMut<[u8]> for AlignedBuffer {
    fn as_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}

impl fmt::Debug for AlignedBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("addr", &format_args!("{:#x}", self.address()))
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("alignment", &self.alignment)
            .field("origin", &self.origin)
            .finish()
    }
}

/// Manages aligned I/O buffer lifecycle.
///
/// **Contract:**
/// - `acquire()` returns a buffer aligned to `alignment()` with capacity
///   of at least `size` bytes, or `OutOfMemory`.
/// - `release()` takes the buffer back. Buffers the provider did not
///   issue are refused with `InvalidState`.
/// - Buffers in use by an in-flight request are owned by the engine and
///   cannot be released until the request is retrieved.
pub trait BufferProvider: Send + Sync {
    /// Acquire a buffer with capacity for at least `size` bytes.
    fn acquire(&self, size: usize) -> Result<AlignedBuffer>;

    /// Return a buffer to the provider.
    fn release(&self, buf: AlignedBuffer) -> Result<()>;

    /// Alignment of every buffer this provider issues.
    fn alignment(&self) -> usize;

    /// Number of buffers currently allocated (free + in use).
    fn pool_size(&self) -> usize;

    /// Number of buffers currently handed out.
    fn in_use(&self) -> usize;
}
