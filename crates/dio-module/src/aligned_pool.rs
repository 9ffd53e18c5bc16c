//! `AlignedPool` — default `BufferProvider` implementation.
//!
//! Standard-size blocks (`block_size`, a multiple of the alignment) are
//! recycled through a bounded lock-free free list. Requests larger than
//! a block get a dedicated allocation that is freed on release. When the
//! free list is full, released blocks are freed too.
//!
//! Every buffer carries the pool's origin tag; `release()` refuses
//! buffers from elsewhere.

use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use dio_core::buffer::{page_size, round_up, AlignedBuffer, BufferProvider};
use dio_core::config::EngineConfig;
use dio_core::error::{DioError, Result};

/// Origin tags. 0 is reserved for standalone buffers.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

pub struct AlignedPool {
    id: u32,
    alignment: usize,
    block_size: usize,
    free: ArrayQueue<AlignedBuffer>,
    /// Buffers handed out and not yet released.
    in_use: AtomicUsize,
    /// Buffers alive (free + in use).
    total: AtomicUsize,
}

impl AlignedPool {
    /// `capacity` bounds the free list, not the number of buffers that
    /// may be outstanding.
    pub fn new(alignment: usize, block_size: usize, capacity: usize) -> Result<Self> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(DioError::InvalidState("alignment must be a power of two"));
        }
        if block_size == 0 || block_size % alignment != 0 {
            return Err(DioError::InvalidState("block size must be a multiple of alignment"));
        }
        Ok(Self {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            alignment,
            block_size,
            free: ArrayQueue::new(capacity.max(1)),
            in_use: AtomicUsize::new(0),
            total: AtomicUsize::new(0),
        })
    }

    /// Page-aligned, page-sized blocks.
    pub fn with_page_blocks(capacity: usize) -> Result<Self> {
        let page = page_size();
        Self::new(page, page, capacity)
    }

    pub fn from_config(config: &EngineConfig) -> Result<Self> {
        let pool = Self::new(
            config.alignment,
            config.pool_block_size,
            config.effective_pool_capacity(),
        )?;
        pool.preallocate(config.pool_prealloc)?;
        Ok(pool)
    }

    /// Fill the free list with up to `n` standard blocks.
    /// Returns how many were added.
    pub fn preallocate(&self, n: usize) -> Result<usize> {
        let mut added = 0;
        for _ in 0..n {
            let buf = self.alloc(self.block_size)?;
            if self.free.push(buf).is_err() {
                self.total.fetch_sub(1, Ordering::Relaxed);
                break;
            }
            added += 1;
        }
        Ok(added)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Blocks sitting in the free list.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    fn alloc(&self, size: usize) -> Result<AlignedBuffer> {
        let buf = AlignedBuffer::with_origin(size, self.alignment, self.id)?;
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }
}

impl BufferProvider for AlignedPool {
    fn acquire(&self, size: usize) -> Result<AlignedBuffer> {
        let want = round_up(size.max(1), self.alignment);
        let buf = if want <= self.block_size {
            match self.free.pop() {
                Some(mut b) => {
                    b.clear();
                    b
                }
                None => self.alloc(self.block_size)?,
            }
        } else {
            self.alloc(want)?
        };
        self.in_use.fetch_add(1, Ordering::Relaxed);
        Ok(buf)
    }

    fn release(&self, mut buf: AlignedBuffer) -> Result<()> {
        if buf.origin() != self.id {
            return Err(DioError::InvalidState("buffer was not issued by this pool"));
        }
        self.in_use
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| DioError::InvalidState("release without a matching acquire"))?;

        if buf.capacity() == self.block_size {
            buf.clear();
            if let Err(b) = self.free.push(buf) {
                drop(b);
                self.total.fetch_sub(1, Ordering::Relaxed);
            }
        } else {
            drop(buf);
            self.total.fetch_sub(1, Ordering::Relaxed);
        }
        Ok(())
    }

    fn alignment(&self) -> usize {
        self.alignment
    }

    fn pool_size(&self) -> usize {
        self.total.load(Ordering::Relaxed)
    }

    fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }
}
