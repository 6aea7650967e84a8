//! # Process Pool
//!
//! Allocator for the RAM arena reserved to process images and programs
//! copied out of non-XIP filesystems.
//!
//! ## Design
//!
//! - The arena is split in `POOL_BLOCK_SIZE` (1 KiB) blocks, one bit each
//! - Allocations are powers of two, never smaller than one block
//! - The returned address is aligned to the allocation's own size, so an
//!   MPU region of that size can cover the allocation exactly
//! - A side table maps live pointers to their sizes for deallocation
//!
//! Allocation is O(n) over the bitmap; process creation is already a heavy
//! operation and the pool holds few, large blocks, so the scan is not the
//! bottleneck.

use alloc::collections::BTreeMap;
use alloc::vec;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use crate::config::POOL_BLOCK_SIZE;

/// Pool allocation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Requested size is zero or exceeds the whole pool
    InvalidSize,
    /// Pointer passed to `deallocate` was not returned by `allocate`
    InvalidPointer,
    /// No run of free blocks large enough
    OutOfMemory,
}

impl core::fmt::Display for PoolError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            PoolError::InvalidSize => write!(f, "invalid allocation size"),
            PoolError::InvalidPointer => write!(f, "pointer not allocated from pool"),
            PoolError::OutOfMemory => write!(f, "process pool exhausted"),
        }
    }
}

struct PoolInner {
    /// One bit per block, set = allocated
    bitmap: Vec<u32>,
    /// Live allocations, pointer to size
    allocated: BTreeMap<usize, usize>,
}

/// The process pool: a bitmap allocator over a fixed RAM arena handing out
/// power-of-two blocks aligned to their own size.
pub struct ProcessPool {
    base: usize,
    size: usize,
    inner: Mutex<PoolInner>,
}

impl ProcessPool {
    /// Creates a pool over the arena `[base, base + size)`.
    ///
    /// `size` must be a multiple of `POOL_BLOCK_SIZE` and `base` must be
    /// aligned at least to one block.
    pub fn new(base: usize, size: usize) -> Self {
        assert!(size % POOL_BLOCK_SIZE == 0, "pool size not block aligned");
        assert!(base % POOL_BLOCK_SIZE == 0, "pool base not block aligned");
        let blocks = size / POOL_BLOCK_SIZE;
        Self {
            base,
            size,
            inner: Mutex::new(PoolInner {
                bitmap: vec![0u32; blocks.div_ceil(32)],
                allocated: BTreeMap::new(),
            }),
        }
    }

    /// Base address of the arena.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total size of the arena in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Allocates at least `requested` bytes.
    ///
    /// The actual size is `requested` rounded up to the next power of two,
    /// not smaller than one block, and the returned address is aligned to
    /// the actual size. Returns `(address, actual_size)`.
    pub fn allocate(&self, requested: usize) -> Result<(usize, usize), PoolError> {
        if requested == 0 || requested > self.size {
            return Err(PoolError::InvalidSize);
        }
        let size = requested.next_power_of_two().max(POOL_BLOCK_SIZE);
        if size > self.size {
            return Err(PoolError::InvalidSize);
        }

        let mut inner = self.inner.lock();

        // If the arena base is not itself aligned to this size, skip ahead
        // to the first block whose address is
        let offset = if self.base % size != 0 {
            size - self.base % size
        } else {
            0
        };
        let start_bit = offset / POOL_BLOCK_SIZE;
        let size_bits = size / POOL_BLOCK_SIZE;
        let total_bits = self.size / POOL_BLOCK_SIZE;

        let mut bit = start_bit;
        while bit + size_bits <= total_bits {
            let run_free = (bit..bit + size_bits).all(|b| !test_bit(&inner.bitmap, b));
            if run_free {
                for b in bit..bit + size_bits {
                    set_bit(&mut inner.bitmap, b);
                }
                let addr = self.base + bit * POOL_BLOCK_SIZE;
                inner.allocated.insert(addr, size);
                log::trace!("pool: allocated {} bytes @ {:#x}", size, addr);
                return Ok((addr, size));
            }
            bit += size_bits;
        }
        Err(PoolError::OutOfMemory)
    }

    /// Returns a block to the pool.
    pub fn deallocate(&self, addr: usize) -> Result<(), PoolError> {
        let mut inner = self.inner.lock();
        let size = inner
            .allocated
            .remove(&addr)
            .ok_or(PoolError::InvalidPointer)?;
        let first_bit = (addr - self.base) / POOL_BLOCK_SIZE;
        for b in first_bit..first_bit + size / POOL_BLOCK_SIZE {
            clear_bit(&mut inner.bitmap, b);
        }
        log::trace!("pool: freed {} bytes @ {:#x}", size, addr);
        Ok(())
    }

    /// Size of the live allocation starting at `addr`, if any.
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.inner.lock().allocated.get(&addr).copied()
    }
}

fn test_bit(bitmap: &[u32], bit: usize) -> bool {
    bitmap[bit / 32] & (1 << (bit % 32)) != 0
}

fn set_bit(bitmap: &mut [u32], bit: usize) {
    bitmap[bit / 32] |= 1 << (bit % 32);
}

fn clear_bit(bitmap: &mut [u32], bit: usize) {
    bitmap[bit / 32] &= !(1 << (bit % 32));
}

/// The global process pool, installed once at boot by the board support
/// package after it has reserved the arena.
static POOL: Once<ProcessPool> = Once::new();

/// Installs the global pool. Called once during boot.
pub fn init(base: usize, size: usize) {
    POOL.call_once(|| ProcessPool::new(base, size));
}

/// The global process pool.
///
/// # Panics
///
/// If called before `init`; that is a boot ordering bug.
pub fn pool() -> &'static ProcessPool {
    POOL.get().expect("process pool used before init")
}
