//! Bitmap allocation.
//!
//! A bitmap allocator divides its arena into fixed-size blocks of
//! [`BLOCK_SIZE`] bytes and records the state of every block in an occupancy
//! bitmap, stored in a separate mapping. A set bit marks a free block.
//!
//! Requests are rounded up to a whole number of blocks and served from the
//! first run of free blocks that is long enough.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case |
//! |--------------------------|-----------|------------|
//! | Allocate                 | O(k)      | O(n)       |
//! | Deallocate               | O(k)      | O(k)       |
//!
//! Where `n` is the number of blocks in the arena and `k` is the number of
//! blocks in the request.
//!
//! #### Fragmentation
//!
//! Internal fragmentation is bounded by the block size. Because allocations
//! must be contiguous, a fragmented arena may fail a request even when
//! enough blocks are free in total.
//!
//! [`BLOCK_SIZE`]: BitmapAllocator::BLOCK_SIZE

use std::{fmt, ptr::NonNull};

// Unused on 1.84+, where `NonNull::addr` is inherent.
#[cfg(feature = "sptr")]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

use crate::{
    base::BasePtr,
    bitmap::Bitmap,
    os::{self, Mapping},
    AllocError, AllocInitError,
};

/// A first-fit allocator over fixed-size blocks.
///
/// The allocator owns two mappings: the arena itself and the occupancy
/// bitmap. Both are released when the allocator is destroyed or dropped.
pub struct BitmapAllocator {
    base: BasePtr,
    num_blocks: usize,
    occupancy: Bitmap,
    // The bitmap borrows this mapping's storage.
    _metadata: Mapping,
    _region: Mapping,
}

impl BitmapAllocator {
    /// The size in bytes of a single block.
    pub const BLOCK_SIZE: usize = 16;

    /// Constructs a new `BitmapAllocator` managing at least `size` bytes.
    ///
    /// `size` is rounded up to a multiple of [`PAGE_SIZE`](crate::PAGE_SIZE).
    /// Every block starts out free.
    ///
    /// # Errors
    ///
    /// - `AllocInitError::InvalidArgument` if `size` is zero or overflows when
    ///   rounded up.
    /// - `AllocInitError::BackendFailure` if the arena or the occupancy
    ///   bitmap could not be mapped. Nothing is leaked in that case.
    pub fn try_new(size: usize) -> Result<BitmapAllocator, AllocInitError> {
        if size == 0 {
            log::warn!("bitmap allocator: requested arena size is zero");
            return Err(AllocInitError::InvalidArgument);
        }

        let region_len = os::round_up_to_page(size).ok_or(AllocInitError::InvalidArgument)?;
        let num_blocks = region_len / Self::BLOCK_SIZE;
        let map_len = Bitmap::map_len(num_blocks);

        let region = Mapping::new(region_len)?;
        // If this fails, `region` is unmapped on return.
        let metadata = Mapping::new(map_len)?;

        // SAFETY: `metadata` is valid for `map_len` bytes and is owned by the
        // allocator for as long as the bitmap exists.
        let occupancy = unsafe { Bitmap::new(num_blocks, metadata.ptr().as_ptr(), true) };

        log::debug!(
            "bitmap allocator: mapped {region_len} bytes ({num_blocks} blocks, {map_len}-byte bitmap)"
        );

        Ok(BitmapAllocator {
            base: BasePtr::new(region.ptr(), region_len),
            num_blocks,
            occupancy,
            _metadata: metadata,
            _region: region,
        })
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.base.extent()
    }

    /// Returns the allocation granularity in bytes.
    #[inline]
    pub fn block_size(&self) -> usize {
        Self::BLOCK_SIZE
    }

    /// Returns the number of blocks in the arena.
    #[inline]
    pub fn num_blocks(&self) -> usize {
        self.num_blocks
    }

    /// Returns the number of bytes in currently free blocks.
    pub fn free_bytes(&self) -> usize {
        self.occupancy.count_ones() * Self::BLOCK_SIZE
    }

    /// Returns `true` if `ptr` points into this allocator's arena.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// On success, returns a pointer to a block of exactly `size` bytes. The
    /// block starts on a [`BLOCK_SIZE`](Self::BLOCK_SIZE) boundary and
    /// occupies `size.div_ceil(BLOCK_SIZE)` blocks.
    ///
    /// The contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// - `AllocError::InvalidArgument` if `size` is zero.
    /// - `AllocError::OutOfRange` if `size` exceeds the arena's capacity.
    /// - `AllocError::OutOfMemory` if no run of free blocks is long enough.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            log::warn!("bitmap allocator: zero-sized allocation");
            return Err(AllocError::InvalidArgument);
        }

        if size > self.capacity() {
            log::warn!(
                "bitmap allocator: request of {size} bytes exceeds capacity {}",
                self.capacity()
            );
            return Err(AllocError::OutOfRange);
        }

        let required = size.div_ceil(Self::BLOCK_SIZE);
        let last_start = self.num_blocks - required;

        let mut start = 0;
        while start <= last_start {
            let run = self.occupancy.run_len(start, required);

            if run == required {
                self.occupancy.set_range(start..start + required, false);

                log::trace!("bitmap allocator: allocated blocks {start}..{}", start + required);

                return Ok(self
                    .base
                    .with_offset_and_size(start * Self::BLOCK_SIZE, size));
            }

            // Block `start + run` is in use, so no run can begin at or before it.
            start += run + 1;
        }

        log::warn!("bitmap allocator: no run of {required} free blocks");
        Err(AllocError::OutOfMemory)
    }

    /// Deallocates the `size` bytes at `ptr`.
    ///
    /// Every block covered by `ptr..ptr + size` is marked free. The request is
    /// validated against the arena's bounds and block alignment, and is
    /// rejected without side effects if it fails.
    ///
    /// # Errors
    ///
    /// - `AllocError::InvalidArgument` if `size` is zero.
    /// - `AllocError::OutOfRange` if `ptr` lies outside the arena, or if the
    ///   block range it implies extends past the end of the arena.
    /// - `AllocError::Misaligned` if `ptr` is not on a block boundary.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator, and `size` must be the size it was allocated with.
    ///
    /// Double frees are not detected: freeing an already free range leaves
    /// it free, and freeing with the wrong `size` marks neighbouring blocks
    /// free while they may still be in use.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        if size == 0 {
            log::warn!("bitmap allocator: zero-sized deallocation");
            return Err(AllocError::InvalidArgument);
        }

        let ofs = self.base.offset_of(ptr.addr()).ok_or_else(|| {
            log::warn!("bitmap allocator: {ptr:p} is outside the arena");
            AllocError::OutOfRange
        })?;

        if ofs % Self::BLOCK_SIZE != 0 {
            log::warn!("bitmap allocator: {ptr:p} is not on a block boundary");
            return Err(AllocError::Misaligned);
        }

        let start = ofs / Self::BLOCK_SIZE;
        let end = start
            .checked_add(size.div_ceil(Self::BLOCK_SIZE))
            .filter(|&end| end <= self.num_blocks)
            .ok_or_else(|| {
                log::warn!("bitmap allocator: {size} bytes at {ptr:p} exceed the arena");
                AllocError::OutOfRange
            })?;

        self.occupancy.set_range(start..end, true);

        log::trace!("bitmap allocator: freed blocks {start}..{end}");

        Ok(())
    }

    /// Destroys the allocator, unmapping its arena and metadata.
    ///
    /// All outstanding allocations are invalidated.
    pub fn destroy(self) {
        log::debug!(
            "bitmap allocator: unmapping {} bytes",
            self.capacity()
        );
    }
}

impl fmt::Debug for BitmapAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitmapAllocator")
            .field("base", &self.base)
            .field("num_blocks", &self.num_blocks)
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

// SAFETY: The allocator exclusively owns both of its mappings; no other value
// holds pointers into the occupancy bitmap, and the arena is only reachable
// through pointers the caller received from this allocator.
unsafe impl Send for BitmapAllocator {}
