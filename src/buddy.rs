//! A binary-buddy memory allocator.
//!
//! The arena is a single block whose size is a power of two. Blocks are split
//! in half on demand until they fit a request, and the halves (buddies) are
//! merged back together when both are free. Block sizes range from
//! [`MIN_BLOCK_SIZE`] up to the whole arena; each size is a *level*, with
//! level `k` holding blocks of `MIN_BLOCK_SIZE << k` bytes.
//!
//! Free blocks of each level form an intrusive singly linked list. The link
//! lives in the first bytes of the free block and stores the arena offset of
//! the next free block, so the allocator needs no storage beyond one list
//! head per level.
//!
//! ```
//! use arena_alloc::BuddyAllocator;
//!
//! // Rounded up to 128 bytes: one level of 64-byte blocks below the arena.
//! let mut buddy = BuddyAllocator::try_new(100).unwrap();
//! let a = buddy.allocate(64).unwrap();
//! let b = buddy.allocate(64).unwrap();
//! assert!(buddy.allocate(64).is_err());
//!
//! unsafe {
//!     buddy.deallocate(b.cast(), 64).unwrap();
//!     buddy.deallocate(a.cast(), 64).unwrap();
//! }
//!
//! // The halves have been merged back into the whole arena.
//! assert!(buddy.allocate(128).is_ok());
//! buddy.destroy();
//! ```
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case     |
//! |--------------------------|-----------|----------------|
//! | Allocate                 | O(1)      | O(L)           |
//! | Deallocate               | O(1)      | O(L * F)       |
//!
//! Where `L` is the number of levels and `F` is the length of the longest
//! free list searched for a buddy.
//!
//! #### Fragmentation
//!
//! Requests are rounded up to a power of two, so internal fragmentation may
//! approach half of each block.
//!
//! [`MIN_BLOCK_SIZE`]: BuddyAllocator::MIN_BLOCK_SIZE

use std::{cmp, fmt, mem, ptr::NonNull, slice};

// Unused on 1.84+, where `NonNull::addr` is inherent.
#[cfg(feature = "sptr")]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

use crate::{
    base::{BasePtr, BlockLink},
    os::Mapping,
    AllocError, AllocInitError,
};

struct BuddyLevel {
    block_size: usize,
    free_list: Option<usize>,
}

impl BuddyLevel {
    /// Retrieves the offset of the buddy of the block which starts
    /// `block_ofs` bytes from the base.
    #[inline]
    fn buddy_ofs(&self, block_ofs: usize) -> usize {
        block_ofs ^ self.block_size
    }

    /// Pushes a block onto the free list.
    ///
    /// # Safety
    ///
    /// The block at `block_ofs` must lie within the arena of `base`, be
    /// aligned to this level's block size and be unallocated.
    unsafe fn free_list_push(&mut self, base: BasePtr, block_ofs: usize) {
        debug_assert_eq!(block_ofs % self.block_size, 0);

        unsafe {
            base.init_link_at(
                block_ofs,
                BlockLink {
                    next: self.free_list,
                },
            )
        };

        self.free_list = Some(block_ofs);
    }

    /// Pops the head of the free list.
    ///
    /// # Safety
    ///
    /// Every block on the free list must still hold a valid link.
    unsafe fn free_list_pop(&mut self, base: BasePtr) -> Option<usize> {
        let head = self.free_list?;
        self.free_list = unsafe { base.link_mut(head).next };

        Some(head)
    }

    /// Removes the specified block from the free list.
    ///
    /// Returns `false` if the block is not on the free list.
    ///
    /// # Safety
    ///
    /// Every block on the free list must still hold a valid link.
    unsafe fn free_list_remove(&mut self, base: BasePtr, block_ofs: usize) -> bool {
        let mut prev: Option<usize> = None;
        let mut current = self.free_list;

        while let Some(cur) = current {
            let next = unsafe { base.link_mut(cur).next };

            if cur == block_ofs {
                match prev {
                    // Link `prev` forward to `next`.
                    Some(p) => unsafe { base.link_mut(p).next = next },

                    // If there's no previous block, then `cur` is the head of
                    // the free list.
                    None => self.free_list = next,
                }

                return true;
            }

            prev = Some(cur);
            current = next;
        }

        false
    }

    /// Counts the blocks on the free list.
    ///
    /// # Safety
    ///
    /// Every block on the free list must still hold a valid link.
    unsafe fn free_list_len(&self, base: BasePtr) -> usize {
        let mut len = 0;
        let mut current = self.free_list;

        while let Some(cur) = current {
            len += 1;
            current = unsafe { base.link_mut(cur).next };
        }

        len
    }
}

/// A binary-buddy allocator over an OS-mapped arena.
///
/// The arena size is the requested size rounded up to a power of two, and
/// never less than [`MIN_BLOCK_SIZE`](Self::MIN_BLOCK_SIZE). The per-level
/// list heads live in a second mapping; neither mapping is shared with any
/// other allocator.
pub struct BuddyAllocator {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    /// Pointer to the `BuddyLevel` array stored in `metadata`.
    levels: NonNull<BuddyLevel>,
    num_levels: usize,
    _metadata: Mapping,
    _region: Mapping,
}

impl BuddyAllocator {
    /// The size in bytes of the smallest block the allocator hands out.
    pub const MIN_BLOCK_SIZE: usize = 64;

    /// Constructs a new `BuddyAllocator` managing at least `size` bytes.
    ///
    /// The whole arena starts out as a single free block at the top level.
    ///
    /// # Errors
    ///
    /// - `AllocInitError::InvalidArgument` if `size` is zero or has no
    ///   representable power-of-two successor.
    /// - `AllocInitError::BackendFailure` if the arena or the level table
    ///   could not be mapped. Nothing is leaked in that case.
    pub fn try_new(size: usize) -> Result<BuddyAllocator, AllocInitError> {
        if size == 0 {
            log::warn!("buddy allocator: requested arena size is zero");
            return Err(AllocInitError::InvalidArgument);
        }

        let region_len = size
            .checked_next_power_of_two()
            .ok_or(AllocInitError::InvalidArgument)?
            .max(Self::MIN_BLOCK_SIZE);
        let num_levels = (region_len / Self::MIN_BLOCK_SIZE).ilog2() as usize + 1;

        let region = Mapping::new(region_len)?;
        // If this fails, `region` is unmapped on return.
        let metadata = Mapping::new(num_levels * mem::size_of::<BuddyLevel>())?;

        let levels = metadata.ptr().cast::<BuddyLevel>();
        for li in 0..num_levels {
            // SAFETY: the metadata mapping is page-aligned and holds
            // `num_levels` `BuddyLevel` values.
            unsafe {
                levels.as_ptr().add(li).write(BuddyLevel {
                    block_size: Self::MIN_BLOCK_SIZE << li,
                    free_list: None,
                });
            }
        }

        let mut alloc = BuddyAllocator {
            base: BasePtr::new(region.ptr(), region_len),
            levels,
            num_levels,
            _metadata: metadata,
            _region: region,
        };

        let base = alloc.base;
        let top = num_levels - 1;
        // SAFETY: the arena is entirely unallocated.
        unsafe { alloc.levels_mut()[top].free_list_push(base, 0) };

        log::debug!("buddy allocator: mapped {region_len} bytes ({num_levels} levels)");

        Ok(alloc)
    }

    #[inline]
    fn levels(&self) -> &[BuddyLevel] {
        // SAFETY: `levels` points to `num_levels` initialized values in a
        // mapping owned by `self`.
        unsafe { slice::from_raw_parts(self.levels.as_ptr(), self.num_levels) }
    }

    #[inline]
    fn levels_mut(&mut self) -> &mut [BuddyLevel] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.levels.as_ptr(), self.num_levels) }
    }

    /// Returns the size of the arena in bytes.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.base.extent()
    }

    /// Returns the size in bytes of the smallest block.
    #[inline]
    pub fn min_block_size(&self) -> usize {
        Self::MIN_BLOCK_SIZE
    }

    /// Returns the number of levels, i.e. distinct block sizes.
    #[inline]
    pub fn levels_count(&self) -> usize {
        self.num_levels
    }

    /// Returns the level whose blocks are the smallest that can hold `size`
    /// bytes.
    ///
    /// Returns `None` if `size` is zero or larger than the arena.
    pub fn level_for(&self, size: usize) -> Option<usize> {
        if size == 0 || size > self.capacity() {
            return None;
        }

        // `size <= capacity`, which is itself a power of two.
        let block_size = cmp::max(size, Self::MIN_BLOCK_SIZE).next_power_of_two();

        Some((block_size / Self::MIN_BLOCK_SIZE).ilog2() as usize)
    }

    /// Returns the number of bytes in currently free blocks.
    pub fn free_bytes(&self) -> usize {
        let base = self.base;

        self.levels()
            .iter()
            .map(|level| unsafe { level.free_list_len(base) } * level.block_size)
            .sum()
    }

    /// Returns `true` if `ptr` points into this allocator's arena.
    #[inline]
    pub fn contains(&self, ptr: NonNull<u8>) -> bool {
        self.base.contains_addr(ptr.addr())
    }

    /// Attempts to allocate `size` bytes.
    ///
    /// On success, returns a pointer to a block of exactly `size` bytes. The
    /// underlying block is `max(size, MIN_BLOCK_SIZE)` rounded up to a power
    /// of two, and is aligned to its own size relative to the arena base.
    ///
    /// The contents of the block are unspecified.
    ///
    /// # Errors
    ///
    /// - `AllocError::InvalidArgument` if `size` is zero.
    /// - `AllocError::OutOfMemory` if no free block is large enough,
    ///   including when `size` exceeds the arena.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        if size == 0 {
            log::warn!("buddy allocator: zero-sized allocation");
            return Err(AllocError::InvalidArgument);
        }

        let target_level = self.level_for(size).ok_or_else(|| {
            log::warn!("buddy allocator: request of {size} bytes exceeds the arena");
            AllocError::OutOfMemory
        })?;

        let base = self.base;
        let levels = self.levels_mut();

        // Scan increasing block sizes until a free block is found.
        let (block_ofs, found_level) = (target_level..levels.len())
            .find_map(|level| unsafe { levels[level].free_list_pop(base) }.map(|b| (b, level)))
            .ok_or_else(|| {
                log::warn!("buddy allocator: no free block for {size} bytes");
                AllocError::OutOfMemory
            })?;

        // Split the block repeatedly to obtain a suitably sized block. The
        // address of the front half does not change.
        for level in (target_level..found_level).rev() {
            let back_half = block_ofs + levels[level].block_size;

            // SAFETY: the back half was part of a free block just taken from
            // the free list.
            unsafe { levels[level].free_list_push(base, back_half) };
        }

        log::trace!("buddy allocator: allocated offset {block_ofs:#x} at level {target_level}");

        Ok(base.with_offset_and_size(block_ofs, size))
    }

    /// Deallocates the `size` bytes at `ptr`, coalescing with free buddies.
    ///
    /// `size` determines the level of the block, by the same rule used by
    /// [`allocate`](Self::allocate).
    ///
    /// # Errors
    ///
    /// - `AllocError::InvalidArgument` if `size` is zero.
    /// - `AllocError::OutOfRange` if `ptr` lies outside the arena or `size`
    ///   exceeds it.
    /// - `AllocError::Misaligned` if `ptr` is not aligned to the block size
    ///   implied by `size`.
    ///
    /// A rejected request has no side effects.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated via this
    /// allocator, and `size` must be the size it was allocated with.
    /// Double frees are not detected and corrupt the free lists.
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        if size == 0 {
            log::warn!("buddy allocator: zero-sized deallocation");
            return Err(AllocError::InvalidArgument);
        }

        let mut level = self.level_for(size).ok_or_else(|| {
            log::warn!("buddy allocator: {size} bytes exceed the arena");
            AllocError::OutOfRange
        })?;

        let base = self.base;
        let mut block_ofs = base.offset_of(ptr.addr()).ok_or_else(|| {
            log::warn!("buddy allocator: {ptr:p} is outside the arena");
            AllocError::OutOfRange
        })?;

        let levels = self.levels_mut();

        if block_ofs % levels[level].block_size != 0 {
            log::warn!("buddy allocator: {ptr:p} is not aligned to a level-{level} block");
            return Err(AllocError::Misaligned);
        }

        let top = levels.len() - 1;
        while level < top {
            let buddy_ofs = levels[level].buddy_ofs(block_ofs);

            // SAFETY: free lists only contain free blocks of their level.
            if !unsafe { levels[level].free_list_remove(base, buddy_ofs) } {
                break;
            }

            // The merged block starts at the lower of the two halves.
            block_ofs = cmp::min(block_ofs, buddy_ofs);
            level += 1;
        }

        // SAFETY: the caller guarantees the block was allocated, and every
        // buddy merged into it has just been taken off its free list.
        unsafe { levels[level].free_list_push(base, block_ofs) };

        log::trace!("buddy allocator: freed offset {block_ofs:#x} into level {level}");

        Ok(())
    }

    /// Destroys the allocator, unmapping its arena and level table.
    ///
    /// All outstanding allocations are invalidated.
    pub fn destroy(self) {
        log::debug!("buddy allocator: unmapping {} bytes", self.capacity());
    }
}

impl fmt::Debug for BuddyAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyAllocator")
            .field("base", &self.base)
            .field("num_levels", &self.num_levels)
            .field("free_bytes", &self.free_bytes())
            .finish()
    }
}

// SAFETY: The allocator exclusively owns its arena and level table; the only
// pointers into them are those it has handed out to the caller.
unsafe impl Send for BuddyAllocator {}
