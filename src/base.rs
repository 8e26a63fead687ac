use std::{num::NonZeroUsize, ptr::NonNull};

// Unused on 1.84+, where `NonNull::addr` is inherent.
#[cfg(feature = "sptr")]
#[allow(unused_imports)]
use crate::polyfill::NonNullStrict;

/// A pointer to the base of the arena managed by an allocator.
///
/// Blocks inside the arena are identified by their byte offset from the base.
/// Pointers handed out to callers are always derived from the base pointer,
/// so they carry its provenance.
#[derive(Copy, Clone, Debug)]
pub struct BasePtr {
    ptr: NonNull<u8>,
    extent: usize,
}

impl BasePtr {
    /// Creates a `BasePtr` from `ptr`.
    ///
    /// The returned value assumes the provenance of `ptr`.
    #[inline]
    pub fn new(ptr: NonNull<u8>, extent: usize) -> BasePtr {
        debug_assert!(
            ptr.addr().get().checked_add(extent).is_some(),
            "region limit overflows usize"
        );

        BasePtr { ptr, extent }
    }

    /// Returns the number of bytes in the arena.
    #[inline]
    pub fn extent(self) -> usize {
        self.extent
    }

    /// Returns the address of the base pointer.
    #[inline]
    pub fn addr(self) -> NonZeroUsize {
        self.ptr.addr()
    }

    #[inline]
    pub fn contains_addr(self, addr: NonZeroUsize) -> bool {
        self.offset_of(addr).is_some()
    }

    /// Calculates the offset from the base to `addr`.
    ///
    /// Returns `None` if `addr` does not lie within the arena.
    #[inline]
    pub fn offset_of(self, addr: NonZeroUsize) -> Option<usize> {
        addr.get()
            .checked_sub(self.addr().get())
            .filter(|&ofs| ofs < self.extent)
    }

    /// Creates a new pointer `ofs` bytes past the base.
    ///
    /// The returned pointer has the provenance of this pointer.
    #[inline]
    pub fn with_offset(self, ofs: usize) -> NonNull<u8> {
        debug_assert!(ofs < self.extent);

        // SAFETY: `ofs` is within the arena, so the result is in bounds of
        // the same mapping and cannot be null.
        unsafe { NonNull::new_unchecked(self.ptr.as_ptr().add(ofs)) }
    }

    #[inline]
    pub fn with_offset_and_size(self, ofs: usize, len: usize) -> NonNull<[u8]> {
        debug_assert!(ofs.checked_add(len).map_or(false, |end| end <= self.extent));

        NonNull::slice_from_raw_parts(self.with_offset(ofs), len)
    }

    /// Initializes a `BlockLink` at the given offset.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be a properly aligned offset for `BlockLink` values.
    /// - The memory at `ofs` must be valid for reads and writes for
    ///   `size_of::<BlockLink>()` bytes.
    /// - The memory at `ofs` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn init_link_at(self, ofs: usize, link: BlockLink) {
        debug_assert!(ofs < self.extent);
        debug_assert!(
            link.next.map_or(true, |next| next < self.extent),
            "next link out of region"
        );

        unsafe { self.with_offset(ofs).cast::<BlockLink>().as_ptr().write(link) };
    }

    /// Returns a mutable reference to the `BlockLink` at `ofs`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ofs` must be a properly aligned offset for `BlockLink` values.
    /// - The memory at `ofs` must contain a properly initialized `BlockLink`.
    /// - The memory at `ofs` must be unallocated by the associated allocator.
    #[inline]
    pub unsafe fn link_mut<'a>(self, ofs: usize) -> &'a mut BlockLink {
        debug_assert!(ofs < self.extent);

        unsafe { self.with_offset(ofs).cast::<BlockLink>().as_mut() }
    }
}

// Links store arena offsets rather than pointers. A free block's link never
// outlives the block being free, and any real pointer to a block is
// re-derived from the base pointer.

/// A link in a singly linked list of free blocks.
///
/// This type is meant to be embedded in the block itself, forming an intrusive
/// linked list.
#[repr(C)]
#[derive(Debug)]
pub struct BlockLink {
    pub next: Option<usize>,
}
