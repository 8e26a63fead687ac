//! Allocators over privately owned, OS-mapped arenas.
//!
//! This crate provides two allocation strategies. Each allocator maps its own
//! arena (and its own metadata) directly from the operating system and never
//! touches the global allocator.
//!
//! - [`BitmapAllocator`] carves the arena into fixed 16-byte blocks and tracks
//!   them with one occupancy bit per block. Requests are served first-fit from
//!   a contiguous run of free blocks.
//! - [`BuddyAllocator`] manages the arena as a binary tree of power-of-two
//!   blocks, from 64 bytes up to the whole arena. Freed blocks are coalesced
//!   with their buddy whenever both halves are free.
//!
//! Neither allocator is thread-safe. Both are [`Send`], so an instance may be
//! wrapped in a caller-owned [`Mutex`](std::sync::Mutex) if it must be shared.
//!
//! ## Lifecycle
//!
//! An allocator is created with `try_new`, used through `allocate` and
//! `deallocate`, and torn down with `destroy` (or simply dropped). Because
//! `destroy` takes the allocator by value, using an allocator after it has
//! been destroyed does not compile:
//!
//! ```compile_fail
//! use arena_alloc::BitmapAllocator;
//!
//! let alloc = BitmapAllocator::try_new(4096).unwrap();
//! alloc.destroy();
//! alloc.destroy();
//! ```

#![doc(html_root_url = "https://docs.rs/arena_alloc/0.1.0")]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]
#![deny(unsafe_op_in_unsafe_fn)]
// This is necessary to allow `sptr` and `polyfill` to shadow methods provided
// by newer toolchains.
#![allow(unstable_name_collisions)]

use std::io;

mod base;
mod bitmap;
pub mod bitmap_alloc;
pub mod buddy;
mod os;

#[cfg(feature = "sptr")]
mod polyfill;

#[cfg(test)]
mod tests;

pub use crate::{bitmap_alloc::BitmapAllocator, buddy::BuddyAllocator, os::PAGE_SIZE};

/// The error type for allocator constructors.
#[derive(Debug, thiserror::Error)]
pub enum AllocInitError {
    /// The requested arena size is zero or cannot be represented once
    /// rounded up to the allocator's granularity.
    #[error("invalid arena size requested")]
    InvalidArgument,

    /// The operating system refused to map memory for the arena or its
    /// metadata.
    ///
    /// Any memory mapped before the failure has already been released.
    #[error("failed to map {size} bytes from the operating system")]
    BackendFailure {
        /// The length of the mapping that could not be created.
        size: usize,
        /// The error reported by the operating system.
        #[source]
        source: io::Error,
    },
}

/// The error type for allocation and deallocation requests.
#[derive(Copy, Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum AllocError {
    /// A size of zero was passed.
    #[error("invalid argument")]
    InvalidArgument,

    /// No free block or run of blocks is large enough for the request.
    #[error("out of memory")]
    OutOfMemory,

    /// The address or the block range it implies lies outside the arena.
    #[error("address or size out of range of the arena")]
    OutOfRange,

    /// The address is not aligned to the allocator's block granularity.
    #[error("address is not aligned to a block boundary")]
    Misaligned,
}
