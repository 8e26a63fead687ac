//! Anonymous memory mappings obtained from the operating system.

use std::{io, ptr::NonNull};

use crate::AllocInitError;

/// The granularity to which bitmap arenas are rounded.
pub const PAGE_SIZE: usize = 4096;

/// Rounds `size` up to the next multiple of [`PAGE_SIZE`].
///
/// Returns `None` if the result would overflow a `usize`.
#[inline]
pub fn round_up_to_page(size: usize) -> Option<usize> {
    Some(size.checked_add(PAGE_SIZE - 1)? & !(PAGE_SIZE - 1))
}

/// An owned, zero-filled, read/write anonymous mapping.
///
/// The mapping is released when this value is dropped.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

impl Mapping {
    /// Maps `len` bytes of private anonymous memory.
    ///
    /// # Errors
    ///
    /// Returns `AllocInitError::InvalidArgument` if `len` is zero, or
    /// `AllocInitError::BackendFailure` if the mapping could not be created.
    pub fn new(len: usize) -> Result<Mapping, AllocInitError> {
        if len == 0 {
            return Err(AllocInitError::InvalidArgument);
        }

        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };

        if raw == libc::MAP_FAILED {
            let source = io::Error::last_os_error();
            log::warn!("mmap of {len} bytes failed: {source}");
            return Err(AllocInitError::BackendFailure { size: len, source });
        }

        // mmap never returns a null mapping unless MAP_FIXED was requested.
        let ptr = NonNull::new(raw.cast::<u8>()).ok_or_else(|| AllocInitError::BackendFailure {
            size: len,
            source: io::Error::from(io::ErrorKind::AddrNotAvailable),
        })?;

        Ok(Mapping { ptr, len })
    }

    /// Returns a pointer to the start of the mapping.
    #[inline]
    pub fn ptr(&self) -> NonNull<u8> {
        self.ptr
    }

    /// Returns the length of the mapping in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        let res = unsafe { libc::munmap(self.ptr.as_ptr().cast(), self.len) };

        if res != 0 {
            log::warn!(
                "munmap of {} bytes failed: {}",
                self.len,
                io::Error::last_os_error()
            );
        }
    }
}
