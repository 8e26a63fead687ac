//! Polyfills for strict-provenance APIs on toolchains that predate them.
//!
//! The crate's MSRV is 1.73. `NonNull::addr` and `<*mut T>::addr` became
//! inherent in 1.84; from then on they take precedence over the trait methods
//! defined here, and this module only serves 1.73 through 1.83.

use std::{num::NonZeroUsize, ptr::NonNull};

use sptr::Strict;

pub trait NonNullStrict<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized;
}

impl<T> NonNullStrict<T> for NonNull<T> {
    fn addr(self) -> NonZeroUsize
    where
        T: Sized,
    {
        // SAFETY: The pointer is guaranteed by the type to be non-null,
        // meaning that the address will be non-zero.
        unsafe { NonZeroUsize::new_unchecked(Strict::addr(self.as_ptr())) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_matches_pointer_value() {
        let mut buf = [0u8; 16];
        let ptr = NonNull::new(buf.as_mut_ptr()).unwrap();
        let inner = NonNull::new(buf[8..].as_mut_ptr()).unwrap();

        assert_eq!(
            NonNullStrict::addr(inner).get(),
            NonNullStrict::addr(ptr).get() + 8
        );
    }
}
