use std::ops::Range;

/// A fixed-length bit vector backed by borrowed raw storage.
///
/// Bits are packed eight to a byte, least significant bit first.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u8,
}

impl Bitmap {
    /// Returns the number of bytes needed to store `num_bits` bits.
    #[inline]
    pub const fn map_len(num_bits: usize) -> usize {
        num_bits.div_ceil(u8::BITS as usize)
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`, with every
    /// bit set to `value`.
    ///
    /// The length of the region required for `map` can be obtained with
    /// `Bitmap::map_len(num_bits)`.
    ///
    /// # Safety
    ///
    /// Behavior is undefined if any of the following conditions are violated:
    /// - `map` must be valid for reads and writes for
    ///   `Bitmap::map_len(num_bits)` bytes.
    /// - No other access to that region may occur while the returned `Bitmap`
    ///   is alive.
    pub unsafe fn new(num_bits: usize, map: *mut u8, value: bool) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());

        let fill = if value { u8::MAX } else { 0 };
        unsafe { map.write_bytes(fill, Self::map_len(num_bits)) };

        Bitmap { num_bits, map }
    }

    /// Returns a tuple of the index of the byte containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u8) {
        (bit / u8::BITS as usize, 1 << (bit % u8::BITS as usize))
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        // SAFETY: `index < num_bits`, so `byte_idx < map_len(num_bits)`.
        unsafe { self.map.add(byte_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (byte_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let byte_ptr = self.map.add(byte_idx);
            let byte = byte_ptr.read();
            byte_ptr.write(match value {
                true => byte | mask,
                false => byte & !mask,
            });
        }
    }

    /// Sets every bit in `range` to `value`.
    pub fn set_range(&mut self, range: Range<usize>, value: bool) {
        assert!(range.end <= self.num_bits);

        for index in range {
            self.set(index, value);
        }
    }

    /// Returns the length of the run of set bits starting at `start`, looking
    /// at no more than `limit` bits.
    pub fn run_len(&self, start: usize, limit: usize) -> usize {
        let end = start.saturating_add(limit).min(self.num_bits);

        (start..end).take_while(|&i| self.get(i)).count()
    }

    /// Returns the number of set bits.
    pub fn count_ones(&self) -> usize {
        (0..self.num_bits).filter(|&i| self.get(i)).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct VecBitmap {
        bitmap: Bitmap,
        // Keeps the storage alive for as long as the bitmap.
        _storage: Vec<u8>,
    }

    impl VecBitmap {
        fn new(num_bits: usize, value: bool) -> VecBitmap {
            let mut storage = vec![0xAA; Bitmap::map_len(num_bits)];
            let bitmap = unsafe { Bitmap::new(num_bits, storage.as_mut_ptr(), value) };

            VecBitmap {
                bitmap,
                _storage: storage,
            }
        }
    }

    #[test]
    fn init_many() {
        for num_bits in 1..=256 {
            let v = VecBitmap::new(num_bits, true);
            assert_eq!(v.bitmap.count_ones(), num_bits);

            let v = VecBitmap::new(num_bits, false);
            assert_eq!(v.bitmap.count_ones(), 0);
        }
    }

    #[test]
    fn map_len_rounds_up() {
        assert_eq!(Bitmap::map_len(1), 1);
        assert_eq!(Bitmap::map_len(8), 1);
        assert_eq!(Bitmap::map_len(9), 2);
        assert_eq!(Bitmap::map_len(256), 32);
    }

    #[test]
    fn set_and_get() {
        let mut v = VecBitmap::new(20, false);
        let b = &mut v.bitmap;

        b.set(0, true);
        b.set(9, true);
        b.set(19, true);

        for i in 0..20 {
            assert_eq!(b.get(i), matches!(i, 0 | 9 | 19));
        }

        b.set(9, false);
        assert!(!b.get(9));
        assert_eq!(b.count_ones(), 2);
    }

    #[test]
    fn runs() {
        let mut v = VecBitmap::new(32, true);
        let b = &mut v.bitmap;

        b.set_range(4..6, false);

        assert_eq!(b.run_len(0, 32), 4);
        assert_eq!(b.run_len(0, 3), 3);
        assert_eq!(b.run_len(4, 32), 0);
        assert_eq!(b.run_len(6, 32), 26);
        assert_eq!(b.run_len(30, 10), 2);
    }

    #[test]
    #[should_panic]
    fn out_of_bounds_get_panics() {
        let v = VecBitmap::new(10, true);
        v.bitmap.get(10);
    }
}
