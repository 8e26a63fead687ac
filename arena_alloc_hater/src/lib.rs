#![deny(unsafe_op_in_unsafe_fn)]

use std::ptr::NonNull;

use alloc_hater::Subject;
use arena_alloc::{AllocError, AllocInitError, BitmapAllocator, BuddyAllocator};

pub struct BitmapSubject(BitmapAllocator);

impl BitmapSubject {
    pub fn new(size: usize) -> Result<Self, AllocInitError> {
        let b = BitmapAllocator::try_new(size)?;
        Ok(BitmapSubject(b))
    }
}

impl Subject for BitmapSubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::AllocError> {
        unsafe { self.0.deallocate(ptr, size) }
    }

    fn free_bytes(&self) -> Option<usize> {
        Some(self.0.free_bytes())
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.0.capacity())
    }
}

pub struct BuddySubject(BuddyAllocator);

impl BuddySubject {
    pub fn new(size: usize) -> Result<Self, AllocInitError> {
        let b = BuddyAllocator::try_new(size)?;
        Ok(BuddySubject(b))
    }
}

impl Subject for BuddySubject {
    type AllocError = AllocError;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError> {
        self.0.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::AllocError> {
        unsafe { self.0.deallocate(ptr, size) }
    }

    fn free_bytes(&self) -> Option<usize> {
        Some(self.0.free_bytes())
    }

    fn capacity(&self) -> Option<usize> {
        Some(self.0.capacity())
    }
}

#[cfg(test)]
mod tests {
    use alloc_hater::{AllocatorOp, Evaluator};
    use arbitrary::{Arbitrary, Unstructured};

    use super::*;

    fn ops_from_seed(seed: u64, len: usize) -> Vec<AllocatorOp> {
        // xorshift, so the byte stream is reproducible.
        let mut state = seed | 1;
        let bytes: Vec<u8> = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                state as u8
            })
            .collect();

        let mut un = Unstructured::new(&bytes);
        Vec::<AllocatorOp>::arbitrary(&mut un).unwrap()
    }

    fn scripted() -> Vec<AllocatorOp> {
        vec![
            AllocatorOp::Alloc(64),
            AllocatorOp::Alloc(1),
            AllocatorOp::Alloc(300),
            AllocatorOp::Dealloc(1),
            AllocatorOp::Alloc(4000),
            AllocatorOp::Alloc(17),
            AllocatorOp::Dealloc(0),
            AllocatorOp::Dealloc(5),
            AllocatorOp::Alloc(0),
            AllocatorOp::Alloc(1 << 20),
        ]
    }

    #[test]
    fn bitmap_survives_scripted_ops() {
        let mut eval = Evaluator::new(BitmapSubject::new(1 << 14).unwrap());
        eval.evaluate(scripted()).unwrap();
    }

    #[test]
    fn buddy_survives_scripted_ops() {
        let mut eval = Evaluator::new(BuddySubject::new(1 << 14).unwrap());
        eval.evaluate(scripted()).unwrap();
    }

    #[test]
    fn both_survive_arbitrary_ops() {
        for seed in 0..32 {
            let ops = ops_from_seed(seed, 4096);

            let mut eval = Evaluator::new(BitmapSubject::new(1 << 16).unwrap());
            eval.evaluate(ops.clone()).unwrap();

            let mut eval = Evaluator::new(BuddySubject::new(1 << 16).unwrap());
            eval.evaluate(ops).unwrap();
        }
    }
}
