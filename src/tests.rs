#![cfg(test)]

use std::{fmt::Debug, mem, ptr::NonNull, slice};

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::{AllocError, AllocInitError, BitmapAllocator, BuddyAllocator};

trait QcAllocator: Sized {
    type Params: Arbitrary + Debug;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError>;

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError>;

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError>;

    fn free_bytes(&self) -> usize;

    fn capacity(&self) -> usize;
}

/// Arena sizes, in bytes, before rounding by the allocator.
#[derive(Clone, Debug)]
struct ArenaParams {
    size: usize,
}

impl Arbitrary for ArenaParams {
    fn arbitrary(g: &mut Gen) -> Self {
        ArenaParams {
            size: 1 + usize::arbitrary(g) % (1 << 16),
        }
    }
}

// Bitmap ======================================================================

impl QcAllocator for BitmapAllocator {
    type Params = ArenaParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        BitmapAllocator::try_new(params.size)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        unsafe { self.deallocate(ptr, size) }
    }

    fn free_bytes(&self) -> usize {
        self.free_bytes()
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }
}

// Buddy =======================================================================

impl QcAllocator for BuddyAllocator {
    type Params = ArenaParams;

    fn with_params(params: Self::Params) -> Result<Self, AllocInitError> {
        BuddyAllocator::try_new(params.size)
    }

    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, AllocError> {
        self.allocate(size)
    }

    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        unsafe { self.deallocate(ptr, size) }
    }

    fn free_bytes(&self) -> usize {
        self.free_bytes()
    }

    fn capacity(&self) -> usize {
        self.capacity()
    }
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer that can hold `len` `u32` values.
    Allocate { len: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 12;

fn limited_size(g: &mut Gen) -> usize {
    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
    usize::arbitrary(g) % 2_usize.pow(exp.into())
}

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        if bool::arbitrary(g) {
            AllocatorOp::Allocate {
                len: limited_size(g),
            }
        } else {
            AllocatorOp::Free {
                index: usize::arbitrary(g),
            }
        }
    }
}

type OpId = u32;

/// A live allocation, painted with the id of the operation that created it.
struct Allocation {
    op_id: OpId,
    ptr: NonNull<[u32]>,
}

impl Allocation {
    fn size(&self) -> usize {
        mem::size_of::<u32>() * self.ptr.len()
    }

    fn as_slice(&self) -> &[u32] {
        unsafe { self.ptr.as_ref() }
    }
}

struct AllocatorChecker<A: QcAllocator> {
    allocator: A,
    allocations: Vec<Allocation>,
    num_ops: u32,
}

impl<A: QcAllocator> AllocatorChecker<A> {
    fn new(params: A::Params, capacity: usize) -> Result<Self, AllocInitError> {
        Ok(AllocatorChecker {
            allocator: A::with_params(params)?,
            allocations: Vec::with_capacity(capacity),
            num_ops: 0,
        })
    }

    fn do_op(&mut self, op: AllocatorOp) -> bool {
        let op_id = self.num_ops;
        self.num_ops += 1;

        match op {
            AllocatorOp::Allocate { len } => {
                let size = mem::size_of::<u32>() * len;

                match self.allocator.allocate(size) {
                    Ok(ptr) => {
                        let u32_ptr = ptr.cast::<u32>();
                        let data = unsafe { slice::from_raw_parts_mut(u32_ptr.as_ptr(), len) };
                        data.fill(op_id);

                        self.allocations.push(Allocation {
                            op_id,
                            ptr: NonNull::slice_from_raw_parts(u32_ptr, len),
                        });
                    }

                    Err(AllocError::InvalidArgument) => return size == 0,
                    Err(AllocError::OutOfMemory | AllocError::OutOfRange) => (),
                    Err(AllocError::Misaligned) => return false,
                }
            }

            AllocatorOp::Free { index } => {
                if self.allocations.is_empty() {
                    return true;
                }

                let index = index % self.allocations.len();
                let a = self.allocations.swap_remove(index);

                // Another allocation overlapping this one would have
                // overwritten its contents.
                if !a.as_slice().iter().all(|&elem| elem == a.op_id) {
                    return false;
                }

                let res = unsafe { self.allocator.deallocate(a.ptr.cast::<u8>(), a.size()) };
                if res.is_err() {
                    return false;
                }
            }
        }

        true
    }

    fn run(&mut self, ops: Vec<AllocatorOp>) -> bool {
        if !ops.into_iter().all(|op| self.do_op(op)) {
            return false;
        }

        // Free any outstanding allocations.
        for a in mem::take(&mut self.allocations) {
            if !a.as_slice().iter().all(|&elem| elem == a.op_id) {
                return false;
            }

            if unsafe { self.allocator.deallocate(a.ptr.cast::<u8>(), a.size()) }.is_err() {
                return false;
            }
        }

        // Every block must have been returned.
        self.allocator.free_bytes() == self.allocator.capacity()
    }
}

// Miri is substantially slower to run property tests, so the number of test
// cases is reduced to keep the runtime in check.

#[cfg(not(miri))]
const MAX_TESTS: u64 = 100;

#[cfg(miri)]
const MAX_TESTS: u64 = 20;

/// Checks that no allocation overwrites another, and that every block is
/// returned once all allocations are freed.
fn mutually_exclusive<A: QcAllocator>(params: A::Params, ops: Vec<AllocatorOp>) -> bool {
    let mut checker: AllocatorChecker<A> = AllocatorChecker::new(params, ops.len()).unwrap();
    checker.run(ops)
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn bitmap_allocations_are_mutually_exclusive() {
    init_logging();
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(mutually_exclusive::<BitmapAllocator> as fn(_, _) -> bool);
}

#[test]
fn buddy_allocations_are_mutually_exclusive() {
    init_logging();
    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(mutually_exclusive::<BuddyAllocator> as fn(_, _) -> bool);
}

#[test]
fn bitmap_free_then_alloc_returns_same_address() {
    fn prop(params: ArenaParams, len: u16) -> bool {
        let mut a = BitmapAllocator::try_new(params.size).unwrap();
        let size = usize::from(len) % a.capacity() + 1;

        let p = a.allocate(size).unwrap().cast::<u8>();
        unsafe { a.deallocate(p, size).unwrap() };
        let q = a.allocate(size).unwrap().cast::<u8>();

        p == q
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_, _) -> bool);
}

#[test]
fn buddy_allocations_are_aligned_to_block_size() {
    fn prop(params: ArenaParams, sizes: Vec<u16>) -> bool {
        let mut a = BuddyAllocator::try_new(params.size).unwrap();
        let base = a.allocate(a.capacity()).unwrap().cast::<u8>();
        unsafe { a.deallocate(base, a.capacity()).unwrap() };
        let base = base.as_ptr() as usize;

        let mut live = Vec::new();
        for size in sizes.into_iter().map(|s| usize::from(s) + 1) {
            let Ok(p) = a.allocate(size) else { continue };
            let block = size.max(BuddyAllocator::MIN_BLOCK_SIZE).next_power_of_two();

            if (p.cast::<u8>().as_ptr() as usize - base) % block != 0 {
                return false;
            }
            live.push((p, size));
        }

        for (p, size) in live {
            unsafe { a.deallocate(p.cast(), size).unwrap() };
        }

        a.free_bytes() == a.capacity()
    }

    let mut qc = QuickCheck::new().max_tests(MAX_TESTS);
    qc.quickcheck(prop as fn(_, _) -> bool);
}

// Version sync ================================================================
#[test]
fn html_root_url() {
    version_sync::assert_html_root_url_updated!("src/lib.rs");
}
