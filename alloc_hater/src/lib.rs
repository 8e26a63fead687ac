//! A small library for ~~hating on~~ evaluating the correctness of allocators.
//!
//! An [`Evaluator`] drives a [`Subject`] through a sequence of
//! [`AllocatorOp`]s. Every allocated block is painted with the id of the
//! operation that produced it and verified before it is freed, so any
//! overlap between live allocations is caught.
#![deny(unsafe_op_in_unsafe_fn)]

use core::{mem::MaybeUninit, ptr::NonNull, slice};

use arbitrary::{Arbitrary, Unstructured};

/// Upper bound on the size of a single arbitrary allocation, in bytes.
pub const MAX_ALLOC_SIZE: usize = 1 << 16;

#[derive(Arbitrary)]
enum AllocatorOpTag {
    Alloc,
    Dealloc,
}

#[derive(Clone, Debug)]
pub enum AllocatorOp {
    /// Allocate this many bytes.
    Alloc(usize),
    /// Free the outstanding block at this index, modulo the number of blocks.
    Dealloc(usize),
}

impl Arbitrary<'_> for AllocatorOp {
    fn arbitrary(u: &mut Unstructured<'_>) -> arbitrary::Result<Self> {
        let tag = AllocatorOpTag::arbitrary(u)?;

        let op = match tag {
            AllocatorOpTag::Alloc => AllocatorOp::Alloc(usize::arbitrary(u)? % MAX_ALLOC_SIZE),
            AllocatorOpTag::Dealloc => AllocatorOp::Dealloc(usize::arbitrary(u)?),
        };

        Ok(op)
    }
}

pub trait Subject {
    type AllocError;

    /// Allocates a block of `size` bytes.
    fn allocate(&mut self, size: usize) -> Result<NonNull<[u8]>, Self::AllocError>;

    /// Deallocates the block of `size` bytes pointed to by `ptr`.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block of memory currently allocated by this
    /// allocator, and it must have been allocated with `size`.
    unsafe fn deallocate(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), Self::AllocError>;

    /// Returns the number of free bytes, if the allocator can report it.
    fn free_bytes(&self) -> Option<usize> {
        None
    }

    /// Returns the number of bytes managed by the allocator, if known.
    fn capacity(&self) -> Option<usize> {
        None
    }
}

/// A list of allocated blocks.
#[derive(Default)]
pub struct Blocks {
    blocks: Vec<Block>,
}

impl Blocks {
    pub fn new() -> Blocks {
        Blocks { blocks: Vec::new() }
    }

    pub fn push(&mut self, block: Block) {
        self.blocks.push(block);
    }

    pub fn remove_modulo(&mut self, idx: usize) -> Option<Block> {
        let len = self.blocks.len();
        (len != 0).then(|| self.blocks.swap_remove(idx % len))
    }
}

impl IntoIterator for Blocks {
    type Item = Block;

    type IntoIter = std::vec::IntoIter<Block>;

    fn into_iter(self) -> Self::IntoIter {
        self.blocks.into_iter()
    }
}

/// An allocated block of memory.
pub struct Block {
    // A pointer to the allocated region. Its length is the requested size.
    ptr: NonNull<[u8]>,
    // The unique ID of the last operation that wrote to this allocation.
    id: u64,
}

unsafe fn slice_ptr_to_uninit_slice_mut<'a>(ptr: NonNull<[u8]>) -> &'a mut [MaybeUninit<u8>] {
    unsafe { slice::from_raw_parts_mut(ptr.cast().as_ptr(), ptr.len()) }
}

impl Block {
    /// Creates a block from `ptr` and paints it according to `id`.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `ptr` must be valid for reads and writes for `ptr.len()` bytes.
    /// - No references to the memory at `ptr` may exist when this function is called.
    /// - No accesses to the memory at `ptr` may be made except by way of the
    ///   returned `Block` until said `Block` is dropped.
    pub unsafe fn init(ptr: NonNull<[u8]>, id: u64) -> Block {
        let mut b = Block { ptr, id };
        b.paint(id);
        b
    }

    /// Returns the size of the block in bytes.
    pub fn size(&self) -> usize {
        self.ptr.len()
    }

    pub fn into_raw_parts(self) -> (NonNull<[u8]>, u64) {
        (self.ptr, self.id)
    }

    /// "Paints" the memory contained by `self` with the value of `id`.
    pub fn paint(&mut self, id: u64) {
        // SAFETY: self is mutably borrowed, so no other references to the
        // slice can exist
        let slice = unsafe { slice_ptr_to_uninit_slice_mut(self.ptr) };
        let id_bytes = id.to_le_bytes().into_iter().cycle();

        for (byte, value) in slice.iter_mut().zip(id_bytes) {
            byte.write(value);
        }

        self.id = id;
    }

    /// Verifies that the memory contained by `self` has not been overwritten.
    pub fn verify(&self) -> bool {
        let slice: &[u8] = unsafe { self.ptr.as_ref() };
        let id_bytes = self.id.to_le_bytes().into_iter().cycle();

        slice.iter().zip(id_bytes).all(|(byte, value)| *byte == value)
    }
}

pub struct Evaluator<S: Subject> {
    subject: S,
}

#[derive(Clone, Debug)]
pub struct Failed {
    pub completed: Vec<AllocatorOp>,
    pub failed_op: Option<AllocatorOp>,
}

impl<S: Subject> Evaluator<S> {
    pub fn new(subject: S) -> Evaluator<S> {
        Evaluator { subject }
    }

    pub fn into_subject(self) -> S {
        self.subject
    }

    /// Runs `ops` against the subject, then frees every outstanding block.
    ///
    /// Fails if any block was overwritten while it was allocated, if the
    /// subject rejects a deallocation, or if the subject reports fewer free
    /// bytes than its capacity once everything has been freed.
    pub fn evaluate<I>(&mut self, ops: I) -> Result<(), Failed>
    where
        I: IntoIterator<Item = AllocatorOp>,
    {
        let mut completed = Vec::new();
        let mut blocks = Blocks::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            let op_id = op_id as u64;
            match op {
                AllocatorOp::Alloc(size) => {
                    let ptr = match self.subject.allocate(size) {
                        Ok(p) => p,
                        Err(_) => {
                            completed.push(op);
                            continue;
                        }
                    };

                    let block = unsafe { Block::init(ptr, op_id) };
                    blocks.push(block);
                }

                AllocatorOp::Dealloc(raw_idx) => {
                    let mut block = match blocks.remove_modulo(raw_idx) {
                        Some(b) => b,
                        None => {
                            completed.push(op);
                            continue;
                        }
                    };

                    if !block.verify() {
                        log::error!("block of {} bytes was overwritten", block.size());
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }

                    block.paint(op_id);
                    let (ptr, _) = block.into_raw_parts();

                    if unsafe { self.subject.deallocate(ptr.cast(), ptr.len()) }.is_err() {
                        return Err(Failed {
                            completed,
                            failed_op: Some(op),
                        });
                    }
                }
            }

            completed.push(op);
        }

        for block in blocks {
            if !block.verify() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }

            let (ptr, _) = block.into_raw_parts();
            if unsafe { self.subject.deallocate(ptr.cast(), ptr.len()) }.is_err() {
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }
        }

        if let (Some(free), Some(cap)) = (self.subject.free_bytes(), self.subject.capacity()) {
            if free != cap {
                log::error!("{free} of {cap} bytes free after all blocks were released");
                return Err(Failed {
                    completed,
                    failed_op: None,
                });
            }
        }

        Ok(())
    }
}
