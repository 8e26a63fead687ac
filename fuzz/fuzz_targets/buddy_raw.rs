#![no_main]

use arbitrary::Arbitrary;
use arena_alloc::BuddyAllocator;
use libfuzzer_sys::fuzz_target;

const MAX_ARENA_SIZE: usize = 1 << 20;

#[derive(Clone, Debug, Arbitrary)]
enum BuddyOp {
    Allocate(usize),
    Deallocate(usize),
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    arena_size: usize,
    ops: Vec<BuddyOp>,
}

fuzz_target!(|args: Args| {
    let mut alloc = match BuddyAllocator::try_new(args.arena_size % MAX_ARENA_SIZE) {
        Ok(a) => a,
        Err(_) => return,
    };

    let mut outstanding = Vec::new();

    for op in args.ops {
        match op {
            BuddyOp::Allocate(size) => {
                if let Ok(block) = alloc.allocate(size) {
                    outstanding.push(block);
                }
            }

            BuddyOp::Deallocate(raw_idx) => {
                if outstanding.is_empty() {
                    continue;
                }

                let idx = raw_idx % outstanding.len();
                let block = outstanding.swap_remove(idx);
                unsafe { alloc.deallocate(block.cast(), block.len()).unwrap() };
            }
        }
    }

    for block in outstanding {
        unsafe { alloc.deallocate(block.cast(), block.len()).unwrap() };
    }

    assert_eq!(alloc.free_bytes(), alloc.capacity());
});
