#![no_main]
use alloc_hater::AllocatorOp;
use arbitrary::{Arbitrary, Unstructured};
use arena_alloc_hater::BitmapSubject;
use libfuzzer_sys::fuzz_target;

const MAX_ARENA_SIZE: usize = 1 << 20;

#[derive(Clone, Debug)]
struct Args {
    arena_size: usize,
    ops: Vec<AllocatorOp>,
}

impl Arbitrary<'_> for Args {
    fn arbitrary(un: &mut Unstructured) -> arbitrary::Result<Args> {
        let arena_size = usize::arbitrary(un)? % MAX_ARENA_SIZE;
        let ops = Vec::arbitrary(un)?;

        Ok(Args { arena_size, ops })
    }
}

fuzz_target!(|args: Args| {
    let Args { arena_size, ops } = args;

    let bitmap = match BitmapSubject::new(arena_size) {
        Ok(b) => b,
        Err(_) => return,
    };

    let mut eval = alloc_hater::Evaluator::new(bitmap);
    eval.evaluate(ops).unwrap();
});
