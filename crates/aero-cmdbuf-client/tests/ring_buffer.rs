use aero_cmdbuf_client::{Allocation, BlockState, RingBuffer, TokenTracker};
use proptest::prelude::*;

struct Rng(u64);

impl Rng {
    fn new(seed: u64) -> Self {
        Self(seed)
    }

    fn next_u32(&mut self) -> u32 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        ((x.wrapping_mul(0x2545F4914F6CDD1D)) >> 32) as u32
    }

    fn gen_range(&mut self, max_exclusive: u32) -> u32 {
        if max_exclusive == 0 {
            return 0;
        }
        self.next_u32() % max_exclusive
    }
}

/// The service processes tokens only when asked to.
#[derive(Default)]
struct Service {
    inserted: i32,
    read: i32,
    waits: usize,
}

impl TokenTracker for Service {
    fn last_token_read(&self) -> i32 {
        self.read
    }

    fn has_cached_token_passed(&self, token: i32) -> bool {
        token > self.inserted || token <= self.read
    }

    fn has_token_passed(&mut self, token: i32) -> bool {
        self.has_cached_token_passed(token)
    }

    fn wait_for_token(&mut self, token: i32) {
        self.waits += 1;
        self.read = self.read.max(token);
    }

    fn is_usable(&self) -> bool {
        true
    }
}

fn assert_partition(rb: &RingBuffer) {
    let blocks = rb.blocks();
    let mut next = 0;
    for b in &blocks {
        assert_eq!(b.offset, next, "gap or overlap: {blocks:?}");
        assert!(b.size > 0, "empty block: {blocks:?}");
        next += b.size;
    }
    assert_eq!(next, rb.size(), "partition does not cover the ring: {blocks:?}");

    // Free space is always merged.
    for pair in blocks.windows(2) {
        assert!(
            !(pair[0].state == BlockState::Free && pair[1].state == BlockState::Free),
            "adjacent free runs: {blocks:?}"
        );
    }
}

#[derive(Clone, Debug)]
enum Op {
    Alloc(usize),
    FreeOldest,
    FreeNewest,
    DiscardOldest,
    DiscardNewest,
    Advance,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (1usize..300).prop_map(Op::Alloc),
        1 => Just(Op::FreeOldest),
        1 => Just(Op::FreeNewest),
        1 => Just(Op::DiscardOldest),
        1 => Just(Op::DiscardNewest),
        1 => Just(Op::Advance),
    ]
}

proptest! {
    #[test]
    fn blocks_always_partition_the_ring(ops in proptest::collection::vec(op(), 1..200)) {
        let mut rb = RingBuffer::new(8, 64, 1024);
        let mut service = Service::default();
        let mut live: Vec<Allocation> = Vec::new();

        for op in ops {
            match op {
                Op::Alloc(size) => {
                    if let Some(a) = rb.alloc(size, &mut service) {
                        prop_assert!(a.offset >= 64 && a.offset + a.size <= 64 + 1024);
                        live.push(a);
                    }
                }
                Op::FreeOldest | Op::FreeNewest => {
                    if live.is_empty() {
                        continue;
                    }
                    let a = if matches!(op, Op::FreeOldest) { live.remove(0) } else { live.pop().unwrap() };
                    service.inserted += 1;
                    rb.free_pending_token(a, service.inserted).unwrap();
                }
                Op::DiscardOldest | Op::DiscardNewest => {
                    if live.is_empty() {
                        continue;
                    }
                    let a = if matches!(op, Op::DiscardOldest) { live.remove(0) } else { live.pop().unwrap() };
                    rb.discard_block(a).unwrap();
                }
                Op::Advance => service.read = service.inserted,
            }
            assert_partition(&rb);
            prop_assert_eq!(rb.bytes_in_use(), live.iter().map(|a| a.size).sum::<usize>());
        }
    }
}

#[test]
fn ring_buffer_single_thread_fuzz() {
    let mut rb = RingBuffer::new(16, 0, 4096);
    let mut service = Service::default();
    let mut pending: Vec<Allocation> = Vec::new();
    let mut rng = Rng::new(0x1234_5678_9ABC_DEF0);

    for _ in 0..20_000 {
        match rng.gen_range(4) {
            0 | 1 => {
                let size = rng.gen_range(1024) as usize + 1;
                // The oldest block may still be in use; only allocate when that cannot block us.
                if let Some(a) = rb.alloc(size, &mut service) {
                    pending.push(a);
                }
            }
            2 => {
                if !pending.is_empty() {
                    let a = pending.remove(0);
                    service.inserted += 1;
                    rb.free_pending_token(a, service.inserted).unwrap();
                }
            }
            _ => {
                if rng.gen_range(2) == 0 {
                    service.read = service.inserted;
                } else if let Some(a) = pending.pop() {
                    rb.discard_block(a).unwrap();
                }
            }
        }
        assert_partition(&rb);
    }

    for a in pending.drain(..) {
        service.inserted += 1;
        rb.free_pending_token(a, service.inserted).unwrap();
    }
    assert_eq!(rb.largest_free_or_pending_size(), 4096);
    assert!(service.waits > 0);
}
