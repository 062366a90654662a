use std::{cell::RefCell, rc::Rc};

use allocstack::{
    alloc::{
        block::StaticBlockAllocator,
        compose::FallbackAllocator,
        counting::CountingAllocator,
        global::{allocator, set_allocator, CurrentAllocator, HeapAllocator},
        linear::LinearAllocator,
        pool::{NonIntrusive, PoolAllocator},
        scope::ScopeAllocator,
        tracing::TracingAllocator,
    },
    chain,
    config::StackConfig,
    Alignment, Allocator, Bytes, DeallocateAll, Owns, Rewind,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

#[repr(C, align(16))]
struct Arena([u8; 128]);

#[test]
fn rewinding_a_128_byte_arena() {
    let mut arena = Arena([0; 128]);
    let linear = LinearAllocator::in_buffer(&mut arena.0);
    let base = linear.range().begin();

    let first = linear.allocate(Bytes::new(32), Alignment::new(16));
    assert_eq!(first.begin(), base);
    assert_eq!(first.len(), Bytes::new(32));

    let saved = linear.save_state();
    assert!(linear.allocate(Bytes::new(100), Alignment::ONE).is_empty());

    unsafe { linear.restore_state(saved) };
    let second = linear.allocate(Bytes::new(96), Alignment::ONE);
    assert_eq!(second.begin(), base.add(Bytes::new(32)));
    assert_eq!(second.end(), linear.range().end());
    assert!(linear.remaining().is_zero());
}

#[test]
fn pool_over_arena_falls_back_to_the_heap() {
    let mut arena = Arena([0; 128]);
    let stack = FallbackAllocator::new(
        PoolAllocator::<_, NonIntrusive>::new(
            LinearAllocator::in_buffer(&mut arena.0),
            Bytes::new(32),
            Alignment::new(16),
        ),
        CountingAllocator::new(HeapAllocator),
    );

    // the arena fits four pool blocks
    let small: Vec<_> = (0..4)
        .map(|_| stack.allocate(Bytes::new(24), Alignment::new(8)))
        .collect();
    assert!(small.iter().all(|b| stack.primary().owns(b.as_read_only())));
    assert_eq!(stack.fallback().stats().allocations, 0);

    // the fifth, and anything bigger than a pool block, spills over
    let spilled = stack.allocate(Bytes::new(24), Alignment::new(8));
    let big = stack.allocate(Bytes::new(1000), Alignment::new(8));
    assert!(!stack.primary().owns(spilled.as_read_only()));
    assert_eq!(stack.fallback().stats().live_blocks, 2);

    unsafe {
        stack.deallocate(spilled, Alignment::new(8));
        stack.deallocate(big, Alignment::new(8));
        stack.deallocate(small[2], Alignment::new(8));
    }
    assert_eq!(stack.fallback().stats().live_blocks, 0);

    // recycled from the pool, not the heap
    let again = stack.allocate(Bytes::new(8), Alignment::new(8));
    assert_eq!(again.begin(), small[2].begin());
    assert_eq!(stack.fallback().stats().allocations, 2);
}

#[test]
fn chains_route_frees_to_their_owner() {
    let mut a = Arena([0; 128]);
    let mut b = Arena([0; 128]);
    let stack = chain![
        LinearAllocator::in_buffer(&mut a.0),
        LinearAllocator::in_buffer(&mut b.0),
    ];
    let blocks: Vec<_> = (0..4)
        .map(|_| stack.allocate(Bytes::new(64), Alignment::ONE))
        .collect();
    assert!(blocks.iter().all(|block| !block.is_empty()));
    assert!(stack.allocate(Bytes::new(1), Alignment::ONE).is_empty());
    assert!(stack.head().owns(blocks[1].as_read_only()));
    assert!(stack.tail().head().owns(blocks[2].as_read_only()));

    unsafe { stack.deallocate_all() };
    assert_eq!(stack.allocate(Bytes::new(64), Alignment::ONE), blocks[0]);
}

#[test]
fn scopes_over_a_traced_arena_leave_nothing_behind() {
    let traced = TracingAllocator::new(LinearAllocator::new(Bytes::kib(64)).unwrap());
    let dropped = Rc::new(RefCell::new(0));
    let before = traced.save_state();

    struct Counted(Rc<RefCell<usize>>);
    impl Drop for Counted {
        fn drop(&mut self) {
            *self.0.borrow_mut() += 1;
        }
    }

    {
        let scope = ScopeAllocator::new(&traced);
        for _ in 0..100 {
            scope.new_object(Counted(dropped.clone())).unwrap();
        }
        let words = scope.new_object(vec!["a".to_string(); 10]).unwrap();
        words.push("b".into());
        assert_eq!(traced.nr_allocations(), 101);
    }
    assert_eq!(*dropped.borrow(), 100);
    assert_eq!(traced.nr_allocations(), 0);
    assert!(traced.inner().used().is_zero());
    assert_eq!(traced.save_state(), before);
}

#[test]
fn zero_sized_requests_round_trip_through_every_layer() {
    let blocks = StaticBlockAllocator::new(Bytes::mib(1), Bytes::kib(64)).unwrap();
    let stack = FallbackAllocator::new(
        PoolAllocator::<_, NonIntrusive>::new(
            TracingAllocator::new(&blocks),
            Bytes::new(64),
            Alignment::DEFAULT,
        ),
        CountingAllocator::new(HeapAllocator),
    );
    let live = stack.allocate(Bytes::new(16), Alignment::ONE);
    let empty = stack.allocate(Bytes::ZERO, Alignment::ONE);
    assert!(empty.is_empty());
    unsafe { stack.deallocate(empty, Alignment::ONE) };
    assert_eq!(stack.fallback().stats(), Default::default());
    assert_eq!(stack.primary().live_count(), 1);
    assert_eq!(stack.primary().upstream().nr_allocations(), 1);
    assert_eq!(blocks.reserved_blocks(), 1);
    unsafe { stack.deallocate(live, Alignment::ONE) };
}

#[test]
fn random_churn_through_a_configured_stack() {
    let config = StackConfig::from_json(
        r#"{ "pool": { "max_size": 256, "max_alignment": 64 }, "block": { "capacity": 16777216 } }"#,
    )
    .unwrap();
    let blocks: StaticBlockAllocator = config.block.build().unwrap();
    let stack = FallbackAllocator::new(
        config.pool.build::<_, NonIntrusive>(&blocks),
        CountingAllocator::new(HeapAllocator),
    );

    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live = Vec::new();
    for _ in 0..5_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let size = Bytes::new(rng.gen_range(1..=512));
            let alignment = Alignment::new(1 << rng.gen_range(0..=7));
            let block = stack.allocate(size, alignment);
            assert!(!block.is_empty());
            assert!(block.is_aligned_to(alignment));
            assert_eq!(block.len(), size);
            let tag = live.len() as u8;
            unsafe { block.as_mut_slice() }.fill(tag);
            live.push((block, alignment, tag));
        } else {
            let (block, alignment, tag) = live.swap_remove(rng.gen_range(0..live.len()));
            assert!(unsafe { block.as_read_only().as_slice() }.iter().all(|b| *b == tag));
            unsafe { stack.deallocate(block, alignment) };
        }
    }
    for (block, alignment, _) in live.drain(..) {
        unsafe { stack.deallocate(block, alignment) };
    }
    assert_eq!(stack.fallback().stats().live_blocks, 0);
    assert_eq!(stack.primary().live_count(), 0);
}

#[test]
fn current_allocator_can_be_an_arena() {
    let arena: Rc<dyn Allocator> = Rc::new(CountingAllocator::new(
        LinearAllocator::new(Bytes::kib(4)).unwrap(),
    ));
    let previous = set_allocator(arena.clone());
    let block = CurrentAllocator.allocate(Bytes::new(100), Alignment::DEFAULT);
    assert!(!block.is_empty());
    assert!(Rc::ptr_eq(&allocator(), &arena));
    unsafe { CurrentAllocator.deallocate(block, Alignment::DEFAULT) };
    set_allocator(previous);
}
