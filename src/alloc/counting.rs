use std::cell::Cell;

use serde::Serialize;

use crate::{
    alloc::{Allocator, DeallocateAll, Owns, Rewind},
    span::{ByteSpan, RWByteSpan},
    units::{Alignment, Bytes},
};

/// A snapshot of what a [`CountingAllocator`] has seen
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AllocStats {
    /// Successful `allocate()` calls
    pub allocations: usize,
    /// Non-zero `allocate()` requests that came back empty
    pub failures: usize,
    pub deallocations: usize,
    /// Blocks currently outstanding
    pub live_blocks: usize,
    /// Bytes currently outstanding
    pub live_bytes: Bytes,
    /// High-water mark of `live_bytes`
    pub peak_bytes: Bytes,
}

/// Counts what flows through `A` without changing any of it.
#[derive(Debug, Default)]
pub struct CountingAllocator<A> {
    inner: A,
    stats: Cell<AllocStats>,
}

impl<A> CountingAllocator<A> {
    pub fn new(inner: A) -> Self {
        Self {
            inner,
            stats: Cell::new(AllocStats::default()),
        }
    }

    pub fn inner(&self) -> &A {
        &self.inner
    }

    pub fn into_inner(self) -> A {
        self.inner
    }

    pub fn stats(&self) -> AllocStats {
        self.stats.get()
    }

    fn update(&self, f: impl FnOnce(&mut AllocStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }
}

impl<A: Allocator> Allocator for CountingAllocator<A> {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        let block = self.inner.allocate(size, alignment);
        if size.is_zero() {
            return block;
        }
        self.update(|stats| {
            if block.is_empty() {
                stats.failures += 1;
            } else {
                stats.allocations += 1;
                stats.live_blocks += 1;
                stats.live_bytes += block.len();
                stats.peak_bytes = stats.peak_bytes.max(stats.live_bytes);
            }
        });
        block
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        unsafe { self.inner.deallocate(block, alignment) };
        if block.is_empty() {
            return;
        }
        self.update(|stats| {
            debug_assert!(stats.live_blocks > 0, "more deallocations than allocations");
            stats.deallocations += 1;
            stats.live_blocks = stats.live_blocks.saturating_sub(1);
            stats.live_bytes = stats.live_bytes.saturating_sub(block.len());
        });
    }
}

impl<A: Owns> Owns for CountingAllocator<A> {
    fn owns(&self, block: ByteSpan) -> bool {
        self.inner.owns(block)
    }
}

impl<A: DeallocateAll> DeallocateAll for CountingAllocator<A> {
    unsafe fn deallocate_all(&self) {
        unsafe { self.inner.deallocate_all() };
        self.update(|stats| {
            stats.live_blocks = 0;
            stats.live_bytes = Bytes::ZERO;
        });
    }
}

/// A [`CountingAllocator`] checkpoint: the inner state plus what was live
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CountingState<S> {
    inner: S,
    live_blocks: usize,
    live_bytes: Bytes,
}

impl<A: Rewind> Rewind for CountingAllocator<A> {
    type State = CountingState<A::State>;

    fn save_state(&self) -> Self::State {
        let stats = self.stats.get();
        CountingState {
            inner: self.inner.save_state(),
            live_blocks: stats.live_blocks,
            live_bytes: stats.live_bytes,
        }
    }

    unsafe fn restore_state(&self, state: Self::State) {
        unsafe { self.inner.restore_state(state.inner) };
        self.update(|stats| {
            stats.live_blocks = state.live_blocks;
            stats.live_bytes = state.live_bytes;
        });
    }
}
