//! A fixed-maximum-size recycler.
//!
//! Every block a [`PoolAllocator`] gets from its upstream is exactly
//! `max_size` bytes aligned to `max_alignment`. Requests of any size up to
//! `max_size` are carved from the front of such a block, and freed blocks go
//! on a free list to be handed out again, LIFO.

use std::{
    cell::{Cell, RefCell},
    fmt, ptr,
};

use ahash::RandomState;
use hashbrown::HashMap;
use log::debug;

use crate::{
    alloc::{Allocator, Owns},
    span::{ByteSpan, RWByteSpan},
    units::{Address, Alignment, Bytes},
    util::hint::cold,
};

/// How a [`PoolAllocator`] remembers its free blocks
pub trait FreeListPolicy: Default {
    /// The smallest `max_size` this policy can work with
    const MIN_BLOCK_SIZE: Bytes;

    /// # Safety
    ///
    /// `block` must be the base of a pool block nobody is using, at least
    /// `MIN_BLOCK_SIZE` bytes long.
    unsafe fn push(&mut self, block: Address);

    fn pop(&mut self) -> Option<Address>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Threads the free list through the freed blocks themselves: each free
/// block's first word is the address of the next one. Costs no memory, but
/// the freed blocks must stay writable.
pub struct Intrusive {
    head: *mut u8,
    len: usize,
}

impl Default for Intrusive {
    fn default() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }
}

impl FreeListPolicy for Intrusive {
    const MIN_BLOCK_SIZE: Bytes = Bytes::of::<*mut u8>();

    unsafe fn push(&mut self, block: Address) {
        // SAFETY: caller guarantees the block is ours, unused and big enough
        // for one pointer
        unsafe { block.cast::<*mut u8>().write_unaligned(self.head) };
        self.head = block.as_ptr();
        self.len += 1;
    }

    fn pop(&mut self) -> Option<Address> {
        if self.head.is_null() {
            return None;
        }
        let block = self.head;
        // SAFETY: `block` was pushed by `push()`, which wrote the link
        self.head = unsafe { (block as *mut *mut u8).read_unaligned() };
        self.len -= 1;
        Some(Address::new(block))
    }

    fn len(&self) -> usize {
        self.len
    }
}

/// Keeps free block addresses in a side stack and never touches freed
/// memory, so it works over upstreams that decommit what they are given back.
#[derive(Default)]
pub struct NonIntrusive {
    stack: Vec<Address>,
}

impl FreeListPolicy for NonIntrusive {
    const MIN_BLOCK_SIZE: Bytes = Bytes::new(1);

    unsafe fn push(&mut self, block: Address) {
        self.stack.push(block);
    }

    fn pop(&mut self) -> Option<Address> {
        self.stack.pop()
    }

    fn len(&self) -> usize {
        self.stack.len()
    }
}

/// See the [module docs](self).
///
/// Deallocation is strict: the pool remembers the size it handed out for
/// every live block, and panics if a block comes back with a different start
/// or length.
pub struct PoolAllocator<A, P = Intrusive>
where
    A: Allocator,
    P: FreeListPolicy,
{
    upstream: A,
    max_size: Bytes,
    max_alignment: Alignment,
    free: RefCell<P>,
    live: RefCell<HashMap<Address, Bytes, RandomState>>,
    upstream_blocks: Cell<usize>,
}

impl<A, P> PoolAllocator<A, P>
where
    A: Allocator,
    P: FreeListPolicy,
{
    /// # Panics
    /// - If `max_size` is smaller than the policy's `MIN_BLOCK_SIZE`
    pub fn new(upstream: A, max_size: Bytes, max_alignment: Alignment) -> Self {
        assert!(
            max_size >= P::MIN_BLOCK_SIZE,
            "pool blocks of {max_size} can't hold a free-list link"
        );
        debug!("PoolAllocator::new(max_size: {max_size}, max_alignment: {max_alignment})");
        Self {
            upstream,
            max_size,
            max_alignment,
            free: RefCell::new(P::default()),
            live: RefCell::new(HashMap::default()),
            upstream_blocks: Cell::new(0),
        }
    }

    pub fn upstream(&self) -> &A {
        &self.upstream
    }

    pub fn max_size(&self) -> Bytes {
        self.max_size
    }

    pub fn max_alignment(&self) -> Alignment {
        self.max_alignment
    }

    /// How many blocks are waiting on the free list
    pub fn free_count(&self) -> usize {
        self.free.borrow().len()
    }

    /// How many blocks are currently handed out
    pub fn live_count(&self) -> usize {
        self.live.borrow().len()
    }

    /// Give every free block back to the upstream allocator. Returns how many
    /// blocks were released.
    pub fn trim(&self) -> usize {
        let mut free = self.free.borrow_mut();
        let mut released = 0;
        while let Some(block) = free.pop() {
            // SAFETY: every free-listed block came from `self.upstream` with
            // exactly this size and alignment, and nobody is using it
            unsafe {
                self.upstream.deallocate(
                    RWByteSpan::from_address(block, self.max_size),
                    self.max_alignment,
                )
            };
            released += 1;
        }
        self.upstream_blocks.set(self.upstream_blocks.get() - released);
        if released > 0 {
            debug!("PoolAllocator::trim(): released {released} blocks");
        }
        released
    }

    fn refill(&self) -> Option<Address> {
        cold(|| {
            let block = self.upstream.allocate(self.max_size, self.max_alignment);
            if block.is_empty() {
                return None;
            }
            self.upstream_blocks.set(self.upstream_blocks.get() + 1);
            Some(block.begin())
        })
    }
}

impl<A, P> Allocator for PoolAllocator<A, P>
where
    A: Allocator,
    P: FreeListPolicy,
{
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        if size.is_zero() || size > self.max_size || alignment > self.max_alignment {
            return RWByteSpan::EMPTY;
        }
        let recycled = self.free.borrow_mut().pop();
        let Some(base) = recycled.or_else(|| self.refill()) else {
            return RWByteSpan::EMPTY;
        };
        debug_assert!(base.is_aligned_to(alignment));
        self.live.borrow_mut().insert(base, size);
        RWByteSpan::from_address(base, size)
    }

    unsafe fn deallocate(&self, block: RWByteSpan, _: Alignment) {
        if block.is_empty() {
            return;
        }
        let issued = self.live.borrow_mut().remove(&block.begin());
        match issued {
            Some(size) => assert_eq!(
                size,
                block.len(),
                "{block:?} handed back with a different size than it was allocated with"
            ),
            None => panic!("{block:?} is not a live block of this pool"),
        }
        // SAFETY: the block is live in this pool, so its base starts a whole
        // `max_size` upstream block that the caller no longer uses
        unsafe { self.free.borrow_mut().push(block.begin()) };
    }
}

impl<A, P> Owns for PoolAllocator<A, P>
where
    A: Allocator + Owns,
    P: FreeListPolicy,
{
    fn owns(&self, block: ByteSpan) -> bool {
        self.upstream.owns(block)
    }
}

impl<A, P> Drop for PoolAllocator<A, P>
where
    A: Allocator,
    P: FreeListPolicy,
{
    fn drop(&mut self) {
        self.trim();
    }
}

impl<A, P> fmt::Debug for PoolAllocator<A, P>
where
    A: Allocator,
    P: FreeListPolicy,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolAllocator")
            .field("max_size", &self.max_size)
            .field("max_alignment", &self.max_alignment)
            .field("free", &self.free_count())
            .field("live", &self.live_count())
            .field("upstream_blocks", &self.upstream_blocks.get())
            .finish()
    }
}
