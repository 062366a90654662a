//! Block-granular allocation over a reserved stretch of address space.
//!
//! The range is reserved up front with no access rights, then carved into
//! equal `block_size` blocks. A block's pages are only committed when it is
//! handed out, so the committed footprint follows actual use.
//!
//! [`BlockAllocator`] decommits a block's pages when it is freed.
//! [`StaticBlockAllocator`] never does: freed blocks keep their pages, which
//! saves the kernel round trips at the cost of never shrinking.

use std::{
    cell::{Cell, RefCell},
    fmt,
    marker::PhantomData,
};

use log::{debug, warn};

use crate::{
    alloc::{Allocator, Owns},
    os::mem::{page_alignment, page_size, MapError, MmapRegion},
    span::{ByteSpan, RWByteSpan},
    units::{Address, Alignment, Bytes},
    util::hint::cold,
};

/// What happens to a block's pages when it is freed
pub trait DecommitPolicy {
    const DECOMMIT_ON_FREE: bool;
}

/// Freed blocks are decommitted
pub enum Decommit {}

/// Freed blocks stay committed
pub enum Retain {}

impl DecommitPolicy for Decommit {
    const DECOMMIT_ON_FREE: bool = true;
}

impl DecommitPolicy for Retain {
    const DECOMMIT_ON_FREE: bool = false;
}

pub type BlockAllocator = RawBlockAllocator<Decommit>;
pub type StaticBlockAllocator = RawBlockAllocator<Retain>;

/// A reserved, not yet committed block
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Reserved {
    index: usize,
    base: Address,
}

impl Reserved {
    pub fn base(&self) -> Address {
        self.base
    }
}

/// See the [module docs](self). Use the [`BlockAllocator`] and
/// [`StaticBlockAllocator`] aliases.
pub struct RawBlockAllocator<D: DecommitPolicy> {
    region: MmapRegion,
    /// First block-aligned address of `region`
    base: Address,
    block_size: Bytes,
    block_count: usize,
    /// Blocks below the cursor have been handed out at least once
    cursor: Cell<usize>,
    /// Indices of freed blocks
    free: RefCell<Vec<usize>>,
    /// Committed bytes per block index below the cursor
    committed: RefCell<Vec<Bytes>>,
    _policy: PhantomData<D>,
}

impl<D: DecommitPolicy> RawBlockAllocator<D> {
    /// Reserve room for `capacity` bytes worth of `block_size` blocks.
    ///
    /// # Panics
    /// - If `block_size` is not a power of two, or smaller than a page
    pub fn new(capacity: Bytes, block_size: Bytes) -> Result<Self, MapError> {
        assert!(
            block_size.get().is_power_of_two() && block_size >= page_size(),
            "block size {block_size} must be a power of two of at least one page"
        );
        let block_count = capacity.get() / block_size.get();
        // Over-reserve by one block so the first block can be aligned
        let region = MmapRegion::reserve(block_size * (block_count + 1))?;
        let base = region.base().align_up(Alignment::new(block_size.get()));
        debug!(
            "RawBlockAllocator::new({capacity}, {block_size}): {block_count} blocks at {base:?}, decommit: {}",
            D::DECOMMIT_ON_FREE
        );
        Ok(Self {
            region,
            base,
            block_size,
            block_count,
            cursor: Cell::new(0),
            free: RefCell::new(Vec::new()),
            committed: RefCell::new(Vec::new()),
            _policy: PhantomData,
        })
    }

    pub fn page_size(&self) -> Bytes {
        page_size()
    }

    pub fn block_size(&self) -> Bytes {
        self.block_size
    }

    pub fn block_count(&self) -> usize {
        self.block_count
    }

    /// Everything that could ever be handed out
    pub fn span(&self) -> RWByteSpan {
        RWByteSpan::from_address(self.base, self.block_size * self.block_count)
    }

    /// Total committed bytes, over live and (for [`StaticBlockAllocator`])
    /// freed blocks
    pub fn committed(&self) -> Bytes {
        self.committed
            .borrow()
            .iter()
            .fold(Bytes::ZERO, |acc, b| acc + *b)
    }

    /// How many blocks have ever been reserved
    pub fn reserved_blocks(&self) -> usize {
        self.cursor.get()
    }

    fn block_base(&self, index: usize) -> Address {
        self.base.add(self.block_size * index)
    }

    fn index_of(&self, addr: Address) -> usize {
        addr.offset_from(self.base).get() / self.block_size.get()
    }

    /// Take a block. It must be [`commit()`](Self::commit)ted before use.
    pub fn reserve(&self) -> Option<Reserved> {
        if let Some(index) = self.free.borrow_mut().pop() {
            return Some(Reserved {
                index,
                base: self.block_base(index),
            });
        }
        let index = self.cursor.get();
        if index == self.block_count {
            return cold(|| None);
        }
        self.cursor.set(index + 1);
        self.committed.borrow_mut().push(Bytes::ZERO);
        Some(Reserved {
            index,
            base: self.block_base(index),
        })
    }

    /// Make the first `size` bytes (rounded up to pages, capped at the block
    /// size) of `block` usable.
    pub fn commit(&self, block: Reserved, size: Bytes) -> Result<RWByteSpan, MapError> {
        let size = size.round_up(page_alignment()).min(self.block_size);
        let mut committed = self.committed.borrow_mut();
        let already = committed[block.index];
        if size > already {
            let extra = RWByteSpan::from_address(block.base.add(already), size - already);
            self.region.commit(extra)?;
            committed[block.index] = size;
        }
        Ok(RWByteSpan::from_address(block.base, size))
    }

    /// Put a reserved block straight back without committing anything.
    pub fn unreserve(&self, block: Reserved) {
        self.release(block.index);
    }

    /// Free the block starting at `block`
    ///
    /// # Safety
    ///
    /// `block` must have come from this allocator and must not be used again.
    pub unsafe fn free(&self, block: Address) {
        debug_assert!(self.span().as_read_only().contains_address(block));
        debug_assert!(block.is_aligned_to(Alignment::new(self.block_size.get())));
        self.release(self.index_of(block));
    }

    fn release(&self, index: usize) {
        debug_assert!(!self.free.borrow().contains(&index), "block {index} freed twice");
        if D::DECOMMIT_ON_FREE {
            let mut committed = self.committed.borrow_mut();
            let span = RWByteSpan::from_address(self.block_base(index), committed[index]);
            // SAFETY: the block is no longer used by anyone
            match unsafe { self.region.decommit(span) } {
                Ok(()) => committed[index] = Bytes::ZERO,
                // The pages stay committed and will be reused as they are
                Err(e) => warn!("could not decommit block {index}: {e}"),
            }
        }
        self.free.borrow_mut().push(index);
    }
}

impl<D: DecommitPolicy> Allocator for RawBlockAllocator<D> {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        if size.is_zero() || size > self.block_size || alignment.get() > self.block_size.get() {
            return RWByteSpan::EMPTY;
        }
        let Some(block) = self.reserve() else {
            return RWByteSpan::EMPTY;
        };
        match self.commit(block, size) {
            Ok(_) => RWByteSpan::from_address(block.base, size),
            Err(e) => cold(|| {
                warn!("could not commit block at {:?}: {e}", block.base);
                self.unreserve(block);
                RWByteSpan::EMPTY
            }),
        }
    }

    unsafe fn deallocate(&self, block: RWByteSpan, _: Alignment) {
        if block.is_empty() {
            return;
        }
        unsafe { self.free(block.begin()) }
    }
}

impl<D: DecommitPolicy> Owns for RawBlockAllocator<D> {
    fn owns(&self, block: ByteSpan) -> bool {
        self.span().contains(&block)
    }
}

impl<D: DecommitPolicy> fmt::Debug for RawBlockAllocator<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawBlockAllocator")
            .field("base", &self.base)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("reserved", &self.cursor.get())
            .field("free", &self.free.borrow().len())
            .field("decommit_on_free", &D::DECOMMIT_ON_FREE)
            .finish()
    }
}
