use std::{cell::RefCell, fmt};

use ::dlmalloc::Dlmalloc;

use crate::{
    alloc::Allocator,
    span::RWByteSpan,
    units::{Alignment, Bytes},
    util::hint::cold,
};

// https://gee.cs.oswego.edu/dl/html/malloc.html

/// What `dlmalloc()` guarantees without going through `memalign()`
pub const DLMALLOC_MIN_ALIGN: Alignment = Alignment::new(2 * std::mem::size_of::<usize>());

/// A private `dlmalloc()` heap. Unlike [`HeapAllocator`], nothing else in the
/// process allocates out of it, so it can back an allocator stack without
/// contending with (or fragmenting) the global heap.
///
/// The segments it maps from the OS are kept for the life of the process.
///
/// [`HeapAllocator`]: crate::alloc::global::HeapAllocator
pub struct DlmallocAllocator {
    heap: RefCell<Dlmalloc>,
}

impl DlmallocAllocator {
    pub const fn new() -> Self {
        Self {
            heap: RefCell::new(Dlmalloc::new()),
        }
    }
}

impl Default for DlmallocAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator for DlmallocAllocator {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        if size.is_zero() {
            return RWByteSpan::EMPTY;
        }
        // SAFETY: non-zero size and power-of-two alignment are all `malloc()`
        // asks of us
        let data = unsafe {
            self.heap
                .borrow_mut()
                .malloc(size.get(), alignment.get())
        };
        if data.is_null() {
            return cold(|| RWByteSpan::EMPTY);
        }
        RWByteSpan::from_raw_parts(data, size)
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        if block.is_empty() {
            return;
        }
        // SAFETY:
        // - Identical contract to caller: the block came from this heap with
        //   this size and alignment.
        unsafe {
            self.heap
                .borrow_mut()
                .free(block.as_ptr(), block.len().get(), alignment.get())
        }
    }
}

impl fmt::Debug for DlmallocAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("DlmallocAllocator")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::pool::PoolAllocator;

    #[test]
    fn allocates_aligned_writable_blocks() {
        let alloc = DlmallocAllocator::new();
        let mut blocks = Vec::new();
        for shift in 0..10 {
            let align = Alignment::new(1 << shift);
            let block = alloc.allocate(Bytes::new(100 + shift), align);
            assert!(block.is_aligned_to(align));
            unsafe { block.as_mut_slice() }.fill(shift as u8);
            blocks.push((block, align));
        }
        for (i, (block, align)) in blocks.into_iter().enumerate() {
            assert!(unsafe { block.as_read_only().as_slice() }.iter().all(|b| *b == i as u8));
            unsafe { alloc.deallocate(block, align) };
        }
    }

    #[test]
    fn backs_a_pool() {
        let pool: PoolAllocator<_> =
            PoolAllocator::new(DlmallocAllocator::new(), Bytes::new(256), DLMALLOC_MIN_ALIGN);
        let a = pool.allocate(Bytes::new(200), Alignment::new(8));
        unsafe { pool.deallocate(a, Alignment::new(8)) };
        assert_eq!(pool.allocate(Bytes::new(10), Alignment::ONE).begin(), a.begin());
    }
}
