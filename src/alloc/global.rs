//! The system heap as an [`Allocator`], and the per-thread "current
//! allocator" slot.
//!
//! Prefer passing allocators explicitly. The slot is an escape hatch for code
//! that can't thread one through: it starts out as [`HeapAllocator`] the first
//! time a thread asks for it, and only changes through [`set_allocator()`].
//! There is no guard that puts the old one back; keep what `set_allocator()`
//! returns and restore it yourself.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::RefCell,
    rc::Rc,
};

use crate::{
    alloc::Allocator,
    span::RWByteSpan,
    units::{Alignment, Bytes},
    util::hint::cold,
};

/// Forwards to the process heap (`std::alloc::System`)
#[derive(Clone, Copy, Debug, Default)]
pub struct HeapAllocator;

impl Allocator for HeapAllocator {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        if size.is_zero() {
            return RWByteSpan::EMPTY;
        }
        let Ok(layout) = Layout::from_size_align(size.get(), alignment.get()) else {
            return cold(|| RWByteSpan::EMPTY);
        };
        // SAFETY: `layout` has a non-zero size
        let data = unsafe { System.alloc(layout) };
        if data.is_null() {
            return cold(|| RWByteSpan::EMPTY);
        }
        RWByteSpan::from_raw_parts(data, size)
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        if block.is_empty() {
            return;
        }
        // SAFETY: the caller passes a block from `allocate()` with the same
        // alignment, so this is the layout it was allocated with
        unsafe {
            let layout = Layout::from_size_align_unchecked(block.len().get(), alignment.get());
            System.dealloc(block.as_ptr(), layout)
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<dyn Allocator>>> = const { RefCell::new(None) };
}

fn default_allocator() -> Rc<dyn Allocator> {
    Rc::new(HeapAllocator)
}

/// This thread's current allocator
pub fn allocator() -> Rc<dyn Allocator> {
    CURRENT.with(|slot| {
        slot.borrow_mut()
            .get_or_insert_with(default_allocator)
            .clone()
    })
}

/// Make `allocator` this thread's current allocator, returning the previous
/// one.
pub fn set_allocator(allocator: Rc<dyn Allocator>) -> Rc<dyn Allocator> {
    CURRENT.with(|slot| {
        let mut slot = slot.borrow_mut();
        let previous = slot.take().unwrap_or_else(default_allocator);
        *slot = Some(allocator);
        previous
    })
}

/// Forwards every call to whatever [`allocator()`] is at the time.
///
/// Blocks must be deallocated while the same allocator is current.
#[derive(Clone, Copy, Debug, Default)]
pub struct CurrentAllocator;

impl Allocator for CurrentAllocator {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        allocator().allocate(size, alignment)
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        unsafe { allocator().deallocate(block, alignment) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::{counting::CountingAllocator, NullAllocator};

    #[test]
    fn heap_allocations_are_aligned() {
        for shift in 0..12 {
            let align = Alignment::new(1 << shift);
            let block = HeapAllocator.allocate(Bytes::new(40), align);
            assert!(!block.is_empty());
            assert!(block.is_aligned_to(align));
            unsafe { HeapAllocator.deallocate(block, align) };
        }
    }

    #[test]
    fn current_allocator_defaults_to_the_heap_and_can_be_swapped() {
        let block = CurrentAllocator.allocate(Bytes::new(16), Alignment::DEFAULT);
        assert!(!block.is_empty());
        unsafe { CurrentAllocator.deallocate(block, Alignment::DEFAULT) };

        let previous = set_allocator(Rc::new(NullAllocator));
        assert!(CurrentAllocator.allocate(Bytes::new(16), Alignment::DEFAULT).is_empty());
        let null = set_allocator(previous);
        assert!(null.allocate(Bytes::new(16), Alignment::DEFAULT).is_empty());
        assert!(allocator().allocate(Bytes::ZERO, Alignment::ONE).is_empty());
    }

    #[test]
    fn slot_is_per_thread() {
        let counting = Rc::new(CountingAllocator::new(HeapAllocator));
        let previous = set_allocator(counting.clone());
        std::thread::spawn(|| {
            // a fresh thread starts from the heap, not from our counter
            let block = CurrentAllocator.allocate(Bytes::new(8), Alignment::ONE);
            unsafe { CurrentAllocator.deallocate(block, Alignment::ONE) };
        })
        .join()
        .unwrap();
        let block = CurrentAllocator.allocate(Bytes::new(8), Alignment::ONE);
        unsafe { CurrentAllocator.deallocate(block, Alignment::ONE) };
        assert_eq!(counting.stats().allocations, 1);
        set_allocator(previous);
    }
}
