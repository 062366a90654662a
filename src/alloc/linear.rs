use std::{cell::Cell, fmt, marker::PhantomData};

use log::debug;

use crate::{
    alloc::{Allocator, DeallocateAll, Owns, Rewind},
    os::mem::{MapError, MmapRegion},
    span::{ByteSpan, RWByteSpan},
    units::{Alignment, Bytes},
    util::hint::cold,
};

/// A saved [`LinearAllocator`] head, as an offset from the start of the range
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinearState(Bytes);

impl LinearState {
    pub const fn offset(self) -> Bytes {
        self.0
    }
}

/// A bump allocator over a fixed byte range.
///
/// `allocate()` is just a head bump, and `deallocate()` is a nop. The only
/// ways to get memory back are [`Rewind::restore_state()`] and
/// [`DeallocateAll::deallocate_all()`].
///
/// ```plaintext
/// begin                 head                        end
///   |  A1  |pad|   A2   |          free             |
///   +------+---+--------+---------------------------+
/// ```
pub struct LinearAllocator<'a> {
    range: RWByteSpan,
    head: Cell<usize>,
    _region: Option<MmapRegion>,
    _buffer: PhantomData<&'a mut [u8]>,
}

impl LinearAllocator<'static> {
    /// Construct a new [`LinearAllocator`] over its own mapping, that can hold
    /// at least `capacity` bytes (the mapping is whole pages).
    pub fn new(capacity: Bytes) -> Result<Self, MapError> {
        let region = MmapRegion::map(capacity)?;
        debug!("LinearAllocator::new({capacity}) -> {:?}", region);
        Ok(Self {
            range: region.span(),
            head: Cell::new(0),
            _region: Some(region),
            _buffer: PhantomData,
        })
    }
}

impl<'a> LinearAllocator<'a> {
    /// Bump-allocate out of a borrowed buffer
    pub fn in_buffer(buffer: &'a mut [u8]) -> Self {
        Self {
            range: RWByteSpan::from_slice(buffer),
            head: Cell::new(0),
            _region: None,
            _buffer: PhantomData,
        }
    }

    /// Bump-allocate out of an arbitrary range.
    ///
    /// # Safety
    ///
    /// `range` must be valid for reads and writes, and not used by anything
    /// else, for as long as this allocator or any block from it is alive.
    pub unsafe fn from_span(range: RWByteSpan) -> Self {
        Self {
            range,
            head: Cell::new(0),
            _region: None,
            _buffer: PhantomData,
        }
    }

    pub fn range(&self) -> RWByteSpan {
        self.range
    }

    pub fn capacity(&self) -> Bytes {
        self.range.len()
    }

    pub fn used(&self) -> Bytes {
        Bytes::new(self.head.get())
    }

    pub fn remaining(&self) -> Bytes {
        self.capacity() - self.used()
    }
}

impl Allocator for LinearAllocator<'_> {
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        if size.is_zero() {
            return RWByteSpan::EMPTY;
        }
        let begin = self.range.begin();
        let aligned = begin.add(self.used()).align_up(alignment);
        let offset = aligned.addr().wrapping_sub(begin.addr());
        match Bytes::new(offset).checked_add(size) {
            Some(new_head) if offset >= self.head.get() && new_head <= self.capacity() => {
                self.head.set(new_head.get());
                RWByteSpan::from_address(aligned, size)
            }
            _ => cold(|| RWByteSpan::EMPTY),
        }
    }

    unsafe fn deallocate(&self, block: RWByteSpan, _: Alignment) {
        if block.is_empty() {
            return;
        }
        debug_assert!(
            self.owns(block.into()),
            "{block:?} was not allocated from {:?}",
            self.range
        );
    }
}

impl Owns for LinearAllocator<'_> {
    fn owns(&self, block: ByteSpan) -> bool {
        self.range.contains(&block)
    }
}

impl DeallocateAll for LinearAllocator<'_> {
    unsafe fn deallocate_all(&self) {
        self.head.set(0);
    }
}

impl Rewind for LinearAllocator<'_> {
    type State = LinearState;

    fn save_state(&self) -> LinearState {
        LinearState(self.used())
    }

    unsafe fn restore_state(&self, state: LinearState) {
        debug_assert!(
            state.0 <= self.capacity(),
            "restoring {state:?} past the end of {:?}",
            self.range
        );
        self.head.set(state.0.get());
    }
}

impl fmt::Debug for LinearAllocator<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearAllocator")
            .field("range", &self.range)
            .field("head", &self.head.get())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[repr(C, align(16))]
    struct Aligned<const N: usize>([u8; N]);

    #[test]
    fn sequential_allocations_are_disjoint_and_monotonic() {
        let mut buf = Aligned([0u8; 1024]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        let mut last_end = alloc.range().begin();
        for (size, align) in [(1, 1), (7, 8), (32, 16), (3, 2), (100, 64), (5, 4)] {
            let span = alloc.allocate(Bytes::new(size), Alignment::new(align));
            assert!(!span.is_empty());
            assert_eq!(span.len(), Bytes::new(size));
            assert!(span.begin() >= last_end);
            assert!(span.is_aligned_to(Alignment::new(align)));
            last_end = span.end();
        }
    }

    #[test]
    fn exhaustion_returns_empty_without_moving_the_head() {
        let mut buf = Aligned([0u8; 64]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        assert!(!alloc.allocate(Bytes::new(60), Alignment::ONE).is_empty());
        let before = alloc.save_state();
        assert!(alloc.allocate(Bytes::new(8), Alignment::ONE).is_empty());
        assert_eq!(alloc.save_state(), before);
        assert!(!alloc.allocate(Bytes::new(4), Alignment::ONE).is_empty());
        assert_eq!(alloc.remaining(), Bytes::ZERO);
    }

    #[test]
    fn save_then_restore_reuses_addresses() {
        let mut buf = Aligned([0u8; 256]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        alloc.allocate(Bytes::new(10), Alignment::ONE);
        let saved = alloc.save_state();
        unsafe { alloc.restore_state(saved) };
        let first = alloc.allocate(Bytes::new(24), Alignment::new(8));
        let second = alloc.allocate(Bytes::new(24), Alignment::new(8));
        unsafe { alloc.restore_state(saved) };
        assert_eq!(alloc.allocate(Bytes::new(24), Alignment::new(8)), first);
        assert_eq!(alloc.allocate(Bytes::new(24), Alignment::new(8)), second);
    }

    #[test]
    fn deallocate_all_starts_over() {
        let mut buf = Aligned([0u8; 128]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        let first = alloc.allocate(Bytes::new(100), Alignment::ONE);
        unsafe { alloc.deallocate(first, Alignment::ONE) };
        assert!(alloc.allocate(Bytes::new(100), Alignment::ONE).is_empty());
        unsafe { alloc.deallocate_all() };
        assert_eq!(alloc.allocate(Bytes::new(100), Alignment::ONE), first);
    }

    #[test]
    fn ownership_is_a_range_check() {
        let mut buf = Aligned([0u8; 32]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        let span = alloc.allocate(Bytes::new(8), Alignment::ONE);
        assert!(alloc.owns(span.into()));
        let mut other = [0u8; 8];
        assert!(!alloc.owns(ByteSpan::from_slice(&mut other)));
    }

    #[test]
    fn zero_sized_requests_yield_the_empty_span() {
        let mut buf = Aligned([0u8; 32]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        assert!(alloc.allocate(Bytes::ZERO, Alignment::new(16)).is_empty());
        assert_eq!(alloc.used(), Bytes::ZERO);
    }

    #[test]
    fn deallocating_a_zero_sized_block_is_a_nop() {
        let mut buf = Aligned([0u8; 32]);
        let alloc = LinearAllocator::in_buffer(&mut buf.0);
        alloc.allocate(Bytes::new(8), Alignment::ONE);
        let empty = alloc.allocate(Bytes::ZERO, Alignment::ONE);
        unsafe { alloc.deallocate(empty, Alignment::ONE) };
        assert_eq!(alloc.used(), Bytes::new(8));
    }

    #[test]
    fn mapped_allocator_is_page_backed() {
        let alloc = LinearAllocator::new(Bytes::new(1000)).unwrap();
        assert!(alloc.capacity() >= Bytes::new(1000));
        let span = alloc.allocate(Bytes::new(1000), Alignment::new(4096));
        assert!(!span.is_empty());
        unsafe { span.as_mut_slice() }.fill(0x5a);
    }
}
