//! Trying allocators in order.
//!
//! Both combinators route deallocation by asking members whether they
//! [`Owns`] the block, in the same order allocation tried them. That makes
//! `owns()` part of every deallocation, so keep it cheap.

use crate::{
    alloc::{Allocator, DeallocateAll, NullAllocator, Owns},
    span::{ByteSpan, RWByteSpan},
    units::{Alignment, Bytes},
};

/// Allocate from `P`, and from `F` whenever `P` fails
#[derive(Debug, Default)]
pub struct FallbackAllocator<P, F> {
    primary: P,
    fallback: F,
}

impl<P, F> FallbackAllocator<P, F> {
    pub const fn new(primary: P, fallback: F) -> Self {
        Self { primary, fallback }
    }

    pub fn primary(&self) -> &P {
        &self.primary
    }

    pub fn fallback(&self) -> &F {
        &self.fallback
    }

    pub fn into_inner(self) -> (P, F) {
        (self.primary, self.fallback)
    }
}

impl<P, F> Allocator for FallbackAllocator<P, F>
where
    P: Allocator + Owns,
    F: Allocator,
{
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        let block = self.primary.allocate(size, alignment);
        if !block.is_empty() {
            return block;
        }
        self.fallback.allocate(size, alignment)
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        // SAFETY: forwarded to whichever member produced the block
        unsafe {
            if self.primary.owns(block.into()) {
                self.primary.deallocate(block, alignment)
            } else {
                self.fallback.deallocate(block, alignment)
            }
        }
    }
}

impl<P: Owns, F: Owns> Owns for FallbackAllocator<P, F> {
    fn owns(&self, block: ByteSpan) -> bool {
        self.primary.owns(block) || self.fallback.owns(block)
    }
}

impl<P: DeallocateAll, F: DeallocateAll> DeallocateAll for FallbackAllocator<P, F> {
    unsafe fn deallocate_all(&self) {
        unsafe {
            self.primary.deallocate_all();
            self.fallback.deallocate_all();
        }
    }
}

/// A compile-time list of allocators, tried head first. The list ends in
/// [`NullAllocator`]; build one with [`chain!`](crate::chain).
#[derive(Debug, Default)]
pub struct ChainAllocator<H, T = NullAllocator> {
    head: H,
    tail: T,
}

impl<H, T> ChainAllocator<H, T> {
    pub const fn new(head: H, tail: T) -> Self {
        Self { head, tail }
    }

    pub fn head(&self) -> &H {
        &self.head
    }

    pub fn tail(&self) -> &T {
        &self.tail
    }
}

impl<H, T> Allocator for ChainAllocator<H, T>
where
    H: Allocator + Owns,
    T: Allocator + Owns,
{
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        let block = self.head.allocate(size, alignment);
        if !block.is_empty() {
            return block;
        }
        self.tail.allocate(size, alignment)
    }

    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
        // SAFETY: forwarded to the first member that owns the block; if none
        // does, `NullAllocator` at the end flags the contract violation
        unsafe {
            if self.head.owns(block.into()) {
                self.head.deallocate(block, alignment)
            } else {
                self.tail.deallocate(block, alignment)
            }
        }
    }
}

impl<H: Owns, T: Owns> Owns for ChainAllocator<H, T> {
    fn owns(&self, block: ByteSpan) -> bool {
        self.head.owns(block) || self.tail.owns(block)
    }
}

impl<H: DeallocateAll, T: DeallocateAll> DeallocateAll for ChainAllocator<H, T> {
    unsafe fn deallocate_all(&self) {
        unsafe {
            self.head.deallocate_all();
            self.tail.deallocate_all();
        }
    }
}

/// Build a [`ChainAllocator`] from a list of allocators, tried left to right.
///
/// ```
/// use allocstack::{alloc::{linear::LinearAllocator, Allocator}, chain, units::{Alignment, Bytes}};
///
/// let mut small = [0u8; 64];
/// let mut big = [0u8; 1024];
/// let alloc = chain![
///     LinearAllocator::in_buffer(&mut small),
///     LinearAllocator::in_buffer(&mut big),
/// ];
/// let block = alloc.allocate(Bytes::new(100), Alignment::ONE);
/// assert!(alloc.tail().head().range().contains(&block.into()));
/// ```
#[macro_export]
macro_rules! chain {
    () => {
        $crate::alloc::NullAllocator
    };
    ($head:expr $(, $tail:expr)* $(,)?) => {
        $crate::alloc::compose::ChainAllocator::new($head, $crate::chain!($($tail),*))
    };
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;
    use crate::alloc::{global::HeapAllocator, linear::LinearAllocator};

    /// Fails every request, but counts them
    #[derive(Default)]
    struct Refusing {
        asked: Cell<usize>,
    }

    impl Allocator for Refusing {
        fn allocate(&self, _: Bytes, _: Alignment) -> RWByteSpan {
            self.asked.set(self.asked.get() + 1);
            RWByteSpan::EMPTY
        }

        unsafe fn deallocate(&self, _: RWByteSpan, _: Alignment) {
            panic!("Refusing never hands anything out");
        }
    }

    impl Owns for Refusing {
        fn owns(&self, _: ByteSpan) -> bool {
            false
        }
    }

    #[repr(C, align(64))]
    struct Aligned([u8; 256]);

    #[test]
    fn failing_primary_gives_exactly_the_fallback_result() {
        let mut a = Aligned([0u8; 256]);
        let mut b = Aligned([0u8; 256]);
        let reference = LinearAllocator::in_buffer(&mut a.0);
        let composed =
            FallbackAllocator::new(Refusing::default(), LinearAllocator::in_buffer(&mut b.0));
        for (size, align) in [(8, 8), (3, 1), (40, 32), (1, 64)] {
            let expected = reference.allocate(Bytes::new(size), Alignment::new(align));
            let got = composed.allocate(Bytes::new(size), Alignment::new(align));
            // Same offsets within two identically aligned buffers
            assert_eq!(
                got.begin().offset_from(composed.fallback().range().begin()),
                expected.begin().offset_from(reference.range().begin())
            );
            assert_eq!(got.len(), expected.len());
        }
        assert_eq!(composed.primary().asked.get(), 4);
    }

    #[test]
    fn fallback_kicks_in_on_exhaustion_and_routes_frees() {
        let mut small = [0u8; 32];
        let alloc = FallbackAllocator::new(LinearAllocator::in_buffer(&mut small), HeapAllocator);
        let a = alloc.allocate(Bytes::new(24), Alignment::ONE);
        let b = alloc.allocate(Bytes::new(24), Alignment::ONE);
        assert!(alloc.primary().owns(a.into()));
        assert!(!alloc.primary().owns(b.into()));
        unsafe {
            alloc.deallocate(b, Alignment::ONE);
            alloc.deallocate(a, Alignment::ONE);
        }
    }

    #[test]
    fn chain_tries_left_to_right() {
        let mut x = [0u8; 16];
        let mut y = [0u8; 64];
        let mut z = [0u8; 256];
        let alloc = chain![
            LinearAllocator::in_buffer(&mut x),
            LinearAllocator::in_buffer(&mut y),
            LinearAllocator::in_buffer(&mut z),
        ];
        let small = alloc.allocate(Bytes::new(16), Alignment::ONE);
        let medium = alloc.allocate(Bytes::new(50), Alignment::ONE);
        let large = alloc.allocate(Bytes::new(200), Alignment::ONE);
        assert!(alloc.head().owns(small.into()));
        assert!(alloc.tail().head().owns(medium.into()));
        assert!(alloc.tail().tail().head().owns(large.into()));
        assert!(alloc.allocate(Bytes::new(100), Alignment::ONE).is_empty());
        assert!(alloc.owns(large.into()));
        unsafe {
            alloc.deallocate(large, Alignment::ONE);
            alloc.deallocate_all();
        }
        assert!(!alloc.allocate(Bytes::new(16), Alignment::ONE).is_empty());
    }

    #[test]
    fn empty_chain_is_the_null_allocator() {
        let alloc: NullAllocator = chain![];
        assert!(alloc.allocate(Bytes::new(1), Alignment::ONE).is_empty());
    }
}
