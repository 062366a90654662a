//! The allocator capability traits, and every allocator in this crate.
//!
//! Every allocator takes `&self`. State lives in `Cell`s and `RefCell`s, so no
//! allocator here is `Sync`: share one between threads and the compiler will
//! stop you.

use std::{fmt, rc::Rc};

use crate::{
    span::{ByteSpan, RWByteSpan},
    units::{Alignment, Bytes},
};

pub mod block;
pub mod compose;
pub mod counting;
pub mod dlmalloc;
pub mod global;
pub mod linear;
pub mod pool;
pub mod scope;
pub mod tracing;

/// Something that hands out byte ranges.
///
/// `allocate()` never panics on exhaustion and never returns a block smaller
/// than requested: it returns [`RWByteSpan::EMPTY`] instead. A zero-byte
/// request also yields the empty span, which there is nothing to deallocate.
pub trait Allocator {
    /// Allocate `size` bytes whose first byte satisfies `alignment`.
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan;

    /// Give a block back.
    ///
    /// # Safety
    ///
    /// `block` must have been returned by `allocate()` on this same allocator
    /// with this same `alignment`, and not already deallocated (or reclaimed
    /// by a rewind). Nothing may use the bytes afterwards.
    unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment);
}

/// An allocator that can tell whether a block came from it.
pub trait Owns {
    /// Pure query: no side effects
    fn owns(&self, block: ByteSpan) -> bool;
}

/// An allocator that can reclaim every outstanding block at once.
pub trait DeallocateAll {
    /// # Safety
    ///
    /// Every block handed out so far becomes invalid. Nothing may use them
    /// afterwards.
    unsafe fn deallocate_all(&self);
}

/// An allocator whose whole state can be captured and later restored.
pub trait Rewind {
    type State: Copy + Eq + fmt::Debug;

    fn save_state(&self) -> Self::State;

    /// Go back to `state`, reclaiming everything allocated since it was saved.
    ///
    /// # Safety
    ///
    /// `state` must come from `save_state()` on this allocator and must not
    /// be "in the future" (states are a stack). Every block allocated after
    /// `state` was saved becomes invalid.
    unsafe fn restore_state(&self, state: Self::State);
}

/// Returned by the typed layers when a request can't be satisfied.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AllocError {
    pub size: Bytes,
    pub alignment: Alignment,
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "could not allocate {} with {}",
            self.size, self.alignment
        )
    }
}

impl std::error::Error for AllocError {}

/// Always fails and owns nothing. Terminates allocator chains.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullAllocator;

impl Allocator for NullAllocator {
    fn allocate(&self, _: Bytes, _: Alignment) -> RWByteSpan {
        RWByteSpan::EMPTY
    }

    unsafe fn deallocate(&self, block: RWByteSpan, _: Alignment) {
        debug_assert!(
            block.is_empty(),
            "no allocator in the chain owns {block:?}"
        );
    }
}

impl Owns for NullAllocator {
    fn owns(&self, _: ByteSpan) -> bool {
        false
    }
}

impl DeallocateAll for NullAllocator {
    unsafe fn deallocate_all(&self) {}
}

macro_rules! forward_through {
    ($(<$($lt:lifetime),*> $ptr:ty),* $(,)?) => {$(
        impl<$($lt,)* A: Allocator + ?Sized> Allocator for $ptr {
            fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
                (**self).allocate(size, alignment)
            }

            unsafe fn deallocate(&self, block: RWByteSpan, alignment: Alignment) {
                unsafe { (**self).deallocate(block, alignment) }
            }
        }

        impl<$($lt,)* A: Owns + ?Sized> Owns for $ptr {
            fn owns(&self, block: ByteSpan) -> bool {
                (**self).owns(block)
            }
        }

        impl<$($lt,)* A: DeallocateAll + ?Sized> DeallocateAll for $ptr {
            unsafe fn deallocate_all(&self) {
                unsafe { (**self).deallocate_all() }
            }
        }

        impl<$($lt,)* A: Rewind + ?Sized> Rewind for $ptr {
            type State = A::State;

            fn save_state(&self) -> A::State {
                (**self).save_state()
            }

            unsafe fn restore_state(&self, state: A::State) {
                unsafe { (**self).restore_state(state) }
            }
        }
    )*};
}

forward_through!(<'a> &'a A, <> Box<A>, <> Rc<A>);

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Installs `env_logger` once per test binary
    pub(crate) fn init_logging() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    #[test]
    fn null_allocator_always_fails() {
        let null = NullAllocator;
        assert!(null.allocate(Bytes::new(1), Alignment::ONE).is_empty());
        assert!(null.allocate(Bytes::ZERO, Alignment::ONE).is_empty());
        assert!(!null.owns(ByteSpan::EMPTY));
    }

    #[test]
    fn trait_objects_forward() {
        let boxed: Box<dyn Allocator> = Box::new(NullAllocator);
        assert!(boxed.allocate(Bytes::new(8), Alignment::DEFAULT).is_empty());
        let by_ref: &dyn Allocator = &NullAllocator;
        assert!(by_ref.allocate(Bytes::new(8), Alignment::DEFAULT).is_empty());
    }
}
