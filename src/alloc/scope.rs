//! Typed objects on top of a rewindable allocator, torn down all at once.
//!
//! A [`ScopeAllocator`] snapshots its upstream when it is created. Objects
//! made through it live until the scope is dropped, at which point their
//! destructors run newest-first and the upstream is rewound to the snapshot,
//! so every byte comes back in one go however many objects there were.
//!
//! Objects that need dropping carry a `Finalizer` record right in front of
//! them:
//!
//! ```plaintext
//! | padding | Finalizer { drop_fn, object, next } | T |
//!                                                 ^ aligned for T
//! ```
//!
//! The records form a singly linked list, newest at the head.
//!
//! Scopes sharing an upstream must be dropped in the reverse order they were
//! created. Rewinding an outer scope while an inner one is alive pulls the
//! inner one's memory out from under it.

use std::{cell::Cell, fmt, marker::PhantomData, mem, ptr};

use log::trace;

use crate::{
    alloc::{AllocError, Allocator, Rewind},
    span::RWByteSpan,
    units::{Alignment, Bytes},
    util::num::round_up_pow2,
};

#[repr(C)]
struct Finalizer {
    drop_fn: unsafe fn(*mut u8),
    object: *mut u8,
    next: *mut Finalizer,
}

unsafe fn drop_object<T>(object: *mut u8) {
    unsafe { ptr::drop_in_place(object as *mut T) }
}

/// See the [module docs](self).
pub struct ScopeAllocator<'a, A>
where
    A: Allocator + Rewind,
{
    upstream: &'a A,
    state: A::State,
    finalizers: Cell<*mut Finalizer>,
    objects: Cell<usize>,
    finalizer_count: Cell<usize>,
    _invariant: PhantomData<Cell<&'a ()>>,
}

impl<'a, A> ScopeAllocator<'a, A>
where
    A: Allocator + Rewind,
{
    pub fn new(upstream: &'a A) -> Self {
        Self {
            upstream,
            state: upstream.save_state(),
            finalizers: Cell::new(ptr::null_mut()),
            objects: Cell::new(0),
            finalizer_count: Cell::new(0),
            _invariant: PhantomData,
        }
    }

    pub fn upstream(&self) -> &'a A {
        self.upstream
    }

    /// The upstream state this scope rewinds to
    pub fn saved_state(&self) -> A::State {
        self.state
    }

    /// Objects created through this scope
    pub fn object_count(&self) -> usize {
        self.objects.get()
    }

    /// Objects that will have their destructor run
    pub fn finalizer_count(&self) -> usize {
        self.finalizer_count.get()
    }

    /// Move `value` into the scope. On failure `value` is dropped.
    #[allow(clippy::mut_from_ref)]
    pub fn new_object<T: 'a>(&self, value: T) -> Result<&mut T, AllocError> {
        self.aligned_new(Alignment::of::<T>(), value)
    }

    /// Move `value` into the scope at an address aligned to `alignment` (or
    /// `T`'s own alignment, if that is stricter). On failure `value` is
    /// dropped.
    #[allow(clippy::mut_from_ref)]
    pub fn aligned_new<T: 'a>(&self, alignment: Alignment, value: T) -> Result<&mut T, AllocError> {
        let alignment = alignment.max(Alignment::of::<T>());
        trace!(
            "scope {:p}: new {} ({}, {alignment})",
            self,
            tynm::type_name::<T>(),
            Bytes::of::<T>()
        );
        let object = if mem::needs_drop::<T>() {
            self.place_with_finalizer::<T>(alignment)?
        } else {
            self.place::<T>(alignment)?
        };
        self.objects.set(self.objects.get() + 1);
        // SAFETY: `object` is a fresh, suitably sized and aligned block that
        // lives until the scope is dropped, and `&self` ties the reference to
        // the scope
        unsafe {
            object.write(value);
            Ok(&mut *object)
        }
    }

    /// Raw scratch bytes, reclaimed when the scope is dropped
    pub fn allocate_bytes(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        self.upstream.allocate(size, alignment)
    }

    fn place<T>(&self, alignment: Alignment) -> Result<*mut T, AllocError> {
        // Zero-sized types still get a distinct address
        let size = Bytes::of::<T>().max(Bytes::new(1));
        let block = self.upstream.allocate(size, alignment);
        if block.is_empty() {
            return Err(AllocError { size, alignment });
        }
        Ok(block.as_ptr() as *mut T)
    }

    fn place_with_finalizer<T>(&self, alignment: Alignment) -> Result<*mut T, AllocError> {
        let block_alignment = alignment.max(Alignment::of::<Finalizer>());
        let header = round_up_pow2(mem::size_of::<Finalizer>(), block_alignment.get());
        let size = Bytes::new(header) + Bytes::of::<T>();
        let block = self.upstream.allocate(size, block_alignment);
        if block.is_empty() {
            return Err(AllocError {
                size,
                alignment: block_alignment,
            });
        }
        let object = block.begin().add(Bytes::new(header));
        let finalizer = object.sub(Bytes::of::<Finalizer>()).cast::<Finalizer>();
        debug_assert!(object.is_aligned_to(alignment));
        // SAFETY: `header >= size_of::<Finalizer>()`, and `object` is aligned
        // to at least `Finalizer`'s alignment, so is `object - sizeof`
        unsafe {
            finalizer.write(Finalizer {
                drop_fn: drop_object::<T>,
                object: object.as_ptr(),
                next: self.finalizers.get(),
            })
        };
        self.finalizers.set(finalizer);
        self.finalizer_count.set(self.finalizer_count.get() + 1);
        Ok(object.cast::<T>())
    }
}

/// Rewinds the upstream when dropped, even while unwinding out of a
/// panicking destructor. Objects not yet finalized at that point leak.
struct RewindOnDrop<'s, A: Rewind> {
    upstream: &'s A,
    state: A::State,
}

impl<A: Rewind> Drop for RewindOnDrop<'_, A> {
    fn drop(&mut self) {
        // SAFETY: the state came from this upstream when the scope was made,
        // and every reference into the scope is gone now that it is dropped
        unsafe { self.upstream.restore_state(self.state) };
    }
}

impl<A> Drop for ScopeAllocator<'_, A>
where
    A: Allocator + Rewind,
{
    fn drop(&mut self) {
        trace!(
            "scope {:p}: finalizing {} of {} objects",
            self,
            self.finalizer_count.get(),
            self.objects.get()
        );
        let _rewind = RewindOnDrop {
            upstream: self.upstream,
            state: self.state,
        };
        let mut cursor = self.finalizers.replace(ptr::null_mut());
        while !cursor.is_null() {
            // SAFETY: every record in the list was written by
            // `place_with_finalizer()` in front of a live object, and is
            // visited exactly once
            unsafe {
                let finalizer = cursor.read();
                cursor = finalizer.next;
                (finalizer.drop_fn)(finalizer.object);
            }
        }
    }
}

/// Scopes nest: raw allocations go to the upstream, and are reclaimed with the
/// scope's rewind, so `deallocate()` is a nop.
impl<A> Allocator for ScopeAllocator<'_, A>
where
    A: Allocator + Rewind,
{
    fn allocate(&self, size: Bytes, alignment: Alignment) -> RWByteSpan {
        self.allocate_bytes(size, alignment)
    }

    unsafe fn deallocate(&self, _: RWByteSpan, _: Alignment) {}
}

impl<A> Rewind for ScopeAllocator<'_, A>
where
    A: Allocator + Rewind,
{
    type State = A::State;

    fn save_state(&self) -> A::State {
        self.upstream.save_state()
    }

    unsafe fn restore_state(&self, state: A::State) {
        unsafe { self.upstream.restore_state(state) }
    }
}

impl<A> fmt::Debug for ScopeAllocator<'_, A>
where
    A: Allocator + Rewind,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopeAllocator")
            .field("state", &self.state)
            .field("objects", &self.objects.get())
            .field("finalizers", &self.finalizer_count.get())
            .finish()
    }
}
