//! Composable allocators that hand out raw byte spans.
//!
//! Every allocator implements [`Allocator`]; some can also tell whether they
//! [`Owns`] a block, drop everything at once ([`DeallocateAll`]), or roll back
//! to a checkpoint ([`Rewind`]). Building blocks stack on top of each other:
//!
//! ```plaintext
//!   ScopeAllocator            typed objects, destructors run on exit
//!        |
//!   FallbackAllocator ---------------------+
//!        |                                 |
//!   PoolAllocator   (fixed max size)   HeapAllocator
//!        |
//!   LinearAllocator / BlockAllocator   (mmap'd regions)
//! ```
//!
//! Running out of memory is never a panic at this layer: `allocate()` returns
//! an empty span, and it's up to the caller (or a [`FallbackAllocator`]) to
//! try somewhere else.
//!
//! [`FallbackAllocator`]: alloc::compose::FallbackAllocator

pub mod alloc;
pub mod config;
pub mod os;
pub mod serialize;
pub mod span;
pub mod units;
mod util;

pub use alloc::{AllocError, Allocator, DeallocateAll, NullAllocator, Owns, Rewind};
pub use span::{ByteSpan, RWByteSpan};
pub use units::{Address, Alignment, Bytes};
