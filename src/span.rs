//! Non-owning views over `[begin, end)` byte ranges.
//!
//! [`RWByteSpan`] is what allocators hand out. It narrows into a read-only
//! [`ByteSpan`] for ownership queries, but nothing widens a [`ByteSpan`] back
//! into a [`RWByteSpan`].
//!
//! An empty span (`begin == end`) doubles as the "no allocation" sentinel, so
//! check [`RWByteSpan::is_empty()`] before touching the bytes.

use std::{fmt, ptr, slice};

use crate::units::{Address, Alignment, Bytes};

/// A read-only byte range
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ByteSpan {
    begin: *const u8,
    end: *const u8,
}

/// A read/write byte range
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RWByteSpan {
    begin: *mut u8,
    end: *mut u8,
}

impl ByteSpan {
    pub const EMPTY: ByteSpan = ByteSpan {
        begin: ptr::null(),
        end: ptr::null(),
    };

    /// # Panics
    /// - In debug mode if `begin > end`
    pub fn new(begin: *const u8, end: *const u8) -> Self {
        debug_assert!(begin <= end, "span begins after it ends");
        Self { begin, end }
    }

    pub fn from_raw_parts(begin: *const u8, len: Bytes) -> Self {
        Self {
            begin,
            end: begin.wrapping_add(len.get()),
        }
    }

    pub fn from_slice(bytes: &[u8]) -> Self {
        Self::from_raw_parts(bytes.as_ptr(), Bytes::new(bytes.len()))
    }

    pub fn begin(&self) -> Address {
        Address::new(self.begin as *mut u8)
    }

    pub fn end(&self) -> Address {
        Address::new(self.end as *mut u8)
    }

    pub fn len(&self) -> Bytes {
        Bytes::new(self.end as usize - self.begin as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// Does `other` lie entirely within this span? An empty `other` is
    /// contained only if its `begin` falls within `[begin, end]`.
    pub fn contains(&self, other: &ByteSpan) -> bool {
        self.begin <= other.begin && other.end <= self.end
    }

    /// Does `addr` lie within `[begin, end)`?
    pub fn contains_address(&self, addr: Address) -> bool {
        let addr = addr.as_ptr() as *const u8;
        self.begin <= addr && addr < self.end
    }

    pub fn is_aligned_to(&self, align: Alignment) -> bool {
        self.begin().is_aligned_to(align)
    }

    /// # Safety
    ///
    /// The span must describe initialized memory that stays valid and is not
    /// written to for the lifetime `'a`.
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.is_empty() {
            return &[];
        }
        unsafe { slice::from_raw_parts(self.begin, self.len().get()) }
    }
}

impl RWByteSpan {
    pub const EMPTY: RWByteSpan = RWByteSpan {
        begin: ptr::null_mut(),
        end: ptr::null_mut(),
    };

    /// # Panics
    /// - In debug mode if `begin > end`
    pub fn new(begin: *mut u8, end: *mut u8) -> Self {
        debug_assert!(begin <= end, "span begins after it ends");
        Self { begin, end }
    }

    pub fn from_raw_parts(begin: *mut u8, len: Bytes) -> Self {
        Self {
            begin,
            end: begin.wrapping_add(len.get()),
        }
    }

    pub fn from_address(begin: Address, len: Bytes) -> Self {
        Self::from_raw_parts(begin.as_ptr(), len)
    }

    pub fn from_slice(bytes: &mut [u8]) -> Self {
        Self::from_raw_parts(bytes.as_mut_ptr(), Bytes::new(bytes.len()))
    }

    pub fn begin(&self) -> Address {
        Address::new(self.begin)
    }

    pub fn end(&self) -> Address {
        Address::new(self.end)
    }

    pub const fn as_ptr(&self) -> *mut u8 {
        self.begin
    }

    pub fn len(&self) -> Bytes {
        Bytes::new(self.end as usize - self.begin as usize)
    }

    pub fn is_empty(&self) -> bool {
        self.begin == self.end
    }

    /// `Some(self)` if this span is a real allocation
    pub fn non_empty(self) -> Option<Self> {
        (!self.is_empty()).then_some(self)
    }

    pub fn as_read_only(&self) -> ByteSpan {
        ByteSpan {
            begin: self.begin,
            end: self.end,
        }
    }

    pub fn contains(&self, other: &ByteSpan) -> bool {
        self.as_read_only().contains(other)
    }

    pub fn is_aligned_to(&self, align: Alignment) -> bool {
        self.begin().is_aligned_to(align)
    }

    /// # Safety
    ///
    /// The span must describe memory that is valid for reads and writes and
    /// not aliased by any other reference for the lifetime `'a`. The bytes
    /// may be uninitialized, so only write through the result until they are
    /// not.
    pub unsafe fn as_mut_slice<'a>(&self) -> &'a mut [u8] {
        if self.is_empty() {
            return &mut [];
        }
        unsafe { slice::from_raw_parts_mut(self.begin, self.len().get()) }
    }
}

impl Default for ByteSpan {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl Default for RWByteSpan {
    fn default() -> Self {
        Self::EMPTY
    }
}

impl From<RWByteSpan> for ByteSpan {
    fn from(span: RWByteSpan) -> Self {
        span.as_read_only()
    }
}

impl fmt::Debug for ByteSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ByteSpan[{:?}, {:?})", self.begin(), self.end())
    }
}

impl fmt::Debug for RWByteSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RWByteSpan[{:?}, {:?})", self.begin(), self.end())
    }
}
