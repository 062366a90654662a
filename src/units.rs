//! Strongly typed sizes, alignments and addresses.
//!
//! None of these convert implicitly into each other. Moving between a
//! [`Bytes`] and a raw `usize`, or between an [`Address`] and a pointer, is
//! always spelled out.

use std::{
    fmt,
    mem,
    ops::{Add, AddAssign, Mul, Sub, SubAssign},
    ptr,
};

use serde::{Deserialize, Serialize};

use crate::util::num::{round_down_pow2, round_up_pow2};

/// A count of bytes.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Bytes(usize);

impl Bytes {
    pub const ZERO: Bytes = Bytes(0);

    pub const fn new(n: usize) -> Self {
        Self(n)
    }

    /// `n` KiB
    pub const fn kib(n: usize) -> Self {
        Self(n * 1024)
    }

    /// `n` MiB
    pub const fn mib(n: usize) -> Self {
        Self(n * 1024 * 1024)
    }

    /// The size of a `T`
    pub const fn of<T>() -> Self {
        Self(mem::size_of::<T>())
    }

    pub const fn get(self) -> usize {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// Round up to the next multiple of `align`
    pub const fn round_up(self, align: Alignment) -> Self {
        Self(round_up_pow2(self.0, align.get()))
    }

    /// Round down to the previous multiple of `align`
    pub const fn round_down(self, align: Alignment) -> Self {
        Self(round_down_pow2(self.0, align.get()))
    }

    pub fn checked_add(self, rhs: Bytes) -> Option<Self> {
        self.0.checked_add(rhs.0).map(Self)
    }

    pub fn checked_sub(self, rhs: Bytes) -> Option<Self> {
        self.0.checked_sub(rhs.0).map(Self)
    }

    pub fn saturating_sub(self, rhs: Bytes) -> Self {
        Self(self.0.saturating_sub(rhs.0))
    }
}

impl From<usize> for Bytes {
    fn from(n: usize) -> Self {
        Self(n)
    }
}

impl From<Bytes> for usize {
    fn from(bytes: Bytes) -> Self {
        bytes.0
    }
}

impl Add for Bytes {
    type Output = Bytes;

    fn add(self, rhs: Bytes) -> Bytes {
        Bytes(self.0 + rhs.0)
    }
}

impl AddAssign for Bytes {
    fn add_assign(&mut self, rhs: Bytes) {
        self.0 += rhs.0;
    }
}

impl Sub for Bytes {
    type Output = Bytes;

    fn sub(self, rhs: Bytes) -> Bytes {
        Bytes(self.0 - rhs.0)
    }
}

impl SubAssign for Bytes {
    fn sub_assign(&mut self, rhs: Bytes) {
        self.0 -= rhs.0;
    }
}

impl Mul<usize> for Bytes {
    type Output = Bytes;

    fn mul(self, rhs: usize) -> Bytes {
        Bytes(self.0 * rhs)
    }
}

impl fmt::Display for Bytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}B", self.0)
    }
}

/// A power-of-two byte boundary.
///
/// The power-of-two invariant is checked on construction and never silently
/// corrected: [`Alignment::new()`] panics on a bad value and
/// [`Alignment::try_new()`] returns `None`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct Alignment(usize);

impl Alignment {
    /// No constraint at all
    pub const ONE: Alignment = Alignment(1);

    /// What the system `malloc()` guarantees: two machine words
    pub const DEFAULT: Alignment = Alignment(2 * mem::size_of::<usize>());

    /// # Panics
    /// - If `value` is not a power of two
    pub const fn new(value: usize) -> Self {
        assert!(value.is_power_of_two(), "alignment must be a power of two");
        Self(value)
    }

    pub const fn try_new(value: usize) -> Option<Self> {
        if value.is_power_of_two() {
            Some(Self(value))
        } else {
            None
        }
    }

    /// The alignment of a `T`
    pub const fn of<T>() -> Self {
        Self(mem::align_of::<T>())
    }

    pub const fn get(self) -> usize {
        self.0
    }

    /// `log2(self)`
    pub const fn log2(self) -> u32 {
        self.0.trailing_zeros()
    }

    /// # Panics
    /// - If doubling would overflow
    pub const fn double(self) -> Self {
        Self::new(self.0 << 1)
    }

    /// Halve this alignment. [`Alignment::ONE`] stays [`Alignment::ONE`].
    pub const fn half(self) -> Self {
        if self.0 == 1 {
            self
        } else {
            Self(self.0 >> 1)
        }
    }

    pub const fn max(self, other: Alignment) -> Self {
        if self.0 >= other.0 {
            self
        } else {
            other
        }
    }

    /// The smallest address `>= addr` that satisfies this alignment
    pub fn round_up(self, addr: Address) -> Address {
        addr.align_up(self)
    }

    /// The largest address `<= addr` that satisfies this alignment
    pub fn round_down(self, addr: Address) -> Address {
        addr.align_down(self)
    }

    pub fn is_aligned(self, addr: Address) -> bool {
        addr.is_aligned_to(self)
    }

    /// View this alignment as a byte count
    pub const fn as_bytes(self) -> Bytes {
        Bytes(self.0)
    }
}

impl Default for Alignment {
    fn default() -> Self {
        Self::ONE
    }
}

impl TryFrom<usize> for Alignment {
    type Error = InvalidAlignment;

    fn try_from(value: usize) -> Result<Self, Self::Error> {
        Self::try_new(value).ok_or(InvalidAlignment(value))
    }
}

impl From<Alignment> for usize {
    fn from(align: Alignment) -> Self {
        align.0
    }
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "align({})", self.0)
    }
}

/// A value that was supposed to be an [`Alignment`] but is not a power of two
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct InvalidAlignment(pub usize);

impl fmt::Display for InvalidAlignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} is not a power of two", self.0)
    }
}

impl std::error::Error for InvalidAlignment {}

/// A raw byte address.
///
/// Arithmetic is in [`Bytes`] and always goes through wrapping pointer
/// operations, so an `Address` derived from an allocation keeps that
/// allocation's provenance.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address(*mut u8);

impl Address {
    pub const NULL: Address = Address(ptr::null_mut());

    pub const fn new(ptr: *mut u8) -> Self {
        Self(ptr)
    }

    pub fn from_ref<T>(value: &T) -> Self {
        Self(value as *const T as *mut u8)
    }

    pub const fn as_ptr(self) -> *mut u8 {
        self.0
    }

    pub const fn cast<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// The numeric value of this address
    pub fn addr(self) -> usize {
        self.0 as usize
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }

    pub fn add(self, n: Bytes) -> Self {
        Self(self.0.wrapping_add(n.get()))
    }

    pub fn sub(self, n: Bytes) -> Self {
        Self(self.0.wrapping_sub(n.get()))
    }

    /// `self - origin`, in bytes
    ///
    /// # Panics
    /// - In debug mode if `origin > self`
    pub fn offset_from(self, origin: Address) -> Bytes {
        debug_assert!(origin <= self, "offset_from() with origin past self");
        Bytes::new(self.addr() - origin.addr())
    }

    pub fn align_up(self, align: Alignment) -> Self {
        let delta = round_up_pow2(self.addr(), align.get()) - self.addr();
        Self(self.0.wrapping_add(delta))
    }

    pub fn align_down(self, align: Alignment) -> Self {
        let delta = self.addr() - round_down_pow2(self.addr(), align.get());
        Self(self.0.wrapping_sub(delta))
    }

    pub fn is_aligned_to(self, align: Alignment) -> bool {
        self.addr() & (align.get() - 1) == 0
    }
}

impl<T> From<*mut T> for Address {
    fn from(ptr: *mut T) -> Self {
        Self(ptr as *mut u8)
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.addr())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
