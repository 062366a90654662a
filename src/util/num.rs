/// Round up `n` to the nearest multiple of `to`
pub const fn round_up(n: usize, to: usize) -> usize {
    to * n.div_ceil(to)
}

/// Round up `n` to the nearest multiple of `align`, which must be a power of
/// two. Cheaper than [`round_up()`], since it's just a mask.
pub const fn round_up_pow2(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Round down `n` to the nearest multiple of `align` (a power of two)
pub const fn round_down_pow2(n: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    n & !(align - 1)
}
