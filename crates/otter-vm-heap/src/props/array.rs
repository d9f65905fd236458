//! Array items density checks

use super::PropPolicy;
use crate::ptr::PtrRepr;
use crate::value::TaggedValue;

/// Fast check when writing `arr_idx` past an items part of `old_size`.
///
/// Assumes the current items are dense; only a write that grows the part by
/// more than `fast_resize_limit/8` of its size, on an array large enough to
/// matter, needs the full density scan.
pub fn abandon_slow_check_required(policy: &PropPolicy, arr_idx: u32, old_size: u32) -> bool {
    let new_size_min = u64::from(arr_idx) + 1;
    new_size_min >= u64::from(policy.array_abandon_min_size)
        && u64::from(arr_idx) > u64::from(policy.array_fast_resize_limit) * ((u64::from(old_size) + 7) >> 3)
}

/// Density check: abandon if fewer than `abandon_limit/8` of `a_size` slots
/// would be used
pub fn abandon_density_check(policy: &PropPolicy, a_used: u32, a_size: u32) -> bool {
    a_size >= 256 && u64::from(a_used) < u64::from(policy.array_abandon_limit) * u64::from(a_size >> 3)
}

/// Used item count and minimum size (highest used index + 1)
pub(crate) fn items_stats<P: PtrRepr>(items: &[TaggedValue<P>]) -> (u32, u32) {
    let mut used = 0u32;
    let mut min_size = 0u32;
    for (i, v) in items.iter().enumerate() {
        if !v.is_unused() {
            used += 1;
            min_size = i as u32 + 1;
        }
    }
    (used, min_size)
}
