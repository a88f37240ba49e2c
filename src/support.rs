//! Small free-standing helpers shared across the crate.

use std::time::{SystemTime, UNIX_EPOCH};

/// True iff `n` is a non-zero power of two.
#[inline]
pub fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Round `value` up to the next multiple of `align`.
///
/// `align` must be a power of two (checked in debug builds only; callers
/// validate alignment at the API boundary).
#[inline]
pub fn aligned(value: u64, align: u64) -> u64 {
    debug_assert!(is_power_of_two(align), "alignment must be a power of two");
    (value + align - 1) & !(align - 1)
}

/// Milliseconds since the Unix epoch, for trailer timestamps.
pub fn milliseconds_since_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_is_power_of_two() {
        assert!(!is_power_of_two(0));
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(!is_power_of_two(3));
        assert!(is_power_of_two(4096));
        assert!(is_power_of_two(1 << 63));
        assert!(!is_power_of_two(u64::MAX));
    }

    #[test]
    fn test_aligned() {
        assert_eq!(aligned(0, 8), 0);
        assert_eq!(aligned(1, 8), 8);
        assert_eq!(aligned(8, 8), 8);
        assert_eq!(aligned(9, 8), 16);
        assert_eq!(aligned(100, 1), 100);
        assert_eq!(aligned(4097, 4096), 8192);
    }

    proptest! {
        #[test]
        fn prop_is_power_of_two_matches_definition(n in any::<u64>()) {
            prop_assert_eq!(is_power_of_two(n), n != 0 && (n & (n - 1)) == 0);
        }

        #[test]
        fn prop_aligned_is_aligned(v in 0u64..(1 << 40), shift in 0u32..12) {
            let align = 1u64 << shift;
            let a = aligned(v, align);
            prop_assert!(a >= v);
            prop_assert!(a - v < align);
            prop_assert_eq!(a % align, 0);
        }
    }
}
