//! Fowler/Noll/Vo FNV-1a hashing.
//!
//! 64-bit FNV-1a drives the HAMT indices; the wrapped 128-bit form is the
//! content digest used as the key of the digest index. Parameters are the
//! public FNV constants.

use crate::uint128::UInt128;

/// 64-bit FNV-1a offset basis.
pub const FNV1A_64_INIT: u64 = 0xcbf2_9ce4_8422_2325;

/// 64-bit FNV-1a prime.
pub const FNV1A_64_PRIME: u64 = 0x0000_0100_0000_01b3;

/// FNV-1a hash of `buf`, continuing from `hval`.
///
/// Pass [`FNV1A_64_INIT`] to start a new hash; pass a previous result to
/// hash data presented in pieces.
#[inline]
pub fn fnv1a_64_buf(buf: &[u8], hval: u64) -> u64 {
    let mut h = hval;
    for &b in buf {
        h ^= u64::from(b);
        h = h.wrapping_mul(FNV1A_64_PRIME);
    }
    h
}

/// FNV-1a hash of `buf` from the standard offset basis.
#[inline]
pub fn fnv1a_64(buf: &[u8]) -> u64 {
    fnv1a_64_buf(buf, FNV1A_64_INIT)
}

/// 128-bit content digest: two chained 64-bit FNV-1a passes.
///
/// The low limb is the plain hash; the high limb re-hashes the input
/// seeded with the low limb, so the two halves never agree on more input
/// than a genuine 128-bit collision would.
pub fn digest(buf: &[u8]) -> UInt128 {
    let low = fnv1a_64(buf);
    let high = fnv1a_64_buf(buf, low);
    UInt128::new(high, low)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Published FNV-1a 64-bit test vectors.
    #[test]
    fn test_fnv1a_64_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"b"), 0xaf63_df4c_8601_f1a5);
        assert_eq!(fnv1a_64(b"foobar"), 0x85944171f73967e8);
    }

    #[test]
    fn test_fnv1a_64_incremental() {
        // Hashing in pieces must equal hashing in one go.
        let whole = fnv1a_64(b"hello world");
        let part = fnv1a_64_buf(b" world", fnv1a_64(b"hello"));
        assert_eq!(whole, part);
    }

    #[test]
    fn test_fnv1a_64_byte_sweep() {
        // Every single-byte input hashes distinctly.
        let mut seen = std::collections::HashSet::new();
        for b in 0u8..=255 {
            assert!(seen.insert(fnv1a_64(&[b])));
        }
        assert_eq!(seen.len(), 256);
    }

    #[test]
    fn test_digest_limbs_differ() {
        let d = digest(b"hello world\n");
        assert_ne!(d.high(), d.low());
        assert_eq!(d.low(), fnv1a_64(b"hello world\n"));
    }

    #[test]
    fn test_digest_distinct_inputs() {
        assert_ne!(digest(b"a"), digest(b"b"));
        assert_ne!(digest(b""), digest(b"\0"));
    }
}
