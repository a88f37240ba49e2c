//! Byte addresses and extents.
//!
//! Everything in the store is named by its byte offset from the start of
//! the file. An `Address` is such an offset; an `Extent<T>` names a
//! contiguous range whose payload is a `T` (or an array of them). Null is
//! address zero — the header occupies it, so no allocation ever returns it.

use std::cmp::Ordering;
use std::fmt;
use std::marker::PhantomData;

/// Log2 of the segment size. Segments are 4 MiB.
pub const LOG2_SEGMENT_SIZE: u32 = 22;

/// Segment size in bytes.
pub const SEGMENT_SIZE: u64 = 1 << LOG2_SEGMENT_SIZE;

// ── Address ────────────────────────────────────────────────────────

/// A 64-bit byte offset from the start of the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Address(u64);

impl Address {
    /// The null address. Nothing is ever stored at offset 0 except the
    /// file header, so 0 doubles as "no address".
    pub const NULL: Address = Address(0);

    #[inline]
    pub const fn new(offset: u64) -> Self {
        Address(offset)
    }

    #[inline]
    pub const fn absolute(self) -> u64 {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Segment number: the high bits of the offset.
    #[inline]
    pub const fn segment(self) -> u64 {
        self.0 >> LOG2_SEGMENT_SIZE
    }

    /// Offset within the segment: the low bits.
    #[inline]
    pub const fn offset(self) -> u64 {
        self.0 & (SEGMENT_SIZE - 1)
    }

    /// Checked addition, `None` on u64 overflow.
    #[inline]
    pub fn checked_add(self, n: u64) -> Option<Address> {
        self.0.checked_add(n).map(Address)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl std::ops::Add<u64> for Address {
    type Output = Address;

    fn add(self, rhs: u64) -> Address {
        Address(self.0 + rhs)
    }
}

// ── Extent ─────────────────────────────────────────────────────────

/// A contiguous store range holding a `T` payload.
///
/// The type parameter is a compile-time tag only; it occupies no space
/// and is not checked at run time.
pub struct Extent<T = u8> {
    pub addr: Address,
    pub size: u64,
    marker: PhantomData<fn() -> T>,
}

impl<T> Extent<T> {
    pub const NULL: Extent<T> = Extent {
        addr: Address::NULL,
        size: 0,
        marker: PhantomData,
    };

    #[inline]
    pub const fn new(addr: Address, size: u64) -> Self {
        Extent {
            addr,
            size,
            marker: PhantomData,
        }
    }

    #[inline]
    pub const fn is_null(&self) -> bool {
        self.addr.is_null()
    }

    /// One past the last byte of the extent.
    #[inline]
    pub fn end(&self) -> Address {
        self.addr + self.size
    }

    /// Re-tag the extent with a different payload type.
    #[inline]
    pub fn cast<U>(self) -> Extent<U> {
        Extent::new(self.addr, self.size)
    }
}

// Manual impls: derive would put a `T: Clone` (etc.) bound on the tag.
impl<T> Clone for Extent<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Extent<T> {}

impl<T> fmt::Debug for Extent<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Extent")
            .field("addr", &self.addr)
            .field("size", &self.size)
            .finish()
    }
}

impl<T> PartialEq for Extent<T> {
    fn eq(&self, other: &Self) -> bool {
        self.addr == other.addr && self.size == other.size
    }
}
impl<T> Eq for Extent<T> {}

impl<T> PartialOrd for Extent<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Extent<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.addr, self.size).cmp(&(other.addr, other.size))
    }
}

impl<T> Default for Extent<T> {
    fn default() -> Self {
        Extent::NULL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_segment_split() {
        let a = Address::new(SEGMENT_SIZE * 3 + 17);
        assert_eq!(a.segment(), 3);
        assert_eq!(a.offset(), 17);
        assert_eq!(Address::NULL.segment(), 0);
        assert_eq!(Address::NULL.offset(), 0);
    }

    #[test]
    fn test_address_null() {
        assert!(Address::NULL.is_null());
        assert!(!Address::new(1).is_null());
        assert_eq!(Address::default(), Address::NULL);
    }

    #[test]
    fn test_address_checked_add_overflow() {
        assert_eq!(Address::new(u64::MAX).checked_add(1), None);
        assert_eq!(
            Address::new(10).checked_add(5),
            Some(Address::new(15))
        );
    }

    #[test]
    fn test_extent_ordering() {
        let e1 = Extent::<u8>::new(Address::new(2), 4);
        let e2 = Extent::<u8>::new(Address::new(2), 4);
        assert_eq!(e1, e2);
        assert!(e1 <= e2 && e1 >= e2);

        // Ordering is lexicographic on (addr, size).
        let bigger_addr = Extent::<u8>::new(Address::new(5), 4);
        assert!(e1 < bigger_addr);
        assert!(bigger_addr > e1);

        let bigger_size = Extent::<u8>::new(Address::new(2), 5);
        assert!(e1 < bigger_size);
        assert!(bigger_size > e1);
    }

    #[test]
    fn test_extent_end() {
        let e = Extent::<u8>::new(Address::new(100), 12);
        assert_eq!(e.end(), Address::new(112));
        assert!(Extent::<u8>::NULL.is_null());
    }
}
