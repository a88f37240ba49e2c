//! Address-to-bytes resolution over the mapped regions.
//!
//! A read whose range lies inside a single region borrows the mapping
//! directly; a range that spans regions is assembled into an owned copy.
//! Writes are piecewise copies into the covering regions and are refused
//! below the frozen watermark — the byte-accurate form of the page
//! hardening done by the region manager.

use std::borrow::Cow;

use crate::address::Address;
use crate::error::{Result, StoreError};
use crate::file::StoreFile;
use crate::region::{RegionConfig, RegionManager};
use crate::support::is_power_of_two;

pub struct Storage {
    regions: RegionManager,
    /// Logical store size: one past the last allocated byte.
    len: u64,
    /// Bytes below this address are committed and immutable.
    frozen: u64,
}

impl Storage {
    /// Map `file` and expose `[0, len)` of it, with everything below
    /// `len` initially frozen.
    pub fn open(file: &StoreFile, len: u64, config: RegionConfig) -> Result<Self> {
        let regions = RegionManager::open(file, file.size()?, config)?;
        Ok(Storage {
            regions,
            len,
            frozen: len,
        })
    }

    #[inline]
    pub fn len(&self) -> u64 {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn frozen(&self) -> u64 {
        self.frozen
    }

    #[inline]
    pub fn regions(&self) -> &RegionManager {
        &self.regions
    }

    /// True iff `[addr, addr+size)` touches two or more regions.
    #[inline]
    pub fn request_spans_regions(&self, addr: Address, size: u64) -> bool {
        self.regions.request_spans_regions(addr, size)
    }

    fn check_range(&self, addr: Address, size: u64) -> Result<()> {
        let end = addr.checked_add(size).ok_or(StoreError::BadAddress {
            addr: addr.absolute(),
            size,
        })?;
        if end.absolute() > self.len {
            return Err(StoreError::BadAddress {
                addr: addr.absolute(),
                size,
            });
        }
        Ok(())
    }

    /// Resolve `[addr, addr+size)` to bytes.
    ///
    /// Borrows the mapping when the range lies in a single region;
    /// otherwise returns an owned concatenated copy. With
    /// `initialised == false` the caller promises to overwrite every
    /// byte, so a spanning request skips the copy-in and returns a
    /// zeroed buffer.
    pub fn get(&self, addr: Address, size: u64, initialised: bool) -> Result<Cow<'_, [u8]>> {
        self.check_range(addr, size)?;
        if size == 0 {
            // Zero-length extents may sit exactly at the logical end,
            // where no region lookup is possible.
            return Ok(Cow::Borrowed(&[]));
        }
        if !self.request_spans_regions(addr, size) {
            let mut it = self.regions.covering(addr, size)?;
            let slice = match it.next() {
                Some((region, off, len)) => {
                    debug_assert_eq!(len, size);
                    unsafe {
                        std::slice::from_raw_parts(
                            region.as_ptr().add(off as usize),
                            len as usize,
                        )
                    }
                }
                None => &[],
            };
            return Ok(Cow::Borrowed(slice));
        }

        let mut buf = vec![0u8; size as usize];
        if initialised {
            let mut cursor = 0usize;
            for (region, off, len) in self.regions.covering(addr, size)? {
                let src = unsafe {
                    std::slice::from_raw_parts(region.as_ptr().add(off as usize), len as usize)
                };
                buf[cursor..cursor + len as usize].copy_from_slice(src);
                cursor += len as usize;
            }
            debug_assert_eq!(cursor, size as usize);
        }
        Ok(Cow::Owned(buf))
    }

    /// Resolve an initialised range. See [`Storage::get`].
    #[inline]
    pub fn read(&self, addr: Address, size: u64) -> Result<Cow<'_, [u8]>> {
        self.get(addr, size, true)
    }

    /// Copy `bytes` into the store at `addr`, crossing region boundaries
    /// as needed. Refused below the frozen watermark.
    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as u64;
        self.check_range(addr, size)?;
        if size == 0 {
            return Ok(());
        }
        if addr.absolute() < self.frozen {
            return Err(StoreError::ReadOnlyAddress(addr.absolute()));
        }
        let mut cursor = 0usize;
        for (region, off, len) in self.regions.covering(addr, size)? {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes[cursor..].as_ptr(),
                    region.as_ptr().add(off as usize),
                    len as usize,
                );
            }
            cursor += len as usize;
        }
        debug_assert_eq!(cursor, size as usize);
        Ok(())
    }

    /// Copy `bytes` into the store bypassing the frozen watermark.
    ///
    /// Reserved for the header's mutable fields (crash indicator); all
    /// payload writes go through [`Storage::write`].
    pub(crate) fn write_unchecked(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        let size = bytes.len() as u64;
        self.check_range(addr, size)?;
        if size == 0 {
            return Ok(());
        }
        let mut cursor = 0usize;
        for (region, off, len) in self.regions.covering(addr, size)? {
            unsafe {
                std::ptr::copy_nonoverlapping(
                    bytes[cursor..].as_ptr(),
                    region.as_ptr().add(off as usize),
                    len as usize,
                );
            }
            cursor += len as usize;
        }
        Ok(())
    }

    /// Reset logical length and frozen watermark (open/recovery path).
    pub(crate) fn set_bounds(&mut self, len: u64, frozen: u64) {
        debug_assert!(frozen <= len);
        self.len = len;
        self.frozen = frozen;
    }

    /// Validate that `addr` satisfies `align` (a power of two).
    pub fn check_alignment(&self, addr: Address, align: u64) -> Result<()> {
        if !is_power_of_two(align) {
            return Err(StoreError::BadAlignment(align));
        }
        if addr.absolute() & (align - 1) != 0 {
            return Err(StoreError::BadAlignment(align));
        }
        Ok(())
    }

    // ── Growth, truncation, protection ─────────────────────────────

    /// Extend the logical size to `new_len`, growing file and mapping.
    pub(crate) fn grow(&mut self, file: &StoreFile, new_len: u64) -> Result<()> {
        debug_assert!(new_len >= self.len);
        self.regions.grow(file, new_len)?;
        self.len = new_len;
        Ok(())
    }

    /// Shrink the logical size to `new_len` (rollback / recovery path).
    pub(crate) fn truncate(&mut self, file: &StoreFile, new_len: u64) -> Result<()> {
        debug_assert!(new_len <= self.len);
        self.regions.truncate(file, new_len)?;
        self.len = new_len;
        self.frozen = self.frozen.min(new_len);
        Ok(())
    }

    /// Advance the frozen watermark and harden the pages behind it.
    pub(crate) fn freeze(&mut self, first: Address, last: Address) -> Result<()> {
        self.regions.protect(first, last, true)?;
        self.frozen = self.frozen.max(last.absolute());
        Ok(())
    }

    /// Re-open `[first, last)` for writing (transaction start).
    pub(crate) fn thaw(&mut self, first: Address, last: Address) -> Result<()> {
        self.regions.protect(first, last, false)?;
        debug_assert!(first.absolute() >= self.frozen);
        Ok(())
    }

    /// Write back `[first, last)` to the file.
    pub(crate) fn flush(&self, first: Address, last: Address) -> Result<()> {
        self.regions.flush(first, last)
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("len", &self.len)
            .field("frozen", &self.frozen)
            .field("regions", &self.regions)
            .finish()
    }
}
