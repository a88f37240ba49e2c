//! Memory-mapped region management.
//!
//! The store file is covered by a sequence of mapped regions sorted by
//! file offset. Opening a file coalesces coverage into as few mappings as
//! possible (up to `full_region_size` each); growing appends regions in
//! `min_region_size` multiples. Regions are never split and never shrunk;
//! a truncate drops whole trailing regions and a region is allowed to
//! extend past the current file length — the bytes past end-of-file are
//! reserved and never read.

use std::sync::atomic::AtomicU64;

use memmap2::{MmapOptions, MmapRaw};

use crate::address::Address;
use crate::error::{Result, StoreError};
use crate::file::{AccessMode, StoreFile};
use crate::support::{aligned, is_power_of_two};

// ── Sizing ─────────────────────────────────────────────────────────

/// Default growth granularity: 4 MiB.
pub const DEFAULT_MIN_REGION_SIZE: u64 = 4 * 1024 * 1024;

/// Default upper bound on a single mapping: 1 GiB.
pub const DEFAULT_FULL_REGION_SIZE: u64 = 1024 * 1024 * 1024;

/// Region sizing knobs. The defaults suit production; tests shrink
/// `min_region_size` to exercise region-spanning reads cheaply.
#[derive(Debug, Clone, Copy)]
pub struct RegionConfig {
    /// Growth granularity. Power of two, at least one page.
    pub min_region_size: u64,
    /// Largest single mapping created on open. Power-of-two multiple of
    /// `min_region_size`.
    pub full_region_size: u64,
}

impl RegionConfig {
    pub fn with_min_region_size(min: u64) -> Self {
        let full = min
            .saturating_mul(256)
            .min(DEFAULT_FULL_REGION_SIZE)
            .max(min);
        RegionConfig {
            min_region_size: min,
            full_region_size: full,
        }
    }

    fn validate(&self) -> Result<()> {
        if !is_power_of_two(self.min_region_size) || self.min_region_size < 4096 {
            return Err(StoreError::BadAlignment(self.min_region_size));
        }
        if !is_power_of_two(self.full_region_size)
            || self.full_region_size < self.min_region_size
        {
            return Err(StoreError::BadAlignment(self.full_region_size));
        }
        Ok(())
    }
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            min_region_size: DEFAULT_MIN_REGION_SIZE,
            full_region_size: DEFAULT_FULL_REGION_SIZE,
        }
    }
}

// ── Region ─────────────────────────────────────────────────────────

/// One mapped window of the store file.
pub struct Region {
    map: MmapRaw,
    file_offset: u64,
}

impl Region {
    #[inline]
    pub fn offset(&self) -> u64 {
        self.file_offset
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.map.len() as u64
    }

    /// One past the last mapped byte, as a file offset.
    #[inline]
    pub fn end(&self) -> u64 {
        self.file_offset + self.size()
    }

    #[inline]
    pub(crate) fn as_ptr(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub(crate) fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.map.flush_range(offset as usize, len as usize)?;
        Ok(())
    }
}

impl std::fmt::Debug for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Region")
            .field("file_offset", &self.file_offset)
            .field("size", &self.size())
            .finish()
    }
}

// ── RegionManager ──────────────────────────────────────────────────

/// Owns the mapped regions covering the store file.
pub struct RegionManager {
    regions: Vec<Region>,
    /// Actual file length. Always a `min_region_size` multiple while the
    /// store is writable; mapped coverage may exceed it.
    physical_size: u64,
    config: RegionConfig,
    mode: AccessMode,
    page_size: u64,
}

impl RegionManager {
    /// Map an existing file of length `size`.
    pub fn open(file: &StoreFile, size: u64, config: RegionConfig) -> Result<Self> {
        config.validate()?;
        let mut mgr = RegionManager {
            regions: Vec::new(),
            physical_size: size,
            config,
            mode: file.mode(),
            page_size: page_size(),
        };
        // Coalesce coverage into full-sized mappings where possible.
        let mut covered = 0;
        while covered < size {
            let len = (size - covered).min(config.full_region_size);
            mgr.map_region(file, covered, len)?;
            covered += len;
        }
        Ok(mgr)
    }

    #[inline]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// End of mapped coverage (>= physical file size).
    #[inline]
    pub fn covered(&self) -> u64 {
        self.regions.last().map_or(0, Region::end)
    }

    #[inline]
    pub fn physical_size(&self) -> u64 {
        self.physical_size
    }

    #[inline]
    pub(crate) fn page_size(&self) -> u64 {
        self.page_size
    }

    fn map_region(&mut self, file: &StoreFile, offset: u64, len: u64) -> Result<()> {
        let mut opts = MmapOptions::new();
        opts.offset(offset).len(len as usize);
        let map = if self.mode.is_writable() {
            opts.map_raw(file.file())?
        } else {
            opts.map_raw_read_only(file.file())?
        };
        self.regions.push(Region {
            map,
            file_offset: offset,
        });
        Ok(())
    }

    /// Index of the region containing file offset `addr`.
    fn region_index(&self, addr: Address) -> Result<usize> {
        let a = addr.absolute();
        if a >= self.covered() {
            return Err(StoreError::BadAddress { addr: a, size: 0 });
        }
        // Regions are sorted by offset; lower-bound on the region end.
        let idx = self.regions.partition_point(|r| r.end() <= a);
        debug_assert!(idx < self.regions.len());
        Ok(idx)
    }

    /// True iff `[addr, addr+len)` touches two or more regions.
    pub fn request_spans_regions(&self, addr: Address, len: u64) -> bool {
        if len == 0 {
            return false;
        }
        match self.region_index(addr) {
            Ok(idx) => addr.absolute() + len > self.regions[idx].end(),
            Err(_) => false,
        }
    }

    /// The regions overlapping `[addr, addr+len)`, with the intersecting
    /// sub-range of each expressed as (region, offset-in-region, len).
    pub(crate) fn covering<'s>(
        &'s self,
        addr: Address,
        len: u64,
    ) -> Result<impl Iterator<Item = (&'s Region, u64, u64)> + 's> {
        let end = addr
            .checked_add(len)
            .ok_or(StoreError::BadAddress {
                addr: addr.absolute(),
                size: len,
            })?
            .absolute();
        if end > self.covered() {
            return Err(StoreError::BadAddress {
                addr: addr.absolute(),
                size: len,
            });
        }
        let first = self.region_index(addr)?;
        let start = addr.absolute();
        Ok(self.regions[first..]
            .iter()
            .take_while(move |r| r.offset() < end)
            .map(move |r| {
                let lo = start.max(r.offset());
                let hi = end.min(r.end());
                (r, lo - r.offset(), hi - lo)
            }))
    }

    /// Grow the file so that at least `new_size` bytes are usable, then
    /// extend mapped coverage. Never shrinks anything.
    pub fn grow(&mut self, file: &StoreFile, new_size: u64) -> Result<()> {
        let new_physical = aligned(new_size, self.config.min_region_size);
        if new_physical > self.physical_size {
            // Another process may have grown the file further already;
            // set_len must never shrink it.
            let actual = file.size()?;
            if new_physical > actual {
                file.set_len(new_physical)?;
            }
            self.physical_size = new_physical.max(actual);
        }
        let mut covered = self.covered();
        while covered < new_physical {
            let len = (new_physical - covered).min(self.config.full_region_size);
            self.map_region(file, covered, len)?;
            covered += len;
        }
        Ok(())
    }

    /// Truncate the file for rollback, dropping regions that lie wholly
    /// past the new length. A region straddling the cut stays mapped; its
    /// tail is reserved bytes that nothing will read.
    pub fn truncate(&mut self, file: &StoreFile, new_size: u64) -> Result<()> {
        let new_physical = aligned(new_size, self.config.min_region_size);
        if new_physical >= self.physical_size {
            return Ok(());
        }
        self.regions.retain(|r| r.offset() < new_physical);
        file.set_len(new_physical)?;
        self.physical_size = new_physical;
        Ok(())
    }

    /// Change page protection over `[first, last)`.
    ///
    /// Hardening only: ranges are rounded inward to page boundaries when
    /// removing write access and outward when restoring it, so partial
    /// pages stay writable. The logical read-only watermark lives in
    /// `Storage` and is byte-accurate.
    pub fn protect(&self, first: Address, last: Address, readonly: bool) -> Result<()> {
        if !self.mode.is_writable() || last <= first {
            return Ok(());
        }
        let (lo, hi) = if readonly {
            (
                aligned(first.absolute(), self.page_size),
                last.absolute() & !(self.page_size - 1),
            )
        } else {
            (
                first.absolute() & !(self.page_size - 1),
                aligned(last.absolute(), self.page_size),
            )
        };
        if hi <= lo {
            return Ok(());
        }
        let hi = hi.min(self.covered());
        for (region, off, len) in self.covering(Address::new(lo), hi - lo)? {
            let prot = if readonly {
                libc::PROT_READ
            } else {
                libc::PROT_READ | libc::PROT_WRITE
            };
            let rc = unsafe {
                libc::mprotect(
                    region.as_ptr().add(off as usize).cast(),
                    len as usize,
                    prot,
                )
            };
            if rc != 0 {
                return Err(std::io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Write back the mapped range `[first, last)` to the file.
    pub fn flush(&self, first: Address, last: Address) -> Result<()> {
        if last <= first {
            return Ok(());
        }
        let len = last.absolute() - first.absolute();
        for (region, off, sub_len) in self.covering(first, len)? {
            region.flush_range(off, sub_len)?;
        }
        Ok(())
    }

    /// An atomic view of the u64 at file offset `offset`.
    ///
    /// The offset must be 8-aligned and must not cross a region boundary;
    /// the header's footer pointer satisfies both by construction.
    pub(crate) fn atomic_u64_at(&self, offset: u64) -> Result<&AtomicU64> {
        debug_assert_eq!(offset % 8, 0);
        let idx = self.region_index(Address::new(offset))?;
        let region = &self.regions[idx];
        debug_assert!(offset + 8 <= region.end());
        let ptr = unsafe { region.as_ptr().add((offset - region.offset()) as usize) };
        // Safety: the mapping outlives the returned reference (it borrows
        // self), the pointer is 8-aligned, and all concurrent access to
        // this word goes through atomics.
        Ok(unsafe { AtomicU64::from_ptr(ptr.cast()) })
    }
}

impl std::fmt::Debug for RegionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionManager")
            .field("regions", &self.regions)
            .field("physical_size", &self.physical_size)
            .finish()
    }
}

fn page_size() -> u64 {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as u64 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn small_config() -> RegionConfig {
        RegionConfig {
            min_region_size: 4096,
            full_region_size: 8192,
        }
    }

    fn store_file(dir: &TempDir, len: u64) -> StoreFile {
        let f = StoreFile::create(&dir.path().join("t.db")).unwrap();
        f.set_len(len).unwrap();
        f
    }

    #[test]
    fn test_open_coalesces_to_full_regions() {
        let dir = TempDir::new().unwrap();
        let f = store_file(&dir, 8192 + 4096);
        let mgr = RegionManager::open(&f, 8192 + 4096, small_config()).unwrap();

        // One full region then the remainder.
        assert_eq!(mgr.regions().len(), 2);
        assert_eq!(mgr.regions()[0].offset(), 0);
        assert_eq!(mgr.regions()[0].size(), 8192);
        assert_eq!(mgr.regions()[1].offset(), 8192);
        assert_eq!(mgr.regions()[1].size(), 4096);
    }

    #[test]
    fn test_grow_appends_min_sized_regions() {
        let dir = TempDir::new().unwrap();
        let f = store_file(&dir, 4096);
        let mut mgr = RegionManager::open(&f, 4096, small_config()).unwrap();
        assert_eq!(mgr.regions().len(), 1);

        mgr.grow(&f, 4097).unwrap();
        assert_eq!(mgr.physical_size(), 8192);
        assert_eq!(mgr.regions().len(), 2);
        assert_eq!(mgr.regions()[1].offset(), 4096);
        assert_eq!(mgr.regions()[1].size(), 4096);
        assert_eq!(f.size().unwrap(), 8192);
    }

    #[test]
    fn test_request_spans_regions() {
        let dir = TempDir::new().unwrap();
        let f = store_file(&dir, 4096);
        let mut mgr = RegionManager::open(&f, 4096, small_config()).unwrap();
        mgr.grow(&f, 4096 * 2 + 1).unwrap();

        assert!(!mgr.request_spans_regions(Address::NULL, 0));
        assert!(!mgr.request_spans_regions(Address::NULL, 4096));
        assert!(!mgr.request_spans_regions(Address::new(4095), 1));
        assert!(!mgr.request_spans_regions(Address::new(4096), 1));
        assert!(mgr.request_spans_regions(Address::new(4095), 2));
        assert!(mgr.request_spans_regions(Address::NULL, 4097));
    }

    #[test]
    fn test_reopen_coalesces_grown_file() {
        let dir = TempDir::new().unwrap();
        let f = store_file(&dir, 4096);
        let mut mgr = RegionManager::open(&f, 4096, small_config()).unwrap();
        mgr.grow(&f, 8192).unwrap();
        assert_eq!(mgr.regions().len(), 2);
        drop(mgr);

        // A second open sees one maximal region where the first had two.
        let mgr2 = RegionManager::open(&f, f.size().unwrap(), small_config()).unwrap();
        assert_eq!(mgr2.regions().len(), 1);
        assert_eq!(mgr2.regions()[0].size(), 8192);
        assert!(!mgr2.request_spans_regions(Address::new(4095), 2));
    }

    #[test]
    fn test_truncate_drops_trailing_regions() {
        let dir = TempDir::new().unwrap();
        let f = store_file(&dir, 4096);
        let mut mgr = RegionManager::open(&f, 4096, small_config()).unwrap();
        mgr.grow(&f, 4096 * 3).unwrap();
        assert!(mgr.regions().len() >= 2);

        mgr.truncate(&f, 4096).unwrap();
        assert_eq!(mgr.physical_size(), 4096);
        assert_eq!(f.size().unwrap(), 4096);
        assert_eq!(mgr.covered(), 4096);
    }

    #[test]
    fn test_covering_out_of_range() {
        let dir = TempDir::new().unwrap();
        let f = store_file(&dir, 4096);
        let mgr = RegionManager::open(&f, 4096, small_config()).unwrap();
        assert!(mgr.covering(Address::new(4000), 200).is_err());
        assert!(mgr.covering(Address::new(u64::MAX), 2).is_err());
    }
}
