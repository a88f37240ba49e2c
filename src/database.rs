//! The database: file validation, revision selection, allocation.
//!
//! Opening walks the revision chain from the header's footer pointer back
//! to the generation-0 sentinel, verifying signatures, CRCs and
//! generation ordering. A writable open additionally runs crash recovery:
//! a raised crash indicator means a writer died mid-transaction, and the
//! file is truncated back to the end of the authoritative footer.

use std::path::Path;
use std::sync::atomic::Ordering;

use crate::address::{Address, Extent};
use crate::error::{Result, StoreError};
use crate::file::{AccessMode, StoreFile};
use crate::format::{
    Header, Trailer, CRASH_INDICATOR_OFFSET, FOOTER_POS_OFFSET, HEADER_SIZE, TRAILER_SIZE,
};
use crate::region::RegionConfig;
use crate::storage::Storage;
use crate::support::milliseconds_since_epoch;

// ── Revision selection ─────────────────────────────────────────────

/// Names a revision to pin: the head of the chain at the moment of
/// pinning, or an explicit generation number.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Revision {
    Head,
    Number(u32),
}

// ── Database ───────────────────────────────────────────────────────

pub struct Database {
    file: StoreFile,
    storage: Storage,
    header: Header,
    /// Address of the pinned revision's trailer.
    footer_addr: Address,
    /// Cached copy of the pinned trailer.
    trailer: Trailer,
}

impl Database {
    /// Create a new store file and open it writable.
    pub fn create(path: &Path) -> Result<Self> {
        Self::create_with(path, RegionConfig::default())
    }

    /// Create with explicit region sizing (tests shrink the regions).
    pub fn create_with(path: &Path, config: RegionConfig) -> Result<Self> {
        use std::os::unix::fs::FileExt;

        let file = StoreFile::create(path)?;
        let header = Header::new();
        let sentinel = Trailer::sentinel(milliseconds_since_epoch());

        file.set_len(crate::support::aligned(
            HEADER_SIZE + TRAILER_SIZE,
            config.min_region_size,
        ))?;
        file.file().write_all_at(&header.to_bytes(), 0)?;
        file.file().write_all_at(&sentinel.to_bytes(), HEADER_SIZE)?;
        file.sync()?;
        drop(file);

        tracing::debug!(path = %path.display(), uuid = %header.uuid, "created store");
        Self::open_with(path, AccessMode::Writable, config)
    }

    /// Open an existing store.
    pub fn open(path: &Path, mode: AccessMode) -> Result<Self> {
        Self::open_with(path, mode, RegionConfig::default())
    }

    /// Open with explicit region sizing.
    pub fn open_with(path: &Path, mode: AccessMode, config: RegionConfig) -> Result<Self> {
        let file = StoreFile::open(path, mode)?;
        let file_size = file.size()?;
        if file_size < HEADER_SIZE + TRAILER_SIZE {
            return Err(StoreError::HeaderCorrupt("file too small".into()));
        }

        // Bootstrap: map the whole file so the header and the chain can
        // be validated; logical bounds are tightened below.
        let mut storage = Storage::open(&file, file_size, config)?;

        let header_bytes = storage.read(Address::NULL, HEADER_SIZE)?;
        let header = Header::from_bytes(&header_bytes)?;
        drop(header_bytes);

        // The footer pointer is the one field other processes update, so
        // re-load it with acquire ordering rather than trusting the
        // parsed snapshot.
        let footer_addr = Address::new(
            storage
                .regions()
                .atomic_u64_at(FOOTER_POS_OFFSET)?
                .load(Ordering::Acquire),
        );
        validate_footer_pos(footer_addr, file_size)?;

        let mut db = Database {
            file,
            storage,
            header,
            footer_addr,
            trailer: Trailer::sentinel(0),
        };

        db.trailer = db.read_trailer(footer_addr)?;
        db.check_chain(footer_addr, &db.trailer.clone())?;

        let logical = footer_addr.absolute() + TRAILER_SIZE;
        db.storage.set_bounds(logical, logical);

        if mode.is_writable() && db.header.crash_indicator != 0 {
            // A raised indicator only means a crash if nobody holds the
            // transaction lock; a live writer raises it too.
            match db.file.try_lock_transaction() {
                Ok(_guard) => {
                    tracing::warn!(
                        indicator = db.header.crash_indicator,
                        generation = db.trailer.generation,
                        "recovering from interrupted transaction"
                    );
                    db.storage.truncate(&db.file, logical)?;
                    db.write_crash_indicator(0)?;
                }
                Err(StoreError::LockBusy) => {}
                Err(e) => return Err(e),
            }
        }

        // Harden everything committed so far. The first page stays
        // writable: it holds the header fields the writer must update.
        let page = db.storage.regions().page_size();
        if logical > page {
            db.storage.freeze(Address::new(page), Address::new(logical))?;
        }

        tracing::debug!(
            path = %db.file.path().display(),
            generation = db.trailer.generation,
            size = logical,
            "opened store"
        );
        Ok(db)
    }

    // ── Accessors ──────────────────────────────────────────────────

    /// Logical store size: one past the last committed/allocated byte.
    #[inline]
    pub fn size(&self) -> u64 {
        self.storage.len()
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.file.mode().is_writable()
    }

    #[inline]
    pub fn header(&self) -> &Header {
        &self.header
    }

    /// The pinned revision's trailer.
    #[inline]
    pub fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    /// Generation number of the pinned revision.
    #[inline]
    pub fn revision(&self) -> u32 {
        self.trailer.generation
    }

    /// Address of the pinned revision's trailer.
    #[inline]
    pub fn footer_addr(&self) -> Address {
        self.footer_addr
    }

    #[inline]
    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    #[inline]
    pub(crate) fn file(&self) -> &StoreFile {
        &self.file
    }

    // ── Reading ────────────────────────────────────────────────────

    /// Resolve `[addr, addr+size)` to bytes; see [`Storage::get`].
    #[inline]
    pub fn read(&self, addr: Address, size: u64) -> Result<std::borrow::Cow<'_, [u8]>> {
        self.storage.read(addr, size)
    }

    /// Materialise an extent.
    #[inline]
    pub fn read_extent(&self, extent: Extent<u8>) -> Result<std::borrow::Cow<'_, [u8]>> {
        self.storage.read(extent.addr, extent.size)
    }

    // ── Revisions ──────────────────────────────────────────────────

    /// Pin a revision. `Revision::Head` re-reads the footer pointer, so
    /// commits made by another process since open become visible.
    pub fn sync(&mut self, revision: Revision) -> Result<()> {
        let head = Address::new(
            self.storage
                .regions()
                .atomic_u64_at(FOOTER_POS_OFFSET)?
                .load(Ordering::Acquire),
        );

        // Another writer may have appended since we mapped the file.
        let head_end = head.absolute() + TRAILER_SIZE;
        if head_end > self.storage.len() {
            let frozen = self.storage.frozen();
            self.storage.grow(&self.file, head_end)?;
            self.storage.set_bounds(head_end, frozen.max(head_end));
        }

        let target = match revision {
            Revision::Head => head,
            Revision::Number(g) => self.find_generation(head, g)?,
        };
        self.trailer = self.read_trailer(target)?;
        self.footer_addr = target;
        Ok(())
    }

    fn find_generation(&self, head: Address, generation: u32) -> Result<Address> {
        let mut addr = head;
        loop {
            let t = self.read_trailer(addr)?;
            if t.generation == generation {
                return Ok(addr);
            }
            if t.generation < generation || t.generation == 0 {
                return Err(StoreError::UnknownRevision(generation));
            }
            addr = t.prev_generation;
        }
    }

    /// Read and validate the trailer at `addr`.
    pub fn read_trailer(&self, addr: Address) -> Result<Trailer> {
        validate_footer_pos(addr, self.storage.regions().covered())?;
        let bytes = self.storage.get(addr, TRAILER_SIZE, true)?;
        let trailer = Trailer::from_bytes(&bytes)?;
        for rec in &trailer.index_records {
            let end = rec.addr.checked_add(rec.size);
            if !rec.is_null() && end.map_or(true, |e| e > addr) {
                return Err(StoreError::IndexCorrupt(format!(
                    "index root {rec:?} reaches past its trailer at {addr}"
                )));
            }
        }
        Ok(trailer)
    }

    /// Verify the whole chain below `head`: strictly decreasing
    /// generations linked down to the sentinel at the header.
    fn check_chain(&self, head: Address, head_trailer: &Trailer) -> Result<()> {
        let mut addr = head;
        let mut trailer = head_trailer.clone();
        loop {
            if trailer.generation == 0 {
                if addr != Address::new(HEADER_SIZE) {
                    return Err(StoreError::FooterCorrupt(
                        "generation 0 is not the sentinel trailer".into(),
                    ));
                }
                return Ok(());
            }
            let prev = trailer.prev_generation;
            if prev >= addr {
                return Err(StoreError::FooterCorrupt(
                    "revision chain does not decrease".into(),
                ));
            }
            let prev_trailer = self.read_trailer(prev)?;
            if prev_trailer.generation + 1 != trailer.generation {
                return Err(StoreError::FooterCorrupt(format!(
                    "generation {} follows {}",
                    trailer.generation, prev_trailer.generation
                )));
            }
            addr = prev;
            trailer = prev_trailer;
        }
    }

    // ── Mutation (transaction plumbing) ────────────────────────────

    fn require_writable(&self) -> Result<()> {
        if !self.is_writable() {
            return Err(StoreError::ReadOnly);
        }
        Ok(())
    }

    /// Bump-pointer allocation at end-of-file. Transaction use only.
    pub(crate) fn allocate(&mut self, size: u64, align: u64) -> Result<Address> {
        self.require_writable()?;
        if !crate::support::is_power_of_two(align) {
            return Err(StoreError::BadAlignment(align));
        }
        let start = crate::support::aligned(self.storage.len(), align);
        let new_len = start.checked_add(size).ok_or(StoreError::BadAddress {
            addr: start,
            size,
        })?;
        self.storage.grow(&self.file, new_len)?;
        Ok(Address::new(start))
    }

    /// Write into storage (above the frozen watermark only).
    pub(crate) fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        self.require_writable()?;
        self.storage.write(addr, bytes)
    }

    /// Truncate back to `new_len` (rollback path).
    pub(crate) fn truncate(&mut self, new_len: u64) -> Result<()> {
        self.require_writable()?;
        self.storage.truncate(&self.file, new_len)
    }

    /// Make `[first, last)` writable ahead of a transaction's appends.
    pub(crate) fn thaw(&mut self, first: Address, last: Address) -> Result<()> {
        self.storage.thaw(first, last)
    }

    /// Harden `[first, last)` after commit.
    pub(crate) fn protect(&mut self, first: Address, last: Address) -> Result<()> {
        self.storage.freeze(first, last)
    }

    /// msync `[first, last)`.
    pub(crate) fn flush_range(&self, first: Address, last: Address) -> Result<()> {
        self.storage.flush(first, last)
    }

    /// Publish a new footer: release-store the pointer, then flush the
    /// header page so the pointer is durable.
    pub(crate) fn set_new_footer(&mut self, addr: Address) -> Result<()> {
        self.require_writable()?;
        self.trailer = self.read_trailer(addr)?;
        self.storage
            .regions()
            .atomic_u64_at(FOOTER_POS_OFFSET)?
            .store(addr.absolute(), Ordering::Release);
        self.footer_addr = addr;
        self.header.footer_pos = addr;
        self.storage
            .flush(Address::NULL, Address::new(HEADER_SIZE))?;
        Ok(())
    }

    /// Raise or clear the header crash indicator and flush it.
    pub(crate) fn write_crash_indicator(&mut self, value: u32) -> Result<()> {
        self.require_writable()?;
        self.storage.write_unchecked(
            Address::new(CRASH_INDICATOR_OFFSET),
            &value.to_le_bytes(),
        )?;
        self.header.crash_indicator = value;
        self.storage
            .flush(Address::NULL, Address::new(HEADER_SIZE))?;
        Ok(())
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("path", &self.file.path())
            .field("generation", &self.trailer.generation)
            .field("size", &self.storage.len())
            .finish()
    }
}

fn validate_footer_pos(addr: Address, file_size: u64) -> Result<()> {
    let a = addr.absolute();
    if a < HEADER_SIZE || a % 8 != 0 || a + TRAILER_SIZE > file_size {
        return Err(StoreError::HeaderCorrupt(format!(
            "footer pointer {addr} out of range"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_config() -> RegionConfig {
        RegionConfig {
            min_region_size: 4096,
            full_region_size: 16384,
        }
    }

    #[test]
    fn test_create_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");

        let db = Database::create_with(&path, test_config()).unwrap();
        assert_eq!(db.revision(), 0);
        assert_eq!(db.size(), HEADER_SIZE + TRAILER_SIZE);
        let uuid = db.header().uuid;
        drop(db);

        let db = Database::open_with(&path, AccessMode::ReadOnly, test_config()).unwrap();
        assert_eq!(db.revision(), 0);
        assert_eq!(db.header().uuid, uuid);
        assert!(!db.is_writable());
    }

    #[test]
    fn test_open_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        std::fs::write(&path, vec![0u8; 8192]).unwrap();

        let err = Database::open_with(&path, AccessMode::ReadOnly, test_config()).unwrap_err();
        assert!(matches!(err, StoreError::HeaderCorrupt(_)));
    }

    #[test]
    fn test_open_rejects_too_small() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        std::fs::write(&path, b"aodbStor").unwrap();

        let err = Database::open_with(&path, AccessMode::ReadOnly, test_config()).unwrap_err();
        assert!(matches!(err, StoreError::HeaderCorrupt(_)));
    }

    #[test]
    fn test_open_rejects_corrupt_sentinel() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        Database::create_with(&path, test_config()).unwrap();

        // Flip a byte inside the sentinel trailer's size field.
        use std::os::unix::fs::FileExt;
        let f = std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap();
        f.write_all_at(&[0xff], HEADER_SIZE + 20).unwrap();

        let err = Database::open_with(&path, AccessMode::ReadOnly, test_config()).unwrap_err();
        assert!(matches!(err, StoreError::FooterCorrupt(_)));
    }

    #[test]
    fn test_unknown_revision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let mut db = Database::create_with(&path, test_config()).unwrap();

        assert!(matches!(
            db.sync(Revision::Number(3)),
            Err(StoreError::UnknownRevision(3))
        ));
        db.sync(Revision::Head).unwrap();
        db.sync(Revision::Number(0)).unwrap();
    }

    #[test]
    fn test_readonly_refuses_mutation() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        Database::create_with(&path, test_config()).unwrap();

        let mut db = Database::open_with(&path, AccessMode::ReadOnly, test_config()).unwrap();
        assert!(matches!(db.allocate(16, 8), Err(StoreError::ReadOnly)));
    }

    #[test]
    fn test_allocate_alignment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.db");
        let mut db = Database::create_with(&path, test_config()).unwrap();

        assert!(matches!(
            db.allocate(8, 3),
            Err(StoreError::BadAlignment(3))
        ));
        let a = db.allocate(8, 16).unwrap();
        assert_eq!(a.absolute() % 16, 0);
        assert_eq!(db.size(), a.absolute() + 8);
    }
}
