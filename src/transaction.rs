//! Scoped writer over the database.
//!
//! A transaction holds the cross-process transaction lock for its whole
//! lifetime. All writes go to freshly allocated end-of-file bytes; commit
//! appends a trailer, publishes it through the header's footer pointer
//! and hardens everything it wrote. Dropping an uncommitted transaction
//! rolls back by truncating the file to its size at begin.

use crate::address::{Address, Extent};
use crate::database::{Database, Revision};
use crate::error::{Result, StoreError};
use crate::file::LockGuard;
use crate::format::{Trailer, TRAILER_SIZE};
use crate::index::IndexSet;
use crate::support::milliseconds_since_epoch;

pub struct Transaction<'db> {
    db: &'db mut Database,
    guard: Option<LockGuard>,
    /// First address allocated by this transaction; null until then.
    first: Address,
    dbsize_at_begin: u64,
    bytes_appended: u64,
    closed: bool,
}

impl<'db> Transaction<'db> {
    /// Begin a transaction, blocking until the transaction lock is free.
    pub fn begin(db: &'db mut Database) -> Result<Self> {
        if !db.is_writable() {
            return Err(StoreError::ReadOnly);
        }
        let guard = db.file().lock_transaction()?;
        Self::start(db, guard)
    }

    /// Begin without blocking; [`StoreError::LockBusy`] if another
    /// process holds the lock.
    pub fn try_begin(db: &'db mut Database) -> Result<Self> {
        if !db.is_writable() {
            return Err(StoreError::ReadOnly);
        }
        let guard = db.file().try_lock_transaction()?;
        Self::start(db, guard)
    }

    fn start(db: &'db mut Database, guard: LockGuard) -> Result<Self> {
        // Another process may have committed while we waited for the
        // lock; our revision must be the head before we append to it.
        db.sync(Revision::Head)?;
        db.write_crash_indicator(db.revision() + 1)?;
        let dbsize_at_begin = db.size();
        Ok(Transaction {
            db,
            guard: Some(guard),
            first: Address::NULL,
            dbsize_at_begin,
            bytes_appended: 0,
            closed: false,
        })
    }

    /// Read access to the database for index lookups inside the
    /// transaction.
    #[inline]
    pub fn db(&self) -> &Database {
        self.db
    }

    /// True until commit or rollback.
    #[inline]
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Bytes appended so far, including alignment padding.
    #[inline]
    pub fn bytes_appended(&self) -> u64 {
        self.bytes_appended
    }

    /// Allocate `size` bytes aligned to `align` at end-of-file.
    pub fn allocate(&mut self, size: u64, align: u64) -> Result<Address> {
        if self.closed {
            return Err(StoreError::CannotAllocateAfterCommit);
        }
        let old_size = self.db.size();
        let addr = self.db.allocate(size, align)?;
        if self.first.is_null() {
            self.first = addr;
            // Committed pages behind end-of-file were hardened at the
            // last commit; reopen the pages this transaction appends to.
            self.db.thaw(addr, Address::new(self.db.size()))?;
        }
        // Count what was actually consumed, padding included.
        self.bytes_appended += self.db.size() - old_size;
        Ok(addr)
    }

    /// Allocate and fill in one step. New storage is never copied in
    /// first: the write overwrites every byte of the extent.
    pub fn write_bytes(&mut self, bytes: &[u8], align: u64) -> Result<Extent<u8>> {
        let addr = self.allocate(bytes.len() as u64, align)?;
        self.db.write(addr, bytes)?;
        Ok(Extent::new(addr, bytes.len() as u64))
    }

    /// Write to an address previously allocated by this transaction.
    pub fn write(&mut self, addr: Address, bytes: &[u8]) -> Result<()> {
        if self.closed {
            return Err(StoreError::CannotAllocateAfterCommit);
        }
        self.db.write(addr, bytes)
    }

    /// Commit: flush indices, append the trailer, publish it, harden.
    ///
    /// Returns the generation number of the new revision.
    pub fn commit(&mut self, indexes: &mut IndexSet) -> Result<u32> {
        if self.closed {
            return Ok(self.db.revision());
        }

        let generation = self.db.revision() + 1;
        let prev_footer = self.db.footer_addr();

        // 1. Write out index mutations; this allocates through us.
        let index_records = indexes.flush(self, generation)?;

        // 2. Build the new trailer at end-of-file.
        let trailer_addr = self.allocate(TRAILER_SIZE, 8)?;
        let trailer = Trailer {
            generation,
            // Alignment padding counts as transaction payload; only the
            // trailer itself is excluded.
            size: self.bytes_appended - TRAILER_SIZE,
            time: milliseconds_since_epoch(),
            prev_generation: prev_footer,
            index_records,
        };
        // 3. CRC is computed as part of serialisation.
        self.db.write(trailer_addr, &trailer.to_bytes())?;

        // 4. Write back everything this transaction touched.
        let first = self.first;
        let end = trailer_addr + TRAILER_SIZE;
        self.db.flush_range(first, end)?;

        // 5./6. Publish the footer, then clear the crash indicator; both
        // flush the header page.
        self.db.set_new_footer(trailer_addr)?;
        self.db.write_crash_indicator(0)?;

        // 7. Harden the committed range, trailer included.
        self.db.protect(first, end)?;

        // 8. Release the lock.
        self.guard.take();
        self.closed = true;
        tracing::debug!(generation, bytes = trailer.size, "committed transaction");
        Ok(generation)
    }

    /// Abandon the transaction, truncating away anything it appended.
    /// Idempotent; also run by drop.
    pub fn rollback(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if self.db.size() > self.dbsize_at_begin {
            self.db.truncate(self.dbsize_at_begin)?;
        }
        self.db.write_crash_indicator(0)?;
        self.guard.take();
        Ok(())
    }
}

impl Drop for Transaction<'_> {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(e) = self.rollback() {
                tracing::warn!(error = %e, "rollback on drop failed");
            }
        }
    }
}
