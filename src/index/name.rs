//! String-interning index over indirect strings.
//!
//! A stored entry holds the extent of the string's bytes rather than the
//! bytes themselves; equality on lookup materialises the committed bytes
//! and compares them. Strings added during a transaction stay pending in
//! heap leaves, carrying their bytes and an insertion sequence number;
//! flush lays all pending bytes out contiguously in insertion order and
//! only then writes the trie nodes that point at them.

use std::borrow::Cow;
use std::collections::HashMap;

use crate::address::Extent;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::fnv::fnv1a_64;
use crate::index::{HamtMap, IndexKey};
use crate::serialize::{ArchiveReader, ArchiveWriter};
use crate::transaction::Transaction;

// ── IndirectString ─────────────────────────────────────────────────

/// A string keyed by content but stored by extent.
#[derive(Debug, Clone)]
pub enum IndirectString {
    /// Added in the current transaction; bytes not yet in the store.
    Pending { seq: u64, bytes: Box<[u8]> },
    /// Committed: the bytes live at `extent`.
    Committed { extent: Extent<u8> },
}

impl IndirectString {
    /// A probe key for lookups; the sequence number never matters for
    /// equality.
    fn probe(bytes: &[u8]) -> Self {
        IndirectString::Pending {
            seq: u64::MAX,
            bytes: bytes.into(),
        }
    }

    /// The string's bytes, materialising committed storage as needed.
    fn bytes<'a>(&'a self, db: &'a Database) -> Result<Cow<'a, [u8]>> {
        match self {
            IndirectString::Pending { bytes, .. } => Ok(Cow::Borrowed(bytes)),
            IndirectString::Committed { extent } => db.read_extent(*extent),
        }
    }
}

impl IndexKey for IndirectString {
    fn hash_key(&self) -> u64 {
        match self {
            IndirectString::Pending { bytes, .. } => fnv1a_64(bytes),
            // Probes and inserts always carry their bytes; a committed
            // key's hash lives in the leaf record that stores it.
            IndirectString::Committed { .. } => {
                unreachable!("committed strings are never re-hashed")
            }
        }
    }

    fn encode(&self, w: &mut ArchiveWriter) -> Result<()> {
        match self {
            IndirectString::Committed { extent } => {
                w.put_u64(extent.addr.absolute());
                w.put_u64(extent.size);
                Ok(())
            }
            IndirectString::Pending { .. } => Err(StoreError::IndexCorrupt(
                "pending string reached the store unflushed".into(),
            )),
        }
    }

    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self> {
        let addr = r.get_u64()?;
        let size = r.get_u64()?;
        Ok(IndirectString::Committed {
            extent: Extent::new(crate::address::Address::new(addr), size),
        })
    }

    fn key_eq(&self, stored: &Self, db: &Database) -> Result<bool> {
        if let (
            IndirectString::Committed { extent: a },
            IndirectString::Committed { extent: b },
        ) = (self, stored)
        {
            if a == b {
                return Ok(true);
            }
        }
        Ok(*self.bytes(db)? == *stored.bytes(db)?)
    }
}

// ── NameIndex ──────────────────────────────────────────────────────

/// The interning index: a set of unique strings stored indirectly.
pub struct NameIndex {
    map: HamtMap<IndirectString, ()>,
    next_seq: u64,
}

impl NameIndex {
    pub fn empty() -> Self {
        NameIndex {
            map: HamtMap::empty(),
            next_seq: 0,
        }
    }

    pub fn load(db: &Database, record: Extent<u8>) -> Result<Self> {
        Ok(NameIndex {
            map: HamtMap::load(db, record)?,
            next_seq: 0,
        })
    }

    /// Number of interned strings, pending ones included.
    #[inline]
    pub fn len(&self) -> u64 {
        self.map.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Intern `bytes`. Returns true iff the string was new; interning an
    /// already known string (committed or pending) changes nothing.
    pub fn intern(&mut self, tx: &Transaction<'_>, bytes: &[u8]) -> Result<bool> {
        if self
            .map
            .find_entry(tx.db(), &IndirectString::probe(bytes))?
            .is_some()
        {
            return Ok(false);
        }
        let key = IndirectString::Pending {
            seq: self.next_seq,
            bytes: bytes.into(),
        };
        self.next_seq += 1;
        let inserted = self.map.insert_or_assign(tx, key, ())?;
        debug_assert!(inserted);
        Ok(true)
    }

    /// Whether `bytes` is interned, pending strings included.
    pub fn contains(&self, db: &Database, bytes: &[u8]) -> Result<bool> {
        Ok(self
            .map
            .find_entry(db, &IndirectString::probe(bytes))?
            .is_some())
    }

    /// The committed location of `bytes`. A string that is still pending
    /// in the current transaction has no location yet and reports None;
    /// use [`NameIndex::contains`] for membership.
    pub fn find(&self, db: &Database, bytes: &[u8]) -> Result<Option<Extent<u8>>> {
        match self.map.find_entry(db, &IndirectString::probe(bytes))? {
            Some((IndirectString::Committed { extent }, ())) => Ok(Some(extent)),
            Some((IndirectString::Pending { .. }, ())) => Ok(None),
            None => Ok(None),
        }
    }

    /// Lay out pending strings contiguously in insertion order, then
    /// flush the trie.
    pub fn flush(&mut self, tx: &mut Transaction<'_>) -> Result<Extent<u8>> {
        if self.map.is_dirty() {
            let mut pending: Vec<(u64, Box<[u8]>)> = Vec::new();
            self.map.for_each_heap_key_mut(&mut |k| {
                if let IndirectString::Pending { seq, bytes } = k {
                    pending.push((*seq, bytes.clone()));
                }
            });
            pending.sort_by_key(|&(seq, _)| seq);

            let mut extents: HashMap<u64, Extent<u8>> = HashMap::new();
            for (seq, bytes) in &pending {
                extents.insert(*seq, tx.write_bytes(bytes, 1)?);
            }

            self.map.for_each_heap_key_mut(&mut |k| {
                if let IndirectString::Pending { seq, .. } = k {
                    let extent = extents[seq];
                    *k = IndirectString::Committed { extent };
                }
            });
            self.next_seq = 0;
        }
        self.map.flush(tx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;
    use crate::index::IndexSet;
    use crate::region::RegionConfig;
    use tempfile::TempDir;

    fn test_config() -> RegionConfig {
        RegionConfig {
            min_region_size: 4096,
            full_region_size: 16384,
        }
    }

    fn new_db(dir: &TempDir) -> Database {
        Database::create_with(&dir.path().join("t.db"), test_config()).unwrap()
    }

    #[test]
    fn test_intern_and_find_after_flush() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut names = NameIndex::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        assert!(names.intern(&tx, b"alpha").unwrap());
        assert!(names.intern(&tx, b"beta").unwrap());
        assert!(!names.intern(&tx, b"alpha").unwrap());
        assert_eq!(names.len(), 2);

        // Pending strings are visible but have no location yet.
        assert!(names.contains(tx.db(), b"alpha").unwrap());
        assert!(names.find(tx.db(), b"alpha").unwrap().is_none());

        let record = names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let names = NameIndex::load(&db, record).unwrap();
        let alpha = names.find(&db, b"alpha").unwrap().unwrap();
        assert_eq!(&*db.read_extent(alpha).unwrap(), b"alpha");
        let beta = names.find(&db, b"beta").unwrap().unwrap();
        assert_eq!(&*db.read_extent(beta).unwrap(), b"beta");
        assert!(names.find(&db, b"gamma").unwrap().is_none());
    }

    #[test]
    fn test_pending_bytes_laid_out_in_insertion_order() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut names = NameIndex::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        names.intern(&tx, b"first").unwrap();
        names.intern(&tx, b"second").unwrap();
        names.intern(&tx, b"third").unwrap();
        names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let first = names.find(&db, b"first").unwrap().unwrap();
        let second = names.find(&db, b"second").unwrap().unwrap();
        let third = names.find(&db, b"third").unwrap().unwrap();

        // Contiguous, in insertion order.
        assert_eq!(second.addr, first.end());
        assert_eq!(third.addr, second.end());
    }

    #[test]
    fn test_reintern_committed_string_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut names = NameIndex::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        names.intern(&tx, b"stable").unwrap();
        let r1 = names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);
        let loc1 = names.find(&db, b"stable").unwrap().unwrap();

        let mut tx = Transaction::begin(&mut db).unwrap();
        assert!(!names.intern(&tx, b"stable").unwrap());
        let r2 = names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        // Nothing changed: same root record, same location.
        assert_eq!(r1, r2);
        assert_eq!(names.find(&db, b"stable").unwrap().unwrap(), loc1);
    }

    #[test]
    fn test_interning_across_revisions() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut names = NameIndex::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        names.intern(&tx, b"one").unwrap();
        names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let mut tx = Transaction::begin(&mut db).unwrap();
        assert!(names.intern(&tx, b"two").unwrap());
        assert!(!names.intern(&tx, b"one").unwrap());
        let record = names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let names = NameIndex::load(&db, record).unwrap();
        assert_eq!(names.len(), 2);
        assert!(names.find(&db, b"one").unwrap().is_some());
        assert!(names.find(&db, b"two").unwrap().is_some());
    }

    #[test]
    fn test_empty_and_unicode_strings() {
        let dir = TempDir::new().unwrap();
        let mut db = new_db(&dir);
        let mut indexes = IndexSet::new();

        let mut names = NameIndex::empty();
        let mut tx = Transaction::begin(&mut db).unwrap();
        names.intern(&tx, b"").unwrap();
        names.intern(&tx, "путь".as_bytes()).unwrap();
        names.flush(&mut tx).unwrap();
        tx.commit(&mut indexes).unwrap();
        drop(tx);

        let empty = names.find(&db, b"").unwrap().unwrap();
        assert_eq!(empty.size, 0);
        let cyr = names.find(&db, "путь".as_bytes()).unwrap().unwrap();
        assert_eq!(&*db.read_extent(cyr).unwrap(), "путь".as_bytes());
    }
}
