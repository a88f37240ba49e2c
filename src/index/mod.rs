//! Persistent indices stored in the file.
//!
//! Each revision's trailer carries one root record per named index. The
//! records are loaded lazily into an [`IndexSet`], mutated through a
//! transaction, and flushed back into the next trailer on commit.

pub mod hamt;
pub mod name;

use crate::address::Extent;
use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::fnv::fnv1a_64;
use crate::format::NUM_INDICES;
use crate::serialize::{ArchiveReader, ArchiveWriter};
use crate::transaction::Transaction;
use crate::uint128::UInt128;

pub use hamt::HamtMap;
pub use name::NameIndex;

// ── Key / value traits ─────────────────────────────────────────────

/// A key storable in a HAMT index.
pub trait IndexKey: Clone {
    /// The 64-bit hash that drives the trie. Called on probe and insert
    /// keys only; stored keys keep their hash in the leaf record.
    fn hash_key(&self) -> u64;

    fn encode(&self, w: &mut ArchiveWriter) -> Result<()>;

    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self>;

    /// Full equality between a probe key (`self`) and a stored key.
    /// `db` lets indirect keys materialise their committed bytes.
    fn key_eq(&self, stored: &Self, db: &Database) -> Result<bool>;
}

/// A value storable in a HAMT index.
pub trait IndexValue: Clone {
    fn encode(&self, w: &mut ArchiveWriter) -> Result<()>;
    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self>;
}

impl IndexKey for String {
    fn hash_key(&self) -> u64 {
        fnv1a_64(self.as_bytes())
    }

    fn encode(&self, w: &mut ArchiveWriter) -> Result<()> {
        w.put_lp_bytes(self.as_bytes());
        Ok(())
    }

    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self> {
        let bytes = r.get_lp_bytes()?;
        String::from_utf8(bytes)
            .map_err(|_| StoreError::IndexCorrupt("stored key is not UTF-8".into()))
    }

    fn key_eq(&self, stored: &Self, _db: &Database) -> Result<bool> {
        Ok(self == stored)
    }
}

impl IndexKey for UInt128 {
    fn hash_key(&self) -> u64 {
        // Digests are already uniformly distributed; fold the limbs.
        self.low() ^ self.high().rotate_left(1)
    }

    fn encode(&self, w: &mut ArchiveWriter) -> Result<()> {
        w.put_bytes(&self.to_le_bytes());
        Ok(())
    }

    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self> {
        let bytes = r.get_bytes(16)?;
        Ok(UInt128::from_le_bytes(bytes[..16].try_into().unwrap()))
    }

    fn key_eq(&self, stored: &Self, _db: &Database) -> Result<bool> {
        Ok(self == stored)
    }
}

impl IndexValue for Extent<u8> {
    fn encode(&self, w: &mut ArchiveWriter) -> Result<()> {
        w.put_u64(self.addr.absolute());
        w.put_u64(self.size);
        Ok(())
    }

    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self> {
        let addr = r.get_u64()?;
        let size = r.get_u64()?;
        Ok(Extent::new(crate::address::Address::new(addr), size))
    }
}

impl IndexValue for u64 {
    fn encode(&self, w: &mut ArchiveWriter) -> Result<()> {
        w.put_u64(*self);
        Ok(())
    }

    fn decode(r: &mut ArchiveReader<'_>) -> Result<Self> {
        r.get_u64()
    }
}

impl IndexValue for () {
    fn encode(&self, _w: &mut ArchiveWriter) -> Result<()> {
        Ok(())
    }

    fn decode(_r: &mut ArchiveReader<'_>) -> Result<Self> {
        Ok(())
    }
}

// ── Index identity ─────────────────────────────────────────────────

/// The named indices, in trailer record order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum IndexId {
    /// Content digest → stored fragment bytes.
    Digest = 0,
    /// Interned strings.
    Name = 1,
    /// Free-form key → extent map.
    Write = 2,
}

impl IndexId {
    pub const ALL: [IndexId; NUM_INDICES] = [IndexId::Digest, IndexId::Name, IndexId::Write];

    pub fn name(self) -> &'static str {
        match self {
            IndexId::Digest => "digest",
            IndexId::Name => "name",
            IndexId::Write => "write",
        }
    }
}

/// Digest index: content digest → extent of the stored bytes.
pub type DigestIndex = HamtMap<UInt128, Extent<u8>>;

/// Write index: string key → extent.
pub type WriteIndex = HamtMap<String, Extent<u8>>;

// ── IndexSet ───────────────────────────────────────────────────────

/// The lazily loaded indices of one database handle.
///
/// Loading pins each index to the database's revision at load time; a
/// `sync` to another revision calls for a fresh set.
#[derive(Default)]
pub struct IndexSet {
    digest: Option<DigestIndex>,
    name: Option<NameIndex>,
    write: Option<WriteIndex>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The digest index at the database's pinned revision.
    pub fn digest_index(&mut self, db: &Database) -> Result<&mut DigestIndex> {
        if self.digest.is_none() {
            let record = db.trailer().index_records[IndexId::Digest as usize];
            self.digest = Some(DigestIndex::load(db, record)?);
        }
        Ok(self.digest.as_mut().unwrap())
    }

    /// The name (string-interning) index.
    pub fn name_index(&mut self, db: &Database) -> Result<&mut NameIndex> {
        if self.name.is_none() {
            let record = db.trailer().index_records[IndexId::Name as usize];
            self.name = Some(NameIndex::load(db, record)?);
        }
        Ok(self.name.as_mut().unwrap())
    }

    /// The write index.
    pub fn write_index(&mut self, db: &Database) -> Result<&mut WriteIndex> {
        if self.write.is_none() {
            let record = db.trailer().index_records[IndexId::Write as usize];
            self.write = Some(WriteIndex::load(db, record)?);
        }
        Ok(self.write.as_mut().unwrap())
    }

    /// Flush every loaded index and produce the trailer's record table.
    /// Unloaded indices carry their previous records forward unchanged.
    pub(crate) fn flush(
        &mut self,
        tx: &mut Transaction<'_>,
        generation: u32,
    ) -> Result<[Extent<u8>; NUM_INDICES]> {
        let mut records = tx.db().trailer().index_records;
        if let Some(digest) = self.digest.as_mut() {
            records[IndexId::Digest as usize] = digest.flush(tx)?;
        }
        if let Some(name) = self.name.as_mut() {
            records[IndexId::Name as usize] = name.flush(tx)?;
        }
        if let Some(write) = self.write.as_mut() {
            records[IndexId::Write as usize] = write.flush(tx)?;
        }
        tracing::debug!(generation, "flushed index roots");
        Ok(records)
    }
}
