//! On-disk file format: header and trailer records.
//!
//! The store file begins with a fixed 64-byte header followed by a
//! sentinel generation-0 trailer. Each committed transaction appends a
//! new trailer at end-of-file and links it to its predecessor, forming
//! the revision chain rooted in `footer_pos`.
//!
//! Header layout (offset 0, little-endian):
//! ```text
//! Offset  Size  Field
//! 0       8     magic: b"aodbStor"
//! 8       4     version: major, minor, patch, reserved
//! 12      16    uuid (generated at creation)
//! 28      2     sync_name: u16
//! 30      2     reserved: 0x00
//! 32      4     crash_indicator: u32 (0 = clean)
//! 36      4     reserved: 0x00
//! 40      8     footer_pos: u64 (atomic; current trailer address)
//! 48      16    reserved — hosts the advisory transaction-lock range
//! ```
//!
//! Trailer layout (one per revision, 8-aligned):
//! ```text
//! Offset  Size  Field
//! 0       8     signature1: b"aodbTrlr"
//! 8       4     generation: u32
//! 12      4     reserved: 0x00
//! 16      8     size: u64 (bytes appended, excl. this trailer)
//! 24      8     time: u64 (ms since Unix epoch)
//! 32      8     prev_generation: u64 (address of previous trailer)
//! 40      48    index_records: 3 x { addr: u64, size: u64 }
//! 88      4     crc: u32 (CRC-32/IEEE over bytes 0..88)
//! 92      8     signature2: b"rlrTbdoa"
//! 100     4     reserved: 0x00
//! ```

use uuid::Uuid;

use crate::address::{Address, Extent};
use crate::error::{Result, StoreError};

// ── Constants ──────────────────────────────────────────────────────

/// Store file magic.
pub const MAGIC: [u8; 8] = *b"aodbStor";

/// Current format version: major, minor, patch, reserved.
pub const VERSION: [u8; 4] = [1, 0, 0, 0];

/// Header size in bytes (fixed, power-of-2).
pub const HEADER_SIZE: u64 = 64;

/// Byte offset of the crash indicator within the header.
pub const CRASH_INDICATOR_OFFSET: u64 = 32;

/// Byte offset of the atomic footer pointer within the header.
pub const FOOTER_POS_OFFSET: u64 = 40;

/// Advisory transaction-lock byte range within the header. Readers never
/// touch these bytes, so locking them cannot interfere with lock-free
/// footer loads.
pub const LOCK_OFFSET: u64 = 48;
pub const LOCK_LEN: u64 = 16;

/// Trailer signatures. `signature2` is `signature1` reversed.
pub const TRAILER_SIGNATURE1: [u8; 8] = *b"aodbTrlr";
pub const TRAILER_SIGNATURE2: [u8; 8] = *b"rlrTbdoa";

/// Number of index-root slots in each trailer.
pub const NUM_INDICES: usize = 3;

/// Trailer size in bytes.
pub const TRAILER_SIZE: u64 = 104;

/// Byte count covered by the trailer CRC (everything before the crc field).
const TRAILER_CRC_COVERAGE: usize = 88;

// ── Header ─────────────────────────────────────────────────────────

/// Parsed store header.
///
/// Written once by [`Header::new`] at store creation; afterwards only the
/// `crash_indicator` and `footer_pos` fields change, and those are
/// re-read from the mapping rather than from this struct.
#[derive(Debug, Clone)]
pub struct Header {
    pub version: [u8; 4],
    pub uuid: Uuid,
    pub sync_name: u16,
    pub crash_indicator: u32,
    pub footer_pos: Address,
}

impl Header {
    /// Header for a freshly created store: new UUID, clean crash
    /// indicator, footer pointer at the sentinel trailer.
    pub fn new() -> Self {
        Header {
            version: VERSION,
            uuid: Uuid::new_v4(),
            sync_name: 0,
            crash_indicator: 0,
            footer_pos: Address::new(HEADER_SIZE),
        }
    }

    /// Parse and validate a header from the first [`HEADER_SIZE`] bytes
    /// of the file.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE as usize {
            return Err(StoreError::HeaderCorrupt(
                "file too small for header".into(),
            ));
        }
        if bytes[0..8] != MAGIC {
            return Err(StoreError::HeaderCorrupt("bad magic".into()));
        }
        let version: [u8; 4] = bytes[8..12].try_into().unwrap();
        if version[0] != VERSION[0] || version[1] != VERSION[1] {
            return Err(StoreError::HeaderVersionMismatch {
                major: version[0],
                minor: version[1],
            });
        }
        let uuid_bytes: [u8; 16] = bytes[12..28].try_into().unwrap();
        let uuid = Uuid::from_bytes(uuid_bytes);
        let sync_name = u16::from_le_bytes(bytes[28..30].try_into().unwrap());
        let crash_indicator = u32::from_le_bytes(bytes[32..36].try_into().unwrap());
        let footer_pos = Address::new(u64::from_le_bytes(bytes[40..48].try_into().unwrap()));

        Ok(Header {
            version,
            uuid,
            sync_name,
            crash_indicator,
            footer_pos,
        })
    }

    /// Serialize to exactly [`HEADER_SIZE`] bytes.
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE as usize] {
        let mut buf = [0u8; HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&MAGIC);
        buf[8..12].copy_from_slice(&self.version);
        buf[12..28].copy_from_slice(self.uuid.as_bytes());
        buf[28..30].copy_from_slice(&self.sync_name.to_le_bytes());
        buf[32..36].copy_from_slice(&self.crash_indicator.to_le_bytes());
        buf[40..48].copy_from_slice(&self.footer_pos.absolute().to_le_bytes());
        buf
    }
}

impl Default for Header {
    fn default() -> Self {
        Self::new()
    }
}

// ── Trailer ────────────────────────────────────────────────────────

/// Per-revision trailer record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trailer {
    /// Strictly increasing across the chain; 0 is the sentinel.
    pub generation: u32,
    /// Bytes appended by the transaction, excluding the trailer itself.
    pub size: u64,
    /// Commit time, milliseconds since the Unix epoch.
    pub time: u64,
    /// Address of the previous trailer; null for the sentinel.
    pub prev_generation: Address,
    /// Root extents of the named indices at this revision. Null extents
    /// mark indices that have never been written.
    pub index_records: [Extent<u8>; NUM_INDICES],
}

impl Trailer {
    /// The sentinel generation-0 trailer written right after the header
    /// at store creation.
    pub fn sentinel(time: u64) -> Self {
        Trailer {
            generation: 0,
            size: 0,
            time,
            prev_generation: Address::NULL,
            index_records: [Extent::NULL; NUM_INDICES],
        }
    }

    /// Serialize to exactly [`TRAILER_SIZE`] bytes, computing the CRC.
    pub fn to_bytes(&self) -> [u8; TRAILER_SIZE as usize] {
        let mut buf = [0u8; TRAILER_SIZE as usize];
        buf[0..8].copy_from_slice(&TRAILER_SIGNATURE1);
        buf[8..12].copy_from_slice(&self.generation.to_le_bytes());
        buf[16..24].copy_from_slice(&self.size.to_le_bytes());
        buf[24..32].copy_from_slice(&self.time.to_le_bytes());
        buf[32..40].copy_from_slice(&self.prev_generation.absolute().to_le_bytes());
        let mut pos = 40;
        for rec in &self.index_records {
            buf[pos..pos + 8].copy_from_slice(&rec.addr.absolute().to_le_bytes());
            buf[pos + 8..pos + 16].copy_from_slice(&rec.size.to_le_bytes());
            pos += 16;
        }
        let crc = crc32fast::hash(&buf[..TRAILER_CRC_COVERAGE]);
        buf[88..92].copy_from_slice(&crc.to_le_bytes());
        buf[92..100].copy_from_slice(&TRAILER_SIGNATURE2);
        buf
    }

    /// Parse and validate a trailer: both signatures and the CRC must
    /// match.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < TRAILER_SIZE as usize {
            return Err(StoreError::FooterCorrupt("truncated trailer".into()));
        }
        if bytes[0..8] != TRAILER_SIGNATURE1 {
            return Err(StoreError::FooterCorrupt("bad signature1".into()));
        }
        if bytes[92..100] != TRAILER_SIGNATURE2 {
            return Err(StoreError::FooterCorrupt("bad signature2".into()));
        }
        let stored_crc = u32::from_le_bytes(bytes[88..92].try_into().unwrap());
        let computed = crc32fast::hash(&bytes[..TRAILER_CRC_COVERAGE]);
        if stored_crc != computed {
            return Err(StoreError::FooterCorrupt(format!(
                "crc mismatch: stored {stored_crc:#x}, computed {computed:#x}"
            )));
        }

        let generation = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        let size = u64::from_le_bytes(bytes[16..24].try_into().unwrap());
        let time = u64::from_le_bytes(bytes[24..32].try_into().unwrap());
        let prev_generation =
            Address::new(u64::from_le_bytes(bytes[32..40].try_into().unwrap()));

        let mut index_records = [Extent::NULL; NUM_INDICES];
        let mut pos = 40;
        for rec in &mut index_records {
            let addr = u64::from_le_bytes(bytes[pos..pos + 8].try_into().unwrap());
            let size = u64::from_le_bytes(bytes[pos + 8..pos + 16].try_into().unwrap());
            *rec = Extent::new(Address::new(addr), size);
            pos += 16;
        }

        Ok(Trailer {
            generation,
            size,
            time,
            prev_generation,
            index_records,
        })
    }
}
