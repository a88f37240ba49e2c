//! Error types for the datastore.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store is closed")]
    StoreClosed,

    #[error("Operation not allowed in read-only mode")]
    ReadOnly,

    #[error("Store header is corrupt: {0}")]
    HeaderCorrupt(String),

    #[error("Store footer is corrupt: {0}")]
    FooterCorrupt(String),

    #[error("Index structure is corrupt: {0}")]
    IndexCorrupt(String),

    #[error("Unsupported store format version: {major}.{minor}")]
    HeaderVersionMismatch { major: u8, minor: u8 },

    #[error("Unknown revision: {0}")]
    UnknownRevision(u32),

    #[error("Address out of range: {addr:#x}+{size:#x}")]
    BadAddress { addr: u64, size: u64 },

    #[error("Bad alignment: {0}")]
    BadAlignment(u64),

    #[error("Write to read-only address {0:#x}")]
    ReadOnlyAddress(u64),

    #[error("Cannot allocate after commit")]
    CannotAllocateAfterCommit,

    #[error("Short read: wanted {wanted} bytes, got {got}")]
    ShortRead { wanted: u64, got: u64 },

    #[error("Transaction lock is held by another process")]
    LockBusy,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid digest: {0}")]
    BadDigest(String),
}
