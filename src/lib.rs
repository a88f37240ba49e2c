//! AODB — a single-writer, many-reader, append-only, memory-mapped,
//! content-addressed datastore.
//!
//! Data is named by byte offsets into one file. All writes happen inside
//! a [`Transaction`] that appends at end-of-file; commit links a new
//! immutable trailer into the revision chain rooted in the file header,
//! giving readers snapshot isolation for free. Durable key→value maps
//! (the digest, name and write indices) are persistent HAMTs whose
//! nodes are shared structurally across revisions.
//!
//! ```no_run
//! use aodb::{AccessMode, Database, IndexSet, Transaction};
//!
//! # fn main() -> aodb::Result<()> {
//! let mut db = Database::create(std::path::Path::new("t.db"))?;
//! let mut indexes = IndexSet::new();
//!
//! let mut tx = Transaction::begin(&mut db)?;
//! let extent = tx.write_bytes(b"hello world\n", 1)?;
//! indexes
//!     .write_index(tx.db())?
//!     .insert_or_assign(&tx, "key".to_string(), extent)?;
//! tx.commit(&mut indexes)?;
//!
//! let reader = Database::open(std::path::Path::new("t.db"), AccessMode::ReadOnly)?;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod database;
pub mod error;
pub mod file;
pub mod fnv;
pub mod format;
pub mod index;
pub mod region;
pub mod serialize;
pub mod storage;
pub mod support;
pub mod transaction;
pub mod uint128;

pub use address::{Address, Extent};
pub use database::{Database, Revision};
pub use error::{Result, StoreError};
pub use file::AccessMode;
pub use index::{DigestIndex, HamtMap, IndexId, IndexSet, NameIndex, WriteIndex};
pub use region::RegionConfig;
pub use transaction::Transaction;
pub use uint128::UInt128;
