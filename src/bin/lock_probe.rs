//! Cross-process lock probe used by the integration tests.
//!
//! Opens the store at `argv[1]` writable and attempts a non-blocking
//! transaction. Exit codes: 0 = lock acquired, 2 = lock held elsewhere,
//! 1 = any other failure.

use std::path::Path;
use std::process::exit;

use aodb::{AccessMode, Database, StoreError, Transaction};

fn main() {
    let Some(path) = std::env::args().nth(1) else {
        eprintln!("usage: lock_probe <store>");
        exit(1);
    };

    let mut db = match Database::open(Path::new(&path), AccessMode::Writable) {
        Ok(db) => db,
        Err(e) => {
            eprintln!("open failed: {e}");
            exit(1);
        }
    };

    let code = match Transaction::try_begin(&mut db) {
        Ok(mut tx) => {
            let _ = tx.rollback();
            0
        }
        Err(StoreError::LockBusy) => 2,
        Err(e) => {
            eprintln!("try_begin failed: {e}");
            1
        }
    };
    exit(code);
}
