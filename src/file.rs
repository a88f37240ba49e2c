//! Store file handle and the advisory transaction lock.
//!
//! The transaction lock is a POSIX `fcntl` byte-range write lock over a
//! reserved range of the header. The kernel drops it when the owning
//! process exits, which is what makes crash recovery on the next open
//! safe: a dead writer can never leave the store locked.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use crate::error::{Result, StoreError};
use crate::format::{LOCK_LEN, LOCK_OFFSET};

// ── Access mode ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    Writable,
}

impl AccessMode {
    #[inline]
    pub fn is_writable(self) -> bool {
        matches!(self, AccessMode::Writable)
    }
}

// ── StoreFile ──────────────────────────────────────────────────────

/// An open store file.
#[derive(Debug)]
pub struct StoreFile {
    file: File,
    path: PathBuf,
    mode: AccessMode,
}

impl StoreFile {
    /// Create a brand-new store file. Fails if the path already exists.
    pub fn create(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(StoreFile {
            file,
            path: path.to_path_buf(),
            mode: AccessMode::Writable,
        })
    }

    /// Open an existing store file.
    pub fn open(path: &Path, mode: AccessMode) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(mode.is_writable())
            .open(path)?;
        Ok(StoreFile {
            file,
            path: path.to_path_buf(),
            mode,
        })
    }

    #[inline]
    pub fn file(&self) -> &File {
        &self.file
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current file length in bytes.
    pub fn size(&self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    /// Set the file length (grow or truncate).
    pub fn set_len(&self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    /// Flush file metadata and data to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    /// Acquire the transaction lock, blocking until it is free.
    pub fn lock_transaction(&self) -> Result<LockGuard> {
        fcntl_lock(&self.file, libc::F_SETLKW, libc::F_WRLCK)?;
        Ok(LockGuard {
            fd: self.file.as_raw_fd(),
        })
    }

    /// Acquire the transaction lock without blocking. Returns
    /// [`StoreError::LockBusy`] if another process holds it.
    pub fn try_lock_transaction(&self) -> Result<LockGuard> {
        match fcntl_lock(&self.file, libc::F_SETLK, libc::F_WRLCK) {
            Ok(()) => Ok(LockGuard {
                fd: self.file.as_raw_fd(),
            }),
            Err(e)
                if e.raw_os_error() == Some(libc::EAGAIN)
                    || e.raw_os_error() == Some(libc::EACCES) =>
            {
                Err(StoreError::LockBusy)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ── LockGuard ──────────────────────────────────────────────────────

/// Holds the transaction lock; releases it on drop.
///
/// Only the raw descriptor is kept so the guard does not borrow the
/// store file. The descriptor outlives the guard because the guard lives
/// inside the transaction, which borrows the database exclusively.
#[derive(Debug)]
pub struct LockGuard {
    fd: RawFd,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let mut fl: libc::flock = unsafe { std::mem::zeroed() };
        fl.l_type = libc::F_UNLCK as libc::c_short;
        fl.l_whence = libc::SEEK_SET as libc::c_short;
        fl.l_start = LOCK_OFFSET as libc::off_t;
        fl.l_len = LOCK_LEN as libc::off_t;
        // Nothing useful to do on failure during drop; the kernel will
        // release the lock when the descriptor closes anyway.
        unsafe {
            libc::fcntl(self.fd, libc::F_SETLK, &fl);
        }
    }
}

fn fcntl_lock(file: &File, cmd: libc::c_int, lock_type: libc::c_int) -> io::Result<()> {
    let mut fl: libc::flock = unsafe { std::mem::zeroed() };
    fl.l_type = lock_type as libc::c_short;
    fl.l_whence = libc::SEEK_SET as libc::c_short;
    fl.l_start = LOCK_OFFSET as libc::off_t;
    fl.l_len = LOCK_LEN as libc::off_t;
    let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &fl) };
    if rc == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
