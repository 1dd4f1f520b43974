//! SQLite VFS (Virtual File System) over asynchronous block storage
//!
//! The engine drives files through a synchronous contract ([`Vfs`] and
//! [`VfsFile`]). Two implementations exist:
//!
//! - [`VfsAdapter`] persists into a [`BlockStore`](crate::BlockStore).
//!   Mutations are applied to memory at once and queued for durable
//!   execution; `sync` hands back a [`SyncBarrier`] the host can await.
//! - [`MemoryVfsAdapter`] keeps each file as one growable byte array, for
//!   databases that are never meant to outlive the process.
//!
//! [`register_vfs`] exposes either one to SQLite as a `sqlite3_vfs`.

mod adapter;
mod file;
mod handle;
mod memory;
mod vfs;

#[cfg(test)]
mod tests;

pub use adapter::VfsAdapter;
pub use handle::SyncFileHandle;
pub use memory::{MemoryFileHandle, MemoryVfsAdapter};
pub use vfs::{register_vfs, unregister_vfs, DEFAULT_MAX_PATHNAME, DEFAULT_VFS_NAME};

use crate::core::block_store::BLOCK_SIZE;
use crate::core::lock::LockLevel;
use crate::core::queue::SyncBarrier;
use crate::error::Result;

/// How a file is being opened
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpenFlags {
    pub create: bool,
    pub exclusive: bool,
    pub read_only: bool,
    pub delete_on_close: bool,
}

impl OpenFlags {
    /// Open an existing file for reading and writing
    pub fn existing() -> Self {
        Self::default()
    }

    /// Open, creating the file if it is absent
    pub fn create() -> Self {
        Self {
            create: true,
            ..Self::default()
        }
    }

    pub fn read_only() -> Self {
        Self {
            read_only: true,
            ..Self::default()
        }
    }

    /// Translate the engine's `SQLITE_OPEN_*` bits
    pub fn from_sqlite(flags: i32) -> Self {
        use libsqlite3_sys as ffi;
        Self {
            create: flags & ffi::SQLITE_OPEN_CREATE != 0,
            exclusive: flags & ffi::SQLITE_OPEN_EXCLUSIVE != 0,
            read_only: flags & ffi::SQLITE_OPEN_READONLY != 0,
            delete_on_close: flags & ffi::SQLITE_OPEN_DELETEONCLOSE != 0,
        }
    }
}

/// File-system half of the engine's synchronous contract
pub trait Vfs: Send + Sync {
    /// Open `name`, or an anonymous temp file when `name` is `None`
    fn open_file(&self, name: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>>;

    fn delete(&self, name: &str) -> Result<()>;

    fn access(&self, name: &str) -> bool;

    fn full_pathname(&self, name: &str) -> Result<String> {
        Ok(normalize_path(name))
    }

    /// Longest path the engine may pass in, reported as `mxPathname`
    fn max_pathname(&self) -> usize {
        DEFAULT_MAX_PATHNAME
    }
}

/// Per-file half of the engine's synchronous contract
///
/// No method ever suspends. `sync` and `close` return a barrier instead of
/// waiting for durability.
pub trait VfsFile: Send {
    /// Fill `buf` from `offset`; returns how many bytes came from the file.
    /// Bytes past end of file are zeroed.
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize>;

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()>;

    fn truncate(&mut self, size: u64) -> Result<()>;

    fn sync(&mut self) -> Result<SyncBarrier>;

    fn file_size(&self) -> u64;

    fn lock(&mut self, level: LockLevel) -> Result<()>;

    fn unlock(&mut self, level: LockLevel) -> Result<()>;

    fn check_reserved_lock(&self) -> bool;

    fn close(&mut self) -> Result<SyncBarrier>;

    fn name(&self) -> &str;

    fn sector_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn device_characteristics(&self) -> i32 {
        0
    }
}

/// Collapse `name` into an absolute path without `.`, `..` or empty
/// segments
pub fn normalize_path(name: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in name.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}
