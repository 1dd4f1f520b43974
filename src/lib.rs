//! # blockvfs - SQLite over asynchronous block storage
//!
//! `blockvfs` lets SQLite, which only knows a synchronous file API, keep its
//! databases in an asynchronous block store. Every engine call returns at
//! once: reads are served from memory, mutations are applied to memory and
//! queued, and the queue drains into the store on a tokio task.
//!
//! - **Block stores**: [`MemoryBlockStore`] for tests and scratch use,
//!   [`SqliteBlockStore`] for durable storage, or any [`BlockStore`]
//! - **Merge-on-enqueue**: redundant writes, truncates and create/delete
//!   pairs are folded away before they reach the store
//! - **Barriers**: `sync` returns a [`SyncBarrier`]; [`VfsAdapter::flush`]
//!   waits for everything accepted so far
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use blockvfs::{register_vfs, MemoryBlockStore, VfsAdapter, VfsConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> blockvfs::Result<()> {
//! let config = VfsConfig::default().with_name("app");
//! let adapter = VfsAdapter::mount(Arc::new(MemoryBlockStore::new()), config).await?;
//! register_vfs("app", Arc::new(adapter.clone()), false)?;
//!
//! let conn = rusqlite::Connection::open_with_flags(
//!     "file:/app.db?vfs=app",
//!     rusqlite::OpenFlags::SQLITE_OPEN_READ_WRITE
//!         | rusqlite::OpenFlags::SQLITE_OPEN_CREATE
//!         | rusqlite::OpenFlags::SQLITE_OPEN_URI,
//! )?;
//! conn.execute("CREATE TABLE t (x INTEGER)", [])?;
//! drop(conn);
//!
//! // Durable once this returns
//! adapter.flush().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;

pub use crate::config::{StoreConfig, VfsConfig};
pub use crate::core::{
    block_store::{
        BlockStore, DirtyRange, MemoryBlockStore, SqliteBlockStore, StoreFileId, StoreStats,
        WriteBatch, BLOCK_SIZE,
    },
    dirty::DirtyPageBuffer,
    file_table::{FileId, FileTable},
    lock::LockLevel,
    queue::{
        FlushTicket, OperationQueue, OperationTicket, PendingOperation, QueueStats, SyncBarrier,
    },
    vfs::{
        normalize_path, register_vfs, unregister_vfs, MemoryFileHandle, MemoryVfsAdapter,
        OpenFlags, SyncFileHandle, Vfs, VfsAdapter, VfsFile, DEFAULT_MAX_PATHNAME,
        DEFAULT_VFS_NAME,
    },
};
pub use crate::error::{Result, VfsError};
