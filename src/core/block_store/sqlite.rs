//! Durable block store backed by a SQLite database file
//!
//! Layout:
//!
//! ```text
//! files(id INTEGER PRIMARY KEY, name TEXT UNIQUE, length INTEGER)
//! blocks(file_id, block_index, data BLOB, PRIMARY KEY(file_id, block_index))
//! ```
//!
//! Every operation runs in its own transaction on tokio's blocking pool.

use super::{assemble, blocks_for, BlockStore, StoreFileId, WriteBatch, BLOCK_SIZE};
use crate::error::{Result, VfsError};
use async_trait::async_trait;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS files (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        length INTEGER NOT NULL DEFAULT 0
    );
    CREATE TABLE IF NOT EXISTS blocks (
        file_id INTEGER NOT NULL REFERENCES files(id) ON DELETE CASCADE,
        block_index INTEGER NOT NULL,
        data BLOB NOT NULL,
        PRIMARY KEY (file_id, block_index)
    );
";

/// Block store persisted in a SQLite database
pub struct SqliteBlockStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl SqliteBlockStore {
    /// Open or create a store at `path`
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        Self::init(&conn)?;
        info!("Opened SQLite block store at {:?}", path.as_ref());
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.as_ref().to_path_buf()),
        })
    }

    /// Store in a private in-memory SQLite database
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn init(conn: &Connection) -> Result<()> {
        conn.pragma_update(None, "foreign_keys", true)?;
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run `f` against the connection on the blocking pool
    async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock();
            f(&mut conn)
        })
        .await?
    }
}

fn require_file(conn: &Connection, id: StoreFileId) -> Result<u64> {
    let length: Option<i64> = conn
        .query_row("SELECT length FROM files WHERE id = ?1", params![id], |row| {
            row.get(0)
        })
        .optional()?;
    length
        .map(|len| len as u64)
        .ok_or_else(|| VfsError::Consistency(format!("unknown store file id {}", id)))
}

#[async_trait]
impl BlockStore for SqliteBlockStore {
    async fn list_files(&self) -> Result<BTreeMap<String, StoreFileId>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT name, id FROM files")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, StoreFileId>(1)?))
            })?;
            let mut files = BTreeMap::new();
            for row in rows {
                let (name, id) = row?;
                files.insert(name, id);
            }
            Ok(files)
        })
        .await
    }

    async fn read_file(&self, id: StoreFileId) -> Result<Vec<u8>> {
        self.with_conn(move |conn| {
            let length = require_file(conn, id)?;
            let mut stmt = conn.prepare(
                "SELECT block_index, data FROM blocks WHERE file_id = ?1 AND block_index < ?2",
            )?;
            let rows = stmt.query_map(params![id, blocks_for(length) as i64], |row| {
                Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?))
            })?;
            let mut blocks = Vec::new();
            for row in rows {
                blocks.push(row?);
            }
            Ok(assemble(
                length,
                blocks.iter().map(|(index, data)| (*index, data.as_slice())),
            ))
        })
        .await
    }

    async fn create_file(&self, name: &str) -> Result<StoreFileId> {
        let name = name.to_string();
        self.with_conn(move |conn| {
            let exists: Option<i64> = conn
                .query_row("SELECT id FROM files WHERE name = ?1", params![name], |row| {
                    row.get(0)
                })
                .optional()?;
            if exists.is_some() {
                return Err(VfsError::AlreadyExists(name));
            }
            conn.execute(
                "INSERT INTO files (name, length) VALUES (?1, 0)",
                params![name],
            )?;
            let id = conn.last_insert_rowid();
            debug!("sqlite store: created {} as {}", name, id);
            Ok(id)
        })
        .await
    }

    async fn write_ranges(&self, id: StoreFileId, batch: &WriteBatch) -> Result<()> {
        let blocks: Vec<(u64, Vec<u8>)> = batch
            .coalesced()
            .into_iter()
            .map(|(index, bytes)| {
                let mut block = vec![0u8; BLOCK_SIZE];
                block[..bytes.len()].copy_from_slice(bytes);
                (index, block)
            })
            .collect();
        let new_length = batch.new_length;

        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            require_file(&tx, id)?;
            {
                let mut upsert = tx.prepare(
                    "INSERT OR REPLACE INTO blocks (file_id, block_index, data) VALUES (?1, ?2, ?3)",
                )?;
                for (index, block) in &blocks {
                    upsert.execute(params![id, *index as i64, block])?;
                }
            }
            tx.execute(
                "DELETE FROM blocks WHERE file_id = ?1 AND block_index >= ?2",
                params![id, blocks_for(new_length) as i64],
            )?;
            tx.execute(
                "UPDATE files SET length = ?2 WHERE id = ?1",
                params![id, new_length as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn set_length(&self, id: StoreFileId, length: u64) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            require_file(&tx, id)?;
            tx.execute(
                "DELETE FROM blocks WHERE file_id = ?1 AND block_index >= ?2",
                params![id, blocks_for(length) as i64],
            )?;

            let tail = (length % BLOCK_SIZE as u64) as usize;
            if tail != 0 {
                let boundary = (length / BLOCK_SIZE as u64) as i64;
                let data: Option<Vec<u8>> = tx
                    .query_row(
                        "SELECT data FROM blocks WHERE file_id = ?1 AND block_index = ?2",
                        params![id, boundary],
                        |row| row.get(0),
                    )
                    .optional()?;
                if let Some(mut data) = data {
                    if data.len() > tail {
                        data[tail..].fill(0);
                        tx.execute(
                            "UPDATE blocks SET data = ?3 WHERE file_id = ?1 AND block_index = ?2",
                            params![id, boundary, data],
                        )?;
                    }
                }
            }

            tx.execute(
                "UPDATE files SET length = ?2 WHERE id = ?1",
                params![id, length as i64],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    async fn delete_file(&self, id: StoreFileId) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            require_file(&tx, id)?;
            tx.execute("DELETE FROM blocks WHERE file_id = ?1", params![id])?;
            tx.execute("DELETE FROM files WHERE id = ?1", params![id])?;
            tx.commit()?;
            debug!("sqlite store: deleted {}", id);
            Ok(())
        })
        .await
    }

    async fn file_length(&self, id: StoreFileId) -> Result<u64> {
        self.with_conn(move |conn| require_file(conn, id)).await
    }
}
