//! Persistent VFS over a block store

use super::handle::SyncFileHandle;
use super::{normalize_path, OpenFlags, Vfs, VfsFile};
use crate::config::VfsConfig;
use crate::core::block_store::{BlockStore, WriteBatch};
use crate::core::file_table::{FileId, FileTable};
use crate::core::queue::{IdMap, OperationQueue, OperationTicket, PendingOperation, QueueStats};
use crate::error::{Result, VfsError};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

struct AdapterInner {
    config: VfsConfig,
    store: Arc<dyn BlockStore>,
    files: Mutex<FileTable>,
    queue: OperationQueue,
    next_handle: AtomicU64,
    next_temp: AtomicU64,
}

/// VFS persisting into a [`BlockStore`]
///
/// Cheap to clone; every clone and every handle shares one file table and
/// one operation queue. The drain task lives as long as the last clone.
#[derive(Clone)]
pub struct VfsAdapter {
    inner: Arc<AdapterInner>,
}

impl VfsAdapter {
    /// Load the store's catalog and every file into memory, then start
    /// draining
    ///
    /// Must be called from within a tokio runtime.
    pub async fn mount(store: Arc<dyn BlockStore>, config: VfsConfig) -> Result<Self> {
        config.validate()?;

        let mut files = FileTable::new();
        let mut ids = IdMap::new();
        for (name, store_id) in store.list_files().await? {
            let content = store.read_file(store_id).await?;
            debug!("loaded {} ({} bytes)", name, content.len());
            let id = files.insert_loaded(&name, content);
            ids.insert(id, store_id);
        }
        info!("Mounted VFS '{}' with {} files", config.name, files.len());

        let queue = OperationQueue::start(Arc::clone(&store), ids);
        Ok(Self {
            inner: Arc::new(AdapterInner {
                config,
                store,
                files: Mutex::new(files),
                queue,
                next_handle: AtomicU64::new(1),
                next_temp: AtomicU64::new(1),
            }),
        })
    }

    /// Mount the store described by `config.store`
    pub async fn from_config(config: VfsConfig) -> Result<Self> {
        let store = config.store.open().await?;
        Self::mount(store, config).await
    }

    pub fn config(&self) -> &VfsConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.inner.store
    }

    /// Open `name`, creating it if `flags.create` is set
    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<SyncFileHandle> {
        let mut files = self.inner.files.lock();
        let (id, create) = match files.lookup(name) {
            Some(_) if flags.create && flags.exclusive => {
                return Err(VfsError::AlreadyExists(name.to_string()));
            }
            Some(id) => (id, None),
            None if flags.create => {
                let id = files.create(name);
                let ticket = self.inner.queue.enqueue(PendingOperation::CreateFile {
                    file: id,
                    name: name.to_string(),
                });
                debug!("created {} as {}", name, id);
                (id, Some(ticket))
            }
            None => return Err(VfsError::NotFound(name.to_string())),
        };

        let image = files
            .image(id)
            .ok_or_else(|| VfsError::Consistency(format!("{} vanished while opening", id)))?;
        let length = files.length(id).unwrap_or(0);
        drop(files);

        let handle = self.inner.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!("opened {} ({}) as handle {}", name, id, handle);
        Ok(SyncFileHandle::new(
            self.clone(),
            id,
            name.to_string(),
            handle,
            image,
            length,
            flags,
            create,
        ))
    }

    /// Open a fresh temp file that disappears on close
    pub fn open_temp(&self, flags: OpenFlags) -> Result<SyncFileHandle> {
        let n = self.inner.next_temp.fetch_add(1, Ordering::Relaxed);
        let name = format!("{}{}", self.inner.config.temp_prefix, n);
        self.open(
            &name,
            OpenFlags {
                create: true,
                exclusive: true,
                delete_on_close: true,
                ..flags
            },
        )
    }

    pub fn access(&self, name: &str) -> bool {
        self.inner.files.lock().lookup(name).is_some()
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        let mut files = self.inner.files.lock();
        let id = files
            .lookup(name)
            .ok_or_else(|| VfsError::NotFound(name.to_string()))?;
        files.remove(id);
        self.inner.queue.enqueue(PendingOperation::DeleteFile { file: id });
        debug!("deleted {} ({})", name, id);
        Ok(())
    }

    pub fn full_pathname(&self, name: &str) -> Result<String> {
        let path = normalize_path(name);
        if path.len() >= self.inner.config.max_pathname {
            return Err(VfsError::Protocol(format!(
                "path longer than {} bytes",
                self.inner.config.max_pathname
            )));
        }
        Ok(path)
    }

    /// `(name, length)` of every file as the synchronous surface sees it
    pub fn list(&self) -> Vec<(String, u64)> {
        self.inner.files.lock().list()
    }

    /// Wait until every operation accepted so far has settled
    ///
    /// Reports the first durable failure seen since the previous flush.
    pub async fn flush(&self) -> Result<()> {
        self.inner.queue.flush().wait().await;
        match self.inner.queue.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Drain the queue and stop the drain task
    pub async fn shutdown(&self) -> Result<()> {
        self.inner.queue.shutdown().await;
        info!("VFS '{}' shut down", self.inner.config.name);
        match self.inner.queue.take_failure() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.inner.queue.stats()
    }

    pub(crate) fn files(&self) -> MutexGuard<'_, FileTable> {
        self.inner.files.lock()
    }

    pub(crate) fn queue(&self) -> &OperationQueue {
        &self.inner.queue
    }

    /// Queue the whole resident state of `id` again
    ///
    /// Used after a durable operation on the file failed: a create (skipped
    /// by the drain if the store already has the file) and one write holding
    /// every resident block. Returns nothing for a file no longer present.
    pub(crate) fn restore(&self, id: FileId) -> Vec<OperationTicket> {
        let files = self.inner.files.lock();
        let (Some(name), Some(image)) = (files.name(id), files.image(id)) else {
            return Vec::new();
        };
        let length = files.length(id).unwrap_or(0);
        let batch = WriteBatch::covering(&image.content.read(), length);

        debug!("re-submitting {} ({}, {} bytes)", name, id, length);
        let create = self.inner.queue.enqueue(PendingOperation::CreateFile {
            file: id,
            name: name.to_string(),
        });
        let write = self
            .inner
            .queue
            .enqueue(PendingOperation::WriteBytes { file: id, batch });
        vec![create, write]
    }

    /// Apply `mutate` to the file table and queue `op` in the same step
    pub(crate) fn accept<F>(&self, op: PendingOperation, mutate: F) -> Result<OperationTicket>
    where
        F: FnOnce(&mut FileTable),
    {
        let mut files = self.inner.files.lock();
        let id: FileId = op.file();
        if !files.contains(id) {
            return Err(VfsError::Consistency(format!("{} is no longer in the file table", id)));
        }
        mutate(&mut *files);
        Ok(self.inner.queue.enqueue(op))
    }
}

impl Vfs for VfsAdapter {
    fn open_file(&self, name: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let handle = match name {
            Some(name) => self.open(name, flags)?,
            None => self.open_temp(flags)?,
        };
        Ok(Box::new(handle))
    }

    fn delete(&self, name: &str) -> Result<()> {
        VfsAdapter::delete(self, name)
    }

    fn access(&self, name: &str) -> bool {
        VfsAdapter::access(self, name)
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        VfsAdapter::full_pathname(self, name)
    }

    fn max_pathname(&self) -> usize {
        self.inner.config.max_pathname
    }
}
