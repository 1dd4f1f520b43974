//! Synchronous file handle over the persistent adapter
//!
//! Every method returns without suspending. Reads come from the resident
//! image overlaid with this handle's dirty pages; writes and truncates are
//! applied in memory and queued as durable operations in the same call.

use super::adapter::VfsAdapter;
use super::{OpenFlags, VfsFile};
use crate::core::dirty::DirtyPageBuffer;
use crate::core::file_table::{FileId, FileImage};
use crate::core::lock::{lock_to, HandleId, LockLevel};
use crate::core::queue::{OperationTicket, PendingOperation, SyncBarrier};
use crate::error::{Result, VfsError};
use std::sync::Arc;
use tracing::{debug, warn};

/// One open file of a [`VfsAdapter`]
pub struct SyncFileHandle {
    adapter: VfsAdapter,
    id: FileId,
    name: String,
    handle: HandleId,
    image: Arc<FileImage>,
    buffer: DirtyPageBuffer,
    lock_level: LockLevel,
    dirty: bool,
    flags: OpenFlags,
    /// Operations submitted by this handle whose outcome is not yet known
    unsettled: Vec<OperationTicket>,
    /// A durable operation failed; the store may be missing acknowledged bytes
    diverged: bool,
    closed: bool,
}

impl SyncFileHandle {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        adapter: VfsAdapter,
        id: FileId,
        name: String,
        handle: HandleId,
        image: Arc<FileImage>,
        length: u64,
        flags: OpenFlags,
        create: Option<OperationTicket>,
    ) -> Self {
        let mut file = Self {
            adapter,
            id,
            name,
            handle,
            image,
            buffer: DirtyPageBuffer::new(length),
            lock_level: LockLevel::None,
            dirty: false,
            flags,
            unsettled: Vec::new(),
            diverged: false,
            closed: false,
        };
        if let Some(ticket) = create {
            file.track(ticket);
        }
        file
    }

    pub fn file_id(&self) -> FileId {
        self.id
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn lock_level(&self) -> LockLevel {
        self.lock_level
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(VfsError::Protocol(format!("{} is closed", self.name)));
        }
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        self.ensure_open()?;
        if self.flags.read_only {
            return Err(VfsError::Protocol(format!("{} is open read-only", self.name)));
        }
        if !self.adapter.files().contains(self.id) {
            return Err(VfsError::Consistency(format!("{} was deleted", self.name)));
        }
        Ok(())
    }

    fn track(&mut self, ticket: OperationTicket) {
        if ticket.outcome() == Some(Ok(())) {
            return;
        }
        if self.unsettled.last().map(OperationTicket::seq) != Some(ticket.seq()) {
            self.unsettled.push(ticket);
        }
    }

    /// Drop settled tickets; report the first failure among them
    fn settle(&mut self) -> Result<()> {
        let mut failure = None;
        self.unsettled.retain(|ticket| match ticket.outcome() {
            None => true,
            Some(Ok(())) => false,
            Some(Err(err)) => {
                failure.get_or_insert(err);
                false
            }
        });
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Fold this handle's pages into the shared image
    ///
    /// Only a dirty handle's length is authoritative; a clean one may be
    /// behind another handle's growth.
    fn publish(&mut self) {
        if self.dirty {
            let mut content = self.image.content.write();
            self.buffer.fold_into(&mut content);
            self.dirty = false;
        }
    }

    fn release_locks(&mut self) {
        if self.lock_level != LockLevel::None {
            self.lock_level = self
                .image
                .locks
                .lock()
                .release(self.handle, self.lock_level, LockLevel::None);
        }
    }
}

impl VfsFile for SyncFileHandle {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.ensure_open()?;
        let base = self.image.content.read();
        Ok(self.buffer.read(&base, offset, buf))
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.ensure_writable()?;
        if buf.is_empty() {
            return Ok(());
        }

        {
            let base = self.image.content.read();
            self.buffer.write(&base, offset, buf);
        }
        self.dirty = true;

        let id = self.id;
        let length = self.buffer.length();
        if let Some(batch) = self.buffer.drain_as_write_ranges() {
            let ticket = self.adapter.accept(
                PendingOperation::WriteBytes { file: id, batch },
                |files| files.set_length(id, length),
            )?;
            self.track(ticket);
        }
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;

        self.buffer.truncate(size);
        {
            let mut content = self.image.content.write();
            if content.len() as u64 > size {
                content.truncate(size as usize);
            }
        }
        self.dirty = true;

        let id = self.id;
        let ticket = self.adapter.accept(
            PendingOperation::SetLength { file: id, length: size },
            |files| files.set_length(id, size),
        )?;
        self.track(ticket);
        Ok(())
    }

    fn sync(&mut self) -> Result<SyncBarrier> {
        self.ensure_open()?;
        self.publish();
        let settled = self.settle();
        if settled.is_err() {
            self.diverged = true;
        }
        // Pages of a failed write were already drained, so resend the whole file
        if self.diverged {
            for ticket in self.adapter.restore(self.id) {
                self.track(ticket);
            }
            self.diverged = false;
        }
        settled?;
        Ok(SyncBarrier::new(self.adapter.queue().flush(), self.unsettled.clone()))
    }

    fn file_size(&self) -> u64 {
        self.adapter
            .files()
            .length(self.id)
            .unwrap_or_else(|| self.buffer.length())
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.ensure_open()?;
        let refresh = self.lock_level == LockLevel::None && !self.dirty && self.buffer.is_clean();

        lock_to(&mut *self.image.locks.lock(), self.handle, &mut self.lock_level, level)?;

        // Another handle may have grown or shrunk the file since we last looked
        if refresh {
            if let Some(length) = self.adapter.files().length(self.id) {
                self.buffer.reset(length);
            }
        }
        Ok(())
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.ensure_open()?;
        // Whoever takes the lock next must see what we wrote under it
        self.publish();
        self.lock_level = self
            .image
            .locks
            .lock()
            .release(self.handle, self.lock_level, level);
        Ok(())
    }

    fn check_reserved_lock(&self) -> bool {
        self.lock_level >= LockLevel::Reserved || self.image.locks.lock().is_reserved()
    }

    fn close(&mut self) -> Result<SyncBarrier> {
        if self.closed {
            return Ok(SyncBarrier::ready());
        }

        let barrier = if self.dirty || self.diverged || !self.unsettled.is_empty() {
            self.sync()
        } else {
            Ok(SyncBarrier::ready())
        };

        self.release_locks();
        self.closed = true;
        debug!("closed {} (handle {})", self.name, self.handle);

        if self.flags.delete_on_close {
            match self.adapter.delete(&self.name) {
                Ok(()) | Err(VfsError::NotFound(_)) => {}
                Err(err) => warn!("delete-on-close of {} failed: {}", self.name, err),
            }
        }
        barrier
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for SyncFileHandle {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                warn!("{} dropped with a failed sync: {}", self.name, err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::VfsConfig;
    use crate::core::block_store::{BlockStore, MemoryBlockStore, BLOCK_SIZE};

    async fn mounted() -> (Arc<MemoryBlockStore>, VfsAdapter) {
        let store = Arc::new(MemoryBlockStore::new());
        let adapter = VfsAdapter::mount(store.clone(), VfsConfig::default())
            .await
            .unwrap();
        (store, adapter)
    }

    fn read_vec(file: &dyn VfsFile, offset: u64, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        file.read(&mut out, offset).unwrap();
        out
    }

    #[tokio::test]
    async fn test_write_then_read_before_sync() {
        let (_store, adapter) = mounted().await;
        let mut file = adapter.open("/a.db", OpenFlags::create()).unwrap();

        file.write(b"AAAA", 0).unwrap();
        file.write(b"BB", 2).unwrap();
        assert_eq!(read_vec(&file, 0, 4), b"AABB");
        assert_eq!(file.file_size(), 4);
        assert!(file.is_dirty());
    }

    #[tokio::test]
    async fn test_sync_makes_writes_durable() {
        let (store, adapter) = mounted().await;
        let mut file = adapter.open("/a.db", OpenFlags::create()).unwrap();
        file.write(b"hello", 0).unwrap();

        file.sync().unwrap().wait().await.unwrap();
        assert!(!file.is_dirty());

        let files = store.list_files().await.unwrap();
        assert_eq!(store.read_file(files["/a.db"]).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_burst_of_writes_is_one_store_write() {
        let (store, adapter) = mounted().await;
        let mut file = adapter.open("/burst.db", OpenFlags::create()).unwrap();
        for i in 0..100u64 {
            file.write(&[i as u8; 64], i * 64).unwrap();
        }
        file.sync().unwrap().wait().await.unwrap();
        assert_eq!(store.stats().writes, 1);
    }

    #[tokio::test]
    async fn test_truncate_hides_old_bytes() {
        let (_store, adapter) = mounted().await;
        let mut file = adapter.open("/t.db", OpenFlags::create()).unwrap();
        file.write(&[7u8; BLOCK_SIZE * 2], 0).unwrap();
        file.sync().unwrap().wait().await.unwrap();

        file.truncate(10).unwrap();
        assert_eq!(file.file_size(), 10);

        let mut out = vec![0xFFu8; 20];
        let n = file.read(&mut out, 0).unwrap();
        assert_eq!(n, 10);
        assert!(out[10..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_read_only_rejects_writes() {
        let (_store, adapter) = mounted().await;
        adapter.open("/r.db", OpenFlags::create()).unwrap();
        let mut file = adapter.open("/r.db", OpenFlags::read_only()).unwrap();
        assert!(matches!(file.write(b"x", 0), Err(VfsError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_deferred_failure_surfaces_at_sync() {
        let (store, adapter) = mounted().await;
        let mut file = adapter.open("/f.db", OpenFlags::create()).unwrap();
        file.sync().unwrap().wait().await.unwrap();

        store.set_available(false);
        file.write(b"lost?", 0).unwrap();
        let err = file.sync().unwrap().wait().await.unwrap_err();
        assert!(matches!(err, VfsError::StorageUnavailable(_)));

        // The bytes stay readable from memory
        assert_eq!(read_vec(&file, 0, 5), b"lost?");

        store.set_available(true);
        file.write(b"kept!", 0).unwrap();
        // The settled failure is reported once by sync itself, then dropped
        assert!(matches!(file.sync(), Err(VfsError::StorageUnavailable(_))));
        file.sync().unwrap().wait().await.unwrap();
        assert_eq!(read_vec(&file, 0, 5), b"kept!");
    }

    #[tokio::test]
    async fn test_failed_create_is_resubmitted() {
        let (store, adapter) = mounted().await;
        store.set_available(false);
        let mut file = adapter.open("/late.db", OpenFlags::create()).unwrap();
        file.write(b"born", 0).unwrap();
        assert!(file.sync().unwrap().wait().await.is_err());

        store.set_available(true);
        assert!(matches!(file.sync(), Err(VfsError::StorageUnavailable(_))));
        file.sync().unwrap().wait().await.unwrap();

        let files = store.list_files().await.unwrap();
        assert_eq!(store.read_file(files["/late.db"]).await.unwrap(), b"born");

        file.write(b"!", 4).unwrap();
        file.sync().unwrap().wait().await.unwrap();
        assert_eq!(store.read_file(files["/late.db"]).await.unwrap(), b"born!");
        assert_eq!(store.stats().creates, 1);
    }

    #[tokio::test]
    async fn test_second_handle_sees_synced_growth() {
        let (_store, adapter) = mounted().await;
        let mut writer = adapter.open("/shared.db", OpenFlags::create()).unwrap();
        let mut reader = adapter.open("/shared.db", OpenFlags::existing()).unwrap();

        writer.lock(LockLevel::Exclusive).unwrap();
        writer.write(b"grown", 0).unwrap();
        writer.sync().unwrap();
        writer.unlock(LockLevel::None).unwrap();

        reader.lock(LockLevel::Shared).unwrap();
        assert_eq!(read_vec(&reader, 0, 5), b"grown");
    }

    #[tokio::test]
    async fn test_lock_conflict_between_handles() {
        let (_store, adapter) = mounted().await;
        let mut a = adapter.open("/l.db", OpenFlags::create()).unwrap();
        let mut b = adapter.open("/l.db", OpenFlags::existing()).unwrap();

        a.lock(LockLevel::Shared).unwrap();
        a.lock(LockLevel::Reserved).unwrap();
        b.lock(LockLevel::Shared).unwrap();
        assert!(b.check_reserved_lock());
        assert!(matches!(
            b.lock(LockLevel::Reserved),
            Err(VfsError::LockConflict { .. })
        ));

        a.close().unwrap();
        b.lock(LockLevel::Reserved).unwrap();
        assert_eq!(b.lock_level(), LockLevel::Reserved);
    }

    #[tokio::test]
    async fn test_delete_on_close() {
        let (store, adapter) = mounted().await;
        let mut temp = adapter.open_temp(OpenFlags::default()).unwrap();
        let name = temp.name().to_string();
        temp.write(b"scratch", 0).unwrap();
        assert!(adapter.access(&name));

        temp.close().unwrap();
        assert!(!adapter.access(&name));

        adapter.flush().await.unwrap();
        assert!(store.list_files().await.unwrap().is_empty());
        assert_eq!(store.stats().creates, 0);
    }

    #[tokio::test]
    async fn test_closed_handle_rejects_calls() {
        let (_store, adapter) = mounted().await;
        let mut file = adapter.open("/c.db", OpenFlags::create()).unwrap();
        file.close().unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(file.read(&mut buf, 0), Err(VfsError::Protocol(_))));
        assert!(file.close().unwrap().is_settled());
    }
}
