//! Non-persistent VFS keeping each file as one byte array

use super::{normalize_path, OpenFlags, Vfs, VfsFile};
use crate::core::file_table::FileImage;
use crate::core::lock::{lock_to, HandleId, LockLevel};
use crate::core::queue::SyncBarrier;
use crate::error::{Result, VfsError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Default)]
struct MemoryInner {
    files: Mutex<HashMap<String, Arc<FileImage>>>,
    next_handle: AtomicU64,
    next_temp: AtomicU64,
}

/// VFS for databases that never outlive the process
///
/// Files behave exactly as through [`VfsAdapter`](super::VfsAdapter), but
/// there is no queue and no store: `sync` has nothing to wait for.
#[derive(Clone, Default)]
pub struct MemoryVfsAdapter {
    inner: Arc<MemoryInner>,
}

impl MemoryVfsAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open(&self, name: &str, flags: OpenFlags) -> Result<MemoryFileHandle> {
        let image = {
            let mut files = self.inner.files.lock();
            match files.get(name) {
                Some(_) if flags.create && flags.exclusive => {
                    return Err(VfsError::AlreadyExists(name.to_string()));
                }
                Some(image) => Arc::clone(image),
                None if flags.create => {
                    let image = FileImage::new(Vec::new());
                    files.insert(name.to_string(), Arc::clone(&image));
                    debug!("memory vfs: created {}", name);
                    image
                }
                None => return Err(VfsError::NotFound(name.to_string())),
            }
        };

        Ok(MemoryFileHandle {
            vfs: self.clone(),
            name: name.to_string(),
            handle: self.inner.next_handle.fetch_add(1, Ordering::Relaxed),
            image,
            lock_level: LockLevel::None,
            flags,
            closed: false,
        })
    }

    pub fn open_temp(&self, flags: OpenFlags) -> Result<MemoryFileHandle> {
        let n = self.inner.next_temp.fetch_add(1, Ordering::Relaxed) + 1;
        self.open(
            &format!("/memory-tmp-{}", n),
            OpenFlags {
                create: true,
                exclusive: true,
                delete_on_close: true,
                ..flags
            },
        )
    }

    pub fn access(&self, name: &str) -> bool {
        self.inner.files.lock().contains_key(name)
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        match self.inner.files.lock().remove(name) {
            Some(_) => Ok(()),
            None => Err(VfsError::NotFound(name.to_string())),
        }
    }

    /// `(name, length)` of every file, sorted by name
    pub fn list(&self) -> Vec<(String, u64)> {
        let mut files: Vec<_> = self
            .inner
            .files
            .lock()
            .iter()
            .map(|(name, image)| (name.clone(), image.content.read().len() as u64))
            .collect();
        files.sort();
        files
    }
}

impl Vfs for MemoryVfsAdapter {
    fn open_file(&self, name: Option<&str>, flags: OpenFlags) -> Result<Box<dyn VfsFile>> {
        let handle = match name {
            Some(name) => self.open(name, flags)?,
            None => self.open_temp(flags)?,
        };
        Ok(Box::new(handle))
    }

    fn delete(&self, name: &str) -> Result<()> {
        MemoryVfsAdapter::delete(self, name)
    }

    fn access(&self, name: &str) -> bool {
        MemoryVfsAdapter::access(self, name)
    }

    fn full_pathname(&self, name: &str) -> Result<String> {
        Ok(normalize_path(name))
    }
}

/// One open file of a [`MemoryVfsAdapter`]
pub struct MemoryFileHandle {
    vfs: MemoryVfsAdapter,
    name: String,
    handle: HandleId,
    image: Arc<FileImage>,
    lock_level: LockLevel,
    flags: OpenFlags,
    closed: bool,
}

impl MemoryFileHandle {
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
        Ok(())
    }
}

impl VfsFile for MemoryFileHandle {
    fn read(&self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.ensure_open()?;
        let content = self.image.content.read();
        let available = if offset >= content.len() as u64 {
            0
        } else {
            (content.len() - offset as usize).min(buf.len())
        };
        if available > 0 {
            let start = offset as usize;
            buf[..available].copy_from_slice(&content[start..start + available]);
        }
        buf[available..].fill(0);
        Ok(available)
    }

    fn write(&mut self, buf: &[u8], offset: u64) -> Result<()> {
        self.ensure_writable()?;
        let mut content = self.image.content.write();
        let end = offset as usize + buf.len();
        if content.len() < end {
            content.resize(end, 0);
        }
        content[offset as usize..end].copy_from_slice(buf);
        Ok(())
    }

    fn truncate(&mut self, size: u64) -> Result<()> {
        self.ensure_writable()?;
        self.image.content.write().resize(size as usize, 0);
        Ok(())
    }

    fn sync(&mut self) -> Result<SyncBarrier> {
        self.ensure_open()?;
        Ok(SyncBarrier::ready())
    }

    fn file_size(&self) -> u64 {
        self.image.content.read().len() as u64
    }

    fn lock(&mut self, level: LockLevel) -> Result<()> {
        self.ensure_open()?;
        lock_to(&mut *self.image.locks.lock(), self.handle, &mut self.lock_level, level)
    }

    fn unlock(&mut self, level: LockLevel) -> Result<()> {
        self.ensure_open()?;
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
        self.lock_level = self
            .image
            .locks
            .lock()
            .release(self.handle, self.lock_level, LockLevel::None);
        self.closed = true;

        if self.flags.delete_on_close {
            match self.vfs.delete(&self.name) {
                Ok(()) | Err(VfsError::NotFound(_)) => {}
                Err(err) => warn!("delete-on-close of {} failed: {}", self.name, err),
            }
        }
        Ok(SyncBarrier::ready())
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemoryFileHandle {
    fn drop(&mut self) {
        if !self.closed {
            if let Err(err) = self.close() {
                warn!("{} failed to close on drop: {}", self.name, err);
            }
        }
    }
}
