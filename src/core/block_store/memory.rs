//! In-process block store for tests and ephemeral use

use super::{assemble, blocks_for, BlockStore, StoreFileId, WriteBatch, BLOCK_SIZE};
use crate::error::{Result, VfsError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use tracing::debug;

/// Counts of executed store operations
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub creates: u64,
    pub writes: u64,
    pub set_lengths: u64,
    pub deletes: u64,
}

#[derive(Debug)]
struct StoredFile {
    name: String,
    length: u64,
}

#[derive(Debug, Default)]
struct MemoryState {
    files: BTreeMap<StoreFileId, StoredFile>,
    blocks: BTreeMap<(StoreFileId, u64), Vec<u8>>,
    next_id: StoreFileId,
    stats: StoreStats,
    quota_blocks: Option<usize>,
    unavailable: bool,
}

impl MemoryState {
    fn check_available(&self) -> Result<()> {
        if self.unavailable {
            return Err(VfsError::StorageUnavailable("memory store offline".to_string()));
        }
        Ok(())
    }

    fn file(&self, id: StoreFileId) -> Result<&StoredFile> {
        self.files
            .get(&id)
            .ok_or_else(|| VfsError::Consistency(format!("unknown store file id {}", id)))
    }

    fn drop_blocks_from(&mut self, id: StoreFileId, first: u64) {
        self.blocks.retain(|&(file, index), _| file != id || index < first);
    }
}

/// Block store kept entirely in process memory
///
/// Supports a block quota and an availability switch so callers can exercise
/// the deferred-failure paths.
#[derive(Debug, Default)]
pub struct MemoryBlockStore {
    state: Mutex<MemoryState>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse writes that would hold more than `blocks` blocks in total
    pub fn with_quota(blocks: usize) -> Self {
        let store = Self::default();
        store.state.lock().quota_blocks = Some(blocks);
        store
    }

    /// Toggle whether operations succeed
    pub fn set_available(&self, available: bool) {
        self.state.lock().unavailable = !available;
    }

    pub fn stats(&self) -> StoreStats {
        self.state.lock().stats
    }

    /// Number of stored blocks belonging to `name`, if the file exists
    pub fn block_count(&self, name: &str) -> Option<usize> {
        let state = self.state.lock();
        let id = state
            .files
            .iter()
            .find(|(_, file)| file.name == name)
            .map(|(&id, _)| id)?;
        Some(state.blocks.keys().filter(|(file, _)| *file == id).count())
    }

    /// Total number of stored blocks across every file
    pub fn total_blocks(&self) -> usize {
        self.state.lock().blocks.len()
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn list_files(&self) -> Result<BTreeMap<String, StoreFileId>> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state
            .files
            .iter()
            .map(|(&id, file)| (file.name.clone(), id))
            .collect())
    }

    async fn read_file(&self, id: StoreFileId) -> Result<Vec<u8>> {
        let state = self.state.lock();
        state.check_available()?;
        let length = state.file(id)?.length;
        let blocks = state
            .blocks
            .range((id, 0)..(id, u64::MAX))
            .map(|(&(_, index), bytes)| (index, bytes.as_slice()));
        Ok(assemble(length, blocks))
    }

    async fn create_file(&self, name: &str) -> Result<StoreFileId> {
        let mut state = self.state.lock();
        state.check_available()?;
        if state.files.values().any(|file| file.name == name) {
            return Err(VfsError::AlreadyExists(name.to_string()));
        }
        state.next_id += 1;
        let id = state.next_id;
        state.files.insert(
            id,
            StoredFile {
                name: name.to_string(),
                length: 0,
            },
        );
        state.stats.creates += 1;
        debug!("memory store: created {} as {}", name, id);
        Ok(id)
    }

    async fn write_ranges(&self, id: StoreFileId, batch: &WriteBatch) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.file(id)?;

        let coalesced = batch.coalesced();
        if let Some(quota) = state.quota_blocks {
            let fresh = coalesced
                .keys()
                .filter(|&&index| !state.blocks.contains_key(&(id, index)))
                .count();
            if state.blocks.len() + fresh > quota {
                return Err(VfsError::QuotaExceeded(format!(
                    "{} blocks requested, quota is {}",
                    state.blocks.len() + fresh,
                    quota
                )));
            }
        }

        for (index, bytes) in coalesced {
            let mut block = vec![0u8; BLOCK_SIZE];
            block[..bytes.len()].copy_from_slice(bytes);
            state.blocks.insert((id, index), block);
        }
        if let Some(file) = state.files.get_mut(&id) {
            file.length = batch.new_length;
        }
        state.drop_blocks_from(id, blocks_for(batch.new_length));
        state.stats.writes += 1;
        Ok(())
    }

    async fn set_length(&self, id: StoreFileId, length: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        state.file(id)?;

        state.drop_blocks_from(id, blocks_for(length));
        let tail = (length % BLOCK_SIZE as u64) as usize;
        if tail != 0 {
            if let Some(block) = state.blocks.get_mut(&(id, length / BLOCK_SIZE as u64)) {
                block[tail..].fill(0);
            }
        }
        if let Some(file) = state.files.get_mut(&id) {
            file.length = length;
        }
        state.stats.set_lengths += 1;
        Ok(())
    }

    async fn delete_file(&self, id: StoreFileId) -> Result<()> {
        let mut state = self.state.lock();
        state.check_available()?;
        let file = state
            .files
            .remove(&id)
            .ok_or_else(|| VfsError::Consistency(format!("unknown store file id {}", id)))?;
        state.drop_blocks_from(id, 0);
        state.stats.deletes += 1;
        debug!("memory store: deleted {} ({})", file.name, id);
        Ok(())
    }

    async fn file_length(&self, id: StoreFileId) -> Result<u64> {
        let state = self.state.lock();
        state.check_available()?;
        Ok(state.file(id)?.length)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::block_store::DirtyRange;

    fn page(fill: u8) -> Vec<u8> {
        vec![fill; BLOCK_SIZE]
    }

    #[tokio::test]
    async fn test_create_write_read() {
        let store = MemoryBlockStore::new();
        let id = store.create_file("/a.db").await.unwrap();

        let mut first = page(0);
        first[..5].copy_from_slice(b"hello");
        store
            .write_ranges(
                id,
                &WriteBatch {
                    ranges: vec![DirtyRange { offset: 0, bytes: first }],
                    new_length: 5,
                },
            )
            .await
            .unwrap();

        assert_eq!(store.read_file(id).await.unwrap(), b"hello");
        assert_eq!(store.file_length(id).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn test_duplicate_name_rejected() {
        let store = MemoryBlockStore::new();
        store.create_file("/a.db").await.unwrap();
        assert!(matches!(
            store.create_file("/a.db").await,
            Err(VfsError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_set_length_scrubs_boundary_block() {
        let store = MemoryBlockStore::new();
        let id = store.create_file("/t.db").await.unwrap();
        store
            .write_ranges(
                id,
                &WriteBatch {
                    ranges: vec![
                        DirtyRange { offset: 0, bytes: page(7) },
                        DirtyRange { offset: BLOCK_SIZE as u64, bytes: page(8) },
                    ],
                    new_length: 2 * BLOCK_SIZE as u64,
                },
            )
            .await
            .unwrap();

        store.set_length(id, 100).await.unwrap();
        assert_eq!(store.block_count("/t.db"), Some(1));

        // Growing again must expose zeros, not the old bytes
        store.set_length(id, 200).await.unwrap();
        let content = store.read_file(id).await.unwrap();
        assert!(content[..100].iter().all(|&b| b == 7));
        assert!(content[100..].iter().all(|&b| b == 0));
    }

    #[tokio::test]
    async fn test_quota_exceeded() {
        let store = MemoryBlockStore::with_quota(1);
        let id = store.create_file("/q.db").await.unwrap();
        let batch = WriteBatch {
            ranges: vec![
                DirtyRange { offset: 0, bytes: page(1) },
                DirtyRange { offset: BLOCK_SIZE as u64, bytes: page(2) },
            ],
            new_length: 2 * BLOCK_SIZE as u64,
        };
        assert!(matches!(
            store.write_ranges(id, &batch).await,
            Err(VfsError::QuotaExceeded(_))
        ));
    }

    #[tokio::test]
    async fn test_unavailable_and_delete() {
        let store = MemoryBlockStore::new();
        let id = store.create_file("/gone.db").await.unwrap();

        store.set_available(false);
        assert!(matches!(
            store.delete_file(id).await,
            Err(VfsError::StorageUnavailable(_))
        ));

        store.set_available(true);
        store.delete_file(id).await.unwrap();
        assert!(store.list_files().await.unwrap().is_empty());
        assert_eq!(store.stats().deletes, 1);
    }
}
