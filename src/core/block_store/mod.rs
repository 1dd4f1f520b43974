//! Durable block storage
//!
//! A [`BlockStore`] keeps two logical tables: a file catalog
//! (`name -> id, length`) and fixed-size blocks keyed by `(id, index)`.
//! Block contents at or beyond a file's length are never surfaced.

mod memory;
mod sqlite;

pub use memory::{MemoryBlockStore, StoreStats};
pub use sqlite::SqliteBlockStore;

use crate::error::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

/// Fixed block size in bytes
pub const BLOCK_SIZE: usize = 4096;

/// Identifier assigned by the store when a file is created
pub type StoreFileId = i64;

/// One block-aligned run of bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirtyRange {
    /// Byte offset, always a multiple of [`BLOCK_SIZE`]
    pub offset: u64,
    /// At most [`BLOCK_SIZE`] bytes
    pub bytes: Vec<u8>,
}

impl DirtyRange {
    pub fn block_index(&self) -> u64 {
        self.offset / BLOCK_SIZE as u64
    }
}

/// Ranges to write plus the file length once they are applied
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub ranges: Vec<DirtyRange>,
    pub new_length: u64,
}

impl WriteBatch {
    /// Append a later batch; later ranges win on overlap
    pub fn absorb(&mut self, later: WriteBatch) {
        self.ranges.extend(later.ranges);
        self.new_length = later.new_length;
    }

    /// Every block of `content` below `length`, ending the file at `length`
    pub fn covering(content: &[u8], length: u64) -> Self {
        let end = content.len().min(length as usize);
        let ranges = content[..end]
            .chunks(BLOCK_SIZE)
            .enumerate()
            .map(|(index, bytes)| DirtyRange {
                offset: (index * BLOCK_SIZE) as u64,
                bytes: bytes.to_vec(),
            })
            .collect();
        Self {
            ranges,
            new_length: length,
        }
    }

    /// Collapse the range list so each block appears once, last write winning
    pub fn coalesced(&self) -> BTreeMap<u64, &[u8]> {
        let mut blocks = BTreeMap::new();
        for range in &self.ranges {
            blocks.insert(range.block_index(), range.bytes.as_slice());
        }
        blocks
    }
}

/// Asynchronous storage of file catalog and blocks
///
/// Every operation is individually atomic. Failures surface as
/// `StorageUnavailable` or `QuotaExceeded`.
#[async_trait]
pub trait BlockStore: Send + Sync {
    /// Catalog as `name -> id`
    async fn list_files(&self) -> Result<BTreeMap<String, StoreFileId>>;

    /// Full content of a file, clipped to its length
    async fn read_file(&self, id: StoreFileId) -> Result<Vec<u8>>;

    /// Create an empty file; fails if the name exists
    async fn create_file(&self, name: &str) -> Result<StoreFileId>;

    /// Write block-aligned ranges and record the new length
    async fn write_ranges(&self, id: StoreFileId, batch: &WriteBatch) -> Result<()>;

    /// Set the length, dropping blocks past it
    async fn set_length(&self, id: StoreFileId, length: u64) -> Result<()>;

    /// Delete a file and all of its blocks
    async fn delete_file(&self, id: StoreFileId) -> Result<()>;

    /// Current stored length of a file
    async fn file_length(&self, id: StoreFileId) -> Result<u64>;
}

/// Number of blocks needed to hold `length` bytes
pub(crate) fn blocks_for(length: u64) -> u64 {
    length.div_ceil(BLOCK_SIZE as u64)
}

/// Rebuild file content from `(index, bytes)` pairs, clipped to `length`
pub(crate) fn assemble<'a, I>(length: u64, blocks: I) -> Vec<u8>
where
    I: IntoIterator<Item = (u64, &'a [u8])>,
{
    let mut content = vec![0u8; length as usize];
    for (index, bytes) in blocks {
        let start = index * BLOCK_SIZE as u64;
        if start >= length {
            continue;
        }
        let end = (start + bytes.len() as u64).min(length);
        let take = (end - start) as usize;
        content[start as usize..end as usize].copy_from_slice(&bytes[..take]);
    }
    content
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assemble_clips_to_length() {
        let block0 = vec![1u8; BLOCK_SIZE];
        let block1 = vec![2u8; BLOCK_SIZE];
        let content = assemble(
            BLOCK_SIZE as u64 + 10,
            vec![(0, block0.as_slice()), (1, block1.as_slice())],
        );
        assert_eq!(content.len(), BLOCK_SIZE + 10);
        assert_eq!(content[BLOCK_SIZE - 1], 1);
        assert_eq!(content[BLOCK_SIZE + 9], 2);
    }

    #[test]
    fn test_assemble_zero_fills_holes() {
        let block2 = vec![9u8; BLOCK_SIZE];
        let content = assemble(3 * BLOCK_SIZE as u64, vec![(2, block2.as_slice())]);
        assert!(content[..2 * BLOCK_SIZE].iter().all(|&b| b == 0));
        assert!(content[2 * BLOCK_SIZE..].iter().all(|&b| b == 9));
    }

    #[test]
    fn test_batch_absorb_later_wins() {
        let mut first = WriteBatch {
            ranges: vec![DirtyRange { offset: 0, bytes: vec![1; 4] }],
            new_length: 4,
        };
        first.absorb(WriteBatch {
            ranges: vec![DirtyRange { offset: 0, bytes: vec![2; 4] }],
            new_length: 8,
        });
        assert_eq!(first.new_length, 8);
        assert_eq!(first.coalesced().get(&0).copied(), Some(&[2u8, 2, 2, 2][..]));
    }

    #[test]
    fn test_blocks_for() {
        assert_eq!(blocks_for(0), 0);
        assert_eq!(blocks_for(1), 1);
        assert_eq!(blocks_for(BLOCK_SIZE as u64), 1);
        assert_eq!(blocks_for(BLOCK_SIZE as u64 + 1), 2);
    }
}
