//! In-memory catalog of files, ahead of durability
//!
//! Ids are allocated here synchronously when a create is accepted, so a
//! file is visible to `open`/`access`/`delete` before the store has heard
//! of it.

use crate::core::lock::LockTable;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Adapter-local file identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(pub u64);

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Resident content of one file plus the locks of its handles
///
/// Shared by every handle open on the file. The image holds the content as
/// of the last handle sync; unsynced writes live in each handle's dirty
/// buffer.
#[derive(Debug, Default)]
pub struct FileImage {
    pub content: RwLock<Vec<u8>>,
    pub locks: Mutex<LockTable>,
}

impl FileImage {
    pub fn new(content: Vec<u8>) -> Arc<Self> {
        Arc::new(Self {
            content: RwLock::new(content),
            locks: Mutex::new(LockTable::new()),
        })
    }
}

#[derive(Debug)]
struct FileEntry {
    name: String,
    length: u64,
    image: Arc<FileImage>,
}

/// Name/id/length view used by every synchronous call
#[derive(Debug, Default)]
pub struct FileTable {
    by_name: HashMap<String, FileId>,
    entries: HashMap<FileId, FileEntry>,
    next_id: u64,
}

impl FileTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a file that already exists durably
    pub fn insert_loaded(&mut self, name: &str, content: Vec<u8>) -> FileId {
        let id = self.allocate();
        self.entries.insert(
            id,
            FileEntry {
                name: name.to_string(),
                length: content.len() as u64,
                image: FileImage::new(content),
            },
        );
        self.by_name.insert(name.to_string(), id);
        id
    }

    /// Allocate an id for a new, empty file
    pub fn create(&mut self, name: &str) -> FileId {
        self.insert_loaded(name, Vec::new())
    }

    pub fn remove(&mut self, id: FileId) -> Option<String> {
        let entry = self.entries.remove(&id)?;
        self.by_name.remove(&entry.name);
        Some(entry.name)
    }

    pub fn lookup(&self, name: &str) -> Option<FileId> {
        self.by_name.get(name).copied()
    }

    pub fn contains(&self, id: FileId) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn length(&self, id: FileId) -> Option<u64> {
        self.entries.get(&id).map(|entry| entry.length)
    }

    pub fn set_length(&mut self, id: FileId, length: u64) {
        if let Some(entry) = self.entries.get_mut(&id) {
            entry.length = length;
        }
    }

    pub fn name(&self, id: FileId) -> Option<&str> {
        self.entries.get(&id).map(|entry| entry.name.as_str())
    }

    pub fn image(&self, id: FileId) -> Option<Arc<FileImage>> {
        self.entries.get(&id).map(|entry| Arc::clone(&entry.image))
    }

    /// `(name, length)` of every file, sorted by name
    pub fn list(&self) -> Vec<(String, u64)> {
        let mut files: Vec<_> = self
            .entries
            .values()
            .map(|entry| (entry.name.clone(), entry.length))
            .collect();
        files.sort();
        files
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn allocate(&mut self) -> FileId {
        self.next_id += 1;
        FileId(self.next_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_is_immediately_visible() {
        let mut table = FileTable::new();
        let id = table.create("/a.db");
        assert_eq!(table.lookup("/a.db"), Some(id));
        assert_eq!(table.length(id), Some(0));
        assert_eq!(table.name(id), Some("/a.db"));
    }

    #[test]
    fn test_ids_are_never_reused() {
        let mut table = FileTable::new();
        let first = table.create("/a.db");
        table.remove(first);
        let second = table.create("/a.db");
        assert_ne!(first, second);
        assert!(!table.contains(first));
    }

    #[test]
    fn test_loaded_length_and_list() {
        let mut table = FileTable::new();
        let id = table.insert_loaded("/b.db", vec![1, 2, 3]);
        table.create("/a.db");
        table.set_length(id, 10);
        assert_eq!(
            table.list(),
            vec![("/a.db".to_string(), 0), ("/b.db".to_string(), 10)]
        );
        assert_eq!(table.image(id).unwrap().content.read().len(), 3);
    }

    #[test]
    fn test_remove_unknown() {
        let mut table = FileTable::new();
        assert!(table.remove(FileId(42)).is_none());
        assert!(table.is_empty());
    }
}
