//! Configuration for the VFS and its backing store
//!
//! ```toml
//! name = "blockvfs"
//! make_default = false
//! max_pathname = 1024
//! temp_prefix = "/sqlite-tmp-"
//!
//! [store]
//! kind = "sqlite"
//! path = "/var/lib/app/blocks.sqlite"
//! ```

use crate::core::block_store::{BlockStore, MemoryBlockStore, SqliteBlockStore};
use crate::error::{Result, VfsError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Where durable blocks live
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoreConfig {
    /// Process memory; gone when the process exits
    #[default]
    Memory,
    /// SQLite database file holding the `files` and `blocks` tables
    Sqlite { path: PathBuf },
}

impl StoreConfig {
    pub async fn open(&self) -> Result<Arc<dyn BlockStore>> {
        match self {
            StoreConfig::Memory => Ok(Arc::new(MemoryBlockStore::new())),
            StoreConfig::Sqlite { path } => {
                let path = path.clone();
                let store = tokio::task::spawn_blocking(move || SqliteBlockStore::open(path)).await??;
                Ok(Arc::new(store))
            }
        }
    }
}

/// VFS settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Name the VFS is registered under
    pub name: String,
    /// Register as the engine's default VFS
    pub make_default: bool,
    /// Longest path handed back by `xFullPathname`
    pub max_pathname: usize,
    /// Prefix for anonymous temp files
    pub temp_prefix: String,
    pub store: StoreConfig,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            name: crate::core::vfs::DEFAULT_VFS_NAME.to_string(),
            make_default: false,
            max_pathname: crate::core::vfs::DEFAULT_MAX_PATHNAME,
            temp_prefix: "/sqlite-tmp-".to_string(),
            store: StoreConfig::Memory,
        }
    }
}

impl VfsConfig {
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: VfsConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            VfsError::Config(format!("cannot read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml_str(&text)
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_store(mut self, store: StoreConfig) -> Self {
        self.store = store;
        self
    }

    pub fn make_default(mut self, make_default: bool) -> Self {
        self.make_default = make_default;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(VfsError::Config(format!("invalid VFS name {:?}", self.name)));
        }
        if self.max_pathname < 64 {
            return Err(VfsError::Config(format!(
                "max_pathname {} is too small (minimum 64)",
                self.max_pathname
            )));
        }
        if !self.temp_prefix.starts_with('/') {
            return Err(VfsError::Config(format!(
                "temp_prefix {:?} must be an absolute path",
                self.temp_prefix
            )));
        }
        Ok(())
    }
}
