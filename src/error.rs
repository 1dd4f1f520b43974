//! Error types for VFS operations

use thiserror::Error;

/// VFS operation result type
pub type Result<T> = std::result::Result<T, VfsError>;

/// VFS operation errors
///
/// Errors are `Clone` because one failed durable operation can be observed
/// through several tickets (every write merged into it sees the same failure).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VfsError {
    /// Malformed call from the engine or a caller
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Open without create on an absent name
    #[error("File not found: {0}")]
    NotFound(String),

    /// Exclusive create on a name that already exists
    #[error("File already exists: {0}")]
    AlreadyExists(String),

    /// Backing store rejected or could not run an operation
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Backing store is out of space
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// An operation referenced a file id nobody knows about
    #[error("Consistency error: {0}")]
    Consistency(String),

    /// Lock requested at a level incompatible with another handle's lock
    #[error("Lock conflict: requested {requested}, held {held}")]
    LockConflict { requested: String, held: String },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// sqlite3_vfs_register / unregister returned non-OK
    #[error("VFS registration failed: {0}")]
    VfsRegistration(i32),
}

impl VfsError {
    /// True for failures raised by the backing store during durable execution
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            VfsError::StorageUnavailable(_) | VfsError::QuotaExceeded(_)
        )
    }
}

impl From<rusqlite::Error> for VfsError {
    fn from(err: rusqlite::Error) -> Self {
        match err.sqlite_error_code() {
            Some(rusqlite::ErrorCode::DiskFull) => VfsError::QuotaExceeded(err.to_string()),
            _ => VfsError::StorageUnavailable(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for VfsError {
    fn from(err: tokio::task::JoinError) -> Self {
        VfsError::StorageUnavailable(format!("store task failed: {}", err))
    }
}

impl From<toml::de::Error> for VfsError {
    fn from(err: toml::de::Error) -> Self {
        VfsError::Config(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_classification() {
        assert!(VfsError::QuotaExceeded("full".into()).is_storage());
        assert!(VfsError::StorageUnavailable("gone".into()).is_storage());
        assert!(!VfsError::NotFound("/a.db".into()).is_storage());
    }

    #[test]
    fn test_disk_full_maps_to_quota() {
        let err = rusqlite::Error::SqliteFailure(
            rusqlite::ffi::Error::new(libsqlite3_sys::SQLITE_FULL),
            None,
        );
        assert!(matches!(VfsError::from(err), VfsError::QuotaExceeded(_)));
    }
}
