use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The path is not below any configured mapping root nor below the NAS root.
    #[error("path is not under any configured root: {}", path.display())]
    PathNotUnderRoot { path: PathBuf },

    /// Retries exhausted; nothing was pulled, executed or pushed.
    #[error("could not acquire lock {} after {attempts} attempts", lock_path.display())]
    LockAcquisitionTimeout { lock_path: PathBuf, attempts: u32 },

    /// Another holder reclaimed the lock while this one still held it.
    #[error("lock {} was taken over by {}", lock_path.display(), holder.as_deref().unwrap_or("another holder"))]
    LockLost {
        lock_path: PathBuf,
        holder: Option<String>,
    },

    /// The record disappeared since this machine last read the catalog.
    #[error("entry {id} was deleted by another machine")]
    ConflictDeleted { id: String },

    #[error("cannot fingerprint {}: {source}", path.display())]
    FingerprintUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("catalog {} is unreadable: {reason}", path.display())]
    CatalogUnreadable { path: PathBuf, reason: String },

    #[error("backup to {} failed: {source}", path.display())]
    BackupFailed {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no path mapping config at {}", path.display())]
    ConfigMissing { path: PathBuf },
}

impl Error {
    /// Only lock contention is worth retrying without operator action.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::LockAcquisitionTimeout { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ConflictDeleted { .. })
    }
}
