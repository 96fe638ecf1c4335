//! Error taxonomy for catalog operations.

use std::path::PathBuf;

use crate::protocol::{RecordKey, StoreName};

pub type Result<T> = std::result::Result<T, CatalogError>;

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    /// The underlying storage failed to open or commit. Fatal for the
    /// operation; surfaced to the user, never retried silently.
    #[error("catalog storage unavailable: {0}")]
    StorageUnavailable(#[source] rusqlite::Error),

    #[error("no {store} row with key {key}")]
    NotFound { store: StoreName, key: RecordKey },

    /// A unique name column rejected a duplicate. No partial write occurred.
    #[error("a {store} entry named \"{name}\" already exists")]
    UniquenessConflict { store: StoreName, name: String },

    /// The directory handle could no longer be read; the whole import aborts.
    #[error("directory unreadable: {}: {source}", path.display())]
    PermissionRevoked {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("an import is already in progress for directory {directory_id}")]
    ImportBusy { directory_id: i64 },
}

impl From<rusqlite::Error> for CatalogError {
    fn from(err: rusqlite::Error) -> Self {
        CatalogError::StorageUnavailable(err)
    }
}

impl CatalogError {
    /// Maps a constraint violation on a unique name column to a typed
    /// conflict; everything else stays a storage failure.
    pub(crate) fn from_write(err: rusqlite::Error, store: StoreName, name: &str) -> Self {
        if let rusqlite::Error::SqliteFailure(failure, _) = &err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                return CatalogError::UniquenessConflict {
                    store,
                    name: name.to_string(),
                };
            }
        }
        CatalogError::StorageUnavailable(err)
    }
}
