//! Change-notification and import protocol shared by all catalog components.
//!
//! This module defines the record-level change payloads broadcast after every
//! committed transaction, plus the request/progress messages exchanged with
//! background import workers.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// Reserved playlist id for the implicit Favorites playlist.
///
/// Favorites is never materialized as a playlists row; only its membership
/// rows exist. Real playlist ids are positive, so -1 can never be allocated.
pub const FAVORITES_PLAYLIST_ID: i64 = -1;

/// Closed set of persisted collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreName {
    Tracks,
    Albums,
    Artists,
    Playlists,
    PlaylistsTracks,
    Directories,
}

impl StoreName {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreName::Tracks => "tracks",
            StoreName::Albums => "albums",
            StoreName::Artists => "artists",
            StoreName::Playlists => "playlists",
            StoreName::PlaylistsTracks => "playlists_tracks",
            StoreName::Directories => "directories",
        }
    }
}

impl fmt::Display for StoreName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Row-level operation carried by a change record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Add,
    Update,
    Delete,
}

/// Primary key of a changed row.
///
/// Every collection uses a single numeric surrogate key except the
/// playlist-membership join, which is keyed by the pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Deserialize, serde::Serialize)]
#[serde(untagged)]
pub enum RecordKey {
    Id(i64),
    Pair(i64, i64),
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordKey::Id(id) => write!(f, "{id}"),
            RecordKey::Pair(a, b) => write!(f, "({a}, {b})"),
        }
    }
}

/// One committed row mutation.
///
/// `value` carries the post-commit row for adds and updates and is omitted
/// for deletes.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ChangeRecord {
    pub store: StoreName,
    pub op: ChangeOp,
    pub key: RecordKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<EntityPayload>,
}

impl ChangeRecord {
    pub fn added(store: StoreName, key: RecordKey, value: EntityPayload) -> Self {
        Self {
            store,
            op: ChangeOp::Add,
            key,
            value: Some(value),
        }
    }

    pub fn updated(store: StoreName, key: RecordKey, value: EntityPayload) -> Self {
        Self {
            store,
            op: ChangeOp::Update,
            key,
            value: Some(value),
        }
    }

    pub fn deleted(store: StoreName, key: RecordKey) -> Self {
        Self {
            store,
            op: ChangeOp::Delete,
            key,
            value: None,
        }
    }
}

/// Materialized row payload, tagged by collection.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EntityPayload {
    Track(TrackRecord),
    Album(AlbumRecord),
    Artist(ArtistRecord),
    Playlist(PlaylistRecord),
    Membership(MembershipRecord),
    Directory(DirectoryRecord),
}

/// One track row.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct TrackRecord {
    pub id: i64,
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub year: Option<i64>,
    pub track_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub bpm: Option<f64>,
    pub rating: Option<i64>,
    pub play_count: i64,
    /// Playback timestamps in unix milliseconds, oldest first.
    pub play_history: Vec<i64>,
    /// Free-form user metadata.
    pub custom: BTreeMap<String, String>,
    /// Owning directory row.
    pub directory_id: i64,
    /// File location on disk at last scan time.
    pub path: PathBuf,
    pub last_scanned_unix_ms: i64,
}

/// One album row. Albums are deduplicated by name across the whole catalog.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AlbumRecord {
    pub id: i64,
    pub name: String,
    /// Union of contributing artist names, in first-seen order.
    pub artists: Vec<String>,
    pub year: Option<i64>,
    pub cover_path: Option<PathBuf>,
}

/// One artist row. Name is the only payload and is unique.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct ArtistRecord {
    pub id: i64,
    pub name: String,
}

/// One playlist row.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct PlaylistRecord {
    pub id: i64,
    pub name: String,
    pub created_unix_ms: i64,
}

/// One playlist-membership row. Existence is the fact; there is no payload
/// beyond the pair itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct MembershipRecord {
    pub playlist_id: i64,
    pub track_id: i64,
}

/// One directory row: a user-granted folder mirrored into tracks.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct DirectoryRecord {
    pub id: i64,
    pub path: PathBuf,
}

/// Inbound request handled by a background import worker.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub enum ImportRequest {
    /// Scan a freshly added directory, diffing against whatever the catalog
    /// already knows for it.
    DirectoryAdd { directory_id: i64, path: PathBuf },
    /// The directory handle was replaced: purge its tracks, then scan fresh.
    DirectoryReplace { directory_id: i64, path: PathBuf },
}

impl ImportRequest {
    pub fn directory_id(&self) -> i64 {
        match self {
            ImportRequest::DirectoryAdd { directory_id, .. }
            | ImportRequest::DirectoryReplace { directory_id, .. } => *directory_id,
        }
    }

    pub fn path(&self) -> &PathBuf {
        match self {
            ImportRequest::DirectoryAdd { path, .. }
            | ImportRequest::DirectoryReplace { path, .. } => path,
        }
    }
}

/// Running counters reported by an import worker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ImportCounters {
    /// Files processed so far.
    pub current: usize,
    /// Files discovered by the walk.
    pub total: usize,
    pub newly_imported: usize,
    pub existing_updated: usize,
    pub removed: usize,
}

/// Progress message emitted after every processed file and once finally with
/// `finished: true`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
pub struct ImportProgress {
    pub directory_id: i64,
    pub finished: bool,
    pub count: ImportCounters,
}

/// Outbound message from an import worker to its initiating caller.
#[derive(Debug, Clone, PartialEq, serde::Deserialize, serde::Serialize)]
pub enum ImportEvent {
    Progress(ImportProgress),
    /// The whole import aborted (directory unreadable). Per-file extraction
    /// failures never produce this; they are skipped in place.
    Failed { directory_id: i64, error: String },
}
