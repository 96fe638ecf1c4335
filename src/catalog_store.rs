//! Catalog schema and transaction gateway backed by `rusqlite`.
//!
//! Owns the physical table layout and exposes scoped write transactions.
//! Every write helper returns the change records for the rows it actually
//! touched so the caller can assemble one notification batch per commit.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{CatalogError, Result};
use crate::protocol::{
    AlbumRecord, ArtistRecord, ChangeRecord, DirectoryRecord, EntityPayload, MembershipRecord,
    PlaylistRecord, RecordKey, StoreName, TrackRecord,
};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Metadata payload written for a track during import.
///
/// Playback statistics, rating, and custom metadata are owned by the catalog
/// and survive re-imports untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackImport {
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub year: Option<i64>,
    pub track_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub bpm: Option<f64>,
    pub directory_id: i64,
    pub path: PathBuf,
    pub last_scanned_unix_ms: i64,
}

pub struct CatalogStore {
    conn: Connection,
}

fn json_strings(values: &[String]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_strings(text: &str) -> Vec<String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn json_history(values: &[i64]) -> String {
    serde_json::to_string(values).unwrap_or_else(|_| "[]".to_string())
}

fn parse_history(text: &str) -> Vec<i64> {
    serde_json::from_str(text).unwrap_or_default()
}

fn parse_custom(text: &str) -> BTreeMap<String, String> {
    serde_json::from_str(text).unwrap_or_default()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn track_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TrackRecord> {
    Ok(TrackRecord {
        id: row.get(0)?,
        title: row.get(1)?,
        artists: parse_strings(&row.get::<_, String>(2)?),
        album: row.get(3)?,
        year: row.get(4)?,
        track_number: row.get(5)?,
        duration_ms: row.get(6)?,
        bpm: row.get(7)?,
        rating: row.get(8)?,
        play_count: row.get(9)?,
        play_history: parse_history(&row.get::<_, String>(10)?),
        custom: parse_custom(&row.get::<_, String>(11)?),
        directory_id: row.get(12)?,
        path: PathBuf::from(row.get::<_, String>(13)?),
        last_scanned_unix_ms: row.get(14)?,
    })
}

const TRACK_COLUMNS: &str = "id, title, artists, album, year, track_number, duration_ms, bpm, \
     rating, play_count, play_history, custom, directory_id, path, last_scanned_unix_ms";

fn get_track_with(conn: &Connection, id: i64) -> Result<TrackRecord> {
    conn.query_row(
        &format!("SELECT {TRACK_COLUMNS} FROM tracks WHERE id = ?1"),
        params![id],
        track_from_row,
    )
    .optional()?
    .ok_or(CatalogError::NotFound {
        store: StoreName::Tracks,
        key: RecordKey::Id(id),
    })
}

fn get_album_with(conn: &Connection, id: i64) -> Result<AlbumRecord> {
    conn.query_row(
        "SELECT id, name, artists, year, cover_path FROM albums WHERE id = ?1",
        params![id],
        album_from_row,
    )
    .optional()?
    .ok_or(CatalogError::NotFound {
        store: StoreName::Albums,
        key: RecordKey::Id(id),
    })
}

fn album_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlbumRecord> {
    Ok(AlbumRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        artists: parse_strings(&row.get::<_, String>(2)?),
        year: row.get(3)?,
        cover_path: row.get::<_, Option<String>>(4)?.map(PathBuf::from),
    })
}

impl CatalogStore {
    /// Opens (or creates) the catalog database at `path`, creating tables and
    /// indexes idempotently.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|err| CatalogError::PermissionRevoked {
                    path: parent.to_path_buf(),
                    source: err,
                })?;
            }
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        let store = Self { conn };
        store.initialize_schema()?;
        store.migrate()?;
        Ok(store)
    }

    /// In-memory catalog, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.initialize_schema()?;
        store.migrate()?;
        Ok(store)
    }

    fn initialize_schema(&self) -> Result<()> {
        // Multi-valued columns (artists, play_history, custom) are stored as
        // JSON text; artist lookups go through the albums/artists tables.
        self.conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tracks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                artists TEXT NOT NULL DEFAULT '[]',
                album TEXT NOT NULL DEFAULT '',
                year INTEGER,
                track_number INTEGER,
                duration_ms INTEGER,
                rating INTEGER,
                play_count INTEGER NOT NULL DEFAULT 0,
                play_history TEXT NOT NULL DEFAULT '[]',
                custom TEXT NOT NULL DEFAULT '{}',
                directory_id INTEGER NOT NULL,
                path TEXT NOT NULL,
                file_name TEXT NOT NULL,
                last_scanned_unix_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tracks_title ON tracks(title);
            CREATE INDEX IF NOT EXISTS idx_tracks_album ON tracks(album);
            CREATE INDEX IF NOT EXISTS idx_tracks_year ON tracks(year);
            CREATE INDEX IF NOT EXISTS idx_tracks_duration ON tracks(duration_ms);
            CREATE INDEX IF NOT EXISTS idx_tracks_directory ON tracks(directory_id);
            CREATE INDEX IF NOT EXISTS idx_tracks_last_scanned ON tracks(last_scanned_unix_ms);

            CREATE TABLE IF NOT EXISTS albums (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                artists TEXT NOT NULL DEFAULT '[]',
                year INTEGER,
                cover_path TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_albums_year ON albums(year);

            CREATE TABLE IF NOT EXISTS artists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE
            );

            CREATE TABLE IF NOT EXISTS playlists (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL UNIQUE,
                created_unix_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_playlists_created ON playlists(created_unix_ms);

            CREATE TABLE IF NOT EXISTS playlists_tracks (
                playlist_id INTEGER NOT NULL,
                track_id INTEGER NOT NULL,
                PRIMARY KEY (playlist_id, track_id)
            );
            CREATE INDEX IF NOT EXISTS idx_playlists_tracks_playlist
                ON playlists_tracks(playlist_id);
            CREATE INDEX IF NOT EXISTS idx_playlists_tracks_track
                ON playlists_tracks(track_id);

            CREATE TABLE IF NOT EXISTS directories (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                path TEXT NOT NULL
            );",
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<()> {
        // The initial tracks layout has no bpm column; it is added in place.
        // Rows of unaffected tables are never touched.
        let mut stmt = self.conn.prepare("PRAGMA table_info(tracks)")?;
        let columns = stmt.query_map([], |row| row.get::<_, String>(1))?;
        let mut has_bpm = false;
        for column in columns {
            if column? == "bpm" {
                has_bpm = true;
                break;
            }
        }
        drop(stmt);

        if !has_bpm {
            self.conn.execute("ALTER TABLE tracks ADD COLUMN bpm REAL", [])?;
        }
        Ok(())
    }

    /// Runs `body` inside one write transaction: commits on `Ok`, rolls back
    /// on `Err`. Callers must not observe partial multi-table writes, so any
    /// logically coupled writes belong in a single call.
    pub fn with_write_tx<T>(&mut self, body: impl FnOnce(&Transaction) -> Result<T>) -> Result<T> {
        let tx = self.conn.transaction()?;
        let out = body(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    // --- tracks ---

    pub fn insert_track(tx: &Transaction, import: &TrackImport) -> Result<ChangeRecord> {
        tx.execute(
            "INSERT INTO tracks (title, artists, album, year, track_number, duration_ms, bpm,
                directory_id, path, file_name, last_scanned_unix_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                import.title,
                json_strings(&import.artists),
                import.album,
                import.year,
                import.track_number,
                import.duration_ms,
                import.bpm,
                import.directory_id,
                import.path.to_string_lossy(),
                file_name_of(&import.path),
                import.last_scanned_unix_ms,
            ],
        )?;
        let id = tx.last_insert_rowid();
        let track = get_track_with(tx, id)?;
        Ok(ChangeRecord::added(
            StoreName::Tracks,
            RecordKey::Id(id),
            EntityPayload::Track(track),
        ))
    }

    /// Rewrites a track's scanned metadata under its existing key, preserving
    /// playback statistics, rating, and custom metadata. `last_scanned_unix_ms`
    /// increases strictly on every re-import.
    pub fn update_track(tx: &Transaction, id: i64, import: &TrackImport) -> Result<ChangeRecord> {
        let previous_scanned: i64 = tx
            .query_row(
                "SELECT last_scanned_unix_ms FROM tracks WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or(CatalogError::NotFound {
                store: StoreName::Tracks,
                key: RecordKey::Id(id),
            })?;
        let last_scanned = import.last_scanned_unix_ms.max(previous_scanned + 1);

        tx.execute(
            "UPDATE tracks SET title = ?1, artists = ?2, album = ?3, year = ?4,
                track_number = ?5, duration_ms = ?6, bpm = ?7, directory_id = ?8,
                path = ?9, file_name = ?10, last_scanned_unix_ms = ?11
             WHERE id = ?12",
            params![
                import.title,
                json_strings(&import.artists),
                import.album,
                import.year,
                import.track_number,
                import.duration_ms,
                import.bpm,
                import.directory_id,
                import.path.to_string_lossy(),
                file_name_of(&import.path),
                last_scanned,
                id,
            ],
        )?;
        let track = get_track_with(tx, id)?;
        Ok(ChangeRecord::updated(
            StoreName::Tracks,
            RecordKey::Id(id),
            EntityPayload::Track(track),
        ))
    }

    /// Deletes a track and its membership rows, one record per deleted row.
    pub fn delete_track(tx: &Transaction, id: i64) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        let mut stmt =
            tx.prepare("SELECT playlist_id FROM playlists_tracks WHERE track_id = ?1")?;
        let playlist_ids = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;
        for playlist_id in playlist_ids {
            records.push(ChangeRecord::deleted(
                StoreName::PlaylistsTracks,
                RecordKey::Pair(playlist_id?, id),
            ));
        }
        drop(stmt);
        tx.execute(
            "DELETE FROM playlists_tracks WHERE track_id = ?1",
            params![id],
        )?;

        let deleted = tx.execute("DELETE FROM tracks WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(CatalogError::NotFound {
                store: StoreName::Tracks,
                key: RecordKey::Id(id),
            });
        }
        records.push(ChangeRecord::deleted(StoreName::Tracks, RecordKey::Id(id)));
        Ok(records)
    }

    pub fn record_playback(tx: &Transaction, id: i64, at_unix_ms: i64) -> Result<ChangeRecord> {
        let track = get_track_with(tx, id)?;
        let mut history = track.play_history;
        history.push(at_unix_ms);
        tx.execute(
            "UPDATE tracks SET play_count = play_count + 1, play_history = ?1 WHERE id = ?2",
            params![json_history(&history), id],
        )?;
        let track = get_track_with(tx, id)?;
        Ok(ChangeRecord::updated(
            StoreName::Tracks,
            RecordKey::Id(id),
            EntityPayload::Track(track),
        ))
    }

    pub fn set_track_rating(
        tx: &Transaction,
        id: i64,
        rating: Option<i64>,
    ) -> Result<ChangeRecord> {
        let updated = tx.execute(
            "UPDATE tracks SET rating = ?1 WHERE id = ?2",
            params![rating, id],
        )?;
        if updated == 0 {
            return Err(CatalogError::NotFound {
                store: StoreName::Tracks,
                key: RecordKey::Id(id),
            });
        }
        let track = get_track_with(tx, id)?;
        Ok(ChangeRecord::updated(
            StoreName::Tracks,
            RecordKey::Id(id),
            EntityPayload::Track(track),
        ))
    }

    pub fn set_track_custom(
        tx: &Transaction,
        id: i64,
        key: &str,
        value: Option<String>,
    ) -> Result<ChangeRecord> {
        let track = get_track_with(tx, id)?;
        let mut custom = track.custom;
        match value {
            Some(value) => {
                custom.insert(key.to_string(), value);
            }
            None => {
                custom.remove(key);
            }
        }
        let encoded = serde_json::to_string(&custom).unwrap_or_else(|_| "{}".to_string());
        tx.execute(
            "UPDATE tracks SET custom = ?1 WHERE id = ?2",
            params![encoded, id],
        )?;
        let track = get_track_with(tx, id)?;
        Ok(ChangeRecord::updated(
            StoreName::Tracks,
            RecordKey::Id(id),
            EntityPayload::Track(track),
        ))
    }

    pub fn get_track(&self, id: i64) -> Result<TrackRecord> {
        get_track_with(&self.conn, id)
    }

    pub fn tracks_for_directory(&self, directory_id: i64) -> Result<Vec<TrackRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks WHERE directory_id = ?1 ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![directory_id], track_from_row)?;
        let mut tracks = Vec::new();
        for track in rows {
            tracks.push(track?);
        }
        Ok(tracks)
    }

    /// Multi-value lookup over the JSON artists column via `json_each`.
    pub fn tracks_for_artist(&self, artist: &str) -> Result<Vec<TrackRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {TRACK_COLUMNS} FROM tracks
             WHERE EXISTS (
                 SELECT 1 FROM json_each(tracks.artists) WHERE json_each.value = ?1
             )
             ORDER BY id ASC"
        ))?;
        let rows = stmt.query_map(params![artist], track_from_row)?;
        let mut tracks = Vec::new();
        for track in rows {
            tracks.push(track?);
        }
        Ok(tracks)
    }

    pub fn track_count_for_directory(&self, directory_id: i64) -> Result<usize> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM tracks WHERE directory_id = ?1",
            params![directory_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // --- albums ---

    /// Resolves an album by name: creates it when missing, otherwise merges
    /// the artist union and backfills year/cover only when unset. Returns
    /// `None` when the existing row is already complete (no phantom records).
    pub fn upsert_album(
        tx: &Transaction,
        name: &str,
        artists: &[String],
        year: Option<i64>,
        cover_path: Option<&Path>,
    ) -> Result<Option<ChangeRecord>> {
        let existing = tx
            .query_row(
                "SELECT id, name, artists, year, cover_path FROM albums WHERE name = ?1",
                params![name],
                album_from_row,
            )
            .optional()?;

        match existing {
            None => {
                tx.execute(
                    "INSERT INTO albums (name, artists, year, cover_path) VALUES (?1, ?2, ?3, ?4)",
                    params![
                        name,
                        json_strings(artists),
                        year,
                        cover_path.map(|p| p.to_string_lossy().to_string()),
                    ],
                )
                .map_err(|err| CatalogError::from_write(err, StoreName::Albums, name))?;
                let id = tx.last_insert_rowid();
                let album = get_album_with(tx, id)?;
                Ok(Some(ChangeRecord::added(
                    StoreName::Albums,
                    RecordKey::Id(id),
                    EntityPayload::Album(album),
                )))
            }
            Some(existing) => {
                let mut merged_artists = existing.artists.clone();
                for artist in artists {
                    if !merged_artists.contains(artist) {
                        merged_artists.push(artist.clone());
                    }
                }
                let merged_year = existing.year.or(year);
                let merged_cover = existing
                    .cover_path
                    .clone()
                    .or_else(|| cover_path.map(Path::to_path_buf));

                if merged_artists == existing.artists
                    && merged_year == existing.year
                    && merged_cover == existing.cover_path
                {
                    return Ok(None);
                }

                tx.execute(
                    "UPDATE albums SET artists = ?1, year = ?2, cover_path = ?3 WHERE id = ?4",
                    params![
                        json_strings(&merged_artists),
                        merged_year,
                        merged_cover.as_ref().map(|p| p.to_string_lossy().to_string()),
                        existing.id,
                    ],
                )?;
                let album = get_album_with(tx, existing.id)?;
                Ok(Some(ChangeRecord::updated(
                    StoreName::Albums,
                    RecordKey::Id(existing.id),
                    EntityPayload::Album(album),
                )))
            }
        }
    }

    pub fn get_album(&self, id: i64) -> Result<AlbumRecord> {
        get_album_with(&self.conn, id)
    }

    pub fn find_album_by_name(&self, name: &str) -> Result<Option<AlbumRecord>> {
        Ok(self
            .conn
            .query_row(
                "SELECT id, name, artists, year, cover_path FROM albums WHERE name = ?1",
                params![name],
                album_from_row,
            )
            .optional()?)
    }

    /// Albums whose artist union contains `artist`.
    pub fn albums_for_artist(&self, artist: &str) -> Result<Vec<AlbumRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, artists, year, cover_path FROM albums
             WHERE EXISTS (
                 SELECT 1 FROM json_each(albums.artists) WHERE json_each.value = ?1
             )
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![artist], album_from_row)?;
        let mut albums = Vec::new();
        for album in rows {
            albums.push(album?);
        }
        Ok(albums)
    }

    // --- artists ---

    /// Find-by-name-else-create. Artists are never updated once created.
    pub fn ensure_artist(tx: &Transaction, name: &str) -> Result<Option<ChangeRecord>> {
        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM artists WHERE name = ?1",
                params![name],
                |row| row.get(0),
            )
            .optional()?;
        if existing.is_some() {
            return Ok(None);
        }
        tx.execute("INSERT INTO artists (name) VALUES (?1)", params![name])
            .map_err(|err| CatalogError::from_write(err, StoreName::Artists, name))?;
        let id = tx.last_insert_rowid();
        Ok(Some(ChangeRecord::added(
            StoreName::Artists,
            RecordKey::Id(id),
            EntityPayload::Artist(ArtistRecord {
                id,
                name: name.to_string(),
            }),
        )))
    }

    pub fn get_artist(&self, id: i64) -> Result<ArtistRecord> {
        self.conn
            .query_row(
                "SELECT id, name FROM artists WHERE id = ?1",
                params![id],
                |row| {
                    Ok(ArtistRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                    })
                },
            )
            .optional()?
            .ok_or(CatalogError::NotFound {
                store: StoreName::Artists,
                key: RecordKey::Id(id),
            })
    }

    // --- playlists ---

    pub fn insert_playlist(
        tx: &Transaction,
        name: &str,
        created_unix_ms: i64,
    ) -> Result<ChangeRecord> {
        tx.execute(
            "INSERT INTO playlists (name, created_unix_ms) VALUES (?1, ?2)",
            params![name, created_unix_ms],
        )
        .map_err(|err| CatalogError::from_write(err, StoreName::Playlists, name))?;
        let id = tx.last_insert_rowid();
        Ok(ChangeRecord::added(
            StoreName::Playlists,
            RecordKey::Id(id),
            EntityPayload::Playlist(PlaylistRecord {
                id,
                name: name.to_string(),
                created_unix_ms,
            }),
        ))
    }

    pub fn rename_playlist(tx: &Transaction, id: i64, name: &str) -> Result<ChangeRecord> {
        let updated = tx
            .execute(
                "UPDATE playlists SET name = ?1 WHERE id = ?2",
                params![name, id],
            )
            .map_err(|err| CatalogError::from_write(err, StoreName::Playlists, name))?;
        if updated == 0 {
            return Err(CatalogError::NotFound {
                store: StoreName::Playlists,
                key: RecordKey::Id(id),
            });
        }
        let playlist = tx.query_row(
            "SELECT id, name, created_unix_ms FROM playlists WHERE id = ?1",
            params![id],
            |row| {
                Ok(PlaylistRecord {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    created_unix_ms: row.get(2)?,
                })
            },
        )?;
        Ok(ChangeRecord::updated(
            StoreName::Playlists,
            RecordKey::Id(id),
            EntityPayload::Playlist(playlist),
        ))
    }

    pub fn delete_playlist(tx: &Transaction, id: i64) -> Result<Vec<ChangeRecord>> {
        let mut records = Vec::new();
        let mut stmt =
            tx.prepare("SELECT track_id FROM playlists_tracks WHERE playlist_id = ?1")?;
        let track_ids = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;
        for track_id in track_ids {
            records.push(ChangeRecord::deleted(
                StoreName::PlaylistsTracks,
                RecordKey::Pair(id, track_id?),
            ));
        }
        drop(stmt);
        tx.execute(
            "DELETE FROM playlists_tracks WHERE playlist_id = ?1",
            params![id],
        )?;

        let deleted = tx.execute("DELETE FROM playlists WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(CatalogError::NotFound {
                store: StoreName::Playlists,
                key: RecordKey::Id(id),
            });
        }
        records.push(ChangeRecord::deleted(
            StoreName::Playlists,
            RecordKey::Id(id),
        ));
        Ok(records)
    }

    pub fn get_playlist(&self, id: i64) -> Result<PlaylistRecord> {
        self.conn
            .query_row(
                "SELECT id, name, created_unix_ms FROM playlists WHERE id = ?1",
                params![id],
                |row| {
                    Ok(PlaylistRecord {
                        id: row.get(0)?,
                        name: row.get(1)?,
                        created_unix_ms: row.get(2)?,
                    })
                },
            )
            .optional()?
            .ok_or(CatalogError::NotFound {
                store: StoreName::Playlists,
                key: RecordKey::Id(id),
            })
    }

    pub fn list_playlists(&self) -> Result<Vec<PlaylistRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT id, name, created_unix_ms FROM playlists ORDER BY created_unix_ms ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PlaylistRecord {
                id: row.get(0)?,
                name: row.get(1)?,
                created_unix_ms: row.get(2)?,
            })
        })?;
        let mut playlists = Vec::new();
        for playlist in rows {
            playlists.push(playlist?);
        }
        Ok(playlists)
    }

    // --- playlist membership ---

    /// Adds a membership row; `None` when the pair already exists.
    pub fn add_membership(
        tx: &Transaction,
        playlist_id: i64,
        track_id: i64,
    ) -> Result<Option<ChangeRecord>> {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO playlists_tracks (playlist_id, track_id) VALUES (?1, ?2)",
            params![playlist_id, track_id],
        )?;
        if inserted == 0 {
            return Ok(None);
        }
        Ok(Some(ChangeRecord::added(
            StoreName::PlaylistsTracks,
            RecordKey::Pair(playlist_id, track_id),
            EntityPayload::Membership(MembershipRecord {
                playlist_id,
                track_id,
            }),
        )))
    }

    /// Removes a membership row; `None` when the pair was absent.
    pub fn remove_membership(
        tx: &Transaction,
        playlist_id: i64,
        track_id: i64,
    ) -> Result<Option<ChangeRecord>> {
        let deleted = tx.execute(
            "DELETE FROM playlists_tracks WHERE playlist_id = ?1 AND track_id = ?2",
            params![playlist_id, track_id],
        )?;
        if deleted == 0 {
            return Ok(None);
        }
        Ok(Some(ChangeRecord::deleted(
            StoreName::PlaylistsTracks,
            RecordKey::Pair(playlist_id, track_id),
        )))
    }

    pub fn membership_exists(&self, playlist_id: i64, track_id: i64) -> Result<bool> {
        let exists: i64 = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM playlists_tracks WHERE playlist_id = ?1 AND track_id = ?2)",
            params![playlist_id, track_id],
            |row| row.get(0),
        )?;
        Ok(exists != 0)
    }

    pub fn is_favorite(&self, track_id: i64) -> Result<bool> {
        self.membership_exists(crate::protocol::FAVORITES_PLAYLIST_ID, track_id)
    }

    pub fn playlists_for_track(&self, track_id: i64) -> Result<Vec<i64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT playlist_id FROM playlists_tracks WHERE track_id = ?1")?;
        let rows = stmt.query_map(params![track_id], |row| row.get::<_, i64>(0))?;
        let mut playlist_ids = Vec::new();
        for playlist_id in rows {
            playlist_ids.push(playlist_id?);
        }
        Ok(playlist_ids)
    }

    // --- directories ---

    pub fn insert_directory(tx: &Transaction, path: &Path) -> Result<ChangeRecord> {
        tx.execute(
            "INSERT INTO directories (path) VALUES (?1)",
            params![path.to_string_lossy()],
        )?;
        let id = tx.last_insert_rowid();
        Ok(ChangeRecord::added(
            StoreName::Directories,
            RecordKey::Id(id),
            EntityPayload::Directory(DirectoryRecord {
                id,
                path: path.to_path_buf(),
            }),
        ))
    }

    pub fn update_directory_path(tx: &Transaction, id: i64, path: &Path) -> Result<ChangeRecord> {
        let updated = tx.execute(
            "UPDATE directories SET path = ?1 WHERE id = ?2",
            params![path.to_string_lossy(), id],
        )?;
        if updated == 0 {
            return Err(CatalogError::NotFound {
                store: StoreName::Directories,
                key: RecordKey::Id(id),
            });
        }
        Ok(ChangeRecord::updated(
            StoreName::Directories,
            RecordKey::Id(id),
            EntityPayload::Directory(DirectoryRecord {
                id,
                path: path.to_path_buf(),
            }),
        ))
    }

    /// Deletes a directory, all its tracks, and their membership rows within
    /// the caller's transaction. Per-track deletions come first, the
    /// directory's own record last.
    pub fn delete_directory(tx: &Transaction, id: i64) -> Result<Vec<ChangeRecord>> {
        let mut track_ids = Vec::new();
        let mut stmt = tx.prepare("SELECT id FROM tracks WHERE directory_id = ?1")?;
        let rows = stmt.query_map(params![id], |row| row.get::<_, i64>(0))?;
        for track_id in rows {
            track_ids.push(track_id?);
        }
        drop(stmt);

        let mut records = Vec::new();
        for track_id in track_ids {
            records.extend(Self::delete_track(tx, track_id)?);
        }

        let deleted = tx.execute("DELETE FROM directories WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(CatalogError::NotFound {
                store: StoreName::Directories,
                key: RecordKey::Id(id),
            });
        }
        records.push(ChangeRecord::deleted(
            StoreName::Directories,
            RecordKey::Id(id),
        ));
        Ok(records)
    }

    pub fn get_directory(&self, id: i64) -> Result<DirectoryRecord> {
        self.conn
            .query_row(
                "SELECT id, path FROM directories WHERE id = ?1",
                params![id],
                |row| {
                    Ok(DirectoryRecord {
                        id: row.get(0)?,
                        path: PathBuf::from(row.get::<_, String>(1)?),
                    })
                },
            )
            .optional()?
            .ok_or(CatalogError::NotFound {
                store: StoreName::Directories,
                key: RecordKey::Id(id),
            })
    }

    pub fn list_directories(&self) -> Result<Vec<DirectoryRecord>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, path FROM directories ORDER BY id ASC")?;
        let rows = stmt.query_map([], |row| {
            Ok(DirectoryRecord {
                id: row.get(0)?,
                path: PathBuf::from(row.get::<_, String>(1)?),
            })
        })?;
        let mut directories = Vec::new();
        for directory in rows {
            directories.push(directory?);
        }
        Ok(directories)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChangeOp;

    fn sample_import(directory_id: i64, name: &str) -> TrackImport {
        TrackImport {
            title: name.to_string(),
            artists: vec!["Artist".to_string()],
            album: "Album".to_string(),
            year: Some(2001),
            track_number: Some(1),
            duration_ms: Some(180_000),
            bpm: None,
            directory_id,
            path: PathBuf::from(format!("/music/{name}.mp3")),
            last_scanned_unix_ms: 1_000,
        }
    }

    fn store_with_directory() -> (CatalogStore, i64) {
        let mut store = CatalogStore::open_in_memory().expect("open store");
        let record = store
            .with_write_tx(|tx| CatalogStore::insert_directory(tx, Path::new("/music")))
            .expect("insert directory");
        let RecordKey::Id(dir_id) = record.key else {
            panic!("directory key should be a plain id");
        };
        (store, dir_id)
    }

    #[test]
    fn test_schema_initialization_is_idempotent() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("medley_schema_{nonce}.db"));

        {
            let mut store = CatalogStore::open(&path).expect("first open");
            store
                .with_write_tx(|tx| CatalogStore::insert_playlist(tx, "Road Trip", 1))
                .expect("insert playlist");
        }
        let store = CatalogStore::open(&path).expect("second open");
        let playlists = store.list_playlists().expect("list playlists");
        assert_eq!(playlists.len(), 1);
        assert_eq!(playlists[0].name, "Road Trip");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_adds_bpm_column_to_databases_without_it() {
        let nonce = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("medley_migrate_{nonce}.db"));

        // Lay down the pre-bpm tracks table with one row in it.
        {
            let conn = rusqlite::Connection::open(&path).expect("raw open");
            conn.execute_batch(
                "CREATE TABLE tracks (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    title TEXT NOT NULL,
                    artists TEXT NOT NULL DEFAULT '[]',
                    album TEXT NOT NULL DEFAULT '',
                    year INTEGER,
                    track_number INTEGER,
                    duration_ms INTEGER,
                    rating INTEGER,
                    play_count INTEGER NOT NULL DEFAULT 0,
                    play_history TEXT NOT NULL DEFAULT '[]',
                    custom TEXT NOT NULL DEFAULT '{}',
                    directory_id INTEGER NOT NULL,
                    path TEXT NOT NULL,
                    file_name TEXT NOT NULL,
                    last_scanned_unix_ms INTEGER NOT NULL
                );",
            )
            .expect("legacy schema");
            conn.execute(
                "INSERT INTO tracks (title, directory_id, path, file_name, last_scanned_unix_ms)
                 VALUES ('old', 1, '/music/old.mp3', 'old.mp3', 1)",
                [],
            )
            .expect("legacy row");
        }

        let mut store = CatalogStore::open(&path).expect("open migrates");
        let mut import = sample_import(1, "new");
        import.bpm = Some(128.0);
        let record = store
            .with_write_tx(|tx| CatalogStore::insert_track(tx, &import))
            .expect("insert with bpm");
        let RecordKey::Id(new_id) = record.key else {
            panic!("track key should be a plain id");
        };
        assert_eq!(store.get_track(new_id).expect("new row").bpm, Some(128.0));
        assert_eq!(store.get_track(1).expect("legacy row").bpm, None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_artist_lookups_match_inside_json_lists() {
        let (mut store, dir_id) = store_with_directory();
        let mut solo = sample_import(dir_id, "solo");
        solo.artists = vec!["Ann".to_string()];
        let mut duet = sample_import(dir_id, "duet");
        duet.artists = vec!["Ann".to_string(), "Ben".to_string()];
        for import in [&solo, &duet] {
            store
                .with_write_tx(|tx| CatalogStore::insert_track(tx, import))
                .expect("insert track");
        }
        store
            .with_write_tx(|tx| {
                CatalogStore::upsert_album(tx, "X", &["Ann".to_string()], None, None)?;
                CatalogStore::upsert_album(tx, "Y", &["Ben".to_string()], None, None)
            })
            .expect("insert albums");

        let ann_tracks = store.tracks_for_artist("Ann").expect("tracks for Ann");
        assert_eq!(ann_tracks.len(), 2);
        let ben_tracks = store.tracks_for_artist("Ben").expect("tracks for Ben");
        assert_eq!(ben_tracks.len(), 1);
        assert_eq!(ben_tracks[0].title, "duet");
        // Substrings of a stored name must not match.
        assert!(store.tracks_for_artist("An").expect("prefix").is_empty());

        let ben_albums = store.albums_for_artist("Ben").expect("albums for Ben");
        assert_eq!(ben_albums.len(), 1);
        assert_eq!(ben_albums[0].name, "Y");
    }

    #[test]
    fn test_duplicate_playlist_name_is_a_typed_conflict() {
        let mut store = CatalogStore::open_in_memory().expect("open store");
        store
            .with_write_tx(|tx| CatalogStore::insert_playlist(tx, "Road Trip", 1))
            .expect("first insert");
        let err = store
            .with_write_tx(|tx| CatalogStore::insert_playlist(tx, "Road Trip", 2))
            .expect_err("duplicate should fail");
        assert!(matches!(
            err,
            CatalogError::UniquenessConflict {
                store: StoreName::Playlists,
                ..
            }
        ));
        assert_eq!(store.list_playlists().expect("list").len(), 1);
    }

    #[test]
    fn test_update_track_preserves_stats_and_bumps_last_scanned() {
        let (mut store, dir_id) = store_with_directory();
        let record = store
            .with_write_tx(|tx| CatalogStore::insert_track(tx, &sample_import(dir_id, "a")))
            .expect("insert track");
        let RecordKey::Id(track_id) = record.key else {
            panic!("track key should be a plain id");
        };
        store
            .with_write_tx(|tx| CatalogStore::record_playback(tx, track_id, 5_000))
            .expect("record playback");

        // Re-import with an older wall clock than the stored scan time.
        let mut reimport = sample_import(dir_id, "a");
        reimport.title = "a (remaster)".to_string();
        reimport.last_scanned_unix_ms = 500;
        store
            .with_write_tx(|tx| CatalogStore::update_track(tx, track_id, &reimport))
            .expect("update track");

        let track = store.get_track(track_id).expect("get track");
        assert_eq!(track.title, "a (remaster)");
        assert_eq!(track.play_count, 1);
        assert_eq!(track.play_history, vec![5_000]);
        assert!(track.last_scanned_unix_ms > 1_000);
    }

    #[test]
    fn test_album_merge_unions_artists_and_backfills_once() {
        let mut store = CatalogStore::open_in_memory().expect("open store");
        store
            .with_write_tx(|tx| {
                CatalogStore::upsert_album(tx, "X", &["Ann".to_string()], None, None)
            })
            .expect("first upsert");
        let record = store
            .with_write_tx(|tx| {
                CatalogStore::upsert_album(tx, "X", &["Ben".to_string()], Some(1999), None)
            })
            .expect("second upsert")
            .expect("merge should change the row");
        assert_eq!(record.op, ChangeOp::Update);

        let album = store
            .find_album_by_name("X")
            .expect("find album")
            .expect("album exists");
        assert_eq!(album.artists, vec!["Ann".to_string(), "Ben".to_string()]);
        assert_eq!(album.year, Some(1999));

        // Year is already set; a different year must not overwrite it.
        let unchanged = store
            .with_write_tx(|tx| {
                CatalogStore::upsert_album(
                    tx,
                    "X",
                    &["Ann".to_string(), "Ben".to_string()],
                    Some(2005),
                    None,
                )
            })
            .expect("third upsert");
        assert!(unchanged.is_none());
        let album = store
            .find_album_by_name("X")
            .expect("find album")
            .expect("album exists");
        assert_eq!(album.year, Some(1999));
    }

    #[test]
    fn test_delete_directory_cascades_tracks_and_memberships() {
        let (mut store, dir_id) = store_with_directory();
        let mut track_ids = Vec::new();
        for name in ["a", "b"] {
            let record = store
                .with_write_tx(|tx| CatalogStore::insert_track(tx, &sample_import(dir_id, name)))
                .expect("insert track");
            let RecordKey::Id(id) = record.key else {
                panic!("track key should be a plain id");
            };
            track_ids.push(id);
        }
        store
            .with_write_tx(|tx| CatalogStore::add_membership(tx, -1, track_ids[0]))
            .expect("favorite first track");

        let records = store
            .with_write_tx(|tx| CatalogStore::delete_directory(tx, dir_id))
            .expect("delete directory");

        let membership_deletes = records
            .iter()
            .filter(|r| r.store == StoreName::PlaylistsTracks)
            .count();
        let track_deletes = records
            .iter()
            .filter(|r| r.store == StoreName::Tracks)
            .count();
        assert_eq!(membership_deletes, 1);
        assert_eq!(track_deletes, 2);
        assert_eq!(
            records.last().map(|r| r.store),
            Some(StoreName::Directories)
        );
        assert!(records.iter().all(|r| r.op == ChangeOp::Delete));
        assert!(store.get_track(track_ids[0]).is_err());
        assert!(store.get_directory(dir_id).is_err());
    }
}
