//! Intention-revealing catalog mutations.
//!
//! Every operation runs exactly one write transaction and publishes exactly
//! one change batch; the store commit always comes first, notification
//! second, cache patching third (driven by the bus subscriber).

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::catalog_store::CatalogStore;
use crate::change_bus::ChangeBus;
use crate::error::Result;
use crate::import_manager::now_unix_ms;
use crate::protocol::{
    DirectoryRecord, EntityPayload, PlaylistRecord, TrackRecord, FAVORITES_PLAYLIST_ID,
};

pub struct LibraryService {
    store: Mutex<CatalogStore>,
    bus: Arc<ChangeBus>,
}

impl LibraryService {
    pub fn new(store: CatalogStore, bus: Arc<ChangeBus>) -> Self {
        Self {
            store: Mutex::new(store),
            bus,
        }
    }

    fn store(&self) -> MutexGuard<'_, CatalogStore> {
        self.store
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn create_playlist(&self, name: &str) -> Result<PlaylistRecord> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::insert_playlist(tx, name, now_unix_ms()))?;
        let playlist = match &record.value {
            Some(EntityPayload::Playlist(playlist)) => playlist.clone(),
            _ => unreachable!("insert_playlist always carries a playlist payload"),
        };
        self.bus.publish(vec![record]);
        Ok(playlist)
    }

    pub fn rename_playlist(&self, id: i64, name: &str) -> Result<()> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::rename_playlist(tx, id, name))?;
        self.bus.publish(vec![record]);
        Ok(())
    }

    pub fn delete_playlist(&self, id: i64) -> Result<()> {
        let records = self
            .store()
            .with_write_tx(|tx| CatalogStore::delete_playlist(tx, id))?;
        self.bus.publish(records);
        Ok(())
    }

    /// Adds the track when absent, removes it when present. Returns the new
    /// membership state.
    pub fn toggle_playlist_track(&self, playlist_id: i64, track_id: i64) -> Result<bool> {
        let mut store = self.store();
        // Surface not-found before touching the join table. Favorites never
        // has a playlist row.
        store.get_track(track_id)?;
        if playlist_id != FAVORITES_PLAYLIST_ID {
            store.get_playlist(playlist_id)?;
        }
        let (records, now_member) = store.with_write_tx(|tx| {
            if let Some(record) = CatalogStore::remove_membership(tx, playlist_id, track_id)? {
                return Ok((vec![record], false));
            }
            match CatalogStore::add_membership(tx, playlist_id, track_id)? {
                Some(record) => Ok((vec![record], true)),
                None => Ok((Vec::new(), true)),
            }
        })?;
        drop(store);
        self.bus.publish(records);
        Ok(now_member)
    }

    pub fn toggle_favorite(&self, track_id: i64) -> Result<bool> {
        self.toggle_playlist_track(FAVORITES_PLAYLIST_ID, track_id)
    }

    pub fn add_directory(&self, path: &Path) -> Result<DirectoryRecord> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::insert_directory(tx, path))?;
        let directory = match &record.value {
            Some(EntityPayload::Directory(directory)) => directory.clone(),
            _ => unreachable!("insert_directory always carries a directory payload"),
        };
        self.bus.publish(vec![record]);
        Ok(directory)
    }

    /// Points an existing directory row at a new folder handle. The caller
    /// follows up with a replace import to purge and rescan its tracks.
    pub fn replace_directory(&self, id: i64, path: &Path) -> Result<()> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::update_directory_path(tx, id, path))?;
        self.bus.publish(vec![record]);
        Ok(())
    }

    /// Removes the directory and everything it owns in one transaction; the
    /// batch carries each track and membership deletion individually so
    /// caches can patch row by row.
    pub fn remove_directory(&self, id: i64) -> Result<()> {
        let records = self
            .store()
            .with_write_tx(|tx| CatalogStore::delete_directory(tx, id))?;
        self.bus.publish(records);
        Ok(())
    }

    pub fn record_playback(&self, track_id: i64) -> Result<()> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::record_playback(tx, track_id, now_unix_ms()))?;
        self.bus.publish(vec![record]);
        Ok(())
    }

    pub fn set_track_rating(&self, track_id: i64, rating: Option<i64>) -> Result<()> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::set_track_rating(tx, track_id, rating))?;
        self.bus.publish(vec![record]);
        Ok(())
    }

    pub fn set_track_custom(&self, track_id: i64, key: &str, value: Option<String>) -> Result<()> {
        let record = self
            .store()
            .with_write_tx(|tx| CatalogStore::set_track_custom(tx, track_id, key, value))?;
        self.bus.publish(vec![record]);
        Ok(())
    }

    // Read passthroughs used by callers that want rows rather than cached
    // entities.

    pub fn list_playlists(&self) -> Result<Vec<PlaylistRecord>> {
        self.store().list_playlists()
    }

    pub fn list_directories(&self) -> Result<Vec<DirectoryRecord>> {
        self.store().list_directories()
    }

    pub fn tracks_for_directory(&self, directory_id: i64) -> Result<Vec<TrackRecord>> {
        self.store().tracks_for_directory(directory_id)
    }

    pub fn track_count_for_directory(&self, directory_id: i64) -> Result<usize> {
        self.store().track_count_for_directory(directory_id)
    }
}
