//! Read-through entity cache kept coherent by change batches.
//!
//! Entries are weakly held: the map stores `Weak` pointers and a bounded
//! strong ring keeps the most recently used entities alive. Once the ring
//! evicts an entry and no caller still holds it, the slot is reclaimable.
//! The cache is purely derivative; it never writes to the store.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};

use crate::catalog_store::CatalogStore;
use crate::error::{CatalogError, Result};
use crate::protocol::{
    AlbumRecord, ArtistRecord, ChangeOp, ChangeRecord, DirectoryRecord, EntityPayload,
    MembershipRecord, PlaylistRecord, RecordKey, StoreName, TrackRecord,
    FAVORITES_PLAYLIST_ID,
};

/// A cached track with its derived attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedTrack {
    pub record: TrackRecord,
    /// Derived from the Favorites membership rows; recomputed in place when
    /// a related membership change arrives.
    pub is_favorite: bool,
}

/// Materialized entity held under a `(collection, key)` slot.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedEntity {
    Track(CachedTrack),
    Album(AlbumRecord),
    Artist(ArtistRecord),
    Playlist(PlaylistRecord),
    Membership(MembershipRecord),
    Directory(DirectoryRecord),
}

type CacheKey = (StoreName, RecordKey);

struct SlotMap {
    entries: HashMap<CacheKey, Weak<CachedEntity>>,
    /// Strong references for recently used entries, oldest first.
    recent: VecDeque<(CacheKey, Arc<CachedEntity>)>,
}

pub struct EntityCache {
    store: Mutex<CatalogStore>,
    slots: Mutex<SlotMap>,
    in_flight: Mutex<HashSet<CacheKey>>,
    in_flight_done: Condvar,
    /// Bumped for every applied change record. A fetch that started before a
    /// bump must not install its result over the newer notification.
    version: AtomicU64,
    capacity: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl EntityCache {
    /// Wraps a read connection. `capacity` bounds the strong ring, not the
    /// weak map (dead weaks are swept lazily).
    pub fn new(store: CatalogStore, capacity: usize) -> Self {
        Self {
            store: Mutex::new(store),
            slots: Mutex::new(SlotMap {
                entries: HashMap::new(),
                recent: VecDeque::new(),
            }),
            in_flight: Mutex::new(HashSet::new()),
            in_flight_done: Condvar::new(),
            version: AtomicU64::new(0),
            capacity: capacity.max(1),
        }
    }

    /// Returns the entity for `(store, key)`, fetching through to the catalog
    /// store on miss. Concurrent requests for the same key coalesce to one
    /// underlying read.
    pub fn get(&self, store: StoreName, key: RecordKey) -> Result<Arc<CachedEntity>> {
        let cache_key = (store, key);
        loop {
            if let Some(entity) = self.cached(cache_key) {
                return Ok(entity);
            }
            let mut in_flight = lock(&self.in_flight);
            if !in_flight.contains(&cache_key) {
                in_flight.insert(cache_key);
                break;
            }
            // Another caller is already fetching this key; wait, then
            // re-check the slot.
            let guard = self
                .in_flight_done
                .wait(in_flight)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            drop(guard);
        }

        let fetched_at = self.version.load(Ordering::SeqCst);
        let fetched = self.fetch(store, key);
        let result = match fetched {
            Ok(entity) => {
                let entity = Arc::new(entity);
                self.store_slot(cache_key, &entity, fetched_at);
                Ok(entity)
            }
            Err(err) => Err(err),
        };

        let mut in_flight = lock(&self.in_flight);
        in_flight.remove(&cache_key);
        drop(in_flight);
        self.in_flight_done.notify_all();
        result
    }

    pub fn get_track(&self, id: i64) -> Result<Arc<CachedEntity>> {
        self.get(StoreName::Tracks, RecordKey::Id(id))
    }

    /// Applies one committed batch. Record application is idempotent, so
    /// batches arriving out of order across senders cannot corrupt state.
    pub fn apply_batch(&self, batch: &[ChangeRecord]) {
        for record in batch {
            self.version.fetch_add(1, Ordering::SeqCst);
            match record.op {
                ChangeOp::Delete => {
                    let mut slots = lock(&self.slots);
                    Self::remove_slot(&mut slots, (record.store, record.key));
                }
                ChangeOp::Add | ChangeOp::Update => self.patch(record),
            }
            if record.store == StoreName::PlaylistsTracks {
                self.recompute_favorite(record);
            }
        }
    }

    /// Drops every slot, forcing subsequent reads back through the store.
    /// Used after a subscription gap, where re-fetching replaces replay.
    pub fn clear(&self) {
        self.version.fetch_add(1, Ordering::SeqCst);
        let mut slots = lock(&self.slots);
        slots.entries.clear();
        slots.recent.clear();
    }

    #[cfg(test)]
    pub(crate) fn peek(&self, store: StoreName, key: RecordKey) -> Option<Arc<CachedEntity>> {
        self.cached((store, key))
    }

    fn cached(&self, cache_key: CacheKey) -> Option<Arc<CachedEntity>> {
        let mut slots = lock(&self.slots);
        let entity = slots.entries.get(&cache_key)?.upgrade()?;
        Self::touch(&mut slots, cache_key, &entity, self.capacity);
        Some(entity)
    }

    fn fetch(&self, store: StoreName, key: RecordKey) -> Result<CachedEntity> {
        let catalog = lock(&self.store);
        match (store, key) {
            (StoreName::Tracks, RecordKey::Id(id)) => {
                let record = catalog.get_track(id)?;
                let is_favorite = catalog.is_favorite(id)?;
                Ok(CachedEntity::Track(CachedTrack {
                    record,
                    is_favorite,
                }))
            }
            (StoreName::Albums, RecordKey::Id(id)) => {
                Ok(CachedEntity::Album(catalog.get_album(id)?))
            }
            (StoreName::Artists, RecordKey::Id(id)) => {
                Ok(CachedEntity::Artist(catalog.get_artist(id)?))
            }
            (StoreName::Playlists, RecordKey::Id(id)) => {
                Ok(CachedEntity::Playlist(catalog.get_playlist(id)?))
            }
            (StoreName::Directories, RecordKey::Id(id)) => {
                Ok(CachedEntity::Directory(catalog.get_directory(id)?))
            }
            (StoreName::PlaylistsTracks, RecordKey::Pair(playlist_id, track_id)) => {
                if catalog.membership_exists(playlist_id, track_id)? {
                    Ok(CachedEntity::Membership(MembershipRecord {
                        playlist_id,
                        track_id,
                    }))
                } else {
                    Err(CatalogError::NotFound { store, key })
                }
            }
            (store, key) => Err(CatalogError::NotFound { store, key }),
        }
    }

    fn patch(&self, record: &ChangeRecord) {
        let Some(value) = &record.value else {
            return;
        };
        let cache_key = (record.store, record.key);
        let mut slots = lock(&self.slots);
        let Some(weak) = slots.entries.get(&cache_key) else {
            // Adds are applied opportunistically; a cold slot stays cold.
            return;
        };
        let Some(previous) = weak.upgrade() else {
            Self::remove_slot(&mut slots, cache_key);
            return;
        };

        let next = match (value, previous.as_ref()) {
            (EntityPayload::Track(track), CachedEntity::Track(prev)) => {
                // Replace the payload, keep the derived favorite flag.
                CachedEntity::Track(CachedTrack {
                    record: track.clone(),
                    is_favorite: prev.is_favorite,
                })
            }
            (EntityPayload::Track(track), _) => CachedEntity::Track(CachedTrack {
                record: track.clone(),
                is_favorite: false,
            }),
            (EntityPayload::Album(album), _) => CachedEntity::Album(album.clone()),
            (EntityPayload::Artist(artist), _) => CachedEntity::Artist(artist.clone()),
            (EntityPayload::Playlist(playlist), _) => CachedEntity::Playlist(playlist.clone()),
            (EntityPayload::Membership(membership), _) => CachedEntity::Membership(*membership),
            (EntityPayload::Directory(directory), _) => CachedEntity::Directory(directory.clone()),
        };
        if next == *previous {
            return;
        }
        let next = Arc::new(next);
        slots.entries.insert(cache_key, Arc::downgrade(&next));
        Self::touch(&mut slots, cache_key, &next, self.capacity);
    }

    /// A Favorites membership change recomputes the affected cached track's
    /// flag in place rather than dropping the entry.
    fn recompute_favorite(&self, record: &ChangeRecord) {
        let RecordKey::Pair(playlist_id, track_id) = record.key else {
            return;
        };
        if playlist_id != FAVORITES_PLAYLIST_ID {
            return;
        }
        let is_favorite = match record.op {
            ChangeOp::Add => true,
            ChangeOp::Delete => false,
            ChangeOp::Update => return,
        };

        let track_key = (StoreName::Tracks, RecordKey::Id(track_id));
        let mut slots = lock(&self.slots);
        let Some(previous) = slots.entries.get(&track_key).and_then(Weak::upgrade) else {
            return;
        };
        let CachedEntity::Track(prev) = previous.as_ref() else {
            return;
        };
        if prev.is_favorite == is_favorite {
            return;
        }
        let next = Arc::new(CachedEntity::Track(CachedTrack {
            record: prev.record.clone(),
            is_favorite,
        }));
        slots.entries.insert(track_key, Arc::downgrade(&next));
        Self::touch(&mut slots, track_key, &next, self.capacity);
    }

    fn store_slot(&self, cache_key: CacheKey, entity: &Arc<CachedEntity>, fetched_at: u64) {
        let mut slots = lock(&self.slots);
        // A record applied since the fetch started supersedes its result.
        // The caller still gets the fetched value; the next read refetches.
        if self.version.load(Ordering::SeqCst) != fetched_at {
            return;
        }
        slots.entries.insert(cache_key, Arc::downgrade(entity));
        Self::touch(&mut slots, cache_key, entity, self.capacity);

        // Lazy sweep of dead weaks once the map grows well past the ring.
        if slots.entries.len() > self.capacity * 4 {
            slots.entries.retain(|_, weak| weak.strong_count() > 0);
        }
    }

    fn touch(
        slots: &mut SlotMap,
        cache_key: CacheKey,
        entity: &Arc<CachedEntity>,
        capacity: usize,
    ) {
        if let Some(position) = slots.recent.iter().position(|(key, _)| *key == cache_key) {
            slots.recent.remove(position);
        }
        slots.recent.push_back((cache_key, entity.clone()));
        while slots.recent.len() > capacity {
            slots.recent.pop_front();
        }
    }

    fn remove_slot(slots: &mut SlotMap, cache_key: CacheKey) {
        slots.entries.remove(&cache_key);
        if let Some(position) = slots.recent.iter().position(|(key, _)| *key == cache_key) {
            slots.recent.remove(position);
        }
    }
}
