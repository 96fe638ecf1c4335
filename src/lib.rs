//! Local-first media catalog: persistent library store with live change
//! propagation.
//!
//! The catalog keeps tracks, albums, artists, playlists, and directories in
//! an embedded SQLite store, broadcasts every committed mutation as a change
//! batch, keeps a read-through entity cache coherent from those batches, and
//! imports directories incrementally on background worker threads.

pub mod catalog_store;
pub mod change_bus;
pub mod config;
pub mod entity_cache;
pub mod error;
pub mod file_discovery;
pub mod import_manager;
pub mod library_service;
pub mod metadata_tags;
pub mod protocol;

use std::sync::Arc;
use std::thread::JoinHandle;

use catalog_store::CatalogStore;
use change_bus::{BusEvent, ChangeBus};
use config::CatalogConfig;
use entity_cache::{CachedEntity, EntityCache};
use error::Result;
use import_manager::ImportManager;
use library_service::LibraryService;
use metadata_tags::LoftyTagReader;
use protocol::{RecordKey, StoreName};

const BUS_CAPACITY: usize = 256;

/// One assembled catalog: store connections, bus, cache, services, and the
/// cache-patching subscriber. Explicitly constructed and torn down; nothing
/// here is ambient global state.
pub struct Catalog {
    bus: Arc<ChangeBus>,
    cache: Arc<EntityCache>,
    service: LibraryService,
    imports: ImportManager,
    patcher: Option<JoinHandle<()>>,
}

impl Catalog {
    /// Opens the catalog described by `config`, creating storage on first
    /// use, and starts the subscriber that keeps the entity cache patched.
    pub fn open(config: &CatalogConfig) -> Result<Self> {
        let db_path = config.database_path();
        let bus = Arc::new(ChangeBus::new(BUS_CAPACITY));
        let cache = Arc::new(EntityCache::new(
            CatalogStore::open(&db_path)?,
            config.cache.capacity,
        ));
        let service = LibraryService::new(CatalogStore::open(&db_path)?, bus.clone());
        let imports = ImportManager::new(
            db_path,
            bus.clone(),
            Arc::new(LoftyTagReader),
            config.import.extra_extensions.clone(),
        );

        let patcher_cache = cache.clone();
        let mut subscription = bus.subscribe();
        let patcher = std::thread::spawn(move || loop {
            match subscription.blocking_recv() {
                BusEvent::Batch(batch) => patcher_cache.apply_batch(&batch),
                // A gap means missed batches: drop everything and let reads
                // fetch back through the store.
                BusEvent::Lagged(_) => patcher_cache.clear(),
                BusEvent::Closed => break,
            }
        });

        Ok(Self {
            bus,
            cache,
            service,
            imports,
            patcher: Some(patcher),
        })
    }

    pub fn service(&self) -> &LibraryService {
        &self.service
    }

    pub fn imports(&self) -> &ImportManager {
        &self.imports
    }

    pub fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    /// Cached read-through fetch.
    pub fn entity(&self, store: StoreName, key: RecordKey) -> Result<Arc<CachedEntity>> {
        self.cache.get(store, key)
    }

    pub fn track(&self, id: i64) -> Result<Arc<CachedEntity>> {
        self.cache.get_track(id)
    }

    /// Tears the catalog down, joining the cache patcher after the last bus
    /// sender is gone.
    pub fn shutdown(mut self) {
        let patcher = self.patcher.take();
        drop(self);
        if let Some(patcher) = patcher {
            let _ = patcher.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity_cache::CachedEntity;
    use std::time::{Duration, SystemTime, UNIX_EPOCH};

    fn temp_config(name: &str) -> (CatalogConfig, std::path::PathBuf) {
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time should be valid")
            .as_nanos();
        let base = std::env::temp_dir().join(format!("medley_{name}_{nonce}"));
        std::fs::create_dir_all(&base).expect("create temp dir");
        let mut config = CatalogConfig::default();
        config.storage.database_file = base
            .join("catalog.db")
            .to_string_lossy()
            .to_string();
        (config, base)
    }

    #[test]
    fn test_cache_is_patched_from_service_mutations() {
        let (config, base) = temp_config("catalog");
        let catalog = Catalog::open(&config).expect("open catalog");

        let directory = catalog
            .service()
            .add_directory(std::path::Path::new("/music"))
            .expect("add directory");

        // The patcher runs on its own thread; wait for the add to land in
        // the warm cache entry.
        let entity = catalog
            .entity(StoreName::Directories, RecordKey::Id(directory.id))
            .expect("fetch directory");
        match entity.as_ref() {
            CachedEntity::Directory(record) => assert_eq!(record.id, directory.id),
            other => panic!("expected directory entity, got {other:?}"),
        }

        catalog
            .service()
            .remove_directory(directory.id)
            .expect("remove directory");
        // Deletion clears the slot; a read-through now reports not-found.
        let mut attempts = 0;
        loop {
            match catalog.entity(StoreName::Directories, RecordKey::Id(directory.id)) {
                Err(crate::error::CatalogError::NotFound { .. }) => break,
                _ if attempts < 100 => {
                    attempts += 1;
                    std::thread::sleep(Duration::from_millis(5));
                }
                other => panic!("expected not-found after removal, got {other:?}"),
            }
        }

        catalog.shutdown();
        let _ = std::fs::remove_dir_all(base);
    }
}
