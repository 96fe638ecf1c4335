//! Background directory import pipeline.
//!
//! Each import runs on its own worker thread with its own store connection,
//! communicating with the initiating caller only through a progress channel.
//! The walk diffs scanned files against the directory's known tracks, writes
//! adds/updates/removals transactionally, and publishes each commit's change
//! batch on the bus.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{SyncSender, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};

use crate::catalog_store::{CatalogStore, TrackImport};
use crate::change_bus::ChangeBus;
use crate::error::{CatalogError, Result};
use crate::file_discovery::{collect_media_files, find_folder_cover};
use crate::metadata_tags::{fallback_title_from_path, TagReader, TrackTags};
use crate::protocol::{
    ImportCounters, ImportEvent, ImportProgress, ImportRequest, TrackRecord,
};

pub(crate) fn now_unix_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

fn file_modified_unix_ms(path: &Path) -> i64 {
    std::fs::metadata(path)
        .and_then(|meta| meta.modified())
        .ok()
        .and_then(|modified| modified.duration_since(UNIX_EPOCH).ok())
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}

/// Confirms that a scanned file and a stored track point at the same
/// underlying filesystem entry. Name equality alone is never enough; a file
/// moved between sibling folders keeps its name but is a different entry.
#[cfg(unix)]
fn same_entry(scanned: &Path, stored: &Path) -> bool {
    use std::os::unix::fs::MetadataExt;
    if scanned == stored {
        return true;
    }
    match (std::fs::metadata(scanned), std::fs::metadata(stored)) {
        (Ok(a), Ok(b)) => a.dev() == b.dev() && a.ino() == b.ino(),
        _ => false,
    }
}

#[cfg(not(unix))]
fn same_entry(scanned: &Path, stored: &Path) -> bool {
    if scanned == stored {
        return true;
    }
    match (std::fs::metadata(scanned), std::fs::metadata(stored)) {
        (Ok(a), Ok(b)) => {
            a.len() == b.len() && a.modified().ok() == b.modified().ok()
        }
        _ => false,
    }
}

fn import_from_tags(directory_id: i64, path: &Path, tags: TrackTags) -> TrackImport {
    let title = if tags.title.trim().is_empty() {
        fallback_title_from_path(path)
    } else {
        tags.title
    };
    TrackImport {
        title,
        artists: tags.artists,
        album: tags.album,
        year: tags.year,
        track_number: tags.track_number,
        duration_ms: tags.duration_ms,
        bpm: tags.bpm,
        directory_id,
        path: path.to_path_buf(),
        last_scanned_unix_ms: now_unix_ms(),
    }
}

/// Clears the in-progress flag when an import worker exits, on any path.
struct ImportSlot {
    in_progress: Arc<Mutex<HashSet<i64>>>,
    directory_id: i64,
}

impl Drop for ImportSlot {
    fn drop(&mut self) {
        let mut in_progress = self
            .in_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        in_progress.remove(&self.directory_id);
    }
}

/// Coordinates background imports and enforces directory-level mutual
/// exclusion: at most one active import per directory, any number across
/// distinct directories.
pub struct ImportManager {
    db_path: PathBuf,
    bus: Arc<ChangeBus>,
    tag_reader: Arc<dyn TagReader>,
    extra_extensions: Vec<String>,
    in_progress: Arc<Mutex<HashSet<i64>>>,
}

impl ImportManager {
    pub fn new(
        db_path: PathBuf,
        bus: Arc<ChangeBus>,
        tag_reader: Arc<dyn TagReader>,
        extra_extensions: Vec<String>,
    ) -> Self {
        Self {
            db_path,
            bus,
            tag_reader,
            extra_extensions,
            in_progress: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn try_begin(&self, directory_id: i64) -> Result<ImportSlot> {
        let mut in_progress = self
            .in_progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if !in_progress.insert(directory_id) {
            return Err(CatalogError::ImportBusy { directory_id });
        }
        Ok(ImportSlot {
            in_progress: self.in_progress.clone(),
            directory_id,
        })
    }

    /// Spawns a worker for `request`. Progress events stream over
    /// `progress_tx`; the join handle carries the final counters or the
    /// aborting error. There is no mid-scan cancellation: a caller that loses
    /// interest simply stops draining progress.
    pub fn start(
        &self,
        request: ImportRequest,
        progress_tx: SyncSender<ImportEvent>,
    ) -> Result<JoinHandle<Result<ImportCounters>>> {
        let slot = self.try_begin(request.directory_id())?;
        let db_path = self.db_path.clone();
        let bus = self.bus.clone();
        let tag_reader = self.tag_reader.clone();
        let extra_extensions = self.extra_extensions.clone();

        Ok(thread::spawn(move || {
            let _slot = slot;
            let directory_id = request.directory_id();
            let mut store = match CatalogStore::open(&db_path) {
                Ok(store) => store,
                Err(err) => {
                    let _ = progress_tx.send(ImportEvent::Failed {
                        directory_id,
                        error: err.to_string(),
                    });
                    return Err(err);
                }
            };
            match run_import(
                &mut store,
                &bus,
                tag_reader.as_ref(),
                &request,
                &extra_extensions,
                &progress_tx,
            ) {
                Ok(counters) => Ok(counters),
                Err(err) => {
                    warn!("Import of directory {directory_id} aborted: {err}");
                    let _ = progress_tx.send(ImportEvent::Failed {
                        directory_id,
                        error: err.to_string(),
                    });
                    Err(err)
                }
            }
        }))
    }
}

fn push_progress(
    progress_tx: &SyncSender<ImportEvent>,
    directory_id: i64,
    count: ImportCounters,
    finished: bool,
) {
    let event = ImportEvent::Progress(ImportProgress {
        directory_id,
        finished,
        count,
    });
    if finished {
        let _ = progress_tx.send(event);
    } else {
        // Intermediate updates may be dropped under backpressure; the final
        // message always carries the complete counters.
        match progress_tx.try_send(event) {
            Ok(()) | Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {}
        }
    }
}

fn run_import(
    store: &mut CatalogStore,
    bus: &ChangeBus,
    reader: &dyn TagReader,
    request: &ImportRequest,
    extra_extensions: &[String],
    progress_tx: &SyncSender<ImportEvent>,
) -> Result<ImportCounters> {
    let directory_id = request.directory_id();
    let root = request.path().clone();
    let mut counters = ImportCounters::default();

    if let ImportRequest::DirectoryReplace { .. } = request {
        let purged = purge_directory_tracks(store, bus, directory_id)?;
        counters.removed += purged;
    }

    let existing = store.tracks_for_directory(directory_id)?;
    let mut by_file_name: HashMap<String, Vec<&TrackRecord>> = HashMap::new();
    for track in &existing {
        let file_name = track
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();
        by_file_name.entry(file_name).or_default().push(track);
    }

    let files = collect_media_files(&root, extra_extensions)?;
    counters.total = files.len();
    let mut matched: HashSet<i64> = HashSet::new();

    for file in files {
        counters.current += 1;
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_default();

        let candidate = by_file_name.get(file_name.as_str()).and_then(|tracks| {
            tracks
                .iter()
                .find(|track| !matched.contains(&track.id) && same_entry(&file, &track.path))
                .copied()
        });

        match candidate {
            Some(track) => {
                matched.insert(track.id);
                if file_modified_unix_ms(&file) <= track.last_scanned_unix_ms {
                    // Unchanged since the last scan. Coarse filesystem
                    // timestamps can hide a very recent edit; accepted
                    // approximation.
                } else if let Some(tags) = reader.read_tags(&file) {
                    let import = import_from_tags(directory_id, &file, tags);
                    let cover = file.parent().and_then(find_folder_cover);
                    let records = store.with_write_tx(|tx| {
                        let mut records = Vec::new();
                        for artist in &import.artists {
                            if let Some(record) = CatalogStore::ensure_artist(tx, artist)? {
                                records.push(record);
                            }
                        }
                        if !import.album.is_empty() {
                            if let Some(record) = CatalogStore::upsert_album(
                                tx,
                                &import.album,
                                &import.artists,
                                import.year,
                                cover.as_deref(),
                            )? {
                                records.push(record);
                            }
                        }
                        records.push(CatalogStore::update_track(tx, track.id, &import)?);
                        Ok(records)
                    })?;
                    bus.publish(records);
                    counters.existing_updated += 1;
                } else {
                    debug!("Import: could not re-read tags of {}, skipped", file.display());
                }
            }
            None => {
                if let Some(tags) = reader.read_tags(&file) {
                    let import = import_from_tags(directory_id, &file, tags);
                    let cover = file.parent().and_then(find_folder_cover);
                    let records = store.with_write_tx(|tx| {
                        let mut records = Vec::new();
                        for artist in &import.artists {
                            if let Some(record) = CatalogStore::ensure_artist(tx, artist)? {
                                records.push(record);
                            }
                        }
                        if !import.album.is_empty() {
                            if let Some(record) = CatalogStore::upsert_album(
                                tx,
                                &import.album,
                                &import.artists,
                                import.year,
                                cover.as_deref(),
                            )? {
                                records.push(record);
                            }
                        }
                        records.push(CatalogStore::insert_track(tx, &import)?);
                        Ok(records)
                    })?;
                    bus.publish(records);
                    counters.newly_imported += 1;
                } else {
                    debug!("Import: could not read tags of {}, skipped", file.display());
                }
            }
        }

        push_progress(progress_tx, directory_id, counters, false);
    }

    // Everything previously known for this directory that the walk did not
    // match no longer exists on disk.
    let stale: Vec<i64> = existing
        .iter()
        .filter(|track| !matched.contains(&track.id))
        .map(|track| track.id)
        .collect();
    if !stale.is_empty() {
        let records = store.with_write_tx(|tx| {
            let mut records = Vec::new();
            for track_id in &stale {
                records.extend(CatalogStore::delete_track(tx, *track_id)?);
            }
            Ok(records)
        })?;
        bus.publish(records);
        counters.removed += stale.len();
    }

    push_progress(progress_tx, directory_id, counters, true);
    info!(
        "Import of directory {} finished: {} new, {} updated, {} removed ({} file(s) seen)",
        directory_id,
        counters.newly_imported,
        counters.existing_updated,
        counters.removed,
        counters.total
    );
    Ok(counters)
}

fn purge_directory_tracks(
    store: &mut CatalogStore,
    bus: &ChangeBus,
    directory_id: i64,
) -> Result<usize> {
    let existing = store.tracks_for_directory(directory_id)?;
    if existing.is_empty() {
        return Ok(0);
    }
    let records = store.with_write_tx(|tx| {
        let mut records = Vec::new();
        for track in &existing {
            records.extend(CatalogStore::delete_track(tx, track.id)?);
        }
        Ok(records)
    })?;
    bus.publish(records);
    Ok(existing.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{ChangeOp, RecordKey, StoreName};
    use std::fs;
    use std::sync::mpsc;
    use std::time::Duration;

    /// Deterministic tag source: derives tags from the file stem, with
    /// per-file overrides for album/artist scenarios.
    struct FakeTagReader {
        overrides: HashMap<String, TrackTags>,
    }

    impl FakeTagReader {
        fn new() -> Self {
            Self {
                overrides: HashMap::new(),
            }
        }

        fn with_override(mut self, file_name: &str, tags: TrackTags) -> Self {
            self.overrides.insert(file_name.to_string(), tags);
            self
        }
    }

    impl TagReader for FakeTagReader {
        fn read_tags(&self, path: &Path) -> Option<TrackTags> {
            let file_name = path.file_name()?.to_str()?.to_string();
            if let Some(tags) = self.overrides.get(&file_name) {
                return Some(tags.clone());
            }
            let stem = path.file_stem()?.to_str()?.to_string();
            Some(TrackTags {
                title: stem.clone(),
                artists: vec![format!("Artist {stem}")],
                album: "Album".to_string(),
                year: Some(2001),
                track_number: None,
                duration_ms: Some(60_000),
                bpm: None,
            })
        }
    }

    struct Fixture {
        root: PathBuf,
        db_path: PathBuf,
        directory_id: i64,
    }

    impl Fixture {
        fn new(name: &str) -> Self {
            let nonce = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .expect("system time should be valid")
                .as_nanos();
            let base = std::env::temp_dir().join(format!("medley_{name}_{nonce}"));
            let root = base.join("music");
            fs::create_dir_all(&root).expect("create fixture root");
            let db_path = base.join("catalog.db");

            let mut store = CatalogStore::open(&db_path).expect("open store");
            let record = store
                .with_write_tx(|tx| CatalogStore::insert_directory(tx, &root))
                .expect("insert directory");
            let RecordKey::Id(directory_id) = record.key else {
                panic!("directory key should be a plain id");
            };
            Self {
                root,
                db_path,
                directory_id,
            }
        }

        fn manager(&self, reader: FakeTagReader) -> ImportManager {
            ImportManager::new(
                self.db_path.clone(),
                Arc::new(ChangeBus::new(256)),
                Arc::new(reader),
                Vec::new(),
            )
        }

        fn store(&self) -> CatalogStore {
            CatalogStore::open(&self.db_path).expect("open store")
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            if let Some(base) = self.root.parent() {
                let _ = fs::remove_dir_all(base);
            }
        }
    }

    fn import(
        manager: &ImportManager,
        request: ImportRequest,
    ) -> (ImportCounters, Vec<ImportEvent>) {
        let (tx, rx) = mpsc::sync_channel(1024);
        let handle = manager.start(request, tx).expect("start import");
        let counters = handle
            .join()
            .expect("worker should not panic")
            .expect("import should succeed");
        (counters, rx.try_iter().collect())
    }

    #[test]
    fn test_rescan_diffs_adds_and_removals() {
        let fixture = Fixture::new("diff");
        for name in ["a.mp3", "b.mp3", "c.mp3"] {
            fs::write(fixture.root.join(name), b"x").expect("write file");
        }
        let manager = fixture.manager(FakeTagReader::new());
        let request = ImportRequest::DirectoryAdd {
            directory_id: fixture.directory_id,
            path: fixture.root.clone(),
        };
        let (counters, _) = import(&manager, request.clone());
        assert_eq!(counters.newly_imported, 3);
        assert_eq!(counters.removed, 0);

        fs::remove_file(fixture.root.join("b.mp3")).expect("delete b");
        fs::write(fixture.root.join("d.mp3"), b"x").expect("write d");

        let (counters, events) = import(&manager, request);
        assert_eq!(counters.newly_imported, 1);
        assert_eq!(counters.existing_updated, 0);
        assert_eq!(counters.removed, 1);
        assert_eq!(counters.total, 3);

        let last = events.last().expect("final progress event");
        assert!(matches!(
            last,
            ImportEvent::Progress(ImportProgress { finished: true, .. })
        ));

        let store = fixture.store();
        let mut titles: Vec<String> = store
            .tracks_for_directory(fixture.directory_id)
            .expect("tracks")
            .into_iter()
            .map(|track| track.title)
            .collect();
        titles.sort();
        assert_eq!(titles, vec!["a", "c", "d"]);
    }

    #[test]
    fn test_modified_file_updates_existing_track_in_place() {
        let fixture = Fixture::new("update");
        fs::write(fixture.root.join("a.mp3"), b"x").expect("write file");
        let manager = fixture.manager(FakeTagReader::new());
        let request = ImportRequest::DirectoryAdd {
            directory_id: fixture.directory_id,
            path: fixture.root.clone(),
        };
        let (counters, _) = import(&manager, request.clone());
        assert_eq!(counters.newly_imported, 1);
        let before = fixture
            .store()
            .tracks_for_directory(fixture.directory_id)
            .expect("tracks");

        // Move the file's mtime past the stored scan timestamp.
        std::thread::sleep(Duration::from_millis(50));
        fs::write(fixture.root.join("a.mp3"), b"xy").expect("rewrite file");

        let (counters, _) = import(&manager, request);
        assert_eq!(counters.newly_imported, 0);
        assert_eq!(counters.existing_updated, 1);
        assert_eq!(counters.removed, 0);

        let after = fixture
            .store()
            .tracks_for_directory(fixture.directory_id)
            .expect("tracks");
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].id, before[0].id);
        assert!(after[0].last_scanned_unix_ms > before[0].last_scanned_unix_ms);
    }

    #[test]
    fn test_album_rows_merge_by_name_across_artists() {
        let fixture = Fixture::new("merge");
        fs::write(fixture.root.join("one.mp3"), b"x").expect("write one");
        fs::write(fixture.root.join("two.mp3"), b"x").expect("write two");
        let reader = FakeTagReader::new()
            .with_override(
                "one.mp3",
                TrackTags {
                    title: "one".to_string(),
                    artists: vec!["Ann".to_string()],
                    album: "X".to_string(),
                    ..TrackTags::default()
                },
            )
            .with_override(
                "two.mp3",
                TrackTags {
                    title: "two".to_string(),
                    artists: vec!["Ben".to_string()],
                    album: "X".to_string(),
                    ..TrackTags::default()
                },
            );
        let manager = fixture.manager(reader);
        let (counters, _) = import(
            &manager,
            ImportRequest::DirectoryAdd {
                directory_id: fixture.directory_id,
                path: fixture.root.clone(),
            },
        );
        assert_eq!(counters.newly_imported, 2);

        let store = fixture.store();
        let album = store
            .find_album_by_name("X")
            .expect("query")
            .expect("album exists");
        assert_eq!(album.artists, vec!["Ann".to_string(), "Ben".to_string()]);
    }

    #[test]
    fn test_folder_art_fills_album_cover() {
        let fixture = Fixture::new("cover");
        fs::write(fixture.root.join("a.mp3"), b"x").expect("write a");
        fs::write(fixture.root.join("cover.jpg"), b"x").expect("write cover");
        let manager = fixture.manager(FakeTagReader::new());
        let (counters, _) = import(
            &manager,
            ImportRequest::DirectoryAdd {
                directory_id: fixture.directory_id,
                path: fixture.root.clone(),
            },
        );
        assert_eq!(counters.newly_imported, 1);

        let album = fixture
            .store()
            .find_album_by_name("Album")
            .expect("query")
            .expect("album exists");
        assert_eq!(album.cover_path, Some(fixture.root.join("cover.jpg")));
    }

    #[test]
    fn test_unparseable_file_is_skipped_not_fatal() {
        let fixture = Fixture::new("badfile");
        fs::write(fixture.root.join("good.mp3"), b"x").expect("write good");
        fs::write(fixture.root.join("bad.mp3"), b"x").expect("write bad");
        struct Failing<R>(R, String);
        impl<R: TagReader> TagReader for Failing<R> {
            fn read_tags(&self, path: &Path) -> Option<TrackTags> {
                if path.file_name().and_then(|n| n.to_str()) == Some(self.1.as_str()) {
                    return None;
                }
                self.0.read_tags(path)
            }
        }

        let manager = ImportManager::new(
            fixture.db_path.clone(),
            Arc::new(ChangeBus::new(256)),
            Arc::new(Failing(FakeTagReader::new(), "bad.mp3".to_string())),
            Vec::new(),
        );
        let (counters, _) = import(
            &manager,
            ImportRequest::DirectoryAdd {
                directory_id: fixture.directory_id,
                path: fixture.root.clone(),
            },
        );
        assert_eq!(counters.newly_imported, 1);
        assert_eq!(counters.existing_updated, 0);
        assert_eq!(counters.current, 2);
    }

    #[test]
    fn test_missing_root_aborts_and_clears_in_progress_flag() {
        let fixture = Fixture::new("revoked");
        let missing = fixture.root.join("nope");
        let manager = fixture.manager(FakeTagReader::new());
        let (tx, rx) = mpsc::sync_channel(16);
        let handle = manager
            .start(
                ImportRequest::DirectoryAdd {
                    directory_id: fixture.directory_id,
                    path: missing,
                },
                tx,
            )
            .expect("start import");
        let result = handle.join().expect("worker should not panic");
        assert!(matches!(
            result,
            Err(CatalogError::PermissionRevoked { .. })
        ));
        assert!(rx
            .try_iter()
            .any(|event| matches!(event, ImportEvent::Failed { .. })));

        // The directory-level flag is cleared on the abort path.
        assert!(manager.try_begin(fixture.directory_id).is_ok());
    }

    #[test]
    fn test_directory_level_mutual_exclusion() {
        let fixture = Fixture::new("busy");
        let manager = fixture.manager(FakeTagReader::new());
        let _slot = manager.try_begin(fixture.directory_id).expect("first claim");
        let (tx, _rx) = mpsc::sync_channel(16);
        let err = manager
            .start(
                ImportRequest::DirectoryAdd {
                    directory_id: fixture.directory_id,
                    path: fixture.root.clone(),
                },
                tx,
            )
            .expect_err("second import of same directory must be rejected");
        assert!(matches!(err, CatalogError::ImportBusy { .. }));

        // A different directory is unaffected.
        assert!(manager.try_begin(fixture.directory_id + 1).is_ok());
    }

    #[test]
    fn test_replace_purges_before_rescanning() {
        let fixture = Fixture::new("replace");
        fs::write(fixture.root.join("a.mp3"), b"x").expect("write a");
        let manager = fixture.manager(FakeTagReader::new());
        let (counters, _) = import(
            &manager,
            ImportRequest::DirectoryAdd {
                directory_id: fixture.directory_id,
                path: fixture.root.clone(),
            },
        );
        assert_eq!(counters.newly_imported, 1);

        let (counters, _) = import(
            &manager,
            ImportRequest::DirectoryReplace {
                directory_id: fixture.directory_id,
                path: fixture.root.clone(),
            },
        );
        assert_eq!(counters.removed, 1);
        assert_eq!(counters.newly_imported, 1);
        assert_eq!(
            fixture
                .store()
                .tracks_for_directory(fixture.directory_id)
                .expect("tracks")
                .len(),
            1
        );
    }

    #[test]
    fn test_change_batches_mirror_import_writes() {
        let fixture = Fixture::new("batches");
        fs::write(fixture.root.join("a.mp3"), b"x").expect("write a");
        let bus = Arc::new(ChangeBus::new(256));
        let mut subscription = bus.subscribe();
        let manager = ImportManager::new(
            fixture.db_path.clone(),
            bus.clone(),
            Arc::new(FakeTagReader::new()),
            Vec::new(),
        );
        let (tx, _rx) = mpsc::sync_channel(64);
        manager
            .start(
                ImportRequest::DirectoryAdd {
                    directory_id: fixture.directory_id,
                    path: fixture.root.clone(),
                },
                tx,
            )
            .expect("start import")
            .join()
            .expect("worker should not panic")
            .expect("import should succeed");

        let mut seen = Vec::new();
        while let Some(event) = subscription.try_recv() {
            match event {
                crate::change_bus::BusEvent::Batch(batch) => {
                    assert!(!batch.is_empty());
                    seen.extend(batch.iter().cloned());
                }
                other => panic!("unexpected bus event {other:?}"),
            }
        }
        // One file: artist add, album add, track add, in emission order.
        let stores: Vec<_> = seen.iter().map(|r| r.store).collect();
        assert_eq!(
            stores,
            vec![StoreName::Artists, StoreName::Albums, StoreName::Tracks]
        );
        assert!(seen.iter().all(|r| r.op == ChangeOp::Add));
    }
}
