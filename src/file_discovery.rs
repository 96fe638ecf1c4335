//! Recursive media-file discovery under a catalog directory.

use std::path::{Path, PathBuf};

use log::debug;

use crate::error::{CatalogError, Result};

pub const SUPPORTED_AUDIO_EXTENSIONS: [&str; 7] =
    ["mp3", "wav", "ogg", "flac", "aac", "m4a", "mp4"];

pub fn is_supported_audio_file(path: &Path, extra_extensions: &[String]) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| {
            SUPPORTED_AUDIO_EXTENSIONS
                .iter()
                .any(|supported| ext.eq_ignore_ascii_case(supported))
                || extra_extensions
                    .iter()
                    .any(|supported| ext.eq_ignore_ascii_case(supported))
        })
        .unwrap_or(false)
}

const COVER_FILE_STEMS: [&str; 4] = ["cover", "folder", "front", "album"];
const COVER_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Looks for a conventional cover-art image (`cover.jpg`, `folder.png`, ...)
/// directly inside `directory`. Earlier stems in the list win.
pub fn find_folder_cover(directory: &Path) -> Option<PathBuf> {
    let entries = std::fs::read_dir(directory).ok()?;
    let mut best: Option<(usize, PathBuf)> = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
            continue;
        };
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            continue;
        };
        if !COVER_EXTENSIONS
            .iter()
            .any(|supported| ext.eq_ignore_ascii_case(supported))
        {
            continue;
        }
        let Some(rank) = COVER_FILE_STEMS
            .iter()
            .position(|known| stem.eq_ignore_ascii_case(known))
        else {
            continue;
        };
        if best.as_ref().map_or(true, |(previous, _)| rank < *previous) {
            best = Some((rank, path));
        }
    }
    best.map(|(_, path)| path)
}

/// Walks `root` recursively and returns every supported media file, sorted.
///
/// An unreadable root aborts the walk with `PermissionRevoked`; unreadable
/// subdirectories and entries are logged and skipped.
pub fn collect_media_files(root: &Path, extra_extensions: &[String]) -> Result<Vec<PathBuf>> {
    // Fail the whole import when the granted handle itself is gone.
    if let Err(err) = std::fs::read_dir(root) {
        return Err(CatalogError::PermissionRevoked {
            path: root.to_path_buf(),
            source: err,
        });
    }

    let mut pending_directories = vec![root.to_path_buf()];
    let mut files = Vec::new();

    while let Some(directory) = pending_directories.pop() {
        let entries = match std::fs::read_dir(&directory) {
            Ok(entries) => entries,
            Err(err) => {
                debug!("Import walk: failed to read {}: {}", directory.display(), err);
                continue;
            }
        };

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    debug!(
                        "Import walk: failed to read entry in {}: {}",
                        directory.display(),
                        err
                    );
                    continue;
                }
            };

            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(file_type) => file_type,
                Err(err) => {
                    debug!("Import walk: failed to inspect {}: {}", path.display(), err);
                    continue;
                }
            };

            if file_type.is_dir() {
                pending_directories.push(path);
                continue;
            }

            if file_type.is_file() && is_supported_audio_file(&path, extra_extensions) {
                files.push(path);
            }
        }
    }

    files.sort_unstable();
    Ok(files)
}
