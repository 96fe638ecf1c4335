//! Tag extraction backed by `lofty`, behind the `TagReader` seam.

use std::path::Path;

use lofty::file::{AudioFile, TaggedFileExt};
use lofty::prelude::Accessor;
use lofty::probe::Probe;
use lofty::tag::{ItemKey, Tag};
use log::debug;

/// Normalized attributes extracted from one file's tags.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TrackTags {
    pub title: String,
    pub artists: Vec<String>,
    pub album: String,
    pub year: Option<i64>,
    pub track_number: Option<i64>,
    pub duration_ms: Option<i64>,
    pub bpm: Option<f64>,
}

/// Per-file metadata extraction. `None` means the file could not be parsed;
/// the importer skips it and keeps walking.
pub trait TagReader: Send + Sync {
    fn read_tags(&self, path: &Path) -> Option<TrackTags>;
}

/// Default reader over `lofty`.
pub struct LoftyTagReader;

fn first_non_empty_value<F>(primary_tag: Option<&Tag>, tags: &[Tag], mut extractor: F) -> String
where
    F: FnMut(&Tag) -> Option<String>,
{
    if let Some(tag) = primary_tag {
        if let Some(value) = extractor(tag) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    for tag in tags {
        if let Some(value) = extractor(tag) {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }
    }
    String::new()
}

fn derive_year(date: &str) -> Option<i64> {
    let mut consecutive_digits = String::with_capacity(4);
    for ch in date.chars() {
        if ch.is_ascii_digit() {
            consecutive_digits.push(ch);
            if consecutive_digits.len() == 4 {
                return consecutive_digits.parse().ok();
            }
        } else {
            consecutive_digits.clear();
        }
    }
    None
}

fn split_artists(raw: &str) -> Vec<String> {
    raw.split(';')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn fallback_title_from_path(path: &Path) -> String {
    path.file_stem()
        .and_then(|name| name.to_str())
        .map(|name| name.to_string())
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| "Unknown Title".to_string())
}

impl TagReader for LoftyTagReader {
    fn read_tags(&self, path: &Path) -> Option<TrackTags> {
        let tagged_file = match Probe::open(path).and_then(|probe| probe.read()) {
            Ok(tagged_file) => tagged_file,
            Err(err) => {
                debug!("Tag read failed for {}: {}", path.display(), err);
                return None;
            }
        };

        let duration_ms = Some(tagged_file.properties().duration().as_millis() as i64);
        let primary_tag = tagged_file.primary_tag();
        let tags = tagged_file.tags();

        let title = {
            let tagged = first_non_empty_value(primary_tag, tags, |tag| {
                tag.title().map(|value| value.into_owned())
            });
            if tagged.is_empty() {
                fallback_title_from_path(path)
            } else {
                tagged
            }
        };
        let artists = split_artists(&first_non_empty_value(primary_tag, tags, |tag| {
            tag.artist().map(|value| value.into_owned())
        }));
        let album = first_non_empty_value(primary_tag, tags, |tag| {
            tag.album().map(|value| value.into_owned())
        });
        let date = first_non_empty_value(primary_tag, tags, |tag| {
            tag.get_string(ItemKey::Year)
                .or_else(|| tag.get_string(ItemKey::RecordingDate))
                .or_else(|| tag.get_string(ItemKey::ReleaseDate))
                .map(str::to_string)
        });
        let year = derive_year(&date);
        let track_number = first_non_empty_value(primary_tag, tags, |tag| {
            tag.track().map(|value| value.to_string())
        })
        .parse()
        .ok();
        let bpm = first_non_empty_value(primary_tag, tags, |tag| {
            tag.get_string(ItemKey::Bpm).map(str::to_string)
        })
        .parse()
        .ok();

        Some(TrackTags {
            title,
            artists,
            album,
            year,
            track_number,
            duration_ms,
            bpm,
        })
    }
}
