//! Bounded listing of zip archive contents.
//!
//! Previews are advisory: anything that cannot be read as a zip yields an
//! empty listing instead of an error.

use crate::models::preview::{ArchiveEntry, ArchivePreview};
use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};
use tracing::debug;

/// Extensions treated as zip containers. Detection is by name only.
const ARCHIVE_EXTENSIONS: [&str; 1] = ["zip"];

#[derive(Clone, Debug)]
pub struct ArchivePreviewer {
    limit: usize,
}

impl ArchivePreviewer {
    pub fn new(limit: usize) -> Self {
        Self { limit }
    }

    /// True when `filename` carries an archive extension.
    pub fn is_archive(filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| {
                ARCHIVE_EXTENSIONS
                    .iter()
                    .any(|candidate| candidate.eq_ignore_ascii_case(ext))
            })
    }

    /// List up to `limit` content entries of the archive at `path`.
    ///
    /// Zip parsing is blocking, so it runs on the blocking pool.
    pub async fn preview(&self, path: PathBuf) -> ArchivePreview {
        let limit = self.limit;
        match tokio::task::spawn_blocking(move || list_entries(&path, limit)).await {
            Ok(preview) => preview,
            Err(err) => {
                debug!("archive preview task failed: {}", err);
                ArchivePreview::default()
            }
        }
    }
}

/// Walk the central directory in its native order.
///
/// Directory placeholders are skipped. Once `limit` entries are collected the
/// scan only continues far enough to learn whether one more content entry
/// exists.
fn list_entries(path: &Path, limit: usize) -> ArchivePreview {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(err) => {
            debug!("cannot open {} for preview: {}", path.display(), err);
            return ArchivePreview::default();
        }
    };
    let mut archive = match zip::ZipArchive::new(BufReader::new(file)) {
        Ok(archive) => archive,
        Err(err) => {
            debug!("{} is not a readable zip: {}", path.display(), err);
            return ArchivePreview::default();
        }
    };

    let mut preview = ArchivePreview::default();
    for index in 0..archive.len() {
        let entry = match archive.by_index_raw(index) {
            Ok(entry) => entry,
            Err(err) => {
                debug!("skipping unreadable zip entry {}: {}", index, err);
                continue;
            }
        };
        if entry.is_dir() {
            continue;
        }
        if preview.entries.len() == limit {
            preview.truncated = true;
            break;
        }
        preview.entries.push(ArchiveEntry {
            name: entry.name().to_string(),
            size: entry.size(),
        });
    }

    preview
}
