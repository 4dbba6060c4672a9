//! On-disk payload storage.
//!
//! Payloads live beneath `root/{shard}/{id}_{name}` where `shard` is the first
//! two characters of the id. Writes stream into a temporary file beside the
//! destination and are renamed into place only once complete and fsynced, so
//! a reader never opens a half-written payload.

use bytes::Bytes;
use futures::{Stream, StreamExt, pin_mut};
use md5::Context;
use std::{
    io::{self, ErrorKind},
    path::{Component, Path, PathBuf},
    time::SystemTime,
};
use thiserror::Error;
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::debug;
use uuid::Uuid;

/// Prefix for in-flight payload files.
pub const TMP_PREFIX: &str = ".tmp-";

const SHARD_LEN: usize = 2;
const MAX_NAME_FRAGMENT: usize = 64;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: u64 },
    #[error("incoming payload stream failed: {0}")]
    Incoming(#[source] io::Error),
    #[error("invalid object location `{0}`")]
    InvalidLocation(String),
    #[error("object not found")]
    NotFound,
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type ObjectStoreResult<T> = Result<T, ObjectStoreError>;

/// Outcome of a committed write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenObject {
    pub size_bytes: u64,
    pub etag: String,
}

/// A payload file found while scanning the store.
#[derive(Debug, Clone)]
pub struct StoredFile {
    /// Location relative to the store root.
    pub location: String,
    pub modified: SystemTime,
}

#[derive(Clone, Debug)]
pub struct ObjectStore {
    root: PathBuf,
    max_bytes: u64,
}

impl ObjectStore {
    /// Create a store rooted at `root` that accepts payloads of at most
    /// `max_bytes`.
    pub fn new(root: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            root: root.into(),
            max_bytes,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Derive the storage location for an upload.
    ///
    /// Only the id and a sanitized fragment of the filename contribute, so the
    /// client can never choose where bytes land.
    pub fn location_for(id: &str, filename: &str) -> String {
        let shard: String = id.chars().take(SHARD_LEN).collect();
        format!("{}/{}_{}", shard, id, sanitize_filename(filename))
    }

    /// True when `location` is one `location_for` could produce for `id`.
    pub fn location_belongs_to(location: &str, id: &str) -> bool {
        let Some((shard, name)) = location.split_once('/') else {
            return false;
        };
        id.len() >= SHARD_LEN
            && shard == &id[..SHARD_LEN]
            && name
                .strip_prefix(id)
                .is_some_and(|rest| rest.starts_with('_'))
    }

    /// Resolve a relative location to a path under the root.
    ///
    /// Rejects anything that is absolute, contains `..`, or is not exactly
    /// `shard/name`.
    pub fn path_for(&self, location: &str) -> ObjectStoreResult<PathBuf> {
        let invalid = || ObjectStoreError::InvalidLocation(location.to_string());
        let relative = Path::new(location);
        let components: Vec<_> = relative.components().collect();
        if components.len() != 2
            || !components
                .iter()
                .all(|c| matches!(c, Component::Normal(_)))
            || location.bytes().any(|b| b.is_ascii_control() || b == b'\\')
        {
            return Err(invalid());
        }
        Ok(self.root.join(relative))
    }

    /// Stream a payload to `location`.
    ///
    /// - Counts bytes and computes the MD5 etag while writing.
    /// - Fails with `TooLarge` as soon as the limit is crossed.
    /// - Any failure removes the temporary file; nothing is left behind.
    pub async fn write_stream<S>(
        &self,
        location: &str,
        stream: S,
    ) -> ObjectStoreResult<WrittenObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let file_path = self.path_for(location)?;
        let parent = file_path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| ObjectStoreError::InvalidLocation(location.to_string()))?;
        let tmp_path = parent.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        fs::create_dir_all(&parent).await?;
        // A concurrent delete may prune the shard between the two calls.
        let file = match File::create(&tmp_path).await {
            Err(err) if err.kind() == ErrorKind::NotFound => {
                fs::create_dir_all(&parent).await?;
                File::create(&tmp_path).await?
            }
            other => other?,
        };

        match self.fill_temp(file, stream).await {
            Ok(written) => {
                if let Err(err) = fs::rename(&tmp_path, &file_path).await {
                    let _ = fs::remove_file(&tmp_path).await;
                    return Err(ObjectStoreError::Io(err));
                }
                debug!(
                    location,
                    size_bytes = written.size_bytes,
                    "payload committed"
                );
                Ok(written)
            }
            Err(err) => {
                let _ = fs::remove_file(&tmp_path).await;
                self.prune_empty_dirs(&parent).await;
                Err(err)
            }
        }
    }

    async fn fill_temp<S>(&self, mut file: File, stream: S) -> ObjectStoreResult<WrittenObject>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        let mut size_bytes: u64 = 0;
        let mut digest = Context::new();

        pin_mut!(stream);
        while let Some(chunk_res) = stream.next().await {
            let chunk = chunk_res.map_err(ObjectStoreError::Incoming)?;
            size_bytes += chunk.len() as u64;
            if size_bytes > self.max_bytes {
                return Err(ObjectStoreError::TooLarge {
                    limit: self.max_bytes,
                });
            }
            digest.consume(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;

        Ok(WrittenObject {
            size_bytes,
            etag: format!("{:x}", digest.compute()),
        })
    }

    /// Open a payload for sequential reading, returning its length.
    ///
    /// The returned handle stays readable even if the file is unlinked
    /// afterwards.
    pub async fn open(&self, location: &str) -> ObjectStoreResult<(File, u64)> {
        let path = self.path_for(location)?;
        let file = File::open(&path).await.map_err(not_found_or_io)?;
        let len = file.metadata().await?.len();
        Ok((file, len))
    }

    /// Size of a stored payload without opening it.
    pub async fn stat(&self, location: &str) -> ObjectStoreResult<u64> {
        let path = self.path_for(location)?;
        let meta = fs::metadata(&path).await.map_err(not_found_or_io)?;
        if !meta.is_file() {
            return Err(ObjectStoreError::NotFound);
        }
        Ok(meta.len())
    }

    /// Remove a payload. Absence is not an error.
    pub async fn delete(&self, location: &str) -> ObjectStoreResult<()> {
        let path = self.path_for(location)?;
        self.remove_path(&path).await
    }

    async fn remove_path(&self, path: &Path) -> ObjectStoreResult<()> {
        match fs::remove_file(path).await {
            Ok(_) => debug!("removed payload {}", path.display()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                debug!("payload {} already missing", path.display());
            }
            Err(err) => return Err(ObjectStoreError::Io(err)),
        }
        if let Some(parent) = path.parent() {
            self.prune_empty_dirs(parent).await;
        }
        Ok(())
    }

    /// Every file under the shard directories, temporary files included.
    pub async fn list_files(&self) -> ObjectStoreResult<Vec<StoredFile>> {
        let mut files = Vec::new();
        let mut shards = match fs::read_dir(&self.root).await {
            Ok(shards) => shards,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(ObjectStoreError::Io(err)),
        };

        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let shard_name = shard.file_name().to_string_lossy().into_owned();
            let mut entries = match fs::read_dir(shard.path()).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(ObjectStoreError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await? {
                let meta = match entry.metadata().await {
                    Ok(meta) => meta,
                    Err(err) if err.kind() == ErrorKind::NotFound => continue,
                    Err(err) => return Err(ObjectStoreError::Io(err)),
                };
                if !meta.is_file() {
                    continue;
                }
                files.push(StoredFile {
                    location: format!("{}/{}", shard_name, entry.file_name().to_string_lossy()),
                    modified: meta.modified()?,
                });
            }
        }

        Ok(files)
    }

    /// Recursively remove empty directories up to the store root.
    ///
    /// Stops when:
    /// - directory not empty
    /// - directory not found
    /// - reached root
    /// - encountered unexpected I/O errors
    async fn prune_empty_dirs(&self, start: &Path) {
        let mut current = start.to_path_buf();
        while current.starts_with(&self.root) && current != self.root {
            match fs::remove_dir(&current).await {
                Ok(_) => {
                    if let Some(parent) = current.parent() {
                        current = parent.to_path_buf();
                    } else {
                        break;
                    }
                }
                Err(err) if err.kind() == ErrorKind::NotFound => break,
                Err(err) if err.kind() == ErrorKind::DirectoryNotEmpty => break,
                Err(err) => {
                    debug!("failed to prune directory {}: {}", current.display(), err);
                    break;
                }
            }
        }
    }
}

fn not_found_or_io(err: io::Error) -> ObjectStoreError {
    if err.kind() == ErrorKind::NotFound {
        ObjectStoreError::NotFound
    } else {
        ObjectStoreError::Io(err)
    }
}

/// Reduce a client filename to a short, filesystem-safe fragment.
///
/// Keeps ASCII letters, digits, `.`, `_` and `-`; everything else becomes
/// `_`. Leading dots are dropped so the result is never hidden or `..`.
pub fn sanitize_filename(filename: &str) -> String {
    let base = filename
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(filename);
    let mapped: String = base
        .chars()
        .map(|c| match c {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '.' | '_' | '-' => c,
            _ => '_',
        })
        .collect();
    let trimmed = mapped.trim_start_matches('.');

    // Keep the tail so the extension survives truncation.
    let start = trimmed.len().saturating_sub(MAX_NAME_FRAGMENT);
    let fragment = &trimmed[start..];
    if fragment.is_empty() {
        "file".to_string()
    } else {
        fragment.to_string()
    }
}
