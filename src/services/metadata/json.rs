//! One JSON document per record under a single directory.
//!
//! A record is written to a `.tmp-` file, fsynced, then hard linked to
//! `{id}.json`. The link fails if the target exists, which gives both the
//! no-overwrite rule and an atomic publish: readers either see the complete
//! file or nothing.

use super::{Listing, MetadataError, MetadataResult, MetadataStore};
use crate::{
    models::record::ObjectRecord,
    services::{
        id_generator::{is_well_formed, sanitize_id},
        probe_dir,
    },
};
use async_trait::async_trait;
use std::{
    io::{self, ErrorKind},
    path::{Path, PathBuf},
    time::SystemTime,
};
use tokio::{
    fs::{self, File},
    io::AsyncWriteExt,
};
use tracing::{debug, warn};
use uuid::Uuid;

const RECORD_EXT: &str = "json";
const TMP_PREFIX: &str = ".tmp-";

#[derive(Clone, Debug)]
pub struct JsonMetadataStore {
    root: PathBuf,
}

impl JsonMetadataStore {
    /// Open (and create if needed) a metadata directory.
    pub async fn open(root: impl Into<PathBuf>) -> MetadataResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root).await?;
        Ok(Self { root })
    }

    #[cfg(test)]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the record for an already-sanitized id, or `None` when the id
    /// cannot have been issued.
    fn record_path(&self, id: &str) -> Option<PathBuf> {
        is_well_formed(id).then(|| self.root.join(format!("{}.{}", id, RECORD_EXT)))
    }

    async fn read_record(&self, id: &str, path: &Path) -> MetadataResult<Option<ObjectRecord>> {
        let bytes = match fs::read(path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(MetadataError::Io(err)),
        };
        let record: ObjectRecord =
            serde_json::from_slice(&bytes).map_err(|err| MetadataError::Corrupt {
                id: id.to_string(),
                reason: err.to_string(),
            })?;
        if record.id != id {
            return Err(MetadataError::Corrupt {
                id: id.to_string(),
                reason: format!("file holds record `{}`", record.id),
            });
        }
        Ok(Some(record))
    }
}

#[async_trait]
impl MetadataStore for JsonMetadataStore {
    async fn put(&self, record: &ObjectRecord) -> MetadataResult<()> {
        let path = self
            .record_path(&record.id)
            .ok_or_else(|| MetadataError::InvalidId(record.id.clone()))?;
        let body = serde_json::to_vec_pretty(record)?;

        let tmp_path = self.root.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()));
        let written: io::Result<()> = async {
            let mut file = File::create(&tmp_path).await?;
            file.write_all(&body).await?;
            file.flush().await?;
            file.sync_all().await?;
            fs::hard_link(&tmp_path, &path).await
        }
        .await;
        let _ = fs::remove_file(&tmp_path).await;

        match written {
            Ok(()) => {
                debug!(id = %record.id, "metadata committed");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                Err(MetadataError::AlreadyExists(record.id.clone()))
            }
            Err(err) => Err(MetadataError::Io(err)),
        }
    }

    async fn get(&self, id: &str) -> MetadataResult<Option<ObjectRecord>> {
        let id = sanitize_id(id);
        match self.record_path(&id) {
            Some(path) => self.read_record(&id, &path).await,
            None => Ok(None),
        }
    }

    async fn delete(&self, id: &str) -> MetadataResult<()> {
        let id = sanitize_id(id);
        let Some(path) = self.record_path(&id) else {
            return Ok(());
        };
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(MetadataError::Io(err)),
        }
    }

    async fn list_all(&self) -> MetadataResult<Listing> {
        let mut listing = Listing::default();
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(listing),
            Err(err) => return Err(MetadataError::Io(err)),
        };

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(RECORD_EXT) {
                continue;
            }
            let Some(id) = path
                .file_stem()
                .and_then(|stem| stem.to_str())
                .filter(|stem| is_well_formed(stem))
            else {
                continue;
            };
            match self.read_record(id, &path).await {
                Ok(Some(record)) => listing.records.push(record),
                Ok(None) => {}
                Err(MetadataError::Corrupt { id, reason }) => {
                    warn!(%id, %reason, "unreadable metadata record");
                    listing.unreadable.push(id);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(listing)
    }

    async fn prune_temp_files(&self, cutoff: SystemTime) -> MetadataResult<usize> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(MetadataError::Io(err)),
        };

        let mut removed = 0;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_name().to_string_lossy().starts_with(TMP_PREFIX) {
                continue;
            }
            let modified = match entry.metadata().await.and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => return Err(MetadataError::Io(err)),
            };
            if modified > cutoff {
                continue;
            }
            match fs::remove_file(entry.path()).await {
                Ok(()) => {
                    debug!(path = %entry.path().display(), "removed abandoned metadata temp file");
                    removed += 1;
                }
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(MetadataError::Io(err)),
            }
        }
        Ok(removed)
    }

    async fn health_check(&self) -> MetadataResult<()> {
        probe_dir(&self.root).await?;
        Ok(())
    }
}
