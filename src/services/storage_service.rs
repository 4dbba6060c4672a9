//! src/services/storage_service.rs
//!
//! StorageService — the upload / info / download operations of the drop
//! store. It composes the id generator, metadata store, object store,
//! archive previewer and sweeper, and owns the rules that tie them together:
//! bytes are committed before metadata, expired or inconsistent records are
//! cleaned up the moment a request touches them, and nothing here knows
//! about HTTP.

use crate::{
    config::AppConfig,
    models::{preview::ArchivePreview, record::ObjectRecord},
    services::{
        archive_preview::ArchivePreviewer,
        id_generator::{IdError, is_well_formed, new_id, sanitize_id},
        metadata::{MetadataError, MetadataStore},
        object_store::{ObjectStore, ObjectStoreError},
        sweeper::Sweeper,
    },
};
use bytes::Bytes;
use chrono::Utc;
use futures::Stream;
use std::{io, sync::Arc};
use thiserror::Error;
use tokio::fs::File;
use tracing::{debug, info, warn};

/// Attempts at finding an unused id before giving up.
const MAX_ID_ATTEMPTS: usize = 4;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("{0}")]
    BadRequest(&'static str),
    #[error("file exceeds the maximum size of {limit} bytes")]
    PayloadTooLarge { limit: u64 },
    #[error("file not found")]
    NotFound,
    #[error("file has expired")]
    Gone,
    #[error("no unused identifier after {0} attempts")]
    IdExhausted(usize),
    #[error(transparent)]
    Id(#[from] IdError),
    #[error(transparent)]
    Metadata(#[from] MetadataError),
    #[error(transparent)]
    Objects(#[from] ObjectStoreError),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Metadata plus, for archives, a bounded listing of their entries.
#[derive(Debug)]
pub struct ObjectInfo {
    pub record: ObjectRecord,
    pub preview: Option<ArchivePreview>,
}

/// An opened payload ready to stream to a client.
#[derive(Debug)]
pub struct Download {
    pub record: ObjectRecord,
    pub file: File,
    pub len: u64,
}

/// StorageService provides the three client operations:
/// - Upload (stream bytes to disk, then commit metadata)
/// - Info (metadata and optional archive preview)
/// - Download (metadata and an open file handle)
///
/// Cloning is cheap; every clone shares the same stores.
#[derive(Clone)]
pub struct StorageService {
    /// Record storage shared by every request.
    pub metadata: Arc<dyn MetadataStore>,

    /// Payload storage.
    pub objects: ObjectStore,

    previewer: ArchivePreviewer,
    sweeper: Sweeper,
    ttl: chrono::Duration,
    sweep_per_request: bool,
    public_url: String,
}

impl StorageService {
    /// Build the service from configuration and an opened metadata backend.
    pub fn new(cfg: &AppConfig, metadata: Arc<dyn MetadataStore>) -> Self {
        let objects = ObjectStore::new(cfg.storage_dir.clone(), cfg.max_upload_bytes);
        let sweeper = Sweeper::new(metadata.clone(), objects.clone(), cfg.ttl());
        Self {
            metadata,
            objects,
            previewer: ArchivePreviewer::new(cfg.preview_limit),
            sweeper,
            ttl: cfg.ttl(),
            sweep_per_request: cfg.sweep_interval().is_none(),
            public_url: cfg.public_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn sweeper(&self) -> Sweeper {
        self.sweeper.clone()
    }

    /// Client-facing URL that downloads `id`.
    pub fn download_url(&self, id: &str) -> String {
        format!("{}/api?id={}", self.public_url, id)
    }

    /// Opportunistic sweep run once per request when no periodic sweeper is
    /// configured.
    ///
    /// Lookups resolve their own id first so an expired id still answers
    /// `Gone` rather than `NotFound`.
    async fn sweep_per_request(&self) {
        if self.sweep_per_request {
            self.sweeper.try_sweep().await;
        }
    }

    /// Store an uploaded payload and commit its record.
    ///
    /// The payload is fully written and renamed into place before the
    /// metadata is published, so no reader can observe the id early. Any
    /// failure removes whatever bytes were written.
    pub async fn upload<S>(&self, filename: &str, stream: S) -> ServiceResult<ObjectRecord>
    where
        S: Stream<Item = io::Result<Bytes>> + Send,
    {
        self.sweep_per_request().await;

        if filename.trim().is_empty() {
            return Err(ServiceError::BadRequest("no file uploaded"));
        }

        let id = self.allocate_id().await?;
        let location = ObjectStore::location_for(&id, filename);

        let written = self
            .objects
            .write_stream(&location, stream)
            .await
            .map_err(|err| match err {
                ObjectStoreError::TooLarge { limit } => ServiceError::PayloadTooLarge { limit },
                ObjectStoreError::Incoming(source) => {
                    debug!(%id, "upload body ended early: {}", source);
                    ServiceError::BadRequest("upload was interrupted")
                }
                other => ServiceError::Objects(other),
            })?;

        if written.size_bytes == 0 {
            self.objects.delete(&location).await?;
            return Err(ServiceError::BadRequest("uploaded file is empty"));
        }

        let record = ObjectRecord::new(
            id,
            filename.to_string(),
            location,
            written.size_bytes,
            written.etag,
            Utc::now(),
            self.ttl,
        );

        if let Err(err) = self.metadata.put(&record).await {
            if let Err(cleanup) = self.objects.delete(&record.stored_location).await {
                warn!(id = %record.id, "failed to roll back payload: {}", cleanup);
            }
            return Err(err.into());
        }

        info!(
            id = %record.id,
            size_bytes = record.size_bytes,
            expires_at = %record.expires_at,
            "upload committed"
        );
        Ok(record)
    }

    /// Resolve `raw_id` to its record and, for archives, a preview.
    pub async fn info(&self, raw_id: &str) -> ServiceResult<ObjectInfo> {
        let resolved = self.resolve(raw_id).await;
        self.sweep_per_request().await;
        let record = resolved?;

        match self.objects.stat(&record.stored_location).await {
            Ok(len) if len == record.size_bytes => {}
            Ok(len) => return Err(self.heal_size_mismatch(&record, len).await),
            Err(ObjectStoreError::NotFound) => return Err(self.heal_missing_payload(&record).await),
            Err(err) => return Err(err.into()),
        }

        let preview = if ArchivePreviewer::is_archive(&record.filename) {
            let path = self.objects.path_for(&record.stored_location)?;
            Some(self.previewer.preview(path).await)
        } else {
            None
        };

        Ok(ObjectInfo { record, preview })
    }

    /// Resolve `raw_id` and open its payload for streaming.
    pub async fn open_download(&self, raw_id: &str) -> ServiceResult<Download> {
        let resolved = self.resolve(raw_id).await;
        self.sweep_per_request().await;
        let record = resolved?;

        let (file, len) = match self.objects.open(&record.stored_location).await {
            Ok(opened) => opened,
            Err(ObjectStoreError::NotFound) => return Err(self.heal_missing_payload(&record).await),
            Err(err) => return Err(err.into()),
        };
        if len != record.size_bytes {
            return Err(self.heal_size_mismatch(&record, len).await);
        }

        debug!(id = %record.id, len, "download opened");
        Ok(Download { record, file, len })
    }

    /// Sanitize an id and load its live record.
    ///
    /// Expired records are removed and reported as `Gone`. Unreadable records,
    /// and records whose location was not derived from their id, are removed
    /// and reported as `NotFound`.
    async fn resolve(&self, raw_id: &str) -> ServiceResult<ObjectRecord> {
        let id = sanitize_id(raw_id);
        if id.is_empty() {
            return Err(ServiceError::BadRequest("missing or invalid id"));
        }
        if !is_well_formed(&id) {
            return Err(ServiceError::NotFound);
        }

        let record = match self.metadata.get(&id).await {
            Ok(Some(record)) => record,
            Ok(None) => return Err(ServiceError::NotFound),
            Err(MetadataError::Corrupt { reason, .. }) => {
                warn!(%id, %reason, "removing unreadable metadata record");
                self.metadata.delete(&id).await?;
                return Err(ServiceError::NotFound);
            }
            Err(err) => return Err(err.into()),
        };

        if !ObjectStore::location_belongs_to(&record.stored_location, &record.id) {
            warn!(%id, "removing record with foreign storage location");
            self.metadata.delete(&id).await?;
            return Err(ServiceError::NotFound);
        }

        if record.is_expired_at(Utc::now()) {
            self.sweeper.expire(&record).await?;
            return Err(ServiceError::Gone);
        }

        Ok(record)
    }

    /// Metadata without bytes: drop the metadata.
    async fn heal_missing_payload(&self, record: &ObjectRecord) -> ServiceError {
        warn!(id = %record.id, "payload missing, removing metadata");
        match self.metadata.delete(&record.id).await {
            Ok(()) => ServiceError::NotFound,
            Err(err) => err.into(),
        }
    }

    /// Bytes that disagree with their record: drop both.
    async fn heal_size_mismatch(&self, record: &ObjectRecord, actual: u64) -> ServiceError {
        warn!(
            id = %record.id,
            expected = record.size_bytes,
            actual,
            "payload size mismatch, removing object"
        );
        match self.sweeper.expire(record).await {
            Ok(()) => ServiceError::NotFound,
            Err(err) => err.into(),
        }
    }

    /// Draw ids until one is not already taken.
    async fn allocate_id(&self) -> ServiceResult<String> {
        for _ in 0..MAX_ID_ATTEMPTS {
            let id = new_id()?;
            match self.metadata.get(&id).await {
                Ok(None) => return Ok(id),
                Ok(Some(_)) | Err(MetadataError::Corrupt { .. }) => {
                    warn!(%id, "generated id already in use, retrying");
                }
                Err(err) => return Err(err.into()),
            }
        }
        Err(ServiceError::IdExhausted(MAX_ID_ATTEMPTS))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::metadata::JsonMetadataStore;
    use chrono::Duration;
    use futures::stream;
    use std::{io::Write, path::Path};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;
    use zip::{CompressionMethod, ZipWriter, write::SimpleFileOptions};

    async fn service_with(dir: &Path, tweak: impl FnOnce(&mut AppConfig)) -> StorageService {
        let mut cfg = AppConfig::for_root(dir);
        tweak(&mut cfg);
        let metadata = Arc::new(JsonMetadataStore::open(&cfg.metadata_dir).await.unwrap());
        StorageService::new(&cfg, metadata)
    }

    async fn service(dir: &Path) -> StorageService {
        service_with(dir, |_| {}).await
    }

    fn body(bytes: Vec<u8>) -> impl Stream<Item = io::Result<Bytes>> + Send {
        let chunks: Vec<io::Result<Bytes>> = bytes
            .chunks(7)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks)
    }

    fn zip_with(files: usize) -> Vec<u8> {
        let mut writer = ZipWriter::new(io::Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for i in 0..files {
            writer.start_file(format!("f{:03}.txt", i), options).unwrap();
            writer.write_all(b"abc").unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    /// Commit a record directly, bypassing upload, with a chosen upload time.
    async fn plant(
        svc: &StorageService,
        id: &str,
        uploaded_at: chrono::DateTime<Utc>,
    ) -> ObjectRecord {
        let location = ObjectStore::location_for(id, "old.txt");
        let written = svc
            .objects
            .write_stream(&location, body(b"stale".to_vec()))
            .await
            .unwrap();
        let record = ObjectRecord::new(
            id.into(),
            "old.txt".into(),
            location,
            written.size_bytes,
            written.etag,
            uploaded_at,
            Duration::hours(48),
        );
        svc.metadata.put(&record).await.unwrap();
        record
    }

    #[tokio::test]
    async fn upload_then_info_reports_exact_size_and_ttl() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let payload = b"The quick brown fox jumps over the lazy dog".to_vec();

        let record = svc.upload("fox.txt", body(payload.clone())).await.unwrap();
        let info = svc.info(&record.id).await.unwrap();

        assert_eq!(info.record.size_bytes, payload.len() as u64);
        assert_eq!(info.record.expires_at - info.record.uploaded_at, Duration::hours(48));
        assert_eq!(info.record.etag, "9e107d9d372bb6826bd81d3542a419d6");
        assert!(info.preview.is_none());
    }

    #[tokio::test]
    async fn download_round_trips_bytes_and_original_name() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();

        let record = svc
            .upload("Quarterly Report (final) ü.pdf", body(payload.clone()))
            .await
            .unwrap();
        let mut download = svc.open_download(&record.id).await.unwrap();

        let mut received = Vec::new();
        download.file.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, payload);
        assert_eq!(download.len, payload.len() as u64);
        assert_eq!(download.record.filename, "Quarterly Report (final) ü.pdf");
        assert_ne!(download.record.stored_location, download.record.filename);
    }

    #[tokio::test]
    async fn upload_rejects_empty_input() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;

        let err = svc.upload("empty.bin", body(Vec::new())).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));
        let err = svc.upload("  ", body(b"data".to_vec())).await.unwrap_err();
        assert!(matches!(err, ServiceError::BadRequest(_)));

        assert!(svc.objects.list_files().await.unwrap().is_empty());
        assert!(svc.metadata.list_all().await.unwrap().records.is_empty());
    }

    #[tokio::test]
    async fn size_limit_is_inclusive() {
        let dir = TempDir::new().unwrap();
        let svc = service_with(dir.path(), |cfg| cfg.max_upload_bytes = 64).await;

        svc.upload("exact.bin", body(vec![1; 64])).await.unwrap();
        let err = svc.upload("over.bin", body(vec![1; 65])).await.unwrap_err();
        assert!(matches!(err, ServiceError::PayloadTooLarge { limit: 64 }));

        assert_eq!(svc.objects.list_files().await.unwrap().len(), 1);
        assert_eq!(svc.metadata.list_all().await.unwrap().records.len(), 1);
    }

    #[tokio::test]
    async fn expired_record_is_gone_then_removed() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let past = Utc::now() - Duration::hours(48) - Duration::seconds(1);
        let record = plant(&svc, "a1a1a1a1a1a1", past).await;

        assert!(matches!(svc.info(&record.id).await, Err(ServiceError::Gone)));
        assert!(svc.metadata.get(&record.id).await.unwrap().is_none());
        assert!(svc.objects.stat(&record.stored_location).await.is_err());
        assert!(matches!(
            svc.open_download(&record.id).await,
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn expired_record_download_is_gone() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let past = Utc::now() - Duration::hours(48) - Duration::seconds(1);
        let record = plant(&svc, "d4d4d4d4d4d4", past).await;

        assert!(matches!(
            svc.open_download(&record.id).await,
            Err(ServiceError::Gone)
        ));
        assert!(svc.metadata.get(&record.id).await.unwrap().is_none());
        assert!(svc.objects.stat(&record.stored_location).await.is_err());
    }

    #[tokio::test]
    async fn filename_is_kept_exactly_as_submitted() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;

        let record = svc.upload(" notes.txt ", body(b"abc".to_vec())).await.unwrap();
        let download = svc.open_download(&record.id).await.unwrap();
        assert_eq!(download.record.filename, " notes.txt ");
        let info = svc.info(&record.id).await.unwrap();
        assert_eq!(info.record.filename, " notes.txt ");
    }

    #[tokio::test]
    async fn per_request_sweep_removes_other_expired_records() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let stale = plant(&svc, "b2b2b2b2b2b2", Utc::now() - Duration::hours(60)).await;

        let fresh = svc.upload("new.txt", body(b"new".to_vec())).await.unwrap();
        assert!(svc.metadata.get(&stale.id).await.unwrap().is_none());
        assert!(svc.info(&fresh.id).await.is_ok());
    }

    #[tokio::test]
    async fn missing_payload_self_heals_to_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let record = svc.upload("gone.txt", body(b"bytes".to_vec())).await.unwrap();
        svc.objects.delete(&record.stored_location).await.unwrap();

        assert!(matches!(svc.info(&record.id).await, Err(ServiceError::NotFound)));
        assert!(svc.metadata.get(&record.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn size_mismatch_self_heals_to_not_found() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let record = svc.upload("grow.txt", body(b"bytes".to_vec())).await.unwrap();
        let path = svc.objects.path_for(&record.stored_location).unwrap();
        tokio::fs::write(&path, b"tampered bytes").await.unwrap();

        assert!(matches!(
            svc.open_download(&record.id).await,
            Err(ServiceError::NotFound)
        ));
        assert!(svc.metadata.get(&record.id).await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn ids_are_sanitized_before_lookup() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;
        let record = svc.upload("a.txt", body(b"abc".to_vec())).await.unwrap();

        let noisy = format!("../{}/", record.id);
        assert!(svc.info(&noisy).await.is_ok());
        assert!(matches!(svc.info("!!//..").await, Err(ServiceError::BadRequest(_))));
        assert!(matches!(svc.info("").await, Err(ServiceError::BadRequest(_))));
        assert!(matches!(svc.info("abc").await, Err(ServiceError::NotFound)));
        assert!(matches!(
            svc.open_download("0123456789ab").await,
            Err(ServiceError::NotFound)
        ));
    }

    #[tokio::test]
    async fn zip_uploads_include_preview() {
        let dir = TempDir::new().unwrap();
        let svc = service(dir.path()).await;

        let small = svc.upload("bundle.zip", body(zip_with(50))).await.unwrap();
        let preview = svc.info(&small.id).await.unwrap().preview.unwrap();
        assert_eq!(preview.entries.len(), 50);
        assert!(!preview.truncated);

        let big = svc.upload("huge.ZIP", body(zip_with(500))).await.unwrap();
        let preview = svc.info(&big.id).await.unwrap().preview.unwrap();
        assert_eq!(preview.entries.len(), 200);
        assert!(preview.truncated);

        let fake = svc.upload("fake.zip", body(b"not a zip".to_vec())).await.unwrap();
        let preview = svc.info(&fake.id).await.unwrap().preview.unwrap();
        assert!(preview.entries.is_empty());
    }

    #[tokio::test]
    async fn download_url_uses_public_prefix() {
        let dir = TempDir::new().unwrap();
        let relative = service(dir.path()).await;
        assert_eq!(relative.download_url("0a1b2c3d4e5f"), "/api?id=0a1b2c3d4e5f");

        let absolute = service_with(dir.path(), |cfg| {
            cfg.public_url = "https://drop.example.com/".into()
        })
        .await;
        assert_eq!(
            absolute.download_url("0a1b2c3d4e5f"),
            "https://drop.example.com/api?id=0a1b2c3d4e5f"
        );
    }
}
