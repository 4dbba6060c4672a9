//! Storage building blocks and the service that composes them.

pub mod archive_preview;
pub mod id_generator;
pub mod metadata;
pub mod object_store;
pub mod storage_service;
pub mod sweeper;

use std::{io, path::Path};
use tokio::fs;
use uuid::Uuid;

/// Write, read back and delete a scratch file in `dir`.
pub async fn probe_dir(dir: &Path) -> io::Result<()> {
    let tmp_path = dir.join(format!(".readyz-{}", Uuid::new_v4()));
    fs::write(&tmp_path, b"readyz").await?;
    let read = fs::read(&tmp_path).await;
    let removed = fs::remove_file(&tmp_path).await;
    if read? != b"readyz" {
        return Err(io::Error::other("probe file content mismatch"));
    }
    removed
}
