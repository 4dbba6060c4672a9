//! Durable metadata for stored objects.
//!
//! The request path only sees [`MetadataStore`]. Two backends exist:
//! - [`JsonMetadataStore`]: one JSON file per record (default)
//! - [`SqliteMetadataStore`]: one row per record in SQLite
//!
//! Both publish a record atomically and refuse to overwrite an existing id.

mod json;
mod sqlite;

pub use json::JsonMetadataStore;
pub use sqlite::SqliteMetadataStore;

use crate::models::record::ObjectRecord;
use async_trait::async_trait;
use std::{io, time::SystemTime};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("record `{0}` already exists")]
    AlreadyExists(String),
    #[error("record id `{0}` is malformed")]
    InvalidId(String),
    #[error("record `{id}` is unreadable: {reason}")]
    Corrupt { id: String, reason: String },
    #[error(transparent)]
    Serde(#[from] serde_json::Error),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type MetadataResult<T> = Result<T, MetadataError>;

/// Outcome of scanning every stored record.
#[derive(Debug, Default)]
pub struct Listing {
    pub records: Vec<ObjectRecord>,
    /// Ids whose stored record exists but could not be decoded.
    pub unreadable: Vec<String>,
}

/// Keyed storage for [`ObjectRecord`]s.
///
/// `get` and `delete` sanitize the id before lookup, so raw client input is
/// safe to pass through.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` rather than overwrite.
    async fn put(&self, record: &ObjectRecord) -> MetadataResult<()>;

    /// Fetch a record; `Ok(None)` when absent.
    async fn get(&self, id: &str) -> MetadataResult<Option<ObjectRecord>>;

    /// Remove a record. Absence is not an error.
    async fn delete(&self, id: &str) -> MetadataResult<()>;

    /// Every record, in no particular order. Records that fail to decode are
    /// reported by id instead of failing the whole scan.
    async fn list_all(&self) -> MetadataResult<Listing>;

    /// Remove temporary files abandoned before `cutoff` by an interrupted
    /// `put`. Returns how many were removed.
    async fn prune_temp_files(&self, _cutoff: SystemTime) -> MetadataResult<usize> {
        Ok(0)
    }

    /// Cheap round trip against the backend for readiness probes.
    async fn health_check(&self) -> MetadataResult<()>;
}
