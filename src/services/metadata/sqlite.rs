//! SQLite-backed metadata, one row per record.

use super::{Listing, MetadataError, MetadataResult, MetadataStore};
use crate::{
    models::record::ObjectRecord,
    services::id_generator::{is_well_formed, sanitize_id},
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    FromRow, Row, SqlitePool,
    sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow},
};
use std::{str::FromStr, sync::Arc};
use tracing::{debug, warn};

const SCHEMA: &str = include_str!("../../../migrations/0001_init.sql");
const SELECT_RECORD: &str =
    "SELECT id, filename, stored_location, size_bytes, etag, uploaded_at, expires_at FROM objects";

#[derive(Clone)]
pub struct SqliteMetadataStore {
    /// Shared SQLite connection pool.
    pub db: Arc<SqlitePool>,
}

#[derive(FromRow)]
struct RecordRow {
    id: String,
    filename: String,
    stored_location: String,
    size_bytes: i64,
    etag: String,
    uploaded_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
}

impl TryFrom<RecordRow> for ObjectRecord {
    type Error = MetadataError;

    fn try_from(row: RecordRow) -> MetadataResult<Self> {
        let size_bytes = u64::try_from(row.size_bytes).map_err(|_| MetadataError::Corrupt {
            id: row.id.clone(),
            reason: format!("negative size {}", row.size_bytes),
        })?;
        Ok(Self {
            id: row.id,
            filename: row.filename,
            stored_location: row.stored_location,
            size_bytes,
            etag: row.etag,
            uploaded_at: row.uploaded_at,
            expires_at: row.expires_at,
        })
    }
}

/// Decode one row, reporting any failure as `Corrupt` for that row's id.
fn decode_row(row: &SqliteRow) -> MetadataResult<ObjectRecord> {
    RecordRow::from_row(row)
        .map_err(|err| MetadataError::Corrupt {
            id: row.try_get::<String, _>("id").unwrap_or_default(),
            reason: err.to_string(),
        })
        .and_then(ObjectRecord::try_from)
}

impl SqliteMetadataStore {
    /// Connect to `database_url`, creating the database file if missing.
    pub async fn connect(database_url: &str) -> MetadataResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Ok(Self { db: Arc::new(pool) })
    }

    /// Apply the embedded schema. Statements are idempotent.
    pub async fn migrate(&self) -> MetadataResult<usize> {
        let statements = SCHEMA
            .split(';')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>();

        for stmt in &statements {
            debug!("Executing migration SQL: {}", stmt);
            sqlx::query(stmt).execute(&*self.db).await?;
        }

        Ok(statements.len())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn put(&self, record: &ObjectRecord) -> MetadataResult<()> {
        if !is_well_formed(&record.id) {
            return Err(MetadataError::InvalidId(record.id.clone()));
        }
        let size_bytes = i64::try_from(record.size_bytes).map_err(|_| MetadataError::Corrupt {
            id: record.id.clone(),
            reason: "size does not fit in SQLite INTEGER".into(),
        })?;

        let result = sqlx::query(
            "INSERT INTO objects (
                id, filename, stored_location, size_bytes, etag, uploaded_at, expires_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&record.id)
        .bind(&record.filename)
        .bind(&record.stored_location)
        .bind(size_bytes)
        .bind(&record.etag)
        .bind(record.uploaded_at)
        .bind(record.expires_at)
        .execute(&*self.db)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_unique_violation(&err) => {
                Err(MetadataError::AlreadyExists(record.id.clone()))
            }
            Err(err) => Err(MetadataError::Sqlx(err)),
        }
    }

    async fn get(&self, id: &str) -> MetadataResult<Option<ObjectRecord>> {
        let id = sanitize_id(id);
        if !is_well_formed(&id) {
            return Ok(None);
        }
        let sql = format!("{} WHERE id = ?", SELECT_RECORD);
        sqlx::query(&sql)
            .bind(&id)
            .fetch_optional(&*self.db)
            .await?
            .map(|row| decode_row(&row))
            .transpose()
    }

    async fn delete(&self, id: &str) -> MetadataResult<()> {
        let id = sanitize_id(id);
        sqlx::query("DELETE FROM objects WHERE id = ?")
            .bind(&id)
            .execute(&*self.db)
            .await?;
        Ok(())
    }

    async fn list_all(&self) -> MetadataResult<Listing> {
        let rows = sqlx::query(SELECT_RECORD).fetch_all(&*self.db).await?;

        let mut listing = Listing::default();
        for row in rows {
            match decode_row(&row) {
                Ok(record) => listing.records.push(record),
                Err(MetadataError::Corrupt { id, reason }) => {
                    warn!(%id, %reason, "unreadable metadata row");
                    if !id.is_empty() {
                        listing.unreadable.push(id);
                    }
                }
                Err(err) => return Err(err),
            }
        }
        Ok(listing)
    }

    async fn health_check(&self) -> MetadataResult<()> {
        let one = sqlx::query_scalar::<_, i64>("SELECT 1")
            .fetch_one(&*self.db)
            .await?;
        if one != 1 {
            return Err(MetadataError::Corrupt {
                id: String::new(),
                reason: format!("unexpected health probe result {}", one),
            });
        }
        Ok(())
    }
}

/// Return true if SQLx error indicates a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Database(db_err) if db_err.message().to_ascii_lowercase().contains("unique")
    )
}
