//! Represents one stored upload and its lifetime.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Durable metadata describing a single uploaded object.
///
/// Records are immutable once committed. The payload bytes live in the
/// object store at `stored_location`; this struct never carries them.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ObjectRecord {
    /// Random public identifier (lowercase hex).
    pub id: String,

    /// Filename as submitted by the client. Display and download naming only.
    pub filename: String,

    /// Path of the payload relative to the storage root, derived from `id`.
    pub stored_location: String,

    /// Byte length captured while the payload was written.
    pub size_bytes: u64,

    /// MD5 of the payload, hex encoded.
    pub etag: String,

    /// When the upload was committed.
    pub uploaded_at: DateTime<Utc>,

    /// `uploaded_at + ttl`, fixed at creation.
    pub expires_at: DateTime<Utc>,
}

impl ObjectRecord {
    /// Build a record committed at `uploaded_at` that lives for `ttl`.
    pub fn new(
        id: String,
        filename: String,
        stored_location: String,
        size_bytes: u64,
        etag: String,
        uploaded_at: DateTime<Utc>,
        ttl: Duration,
    ) -> Self {
        Self {
            id,
            filename,
            stored_location,
            size_bytes,
            etag,
            uploaded_at,
            expires_at: uploaded_at + ttl,
        }
    }

    /// A record is expired once `now` reaches `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}
