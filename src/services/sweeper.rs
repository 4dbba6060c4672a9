//! Expiration sweeper.
//!
//! Removes records whose TTL has elapsed, payload first and metadata second,
//! drops records that can no longer be decoded, and reclaims payload and
//! temporary files that never got a usable metadata record.

use crate::{
    models::record::ObjectRecord,
    services::{
        id_generator::{ID_LEN, is_well_formed},
        metadata::{MetadataError, MetadataResult, MetadataStore},
        object_store::{ObjectStore, ObjectStoreError, TMP_PREFIX},
    },
};
use chrono::{DateTime, Utc};
use std::{
    sync::Arc,
    time::{Duration, SystemTime},
};
use tokio::{sync::Mutex, task::JoinHandle};
use tracing::{debug, info, warn};

/// What a single sweep removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepReport {
    pub expired: usize,
    pub unreadable: usize,
    pub orphans: usize,
}

#[derive(Clone)]
pub struct Sweeper {
    metadata: Arc<dyn MetadataStore>,
    objects: ObjectStore,
    ttl: chrono::Duration,
    running: Arc<Mutex<()>>,
}

impl Sweeper {
    pub fn new(
        metadata: Arc<dyn MetadataStore>,
        objects: ObjectStore,
        ttl: chrono::Duration,
    ) -> Self {
        Self {
            metadata,
            objects,
            ttl,
            running: Arc::new(Mutex::new(())),
        }
    }

    /// Run a sweep unless one is already in progress in this process.
    ///
    /// Returns `None` when skipped.
    pub async fn try_sweep(&self) -> Option<SweepReport> {
        let _guard = self.running.try_lock().ok()?;
        Some(self.sweep_at(Utc::now()).await)
    }

    /// Run a full sweep, waiting for any in-flight one to finish first.
    pub async fn sweep(&self) -> SweepReport {
        let _guard = self.running.lock().await;
        self.sweep_at(Utc::now()).await
    }

    async fn sweep_at(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        match self.metadata.list_all().await {
            Ok(listing) => {
                for record in listing.records.iter().filter(|r| r.is_expired_at(now)) {
                    match self.expire(record).await {
                        Ok(()) => report.expired += 1,
                        Err(err) => warn!(id = %record.id, "failed to expire record: {}", err),
                    }
                }
                // The payload, if any, is left for orphan reclaim.
                for id in &listing.unreadable {
                    match self.metadata.delete(id).await {
                        Ok(()) => report.unreadable += 1,
                        Err(err) => warn!(%id, "failed to remove unreadable record: {}", err),
                    }
                }
            }
            Err(err) => warn!("sweep could not list metadata: {}", err),
        }

        let grace = self.ttl.to_std().unwrap_or(Duration::ZERO);
        let cutoff = SystemTime::from(now).checked_sub(grace).unwrap_or(SystemTime::UNIX_EPOCH);

        match self.reclaim_orphans(cutoff).await {
            Ok(count) => report.orphans += count,
            Err(err) => warn!("sweep could not scan payloads: {}", err),
        }
        match self.metadata.prune_temp_files(cutoff).await {
            Ok(count) => report.orphans += count,
            Err(err) => warn!("sweep could not scan metadata temp files: {}", err),
        }

        if report != SweepReport::default() {
            info!(
                expired = report.expired,
                unreadable = report.unreadable,
                orphans = report.orphans,
                "sweep removed stale objects"
            );
        }
        report
    }

    /// Delete a record's payload, then its metadata.
    ///
    /// A crash between the two steps leaves metadata pointing at nothing,
    /// which the read path treats as not found and cleans up.
    pub async fn expire(&self, record: &ObjectRecord) -> MetadataResult<()> {
        match self.objects.delete(&record.stored_location).await {
            Ok(()) => {}
            Err(ObjectStoreError::InvalidLocation(location)) => {
                warn!(id = %record.id, %location, "record points outside the store");
            }
            Err(err) => {
                warn!(id = %record.id, "failed to remove payload: {}", err);
            }
        }
        self.metadata.delete(&record.id).await?;
        debug!(id = %record.id, "expired");
        Ok(())
    }

    /// Remove payload files last modified before `cutoff` that have no
    /// usable metadata.
    ///
    /// Covers a crash after the payload was written but before its metadata
    /// was committed, records that no longer decode, and abandoned temporary
    /// files.
    async fn reclaim_orphans(&self, cutoff: SystemTime) -> Result<usize, ObjectStoreError> {
        let mut reclaimed = 0;
        for file in self.objects.list_files().await? {
            if file.modified > cutoff {
                continue;
            }
            if !self.is_orphan(&file.location).await {
                continue;
            }
            match self.objects.delete(&file.location).await {
                Ok(()) => {
                    debug!(location = %file.location, "reclaimed orphaned payload");
                    reclaimed += 1;
                }
                Err(err) => warn!(location = %file.location, "failed to reclaim payload: {}", err),
            }
        }
        Ok(reclaimed)
    }

    async fn is_orphan(&self, location: &str) -> bool {
        let name = location.rsplit('/').next().unwrap_or(location);
        if name.starts_with(TMP_PREFIX) {
            return true;
        }
        let id = name.get(..ID_LEN).unwrap_or_default();
        if !is_well_formed(id) || !ObjectStore::location_belongs_to(location, id) {
            // Not something this service wrote.
            return false;
        }
        match self.metadata.get(id).await {
            Ok(Some(record)) => record.stored_location != location,
            Ok(None) | Err(MetadataError::Corrupt { .. }) => true,
            Err(err) => {
                warn!(%id, "keeping payload, metadata lookup failed: {}", err);
                false
            }
        }
    }

    /// Sweep on a fixed interval until the task is aborted.
    pub fn spawn_periodic(self, every: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let report = self.sweep().await;
                debug!(?report, "periodic sweep finished");
            }
        })
    }
}
