use crate::service::{IngestService, IngestStats};
use animirror_kodik::{KodikClient, KodikError};
use animirror_util::{Shutdown, chunked, run_limited};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{error, info};

#[derive(Debug)]
pub enum SyncError {
    Catalog(KodikError),
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncError::Catalog(err) => write!(f, "catalog error: {}", err),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<KodikError> for SyncError {
    fn from(err: KodikError) -> Self {
        SyncError::Catalog(err)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub started_at: DateTime<Utc>,
    pub total_fetched: u64,
    pub total_imported: u64,
    pub failed_items: u64,
    pub failed_batches: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl SyncStats {
    fn new() -> Self {
        Self {
            started_at: Utc::now(),
            total_fetched: 0,
            total_imported: 0,
            failed_items: 0,
            failed_batches: 0,
            last_sync_at: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeltaSyncOptions {
    pub sync_interval: Duration,
    pub lookback_hours: u64,
    pub batch_size: usize,
    pub concurrency: usize,
    pub page_size: u32,
    pub max_pages: Option<u32>,
}

impl Default for DeltaSyncOptions {
    fn default() -> Self {
        Self {
            sync_interval: Duration::from_secs(3600),
            lookback_hours: 24,
            batch_size: 100,
            concurrency: 3,
            page_size: 50,
            max_pages: None,
        }
    }
}

/// Periodic incremental pull: every tick fetches the catalog delta and
/// ingests it in concurrent batches. A failing tick is logged and the next
/// tick retries; only shutdown stops the loop.
pub struct DeltaSyncWorker {
    client: Arc<KodikClient>,
    db: PgPool,
    options: DeltaSyncOptions,
    shutdown: Shutdown,
    stats: Mutex<SyncStats>,
}

impl DeltaSyncWorker {
    pub fn new(
        client: Arc<KodikClient>,
        db: PgPool,
        options: DeltaSyncOptions,
        shutdown: Shutdown,
    ) -> Self {
        Self {
            client,
            db,
            options,
            shutdown,
            stats: Mutex::new(SyncStats::new()),
        }
    }

    pub async fn start(&self) {
        info!(
            interval_secs = self.options.sync_interval.as_secs(),
            lookback_hours = self.options.lookback_hours,
            "delta sync worker started"
        );
        let mut shutdown = self.shutdown.clone();
        loop {
            if shutdown.is_triggered() {
                break;
            }
            if let Err(err) = self.sync(None).await {
                error!("sync tick failed: {}", err);
            }
            if shutdown.sleep(self.options.sync_interval).await {
                break;
            }
        }
        let stats = self.stats.lock().await;
        info!(
            fetched = stats.total_fetched,
            imported = stats.total_imported,
            failed_items = stats.failed_items,
            failed_batches = stats.failed_batches,
            "delta sync worker stopped"
        );
    }

    pub async fn sync(&self, updated_since: Option<DateTime<Utc>>) -> Result<SyncStats, SyncError> {
        let since = updated_since.unwrap_or_else(|| {
            Utc::now() - chrono::Duration::hours(self.options.lookback_hours as i64)
        });
        info!(updated_since = %since.to_rfc3339(), "delta sync tick");

        {
            let mut stats = self.stats.lock().await;
            stats.last_sync_at = Some(Utc::now());
        }

        let raw_items = self
            .client
            .fetch_delta(since, self.options.page_size, self.options.max_pages)
            .await?;

        let fetched = raw_items.len() as u64;
        if raw_items.is_empty() {
            info!(updated_since = %since.to_rfc3339(), "no updates");
            return Ok(self.stats.lock().await.clone());
        }

        let batches = chunked(raw_items, self.options.batch_size);
        let batch_count = batches.len();
        let service = Arc::new(IngestService::new(self.db.clone()));
        let results = run_limited(batches, self.options.concurrency, move |batch| {
            let service = service.clone();
            async move { service.ingest_items(&batch).await }
        })
        .await;

        let mut stats = self.stats.lock().await;
        stats.total_fetched += fetched;
        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok(IngestStats {
                    successful, failed, ..
                }) => {
                    stats.total_imported += successful as u64;
                    stats.failed_items += failed as u64;
                }
                Err(err) => {
                    error!(batch = index, "batch failed: {}", err);
                    stats.failed_batches += 1;
                }
            }
        }
        info!(
            fetched,
            batches = batch_count,
            imported = stats.total_imported,
            "delta sync tick complete"
        );

        Ok(stats.clone())
    }

    pub async fn stats(&self) -> SyncStats {
        self.stats.lock().await.clone()
    }
}
