use crate::normalizer::{Bundle, NormalizeError, normalize};
use animirror_store::StoreError;
use animirror_store::{
    upsert_episodes, upsert_translation, upsert_work, upsert_work_translation,
};
use serde::Serialize;
use serde_json::Value;
use sqlx::{Acquire, PgPool, Postgres, Transaction};
use std::fmt;
use tracing::{debug, warn};

#[derive(Debug)]
pub enum IngestError {
    Store(StoreError),
    Normalize(NormalizeError),
}

impl fmt::Display for IngestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IngestError::Store(err) => write!(f, "store error: {}", err),
            IngestError::Normalize(err) => write!(f, "normalize error: {}", err),
        }
    }
}

impl std::error::Error for IngestError {}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        IngestError::Store(err)
    }
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        IngestError::Store(StoreError::from(err))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestStats {
    pub total_processed: usize,
    pub successful: usize,
    pub failed: usize,
    pub errors: Vec<IngestFailure>,
}

pub struct IngestService {
    db: PgPool,
    continue_on_error: bool,
}

impl IngestService {
    pub fn new(db: PgPool) -> Self {
        Self {
            db,
            continue_on_error: true,
        }
    }

    pub fn with_continue_on_error(mut self, continue_on_error: bool) -> Self {
        self.continue_on_error = continue_on_error;
        self
    }

    /// Normalizes and persists one batch inside a single transaction. Each
    /// bundle runs under its own savepoint, so a failing bundle rolls back
    /// alone and the rest of the batch still commits.
    pub async fn ingest_items(&self, raw_items: &[Value]) -> Result<IngestStats, IngestError> {
        let mut stats = IngestStats::default();
        let mut bundles: Vec<Bundle> = Vec::with_capacity(raw_items.len());

        for raw in raw_items {
            stats.total_processed += 1;
            match normalize(raw) {
                Ok(bundle) => bundles.push(bundle),
                Err(err) => {
                    let id = raw
                        .get("id")
                        .and_then(Value::as_str)
                        .map(|value| value.to_string());
                    warn!(item_id = ?id, "skipping item: {}", err);
                    stats.failed += 1;
                    stats.errors.push(IngestFailure {
                        id,
                        message: err.to_string(),
                    });
                    if !self.continue_on_error {
                        return Err(IngestError::Normalize(err));
                    }
                }
            }
        }

        if bundles.is_empty() {
            return Ok(stats);
        }

        let mut tx = self.db.begin().await.map_err(StoreError::from)?;
        for bundle in &bundles {
            match persist_bundle(&mut tx, bundle).await {
                Ok(()) => {
                    stats.successful += 1;
                    debug!(
                        work_id = %bundle.work.id,
                        translation_id = bundle.translation.id,
                        episodes = bundle.episodes.len(),
                        "bundle upserted"
                    );
                }
                Err(err) => {
                    warn!(work_id = %bundle.work.id, "bundle failed: {}", err);
                    stats.failed += 1;
                    stats.errors.push(IngestFailure {
                        id: Some(bundle.work.id.clone()),
                        message: err.to_string(),
                    });
                    if !self.continue_on_error {
                        return Err(err.into());
                    }
                }
            }
        }
        tx.commit().await.map_err(StoreError::from)?;

        Ok(stats)
    }
}

async fn persist_bundle(
    tx: &mut Transaction<'_, Postgres>,
    bundle: &Bundle,
) -> Result<(), StoreError> {
    // Nested begin() is a Postgres savepoint; dropping it on the error path
    // rolls only this bundle back.
    let mut savepoint = tx.begin().await?;
    upsert_translation(&mut savepoint, &bundle.translation).await?;
    upsert_work(&mut savepoint, &bundle.work).await?;
    upsert_work_translation(&mut savepoint, &bundle.link).await?;
    upsert_episodes(&mut savepoint, &bundle.episodes).await?;
    savepoint.commit().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn all_invalid_items_short_circuit_without_touching_the_db() {
        // The pool is lazy; if ingest tried to open a transaction for an
        // empty bundle list this test would fail on connect.
        let db = PgPool::connect_lazy("postgres://localhost/unreachable").expect("lazy pool");
        let service = IngestService::new(db);

        let stats = service
            .ingest_items(&[json!("not an object"), json!({"title": "no id"})])
            .await
            .expect("stats");

        assert_eq!(stats.total_processed, 2);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.failed, 2);
        assert_eq!(stats.errors.len(), 2);
    }

    #[tokio::test]
    async fn strict_mode_propagates_the_first_normalize_error() {
        let db = PgPool::connect_lazy("postgres://localhost/unreachable").expect("lazy pool");
        let service = IngestService::new(db).with_continue_on_error(false);

        let err = service
            .ingest_items(&[json!({"title": "no id"})])
            .await
            .unwrap_err();
        assert!(matches!(err, IngestError::Normalize(_)));
    }

    #[tokio::test]
    async fn empty_batch_returns_zeroed_stats() {
        let db = PgPool::connect_lazy("postgres://localhost/unreachable").expect("lazy pool");
        let service = IngestService::new(db);
        let stats = service.ingest_items(&[]).await.expect("stats");
        assert_eq!(stats.total_processed, 0);
        assert_eq!(stats.successful, 0);
        assert_eq!(stats.failed, 0);
    }
}
