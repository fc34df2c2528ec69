//! Extract, transform and load for every entity type, in dependency order.

mod extract;
mod load;
pub mod transform;

pub use extract::Extractor;
pub use load::Loader;
pub use transform::{transform, transform_document, TransformOutput};

use std::sync::Arc;

use async_trait::async_trait;
use deadpool::managed::Manager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::core::{EntityType, RetryPolicy};
use crate::error::{Result, SyncError};
use crate::orchestrator::{EntityReport, PassExecutor, RunOutcome, SyncRun};
use crate::pool::ConnectionPool;
use crate::source::DocumentSource;
use crate::warehouse::WarehouseConnection;

/// Malformed documents logged individually per entity type; the rest are
/// only counted.
const MALFORMED_LOG_LIMIT: usize = 5;

/// One extract-transform-load pass over all entity types.
pub struct Pipeline<M: Manager> {
    extractor: Extractor,
    loader: Loader<M>,
    retry: RetryPolicy,
}

impl<M> Pipeline<M>
where
    M: Manager<Error = SyncError>,
    M::Type: WarehouseConnection,
{
    pub fn new(source: Arc<dyn DocumentSource>, pool: Arc<ConnectionPool<M>>, retry: RetryPolicy) -> Self {
        Self {
            extractor: Extractor::new(source),
            loader: Loader::new(pool),
            retry,
        }
    }

    /// Sync one entity type once: full extract, transform, one-transaction load.
    pub async fn sync_entity(&self, entity: EntityType) -> Result<EntityReport> {
        let docs = self.extractor.extract(entity).await?;
        let extracted = docs.len();

        let TransformOutput { rows, malformed } = transform(entity, &docs);
        for (i, err) in malformed.iter().enumerate() {
            if i < MALFORMED_LOG_LIMIT {
                warn!("Skipping document: {}", err);
            } else {
                debug!("Skipping document: {}", err);
            }
        }
        if malformed.len() > MALFORMED_LOG_LIMIT {
            warn!(
                "{}: {} malformed documents skipped in total",
                entity,
                malformed.len()
            );
        }

        let counts = self.loader.load(entity, rows).await?;
        Ok(EntityReport {
            entity,
            extracted,
            skipped: malformed.len(),
            counts,
            attempts: 1,
        })
    }

    /// [`sync_entity`](Self::sync_entity) with bounded backoff on transient errors.
    ///
    /// The backoff sleep ends early with Cancelled when `cancel` fires.
    pub async fn sync_entity_with_retry(
        &self,
        entity: EntityType,
        cancel: &CancellationToken,
    ) -> Result<EntityReport> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.sync_entity(entity).await {
                Ok(mut report) => {
                    report.attempts = attempt;
                    return Ok(report);
                }
                Err(e) if e.is_transient() && attempt < self.retry.attempts => {
                    let delay = self.retry.backoff.delay(attempt);
                    warn!(
                        "{}: attempt {}/{} failed: {}. Retrying in {:?}",
                        entity, attempt, self.retry.attempts, e, delay
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(SyncError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl<M> PassExecutor for Pipeline<M>
where
    M: Manager<Error = SyncError> + 'static,
    M::Type: WarehouseConnection,
{
    async fn run_pass(&self, mut run: SyncRun, cancel: CancellationToken) -> SyncRun {
        for entity in EntityType::ALL {
            if cancel.is_cancelled() {
                info!("Pass {}: shutdown requested, stopping before {}", run.short_id(), entity);
                run.finish(RunOutcome::Superseded, None);
                return run;
            }

            match self.sync_entity_with_retry(entity, &cancel).await {
                Ok(report) => {
                    info!(
                        "{}: {} extracted, {} inserted, {} updated, {} unchanged, {} skipped",
                        entity,
                        report.extracted,
                        report.counts.inserted,
                        report.counts.updated,
                        report.counts.unchanged,
                        report.skipped
                    );
                    run.entities.push(report);
                }
                Err(SyncError::Cancelled) => {
                    info!("Pass {}: shutdown requested while retrying {}", run.short_id(), entity);
                    run.finish(RunOutcome::Superseded, None);
                    return run;
                }
                Err(e) => {
                    error!("{}: sync failed: {}", entity, e);
                    run.finish(RunOutcome::Failed, Some(format!("{}: {}", entity, e)));
                    return run;
                }
            }
        }

        run.finish(RunOutcome::Succeeded, None);
        run
    }
}
