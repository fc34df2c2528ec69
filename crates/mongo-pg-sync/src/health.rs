//! Connectivity checks for the source and the warehouse.

use std::future::Future;
use std::time::Instant;

use deadpool::managed::Manager;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::{Result, SyncError};
use crate::source::{DocumentSource, MongoSource};
use crate::warehouse::{PgConnectionManager, WarehouseConnection};

/// Result of a health check run.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub source_connected: bool,
    pub source_latency_ms: u64,
    pub source_error: Option<String>,
    pub target_connected: bool,
    pub target_latency_ms: u64,
    pub target_error: Option<String>,
    pub healthy: bool,
}

/// Ping MongoDB and run `SELECT 1` on PostgreSQL.
pub async fn health_check(config: &Config) -> HealthCheckResult {
    let source = timed_check("source", async {
        let source = MongoSource::connect(&config.source).await?;
        source.shutdown().await;
        Ok::<(), SyncError>(())
    })
    .await;

    let target = timed_check("target", async {
        let manager = PgConnectionManager::new(&config.target)?;
        check_target(&manager).await
    })
    .await;

    HealthCheckResult::from_outcomes(source, target)
}

/// Check already-built collaborators.
pub async fn check_collaborators<M>(source: &dyn DocumentSource, manager: &M) -> HealthCheckResult
where
    M: Manager<Error = SyncError>,
    M::Type: WarehouseConnection,
{
    let source = timed_check("source", source.ping()).await;
    let target = timed_check("target", check_target(manager)).await;
    HealthCheckResult::from_outcomes(source, target)
}

async fn check_target<M>(manager: &M) -> Result<()>
where
    M: Manager<Error = SyncError>,
    M::Type: WarehouseConnection,
{
    let mut conn = manager.create().await?;
    conn.ping().await
}

struct CheckOutcome {
    latency_ms: u64,
    error: Option<String>,
}

async fn timed_check<F>(name: &str, check: F) -> CheckOutcome
where
    F: Future<Output = Result<()>>,
{
    let start = Instant::now();
    let result = check.await;
    let latency_ms = start.elapsed().as_millis() as u64;
    match result {
        Ok(()) => {
            debug!("Health check {}: OK in {}ms", name, latency_ms);
            CheckOutcome {
                latency_ms,
                error: None,
            }
        }
        Err(e) => {
            warn!("Health check {} failed: {}", name, e);
            CheckOutcome {
                latency_ms,
                error: Some(e.to_string()),
            }
        }
    }
}

impl HealthCheckResult {
    fn from_outcomes(source: CheckOutcome, target: CheckOutcome) -> Self {
        let source_connected = source.error.is_none();
        let target_connected = target.error.is_none();
        Self {
            source_connected,
            source_latency_ms: source.latency_ms,
            source_error: source.error,
            target_connected,
            target_latency_ms: target.latency_ms,
            target_error: target.error,
            healthy: source_connected && target_connected,
        }
    }
}
