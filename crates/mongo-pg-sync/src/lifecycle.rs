//! Engine lifecycle: start the parts in order, stop them in reverse.
//!
//! Startup: pool, pipeline, orchestrator, listener, optional warm-up pass.
//! Shutdown: listener (joined), orchestrator (running pass joined at an
//! entity-type boundary), then the pool. Closing the pool last means no pass
//! or feed read can ever hit a closed pool.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deadpool::managed::Manager;
use serde::Serialize;
use tracing::info;

use crate::config::{CollectionNames, Config};
use crate::core::RetryPolicy;
use crate::error::{Result, SyncError};
use crate::listener::{ChangeFeedListener, ListenerSettings, ListenerState, ListenerStatus};
use crate::orchestrator::{
    OrchestratorSettings, OrchestratorStatus, RunState, SyncOrchestrator, SyncTrigger,
};
use crate::pipeline::Pipeline;
use crate::pool::{ConnectionPool, PoolSettings, PoolStatus};
use crate::source::{ChangeFeed, DocumentSource};
use crate::warehouse::WarehouseConnection;

/// Everything the engine needs besides its collaborators.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub pool: PoolSettings,
    pub listener: ListenerSettings,
    pub orchestrator: OrchestratorSettings,
    pub retry: RetryPolicy,
    pub collections: CollectionNames,
    pub warm_up_on_start: bool,
}

impl EngineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            pool: PoolSettings::from_config(&config.pool),
            listener: ListenerSettings::from_config(&config.listener),
            orchestrator: OrchestratorSettings::from_config(&config.sync),
            retry: RetryPolicy::new(
                config.sync.retry_attempts,
                Duration::from_millis(config.sync.retry_base_ms),
            ),
            collections: config.source.collections.clone(),
            warm_up_on_start: config.sync.warm_up_on_start,
        }
    }
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            pool: PoolSettings::default(),
            listener: ListenerSettings::default(),
            orchestrator: OrchestratorSettings::default(),
            retry: RetryPolicy::new(3, Duration::from_secs(2)),
            collections: CollectionNames::default(),
            warm_up_on_start: true,
        }
    }
}

/// Overall engine state reported to operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    Idle,
    Running,
    RunningWithPending,
    /// The listener gave up; no new changes will trigger passes until
    /// `restart_listener`.
    Error,
}

/// Read-only engine snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: EngineState,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub accepting_requests: bool,
    pub listener: ListenerStatus,
    pub orchestrator: OrchestratorStatus,
    pub pool: PoolStatus,
}

impl EngineStatus {
    /// Serialize as JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// The running engine.
pub struct SyncEngine<M: Manager> {
    pool: Arc<ConnectionPool<M>>,
    orchestrator: SyncOrchestrator,
    listener: ChangeFeedListener,
    settings: EngineSettings,
    stopped: AtomicBool,
}

impl<M> SyncEngine<M>
where
    M: Manager<Error = SyncError> + 'static,
    M::Type: WarehouseConnection,
{
    /// Bring the engine up. On failure, whatever was already started is
    /// torn down again.
    pub async fn start(
        settings: EngineSettings,
        manager: M,
        source: Arc<dyn DocumentSource>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self> {
        let pool = Arc::new(ConnectionPool::new(settings.pool));
        pool.initialize(manager).await?;

        let pipeline = Arc::new(Pipeline::new(source, Arc::clone(&pool), settings.retry));
        let orchestrator = SyncOrchestrator::start(pipeline, settings.orchestrator);
        let listener = ChangeFeedListener::new(
            feed,
            orchestrator.handle(),
            settings.collections.clone(),
            settings.listener,
        );

        if let Err(e) = listener.start() {
            orchestrator.shutdown(settings.orchestrator.join_timeout).await;
            pool.shutdown().await;
            return Err(e);
        }

        if settings.warm_up_on_start {
            orchestrator.trigger(SyncTrigger::Startup);
        }

        info!("Sync engine started");
        Ok(Self {
            pool,
            orchestrator,
            listener,
            settings,
            stopped: AtomicBool::new(false),
        })
    }

    /// Request a manual pass. Returns immediately; false once shut down.
    pub fn trigger_sync(&self) -> bool {
        if self.stopped.load(Ordering::SeqCst) {
            return false;
        }
        self.orchestrator.trigger(SyncTrigger::Manual)
    }

    pub fn status(&self) -> EngineStatus {
        let listener = self.listener.status();
        let orchestrator = self.orchestrator.status();

        let (state, last_error) = if listener.state == ListenerState::Error {
            (
                EngineState::Error,
                listener.last_error.clone().or_else(|| orchestrator.last_error.clone()),
            )
        } else {
            let state = match orchestrator.state {
                RunState::Idle => EngineState::Idle,
                RunState::Running => EngineState::Running,
                RunState::RunningWithPending => EngineState::RunningWithPending,
            };
            (state, orchestrator.last_error.clone())
        };

        EngineStatus {
            state,
            last_run_at: orchestrator.last_run_at,
            last_error,
            accepting_requests: !self.stopped.load(Ordering::SeqCst),
            listener,
            orchestrator,
            pool: self.pool.status(),
        }
    }

    /// Stop and start the listener. The pool and any running pass are left alone.
    pub async fn restart_listener(&self) -> Result<()> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(SyncError::Listener("engine is shut down".to_string()));
        }
        info!("Restarting change feed listener");
        self.listener.restart().await
    }

    /// Wait until `passes` passes have finished and nothing is owed.
    pub async fn wait_for_passes(&self, passes: u64, timeout: Duration) -> Result<OrchestratorStatus> {
        self.orchestrator.wait_for_passes(passes, timeout).await
    }

    pub fn pool(&self) -> &Arc<ConnectionPool<M>> {
        &self.pool
    }

    /// Stop everything in reverse start order. Idempotent.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Shutting down sync engine");

        self.listener.stop().await;
        self.orchestrator
            .shutdown(self.settings.orchestrator.join_timeout)
            .await;
        self.pool.shutdown().await;

        info!("Sync engine stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::source::MemorySource;
    use crate::warehouse::MemoryWarehouse;

    fn test_settings() -> EngineSettings {
        let mut settings = EngineSettings::default();
        settings.pool.acquire_timeout = Duration::from_millis(500);
        settings.pool.shutdown_grace = Duration::from_millis(500);
        settings.retry = RetryPolicy::immediate(2);
        settings.orchestrator.retry_failed_after = None;
        settings.orchestrator.join_timeout = Duration::from_secs(5);
        settings
    }

    #[test]
    fn test_settings_follow_config() {
        let yaml = r#"
source:
  uri: mongodb://localhost:27017
  database: agencia
target:
  host: localhost
  database: analytics
  user: postgres
  password: secret
sync:
  retry_attempts: 5
  warm_up_on_start: false
"#;
        let config = Config::from_yaml(yaml).unwrap();
        let settings = EngineSettings::from_config(&config);
        assert_eq!(settings.retry.attempts, 5);
        assert!(!settings.warm_up_on_start);
        assert_eq!(settings.collections.sales, "ventas");
    }

    #[tokio::test]
    async fn test_start_warms_up_and_shuts_down() {
        let source = MemorySource::default();
        let warehouse = MemoryWarehouse::new();
        let engine = SyncEngine::start(
            test_settings(),
            warehouse.manager(),
            Arc::new(source.clone()),
            Arc::new(source.clone()),
        )
        .await
        .unwrap();

        let status = engine.wait_for_passes(1, Duration::from_secs(5)).await.unwrap();
        assert_eq!(
            status.last_run.unwrap().trigger,
            SyncTrigger::Startup
        );

        let status = engine.status();
        assert_eq!(status.state, EngineState::Idle);
        assert!(status.pool.initialized);
        assert!(status.accepting_requests);
        assert!(status.to_json().unwrap().contains("\"state\": \"idle\""));

        engine.shutdown().await;
        assert!(!engine.trigger_sync());
        assert!(!engine.status().pool.initialized);
        assert!(engine.restart_listener().await.is_err());
        engine.shutdown().await;
    }

    #[tokio::test]
    async fn test_listener_error_surfaces_in_status() {
        let source = MemorySource::default();
        source.fail_next_subscriptions(100);
        let mut settings = test_settings();
        settings.warm_up_on_start = false;
        settings.listener.max_consecutive_failures = 2;
        settings.listener.backoff = crate::core::Backoff::exponential(
            Duration::from_millis(1),
            Duration::from_millis(5),
        );

        let engine = SyncEngine::start(
            settings,
            MemoryWarehouse::new().manager(),
            Arc::new(source.clone()),
            Arc::new(source.clone()),
        )
        .await
        .unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while engine.status().state != EngineState::Error {
            assert!(tokio::time::Instant::now() < deadline, "listener never failed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(engine.status().last_error.unwrap().contains("subscription"));

        engine.shutdown().await;
    }
}
