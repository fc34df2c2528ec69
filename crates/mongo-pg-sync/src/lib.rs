//! # mongo-pg-sync
//!
//! Real-time MongoDB to PostgreSQL synchronization engine.
//!
//! This library keeps an analytics warehouse in PostgreSQL in step with an
//! operational MongoDB database:
//!
//! - **Change feed listener** turning MongoDB change stream events into sync requests
//! - **Single-flight orchestration** that coalesces bursts of requests into one pass
//! - **Idempotent upserts** keyed by the source document id (`origen_id`)
//! - **Dependency-ordered passes** so foreign keys always resolve
//! - **Graceful shutdown** that never lets a pass touch a closed pool
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mongo_pg_sync::{Config, EngineSettings, MongoSource, PgConnectionManager, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> mongo_pg_sync::Result<()> {
//!     let config = Config::load("config.yaml")?;
//!     let source = Arc::new(MongoSource::connect(&config.source).await?);
//!     let manager = PgConnectionManager::new(&config.target)?;
//!
//!     let engine = SyncEngine::start(
//!         EngineSettings::from_config(&config),
//!         manager,
//!         source.clone(),
//!         source,
//!     )
//!     .await?;
//!
//!     engine.trigger_sync();
//!     tokio::signal::ctrl_c().await?;
//!     engine.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod health;
pub mod lifecycle;
pub mod listener;
pub mod orchestrator;
pub mod pipeline;
pub mod pool;
pub mod source;
pub mod warehouse;

// Re-exports for convenient access
pub use config::{Config, SourceConfig, TargetConfig};
pub use crate::core::{EntityType, Row, SqlValue};
pub use error::{Result, SyncError};
pub use health::{health_check, HealthCheckResult};
pub use lifecycle::{EngineSettings, EngineState, EngineStatus, SyncEngine};
pub use listener::{ChangeFeedListener, ListenerState, ListenerStatus};
pub use orchestrator::{
    EntityReport, PassExecutor, RunOutcome, RunState, SyncOrchestrator, SyncRun, SyncTrigger,
};
pub use pipeline::Pipeline;
pub use pool::{ConnectionPool, PoolSettings, PoolStatus};
pub use source::{ChangeFeed, DocumentSource, MemorySource, MongoSource};
pub use warehouse::{MemoryWarehouse, PgConnectionManager, UpsertCounts};
