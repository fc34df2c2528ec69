//! Analytics warehouse connections.
//!
//! A [`WarehouseConnection`] applies one entity type's batch in a single
//! transaction. Connections are created by a `deadpool` manager
//! ([`PgConnectionManager`] or [`MemoryConnectionManager`]) and handed out by
//! the [`ConnectionPool`](crate::pool::ConnectionPool).

mod memory;
mod postgres;
pub mod tls;

pub use memory::{CommitRecord, MemoryConnection, MemoryConnectionManager, MemoryWarehouse, StoredRow};
pub use postgres::{build_upsert_sql, PgConnection, PgConnectionManager, UPSERT_CHUNK_ROWS};

use std::ops::AddAssign;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::core::{EntityType, Row};
use crate::error::Result;

/// Outcome of one upsert batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: u64,
    pub updated: u64,
    /// Rows whose mutable columns already matched.
    pub unchanged: u64,
}

impl UpsertCounts {
    pub fn total(&self) -> u64 {
        self.inserted + self.updated + self.unchanged
    }
}

impl AddAssign for UpsertCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }
}

/// A checked-out warehouse connection.
#[async_trait]
pub trait WarehouseConnection: Send {
    /// Insert-or-update `rows` keyed by `origen_id`, all or nothing.
    ///
    /// Reference columns carry source ids and are resolved against the
    /// referenced table's `origen_id`; unknown references load as NULL.
    async fn upsert_batch(&mut self, entity: EntityType, rows: &[Row]) -> Result<UpsertCounts>;

    /// Liveness check used by health checks.
    async fn ping(&mut self) -> Result<()>;

    /// Whether the underlying session is unusable and must be discarded.
    fn is_broken(&self) -> bool;
}
