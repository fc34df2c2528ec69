//! Applies transformed rows to the warehouse through the connection pool.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use deadpool::managed::Manager;
use tracing::debug;

use crate::core::{EntityType, Row};
use crate::error::{Result, SyncError};
use crate::pool::ConnectionPool;
use crate::warehouse::{UpsertCounts, WarehouseConnection};

/// Loads one entity type's rows per call, in one transaction.
pub struct Loader<M: Manager> {
    pool: Arc<ConnectionPool<M>>,
}

impl<M> Loader<M>
where
    M: Manager<Error = SyncError>,
    M::Type: WarehouseConnection,
{
    pub fn new(pool: Arc<ConnectionPool<M>>) -> Self {
        Self { pool }
    }

    /// Upsert `rows` keyed by origin id.
    ///
    /// Duplicate origin ids keep the last row. The connection goes back to
    /// the pool on success and on failure.
    pub async fn load(&self, entity: EntityType, rows: Vec<Row>) -> Result<UpsertCounts> {
        let rows = dedupe_by_origin(rows);
        if rows.is_empty() {
            return Ok(UpsertCounts::default());
        }

        let start = Instant::now();
        let mut conn = self.pool.acquire().await?;
        let result = conn.upsert_batch(entity, &rows).await;
        self.pool.release(conn).await;

        let counts = result?;
        debug!(
            "{}: {} inserted, {} updated, {} unchanged in {:?}",
            entity.table(),
            counts.inserted,
            counts.updated,
            counts.unchanged,
            start.elapsed()
        );
        Ok(counts)
    }
}

/// Keep the last row per origin id, preserving first-seen order.
fn dedupe_by_origin(rows: Vec<Row>) -> Vec<Row> {
    let mut index: HashMap<String, usize> = HashMap::with_capacity(rows.len());
    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows {
        match index.get(&row.origin_id) {
            Some(&pos) => out[pos] = row,
            None => {
                index.insert(row.origin_id.clone(), out.len());
                out.push(row);
            }
        }
    }
    out
}
