//! In-process warehouse with transactional batches and fault injection.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use deadpool::managed::{self, Metrics, RecycleError, RecycleResult};

use super::{UpsertCounts, WarehouseConnection};
use crate::core::{ColumnKind, EntityType, Row, SqlNullType, SqlValue};
use crate::error::{Result, SyncError};

/// A stored warehouse row. Reference columns hold resolved surrogate ids.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub id: i64,
    pub values: Vec<SqlValue>,
}

impl StoredRow {
    /// Value of a named mutable column.
    pub fn get(&self, entity: EntityType, column: &str) -> Option<&SqlValue> {
        entity
            .columns()
            .iter()
            .position(|c| c.name == column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// One committed batch.
#[derive(Debug, Clone)]
pub struct CommitRecord {
    pub entity: EntityType,
    pub rows: usize,
    pub at: Instant,
}

#[derive(Debug, Clone, Copy)]
enum InjectedFailure {
    /// Connection-level failure; the connection is marked broken.
    Transient,
    /// Statement-level failure; the connection stays usable.
    Permanent,
}

#[derive(Default)]
struct State {
    tables: HashMap<EntityType, BTreeMap<String, StoredRow>>,
    next_id: i64,
    commits: Vec<CommitRecord>,
    failures: VecDeque<InjectedFailure>,
    batch_delay: Duration,
    open_connections: usize,
    created_connections: usize,
    breaks_pending: usize,
}

/// In-memory warehouse shared by every [`MemoryConnection`].
///
/// Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryWarehouse {
    state: Arc<Mutex<State>>,
}

impl MemoryWarehouse {
    pub fn new() -> Self {
        Self::default()
    }

    /// A `deadpool` manager handing out connections to this warehouse.
    pub fn manager(&self) -> MemoryConnectionManager {
        MemoryConnectionManager {
            warehouse: self.clone(),
        }
    }

    /// All rows of one table, ordered by `origen_id`.
    pub fn rows(&self, entity: EntityType) -> Vec<(String, StoredRow)> {
        self.lock()
            .tables
            .get(&entity)
            .map(|t| t.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default()
    }

    pub fn row(&self, entity: EntityType, origin_id: &str) -> Option<StoredRow> {
        self.lock()
            .tables
            .get(&entity)
            .and_then(|t| t.get(origin_id).cloned())
    }

    pub fn count(&self, entity: EntityType) -> usize {
        self.lock().tables.get(&entity).map_or(0, BTreeMap::len)
    }

    /// Surrogate id of the row with `origin_id`, if present.
    pub fn id_of(&self, entity: EntityType, origin_id: &str) -> Option<i64> {
        self.row(entity, origin_id).map(|r| r.id)
    }

    pub fn commits(&self) -> Vec<CommitRecord> {
        self.lock().commits.clone()
    }

    /// Connections currently alive (created and not yet dropped).
    pub fn open_connections(&self) -> usize {
        self.lock().open_connections
    }

    pub fn created_connections(&self) -> usize {
        self.lock().created_connections
    }

    /// Fail the next `n` batches with a transient connection error.
    pub fn fail_next_batches(&self, n: usize) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat(InjectedFailure::Transient).take(n));
    }

    /// Fail the next `n` batches with a non-retryable load error.
    pub fn reject_next_batches(&self, n: usize) {
        let mut state = self.lock();
        state.failures.extend(std::iter::repeat(InjectedFailure::Permanent).take(n));
    }

    /// Mark the next `n` checked-out connections broken after their batch.
    pub fn break_next_connections(&self, n: usize) {
        self.lock().breaks_pending += n;
    }

    /// Sleep inside every batch, simulating a slow transaction.
    pub fn set_batch_delay(&self, delay: Duration) {
        self.lock().batch_delay = delay;
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn apply(&self, entity: EntityType, rows: &[Row]) -> Result<UpsertCounts> {
        let mut state = self.lock();
        let columns = entity.columns();

        // Stage against a copy so a failure leaves the table untouched
        let mut staged = state.tables.get(&entity).cloned().unwrap_or_default();
        let mut next_id = state.next_id;
        let mut counts = UpsertCounts::default();

        for row in rows {
            if row.values.len() != columns.len() {
                return Err(SyncError::load(
                    entity.table(),
                    format!(
                        "row {} has {} values, expected {}",
                        row.origin_id,
                        row.values.len(),
                        columns.len()
                    ),
                ));
            }

            let values: Vec<SqlValue> = columns
                .iter()
                .zip(&row.values)
                .map(|(column, value)| match column.kind {
                    ColumnKind::Value(_) => value.clone(),
                    ColumnKind::Reference(target) => value
                        .as_str()
                        .and_then(|origin| {
                            if target == entity {
                                staged.get(origin).map(|r| r.id)
                            } else {
                                state.tables.get(&target).and_then(|t| t.get(origin)).map(|r| r.id)
                            }
                        })
                        .map_or(SqlValue::Null(SqlNullType::I64), SqlValue::I64),
                })
                .collect();

            match staged.get_mut(&row.origin_id) {
                Some(existing) if existing.values == values => counts.unchanged += 1,
                Some(existing) => {
                    existing.values = values;
                    counts.updated += 1;
                }
                None => {
                    next_id += 1;
                    staged.insert(row.origin_id.clone(), StoredRow { id: next_id, values });
                    counts.inserted += 1;
                }
            }
        }

        state.tables.insert(entity, staged);
        state.next_id = next_id;
        state.commits.push(CommitRecord {
            entity,
            rows: rows.len(),
            at: Instant::now(),
        });
        Ok(counts)
    }
}

/// `deadpool` manager for [`MemoryConnection`]s.
pub struct MemoryConnectionManager {
    warehouse: MemoryWarehouse,
}

impl managed::Manager for MemoryConnectionManager {
    type Type = MemoryConnection;
    type Error = SyncError;

    async fn create(&self) -> Result<MemoryConnection> {
        let mut state = self.warehouse.lock();
        state.open_connections += 1;
        state.created_connections += 1;
        Ok(MemoryConnection {
            warehouse: self.warehouse.clone(),
            broken: false,
        })
    }

    async fn recycle(&self, conn: &mut MemoryConnection, _: &Metrics) -> RecycleResult<SyncError> {
        if conn.broken {
            return Err(RecycleError::Backend(SyncError::TransientIo(
                "connection is broken".to_string(),
            )));
        }
        Ok(())
    }
}

/// A connection to a [`MemoryWarehouse`].
pub struct MemoryConnection {
    warehouse: MemoryWarehouse,
    broken: bool,
}

impl MemoryConnection {
    /// Simulate a dropped session.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let mut state = self.warehouse.lock();
        state.open_connections = state.open_connections.saturating_sub(1);
    }
}

#[async_trait]
impl WarehouseConnection for MemoryConnection {
    async fn upsert_batch(&mut self, entity: EntityType, rows: &[Row]) -> Result<UpsertCounts> {
        if self.broken {
            return Err(SyncError::TransientIo("connection is broken".to_string()));
        }

        let (delay, failure, break_after) = {
            let mut state = self.warehouse.lock();
            let failure = state.failures.pop_front();
            let break_after = state.breaks_pending > 0;
            if break_after {
                state.breaks_pending -= 1;
            }
            (state.batch_delay, failure, break_after)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let result = match failure {
            Some(InjectedFailure::Transient) => {
                self.broken = true;
                Err(SyncError::TransientIo(format!(
                    "simulated connection reset while loading {}",
                    entity.table()
                )))
            }
            Some(InjectedFailure::Permanent) => Err(SyncError::load(
                entity.table(),
                "simulated constraint violation",
            )),
            None => self.warehouse.apply(entity, rows),
        };

        if break_after {
            self.broken = true;
        }
        result
    }

    async fn ping(&mut self) -> Result<()> {
        if self.broken {
            return Err(SyncError::TransientIo("connection is broken".to_string()));
        }
        Ok(())
    }

    fn is_broken(&self) -> bool {
        self.broken
    }
}
