//! Warehouse connection pool with an explicit process lifecycle.
//!
//! Wraps a `deadpool` managed pool and adds what the engine needs on top of it:
//!
//! - `initialize` at most once until the next `shutdown`
//! - fail-fast `acquire` once closing has begun
//! - a shutdown that waits (bounded) for checked-out connections to come back
//!   before closing, so an in-flight batch can finish its transaction

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::{Duration, Instant};

use deadpool::managed::{Manager, Object, Pool, PoolError, TimeoutType};
use deadpool::Runtime;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::PoolConfig;
use crate::error::{Result, SyncError};
use crate::warehouse::WarehouseConnection;

/// Poll interval while waiting for outstanding connections during shutdown.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// Pool sizing and timing.
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub min_size: usize,
    pub max_size: usize,
    pub acquire_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl PoolSettings {
    pub fn from_config(config: &PoolConfig) -> Self {
        Self {
            min_size: config.min_size,
            max_size: config.max_size.max(1),
            acquire_timeout: config.acquire_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self::from_config(&PoolConfig::default())
    }
}

/// Point-in-time pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub initialized: bool,
    pub closing: bool,
    pub size: usize,
    pub max_size: usize,
    pub checked_out: usize,
    /// Connections still checked out when the last shutdown's grace period ran out.
    pub abandoned: usize,
}

/// Process-wide pool of warehouse connections.
pub struct ConnectionPool<M: Manager> {
    settings: PoolSettings,
    pool: RwLock<Option<Pool<M>>>,
    closing: AtomicBool,
    /// Bumped by every completed shutdown, before `closing` is cleared.
    generation: AtomicU64,
    checked_out: Arc<AtomicUsize>,
    abandoned: AtomicUsize,
}

impl<M> ConnectionPool<M>
where
    M: Manager<Error = SyncError>,
    M::Type: WarehouseConnection,
{
    /// An uninitialized pool; `acquire` fails with PoolClosed until `initialize`.
    pub fn new(settings: PoolSettings) -> Self {
        Self {
            settings,
            pool: RwLock::new(None),
            closing: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            checked_out: Arc::new(AtomicUsize::new(0)),
            abandoned: AtomicUsize::new(0),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    /// Create the pool and open `min_size` connections.
    ///
    /// Fails with PoolAlreadyInitialized when called twice without a
    /// `shutdown` in between.
    pub async fn initialize(&self, manager: M) -> Result<()> {
        if self.current().is_some() {
            return Err(SyncError::PoolAlreadyInitialized);
        }

        let settings = self.settings;
        let pool = Pool::builder(manager)
            .max_size(settings.max_size)
            .wait_timeout(Some(settings.acquire_timeout))
            .create_timeout(Some(settings.acquire_timeout))
            .runtime(Runtime::Tokio1)
            .build()
            .map_err(|e| SyncError::pool(e.to_string(), "building warehouse pool"))?;

        // Prewarm: hold min_size connections at once so each one is distinct
        let mut warm = Vec::with_capacity(settings.min_size);
        for _ in 0..settings.min_size.min(settings.max_size) {
            let conn = pool.get().await.map_err(|e| map_pool_error(e, settings))?;
            warm.push(conn);
        }
        drop(warm);

        {
            let mut slot = self.pool.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                pool.close();
                return Err(SyncError::PoolAlreadyInitialized);
            }
            *slot = Some(pool);
        }
        self.closing.store(false, Ordering::SeqCst);

        info!(
            "Warehouse pool initialized (min {}, max {})",
            settings.min_size, settings.max_size
        );
        Ok(())
    }

    /// Check out a connection, waiting up to the acquire timeout.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let generation = self.generation.load(Ordering::SeqCst);
        if self.closing.load(Ordering::SeqCst) {
            return Err(SyncError::PoolClosed);
        }
        let pool = self.current().ok_or(SyncError::PoolClosed)?;

        let object = pool
            .get()
            .await
            .map_err(|e| map_pool_error(e, self.settings))?;

        // Count the checkout before looking at `closing` again: a shutdown
        // that has not seen this checkout is guaranteed to be seen here,
        // either still closing or already finished (generation moved on).
        let checkout = CheckoutGuard::new(Arc::clone(&self.checked_out));
        if self.closing.load(Ordering::SeqCst) || self.generation.load(Ordering::SeqCst) != generation {
            drop(object);
            drop(checkout);
            return Err(SyncError::PoolClosed);
        }

        Ok(PooledConnection {
            object,
            _checkout: checkout,
        })
    }

    /// Return a connection. Broken connections are discarded and replaced.
    pub async fn release(&self, conn: PooledConnection<M>) {
        if !conn.is_broken() {
            drop(conn);
            return;
        }

        let PooledConnection { object, _checkout } = conn;
        drop(Object::take(object));
        drop(_checkout);
        warn!("Discarded broken warehouse connection");

        if self.closing.load(Ordering::SeqCst) {
            return;
        }
        if let Some(pool) = self.current() {
            if pool.status().size < self.settings.min_size {
                match pool.get().await {
                    Ok(fresh) => {
                        debug!("Opened replacement warehouse connection");
                        drop(fresh);
                    }
                    Err(e) => warn!("Could not replace warehouse connection: {}", e),
                }
            }
        }
    }

    /// Stop handing out connections, wait for outstanding ones, then close.
    ///
    /// After this returns, `acquire` fails with PoolClosed until the next
    /// `initialize`. Calling it on an uninitialized pool is a no-op.
    pub async fn shutdown(&self) {
        let Some(pool) = self.current() else {
            return;
        };
        self.closing.store(true, Ordering::SeqCst);
        info!("Closing warehouse pool");

        let deadline = Instant::now() + self.settings.shutdown_grace;
        let mut abandoned = 0;
        loop {
            let outstanding = self.checked_out.load(Ordering::SeqCst);
            if outstanding == 0 {
                break;
            }
            if Instant::now() >= deadline {
                error!(
                    "Pool shutdown grace period elapsed with {} connection(s) still checked out; \
                     they are discarded when returned",
                    outstanding
                );
                abandoned = outstanding;
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }

        pool.close();
        *self.pool.write().unwrap_or_else(PoisonError::into_inner) = None;
        self.abandoned.store(abandoned, Ordering::SeqCst);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.closing.store(false, Ordering::SeqCst);
        info!("Warehouse pool closed");
    }

    pub fn status(&self) -> PoolStatus {
        let closing = self.closing.load(Ordering::SeqCst);
        let checked_out = self.checked_out.load(Ordering::SeqCst);
        let abandoned = self.abandoned.load(Ordering::SeqCst);
        match self.current() {
            Some(pool) => {
                let status = pool.status();
                PoolStatus {
                    initialized: true,
                    closing,
                    size: status.size,
                    max_size: status.max_size,
                    checked_out,
                    abandoned,
                }
            }
            None => PoolStatus {
                initialized: false,
                closing,
                size: 0,
                max_size: self.settings.max_size,
                checked_out,
                abandoned,
            },
        }
    }

    fn current(&self) -> Option<Pool<M>> {
        self.pool
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

fn map_pool_error(e: PoolError<SyncError>, settings: PoolSettings) -> SyncError {
    match e {
        PoolError::Timeout(TimeoutType::Wait) => SyncError::PoolExhausted(settings.acquire_timeout),
        PoolError::Timeout(kind) => {
            SyncError::TransientIo(format!("timed out opening warehouse connection ({:?})", kind))
        }
        PoolError::Closed => SyncError::PoolClosed,
        PoolError::Backend(e) => e,
        other => SyncError::pool(other.to_string(), "acquiring warehouse connection"),
    }
}

/// A checked-out connection. Dropping it returns it to the pool.
pub struct PooledConnection<M: Manager> {
    // Field order matters: the object goes back to the pool before the
    // checkout counter drops.
    object: Object<M>,
    _checkout: CheckoutGuard,
}

struct CheckoutGuard(Arc<AtomicUsize>);

impl CheckoutGuard {
    fn new(counter: Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for CheckoutGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<M: Manager> Deref for PooledConnection<M> {
    type Target = M::Type;

    fn deref(&self) -> &M::Type {
        &self.object
    }
}

impl<M: Manager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut M::Type {
        &mut self.object
    }
}
