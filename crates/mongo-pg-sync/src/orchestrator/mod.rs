//! Sync orchestrator: at most one pass at a time, no request lost.
//!
//! One coordinator task owns the [`RunState`]. Everything else talks to it
//! through a [`SyncHandle`] (requests in) and a `watch` channel (status out):
//!
//! - a request while idle starts a pass immediately
//! - requests while a pass runs collapse into one owed pass
//! - when a pass completes, the owed pass (if any) starts right away
//!
//! Passes run inside the coordinator's own future, so aborting the
//! coordinator also drops the pass.

mod run;
mod state;

pub use run::{EntityReport, RunOutcome, SyncRun, SyncTrigger};
pub use state::RunState;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, OptionFuture};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};

/// Runs one full pass. Implemented by the pipeline; tests substitute fakes.
#[async_trait]
pub trait PassExecutor: Send + Sync + 'static {
    /// Execute `run` and return it finished.
    ///
    /// `cancel` fires on shutdown; implementations stop at the next
    /// entity-type boundary and finish the run as Superseded.
    async fn run_pass(&self, run: SyncRun, cancel: CancellationToken) -> SyncRun;
}

/// Orchestrator timing.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorSettings {
    pub request_buffer: usize,
    pub reconcile_interval: Option<Duration>,
    pub retry_failed_after: Option<Duration>,
    pub join_timeout: Duration,
}

impl OrchestratorSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            request_buffer: config.request_buffer.max(1),
            reconcile_interval: config
                .reconcile_interval_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs),
            retry_failed_after: config.retry_failed_after_ms.map(Duration::from_millis),
            join_timeout: Duration::from_millis(config.join_timeout_ms),
        }
    }
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self::from_config(&SyncConfig::default())
    }
}

/// Snapshot published after every state change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorStatus {
    pub state: RunState,
    pub passes_started: u64,
    pub passes_succeeded: u64,
    pub passes_failed: u64,
    pub passes_superseded: u64,
    /// Requests absorbed into an already-owed or running pass.
    pub coalesced_requests: u64,
    pub last_run_at: Option<DateTime<Utc>>,
    /// Error of the latest pass, cleared by the next successful one.
    pub last_error: Option<String>,
    pub last_run: Option<SyncRun>,
    pub retry_scheduled: bool,
}

impl OrchestratorStatus {
    pub fn passes_finished(&self) -> u64 {
        self.passes_succeeded + self.passes_failed + self.passes_superseded
    }
}

#[derive(Debug)]
struct SyncRequest {
    trigger: SyncTrigger,
    requested_at: DateTime<Utc>,
}

/// Cloneable sender of sync requests.
#[derive(Clone)]
pub struct SyncHandle {
    tx: mpsc::Sender<SyncRequest>,
    overflow: Arc<AtomicU64>,
}

impl SyncHandle {
    /// Fire-and-forget request. Never blocks.
    ///
    /// A full buffer still counts as accepted: the buffered requests already
    /// owe a pass that starts after this call. Returns false only when the
    /// orchestrator has stopped.
    pub fn request(&self, trigger: SyncTrigger) -> bool {
        let request = SyncRequest {
            trigger,
            requested_at: Utc::now(),
        };
        match self.tx.try_send(request) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.overflow.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// Owner of the coordinator task.
pub struct SyncOrchestrator {
    handle: SyncHandle,
    status: watch::Receiver<OrchestratorStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncOrchestrator {
    /// Spawn the coordinator. Must be called inside a Tokio runtime.
    pub fn start(executor: Arc<dyn PassExecutor>, settings: OrchestratorSettings) -> Self {
        let (tx, rx) = mpsc::channel(settings.request_buffer.max(1));
        let (status_tx, status_rx) = watch::channel(OrchestratorStatus::default());
        let cancel = CancellationToken::new();
        let overflow = Arc::new(AtomicU64::new(0));

        let coordinator = Coordinator {
            executor,
            settings,
            requests: rx,
            status: status_tx,
            cancel: cancel.clone(),
            overflow: Arc::clone(&overflow),
            state: RunState::Idle,
            pending: None,
            retry_at: None,
        };
        let task = tokio::spawn(coordinator.run());

        info!("Sync orchestrator started");
        Self {
            handle: SyncHandle { tx, overflow },
            status: status_rx,
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn handle(&self) -> SyncHandle {
        self.handle.clone()
    }

    /// Enqueue a request. See [`SyncHandle::request`].
    pub fn trigger(&self, trigger: SyncTrigger) -> bool {
        self.handle.request(trigger)
    }

    pub fn status(&self) -> OrchestratorStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<OrchestratorStatus> {
        self.status.clone()
    }

    /// Wait until at least `passes` passes have finished and nothing is owed.
    pub async fn wait_for_passes(&self, passes: u64, timeout: Duration) -> Result<OrchestratorStatus> {
        let mut rx = self.status.clone();
        let waited = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.passes_finished() >= passes && s.state == RunState::Idle),
        )
        .await;
        match waited {
            Ok(Ok(status)) => Ok(status.clone()),
            Ok(Err(_)) => Err(SyncError::Cancelled),
            Err(_) => Err(SyncError::TransientIo(format!(
                "timed out after {:?} waiting for {} pass(es)",
                timeout, passes
            ))),
        }
    }

    /// Stop accepting work, let the running pass reach an entity-type
    /// boundary, and join the coordinator. The coordinator is aborted if it
    /// has not exited within `join_timeout`. Idempotent.
    pub async fn shutdown(&self, join_timeout: Duration) {
        self.cancel.cancel();
        let task = self
            .task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(mut task) = task else {
            return;
        };

        match tokio::time::timeout(join_timeout, &mut task).await {
            Ok(Ok(())) => info!("Sync orchestrator stopped"),
            Ok(Err(e)) => error!("Sync orchestrator task failed: {}", e),
            Err(_) => {
                warn!(
                    "Running pass did not reach a safe boundary within {:?}; aborting it",
                    join_timeout
                );
                task.abort();
                let _ = task.await;
            }
        }
    }
}

impl Drop for SyncOrchestrator {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// A pass owed to requests that arrived while another one was running.
struct Pending {
    trigger: SyncTrigger,
    requested_at: DateTime<Utc>,
    coalesced: u64,
}

struct Coordinator {
    executor: Arc<dyn PassExecutor>,
    settings: OrchestratorSettings,
    requests: mpsc::Receiver<SyncRequest>,
    status: watch::Sender<OrchestratorStatus>,
    cancel: CancellationToken,
    overflow: Arc<AtomicU64>,
    state: RunState,
    pending: Option<Pending>,
    retry_at: Option<Instant>,
}

impl Coordinator {
    async fn run(mut self) {
        let mut in_flight: Option<BoxFuture<'static, SyncRun>> = None;
        let mut reconcile = self.settings.reconcile_interval.map(|period| {
            let mut interval = tokio::time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        loop {
            let retry_deadline = self.retry_at;
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                Some(run) = OptionFuture::from(in_flight.as_mut()), if in_flight.is_some() => {
                    in_flight = None;
                    self.record_completion(run);
                    let (next, start) = self.state.on_pass_complete();
                    self.state = next;
                    if start {
                        in_flight = self.start_owed_pass();
                    }
                    self.publish();
                }

                request = self.requests.recv() => {
                    let Some(request) = request else { break };
                    if let Some(pass) = self.on_request(request) {
                        in_flight = Some(pass);
                    }
                }

                _ = tick(&mut reconcile) => {
                    let request = SyncRequest { trigger: SyncTrigger::Reconcile, requested_at: Utc::now() };
                    if let Some(pass) = self.on_request(request) {
                        in_flight = Some(pass);
                    }
                }

                _ = sleep_until(retry_deadline), if retry_deadline.is_some() => {
                    self.retry_at = None;
                    let request = SyncRequest { trigger: SyncTrigger::Retry, requested_at: Utc::now() };
                    if let Some(pass) = self.on_request(request) {
                        in_flight = Some(pass);
                    }
                }
            }
        }

        // Drain: the pass sees the cancelled token and stops at the next
        // entity-type boundary.
        if let Some(pass) = in_flight.take() {
            debug!("Waiting for the running pass to reach a safe boundary");
            let run = pass.await;
            self.record_completion(run);
        }
        self.pending = None;
        self.retry_at = None;
        self.state = RunState::Idle;
        self.publish();
        self.requests.close();
    }

    fn on_request(&mut self, request: SyncRequest) -> Option<BoxFuture<'static, SyncRun>> {
        let overflow = self.overflow.swap(0, Ordering::Relaxed);
        debug!("Sync requested ({})", request.trigger);

        let (next, start) = self.state.on_request();
        self.state = next;

        let absorbed;
        let pass = if start {
            absorbed = overflow;
            Some(self.start_pass(request.trigger, request.requested_at, overflow))
        } else {
            absorbed = match self.pending.as_mut() {
                Some(pending) => {
                    pending.coalesced += 1 + overflow;
                    1 + overflow
                }
                None => {
                    self.pending = Some(Pending {
                        trigger: request.trigger,
                        requested_at: request.requested_at,
                        coalesced: overflow,
                    });
                    overflow
                }
            };
            None
        };
        if absorbed > 0 {
            self.status.send_modify(|s| s.coalesced_requests += absorbed);
        }
        self.publish();
        pass
    }

    fn start_owed_pass(&mut self) -> Option<BoxFuture<'static, SyncRun>> {
        let pending = self.pending.take().unwrap_or(Pending {
            trigger: SyncTrigger::Manual,
            requested_at: Utc::now(),
            coalesced: 0,
        });
        let overflow = self.overflow.swap(0, Ordering::Relaxed);
        Some(self.start_pass(pending.trigger, pending.requested_at, pending.coalesced + overflow))
    }

    fn start_pass(
        &mut self,
        trigger: SyncTrigger,
        requested_at: DateTime<Utc>,
        coalesced: u64,
    ) -> BoxFuture<'static, SyncRun> {
        // Any pass starting now covers whatever the scheduled retry would have
        self.retry_at = None;

        let run = SyncRun::begin(trigger, requested_at, coalesced);
        info!(
            "Starting sync pass {} (trigger: {}, coalesced: {})",
            run.short_id(),
            run.trigger,
            run.coalesced
        );
        self.status.send_modify(|s| s.passes_started += 1);

        let executor = Arc::clone(&self.executor);
        let cancel = self.cancel.child_token();
        let mut fallback = run.clone();
        async move {
            match AssertUnwindSafe(executor.run_pass(run, cancel)).catch_unwind().await {
                Ok(run) => run,
                Err(panic) => {
                    fallback.finish(RunOutcome::Failed, Some(format!("pass panicked: {}", panic_message(&*panic))));
                    fallback
                }
            }
        }
        .boxed()
    }

    fn record_completion(&mut self, mut run: SyncRun) {
        if run.outcome.is_none() {
            run.finish(RunOutcome::Failed, Some("pass returned without an outcome".to_string()));
        }
        let outcome = run.outcome.unwrap_or(RunOutcome::Failed);
        let totals = run.totals();

        match outcome {
            RunOutcome::Succeeded => info!(
                "Sync pass {} succeeded in {:.2}s: {} inserted, {} updated, {} unchanged, {} skipped",
                run.short_id(),
                run.duration_seconds().unwrap_or_default(),
                totals.inserted,
                totals.updated,
                totals.unchanged,
                run.skipped()
            ),
            RunOutcome::Failed => error!(
                "Sync pass {} failed: {}",
                run.short_id(),
                run.error.as_deref().unwrap_or("unknown error")
            ),
            RunOutcome::Superseded => info!(
                "Sync pass {} stopped at an entity boundary after {} entity type(s)",
                run.short_id(),
                run.entities.len()
            ),
        }

        let schedule_retry = outcome == RunOutcome::Failed && !self.cancel.is_cancelled();
        if schedule_retry {
            if let Some(delay) = self.settings.retry_failed_after {
                info!("Retrying failed sync in {:?} unless triggered sooner", delay);
                self.retry_at = Some(Instant::now() + delay);
            }
        }

        self.status.send_modify(|s| {
            match outcome {
                RunOutcome::Succeeded => {
                    s.passes_succeeded += 1;
                    s.last_error = None;
                }
                RunOutcome::Failed => {
                    s.passes_failed += 1;
                    s.last_error = run.error.clone();
                }
                RunOutcome::Superseded => s.passes_superseded += 1,
            }
            s.last_run_at = run.finished_at;
            s.last_run = Some(run);
        });
    }

    fn publish(&self) {
        let state = self.state;
        let retry_scheduled = self.retry_at.is_some();
        self.status.send_modify(|s| {
            s.state = state;
            s.retry_scheduled = retry_scheduled;
        });
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Executor that sleeps, counts passes and optionally fails.
    struct FakeExecutor {
        delay: Duration,
        passes: AtomicUsize,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
        fail_first: AtomicUsize,
        started: Mutex<Vec<(SyncTrigger, u64)>>,
    }

    impl FakeExecutor {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                passes: AtomicUsize::new(0),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
                fail_first: AtomicUsize::new(0),
                started: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl PassExecutor for FakeExecutor {
        async fn run_pass(&self, mut run: SyncRun, cancel: CancellationToken) -> SyncRun {
            self.passes.fetch_add(1, Ordering::SeqCst);
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            self.started.lock().unwrap().push((run.trigger.clone(), run.coalesced));

            tokio::time::sleep(self.delay).await;
            self.concurrent.fetch_sub(1, Ordering::SeqCst);

            if cancel.is_cancelled() {
                run.finish(RunOutcome::Superseded, None);
            } else if self
                .fail_first
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                run.finish(RunOutcome::Failed, Some("simulated failure".into()));
            } else {
                run.finish(RunOutcome::Succeeded, None);
            }
            run
        }
    }

    struct PanickingExecutor;

    #[async_trait]
    impl PassExecutor for PanickingExecutor {
        async fn run_pass(&self, _run: SyncRun, _cancel: CancellationToken) -> SyncRun {
            panic!("executor exploded");
        }
    }

    fn settings() -> OrchestratorSettings {
        OrchestratorSettings {
            request_buffer: 64,
            reconcile_interval: None,
            retry_failed_after: None,
            join_timeout: Duration::from_secs(5),
        }
    }

    fn change() -> SyncTrigger {
        SyncTrigger::Change {
            collection: Some("ventas".into()),
            operation: crate::source::OperationKind::Insert,
        }
    }

    #[tokio::test]
    async fn test_single_request_runs_one_pass() {
        let executor = FakeExecutor::new(Duration::from_millis(10));
        let orchestrator = SyncOrchestrator::start(executor.clone(), settings());

        assert!(orchestrator.trigger(SyncTrigger::Manual));
        let status = orchestrator
            .wait_for_passes(1, Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(status.passes_succeeded, 1);
        assert_eq!(executor.passes.load(Ordering::SeqCst), 1);
        assert!(status.last_run_at.is_some());
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_burst_while_running_coalesces_into_one_pass() {
        let executor = FakeExecutor::new(Duration::from_millis(200));
        let orchestrator = SyncOrchestrator::start(executor.clone(), settings());

        orchestrator.trigger(SyncTrigger::Manual);
        let mut rx = orchestrator.subscribe();
        rx.wait_for(|s| s.state == RunState::Running).await.unwrap();

        for _ in 0..5 {
            assert!(orchestrator.trigger(change()));
        }

        let status = orchestrator
            .wait_for_passes(2, Duration::from_secs(5))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(executor.passes.load(Ordering::SeqCst), 2);
        assert_eq!(executor.max_concurrent.load(Ordering::SeqCst), 1);
        assert_eq!(status.coalesced_requests, 4);

        let started = executor.started.lock().unwrap().clone();
        assert_eq!(started[1].0, change());
        assert_eq!(started[1].1, 4);
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_owed_pass_starts_after_last_request() {
        let executor = FakeExecutor::new(Duration::from_millis(100));
        let orchestrator = SyncOrchestrator::start(executor.clone(), settings());

        orchestrator.trigger(SyncTrigger::Manual);
        tokio::time::sleep(Duration::from_millis(20)).await;
        orchestrator.trigger(SyncTrigger::Manual);
        let last_request = Utc::now();

        let status = orchestrator
            .wait_for_passes(2, Duration::from_secs(5))
            .await
            .unwrap();
        let last = status.last_run.unwrap();
        assert!(last.started_at >= last_request);
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_pass_returns_to_idle() {
        let executor = FakeExecutor::new(Duration::from_millis(5));
        executor.fail_first.store(1, Ordering::SeqCst);
        let orchestrator = SyncOrchestrator::start(executor.clone(), settings());

        orchestrator.trigger(SyncTrigger::Manual);
        let status = orchestrator
            .wait_for_passes(1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.passes_failed, 1);
        assert_eq!(status.state, RunState::Idle);
        assert_eq!(status.last_error.as_deref(), Some("simulated failure"));

        orchestrator.trigger(SyncTrigger::Manual);
        let status = orchestrator
            .wait_for_passes(2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.passes_succeeded, 1);
        assert!(status.last_error.is_none());
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_failed_pass_schedules_retry() {
        let executor = FakeExecutor::new(Duration::from_millis(5));
        executor.fail_first.store(1, Ordering::SeqCst);
        let orchestrator = SyncOrchestrator::start(
            executor.clone(),
            OrchestratorSettings {
                retry_failed_after: Some(Duration::from_millis(50)),
                ..settings()
            },
        );

        orchestrator.trigger(SyncTrigger::Manual);
        let status = orchestrator
            .wait_for_passes(2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.last_run.unwrap().trigger, SyncTrigger::Retry);
        assert!(!status.retry_scheduled);
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_reconcile_interval_triggers_passes() {
        let executor = FakeExecutor::new(Duration::from_millis(1));
        let orchestrator = SyncOrchestrator::start(
            executor.clone(),
            OrchestratorSettings {
                reconcile_interval: Some(Duration::from_millis(30)),
                ..settings()
            },
        );

        let status = orchestrator
            .wait_for_passes(2, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.last_run.unwrap().trigger, SyncTrigger::Reconcile);
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_panicking_pass_is_recorded_as_failed() {
        let orchestrator = SyncOrchestrator::start(Arc::new(PanickingExecutor), settings());
        orchestrator.trigger(SyncTrigger::Manual);

        let status = orchestrator
            .wait_for_passes(1, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(status.passes_failed, 1);
        assert!(status.last_error.unwrap().contains("executor exploded"));
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_waits_for_running_pass() {
        let executor = FakeExecutor::new(Duration::from_millis(150));
        let orchestrator = SyncOrchestrator::start(executor.clone(), settings());

        orchestrator.trigger(SyncTrigger::Manual);
        let mut rx = orchestrator.subscribe();
        rx.wait_for(|s| s.state == RunState::Running).await.unwrap();

        orchestrator.shutdown(Duration::from_secs(5)).await;
        let status = orchestrator.status();
        assert_eq!(executor.concurrent.load(Ordering::SeqCst), 0);
        assert_eq!(status.passes_superseded, 1);
        assert_eq!(status.state, RunState::Idle);

        assert!(!orchestrator.trigger(SyncTrigger::Manual));
        // idempotent
        orchestrator.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn test_shutdown_aborts_after_join_timeout() {
        let executor = FakeExecutor::new(Duration::from_secs(30));
        let orchestrator = SyncOrchestrator::start(executor.clone(), settings());

        orchestrator.trigger(SyncTrigger::Manual);
        let mut rx = orchestrator.subscribe();
        rx.wait_for(|s| s.state == RunState::Running).await.unwrap();

        let start = std::time::Instant::now();
        orchestrator.shutdown(Duration::from_millis(100)).await;
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_settings_from_config() {
        let config = SyncConfig {
            reconcile_interval_secs: Some(0),
            retry_failed_after_ms: None,
            ..SyncConfig::default()
        };
        let settings = OrchestratorSettings::from_config(&config);
        assert!(settings.reconcile_interval.is_none());
        assert!(settings.retry_failed_after.is_none());
        assert_eq!(settings.join_timeout, Duration::from_secs(30));
    }
}
