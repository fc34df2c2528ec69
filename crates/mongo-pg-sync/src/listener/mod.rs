//! Change feed listener.
//!
//! One background task blocks on the change stream and turns every
//! notification into a sync request. It never runs the pipeline itself.
//!
//! ```text
//! Stopped -> Starting -> Watching -> Stopping -> Stopped
//!               ^            |
//!               +- backoff --+--> Error (after too many consecutive failures)
//! ```

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{CollectionNames, ListenerConfig};
use crate::core::{Backoff, EntityType};
use crate::error::{Result, SyncError};
use crate::orchestrator::{SyncHandle, SyncTrigger};
use crate::source::{ChangeFeed, ChangeNotification, ChangeStream};

/// Listener lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ListenerState {
    #[default]
    Stopped,
    /// Subscribing, or backing off before the next subscription attempt.
    Starting,
    Watching,
    Stopping,
    /// Gave up after too many consecutive failures. Needs a restart.
    Error,
}

/// Listener status snapshot.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ListenerStatus {
    pub state: ListenerState,
    pub last_error: Option<String>,
    pub consecutive_failures: u32,
    pub notifications_seen: u64,
    pub last_notification_at: Option<DateTime<Utc>>,
    pub subscriptions: u64,
}

/// Listener timing.
#[derive(Debug, Clone, Copy)]
pub struct ListenerSettings {
    pub backoff: Backoff,
    pub max_consecutive_failures: u32,
    pub stop_timeout: Duration,
}

impl ListenerSettings {
    pub fn from_config(config: &ListenerConfig) -> Self {
        Self {
            backoff: Backoff::exponential(
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_cap_ms),
            )
            .with_full_jitter(),
            max_consecutive_failures: config.max_consecutive_failures.max(1),
            stop_timeout: Duration::from_millis(config.stop_timeout_ms),
        }
    }
}

impl Default for ListenerSettings {
    fn default() -> Self {
        Self::from_config(&ListenerConfig::default())
    }
}

struct Running {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Owns the watch task.
pub struct ChangeFeedListener {
    feed: Arc<dyn ChangeFeed>,
    requests: SyncHandle,
    collections: CollectionNames,
    settings: ListenerSettings,
    status: Arc<watch::Sender<ListenerStatus>>,
    running: Mutex<Option<Running>>,
}

impl ChangeFeedListener {
    pub fn new(
        feed: Arc<dyn ChangeFeed>,
        requests: SyncHandle,
        collections: CollectionNames,
        settings: ListenerSettings,
    ) -> Self {
        let (status, _) = watch::channel(ListenerStatus::default());
        Self {
            feed,
            requests,
            collections,
            settings,
            status: Arc::new(status),
            running: Mutex::new(None),
        }
    }

    /// Spawn the watch task. Fails if it is already running.
    pub fn start(&self) -> Result<()> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = running.as_ref() {
            if !current.task.is_finished() {
                return Err(SyncError::Listener("listener is already running".to_string()));
            }
        }

        self.status.send_modify(|s| {
            s.state = ListenerState::Starting;
            s.consecutive_failures = 0;
            s.last_error = None;
        });

        let cancel = CancellationToken::new();
        let watcher = Watcher {
            feed: Arc::clone(&self.feed),
            requests: self.requests.clone(),
            collections: self.collections.clone(),
            settings: self.settings,
            status: Arc::clone(&self.status),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(watcher.run());
        *running = Some(Running { cancel, task });
        info!("Change feed listener started");
        Ok(())
    }

    /// Cancel the watch task and join it, aborting after the stop timeout.
    ///
    /// When this returns the task no longer touches the feed or the
    /// orchestrator.
    pub async fn stop(&self) {
        let running = self
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        if let Some(Running { cancel, mut task }) = running {
            self.status.send_modify(|s| {
                if s.state != ListenerState::Error {
                    s.state = ListenerState::Stopping;
                }
            });
            cancel.cancel();
            match tokio::time::timeout(self.settings.stop_timeout, &mut task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Listener task ended abnormally: {}", e),
                Err(_) => {
                    warn!(
                        "Listener did not stop within {:?}; aborting",
                        self.settings.stop_timeout
                    );
                    task.abort();
                    let _ = task.await;
                }
            }
            info!("Change feed listener stopped");
        }

        self.status.send_modify(|s| s.state = ListenerState::Stopped);
    }

    /// Stop, then start.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await;
        self.start()
    }

    pub fn status(&self) -> ListenerStatus {
        self.status.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ListenerStatus> {
        self.status.subscribe()
    }
}

/// State moved into the watch task.
struct Watcher {
    feed: Arc<dyn ChangeFeed>,
    requests: SyncHandle,
    collections: CollectionNames,
    settings: ListenerSettings,
    status: Arc<watch::Sender<ListenerStatus>>,
    cancel: CancellationToken,
}

impl Watcher {
    async fn run(self) {
        let mut failures: u32 = 0;

        loop {
            let subscribed = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return,
                result = self.feed.subscribe() => result,
            };

            let stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    failures += 1;
                    if !self.back_off(failures, &e.to_string()).await {
                        return;
                    }
                    continue;
                }
            };

            self.status.send_modify(|s| {
                s.state = ListenerState::Watching;
                s.subscriptions += 1;
            });
            info!("Watching change feed");

            let Some(reason) = self.watch(stream, &mut failures).await else {
                return;
            };
            failures += 1;
            if !self.back_off(failures, &reason).await {
                return;
            }
        }
    }

    /// Read until cancelled (None) or the stream fails (Some(reason)).
    ///
    /// A subscription alone does not clear `failures`; only a delivered
    /// notification proves the stream is healthy.
    async fn watch(&self, mut stream: Box<dyn ChangeStream>, failures: &mut u32) -> Option<String> {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return None,
                next = stream.next_change() => next,
            };
            match next {
                Ok(Some(notification)) => {
                    if *failures > 0 {
                        *failures = 0;
                        self.status.send_modify(|s| s.consecutive_failures = 0);
                    }
                    self.dispatch(notification);
                }
                Ok(None) => return Some("change stream closed by the server".to_string()),
                Err(e) => return Some(e.to_string()),
            }
        }
    }

    fn dispatch(&self, notification: ChangeNotification) {
        // Collections outside the entity catalogue (users, unknown) sync everything
        let collection = notification
            .collection
            .filter(|c| EntityType::from_collection(&self.collections, c).is_some());
        debug!(
            "Change notification: {} on {} ({})",
            notification.operation,
            collection.as_deref().unwrap_or("all"),
            notification.document_id.as_deref().unwrap_or("-")
        );

        self.status.send_modify(|s| {
            s.notifications_seen += 1;
            s.last_notification_at = Some(Utc::now());
        });

        let trigger = SyncTrigger::Change {
            collection,
            operation: notification.operation,
        };
        if !self.requests.request(trigger) {
            warn!("Sync orchestrator is stopped; dropping change notification");
        }
    }

    /// Record a failure and sleep. Returns false when the listener should exit.
    async fn back_off(&self, failures: u32, reason: &str) -> bool {
        let max = self.settings.max_consecutive_failures;
        self.status.send_modify(|s| {
            s.consecutive_failures = failures;
            s.last_error = Some(reason.to_string());
        });

        if failures >= max {
            error!(
                "Change feed failed {} times in a row, giving up: {}",
                failures, reason
            );
            self.status.send_modify(|s| s.state = ListenerState::Error);
            return false;
        }

        let delay = self.settings.backoff.delay(failures);
        warn!(
            "Change feed failure {}/{}: {}. Resubscribing in {:?}",
            failures, max, reason, delay
        );
        self.status.send_modify(|s| s.state = ListenerState::Starting);

        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
