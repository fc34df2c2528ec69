//! In-process operational store with a broadcast change feed and fault injection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bson::{Bson, Document};
use tokio::sync::broadcast;

use super::{
    bson_id_string, ChangeFeed, ChangeNotification, ChangeStream, DocumentSource, OperationKind,
};
use crate::config::CollectionNames;
use crate::core::EntityType;
use crate::error::{Result, SyncError};

type FeedItem = std::result::Result<ChangeNotification, String>;

/// In-memory [`DocumentSource`] and [`ChangeFeed`].
///
/// Cloning shares the same store. Writes through [`MemorySource::upsert`]
/// publish a change notification the way a change stream would.
#[derive(Clone)]
pub struct MemorySource {
    inner: Arc<Inner>,
}

struct Inner {
    collections: CollectionNames,
    documents: Mutex<HashMap<EntityType, Vec<Document>>>,
    feed: broadcast::Sender<FeedItem>,
    fetch_delay: Mutex<Duration>,
    failing_fetches: AtomicU32,
    failing_subscriptions: AtomicU32,
    fetches: Mutex<HashMap<EntityType, usize>>,
    subscriptions: AtomicUsize,
}

impl Default for MemorySource {
    fn default() -> Self {
        Self::new(CollectionNames::default())
    }
}

impl MemorySource {
    pub fn new(collections: CollectionNames) -> Self {
        let (feed, _) = broadcast::channel(1024);
        Self {
            inner: Arc::new(Inner {
                collections,
                documents: Mutex::new(HashMap::new()),
                feed,
                fetch_delay: Mutex::new(Duration::ZERO),
                failing_fetches: AtomicU32::new(0),
                failing_subscriptions: AtomicU32::new(0),
                fetches: Mutex::new(HashMap::new()),
                subscriptions: AtomicUsize::new(0),
            }),
        }
    }

    /// Insert or replace a document (matched on `_id`) and publish the change.
    pub fn upsert(&self, entity: EntityType, doc: Document) {
        let id = doc.get("_id").and_then(bson_id_string);
        let operation = {
            let mut documents = self.documents();
            let docs = documents.entry(entity).or_default();
            let existing = id.as_ref().and_then(|id| {
                docs.iter()
                    .position(|d| d.get("_id").and_then(bson_id_string).as_ref() == Some(id))
            });
            match existing {
                Some(pos) => {
                    docs[pos] = doc;
                    OperationKind::Replace
                }
                None => {
                    docs.push(doc);
                    OperationKind::Insert
                }
            }
        };

        let mut notification =
            ChangeNotification::new(entity.collection(&self.inner.collections), operation);
        notification.document_id = id;
        self.publish(notification);
    }

    /// Set a single field on an existing document and publish an update.
    pub fn set_field(&self, entity: EntityType, id: &str, field: &str, value: impl Into<Bson>) -> bool {
        let updated = {
            let mut documents = self.documents();
            let doc = documents.get_mut(&entity).and_then(|docs| {
                docs.iter_mut()
                    .find(|d| d.get("_id").and_then(bson_id_string).as_deref() == Some(id))
            });
            match doc {
                Some(doc) => {
                    doc.insert(field, value.into());
                    true
                }
                None => false,
            }
        };
        if updated {
            self.publish(
                ChangeNotification::new(entity.collection(&self.inner.collections), OperationKind::Update)
                    .with_document_id(id),
            );
        }
        updated
    }

    /// Publish a raw notification to every open stream.
    pub fn publish(&self, notification: ChangeNotification) {
        // No receivers just means nobody is watching yet
        let _ = self.inner.feed.send(Ok(notification));
    }

    /// Make every open stream fail its next read.
    pub fn break_streams(&self, reason: impl Into<String>) {
        let _ = self.inner.feed.send(Err(reason.into()));
    }

    /// Delay every `fetch_all` call, simulating a slow extract.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self
            .inner
            .fetch_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = delay;
    }

    /// Fail the next `n` fetches with a transient I/O error.
    pub fn fail_next_fetches(&self, n: u32) {
        self.inner.failing_fetches.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscription attempts.
    pub fn fail_next_subscriptions(&self, n: u32) {
        self.inner.failing_subscriptions.store(n, Ordering::SeqCst);
    }

    /// Number of completed `fetch_all` calls for one entity type.
    pub fn fetch_count(&self, entity: EntityType) -> usize {
        self.inner
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&entity)
            .copied()
            .unwrap_or(0)
    }

    /// Number of successful subscriptions so far.
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.load(Ordering::SeqCst)
    }

    /// Streams currently open.
    pub fn open_streams(&self) -> usize {
        self.inner.feed.receiver_count()
    }

    fn documents(&self) -> std::sync::MutexGuard<'_, HashMap<EntityType, Vec<Document>>> {
        self.inner
            .documents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl DocumentSource for MemorySource {
    async fn fetch_all(&self, entity: EntityType) -> Result<Vec<Document>> {
        let delay = *self
            .inner
            .fetch_delay
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        if Self::take_failure(&self.inner.failing_fetches) {
            return Err(SyncError::TransientIo(format!(
                "simulated read failure on {}",
                entity.collection(&self.inner.collections)
            )));
        }

        let docs = self.documents().get(&entity).cloned().unwrap_or_default();
        *self
            .inner
            .fetches
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(entity)
            .or_default() += 1;
        Ok(docs)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemorySource {
    async fn subscribe(&self) -> Result<Box<dyn ChangeStream>> {
        if Self::take_failure(&self.inner.failing_subscriptions) {
            return Err(SyncError::FeedSubscription(
                "simulated subscription failure".to_string(),
            ));
        }
        self.inner.subscriptions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryChangeStream {
            receiver: self.inner.feed.subscribe(),
        }))
    }
}

struct MemoryChangeStream {
    receiver: broadcast::Receiver<FeedItem>,
}

#[async_trait]
impl ChangeStream for MemoryChangeStream {
    async fn next_change(&mut self) -> Result<Option<ChangeNotification>> {
        match self.receiver.recv().await {
            Ok(Ok(notification)) => Ok(Some(notification)),
            Ok(Err(reason)) => Err(SyncError::TransientIo(reason)),
            // Missed events: we no longer know which collection changed
            Err(broadcast::error::RecvError::Lagged(_)) => Ok(Some(ChangeNotification {
                collection: None,
                operation: OperationKind::Other,
                document_id: None,
            })),
            Err(broadcast::error::RecvError::Closed) => Ok(None),
        }
    }
}
