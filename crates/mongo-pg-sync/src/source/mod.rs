//! Operational store abstractions.
//!
//! - [`DocumentSource`]: point-in-time reads of one entity type
//! - [`ChangeFeed`]: opens change notification streams for the watched collections
//! - [`ChangeStream`]: a live cursor over change notifications
//!
//! [`MongoSource`] implements all three against MongoDB; [`MemorySource`] is an
//! in-process store with fault injection used by tests.

mod memory;
mod mongo;

pub use memory::MemorySource;
pub use mongo::MongoSource;

use std::fmt;

use async_trait::async_trait;
use bson::Document;
use serde::{Deserialize, Serialize};

use crate::core::EntityType;
use crate::error::Result;

/// Point-in-time read access to the operational store.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    /// Read every current document for one entity type.
    ///
    /// Customers and agents come back with their linked user document
    /// embedded under `usuario` when one exists.
    async fn fetch_all(&self, entity: EntityType) -> Result<Vec<Document>>;

    /// Round-trip to the server.
    async fn ping(&self) -> Result<()>;
}

/// Opens change notification streams.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    /// Subscribe from "now". Fails with `FeedSubscription` or a source error.
    async fn subscribe(&self) -> Result<Box<dyn ChangeStream>>;
}

/// A live change cursor. Dropping it closes the cursor.
#[async_trait]
pub trait ChangeStream: Send {
    /// Block until the next notification.
    ///
    /// `Ok(None)` means the server ended the stream (invalidate, drop).
    async fn next_change(&mut self) -> Result<Option<ChangeNotification>>;
}

/// Kind of write observed on a watched collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Insert,
    Update,
    Replace,
    Delete,
    /// Drops, renames, invalidations and anything newer than this crate.
    Other,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OperationKind::Insert => "insert",
            OperationKind::Update => "update",
            OperationKind::Replace => "replace",
            OperationKind::Delete => "delete",
            OperationKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// One change notification. A trigger, not a durable record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeNotification {
    /// Affected collection; `None` when the event does not name one.
    pub collection: Option<String>,
    pub operation: OperationKind,
    /// Document `_id` rendered as a string, when present.
    pub document_id: Option<String>,
}

impl ChangeNotification {
    pub fn new(collection: impl Into<String>, operation: OperationKind) -> Self {
        Self {
            collection: Some(collection.into()),
            operation,
            document_id: None,
        }
    }

    pub fn with_document_id(mut self, id: impl Into<String>) -> Self {
        self.document_id = Some(id.into());
        self
    }
}

/// Render a document id as the string used for `origin_id`.
///
/// ObjectIds become lowercase hex; strings pass through; integers use decimal.
pub fn bson_id_string(id: &bson::Bson) -> Option<String> {
    match id {
        bson::Bson::ObjectId(oid) => Some(oid.to_hex()),
        bson::Bson::String(s) if !s.is_empty() => Some(s.clone()),
        bson::Bson::Int32(n) => Some(n.to_string()),
        bson::Bson::Int64(n) => Some(n.to_string()),
        _ => None,
    }
}
