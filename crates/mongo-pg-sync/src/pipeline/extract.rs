//! Reads current documents from the operational store.

use std::sync::Arc;
use std::time::Instant;

use bson::Document;
use tracing::debug;

use crate::core::EntityType;
use crate::error::Result;
use crate::source::DocumentSource;

/// Point-in-time reader for one entity type at a time.
#[derive(Clone)]
pub struct Extractor {
    source: Arc<dyn DocumentSource>,
}

impl Extractor {
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source }
    }

    /// Full re-extract of `entity`.
    pub async fn extract(&self, entity: EntityType) -> Result<Vec<Document>> {
        let start = Instant::now();
        let docs = self.source.fetch_all(entity).await?;
        debug!(
            "{}: extracted {} documents in {:?}",
            entity,
            docs.len(),
            start.elapsed()
        );
        Ok(docs)
    }
}
