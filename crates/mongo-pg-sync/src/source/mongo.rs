//! MongoDB implementation of the source traits.

use std::time::Duration;

use async_trait::async_trait;
use bson::{doc, Document};
use futures::TryStreamExt;
use mongodb::change_stream::event::{ChangeStreamEvent, OperationType};
use mongodb::options::ClientOptions;
use mongodb::{Client, Database};
use tracing::{debug, info};

use super::{ChangeFeed, ChangeNotification, ChangeStream, DocumentSource, OperationKind};
use crate::config::{CollectionNames, SourceConfig};
use crate::core::EntityType;
use crate::error::{Result, SyncError};
use crate::source::bson_id_string;

/// MongoDB operational store.
#[derive(Clone)]
pub struct MongoSource {
    client: Client,
    database: Database,
    collections: CollectionNames,
}

impl MongoSource {
    /// Connect and verify the server answers a ping.
    pub async fn connect(config: &SourceConfig) -> Result<Self> {
        let mut options = ClientOptions::parse(&config.uri).await?;
        options.app_name = Some("mongo-pg-sync".to_string());
        options.server_selection_timeout =
            Some(Duration::from_millis(config.server_selection_timeout_ms));

        let client = Client::with_options(options)?;
        let database = client.database(&config.database);
        let source = Self {
            client,
            database,
            collections: config.collections.clone(),
        };

        source.ping().await?;
        info!("Connected to MongoDB database: {}", config.database);
        Ok(source)
    }

    /// Aggregation used to read customers and agents with their user document.
    ///
    /// `usuarioId` may be stored as a string or an ObjectId; `$convert` keeps the
    /// raw value when it is not a valid ObjectId so string ids still match.
    fn with_user_pipeline(&self) -> Vec<Document> {
        vec![
            doc! {
                "$lookup": {
                    "from": self.collections.users.as_str(),
                    "let": { "uid": "$usuarioId" },
                    "pipeline": [
                        { "$match": { "$expr": { "$eq": [
                            "$_id",
                            { "$convert": { "input": "$$uid", "to": "objectId", "onError": "$$uid", "onNull": null } }
                        ] } } },
                        { "$limit": 1 }
                    ],
                    "as": "usuario"
                }
            },
            doc! { "$unwind": { "path": "$usuario", "preserveNullAndEmptyArrays": true } },
        ]
    }

    /// Close the client's connection pool once open cursors are gone.
    pub async fn shutdown(&self) {
        self.client.clone().shutdown().await;
    }
}

#[async_trait]
impl DocumentSource for MongoSource {
    async fn fetch_all(&self, entity: EntityType) -> Result<Vec<Document>> {
        let name = entity.collection(&self.collections);
        let collection = self.database.collection::<Document>(name);

        let cursor = match entity {
            EntityType::Customer | EntityType::Agent => {
                collection.aggregate(self.with_user_pipeline(), None).await?
            }
            _ => collection.find(None, None).await?,
        };
        let docs: Vec<Document> = cursor.try_collect().await?;
        debug!("Read {} documents from {}", docs.len(), name);
        Ok(docs)
    }

    async fn ping(&self) -> Result<()> {
        self.database.run_command(doc! { "ping": 1 }, None).await?;
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MongoSource {
    async fn subscribe(&self) -> Result<Box<dyn ChangeStream>> {
        let watched = self.collections.watched();
        let pipeline = vec![doc! { "$match": { "ns.coll": { "$in": watched } } }];

        let stream = self
            .database
            .watch(pipeline, None)
            .await
            .map_err(|e| SyncError::FeedSubscription(e.to_string()))?;

        info!(
            "Watching change stream on database {}",
            self.database.name()
        );
        Ok(Box::new(MongoChangeStream { inner: stream }))
    }
}

struct MongoChangeStream {
    inner: mongodb::change_stream::ChangeStream<ChangeStreamEvent<Document>>,
}

#[async_trait]
impl ChangeStream for MongoChangeStream {
    async fn next_change(&mut self) -> Result<Option<ChangeNotification>> {
        let Some(event) = self.inner.try_next().await? else {
            return Ok(None);
        };

        let operation = match event.operation_type {
            OperationType::Insert => OperationKind::Insert,
            OperationType::Update => OperationKind::Update,
            OperationType::Replace => OperationKind::Replace,
            OperationType::Delete => OperationKind::Delete,
            _ => OperationKind::Other,
        };

        Ok(Some(ChangeNotification {
            collection: event.ns.and_then(|ns| ns.coll),
            operation,
            document_id: event
                .document_key
                .as_ref()
                .and_then(|key| key.get("_id"))
                .and_then(bson_id_string),
        }))
    }
}
