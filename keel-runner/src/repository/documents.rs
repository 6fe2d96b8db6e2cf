//! Document store repository
//!
//! Handles the three operations the engine needs from the store:
//! - Reading a document by id
//! - Applying a partial update to a document
//! - Inserting a document (activity stream)

use async_trait::async_trait;
use keel_client::{ClientError, StoreClient};
use keel_core::domain::collection::Collection;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document store request failed: {0}")]
    Client(#[from] ClientError),

    #[error("document {id} not found in {collection}")]
    NotFound { collection: Collection, id: Uuid },
}

/// Repository trait for document operations
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Reads a document, `Ok(None)` when it does not exist
    async fn find_by_id(
        &self,
        collection: Collection,
        id: Uuid,
    ) -> Result<Option<JsonValue>, StoreError>;

    /// Merges `fields` into an existing document
    ///
    /// # Arguments
    /// * `collection` - The collection holding the document
    /// * `id` - The document id
    /// * `fields` - Top level fields to overwrite
    async fn update_by_id(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, JsonValue>,
    ) -> Result<(), StoreError>;

    /// Inserts a new document
    async fn insert(&self, collection: Collection, document: JsonValue) -> Result<(), StoreError>;
}

/// HTTP implementation of DocumentStore
pub struct HttpDocumentStore {
    client: StoreClient,
}

impl HttpDocumentStore {
    /// Creates a new HTTP document store
    ///
    /// # Arguments
    /// * `store_url` - Base URL of the store (e.g., "http://localhost:8080")
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            client: StoreClient::new(store_url),
        }
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn find_by_id(
        &self,
        collection: Collection,
        id: Uuid,
    ) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.client.get_document(collection, id).await?)
    }

    async fn update_by_id(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, JsonValue>,
    ) -> Result<(), StoreError> {
        match self.client.update_document(collection, id, &fields).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_not_found() => Err(StoreError::NotFound { collection, id }),
            Err(e) => Err(e.into()),
        }
    }

    async fn insert(&self, collection: Collection, document: JsonValue) -> Result<(), StoreError> {
        Ok(self.client.insert_document(collection, &document).await?)
    }
}
