//! In-memory document store
//!
//! Stands in for the store service in tests. Documents are kept
//! per collection and keyed by their `id` field.

use async_trait::async_trait;
use keel_core::domain::collection::Collection;
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Mutex;
use uuid::Uuid;

use super::{DocumentStore, StoreError};

#[derive(Default)]
pub struct MemoryDocumentStore {
    documents: Mutex<HashMap<(Collection, Uuid), JsonValue>>,
    inserted: Mutex<Vec<(Collection, JsonValue)>>,
    /// Every `status` written through `update_by_id`
    statuses: Mutex<Vec<(Collection, Uuid, JsonValue)>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `document` under `id`, replacing any previous version
    pub fn put(&self, collection: Collection, id: Uuid, document: JsonValue) {
        self.documents
            .lock()
            .unwrap()
            .insert((collection, id), document);
    }

    pub fn get(&self, collection: Collection, id: Uuid) -> Option<JsonValue> {
        self.documents
            .lock()
            .unwrap()
            .get(&(collection, id))
            .cloned()
    }

    /// Documents inserted into `collection`, in insertion order
    pub fn inserted(&self, collection: Collection) -> Vec<JsonValue> {
        self.inserted
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == collection)
            .map(|(_, d)| d.clone())
            .collect()
    }

    /// Statuses written to one document, oldest first
    pub fn statuses(&self, collection: Collection, id: Uuid) -> Vec<String> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, i, _)| *c == collection && *i == id)
            .filter_map(|(_, _, status)| status.as_str().map(str::to_string))
            .collect()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn find_by_id(
        &self,
        collection: Collection,
        id: Uuid,
    ) -> Result<Option<JsonValue>, StoreError> {
        Ok(self.get(collection, id))
    }

    async fn update_by_id(
        &self,
        collection: Collection,
        id: Uuid,
        fields: Map<String, JsonValue>,
    ) -> Result<(), StoreError> {
        let mut documents = self.documents.lock().unwrap();
        let document = documents
            .get_mut(&(collection, id))
            .ok_or(StoreError::NotFound { collection, id })?;

        if let Some(status) = fields.get("status") {
            self.statuses
                .lock()
                .unwrap()
                .push((collection, id, status.clone()));
        }

        if let JsonValue::Object(existing) = document {
            existing.extend(fields);
        } else {
            *document = JsonValue::Object(fields);
        }

        Ok(())
    }

    async fn insert(&self, collection: Collection, document: JsonValue) -> Result<(), StoreError> {
        if let Some(id) = document
            .get("id")
            .and_then(JsonValue::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
        {
            self.put(collection, id, document.clone());
        }

        self.inserted.lock().unwrap().push((collection, document));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_update_merges_fields() {
        let store = MemoryDocumentStore::new();
        let id = Uuid::new_v4();
        store.put(Collection::Jobs, id, json!({"id": id, "status": "new", "name": "a"}));

        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("pending"));
        store.update_by_id(Collection::Jobs, id, fields).await.unwrap();

        let document = store.find_by_id(Collection::Jobs, id).await.unwrap().unwrap();
        assert_eq!(document["status"], "pending");
        assert_eq!(document["name"], "a");
        assert_eq!(store.statuses(Collection::Jobs, id), vec!["pending"]);
    }

    #[tokio::test]
    async fn test_update_missing_document() {
        let store = MemoryDocumentStore::new();
        let mut fields = Map::new();
        fields.insert("status".to_string(), json!("pending"));

        let result = store
            .update_by_id(Collection::Jobs, Uuid::new_v4(), fields)
            .await;
        assert!(matches!(result, Err(StoreError::NotFound { .. })));
    }

    #[tokio::test]
    async fn test_insert_is_recorded() {
        let store = MemoryDocumentStore::new();
        store
            .insert(Collection::ActivityStream, json!({"description": "Job started"}))
            .await
            .unwrap();

        let inserted = store.inserted(Collection::ActivityStream);
        assert_eq!(inserted.len(), 1);
        assert_eq!(inserted[0]["description"], "Job started");
        assert!(store.inserted(Collection::Jobs).is_empty());
    }
}
