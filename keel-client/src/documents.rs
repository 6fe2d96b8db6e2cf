//! Document endpoints

use crate::{StoreClient, accepted};
use crate::error::{ClientError, Result};
use keel_core::domain::collection::Collection;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value as JsonValue};
use tracing::debug;
use uuid::Uuid;

impl StoreClient {
    /// URL of a single document
    pub fn document_url(&self, collection: Collection, id: Uuid) -> String {
        format!("{}/api/{}/{}", self.base_url, collection, id)
    }

    /// URL of a collection
    pub fn collection_url(&self, collection: Collection) -> String {
        format!("{}/api/{}", self.base_url, collection)
    }

    /// Read a document by id
    ///
    /// Returns `Ok(None)` when the store answers 404.
    pub async fn get_document<T: DeserializeOwned>(
        &self,
        collection: Collection,
        id: Uuid,
    ) -> Result<Option<T>> {
        let url = self.document_url(collection, id);
        let response = match accepted(self.client.get(&url).send().await?).await {
            Ok(response) => response,
            Err(e) if e.is_not_found() => return Ok(None),
            Err(e) => return Err(e),
        };

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| ClientError::Decode(format!("{}: {}", url, e)))
    }

    /// Apply a partial field update to a document
    ///
    /// Only the given fields are touched; the store merges them into the
    /// existing record.
    pub async fn update_document(
        &self,
        collection: Collection,
        id: Uuid,
        fields: &Map<String, JsonValue>,
    ) -> Result<()> {
        if fields.is_empty() {
            return Err(ClientError::EmptyUpdate(format!("{} {}", collection, id)));
        }

        let url = self.document_url(collection, id);
        debug!("PATCH {} ({} field(s))", url, fields.len());
        let response = self.client.patch(&url).json(fields).send().await?;
        accepted(response).await?;
        Ok(())
    }

    /// Insert a new document
    pub async fn insert_document<T: Serialize + ?Sized>(
        &self,
        collection: Collection,
        document: &T,
    ) -> Result<()> {
        let url = self.collection_url(collection);
        let response = self.client.post(&url).json(document).send().await?;
        accepted(response).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_urls() {
        let client = StoreClient::new("http://store:9000/");
        let id = Uuid::nil();

        assert_eq!(
            client.document_url(Collection::TerraformJobs, id),
            "http://store:9000/api/terraform_jobs/00000000-0000-0000-0000-000000000000"
        );
        assert_eq!(
            client.collection_url(Collection::ActivityStream),
            "http://store:9000/api/activity_stream"
        );
    }

    #[tokio::test]
    async fn test_empty_update_is_rejected_locally() {
        let client = StoreClient::new("http://127.0.0.1:1");
        let err = client
            .update_document(Collection::Jobs, Uuid::nil(), &Map::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ClientError::EmptyUpdate(_)));
    }
}
