//! Keel document store client
//!
//! The store keeps one JSON record per job, template and project, plus an
//! append-only activity stream. Records live under `/api/<collection>/<id>`;
//! a record is read with `GET`, changed with a `PATCH` carrying only the
//! changed fields and created with a `POST` to its collection.
//!
//! Writes never replace a whole record, so two runners finishing related jobs
//! only race on the fields they both touch.
//!
//! ```no_run
//! use keel_client::StoreClient;
//! use keel_core::domain::collection::Collection;
//! use serde_json::{Map, json};
//! use uuid::Uuid;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), keel_client::ClientError> {
//!     let store = StoreClient::new("http://localhost:8080");
//!
//!     let mut fields = Map::new();
//!     fields.insert("status".to_string(), json!("running"));
//!     store.update_document(Collection::Jobs, Uuid::new_v4(), &fields).await?;
//!     Ok(())
//! }
//! ```

pub mod error;
mod documents;

pub use error::{ClientError, Result};

use reqwest::{Client, Response};

#[derive(Debug, Clone)]
pub struct StoreClient {
    /// Store root without a trailing slash
    base_url: String,
    client: Client,
}

impl StoreClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_client(base_url, Client::new())
    }

    /// Uses a preconfigured `reqwest` client, e.g. one with request timeouts
    pub fn with_client(base_url: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

/// Turns a non-2xx answer into [`ClientError::Rejected`] carrying the body
async fn accepted(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Rejected {
        status: status.as_u16(),
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalized() {
        assert_eq!(StoreClient::new("http://store:9000").base_url(), "http://store:9000");
        assert_eq!(StoreClient::new("http://store:9000//").base_url(), "http://store:9000");
    }
}
