// SPDX-License-Identifier: MIT OR Apache-2.0
//! HTTP registry client.
//!
//! Consumes the registry contract over HTTP:
//! `GET /tools/{tool_id}` for the latest version and
//! `GET /tools/{tool_id}/{version}` for a pinned one. A `404` reads as
//! "unknown tool"; transport failures map to `RegistryUnavailable` and body
//! failures to `Decode`.

use std::time::Duration;

use async_trait::async_trait;
use kiwi_core::{ToolId, ToolVersion};
use tracing::debug;

use crate::{StoreError, ToolStore};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Client for a remote tool registry.
#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRegistry {
    /// Create a client for the registry at `base_url` (no trailing slash).
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    #[must_use]
    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .expect("build HTTP client");
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
        }
    }

    /// The registry base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch(&self, tool_id: &ToolId, url: String) -> Result<Option<ToolVersion>, StoreError> {
        debug!(target: "kiwi.registry", %url, "fetching registry document");
        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| StoreError::RegistryUnavailable {
                    reason: format!("GET {url}: {e}"),
                })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::RegistryUnavailable {
                reason: format!("GET {url}: status {}", response.status()),
            });
        }

        response
            .json::<ToolVersion>()
            .await
            .map(Some)
            .map_err(|e| StoreError::Decode {
                tool_id: tool_id.clone(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ToolStore for HttpRegistry {
    async fn latest(&self, tool_id: &ToolId) -> Result<Option<ToolVersion>, StoreError> {
        let url = format!("{}/tools/{tool_id}", self.base_url);
        self.fetch(tool_id, url).await
    }

    async fn version(
        &self,
        tool_id: &ToolId,
        version: &str,
    ) -> Result<Option<ToolVersion>, StoreError> {
        let url = format!("{}/tools/{tool_id}/{version}", self.base_url);
        self.fetch(tool_id, url).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kiwi_core::{ToolType, ToolVersionBuilder};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn tool(id: &str, version: &str) -> ToolVersion {
        ToolVersionBuilder::new(id, version, ToolType::Primitive)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn latest_decodes_registry_document() {
        let server = MockServer::start().await;
        let doc = tool("subprocess", "1.0.0");
        Mock::given(method("GET"))
            .and(path("/tools/subprocess"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&doc))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri());
        let id: ToolId = "subprocess".parse().unwrap();
        let fetched = registry.latest(&id).await.unwrap().unwrap();
        assert_eq!(fetched, doc);
    }

    #[tokio::test]
    async fn version_hits_pinned_path() {
        let server = MockServer::start().await;
        let doc = tool("subprocess", "2.1.0");
        Mock::given(method("GET"))
            .and(path("/tools/subprocess/2.1.0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&doc))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri());
        let id: ToolId = "subprocess".parse().unwrap();
        let fetched = registry.version(&id, "2.1.0").await.unwrap().unwrap();
        assert_eq!(fetched.version, "2.1.0");
    }

    #[tokio::test]
    async fn not_found_reads_as_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools/ghost"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri());
        let id: ToolId = "ghost".parse().unwrap();
        assert!(registry.latest(&id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn server_error_is_registry_unavailable() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools/subprocess"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri());
        let id: ToolId = "subprocess".parse().unwrap();
        let err = registry.latest(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::RegistryUnavailable { .. }));
    }

    #[tokio::test]
    async fn malformed_body_is_a_decode_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/tools/subprocess"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{\"nope\": true}"))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri());
        let id: ToolId = "subprocess".parse().unwrap();
        let err = registry.latest(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test]
    async fn file_hashes_alias_accepted_on_the_wire() {
        let server = MockServer::start().await;
        let mut doc = serde_json::to_value(tool("subprocess", "1.0.0")).unwrap();
        let files = doc.as_object_mut().unwrap().remove("files").unwrap();
        doc.as_object_mut()
            .unwrap()
            .insert("file_hashes".into(), files);
        Mock::given(method("GET"))
            .and(path("/tools/subprocess"))
            .respond_with(ResponseTemplate::new(200).set_body_json(&doc))
            .mount(&server)
            .await;

        let registry = HttpRegistry::new(server.uri());
        let id: ToolId = "subprocess".parse().unwrap();
        assert!(registry.latest(&id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn unreachable_registry_is_unavailable() {
        // Nothing listens on this port.
        let registry =
            HttpRegistry::with_timeout("http://127.0.0.1:9", Duration::from_millis(250));
        let id: ToolId = "subprocess".parse().unwrap();
        let err = registry.latest(&id).await.unwrap_err();
        assert!(matches!(err, StoreError::RegistryUnavailable { .. }));
    }
}
