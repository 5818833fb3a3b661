//! Artifact storage seam.
//!
//! When a job completes, the provider hands back a short-lived artifact
//! URL. The `ArtifactStore` collaborator turns that into a durable handle;
//! the bytes themselves live with the storage collaborator, not here.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::ProviderError;

/// Turns a provider artifact URL into a durable handle.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store the artifact for a request; returns the durable handle.
    async fn store(&self, request_id: &str, artifact_url: &str) -> Result<String, ProviderError>;
}

/// Uses the provider URL as the handle directly. Suitable for development
/// and for providers whose artifact URLs are already durable.
pub struct PassthroughArtifactStore;

#[async_trait]
impl ArtifactStore for PassthroughArtifactStore {
    async fn store(&self, request_id: &str, artifact_url: &str) -> Result<String, ProviderError> {
        tracing::debug!(request.id = %request_id, url = %artifact_url, "Passthrough artifact handle");
        Ok(artifact_url.to_string())
    }
}

/// Relays the artifact URL to an external storage service which downloads
/// the bytes and answers with a durable handle.
pub struct HttpArtifactRelay {
    client: reqwest::Client,
    endpoint: String,
}

#[derive(Debug, Deserialize)]
struct RelayResponse {
    handle: String,
}

impl HttpArtifactRelay {
    /// Create a relay pointed at the storage service endpoint.
    pub fn new(endpoint: impl Into<String>) -> Result<Self, ProviderError> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl ArtifactStore for HttpArtifactRelay {
    async fn store(&self, request_id: &str, artifact_url: &str) -> Result<String, ProviderError> {
        let body = json!({
            "request_id": request_id,
            "artifact_url": artifact_url,
        });

        let response = self.client.post(&self.endpoint).json(&body).send().await?;
        let status = response.status();

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: RelayResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("bad relay response: {}", e)))?;

        Ok(parsed.handle)
    }
}
