//! HTTP client for the generation provider API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;

use super::{JobState, JobStatus, ProviderClient, ProviderError, SubmittedJob};

/// Default provider API base URL
const DEFAULT_BASE_URL: &str = "https://api.songforge.io/v1";

/// Default request timeout
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Configuration for the HTTP provider client
#[derive(Debug, Clone)]
pub struct ProviderHttpConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub timeout: Duration,
}

impl Default for ProviderHttpConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl ProviderHttpConfig {
    /// Create a config pointed at a specific base URL.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Default::default()
        }
    }
}

/// HTTP generation provider client
pub struct HttpProviderClient {
    client: Client,
    config: ProviderHttpConfig,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
    artifact_url: Option<String>,
    error_message: Option<String>,
    duration_seconds: Option<f64>,
}

impl HttpProviderClient {
    /// Create a new client.
    pub fn new(config: ProviderHttpConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    /// Attach auth if an API key is configured.
    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    /// Map a non-success response to a ProviderError.
    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ProviderError> {
        let status = response.status();

        if status.as_u16() == 429 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(ProviderError::RateLimited { retry_after });
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::Api {
                status: status.as_u16(),
                message,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl ProviderClient for HttpProviderClient {
    async fn submit(&self, prompt: &str, callback_url: &str) -> Result<SubmittedJob, ProviderError> {
        let url = format!("{}/generations", self.config.base_url);
        let body = json!({
            "prompt": prompt,
            "callback_url": callback_url,
        });

        let response = self.authorize(self.client.post(&url)).json(&body).send().await?;
        let response = Self::check(response).await?;

        let parsed: SubmitResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("bad submit response: {}", e)))?;

        if parsed.task_id.is_empty() {
            return Err(ProviderError::InvalidResponse("empty task_id".to_string()));
        }

        tracing::info!(task.id = %parsed.task_id, "Submitted generation job");

        Ok(SubmittedJob {
            external_task_id: parsed.task_id,
        })
    }

    async fn poll(&self, external_task_id: &str) -> Result<JobStatus, ProviderError> {
        let url = format!("{}/generations", self.config.base_url);

        let response = self
            .authorize(self.client.get(&url))
            .query(&[("taskId", external_task_id)])
            .send()
            .await?;
        let response = Self::check(response).await?;

        let parsed: StatusResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("bad status response: {}", e)))?;

        let state = JobState::parse(&parsed.status)
            .ok_or_else(|| ProviderError::InvalidResponse(format!("unknown job status: {}", parsed.status)))?;

        Ok(JobStatus {
            state,
            artifact_url: parsed.artifact_url,
            error_message: parsed.error_message,
            duration_seconds: parsed.duration_seconds,
        })
    }
}
