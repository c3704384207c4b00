//! REST client for the collection service.
//!
//! Wraps the `/api/collection` endpoints (run list, run detail, status,
//! start, stop) using [`reqwest`]. Successful responses use the
//! `{ "data": ... }` envelope.

use std::time::Duration;

use async_trait::async_trait;
use newsdesk_core::job::{CommandAck, Job, JobDetail, StartOptions, StatusSummary};
use newsdesk_core::types::JobId;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{CommandError, FetchError};
use crate::remote::JobsRemote;

/// Standard `{ "data": T }` response envelope.
#[derive(Debug, Deserialize)]
struct DataResponse<T> {
    data: T,
}

/// HTTP implementation of [`JobsRemote`].
pub struct HttpJobsRemote {
    client: reqwest::Client,
    api_url: String,
}

impl HttpJobsRemote {
    /// * `api_url` - Base HTTP URL, e.g. `http://host:8000`.
    /// * `timeout` - Per-request timeout applied by the HTTP client.
    pub fn new(api_url: impl Into<String>, timeout: Duration) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Reuse an existing [`reqwest::Client`] (shared connection pool).
    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/api/collection{}", self.api_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, FetchError> {
        let response = self.client.get(self.url(path)).send().await?;
        Self::parse_response(response).await
    }

    /// Send a command and interpret the answer. `409 Conflict` means the
    /// executor refused (e.g. a run is already in progress).
    async fn command(&self, request: reqwest::RequestBuilder) -> Result<CommandAck, CommandError> {
        let response = request.send().await.map_err(FetchError::from)?;

        if response.status() == StatusCode::CONFLICT {
            let body = response.text().await.unwrap_or_default();
            return Err(CommandError::Rejected(error_message(&body)));
        }

        Ok(Self::parse_response(response).await?)
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code, or return
    /// [`FetchError::Api`] with the status and body text.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, FetchError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(FetchError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }

    /// Parse a successful enveloped JSON body into the expected type.
    async fn parse_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, FetchError> {
        let response = Self::ensure_success(response).await?;
        let envelope = response.json::<DataResponse<T>>().await?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl JobsRemote for HttpJobsRemote {
    async fn fetch_jobs(&self, limit: usize) -> Result<Vec<Job>, FetchError> {
        self.get(&format!("/tasks?limit={limit}")).await
    }

    async fn fetch_job_detail(&self, id: JobId) -> Result<JobDetail, FetchError> {
        self.get(&format!("/tasks/{id}")).await
    }

    async fn fetch_job_status(&self) -> Result<StatusSummary, FetchError> {
        self.get("/status").await
    }

    async fn start_job(&self, options: &StartOptions) -> Result<CommandAck, CommandError> {
        self.command(self.client.post(self.url("/start")).json(options))
            .await
    }

    async fn stop_job(&self) -> Result<CommandAck, CommandError> {
        self.command(self.client.post(self.url("/stop"))).await
    }
}

/// Pull a human-readable message out of an error body.
///
/// Understands `{"error": {"message": ..}}`, `{"error": ".."}`,
/// `{"detail": ".."}` and `{"message": ".."}`; falls back to the raw body.
fn error_message(body: &str) -> String {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(body) else {
        return body.trim().to_string();
    };

    let candidates = [
        value.pointer("/error/message"),
        value.get("error"),
        value.get("detail"),
        value.get("message"),
    ];
    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|v| v.as_str().map(str::to_string));
    message.unwrap_or_else(|| body.trim().to_string())
}
