//! Retrying HTTP helper for talking to external systems.
//!
//! Guardians constantly poke other services — job platforms, monitoring
//! APIs, inventory systems. [`HttpClient`] wraps `reqwest` with the
//! retry discipline those integrations share: attempt `i` failing sleeps
//! `(i + 1)²` back-off units before the next try, and a request that
//! exhausts its retries surfaces as [`ClientError::FailedRequest`] for
//! the decision or executor logic to handle.

use std::time::Duration;

use miette::Diagnostic;
use reqwest::header::HeaderMap;
use thiserror::Error;

#[derive(Debug, Error, Diagnostic)]
pub enum ClientError {
    /// The request failed after every retry.
    #[error("request to {url} failed after {attempts} attempt(s): {message}")]
    #[diagnostic(code(wardmill::client::failed_request))]
    FailedRequest {
        url: String,
        attempts: usize,
        status: Option<u16>,
        message: String,
    },

    /// The underlying client could not be constructed.
    #[error("http client build failed: {0}")]
    #[diagnostic(code(wardmill::client::build))]
    Build(#[from] reqwest::Error),
}

/// HTTP helper with quadratic retry back-off.
pub struct HttpClient {
    inner: reqwest::Client,
    retries: usize,
    backoff_unit: Duration,
    /// Status codes counted as success; empty means any 2xx.
    accepted: Vec<u16>,
}

impl HttpClient {
    pub fn new(timeout: Duration) -> Result<Self, ClientError> {
        let inner = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            inner,
            retries: 2,
            backoff_unit: Duration::from_secs(1),
            accepted: Vec::new(),
        })
    }

    /// Number of retries after the first attempt (default 2).
    #[must_use]
    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Back-off unit multiplied by `(attempt + 1)²` (default one second).
    #[must_use]
    pub fn with_backoff_unit(mut self, unit: Duration) -> Self {
        self.backoff_unit = unit;
        self
    }

    /// Accept exactly these status codes instead of any 2xx.
    #[must_use]
    pub fn with_accepted_status(mut self, accepted: Vec<u16>) -> Self {
        self.accepted = accepted;
        self
    }

    fn acceptable(&self, status: reqwest::StatusCode) -> bool {
        if self.accepted.is_empty() {
            status.is_success()
        } else {
            self.accepted.contains(&status.as_u16())
        }
    }

    /// Issue `method url` with optional headers and body, retrying per
    /// the back-off policy, and return the response body as text.
    pub async fn request(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<String>,
    ) -> Result<String, ClientError> {
        let attempts = self.retries + 1;
        let mut last_status = None;
        let mut last_message = String::new();
        for attempt in 0..attempts {
            if attempt > 0 {
                let factor = (attempt * attempt) as u32;
                tokio::time::sleep(self.backoff_unit * factor).await;
            }
            let mut request = self.inner.request(method.clone(), url);
            if let Some(headers) = &headers {
                request = request.headers(headers.clone());
            }
            if let Some(body) = &body {
                request = request.body(body.clone());
            }
            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if self.acceptable(status) {
                        return response.text().await.map_err(|e| ClientError::FailedRequest {
                            url: url.into(),
                            attempts: attempt + 1,
                            status: Some(status.as_u16()),
                            message: e.to_string(),
                        });
                    }
                    tracing::warn!(%url, %status, attempt, "request rejected");
                    last_status = Some(status.as_u16());
                    last_message = format!("unexpected status {status}");
                }
                Err(error) => {
                    tracing::warn!(%url, %error, attempt, "request failed");
                    last_message = error.to_string();
                }
            }
        }
        Err(ClientError::FailedRequest {
            url: url.into(),
            attempts,
            status: last_status,
            message: last_message,
        })
    }

    /// [`request`](Self::request) with a JSON-parsed response.
    pub async fn request_json(
        &self,
        method: reqwest::Method,
        url: &str,
        headers: Option<HeaderMap>,
        body: Option<String>,
    ) -> Result<serde_json::Value, ClientError> {
        let text = self.request(method, url, headers, body).await?;
        serde_json::from_str(&text).map_err(|e| ClientError::FailedRequest {
            url: url.into(),
            attempts: self.retries + 1,
            status: None,
            message: format!("response is not JSON: {e}"),
        })
    }
}
