//! HTTP delivery transport, behind a trait so tests script responses.

use crate::error::ErrorKind;
use async_trait::async_trait;
use std::fmt;
use std::time::Duration;

/// One outbound webhook POST.
#[derive(Debug, Clone)]
pub struct WebhookRequest {
    pub url: String,
    pub body: serde_json::Value,
    pub headers: Vec<(String, String)>,
    pub traceparent: String,
    pub timeout: Duration,
}

/// Downstream reply, reduced to what classification needs.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    pub status: u16,
    /// Parsed `Retry-After` seconds, when the reply carried one.
    pub retry_after: Option<Duration>,
    /// JSON body, when present. Batch replies put their positional failure
    /// indices here.
    pub body: Option<serde_json::Value>,
}

impl TransportResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Transport-level failure, before any HTTP status exists.
///
/// `kind` is always `Timeout` or `Network`; both are retryable.
#[derive(Debug, Clone, PartialEq)]
pub struct TransportError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl TransportError {
    pub fn timeout(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Timeout, detail: detail.into() }
    }

    pub fn network(detail: impl Into<String>) -> Self {
        Self { kind: ErrorKind::Network, detail: detail.into() }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

impl std::error::Error for TransportError {}

/// Seam between the sender and the wire.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    async fn post(&self, request: WebhookRequest) -> Result<TransportResponse, TransportError>;
}

/// Production transport backed by a shared `reqwest` client.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self { client: reqwest::Client::builder().build()? })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn post(&self, request: WebhookRequest) -> Result<TransportResponse, TransportError> {
        let mut builder = self
            .client
            .post(&request.url)
            .json(&request.body)
            .header("traceparent", &request.traceparent)
            .timeout(request.timeout);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                TransportError::timeout(err.to_string())
            } else {
                TransportError::network(err.to_string())
            }
        })?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.json::<serde_json::Value>().await.ok();
        Ok(TransportResponse { status, retry_after, body })
    }
}
