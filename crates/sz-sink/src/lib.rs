//! HTTP sink for finalized sessions.
//!
//! Each snapshot is POSTed as JSON (`device_id`, `session_start`,
//! `session_end`). Responses are classified as:
//! - 2xx: acknowledged
//! - 408, 429, 5xx, timeouts, connection failures: unavailable (retried)
//! - any other status: rejected (the snapshot is dropped)

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use sz_core::{Ack, SessionSnapshot, Sink, SinkError};
use thiserror::Error;

/// Default request timeout for deliveries.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest slice of a response body kept in error messages.
const MAX_BODY_IN_ERROR: usize = 200;

/// Errors building an [`HttpSink`].
#[derive(Debug, Error)]
pub enum HttpSinkError {
    /// The endpoint is not an http(s) URL.
    #[error("invalid sink url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    /// The bearer token is blank.
    #[error("sink token cannot be empty")]
    EmptyToken,
    /// Failed to build HTTP client.
    #[error("failed to build HTTP client: {0}")]
    ClientBuild(#[source] reqwest::Error),
}

/// Delivers snapshots to an HTTP endpoint.
///
/// Clones share the underlying connection pool.
#[derive(Clone)]
pub struct HttpSink {
    http: reqwest::Client,
    url: Url,
    token: Option<String>,
}

impl fmt::Debug for HttpSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpSink")
            .field("url", &self.url.as_str())
            .field("token", &self.token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpSink {
    pub fn new(url: &str, token: Option<String>, timeout: Duration) -> Result<Self, HttpSinkError> {
        let parsed = Url::parse(url).map_err(|err| HttpSinkError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(HttpSinkError::InvalidUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme {}", parsed.scheme()),
            });
        }
        if token.as_deref().is_some_and(|token| token.trim().is_empty()) {
            return Err(HttpSinkError::EmptyToken);
        }

        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(HttpSinkError::ClientBuild)?;

        Ok(Self {
            http,
            url: parsed,
            token,
        })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

#[async_trait]
impl Sink for HttpSink {
    async fn deliver(&self, snapshot: &SessionSnapshot) -> Result<Ack, SinkError> {
        let mut request = self.http.post(self.url.clone()).json(snapshot);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        classify_status(status, &body)?;

        tracing::debug!(device = %snapshot.device_id, %status, "sink accepted snapshot");
        Ok(Ack::new(format!("http {}", status.as_u16())))
    }
}

/// Maps a response status to the sink error contract.
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), SinkError> {
    if status.is_success() {
        return Ok(());
    }
    let message = format!("status {status}: {}", truncate(body.trim(), MAX_BODY_IN_ERROR));
    if status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.is_server_error()
    {
        Err(SinkError::Unavailable(message))
    } else {
        Err(SinkError::Rejected(message))
    }
}

fn classify_transport(err: reqwest::Error) -> SinkError {
    if err.is_builder() {
        SinkError::Rejected(err.to_string())
    } else {
        SinkError::Unavailable(err.to_string())
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}
