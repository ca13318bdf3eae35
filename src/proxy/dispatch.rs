//! Upstream dispatch.
//!
//! # Responsibilities
//! - Build the target URL from the configured base and the inbound path
//! - Issue exactly one request per inbound request (no retries)
//! - Hand back the response body as a chunk stream, never buffered
//! - Separate "upstream answered with an error" from "upstream unreachable"
//! - Bound the buffered read of an error body by the same no-data window
//!   the relay uses, keeping whatever arrived before a failure

use std::error::Error as _;
use std::pin::Pin;
use std::time::Duration;

use axum::http::{HeaderMap, Method, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt};
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::proxy::relay::{self, StreamError};

/// Upstream body as an incrementally readable, non-restartable stream.
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Bytes, StreamError>> + Send>>;

/// A successful (2xx) upstream response whose body has not been read yet.
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ChunkStream,
}

impl std::fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Why no streamable response was obtained.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// Upstream replied, with a non-2xx status. Authoritative.
    ///
    /// `interrupted` is set when the error body broke off or stalled;
    /// `body` then holds only the bytes read before that.
    #[error("upstream responded with status {status}")]
    Upstream {
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
        interrupted: Option<StreamError>,
    },

    /// No response at all: DNS, refused connection, reset, TLS failure.
    #[error("upstream request failed: {0}")]
    Transport(String),

    /// No response headers within the configured window.
    #[error("upstream did not respond within {0:?}")]
    Timeout(Duration),
}

/// Issues outbound requests to the configured upstream.
#[derive(Debug, Clone)]
pub struct UpstreamDispatcher {
    client: reqwest::Client,
    base_url: String,
    response_timeout: Option<Duration>,
    /// Longest gap allowed between chunks of a buffered error body.
    error_body_timeout: Option<Duration>,
}

impl UpstreamDispatcher {
    /// Create a dispatcher from upstream configuration.
    pub fn new(config: &UpstreamConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .redirect(reqwest::redirect::Policy::none())
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            response_timeout: config.response_timeout(),
            error_body_timeout: config.idle_timeout().or(config.response_timeout()),
        })
    }

    /// `<base url><path and query>`.
    pub fn target_url(&self, path_and_query: &str) -> String {
        format!("{}{}", self.base_url, path_and_query)
    }

    /// Send one request and return the streamed response.
    pub async fn dispatch(
        &self,
        method: Method,
        target_url: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, DispatchError> {
        let request = self
            .client
            .request(method, target_url)
            .headers(headers)
            .body(body)
            .send();

        let result = match self.response_timeout {
            Some(limit) => tokio::time::timeout(limit, request)
                .await
                .map_err(|_| DispatchError::Timeout(limit))?,
            None => request.await,
        };
        let response = result.map_err(|e| DispatchError::Transport(describe(&e)))?;

        let status = response.status();
        let headers = response.headers().clone();

        let body: ChunkStream = Box::pin(
            response
                .bytes_stream()
                .map(|chunk| chunk.map_err(|e| StreamError::Upstream(describe(&e)))),
        );

        if !status.is_success() {
            let (body, interrupted) = read_error_body(body, self.error_body_timeout).await;
            if let Some(err) = &interrupted {
                tracing::warn!(status = %status, error = %err, "Upstream error body interrupted");
            }
            return Err(DispatchError::Upstream {
                status,
                headers,
                body,
                interrupted,
            });
        }

        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

/// Buffer an error body, stopping at the first failure or stall.
async fn read_error_body(
    mut body: ChunkStream,
    idle_timeout: Option<Duration>,
) -> (Bytes, Option<StreamError>) {
    let mut buf = BytesMut::new();
    loop {
        match relay::next_chunk(&mut body, idle_timeout).await {
            Ok(Some(chunk)) => buf.extend_from_slice(&chunk),
            Ok(None) => return (buf.freeze(), None),
            Err(err) => return (buf.freeze(), Some(err)),
        }
    }
}

/// Flatten an error and its sources into one line.
fn describe(err: &reqwest::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
