//! Failure classification.
//!
//! # Request Lifecycle
//! ```text
//! Received ──▶ Dispatching ──▶ Streaming ──▶ Completed
//!    │              │              └──────▶ StreamFailed
//!    │              ├──────▶ DispatchFailed
//!    │              └──────▶ Abandoned
//!    ├──────▶ Rejected
//!    └──────▶ Abandoned
//! ```
//!
//! `Abandoned` means the caller went away before any response head was sent.
//!
//! # Design Decisions
//! - Upstream error replies are authoritative and forwarded verbatim
//! - Transport failures get one fixed gateway status and a proxy-authored body
//! - Stream failures cannot change the status already sent; they only shape
//!   the record
//! - An upstream error body that broke off is relayed as far as it got, then
//!   the connection is aborted, the same as a failure mid-stream

use std::io;

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_LENGTH;
use axum::http::{Response, StatusCode};
use futures_util::stream;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::proxy::dispatch::DispatchError;
use crate::proxy::relay::StreamError;

/// Status answered when the upstream could not be reached at all.
pub const PROXY_FAILURE_STATUS: StatusCode = StatusCode::BAD_GATEWAY;

/// Where one request is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Received,
    Dispatching,
    Streaming,
    Rejected,
    DispatchFailed,
    Completed,
    StreamFailed,
    Abandoned,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Received => "received",
            Phase::Dispatching => "dispatching",
            Phase::Streaming => "streaming",
            Phase::Rejected => "rejected",
            Phase::DispatchFailed => "dispatch_failed",
            Phase::Completed => "completed",
            Phase::StreamFailed => "stream_failed",
            Phase::Abandoned => "abandoned",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Phase::Rejected
                | Phase::DispatchFailed
                | Phase::Completed
                | Phase::StreamFailed
                | Phase::Abandoned
        )
    }

    pub fn can_advance_to(self, next: Phase) -> bool {
        matches!(
            (self, next),
            (Phase::Received, Phase::Dispatching)
                | (Phase::Received, Phase::Rejected)
                | (Phase::Received, Phase::Abandoned)
                | (Phase::Dispatching, Phase::Abandoned)
                | (Phase::Dispatching, Phase::Streaming)
                | (Phase::Dispatching, Phase::DispatchFailed)
                | (Phase::Streaming, Phase::Completed)
                | (Phase::Streaming, Phase::StreamFailed)
        )
    }
}

/// Tracks one request's phase; each transition is checked.
#[derive(Debug)]
pub struct Lifecycle {
    request_id: String,
    phase: Phase,
}

impl Lifecycle {
    pub fn new(request_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            phase: Phase::Received,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, next: Phase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "invalid transition {:?} -> {:?}",
            self.phase,
            next
        );
        tracing::trace!(
            request_id = %self.request_id,
            from = self.phase.as_str(),
            to = next.as_str(),
            "Request phase"
        );
        self.phase = next;
    }
}

/// The inbound request could not be read.
#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("request body exceeds the {0} byte limit")]
    TooLarge(usize),

    #[error("failed to read request body: {0}")]
    Read(String),
}

/// What the caller gets, and what the record says.
#[derive(Debug)]
pub struct Verdict {
    pub status: StatusCode,
    pub response: Response<Body>,
    /// Message for the record's error outcome.
    pub message: String,
    /// Bytes the caller received before the failure, for the record.
    pub partial: Bytes,
}

/// Classify a failure that happened before anything was dispatched.
pub fn intake_failure(err: &IntakeError) -> Verdict {
    let (status, label) = match err {
        IntakeError::TooLarge(_) => (StatusCode::PAYLOAD_TOO_LARGE, "Request body too large"),
        IntakeError::Read(_) => (StatusCode::BAD_REQUEST, "Invalid request body"),
    };
    let message = err.to_string();
    Verdict {
        status,
        response: (status, Json(json!({ "error": label, "message": message }))).into_response(),
        message,
        partial: Bytes::new(),
    }
}

/// Classify a dispatch failure.
pub fn dispatch_failure(err: DispatchError) -> Verdict {
    match err {
        DispatchError::Upstream {
            status,
            mut headers,
            body,
            interrupted: Some(err),
        } => {
            // The declared length no longer matches what will be sent.
            headers.remove(CONTENT_LENGTH);
            let message = stream_failure(&err);
            let mut chunks = Vec::with_capacity(2);
            if !body.is_empty() {
                chunks.push(Ok(body.clone()));
            }
            chunks.push(Err(io::Error::other(message.clone())));

            let mut response = Response::new(Body::from_stream(stream::iter(chunks)));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Verdict {
                status,
                response,
                message,
                partial: body,
            }
        }
        DispatchError::Upstream {
            status,
            headers,
            body,
            interrupted: None,
        } => {
            let message = if body.is_empty() {
                format!("upstream responded with status {}", status)
            } else {
                String::from_utf8_lossy(&body).into_owned()
            };
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            *response.headers_mut() = headers;
            Verdict {
                status,
                response,
                message,
                partial: Bytes::new(),
            }
        }
        err @ (DispatchError::Transport(_) | DispatchError::Timeout(_)) => {
            let message = err.to_string();
            let response = (
                PROXY_FAILURE_STATUS,
                Json(json!({ "error": "Proxy server error", "message": message })),
            )
                .into_response();
            Verdict {
                status: PROXY_FAILURE_STATUS,
                response,
                message,
                partial: Bytes::new(),
            }
        }
    }
}

/// Record message for a failure after the response head was sent.
pub fn stream_failure(err: &StreamError) -> String {
    err.to_string()
}
