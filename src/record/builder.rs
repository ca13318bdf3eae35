//! Record assembly.
//!
//! Combines the caller's request, as received, with whatever the exchange
//! produced. Building never fails: undecodable bodies are kept raw.

use axum::http::StatusCode;
use bytes::Bytes;
use chrono::Utc;

use super::model::{Outcome, Payload, ProxyRecord, RequestMeta};

/// Response bytes captured during a relay.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Capture {
    pub bytes: Bytes,
    /// The capture cap was hit; `bytes` is a prefix of what was relayed.
    pub truncated: bool,
}

impl Capture {
    pub fn new(bytes: Bytes) -> Self {
        Self {
            bytes,
            truncated: false,
        }
    }
}

/// Terminal event of one request.
#[derive(Debug)]
pub enum Completion {
    /// Upstream body relayed to the end.
    Body(Capture),
    /// The request failed; `partial` holds bytes relayed before the failure.
    Failed { message: String, partial: Capture },
}

impl Completion {
    pub fn failed(message: impl Into<String>) -> Self {
        Completion::Failed {
            message: message.into(),
            partial: Capture::default(),
        }
    }
}

/// Build the record for a finished request.
pub fn build(meta: RequestMeta, status: Option<StatusCode>, completion: Completion) -> ProxyRecord {
    let (response, truncated) = match completion {
        Completion::Body(capture) => (Outcome::from(Payload::decode(capture.bytes)), capture.truncated),
        Completion::Failed { message, partial } => (
            Outcome::Error {
                message,
                partial: partial.bytes,
            },
            partial.truncated,
        ),
    };

    ProxyRecord {
        timestamp: Utc::now(),
        duration_ms: meta.received_at.elapsed().as_millis() as u64,
        request_id: meta.request_id,
        method: meta.method,
        url: meta.url,
        headers: meta.headers,
        body: Payload::decode(meta.body),
        status: status.map(|s| s.as_u16()),
        response,
        truncated,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, HeaderValue, Method};
    use serde_json::json;

    fn meta() -> RequestMeta {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer caller"));
        RequestMeta::new(
            "req-7",
            Method::POST,
            "/v1/chat/completions?x=1",
            headers,
            Bytes::from_static(br#"{"model":"gpt"}"#),
        )
    }

    #[test]
    fn decodable_body_becomes_parsed() {
        let record = build(
            meta(),
            Some(StatusCode::OK),
            Completion::Body(Capture::new(Bytes::from_static(br#"{"object":"list","data":[]}"#))),
        );
        assert_eq!(record.response, Outcome::Parsed(json!({"object": "list", "data": []})));
        assert_eq!(record.status, Some(200));
        assert_eq!(record.body, Payload::Json(json!({"model": "gpt"})));
    }

    #[test]
    fn request_side_is_kept_as_received() {
        let record = build(meta(), None, Completion::failed("refused"));
        assert_eq!(record.url, "/v1/chat/completions?x=1");
        assert_eq!(record.method, Method::POST);
        assert_eq!(record.headers["authorization"], "Bearer caller");
        assert_eq!(record.request_id, "req-7");
    }

    #[test]
    fn empty_body_is_raw_not_error() {
        let record = build(meta(), Some(StatusCode::OK), Completion::Body(Capture::default()));
        assert_eq!(record.response, Outcome::Raw(Bytes::new()));
        assert!(!record.response.is_error());
    }

    #[test]
    fn failure_keeps_partial_bytes() {
        let record = build(
            meta(),
            Some(StatusCode::OK),
            Completion::Failed {
                message: "upstream reset".into(),
                partial: Capture {
                    bytes: Bytes::from_static(b"data: {"),
                    truncated: true,
                },
            },
        );
        assert_eq!(
            record.response,
            Outcome::Error {
                message: "upstream reset".into(),
                partial: Bytes::from_static(b"data: {"),
            }
        );
        assert!(record.truncated);
    }
}
