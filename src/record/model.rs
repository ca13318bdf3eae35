//! Captured request/response record types.

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::ser::{SerializeMap, Serializer};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;

/// A body that was decoded as JSON when possible and kept raw otherwise.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),
    Raw(Bytes),
}

impl Payload {
    /// Decode `bytes` as JSON, falling back to the raw bytes.
    ///
    /// Decode failure is an expected branch, never an error.
    pub fn decode(bytes: Bytes) -> Self {
        match serde_json::from_slice::<Value>(&bytes) {
            Ok(value) => Payload::Json(value),
            Err(_) => Payload::Raw(bytes),
        }
    }
}

impl Serialize for Payload {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Payload::Json(value) => value.serialize(serializer),
            Payload::Raw(bytes) => {
                let mut map = serializer.serialize_map(Some(1))?;
                map.serialize_entry("raw", &String::from_utf8_lossy(bytes))?;
                map.end()
            }
        }
    }
}

/// How the exchange ended, as seen by the record.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Outcome {
    /// Upstream body decoded as structured data.
    Parsed(Value),
    /// Upstream body that did not decode; kept verbatim.
    Raw(#[serde(serialize_with = "lossy_utf8")] Bytes),
    /// The exchange failed; `partial` holds whatever was relayed first.
    Error {
        message: String,
        #[serde(
            serialize_with = "lossy_utf8",
            skip_serializing_if = "Bytes::is_empty"
        )]
        partial: Bytes,
    },
}

impl Outcome {
    pub fn error(message: impl Into<String>) -> Self {
        Outcome::Error {
            message: message.into(),
            partial: Bytes::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Outcome::Error { .. })
    }
}

impl From<Payload> for Outcome {
    fn from(payload: Payload) -> Self {
        match payload {
            Payload::Json(value) => Outcome::Parsed(value),
            Payload::Raw(bytes) => Outcome::Raw(bytes),
        }
    }
}

/// What the caller sent, exactly as received.
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub request_id: String,
    pub method: Method,
    /// Path and query as received.
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub received_at: Instant,
}

impl RequestMeta {
    pub fn new(
        request_id: impl Into<String>,
        method: Method,
        url: impl Into<String>,
        headers: HeaderMap,
        body: Bytes,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            method,
            url: url.into(),
            headers,
            body,
            received_at: Instant::now(),
        }
    }
}

/// One captured request/response pair.
#[derive(Debug, Clone, Serialize)]
pub struct ProxyRecord {
    pub timestamp: DateTime<Utc>,
    pub request_id: String,
    #[serde(serialize_with = "serialize_method")]
    pub method: Method,
    pub url: String,
    #[serde(serialize_with = "serialize_headers")]
    pub headers: HeaderMap,
    pub body: Payload,
    /// Status sent to the caller, when one was sent.
    pub status: Option<u16>,
    pub duration_ms: u64,
    pub response: Outcome,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
}

fn lossy_utf8<S: Serializer>(bytes: &Bytes, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&String::from_utf8_lossy(bytes))
}

fn serialize_method<S: Serializer>(method: &Method, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(method.as_str())
}

/// Headers as a JSON object; names with several values become arrays.
fn serialize_headers<S: Serializer>(headers: &HeaderMap, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(headers.keys_len()))?;
    for name in headers.keys() {
        let mut values = headers
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned());
        let first = values.next().unwrap_or_default();
        let rest: Vec<String> = values.collect();
        if rest.is_empty() {
            map.serialize_entry(name.as_str(), &first)?;
        } else {
            let mut all = Vec::with_capacity(rest.len() + 1);
            all.push(first);
            all.extend(rest);
            map.serialize_entry(name.as_str(), &all)?;
        }
    }
    map.end()
}
