//! Request identification.
//!
//! # Responsibilities
//! - Reuse a caller-supplied `x-request-id` or mint a UUID v4
//! - Expose the id to handlers through request extensions
//! - Echo the id on the response unless upstream already set one
//!
//! # Design Decisions
//! - The inbound header map is not modified, so records and the outbound
//!   request see exactly what the caller sent

use axum::{
    body::Body,
    extract::Request,
    http::{HeaderMap, HeaderName, HeaderValue},
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

const MAX_REQUEST_ID_LEN: usize = 128;

/// Identifier attached to one inbound request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(String);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Take the caller's id when it is printable and reasonably short.
    pub fn from_headers(headers: &HeaderMap) -> Option<Self> {
        let value = headers.get(X_REQUEST_ID)?.to_str().ok()?.trim();
        if value.is_empty() || value.len() > MAX_REQUEST_ID_LEN {
            return None;
        }
        Some(Self(value.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access to the id stored by [`request_id_middleware`].
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&RequestId>;
}

impl<B> RequestIdExt for axum::http::Request<B> {
    fn request_id(&self) -> Option<&RequestId> {
        self.extensions().get::<RequestId>()
    }
}

pub async fn request_id_middleware(mut request: Request<Body>, next: Next) -> Response {
    let id = RequestId::from_headers(request.headers()).unwrap_or_default();
    request.extensions_mut().insert(id.clone());

    let mut response = next.run(request).await;
    if !response.headers().contains_key(X_REQUEST_ID) {
        if let Ok(value) = HeaderValue::from_str(id.as_str()) {
            response.headers_mut().insert(X_REQUEST_ID, value);
        }
    }
    response
}
