//! Outbound header preparation.
//!
//! # Responsibilities
//! - Inject the fallback credential when the caller sent none
//! - Strip `host` (re-derived from the target URL) and `content-length`
//!   (recomputed by the outbound transport)
//!
//! # Design Decisions
//! - Operates on a copy; the caller's headers are kept for the record
//! - `HeaderMap` names are case-insensitive, so `Host` and `HOST` are the
//!   same key; every other header keeps its order and multiplicity

use axum::http::header::{AUTHORIZATION, CONTENT_LENGTH, HOST};
use axum::http::{HeaderMap, HeaderValue};

/// Produce outbound headers from the caller's headers.
pub fn transform(inbound: &HeaderMap, fallback_credential: &str) -> HeaderMap {
    let mut outbound = inbound.clone();

    if !outbound.contains_key(AUTHORIZATION) && !fallback_credential.is_empty() {
        match HeaderValue::try_from(format!("Bearer {}", fallback_credential)) {
            Ok(mut value) => {
                value.set_sensitive(true);
                outbound.insert(AUTHORIZATION, value);
            }
            Err(_) => {
                tracing::warn!("Fallback credential is not a valid header value, not injecting");
            }
        }
    }

    outbound.remove(HOST);
    outbound.remove(CONTENT_LENGTH);
    outbound
}
