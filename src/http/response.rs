//! Locally generated responses.
//!
//! Proxied responses are never built here: upstream status, headers and
//! body pass through the relay untouched. This module only answers the
//! liveness probe.

use axum::Json;
use serde::Serialize;

pub const RUNNING_MESSAGE: &str = "OpenAI API Proxy Server is running";

#[derive(Debug, Serialize)]
pub struct StatusPayload {
    pub status: &'static str,
}

/// `GET /`; answers without touching the upstream.
pub async fn status_handler() -> Json<StatusPayload> {
    Json(StatusPayload {
        status: RUNNING_MESSAGE,
    })
}
