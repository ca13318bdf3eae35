//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate the upstream base URL and listener/metrics addresses
//! - Validate value ranges (body limit, capture cap)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::net::SocketAddr;

use thiserror::Error;
use url::Url;

use crate::config::schema::ProxyConfig;

/// A single semantic problem found in a configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("upstream.base_url '{0}' is not a valid URL: {1}")]
    InvalidBaseUrl(String, String),

    #[error("upstream.base_url must use http or https, got '{0}'")]
    UnsupportedScheme(String),

    #[error("upstream.base_url must not carry a query or fragment")]
    BaseUrlHasQuery,

    #[error("listener.bind_address '{0}' is not a socket address")]
    InvalidBindAddress(String),

    #[error("listener.max_body_size must be greater than zero")]
    ZeroBodyLimit,

    #[error("recording.max_capture_bytes must be greater than zero when set")]
    ZeroCaptureLimit,

    #[error("observability.metrics_address '{0}' is not a socket address")]
    InvalidMetricsAddress(String),
}

/// Validate a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    match Url::parse(&config.upstream.base_url) {
        Ok(url) => {
            if !matches!(url.scheme(), "http" | "https") {
                errors.push(ValidationError::UnsupportedScheme(url.scheme().to_string()));
            }
            if url.query().is_some() || url.fragment().is_some() {
                errors.push(ValidationError::BaseUrlHasQuery);
            }
        }
        Err(e) => errors.push(ValidationError::InvalidBaseUrl(
            config.upstream.base_url.clone(),
            e.to_string(),
        )),
    }

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::InvalidBindAddress(
            config.listener.bind_address.clone(),
        ));
    }

    if config.listener.max_body_size == 0 {
        errors.push(ValidationError::ZeroBodyLimit);
    }

    if config.recording.max_capture_bytes == Some(0) {
        errors.push(ValidationError::ZeroCaptureLimit);
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::InvalidMetricsAddress(
            config.observability.metrics_address.clone(),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
