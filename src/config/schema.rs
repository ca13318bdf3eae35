//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Upstream used when nothing else is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com";

/// Documented request body ceiling (50 MiB).
pub const DEFAULT_MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, body limit).
    pub listener: ListenerConfig,

    /// Upstream API host and credentials.
    pub upstream: UpstreamConfig,

    /// Request/response capture settings.
    pub recording: RecordingConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:3000").
    pub bind_address: String,

    /// Maximum accepted request body in bytes.
    pub max_body_size: usize,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:3000".to_string(),
            max_body_size: DEFAULT_MAX_BODY_SIZE,
        }
    }
}

/// Upstream API configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL requests are forwarded to; the inbound path is appended.
    pub base_url: String,

    /// Fallback credential injected as `Bearer <api_key>` when the caller
    /// sends no `authorization` header. Empty disables injection.
    pub api_key: String,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,

    /// Time allowed for upstream response headers in seconds (0 = no limit).
    pub response_timeout_secs: u64,

    /// Abort a relay after this many seconds without upstream bytes.
    pub idle_timeout_secs: Option<u64>,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            api_key: String::new(),
            connect_timeout_secs: 10,
            response_timeout_secs: 300,
            idle_timeout_secs: None,
        }
    }
}

impl UpstreamConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Option<Duration> {
        (self.response_timeout_secs > 0).then(|| Duration::from_secs(self.response_timeout_secs))
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Where captured records go.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    /// One JSON line per record on stdout.
    #[default]
    Console,
    /// One JSON file per record under `RecordingConfig::directory`.
    File,
}

impl std::str::FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "console" => Ok(SinkKind::Console),
            "file" => Ok(SinkKind::File),
            other => Err(format!("unknown record sink '{}'", other)),
        }
    }
}

/// Request/response capture configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Produce one record per proxied request.
    pub enabled: bool,

    /// Record destination.
    pub sink: SinkKind,

    /// Output directory for the file sink.
    pub directory: String,

    /// Stop capturing response bytes past this size (relay is unaffected).
    pub max_capture_bytes: Option<usize>,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            sink: SinkKind::Console,
            directory: "logs".to_string(),
            max_capture_bytes: None,
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log output format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}
