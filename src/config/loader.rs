//! Configuration loading from disk and the process environment.

use std::fs;
use std::net::SocketAddr;
use std::path::Path;

use thiserror::Error;

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid environment variable {name}: {reason}")]
    Env { name: &'static str, reason: String },

    #[error("Validation failed: {}", join_errors(.0))]
    Validation(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// Load and validate configuration from a TOML file.
pub fn load_config(path: &Path) -> Result<ProxyConfig, ConfigError> {
    let content = fs::read_to_string(path)?;
    let config: ProxyConfig = toml::from_str(&content)?;

    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply the deployment environment on top of a loaded configuration.
///
/// Recognised variables: `PORT`, `OPENAI_API_BASE_URL`, `OPENAI_API_KEY`,
/// `LOG_REQUESTS`, `LOG_SINK`, `LOG_DIR`. `lookup` is usually
/// `|name| std::env::var(name).ok()`.
pub fn apply_env_overrides<F>(config: &mut ProxyConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(port) = lookup("PORT") {
        let port: u16 = port.trim().parse().map_err(|_| ConfigError::Env {
            name: "PORT",
            reason: format!("'{}' is not a port number", port),
        })?;
        let mut addr: SocketAddr =
            config
                .listener
                .bind_address
                .parse()
                .map_err(|_| ConfigError::Env {
                    name: "PORT",
                    reason: format!(
                        "bind address '{}' cannot take a port override",
                        config.listener.bind_address
                    ),
                })?;
        addr.set_port(port);
        config.listener.bind_address = addr.to_string();
    }

    if let Some(base_url) = lookup("OPENAI_API_BASE_URL") {
        config.upstream.base_url = base_url;
    }

    if let Some(api_key) = lookup("OPENAI_API_KEY") {
        config.upstream.api_key = api_key;
    }

    if let Some(flag) = lookup("LOG_REQUESTS") {
        config.recording.enabled = flag == "true";
    }

    if let Some(sink) = lookup("LOG_SINK") {
        config.recording.sink = sink
            .parse()
            .map_err(|reason| ConfigError::Env { name: "LOG_SINK", reason })?;
    }

    if let Some(dir) = lookup("LOG_DIR") {
        config.recording.directory = dir;
    }

    Ok(())
}
