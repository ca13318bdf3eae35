//! OpenAI API Proxy Library
//!
//! Forwards `/v1/*` requests to a configured upstream API host, injects a
//! fallback credential when the caller sent none, streams the upstream
//! response back as it arrives and captures one record per request.

pub mod config;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod proxy;
pub mod record;

pub use config::schema::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
