//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection (axum::serve)
//!     → CORS, access log (tower-http)
//!     → request.rs (request ID into extensions)
//!     → server.rs
//!         GET /        → response.rs (fixed status payload)
//!         ANY /v1/*    → proxy pipeline (crate::proxy)
//!     → Send to client (streamed)
//! ```

pub mod request;
pub mod response;
pub mod server;

pub use request::{request_id_middleware, RequestId, RequestIdExt, X_REQUEST_ID};
pub use response::RUNNING_MESSAGE;
pub use server::{AppState, HttpServer, ServerError};
