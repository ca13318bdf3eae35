//! Proxying pipeline.
//!
//! # Data Flow
//! ```text
//! inbound request
//!     → headers.rs (credential injection, host/content-length removal)
//!     → dispatch.rs (one outbound request, streamed response)
//!     → relay.rs (client body + accumulator, backpressured)
//!     → record::build → Recorder
//!
//! on failure at any stage:
//!     → classify.rs (status/body for the caller, message for the record)
//! ```
//!
//! # Design Decisions
//! - No state crosses requests; each request owns its buffers
//! - Configuration arrives through constructors, never from the environment

pub mod classify;
pub mod dispatch;
pub mod headers;
pub mod relay;

pub use classify::{IntakeError, Lifecycle, Phase, Verdict, PROXY_FAILURE_STATUS};
pub use dispatch::{ChunkStream, DispatchError, UpstreamDispatcher, UpstreamResponse};
pub use headers::transform;
pub use relay::{Accumulator, RelayOptions, RelayReport, StreamError, TeeRelay, RELAY_BUFFER_CHUNKS};
