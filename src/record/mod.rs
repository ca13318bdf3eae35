//! Request/response capture subsystem.
//!
//! # Data Flow
//! ```text
//! RequestMeta (caller's request, as received)
//!     + Completion (captured body | failure message)
//!     → builder.rs (decode attempt, assemble ProxyRecord)
//!     → sink.rs Recorder (spawned, fire-and-forget)
//!     → ConsoleSink | FileSink
//! ```
//!
//! # Design Decisions
//! - Exactly one record per request when recording is enabled
//! - Decode failure falls back to raw bytes; building never fails
//! - Sink failures are logged and otherwise ignored

pub mod builder;
pub mod model;
pub mod sink;

pub use builder::{build, Capture, Completion};
pub use model::{Outcome, Payload, ProxyRecord, RequestMeta};
pub use sink::{ConsoleSink, FileSink, RecordSink, Recorder, SinkError};
