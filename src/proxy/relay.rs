//! Tee stream relay.
//!
//! # Data Flow
//! ```text
//! upstream ChunkStream ──next()──▶ TeeRelay::run ──bounded mpsc──▶ client Body
//!                                        │
//!                                        └──append──▶ Accumulator ──▶ RelayReport
//! ```
//!
//! # Design Decisions
//! - Response head (status + headers) is fixed in `start`, before any chunk
//! - The channel holds at most `RELAY_BUFFER_CHUNKS` chunks; a slow client
//!   stalls `send`, which stalls upstream reads
//! - A chunk is captured only after the client side accepted it
//! - `run` returns once with either a clean end or a `StreamError`
//! - A dropped client body closes the channel; the relay stops reading and
//!   drops the upstream stream, which aborts the upstream transfer

use std::io;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Response, StatusCode};
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::proxy::dispatch::{ChunkStream, UpstreamResponse};
use crate::record::Capture;

/// Chunks allowed in flight between upstream and the client connection.
pub const RELAY_BUFFER_CHUNKS: usize = 8;

/// Failure after the response head was sent.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StreamError {
    #[error("upstream stream failed: {0}")]
    Upstream(String),

    #[error("no data from upstream for {0:?}")]
    IdleTimeout(Duration),

    #[error("client disconnected before the response completed")]
    ClientDisconnected,
}

/// Append-only copy of everything relayed to the client.
///
/// With a cap, bytes past the cap are still relayed but not kept, and the
/// capture is flagged truncated.
#[derive(Debug)]
pub struct Accumulator {
    buf: BytesMut,
    enabled: bool,
    limit: Option<usize>,
    truncated: bool,
}

impl Accumulator {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            buf: BytesMut::new(),
            enabled: true,
            limit,
            truncated: false,
        }
    }

    /// An accumulator that keeps nothing (recording disabled).
    pub fn disabled() -> Self {
        Self {
            buf: BytesMut::new(),
            enabled: false,
            limit: None,
            truncated: false,
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        if !self.enabled || self.truncated {
            return;
        }
        match self.limit {
            Some(limit) if self.buf.len() + chunk.len() > limit => {
                let room = limit - self.buf.len();
                self.buf.extend_from_slice(&chunk[..room]);
                self.truncated = true;
            }
            _ => self.buf.extend_from_slice(chunk),
        }
    }

    pub fn finish(self) -> Capture {
        Capture {
            bytes: self.buf.freeze(),
            truncated: self.truncated,
        }
    }
}

/// Relay tuning.
#[derive(Debug, Clone, Default)]
pub struct RelayOptions {
    /// Keep a copy of the relayed bytes.
    pub capture: bool,
    /// Capture cap in bytes.
    pub capture_limit: Option<usize>,
    /// Give up after this long without an upstream chunk.
    pub idle_timeout: Option<Duration>,
}

/// How a relay ended.
#[derive(Debug)]
pub struct RelayReport {
    pub status: StatusCode,
    pub capture: Capture,
    pub bytes_relayed: u64,
    pub result: Result<(), StreamError>,
}

/// Moves one upstream body to the client while capturing it.
pub struct TeeRelay {
    status: StatusCode,
    upstream: ChunkStream,
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    accumulator: Accumulator,
    idle_timeout: Option<Duration>,
}

impl TeeRelay {
    /// Split an upstream response into the client response and the relay
    /// that feeds its body. The response head is copied here, once.
    pub fn start(upstream: UpstreamResponse, options: &RelayOptions) -> (Response<Body>, TeeRelay) {
        let (tx, rx) = mpsc::channel(RELAY_BUFFER_CHUNKS);

        let mut response = Response::new(Body::from_stream(ReceiverStream::new(rx)));
        *response.status_mut() = upstream.status;
        *response.headers_mut() = upstream.headers;

        let accumulator = if options.capture {
            Accumulator::new(options.capture_limit)
        } else {
            Accumulator::disabled()
        };

        let relay = TeeRelay {
            status: upstream.status,
            upstream: upstream.body,
            tx,
            accumulator,
            idle_timeout: options.idle_timeout,
        };
        (response, relay)
    }

    /// Relay until the upstream ends, fails, or the client goes away.
    pub async fn run(mut self) -> RelayReport {
        let mut bytes_relayed = 0u64;

        let result = loop {
            let next = tokio::select! {
                biased;
                _ = self.tx.closed() => break Err(StreamError::ClientDisconnected),
                next = next_chunk(&mut self.upstream, self.idle_timeout) => next,
            };

            match next {
                Ok(Some(chunk)) => {
                    if chunk.is_empty() {
                        continue;
                    }
                    if self.tx.send(Ok(chunk.clone())).await.is_err() {
                        break Err(StreamError::ClientDisconnected);
                    }
                    bytes_relayed += chunk.len() as u64;
                    self.accumulator.append(&chunk);
                }
                Ok(None) => break Ok(()),
                Err(err) => {
                    // An error item makes the server abort the connection
                    // instead of ending the body cleanly.
                    let _ = self.tx.send(Err(io::Error::other(err.to_string()))).await;
                    break Err(err);
                }
            }
        };

        drop(self.upstream);

        RelayReport {
            status: self.status,
            capture: self.accumulator.finish(),
            bytes_relayed,
            result,
        }
    }
}

/// Next upstream chunk, or `IdleTimeout` when none arrives within `idle_timeout`.
pub(crate) async fn next_chunk(
    upstream: &mut ChunkStream,
    idle_timeout: Option<Duration>,
) -> Result<Option<Bytes>, StreamError> {
    let next = match idle_timeout {
        Some(limit) => tokio::time::timeout(limit, upstream.next())
            .await
            .map_err(|_| StreamError::IdleTimeout(limit))?,
        None => upstream.next().await,
    };
    next.transpose()
}
