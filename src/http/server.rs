//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with all handlers
//! - Wire up middleware (request ID, access log, CORS)
//! - Buffer the inbound body within the configured limit
//! - Run the proxy pipeline: transform → dispatch → relay → record
//! - Record requests whose caller left before any response head was sent
//! - Serve until the shutdown signal, letting in-flight relays finish

use axum::{
    body::{Body, Bytes},
    extract::State,
    http::Request,
    middleware,
    response::Response,
    routing::{any, get},
    Router,
};
use http_body_util::LengthLimitError;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::ProxyConfig;
use crate::http::request::{request_id_middleware, RequestIdExt};
use crate::http::response::status_handler;
use crate::lifecycle::shutdown;
use crate::observability::metrics;
use crate::proxy::{
    classify, headers, DispatchError, IntakeError, Lifecycle, Phase, RelayOptions, StreamError,
    TeeRelay, UpstreamDispatcher, Verdict,
};
use crate::record::{self, Capture, Completion, RecordSink, Recorder, RequestMeta};

/// Application state injected into handlers. Read-only after startup.
#[derive(Clone)]
pub struct AppState {
    pub dispatcher: UpstreamDispatcher,
    pub recorder: Recorder,
    pub fallback_credential: Arc<str>,
    pub max_body_size: usize,
    pub relay: RelayOptions,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to build upstream client: {0}")]
    Client(#[from] reqwest::Error),
}

/// HTTP server for the proxy.
pub struct HttpServer {
    router: Router,
    config: ProxyConfig,
}

impl HttpServer {
    /// Create a server whose record sink follows `config.recording`.
    pub fn new(config: ProxyConfig) -> Result<Self, ServerError> {
        let recorder = Recorder::from_config(&config.recording);
        Self::with_recorder(config, recorder)
    }

    /// Create a server that records every request into `sink`, regardless
    /// of `config.recording.enabled`.
    pub fn with_sink(config: ProxyConfig, sink: Arc<dyn RecordSink>) -> Result<Self, ServerError> {
        Self::with_recorder(config, Recorder::new(sink))
    }

    fn with_recorder(config: ProxyConfig, recorder: Recorder) -> Result<Self, ServerError> {
        let dispatcher = UpstreamDispatcher::new(&config.upstream)?;

        let state = AppState {
            dispatcher,
            relay: RelayOptions {
                capture: recorder.is_enabled(),
                capture_limit: config.recording.max_capture_bytes,
                idle_timeout: config.upstream.idle_timeout(),
            },
            recorder,
            fallback_credential: Arc::from(config.upstream.api_key.as_str()),
            max_body_size: config.listener.max_body_size,
        };

        let router = Self::build_router(state);
        Ok(Self { router, config })
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(state: AppState) -> Router {
        Router::new()
            .route("/", get(status_handler))
            // `{*path}` never matches an empty tail.
            .route("/v1/", any(proxy_handler))
            .route("/v1/{*path}", any(proxy_handler))
            .with_state(state)
            .layer(middleware::from_fn(request_id_middleware))
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::permissive())
    }

    /// Run the server, accepting connections on the given listener.
    pub async fn run(
        self,
        listener: TcpListener,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<(), std::io::Error> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            upstream = %self.config.upstream.base_url,
            recording = self.config.recording.enabled,
            "HTTP server starting"
        );

        axum::serve(listener, self.router)
            .with_graceful_shutdown(shutdown::wait(shutdown))
            .await?;

        tracing::info!("HTTP server stopped");
        Ok(())
    }

    /// The configured router, for driving the server without a socket.
    pub fn router(&self) -> Router {
        self.router.clone()
    }
}

/// Metrics status label for a request the caller abandoned before any
/// response head was sent (nginx's "client closed request").
const CLIENT_CLOSED_STATUS: u16 = 499;

/// Main proxy handler.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let start = Instant::now();
    let request_id = request
        .request_id()
        .map(ToString::to_string)
        .unwrap_or_else(|| "unknown".to_string());
    let mut lifecycle = Lifecycle::new(request_id.clone());

    let (parts, body) = request.into_parts();
    let url = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| parts.uri.path().to_string());
    let mut meta = RequestMeta::new(request_id, parts.method, url, parts.headers, Bytes::new());

    // Hyper drops this future if the caller disconnects; the guard then
    // records the request in whatever phase it reached.
    let mut guard = AbandonGuard::new(&state.recorder, start);
    guard.track(&meta, lifecycle.phase());

    match read_body(body, state.max_body_size).await {
        Ok(body) => meta.body = body,
        Err(err) => {
            guard.disarm();
            lifecycle.advance(Phase::Rejected);
            tracing::warn!(request_id = %meta.request_id, url = %meta.url, error = %err, "Rejected request");
            return finish_early(&state, meta, classify::intake_failure(&err), lifecycle.phase(), start);
        }
    }

    let outbound = headers::transform(&meta.headers, &state.fallback_credential);
    let target = state.dispatcher.target_url(&meta.url);
    lifecycle.advance(Phase::Dispatching);
    guard.track(&meta, lifecycle.phase());
    tracing::info!(
        request_id = %meta.request_id,
        method = %meta.method,
        target = %target,
        "Proxying request"
    );

    let dispatched = state
        .dispatcher
        .dispatch(meta.method.clone(), &target, outbound, meta.body.clone())
        .await;
    guard.disarm();

    let upstream = match dispatched {
        Ok(upstream) => upstream,
        Err(err) => {
            lifecycle.advance(Phase::DispatchFailed);
            match &err {
                DispatchError::Upstream { status, .. } => {
                    tracing::warn!(request_id = %meta.request_id, status = %status, "Upstream returned an error")
                }
                _ => tracing::error!(request_id = %meta.request_id, error = %err, "Proxy error"),
            }
            let verdict = classify::dispatch_failure(err);
            return finish_early(&state, meta, verdict, lifecycle.phase(), start);
        }
    };

    lifecycle.advance(Phase::Streaming);
    let (response, relay) = TeeRelay::start(upstream, &state.relay);
    let recorder = state.recorder.clone();

    tokio::spawn(async move {
        let report = relay.run().await;
        metrics::record_relayed_bytes(report.bytes_relayed);

        let completion = match report.result {
            Ok(()) => {
                lifecycle.advance(Phase::Completed);
                tracing::debug!(
                    request_id = %meta.request_id,
                    bytes = report.bytes_relayed,
                    "Relay completed"
                );
                Completion::Body(report.capture)
            }
            Err(err) => {
                lifecycle.advance(Phase::StreamFailed);
                tracing::error!(
                    request_id = %meta.request_id,
                    bytes = report.bytes_relayed,
                    error = %err,
                    "Error in response stream"
                );
                Completion::Failed {
                    message: classify::stream_failure(&err),
                    partial: report.capture,
                }
            }
        };

        metrics::record_request(
            meta.method.as_str(),
            report.status.as_u16(),
            lifecycle.phase().as_str(),
            start,
        );
        if recorder.is_enabled() {
            recorder.submit(record::build(meta, Some(report.status), completion));
        }
    });

    response
}

/// Answer a request that never reached the relay, and record it.
fn finish_early(
    state: &AppState,
    meta: RequestMeta,
    verdict: Verdict,
    phase: Phase,
    start: Instant,
) -> Response {
    metrics::record_request(meta.method.as_str(), verdict.status.as_u16(), phase.as_str(), start);
    if state.recorder.is_enabled() {
        let completion = Completion::Failed {
            message: verdict.message,
            partial: Capture::new(verdict.partial),
        };
        state.recorder.submit(record::build(meta, Some(verdict.status), completion));
    }
    verdict.response
}

/// Records a request whose handler is dropped before a response head exists.
struct AbandonGuard {
    recorder: Recorder,
    pending: Option<(RequestMeta, Phase)>,
    start: Instant,
}

impl AbandonGuard {
    fn new(recorder: &Recorder, start: Instant) -> Self {
        Self {
            recorder: recorder.clone(),
            pending: None,
            start,
        }
    }

    fn track(&mut self, meta: &RequestMeta, phase: Phase) {
        self.pending = Some((meta.clone(), phase));
    }

    fn disarm(&mut self) {
        self.pending = None;
    }
}

impl Drop for AbandonGuard {
    fn drop(&mut self) {
        let Some((meta, phase)) = self.pending.take() else {
            return;
        };
        debug_assert!(phase.can_advance_to(Phase::Abandoned));
        tracing::warn!(
            request_id = %meta.request_id,
            phase = phase.as_str(),
            "Client disconnected before a response was sent"
        );
        metrics::record_request(
            meta.method.as_str(),
            CLIENT_CLOSED_STATUS,
            Phase::Abandoned.as_str(),
            self.start,
        );
        if self.recorder.is_enabled() && tokio::runtime::Handle::try_current().is_ok() {
            let completion = Completion::failed(StreamError::ClientDisconnected.to_string());
            self.recorder.submit(record::build(meta, None, completion));
        }
    }
}

async fn read_body(body: Body, limit: usize) -> Result<Bytes, IntakeError> {
    axum::body::to_bytes(body, limit).await.map_err(|e| {
        let inner = e.into_inner();
        if inner.is::<LengthLimitError>() {
            IntakeError::TooLarge(limit)
        } else {
            IntakeError::Read(inner.to_string())
        }
    })
}
