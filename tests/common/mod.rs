//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{header::CONTENT_TYPE, HeaderMap, Method, StatusCode, Uri};
use axum::Router;
use openai_proxy::record::{ProxyRecord, RecordSink, SinkError};
use openai_proxy::{HttpServer, ProxyConfig, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Collects records in memory.
#[derive(Clone, Default)]
pub struct MemorySink {
    records: Arc<Mutex<Vec<ProxyRecord>>>,
}

impl MemorySink {
    pub fn records(&self) -> Vec<ProxyRecord> {
        self.records.lock().unwrap().clone()
    }

    /// Wait until at least `n` records arrived.
    pub async fn wait_for(&self, n: usize) -> Vec<ProxyRecord> {
        for _ in 0..500 {
            let records = self.records();
            if records.len() >= n {
                return records;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} records, got {}", n, self.records().len());
    }
}

impl RecordSink for MemorySink {
    fn emit<'a>(
        &'a self,
        record: &'a ProxyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        })
    }
}

/// One request as seen by a mock upstream.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

pub type SeenRequests = Arc<Mutex<Vec<SeenRequest>>>;

/// Serve `app` on an ephemeral port.
pub async fn start_upstream(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    addr
}

/// Upstream answering every path with a fixed reply and logging requests.
pub async fn start_fixed_upstream(
    status: u16,
    content_type: &'static str,
    body: &'static str,
) -> (SocketAddr, SeenRequests) {
    let seen: SeenRequests = Arc::default();
    let log = seen.clone();
    let app = Router::new().fallback(
        move |method: Method, uri: Uri, headers: HeaderMap, body_in: Bytes| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(SeenRequest {
                    method,
                    uri,
                    headers,
                    body: body_in,
                });
                (
                    StatusCode::from_u16(status).unwrap(),
                    [(CONTENT_TYPE, content_type)],
                    body,
                )
            }
        },
    );
    (start_upstream(app).await, seen)
}

/// Raw upstream that promises `declared_len` bytes, sends `partial`, then
/// closes the connection.
pub async fn start_truncating_upstream(partial: &'static str, declared_len: usize) -> SocketAddr {
    start_raw_upstream("200 OK", partial, declared_len, Duration::from_millis(50)).await
}

/// Raw upstream answering `status_line` (e.g. `"429 Too Many Requests"`),
/// promising `declared_len` bytes but sending only `partial`, then holding
/// the connection open for `hold` before closing it.
pub async fn start_raw_upstream(
    status_line: &'static str,
    partial: &'static str,
    declared_len: usize,
    hold: Duration,
) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
                let head = format!(
                    "HTTP/1.1 {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    status_line, declared_len
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(partial.as_bytes()).await;
                let _ = socket.flush().await;
                tokio::time::sleep(hold).await;
                let _ = socket.shutdown().await;
            });
        }
    });
    addr
}

/// Upstream that answers every path with `200 OK` after `delay`, logging
/// requests as they arrive.
pub async fn start_slow_upstream(delay: Duration) -> (SocketAddr, SeenRequests) {
    let seen: SeenRequests = Arc::default();
    let log = seen.clone();
    let app = Router::new().fallback(
        move |method: Method, uri: Uri, headers: HeaderMap, body_in: Bytes| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(SeenRequest {
                    method,
                    uri,
                    headers,
                    body: body_in,
                });
                tokio::time::sleep(delay).await;
                (StatusCode::OK, [(CONTENT_TYPE, "application/json")], "{}")
            }
        },
    );
    (start_upstream(app).await, seen)
}

/// An address nothing listens on.
pub fn unused_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

pub fn proxy_config(upstream: SocketAddr, api_key: &str) -> ProxyConfig {
    let mut config = ProxyConfig::default();
    config.listener.bind_address = "127.0.0.1:0".into();
    config.upstream.base_url = format!("http://{}", upstream);
    config.upstream.api_key = api_key.into();
    config.upstream.connect_timeout_secs = 2;
    config.recording.enabled = true;
    config
}

/// Start the proxy on an ephemeral port, recording into `sink`.
pub async fn start_proxy(config: ProxyConfig, sink: MemorySink) -> (SocketAddr, Shutdown) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = HttpServer::with_sink(config, Arc::new(sink)).unwrap();

    let shutdown = Shutdown::new();
    let server_shutdown = shutdown.subscribe();
    tokio::spawn(async move {
        let _ = server.run(listener, server_shutdown).await;
    });
    (addr, shutdown)
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}
