//! End-to-end proxy behaviour against mock upstreams.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::http::header::CONTENT_TYPE;
use axum::routing::get;
use axum::Router;
use futures_util::stream;
use openai_proxy::record::Outcome;
use reqwest::StatusCode;
use serde_json::json;
use tokio::sync::Notify;

mod common;

use common::MemorySink;

#[tokio::test]
async fn get_models_injects_fallback_credential() {
    let (upstream, seen) =
        common::start_fixed_upstream(200, "application/json", r#"{"object":"list","data":[]}"#).await;
    let sink = MemorySink::default();
    let (proxy, shutdown) = common::start_proxy(common::proxy_config(upstream, "sk-test"), sink.clone()).await;

    let res = common::client()
        .get(format!("http://{}/v1/models", proxy))
        .send()
        .await
        .expect("Proxy unreachable");

    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.headers()["content-type"], "application/json");
    assert_eq!(res.text().await.unwrap(), r#"{"object":"list","data":[]}"#);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].uri.path(), "/v1/models");
    assert_eq!(seen[0].headers["authorization"], "Bearer sk-test");

    let records = sink.wait_for(1).await;
    assert_eq!(records[0].response, Outcome::Parsed(json!({"object": "list", "data": []})));
    assert_eq!(records[0].status, Some(200));
    assert_eq!(records[0].url, "/v1/models");
    // The record shows what the caller sent, not the injected credential.
    assert!(!records[0].headers.contains_key("authorization"));

    shutdown.trigger();
}

#[tokio::test]
async fn upstream_error_is_forwarded_and_caller_key_kept() {
    let (upstream, seen) =
        common::start_fixed_upstream(401, "application/json", r#"{"error":"invalid_api_key"}"#).await;
    let sink = MemorySink::default();
    let (proxy, shutdown) = common::start_proxy(common::proxy_config(upstream, "sk-test"), sink.clone()).await;

    let res = common::client()
        .post(format!("http://{}/v1/chat/completions", proxy))
        .header("authorization", "Bearer caller-key")
        .header("content-type", "application/json")
        .body(r#"{"model":"gpt-4o","messages":[]}"#)
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(res.text().await.unwrap(), r#"{"error":"invalid_api_key"}"#);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0].headers["authorization"], "Bearer caller-key");
    assert_eq!(seen[0].body, Bytes::from_static(br#"{"model":"gpt-4o","messages":[]}"#));

    let records = sink.wait_for(1).await;
    assert_eq!(records[0].status, Some(401));
    assert_eq!(
        records[0].response,
        Outcome::error(r#"{"error":"invalid_api_key"}"#)
    );
    assert_eq!(
        records[0].body,
        openai_proxy::record::Payload::Json(json!({"model": "gpt-4o", "messages": []}))
    );

    shutdown.trigger();
}

#[tokio::test]
async fn unreachable_upstream_is_a_gateway_failure() {
    let sink = MemorySink::default();
    let (proxy, shutdown) =
        common::start_proxy(common::proxy_config(common::unused_addr(), "sk-test"), sink.clone()).await;

    let res = common::client()
        .get(format!("http://{}/v1/models", proxy))
        .send()
        .await
        .unwrap();

    assert_eq!(res.status(), StatusCode::BAD_GATEWAY);
    let body: serde_json::Value = serde_json::from_slice(&res.bytes().await.unwrap()).unwrap();
    assert_eq!(body["error"], "Proxy server error");
    assert!(body["message"].as_str().unwrap().starts_with("upstream request failed"));

    let records = sink.wait_for(1).await;
    match &records[0].response {
        Outcome::Error { message, partial } => {
            assert!(message.starts_with("upstream request failed"), "{message}");
            assert!(partial.is_empty());
        }
        other => panic!("expected error outcome, got {other:?}"),
    }
    assert_eq!(records[0].status, Some(502));

    shutdown.trigger();
}

#[tokio::test]
async fn non_json_body_is_relayed_and_recorded_raw() {
    let (upstream, _) = common::start_fixed_upstream(200, "text/plain", "pong").await;
    let sink = MemorySink::default();
    let (proxy, shutdown) = common::start_proxy(common::proxy_config(upstream, ""), sink.clone()).await;

    let res = common::client()
        .get(format!("http://{}/v1/ping", proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(res.text().await.unwrap(), "pong");

    let records = sink.wait_for(1).await;
    assert_eq!(records[0].response, Outcome::Raw(Bytes::from_static(b"pong")));

    shutdown.trigger();
}

#[tokio::test]
async fn status_endpoint_ignores_upstream() {
    let sink = MemorySink::default();
    let (proxy, shutdown) =
        common::start_proxy(common::proxy_config(common::unused_addr(), ""), sink.clone()).await;

    let res = common::client()
        .get(format!("http://{}/", proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert_eq!(
        res.text().await.unwrap(),
        r#"{"status":"OpenAI API Proxy Server is running"}"#
    );

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(sink.records().is_empty());

    shutdown.trigger();
}

#[tokio::test]
async fn empty_upstream_body_is_recorded_as_empty_raw() {
    let (upstream, _) = common::start_fixed_upstream(200, "text/plain", "").await;
    let sink = MemorySink::default();
    let (proxy, shutdown) = common::start_proxy(common::proxy_config(upstream, ""), sink.clone()).await;

    let res = common::client()
        .delete(format!("http://{}/v1/files/file-1", proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);
    assert!(res.bytes().await.unwrap().is_empty());

    let records = sink.wait_for(1).await;
    assert_eq!(records[0].response, Outcome::Raw(Bytes::new()));
    assert_eq!(records[0].method, reqwest::Method::DELETE);

    shutdown.trigger();
}

#[tokio::test]
async fn host_is_rederived_and_query_forwarded() {
    let (upstream, seen) = common::start_fixed_upstream(200, "application/json", "{}").await;
    let sink = MemorySink::default();
    let (proxy, shutdown) = common::start_proxy(common::proxy_config(upstream, ""), sink.clone()).await;

    let payload = "x".repeat(4096);
    let res = common::client()
        .post(format!("http://{}/v1/files?purpose=fine-tune", proxy))
        .header("x-custom", "kept")
        .body(payload.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(res.status(), StatusCode::OK);

    let seen = seen.lock().unwrap().clone();
    assert_eq!(seen[0].uri.path_and_query().unwrap().as_str(), "/v1/files?purpose=fine-tune");
    assert_eq!(seen[0].headers["host"], upstream.to_string());
    assert_eq!(seen[0].headers["x-custom"], "kept");
    assert_eq!(seen[0].headers["content-length"], "4096");
    assert_eq!(seen[0].body.len(), 4096);
    // No fallback credential configured: nothing injected.
    assert!(!seen[0].headers.contains_key("authorization"));

    let records = sink.wait_for(1).await;
    assert_eq!(records[0].url, "/v1/files?purpose=fine-tune");
    assert_eq!(records[0].headers["host"], proxy.to_string());

    shutdown.trigger();
}

#[tokio::test]
async fn streams_before_upstream_finishes() {
    let gate = Arc::new(Notify::new());
    let upstream_gate = gate.clone();
    let app = Router::new().route(
        "/v1/chat/completions",
        get(move || {
            let gate = upstream_gate.clone();
            async move {
                let first = stream::once(async { Ok::<_, std::io::Error>(Bytes::from_static(b"data: first\n\n")) });
                let second = stream::once(async move {
                    gate.notified().await;
                    Ok::<_, std::io::Error>(Bytes::from_static(b"data: [DONE]\n\n"))
                });
                (
                    [(CONTENT_TYPE, "text/event-stream")],
                    Body::from_stream(futures_util::StreamExt::chain(first, second)),
                )
            }
        }),
    );
    let upstream = common::start_upstream(app).await;
    let sink = MemorySink::default();
    let (proxy, shutdown) = common::start_proxy(common::proxy_config(upstream, ""), sink.clone()).await;

    let mut res = common::client()
        .get(format!("http://{}/v1/chat/completions", proxy))
        .send()
        .await
        .unwrap();
    assert_eq!(res.headers()["content-type"], "text/event-stream");

    // The first event arrives while upstream is still holding the second.
    let first = tokio::time::timeout(Duration::from_secs(2), res.chunk())
        .await
        .expect("first chunk should be relayed immediately")
        .unwrap()
        .unwrap();
    assert_eq!(first, Bytes::from_static(b"data: first\n\n"));
    assert!(sink.records().is_empty());

    gate.notify_one();
    let mut rest = Vec::new();
    while let Some(chunk) = res.chunk().await.unwrap() {
        rest.extend_from_slice(&chunk);
    }
    assert_eq!(rest, b"data: [DONE]\n\n");

    let records = sink.wait_for(1).await;
    assert_eq!(
        records[0].response,
        Outcome::Raw(Bytes::from_static(b"data: first\n\ndata: [DONE]\n\n"))
    );

    shutdown.trigger();
}
