//! End-to-end tests for the relay's HTTP surface
//!
//! Drives the router in-process with `tower::ServiceExt::oneshot`:
//! - Pause lock acquire/query/release
//! - Backlog replay and live fan-out over SSE
//! - Crypto gate: encrypted and signed ingest, rejected payloads
//! - Storage failures surfacing as errors

use std::sync::Arc;
use std::time::Duration;

use axum::body::{to_bytes, Body};
use axum::http::{header, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use ed25519_dalek::Signer;
use futures::StreamExt;
use relay::broadcast::{BroadcastChannel, BroadcastConfig};
use relay::crypto::{generate_signing_key, CryptoConfig, CryptoGate, SymmetricKey};
use relay::locks::{FsLockStore, LockStore, MemoryLockStore};
use relay::router::create_router;
use relay::state::AppState;
use serde_json::Value;
use tower::ServiceExt;
use types::ids::LockId;

fn state_with(gate: CryptoGate, locks: Arc<dyn LockStore>) -> AppState {
    AppState::new(
        BroadcastChannel::new(BroadcastConfig {
            backlog_capacity: 10,
            subscriber_queue: 16,
        }),
        gate,
        locks,
    )
}

fn plain_state() -> AppState {
    state_with(CryptoGate::passthrough(), Arc::new(MemoryLockStore::new()))
}

fn app(state: &AppState) -> Router {
    create_router(state.clone(), 16)
}

fn form_post(uri: &str, body: impl Into<Body>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body.into())
        .unwrap()
}

fn empty(method: &str, uri: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .body(Body::empty())
        .unwrap()
}

async fn json_body(response: Response) -> Value {
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn next_frame(body: &mut axum::body::BodyDataStream) -> String {
    let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
        .await
        .expect("frame within timeout")
        .expect("stream open")
        .expect("frame bytes");
    String::from_utf8(chunk.to_vec()).unwrap()
}

#[tokio::test]
async fn acquire_returns_lock_and_stop() {
    let state = plain_state();

    let response = app(&state)
        .oneshot(empty("PATCH", "/pauses/abc123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::X_CONTENT_TYPE_OPTIONS],
        "nosniff"
    );
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"lock": true, "stop": true})
    );

    let id = LockId::new("abc123").unwrap();
    assert!(state.locks.exists(&id).await.unwrap());

    // Repeating the call yields the same shape and still one record.
    let response = app(&state)
        .oneshot(empty("PATCH", "/pauses/abc123"))
        .await
        .unwrap();
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"lock": true, "stop": true})
    );
}

#[tokio::test]
async fn pause_lifecycle() {
    let state = plain_state();
    let mut console = state.channel.subscribe();

    let response = app(&state)
        .oneshot(form_post(
            "/pauses",
            "id=p1&body=waiting&file_path=/srv/app.php&file_line=7",
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers()[header::LOCATION], "/pauses/p1");
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"lock": true, "stop": false})
    );

    let announced = console.try_recv().expect("pause announced");
    let doc: Value = serde_json::from_slice(&announced.payload).unwrap();
    assert_eq!(doc["action"], "pause");
    assert_eq!(doc["id"], "p1");
    assert_eq!(doc["file_display_short"], "app.php:7");

    let response = app(&state).oneshot(empty("GET", "/pauses/p1")).await.unwrap();
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"lock": true, "stop": false})
    );

    app(&state).oneshot(empty("PATCH", "/pauses/p1")).await.unwrap();
    let response = app(&state).oneshot(empty("GET", "/pauses/p1")).await.unwrap();
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"lock": true, "stop": true})
    );

    for _ in 0..2 {
        let response = app(&state)
            .oneshot(empty("DELETE", "/pauses/p1"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
    }
    let response = app(&state).oneshot(empty("GET", "/pauses/p1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn pause_requires_valid_id() {
    let state = plain_state();

    let response = app(&state)
        .oneshot(form_post("/pauses", "body=no-id"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = app(&state)
        .oneshot(empty("PATCH", "/pauses/a%2Fb"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(state.channel.stats().published, 0);
}

#[tokio::test]
async fn late_console_receives_backlog_over_sse() {
    let state = plain_state();

    let response = app(&state)
        .oneshot(form_post("/messages", "body=E1&topic=boot"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = app(&state).oneshot(empty("GET", "/stream")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()[header::CONTENT_TYPE],
        "text/event-stream"
    );
    assert_eq!(state.channel.subscriber_count(), 1);

    let mut body = response.into_body().into_data_stream();
    let frame = next_frame(&mut body).await;
    assert!(frame.contains("id: 1\n"), "{}", frame);
    assert!(frame.contains("event: boot\n"), "{}", frame);
    assert!(frame.contains(r#""message":"E1""#), "{}", frame);

    app(&state)
        .oneshot(form_post("/messages", "body=E2"))
        .await
        .unwrap();
    let frame = next_frame(&mut body).await;
    assert!(frame.contains("id: 2\n"), "{}", frame);
    assert!(frame.contains("event: message\n"), "{}", frame);

    drop(body);
    assert_eq!(state.channel.subscriber_count(), 0);
}

#[tokio::test]
async fn every_console_receives_live_events() {
    let state = plain_state();
    let mut s1 = state.channel.subscribe();
    let mut s2 = state.channel.subscribe();

    app(&state)
        .oneshot(form_post("/messages", "body=E2"))
        .await
        .unwrap();

    let e1 = s1.try_recv().unwrap();
    let e2 = s2.try_recv().unwrap();
    assert_eq!(e1, e2);
    let doc: Value = serde_json::from_slice(&e1.payload).unwrap();
    assert_eq!(doc["message"], "E2");
    assert_eq!(doc["action"], "message");
}

#[tokio::test]
async fn empty_form_is_rejected() {
    let state = plain_state();
    let response = app(&state)
        .oneshot(form_post("/messages", ""))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(json_body(response).await["error"], "BAD_REQUEST");
}

#[tokio::test]
async fn script_tags_never_reach_consoles() {
    let state = plain_state();
    let mut console = state.channel.subscribe();

    app(&state)
        .oneshot(form_post(
            "/messages",
            "body=hi%3Cscript%3Ealert(1)%3C%2Fscript%3E",
        ))
        .await
        .unwrap();

    let doc: Value = serde_json::from_slice(&console.try_recv().unwrap().payload).unwrap();
    assert_eq!(doc["message"], "hi");
}

#[tokio::test]
async fn encrypted_ingest_delivers_plaintext_and_drops_corruption() {
    let gate = CryptoGate::new(&CryptoConfig {
        symmetric_key: Some(SymmetricKey::generate()),
        verifying_key: None,
    });
    let envelope = gate.seal(b"body=E3&topic=secret").unwrap();
    let state = state_with(gate, Arc::new(MemoryLockStore::new()));
    let mut console = state.channel.subscribe();

    let response = app(&state)
        .oneshot(form_post("/messages", envelope.clone()))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let event = console.try_recv().expect("decrypted event delivered");
    assert_eq!(event.topic, "secret");
    let doc: Value = serde_json::from_slice(&event.payload).unwrap();
    assert_eq!(doc["message"], "E3");

    let mut bytes = BASE64_STANDARD.decode(&envelope).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    let corrupted = BASE64_STANDARD.encode(bytes);

    let response = app(&state)
        .oneshot(form_post("/messages", corrupted))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(console.try_recv().is_none());
    assert_eq!(state.channel.stats().published, 1);

    // Plaintext is not accepted once a key is configured.
    let response = app(&state)
        .oneshot(form_post("/messages", "body=plain"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(console.try_recv().is_none());
}

fn signed(request: Request<Body>, signature: &str) -> Request<Body> {
    let mut request = request;
    request
        .headers_mut()
        .insert("x-signature", signature.parse().unwrap());
    request
}

#[tokio::test]
async fn signed_ingest_requires_valid_signature() {
    let signing = generate_signing_key();
    let gate = CryptoGate::new(&CryptoConfig {
        symmetric_key: None,
        verifying_key: Some(signing.verifying_key()),
    });
    let state = state_with(gate, Arc::new(MemoryLockStore::new()));
    let mut console = state.channel.subscribe();
    let body = "file_line=7&body=hello";
    // Sorted keys, each followed by its value.
    let good = BASE64_STANDARD.encode(signing.sign(b"bodyhellofile_line7").to_bytes());

    let response = app(&state)
        .oneshot(form_post("/messages", body))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(json_body(response).await["error"], "UNAUTHORIZED");

    // A signature over the raw body bytes is not the signed message.
    let raw = BASE64_STANDARD.encode(signing.sign(body.as_bytes()).to_bytes());
    let response = app(&state)
        .oneshot(signed(form_post("/messages", body), &raw))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&state)
        .oneshot(signed(form_post("/messages", body), "not base64!"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(console.try_recv().is_none());

    let response = app(&state)
        .oneshot(signed(form_post("/messages", body), &good))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let doc: Value = serde_json::from_slice(&console.try_recv().unwrap().payload).unwrap();
    assert_eq!(doc["message"], "hello");
    assert_eq!(doc["file_line"], "7");

    // Field order on the wire does not matter.
    let response = app(&state)
        .oneshot(signed(form_post("/messages", "body=hello&file_line=7"), &good))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn signed_pause_poll() {
    let signing = generate_signing_key();
    let gate = CryptoGate::new(&CryptoConfig {
        symmetric_key: None,
        verifying_key: Some(signing.verifying_key()),
    });
    let state = state_with(gate, Arc::new(MemoryLockStore::new()));
    let sign = |message: &[u8]| BASE64_STANDARD.encode(signing.sign(message).to_bytes());

    let response = app(&state)
        .oneshot(signed(form_post("/pauses", "id=s1&body=wait"), &sign(b"bodywaitids1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);

    let response = app(&state).oneshot(empty("GET", "/pauses/s1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app(&state)
        .oneshot(signed(empty("GET", "/pauses/s1"), &sign(b"")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        json_body(response).await,
        serde_json::json!({"lock": true, "stop": false})
    );

    let response = app(&state)
        .oneshot(signed(empty("GET", "/pauses/s1?t=1"), &sign(b"t1")))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Operator controls stay unsigned.
    let response = app(&state)
        .oneshot(empty("PATCH", "/pauses/s1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let response = app(&state)
        .oneshot(empty("DELETE", "/pauses/s1"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn storage_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let locks_dir = dir.path().join("locks");
    let store = FsLockStore::open(&locks_dir).await.unwrap();
    std::fs::remove_dir(&locks_dir).unwrap();
    let state = state_with(CryptoGate::passthrough(), Arc::new(store));

    let response = app(&state)
        .oneshot(empty("PATCH", "/pauses/abc123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json_body(response).await["error"], "STORAGE_ERROR");

    // A pause that cannot be stored is not announced.
    let response = app(&state)
        .oneshot(form_post("/pauses", "id=abc123"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(state.channel.stats().published, 0);
}

#[tokio::test]
async fn health_reports_channel_state() {
    let state = plain_state();
    let _console = state.channel.subscribe();
    app(&state)
        .oneshot(form_post("/messages", "body=x"))
        .await
        .unwrap();

    let response = app(&state).oneshot(empty("GET", "/health")).await.unwrap();
    let doc = json_body(response).await;
    assert_eq!(doc["status"], "ok");
    assert_eq!(doc["subscribers"], 1);
    assert_eq!(doc["backlog"], 1);
}
