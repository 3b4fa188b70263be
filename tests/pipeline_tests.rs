// End-to-end pipeline scenarios: the gateway router in front of a mock
// generative-language upstream bound to an ephemeral local port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::extract::Query;
use axum::http::{Request, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use http_body_util::BodyExt;
use serde_json::{Value, json};
use tower::ServiceExt;

use lingua_gateway::config::Config;
use lingua_gateway::keypool::{AUTH_SECRET_SET, GEMINI_API_KEY_SET};
use lingua_gateway::kv::MemoryKv;
use lingua_gateway::state::AppState;
use lingua_gateway::translation_cache::cache_key;

// ── Harness ───────────────────────────────────────────────────────────────

async fn spawn_upstream(router: Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// Gateway router pointed at the mock upstream, with test-friendly timing.
fn gateway(addr: SocketAddr, kv: Arc<MemoryKv>) -> axum::Router {
    gateway_with(addr, kv, |_| {})
}

fn gateway_with(
    addr: SocketAddr,
    kv: Arc<MemoryKv>,
    tweak: impl FnOnce(&mut Config),
) -> axum::Router {
    let mut config = Config::for_tests();
    config.gemini_base_url = format!("http://{addr}");
    config.request_timeout = Duration::from_secs(2);
    tweak(&mut config);
    lingua_gateway::create_router(AppState::new_test_with_config(config, kv))
}

fn authed_kv(gemini_keys: &[&str]) -> Arc<MemoryKv> {
    let kv = Arc::new(MemoryKv::new());
    kv.seed_set(AUTH_SECRET_SET, &["GOODKEY"]);
    kv.seed_set(GEMINI_API_KEY_SET, gemini_keys);
    kv
}

fn candidates_body(text: &str) -> Value {
    json!({ "candidates": [{ "content": { "parts": [{ "text": text }] } }] })
}

fn translate_request(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

// ═══════════════════════════════════════════════════════════════════════════
//  Happy path: single text
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn happy_path_translates_and_caches() {
    let upstream = Router::new().route(
        "/v1beta/models/{model}",
        post(|| async { Json(candidates_body(" Hola ")) }),
    );
    let addr = spawn_upstream(upstream).await;
    let kv = authed_kv(&["K1"]);

    let response = gateway(addr, kv.clone())
        .oneshot(translate_request(
            "/translate/GOODKEY",
            json!({"target_lang": "es", "text_list": ["Hello"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-request-id"));
    let json = body_json(response).await;
    assert_eq!(
        json["translations"],
        json!([{"detected_source_lang": "auto", "text": "Hola"}])
    );

    // The cache write is fire-and-forget; give it a moment to land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(kv.string_value(&cache_key("Hello", None, "es")).is_some());
}

// ═══════════════════════════════════════════════════════════════════════════
//  Invalid credential triggers rotation
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn forbidden_credential_is_evicted_and_rotated_past() {
    let upstream = Router::new().route(
        "/v1beta/models/{model}",
        post(|Query(params): Query<HashMap<String, String>>| async move {
            if params.get("key").map(String::as_str) == Some("BADKEY") {
                (StatusCode::FORBIDDEN, Json(json!({"error": "forbidden"})))
            } else {
                (StatusCode::OK, Json(candidates_body(" Hola ")))
            }
        }),
    );
    let addr = spawn_upstream(upstream).await;
    // Round-robin starts one past the head, so the bad key is tried first.
    let kv = authed_kv(&["GOODK", "BADKEY"]);

    let response = gateway(addr, kv.clone())
        .oneshot(translate_request(
            "/translate/GOODKEY",
            json!({"target_lang": "es", "text_list": ["Hello"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["translations"][0]["text"], "Hola");

    assert_eq!(kv.remove_member_calls.load(Ordering::SeqCst), 1);
    assert!(!kv.set_contains(GEMINI_API_KEY_SET, "BADKEY"));
    assert!(kv.set_contains(GEMINI_API_KEY_SET, "GOODK"));
}

// ═══════════════════════════════════════════════════════════════════════════
//  Rate-limit backoff
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn rate_limits_back_off_then_succeed() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = calls.clone();
    let upstream = Router::new().route(
        "/v1beta/models/{model}",
        post(move || {
            let calls = calls_in_handler.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    (StatusCode::TOO_MANY_REQUESTS, Json(json!({"error": "slow down"})))
                } else {
                    (StatusCode::OK, Json(candidates_body("Hola")))
                }
            }
        }),
    );
    let addr = spawn_upstream(upstream).await;
    let kv = authed_kv(&["K1", "K2", "K3"]);

    let started = Instant::now();
    let response = gateway(addr, kv)
        .oneshot(translate_request(
            "/translate/GOODKEY",
            json!({"target_lang": "es", "text_list": ["Hello"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["translations"][0]["text"], "Hola");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    // 429 policy: 1000 ms after the first, 2000 ms after the second.
    assert!(
        started.elapsed() >= Duration::from_millis(3_000),
        "backoff too short: {:?}",
        started.elapsed()
    );
}

// ═══════════════════════════════════════════════════════════════════════════
//  Batch with duplicates and cache
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn batch_reuses_cache_and_dedups_upstream_calls() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = calls.clone();
    let upstream = Router::new().route(
        "/v1beta/models/{model}",
        post(move || {
            let calls = calls_in_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Json(candidates_body("chien"))
            }
        }),
    );
    let addr = spawn_upstream(upstream).await;

    let kv = authed_kv(&["K1"]);
    kv.seed_string(
        &cache_key("cat", None, "fr"),
        &json!({"detected_source_lang": "auto", "text": "chat"}).to_string(),
    );

    let response = gateway(addr, kv)
        .oneshot(translate_request(
            "/translate/GOODKEY",
            json!({"target_lang": "fr", "text_list": ["cat", "cat", "dog"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(
        json["translations"],
        json!([
            {"detected_source_lang": "auto", "text": "chat"},
            {"detected_source_lang": "auto", "text": "chat"},
            {"detected_source_lang": "auto", "text": "chien"},
        ])
    );
    assert_eq!(calls.load(Ordering::SeqCst), 1, "only the miss goes upstream");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Coalesced duplicate submissions
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn identical_concurrent_requests_share_one_pipeline_run() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = calls.clone();
    let upstream = Router::new().route(
        "/v1beta/models/{model}",
        post(move || {
            let calls = calls_in_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                Json(candidates_body("Hola"))
            }
        }),
    );
    let addr = spawn_upstream(upstream).await;
    let app = gateway(addr, authed_kv(&["K1"]));

    let body = json!({"target_lang": "es", "text_list": ["Hello"]});
    let (first, second) = tokio::join!(
        app.clone()
            .oneshot(translate_request("/translate/GOODKEY", body.clone())),
        app.clone()
            .oneshot(translate_request("/translate/GOODKEY", body.clone())),
    );

    let first = first.unwrap();
    let second = second.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(second.status(), StatusCode::OK);

    let first_body = first.into_body().collect().await.unwrap().to_bytes();
    let second_body = second.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(first_body, second_body);
    assert_eq!(calls.load(Ordering::SeqCst), 1, "pipeline must run once");
}

// ═══════════════════════════════════════════════════════════════════════════
//  Circuit opens on persistent timeouts
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn circuit_opens_and_request_fails_with_internal_error() {
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = calls.clone();
    let upstream = Router::new().route(
        "/v1beta/models/{model}",
        post(move || {
            let calls = calls_in_handler.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                // Outlast the gateway's per-attempt timeout.
                tokio::time::sleep(Duration::from_secs(5)).await;
                Json(candidates_body("never"))
            }
        }),
    );
    let addr = spawn_upstream(upstream).await;

    let app = gateway_with(addr, authed_kv(&["K1", "K2", "K3", "K4"]), |config| {
        config.circuit_failure_threshold = 2;
        config.max_retries = 4;
        config.request_timeout = Duration::from_millis(100);
    });

    let response = app
        .oneshot(translate_request(
            "/translate/GOODKEY",
            json!({"target_lang": "es", "text_list": ["Hello"]}),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let json = body_json(response).await;
    assert_eq!(json["error"], "An internal error occurred");
    assert!(json["requestId"].is_string());

    // Two timeouts trip the breaker; the remaining attempts never reach the
    // network.
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// ═══════════════════════════════════════════════════════════════════════════
//  Passthrough credential injection
// ═══════════════════════════════════════════════════════════════════════════

#[tokio::test]
async fn passthrough_forwards_body_and_injects_pooled_credential() {
    let seen_key: Arc<std::sync::Mutex<Option<String>>> = Arc::new(std::sync::Mutex::new(None));
    let seen_in_handler = seen_key.clone();
    let upstream = Router::new().route(
        "/v1beta/models",
        get(move |headers: axum::http::HeaderMap| {
            let seen = seen_in_handler.clone();
            async move {
                *seen.lock().unwrap() = headers
                    .get("x-goog-api-key")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                Json(json!({"models": [{"name": "models/gemini-2.0-flash"}]}))
            }
        }),
    );
    let addr = spawn_upstream(upstream).await;

    let response = gateway(addr, authed_kv(&["POOLED"]))
        .oneshot(
            Request::builder()
                .uri("/v1beta/models")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["models"][0]["name"], "models/gemini-2.0-flash");
    assert_eq!(seen_key.lock().unwrap().as_deref(), Some("POOLED"));
}
