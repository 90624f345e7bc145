//! Exercises the token manager and HTTP client against loopback stand-ins
//! for the identity provider and the portal APIs.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Json;
use portal_client::models::TaskStatus;
use portal_client::{Client, Error, TokenConfig, TokenManager};
use url::Url;

#[derive(Clone, Default)]
struct Upstream {
    refreshes: Arc<AtomicUsize>,
    api_hits: Arc<AtomicUsize>,
    /// Status codes to serve before succeeding, consumed in order.
    failures: Arc<std::sync::Mutex<Vec<u16>>>,
}

async fn serve_token(State(upstream): State<Upstream>) -> Json<serde_json::Value> {
    let n = upstream.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
    Json(serde_json::json!({
        "access_token": format!("token-{n}"),
        "expires_in": 3600,
    }))
}

async fn serve_tasks(
    State(upstream): State<Upstream>,
    headers: HeaderMap,
) -> (StatusCode, HeaderMap, Json<serde_json::Value>) {
    upstream.api_hits.fetch_add(1, Ordering::SeqCst);

    if let Some(status) = upstream.failures.lock().unwrap().pop() {
        let mut reply_headers = HeaderMap::new();
        if status == 429 {
            reply_headers.insert("retry-after", "1".parse().unwrap());
        }
        return (
            StatusCode::from_u16(status).unwrap(),
            reply_headers,
            Json(serde_json::json!({"error": {"message": "synthetic failure"}})),
        );
    }

    let bearer = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    (
        StatusCode::OK,
        HeaderMap::new(),
        Json(serde_json::json!({
            "tasks": [
                {"id": "T1", "name": bearer, "status": "open"},
            ],
        })),
    )
}

async fn spawn(upstream: Upstream) -> SocketAddr {
    let router = axum::Router::new()
        .route("/oauth/token", post(serve_token))
        .route(
            "/projects/portals/p1/projects/P1/tasks",
            get(serve_tasks),
        )
        .with_state(upstream);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

fn harness(addr: SocketAddr, kv: Arc<dyn kv::Store>) -> (Arc<TokenManager>, Client) {
    let base: Url = format!("http://{addr}/").parse().unwrap();
    let tokens = Arc::new(TokenManager::new(
        reqwest::Client::new(),
        TokenConfig {
            token_url: base.join("oauth/token").unwrap(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
            safety_margin: Duration::from_secs(300),
            refresh_timeout: Duration::from_secs(5),
        },
        kv,
    ));
    let client = Client::new(
        reqwest::Client::new(),
        tokens.clone(),
        base.join("projects").unwrap(),
        base.join("files").unwrap(),
        "p1".to_string(),
        Duration::from_secs(2),
    );
    (tokens, client)
}

#[tokio::test]
async fn concurrent_callers_share_a_single_refresh() {
    let upstream = Upstream::default();
    let addr = spawn(upstream.clone()).await;
    let kv: Arc<dyn kv::Store> = Arc::new(kv::MemoryStore::new());
    let (tokens, _) = harness(addr, kv);

    let mut tasks = Vec::new();
    for _ in 0..8 {
        let tokens = tokens.clone();
        tasks.push(tokio::spawn(async move { tokens.current().await.unwrap() }));
    }
    let mut seen = std::collections::HashSet::new();
    for task in tasks {
        seen.insert(task.await.unwrap());
    }

    assert_eq!(seen.len(), 1, "all callers saw the same credential");
    assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 1);

    // A later caller reads the stored credential without refreshing.
    assert!(tokens.current().await.is_ok());
    assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn transient_upstream_failures_are_retried() {
    let upstream = Upstream::default();
    upstream.failures.lock().unwrap().extend([503, 502]);
    let addr = spawn(upstream.clone()).await;
    let (_, client) = harness(addr, Arc::new(kv::MemoryStore::new()));

    let tasks = client.list_tasks("P1", Some(TaskStatus::Open)).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(upstream.api_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let upstream = Upstream::default();
    upstream.failures.lock().unwrap().push(400);
    let addr = spawn(upstream.clone()).await;
    let (_, client) = harness(addr, Arc::new(kv::MemoryStore::new()));

    let err = client.list_tasks("P1", None).await.unwrap_err();
    assert!(matches!(err, Error::Rejected { status: 400, .. }), "{err}");
    assert_eq!(upstream.api_hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn persistent_server_errors_exhaust_the_retry_budget() {
    let upstream = Upstream::default();
    upstream.failures.lock().unwrap().extend([500, 500, 500, 500]);
    let addr = spawn(upstream.clone()).await;
    let (_, client) = harness(addr, Arc::new(kv::MemoryStore::new()));

    let err = client.list_tasks("P1", None).await.unwrap_err();
    assert!(
        matches!(err, Error::Unavailable { status: Some(500), .. }),
        "{err}"
    );
    assert_eq!(upstream.api_hits.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn a_429_honours_the_retry_after_hint() {
    let upstream = Upstream::default();
    upstream.failures.lock().unwrap().push(429);
    let addr = spawn(upstream.clone()).await;
    let (_, client) = harness(addr, Arc::new(kv::MemoryStore::new()));

    let started = std::time::Instant::now();
    client.list_tasks("P1", None).await.unwrap();
    assert!(started.elapsed() >= Duration::from_secs(1));
    assert_eq!(upstream.api_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_401_forces_one_refresh_and_one_retry() {
    let upstream = Upstream::default();
    upstream.failures.lock().unwrap().push(401);
    let addr = spawn(upstream.clone()).await;
    let (_, client) = harness(addr, Arc::new(kv::MemoryStore::new()));

    // First call: refresh (token-1), 401, forced refresh (token-2), retry.
    let tasks = client.list_tasks("P1", None).await.unwrap();
    assert_eq!(tasks[0].name, "Bearer token-2");
    assert_eq!(upstream.refreshes.load(Ordering::SeqCst), 2);
    assert_eq!(upstream.api_hits.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn a_second_401_is_surfaced() {
    let upstream = Upstream::default();
    upstream.failures.lock().unwrap().extend([401, 401]);
    let addr = spawn(upstream.clone()).await;
    let (_, client) = harness(addr, Arc::new(kv::MemoryStore::new()));

    let err = client.list_tasks("P1", None).await.unwrap_err();
    assert!(matches!(err, Error::Rejected { status: 401, .. }), "{err}");
}

#[tokio::test]
async fn refresh_rejection_is_terminal() {
    // An identity provider that refuses the refresh credential outright.
    let router = axum::Router::new().route(
        "/oauth/token",
        post(|| async {
            (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({"error": {"message": "invalid_grant"}})),
            )
        }),
    );
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });

    let (tokens, _) = harness(addr, Arc::new(kv::MemoryStore::new()));
    let err = tokens.current().await.unwrap_err();
    assert!(
        matches!(err, Error::RefreshRejected { status: 400, ref message } if message == "invalid_grant"),
        "{err}"
    );
}
