//! End-to-end coverage of the request pipeline: a real router served on a
//! loopback port, a stand-in portal upstream, and the in-process KV store.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::Json;
use clerk::admission::{Gate, GateConfig};
use clerk::server::{self, ServerState};
use clerk::webhook::{self, WebhookRouter};
use clerk::App;
use portal_client::{ResponseCache, TokenConfig, TokenManager};
use serde_json::{json, Value};
use url::Url;

const SIGNING_KEY: &[u8] = b"integration-signing-key-32-bytes!";
const WEBHOOK_SECRET: &[u8] = b"integration-webhook-secret";

#[derive(Default)]
struct PortalState {
    tasks: Vec<Value>,
    list_hits: usize,
    create_hits: usize,
    upload_content_type: Option<String>,
}

type Shared = Arc<Mutex<PortalState>>;

impl PortalState {
    fn seed_task(&mut self, name: &str, status: &str) {
        let id = format!("T{}", self.tasks.len() + 1);
        self.tasks.push(json!({
            "id": id,
            "name": name,
            "status": status,
        }));
    }
}

async fn portal_token() -> Json<Value> {
    Json(json!({ "access_token": "token-1", "expires_in": 3600 }))
}

async fn portal_list(
    State(state): State<Shared>,
    Query(query): Query<std::collections::HashMap<String, String>>,
) -> Json<Value> {
    let mut state = state.lock().unwrap();
    state.list_hits += 1;
    let tasks: Vec<Value> = state
        .tasks
        .iter()
        .filter(|task| match (query.get("status"), query.get("name")) {
            (Some(status), _) => task["status"] == status.as_str(),
            (None, Some(name)) => task["name"] == name.as_str(),
            (None, None) => true,
        })
        .cloned()
        .collect();
    Json(json!({ "tasks": tasks }))
}

async fn portal_create(State(state): State<Shared>, Json(body): Json<Value>) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    state.create_hits += 1;
    let id = format!("T{}", state.tasks.len() + 1);
    let task = json!({
        "id": id,
        "name": body["name"],
        "status": "open",
        "owner": body.get("owner").cloned().unwrap_or(Value::Null),
        "due_date": body.get("due_date").cloned().unwrap_or(Value::Null),
    });
    state.tasks.push(task.clone());
    (StatusCode::CREATED, Json(json!({ "task": task })))
}

async fn portal_task_t1(State(state): State<Shared>) -> (StatusCode, Json<Value>) {
    let state = state.lock().unwrap();
    match state.tasks.iter().find(|task| task["id"] == "T1") {
        Some(task) => (StatusCode::OK, Json(json!({ "task": task }))),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": "no such task" } })),
        ),
    }
}

async fn portal_patch_t1(
    State(state): State<Shared>,
    Json(body): Json<Value>,
) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    let Some(task) = state.tasks.iter_mut().find(|task| task["id"] == "T1") else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "message": "no such task" } })),
        );
    };
    for field in ["status", "due_date", "owner"] {
        if let Some(value) = body.get(field) {
            task[field] = value.clone();
        }
    }
    (StatusCode::OK, Json(json!({ "task": task })))
}

async fn portal_download_link() -> Json<Value> {
    Json(json!({
        "url": "https://signed.portal-suite.dev/F1?sig=abc",
        "expires_at": "2026-08-01T10:15:00Z",
    }))
}

async fn portal_search() -> Json<Value> {
    Json(json!({
        "files": [ { "id": "F1", "name": "q3-review.xlsx", "path": "/reviews/q3-review.xlsx" } ],
    }))
}

async fn portal_upload(
    State(state): State<Shared>,
    headers: HeaderMap,
    body: bytes::Bytes,
) -> (StatusCode, Json<Value>) {
    let mut state = state.lock().unwrap();
    state.upload_content_type = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    assert!(!body.is_empty());
    (
        StatusCode::CREATED,
        Json(json!({ "file": { "id": "F9", "name": "q3-review.xlsx", "path": "/reviews/q3-review.xlsx" } })),
    )
}

async fn spawn_portal(state: Shared) -> SocketAddr {
    let router = axum::Router::new()
        .route("/oauth/token", post(portal_token))
        .route(
            "/projects/portals/p1/projects/P1/tasks",
            get(portal_list).post(portal_create),
        )
        .route(
            "/projects/portals/p1/tasks/T1",
            get(portal_task_t1).patch(portal_patch_t1),
        )
        .route("/files/portals/p1/files/F1/download-link", get(portal_download_link))
        .route("/files/portals/p1/files/search", get(portal_search))
        .route(
            "/files/portals/p1/projects/P1/folders/D1/files",
            post(portal_upload),
        )
        .with_state(state);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, router).await.unwrap() });
    addr
}

struct Harness {
    rpc_url: String,
    webhook_url: String,
    state: Shared,
    http: reqwest::Client,
    bearer: String,
}

async fn spawn_harness(rate_limit: u32) -> Harness {
    let state = Shared::default();
    let portal = spawn_portal(state.clone()).await;
    let base: Url = format!("http://{portal}/").parse().unwrap();

    let kv: Arc<dyn kv::Store> = Arc::new(kv::MemoryStore::new());
    let http = reqwest::Client::new();

    let tokens = Arc::new(TokenManager::new(
        http.clone(),
        TokenConfig {
            token_url: base.join("oauth/token").unwrap(),
            client_id: "cid".to_string(),
            client_secret: "secret".to_string(),
            refresh_token: "refresh".to_string(),
            safety_margin: Duration::from_secs(300),
            refresh_timeout: Duration::from_secs(5),
        },
        kv.clone(),
    ));
    let client = portal_client::Client::new(
        http.clone(),
        tokens.clone(),
        base.join("projects").unwrap(),
        base.join("files").unwrap(),
        "p1".to_string(),
        Duration::from_secs(5),
    );

    let app = Arc::new(App {
        client,
        tokens,
        cache: ResponseCache::new(kv.clone()),
        kv: kv.clone(),
        default_cache_ttl: Duration::from_secs(300),
        handler_timeout: Duration::from_secs(10),
        idempotency_window: Duration::from_secs(60),
    });

    let gate = Arc::new(Gate::new(
        GateConfig {
            signing_key: SIGNING_KEY.to_vec(),
            allow_list: vec!["127.0.0.1".parse().unwrap(), "::1".parse().unwrap()],
            rate_limit,
            rate_window: Duration::from_secs(60),
            max_token_lifetime: Duration::from_secs(24 * 3600),
            test_profile: false,
        },
        kv.clone(),
    ));
    let webhook = Some(Arc::new(WebhookRouter::new(WEBHOOK_SECRET.to_vec(), kv)));

    let router = server::build_router(ServerState {
        app,
        gate,
        webhook,
        request_timeout: Duration::from_secs(30),
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap()
    });

    Harness {
        rpc_url: format!("http://{addr}/rpc"),
        webhook_url: format!("http://{addr}/webhook"),
        state,
        http: reqwest::Client::new(),
        bearer: bearer("asst-1"),
    }
}

fn bearer(sub: &str) -> String {
    #[derive(serde::Serialize)]
    struct Claims<'a> {
        sub: &'a str,
        iat: i64,
        exp: i64,
    }
    let now = time::OffsetDateTime::now_utc().unix_timestamp();
    let token = jsonwebtoken::encode(
        &jsonwebtoken::Header::default(),
        &Claims {
            sub,
            iat: now,
            exp: now + 600,
        },
        &jsonwebtoken::EncodingKey::from_secret(SIGNING_KEY),
    )
    .unwrap();
    format!("Bearer {token}")
}

impl Harness {
    async fn rpc_raw(&self, authorization: Option<&str>, body: Value) -> reqwest::Response {
        let mut request = self.http.post(&self.rpc_url).json(&body);
        if let Some(authorization) = authorization {
            request = request.header("authorization", authorization);
        }
        request.send().await.unwrap()
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Value {
        let body = json!({
            "jsonrpc": "2.0",
            "method": "callTool",
            "params": { "name": name, "arguments": arguments },
            "id": 1,
        });
        self.rpc_raw(Some(&self.bearer), body)
            .await
            .json()
            .await
            .unwrap()
    }

    fn list_hits(&self) -> usize {
        self.state.lock().unwrap().list_hits
    }
}

#[tokio::test]
async fn calls_without_a_bearer_are_unauthorized_and_reach_no_handler() {
    let harness = spawn_harness(100).await;

    let response = harness
        .rpc_raw(
            None,
            json!({
                "jsonrpc": "2.0",
                "method": "callTool",
                "params": { "name": "listTasks", "arguments": { "project-id": "P1" } },
                "id": 1,
            }),
        )
        .await;

    // Protocol-level errors ride in the envelope over HTTP 200.
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32001);

    // No upstream request was issued.
    assert_eq!(harness.list_hits(), 0);
}

#[tokio::test]
async fn list_tasks_round_trips_the_upstream_result() {
    let harness = spawn_harness(100).await;
    harness.state.lock().unwrap().seed_task("Draft brief", "open");

    let body = harness
        .call_tool("listTasks", json!({ "project-id": "P1", "status": "open" }))
        .await;

    let tasks = body["result"]["tasks"].as_array().unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0]["id"], "T1");
    assert_eq!(tasks[0]["name"], "Draft brief");
    assert_eq!(tasks[0]["status"], "open");
}

#[tokio::test]
async fn identical_reads_within_the_ttl_hit_upstream_once() {
    let harness = spawn_harness(100).await;
    harness.state.lock().unwrap().seed_task("Draft brief", "open");

    let first = harness
        .call_tool("listTasks", json!({ "project-id": "P1", "status": "open" }))
        .await;
    let second = harness
        .call_tool("listTasks", json!({ "project-id": "P1", "status": "open" }))
        .await;

    assert_eq!(first["result"], second["result"]);
    assert_eq!(harness.list_hits(), 1);

    // Different bindings are a different fingerprint.
    harness
        .call_tool("listTasks", json!({ "project-id": "P1" }))
        .await;
    assert_eq!(harness.list_hits(), 2);
}

#[tokio::test]
async fn create_task_is_idempotent_within_the_window() {
    let harness = spawn_harness(100).await;

    let first = harness
        .call_tool("createTask", json!({ "project-id": "P1", "name": "Review" }))
        .await;
    let second = harness
        .call_tool("createTask", json!({ "project-id": "P1", "name": "Review" }))
        .await;

    assert_eq!(first["result"]["task-id"], "T1");
    assert_eq!(second["result"]["task-id"], "T1");
    assert_eq!(harness.state.lock().unwrap().create_hits, 1);

    // Round-trip: the created task shows up in an open listing.
    let listing = harness
        .call_tool("listTasks", json!({ "project-id": "P1", "status": "open" }))
        .await;
    let ids: Vec<&str> = listing["result"]["tasks"]
        .as_array()
        .unwrap()
        .iter()
        .map(|task| task["id"].as_str().unwrap())
        .collect();
    assert!(ids.contains(&"T1"));
}

#[tokio::test]
async fn update_then_detail_reflects_the_new_status() {
    let harness = spawn_harness(100).await;
    harness.state.lock().unwrap().seed_task("Draft brief", "open");

    let updated = harness
        .call_tool(
            "updateTask",
            json!({ "task-id": "T1", "status": "closed" }),
        )
        .await;
    assert_eq!(updated["result"]["ok"], true);

    let detail = harness
        .call_tool("getTaskDetail", json!({ "task-id": "T1" }))
        .await;
    assert_eq!(detail["result"]["status"], "closed");
    assert_eq!(detail["result"]["name"], "Draft brief");
}

#[tokio::test]
async fn missing_tasks_surface_not_found() {
    let harness = spawn_harness(100).await;

    let body = harness
        .call_tool("getTaskDetail", json!({ "task-id": "T1" }))
        .await;
    assert_eq!(body["error"]["code"], -32004);
    assert_eq!(body["error"]["data"]["upstream-status"], 404);
    assert_eq!(body["error"]["data"]["upstream-message"], "no such task");
}

#[tokio::test]
async fn project_summary_aggregates_status_counts() {
    let harness = spawn_harness(100).await;
    {
        let mut state = harness.state.lock().unwrap();
        for i in 0..4 {
            state.seed_task(&format!("open-{i}"), "open");
        }
        for i in 0..6 {
            state.seed_task(&format!("closed-{i}"), "closed");
        }
        for i in 0..2 {
            state.seed_task(&format!("overdue-{i}"), "overdue");
        }
    }

    let body = harness
        .call_tool("getProjectSummary", json!({ "project-id": "P1" }))
        .await;

    assert_eq!(body["result"]["project-id"], "P1");
    assert_eq!(body["result"]["total-tasks"], 12);
    assert_eq!(body["result"]["completion-rate"], 0.5);
    assert_eq!(body["result"]["overdue-count"], 2);
    // One constituent read per status.
    assert_eq!(harness.list_hits(), 3);

    // The constituent reads are themselves cached: a direct listTasks of one
    // status costs nothing more.
    harness
        .call_tool("listTasks", json!({ "project-id": "P1", "status": "open" }))
        .await;
    assert_eq!(harness.list_hits(), 3);
}

#[tokio::test]
async fn an_empty_project_reports_a_zero_completion_rate() {
    let harness = spawn_harness(100).await;

    let body = harness
        .call_tool("getProjectSummary", json!({ "project-id": "P1" }))
        .await;

    assert_eq!(body["result"]["total-tasks"], 0);
    assert_eq!(body["result"]["completion-rate"], 0.0);
    assert_eq!(body["result"]["overdue-count"], 0);
}

#[tokio::test]
async fn requests_over_the_ceiling_are_rate_limited() {
    let harness = spawn_harness(2).await;

    for _ in 0..2 {
        let body = harness
            .call_tool("listTasks", json!({ "project-id": "P1" }))
            .await;
        assert!(body.get("error").is_none(), "{body}");
    }

    let body = harness
        .call_tool("listTasks", json!({ "project-id": "P1" }))
        .await;
    assert_eq!(body["error"]["code"], -32005);
    assert!(body["error"]["data"]["retry-after-seconds"].is_u64());
}

#[tokio::test]
async fn invalid_arguments_name_the_offending_parameter() {
    let harness = spawn_harness(100).await;

    let body = harness
        .call_tool(
            "uploadReviewSheet",
            json!({
                "project-id": "P1",
                "folder-id": "D1",
                "name": "q3-review.xlsx",
                "content-base64": "!!!not-base64!!!",
            }),
        )
        .await;

    assert_eq!(body["error"]["code"], -32602);
    let message = body["error"]["message"].as_str().unwrap();
    assert!(message.contains("content-base64"), "{message}");
    assert_eq!(harness.list_hits(), 0);
}

#[tokio::test]
async fn uploads_carry_the_suffix_derived_media_type() {
    let harness = spawn_harness(100).await;

    let content = base64::encode(b"col-a,col-b\n1,2\n");
    let body = harness
        .call_tool(
            "uploadReviewSheet",
            json!({
                "project-id": "P1",
                "folder-id": "D1",
                "name": "q3-review.xlsx",
                "content-base64": content,
            }),
        )
        .await;

    assert_eq!(body["result"]["file-id"], "F9");
    assert_eq!(
        harness.state.lock().unwrap().upload_content_type.as_deref(),
        Some("application/vnd.openxmlformats-officedocument.spreadsheetml.sheet")
    );
}

#[tokio::test]
async fn download_passes_the_presigned_url_through() {
    let harness = spawn_harness(100).await;

    let body = harness
        .call_tool("downloadFile", json!({ "file-id": "F1" }))
        .await;

    assert_eq!(
        body["result"]["file-url"],
        "https://signed.portal-suite.dev/F1?sig=abc"
    );
    assert_eq!(body["result"]["expires-at"], "2026-08-01T10:15:00Z");
}

#[tokio::test]
async fn search_files_returns_the_match_list() {
    let harness = spawn_harness(100).await;

    let body = harness
        .call_tool("searchFiles", json!({ "query": "review" }))
        .await;

    let files = body["result"]["files"].as_array().unwrap();
    assert_eq!(files[0]["id"], "F1");
    assert_eq!(files[0]["path"], "/reviews/q3-review.xlsx");
}

#[tokio::test]
async fn unknown_methods_and_tools_are_rejected() {
    let harness = spawn_harness(100).await;

    let body: Value = harness
        .rpc_raw(
            Some(harness.bearer.as_str()),
            json!({ "jsonrpc": "2.0", "method": "shutdown", "id": 7 }),
        )
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["error"]["code"], -32601);
    assert_eq!(body["id"], 7);

    let body = harness.call_tool("dropDatabase", json!({})).await;
    assert_eq!(body["error"]["code"], -32602);
}

#[tokio::test]
async fn notifications_produce_no_response() {
    let harness = spawn_harness(100).await;
    harness.state.lock().unwrap().seed_task("Draft brief", "open");

    let response = harness
        .rpc_raw(
            Some(harness.bearer.as_str()),
            json!({
                "jsonrpc": "2.0",
                "method": "callTool",
                "params": { "name": "listTasks", "arguments": { "project-id": "P1" } },
            }),
        )
        .await;

    assert_eq!(response.status(), 204);
    assert!(response.bytes().await.unwrap().is_empty());
}

#[tokio::test]
async fn malformed_envelopes_are_parse_errors() {
    let harness = spawn_harness(100).await;

    let response = harness
        .http
        .post(&harness.rpc_url)
        .header("authorization", &harness.bearer)
        .header("content-type", "application/json")
        .body("{definitely not json")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["code"], -32700);
    assert_eq!(body["id"], Value::Null);
}

#[tokio::test]
async fn manifest_and_health_need_no_authentication() {
    let harness = spawn_harness(100).await;
    let base = harness.rpc_url.trim_end_matches("/rpc").to_string();

    let manifest: Value = harness
        .http
        .get(format!("{base}/manifest"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(manifest["tools"].as_array().unwrap().len(), 8);

    let health: Value = harness
        .http
        .get(format!("{base}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(health["status"].is_string());
    assert!(health["checks"]["kv"].as_bool().unwrap());
}

#[tokio::test]
async fn webhook_deliveries_verify_and_deduplicate() {
    let harness = spawn_harness(100).await;

    let body = json!({
        "id": "dlv-1",
        "type": "task.updated",
        "data": { "task-id": "T1", "status": "closed" },
    })
    .to_string();
    let signature = webhook::sign(WEBHOOK_SECRET, body.as_bytes());

    let accepted = harness
        .http
        .post(&harness.webhook_url)
        .header("x-portal-signature", &signature)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    assert_eq!(accepted.status(), 200);
    let reply: Value = accepted.json().await.unwrap();
    assert_eq!(reply["status"], "ok");

    // Replay of the same delivery id is acknowledged but not re-dispatched.
    let replay = harness
        .http
        .post(&harness.webhook_url)
        .header("x-portal-signature", &signature)
        .body(body.clone())
        .send()
        .await
        .unwrap();
    let reply: Value = replay.json().await.unwrap();
    assert_eq!(reply["status"], "duplicate");

    // A forged signature is refused outright.
    let forged = harness
        .http
        .post(&harness.webhook_url)
        .header("x-portal-signature", webhook::sign(b"wrong", body.as_bytes()))
        .body(body)
        .send()
        .await
        .unwrap();
    assert_eq!(forged.status(), 401);

    // A correctly signed body that cannot be decoded is a framework-level
    // fault and answers 5xx, inviting redelivery.
    let garbled = "not an event payload".to_string();
    let undecodable = harness
        .http
        .post(&harness.webhook_url)
        .header(
            "x-portal-signature",
            webhook::sign(WEBHOOK_SECRET, garbled.as_bytes()),
        )
        .body(garbled)
        .send()
        .await
        .unwrap();
    assert_eq!(undecodable.status(), 500);
}
