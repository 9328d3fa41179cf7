use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use taskline_contracts::{Permission, RawResult, Record, Scalar};
use taskline_gateway::config::GatewayConfig;
use taskline_gateway::credentials::{LOCAL_AUTH_SECRET_HEADER, LocalCredentials};
use taskline_gateway::http::{AppState, REQUEST_ID_HEADER, app};
use taskline_policy::Grant;
use taskline_routines::scripted::{Scripted, ScriptedBackend};
use tokio::net::TcpListener;
use tokio::sync::oneshot;

struct TestServer {
    addr: SocketAddr,
    client: reqwest::Client,
    shutdown: Option<oneshot::Sender<()>>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}

fn config() -> GatewayConfig {
    GatewayConfig::from_kv(&HashMap::from([(
        "TASKLINE_DB_URL".to_string(),
        "postgres://unused@localhost/taskline".to_string(),
    )]))
    .expect("gateway config should be valid")
}

async fn spawn_with(backend: ScriptedBackend, credentials: LocalCredentials) -> TestServer {
    let state = AppState::new(config(), Arc::new(backend), Arc::new(credentials))
        .expect("app state should build");

    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind should succeed");
    let addr = listener.local_addr().expect("local_addr should succeed");

    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app(state))
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
    });

    let server = TestServer {
        addr,
        client: reqwest::Client::new(),
        shutdown: Some(shutdown_tx),
    };
    wait_for_healthz(&server).await;
    server
}

async fn spawn(backend: ScriptedBackend) -> TestServer {
    spawn_with(
        backend,
        LocalCredentials::new("local", 1, 1, vec![Grant::all()], None),
    )
    .await
}

async fn wait_for_healthz(server: &TestServer) {
    let url = server.url("/healthz");

    for _ in 0..50 {
        if let Ok(response) = server.client.get(&url).send().await
            && response.status().is_success()
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    panic!("server did not become ready at {}", url);
}

fn row(pairs: &[(&str, Scalar)]) -> Record {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), value.clone()))
        .collect()
}

fn task_row(id: i64, title: &str, completed: bool) -> Record {
    row(&[
        ("idTask", Scalar::Int(id)),
        ("idAccount", Scalar::Int(1)),
        ("idUser", Scalar::Int(1)),
        ("title", Scalar::text(title)),
        ("description", Scalar::Null),
        ("priority", Scalar::Int(1)),
        ("completed", Scalar::Bool(completed)),
        ("deleted", Scalar::Bool(false)),
    ])
}

async fn read_json(response: reqwest::Response) -> serde_json::Value {
    response
        .json::<serde_json::Value>()
        .await
        .expect("response body should be JSON")
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn create_defaults_priority_and_returns_new_id() {
    let backend = ScriptedBackend::new().on(
        "functional.spTaskCreate",
        Scripted::Ok(RawResult::single(vec![row(&[("idTask", Scalar::Int(42))])])),
    );
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .post(server.url("/api/v1/internal/task"))
        .header(REQUEST_ID_HEADER, "req_create_01")
        .json(&serde_json::json!({"title": "Buy milk"}))
        .send()
        .await
        .expect("create request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response
            .headers()
            .get(REQUEST_ID_HEADER)
            .and_then(|v| v.to_str().ok()),
        Some("req_create_01")
    );

    let body = read_json(response).await;
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["idTask"], 42);
    assert!(body["timestamp"].is_string());

    let calls = backend.calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].routine, "functional.spTaskCreate");
    assert_eq!(calls[0].params.value("priority"), Scalar::Int(1));
    assert_eq!(calls[0].params.value("description"), Scalar::Null);
    assert_eq!(calls[0].params.value("idAccount"), Scalar::Int(1));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn update_without_title_is_rejected_before_any_routine_call() {
    let backend = ScriptedBackend::new();
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .put(server.url("/api/v1/internal/task/7"))
        .json(&serde_json::json!({"priority": 1, "completed": 0}))
        .send()
        .await
        .expect("update request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body = read_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "ERR_VALIDATION");
    let fields = body["error"]["details"]
        .as_array()
        .expect("violations should be listed")
        .iter()
        .filter_map(|v| v["field"].as_str())
        .collect::<Vec<_>>();
    assert_eq!(fields, vec!["title"]);
    assert!(backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_with_out_of_range_priority_never_reaches_the_database() {
    let backend = ScriptedBackend::new();
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .get(server.url("/api/v1/internal/task?priority=5"))
        .send()
        .await
        .expect("list request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body = read_json(response).await;
    assert_eq!(body["error"]["details"][0]["field"], "priority");
    assert!(backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn list_decodes_rows_into_tasks() {
    let backend = ScriptedBackend::new().on(
        "functional.spTaskList",
        Scripted::Ok(RawResult::single(vec![
            task_row(1, "Buy milk", false),
            task_row(2, "File taxes", true),
        ])),
    );
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .get(server.url("/api/v1/internal/task?completed=1"))
        .send()
        .await
        .expect("list request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body = read_json(response).await;
    let tasks = body["data"].as_array().expect("list data should be an array");
    assert_eq!(tasks.len(), 2);
    assert_eq!(tasks[1]["title"], "File taxes");
    assert_eq!(tasks[1]["completed"], true);
    assert!(tasks[0].get("idAccount").is_none());

    let calls = backend.calls();
    assert_eq!(calls[0].params.value("completed"), Scalar::Bool(true));
    assert_eq!(calls[0].params.value("priority"), Scalar::Null);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_missing_task_surfaces_the_routine_message() {
    let backend = ScriptedBackend::new().on(
        "functional.spTaskDelete",
        Scripted::business("51000", "TaskDoesntExist"),
    );
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .delete(server.url("/api/v1/internal/task/999"))
        .send()
        .await
        .expect("delete request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);

    let body = read_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["message"], "TaskDoesntExist");
    assert_eq!(backend.calls()[0].params.value("idTask"), Scalar::Int(999));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn infrastructure_faults_are_logged_but_hidden_from_the_caller() {
    let log_buf = init_test_tracing();

    let backend =
        ScriptedBackend::new().on("functional.spTaskGet", Scripted::Unavailable);
    let server = spawn(backend).await;

    let response = server
        .client
        .get(server.url("/api/v1/internal/task/5"))
        .header(REQUEST_ID_HEADER, "req_fault_01")
        .send()
        .await
        .expect("get request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);

    let body = read_json(response).await;
    assert_eq!(body["error"]["message"], "Internal Server Error");
    assert!(!body.to_string().contains("spTaskGet"));

    let logs = String::from_utf8(
        log_buf
            .lock()
            .expect("log lock should be available")
            .clone(),
    )
    .expect("logs should be utf-8");
    assert!(logs.contains("functional.spTaskGet"));
    assert!(logs.contains("req_fault_01"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn overview_returns_named_result_sets_from_one_transaction() {
    let backend = ScriptedBackend::new().on(
        "functional.spTaskOverview",
        Scripted::Ok(RawResult {
            tables: vec![
                vec![task_row(1, "Buy milk", false)],
                vec![task_row(2, "File taxes", true), task_row(3, "Walk dog", true)],
            ],
            rows_affected: 3,
        }),
    );
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .get(server.url("/api/v1/internal/task/overview"))
        .send()
        .await
        .expect("overview request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);

    let body = read_json(response).await;
    assert_eq!(body["data"]["pending"].as_array().map(Vec::len), Some(1));
    assert_eq!(body["data"]["completed"].as_array().map(Vec::len), Some(2));

    let calls = backend.calls();
    assert!(calls[0].in_transaction);
    let tx = backend.transactions();
    assert_eq!((tx.begun, tx.committed, tx.rolled_back), (1, 1, 0));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_grant_is_forbidden() {
    let backend = ScriptedBackend::new();
    let server = spawn_with(
        backend.clone(),
        LocalCredentials::new(
            "reader",
            1,
            1,
            vec![Grant::new("TASK", Permission::Read)],
            None,
        ),
    )
    .await;

    let response = server
        .client
        .delete(server.url("/api/v1/internal/task/1"))
        .send()
        .await
        .expect("delete request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);
    assert!(backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shared_secret_guards_api_routes() {
    let backend = ScriptedBackend::new().on(
        "functional.spTaskList",
        Scripted::Ok(RawResult::single(Vec::new())),
    );
    let server = spawn_with(
        backend,
        LocalCredentials::new(
            "local",
            1,
            1,
            vec![Grant::all()],
            Some("s3cret".to_string()),
        ),
    )
    .await;

    let response = server
        .client
        .get(server.url("/api/v1/internal/task"))
        .send()
        .await
        .expect("list request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "ERR_AUTH_REQUIRED");

    let response = server
        .client
        .get(server.url("/api/v1/internal/task"))
        .header(LOCAL_AUTH_SECRET_HEADER, "s3cret")
        .send()
        .await
        .expect("list request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["data"], serde_json::json!([]));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_routes_get_a_not_found_envelope() {
    let server = spawn(ScriptedBackend::new()).await;

    let response = server
        .client
        .get(server.url("/api/v1/internal/project"))
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let body = read_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(
        body["error"]["message"],
        "Route GET /api/v1/internal/project not found"
    );
    assert_eq!(body["error"]["details"]["path"], "/api/v1/internal/project");
    assert_eq!(body["error"]["details"]["method"], "GET");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unrouted_methods_on_known_paths_get_a_not_found_envelope() {
    let backend = ScriptedBackend::new();
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .patch(server.url("/api/v1/internal/task/1"))
        .header("content-type", "application/json")
        .body("{\"title\": \"Buy milk\"}")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);

    let body = read_json(response).await;
    assert_eq!(body["success"], false);
    assert_eq!(body["error"]["code"], "NOT_FOUND");
    assert_eq!(
        body["error"]["message"],
        "Route PATCH /api/v1/internal/task/1 not found"
    );
    assert_eq!(body["error"]["details"]["method"], "PATCH");
    assert!(backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn malformed_json_is_a_bad_request() {
    let backend = ScriptedBackend::new();
    let server = spawn(backend.clone()).await;

    let response = server
        .client
        .post(server.url("/api/v1/internal/task"))
        .header("content-type", "application/json")
        .body("{\"title\": ")
        .send()
        .await
        .expect("request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    let body = read_json(response).await;
    assert_eq!(body["error"]["code"], "ERR_INVALID_JSON");
    assert!(backend.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readyz_and_metrics_are_served() {
    let server = spawn(ScriptedBackend::new()).await;

    let response = server
        .client
        .get(server.url("/readyz"))
        .send()
        .await
        .expect("readyz request should succeed");
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    let body = read_json(response).await;
    assert_eq!(body["checks"]["database"], true);

    let _ = server
        .client
        .get(server.url("/api/v1/internal/task?priority=9"))
        .send()
        .await
        .expect("list request should succeed");

    let metrics = server
        .client
        .get(server.url("/metrics"))
        .send()
        .await
        .expect("metrics request should succeed")
        .text()
        .await
        .expect("metrics body should be text");
    assert!(metrics.contains("taskline_http_requests_total"));
}

fn init_test_tracing() -> Arc<Mutex<Vec<u8>>> {
    static LOG_BUF: OnceLock<Arc<Mutex<Vec<u8>>>> = OnceLock::new();

    LOG_BUF
        .get_or_init(|| {
            let buf = Arc::new(Mutex::new(Vec::new()));
            let make_writer = {
                let buf = buf.clone();
                move || TestWriter { buf: buf.clone() }
            };

            let subscriber = tracing_subscriber::fmt()
                .with_env_filter(tracing_subscriber::EnvFilter::new("info"))
                .with_ansi(false)
                .with_writer(make_writer)
                .finish();

            tracing::subscriber::set_global_default(subscriber)
                .expect("global tracing subscriber should be set once");

            buf
        })
        .clone()
}

struct TestWriter {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl Write for TestWriter {
    fn write(&mut self, data: &[u8]) -> std::io::Result<usize> {
        self.buf
            .lock()
            .expect("log lock should be available")
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
