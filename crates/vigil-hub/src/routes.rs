use crate::ingest::ReportPipeline;
use crate::presence::PresenceTracker;
use crate::registry::{Connection, ConnectionRegistry};
use crate::Config;
use axum::{
    body::Bytes,
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, Request, State,
    },
    http::StatusCode,
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use vigil_core::collab::{IdentityResolver, NotificationSink, SettingsProvider, TaskStore};
use vigil_core::report::ReportSnapshot;
use vigil_core::task::PingRecord;
use vigil_core::wire::PingResult;
use vigil_storage::Store;

const MAX_FRAME_BYTES: usize = 256 * 1024;

pub struct AppState {
    pub config: Config,
    pub presence: Arc<PresenceTracker>,
    pub registry: Arc<ConnectionRegistry>,
    pub pipeline: Arc<ReportPipeline>,
    pub resolver: Arc<dyn IdentityResolver>,
    pub tasks: Arc<dyn TaskStore>,
    pub settings: Arc<dyn SettingsProvider>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<Store>, sink: Arc<dyn NotificationSink>) -> Arc<Self> {
        let presence = Arc::new(PresenceTracker::new(config.idle_window, sink.clone()));
        let registry = Arc::new(ConnectionRegistry::new(sink));
        let tasks: Arc<dyn TaskStore> = store.clone();
        let pipeline = Arc::new(ReportPipeline::new(config.history_ttl, tasks.clone()));
        let resolver: Arc<dyn IdentityResolver> = store.clone();
        let settings: Arc<dyn SettingsProvider> = store;
        Arc::new(Self {
            config,
            presence,
            registry,
            pipeline,
            resolver,
            tasks,
            settings,
        })
    }
}

pub fn build_router(app: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/clients/report", get(report_socket).post(upload_report))
        .route("/api/clients/tasks", get(list_ping_tasks))
        .route("/api/clients/task/result", post(upload_ping_result))
        .route("/api/public", get(public_settings))
        .route("/api/status", get(status_overview))
        .route("/api/recent/:uuid", get(client_recent))
        .route("/health", get(|| async { "ok" }))
        .layer(middleware::from_fn_with_state(app.clone(), client_auth))
        .with_state(app)
}

/// Identity attached to a request by the token middleware.
#[derive(Clone)]
struct AuthedIdentity(String);

/// Resolves the bearer token (query `token` or `x-vigil-token` header) into
/// a request extension. Handlers decide whether the identity is required.
async fn client_auth(State(app): State<Arc<AppState>>, mut req: Request, next: Next) -> Response {
    if let Some(token) = request_token(&req) {
        if let Ok(identity) = app.resolver.resolve(&token) {
            req.extensions_mut().insert(AuthedIdentity(identity));
        }
    }
    next.run(req).await
}

fn request_token(req: &Request) -> Option<String> {
    let query = req.uri().query().unwrap_or_default();
    for pair in query.split('&') {
        if let Some(token) = pair.strip_prefix("token=") {
            if !token.is_empty() {
                return Some(token.to_string());
            }
        }
    }
    req.headers()
        .get("x-vigil-token")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({"status": "error", "error": message})),
    )
        .into_response()
}

fn success_response() -> Response {
    Json(serde_json::json!({"status": "success"})).into_response()
}

/// Heartbeat transport: one stateless report per POST. Identity comes from
/// the body's uuid or, failing that, from the authenticated token.
async fn upload_report(
    State(app): State<Arc<AppState>>,
    authed: Option<Extension<AuthedIdentity>>,
    body: Bytes,
) -> Response {
    // Loose decode first so a structurally broken body is rejected before
    // the typed decode reports field-level problems.
    if serde_json::from_slice::<Value>(&body).is_err() {
        return error_response(StatusCode::BAD_REQUEST, "invalid request body");
    }
    let report: ReportSnapshot = match serde_json::from_slice(&body) {
        Ok(report) => report,
        Err(err) => {
            debug!(event = "report_decode_failed", error = %err);
            return error_response(StatusCode::BAD_REQUEST, "invalid request body");
        }
    };

    let identity = if !report.uuid.is_empty() {
        report.uuid.clone()
    } else if let Some(Extension(AuthedIdentity(identity))) = authed {
        identity
    } else {
        return error_response(StatusCode::BAD_REQUEST, "uuid is required");
    };

    app.pipeline.ingest_report(&identity, report).await;
    app.presence.refresh(&identity).await;
    success_response()
}

/// Ping tasks assigned to the authenticated agent.
async fn list_ping_tasks(
    State(app): State<Arc<AppState>>,
    authed: Option<Extension<AuthedIdentity>>,
) -> Response {
    let Some(Extension(AuthedIdentity(identity))) = authed else {
        return error_response(StatusCode::BAD_REQUEST, "client identity not resolved");
    };
    match app.tasks.ping_tasks(&identity) {
        Ok(tasks) => Json(tasks).into_response(),
        Err(err) => {
            warn!(event = "ping_tasks_failed", identity = %identity, error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load tasks")
        }
    }
}

/// Synchronous measurement-result submission over HTTP. Unlike the
/// fire-and-forget websocket routing, store failures are surfaced here.
async fn upload_ping_result(
    State(app): State<Arc<AppState>>,
    authed: Option<Extension<AuthedIdentity>>,
    body: Bytes,
) -> Response {
    let Some(Extension(AuthedIdentity(identity))) = authed else {
        return error_response(StatusCode::BAD_REQUEST, "client identity not resolved");
    };
    let result: PingResult = match serde_json::from_slice(&body) {
        Ok(result) => result,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "invalid ping result format"),
    };
    let record = PingRecord {
        client: identity.clone(),
        task_id: result.task_id,
        value: result.value,
        kind: result.ping_type,
        finished_at: result.finished_at,
    };
    match app.tasks.save_ping_record(record) {
        Ok(()) => success_response(),
        Err(err) => {
            warn!(event = "ping_record_store_failed", identity = %identity, error = %err);
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "failed to save ping result",
            )
        }
    }
}

async fn public_settings(State(app): State<Arc<AppState>>) -> Response {
    match app.settings.public_settings() {
        Ok(settings) => {
            Json(serde_json::json!({"status": "success", "data": settings})).into_response()
        }
        Err(err) => {
            warn!(event = "public_settings_failed", error = %err);
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to load settings")
        }
    }
}

#[derive(Serialize)]
struct StatusEntry {
    uuid: String,
    online: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    latest: Option<ReportSnapshot>,
}

/// Presence plus latest report per identity, for status-query consumers.
async fn status_overview(State(app): State<Arc<AppState>>) -> Response {
    let mut online: BTreeMap<String, i64> = BTreeMap::new();
    for (identity, conn_token) in app.presence.snapshot().await {
        online.insert(identity, conn_token);
    }
    for (identity, conn_token) in app.registry.snapshot().await {
        online.insert(identity, conn_token);
    }

    let mut entries: BTreeMap<String, StatusEntry> = BTreeMap::new();
    for report in app.pipeline.latest_all().await {
        entries.insert(
            report.uuid.clone(),
            StatusEntry {
                uuid: report.uuid.clone(),
                online: online.contains_key(&report.uuid),
                latest: Some(report),
            },
        );
    }
    for identity in online.keys() {
        entries.entry(identity.clone()).or_insert_with(|| StatusEntry {
            uuid: identity.clone(),
            online: true,
            latest: None,
        });
    }

    Json(entries.into_values().collect::<Vec<_>>()).into_response()
}

/// Presence plus the recency buffer for one identity.
async fn client_recent(State(app): State<Arc<AppState>>, Path(uuid): Path<String>) -> Response {
    let online = app.presence.online_token(&uuid).await.is_some()
        || app.registry.canonical_token(&uuid).await.is_some();
    let latest = app.pipeline.latest(&uuid).await;
    let history = app.pipeline.history(&uuid).await;
    if !online && latest.is_none() && history.is_empty() {
        return error_response(StatusCode::NOT_FOUND, "unknown client");
    }
    Json(serde_json::json!({
        "status": "success",
        "data": {
            "uuid": uuid,
            "online": online,
            "latest": latest,
            "history": history,
        }
    }))
    .into_response()
}

/// Persistent transport: upgrade, then one read loop per connection. The
/// token is resolved before the upgrade; missing and invalid tokens get the
/// same answer.
async fn report_socket(
    State(app): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.get("token").cloned().unwrap_or_default();
    let identity = match app.resolver.resolve(&token) {
        Ok(identity) => identity,
        Err(err) => return error_response(StatusCode::UNAUTHORIZED, &err.to_string()),
    };
    ws.on_upgrade(move |socket| handle_agent_socket(app, socket, identity))
}

async fn handle_agent_socket(app: Arc<AppState>, socket: WebSocket, identity: String) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(256);
    let write_timeout = app.config.write_timeout;
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let send = ws_sender.send(msg);
            if tokio::time::timeout(write_timeout, send).await.is_err() {
                return;
            }
        }
    });

    let conn = Arc::new(Connection::new(&identity, tx.clone()));
    info!(event = "agent_connected", identity = %identity, conn_id = conn.id());

    // A live socket claims the identity: any heartbeat session ends and any
    // previous socket is displaced.
    app.presence.supersede(&identity).await;
    app.registry.connect(conn.clone()).await;

    let idle_window = app.config.idle_window;
    loop {
        tokio::select! {
            _ = conn.closed() => {
                debug!(event = "connection_displaced", identity = %identity, conn_id = conn.id());
                let _ = conn
                    .send(Message::Close(Some(CloseFrame {
                        code: 1008,
                        reason: "superseded".into(),
                    })))
                    .await;
                break;
            }
            next = tokio::time::timeout(idle_window, ws_receiver.next()) => {
                let msg = match next {
                    // The read deadline is the only silence detector on this
                    // transport; no heartbeat interval is negotiated.
                    Err(_) => {
                        info!(event = "read_deadline", identity = %identity, conn_id = conn.id());
                        break;
                    }
                    Ok(None) => break,
                    Ok(Some(Err(err))) => {
                        warn!(event = "read_error", identity = %identity, conn_id = conn.id(), error = %err);
                        break;
                    }
                    Ok(Some(Ok(msg))) => msg,
                };
                let data = match msg {
                    Message::Text(text) => text.into_bytes(),
                    Message::Binary(bytes) => bytes,
                    Message::Close(_) => {
                        info!(event = "agent_close", identity = %identity, conn_id = conn.id());
                        break;
                    }
                    Message::Ping(_) | Message::Pong(_) => continue,
                };
                if data.len() > MAX_FRAME_BYTES {
                    warn!(event = "frame_too_large", identity = %identity, size = data.len());
                    continue;
                }
                if let Err(err) = app.pipeline.ingest_frame(&identity, &data).await {
                    // Soft protocol error; the connection stays open.
                    debug!(event = "frame_rejected", identity = %identity, error = %err);
                    let reply = serde_json::json!({"status": "error", "error": err.to_string()});
                    let _ = conn.send_json(&reply).await;
                }
            }
        }
    }

    app.registry.disconnect_conditionally(&conn).await;
    info!(event = "agent_disconnected", identity = %identity, conn_id = conn.id());
    // Both sender clones must go before the writer drains and exits.
    drop(conn);
    drop(tx);
    let _ = write_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notify::testing::RecordingSink;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio_tungstenite::tungstenite;
    use vigil_core::task::PingTask;

    type AgentSocket =
        tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>;

    async fn launch(idle_ms: u64) -> (SocketAddr, Arc<AppState>, Arc<RecordingSink>, Arc<Store>) {
        let store = Arc::new(Store::open_in_memory().expect("open store"));
        store
            .upsert_client("agent-1", "tok-1", "test agent")
            .expect("seed client");
        let sink = Arc::new(RecordingSink::default());
        let config = Config {
            addr: "127.0.0.1:0".to_string(),
            db_path: std::path::PathBuf::from(":memory:"),
            idle_window: Duration::from_millis(idle_ms),
            history_ttl: Duration::from_secs(60),
            write_timeout: Duration::from_secs(1),
            debug: false,
            log_dir: String::new(),
        };
        let app = AppState::new(config, store.clone(), sink.clone());
        let router = build_router(app.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("local addr");
        tokio::spawn(async move {
            axum::serve(listener, router).await.expect("serve");
        });
        (addr, app, sink, store)
    }

    async fn http_request(addr: SocketAddr, method: &str, path: &str, body: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.expect("connect");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: vigil-test\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        );
        stream.write_all(request.as_bytes()).await.expect("write");
        let mut response = String::new();
        stream.read_to_string(&mut response).await.expect("read");
        response
    }

    async fn connect_agent(addr: SocketAddr, token: &str) -> AgentSocket {
        let (socket, _) =
            tokio_tungstenite::connect_async(format!("ws://{addr}/api/clients/report?token={token}"))
                .await
                .expect("ws connect");
        socket
    }

    async fn wait_for_latest(app: &Arc<AppState>, identity: &str, usage: f64) {
        for _ in 0..100 {
            if let Some(report) = app.pipeline.latest(identity).await {
                if (report.cpu.usage - usage).abs() < f64::EPSILON {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("latest report for {identity} never reached cpu {usage}");
    }

    async fn wait_until_closed(socket: &mut AgentSocket) {
        let deadline = tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                match socket.next().await {
                    None => break,
                    Some(Err(_)) => break,
                    Some(Ok(tungstenite::Message::Close(_))) => break,
                    Some(Ok(_)) => continue,
                }
            }
        });
        deadline.await.expect("socket should close in time");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_report_marks_client_online_once() {
        let (addr, app, sink, _store) = launch(60_000).await;

        let response = http_request(
            addr,
            "POST",
            "/api/clients/report",
            r#"{"uuid":"agent-1","cpu":{"usage":0.0}}"#,
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("success"));

        let latest = app.pipeline.latest("agent-1").await.expect("latest");
        assert_eq!(latest.cpu.usage, 0.01);

        let response = http_request(
            addr,
            "POST",
            "/api/clients/report",
            r#"{"uuid":"agent-1","cpu":{"usage":5.0}}"#,
        )
        .await;
        assert!(response.contains("success"));
        let latest = app.pipeline.latest("agent-1").await.expect("latest");
        assert_eq!(latest.cpu.usage, 5.0);

        assert_eq!(sink.online_count("agent-1"), 1);
        assert_eq!(sink.offline_count("agent-1"), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_identity_falls_back_to_the_token() {
        let (addr, app, _sink, _store) = launch(60_000).await;

        let response = http_request(
            addr,
            "POST",
            "/api/clients/report?token=tok-1",
            r#"{"cpu":{"usage":1.0}}"#,
        )
        .await;
        assert!(response.contains("success"));
        assert!(app.pipeline.latest("agent-1").await.is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn heartbeat_without_any_identity_is_rejected() {
        let (addr, app, _sink, _store) = launch(60_000).await;

        let response =
            http_request(addr, "POST", "/api/clients/report", r#"{"cpu":{"usage":1.0}}"#).await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
        assert!(response.contains("uuid is required"));
        assert!(app.pipeline.latest_all().await.is_empty());

        let response = http_request(addr, "POST", "/api/clients/report", "not json").await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_rejects_missing_and_bad_tokens_uniformly() {
        let (addr, _app, _sink, _store) = launch(60_000).await;

        for url in [
            format!("ws://{addr}/api/clients/report"),
            format!("ws://{addr}/api/clients/report?token=bogus"),
        ] {
            let result = tokio_tungstenite::connect_async(url).await;
            assert!(result.is_err(), "upgrade must be refused");
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_takeover_keeps_the_new_connection() {
        let (addr, app, sink, _store) = launch(60_000).await;

        let mut first = connect_agent(addr, "tok-1").await;
        first
            .send(tungstenite::Message::Text(
                r#"{"type":"report","cpu":{"usage":3.0}}"#.to_string(),
            ))
            .await
            .expect("send report");
        wait_for_latest(&app, "agent-1", 3.0).await;

        let mut second = connect_agent(addr, "tok-1").await;
        wait_until_closed(&mut first).await;

        second
            .send(tungstenite::Message::Text(
                r#"{"cpu":{"usage":7.0}}"#.to_string(),
            ))
            .await
            .expect("send report on new connection");
        wait_for_latest(&app, "agent-1", 7.0).await;

        // The first session got exactly one Offline; the second is Active.
        let token = app
            .registry
            .canonical_token("agent-1")
            .await
            .expect("canonical connection");
        assert_eq!(sink.online_count("agent-1"), 2);
        assert_eq!(sink.offline_count("agent-1"), 1);

        second.close(None).await.expect("close");
        for _ in 0..100 {
            if app.registry.canonical_token("agent-1").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.registry.canonical_token("agent-1").await, None);
        assert_eq!(sink.offline_count("agent-1"), 2);
        let events = sink.events();
        let last = events.last().expect("final event");
        assert_eq!(last, &("agent-1".to_string(), token, false));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn unknown_frame_gets_a_soft_error_and_the_connection_survives() {
        let (addr, app, _sink, _store) = launch(60_000).await;

        let mut agent = connect_agent(addr, "tok-1").await;
        agent
            .send(tungstenite::Message::Text(
                r#"{"type":"telemetry_v2"}"#.to_string(),
            ))
            .await
            .expect("send unknown frame");

        let reply = tokio::time::timeout(Duration::from_secs(2), agent.next())
            .await
            .expect("reply in time")
            .expect("stream open")
            .expect("frame ok");
        let tungstenite::Message::Text(text) = reply else {
            panic!("expected text error reply, got {reply:?}");
        };
        assert!(text.contains("unknown message type"), "{text}");

        agent
            .send(tungstenite::Message::Text(
                r#"{"cpu":{"usage":1.5}}"#.to_string(),
            ))
            .await
            .expect("connection still usable");
        wait_for_latest(&app, "agent-1", 1.5).await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_ping_result_reaches_the_store() {
        let (addr, _app, _sink, store) = launch(60_000).await;

        let mut agent = connect_agent(addr, "tok-1").await;
        agent
            .send(tungstenite::Message::Text(
                r#"{"type":"ping_result","task_id":5,"value":42,"ping_type":"icmp","finished_at":"2026-08-01T10:00:00Z"}"#.to_string(),
            ))
            .await
            .expect("send ping result");

        for _ in 0..100 {
            if !store.ping_records_for_client("agent-1").expect("records").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let records = store.ping_records_for_client("agent-1").expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_websocket_is_disconnected_at_the_deadline() {
        let (addr, app, sink, _store) = launch(300).await;

        let mut agent = connect_agent(addr, "tok-1").await;
        for _ in 0..100 {
            if app.registry.canonical_token("agent-1").await.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Stay silent past the idle window: the server must hang up.
        wait_until_closed(&mut agent).await;
        for _ in 0..100 {
            if app.registry.canonical_token("agent-1").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(app.registry.canonical_token("agent-1").await, None);
        assert_eq!(sink.online_count("agent-1"), 1);
        assert_eq!(sink.offline_count("agent-1"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn websocket_supersedes_the_heartbeat_session() {
        let (addr, app, sink, _store) = launch(60_000).await;

        http_request(
            addr,
            "POST",
            "/api/clients/report",
            r#"{"uuid":"agent-1","cpu":{"usage":1.0}}"#,
        )
        .await;
        assert!(app.presence.online_token("agent-1").await.is_some());

        let _agent = connect_agent(addr, "tok-1").await;
        for _ in 0..100 {
            if app.presence.online_token("agent-1").await.is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(app.presence.online_token("agent-1").await.is_none());
        // Heartbeat session Offline, then socket Online.
        assert_eq!(sink.online_count("agent-1"), 2);
        assert_eq!(sink.offline_count("agent-1"), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn ping_tasks_and_results_roundtrip_over_http() {
        let (addr, _app, _sink, store) = launch(60_000).await;
        store
            .insert_ping_task(&PingTask {
                id: 5,
                client: "agent-1".to_string(),
                kind: "icmp".to_string(),
                target: "198.51.100.7".to_string(),
                interval_secs: 60,
            })
            .expect("seed task");

        let response = http_request(addr, "GET", "/api/clients/tasks?token=tok-1", "").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"id\":5"));
        assert!(response.contains("198.51.100.7"));

        let response = http_request(addr, "GET", "/api/clients/tasks", "").await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");

        let response = http_request(
            addr,
            "POST",
            "/api/clients/task/result?token=tok-1",
            r#"{"task_id":5,"value":23,"ping_type":"icmp","finished_at":"2026-08-01T10:00:00Z"}"#,
        )
        .await;
        assert!(response.contains("success"), "{response}");
        let records = store.ping_records_for_client("agent-1").expect("records");
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, 23);

        let response = http_request(
            addr,
            "POST",
            "/api/clients/task/result?token=tok-1",
            r#"{"value":23}"#,
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 400"), "{response}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn public_settings_and_status_read_paths() {
        let (addr, _app, _sink, store) = launch(60_000).await;
        store
            .set_setting("site_name", &serde_json::json!("vigil"))
            .expect("seed setting");

        let response = http_request(addr, "GET", "/api/public", "").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("site_name"));

        http_request(
            addr,
            "POST",
            "/api/clients/report",
            r#"{"uuid":"agent-1","cpu":{"usage":2.0}}"#,
        )
        .await;
        let response = http_request(addr, "GET", "/api/status", "").await;
        assert!(response.contains("agent-1"));
        assert!(response.contains("\"online\":true"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn recent_endpoint_serves_the_recency_buffer() {
        let (addr, _app, _sink, _store) = launch(60_000).await;

        for usage in [1.0, 2.0] {
            http_request(
                addr,
                "POST",
                "/api/clients/report",
                &format!(r#"{{"uuid":"agent-1","cpu":{{"usage":{usage}}}}}"#),
            )
            .await;
        }

        let response = http_request(addr, "GET", "/api/recent/agent-1", "").await;
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("\"online\":true"));
        assert!(response.contains("\"history\""));
        assert!(response.contains("\"usage\":2.0"));

        let response = http_request(addr, "GET", "/api/recent/ghost", "").await;
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    }
}
