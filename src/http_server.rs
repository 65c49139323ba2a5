//! HTTP server implementation using Axum.

use crate::error::{Error, Result};
use crate::provision::ProgressEvent;
use crate::pty::PtySession;
use crate::state::{AppState, REAPER_INTERVAL_SECS};
use crate::terminal::SendMode;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, Query, State},
    http::StatusCode,
    response::Response,
    routing::{delete, get, post},
    Json, Router,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info};

// Request types
#[derive(Deserialize)]
struct RegisterRequest {
    username: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginRequest {
    identifier: String,
    password: String,
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

#[derive(Deserialize)]
struct CreateEnvironmentRequest {
    user_id: String,
}

#[derive(Deserialize)]
struct ExecuteRequest {
    code: String,
    #[serde(default)]
    input: String,
}

#[derive(Deserialize)]
struct WriteFileRequest {
    /// Base64-encoded file body.
    content: String,
}

#[derive(Deserialize)]
struct SendRequest {
    command: String,
    #[serde(default)]
    mode: SendMode,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        // Identity
        .route("/api/register", post(register))
        .route("/api/login", post(login))
        .route("/api/user_info", get(user_info))
        // Environments
        .route("/environments", post(create_environment))
        .route("/environments/:id", get(get_environment))
        .route("/users/:user_id/environment", get(user_environment))
        .route("/environments/:id/execute", post(execute))
        .route("/environments/:id/files/*path", get(read_file).put(write_file))
        .route(
            "/environments/:id/provision",
            get(provision_status)
                .post(start_provisioning)
                .delete(cancel_provisioning),
        )
        .route("/environments/:id/provision/events", get(provision_events))
        // Terminals
        .route("/environments/:id/terminals", post(open_terminal))
        .route("/terminals/:id", delete(close_terminal))
        .route("/terminals/:id/send", post(send_to_terminal))
        .route("/terminals/:id/output", get(terminal_output))
        .route("/terminals/:id/ws", get(terminal_socket))
        // Health check
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Run the HTTP server on the given port with the provided state.
pub async fn run_server(port: u16, state: AppState) -> std::io::Result<()> {
    let reaper = state
        .terminals
        .spawn_reaper(Duration::from_secs(REAPER_INTERVAL_SECS));
    let terminals = state.terminals.clone();

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Starting HTTP server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    reaper.abort();
    terminals.close_all().await;
    info!("HTTP server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
}

async fn health() -> &'static str {
    "OK"
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<Value>> {
    let response = state
        .identity
        .register(&req.username, &req.email, &req.password)
        .await?;
    Ok(Json(json!({
        "status": "success",
        "message": response.message.unwrap_or_else(|| "Registered".to_string()),
    })))
}

/// Authenticate, then make sure the user has an environment to work in.
async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<Json<Value>> {
    let session = state.identity.login(&req.identifier, &req.password).await?;
    let env = state.environments.create_or_get(&session.user_id).await?;
    info!(user_id = %session.user_id, env_id = %env.id(), "User logged in");
    Ok(Json(json!({
        "status": "success",
        "token": session.token,
        "user": session.data,
        "environment": env.info(),
    })))
}

async fn user_info(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<Value>> {
    let response = state.identity.get_user_info(&query.token).await?;
    Ok(Json(json!({
        "status": "success",
        "data": response.data,
    })))
}

async fn create_environment(
    State(state): State<AppState>,
    Json(req): Json<CreateEnvironmentRequest>,
) -> Result<Json<Value>> {
    let env = state.environments.create_or_get(&req.user_id).await?;
    Ok(Json(json!({ "status": "success", "environment": env.info() })))
}

async fn get_environment(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let env = state.environments.get(&id).await?;
    Ok(Json(json!({ "status": "success", "environment": env.info() })))
}

async fn user_environment(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>> {
    let env = state
        .environments
        .current_for(&user_id)
        .await
        .ok_or_else(|| Error::not_found("environment for user", user_id))?;
    Ok(Json(json!({ "status": "success", "environment": env.info() })))
}

async fn execute(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ExecuteRequest>,
) -> Result<Json<Value>> {
    state.environments.get(&id).await?;
    let result = state.engine.execute(&id, &req.code, &req.input).await;
    let failure = result.failure(state.engine.run_timeout());

    let mut body = serde_json::to_value(&result)
        .map_err(|e| Error::Io(std::io::Error::other(e)))?;
    body["status"] = json!(if failure.is_some() { "error" } else { "success" });
    if let Some(failure) = failure {
        if body.get("message").is_none() {
            body["message"] = json!(failure.to_string());
        }
    }
    Ok(Json(body))
}

async fn read_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
) -> Result<Json<Value>> {
    let env = state.environments.get(&id).await?;
    let content = env.read_file(&path).await?;
    Ok(Json(json!({
        "status": "success",
        "path": path,
        "content": BASE64.encode(content),
    })))
}

async fn write_file(
    State(state): State<AppState>,
    Path((id, path)): Path<(String, String)>,
    Json(req): Json<WriteFileRequest>,
) -> Result<Json<Value>> {
    let env = state.environments.get(&id).await?;
    let content = BASE64
        .decode(req.content.as_bytes())
        .map_err(|e| Error::InvalidInput(format!("content is not valid base64: {}", e)))?;
    env.write_file(&path, &content).await?;
    debug!(env_id = %id, path = %path, bytes = content.len(), "Wrote file");
    Ok(Json(json!({ "status": "success", "path": path, "bytes": content.len() })))
}

async fn start_provisioning(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<(StatusCode, Json<Value>)> {
    state.provisioner.start(&id).await?;
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "status": "accepted", "environment_id": id })),
    ))
}

async fn cancel_provisioning(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let cancelled = state.provisioner.cancel(&id).await?;
    Ok(Json(json!({ "status": "success", "cancelled": cancelled })))
}

async fn provision_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let env = state.environments.get(&id).await?;
    let ready = state.environments.provisioning_status(&id).await?;
    Ok(Json(json!({
        "status": "success",
        "state": env.state(),
        "ready": ready,
        "running": state.provisioner.is_running(&id),
        "last_event": state.provisioner.last_event(&id),
    })))
}

async fn provision_events(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let receiver = state.provisioner.subscribe(&id).await?;
    let last = state.provisioner.last_event(&id);
    Ok(ws.on_upgrade(move |socket| stream_progress(socket, receiver, last)))
}

/// Forward progress events until the job's final one. With no job running,
/// send the last known event and hang up.
async fn stream_progress(
    mut socket: WebSocket,
    receiver: Option<broadcast::Receiver<ProgressEvent>>,
    last: Option<ProgressEvent>,
) {
    let Some(mut receiver) = receiver else {
        if let Some(event) = last {
            send_event(&mut socket, &event).await;
        }
        let _ = socket.send(Message::Close(None)).await;
        return;
    };

    loop {
        match receiver.recv().await {
            Ok(event) => {
                if !send_event(&mut socket, &event).await || event.terminal {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Progress subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    let _ = socket.send(Message::Close(None)).await;
}

async fn send_event(socket: &mut WebSocket, event: &ProgressEvent) -> bool {
    match serde_json::to_string(event) {
        Ok(text) => socket.send(Message::Text(text)).await.is_ok(),
        Err(_) => false,
    }
}

async fn open_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let env = state.environments.get(&id).await?;
    let session_id = state.terminals.open(&env).await?;
    if let Err(e) = state.environments.record_use(&env) {
        tracing::warn!(env_id = %id, error = %e, "Failed to persist last use");
    }
    Ok(Json(json!({ "status": "success", "session_id": session_id })))
}

async fn send_to_terminal(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<SendRequest>,
) -> Result<Json<Value>> {
    let output = state.terminals.send(&id, &req.command, req.mode).await?;
    Ok(Json(json!({ "status": "success", "output": output })))
}

async fn terminal_output(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>> {
    let output = state.terminals.drain(&id).await?;
    Ok(Json(json!({ "status": "success", "output": output })))
}

async fn close_terminal(State(state): State<AppState>, Path(id): Path<String>) -> StatusCode {
    state.terminals.close(&id).await;
    StatusCode::NO_CONTENT
}

async fn terminal_socket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Result<Response> {
    let session = state.terminals.get(&id).await?;
    Ok(ws.on_upgrade(move |socket| async move {
        pipe_terminal(socket, session).await;
        // The connection owns the session.
        state.terminals.close(&id).await;
    }))
}

/// Relay socket messages to the terminal input and terminal output back to
/// the socket until either side goes away.
async fn pipe_terminal(socket: WebSocket, session: Arc<PtySession>) {
    let (mut sink, mut stream) = socket.split();
    loop {
        tokio::select! {
            chunk = session.next_chunk() => match chunk {
                Some(bytes) => {
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    if sink.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            message = stream.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if session.write_all(text.as_bytes()).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(bytes))) => {
                    if session.write_all(&bytes).await.is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!(session_id = %session.id(), "Terminal socket closed");
    let _ = sink.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::execution::tests::shell_toolchain;
    use crate::identity::tests::spawn_fake_identity;
    use crate::sandbox::SandboxTool;
    use crate::store::MemoryStore;
    use tempfile::TempDir;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    struct TestApp {
        base: String,
        addr: SocketAddr,
        http: reqwest::Client,
        _dir: TempDir,
    }

    impl TestApp {
        fn url(&self, path: &str) -> String {
            format!("{}{}", self.base, path)
        }

        async fn environment(&self, user_id: &str) -> String {
            let body: Value = self
                .http
                .post(self.url("/environments"))
                .json(&json!({ "user_id": user_id }))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            body["environment"]["id"].as_str().unwrap().to_string()
        }

        async fn wait_for_provisioning(&self, env_id: &str) -> Value {
            for _ in 0..100 {
                let body: Value = self
                    .http
                    .get(self.url(&format!("/environments/{}/provision", env_id)))
                    .send()
                    .await
                    .unwrap()
                    .json()
                    .await
                    .unwrap();
                if body["running"] == false && !body["last_event"].is_null() {
                    return body;
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
            panic!("provisioning never finished");
        }
    }

    async fn spawn_app(bootstrap: &str) -> TestApp {
        let dir = tempfile::tempdir().unwrap();
        let script = dir.path().join("bootstrap.sh");
        std::fs::write(&script, bootstrap).unwrap();

        let config = Config {
            workspace_dir: dir.path().join("workspace"),
            identity_url: spawn_fake_identity().await,
            bootstrap_script: script,
            max_terminal_sessions: 2,
            terminal_grace: Duration::from_millis(800),
            run_timeout: Duration::from_secs(2),
            max_file_bytes: 16,
            ..Config::default()
        };
        let state = AppState::new(
            &config,
            SandboxTool::unavailable("proot"),
            Arc::new(MemoryStore::default()),
            shell_toolchain(),
        );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(state)).await.unwrap();
        });
        TestApp {
            base: format!("http://{}", addr),
            addr,
            http: reqwest::Client::new(),
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn health_check() {
        let app = spawn_app("").await;
        let response = app.http.get(app.url("/health")).send().await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.text().await.unwrap(), "OK");
    }

    #[tokio::test]
    async fn login_creates_the_users_environment() {
        let app = spawn_app("").await;
        let response = app
            .http
            .post(app.url("/api/login"))
            .json(&json!({ "identifier": "alice", "password": "secret" }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = response.json().await.unwrap();
        assert_eq!(body["token"], "tok-42");
        assert_eq!(body["environment"]["user_id"], "42");

        // The same user gets the same environment back.
        let env_id = body["environment"]["id"].as_str().unwrap();
        assert_eq!(app.environment("42").await, env_id);
        let current: Value = app
            .http
            .get(app.url("/users/42/environment"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(current["environment"]["id"], env_id);
        let by_id: Value = app
            .http
            .get(app.url(&format!("/environments/{}", env_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(by_id["environment"]["state"], "bare");
        let nobody = app.http.get(app.url("/users/7/environment")).send().await.unwrap();
        assert_eq!(nobody.status(), StatusCode::NOT_FOUND);

        let rejected = app
            .http
            .post(app.url("/api/login"))
            .json(&json!({ "identifier": "alice", "password": "wrong" }))
            .send()
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_GATEWAY);
        let body: Value = rejected.json().await.unwrap();
        assert_eq!(body["status"], "error");
        assert!(body["message"].as_str().unwrap().contains("Invalid credentials"));
    }

    #[tokio::test]
    async fn register_and_user_info_pass_through() {
        let app = spawn_app("").await;
        let registered: Value = app
            .http
            .post(app.url("/api/register"))
            .json(&json!({ "username": "a", "email": "a@x", "password": "p" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(registered["status"], "success");

        let info: Value = app
            .http
            .get(app.url("/api/user_info?token=tok-42"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(info["data"]["id"], 42);
    }

    #[tokio::test]
    async fn execute_reports_each_outcome() {
        let app = spawn_app("").await;
        let env_id = app.environment("7").await;
        let url = app.url(&format!("/environments/{}/execute", env_id));

        let ok: Value = app
            .http
            .post(&url)
            .json(&json!({ "code": "read x\necho \"got $x\"\n", "input": "5\n" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(ok["status"], "success");
        assert_eq!(ok["outcome"], "success");
        assert_eq!(ok["stdout"], "got 5\n");
        assert_eq!(ok["exit_code"], 0);

        let broken: Value = app
            .http
            .post(&url)
            .json(&json!({ "code": "if then (\n" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(broken["status"], "error");
        assert_eq!(broken["outcome"], "compile_error");
        assert!(broken["exit_code"].is_null());

        let slow: Value = app
            .http
            .post(&url)
            .json(&json!({ "code": "sleep 30\n" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(slow["outcome"], "runtime_timeout");
        assert_eq!(slow["stdout"], "");

        let missing = app
            .http
            .post(app.url("/environments/nope/execute"))
            .json(&json!({ "code": "echo hi" }))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn files_round_trip_within_the_workspace() {
        let app = spawn_app("").await;
        let env_id = app.environment("8").await;
        let file_url = app.url(&format!("/environments/{}/files/notes/todo.txt", env_id));

        let put = app
            .http
            .put(&file_url)
            .json(&json!({ "content": BASE64.encode("hello") }))
            .send()
            .await
            .unwrap();
        assert_eq!(put.status(), StatusCode::OK);

        let body: Value = app.http.get(&file_url).send().await.unwrap().json().await.unwrap();
        assert_eq!(BASE64.decode(body["content"].as_str().unwrap()).unwrap(), b"hello");

        let scaffolded: Value = app
            .http
            .get(app.url(&format!("/environments/{}/files/Cargo.toml", env_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let manifest = BASE64.decode(scaffolded["content"].as_str().unwrap()).unwrap();
        assert!(String::from_utf8(manifest).unwrap().contains("user_project"));

        let escape = app
            .http
            .get(app.url(&format!("/environments/{}/files/..%2Fsecret", env_id)))
            .send()
            .await
            .unwrap();
        assert_eq!(escape.status(), StatusCode::BAD_REQUEST);

        let too_big = app
            .http
            .put(&file_url)
            .json(&json!({ "content": BASE64.encode([0u8; 32]) }))
            .send()
            .await
            .unwrap();
        assert_eq!(too_big.status(), StatusCode::BAD_REQUEST);

        let missing = app
            .http
            .get(app.url(&format!("/environments/{}/files/absent.txt", env_id)))
            .send()
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn provisioning_runs_to_ready() {
        let app = spawn_app("echo unpacking\necho configuring\n").await;
        let env_id = app.environment("9").await;

        let started = app
            .http
            .post(app.url(&format!("/environments/{}/provision", env_id)))
            .send()
            .await
            .unwrap();
        assert_eq!(started.status(), StatusCode::ACCEPTED);

        let status = app.wait_for_provisioning(&env_id).await;
        assert_eq!(status["state"], "ready");
        assert_eq!(status["ready"], true);
        assert_eq!(status["last_event"]["stage"], "complete");
        assert_eq!(status["last_event"]["percent"], 100);
    }

    #[tokio::test]
    async fn second_start_conflicts_and_cancel_stops_the_job() {
        let app = spawn_app("echo starting\nsleep 30\n").await;
        let env_id = app.environment("10").await;
        let url = app.url(&format!("/environments/{}/provision", env_id));

        assert_eq!(
            app.http.post(&url).send().await.unwrap().status(),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            app.http.post(&url).send().await.unwrap().status(),
            StatusCode::CONFLICT
        );

        let cancelled: Value = app.http.delete(&url).send().await.unwrap().json().await.unwrap();
        assert_eq!(cancelled["cancelled"], true);

        let status = app.wait_for_provisioning(&env_id).await;
        assert_eq!(status["state"], "failed");
        assert_eq!(status["last_event"]["stage"], "cancelled");
    }

    #[tokio::test]
    async fn provisioning_events_stream_over_websocket() {
        let app = spawn_app("sleep 1\necho unpacking\n").await;
        let env_id = app.environment("11").await;
        app.http
            .post(app.url(&format!("/environments/{}/provision", env_id)))
            .send()
            .await
            .unwrap();

        let (mut socket, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/environments/{}/provision/events",
            app.addr, env_id
        ))
        .await
        .unwrap();

        let mut stages = Vec::new();
        while let Ok(Some(Ok(message))) =
            tokio::time::timeout(Duration::from_secs(10), socket.next()).await
        {
            match message {
                WsMessage::Text(text) => {
                    let event: Value = serde_json::from_str(&text).unwrap();
                    stages.push(event["stage"].as_str().unwrap().to_string());
                }
                WsMessage::Close(_) => break,
                _ => {}
            }
        }
        assert!(stages.contains(&"bootstrap".to_string()), "stages: {stages:?}");
        assert_eq!(stages.last().map(String::as_str), Some("complete"));
    }

    #[tokio::test]
    async fn terminal_lifecycle_over_http() {
        let app = spawn_app("").await;
        let env_id = app.environment("12").await;
        let open_url = app.url(&format!("/environments/{}/terminals", env_id));

        let opened: Value = app.http.post(&open_url).send().await.unwrap().json().await.unwrap();
        let session_id = opened["session_id"].as_str().unwrap().to_string();

        let mut output = String::new();
        let sent: Value = app
            .http
            .post(app.url(&format!("/terminals/{}/send", session_id)))
            .json(&json!({ "command": "echo $((6*7))", "mode": "poll" }))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        output.push_str(sent["output"].as_str().unwrap_or_default());
        for _ in 0..30 {
            if output.contains("42") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
            let polled: Value = app
                .http
                .get(app.url(&format!("/terminals/{}/output", session_id)))
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            output.push_str(polled["output"].as_str().unwrap_or_default());
        }
        assert!(output.contains("42"), "output: {output}");

        // Ceiling is two sessions.
        app.http.post(&open_url).send().await.unwrap();
        let refused = app.http.post(&open_url).send().await.unwrap();
        assert_eq!(refused.status(), StatusCode::TOO_MANY_REQUESTS);

        let closed = app
            .http
            .delete(app.url(&format!("/terminals/{}", session_id)))
            .send()
            .await
            .unwrap();
        assert_eq!(closed.status(), StatusCode::NO_CONTENT);

        let gone = app
            .http
            .post(app.url(&format!("/terminals/{}/send", session_id)))
            .json(&json!({ "command": "true" }))
            .send()
            .await
            .unwrap();
        assert_eq!(gone.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn terminal_websocket_relays_both_ways() {
        let app = spawn_app("").await;
        let env_id = app.environment("13").await;
        let opened: Value = app
            .http
            .post(app.url(&format!("/environments/{}/terminals", env_id)))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        let session_id = opened["session_id"].as_str().unwrap().to_string();

        let (mut socket, _) = tokio_tungstenite::connect_async(format!(
            "ws://{}/terminals/{}/ws",
            app.addr, session_id
        ))
        .await
        .unwrap();
        socket
            .send(WsMessage::Text("echo ws-$((20+22))\n".into()))
            .await
            .unwrap();

        let mut seen = String::new();
        while !seen.contains("ws-42") {
            match tokio::time::timeout(Duration::from_secs(5), socket.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) => seen.push_str(&text),
                Ok(Some(Ok(_))) => {}
                other => panic!("socket ended early: {other:?}, seen: {seen}"),
            }
        }
        drop(socket);

        // Dropping the connection tears the session down.
        let output_url = app.url(&format!("/terminals/{}/output", session_id));
        let mut status = StatusCode::OK;
        for _ in 0..50 {
            status = app.http.get(&output_url).send().await.unwrap().status();
            if status == StatusCode::NOT_FOUND {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
