use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tower_http::{cors::CorsLayer, services::ServeDir};

use crate::{config::CreateServer, error::Error, state::AppState, state::ServerType};

#[derive(Serialize)]
struct ApiError {
    error: String,
    kind: &'static str,
}

fn err_response(status: StatusCode, kind: &'static str, msg: impl Into<String>) -> Response {
    (
        status,
        Json(ApiError {
            error: msg.into(),
            kind,
        }),
    )
        .into_response()
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidState { .. } | Error::NotRunning(_) | Error::NotConnected => {
                StatusCode::CONFLICT
            }
            Error::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            Error::ProtocolTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            Error::ProtocolAuth | Error::Protocol(_) => StatusCode::BAD_GATEWAY,
            Error::Process(_) | Error::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!("{}", self);
        }
        err_response(status, self.kind(), self.to_string())
    }
}

pub fn router(state: AppState) -> Router {
    let public = state.config.agent.public_directory.clone();
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(realtime_ws))
        .route("/api/servers/types", get(server_types))
        .route("/api/servers", get(list_servers).post(create_server))
        .route("/api/servers/{id}", get(get_server).delete(delete_server))
        .route("/api/servers/{id}/start", post(start_server_handler))
        .route("/api/servers/{id}/stop", post(stop_server_handler))
        .route("/api/servers/{id}/restart", post(restart_server_handler))
        .route("/api/servers/{id}/command", post(command_handler))
        .route(
            "/api/servers/{id}/console",
            post(attach_console).delete(detach_console),
        )
        .route("/api/servers/{id}/stats", get(stats))
        .route("/api/servers/{id}/stats/latest", get(latest_stats))
        .route("/api/servers/{id}/monitor/start", post(start_monitoring))
        .route("/api/servers/{id}/monitor/stop", post(stop_monitoring))
        .layer(CorsLayer::permissive())
        .with_state(state)
        .fallback_service(ServeDir::new(public))
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn server_types() -> impl IntoResponse {
    Json(ServerType::ALL)
}

pub async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.supervisor.list().await)
}

pub async fn get_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    Ok(Json(state.supervisor.get(&id).await?))
}

pub async fn create_server(
    State(state): State<AppState>,
    Json(input): Json<CreateServer>,
) -> Result<impl IntoResponse, Error> {
    let created = state.supervisor.create(input).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

pub async fn delete_server(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    state.supervisor.delete(&id).await?;
    state.monitor.stop_monitoring(&id);
    Ok(StatusCode::NO_CONTENT)
}

pub async fn start_server_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    state.supervisor.start(&id).await?;
    Ok(Json(json!({ "status": "starting" })))
}

pub async fn stop_server_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    state.supervisor.stop(&id).await?;
    Ok(Json(json!({ "status": "stopped" })))
}

pub async fn restart_server_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    state.supervisor.restart(&id).await?;
    Ok(Json(json!({ "status": "restarting" })))
}

#[derive(Deserialize)]
pub struct CommandBody {
    command: String,
}

pub async fn command_handler(
    Path(id): Path<String>,
    State(state): State<AppState>,
    Json(body): Json<CommandBody>,
) -> Result<Response, Error> {
    if body.command.trim().is_empty() {
        return Ok(err_response(
            StatusCode::BAD_REQUEST,
            "invalid_config",
            "command must not be empty",
        ));
    }
    state.supervisor.send_command(&id, &body.command).await?;
    Ok(Json(json!({ "success": true })).into_response())
}

pub async fn attach_console(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    state.supervisor.attach_console(&id).await?;
    Ok(Json(json!({ "success": true })))
}

pub async fn detach_console(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, Error> {
    state.supervisor.detach_console(&id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn stats(Path(id): Path<String>, State(state): State<AppState>) -> impl IntoResponse {
    Json(state.monitor.get_stats(&id))
}

pub async fn latest_stats(Path(id): Path<String>, State(state): State<AppState>) -> Response {
    match state.monitor.get_latest_stats(&id) {
        Some(sample) => Json(sample).into_response(),
        None => err_response(StatusCode::NOT_FOUND, "not_found", "No stats available"),
    }
}

pub async fn start_monitoring(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.monitor.start_monitoring(&id);
    Json(json!({ "success": true }))
}

pub async fn stop_monitoring(
    Path(id): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    state.monitor.stop_monitoring(&id);
    Json(json!({ "success": true }))
}

pub async fn realtime_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_realtime_ws(socket, state))
}

async fn handle_realtime_ws(socket: WebSocket, state: AppState) {
    let (conn, mut outbox) = state.fanout.connect();
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(text) = outbox.recv().await {
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => state.fanout.handle_message(conn, text.as_str()).await,
            Ok(Message::Close(_)) | Err(_) => break,
            _ => {}
        }
    }

    state.fanout.disconnect(conn);
    writer.abort();
}
