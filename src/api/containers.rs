// 容器生命周期与同步执行接口。
use crate::api::auth::require_user;
use crate::api::errors::{container_error_response, error_response};
use crate::state::SharedState;
use crate::storage::{ContainerSessionRecord, TerminalCommandRecord};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::{json, Value};

#[derive(Debug, Deserialize)]
pub(crate) struct InitialFile {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CreateContainerRequest {
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub initial_files: Vec<InitialFile>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ListQuery {
    #[serde(default)]
    pub active: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct NetworkRequest {
    #[serde(alias = "enabled")]
    pub enable: bool,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ExecRequest {
    pub command: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CommandsQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

fn session_to_json(record: &ContainerSessionRecord) -> Value {
    json!({
        "session_id": record.session_id,
        "user_id": record.user_id,
        "project_id": record.project_id,
        "container_id": record.container_id,
        "status": record.status,
        "image": record.image,
        "cpu_limit": record.cpu_limit,
        "memory_limit_mb": record.memory_limit_mb,
        "created_at": record.created_at,
        "last_activity_at": record.last_activity_at,
        "terminated_at": record.terminated_at,
    })
}

fn command_to_json(record: &TerminalCommandRecord) -> Value {
    json!({
        "session_id": record.session_id,
        "command": record.command,
        "working_dir": record.working_dir,
        "exit_code": record.exit_code,
        "output": record.output,
        "created_at": record.created_at,
        "duration_ms": record.duration_ms,
    })
}

pub(crate) async fn health(State(state): State<SharedState>) -> Response {
    Json(json!({
        "ok": true,
        "degraded": state.manager.is_degraded(),
    }))
    .into_response()
}

pub(crate) async fn create_container(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(request): Json<CreateContainerRequest>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    let mut initial_files = Vec::with_capacity(request.initial_files.len());
    for file in request.initial_files {
        let content = match (file.content_base64, file.content) {
            (Some(encoded), _) => match BASE64.decode(encoded.trim()) {
                Ok(bytes) => bytes,
                Err(err) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        format!("invalid base64 for {}: {err}", file.path),
                    )
                }
            },
            (None, Some(text)) => text.into_bytes(),
            (None, None) => Vec::new(),
        };
        initial_files.push((file.path, content));
    }
    match state
        .manager
        .create(&user.user_id, request.project_id, initial_files)
        .await
    {
        Ok(record) => (
            StatusCode::CREATED,
            Json(json!({ "ok": true, "session": session_to_json(&record) })),
        )
            .into_response(),
        Err(err) => container_error_response(err),
    }
}

pub(crate) async fn list_containers(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Query(query): Query<ListQuery>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state
        .manager
        .list_sessions(&user.user_id, query.active.unwrap_or(false))
    {
        Ok(records) => Json(json!({
            "ok": true,
            "sessions": records.iter().map(session_to_json).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(err) => container_error_response(err),
    }
}

pub(crate) async fn get_container(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    match state.manager.get_owned(&session_id, &user.user_id) {
        Ok(record) => {
            Json(json!({ "ok": true, "session": session_to_json(&record) })).into_response()
        }
        Err(err) => container_error_response(err),
    }
}

pub(crate) async fn delete_container(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    if let Err(err) = state.manager.get_owned(&session_id, &user.user_id) {
        return container_error_response(err);
    }
    state.bridge.drop_session(&session_id);
    match state.terminal.close_session(&session_id).await {
        // terminate 是幂等的：重复删除同样返回 ok，terminated 标记已经在位。
        Ok(terminated) => {
            Json(json!({ "ok": true, "terminated": terminated })).into_response()
        }
        Err(err) => container_error_response(err),
    }
}

pub(crate) async fn set_network(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<NetworkRequest>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    if let Err(err) = state.manager.get_owned(&session_id, &user.user_id) {
        return container_error_response(err);
    }
    let handle = match state.manager.running_handle(&session_id) {
        Ok(handle) => handle,
        Err(err) => return container_error_response(err),
    };
    let applied = if request.enable {
        state.manager.enable_network(&handle).await
    } else {
        state.manager.disable_network(&handle).await
    };
    Json(json!({ "ok": true, "enable": request.enable, "applied": applied })).into_response()
}

pub(crate) async fn exec_command(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<ExecRequest>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    if let Err(err) = state.manager.get_owned(&session_id, &user.user_id) {
        return container_error_response(err);
    }
    match state.terminal.execute_sync(&session_id, &request.command).await {
        Ok(output) => Json(json!({
            "ok": true,
            "exit_code": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
        }))
        .into_response(),
        Err(err) => container_error_response(err),
    }
}

pub(crate) async fn list_commands(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<CommandsQuery>,
) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    if let Err(err) = state.manager.get_owned(&session_id, &user.user_id) {
        return container_error_response(err);
    }
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    match state.storage.list_commands(&session_id, limit) {
        Ok(records) => Json(json!({
            "ok": true,
            "commands": records.iter().map(command_to_json).collect::<Vec<_>>(),
        }))
        .into_response(),
        Err(err) => error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string()),
    }
}
