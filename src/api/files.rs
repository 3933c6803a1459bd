// 容器内文件接口：读写走运行时 exec，不经过宿主机文件系统。
use crate::api::auth::require_user;
use crate::api::errors::{container_error_response, error_response, runtime_error_response};
use crate::files;
use crate::state::SharedState;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Deserialize)]
pub(crate) struct PathQuery {
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WriteFileRequest {
    pub path: String,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub content_base64: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct RenameRequest {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct TreeQuery {
    #[serde(default)]
    pub path: Option<String>,
}

/// Ownership plus running-state check shared by every file handler.
fn resolve_handle(
    state: &SharedState,
    headers: &HeaderMap,
    session_id: &str,
) -> Result<String, Response> {
    let user = require_user(state, headers)?;
    state
        .manager
        .get_owned(session_id, &user.user_id)
        .map_err(container_error_response)?;
    state
        .manager
        .running_handle(session_id)
        .map_err(container_error_response)
}

pub(crate) async fn read_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Response {
    let handle = match resolve_handle(&state, &headers, &session_id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let runtime = state.manager.runtime();
    match files::read_file(runtime.as_ref(), &handle, &query.path).await {
        Ok(bytes) => {
            let text = String::from_utf8(bytes.clone()).ok();
            Json(json!({
                "ok": true,
                "path": query.path,
                "content": text,
                "content_base64": BASE64.encode(&bytes),
                "size": bytes.len(),
            }))
            .into_response()
        }
        Err(err) => runtime_error_response(err),
    }
}

pub(crate) async fn write_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<WriteFileRequest>,
) -> Response {
    let handle = match resolve_handle(&state, &headers, &session_id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let content = match (request.content_base64, request.content) {
        (Some(encoded), _) => match BASE64.decode(encoded.trim()) {
            Ok(bytes) => bytes,
            Err(err) => {
                return error_response(StatusCode::BAD_REQUEST, format!("invalid base64: {err}"))
            }
        },
        (None, Some(text)) => text.into_bytes(),
        (None, None) => Vec::new(),
    };
    let runtime = state.manager.runtime();
    match files::write_file(runtime.as_ref(), &handle, &request.path, &content).await {
        Ok(()) => {
            state.manager.touch(&session_id);
            Json(json!({ "ok": true, "path": request.path })).into_response()
        }
        Err(err) => runtime_error_response(err),
    }
}

pub(crate) async fn delete_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<PathQuery>,
) -> Response {
    let handle = match resolve_handle(&state, &headers, &session_id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let runtime = state.manager.runtime();
    match files::delete_file(runtime.as_ref(), &handle, &query.path).await {
        Ok(()) => {
            state.manager.touch(&session_id);
            Json(json!({ "ok": true, "path": query.path })).into_response()
        }
        Err(err) => runtime_error_response(err),
    }
}

pub(crate) async fn rename_file(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(request): Json<RenameRequest>,
) -> Response {
    let handle = match resolve_handle(&state, &headers, &session_id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let runtime = state.manager.runtime();
    match files::rename_file(runtime.as_ref(), &handle, &request.from, &request.to).await {
        Ok(()) => {
            state.manager.touch(&session_id);
            Json(json!({ "ok": true, "from": request.from, "to": request.to })).into_response()
        }
        Err(err) => runtime_error_response(err),
    }
}

pub(crate) async fn list_tree(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Query(query): Query<TreeQuery>,
) -> Response {
    let handle = match resolve_handle(&state, &headers, &session_id) {
        Ok(handle) => handle,
        Err(response) => return response,
    };
    let root = query
        .path
        .unwrap_or_else(|| state.config.container.workdir.clone());
    let runtime = state.manager.runtime();
    match files::list_tree(runtime.as_ref(), &handle, &root).await {
        Ok(entries) => Json(json!({ "ok": true, "root": root, "entries": entries })).into_response(),
        Err(err) => runtime_error_response(err),
    }
}
