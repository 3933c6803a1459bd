use crate::container::ContainerError;
use crate::runtime::RuntimeError;
use axum::http::header::{HeaderName, HeaderValue};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

pub(crate) const TRACE_HEADER: &str = "x-trace-id";
pub(crate) const ERROR_CODE_HEADER: &str = "x-error-code";

#[derive(Debug, Clone)]
pub(crate) struct ErrorMeta {
    pub code: String,
    pub message: String,
    pub status: u16,
    pub hint: String,
    pub trace_id: String,
    pub timestamp: f64,
}

impl ErrorMeta {
    pub(crate) fn to_value(&self) -> Value {
        json!({
            "code": self.code,
            "message": self.message,
            "status": self.status,
            "hint": self.hint,
            "trace_id": self.trace_id,
            "timestamp": self.timestamp,
        })
    }
}

pub(crate) fn build_error_meta(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    hint: Option<&str>,
) -> ErrorMeta {
    let message = message.into();
    let code = code
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_error_code(status))
        .to_string();
    let hint = hint
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default_hint(status))
        .to_string();
    ErrorMeta {
        code,
        message,
        status: status.as_u16(),
        hint,
        trace_id: format!("err_{}", Uuid::new_v4().simple()),
        timestamp: now_unix_seconds(),
    }
}

pub fn error_response(status: StatusCode, message: impl Into<String>) -> Response {
    error_response_with_detail(status, None, message, None, None)
}

pub fn error_response_with_detail(
    status: StatusCode,
    code: Option<&str>,
    message: impl Into<String>,
    hint: Option<&str>,
    detail: Option<Value>,
) -> Response {
    let meta = build_error_meta(status, code, message, hint);
    let detail = build_detail_payload(&meta.message, detail);
    let payload = json!({
        "ok": false,
        "error": meta.to_value(),
        "detail": detail,
    });

    let mut response = (status, Json(payload)).into_response();
    if let Ok(value) = HeaderValue::from_str(&meta.trace_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(TRACE_HEADER), value);
    }
    if let Ok(value) = HeaderValue::from_str(&meta.code) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(ERROR_CODE_HEADER), value);
    }
    response
}

/// 生命周期错误到 HTTP 的统一映射，所有 handler 共用。
pub(crate) fn container_error_response(err: ContainerError) -> Response {
    match err {
        ContainerError::AlreadyHasActiveContainer => error_response_with_detail(
            StatusCode::CONFLICT,
            Some("ALREADY_HAS_ACTIVE_CONTAINER"),
            "user already has an active container",
            Some("Terminate the existing container before creating a new one."),
            None,
        ),
        ContainerError::SessionNotFound => error_response_with_detail(
            StatusCode::NOT_FOUND,
            Some("SESSION_NOT_FOUND"),
            "session not found",
            None,
            None,
        ),
        ContainerError::AccessDenied => error_response_with_detail(
            StatusCode::FORBIDDEN,
            Some("ACCESS_DENIED"),
            "session belongs to another user",
            None,
            None,
        ),
        ContainerError::CreationFailed(message) => error_response_with_detail(
            StatusCode::BAD_GATEWAY,
            Some("CONTAINER_CREATE_FAILED"),
            message,
            Some("Check the container image and engine health."),
            None,
        ),
        ContainerError::Runtime(err) => runtime_error_response(err),
        ContainerError::Storage(err) => {
            error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
        }
    }
}

pub(crate) fn runtime_error_response(err: RuntimeError) -> Response {
    match err {
        RuntimeError::Unavailable(message) => error_response_with_detail(
            StatusCode::SERVICE_UNAVAILABLE,
            Some("ENGINE_UNAVAILABLE"),
            message,
            Some("The container engine is unreachable; retry once it recovers."),
            None,
        ),
        RuntimeError::NotFound(message) => error_response_with_detail(
            StatusCode::NOT_FOUND,
            Some("CONTAINER_NOT_FOUND"),
            message,
            None,
            None,
        ),
        RuntimeError::NotRunning(message) => error_response_with_detail(
            StatusCode::CONFLICT,
            Some("CONTAINER_NOT_RUNNING"),
            message,
            None,
            None,
        ),
        RuntimeError::ExecFailed { exit_code, stderr } => error_response_with_detail(
            StatusCode::BAD_REQUEST,
            Some("EXEC_FAILED"),
            stderr,
            None,
            Some(json!({ "exit_code": exit_code })),
        ),
        RuntimeError::Rejected(message) => error_response_with_detail(
            StatusCode::BAD_GATEWAY,
            Some("ENGINE_REJECTED"),
            message,
            None,
            None,
        ),
    }
}

fn build_detail_payload(message: &str, detail: Option<Value>) -> Value {
    match detail {
        Some(Value::Object(mut map)) => {
            map.entry("message".to_string())
                .or_insert_with(|| Value::String(message.to_string()));
            Value::Object(map)
        }
        Some(value) => json!({
            "message": message,
            "detail": value,
        }),
        None => json!({
            "message": message,
        }),
    }
}

fn default_error_code(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "BAD_REQUEST",
        StatusCode::UNAUTHORIZED => "UNAUTHORIZED",
        StatusCode::FORBIDDEN => "FORBIDDEN",
        StatusCode::NOT_FOUND => "NOT_FOUND",
        StatusCode::CONFLICT => "CONFLICT",
        StatusCode::PAYLOAD_TOO_LARGE => "PAYLOAD_TOO_LARGE",
        StatusCode::SERVICE_UNAVAILABLE => "SERVICE_UNAVAILABLE",
        StatusCode::BAD_GATEWAY => "ENGINE_REJECTED",
        _ if status.is_server_error() => "INTERNAL_ERROR",
        _ => "REQUEST_ERROR",
    }
}

fn default_hint(status: StatusCode) -> &'static str {
    match status {
        StatusCode::BAD_REQUEST => "Verify request parameters and payload format.",
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            "Check authentication credentials and permission scope."
        }
        StatusCode::NOT_FOUND => "Verify requested resource path or identifier.",
        StatusCode::SERVICE_UNAVAILABLE => "Service may be warming up or the engine is down.",
        _ if status.is_server_error() => "Retry later or contact support with trace_id.",
        _ => "Inspect request and try again.",
    }
}

fn now_unix_seconds() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs_f64())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    #[tokio::test]
    async fn default_error_response_contains_unified_fields() {
        let response = error_response(StatusCode::BAD_REQUEST, "invalid payload");
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let trace_id = response
            .headers()
            .get(TRACE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert!(trace_id.starts_with("err_"));

        let error_code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default()
            .to_string();
        assert_eq!(error_code, "BAD_REQUEST");

        let body = to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read response body");
        let payload: Value = serde_json::from_slice(&body).expect("parse response json");

        assert_eq!(payload["ok"], json!(false));
        assert_eq!(payload["error"]["code"], json!("BAD_REQUEST"));
        assert_eq!(payload["error"]["message"], json!("invalid payload"));
        assert_eq!(payload["error"]["status"], json!(400));
        assert_eq!(payload["error"]["trace_id"], json!(trace_id));
        assert!(payload["error"]["timestamp"].as_f64().unwrap_or_default() > 0.0);
        assert_eq!(payload["detail"]["message"], json!("invalid payload"));
    }

    #[tokio::test]
    async fn duplicate_container_maps_to_conflict() {
        let response = container_error_response(ContainerError::AlreadyHasActiveContainer);
        assert_eq!(response.status(), StatusCode::CONFLICT);
        let code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(code, "ALREADY_HAS_ACTIVE_CONTAINER");
    }

    #[tokio::test]
    async fn engine_unavailable_maps_to_service_unavailable() {
        let response =
            runtime_error_response(RuntimeError::Unavailable("daemon down".to_string()));
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let code = response
            .headers()
            .get(ERROR_CODE_HEADER)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        assert_eq!(code, "ENGINE_UNAVAILABLE");
    }
}
