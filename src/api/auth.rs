// 登录与会话令牌接口。
use crate::api::errors::{error_response, error_response_with_detail};
use crate::auth::extract_bearer_token;
use crate::state::SharedState;
use crate::storage::UserAccountRecord;
use crate::user_store::UserStore;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

#[derive(Debug, Deserialize)]
pub(crate) struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Resolves the bearer token to an active account, or produces the
/// uniform 401 response.
pub(crate) fn require_user(
    state: &SharedState,
    headers: &HeaderMap,
) -> Result<UserAccountRecord, Response> {
    let Some(token) = extract_bearer_token(headers) else {
        return Err(error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("AUTH_REQUIRED"),
            "missing bearer token",
            None,
            None,
        ));
    };
    match state.users.authenticate_token(&token) {
        Ok(Some(user)) => Ok(user),
        Ok(None) => Err(error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("UNAUTHORIZED"),
            "invalid or expired token",
            None,
            None,
        )),
        Err(err) => Err(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )),
    }
}

pub(crate) async fn login(
    State(state): State<SharedState>,
    Json(request): Json<LoginRequest>,
) -> Response {
    match state.users.login(&request.username, &request.password) {
        Ok(session) => {
            info!(user = %session.user.user_id, "用户登录");
            Json(json!({
                "ok": true,
                "token": session.token.token,
                "expires_at": session.token.expires_at,
                "user": UserStore::to_profile(&session.user),
            }))
            .into_response()
        }
        Err(err) => error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("UNAUTHORIZED"),
            err.to_string(),
            Some("Check username and password."),
            None,
        ),
    }
}

pub(crate) async fn me(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    let user = match require_user(&state, &headers) {
        Ok(user) => user,
        Err(response) => return response,
    };
    Json(json!({ "ok": true, "user": UserStore::to_profile(&user) })).into_response()
}

pub(crate) async fn logout(State(state): State<SharedState>, headers: HeaderMap) -> Response {
    if let Some(token) = extract_bearer_token(&headers) {
        if let Err(err) = state.users.logout(&token) {
            return error_response(StatusCode::INTERNAL_SERVER_ERROR, err.to_string());
        }
    }
    Json(json!({ "ok": true })).into_response()
}
