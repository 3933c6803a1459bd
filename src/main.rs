// Rust 入口：装配状态、挂载 API 路由并优雅停机。
use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, StatusCode};
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::response::Response;
use codebox_server::api::errors::{error_response, error_response_with_detail};
use codebox_server::auth::{extract_bearer_token, extract_query_token, is_protected_path};
use codebox_server::config::{load_config, Config};
use codebox_server::shutdown::shutdown_signal;
use codebox_server::state::{AppState, SharedState};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = load_config();
    init_tracing(&config);

    let state = AppState::new(config.clone())?;
    // 引擎自检与孤儿回收在监听端口之前完成。
    state.manager.startup().await;

    let cancel = CancellationToken::new();
    state.manager.spawn_background(cancel.clone());

    let app = codebox_server::api::build_router(state.clone())
        .layer(from_fn_with_state(state.clone(), auth_guard))
        .layer(build_cors(&config))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(panic_guard));

    let addr = bind_address(&config);
    let listener = tokio::net::TcpListener::bind(addr.as_str()).await?;
    info!("codebox 服务已启动: http://{addr}");

    let server = axum::serve(listener, app).with_graceful_shutdown(shutdown_signal());
    if let Err(err) = server.await {
        warn!("服务退出异常: {err}");
    }

    // 停机顺序：先停后台清扫，再卸载所有终端。容器留给下次启动回收。
    cancel.cancel();
    state.terminal.close_all();

    Ok(())
}

fn init_tracing(config: &Config) {
    let default_level = config.observability.log_level.trim();
    let default_level = if default_level.is_empty() {
        "info".to_string()
    } else {
        default_level.to_lowercase()
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn bind_address(config: &Config) -> String {
    // 保留环境变量覆盖，便于容器化部署。
    let host = std::env::var("CODEBOX_HOST").unwrap_or_else(|_| config.server.host.clone());
    let port = std::env::var("CODEBOX_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(config.server.port);
    format!("{host}:{port}")
}

fn build_cors(config: &Config) -> CorsLayer {
    let mut cors = CorsLayer::new();

    match config.cors.allow_origins.as_deref() {
        Some(origins) if origins.iter().any(|value| value == "*") => {
            cors = cors.allow_origin(Any);
        }
        Some(origins) => {
            let values: Vec<_> = origins
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect();
            if !values.is_empty() {
                cors = cors.allow_origin(AllowOrigin::list(values));
            }
        }
        None => {
            cors = cors.allow_origin(Any);
        }
    }

    match config.cors.allow_methods.as_deref() {
        Some(methods) if methods.iter().any(|value| value == "*") => {
            cors = cors.allow_methods(Any);
        }
        Some(methods) => {
            let values: Vec<_> = methods
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect();
            if !values.is_empty() {
                cors = cors.allow_methods(AllowMethods::list(values));
            }
        }
        None => {
            cors = cors.allow_methods(Any);
        }
    }

    match config.cors.allow_headers.as_deref() {
        Some(headers) if headers.iter().any(|value| value == "*") => {
            cors = cors.allow_headers(Any);
        }
        Some(headers) => {
            let values: Vec<_> = headers
                .iter()
                .filter_map(|value| value.parse().ok())
                .collect();
            if !values.is_empty() {
                cors = cors.allow_headers(AllowHeaders::list(values));
            }
        }
        None => {
            cors = cors.allow_headers(Any);
        }
    }

    if config.cors.allow_credentials.unwrap_or(false) {
        cors = cors.allow_credentials(true);
    }

    cors
}

/// 路径级令牌校验；handler 内部再解析用户身份做属主判断。
async fn auth_guard(
    State(state): State<SharedState>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if request.method() == axum::http::Method::OPTIONS {
        return Ok(next.run(request).await);
    }
    let path = request.uri().path();
    if !is_protected_path(path) {
        return Ok(next.run(request).await);
    }

    let token = extract_bearer_token(request.headers())
        .or_else(|| extract_query_token(request.uri().query()));
    let Some(token) = token else {
        return Ok(error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("AUTH_REQUIRED"),
            "missing bearer token",
            None,
            None,
        ));
    };
    match state.users.authenticate_token(&token) {
        Ok(Some(_)) => Ok(next.run(request).await),
        Ok(None) => Ok(error_response_with_detail(
            StatusCode::UNAUTHORIZED,
            Some("UNAUTHORIZED"),
            "invalid or expired token",
            None,
            None,
        )),
        Err(err) => Ok(error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            err.to_string(),
        )),
    }
}

async fn panic_guard(request: Request<Body>, next: Next) -> Result<Response, StatusCode> {
    let method = request.method().clone();
    let path = request.uri().path().to_string();
    let result = AssertUnwindSafe(next.run(request)).catch_unwind().await;
    match result {
        Ok(response) => Ok(response),
        Err(panic) => {
            let detail = panic_message(panic.as_ref());
            error!("panic while handling {method} {path}: {detail}");
            Ok(error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal error",
            ))
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        return message.to_string();
    }
    if let Some(message) = panic.downcast_ref::<String>() {
        return message.clone();
    }
    "unknown panic".to_string()
}
