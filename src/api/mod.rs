// 路由装配：所有 HTTP/WS 接口挂在 /codebox 前缀下。
pub(crate) mod auth;
pub(crate) mod containers;
pub mod errors;
pub(crate) mod files;
pub mod terminal_ws;

use crate::state::SharedState;
use axum::routing::{get, post};
use axum::Router;

pub fn build_router(state: SharedState) -> Router {
    Router::new()
        .route("/codebox/health", get(containers::health))
        .route("/codebox/auth/login", post(auth::login))
        .route("/codebox/auth/logout", post(auth::logout))
        .route("/codebox/auth/me", get(auth::me))
        .route(
            "/codebox/containers",
            post(containers::create_container).get(containers::list_containers),
        )
        .route(
            "/codebox/containers/{session_id}",
            get(containers::get_container).delete(containers::delete_container),
        )
        .route(
            "/codebox/containers/{session_id}/network",
            post(containers::set_network),
        )
        .route(
            "/codebox/containers/{session_id}/exec",
            post(containers::exec_command),
        )
        .route(
            "/codebox/containers/{session_id}/commands",
            get(containers::list_commands),
        )
        .route(
            "/codebox/containers/{session_id}/files",
            get(files::read_file)
                .put(files::write_file)
                .delete(files::delete_file),
        )
        .route(
            "/codebox/containers/{session_id}/files/rename",
            post(files::rename_file),
        )
        .route(
            "/codebox/containers/{session_id}/files/tree",
            get(files::list_tree),
        )
        .route(
            "/codebox/terminal/ws/{session_id}",
            get(terminal_ws::ws_terminal),
        )
        .with_state(state)
}
