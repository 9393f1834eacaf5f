//! Binds HTTP method+path to the handlers and wires up the request
//! pipeline middleware.

use axum::routing::{delete, get, post};
use axum::Router;

use crate::handlers;
use crate::pipeline::pipeline_middleware;
use crate::state::AppState;

/// The route table advertised by `GET /` and the `print-routes` CLI
/// diagnostic.
pub fn route_table() -> serde_json::Value {
    serde_json::json!([
        {"method": "GET", "path": "/"},
        {"method": "GET", "path": "/health"},
        {"method": "GET", "path": "/configs"},
        {"method": "GET", "path": "/config/*name"},
        {"method": "POST", "path": "/config/*name"},
        {"method": "GET", "path": "/backups/*name"},
        {"method": "GET", "path": "/backupcontent/{name}/{filename}"},
        {"method": "POST", "path": "/restore/{name}/{filename}"},
        {"method": "POST", "path": "/action/{name}/{cmd}"},
        {"method": "GET", "path": "/raw/configs"},
        {"method": "POST", "path": "/raw/configs"},
        {"method": "POST", "path": "/raw/configs/reload"},
        {"method": "DELETE", "path": "/raw/configs/*name"},
    ])
}

/// Build the full application router, with the request pipeline middleware
/// wrapping every route and a JSON 404 fallback.
pub fn build(state: AppState) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/configs", get(handlers::list_configs))
        .route(
            "/config/{*name}",
            get(handlers::read_config).post(handlers::write_config),
        )
        .route("/backups/{*name}", get(handlers::list_backups))
        // axum permits only one wildcard segment per route, as the last
        // segment; these two-parameter routes keep single-segment
        // captures for that reason (`Registry::parse` already refuses
        // any entry name containing `/`, so a single segment always
        // suffices in practice).
        .route(
            "/backupcontent/{name}/{filename}",
            get(handlers::backup_content),
        )
        .route("/restore/{name}/{filename}", post(handlers::restore_backup))
        .route("/action/{name}/{cmd}", post(handlers::run_action))
        .route(
            "/raw/configs",
            get(handlers::raw_configs_get).post(handlers::raw_configs_post),
        )
        .route("/raw/configs/reload", post(handlers::raw_configs_reload))
        .route("/raw/configs/{*name}", delete(handlers::raw_configs_delete))
        .fallback(handlers::not_found)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            pipeline_middleware,
        ))
        .with_state(state)
}
