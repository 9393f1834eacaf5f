//! Request handlers: HTTP method+path bindings onto the other components.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::{json, Value};
use tracing::warn;

use crate::error::{AppError, AppResult};
use crate::registry::{is_traversal_shaped, ConfigEntry};
use crate::state::AppState;
use crate::{atomicwrite, backup, dispatcher, meta, pathguard};

/// `GET /`.
pub async fn root() -> Json<Value> {
    Json(json!({
        "ok": true,
        "name": "config-manager",
        "version": env!("CARGO_PKG_VERSION"),
        "api_endpoints": crate::router::route_table(),
    }))
}

/// `GET /health`. Reports `ok` even when the registry is empty, but adds
/// a `registry_loaded` hint an orchestrator's liveness probe can use.
pub async fn health(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot().await;
    Json(json!({
        "ok": 1,
        "status": "ok",
        "registry_loaded": !snapshot.is_empty(),
    }))
}

fn validate_name(name: &str) -> AppResult<()> {
    if is_traversal_shaped(name) {
        return Err(AppError::PathDenied("Pfad nicht erlaubt".to_string()));
    }
    Ok(())
}

async fn lookup(state: &AppState, name: &str) -> AppResult<ConfigEntry> {
    validate_name(name)?;
    state
        .registry
        .get(name)
        .await
        .ok_or_else(|| AppError::NotFound(format!("Unbekannte Konfiguration: {name}")))
}

/// `GET /configs`.
pub async fn list_configs(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot().await;
    let configs: Vec<Value> = snapshot
        .values()
        .map(|e| {
            let filename = e
                .path
                .file_name()
                .unwrap_or(e.name.as_str())
                .to_string();
            let filetype = std::path::Path::new(&filename)
                .extension()
                .and_then(|s| s.to_str())
                .unwrap_or("")
                .to_string();
            let mut actions: Vec<&String> = e.actions.keys().collect();
            actions.sort();
            json!({
                "id": e.name,
                "filename": filename,
                "filetype": filetype,
                "category": e.category,
                "actions": actions,
            })
        })
        .collect();
    Json(json!({ "ok": true, "configs": configs }))
}

/// `GET /config/{name}`.
pub async fn read_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Response> {
    let entry = lookup(&state, &name).await?;
    if !entry.path.exists() {
        return Err(AppError::NotFound(format!("Datei fehlt: {}", entry.path)));
    }
    let bytes = std::fs::read(&entry.path)
        .map_err(|e| AppError::Transient(format!("Lesefehler: {e}")))?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().unwrap(),
    );
    Ok((headers, bytes).into_response())
}

#[derive(Debug, serde::Deserialize)]
struct ContentBody {
    content: String,
}

fn extract_write_bytes(headers: &HeaderMap, body: &Bytes) -> Vec<u8> {
    let is_json = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|ct| ct.starts_with("application/json"))
        .unwrap_or(false);
    if is_json {
        if let Ok(parsed) = serde_json::from_slice::<ContentBody>(body) {
            return parsed.content.into_bytes();
        }
    }
    body.to_vec()
}

/// `POST /config/{name}`.
pub async fn write_config(
    State(state): State<AppState>,
    Path(name): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let entry = lookup(&state, &name).await?;

    if !pathguard::is_allowed(&state.cfg, &entry.path) {
        return Err(AppError::PathDenied("Pfad nicht erlaubt".to_string()));
    }

    let bytes = extract_write_bytes(&headers, &body);

    if let Err(e) = backup::snapshot(&state.cfg, &entry) {
        warn!(entry = name, error = %e, "write_config: snapshot failed, proceeding");
    }

    let method = atomicwrite::write(&entry.path, &bytes)
        .map_err(|e| AppError::Transient(format!("Schreibfehler: {e}")))?;

    let applied = meta::apply(&state.cfg, &entry, &entry.path);

    Ok(Json(json!({
        "ok": true,
        "saved": true,
        "path": entry.path,
        "method": method,
        "requested": {
            "user": entry.user,
            "group": entry.group,
            "mode": entry.mode,
            "apply_meta": entry.apply_meta.unwrap_or(state.cfg.apply_meta),
        },
        "applied": applied,
    })))
}

/// `GET /backups/{name}`.
pub async fn list_backups(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    let entry = lookup(&state, &name).await?;
    let names = backup::list(&entry).map_err(|e| AppError::Transient(e.to_string()))?;
    Ok(Json(json!({ "ok": true, "backups": names })))
}

/// `GET /backupcontent/{name}/{filename}`.
pub async fn backup_content(
    State(state): State<AppState>,
    Path((name, filename)): Path<(String, String)>,
) -> AppResult<Response> {
    let entry = lookup(&state, &name).await?;
    let bytes = backup::read(&entry, &filename).map_err(|e| {
        if e.to_string().contains("malformed") {
            AppError::Validation(e.to_string())
        } else {
            AppError::NotFound(format!("Datei fehlt: {filename}"))
        }
    })?;
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        "application/octet-stream".parse().unwrap(),
    );
    Ok((headers, bytes).into_response())
}

/// `POST /restore/{name}/{filename}`.
pub async fn restore_backup(
    State(state): State<AppState>,
    Path((name, filename)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let entry = lookup(&state, &name).await?;
    if !pathguard::is_allowed(&state.cfg, &entry.path) {
        return Err(AppError::PathDenied("Pfad nicht erlaubt".to_string()));
    }
    backup::restore(&entry, &filename).map_err(|e| {
        if e.to_string().contains("malformed") {
            AppError::Validation(e.to_string())
        } else {
            AppError::Transient(format!("Schreibfehler: {e}"))
        }
    })?;
    let applied = meta::apply(&state.cfg, &entry, &entry.path);
    Ok(Json(json!({ "ok": true, "restored": filename, "applied": applied })))
}

/// `POST /action/{name}/{cmd}`.
pub async fn run_action(
    State(state): State<AppState>,
    Path((name, cmd)): Path<(String, String)>,
) -> AppResult<Json<Value>> {
    let entry = lookup(&state, &name).await?;
    let result = dispatcher::dispatch(&state.cfg, &entry, &cmd).await?;
    Ok(Json(result))
}

/// `GET /raw/configs`.
pub async fn raw_configs_get(State(state): State<AppState>) -> Json<Value> {
    let snapshot = state.registry.snapshot().await;
    Json(json!({ "ok": true, "configs": &*snapshot }))
}

/// `POST /raw/configs`. Validation failures leave disk untouched; once
/// validation passes, the whole table is accepted, persisted, and entries
/// with bad names are silently skipped from the in-memory registry but
/// remain on disk.
pub async fn raw_configs_post(
    State(state): State<AppState>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    if serde_json::from_slice::<Value>(&body).is_err() {
        return Err(AppError::Validation("body is not valid JSON".to_string()));
    }
    let table = crate::registry::Registry::parse(&body, &state.paths.backup_root)
        .map_err(|e| AppError::Validation(e.to_string()))?;

    std::fs::write(&state.paths.configs_path, &body)
        .map_err(|e| AppError::Transient(format!("Schreibfehler: {e}")))?;
    state.registry.rebuild(table).await;
    Ok(Json(json!({ "ok": true })))
}

/// `POST /raw/configs/reload`.
pub async fn raw_configs_reload(State(state): State<AppState>) -> AppResult<Json<Value>> {
    state
        .registry
        .reload_from_disk(state.paths.configs_path.as_std_path(), &state.paths.backup_root)
        .await
        .map_err(|e| AppError::Transient(e.to_string()))?;
    Ok(Json(json!({ "ok": true })))
}

/// `DELETE /raw/configs/{name}`.
pub async fn raw_configs_delete(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<Value>> {
    validate_name(&name)?;
    let removed = state.registry.remove(&name).await;
    if !removed {
        return Err(AppError::NotFound(format!("Unbekannte Konfiguration: {name}")));
    }
    Ok(Json(json!({ "ok": true, "removed": name })))
}

/// Fallback for unmatched routes.
pub async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "ok": false, "error": "404 Not Found" })),
    )
        .into_response()
}
