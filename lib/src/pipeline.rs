//! RequestPipeline: authentication, IP admission, CORS, and structured
//! request/response logging, applied to every request before it reaches
//! a handler.

use std::net::IpAddr;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, HeaderValue, Method, Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use rand::Rng;
use subtle::ConstantTimeEq;
use tracing::info;

use crate::state::AppState;

/// Per-request, short-lived context.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// `<ms-time>-<pid>-<rand>`.
    pub req_id: String,
    /// Monotonic start time, used to compute the logged `time=`.
    pub start: Instant,
    /// The effective client IP after trusted-proxy resolution.
    pub ip: IpAddr,
    /// HTTP method.
    pub method: Method,
    /// Request path.
    pub path: String,
}

fn generate_req_id() -> String {
    let ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let pid = std::process::id();
    let rand: u32 = rand::thread_rng().gen();
    format!("{ms}-{pid}-{rand:08x}")
}

/// The socket peer is authoritative unless it is in the trusted proxy
/// list, in which case the first hop of `X-Forwarded-For` is used.
pub fn effective_ip(socket_ip: IpAddr, headers: &HeaderMap, trusted_proxies: &[IpAddr]) -> IpAddr {
    if !trusted_proxies.contains(&socket_ip) {
        return socket_ip;
    }
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok())
        .unwrap_or(socket_ip)
}

/// Compute the `Access-Control-Allow-Origin` value for the three cases:
/// no configured allow-list (echo the origin), an allow-listed origin
/// (echo it), or a mismatch (deny with `"null"`).
pub fn cors_allow_origin(origin: Option<&str>, allow_origins: &[String]) -> String {
    match origin {
        None => "*".to_string(),
        Some(o) => {
            if allow_origins.is_empty() {
                o.to_string()
            } else if allow_origins.iter().any(|a| a == o) {
                o.to_string()
            } else {
                "null".to_string()
            }
        }
    }
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    let a = a.as_bytes();
    let b = b.as_bytes();
    if a.len() != b.len() {
        // Still perform a comparison of equal cost to avoid a length-based
        // timing signal; the result is discarded.
        let _ = a.ct_eq(a);
        return false;
    }
    a.ct_eq(b).into()
}

fn extract_token(headers: &HeaderMap) -> Option<String> {
    if let Some(v) = headers.get("x-api-token").and_then(|v| v.to_str().ok()) {
        return Some(v.to_string());
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

fn apply_cors_headers(resp: &mut Response, origin: Option<&str>, cfg: &crate::config::GlobalConfig) {
    let allow_origin = cors_allow_origin(origin, &cfg.allow_origins);
    let headers = resp.headers_mut();
    if let Ok(v) = HeaderValue::from_str(&allow_origin) {
        headers.insert("access-control-allow-origin", v);
    }
    headers.insert(
        "access-control-allow-methods",
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    headers.insert(
        "access-control-allow-headers",
        HeaderValue::from_static("Content-Type, X-API-Token, Authorization"),
    );
    headers.insert(
        "access-control-max-age",
        HeaderValue::from_static("86400"),
    );
}

/// axum middleware implementing the full per-request pipeline.
pub async fn pipeline_middleware(
    State(state): State<AppState>,
    ConnectInfo(socket): ConnectInfo<std::net::SocketAddr>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let start = Instant::now();
    let req_id = generate_req_id();
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let ip = effective_ip(socket.ip(), req.headers(), &state.cfg.trusted_proxies);
    let origin = req
        .headers()
        .get("origin")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    info!(req_id, %ip, %method, %path, "REQUEST");

    if method == Method::OPTIONS {
        let mut resp = Response::builder()
            .status(StatusCode::NO_CONTENT)
            .body(Body::empty())
            .expect("building empty response");
        apply_cors_headers(&mut resp, origin.as_deref(), &state.cfg);
        log_response(&req_id, &ip, &method, &path, resp.status(), start);
        return resp;
    }

    if !state.cfg.allowed_ips.is_empty() && !state.cfg.allowed_ips.iter().any(|n| n.contains(ip)) {
        let mut resp = forbidden_response();
        apply_cors_headers(&mut resp, origin.as_deref(), &state.cfg);
        log_response(&req_id, &ip, &method, &path, resp.status(), start);
        return resp;
    }

    if let Some(expected) = &state.cfg.api_token {
        let provided = extract_token(req.headers());
        let ok = provided
            .map(|p| constant_time_eq(&p, expected))
            .unwrap_or(false);
        if !ok {
            let mut resp = unauthorized_response();
            apply_cors_headers(&mut resp, origin.as_deref(), &state.cfg);
            log_response(&req_id, &ip, &method, &path, resp.status(), start);
            return resp;
        }
    }

    let ctx = RequestContext {
        req_id: req_id.clone(),
        start,
        ip,
        method: method.clone(),
        path: path.clone(),
    };
    let mut req = req;
    req.extensions_mut().insert(ctx);

    let mut resp = next.run(req).await;
    apply_cors_headers(&mut resp, origin.as_deref(), &state.cfg);
    log_response(&req_id, &ip, &method, &path, resp.status(), start);
    resp
}

fn forbidden_response() -> Response {
    let body = serde_json::json!({ "ok": false, "error": "Forbidden" });
    (StatusCode::FORBIDDEN, axum::Json(body)).into_response()
}

fn unauthorized_response() -> Response {
    let body = serde_json::json!({ "ok": false, "error": "Unauthorized" });
    (StatusCode::UNAUTHORIZED, axum::Json(body)).into_response()
}

fn log_response(
    req_id: &str,
    ip: &IpAddr,
    method: &Method,
    path: &str,
    status: StatusCode,
    start: Instant,
) {
    let elapsed = start.elapsed().as_secs_f64();
    info!(
        req_id,
        %ip,
        %method,
        %path,
        status = status.as_u16(),
        time = elapsed,
        "RESPONSE"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cors_empty_allowlist_echoes_origin() {
        assert_eq!(
            cors_allow_origin(Some("https://a.example"), &[]),
            "https://a.example"
        );
    }

    #[test]
    fn cors_allowlisted_origin_is_echoed() {
        let allow = vec!["https://a.example".to_string()];
        assert_eq!(cors_allow_origin(Some("https://a.example"), &allow), "https://a.example");
    }

    #[test]
    fn cors_non_allowlisted_origin_is_null() {
        let allow = vec!["https://a.example".to_string()];
        assert_eq!(cors_allow_origin(Some("https://evil.example"), &allow), "null");
    }

    #[test]
    fn constant_time_eq_matches_and_differs() {
        assert!(constant_time_eq("secret", "secret"));
        assert!(!constant_time_eq("secret", "wrong!"));
        assert!(!constant_time_eq("short", "muchlongersecret"));
    }

    #[test]
    fn effective_ip_uses_forwarded_for_only_when_trusted() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.5, 10.0.0.1"));
        let socket: IpAddr = "127.0.0.1".parse().unwrap();
        let untrusted = effective_ip(socket, &headers, &[]);
        assert_eq!(untrusted, socket);

        let trusted = effective_ip(socket, &headers, &[socket]);
        assert_eq!(trusted, "203.0.113.5".parse::<IpAddr>().unwrap());
    }
}
