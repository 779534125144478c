use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header::SET_COOKIE, HeaderValue, Method, Request};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use common_http_errors::ApiError;
use serde_json::json;
use std::net::SocketAddr;
use std::time::Instant;
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::app::AppState;
use crate::sessions::read_cookie;
use crate::tenant::TenantId;

pub const CSRF_COOKIE: &str = "ackify_csrf";
pub const CSRF_HEADER: &str = "X-CSRF-Token";

#[derive(Debug, Clone, Copy)]
pub struct RequestId(pub Uuid);

#[derive(Debug, Clone)]
pub struct ClientIp(pub String);

/// Assign a request id, resolve the client IP behind the reverse proxy, and
/// log the request once it completes.
pub async fn request_context(mut req: Request<Body>, next: Next) -> Response {
    let request_id = RequestId(Uuid::new_v4());
    let ip = resolve_client_ip(&req);
    req.extensions_mut().insert(request_id);
    req.extensions_mut().insert(ClientIp(ip.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();
    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id.0.to_string()) {
        response.headers_mut().insert("X-Request-ID", value);
    }
    tracing::info!(
        request_id = %request_id.0,
        %method,
        path = %path,
        status = response.status().as_u16(),
        ip = %ip,
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );
    response
}

fn resolve_client_ip(req: &Request<Body>) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("X-Forwarded-For")
        .and_then(|value| value.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = req
        .headers()
        .get("X-Real-IP")
        .and_then(|value| value.to_str().ok())
    {
        let real_ip = real_ip.trim();
        if !real_ip.is_empty() {
            return real_ip.to_string();
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn security_headers(req: Request<Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'self'; frame-ancestors 'self'"),
    );
    headers.insert("X-Content-Type-Options", HeaderValue::from_static("nosniff"));
    headers.insert("X-Frame-Options", HeaderValue::from_static("SAMEORIGIN"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Cache-Control",
        HeaderValue::from_static("no-store, no-cache, must-revalidate"),
    );
    response
}

/// Resolve the tenant for this request: `X-Tenant-ID` header when present,
/// otherwise the configured default tenant.
pub async fn tenant_resolver(
    State(state): State<AppState>,
    mut req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let tenant_id = match req
        .headers()
        .get("X-Tenant-ID")
        .and_then(|value| value.to_str().ok())
    {
        Some(raw) => Uuid::parse_str(raw.trim())
            .map_err(|_| ApiError::validation("invalid_tenant", "Malformed X-Tenant-ID header"))?,
        None => state.config.default_tenant_id,
    };
    req.extensions_mut().insert(TenantId(tenant_id));
    Ok(next.run(req).await)
}

pub async fn global_rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(&req);
    let decision = state
        .global_limiter
        .check(&ip, state.config.rate_limits.global_per_minute)
        .await;
    if !decision.allowed {
        return Err(ApiError::rate_limited(decision.retry_after_secs, None));
    }
    Ok(next.run(req).await)
}

pub async fn auth_rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    let ip = client_ip(&req);
    let decision = state
        .auth_limiter
        .check(&ip, state.config.rate_limits.auth_per_minute)
        .await;
    if !decision.allowed {
        return Err(ApiError::rate_limited(decision.retry_after_secs, None));
    }
    Ok(next.run(req).await)
}

pub async fn doc_create_rate_limit(
    State(state): State<AppState>,
    req: Request<Body>,
    next: Next,
) -> Result<Response, ApiError> {
    if req.method() != Method::POST {
        return Ok(next.run(req).await);
    }
    let ip = client_ip(&req);
    let decision = state
        .doc_create_limiter
        .check(&ip, state.config.rate_limits.doc_create_per_minute)
        .await;
    if !decision.allowed {
        return Err(ApiError::rate_limited(decision.retry_after_secs, None));
    }
    Ok(next.run(req).await)
}

fn client_ip(req: &Request<Body>) -> String {
    req.extensions()
        .get::<ClientIp>()
        .map(|ip| ip.0.clone())
        .unwrap_or_else(|| resolve_client_ip(req))
}

/// Double-submit CSRF guard for state-changing verbs: the `X-CSRF-Token`
/// header must equal the `ackify_csrf` cookie, compared in constant time.
pub async fn csrf_protect(req: Request<Body>, next: Next) -> Result<Response, ApiError> {
    if matches!(
        *req.method(),
        Method::GET | Method::HEAD | Method::OPTIONS
    ) {
        return Ok(next.run(req).await);
    }
    let cookie = read_cookie(req.headers(), CSRF_COOKIE);
    let header = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);
    match (cookie, header) {
        (Some(cookie), Some(header))
            if bool::from(cookie.as_bytes().ct_eq(header.as_bytes())) =>
        {
            Ok(next.run(req).await)
        }
        _ => Err(ApiError::forbidden("csrf_mismatch", "CSRF token missing or invalid")),
    }
}

/// `GET /csrf`: issue the double-submit token. The cookie is intentionally
/// readable by the SPA, which echoes it in the request header.
pub async fn csrf_token(State(state): State<AppState>) -> Response {
    let token = URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<32>());
    let cookie = format!(
        "{CSRF_COOKIE}={token}; Path=/; SameSite=Lax{}",
        if state.config.secure_cookies() { "; Secure" } else { "" }
    );
    let mut response = Json(json!({ "csrf_token": token })).into_response();
    if let Ok(value) = HeaderValue::from_str(&cookie) {
        response.headers_mut().insert(SET_COOKIE, value);
    }
    response
}
