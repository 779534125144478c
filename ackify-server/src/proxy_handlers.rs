use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::Response;
use axum::Extension;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;

use crate::app::AppState;
use crate::documents;
use crate::middleware::ClientIp;
use crate::tenant::{TenantId, TenantTx};

const MAX_PROXY_BYTES: usize = 50 * 1024 * 1024;

const ALLOWED_MIME_PREFIXES: &[&str] = &[
    "application/pdf",
    "text/html",
    "text/plain",
    "text/markdown",
    "image/",
];

#[derive(Debug, Deserialize)]
pub struct ProxyQuery {
    pub doc: String,
    pub url: String,
}

fn mime_allowed(content_type: &str) -> bool {
    let essence = content_type.split(';').next().unwrap_or("").trim();
    ALLOWED_MIME_PREFIXES
        .iter()
        .any(|prefix| essence.starts_with(prefix))
}

/// `GET /proxy?doc&url`: stream a registered document from its upstream.
/// The URL must match the document record exactly; three sliding counters
/// bound abuse per IP, per document, and per (IP, document).
pub async fn proxy_document(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    Query(query): Query<ProxyQuery>,
) -> ApiResult<Response> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let doc = documents::get(tx.conn(), &query.doc).await?;
    tx.commit().await.map_err(ApiError::internal)?;

    if doc.url.is_empty() || doc.url != query.url {
        return Err(ApiError::not_found(
            "document_url_mismatch",
            "The requested URL is not registered for this document",
        ));
    }

    let decision = state.proxy_limiter.check(&ip, &doc.doc_id).await;
    if !decision.allowed {
        return Err(ApiError::rate_limited(decision.retry_after_secs, decision.limit_type));
    }

    let upstream = state
        .proxy_client
        .get(&doc.url)
        .send()
        .await
        .map_err(|err| ApiError::upstream(format!("upstream request failed: {err}")))?;

    let status = upstream.status();
    if !status.is_success() {
        return Err(ApiError::upstream(format!("upstream returned status {status}")));
    }

    let content_type = upstream
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("application/octet-stream")
        .to_string();
    if !mime_allowed(&content_type) {
        return Err(ApiError::forbidden(
            "mime_not_allowed",
            format!("Content type {content_type} is not proxied"),
        ));
    }

    if let Some(length) = upstream.content_length() {
        if length as usize > MAX_PROXY_BYTES {
            return Err(ApiError::PayloadTooLarge {
                message: "Upstream document exceeds the 50 MB proxy limit".to_string(),
            });
        }
    }

    let mut body = Vec::new();
    let mut upstream = upstream;
    while let Some(chunk) = upstream
        .chunk()
        .await
        .map_err(|err| ApiError::upstream(format!("upstream read failed: {err}")))?
    {
        if body.len() + chunk.len() > MAX_PROXY_BYTES {
            return Err(ApiError::PayloadTooLarge {
                message: "Upstream document exceeds the 50 MB proxy limit".to_string(),
            });
        }
        body.extend_from_slice(&chunk);
    }

    Response::builder()
        .status(StatusCode::OK)
        .header(
            CONTENT_TYPE,
            HeaderValue::from_str(&content_type)
                .unwrap_or(HeaderValue::from_static("application/octet-stream")),
        )
        .body(Body::from(body))
        .map_err(ApiError::internal)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_allowlist() {
        assert!(mime_allowed("application/pdf"));
        assert!(mime_allowed("text/html; charset=utf-8"));
        assert!(mime_allowed("image/png"));
        assert!(!mime_allowed("application/octet-stream"));
        assert!(!mime_allowed("application/zip"));
        assert!(!mime_allowed("video/mp4"));
    }
}
