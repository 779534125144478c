use axum::body::to_bytes;
use axum::response::IntoResponse;
use common_http_errors::ApiError;

#[tokio::test]
async fn api_error_renders_standard_envelope() {
    let err = ApiError::validation("invalid_doc_id", "doc_id is required");
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 400);
    let headers = resp.headers();
    assert_eq!(headers.get("X-Error-Code").unwrap(), "invalid_doc_id");
    let body = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("\"code\":\"invalid_doc_id\""), "unexpected body: {}", text);
    assert!(text.starts_with("{\"error\":"), "missing envelope: {}", text);
}

#[tokio::test]
async fn rate_limited_sets_retry_after_and_details() {
    let err = ApiError::rate_limited(42, Some("ip_doc"));
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 429);
    assert_eq!(resp.headers().get("Retry-After").unwrap(), "42");
    let body = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["details"]["limit_type"], "ip_doc");
}

#[tokio::test]
async fn internal_error_does_not_leak_cause() {
    let err = ApiError::internal("connection refused to 10.0.0.3:5432");
    let resp = err.into_response();
    assert_eq!(resp.status().as_u16(), 500);
    let body = to_bytes(resp.into_body(), 1024 * 8).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(!text.contains("10.0.0.3"), "leaked internals: {}", text);
}
