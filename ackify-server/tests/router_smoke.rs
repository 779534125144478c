mod support;

use axum::body::Body;
use axum::http::{header::SET_COOKIE, Request, StatusCode};
use http_body_util::BodyExt;
use support::test_state;
use tower::util::ServiceExt;

use ackify_server::app::build_router;

#[tokio::test]
async fn health_responds_with_security_headers() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/api/v1/health").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let headers = response.headers();
    assert_eq!(headers.get("X-Content-Type-Options").unwrap(), "nosniff");
    assert_eq!(headers.get("X-Frame-Options").unwrap(), "SAMEORIGIN");
    assert_eq!(headers.get("Referrer-Policy").unwrap(), "no-referrer");
    assert!(headers.get("Content-Security-Policy").is_some());
    assert!(headers.get("Cache-Control").unwrap().to_str().unwrap().contains("no-store"));
    assert!(headers.get("X-Request-ID").is_some());

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["status"], "ok");
}

#[tokio::test]
async fn authenticated_routes_reject_missing_session() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/api/v1/users/me").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(json["error"]["code"], "unauthorized");
}

#[tokio::test]
async fn admin_routes_reject_missing_session() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/admin/webhooks")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn csrf_endpoint_issues_cookie_and_token() {
    let app = build_router(test_state());
    let response = app
        .oneshot(Request::builder().uri("/api/v1/csrf").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let cookie = response
        .headers()
        .get(SET_COOKIE)
        .expect("csrf cookie")
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("ackify_csrf="));

    let body = response.into_body().collect().await.unwrap().to_bytes();
    let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
    let token = json["csrf_token"].as_str().unwrap();
    assert!(cookie.contains(token));
}

#[tokio::test]
async fn state_changing_requests_require_csrf_token() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/v1/signatures")
                .header("content-type", "application/json")
                .body(Body::from(r#"{"doc_id":"D1"}"#))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(response.headers().get("X-Error-Code").unwrap(), "csrf_mismatch");
}

#[tokio::test]
async fn malformed_tenant_header_is_rejected() {
    let app = build_router(test_state());
    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/v1/health")
                .header("X-Tenant-ID", "not-a-uuid")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(response.headers().get("X-Error-Code").unwrap(), "invalid_tenant");
}
