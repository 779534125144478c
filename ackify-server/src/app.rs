use anyhow::{Context, Result};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, HeaderValue, Method, StatusCode,
};
use axum::middleware::{from_fn, from_fn_with_state};
use axum::response::Response;
use axum::routing::{get, post, put};
use axum::{Json, Router};
use common_crypto::SealingKey;
use reqwest::Client;
use serde_json::json;
use sqlx::PgPool;
use std::any::Any;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::auth_handlers;
use crate::authz::Authorizer;
use crate::config::AckifyConfig;
use crate::document_handlers;
use crate::mailer::{build_mailer, Mailer};
use crate::middleware::{
    auth_rate_limit, csrf_protect, csrf_token, doc_create_rate_limit, global_rate_limit,
    request_context, security_headers, tenant_resolver,
};
use crate::oauth::DynamicProvider;
use crate::proxy_handlers;
use crate::rate_limiter::{ProxyLimiter, WindowLimiter};
use crate::reminder_handlers;
use crate::sessions::SessionCodec;
use crate::signature_handlers;
use crate::signing::CanonicalSigner;
use crate::webhook_handlers;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub config: Arc<AckifyConfig>,
    pub signer: Arc<CanonicalSigner>,
    pub sessions: SessionCodec,
    pub sealing_key: SealingKey,
    pub authorizer: Arc<Authorizer>,
    pub provider: Arc<DynamicProvider>,
    pub mailer: Arc<dyn Mailer>,
    pub http_client: Client,
    pub proxy_client: Client,
    pub global_limiter: WindowLimiter,
    pub auth_limiter: WindowLimiter,
    pub doc_create_limiter: WindowLimiter,
    pub proxy_limiter: ProxyLimiter,
}

impl AppState {
    pub fn build(
        config: AckifyConfig,
        db: PgPool,
        signer: CanonicalSigner,
    ) -> Result<Self> {
        let sealing_key = SealingKey::from_secret(&config.cookie_secret)
            .context("ACKIFY_OAUTH_COOKIE_SECRET is not a valid 32/64-byte secret")?;
        let sessions = SessionCodec::new(sealing_key.clone(), config.secure_cookies());
        let authorizer = Arc::new(Authorizer::new(
            config.admin_emails.clone(),
            config.only_admin_can_create,
        ));
        let provider = Arc::new(DynamicProvider::new(config.oauth.clone()));
        let mailer = build_mailer(&config.mail)?;
        let http_client = Client::builder()
            .build()
            .context("Failed to build HTTP client")?;
        let proxy_client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build proxy HTTP client")?;
        let limits = config.rate_limits;

        Ok(Self {
            db,
            config: Arc::new(config),
            signer: Arc::new(signer),
            sessions,
            sealing_key,
            authorizer,
            provider,
            mailer,
            http_client,
            proxy_client,
            global_limiter: WindowLimiter::new(60),
            auth_limiter: WindowLimiter::new(60),
            doc_create_limiter: WindowLimiter::new(60),
            proxy_limiter: ProxyLimiter::new(
                limits.proxy_ip_per_minute,
                limits.proxy_ip_doc_per_minute,
                limits.proxy_doc_per_minute,
            ),
        })
    }

    /// Background expiry of idle rate-limiter keys.
    pub fn spawn_limiter_cleanup(&self) {
        self.global_limiter.spawn_cleanup();
        self.auth_limiter.spawn_cleanup();
        self.doc_create_limiter.spawn_cleanup();
        self.proxy_limiter.spawn_cleanup();
    }
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response<axum::body::Body> {
    let detail = if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    };
    tracing::error!(panic = %detail, "Request handler panicked");
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
        .body(axum::body::Body::from(
            r#"{"error":{"code":"internal_error","message":"Internal server error"}}"#,
        ))
        .expect("failed to build panic response")
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(
            state
                .config
                .cors_origins
                .iter()
                .filter_map(|origin| origin.parse::<HeaderValue>().ok())
                .collect::<Vec<_>>(),
        ))
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            ACCEPT,
            CONTENT_TYPE,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-tenant-id"),
        ])
        .allow_credentials(true);

    // CSRF and the creation rate limit apply to the POST method only; the
    // public listing on the same path stays unguarded.
    let create_document = post(document_handlers::create_document)
        .layer(from_fn(csrf_protect))
        .layer(from_fn_with_state(state.clone(), doc_create_rate_limit));

    let public = Router::new()
        .route("/health", get(health))
        .route("/csrf", get(csrf_token))
        .route("/proxy", get(proxy_handlers::proxy_document))
        .route(
            "/documents",
            get(document_handlers::list_documents).merge(create_document),
        )
        .route("/documents/:doc_id", get(document_handlers::get_document))
        .route(
            "/documents/:doc_id/signatures",
            get(signature_handlers::list_doc_signatures),
        )
        .route(
            "/documents/:doc_id/expected-signers",
            get(document_handlers::list_expected_signers),
        );

    let auth = Router::new()
        .route("/auth/start", post(auth_handlers::start_oauth))
        .route("/auth/magic-link/request", post(auth_handlers::request_magic_link))
        .layer(from_fn_with_state(state.clone(), auth_rate_limit))
        .route("/auth/callback", get(auth_handlers::oauth_callback))
        .route("/auth/magic-link/verify", get(auth_handlers::verify_magic_link))
        .route("/auth/reminder-link/verify", get(auth_handlers::verify_reminder_link))
        .route("/auth/logout", get(auth_handlers::logout));

    let authenticated = Router::new()
        .route(
            "/signatures",
            get(signature_handlers::list_my_signatures)
                .post(signature_handlers::create_signature),
        )
        .route(
            "/documents/:doc_id/signatures/status",
            get(signature_handlers::signature_status),
        )
        .route("/users/me", get(auth_handlers::me))
        .layer(from_fn(csrf_protect));

    let admin = Router::new()
        .route("/admin/documents", get(document_handlers::admin_list_documents))
        .route(
            "/admin/documents/:doc_id",
            put(document_handlers::update_document).delete(document_handlers::delete_document),
        )
        .route(
            "/admin/documents/:doc_id/signers",
            post(document_handlers::add_expected_signer),
        )
        .route(
            "/admin/documents/:doc_id/signers/:email",
            axum::routing::delete(document_handlers::remove_expected_signer),
        )
        .route(
            "/admin/documents/:doc_id/reminders",
            get(reminder_handlers::list_reminders).post(reminder_handlers::send_reminders),
        )
        .route(
            "/admin/webhooks",
            get(webhook_handlers::list_webhooks).post(webhook_handlers::create_webhook),
        )
        .route(
            "/admin/webhooks/:id",
            get(webhook_handlers::get_webhook)
                .put(webhook_handlers::update_webhook)
                .delete(webhook_handlers::delete_webhook),
        )
        .route(
            "/admin/webhooks/:id/deliveries",
            get(webhook_handlers::list_deliveries),
        )
        .route("/admin/webhooks/:id/test", post(webhook_handlers::test_webhook))
        .route(
            "/admin/signatures/verify-chain",
            get(signature_handlers::verify_chain),
        )
        .route(
            "/admin/signatures/rebuild-chain",
            post(signature_handlers::rebuild_chain),
        )
        .route(
            "/admin/settings",
            get(auth_handlers::get_settings).put(auth_handlers::put_settings),
        )
        .layer(from_fn(csrf_protect));

    let api = Router::new()
        .merge(public)
        .merge(auth)
        .merge(authenticated)
        .merge(admin)
        .with_state(state.clone());

    // Layers apply bottom-up: the last `.layer` call is outermost. Execution
    // order is request_context, panic recovery, security headers, CORS,
    // global rate limit, tenant opener, then the routes. Keeping
    // request_context outermost means even panicking or preflight responses
    // carry a request id and a log line.
    Router::new()
        .nest("/api/v1", api)
        .layer(from_fn_with_state(state.clone(), tenant_resolver))
        .layer(from_fn_with_state(state, global_rate_limit))
        .layer(cors)
        .layer(from_fn(security_headers))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(from_fn(request_context))
}
