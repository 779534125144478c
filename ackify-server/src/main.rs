use ackify_server::app::{build_router, AppState};
use ackify_server::config::{load_config, read_secret_env};
use ackify_server::magic_link::MagicLinkJanitor;
use ackify_server::signing::CanonicalSigner;
use ackify_server::tenant;
use ackify_server::webhook_worker::WebhookWorker;
use anyhow::Context;
use sqlx::PgPool;
use std::{env, net::SocketAddr};
use tokio::net::TcpListener;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()))
        .init();

    let config = load_config()?;

    let dsn = env::var("ACKIFY_DB_DSN").context("ACKIFY_DB_DSN must be set")?;
    let db_pool = PgPool::connect(&dsn)
        .await
        .context("Failed to connect to Postgres")?;

    tenant::ensure_tenant(&db_pool, config.default_tenant_id, "default")
        .await
        .context("Failed to register the default tenant")?;

    let signing_key = read_secret_env("ACKIFY_ED25519_PRIVATE_KEY")?;
    let signer = CanonicalSigner::from_env_value(signing_key.as_deref())?;
    info!(public_key = %signer.public_key_b64(), "Signature keypair loaded");

    let state = AppState::build(config, db_pool.clone(), signer)?;
    state.spawn_limiter_cleanup();

    let webhook_worker = WebhookWorker::start(db_pool.clone(), state.config.webhooks)?;
    let janitor = MagicLinkJanitor::start(
        db_pool.clone(),
        state.config.magic_link.janitor_interval_secs,
    );
    info!(
        workers = state.config.webhooks.workers,
        poll_secs = state.config.webhooks.poll_interval_secs,
        "Background workers started"
    );

    let app = build_router(state);

    let host = env::var("ACKIFY_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var("ACKIFY_PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);
    let ip: std::net::IpAddr = host.parse()?;
    let addr = SocketAddr::from((ip, port));

    println!("starting ackify-server on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("HTTP server stopped; draining background workers");
    webhook_worker.stop().await;
    janitor.stop().await;
    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
