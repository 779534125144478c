use anyhow::Context as _;
use reqwest::header::{HeaderName, HeaderValue, CONTENT_TYPE, USER_AGENT};
use reqwest::Client;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, timeout, Duration, MissedTickBehavior};
use uuid::Uuid;

use crate::config::WebhookWorkerConfig;
use crate::tenant::{self, with_tenant_context};
use crate::webhooks::{self, WebhookDelivery};

/// One claimed delivery plus the webhook fields needed to dispatch it.
struct DispatchJob {
    delivery: WebhookDelivery,
    target_url: String,
    secret: String,
    custom_headers: BTreeMap<String, String>,
}

enum DispatchOutcome {
    Delivered { status: i32, headers: BTreeMap<String, String>, body: String },
    Rejected { status: i32, error: String },
    TransportError { error: String },
}

/// Outbox consumer: a poll loop claims due deliveries one tenant at a time
/// and dispatches them concurrently under a fixed-size semaphore; a second
/// loop prunes old terminal rows. Both loops stop on the shared signal.
pub struct WebhookWorker {
    stop: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WebhookWorker {
    pub fn start(pool: PgPool, config: WebhookWorkerConfig) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("Failed to build webhook HTTP client")?;
        let (stop, stopped) = watch::channel(false);

        let poll_handle = tokio::spawn(poll_loop(
            pool.clone(),
            http,
            config,
            stopped.clone(),
        ));
        let cleanup_handle = tokio::spawn(cleanup_loop(pool, config, stopped));

        Ok(Self { stop, handles: vec![poll_handle, cleanup_handle] })
    }

    /// Signal the loops and wait up to 30s for in-flight dispatches to land.
    /// Anything still running stays in `processing` and is reclaimed after
    /// the visibility timeout.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let drain = async {
            for handle in self.handles {
                let _ = handle.await;
            }
        };
        if timeout(Duration::from_secs(30), drain).await.is_err() {
            tracing::warn!("Webhook worker did not drain within 30s; unfinished deliveries will be retried");
        }
    }
}

async fn poll_loop(
    pool: PgPool,
    http: Client,
    config: WebhookWorkerConfig,
    mut stopped: watch::Receiver<bool>,
) {
    let semaphore = Arc::new(Semaphore::new(config.workers.max(1)));
    let mut ticker = interval(Duration::from_secs(config.poll_interval_secs.max(1)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut tenant_cursor = 0usize;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let tenants = match tenant::list_tenant_ids(&pool).await {
                    Ok(tenants) if !tenants.is_empty() => tenants,
                    Ok(_) => continue,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to list tenants for webhook poll");
                        continue;
                    }
                };
                let tenant_id = tenants[tenant_cursor % tenants.len()];
                tenant_cursor = tenant_cursor.wrapping_add(1);
                if let Err(err) =
                    process_tenant(&pool, &http, &config, &semaphore, tenant_id).await
                {
                    tracing::warn!(error = %err, %tenant_id, "Webhook poll cycle failed");
                }
            }
            _ = stopped.changed() => break,
        }
    }
}

async fn process_tenant(
    pool: &PgPool,
    http: &Client,
    config: &WebhookWorkerConfig,
    semaphore: &Arc<Semaphore>,
    tenant_id: Uuid,
) -> anyhow::Result<()> {
    let batch = config.batch_size;
    let visibility = config.processing_visibility_secs;

    let jobs = with_tenant_context(pool, tenant_id, |tx| {
        Box::pin(async move {
            let reclaimed = webhooks::reset_stuck_processing(tx.conn(), visibility).await?;
            if reclaimed > 0 {
                tracing::info!(reclaimed, "Reset stuck webhook deliveries to pending");
            }

            let mut deliveries = webhooks::claim_pending(tx.conn(), batch).await?;
            if deliveries.is_empty() {
                deliveries = webhooks::claim_retryable(tx.conn(), batch).await?;
            }

            let mut jobs = Vec::with_capacity(deliveries.len());
            for delivery in deliveries {
                match webhooks::get(tx.conn(), delivery.webhook_id).await {
                    Ok(webhook) => jobs.push(DispatchJob {
                        delivery,
                        target_url: webhook.target_url,
                        secret: webhook.secret,
                        custom_headers: webhook.headers.0,
                    }),
                    Err(webhooks::WebhookError::NotFound) => {
                        webhooks::mark_cancelled(tx.conn(), delivery.id).await?;
                    }
                    Err(err) => return Err(err.into()),
                }
            }
            Ok(jobs)
        })
    })
    .await?;

    if jobs.is_empty() {
        return Ok(());
    }

    let mut dispatches = JoinSet::new();
    for job in jobs {
        let permit = semaphore.clone().acquire_owned().await?;
        let http = http.clone();
        let pool = pool.clone();
        dispatches.spawn(async move {
            let _permit = permit;
            let outcome = dispatch(&http, &job).await;
            record_outcome(&pool, tenant_id, &job.delivery, outcome).await;
        });
    }
    while dispatches.join_next().await.is_some() {}
    Ok(())
}

async fn dispatch(http: &Client, job: &DispatchJob) -> DispatchOutcome {
    let payload_bytes = match serde_json::to_vec(&job.delivery.payload.0) {
        Ok(bytes) => bytes,
        Err(err) => {
            return DispatchOutcome::TransportError { error: format!("payload encoding: {err}") }
        }
    };
    let timestamp = chrono::Utc::now().timestamp();
    let signature = webhooks::sign_delivery(
        &job.secret,
        timestamp,
        job.delivery.event_id,
        &job.delivery.event_type,
        &payload_bytes,
    );

    let mut request = http
        .post(&job.target_url)
        .header(CONTENT_TYPE, "application/json")
        .header(USER_AGENT, "Ackify-Webhooks/1.0")
        .header("X-Ackify-Event", &job.delivery.event_type)
        .header("X-Ackify-Event-Id", job.delivery.event_id.to_string())
        .header("X-Ackify-Timestamp", timestamp.to_string())
        .header("X-Ackify-Signature", format!("sha256={signature}"))
        .body(payload_bytes);
    for (name, value) in &job.custom_headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            request = request.header(name, value);
        }
    }

    match request.send().await {
        Ok(response) => {
            let status = response.status();
            let headers = response
                .headers()
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect::<BTreeMap<_, _>>();
            let body = response.text().await.unwrap_or_default();
            if status.is_success() {
                DispatchOutcome::Delivered {
                    status: status.as_u16() as i32,
                    headers,
                    body: truncate_body(body),
                }
            } else {
                DispatchOutcome::Rejected {
                    status: status.as_u16() as i32,
                    error: format!("endpoint returned status {status}"),
                }
            }
        }
        Err(err) => DispatchOutcome::TransportError { error: err.to_string() },
    }
}

fn truncate_body(body: String) -> String {
    const MAX_STORED_BODY: usize = 16 * 1024;
    if body.len() > MAX_STORED_BODY {
        let mut end = MAX_STORED_BODY;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        body[..end].to_string()
    } else {
        body
    }
}

async fn record_outcome(
    pool: &PgPool,
    tenant_id: Uuid,
    delivery: &WebhookDelivery,
    outcome: DispatchOutcome,
) {
    let delivery = delivery.clone();
    let result = with_tenant_context(pool, tenant_id, |tx| {
        Box::pin(async move {
            match outcome {
                DispatchOutcome::Delivered { status, headers, body } => {
                    tracing::debug!(
                        delivery_id = %delivery.id,
                        event = %delivery.event_type,
                        status,
                        "Webhook delivered"
                    );
                    webhooks::mark_delivered(tx.conn(), &delivery, status, headers, body).await?;
                }
                DispatchOutcome::Rejected { status, error } => {
                    tracing::warn!(
                        delivery_id = %delivery.id,
                        event = %delivery.event_type,
                        status,
                        "Webhook rejected by endpoint"
                    );
                    webhooks::mark_failed(tx.conn(), &delivery, &error, Some(status)).await?;
                }
                DispatchOutcome::TransportError { error } => {
                    tracing::warn!(
                        delivery_id = %delivery.id,
                        event = %delivery.event_type,
                        error = %error,
                        "Webhook dispatch failed"
                    );
                    webhooks::mark_failed(tx.conn(), &delivery, &error, None).await?;
                }
            }
            Ok(())
        })
    })
    .await;
    if let Err(err) = result {
        tracing::error!(error = %err, "Failed to record webhook delivery outcome");
    }
}

async fn cleanup_loop(
    pool: PgPool,
    config: WebhookWorkerConfig,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_secs(config.cleanup_interval_secs.max(60)));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let tenants = match tenant::list_tenant_ids(&pool).await {
                    Ok(tenants) => tenants,
                    Err(err) => {
                        tracing::warn!(error = %err, "Failed to list tenants for webhook cleanup");
                        continue;
                    }
                };
                for tenant_id in tenants {
                    let retention = config.retention_days;
                    let swept = with_tenant_context(&pool, tenant_id, |tx| {
                        Box::pin(async move {
                            Ok(webhooks::cleanup_old_deliveries(tx.conn(), retention).await?)
                        })
                    })
                    .await;
                    match swept {
                        Ok(count) if count > 0 => {
                            tracing::info!(%tenant_id, count, "Pruned old webhook deliveries");
                        }
                        Ok(_) => {}
                        Err(err) => {
                            tracing::warn!(error = %err, %tenant_id, "Webhook cleanup failed");
                        }
                    }
                }
            }
            _ = stopped.changed() => break,
        }
    }
}
