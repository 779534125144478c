use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::{FromRow, PgConnection};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub const EVENT_DOCUMENT_CREATED: &str = "document.created";
pub const EVENT_DOCUMENT_UPDATED: &str = "document.updated";
pub const EVENT_DOCUMENT_DELETED: &str = "document.deleted";
pub const EVENT_SIGNATURE_CREATED: &str = "signature.created";
pub const EVENT_REMINDER_SENT: &str = "reminder.sent";
pub const EVENT_WEBHOOK_CREATED: &str = "webhook.created";
pub const EVENT_WEBHOOK_DELETED: &str = "webhook.deleted";
pub const EVENT_WEBHOOK_TEST: &str = "webhook.test";

pub const KNOWN_EVENTS: &[&str] = &[
    EVENT_DOCUMENT_CREATED,
    EVENT_DOCUMENT_UPDATED,
    EVENT_DOCUMENT_DELETED,
    EVENT_SIGNATURE_CREATED,
    EVENT_REMINDER_SENT,
    EVENT_WEBHOOK_CREATED,
    EVENT_WEBHOOK_DELETED,
    EVENT_WEBHOOK_TEST,
];

pub const STATUS_PENDING: &str = "pending";
pub const STATUS_PROCESSING: &str = "processing";
pub const STATUS_DELIVERED: &str = "delivered";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_CANCELLED: &str = "cancelled";

const BACKOFF_BASE_SECS: u64 = 30;
const BACKOFF_CAP_SECS: u64 = 3600;

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("webhook not found")]
    NotFound,
    #[error("unknown event type: {0}")]
    UnknownEvent(String),
    #[error("invalid target url")]
    InvalidTargetUrl,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<WebhookError> for common_http_errors::ApiError {
    fn from(err: WebhookError) -> Self {
        use common_http_errors::ApiError;
        match err {
            WebhookError::NotFound => ApiError::not_found("webhook_not_found", "Webhook not found"),
            WebhookError::UnknownEvent(event) => {
                ApiError::validation("unknown_event", format!("Unknown event type: {event}"))
            }
            WebhookError::InvalidTargetUrl => {
                ApiError::validation("invalid_target_url", "target_url must be an http(s) URL")
            }
            WebhookError::Database(err) => ApiError::internal(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub title: String,
    pub target_url: String,
    #[serde(skip_serializing)]
    pub secret: String,
    pub active: bool,
    pub events: Vec<String>,
    pub headers: Json<BTreeMap<String, String>>,
    pub failure_count: i32,
    pub last_delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub webhook_id: Uuid,
    pub event_type: String,
    pub event_id: Uuid,
    pub payload: Json<Value>,
    pub status: String,
    pub retry_count: i32,
    pub max_retries: i32,
    pub priority: i32,
    pub scheduled_for: DateTime<Utc>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub response_status: Option<i32>,
    pub response_headers: Option<Json<BTreeMap<String, String>>>,
    pub response_body: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct NewWebhook {
    pub title: String,
    pub target_url: String,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default = "default_active")]
    pub active: bool,
    pub events: Vec<String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Deserialize)]
pub struct WebhookUpdate {
    pub title: Option<String>,
    pub target_url: Option<String>,
    pub secret: Option<String>,
    pub active: Option<bool>,
    pub events: Option<Vec<String>>,
    pub headers: Option<BTreeMap<String, String>>,
}

const WEBHOOK_COLUMNS: &str = "id, tenant_id, title, target_url, secret, active, events, headers, \
     failure_count, last_delivered_at, created_at, updated_at";

const DELIVERY_COLUMNS: &str = "id, tenant_id, webhook_id, event_type, event_id, payload, status, \
     retry_count, max_retries, priority, scheduled_for, next_retry_at, started_at, completed_at, \
     response_status, response_headers, response_body, last_error, created_at";

fn validate_events(events: &[String]) -> Result<(), WebhookError> {
    for event in events {
        if !KNOWN_EVENTS.contains(&event.as_str()) {
            return Err(WebhookError::UnknownEvent(event.clone()));
        }
    }
    Ok(())
}

/// Random shared secret for webhooks created without one.
pub fn generate_secret() -> String {
    URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<32>())
}

pub async fn create(conn: &mut PgConnection, new: NewWebhook) -> Result<Webhook, WebhookError> {
    if !new.target_url.starts_with("http://") && !new.target_url.starts_with("https://") {
        return Err(WebhookError::InvalidTargetUrl);
    }
    validate_events(&new.events)?;
    let secret = new
        .secret
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(generate_secret);
    let query = format!(
        "INSERT INTO webhooks (title, target_url, secret, active, events, headers) \
         VALUES ($1, $2, $3, $4, $5, $6) RETURNING {WEBHOOK_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Webhook>(&query)
        .bind(&new.title)
        .bind(&new.target_url)
        .bind(&secret)
        .bind(new.active)
        .bind(&new.events)
        .bind(Json(new.headers))
        .fetch_one(conn)
        .await?)
}

pub async fn list(conn: &mut PgConnection) -> Result<Vec<Webhook>, sqlx::Error> {
    let query = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks ORDER BY created_at ASC");
    sqlx::query_as::<_, Webhook>(&query).fetch_all(conn).await
}

pub async fn get(conn: &mut PgConnection, id: Uuid) -> Result<Webhook, WebhookError> {
    let query = format!("SELECT {WEBHOOK_COLUMNS} FROM webhooks WHERE id = $1");
    sqlx::query_as::<_, Webhook>(&query)
        .bind(id)
        .fetch_optional(conn)
        .await?
        .ok_or(WebhookError::NotFound)
}

pub async fn update(
    conn: &mut PgConnection,
    id: Uuid,
    update: WebhookUpdate,
) -> Result<Webhook, WebhookError> {
    let current = get(&mut *conn, id).await?;
    if let Some(events) = &update.events {
        validate_events(events)?;
    }
    if let Some(url) = &update.target_url {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(WebhookError::InvalidTargetUrl);
        }
    }
    let query = format!(
        "UPDATE webhooks \
         SET title = $2, target_url = $3, secret = $4, active = $5, events = $6, headers = $7 \
         WHERE id = $1 RETURNING {WEBHOOK_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Webhook>(&query)
        .bind(id)
        .bind(update.title.unwrap_or(current.title))
        .bind(update.target_url.unwrap_or(current.target_url))
        .bind(update.secret.unwrap_or(current.secret))
        .bind(update.active.unwrap_or(current.active))
        .bind(update.events.unwrap_or(current.events))
        .bind(update.headers.map(Json).unwrap_or(current.headers))
        .fetch_one(conn)
        .await?)
}

pub async fn delete(conn: &mut PgConnection, id: Uuid) -> Result<bool, sqlx::Error> {
    let done = sqlx::query("DELETE FROM webhooks WHERE id = $1")
        .bind(id)
        .execute(conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn list_deliveries(
    conn: &mut PgConnection,
    webhook_id: Uuid,
    limit: i64,
) -> Result<Vec<WebhookDelivery>, sqlx::Error> {
    let query = format!(
        "SELECT {DELIVERY_COLUMNS} FROM webhook_deliveries \
         WHERE webhook_id = $1 ORDER BY created_at DESC LIMIT $2"
    );
    sqlx::query_as::<_, WebhookDelivery>(&query)
        .bind(webhook_id)
        .bind(limit)
        .fetch_all(conn)
        .await
}

/// Enqueue one delivery per active webhook subscribed to `event_type`,
/// within the caller's transaction so the outbox write commits or rolls back
/// with the business event. Returns the number of rows enqueued.
pub async fn enqueue_event(
    conn: &mut PgConnection,
    event_type: &str,
    payload: &Value,
    max_retries: i32,
) -> Result<usize, WebhookError> {
    if !KNOWN_EVENTS.contains(&event_type) {
        return Err(WebhookError::UnknownEvent(event_type.to_string()));
    }
    let targets: Vec<Uuid> =
        sqlx::query_scalar("SELECT id FROM webhooks WHERE active AND $1 = ANY(events)")
            .bind(event_type)
            .fetch_all(&mut *conn)
            .await?;
    let event_id = Uuid::new_v4();
    for webhook_id in &targets {
        sqlx::query(
            "INSERT INTO webhook_deliveries \
               (webhook_id, event_type, event_id, payload, max_retries) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(webhook_id)
        .bind(event_type)
        .bind(event_id)
        .bind(Json(payload.clone()))
        .bind(max_retries)
        .execute(&mut *conn)
        .await?;
    }
    Ok(targets.len())
}

/// Lifecycle events (`webhook.created` / `webhook.deleted`) go to every
/// *other* subscribed webhook; a webhook never hears about itself.
pub async fn enqueue_lifecycle(
    conn: &mut PgConnection,
    event_type: &str,
    payload: &Value,
    max_retries: i32,
    exclude_webhook: Uuid,
) -> Result<usize, WebhookError> {
    let targets: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM webhooks WHERE active AND $1 = ANY(events) AND id <> $2",
    )
    .bind(event_type)
    .bind(exclude_webhook)
    .fetch_all(&mut *conn)
    .await?;
    let event_id = Uuid::new_v4();
    for webhook_id in &targets {
        sqlx::query(
            "INSERT INTO webhook_deliveries \
               (webhook_id, event_type, event_id, payload, max_retries) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(webhook_id)
        .bind(event_type)
        .bind(event_id)
        .bind(Json(payload.clone()))
        .bind(max_retries)
        .execute(&mut *conn)
        .await?;
    }
    Ok(targets.len())
}

/// Enqueue a `webhook.test` delivery for one specific webhook, regardless of
/// its event subscriptions.
pub async fn enqueue_test(
    conn: &mut PgConnection,
    webhook_id: Uuid,
    payload: &Value,
    max_retries: i32,
) -> Result<Uuid, WebhookError> {
    get(&mut *conn, webhook_id).await?;
    let event_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO webhook_deliveries \
           (webhook_id, event_type, event_id, payload, max_retries, priority) \
         VALUES ($1, $2, $3, $4, $5, 10)",
    )
    .bind(webhook_id)
    .bind(EVENT_WEBHOOK_TEST)
    .bind(event_id)
    .bind(Json(payload.clone()))
    .bind(max_retries)
    .execute(conn)
    .await?;
    Ok(event_id)
}

/// The HMAC base string: `"<timestamp>.<event_id>.<event_type>."` followed by
/// the raw JSON payload bytes.
pub fn signature_base(timestamp: i64, event_id: Uuid, event_type: &str, payload: &[u8]) -> Vec<u8> {
    let mut base = format!("{timestamp}.{event_id}.{event_type}.").into_bytes();
    base.extend_from_slice(payload);
    base
}

/// Hex-lower HMAC-SHA256 of the base string, keyed by the webhook secret.
pub fn sign_delivery(
    secret: &str,
    timestamp: i64,
    event_id: Uuid,
    event_type: &str,
    payload: &[u8],
) -> String {
    let base = signature_base(timestamp, event_id, event_type, payload);
    common_crypto::hmac_sha256_hex(secret.as_bytes(), &base)
        .expect("HMAC accepts any key length")
}

/// Exponential backoff starting at 30s, doubling per attempt, capped at 1h,
/// with ±20% jitter.
pub fn retry_backoff(retry_count: i32) -> std::time::Duration {
    let exponent = retry_count.max(1) as u32 - 1;
    let base = BACKOFF_BASE_SECS
        .saturating_mul(1u64 << exponent.min(16))
        .min(BACKOFF_CAP_SECS);
    let jitter = rand::thread_rng().gen_range(0.8..=1.2);
    std::time::Duration::from_secs_f64(base as f64 * jitter)
}

/// Deliveries stuck in `processing` past the visibility timeout go back to
/// `pending`; the worker that claimed them is assumed dead.
pub async fn reset_stuck_processing(
    conn: &mut PgConnection,
    visibility_secs: i64,
) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::seconds(visibility_secs);
    let done = sqlx::query(
        "UPDATE webhook_deliveries SET status = 'pending', started_at = NULL \
         WHERE status = 'processing' AND started_at < $1",
    )
    .bind(cutoff)
    .execute(conn)
    .await?;
    Ok(done.rows_affected())
}

/// Claim up to `batch` due pending deliveries, marking them `processing`.
pub async fn claim_pending(
    conn: &mut PgConnection,
    batch: i64,
) -> Result<Vec<WebhookDelivery>, sqlx::Error> {
    let query = format!(
        "UPDATE webhook_deliveries SET status = 'processing', started_at = now() \
         WHERE id IN ( \
             SELECT id FROM webhook_deliveries \
             WHERE status = 'pending' AND scheduled_for <= now() \
             ORDER BY priority DESC, scheduled_for ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) RETURNING {DELIVERY_COLUMNS}"
    );
    sqlx::query_as::<_, WebhookDelivery>(&query)
        .bind(batch)
        .fetch_all(conn)
        .await
}

/// Claim up to `batch` failed deliveries whose retry window has arrived.
pub async fn claim_retryable(
    conn: &mut PgConnection,
    batch: i64,
) -> Result<Vec<WebhookDelivery>, sqlx::Error> {
    let query = format!(
        "UPDATE webhook_deliveries SET status = 'processing', started_at = now() \
         WHERE id IN ( \
             SELECT id FROM webhook_deliveries \
             WHERE status = 'failed' AND next_retry_at IS NOT NULL \
               AND next_retry_at <= now() AND retry_count < max_retries \
             ORDER BY priority DESC, next_retry_at ASC \
             LIMIT $1 \
             FOR UPDATE SKIP LOCKED \
         ) RETURNING {DELIVERY_COLUMNS}"
    );
    sqlx::query_as::<_, WebhookDelivery>(&query)
        .bind(batch)
        .fetch_all(conn)
        .await
}

pub async fn mark_delivered(
    conn: &mut PgConnection,
    delivery: &WebhookDelivery,
    response_status: i32,
    response_headers: BTreeMap<String, String>,
    response_body: String,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE webhook_deliveries \
         SET status = 'delivered', completed_at = now(), next_retry_at = NULL, \
             response_status = $2, response_headers = $3, response_body = $4, last_error = NULL \
         WHERE id = $1",
    )
    .bind(delivery.id)
    .bind(response_status)
    .bind(Json(response_headers))
    .bind(response_body)
    .execute(&mut *conn)
    .await?;
    sqlx::query(
        "UPDATE webhooks SET failure_count = 0, last_delivered_at = now() WHERE id = $1",
    )
    .bind(delivery.webhook_id)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn mark_failed(
    conn: &mut PgConnection,
    delivery: &WebhookDelivery,
    error: &str,
    response_status: Option<i32>,
) -> Result<(), sqlx::Error> {
    let new_count = delivery.retry_count + 1;
    let next_retry_at = if new_count < delivery.max_retries {
        let backoff = Duration::from_std(retry_backoff(new_count))
            .unwrap_or_else(|_| Duration::seconds(BACKOFF_CAP_SECS as i64));
        Some(Utc::now() + backoff)
    } else {
        None
    };
    sqlx::query(
        "UPDATE webhook_deliveries \
         SET status = 'failed', retry_count = $2, next_retry_at = $3, \
             response_status = $4, last_error = $5 \
         WHERE id = $1",
    )
    .bind(delivery.id)
    .bind(new_count)
    .bind(next_retry_at)
    .bind(response_status)
    .bind(error)
    .execute(&mut *conn)
    .await?;
    sqlx::query("UPDATE webhooks SET failure_count = failure_count + 1 WHERE id = $1")
        .bind(delivery.webhook_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Terminal state for deliveries whose webhook disappeared mid-flight.
pub async fn mark_cancelled(conn: &mut PgConnection, delivery_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE webhook_deliveries \
         SET status = 'cancelled', completed_at = now(), next_retry_at = NULL \
         WHERE id = $1",
    )
    .bind(delivery_id)
    .execute(conn)
    .await
    .map(|_| ())
}

/// Drop terminal deliveries older than the retention window.
pub async fn cleanup_old_deliveries(
    conn: &mut PgConnection,
    retention_days: i64,
) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(retention_days);
    let done = sqlx::query(
        "DELETE FROM webhook_deliveries \
         WHERE created_at < $1 AND status IN ('delivered', 'failed', 'cancelled')",
    )
    .bind(cutoff)
    .execute(conn)
    .await?;
    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_base_concatenates_payload_bytes() {
        let event_id = Uuid::nil();
        let base = signature_base(1700000000, event_id, "signature.created", br#"{"a":1}"#);
        assert_eq!(
            String::from_utf8(base).unwrap(),
            format!("1700000000.{event_id}.signature.created.{{\"a\":1}}")
        );
    }

    #[test]
    fn signing_is_reproducible_with_same_secret() {
        let event_id = Uuid::new_v4();
        let payload = br#"{"doc_id":"D1"}"#;
        let a = sign_delivery("s", 1700000000, event_id, "signature.created", payload);
        let b = sign_delivery("s", 1700000000, event_id, "signature.created", payload);
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        let other = sign_delivery("other", 1700000000, event_id, "signature.created", payload);
        assert_ne!(a, other);
    }

    #[test]
    fn backoff_grows_and_caps() {
        // Strip jitter bounds: value must stay within ±20% of the schedule.
        let schedule = [(1, 30.0), (2, 60.0), (3, 120.0), (7, 1920.0), (10, 3600.0), (30, 3600.0)];
        for (retry, expected) in schedule {
            let secs = retry_backoff(retry).as_secs_f64();
            assert!(
                secs >= expected * 0.8 - f64::EPSILON && secs <= expected * 1.2 + f64::EPSILON,
                "retry {retry}: got {secs}, expected around {expected}"
            );
        }
    }

    #[test]
    fn backoff_jitter_never_leaves_the_band() {
        for _ in 0..200 {
            let secs = retry_backoff(3).as_secs_f64();
            assert!((96.0..=144.0).contains(&secs), "retry 3 out of band: {secs}");
            let capped = retry_backoff(20).as_secs_f64();
            assert!((2880.0..=4320.0).contains(&capped), "cap out of band: {capped}");
        }
    }

    #[test]
    fn unknown_events_are_rejected() {
        assert!(validate_events(&["signature.created".to_string()]).is_ok());
        assert!(matches!(
            validate_events(&["bogus.event".to_string()]),
            Err(WebhookError::UnknownEvent(_))
        ));
    }
}
