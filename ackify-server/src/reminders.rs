use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use uuid::Uuid;

pub const STATUS_SENT: &str = "sent";
pub const STATUS_FAILED: &str = "failed";
pub const STATUS_BOUNCED: &str = "bounced";
pub const STATUS_QUEUED: &str = "queued";

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ReminderLog {
    pub id: i64,
    pub tenant_id: Uuid,
    pub doc_id: String,
    pub recipient_email: String,
    pub sent_at: DateTime<Utc>,
    pub sent_by: String,
    pub template_used: String,
    pub status: String,
    pub error_message: Option<String>,
}

pub async fn record(
    conn: &mut PgConnection,
    doc_id: &str,
    recipient_email: &str,
    sent_by: &str,
    template_used: &str,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO reminder_logs (doc_id, recipient_email, sent_by, template_used, status) \
         VALUES ($1, $2, $3, $4, 'queued') RETURNING id",
    )
    .bind(doc_id)
    .bind(recipient_email)
    .bind(sent_by)
    .bind(template_used)
    .fetch_one(conn)
    .await
}

pub async fn update_status(
    conn: &mut PgConnection,
    id: i64,
    status: &str,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE reminder_logs SET status = $2, error_message = $3 WHERE id = $1")
        .bind(id)
        .bind(status)
        .bind(error_message)
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn list_for_doc(
    conn: &mut PgConnection,
    doc_id: &str,
) -> Result<Vec<ReminderLog>, sqlx::Error> {
    sqlx::query_as::<_, ReminderLog>(
        "SELECT id, tenant_id, doc_id, recipient_email, sent_at, sent_by, template_used, \
                status, error_message \
         FROM reminder_logs WHERE doc_id = $1 ORDER BY sent_at DESC",
    )
    .bind(doc_id)
    .fetch_all(conn)
    .await
}
