use axum::extract::{Path, State};
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::app::AppState;
use crate::authz::AdminUser;
use crate::documents;
use crate::magic_link;
use crate::mailer;
use crate::reminders;
use crate::tenant::{TenantId, TenantTx};
use crate::webhooks;

#[derive(Debug, Deserialize)]
pub struct SendRemindersRequest {
    /// Explicit recipients; defaults to every expected signer still pending.
    #[serde(default)]
    pub emails: Option<Vec<String>>,
    #[serde(default)]
    pub locale: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ReminderBatchResult {
    pub sent: Vec<String>,
    pub failed: Vec<String>,
    pub bounced: Vec<String>,
    pub skipped: Vec<String>,
}

struct QueuedReminder {
    email: String,
    token: String,
    log_id: i64,
}

/// `POST /admin/documents/{docId}/reminders`: issue one reminder-auth link
/// per pending signer, log each send, and enqueue `reminder.sent` events.
/// The SMTP hops happen after the transaction commits; a failed hop marks
/// its log row `failed` without aborting the batch.
pub async fn send_reminders(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(admin): AdminUser,
    Path(doc_id): Path<String>,
    Json(request): Json<SendRemindersRequest>,
) -> ApiResult<Json<ReminderBatchResult>> {
    let locale = request.locale.unwrap_or_else(|| "en".to_string());

    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let doc = documents::get(tx.conn(), &doc_id).await?;
    let pending = documents::pending_signers(tx.conn(), &doc_id)
        .await
        .map_err(ApiError::internal)?;

    let mut skipped = Vec::new();
    let recipients: Vec<String> = match request.emails {
        Some(explicit) => explicit
            .into_iter()
            .map(|email| email.trim().to_ascii_lowercase())
            .filter(|email| {
                if pending.contains(email) {
                    true
                } else {
                    skipped.push(email.clone());
                    false
                }
            })
            .collect(),
        None => pending,
    };

    let mut queued = Vec::with_capacity(recipients.len());
    for email in &recipients {
        let redirect_to = format!(
            "{}/?doc={}",
            state.config.base_url,
            urlencoding::encode(&doc_id)
        );
        let token = magic_link::create_reminder_auth_token(
            tx.conn(),
            &state.config.magic_link,
            email,
            &doc_id,
            Some(redirect_to),
        )
        .await?;
        let log_id = reminders::record(tx.conn(), &doc_id, email, &admin.normalized_email(), "reminder")
            .await
            .map_err(ApiError::internal)?;
        let payload = json!({
            "doc_id": doc_id,
            "recipient_email": email,
            "sent_by": admin.normalized_email(),
        });
        webhooks::enqueue_event(
            tx.conn(),
            webhooks::EVENT_REMINDER_SENT,
            &payload,
            state.config.webhooks.max_retries,
        )
        .await?;
        queued.push(QueuedReminder { email: email.clone(), token, log_id });
    }
    tx.commit().await.map_err(ApiError::internal)?;

    let mut sent = Vec::new();
    let mut failed = Vec::new();
    let mut bounced = Vec::new();
    for reminder in queued {
        let link = format!(
            "{}/api/v1/auth/reminder-link/verify?token={}",
            state.config.base_url,
            urlencoding::encode(&reminder.token)
        );
        let rendered = mailer::reminder_email(&locale, &doc.title, &link);
        let outcome = state
            .mailer
            .send(&reminder.email, &rendered.subject, &rendered.text, Some(rendered.html))
            .await;

        let mut tx = TenantTx::begin(&state.db, tenant_id)
            .await
            .map_err(ApiError::internal)?;
        match outcome {
            Ok(()) => {
                reminders::update_status(tx.conn(), reminder.log_id, reminders::STATUS_SENT, None)
                    .await
                    .map_err(ApiError::internal)?;
                sent.push(reminder.email);
            }
            // Permanent rejections are bounces; transient ones may succeed
            // on a later batch.
            Err(err) => {
                let status = if err.is_permanent() {
                    reminders::STATUS_BOUNCED
                } else {
                    reminders::STATUS_FAILED
                };
                tracing::warn!(
                    error = %err,
                    recipient = %reminder.email,
                    status,
                    "Reminder mail not delivered"
                );
                reminders::update_status(
                    tx.conn(),
                    reminder.log_id,
                    status,
                    Some(&err.to_string()),
                )
                .await
                .map_err(ApiError::internal)?;
                if err.is_permanent() {
                    bounced.push(reminder.email);
                } else {
                    failed.push(reminder.email);
                }
            }
        }
        tx.commit().await.map_err(ApiError::internal)?;
    }

    tracing::info!(
        doc_id = %doc_id,
        sent = sent.len(),
        failed = failed.len(),
        bounced = bounced.len(),
        skipped = skipped.len(),
        "Reminder batch finished"
    );
    Ok(Json(ReminderBatchResult { sent, failed, bounced, skipped }))
}

/// `GET /admin/documents/{docId}/reminders`
pub async fn list_reminders(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<Vec<reminders::ReminderLog>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    documents::get(tx.conn(), &doc_id).await?;
    let logs = reminders::list_for_doc(tx.conn(), &doc_id)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(logs))
}
