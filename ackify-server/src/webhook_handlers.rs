use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde_json::json;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::AdminUser;
use crate::tenant::{TenantId, TenantTx};
use crate::webhooks;

/// `POST /admin/webhooks`: the generated secret is returned exactly once,
/// in this response.
pub async fn create_webhook(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Json(new): Json<webhooks::NewWebhook>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let webhook = webhooks::create(tx.conn(), new).await?;
    let payload = json!({ "webhook_id": webhook.id, "title": webhook.title });
    webhooks::enqueue_lifecycle(
        tx.conn(),
        webhooks::EVENT_WEBHOOK_CREATED,
        &payload,
        state.config.webhooks.max_retries,
        webhook.id,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(webhook_id = %webhook.id, "Webhook created");
    let mut body = serde_json::to_value(&webhook).map_err(ApiError::internal)?;
    body["secret"] = json!(webhook.secret);
    Ok((StatusCode::CREATED, Json(body)))
}

/// `GET /admin/webhooks` (secrets are never listed).
pub async fn list_webhooks(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
) -> ApiResult<Json<Vec<webhooks::Webhook>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let hooks = webhooks::list(tx.conn()).await.map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(hooks))
}

/// `GET /admin/webhooks/{id}`
pub async fn get_webhook(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<webhooks::Webhook>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let webhook = webhooks::get(tx.conn(), id).await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(webhook))
}

/// `PUT /admin/webhooks/{id}`
pub async fn update_webhook(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(id): Path<Uuid>,
    Json(update): Json<webhooks::WebhookUpdate>,
) -> ApiResult<Json<webhooks::Webhook>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let webhook = webhooks::update(tx.conn(), id, update).await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(webhook))
}

/// `DELETE /admin/webhooks/{id}`
pub async fn delete_webhook(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let webhook = webhooks::get(tx.conn(), id).await?;
    webhooks::delete(tx.conn(), id)
        .await
        .map_err(ApiError::internal)?;
    let payload = json!({ "webhook_id": webhook.id, "title": webhook.title });
    webhooks::enqueue_lifecycle(
        tx.conn(),
        webhooks::EVENT_WEBHOOK_DELETED,
        &payload,
        state.config.webhooks.max_retries,
        webhook.id,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(webhook_id = %id, "Webhook deleted");
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /admin/webhooks/{id}/deliveries`
pub async fn list_deliveries(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Vec<webhooks::WebhookDelivery>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    webhooks::get(tx.conn(), id).await?;
    let deliveries = webhooks::list_deliveries(tx.conn(), id, 100)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(deliveries))
}

/// `POST /admin/webhooks/{id}/test`: enqueue a high-priority test delivery
/// that rides the normal dispatch and retry machinery.
pub async fn test_webhook(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(admin): AdminUser,
    Path(id): Path<Uuid>,
) -> ApiResult<(StatusCode, Json<serde_json::Value>)> {
    let payload = json!({
        "message": "Ackify webhook test",
        "requested_by": admin.normalized_email(),
    });
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let event_id = webhooks::enqueue_test(
        tx.conn(),
        id,
        &payload,
        state.config.webhooks.max_retries,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok((StatusCode::ACCEPTED, Json(json!({ "event_id": event_id }))))
}
