use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;

use crate::app::AppState;
use crate::authz::AdminUser;
use crate::documents;
use crate::sessions::CurrentUser;
use crate::settings;
use crate::tenant::{TenantId, TenantTx};
use crate::webhooks;

/// `GET /documents`
pub async fn list_documents(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
) -> ApiResult<Json<Vec<documents::Document>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let docs = documents::list(tx.conn()).await.map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(docs))
}

/// `GET /documents/{docId}`
pub async fn get_document(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<documents::Document>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let doc = documents::get(tx.conn(), &doc_id).await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(doc))
}

/// `POST /documents`: open to any authenticated reader unless the
/// admin-only policy is enabled.
pub async fn create_document(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    CurrentUser(user): CurrentUser,
    Json(new): Json<documents::NewDocument>,
) -> ApiResult<(StatusCode, Json<documents::Document>)> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let policy_override = settings::get(tx.conn(), settings::ONLY_ADMIN_CAN_CREATE)
        .await
        .map_err(ApiError::internal)?
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"));
    if !state
        .authorizer
        .can_create_document(&user.email, policy_override)
    {
        return Err(ApiError::forbidden(
            "document_creation_restricted",
            "Only administrators may create documents",
        ));
    }

    let doc = documents::create(tx.conn(), new, &user.normalized_email()).await?;
    let payload = json!({
        "doc_id": doc.doc_id,
        "title": doc.title,
        "created_by": doc.created_by,
    });
    webhooks::enqueue_event(
        tx.conn(),
        webhooks::EVENT_DOCUMENT_CREATED,
        &payload,
        state.config.webhooks.max_retries,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(doc_id = %doc.doc_id, "Document created");
    Ok((StatusCode::CREATED, Json(doc)))
}

/// `GET /admin/documents`
pub async fn admin_list_documents(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
) -> ApiResult<Json<Vec<documents::Document>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let docs = documents::list(tx.conn()).await.map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(docs))
}

/// `PUT /admin/documents/{docId}`
pub async fn update_document(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(doc_id): Path<String>,
    Json(update): Json<documents::DocumentUpdate>,
) -> ApiResult<Json<documents::Document>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let doc = documents::update(tx.conn(), &doc_id, update).await?;
    let payload = json!({ "doc_id": doc.doc_id, "title": doc.title });
    webhooks::enqueue_event(
        tx.conn(),
        webhooks::EVENT_DOCUMENT_UPDATED,
        &payload,
        state.config.webhooks.max_retries,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(doc))
}

/// `DELETE /admin/documents/{docId}`
pub async fn delete_document(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path(doc_id): Path<String>,
) -> ApiResult<StatusCode> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let removed = documents::delete(tx.conn(), &doc_id)
        .await
        .map_err(ApiError::internal)?;
    if !removed {
        return Err(ApiError::not_found("document_not_found", "Document not found"));
    }
    let payload = json!({ "doc_id": doc_id });
    webhooks::enqueue_event(
        tx.conn(),
        webhooks::EVENT_DOCUMENT_DELETED,
        &payload,
        state.config.webhooks.max_retries,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(StatusCode::NO_CONTENT)
}

/// `GET /documents/{docId}/expected-signers`
pub async fn list_expected_signers(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<Vec<documents::ExpectedSigner>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let signers = documents::list_expected_signers(tx.conn(), &doc_id)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(signers))
}

#[derive(Debug, Deserialize)]
pub struct AddSignerRequest {
    pub email: String,
    #[serde(default)]
    pub notes: Option<String>,
}

/// `POST /admin/documents/{docId}/signers`
pub async fn add_expected_signer(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(admin): AdminUser,
    Path(doc_id): Path<String>,
    Json(request): Json<AddSignerRequest>,
) -> ApiResult<(StatusCode, Json<documents::ExpectedSigner>)> {
    if !crate::magic_link::email_shape_ok(&request.email) {
        return Err(ApiError::validation("invalid_email", "A valid email address is required"));
    }
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let signer = documents::add_expected_signer(
        tx.conn(),
        &doc_id,
        &request.email,
        &admin.normalized_email(),
        request.notes,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok((StatusCode::CREATED, Json(signer)))
}

/// `DELETE /admin/documents/{docId}/signers/{email}`
pub async fn remove_expected_signer(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
    Path((doc_id, email)): Path<(String, String)>,
) -> ApiResult<StatusCode> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let removed = documents::remove_expected_signer(tx.conn(), &doc_id, &email)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    if removed {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ApiError::not_found("signer_not_found", "Expected signer not found"))
    }
}
