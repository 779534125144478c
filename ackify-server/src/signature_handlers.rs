use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;

use crate::app::AppState;
use crate::authz::AdminUser;
use crate::sessions::CurrentUser;
use crate::signatures;
use crate::signing::rfc3339_nano;
use crate::tenant::{TenantId, TenantTx};
use crate::webhooks;

#[derive(Debug, Deserialize)]
pub struct CreateSignatureRequest {
    pub doc_id: String,
    #[serde(default)]
    pub referer: Option<String>,
}

/// `POST /signatures`: sign the document, chain the record, and enqueue the
/// `signature.created` outbox rows, all in one tenant transaction.
pub async fn create_signature(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    CurrentUser(user): CurrentUser,
    Json(request): Json<CreateSignatureRequest>,
) -> ApiResult<(StatusCode, Json<signatures::Signature>)> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let signature = signatures::create_proof(
        &mut tx,
        &state.signer,
        &user,
        &request.doc_id,
        request.referer,
    )
    .await?;

    let payload = json!({
        "doc_id": signature.doc_id,
        "user_sub": signature.user_sub,
        "user_email": signature.user_email,
        "signed_at": rfc3339_nano(signature.signed_at),
        "payload_hash": signature.payload_hash,
        "signature_id": signature.id,
    });
    webhooks::enqueue_event(
        tx.conn(),
        webhooks::EVENT_SIGNATURE_CREATED,
        &payload,
        state.config.webhooks.max_retries,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(doc_id = %signature.doc_id, user_sub = %signature.user_sub, "Signature recorded");
    Ok((StatusCode::CREATED, Json(signature)))
}

/// `GET /signatures`: the caller's own signatures.
pub async fn list_my_signatures(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    CurrentUser(user): CurrentUser,
) -> ApiResult<Json<Vec<signatures::Signature>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let sigs = signatures::get_by_user(tx.conn(), &user.sub)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(sigs))
}

/// `GET /documents/{docId}/signatures` (public proof listing).
pub async fn list_doc_signatures(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<Vec<signatures::Signature>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let sigs = signatures::get_by_doc(tx.conn(), &doc_id)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(sigs))
}

/// `GET /documents/{docId}/signatures/status`
pub async fn signature_status(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    CurrentUser(user): CurrentUser,
    Path(doc_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let result = signatures::get_by_doc_and_user(tx.conn(), &doc_id, &user.sub).await;
    tx.commit().await.map_err(ApiError::internal)?;
    match result {
        Ok(signature) => Ok(Json(json!({ "signed": true, "signature": signature }))),
        Err(signatures::SignatureError::NotFound) => {
            Ok(Json(json!({ "signed": false, "signature": null })))
        }
        Err(err) => Err(err.into()),
    }
}

/// `GET /admin/signatures/verify-chain`
pub async fn verify_chain(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let report = signatures::verify_chain(&mut tx)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(json!({
        "report": report,
        "public_key": state.signer.public_key_b64(),
    })))
}

/// `POST /admin/signatures/rebuild-chain`
pub async fn rebuild_chain(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(admin): AdminUser,
) -> ApiResult<Json<serde_json::Value>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let updated = signatures::rebuild_chain(&mut tx)
        .await
        .map_err(ApiError::internal)?;
    let report = signatures::verify_chain(&mut tx)
        .await
        .map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(admin = %admin.normalized_email(), updated, "Signature chain rebuilt");
    Ok(Json(json!({ "updated": updated, "report": report })))
}
