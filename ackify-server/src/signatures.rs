use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgConnection};
use thiserror::Error;
use uuid::Uuid;

use crate::chain;
use crate::sessions::User;
use crate::signing::{CanonicalSigner, SigningError};
use crate::tenant::TenantTx;

/// One append-only ledger row. `prev_hash` is the record-hash of the row with
/// the next-lower id in the tenant's stream, or NULL for the genesis row.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Signature {
    pub id: i64,
    pub tenant_id: Uuid,
    pub doc_id: String,
    pub user_sub: String,
    pub user_email: String,
    pub user_name: Option<String>,
    pub signed_at: DateTime<Utc>,
    pub payload_hash: String,
    pub signature: String,
    pub nonce: String,
    pub created_at: DateTime<Utc>,
    pub referer: Option<String>,
    pub prev_hash: Option<String>,
}

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature not found")]
    NotFound,
    #[error("signature already exists for this document and user")]
    AlreadyExists,
    #[error("invalid user")]
    InvalidUser,
    #[error("invalid document")]
    InvalidDocument,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<SignatureError> for common_http_errors::ApiError {
    fn from(err: SignatureError) -> Self {
        use common_http_errors::ApiError;
        match err {
            SignatureError::NotFound => ApiError::not_found("signature_not_found", "Signature not found"),
            SignatureError::AlreadyExists => {
                ApiError::conflict("signature_already_exists", "This document is already signed by this user")
            }
            SignatureError::InvalidUser => ApiError::unauthorized("invalid_user", "Invalid user"),
            SignatureError::InvalidDocument => {
                ApiError::validation("invalid_document", "A document id is required")
            }
            SignatureError::Database(err) => ApiError::internal(err),
        }
    }
}

impl From<SigningError> for SignatureError {
    fn from(err: SigningError) -> Self {
        match err {
            SigningError::InvalidUser => SignatureError::InvalidUser,
            SigningError::InvalidKey(_) => {
                SignatureError::Database(sqlx::Error::Protocol(err.to_string()))
            }
        }
    }
}

const SIGNATURE_COLUMNS: &str = "id, tenant_id, doc_id, user_sub, user_email, user_name, \
     signed_at, payload_hash, signature, nonce, created_at, referer, prev_hash";

/// Sign `doc_id` for `user` and append the proof to the ledger, all inside
/// the caller's tenant transaction. The previous row is fetched under the
/// same transaction so the chain link cannot skip concurrent commits.
pub async fn create_proof(
    tx: &mut TenantTx,
    signer: &CanonicalSigner,
    user: &User,
    doc_id: &str,
    referer: Option<String>,
) -> Result<Signature, SignatureError> {
    let doc_id = doc_id.trim();
    if doc_id.is_empty() {
        return Err(SignatureError::InvalidDocument);
    }
    if !user.is_valid() {
        return Err(SignatureError::InvalidUser);
    }

    let signed_at = Utc::now();
    let nonce = CanonicalSigner::generate_nonce();
    let (payload_hash, signature) = signer.create_signature(doc_id, user, signed_at, &nonce)?;

    let conn = tx.conn();
    let prev_hash = last_signature(conn).await?.map(|prev| chain::record_hash(&prev));

    let query = format!(
        "INSERT INTO signatures \
           (doc_id, user_sub, user_email, user_name, signed_at, payload_hash, signature, nonce, referer, prev_hash) \
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) \
         RETURNING {SIGNATURE_COLUMNS}"
    );
    let inserted = sqlx::query_as::<_, Signature>(&query)
        .bind(doc_id)
        .bind(&user.sub)
        .bind(user.normalized_email())
        .bind(&user.name)
        .bind(signed_at)
        .bind(&payload_hash)
        .bind(&signature)
        .bind(&nonce)
        .bind(&referer)
        .bind(&prev_hash)
        .fetch_one(tx.conn())
        .await
        .map_err(map_unique_violation)?;

    Ok(inserted)
}

fn map_unique_violation(err: sqlx::Error) -> SignatureError {
    if let sqlx::Error::Database(db) = &err {
        if db.code().as_deref() == Some("23505") {
            return SignatureError::AlreadyExists;
        }
    }
    SignatureError::Database(err)
}

async fn last_signature(conn: &mut PgConnection) -> Result<Option<Signature>, sqlx::Error> {
    let query = format!("SELECT {SIGNATURE_COLUMNS} FROM signatures ORDER BY id DESC LIMIT 1");
    sqlx::query_as::<_, Signature>(&query).fetch_optional(conn).await
}

pub async fn get_by_doc_and_user(
    conn: &mut PgConnection,
    doc_id: &str,
    user_sub: &str,
) -> Result<Signature, SignatureError> {
    let query = format!(
        "SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE doc_id = $1 AND user_sub = $2"
    );
    sqlx::query_as::<_, Signature>(&query)
        .bind(doc_id)
        .bind(user_sub)
        .fetch_optional(conn)
        .await?
        .ok_or(SignatureError::NotFound)
}

pub async fn get_by_doc(
    conn: &mut PgConnection,
    doc_id: &str,
) -> Result<Vec<Signature>, sqlx::Error> {
    let query = format!(
        "SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE doc_id = $1 ORDER BY signed_at DESC"
    );
    sqlx::query_as::<_, Signature>(&query).bind(doc_id).fetch_all(conn).await
}

pub async fn get_by_user(
    conn: &mut PgConnection,
    user_sub: &str,
) -> Result<Vec<Signature>, sqlx::Error> {
    let query = format!(
        "SELECT {SIGNATURE_COLUMNS} FROM signatures WHERE user_sub = $1 ORDER BY signed_at DESC"
    );
    sqlx::query_as::<_, Signature>(&query).bind(user_sub).fetch_all(conn).await
}

pub async fn exists_by_doc_and_user(
    conn: &mut PgConnection,
    doc_id: &str,
    user_sub: &str,
) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT EXISTS(SELECT 1 FROM signatures WHERE doc_id = $1 AND user_sub = $2)",
    )
    .bind(doc_id)
    .bind(user_sub)
    .fetch_one(conn)
    .await
}

/// Full tenant stream in id order; the verifier and rebuild walk this.
pub async fn all_ordered(conn: &mut PgConnection) -> Result<Vec<Signature>, sqlx::Error> {
    let query = format!("SELECT {SIGNATURE_COLUMNS} FROM signatures ORDER BY id ASC");
    sqlx::query_as::<_, Signature>(&query).fetch_all(conn).await
}

/// Only chain rebuild may touch an existing row, and only this column.
pub async fn update_prev_hash(
    conn: &mut PgConnection,
    id: i64,
    prev_hash: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE signatures SET prev_hash = $2 WHERE id = $1")
        .bind(id)
        .bind(prev_hash)
        .execute(conn)
        .await
        .map(|_| ())
}

pub async fn verify_chain(tx: &mut TenantTx) -> Result<chain::ChainReport, sqlx::Error> {
    let sigs = all_ordered(tx.conn()).await?;
    Ok(chain::verify_chain(&sigs))
}

/// Relink the tenant's stream. Returns the number of rows updated; zero on
/// an already-consistent ledger.
pub async fn rebuild_chain(tx: &mut TenantTx) -> Result<usize, sqlx::Error> {
    let sigs = all_ordered(tx.conn()).await?;
    let plan = chain::plan_rebuild(&sigs);
    let updated = plan.len();
    for (id, value) in plan {
        update_prev_hash(tx.conn(), id, value.as_deref()).await?;
    }
    Ok(updated)
}
