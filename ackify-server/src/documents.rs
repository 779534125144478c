use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgConnection};
use thiserror::Error;
use uuid::Uuid;

pub const CHECKSUM_ALGORITHMS: &[&str] = &["SHA-256", "SHA-512", "MD5"];

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("document not found")]
    NotFound,
    #[error("document already exists")]
    AlreadyExists,
    #[error("unsupported checksum algorithm")]
    InvalidChecksumAlgorithm,
    #[error("invalid document id")]
    InvalidDocId,
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<DocumentError> for common_http_errors::ApiError {
    fn from(err: DocumentError) -> Self {
        use common_http_errors::ApiError;
        match err {
            DocumentError::NotFound => ApiError::not_found("document_not_found", "Document not found"),
            DocumentError::AlreadyExists => {
                ApiError::conflict("document_already_exists", "A document with this id already exists")
            }
            DocumentError::InvalidChecksumAlgorithm => ApiError::validation(
                "invalid_checksum_algorithm",
                "checksum_algorithm must be one of SHA-256, SHA-512, MD5",
            ),
            DocumentError::InvalidDocId => {
                ApiError::validation("invalid_doc_id", "A document id is required")
            }
            DocumentError::Database(err) => ApiError::internal(err),
        }
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Document {
    pub tenant_id: Uuid,
    pub doc_id: String,
    pub title: String,
    pub url: String,
    pub checksum: String,
    pub checksum_algorithm: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub created_by: String,
}

#[derive(Debug, Deserialize)]
pub struct NewDocument {
    pub doc_id: String,
    pub title: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub checksum: String,
    #[serde(default = "default_checksum_algorithm")]
    pub checksum_algorithm: String,
    #[serde(default)]
    pub description: String,
}

fn default_checksum_algorithm() -> String {
    "SHA-256".to_string()
}

#[derive(Debug, Deserialize)]
pub struct DocumentUpdate {
    pub title: Option<String>,
    pub url: Option<String>,
    pub checksum: Option<String>,
    pub checksum_algorithm: Option<String>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct ExpectedSigner {
    pub tenant_id: Uuid,
    pub doc_id: String,
    pub email: String,
    pub added_at: DateTime<Utc>,
    pub added_by: String,
    pub notes: Option<String>,
}

const DOCUMENT_COLUMNS: &str = "tenant_id, doc_id, title, url, checksum, checksum_algorithm, \
     description, created_at, updated_at, created_by";

pub async fn create(
    conn: &mut PgConnection,
    new: NewDocument,
    created_by: &str,
) -> Result<Document, DocumentError> {
    let doc_id = new.doc_id.trim();
    if doc_id.is_empty() {
        return Err(DocumentError::InvalidDocId);
    }
    if !CHECKSUM_ALGORITHMS.contains(&new.checksum_algorithm.as_str()) {
        return Err(DocumentError::InvalidChecksumAlgorithm);
    }
    let query = format!(
        "INSERT INTO documents (doc_id, title, url, checksum, checksum_algorithm, description, created_by) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {DOCUMENT_COLUMNS}"
    );
    sqlx::query_as::<_, Document>(&query)
        .bind(doc_id)
        .bind(&new.title)
        .bind(&new.url)
        .bind(&new.checksum)
        .bind(&new.checksum_algorithm)
        .bind(&new.description)
        .bind(created_by)
        .fetch_one(conn)
        .await
        .map_err(|err| {
            if let sqlx::Error::Database(db) = &err {
                if db.code().as_deref() == Some("23505") {
                    return DocumentError::AlreadyExists;
                }
            }
            DocumentError::Database(err)
        })
}

pub async fn list(conn: &mut PgConnection) -> Result<Vec<Document>, sqlx::Error> {
    let query = format!("SELECT {DOCUMENT_COLUMNS} FROM documents ORDER BY created_at DESC");
    sqlx::query_as::<_, Document>(&query).fetch_all(conn).await
}

pub async fn get(conn: &mut PgConnection, doc_id: &str) -> Result<Document, DocumentError> {
    let query = format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE doc_id = $1");
    sqlx::query_as::<_, Document>(&query)
        .bind(doc_id)
        .fetch_optional(conn)
        .await?
        .ok_or(DocumentError::NotFound)
}

pub async fn update(
    conn: &mut PgConnection,
    doc_id: &str,
    update: DocumentUpdate,
) -> Result<Document, DocumentError> {
    let current = get(&mut *conn, doc_id).await?;
    if let Some(algorithm) = &update.checksum_algorithm {
        if !CHECKSUM_ALGORITHMS.contains(&algorithm.as_str()) {
            return Err(DocumentError::InvalidChecksumAlgorithm);
        }
    }
    let query = format!(
        "UPDATE documents \
         SET title = $2, url = $3, checksum = $4, checksum_algorithm = $5, description = $6 \
         WHERE doc_id = $1 RETURNING {DOCUMENT_COLUMNS}"
    );
    Ok(sqlx::query_as::<_, Document>(&query)
        .bind(doc_id)
        .bind(update.title.unwrap_or(current.title))
        .bind(update.url.unwrap_or(current.url))
        .bind(update.checksum.unwrap_or(current.checksum))
        .bind(update.checksum_algorithm.unwrap_or(current.checksum_algorithm))
        .bind(update.description.unwrap_or(current.description))
        .fetch_one(conn)
        .await?)
}

pub async fn delete(conn: &mut PgConnection, doc_id: &str) -> Result<bool, sqlx::Error> {
    let done = sqlx::query("DELETE FROM documents WHERE doc_id = $1")
        .bind(doc_id)
        .execute(conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn add_expected_signer(
    conn: &mut PgConnection,
    doc_id: &str,
    email: &str,
    added_by: &str,
    notes: Option<String>,
) -> Result<ExpectedSigner, DocumentError> {
    get(&mut *conn, doc_id).await?;
    sqlx::query_as::<_, ExpectedSigner>(
        "INSERT INTO expected_signers (doc_id, email, added_by, notes) \
         VALUES ($1, $2, $3, $4) \
         ON CONFLICT (tenant_id, doc_id, email) DO UPDATE SET notes = EXCLUDED.notes \
         RETURNING tenant_id, doc_id, email, added_at, added_by, notes",
    )
    .bind(doc_id)
    .bind(email.trim().to_ascii_lowercase())
    .bind(added_by)
    .bind(notes)
    .fetch_one(conn)
    .await
    .map_err(DocumentError::from)
}

pub async fn remove_expected_signer(
    conn: &mut PgConnection,
    doc_id: &str,
    email: &str,
) -> Result<bool, sqlx::Error> {
    let done = sqlx::query("DELETE FROM expected_signers WHERE doc_id = $1 AND email = $2")
        .bind(doc_id)
        .bind(email.trim().to_ascii_lowercase())
        .execute(conn)
        .await?;
    Ok(done.rows_affected() > 0)
}

pub async fn list_expected_signers(
    conn: &mut PgConnection,
    doc_id: &str,
) -> Result<Vec<ExpectedSigner>, sqlx::Error> {
    sqlx::query_as::<_, ExpectedSigner>(
        "SELECT tenant_id, doc_id, email, added_at, added_by, notes \
         FROM expected_signers WHERE doc_id = $1 ORDER BY added_at ASC",
    )
    .bind(doc_id)
    .fetch_all(conn)
    .await
}

/// Expected signers who have not acknowledged the document yet. Signature
/// emails are stored normalized, so a plain equality join suffices.
pub async fn pending_signers(
    conn: &mut PgConnection,
    doc_id: &str,
) -> Result<Vec<String>, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT es.email FROM expected_signers es \
         LEFT JOIN signatures s ON s.doc_id = es.doc_id AND s.user_email = es.email \
         WHERE es.doc_id = $1 AND s.id IS NULL \
         ORDER BY es.email ASC",
    )
    .bind(doc_id)
    .fetch_all(conn)
    .await
}
