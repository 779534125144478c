use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{DateTime, Utc};
use common_http_errors::ApiError;
use sqlx::{FromRow, PgConnection, PgPool, Postgres, Transaction};
use std::future::Future;
use std::pin::Pin;
use uuid::Uuid;

/// A database transaction scoped to one tenant. Opening it runs
/// `SELECT set_config('app.tenant_id', <uuid>, true)` so every row-level
/// security predicate in the transaction resolves against that tenant.
///
/// Dropping the value without [`TenantTx::commit`] rolls the transaction
/// back, which covers error returns, panics, and cancelled requests alike.
pub struct TenantTx {
    tx: Transaction<'static, Postgres>,
    tenant_id: Uuid,
}

impl TenantTx {
    pub async fn begin(pool: &PgPool, tenant_id: Uuid) -> Result<Self, sqlx::Error> {
        let mut tx = pool.begin().await?;
        sqlx::query("SELECT set_config('app.tenant_id', $1, true)")
            .bind(tenant_id.to_string())
            .execute(&mut *tx)
            .await?;
        Ok(Self { tx, tenant_id })
    }

    pub fn tenant_id(&self) -> Uuid {
        self.tenant_id
    }

    /// The connection repositories run against. Repositories take
    /// `&mut PgConnection` so they inherit whatever tenant scope the caller
    /// opened, and never add tenant filters of their own.
    pub fn conn(&mut self) -> &mut PgConnection {
        &mut self.tx
    }

    pub async fn commit(self) -> Result<(), sqlx::Error> {
        self.tx.commit().await
    }

    pub async fn rollback(self) -> Result<(), sqlx::Error> {
        self.tx.rollback().await
    }
}

type TenantFuture<'a, T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'a>>;

/// Run `f` inside a tenant-scoped transaction: commit on `Ok`, roll back on
/// `Err`. Background workers use this wrapper; request handlers usually hold
/// a [`TenantTx`] directly so they can stage several writes before commit.
pub async fn with_tenant_context<T, F>(pool: &PgPool, tenant_id: Uuid, f: F) -> anyhow::Result<T>
where
    F: for<'a> FnOnce(&'a mut TenantTx) -> TenantFuture<'a, T>,
{
    let mut tx = TenantTx::begin(pool, tenant_id).await?;
    match f(&mut tx).await {
        Ok(value) => {
            tx.commit().await?;
            Ok(value)
        }
        Err(err) => {
            if let Err(rb) = tx.rollback().await {
                tracing::warn!(error = %rb, tenant_id = %tenant_id, "Rollback failed");
            }
            Err(err)
        }
    }
}

/// Tenant resolved for the current request, inserted into request extensions
/// by the tenant middleware (`X-Tenant-ID` header, else the configured
/// default tenant).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TenantId(pub Uuid);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for TenantId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<TenantId>()
            .copied()
            .ok_or_else(|| ApiError::internal("tenant middleware not installed"))
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Tenant {
    pub id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

/// The tenants registry is deliberately outside row-level security: workers
/// iterate it to open a context per tenant.
pub async fn list_tenant_ids(pool: &PgPool) -> Result<Vec<Uuid>, sqlx::Error> {
    sqlx::query_scalar("SELECT id FROM tenants ORDER BY created_at ASC")
        .fetch_all(pool)
        .await
}

pub async fn ensure_tenant(pool: &PgPool, id: Uuid, name: &str) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO tenants (id, name) VALUES ($1, $2) ON CONFLICT (id) DO NOTHING")
        .bind(id)
        .bind(name)
        .execute(pool)
        .await
        .map(|_| ())
}
