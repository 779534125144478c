use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{DateTime, Duration, Utc};
use sqlx::{FromRow, PgConnection, PgPool};
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use uuid::Uuid;

use crate::config::{MagicLinkConfig, RateLimitConfig};
use crate::oauth;
use crate::tenant::{self, with_tenant_context};

pub const PURPOSE_LOGIN: &str = "login";
pub const PURPOSE_REMINDER_AUTH: &str = "reminder_auth";

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token")]
    Invalid,
    #[error("token expired")]
    Expired,
    #[error("token already used")]
    Used,
    #[error("invalid email address")]
    InvalidEmail,
    #[error("rate limited")]
    RateLimited { retry_after_secs: u64 },
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl From<TokenError> for common_http_errors::ApiError {
    fn from(err: TokenError) -> Self {
        use common_http_errors::ApiError;
        match err {
            TokenError::Invalid => ApiError::unauthorized("token_invalid", "Invalid token"),
            TokenError::Expired => ApiError::unauthorized("token_expired", "This link has expired"),
            TokenError::Used => ApiError::unauthorized("token_used", "This link has already been used"),
            TokenError::InvalidEmail => {
                ApiError::validation("invalid_email", "A valid email address is required")
            }
            TokenError::RateLimited { retry_after_secs } => {
                ApiError::rate_limited(retry_after_secs, None)
            }
            TokenError::Database(err) => ApiError::internal(err),
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct MagicLinkToken {
    pub token: String,
    pub tenant_id: Uuid,
    pub email: String,
    pub purpose: String,
    pub doc_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub used_at: Option<DateTime<Utc>>,
    pub ip: String,
    pub user_agent: String,
    pub redirect_to: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a successful verification.
#[derive(Debug, Clone)]
pub struct VerifiedToken {
    pub email: String,
    pub purpose: String,
    pub doc_id: Option<String>,
    pub redirect_to: Option<String>,
}

/// 32 random bytes, URL-safe base64. Opaque and unguessable.
pub fn generate_token() -> String {
    URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<32>())
}

/// Minimal shape check; deliverability is the SMTP server's problem.
pub fn email_shape_ok(email: &str) -> bool {
    let trimmed = email.trim();
    match trimmed.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.starts_with('.')
        }
        None => false,
    }
}

/// Issue a login token for `email`, enforcing the rolling-window rate limits
/// before any row is written. Returns the token to embed in the mail link;
/// the caller sends the mail after committing so a slow SMTP hop never holds
/// the transaction open.
pub async fn request_login_token(
    conn: &mut PgConnection,
    limits: &RateLimitConfig,
    ttl: &MagicLinkConfig,
    email: &str,
    redirect_to: Option<String>,
    ip: &str,
    user_agent: &str,
) -> Result<String, TokenError> {
    if !email_shape_ok(email) {
        return Err(TokenError::InvalidEmail);
    }
    let email = email.trim().to_ascii_lowercase();
    let window = Duration::seconds(limits.magic_link_window_secs as i64);
    let window_start = Utc::now() - window;

    let by_email: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM magic_link_auth_attempts WHERE email = $1 AND created_at > $2",
    )
    .bind(&email)
    .bind(window_start)
    .fetch_one(&mut *conn)
    .await?;
    let by_ip: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM magic_link_auth_attempts WHERE ip = $1 AND created_at > $2",
    )
    .bind(ip)
    .bind(window_start)
    .fetch_one(&mut *conn)
    .await?;

    if by_email >= limits.magic_link_per_email as i64 || by_ip >= limits.magic_link_per_ip as i64 {
        return Err(TokenError::RateLimited {
            retry_after_secs: limits.magic_link_window_secs,
        });
    }

    let token = generate_token();
    let expires_at = Utc::now() + Duration::minutes(ttl.login_ttl_minutes);
    sqlx::query(
        "INSERT INTO magic_link_tokens \
           (token, email, purpose, expires_at, ip, user_agent, redirect_to) \
         VALUES ($1, $2, $3, $4, $5, $6, $7)",
    )
    .bind(&token)
    .bind(&email)
    .bind(PURPOSE_LOGIN)
    .bind(expires_at)
    .bind(ip)
    .bind(user_agent)
    .bind(&redirect_to)
    .execute(&mut *conn)
    .await?;

    sqlx::query("INSERT INTO magic_link_auth_attempts (email, ip) VALUES ($1, $2)")
        .bind(&email)
        .bind(ip)
        .execute(conn)
        .await?;

    Ok(token)
}

/// Reminder tokens are admin-driven and skip the request rate limits.
pub async fn create_reminder_auth_token(
    conn: &mut PgConnection,
    ttl: &MagicLinkConfig,
    email: &str,
    doc_id: &str,
    redirect_to: Option<String>,
) -> Result<String, TokenError> {
    if !email_shape_ok(email) {
        return Err(TokenError::InvalidEmail);
    }
    let token = generate_token();
    let expires_at = Utc::now() + Duration::hours(ttl.reminder_ttl_hours);
    sqlx::query(
        "INSERT INTO magic_link_tokens \
           (token, email, purpose, doc_id, expires_at, redirect_to) \
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(&token)
    .bind(email.trim().to_ascii_lowercase())
    .bind(PURPOSE_REMINDER_AUTH)
    .bind(doc_id)
    .bind(expires_at)
    .bind(&redirect_to)
    .execute(conn)
    .await?;
    Ok(token)
}

/// Verify a token and consume it. The consumption is a single conditional
/// UPDATE; anything other than exactly one affected row means another request
/// spent the token first.
pub async fn verify_token(
    conn: &mut PgConnection,
    token: &str,
    ip: &str,
    user_agent: &str,
) -> Result<VerifiedToken, TokenError> {
    let row = sqlx::query_as::<_, MagicLinkToken>(
        "SELECT token, tenant_id, email, purpose, doc_id, expires_at, used_at, ip, user_agent, \
                redirect_to, created_at \
         FROM magic_link_tokens WHERE token = $1",
    )
    .bind(token)
    .fetch_optional(&mut *conn)
    .await?
    .ok_or(TokenError::Invalid)?;

    if row.expires_at <= Utc::now() {
        return Err(TokenError::Expired);
    }
    if row.used_at.is_some() {
        return Err(TokenError::Used);
    }

    let done = sqlx::query(
        "UPDATE magic_link_tokens \
         SET used_at = now(), ip = $2, user_agent = $3 \
         WHERE token = $1 AND used_at IS NULL",
    )
    .bind(token)
    .bind(ip)
    .bind(user_agent)
    .execute(conn)
    .await?;
    if done.rows_affected() != 1 {
        return Err(TokenError::Used);
    }

    Ok(VerifiedToken {
        email: row.email,
        purpose: row.purpose,
        doc_id: row.doc_id,
        redirect_to: row.redirect_to,
    })
}

/// Drop tokens expired for more than an hour. Returns the deleted count.
pub async fn cleanup_expired_tokens(conn: &mut PgConnection) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::hours(1);
    let done = sqlx::query("DELETE FROM magic_link_tokens WHERE expires_at < $1")
        .bind(cutoff)
        .execute(conn)
        .await?;
    Ok(done.rows_affected())
}

/// Periodic sweeper for expired magic-link tokens and stale refresh-token
/// vault rows, one tenant context at a time.
pub struct MagicLinkJanitor {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl MagicLinkJanitor {
    pub fn start(pool: PgPool, interval_secs: u64) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = interval(tokio::time::Duration::from_secs(interval_secs.max(60)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(err) = sweep_all_tenants(&pool).await {
                            tracing::warn!(error = %err, "Magic-link janitor sweep failed");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });
        Self { stop, handle }
    }

    pub async fn stop(self) {
        let _ = self.stop.send(true);
        if tokio::time::timeout(tokio::time::Duration::from_secs(5), self.handle)
            .await
            .is_err()
        {
            tracing::warn!("Magic-link janitor did not stop within 5s");
        }
    }
}

async fn sweep_all_tenants(pool: &PgPool) -> anyhow::Result<()> {
    for tenant_id in tenant::list_tenant_ids(pool).await? {
        let (tokens, sessions) = with_tenant_context(pool, tenant_id, |tx| {
            Box::pin(async move {
                let tokens = cleanup_expired_tokens(tx.conn()).await?;
                let sessions = oauth::cleanup_expired_sessions(tx.conn()).await?;
                Ok((tokens, sessions))
            })
        })
        .await?;
        if tokens > 0 || sessions > 0 {
            tracing::info!(
                %tenant_id,
                expired_tokens = tokens,
                expired_oauth_sessions = sessions,
                "Swept expired auth artifacts"
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_urlsafe_32_bytes() {
        let token = generate_token();
        assert_eq!(token.len(), 43);
        assert!(!token.contains('+'));
        assert!(!token.contains('/'));
        assert!(!token.contains('='));
    }

    #[test]
    fn tokens_are_unique() {
        assert_ne!(generate_token(), generate_token());
    }

    #[test]
    fn email_shape_checks() {
        assert!(email_shape_ok("a@x.example"));
        assert!(email_shape_ok("  padded@x.example  "));
        assert!(!email_shape_ok("no-at-sign"));
        assert!(!email_shape_ok("@x.example"));
        assert!(!email_shape_ok("a@nodot"));
        assert!(!email_shape_ok("a@.leading"));
        assert!(!email_shape_ok(""));
    }
}
