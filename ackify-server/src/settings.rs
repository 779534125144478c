use sqlx::{PgConnection, Row};
use std::collections::BTreeMap;

pub const OAUTH_CLIENT_ID: &str = "oauth.client_id";
pub const OAUTH_CLIENT_SECRET: &str = "oauth.client_secret";
pub const OAUTH_AUTH_URL: &str = "oauth.auth_url";
pub const OAUTH_TOKEN_URL: &str = "oauth.token_url";
pub const OAUTH_USERINFO_URL: &str = "oauth.userinfo_url";
pub const OAUTH_ALLOWED_DOMAIN: &str = "oauth.allowed_domain";
pub const ONLY_ADMIN_CAN_CREATE: &str = "documents.only_admin_can_create";

/// Keys accepted by the admin settings API.
pub const KNOWN_KEYS: &[&str] = &[
    OAUTH_CLIENT_ID,
    OAUTH_CLIENT_SECRET,
    OAUTH_AUTH_URL,
    OAUTH_TOKEN_URL,
    OAUTH_USERINFO_URL,
    OAUTH_ALLOWED_DOMAIN,
    ONLY_ADMIN_CAN_CREATE,
];

/// Keys whose values are masked in API responses.
pub fn is_secret_key(key: &str) -> bool {
    key == OAUTH_CLIENT_SECRET
}

/// Tenant-level overrides for the OAuth client, read fresh on every auth
/// call so edits apply without restart.
#[derive(Debug, Default, Clone)]
pub struct OAuthOverrides {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    pub allowed_domain: Option<String>,
}

pub async fn oauth_overrides(conn: &mut PgConnection) -> Result<OAuthOverrides, sqlx::Error> {
    let rows = sqlx::query("SELECT key, value FROM settings WHERE key LIKE 'oauth.%'")
        .fetch_all(conn)
        .await?;
    let mut overrides = OAuthOverrides::default();
    for row in rows {
        let key: String = row.try_get("key")?;
        let value: String = row.try_get("value")?;
        let value = if value.trim().is_empty() { None } else { Some(value) };
        match key.as_str() {
            OAUTH_CLIENT_ID => overrides.client_id = value,
            OAUTH_CLIENT_SECRET => overrides.client_secret = value,
            OAUTH_AUTH_URL => overrides.auth_url = value,
            OAUTH_TOKEN_URL => overrides.token_url = value,
            OAUTH_USERINFO_URL => overrides.userinfo_url = value,
            OAUTH_ALLOWED_DOMAIN => overrides.allowed_domain = value,
            _ => {}
        }
    }
    Ok(overrides)
}

pub async fn get(conn: &mut PgConnection, key: &str) -> Result<Option<String>, sqlx::Error> {
    sqlx::query_scalar("SELECT value FROM settings WHERE key = $1")
        .bind(key)
        .fetch_optional(conn)
        .await
}

pub async fn get_all(conn: &mut PgConnection) -> Result<BTreeMap<String, String>, sqlx::Error> {
    let rows = sqlx::query("SELECT key, value FROM settings ORDER BY key")
        .fetch_all(conn)
        .await?;
    let mut map = BTreeMap::new();
    for row in rows {
        map.insert(row.try_get("key")?, row.try_get("value")?);
    }
    Ok(map)
}

pub async fn upsert(conn: &mut PgConnection, key: &str, value: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO settings (key, value) VALUES ($1, $2) \
         ON CONFLICT (tenant_id, key) DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
    )
    .bind(key)
    .bind(value)
    .execute(conn)
    .await
    .map(|_| ())
}

pub async fn delete(conn: &mut PgConnection, key: &str) -> Result<bool, sqlx::Error> {
    let done = sqlx::query("DELETE FROM settings WHERE key = $1")
        .bind(key)
        .execute(conn)
        .await?;
    Ok(done.rows_affected() > 0)
}
