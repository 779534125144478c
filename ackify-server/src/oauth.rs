use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::{Duration, Utc};
use common_crypto::SealingKey;
use reqwest::Client;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use sqlx::PgConnection;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::config::OAuthEnvConfig;
use crate::sessions::User;
use crate::settings;

const REFRESH_SESSION_DAYS: i64 = 30;
const REFRESH_SESSION_GRACE_DAYS: i64 = 7;

#[derive(Debug, Error)]
pub enum OAuthError {
    #[error("oauth provider is not configured")]
    NotConfigured,
    #[error("state token mismatch")]
    StateMismatch,
    #[error("email domain is not allowed")]
    DomainNotAllowed,
    #[error("provider returned no usable identity")]
    InvalidIdentity,
    #[error("token exchange failed: {0}")]
    Exchange(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("crypto error: {0}")]
    Crypto(#[from] common_crypto::CryptoError),
}

impl From<OAuthError> for common_http_errors::ApiError {
    fn from(err: OAuthError) -> Self {
        use common_http_errors::ApiError;
        match err {
            OAuthError::NotConfigured => {
                ApiError::internal("OAuth provider is not configured")
            }
            OAuthError::StateMismatch => {
                ApiError::unauthorized("state_mismatch", "OAuth state verification failed")
            }
            OAuthError::DomainNotAllowed => {
                ApiError::forbidden("domain_not_allowed", "This email domain is not allowed")
            }
            OAuthError::InvalidIdentity => {
                ApiError::unauthorized("invalid_identity", "The provider returned no usable identity")
            }
            OAuthError::Exchange(detail) => {
                ApiError::unauthorized("oauth_exchange_failed", detail)
            }
            OAuthError::Http(err) => ApiError::upstream(err.to_string()),
            OAuthError::Database(err) => ApiError::internal(err),
            OAuthError::Crypto(err) => ApiError::internal(err),
        }
    }
}

/// Effective OAuth client configuration after overlaying tenant settings on
/// the environment defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: String,
    pub token_url: String,
    pub userinfo_url: String,
    pub scopes: Vec<String>,
    pub allowed_domain: Option<String>,
}

impl OAuthClientConfig {
    /// Cache validity is keyed on exactly these four fields.
    fn matches(&self, other: &OAuthClientConfig) -> bool {
        self.client_id == other.client_id
            && self.client_secret == other.client_secret
            && self.auth_url == other.auth_url
            && self.token_url == other.token_url
    }
}

struct ProviderEndpoints {
    auth_url: &'static str,
    token_url: &'static str,
    userinfo_url: &'static str,
}

fn provider_preset(provider: &str) -> Option<ProviderEndpoints> {
    match provider {
        "google" => Some(ProviderEndpoints {
            auth_url: "https://accounts.google.com/o/oauth2/v2/auth",
            token_url: "https://oauth2.googleapis.com/token",
            userinfo_url: "https://openidconnect.googleapis.com/v1/userinfo",
        }),
        "github" => Some(ProviderEndpoints {
            auth_url: "https://github.com/login/oauth/authorize",
            token_url: "https://github.com/login/oauth/access_token",
            userinfo_url: "https://api.github.com/user",
        }),
        "gitlab" => Some(ProviderEndpoints {
            auth_url: "https://gitlab.com/oauth/authorize",
            token_url: "https://gitlab.com/oauth/token",
            userinfo_url: "https://gitlab.com/oauth/userinfo",
        }),
        _ => None,
    }
}

/// Assembles the OAuth client configuration on each call so settings edits
/// take effect without a restart. The assembled config is cached; the cache
/// is replaced only when one of the four key fields changed.
pub struct DynamicProvider {
    env: OAuthEnvConfig,
    cache: RwLock<Option<OAuthClientConfig>>,
}

impl DynamicProvider {
    pub fn new(env: OAuthEnvConfig) -> Self {
        Self { env, cache: RwLock::new(None) }
    }

    pub async fn client_config(
        &self,
        conn: &mut PgConnection,
    ) -> Result<OAuthClientConfig, OAuthError> {
        let overrides = settings::oauth_overrides(conn).await?;
        let assembled = self.assemble(overrides)?;

        {
            let guard = self.cache.read().await;
            if let Some(cached) = guard.as_ref() {
                if cached.matches(&assembled) {
                    return Ok(cached.clone());
                }
            }
        }

        let mut guard = self.cache.write().await;
        // Re-check under the write lock; another task may have refreshed.
        let stale = !guard.as_ref().map_or(false, |cached| cached.matches(&assembled));
        if stale {
            tracing::info!("OAuth client configuration loaded");
            *guard = Some(assembled.clone());
        }
        Ok(assembled)
    }

    fn assemble(
        &self,
        overrides: settings::OAuthOverrides,
    ) -> Result<OAuthClientConfig, OAuthError> {
        let preset = provider_preset(&self.env.provider);
        let client_id = overrides
            .client_id
            .or_else(|| self.env.client_id.clone())
            .ok_or(OAuthError::NotConfigured)?;
        let client_secret = overrides
            .client_secret
            .or_else(|| self.env.client_secret.clone())
            .ok_or(OAuthError::NotConfigured)?;
        let auth_url = overrides
            .auth_url
            .or_else(|| self.env.auth_url.clone())
            .or_else(|| preset.as_ref().map(|p| p.auth_url.to_string()))
            .ok_or(OAuthError::NotConfigured)?;
        let token_url = overrides
            .token_url
            .or_else(|| self.env.token_url.clone())
            .or_else(|| preset.as_ref().map(|p| p.token_url.to_string()))
            .ok_or(OAuthError::NotConfigured)?;
        let userinfo_url = overrides
            .userinfo_url
            .or_else(|| self.env.userinfo_url.clone())
            .or_else(|| preset.as_ref().map(|p| p.userinfo_url.to_string()))
            .ok_or(OAuthError::NotConfigured)?;
        let allowed_domain = overrides
            .allowed_domain
            .or_else(|| self.env.allowed_domain.clone())
            .map(|domain| domain.trim_start_matches('@').to_ascii_lowercase());

        Ok(OAuthClientConfig {
            client_id,
            client_secret,
            auth_url,
            token_url,
            userinfo_url,
            scopes: self.env.scopes.clone(),
            allowed_domain,
        })
    }
}

/// PKCE code verifier: 32 random bytes, URL-safe base64 (43 chars, within
/// the RFC 7636 length bounds).
pub fn generate_code_verifier() -> String {
    URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<32>())
}

/// S256 code challenge for a verifier.
pub fn code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// Opaque state: a 20-byte random token, optionally joined with the
/// base64url-encoded `next` URL by a colon.
pub fn generate_state(next: Option<&str>) -> String {
    let token = URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<20>());
    match next {
        Some(next) if !next.is_empty() => {
            format!("{token}:{}", URL_SAFE_NO_PAD.encode(next.as_bytes()))
        }
        _ => token,
    }
}

/// Split a state value into its token and the decoded `next` URL.
pub fn split_state(state: &str) -> (&str, Option<String>) {
    match state.split_once(':') {
        Some((token, encoded)) => {
            let next = URL_SAFE_NO_PAD
                .decode(encoded.as_bytes())
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            (token, next)
        }
        None => (state, None),
    }
}

/// Constant-time comparison of the stored and returned state values.
pub fn state_matches(stored: &str, returned: &str) -> bool {
    stored.as_bytes().ct_eq(returned.as_bytes()).into()
}

/// Build the provider authorize URL. Silent probes send `prompt=none`
/// instead of `prompt=select_account`.
pub fn authorize_url(
    config: &OAuthClientConfig,
    redirect_uri: &str,
    state: &str,
    challenge: &str,
    silent: bool,
) -> String {
    let prompt = if silent { "none" } else { "select_account" };
    format!(
        "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&code_challenge={}&code_challenge_method=S256&prompt={}",
        config.auth_url,
        urlencoding::encode(&config.client_id),
        urlencoding::encode(redirect_uri),
        urlencoding::encode(&config.scopes.join(" ")),
        urlencoding::encode(state),
        urlencoding::encode(challenge),
        prompt,
    )
}

#[derive(Debug, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawUserInfo {
    #[serde(default)]
    sub: Option<String>,
    #[serde(default)]
    id: Option<serde_json::Value>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
}

/// Exchange the authorization code, proving possession of the PKCE verifier.
pub async fn exchange_code(
    http: &Client,
    config: &OAuthClientConfig,
    code: &str,
    verifier: &str,
    redirect_uri: &str,
) -> Result<TokenResponse, OAuthError> {
    let response = http
        .post(&config.token_url)
        .header(reqwest::header::ACCEPT, "application/json")
        .form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", redirect_uri),
            ("client_id", &config.client_id),
            ("client_secret", &config.client_secret),
            ("code_verifier", verifier),
        ])
        .send()
        .await?;
    if !response.status().is_success() {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        return Err(OAuthError::Exchange(format!("status {status}: {body}")));
    }
    Ok(response.json::<TokenResponse>().await?)
}

/// Resolve the authenticated identity from the provider's userinfo endpoint.
pub async fn fetch_userinfo(
    http: &Client,
    config: &OAuthClientConfig,
    access_token: &str,
) -> Result<User, OAuthError> {
    let raw: RawUserInfo = http
        .get(&config.userinfo_url)
        .bearer_auth(access_token)
        .header(reqwest::header::USER_AGENT, "Ackify/1.0")
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    let sub = raw
        .sub
        .or_else(|| raw.id.map(|id| id.to_string().trim_matches('"').to_string()))
        .unwrap_or_default();
    let email = raw.email.unwrap_or_default();
    let user = User::new(sub, email, raw.name);
    if !user.is_valid() {
        return Err(OAuthError::InvalidIdentity);
    }
    Ok(user)
}

/// True when no domain restriction applies or the email ends with the
/// configured domain, case-insensitively.
pub fn domain_allowed(email: &str, allowed_domain: Option<&str>) -> bool {
    match allowed_domain {
        None => true,
        Some(domain) => {
            let domain = domain.trim_start_matches('@').to_ascii_lowercase();
            email.trim().to_ascii_lowercase().ends_with(&format!("@{domain}"))
        }
    }
}

/// Opaque key linking the session cookie to its vault row.
pub fn generate_session_key() -> String {
    URL_SAFE_NO_PAD.encode(common_crypto::random_bytes::<32>())
}

/// Persist a provider refresh token, sealed with AES-256-GCM.
pub async fn store_refresh_token(
    conn: &mut PgConnection,
    sealing_key: &SealingKey,
    session_key: &str,
    user: &User,
    refresh_token: &str,
    ip: &str,
    user_agent: &str,
) -> Result<(), OAuthError> {
    let ciphertext = sealing_key.seal_to_base64(refresh_token.as_bytes())?;
    let expires_at = Utc::now() + Duration::days(REFRESH_SESSION_DAYS);
    sqlx::query(
        "INSERT INTO oauth_sessions \
           (session_key, user_sub, user_email, refresh_token_ciphertext, ip, user_agent, expires_at) \
         VALUES ($1, $2, $3, $4, $5, $6, $7) \
         ON CONFLICT (tenant_id, session_key) DO UPDATE SET \
           refresh_token_ciphertext = EXCLUDED.refresh_token_ciphertext, \
           expires_at = EXCLUDED.expires_at",
    )
    .bind(session_key)
    .bind(&user.sub)
    .bind(user.normalized_email())
    .bind(ciphertext)
    .bind(ip)
    .bind(user_agent)
    .bind(expires_at)
    .execute(conn)
    .await?;
    Ok(())
}

pub async fn delete_session(conn: &mut PgConnection, session_key: &str) -> Result<(), sqlx::Error> {
    sqlx::query("DELETE FROM oauth_sessions WHERE session_key = $1")
        .bind(session_key)
        .execute(conn)
        .await
        .map(|_| ())
}

/// Vault rows linger for a grace period after expiry, then are swept by the
/// janitor.
pub async fn cleanup_expired_sessions(conn: &mut PgConnection) -> Result<u64, sqlx::Error> {
    let cutoff = Utc::now() - Duration::days(REFRESH_SESSION_GRACE_DAYS);
    let done = sqlx::query("DELETE FROM oauth_sessions WHERE expires_at < $1")
        .bind(cutoff)
        .execute(conn)
        .await?;
    Ok(done.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn code_challenge_matches_rfc_vector() {
        // RFC 7636 appendix B.
        assert_eq!(
            code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk"),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[test]
    fn verifier_length_is_within_rfc_bounds() {
        let verifier = generate_code_verifier();
        assert!((43..=128).contains(&verifier.len()));
    }

    #[test]
    fn state_round_trips_next_url() {
        let state = generate_state(Some("/docs/abc?x=1"));
        let (token, next) = split_state(&state);
        assert!(!token.is_empty());
        assert_eq!(next.as_deref(), Some("/docs/abc?x=1"));

        let bare = generate_state(None);
        let (token, next) = split_state(&bare);
        assert_eq!(token, bare);
        assert!(next.is_none());
    }

    #[test]
    fn state_comparison_detects_mismatch() {
        let state = generate_state(None);
        assert!(state_matches(&state, &state));
        assert!(!state_matches(&state, "forged"));
    }

    #[test]
    fn domain_allowlist_is_case_insensitive() {
        assert!(domain_allowed("user@Example.COM", Some("example.com")));
        assert!(domain_allowed("user@example.com", Some("@example.com")));
        assert!(!domain_allowed("user@other.org", Some("example.com")));
        assert!(!domain_allowed("userexample.com", Some("example.com")));
        assert!(domain_allowed("anyone@anywhere", None));
    }

    #[test]
    fn authorize_url_carries_pkce_parameters() {
        let config = OAuthClientConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            auth_url: "https://idp.example/authorize".into(),
            token_url: "https://idp.example/token".into(),
            userinfo_url: "https://idp.example/userinfo".into(),
            scopes: vec!["openid".into(), "email".into()],
            allowed_domain: None,
        };
        let url = authorize_url(&config, "https://app.example/cb", "st", "ch", false);
        assert!(url.contains("response_type=code"));
        assert!(url.contains("code_challenge=ch"));
        assert!(url.contains("code_challenge_method=S256"));
        assert!(url.contains("prompt=select_account"));
        assert!(url.contains("scope=openid%20email"));

        let silent = authorize_url(&config, "https://app.example/cb", "st", "ch", true);
        assert!(silent.contains("prompt=none"));
    }

    #[test]
    fn cache_key_ignores_non_critical_fields() {
        let base = OAuthClientConfig {
            client_id: "cid".into(),
            client_secret: "secret".into(),
            auth_url: "a".into(),
            token_url: "t".into(),
            userinfo_url: "u".into(),
            scopes: vec![],
            allowed_domain: None,
        };
        let mut same = base.clone();
        same.userinfo_url = "changed".into();
        assert!(base.matches(&same));
        let mut different = base.clone();
        different.client_secret = "rotated".into();
        assert!(!base.matches(&different));
    }
}
