use axum::extract::{FromRef, FromRequestParts};
use axum::http::{header::COOKIE, request::Parts, HeaderMap};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use common_crypto::SealingKey;
use common_http_errors::ApiError;
use serde::{Deserialize, Serialize};

use crate::app::AppState;

pub const SESSION_COOKIE: &str = "ackify_session";
const SESSION_MAX_AGE_SECS: i64 = 30 * 24 * 3600;

/// Authenticated principal carried by the session cookie.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub sub: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl User {
    pub fn new(sub: impl Into<String>, email: impl Into<String>, name: Option<String>) -> Self {
        Self { sub: sub.into(), email: email.into(), name }
    }

    /// A user is valid iff sub and email are non-blank after trimming.
    pub fn is_valid(&self) -> bool {
        !self.sub.trim().is_empty() && !self.email.trim().is_empty()
    }

    /// Lower-cased, trimmed email; the canonical form stored and signed.
    pub fn normalized_email(&self) -> String {
        self.email.trim().to_ascii_lowercase()
    }
}

/// Everything the sealed session cookie can carry. The OAuth fields only
/// exist between `/auth/start` and `/auth/callback`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<User>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth_state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pkce_verifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

/// Seals session payloads into the `ackify_session` cookie and opens them
/// back. The sealing key is derived from `ACKIFY_OAUTH_COOKIE_SECRET`;
/// AES-256-GCM gives both confidentiality and tamper evidence.
#[derive(Clone)]
pub struct SessionCodec {
    key: SealingKey,
    secure: bool,
}

impl SessionCodec {
    pub fn new(key: SealingKey, secure: bool) -> Self {
        Self { key, secure }
    }

    pub fn encode(&self, data: &SessionData) -> Result<String, ApiError> {
        let plain = serde_json::to_vec(data).map_err(ApiError::internal)?;
        let sealed = self.key.seal(&plain).map_err(ApiError::internal)?;
        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    /// An unreadable or tampered cookie is treated as no session at all.
    pub fn decode(&self, value: &str) -> Option<SessionData> {
        let sealed = URL_SAFE_NO_PAD.decode(value.as_bytes()).ok()?;
        let plain = self.key.open(&sealed).ok()?;
        serde_json::from_slice(&plain).ok()
    }

    pub fn read(&self, headers: &HeaderMap) -> SessionData {
        read_cookie(headers, SESSION_COOKIE)
            .and_then(|value| self.decode(&value))
            .unwrap_or_default()
    }

    /// `Set-Cookie` value persisting `data` for the session lifetime.
    pub fn set_cookie(&self, data: &SessionData) -> Result<String, ApiError> {
        let value = self.encode(data)?;
        Ok(format!(
            "{SESSION_COOKIE}={value}; Path=/; Max-Age={SESSION_MAX_AGE_SECS}; HttpOnly; SameSite=Lax{}",
            if self.secure { "; Secure" } else { "" }
        ))
    }

    pub fn clear_cookie(&self) -> String {
        format!(
            "{SESSION_COOKIE}=; Path=/; Max-Age=0; HttpOnly; SameSite=Lax{}",
            if self.secure { "; Secure" } else { "" }
        )
    }
}

/// Pull one cookie value out of the `Cookie` header.
pub fn read_cookie(headers: &HeaderMap, name: &str) -> Option<String> {
    let raw = headers.get(COOKIE)?.to_str().ok()?;
    raw.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        if key == name {
            Some(value.to_string())
        } else {
            None
        }
    })
}

/// Extractor for routes behind `RequireAuth`: rejects with 401 unless the
/// session cookie carries a valid user.
pub struct CurrentUser(pub User);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let state = AppState::from_ref(state);
        let session = state.sessions.read(&parts.headers);
        match session.user {
            Some(user) if user.is_valid() => Ok(CurrentUser(user)),
            _ => Err(ApiError::unauthorized("unauthorized", "Authentication required")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> SessionCodec {
        SessionCodec::new(SealingKey::from_bytes([7u8; 32]).expect("key"), false)
    }

    #[test]
    fn session_round_trip() {
        let codec = codec();
        let data = SessionData {
            user: Some(User::new("u1", "A@X.example", Some("Alice".into()))),
            ..Default::default()
        };
        let encoded = codec.encode(&data).expect("encode");
        let decoded = codec.decode(&encoded).expect("decode");
        assert_eq!(decoded.user, data.user);
    }

    #[test]
    fn tampered_cookie_is_no_session() {
        let codec = codec();
        let mut encoded = codec.encode(&SessionData::default()).expect("encode");
        encoded.pop();
        encoded.push('A');
        assert!(codec.decode(&encoded).is_none());
    }

    #[test]
    fn normalized_email_lowercases() {
        let user = User::new("u1", "  Person@Example.COM ", None);
        assert_eq!(user.normalized_email(), "person@example.com");
    }

    #[test]
    fn blank_sub_is_invalid() {
        assert!(!User::new("  ", "a@x", None).is_valid());
        assert!(!User::new("u1", "", None).is_valid());
        assert!(User::new("u1", "a@x", None).is_valid());
    }

    #[test]
    fn cookie_attributes() {
        let secure = SessionCodec::new(SealingKey::from_bytes([1u8; 32]).unwrap(), true);
        let cookie = secure.set_cookie(&SessionData::default()).expect("cookie");
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        assert!(cookie.contains("Secure"));
        assert!(secure.clear_cookie().contains("Max-Age=0"));
    }

    #[test]
    fn read_cookie_finds_named_pair() {
        let mut headers = HeaderMap::new();
        headers.insert(COOKIE, "a=1; ackify_session=abc; b=2".parse().unwrap());
        assert_eq!(read_cookie(&headers, SESSION_COOKIE).as_deref(), Some("abc"));
        assert_eq!(read_cookie(&headers, "missing"), None);
    }
}
