use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{
    header::{LOCATION, SET_COOKIE},
    HeaderMap, StatusCode,
};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use common_http_errors::{ApiError, ApiResult};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;

use crate::app::AppState;
use crate::authz::AdminUser;
use crate::magic_link;
use crate::mailer;
use crate::middleware::ClientIp;
use crate::oauth;
use crate::sessions::{CurrentUser, SessionData, User};
use crate::settings;
use crate::tenant::{TenantId, TenantTx};

#[derive(Debug, Deserialize)]
pub struct StartOAuthRequest {
    #[serde(default)]
    pub next: Option<String>,
    #[serde(default)]
    pub silent: bool,
}

#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MagicLinkRequest {
    pub email: String,
    #[serde(default)]
    pub redirect_to: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

fn callback_uri(base_url: &str) -> String {
    format!("{base_url}/api/v1/auth/callback")
}

fn redirect_with_session(
    state: &AppState,
    session: &SessionData,
    location: &str,
) -> ApiResult<Response> {
    let cookie = state.sessions.set_cookie(session)?;
    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(LOCATION, location)
        .header(SET_COOKIE, cookie)
        .body(Body::empty())
        .map_err(ApiError::internal)
}

/// Pick the mail locale from the Accept-Language header, first tag wins.
fn request_locale(headers: &HeaderMap) -> String {
    headers
        .get("Accept-Language")
        .and_then(|value| value.to_str().ok())
        .and_then(|raw| raw.split(',').next())
        .map(|tag| tag.trim().to_ascii_lowercase())
        .unwrap_or_else(|| "en".to_string())
}

/// `POST /auth/start`: open the OIDC handshake. PKCE verifier and state are
/// parked in the sealed session cookie until the callback.
pub async fn start_oauth(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    headers: HeaderMap,
    Json(request): Json<StartOAuthRequest>,
) -> ApiResult<Response> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let client = state.provider.client_config(tx.conn()).await?;
    tx.commit().await.map_err(ApiError::internal)?;

    let verifier = oauth::generate_code_verifier();
    let challenge = oauth::code_challenge(&verifier);
    let oauth_state = oauth::generate_state(request.next.as_deref());
    let redirect_url = oauth::authorize_url(
        &client,
        &callback_uri(&state.config.base_url),
        &oauth_state,
        &challenge,
        request.silent,
    );

    let mut session = state.sessions.read(&headers);
    session.oauth_state = Some(oauth_state);
    session.pkce_verifier = Some(verifier);
    let cookie = state.sessions.set_cookie(&session)?;

    let mut response = Json(json!({ "redirectUrl": redirect_url })).into_response();
    response
        .headers_mut()
        .insert(SET_COOKIE, cookie.parse().map_err(ApiError::internal)?);
    Ok(response)
}

/// `GET /auth/callback`: finish the handshake. The stored state is compared
/// in constant time and deleted regardless of outcome.
pub async fn oauth_callback(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
    Query(query): Query<CallbackQuery>,
) -> ApiResult<Response> {
    if let Some(error) = query.error {
        return Err(ApiError::unauthorized("oauth_error", format!("Provider error: {error}")));
    }
    let code = query
        .code
        .ok_or_else(|| ApiError::validation("missing_code", "Missing authorization code"))?;
    let returned_state = query
        .state
        .ok_or_else(|| ApiError::validation("missing_state", "Missing state parameter"))?;

    let mut session = state.sessions.read(&headers);
    let stored_state = session
        .oauth_state
        .take()
        .ok_or_else(|| ApiError::unauthorized("state_mismatch", "No login in progress"))?;
    let verifier = session
        .pkce_verifier
        .take()
        .ok_or_else(|| ApiError::unauthorized("state_mismatch", "No login in progress"))?;
    if !oauth::state_matches(&stored_state, &returned_state) {
        return Err(oauth::OAuthError::StateMismatch.into());
    }
    let (_, next) = oauth::split_state(&stored_state);

    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let client = state.provider.client_config(tx.conn()).await?;
    let tokens = oauth::exchange_code(
        &state.http_client,
        &client,
        &code,
        &verifier,
        &callback_uri(&state.config.base_url),
    )
    .await?;
    let user = oauth::fetch_userinfo(&state.http_client, &client, &tokens.access_token).await?;
    if !oauth::domain_allowed(&user.email, client.allowed_domain.as_deref()) {
        return Err(oauth::OAuthError::DomainNotAllowed.into());
    }

    if let Some(refresh_token) = tokens.refresh_token.as_deref() {
        let session_key = oauth::generate_session_key();
        let user_agent = headers
            .get("User-Agent")
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();
        oauth::store_refresh_token(
            tx.conn(),
            &state.sealing_key,
            &session_key,
            &user,
            refresh_token,
            &ip,
            user_agent,
        )
        .await?;
        session.session_key = Some(session_key);
    }
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(user_sub = %user.sub, "OAuth login completed");
    session.user = Some(user);
    let location = next.unwrap_or_else(|| state.config.base_url.clone());
    redirect_with_session(&state, &session, &location)
}

/// `POST /auth/magic-link/request`: always answers 200 on success so the
/// response never reveals whether an address is known. Mail is sent after
/// the transaction commits.
pub async fn request_magic_link(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
    Json(request): Json<MagicLinkRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    let user_agent = headers
        .get("User-Agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let token = magic_link::request_login_token(
        tx.conn(),
        &state.config.rate_limits,
        &state.config.magic_link,
        &request.email,
        request.redirect_to.clone(),
        &ip,
        &user_agent,
    )
    .await?;
    tx.commit().await.map_err(ApiError::internal)?;

    let link = format!(
        "{}/api/v1/auth/magic-link/verify?token={}",
        state.config.base_url,
        urlencoding::encode(&token)
    );
    let rendered = mailer::magic_link_email(
        &request_locale(&headers),
        &link,
        state.config.magic_link.login_ttl_minutes,
    );
    if let Err(err) = state
        .mailer
        .send(
            request.email.trim(),
            &rendered.subject,
            &rendered.text,
            Some(rendered.html),
        )
        .await
    {
        tracing::warn!(error = %err, "Failed to send magic-link mail");
    }

    Ok(Json(json!({
        "message": "If the address can receive mail, a sign-in link is on its way"
    })))
}

/// `GET /auth/magic-link/verify`: consume the token (at most once) and open
/// an authenticated session.
pub async fn verify_magic_link(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Response> {
    let user_agent = headers
        .get("User-Agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let verified = magic_link::verify_token(tx.conn(), &query.token, &ip, &user_agent).await?;
    if verified.purpose != magic_link::PURPOSE_LOGIN {
        return Err(magic_link::TokenError::Invalid.into());
    }
    tx.commit().await.map_err(ApiError::internal)?;

    // Magic-link identities use the normalized email as the stable subject.
    let mut session = state.sessions.read(&headers);
    session.user = Some(User::new(verified.email.clone(), verified.email, None));
    session.oauth_state = None;
    session.pkce_verifier = None;

    let location = verified
        .redirect_to
        .unwrap_or_else(|| state.config.base_url.clone());
    redirect_with_session(&state, &session, &location)
}

/// `GET /auth/reminder-link/verify`: like magic-link verify, but only for
/// `reminder_auth` tokens; lands on the document the reminder was about.
pub async fn verify_reminder_link(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    Extension(ClientIp(ip)): Extension<ClientIp>,
    headers: HeaderMap,
    Query(query): Query<TokenQuery>,
) -> ApiResult<Response> {
    let user_agent = headers
        .get("User-Agent")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let verified = magic_link::verify_token(tx.conn(), &query.token, &ip, &user_agent).await?;
    if verified.purpose != magic_link::PURPOSE_REMINDER_AUTH {
        return Err(magic_link::TokenError::Invalid.into());
    }
    tx.commit().await.map_err(ApiError::internal)?;

    let mut session = state.sessions.read(&headers);
    session.user = Some(User::new(verified.email.clone(), verified.email, None));

    let location = verified.redirect_to.unwrap_or_else(|| match &verified.doc_id {
        Some(doc_id) => format!("{}/?doc={}", state.config.base_url, urlencoding::encode(doc_id)),
        None => state.config.base_url.clone(),
    });
    redirect_with_session(&state, &session, &location)
}

/// `GET /auth/logout`: drop the refresh-token vault row and clear the cookie.
pub async fn logout(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    headers: HeaderMap,
) -> ApiResult<Response> {
    let session = state.sessions.read(&headers);
    if let Some(session_key) = session.session_key.as_deref() {
        let mut tx = TenantTx::begin(&state.db, tenant_id)
            .await
            .map_err(ApiError::internal)?;
        oauth::delete_session(tx.conn(), session_key)
            .await
            .map_err(ApiError::internal)?;
        tx.commit().await.map_err(ApiError::internal)?;
    }

    Response::builder()
        .status(StatusCode::SEE_OTHER)
        .header(LOCATION, state.config.base_url.as_str())
        .header(SET_COOKIE, state.sessions.clear_cookie())
        .body(Body::empty())
        .map_err(ApiError::internal)
}

/// `GET /users/me`
pub async fn me(
    State(state): State<AppState>,
    CurrentUser(user): CurrentUser,
) -> Json<serde_json::Value> {
    let is_admin = state.authorizer.is_admin(&user.email);
    Json(json!({
        "sub": user.sub,
        "email": user.normalized_email(),
        "name": user.name,
        "is_admin": is_admin,
    }))
}

fn masked_settings(map: BTreeMap<String, String>) -> BTreeMap<String, String> {
    map.into_iter()
        .map(|(key, value)| {
            if settings::is_secret_key(&key) && !value.is_empty() {
                (key, "********".to_string())
            } else {
                (key, value)
            }
        })
        .collect()
}

/// `GET /admin/settings`
pub async fn get_settings(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(_): AdminUser,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    let all = settings::get_all(tx.conn()).await.map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;
    Ok(Json(masked_settings(all)))
}

/// `PUT /admin/settings`: upsert the supplied keys. The next OAuth call
/// observes the change without a restart.
pub async fn put_settings(
    State(state): State<AppState>,
    TenantId(tenant_id): TenantId,
    AdminUser(admin): AdminUser,
    Json(updates): Json<BTreeMap<String, String>>,
) -> ApiResult<Json<BTreeMap<String, String>>> {
    for key in updates.keys() {
        if !settings::KNOWN_KEYS.contains(&key.as_str()) {
            return Err(ApiError::validation(
                "unknown_setting",
                format!("Unknown setting key: {key}"),
            ));
        }
    }

    let mut tx = TenantTx::begin(&state.db, tenant_id)
        .await
        .map_err(ApiError::internal)?;
    for (key, value) in &updates {
        settings::upsert(tx.conn(), key, value)
            .await
            .map_err(ApiError::internal)?;
    }
    let all = settings::get_all(tx.conn()).await.map_err(ApiError::internal)?;
    tx.commit().await.map_err(ApiError::internal)?;

    tracing::info!(admin = %admin.normalized_email(), count = updates.len(), "Settings updated");
    Ok(Json(masked_settings(all)))
}
