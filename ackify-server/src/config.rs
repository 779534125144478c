use anyhow::{anyhow, Context, Result};
use std::collections::HashSet;
use std::env;
use std::fs;
use uuid::Uuid;

pub const DEFAULT_TENANT_ID: &str = "00000000-0000-0000-0000-000000000001";

#[derive(Debug, Clone)]
pub struct AckifyConfig {
    pub base_url: String,
    pub default_tenant_id: Uuid,
    pub admin_emails: HashSet<String>,
    pub only_admin_can_create: bool,
    pub cors_origins: Vec<String>,
    pub cookie_secret: String,
    pub oauth: OAuthEnvConfig,
    pub mail: MailConfig,
    pub rate_limits: RateLimitConfig,
    pub webhooks: WebhookWorkerConfig,
    pub magic_link: MagicLinkConfig,
}

#[derive(Debug, Clone)]
pub struct OAuthEnvConfig {
    pub provider: String,
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub auth_url: Option<String>,
    pub token_url: Option<String>,
    pub userinfo_url: Option<String>,
    pub scopes: Vec<String>,
    pub allowed_domain: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub from: String,
}

impl MailConfig {
    pub fn is_configured(&self) -> bool {
        self.smtp_host.is_some()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub global_per_minute: u32,
    pub auth_per_minute: u32,
    pub doc_create_per_minute: u32,
    pub magic_link_per_email: u32,
    pub magic_link_per_ip: u32,
    pub magic_link_window_secs: u64,
    pub proxy_ip_per_minute: u32,
    pub proxy_ip_doc_per_minute: u32,
    pub proxy_doc_per_minute: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct WebhookWorkerConfig {
    pub workers: usize,
    pub batch_size: i64,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub max_retries: i32,
    pub cleanup_interval_secs: u64,
    pub retention_days: i64,
    pub processing_visibility_secs: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct MagicLinkConfig {
    pub login_ttl_minutes: i64,
    pub reminder_ttl_hours: i64,
    pub janitor_interval_secs: u64,
}

impl AckifyConfig {
    /// True when session cookies must carry the `Secure` attribute.
    pub fn secure_cookies(&self) -> bool {
        self.base_url.starts_with("https://")
    }
}

pub fn load_config() -> Result<AckifyConfig> {
    let base_url = env::var("ACKIFY_BASE_URL")
        .context("ACKIFY_BASE_URL must be set")?
        .trim_end_matches('/')
        .to_string();

    let default_tenant_id = env::var("ACKIFY_TENANT_ID")
        .ok()
        .map(|value| Uuid::parse_str(value.trim()))
        .transpose()
        .context("Failed to parse ACKIFY_TENANT_ID")?
        .unwrap_or_else(|| Uuid::parse_str(DEFAULT_TENANT_ID).expect("default tenant uuid"));

    let admin_emails = env::var("ACKIFY_ADMIN_EMAILS")
        .ok()
        .map(|value| parse_email_set(&value))
        .unwrap_or_default();

    let only_admin_can_create = bool_from_env("ACKIFY_ONLY_ADMIN_CAN_CREATE").unwrap_or(false);

    let cors_origins = env::var("ACKIFY_CORS_ORIGINS")
        .ok()
        .map(|value| parse_list(&value))
        .unwrap_or_default();

    let cookie_secret = read_secret_env("ACKIFY_OAUTH_COOKIE_SECRET")?
        .ok_or_else(|| anyhow!("ACKIFY_OAUTH_COOKIE_SECRET must be set"))?;

    let oauth = OAuthEnvConfig {
        provider: env::var("ACKIFY_OAUTH_PROVIDER").unwrap_or_else(|_| "generic".to_string()),
        client_id: env::var("ACKIFY_OAUTH_CLIENT_ID").ok().and_then(|v| normalize_optional(&v)),
        client_secret: read_secret_env("ACKIFY_OAUTH_CLIENT_SECRET")?
            .and_then(|v| normalize_optional(&v)),
        auth_url: env::var("ACKIFY_OAUTH_AUTH_URL").ok().and_then(|v| normalize_optional(&v)),
        token_url: env::var("ACKIFY_OAUTH_TOKEN_URL").ok().and_then(|v| normalize_optional(&v)),
        userinfo_url: env::var("ACKIFY_OAUTH_USERINFO_URL")
            .ok()
            .and_then(|v| normalize_optional(&v)),
        scopes: env::var("ACKIFY_OAUTH_SCOPES")
            .ok()
            .map(|value| parse_list(&value))
            .unwrap_or_else(|| vec!["openid".into(), "email".into(), "profile".into()]),
        allowed_domain: env::var("ACKIFY_OAUTH_ALLOWED_DOMAIN")
            .ok()
            .and_then(|v| normalize_optional(&v))
            .map(|v| v.to_ascii_lowercase()),
    };

    let mail = MailConfig {
        smtp_host: env::var("ACKIFY_MAIL_HOST").ok().and_then(|v| normalize_optional(&v)),
        smtp_port: u16_from_env("ACKIFY_MAIL_PORT").unwrap_or(587),
        username: env::var("ACKIFY_MAIL_USERNAME").ok().and_then(|v| normalize_optional(&v)),
        password: read_secret_env("ACKIFY_MAIL_PASSWORD")?.and_then(|v| normalize_optional(&v)),
        from: env::var("ACKIFY_MAIL_FROM").unwrap_or_else(|_| "Ackify <no-reply@localhost>".to_string()),
    };

    let rate_limits = RateLimitConfig {
        global_per_minute: u32_from_env("ACKIFY_RATE_LIMIT_GLOBAL").unwrap_or(100),
        auth_per_minute: u32_from_env("ACKIFY_RATE_LIMIT_AUTH").unwrap_or(5),
        doc_create_per_minute: u32_from_env("ACKIFY_RATE_LIMIT_DOC_CREATE").unwrap_or(10),
        magic_link_per_email: u32_from_env("ACKIFY_MAGIC_LINK_RATE_PER_EMAIL").unwrap_or(3),
        magic_link_per_ip: u32_from_env("ACKIFY_MAGIC_LINK_RATE_PER_IP").unwrap_or(10),
        magic_link_window_secs: u64_from_env("ACKIFY_MAGIC_LINK_RATE_WINDOW_SECS").unwrap_or(3600),
        proxy_ip_per_minute: u32_from_env("ACKIFY_PROXY_RATE_PER_IP").unwrap_or(60),
        proxy_ip_doc_per_minute: u32_from_env("ACKIFY_PROXY_RATE_PER_IP_DOC").unwrap_or(20),
        proxy_doc_per_minute: u32_from_env("ACKIFY_PROXY_RATE_PER_DOC").unwrap_or(300),
    };

    let webhooks = WebhookWorkerConfig {
        workers: u32_from_env("ACKIFY_WEBHOOK_WORKERS").unwrap_or(5) as usize,
        batch_size: u32_from_env("ACKIFY_WEBHOOK_BATCH_SIZE").unwrap_or(10) as i64,
        poll_interval_secs: u64_from_env("ACKIFY_WEBHOOK_POLL_SECS").unwrap_or(5),
        request_timeout_secs: u64_from_env("ACKIFY_WEBHOOK_TIMEOUT_SECS").unwrap_or(10),
        max_retries: u32_from_env("ACKIFY_WEBHOOK_MAX_RETRIES").unwrap_or(5) as i32,
        cleanup_interval_secs: u64_from_env("ACKIFY_WEBHOOK_CLEANUP_SECS").unwrap_or(3600),
        retention_days: u32_from_env("ACKIFY_WEBHOOK_RETENTION_DAYS").unwrap_or(30) as i64,
        processing_visibility_secs: u32_from_env("ACKIFY_WEBHOOK_VISIBILITY_SECS").unwrap_or(600)
            as i64,
    };

    let magic_link = MagicLinkConfig {
        login_ttl_minutes: u32_from_env("ACKIFY_MAGIC_LINK_TTL_MINUTES").unwrap_or(15) as i64,
        reminder_ttl_hours: u32_from_env("ACKIFY_REMINDER_LINK_TTL_HOURS").unwrap_or(24) as i64,
        janitor_interval_secs: u64_from_env("ACKIFY_MAGIC_LINK_JANITOR_SECS").unwrap_or(3600),
    };

    Ok(AckifyConfig {
        base_url,
        default_tenant_id,
        admin_emails,
        only_admin_can_create,
        cors_origins,
        cookie_secret,
        oauth,
        mail,
        rate_limits,
        webhooks,
        magic_link,
    })
}

/// Read a secret either from `<KEY>_FILE` or directly from `<KEY>`.
pub fn read_secret_env(key: &str) -> Result<Option<String>> {
    let file_var = format!("{}_FILE", key);
    if let Ok(path) = env::var(&file_var) {
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} from {}", file_var, path))?;
        return Ok(Some(contents.trim().to_string()));
    }
    Ok(env::var(key).ok())
}

fn bool_from_env(key: &str) -> Option<bool> {
    env::var(key).ok().map(|value| {
        matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        )
    })
}

fn u32_from_env(key: &str) -> Option<u32> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn u64_from_env(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn u16_from_env(key: &str) -> Option<u16> {
    env::var(key).ok().and_then(|value| value.trim().parse().ok())
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';' || c == ' ')
        .filter_map(|item| {
            let entry = item.trim();
            if entry.is_empty() {
                None
            } else {
                Some(entry.to_string())
            }
        })
        .collect()
}

fn parse_email_set(value: &str) -> HashSet<String> {
    value
        .split(|c| c == ',' || c == ';' || c == ' ')
        .filter_map(|item| {
            let email = item.trim();
            if email.is_empty() {
                None
            } else {
                Some(email.to_ascii_lowercase())
            }
        })
        .collect()
}

fn normalize_optional(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bool_from_env_parses() {
        std::env::set_var("ACKIFY_TEST_BOOL_TRUE", "true");
        std::env::set_var("ACKIFY_TEST_BOOL_ONE", "1");
        std::env::set_var("ACKIFY_TEST_BOOL_FALSE", "no");
        assert_eq!(bool_from_env("ACKIFY_TEST_BOOL_TRUE"), Some(true));
        assert_eq!(bool_from_env("ACKIFY_TEST_BOOL_ONE"), Some(true));
        assert_eq!(bool_from_env("ACKIFY_TEST_BOOL_FALSE"), Some(false));
    }

    #[test]
    fn parse_email_set_normalises() {
        let emails = parse_email_set("Admin@Example.COM, ops@example.com");
        assert!(emails.contains("admin@example.com"));
        assert!(emails.contains("ops@example.com"));
        assert!(!emails.contains("Admin@Example.COM"));
    }

    #[test]
    fn parse_list_splits_on_separators() {
        let list = parse_list("https://a.example, https://b.example;https://c.example");
        assert_eq!(list.len(), 3);
    }
}
