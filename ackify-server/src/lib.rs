pub mod app;
pub mod auth_handlers;
pub mod authz;
pub mod chain;
pub mod config;
pub mod document_handlers;
pub mod documents;
pub mod magic_link;
pub mod mailer;
pub mod middleware;
pub mod oauth;
pub mod proxy_handlers;
pub mod rate_limiter;
pub mod reminder_handlers;
pub mod reminders;
pub mod sessions;
pub mod settings;
pub mod signature_handlers;
pub mod signatures;
pub mod signing;
pub mod tenant;
pub mod webhook_handlers;
pub mod webhook_worker;
pub mod webhooks;

pub use app::AppState;
