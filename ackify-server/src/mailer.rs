use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use std::sync::Arc;
use thiserror::Error;

use crate::config::MailConfig;

/// Delivery failures keep their SMTP classification: a permanent rejection
/// (5xx, unroutable address) is a bounce, anything else may succeed on a
/// later attempt. Reminder logs record the two outcomes differently.
#[derive(Debug, Error)]
pub enum MailError {
    #[error("permanent delivery failure: {0}")]
    Permanent(String),
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl MailError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, MailError::Permanent(_))
    }
}

/// Outbound mail boundary. Handlers and the reminder batch depend on this
/// trait so tests can record messages instead of speaking SMTP.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        text: &str,
        html: Option<String>,
    ) -> Result<(), MailError>;
    fn is_configured(&self) -> bool;
}

pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_config(config: &MailConfig) -> Result<Self> {
        let host = config
            .smtp_host
            .as_deref()
            .ok_or_else(|| anyhow!("ACKIFY_MAIL_HOST is not set"))?;
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(host)
            .context("Failed to configure SMTP relay")?
            .port(config.smtp_port);
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            builder = builder.credentials(Credentials::new(username.clone(), password.clone()));
        }
        let from = config
            .from
            .parse::<Mailbox>()
            .context("Failed to parse ACKIFY_MAIL_FROM")?;
        Ok(Self { transport: builder.build(), from })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        text: &str,
        html: Option<String>,
    ) -> Result<(), MailError> {
        // A recipient that cannot even be parsed will never deliver.
        let to = to
            .parse::<Mailbox>()
            .map_err(|err| MailError::Permanent(format!("invalid recipient: {err}")))?;
        let builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(subject);
        let message = match html {
            Some(html) => builder.multipart(MultiPart::alternative_plain_html(
                text.to_string(),
                html,
            )),
            None => builder.body(text.to_string()),
        }
        .map_err(|err| MailError::Permanent(format!("message build failed: {err}")))?;

        self.transport.send(message).await.map_err(|err| {
            if err.is_permanent() {
                MailError::Permanent(err.to_string())
            } else {
                MailError::Transient(err.to_string())
            }
        })?;
        Ok(())
    }

    fn is_configured(&self) -> bool {
        true
    }
}

/// Stands in when no SMTP host is configured: deliveries are logged and
/// dropped so auth flows keep their uniform responses.
pub struct DisabledMailer;

#[async_trait]
impl Mailer for DisabledMailer {
    async fn send(
        &self,
        to: &str,
        subject: &str,
        _text: &str,
        _html: Option<String>,
    ) -> Result<(), MailError> {
        tracing::warn!(%to, %subject, "Mail delivery skipped: SMTP is not configured");
        Ok(())
    }

    fn is_configured(&self) -> bool {
        false
    }
}

pub fn build_mailer(config: &MailConfig) -> Result<Arc<dyn Mailer>> {
    if config.is_configured() {
        Ok(Arc::new(SmtpMailer::from_config(config)?))
    } else {
        tracing::warn!("ACKIFY_MAIL_HOST not set; outbound mail is disabled");
        Ok(Arc::new(DisabledMailer))
    }
}

pub struct RenderedEmail {
    pub subject: String,
    pub text: String,
    pub html: String,
}

/// Sign-in email for a freshly issued magic link. Locales fall back to
/// English; `fr` is the only translated locale shipped today.
pub fn magic_link_email(locale: &str, link: &str, ttl_minutes: i64) -> RenderedEmail {
    if locale.starts_with("fr") {
        RenderedEmail {
            subject: "Votre lien de connexion Ackify".to_string(),
            text: format!(
                "Bonjour,\n\nCliquez sur le lien suivant pour vous connecter :\n{link}\n\n\
                 Ce lien expire dans {ttl_minutes} minutes et ne peut servir qu'une seule fois.\n"
            ),
            html: format!(
                "<p>Bonjour,</p><p><a href=\"{link}\">Connectez-vous à Ackify</a></p>\
                 <p>Ce lien expire dans {ttl_minutes} minutes et ne peut servir qu'une seule fois.</p>"
            ),
        }
    } else {
        RenderedEmail {
            subject: "Your Ackify sign-in link".to_string(),
            text: format!(
                "Hello,\n\nUse the link below to sign in:\n{link}\n\n\
                 The link expires in {ttl_minutes} minutes and can only be used once.\n"
            ),
            html: format!(
                "<p>Hello,</p><p><a href=\"{link}\">Sign in to Ackify</a></p>\
                 <p>The link expires in {ttl_minutes} minutes and can only be used once.</p>"
            ),
        }
    }
}

/// Reminder email asking an expected signer to acknowledge a document.
pub fn reminder_email(locale: &str, doc_title: &str, link: &str) -> RenderedEmail {
    if locale.starts_with("fr") {
        RenderedEmail {
            subject: format!("Rappel : merci de confirmer la lecture de « {doc_title} »"),
            text: format!(
                "Bonjour,\n\nVotre confirmation de lecture est attendue pour « {doc_title} ».\n\
                 Ouvrez le lien suivant pour signer :\n{link}\n"
            ),
            html: format!(
                "<p>Bonjour,</p><p>Votre confirmation de lecture est attendue pour \
                 « {doc_title} ».</p><p><a href=\"{link}\">Confirmer la lecture</a></p>"
            ),
        }
    } else {
        RenderedEmail {
            subject: format!("Reminder: please acknowledge \"{doc_title}\""),
            text: format!(
                "Hello,\n\nYour read acknowledgement is pending for \"{doc_title}\".\n\
                 Open the link below to sign:\n{link}\n"
            ),
            html: format!(
                "<p>Hello,</p><p>Your read acknowledgement is pending for \
                 \"{doc_title}\".</p><p><a href=\"{link}\">Acknowledge the document</a></p>"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locale_selection_with_english_fallback() {
        let fr = magic_link_email("fr-FR", "https://x/verify?token=t", 15);
        assert!(fr.subject.contains("connexion"));
        let en = magic_link_email("de-DE", "https://x/verify?token=t", 15);
        assert!(en.subject.contains("sign-in"));
        assert!(en.text.contains("https://x/verify?token=t"));
    }

    #[test]
    fn reminder_mentions_document_title() {
        let mail = reminder_email("en", "Security Policy", "https://x/verify?token=t");
        assert!(mail.subject.contains("Security Policy"));
        assert!(mail.html.contains("https://x/verify?token=t"));
    }
}
