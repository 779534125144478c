use axum::extract::{FromRef, FromRequestParts};
use axum::http::request::Parts;
use common_http_errors::ApiError;
use std::collections::HashSet;

use crate::app::AppState;
use crate::sessions::{CurrentUser, User};

/// Case-insensitive admin roster plus the document-creation policy switch.
#[derive(Debug, Clone)]
pub struct Authorizer {
    admin_emails: HashSet<String>,
    only_admin_can_create: bool,
}

impl Authorizer {
    pub fn new(admin_emails: HashSet<String>, only_admin_can_create: bool) -> Self {
        Self { admin_emails, only_admin_can_create }
    }

    pub fn is_admin(&self, email: &str) -> bool {
        self.admin_emails.contains(&email.trim().to_ascii_lowercase())
    }

    /// Anyone may create documents unless the admin-only policy is switched
    /// on, either in config or via the tenant settings override.
    pub fn can_create_document(&self, email: &str, settings_override: Option<bool>) -> bool {
        let only_admin = settings_override.unwrap_or(self.only_admin_can_create);
        !only_admin || self.is_admin(email)
    }
}

/// Extractor for admin routes: a valid session whose email is on the admin
/// roster, otherwise 403.
pub struct AdminUser(pub User);

#[async_trait::async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
    AppState: FromRef<S>,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(user) = CurrentUser::from_request_parts(parts, state).await?;
        let app = AppState::from_ref(state);
        if !app.authorizer.is_admin(&user.email) {
            return Err(ApiError::forbidden("admin_required", "Administrator access required"));
        }
        Ok(AdminUser(user))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authorizer(only_admin: bool) -> Authorizer {
        let mut emails = HashSet::new();
        emails.insert("admin@example.com".to_string());
        Authorizer::new(emails, only_admin)
    }

    #[test]
    fn admin_check_is_case_insensitive() {
        let authz = authorizer(false);
        assert!(authz.is_admin("Admin@Example.COM"));
        assert!(authz.is_admin(" admin@example.com "));
        assert!(!authz.is_admin("user@example.com"));
    }

    #[test]
    fn create_document_policy() {
        let open = authorizer(false);
        assert!(open.can_create_document("user@example.com", None));
        let locked = authorizer(true);
        assert!(!locked.can_create_document("user@example.com", None));
        assert!(locked.can_create_document("admin@example.com", None));
        // Settings override wins over the config default.
        assert!(!open.can_create_document("user@example.com", Some(true)));
        assert!(locked.can_create_document("user@example.com", Some(false)));
    }
}
