//! Caller-scoped operations
//!
//! Writing to one's own account still needs the admin channel, but there is
//! no degraded fallback for it: a channel failure surfaces as 503.

use idp_core::{ManagedUserRecord, PermissionEvaluator, UserPatch};
use serde::Serialize;
use tracing::{debug, info};

use super::{Gateway, validate_email, validate_password};
use crate::idp::{LoginSession, bearer_token};
use crate::{Error, Result};

/// The caller's profile
#[derive(Debug, Clone, Serialize)]
pub struct Profile {
    /// Subject id
    pub subject: String,
    /// Username
    pub username: Option<String>,
    /// Email
    pub email: Option<String>,
    /// Given name
    pub first_name: Option<String>,
    /// Family name
    pub last_name: Option<String>,
    /// Realm roles plus roles of the serving client
    pub roles: Vec<String>,
    /// Whether the caller holds an administrative role
    pub is_admin: bool,
    /// Linked professor id
    pub professor_id: Option<String>,
    /// Linked professor display name
    pub professor_name: Option<String>,
}

impl Gateway {
    /// Userinfo, effective roles and the linked professor's name.
    /// The name lookup is best effort and falls back to `Professor (ID: <id>)`.
    pub async fn profile(&self, token: &str) -> Result<Profile> {
        let token = bearer_token(Some(token))?;
        let (claims, info) = self.idp.validator().validate_with_userinfo(token).await?;

        let professor_name = match claims.professor.as_deref() {
            Some(id) => Some(self.professor_name(id).await),
            None => None,
        };

        Ok(Profile {
            roles: claims
                .effective_roles(self.permissions.client_id())
                .into_iter()
                .map(str::to_string)
                .collect(),
            is_admin: self.permissions.is_admin(&claims),
            username: claims.username.clone().or(info.preferred_username),
            email: claims.email.clone().or(info.email),
            first_name: info.given_name,
            last_name: info.family_name,
            professor_id: claims.professor.clone(),
            professor_name,
            subject: claims.subject,
        })
    }

    /// Password login with this gateway's client credentials. `totp` is the
    /// one-time code for accounts with a second factor.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidInput`] for a blank username or password and
    /// [`Error::Validation`] when the IdP rejects the credentials.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        totp: Option<&str>,
    ) -> Result<LoginSession> {
        let username = username.trim();
        if username.is_empty() || password.is_empty() {
            return Err(Error::InvalidInput(
                "username and password are required".to_string(),
            ));
        }
        let totp = totp.map(str::trim).filter(|code| !code.is_empty());

        let session = self.idp.validator().login(username, password, totp).await?;
        info!(username = %username, "Login succeeded");
        Ok(session)
    }

    /// Whether the caller holds every role in `required`, across realm roles
    /// and the roles of every client
    pub async fn has_all_roles(&self, token: &str, required: &[&str]) -> Result<bool> {
        let claims = self.validate_caller(token).await?;
        Ok(PermissionEvaluator::has_all_roles(&claims, required))
    }

    async fn professor_name(&self, id: &str) -> String {
        match self.idp.admin().get_user(id).await {
            Ok(professor) => professor.display_name(),
            Err(e) => {
                debug!(professor_id = %id, error = %e, "Professor lookup failed");
                format!("Professor (ID: {id})")
            }
        }
    }

    /// Apply `patch` to the caller's own account. Email changes go through
    /// [`Gateway::change_email`].
    pub async fn update_own_profile(&self, token: &str, patch: UserPatch) -> Result<ManagedUserRecord> {
        let claims = self.validate_caller(token).await?;
        let admin = self.idp.admin();

        let mut record = admin.get_user(&claims.subject).await?;
        let report = record.apply_patch(&patch);
        if !report.ignored.is_empty() {
            debug!(ignored = ?report.ignored, "Ignored attribute changes");
        }
        admin.update_user(&record).await?;

        info!(subject = %claims.subject, "Profile updated");
        Ok(record)
    }

    /// Change the caller's email (and username when it mirrored the email)
    pub async fn change_email(&self, token: &str, email: &str) -> Result<ManagedUserRecord> {
        let email = email.trim();
        validate_email(email)?;
        let claims = self.validate_caller(token).await?;
        let admin = self.idp.admin();

        let mut record = admin.get_user(&claims.subject).await?;
        if record.email.eq_ignore_ascii_case(email) {
            return Ok(record);
        }
        record.apply_email(email);
        admin.update_user(&record).await?;

        info!(subject = %claims.subject, "Email changed");
        Ok(record)
    }

    /// Set a new password for the caller
    pub async fn change_password(&self, token: &str, password: &str) -> Result<()> {
        validate_password(password)?;
        let claims = self.validate_caller(token).await?;

        self.idp
            .admin()
            .reset_password(&claims.subject, password, false)
            .await?;

        info!(subject = %claims.subject, "Password changed");
        Ok(())
    }
}
