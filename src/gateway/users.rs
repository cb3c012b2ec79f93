//! Managed-user operations

use chrono::Utc;
use idp_core::{ManagedUserRecord, NewUser, TokenClaims, UserPatch};
use tracing::debug;
use uuid::Uuid;

use super::{Gateway, Outcome, validate_email, validate_password};
use crate::{Error, Result};

/// `target` when given and non-empty, otherwise the caller
fn target_or_self(target: Option<&str>, subject: &str) -> String {
    target
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .unwrap_or(subject)
        .to_string()
}

/// One-off initial password; the IdP forces a change at first login
fn temporary_password() -> String {
    format!("Tmp-{}!", Uuid::new_v4().simple())
}

impl Gateway {
    /// Users owned by the caller
    pub async fn list_users(&self, token: &str) -> Result<Outcome<Vec<ManagedUserRecord>>> {
        let claims = self.validate_caller(token).await?;

        match self.idp.admin().list_users(&claims.subject).await {
            Ok(users) => Ok(Outcome::privileged(users)),
            Err(e) => {
                let store = self.degraded_store("list_users", e)?;
                Ok(Outcome::degraded(store.list(&claims.subject).await?))
            }
        }
    }

    /// Create a user owned by the caller, or by `created_by` when the caller
    /// is allowed to act for that identity. `professor_id` follows the same rule.
    pub async fn create_user(
        &self,
        token: &str,
        mut input: NewUser,
    ) -> Result<Outcome<ManagedUserRecord>> {
        let claims = self.validate_caller(token).await?;

        input.email = input.email.trim().to_string();
        validate_email(&input.email)?;
        if let Some(password) = input.password.as_deref().filter(|p| !p.is_empty()) {
            validate_password(password)?;
        }

        let owner = target_or_self(input.created_by.as_deref(), &claims.subject);
        if owner != claims.subject {
            self.authorize(&claims, Some(&owner), "create")?;
        }
        let professor = target_or_self(input.professor_id.as_deref(), &claims.subject);
        if professor != claims.subject {
            self.authorize(&claims, Some(&professor), "assign a professor to")?;
        }
        input.created_by = Some(owner.clone());
        input.professor_id = Some(professor.clone());

        let (password, temporary) = match input.password.clone().filter(|p| !p.is_empty()) {
            Some(password) => (password, false),
            None => (temporary_password(), true),
        };
        let record = input.to_record(String::new(), &owner, &professor, Utc::now().timestamp_millis());

        match self.idp.admin().create_user(&record, &password, temporary).await {
            Ok(created) => {
                debug!(id = %created.id, owner = %owner, "User created");
                Ok(Outcome::privileged(created))
            }
            Err(e) => {
                let store = self.degraded_store("create_user", e)?;
                Ok(Outcome::degraded(store.create(&input, &owner).await?))
            }
        }
    }

    /// Merge `patch` into the user `id` after checking the caller owns it
    pub async fn update_user(
        &self,
        token: &str,
        id: &str,
        patch: UserPatch,
    ) -> Result<Outcome<ManagedUserRecord>> {
        let claims = self.validate_caller(token).await?;
        let email = patch
            .email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty());
        if let Some(email) = email {
            validate_email(email)?;
        }

        match self.update_privileged(&claims, id, &patch, email).await {
            Ok(record) => Ok(Outcome::privileged(record)),
            Err(e) => {
                let store = self.degraded_store("update_user", e)?;
                let target = store
                    .get(id)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
                self.authorize(&claims, target.owner(), "update")?;

                let updated = store
                    .update(id, &patch)
                    .await?
                    .ok_or_else(|| Error::NotFound(format!("user {id}")))?;
                Ok(Outcome::degraded(updated))
            }
        }
    }

    async fn update_privileged(
        &self,
        claims: &TokenClaims,
        id: &str,
        patch: &UserPatch,
        email: Option<&str>,
    ) -> Result<ManagedUserRecord> {
        let admin = self.idp.admin();
        let mut record = admin.get_user(id).await?;
        self.authorize(claims, record.owner(), "update")?;

        let report = record.apply_patch(patch);
        if !report.ignored.is_empty() {
            debug!(id = %id, ignored = ?report.ignored, "Ignored attribute changes");
        }
        if let Some(email) = email {
            record.apply_email(email);
        }

        admin.update_user(&record).await?;
        Ok(record)
    }

    /// Delete the user `id` after checking the caller owns it. Returns
    /// `false` when the degraded store had no such record.
    pub async fn delete_user(&self, token: &str, id: &str) -> Result<Outcome<bool>> {
        let claims = self.validate_caller(token).await?;

        match self.delete_privileged(&claims, id).await {
            Ok(()) => Ok(Outcome::privileged(true)),
            Err(e) => {
                let store = self.degraded_store("delete_user", e)?;
                let Some(target) = store.get(id).await? else {
                    return Ok(Outcome::degraded(false));
                };
                self.authorize(&claims, target.owner(), "delete")?;
                Ok(Outcome::degraded(store.delete(id).await?))
            }
        }
    }

    async fn delete_privileged(&self, claims: &TokenClaims, id: &str) -> Result<()> {
        let admin = self.idp.admin();
        let target = admin.get_user(id).await?;
        self.authorize(claims, target.owner(), "delete")?;
        admin.delete_user(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_defaults_to_caller() {
        assert_eq!(target_or_self(None, "u1"), "u1");
        assert_eq!(target_or_self(Some("  "), "u1"), "u1");
        assert_eq!(target_or_self(Some("u2"), "u1"), "u2");
    }

    #[test]
    fn temporary_passwords_are_unique_and_long_enough() {
        let a = temporary_password();
        let b = temporary_password();
        assert_ne!(a, b);
        assert!(validate_password(&a).is_ok());
    }
}
