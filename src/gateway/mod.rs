//! Request orchestration
//!
//! Every operation runs `validate caller -> [authorize ownership] ->
//! acquire admin token -> privileged call | degraded call`. Only a channel
//! failure (discovery, admin token, transport) falls through to the degraded
//! store; authorization always happens before a mutation on either path.

mod account;
mod users;

pub use account::Profile;

use std::sync::{Arc, LazyLock};

use idp_core::{PermissionEvaluator, TokenClaims};
use regex::Regex;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::fallback::DegradedStore;
use crate::idp::{ChannelReport, IdpContext, bearer_token};
use crate::{Error, Result};

/// Minimum accepted password length
const MIN_PASSWORD_LEN: usize = 8;

static EMAIL_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").expect("email pattern is valid"));

fn validate_email(email: &str) -> Result<()> {
    if EMAIL_PATTERN.is_match(email) {
        Ok(())
    } else {
        Err(Error::InvalidInput(format!("invalid email address: {email:?}")))
    }
}

fn validate_password(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(Error::InvalidInput(format!(
            "password must be at least {MIN_PASSWORD_LEN} characters"
        )));
    }
    Ok(())
}

/// Which path served an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionPath {
    /// The IdP management API
    Privileged,
    /// The local degraded store
    Degraded,
}

/// Operation result tagged with the path that produced it
#[derive(Debug, Clone, Serialize)]
pub struct Outcome<T> {
    /// Result value
    pub value: T,
    /// Path that served the request
    pub path: ExecutionPath,
}

impl<T> Outcome<T> {
    fn privileged(value: T) -> Self {
        Self {
            value,
            path: ExecutionPath::Privileged,
        }
    }

    fn degraded(value: T) -> Self {
        Self {
            value,
            path: ExecutionPath::Degraded,
        }
    }

    /// Whether the degraded store served this result
    #[must_use]
    pub fn is_degraded(&self) -> bool {
        self.path == ExecutionPath::Degraded
    }

    /// Unwrap the value
    pub fn into_inner(self) -> T {
        self.value
    }
}

/// Composes IdP access, authorization and the degraded store per operation
#[derive(Debug)]
pub struct Gateway {
    idp: Arc<IdpContext>,
    store: Option<Arc<DegradedStore>>,
    permissions: PermissionEvaluator,
}

impl Gateway {
    /// Assemble a gateway. Without a store, channel failures surface as errors.
    #[must_use]
    pub fn new(
        idp: Arc<IdpContext>,
        store: Option<Arc<DegradedStore>>,
        permissions: PermissionEvaluator,
    ) -> Self {
        Self {
            idp,
            store,
            permissions,
        }
    }

    /// Build the IdP context, open the degraded store (when enabled) and
    /// wire the permission evaluator from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built or the store
    /// cannot be opened.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let idp = Arc::new(IdpContext::new(config)?);
        let store = if config.fallback.enabled {
            let store =
                DegradedStore::open(&config.fallback.path, config.fallback.synthesize_example)
                    .await?;
            Some(Arc::new(store))
        } else {
            None
        };
        let permissions = PermissionEvaluator::new(config.idp.client_id.clone())
            .with_admin_roles(config.authorization.admin_roles.clone());

        info!(fallback = store.is_some(), "Gateway ready");
        Ok(Self::new(idp, store, permissions))
    }

    /// IdP context
    #[must_use]
    pub fn idp(&self) -> &IdpContext {
        &self.idp
    }

    /// Degraded store, when enabled
    #[must_use]
    pub fn store(&self) -> Option<&DegradedStore> {
        self.store.as_deref()
    }

    /// Permission evaluator
    #[must_use]
    pub fn permissions(&self) -> &PermissionEvaluator {
        &self.permissions
    }

    /// Validate the caller's own token (an `Authorization` header value or a
    /// bare token) against the IdP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for a missing, malformed, inactive or
    /// expired token.
    pub async fn validate_caller(&self, token: &str) -> Result<TokenClaims> {
        let token = bearer_token(Some(token))?;
        self.idp.validator().validate(token).await
    }

    /// Admin channel metrics and cached state
    #[must_use]
    pub fn channel_health(&self) -> ChannelReport {
        self.idp.report()
    }

    /// Fail with [`Error::Authorization`] unless the caller may act on a
    /// resource owned by `owner`.
    fn authorize(&self, claims: &TokenClaims, owner: Option<&str>, action: &str) -> Result<()> {
        if self.permissions.evaluate_ownership(claims, owner).is_allowed() {
            return Ok(());
        }
        warn!(
            subject = %claims.subject,
            owner = owner.unwrap_or("<none>"),
            action,
            "Ownership check denied"
        );
        Err(Error::Authorization(format!(
            "not allowed to {action} a user owned by someone else"
        )))
    }

    /// The degraded store when `err` is a channel failure and the fallback is
    /// enabled; otherwise `err` itself.
    fn degraded_store(&self, operation: &'static str, err: Error) -> Result<&DegradedStore> {
        match self.store.as_deref() {
            Some(store) if err.is_channel_failure() => {
                warn!(operation, error = %err, "Admin channel unavailable, serving from degraded store");
                Ok(store)
            }
            _ => Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_format() {
        assert!(validate_email("ana@example.com").is_ok());
        assert!(validate_email("ana.soto+x@mail.example.cl").is_ok());
        assert!(validate_email("ana").is_err());
        assert!(validate_email("ana@localhost").is_err());
        assert!(validate_email("a na@example.com").is_err());
        assert!(validate_email("").is_err());
    }

    #[test]
    fn password_length() {
        assert!(validate_password("12345678").is_ok());
        assert!(validate_password("short").is_err());
    }

    #[test]
    fn outcome_path() {
        let outcome = Outcome::degraded(3);
        assert!(outcome.is_degraded());
        assert_eq!(outcome.into_inner(), 3);
        assert!(!Outcome::privileged(()).is_degraded());
    }

    #[tokio::test]
    async fn channel_failure_without_store_is_returned() {
        let idp = Arc::new(IdpContext::new(&Config::default()).unwrap());
        let gateway = Gateway::new(idp, None, PermissionEvaluator::new("web-api"));

        let err = gateway
            .degraded_store("list_users", Error::Auth("down".into()))
            .unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
    }

    #[tokio::test]
    async fn non_channel_error_never_degrades() {
        let dir = tempfile::tempdir().unwrap();
        let store = DegradedStore::open(dir.path().join("users.json"), true)
            .await
            .unwrap();
        let idp = Arc::new(IdpContext::new(&Config::default()).unwrap());
        let gateway = Gateway::new(idp, Some(Arc::new(store)), PermissionEvaluator::new("web-api"));

        let upstream = Error::Upstream {
            status: 404,
            body: String::new(),
        };
        assert!(matches!(
            gateway.degraded_store("get_user", upstream),
            Err(Error::Upstream { status: 404, .. })
        ));
        assert!(gateway.degraded_store("get_user", Error::Auth("down".into())).is_ok());
    }
}
