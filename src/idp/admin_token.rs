//! Admin token cache
//!
//! Holds the privileged bearer token used for the management API. A usable
//! record is served without any network call; on a miss exactly one refresh
//! is in flight. Waiters re-check the cache once they get the lock, and share
//! the leader's error when the refresh they queued behind failed.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};

use parking_lot::RwLock;
use reqwest::Client;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::discovery::EndpointResolver;
use crate::config::{AdminConfig, AdminGrant};
use crate::{Error, Result};

/// Time source for expiry decisions
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time
    fn now(&self) -> SystemTime;
}

/// Wall clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> SystemTime {
        SystemTime::now()
    }
}

/// Clock that only moves when advanced, for deterministic expiry tests
#[derive(Debug)]
pub struct ManualClock {
    now: parking_lot::Mutex<SystemTime>,
}

impl ManualClock {
    /// Clock frozen at `start`
    #[must_use]
    pub fn new(start: SystemTime) -> Self {
        Self {
            now: parking_lot::Mutex::new(start),
        }
    }

    /// Move the clock forward
    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock();
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> SystemTime {
        *self.now.lock()
    }
}

/// Cached privileged credential. Never persisted.
#[derive(Clone)]
pub struct AdminTokenRecord {
    /// Bearer token
    pub token: String,
    /// Instant after which the token is no longer handed out
    pub expires_at: SystemTime,
}

impl AdminTokenRecord {
    /// Usable iff `expires_at > now`
    #[must_use]
    pub fn is_usable(&self, now: SystemTime) -> bool {
        self.expires_at > now
    }
}

impl fmt::Debug for AdminTokenRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminTokenRecord")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Token endpoint response
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Obtains and caches the admin bearer token
pub struct AdminTokenCache {
    http_client: Client,
    resolver: Arc<EndpointResolver>,
    settings: AdminConfig,
    clock: Arc<dyn Clock>,
    record: RwLock<Option<AdminTokenRecord>>,
    refresh_lock: Mutex<()>,
    refreshes: AtomicU64,
    /// Completed refresh attempts, successful or not
    attempts: AtomicU64,
    last_failure: RwLock<Option<String>>,
}

impl AdminTokenCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(
        http_client: Client,
        resolver: Arc<EndpointResolver>,
        settings: AdminConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http_client,
            resolver,
            settings,
            clock,
            record: RwLock::new(None),
            refresh_lock: Mutex::new(()),
            refreshes: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            last_failure: RwLock::new(None),
        }
    }

    /// A usable admin token, refreshing when the cached one is missing or expired
    ///
    /// # Errors
    ///
    /// Returns [`Error::Auth`] when the token request fails at the transport
    /// level, is rejected, or the response is malformed. Any previous record
    /// is left untouched. Callers that queued behind a failed refresh get the
    /// same error without sending another request.
    pub async fn get_token(&self) -> Result<String> {
        if let Some(token) = self.usable_token() {
            return Ok(token);
        }

        let seen = self.attempts.load(Ordering::Acquire);
        let _guard = self.refresh_lock.lock().await;
        if let Some(token) = self.usable_token() {
            debug!("Admin token refreshed by a concurrent caller");
            return Ok(token);
        }
        if self.attempts.load(Ordering::Acquire) != seen
            && let Some(reason) = self.last_failure.read().clone()
        {
            debug!("Sharing the failure of a concurrent refresh");
            return Err(Error::Auth(reason));
        }

        let result = self.refresh().await;
        *self.last_failure.write() = result.as_ref().err().map(|e| match e {
            Error::Auth(reason) => reason.clone(),
            other => other.to_string(),
        });
        self.attempts.fetch_add(1, Ordering::Release);

        let record = result?;
        let token = record.token.clone();
        *self.record.write() = Some(record);
        Ok(token)
    }

    /// Snapshot of the current record
    #[must_use]
    pub fn record(&self) -> Option<AdminTokenRecord> {
        self.record.read().clone()
    }

    /// Drop the cached record
    pub fn invalidate(&self) {
        if self.record.write().take().is_some() {
            info!("Admin token invalidated");
        }
    }

    /// Number of token requests sent so far
    #[must_use]
    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn usable_token(&self) -> Option<String> {
        let now = self.clock.now();
        self.record
            .read()
            .as_ref()
            .filter(|r| r.is_usable(now))
            .map(|r| r.token.clone())
    }

    fn grant_params(&self) -> Result<Vec<(&'static str, String)>> {
        let mut params = vec![
            ("grant_type", self.settings.grant.as_str().to_string()),
            ("client_id", self.settings.client_id.clone()),
        ];
        match self.settings.grant {
            AdminGrant::Password => {
                let (Some(username), Some(password)) =
                    (self.settings.username(), self.settings.password())
                else {
                    return Err(Error::Auth(
                        "admin username and password are not configured".to_string(),
                    ));
                };
                params.push(("username", username));
                params.push(("password", password));
                if let Some(secret) = self.settings.client_secret() {
                    params.push(("client_secret", secret));
                }
            }
            AdminGrant::ClientCredentials => {
                let secret = self.settings.client_secret().ok_or_else(|| {
                    Error::Auth("admin client secret is not configured".to_string())
                })?;
                params.push(("client_secret", secret));
            }
        }
        Ok(params)
    }

    async fn refresh(&self) -> Result<AdminTokenRecord> {
        let params = self.grant_params()?;
        let endpoint = self.resolver.resolve_or_default().await;
        let url = endpoint.token_url(&self.settings.realm);

        self.refreshes.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, grant = self.settings.grant.as_str(), "Requesting admin token");

        let response = self
            .http_client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| {
                warn!(error = %e, "Admin token request failed");
                Error::Auth(format!("Token request failed: {e}"))
            })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = %status, "Admin token request rejected");
            return Err(Error::Auth(format!("Token request failed: HTTP {status} - {body}")));
        }

        let token_response: TokenResponse = response
            .json()
            .await
            .map_err(|e| Error::Auth(format!("Failed to parse token response: {e}")))?;

        let lifetime = token_response
            .expires_in
            .map_or(self.settings.default_expires_in, Duration::from_secs);
        let expires_at = self.clock.now() + lifetime.saturating_sub(self.settings.safety_margin);

        info!(
            expires_in_secs = lifetime.as_secs(),
            margin_secs = self.settings.safety_margin.as_secs(),
            "Admin token refreshed"
        );

        Ok(AdminTokenRecord {
            token: token_response.access_token,
            expires_at,
        })
    }
}

impl fmt::Debug for AdminTokenCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminTokenCache")
            .field("realm", &self.settings.realm)
            .field("grant", &self.settings.grant)
            .field("record", &*self.record.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_usable_strictly_before_expiry() {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000);
        let record = AdminTokenRecord {
            token: "t".to_string(),
            expires_at: t,
        };
        assert!(record.is_usable(t - Duration::from_secs(1)));
        assert!(!record.is_usable(t));
        assert!(!record.is_usable(t + Duration::from_secs(1)));
    }

    #[test]
    fn manual_clock_advances() {
        let start = SystemTime::UNIX_EPOCH;
        let clock = ManualClock::new(start);
        clock.advance(Duration::from_secs(270));
        assert_eq!(clock.now(), start + Duration::from_secs(270));
    }

    #[test]
    fn debug_redacts_token() {
        let record = AdminTokenRecord {
            token: "super-secret".to_string(),
            expires_at: SystemTime::UNIX_EPOCH,
        };
        assert!(!format!("{record:?}").contains("super-secret"));
    }

    #[tokio::test]
    async fn missing_credentials_fail_without_request() {
        let http = Client::new();
        let resolver = Arc::new(EndpointResolver::new(
            http.clone(),
            vec!["http://127.0.0.1:9".to_string()],
            "master",
            Duration::from_millis(50),
        ));
        let cache = AdminTokenCache::new(http, resolver, AdminConfig::default(), Arc::new(SystemClock));

        let err = cache.get_token().await.unwrap_err();
        assert!(matches!(err, Error::Auth(_)));
        assert_eq!(cache.refresh_count(), 0);
        assert!(cache.record().is_none());
    }
}
