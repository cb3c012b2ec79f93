//! IdP endpoint discovery
//!
//! Walks the configured candidate base URLs in priority order and memoizes
//! the first one whose realm serves a well-formed OpenID configuration.
//! Keycloak releases before 17 mount everything under `/auth`, so every
//! candidate without that segment is followed by its `{base}/auth` variant.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::{Error, Result};

/// OpenID Provider configuration document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenIdConfiguration {
    /// Issuer URL
    #[serde(default)]
    pub issuer: Option<String>,

    /// Token endpoint URL
    pub token_endpoint: String,

    /// Introspection endpoint (optional)
    #[serde(default)]
    pub introspection_endpoint: Option<String>,

    /// Userinfo endpoint (optional)
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
}

/// A working IdP base URL
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedEndpoint {
    /// Base URL, without trailing slash
    pub base_url: String,
    /// Token endpoint advertised by the discovery document
    pub token_endpoint: String,
    /// When the discovery document was fetched
    pub resolved_at: DateTime<Utc>,
}

impl ResolvedEndpoint {
    /// `{base}/realms/{realm}`
    #[must_use]
    pub fn realm_url(&self, realm: &str) -> String {
        format!("{}/realms/{realm}", self.base_url)
    }

    /// Token endpoint of `realm`, built from the base URL
    #[must_use]
    pub fn token_url(&self, realm: &str) -> String {
        format!("{}/protocol/openid-connect/token", self.realm_url(realm))
    }

    /// Introspection endpoint of `realm`
    #[must_use]
    pub fn introspection_url(&self, realm: &str) -> String {
        format!("{}/introspect", self.token_url(realm))
    }

    /// Userinfo endpoint of `realm`
    #[must_use]
    pub fn userinfo_url(&self, realm: &str) -> String {
        format!("{}/protocol/openid-connect/userinfo", self.realm_url(realm))
    }

    /// Management API users collection of `realm`
    #[must_use]
    pub fn admin_users_url(&self, realm: &str) -> String {
        format!("{}/admin/realms/{realm}/users", self.base_url)
    }
}

/// Whether the URL path already contains an `auth` segment
fn has_auth_segment(base: &str) -> bool {
    match Url::parse(base) {
        Ok(url) => url
            .path_segments()
            .is_some_and(|mut segments| segments.any(|s| s == "auth")),
        Err(_) => base.contains("/auth"),
    }
}

/// Expand candidates with their legacy `/auth` variants, keeping order and
/// dropping duplicates.
#[must_use]
pub fn expand_candidates(candidates: &[String], try_legacy_paths: bool) -> Vec<String> {
    let mut expanded: Vec<String> = Vec::with_capacity(candidates.len() * 2);
    let mut push = |url: String| {
        if !expanded.contains(&url) {
            expanded.push(url);
        }
    };
    for candidate in candidates {
        let base = candidate.trim_end_matches('/').to_string();
        let legacy = (try_legacy_paths && !has_auth_segment(&base)).then(|| format!("{base}/auth"));
        push(base);
        if let Some(legacy) = legacy {
            push(legacy);
        }
    }
    expanded
}

/// Discovers and memoizes a working IdP base URL
pub struct EndpointResolver {
    http_client: Client,
    candidates: Vec<String>,
    primary: String,
    realm: String,
    discovery_timeout: Duration,
    resolved: RwLock<Option<ResolvedEndpoint>>,
    /// Held while walking the candidates so concurrent first calls coalesce
    walk_lock: Mutex<()>,
    requests: AtomicU64,
    /// Completed candidate walks
    walks: AtomicU64,
    /// Candidates tried by the last walk, when it failed
    last_failure: RwLock<Option<Vec<String>>>,
}

impl EndpointResolver {
    /// Create a resolver over `candidates` (primary first, already expanded)
    #[must_use]
    pub fn new(
        http_client: Client,
        candidates: Vec<String>,
        realm: impl Into<String>,
        discovery_timeout: Duration,
    ) -> Self {
        let primary = candidates.first().cloned().unwrap_or_default();
        Self {
            http_client,
            candidates,
            primary,
            realm: realm.into(),
            discovery_timeout,
            resolved: RwLock::new(None),
            walk_lock: Mutex::new(()),
            requests: AtomicU64::new(0),
            walks: AtomicU64::new(0),
            last_failure: RwLock::new(None),
        }
    }

    /// Candidate base URLs in discovery order
    #[must_use]
    pub fn candidates(&self) -> &[String] {
        &self.candidates
    }

    /// Memoized endpoint, if any
    #[must_use]
    pub fn cached(&self) -> Option<ResolvedEndpoint> {
        self.resolved.read().clone()
    }

    /// Drop the memoized endpoint so the next call walks the candidates again
    pub fn invalidate(&self) {
        if self.resolved.write().take().is_some() {
            info!("Resolved IdP endpoint invalidated");
        }
    }

    /// Number of discovery requests sent so far
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Relaxed)
    }

    /// Resolve a working endpoint
    ///
    /// # Errors
    ///
    /// Returns [`Error::Discovery`] listing every attempted URL when no
    /// candidate serves a valid discovery document. Callers that queued
    /// behind a failed walk share its error.
    pub async fn resolve(&self) -> Result<ResolvedEndpoint> {
        if let Some(endpoint) = self.cached() {
            return Ok(endpoint);
        }

        let seen = self.walks.load(Ordering::Acquire);
        let _guard = self.walk_lock.lock().await;
        // Another caller may have finished the walk while we waited
        if let Some(endpoint) = self.cached() {
            return Ok(endpoint);
        }
        if self.walks.load(Ordering::Acquire) != seen
            && let Some(attempted) = self.last_failure.read().clone()
        {
            return Err(Error::Discovery { attempted });
        }

        let result = self.walk().await;
        *self.last_failure.write() = match &result {
            Err(Error::Discovery { attempted }) => Some(attempted.clone()),
            _ => None,
        };
        self.walks.fetch_add(1, Ordering::Release);
        result
    }

    /// Try every candidate in order, memoizing the first that answers
    async fn walk(&self) -> Result<ResolvedEndpoint> {
        let mut attempted = Vec::with_capacity(self.candidates.len());
        for base in &self.candidates {
            attempted.push(base.clone());
            match self.fetch_document(base).await {
                Ok(doc) => {
                    let endpoint = ResolvedEndpoint {
                        base_url: base.clone(),
                        token_endpoint: doc.token_endpoint,
                        resolved_at: Utc::now(),
                    };
                    info!(base_url = %endpoint.base_url, attempts = attempted.len(), "Resolved IdP endpoint");
                    *self.resolved.write() = Some(endpoint.clone());
                    return Ok(endpoint);
                }
                Err(e) => {
                    debug!(base_url = %base, error = %e, "Discovery request failed");
                }
            }
        }

        warn!(attempted = ?attempted, "No IdP candidate answered discovery");
        Err(Error::Discovery { attempted })
    }

    /// Resolve, falling back to the primary base URL in best-effort mode.
    /// The fallback is not memoized.
    pub async fn resolve_or_default(&self) -> ResolvedEndpoint {
        match self.resolve().await {
            Ok(endpoint) => endpoint,
            Err(e) => {
                warn!(error = %e, base_url = %self.primary, "Using primary IdP base URL without discovery");
                let base_url = self.primary.clone();
                let token_endpoint = format!(
                    "{base_url}/realms/{}/protocol/openid-connect/token",
                    self.realm
                );
                ResolvedEndpoint {
                    base_url,
                    token_endpoint,
                    resolved_at: Utc::now(),
                }
            }
        }
    }

    /// Fetch and validate the discovery document under `base`
    async fn fetch_document(&self, base: &str) -> Result<OpenIdConfiguration> {
        let url = format!(
            "{base}/realms/{}/.well-known/openid-configuration",
            self.realm
        );
        self.requests.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, "Probing IdP discovery document");

        let response = self
            .http_client
            .get(&url)
            .timeout(self.discovery_timeout)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::Internal(format!(
                "Discovery failed: HTTP {}",
                response.status()
            )));
        }

        let doc: OpenIdConfiguration = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse discovery document: {e}")))?;

        if doc.token_endpoint.trim().is_empty() {
            return Err(Error::Internal(
                "Discovery document has an empty token_endpoint".to_string(),
            ));
        }

        Ok(doc)
    }
}

impl std::fmt::Debug for EndpointResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointResolver")
            .field("candidates", &self.candidates)
            .field("realm", &self.realm)
            .field("resolved", &*self.resolved.read())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn urls(list: &[&str]) -> Vec<String> {
        list.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn legacy_variant_follows_each_candidate() {
        let expanded = expand_candidates(&urls(&["http://a:8080/", "http://b"]), true);
        assert_eq!(
            expanded,
            urls(&["http://a:8080", "http://a:8080/auth", "http://b", "http://b/auth"])
        );
    }

    #[test]
    fn candidate_with_auth_segment_gets_no_variant() {
        let expanded = expand_candidates(&urls(&["https://sso.example.com/auth"]), true);
        assert_eq!(expanded, urls(&["https://sso.example.com/auth"]));
    }

    #[test]
    fn authority_path_is_not_an_auth_segment() {
        assert!(!has_auth_segment("https://auth.example.com"));
        assert!(has_auth_segment("https://example.com/auth"));
        assert!(!has_auth_segment("https://example.com/oauth"));
    }

    #[test]
    fn legacy_variants_disabled() {
        let expanded = expand_candidates(&urls(&["http://a", "http://a/"]), false);
        assert_eq!(expanded, urls(&["http://a"]));
    }

    #[test]
    fn endpoint_urls() {
        let endpoint = ResolvedEndpoint {
            base_url: "http://kc:8080".to_string(),
            token_endpoint: String::new(),
            resolved_at: Utc::now(),
        };
        assert_eq!(
            endpoint.token_url("master"),
            "http://kc:8080/realms/master/protocol/openid-connect/token"
        );
        assert_eq!(
            endpoint.introspection_url("school"),
            "http://kc:8080/realms/school/protocol/openid-connect/token/introspect"
        );
        assert_eq!(
            endpoint.admin_users_url("school"),
            "http://kc:8080/admin/realms/school/users"
        );
    }

    #[test]
    fn discovery_document_requires_token_endpoint() {
        let missing: std::result::Result<OpenIdConfiguration, _> =
            serde_json::from_str(r#"{"issuer": "http://kc/realms/school"}"#);
        assert!(missing.is_err());

        let doc: OpenIdConfiguration = serde_json::from_str(
            r#"{"issuer": "http://kc/realms/school", "token_endpoint": "http://kc/t"}"#,
        )
        .unwrap();
        assert_eq!(doc.token_endpoint, "http://kc/t");
    }
}
