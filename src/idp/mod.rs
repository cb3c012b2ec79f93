//! Identity provider access
//!
//! Everything that talks to the IdP lives here, composed into one
//! [`IdpContext`] built at startup and shared by reference.

pub mod admin_api;
pub mod admin_token;
pub mod discovery;
pub mod health;
pub mod validation;

pub use admin_api::AdminApi;
pub use admin_token::{AdminTokenCache, AdminTokenRecord, Clock, ManualClock, SystemClock};
pub use discovery::{EndpointResolver, OpenIdConfiguration, ResolvedEndpoint};
pub use health::{ChannelHealth, ChannelMetrics};
pub use validation::{CallerValidator, LoginSession, UserInfo, bearer_token};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use crate::config::{Config, HttpConfig};
use crate::{Error, Result};

/// Build the shared HTTP client: explicit timeout, optional extra CA, and
/// certificate verification only switched off on request.
pub fn build_http_client(settings: &HttpConfig) -> Result<Client> {
    let mut builder = Client::builder()
        .timeout(settings.timeout)
        .connect_timeout(settings.discovery_timeout)
        .user_agent(concat!("idp-gateway/", env!("CARGO_PKG_VERSION")));

    if let Some(path) = &settings.ca_cert_path {
        let pem = std::fs::read(path).map_err(|e| {
            Error::Config(format!("Failed to read CA certificate {}: {e}", path.display()))
        })?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|e| Error::Config(format!("Invalid CA certificate: {e}")))?;
        builder = builder.add_root_certificate(cert);
    }

    if !settings.verify_tls {
        tracing::warn!("TLS certificate verification disabled for IdP requests");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder
        .build()
        .map_err(|e| Error::Config(format!("Failed to build HTTP client: {e}")))
}

/// Shared IdP state: HTTP client, memoized endpoint, admin token and channel health
#[derive(Debug)]
pub struct IdpContext {
    resolver: Arc<EndpointResolver>,
    tokens: Arc<AdminTokenCache>,
    health: Arc<ChannelHealth>,
    validator: CallerValidator,
    admin: AdminApi,
}

impl IdpContext {
    /// Build the context from configuration using the wall clock
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self> {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    /// Build the context with an explicit time source
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when the HTTP client cannot be built.
    pub fn with_clock(config: &Config, clock: Arc<dyn Clock>) -> Result<Self> {
        let http_client = build_http_client(&config.http)?;
        let candidates =
            discovery::expand_candidates(&config.candidate_urls(), config.idp.try_legacy_paths);

        let resolver = Arc::new(EndpointResolver::new(
            http_client.clone(),
            candidates,
            config.idp.realm.clone(),
            config.http.discovery_timeout,
        ));
        let tokens = Arc::new(AdminTokenCache::new(
            http_client.clone(),
            Arc::clone(&resolver),
            config.admin.clone(),
            Arc::clone(&clock),
        ));
        let health = Arc::new(ChannelHealth::new(
            config.health.failure_threshold,
            config.health.cooldown,
        ));
        let validator = CallerValidator::new(
            http_client.clone(),
            Arc::clone(&resolver),
            config.idp.realm.clone(),
            config.idp.client_id.clone(),
            config.idp.client_secret(),
            clock,
        );
        let admin = AdminApi::new(
            http_client,
            Arc::clone(&resolver),
            Arc::clone(&tokens),
            Arc::clone(&health),
            config.idp.realm.clone(),
        );

        info!(
            candidates = ?resolver.candidates(),
            realm = %config.idp.realm,
            "IdP context ready"
        );

        Ok(Self {
            resolver,
            tokens,
            health,
            validator,
            admin,
        })
    }

    /// Endpoint resolver
    #[must_use]
    pub fn resolver(&self) -> &EndpointResolver {
        &self.resolver
    }

    /// Admin token cache
    #[must_use]
    pub fn tokens(&self) -> &AdminTokenCache {
        &self.tokens
    }

    /// Admin channel health
    #[must_use]
    pub fn health(&self) -> &ChannelHealth {
        &self.health
    }

    /// Caller token validator
    #[must_use]
    pub fn validator(&self) -> &CallerValidator {
        &self.validator
    }

    /// Management API client
    #[must_use]
    pub fn admin(&self) -> &AdminApi {
        &self.admin
    }

    /// Snapshot of channel metrics and cached state
    #[must_use]
    pub fn report(&self) -> ChannelReport {
        let record = self.tokens.record();
        ChannelReport {
            channel: self.health.metrics(),
            endpoint: self.resolver.cached(),
            candidates: self.resolver.candidates().to_vec(),
            discovery_requests: self.resolver.request_count(),
            admin_token_cached: record.is_some(),
            admin_token_expires_at: record.map(|r| DateTime::<Utc>::from(r.expires_at)),
            token_refreshes: self.tokens.refresh_count(),
        }
    }

    /// Drop all cached IdP state
    pub fn shutdown(&self) {
        self.tokens.invalidate();
        self.resolver.invalidate();
        info!("IdP context shut down");
    }
}

/// Channel health report
#[derive(Debug, Clone, Serialize)]
pub struct ChannelReport {
    /// Admin channel metrics
    pub channel: ChannelMetrics,
    /// Memoized endpoint
    pub endpoint: Option<ResolvedEndpoint>,
    /// Candidate base URLs in discovery order
    pub candidates: Vec<String>,
    /// Discovery requests sent
    pub discovery_requests: u64,
    /// Whether an admin token record is cached
    pub admin_token_cached: bool,
    /// Expiry of the cached admin token
    pub admin_token_expires_at: Option<DateTime<Utc>>,
    /// Admin token requests sent
    pub token_refreshes: u64,
}
