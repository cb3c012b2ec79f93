//! IdP Gateway Library
//!
//! Resilience layer between application request handlers and a
//! Keycloak-compatible identity provider.
//!
//! # Features
//!
//! - **Endpoint discovery**: tries candidate base URLs (with legacy `/auth`
//!   variants) and memoizes the first working one
//! - **Admin token cache**: single-flight, TTL-aware refresh of the privileged credential
//! - **Ownership checks**: decisions derived only from IdP-validated claims
//! - **Degraded mode**: file-backed user store serving management operations
//!   while the privileged channel is down
//! - **Channel health**: consecutive-failure tracking that drops stale cached state

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod error;
pub mod fallback;
pub mod gateway;
pub mod idp;

pub use error::{Error, Result};
pub use idp_core::{ManagedUserRecord, NewUser, PermissionDecision, TokenClaims, UserPatch};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    match format {
        Some("json") => subscriber
            .with(fmt::layer().json())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
        _ => subscriber
            .with(fmt::layer())
            .try_init()
            .map_err(|e| Error::Internal(format!("Failed to install subscriber: {e}"))),
    }
}
