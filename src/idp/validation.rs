//! Caller token validation
//!
//! The caller's own token is checked against the IdP with the caller's (or
//! this client's) credentials; no admin privilege is involved. Signatures are
//! the IdP's business: a token is valid when the IdP says it is active.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use idp_core::{RawClaims, TokenClaims};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::admin_token::Clock;
use super::discovery::EndpointResolver;
use crate::{Error, Result};

/// Userinfo response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInfo {
    /// Subject
    pub sub: String,
    /// Username
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Given name
    #[serde(default)]
    pub given_name: Option<String>,
    /// Family name
    #[serde(default)]
    pub family_name: Option<String>,
    /// Display name
    #[serde(default)]
    pub name: Option<String>,
    /// Mapped claims not modelled above
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Tokens issued by a password login
#[derive(Debug, Clone, Serialize)]
pub struct LoginSession {
    /// Access token
    pub access_token: String,
    /// Refresh token, when issued
    pub refresh_token: Option<String>,
    /// Token type, `Bearer` unless the IdP says otherwise
    pub token_type: String,
    /// Lifetime reported by the IdP (seconds)
    pub expires_in: Option<u64>,
    /// `exp` read from the access token payload (Unix seconds)
    pub expires_at: Option<u64>,
}

#[derive(Deserialize)]
struct GrantResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
}

/// Extract the bearer token from an `Authorization` header value.
/// A bare token is accepted as well.
///
/// # Errors
///
/// Returns [`Error::Validation`] when the header is missing or blank.
pub fn bearer_token(header: Option<&str>) -> Result<&str> {
    let value = header.map(str::trim).unwrap_or_default();
    let token = value
        .strip_prefix("Bearer ")
        .or_else(|| value.strip_prefix("bearer "))
        .unwrap_or(value)
        .trim();
    if token.is_empty() {
        return Err(Error::Validation("missing bearer token".to_string()));
    }
    Ok(token)
}

/// Decode the payload of a compact token without verifying anything.
///
/// # Errors
///
/// Returns [`Error::Validation`] unless the token has three dot-separated
/// parts and a base64url JSON object payload.
pub fn decode_unverified(token: &str) -> Result<RawClaims> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::Validation(
            "malformed token: expected three dot-separated parts".to_string(),
        ));
    }

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1].trim_end_matches('='))
        .map_err(|e| Error::Validation(format!("malformed token payload: {e}")))?;

    serde_json::from_slice(&payload)
        .map_err(|e| Error::Validation(format!("malformed token payload: {e}")))
}

/// Validates caller tokens against the IdP
pub struct CallerValidator {
    http_client: Client,
    resolver: Arc<EndpointResolver>,
    realm: String,
    client_id: String,
    client_secret: Option<String>,
    clock: Arc<dyn Clock>,
}

impl CallerValidator {
    /// Create a validator for `realm`. Without a client secret, tokens are
    /// confirmed through the userinfo endpoint instead of introspection.
    #[must_use]
    pub fn new(
        http_client: Client,
        resolver: Arc<EndpointResolver>,
        realm: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: Option<String>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            http_client,
            resolver,
            realm: realm.into(),
            client_id: client_id.into(),
            client_secret,
            clock,
        }
    }

    /// Client whose scoped roles apply
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Validate `token` and return its claims
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] for malformed, inactive or expired tokens;
    /// transport failures surface as [`Error::Http`].
    pub async fn validate(&self, token: &str) -> Result<TokenClaims> {
        let payload = decode_unverified(token)?;

        let raw = if let Some(secret) = &self.client_secret {
            self.introspect(token, secret).await?
        } else {
            self.confirm_with_userinfo(token, payload).await?.0
        };
        self.checked_claims(raw)
    }

    /// Validate `token` and fetch the caller's userinfo. Without a client
    /// secret the userinfo answer doubles as the validation, so the IdP is
    /// asked once.
    ///
    /// # Errors
    ///
    /// Same as [`CallerValidator::validate`].
    pub async fn validate_with_userinfo(&self, token: &str) -> Result<(TokenClaims, UserInfo)> {
        let payload = decode_unverified(token)?;

        let (raw, info) = if let Some(secret) = &self.client_secret {
            futures::try_join!(self.introspect(token, secret), self.userinfo(token))?
        } else {
            self.confirm_with_userinfo(token, payload).await?
        };
        Ok((self.checked_claims(raw)?, info))
    }

    /// The IdP accepting the token at userinfo confirms it is active
    async fn confirm_with_userinfo(
        &self,
        token: &str,
        payload: RawClaims,
    ) -> Result<(RawClaims, UserInfo)> {
        let info = self.userinfo(token).await?;
        if payload.sub.as_deref().is_some_and(|sub| sub != info.sub) {
            return Err(Error::Validation("token subject mismatch".to_string()));
        }
        let raw = RawClaims {
            active: Some(true),
            sub: Some(info.sub.clone()),
            ..payload
        };
        Ok((raw, info))
    }

    fn checked_claims(&self, raw: RawClaims) -> Result<TokenClaims> {
        let claims = raw
            .into_claims()
            .ok_or_else(|| Error::Validation("token has no subject".to_string()))?;

        if let Some(exp) = claims.expires_at {
            if exp <= unix_secs(self.clock.now()) {
                return Err(Error::Validation("token expired".to_string()));
            }
        }

        debug!(subject = %claims.subject, "Caller token validated");
        Ok(claims)
    }

    /// Exchange a username and password (plus a one-time code when the
    /// account requires one) for tokens, using this client's credentials.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the IdP rejects the credentials;
    /// other non-success statuses surface as [`Error::Upstream`].
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        totp: Option<&str>,
    ) -> Result<LoginSession> {
        let mut params = vec![
            ("grant_type", "password"),
            ("client_id", self.client_id.as_str()),
            ("username", username),
            ("password", password),
        ];
        if let Some(secret) = self.client_secret.as_deref() {
            params.push(("client_secret", secret));
        }
        if let Some(code) = totp {
            params.push(("totp", code));
        }

        let endpoint = self.resolver.resolve_or_default().await;
        let response = self
            .http_client
            .post(endpoint.token_url(&self.realm))
            .form(&params)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => {}
            StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED => {
                debug!(username = %username, "Login rejected by IdP");
                return Err(Error::Validation("invalid credentials".to_string()));
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(Error::upstream(status, body));
            }
        }

        let grant: GrantResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse token response: {e}")))?;
        let expires_at = decode_unverified(&grant.access_token)
            .ok()
            .and_then(|payload| payload.exp);

        debug!(username = %username, "Login succeeded");
        Ok(LoginSession {
            access_token: grant.access_token,
            refresh_token: grant.refresh_token,
            token_type: grant.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_in: grant.expires_in,
            expires_at,
        })
    }

    /// Ask the introspection endpoint about `token`
    async fn introspect(&self, token: &str, secret: &str) -> Result<RawClaims> {
        let endpoint = self.resolver.resolve_or_default().await;
        let response = self
            .http_client
            .post(endpoint.introspection_url(&self.realm))
            .basic_auth(&self.client_id, Some(secret))
            .form(&[("token", token)])
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status, body));
        }

        let raw: RawClaims = response
            .json()
            .await
            .map_err(|e| Error::Internal(format!("Failed to parse introspection response: {e}")))?;

        if !raw.is_active() {
            return Err(Error::Validation("token is not active".to_string()));
        }
        Ok(raw)
    }

    /// Fetch the caller's userinfo with their own token
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] when the IdP rejects the token.
    pub async fn userinfo(&self, token: &str) -> Result<UserInfo> {
        let endpoint = self.resolver.resolve_or_default().await;
        let response = self
            .http_client
            .get(endpoint.userinfo_url(&self.realm))
            .bearer_auth(token)
            .send()
            .await?;

        match response.status() {
            status if status.is_success() => response
                .json()
                .await
                .map_err(|e| Error::Internal(format!("Failed to parse userinfo: {e}"))),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(Error::Validation("token rejected by IdP".to_string()))
            }
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(Error::upstream(status, body))
            }
        }
    }
}

/// Unix seconds for `time`
pub(crate) fn unix_secs(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

impl std::fmt::Debug for CallerValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallerValidator")
            .field("realm", &self.realm)
            .field("client_id", &self.client_id)
            .field("introspection", &self.client_secret.is_some())
            .finish_non_exhaustive()
    }
}
