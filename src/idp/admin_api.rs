//! Management API client
//!
//! Every call authenticates with the cached admin token and reports its
//! outcome to [`ChannelHealth`]. While the channel is cooling down calls are
//! refused with [`Error::Auth`] before any token is requested. A 401 drops
//! the cached token and surfaces as [`Error::Auth`]; other non-success
//! statuses pass through as [`Error::Upstream`].

use std::sync::Arc;
use std::time::Instant;

use idp_core::{ManagedUserRecord, OWNER_ATTRIBUTE};
use reqwest::header::LOCATION;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::{debug, warn};

use super::admin_token::AdminTokenCache;
use super::discovery::EndpointResolver;
use super::health::ChannelHealth;
use crate::{Error, Result};

/// Upper bound on users returned by one listing
const LIST_LIMIT: &str = "1000";

/// Reject ids that would escape the `/users/{id}` path
fn check_id(id: &str) -> Result<()> {
    if id.is_empty() || id.contains(['/', '?', '#', '%']) || id == "." || id == ".." {
        return Err(Error::InvalidInput(format!("invalid user id: {id:?}")));
    }
    Ok(())
}

/// Last path segment of a `Location` header
fn id_from_location(response: &Response) -> Option<String> {
    response
        .headers()
        .get(LOCATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|location| location.trim_end_matches('/').rsplit('/').next())
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

async fn parse<T: DeserializeOwned>(response: Response, what: &str) -> Result<T> {
    response
        .json()
        .await
        .map_err(|e| Error::Internal(format!("Failed to parse {what}: {e}")))
}

/// Typed client for `/admin/realms/{realm}/users`
pub struct AdminApi {
    http_client: Client,
    resolver: Arc<EndpointResolver>,
    tokens: Arc<AdminTokenCache>,
    health: Arc<ChannelHealth>,
    realm: String,
}

impl AdminApi {
    /// Create a client for the users of `realm`
    #[must_use]
    pub fn new(
        http_client: Client,
        resolver: Arc<EndpointResolver>,
        tokens: Arc<AdminTokenCache>,
        health: Arc<ChannelHealth>,
        realm: impl Into<String>,
    ) -> Self {
        Self {
            http_client,
            resolver,
            tokens,
            health,
            realm: realm.into(),
        }
    }

    /// Users whose owner attribute equals `owner`
    pub async fn list_users(&self, owner: &str) -> Result<Vec<ManagedUserRecord>> {
        let query = format!("{OWNER_ATTRIBUTE}:{owner}");
        let response = self
            .send(|client, users| {
                client.get(users).query(&[
                    ("q", query.as_str()),
                    ("briefRepresentation", "false"),
                    ("max", LIST_LIMIT),
                ])
            })
            .await?;

        let users: Vec<ManagedUserRecord> = parse(response, "user list").await?;
        // Older IdP releases ignore `q`
        Ok(users
            .into_iter()
            .filter(|user| user.owner() == Some(owner))
            .collect())
    }

    /// Fetch one user
    pub async fn get_user(&self, id: &str) -> Result<ManagedUserRecord> {
        check_id(id)?;
        let response = self
            .send(|client, users| client.get(format!("{users}/{id}")))
            .await?;
        parse(response, "user").await
    }

    /// Exact username lookup
    pub async fn find_by_username(&self, username: &str) -> Result<Option<ManagedUserRecord>> {
        let response = self
            .send(|client, users| {
                client.get(users).query(&[
                    ("username", username),
                    ("exact", "true"),
                    ("briefRepresentation", "false"),
                ])
            })
            .await?;

        let users: Vec<ManagedUserRecord> = parse(response, "user search").await?;
        Ok(users.into_iter().find(|user| {
            user.username
                .as_deref()
                .is_some_and(|u| u.eq_ignore_ascii_case(username))
        }))
    }

    /// Create a user with an initial password and read it back
    pub async fn create_user(
        &self,
        record: &ManagedUserRecord,
        password: &str,
        temporary: bool,
    ) -> Result<ManagedUserRecord> {
        let mut body = serde_json::to_value(record)?;
        if let Some(fields) = body.as_object_mut() {
            fields.remove("id");
            fields.remove("createdTimestamp");
            fields.remove("role");
            fields.insert(
                "credentials".to_string(),
                json!([{"type": "password", "value": password, "temporary": temporary}]),
            );
        }

        let response = self
            .send(|client, users| client.post(users).json(&body))
            .await?;

        let location_id = id_from_location(&response);
        let username = record.username.as_deref().unwrap_or(&record.email);
        let read_back = match &location_id {
            Some(id) => {
                debug!(id = %id, "User created");
                self.get_user(id).await.map(Some)
            }
            None => self.find_by_username(username).await,
        };

        // The user exists in the IdP from here on; a failed read-back must
        // not surface as a failed create
        match read_back {
            Ok(Some(created)) => return Ok(created),
            Ok(None) => warn!(username = %username, "Created user not found on read-back"),
            Err(e) => {
                warn!(username = %username, error = %e, "Read-back of created user failed");
            }
        }
        Ok(ManagedUserRecord {
            id: location_id.unwrap_or_default(),
            ..record.clone()
        })
    }

    /// Replace a user's representation
    pub async fn update_user(&self, record: &ManagedUserRecord) -> Result<()> {
        check_id(&record.id)?;
        let id = record.id.as_str();
        self.send(|client, users| client.put(format!("{users}/{id}")).json(record))
            .await?;
        Ok(())
    }

    /// Delete a user
    pub async fn delete_user(&self, id: &str) -> Result<()> {
        check_id(id)?;
        self.send(|client, users| client.delete(format!("{users}/{id}")))
            .await?;
        Ok(())
    }

    /// Set a user's password
    pub async fn reset_password(&self, id: &str, password: &str, temporary: bool) -> Result<()> {
        check_id(id)?;
        let body = json!({"type": "password", "value": password, "temporary": temporary});
        self.send(|client, users| client.put(format!("{users}/{id}/reset-password")).json(&body))
            .await?;
        Ok(())
    }

    /// Authenticate and send a request built against the users collection URL
    async fn send<F>(&self, build: F) -> Result<Response>
    where
        F: FnOnce(&Client, &str) -> RequestBuilder,
    {
        if !self.health.allow_request() {
            debug!("Admin channel cooling down, refusing call");
            return Err(Error::Auth("admin channel unavailable".to_string()));
        }

        let token = match self.tokens.get_token().await {
            Ok(token) => token,
            Err(e) => {
                self.channel_failed();
                return Err(e);
            }
        };

        let endpoint = self.resolver.resolve_or_default().await;
        let users = endpoint.admin_users_url(&self.realm);
        let started = Instant::now();

        let response = match build(&self.http_client, &users)
            .bearer_auth(&token)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Admin API request failed");
                self.channel_failed();
                return Err(Error::Http(e));
            }
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            warn!("Admin token rejected, dropping it");
            self.tokens.invalidate();
            self.channel_failed();
            return Err(Error::Auth("admin token rejected by IdP".to_string()));
        }
        self.health.record_success(started.elapsed());
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::upstream(status, body));
        }
        Ok(response)
    }

    fn channel_failed(&self) {
        if self.health.record_failure() {
            self.resolver.invalidate();
            self.tokens.invalidate();
        }
    }
}

impl std::fmt::Debug for AdminApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdminApi")
            .field("realm", &self.realm)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_cannot_escape_the_users_path() {
        assert!(check_id("7f0c2a1e-1111-4a4a-9b9b-000000000001").is_ok());
        assert!(check_id("fallback-abc").is_ok());
        assert!(check_id("").is_err());
        assert!(check_id("../roles").is_err());
        assert!(check_id("a/b").is_err());
        assert!(check_id("a?x=1").is_err());
        assert!(check_id("..").is_err());
        assert!(check_id("%2e%2e").is_err());
    }
}
