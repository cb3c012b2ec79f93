//! Token claims
//!
//! [`RawClaims`] mirrors what the IdP puts on the wire (an introspection
//! response or the payload segment of a compact token). [`TokenClaims`] is the
//! validated, per-request view the gateway authorizes against.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Deserializer, Serialize};

/// Role list wrapper used by `realm_access` and `resource_access` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleSet {
    /// Role names
    #[serde(default)]
    pub roles: Vec<String>,
}

/// Claims exactly as the IdP returns them.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawClaims {
    /// Introspection `active` flag (absent in compact token payloads)
    #[serde(default)]
    pub active: Option<bool>,
    /// Subject
    #[serde(default)]
    pub sub: Option<String>,
    /// Username (introspection)
    #[serde(default)]
    pub username: Option<String>,
    /// Username (token payload / userinfo)
    #[serde(default)]
    pub preferred_username: Option<String>,
    /// Email
    #[serde(default)]
    pub email: Option<String>,
    /// Expiry (Unix seconds)
    #[serde(default)]
    pub exp: Option<u64>,
    /// Realm-scoped roles
    #[serde(default)]
    pub realm_access: Option<RoleSet>,
    /// Client-scoped roles keyed by client id
    #[serde(default)]
    pub resource_access: BTreeMap<String, RoleSet>,
    /// Owner reference custom claim
    #[serde(default, deserialize_with = "deserialize_first")]
    pub created_by: Option<String>,
    /// Linked professor custom claim
    #[serde(default, deserialize_with = "deserialize_first")]
    pub professor_id: Option<String>,
}

/// Custom attributes are mapped into tokens either as a plain string or as a
/// list, depending on the mapper's "multivalued" setting.
fn deserialize_first<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    let value = match Option::<StringOrVec>::deserialize(deserializer)? {
        Some(StringOrVec::String(s)) => Some(s),
        Some(StringOrVec::Vec(v)) => v.into_iter().next(),
        None => None,
    };
    Ok(value.filter(|s| !s.is_empty()))
}

impl RawClaims {
    /// Whether an introspection response marked the token active.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.unwrap_or(false)
    }

    /// Convert into validated claims. Returns `None` without a subject.
    #[must_use]
    pub fn into_claims(self) -> Option<TokenClaims> {
        let subject = self.sub.filter(|s| !s.is_empty())?;
        Some(TokenClaims {
            subject,
            username: self.username.or(self.preferred_username),
            email: self.email,
            expires_at: self.exp,
            realm_roles: self.realm_access.map(|r| r.roles).unwrap_or_default(),
            client_roles: self
                .resource_access
                .into_iter()
                .map(|(client, set)| (client, set.roles))
                .collect(),
            owner: self.created_by,
            professor: self.professor_id,
        })
    }
}

/// Claims of a token the IdP has confirmed as active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TokenClaims {
    /// Subject id
    pub subject: String,
    /// Username, when present
    pub username: Option<String>,
    /// Email, when present
    pub email: Option<String>,
    /// Expiry (Unix seconds)
    pub expires_at: Option<u64>,
    /// Realm-scoped roles
    pub realm_roles: Vec<String>,
    /// Client-scoped roles keyed by client id
    pub client_roles: BTreeMap<String, Vec<String>>,
    /// Identity that created this subject (`created_by`)
    pub owner: Option<String>,
    /// Linked professor (`professor_id`)
    pub professor: Option<String>,
}

impl TokenClaims {
    /// Claims for `subject` with no roles or attributes.
    #[must_use]
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            username: None,
            email: None,
            expires_at: None,
            realm_roles: Vec::new(),
            client_roles: BTreeMap::new(),
            owner: None,
            professor: None,
        }
    }

    /// Add realm roles.
    #[must_use]
    pub fn with_realm_roles<I, S>(mut self, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.realm_roles.extend(roles.into_iter().map(Into::into));
        self
    }

    /// Add roles scoped to `client_id`.
    #[must_use]
    pub fn with_client_roles<I, S>(mut self, client_id: &str, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.client_roles
            .entry(client_id.to_string())
            .or_default()
            .extend(roles.into_iter().map(Into::into));
        self
    }

    /// Union of realm roles and the roles scoped to the serving client.
    #[must_use]
    pub fn effective_roles(&self, client_id: &str) -> BTreeSet<&str> {
        let client = self
            .client_roles
            .get(client_id)
            .into_iter()
            .flatten()
            .map(String::as_str);
        self.realm_roles.iter().map(String::as_str).chain(client).collect()
    }

    /// Realm roles plus the roles of every client in the token.
    #[must_use]
    pub fn all_roles(&self) -> BTreeSet<&str> {
        let clients = self.client_roles.values().flatten().map(String::as_str);
        self.realm_roles.iter().map(String::as_str).chain(clients).collect()
    }
}
