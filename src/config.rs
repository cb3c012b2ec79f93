//! Configuration management

use std::{
    env,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// `${VAR}` or `${VAR:-default}`
static ENV_VAR_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").expect("env var pattern is valid")
});

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order; variables already set win.
    pub env_files: Vec<String>,
    /// Identity provider connection
    pub idp: IdpConfig,
    /// Privileged (admin) channel
    pub admin: AdminConfig,
    /// Outbound HTTP behaviour
    pub http: HttpConfig,
    /// Degraded-mode store
    pub fallback: FallbackConfig,
    /// Authorization rules
    pub authorization: AuthorizationConfig,
    /// Channel health tracking
    pub health: HealthConfig,
}

/// Identity provider connection
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdpConfig {
    /// Primary base URL
    pub base_url: String,
    /// Alternative base URLs, tried in order after the primary
    pub alternatives: Vec<String>,
    /// Realm serving application users
    pub realm: String,
    /// Client id of this gateway
    pub client_id: String,
    /// Client secret (supports `env:VAR_NAME`), used for introspection
    pub client_secret: Option<String>,
    /// Also try `{base}/auth` for every candidate lacking an `/auth` segment
    pub try_legacy_paths: bool,
}

impl Default for IdpConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8080".to_string(),
            alternatives: Vec::new(),
            realm: "master".to_string(),
            client_id: "idp-gateway".to_string(),
            client_secret: None,
            try_legacy_paths: true,
        }
    }
}

impl IdpConfig {
    /// Resolved client secret
    #[must_use]
    pub fn client_secret(&self) -> Option<String> {
        self.client_secret.as_deref().map(resolve_secret)
    }
}

/// Grant used to obtain the admin token
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminGrant {
    /// Resource owner password grant with admin credentials
    #[default]
    Password,
    /// Service account of a confidential client
    ClientCredentials,
}

impl AdminGrant {
    /// Wire value of `grant_type`
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Password => "password",
            Self::ClientCredentials => "client_credentials",
        }
    }
}

/// Privileged channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Realm the admin account lives in
    pub realm: String,
    /// Client used for the token request
    pub client_id: String,
    /// Grant type
    pub grant: AdminGrant,
    /// Admin username (supports `env:VAR_NAME`)
    pub username: Option<String>,
    /// Admin password (supports `env:VAR_NAME`)
    pub password: Option<String>,
    /// Client secret for `client_credentials` (supports `env:VAR_NAME`)
    pub client_secret: Option<String>,
    /// Subtracted from `expires_in` so tokens are renewed before the IdP rejects them
    #[serde(with = "humantime_serde")]
    pub safety_margin: Duration,
    /// Lifetime assumed when the token response has no `expires_in`
    #[serde(with = "humantime_serde")]
    pub default_expires_in: Duration,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            realm: "master".to_string(),
            client_id: "admin-cli".to_string(),
            grant: AdminGrant::Password,
            username: None,
            password: None,
            client_secret: None,
            safety_margin: Duration::from_secs(30),
            default_expires_in: Duration::from_secs(60),
        }
    }
}

impl AdminConfig {
    /// Resolved username
    #[must_use]
    pub fn username(&self) -> Option<String> {
        self.username.as_deref().map(resolve_secret)
    }

    /// Resolved password
    #[must_use]
    pub fn password(&self) -> Option<String> {
        self.password.as_deref().map(resolve_secret)
    }

    /// Resolved client secret
    #[must_use]
    pub fn client_secret(&self) -> Option<String> {
        self.client_secret.as_deref().map(resolve_secret)
    }
}

/// Outbound HTTP configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    /// Timeout for every IdP request
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Timeout for a single discovery request
    #[serde(with = "humantime_serde")]
    pub discovery_timeout: Duration,
    /// Verify TLS certificates
    pub verify_tls: bool,
    /// Extra CA certificate (PEM)
    pub ca_cert_path: Option<PathBuf>,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            discovery_timeout: Duration::from_secs(5),
            verify_tls: true,
            ca_cert_path: None,
        }
    }
}

/// Degraded-mode store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FallbackConfig {
    /// Serve user management from the local store when the admin channel fails
    pub enabled: bool,
    /// Store file. Supports ~ expansion.
    pub path: PathBuf,
    /// Return one illustrative record when a caller owns nothing
    pub synthesize_example: bool,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        let path = dirs::data_local_dir().map_or_else(
            || PathBuf::from("fallback_users.json"),
            |dir| dir.join("idp-gateway").join("fallback_users.json"),
        );
        Self {
            enabled: true,
            path,
            synthesize_example: true,
        }
    }
}

/// Authorization configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthorizationConfig {
    /// Administrative roles; empty keeps `admin` and `realm-admin`
    pub admin_roles: Vec<String>,
}

/// Channel health configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Consecutive privileged-channel failures before cached state is dropped
    pub failure_threshold: u32,
    /// How long an unhealthy channel refuses calls before one trial call
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
        }
    }
}

/// Resolve `env:VAR_NAME` references; other values are returned unchanged.
#[must_use]
pub fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

fn expand_home(path: &str) -> String {
    if path.starts_with('~') {
        if let Some(home) = dirs::home_dir() {
            return path.replacen('~', &home.display().to_string(), 1);
        }
    }
    path.to_string()
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // IDP_GATEWAY_ADMIN__USERNAME -> admin.username
        figment = figment.merge(Env::prefixed("IDP_GATEWAY_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Reject configurations the gateway cannot run with
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for an empty or unparsable base URL, an
    /// empty realm, or a zero failure threshold.
    pub fn validate(&self) -> Result<()> {
        if self.idp.base_url.trim().is_empty() {
            return Err(Error::Config("idp.base_url must not be empty".to_string()));
        }
        for candidate in std::iter::once(&self.idp.base_url).chain(&self.idp.alternatives) {
            url::Url::parse(candidate)
                .map_err(|e| Error::Config(format!("Invalid IdP URL {candidate}: {e}")))?;
        }
        if self.idp.realm.trim().is_empty() {
            return Err(Error::Config("idp.realm must not be empty".to_string()));
        }
        if self.admin.realm.trim().is_empty() {
            return Err(Error::Config("admin.realm must not be empty".to_string()));
        }
        if self.health.failure_threshold == 0 {
            return Err(Error::Config(
                "health.failure_threshold must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = expand_home(path_str);
            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand `${VAR}` and `${VAR:-default}` in URLs, credentials and paths
    fn expand_env_vars(&mut self) {
        self.idp.base_url = expand_string(&self.idp.base_url);
        for alt in &mut self.idp.alternatives {
            *alt = expand_string(alt);
        }
        for secret in [
            &mut self.idp.client_secret,
            &mut self.admin.username,
            &mut self.admin.password,
            &mut self.admin.client_secret,
        ]
        .into_iter()
        .flatten()
        {
            *secret = expand_string(secret);
        }

        let path = expand_string(&self.fallback.path.to_string_lossy());
        self.fallback.path = PathBuf::from(expand_home(&path));
    }

    /// Candidate base URLs in priority order: primary first, then alternatives.
    /// Duplicates and trailing slashes are removed.
    #[must_use]
    pub fn candidate_urls(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for url in std::iter::once(&self.idp.base_url).chain(&self.idp.alternatives) {
            let url = url.trim().trim_end_matches('/').to_string();
            if !url.is_empty() && !seen.contains(&url) {
                seen.push(url);
            }
        }
        seen
    }
}

/// Expand environment variables in a string
fn expand_string(value: &str) -> String {
    ENV_VAR_PATTERN
        .replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
}

/// Human-readable `Duration` serde (`"30s"`, `"5m"`, `"1h"`, `"250ms"`, bare seconds)
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize a Duration as seconds, or milliseconds when sub-second
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string or a number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Secs(u64),
            Text(String),
        }

        let s = match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => return Ok(Duration::from_secs(secs)),
            Raw::Text(s) => s,
        };
        let s = s.trim();

        let parse = |n: &str| -> Result<u64, D::Error> {
            n.trim().parse::<u64>().map_err(serde::de::Error::custom)
        };
        let scaled = |n: &str, unit: u64| -> Result<Duration, D::Error> {
            parse(n)?
                .checked_mul(unit)
                .map(Duration::from_secs)
                .ok_or_else(|| serde::de::Error::custom(format!("duration out of range: {s}")))
        };
        if let Some(ms) = s.strip_suffix("ms") {
            parse(ms).map(Duration::from_millis)
        } else if let Some(secs) = s.strip_suffix('s') {
            scaled(secs, 1)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins, 60)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours, 3600)
        } else {
            scaled(s, 1)
        }
    }
}
