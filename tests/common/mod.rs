//! In-process mock IdP for integration tests
//!
//! Serves the discovery document, token, introspection, userinfo and the
//! users management API on an ephemeral port. Counters and switches on
//! [`MockState`] let tests observe and steer the IdP.

#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Form, Json, Router,
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::net::TcpListener;

use idp_gateway::config::Config;
use idp_gateway::gateway::Gateway;

pub const REALM: &str = "school";
pub const CLIENT_ID: &str = "web-api";
pub const CLIENT_SECRET: &str = "web-api-secret";
pub const ADMIN_USER: &str = "admin";
pub const ADMIN_PASSWORD: &str = "admin-pass";
pub const ADMIN_CLIENT_SECRET: &str = "svc-secret";

/// 2100-01-01
pub const FAR_FUTURE: u64 = 4_102_444_800;

/// Observable, steerable IdP state
pub struct MockState {
    pub discovery_hits: AtomicUsize,
    pub token_requests: AtomicUsize,
    pub admin_calls: AtomicUsize,
    pub userinfo_hits: AtomicUsize,
    /// Discovery answers 404
    pub discovery_broken: AtomicBool,
    /// Discovery answers 200 with an HTML body
    pub discovery_garbage: AtomicBool,
    /// Discovery only served under `/auth`
    pub legacy_only: AtomicBool,
    /// Token endpoint rejects every admin grant
    pub admin_down: AtomicBool,
    /// Management API rejects admin tokens with 401
    pub reject_admin_tokens: AtomicBool,
    /// Single-user reads answer 500
    pub readback_broken: AtomicBool,
    /// `expires_in` of issued admin tokens; 0 omits the field
    pub expires_in: AtomicU64,
    pub token_delay_ms: AtomicU64,
    pub users: Mutex<Vec<Value>>,
    pub callers: Mutex<HashMap<String, Value>>,
    pub passwords: Mutex<HashMap<String, (String, bool)>>,
    /// Login credentials: username to (password, one-time code)
    pub logins: Mutex<HashMap<String, (String, Option<String>)>>,
    next_id: AtomicUsize,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            discovery_hits: AtomicUsize::new(0),
            token_requests: AtomicUsize::new(0),
            admin_calls: AtomicUsize::new(0),
            userinfo_hits: AtomicUsize::new(0),
            discovery_broken: AtomicBool::new(false),
            discovery_garbage: AtomicBool::new(false),
            legacy_only: AtomicBool::new(false),
            admin_down: AtomicBool::new(false),
            reject_admin_tokens: AtomicBool::new(false),
            readback_broken: AtomicBool::new(false),
            expires_in: AtomicU64::new(300),
            token_delay_ms: AtomicU64::new(0),
            users: Mutex::new(Vec::new()),
            callers: Mutex::new(HashMap::new()),
            passwords: Mutex::new(HashMap::new()),
            logins: Mutex::new(HashMap::new()),
            next_id: AtomicUsize::new(1),
        }
    }
}

type Shared = Arc<MockState>;

pub struct MockIdp {
    pub base_url: String,
    pub state: Shared,
}

impl MockIdp {
    pub async fn start() -> Self {
        Self::start_with(MockState::default()).await
    }

    pub async fn start_with(state: MockState) -> Self {
        let state = Arc::new(state);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn set(&self, flag: &AtomicBool, value: bool) {
        flag.store(value, Ordering::SeqCst);
    }

    pub fn discovery_hits(&self) -> usize {
        self.state.discovery_hits.load(Ordering::SeqCst)
    }

    pub fn token_requests(&self) -> usize {
        self.state.token_requests.load(Ordering::SeqCst)
    }

    pub fn admin_calls(&self) -> usize {
        self.state.admin_calls.load(Ordering::SeqCst)
    }

    pub fn userinfo_hits(&self) -> usize {
        self.state.userinfo_hits.load(Ordering::SeqCst)
    }

    /// Accept a password login for `username`, optionally requiring `totp`
    pub fn add_login(&self, username: &str, password: &str, totp: Option<&str>) {
        self.state.logins.lock().insert(
            username.to_string(),
            (password.to_string(), totp.map(str::to_string)),
        );
    }

    /// Register an active caller token for `sub` with the given realm roles
    pub fn caller(&self, sub: &str, roles: &[&str]) -> String {
        self.caller_with(
            sub,
            json!({
                "username": format!("{sub}@example.com"),
                "email": format!("{sub}@example.com"),
                "exp": FAR_FUTURE,
                "realm_access": {"roles": roles},
            }),
        )
    }

    /// Register an active caller token for `sub` with custom claims
    pub fn caller_with(&self, sub: &str, claims: Value) -> String {
        let mut claims = claims;
        claims["sub"] = json!(sub);
        let token = compact_token(&claims);
        self.state.callers.lock().insert(token.clone(), claims);
        token
    }

    /// Insert a user straight into the IdP
    pub fn add_user(&self, id: &str, email: &str, owner: &str) {
        self.state.users.lock().push(json!({
            "id": id,
            "username": email,
            "email": email,
            "firstName": "Seeded",
            "lastName": id,
            "enabled": true,
            "attributes": {"created_by": [owner], "professor_id": [owner]},
            "createdTimestamp": 1_700_000_000_000_i64,
        }));
    }

    pub fn user(&self, id: &str) -> Option<Value> {
        self.state
            .users
            .lock()
            .iter()
            .find(|u| u["id"] == id)
            .cloned()
    }

    pub fn user_count(&self) -> usize {
        self.state.users.lock().len()
    }
}

/// `header.payload.signature` with a base64url JSON payload
pub fn compact_token(claims: &Value) -> String {
    format!(
        "{}.{}.{}",
        URL_SAFE_NO_PAD.encode(r#"{"alg":"RS256","typ":"JWT"}"#),
        URL_SAFE_NO_PAD.encode(claims.to_string()),
        URL_SAFE_NO_PAD.encode("signature"),
    )
}

/// Configuration pointing at `base_url`, with the store under `store_dir`
pub fn config(base_url: &str, store_dir: &Path) -> Config {
    let mut config = Config::default();
    config.idp.base_url = base_url.to_string();
    config.idp.realm = REALM.to_string();
    config.idp.client_id = CLIENT_ID.to_string();
    config.idp.client_secret = Some(CLIENT_SECRET.to_string());
    config.idp.try_legacy_paths = false;
    config.admin.username = Some(ADMIN_USER.to_string());
    config.admin.password = Some(ADMIN_PASSWORD.to_string());
    config.http.timeout = Duration::from_secs(5);
    config.http.discovery_timeout = Duration::from_secs(2);
    config.fallback.path = store_dir.join("fallback_users.json");
    config
}

pub async fn gateway(config: &Config) -> Gateway {
    Gateway::from_config(config).await.unwrap()
}

fn router(state: Shared) -> Router {
    Router::new()
        .route("/realms/{realm}/.well-known/openid-configuration", get(discovery))
        .route(
            "/auth/realms/{realm}/.well-known/openid-configuration",
            get(legacy_discovery),
        )
        .route("/realms/{realm}/protocol/openid-connect/token", post(token))
        .route(
            "/realms/{realm}/protocol/openid-connect/token/introspect",
            post(introspect),
        )
        .route("/realms/{realm}/protocol/openid-connect/userinfo", get(userinfo))
        .route("/admin/realms/{realm}/users", get(list_users).post(create_user))
        .route(
            "/admin/realms/{realm}/users/{id}",
            get(get_user).put(put_user).delete(delete_user),
        )
        .route(
            "/admin/realms/{realm}/users/{id}/reset-password",
            put(reset_password),
        )
        .with_state(state)
}

// ============================================================================
// Discovery and tokens
// ============================================================================

fn discovery_document(realm: &str) -> Response {
    Json(json!({
        "issuer": format!("http://mock/realms/{realm}"),
        "token_endpoint": format!("http://mock/realms/{realm}/protocol/openid-connect/token"),
        "userinfo_endpoint": format!("http://mock/realms/{realm}/protocol/openid-connect/userinfo"),
    }))
    .into_response()
}

async fn discovery(State(s): State<Shared>, UrlPath(realm): UrlPath<String>) -> Response {
    s.discovery_hits.fetch_add(1, Ordering::SeqCst);
    if s.discovery_broken.load(Ordering::SeqCst) || s.legacy_only.load(Ordering::SeqCst) {
        return StatusCode::NOT_FOUND.into_response();
    }
    if s.discovery_garbage.load(Ordering::SeqCst) {
        return (StatusCode::OK, "<html>login</html>").into_response();
    }
    discovery_document(&realm)
}

async fn legacy_discovery(State(s): State<Shared>, UrlPath(realm): UrlPath<String>) -> Response {
    s.discovery_hits.fetch_add(1, Ordering::SeqCst);
    if s.legacy_only.load(Ordering::SeqCst) {
        discovery_document(&realm)
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

async fn token(
    State(s): State<Shared>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let n = s.token_requests.fetch_add(1, Ordering::SeqCst) + 1;
    let delay = s.token_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }

    let field = |name: &str| form.get(name).map(String::as_str);
    let admin_grant = !s.admin_down.load(Ordering::SeqCst)
        && match field("grant_type") {
            Some("password") => {
                field("username") == Some(ADMIN_USER) && field("password") == Some(ADMIN_PASSWORD)
            }
            Some("client_credentials") => field("client_secret") == Some(ADMIN_CLIENT_SECRET),
            _ => false,
        };
    if admin_grant {
        let mut body = json!({"access_token": format!("admin-token-{n}"), "token_type": "Bearer"});
        let expires_in = s.expires_in.load(Ordering::SeqCst);
        if expires_in > 0 {
            body["expires_in"] = json!(expires_in);
        }
        return Json(body).into_response();
    }

    let user_login = field("grant_type") == Some("password")
        && field("client_id") == Some(CLIENT_ID)
        && field("client_secret") == Some(CLIENT_SECRET);
    let username = field("username").unwrap_or_default();
    let known = user_login
        && s.logins
            .lock()
            .get(username)
            .is_some_and(|(password, totp)| {
                field("password") == Some(password.as_str())
                    && totp.as_deref().is_none_or(|code| field("totp") == Some(code))
            });
    if known {
        let claims = json!({
            "sub": format!("sub-{username}"),
            "username": username,
            "email": username,
            "exp": FAR_FUTURE,
            "realm_access": {"roles": ["alumno"]},
        });
        let access_token = compact_token(&claims);
        s.callers.lock().insert(access_token.clone(), claims);
        return Json(json!({
            "access_token": access_token,
            "refresh_token": format!("refresh-{n}"),
            "token_type": "Bearer",
            "expires_in": 300,
        }))
        .into_response();
    }

    (
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": "invalid_grant"})),
    )
        .into_response()
}

async fn introspect(
    State(s): State<Shared>,
    Form(form): Form<HashMap<String, String>>,
) -> Response {
    let claims = form
        .get("token")
        .and_then(|t| s.callers.lock().get(t).cloned());
    match claims {
        Some(mut claims) => {
            claims["active"] = json!(true);
            Json(claims).into_response()
        }
        None => Json(json!({"active": false})).into_response(),
    }
}

fn bearer(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_string)
}

async fn userinfo(State(s): State<Shared>, headers: HeaderMap) -> Response {
    s.userinfo_hits.fetch_add(1, Ordering::SeqCst);
    let claims = bearer(&headers).and_then(|t| s.callers.lock().get(&t).cloned());
    match claims {
        Some(claims) => Json(json!({
            "sub": claims["sub"],
            "preferred_username": claims["username"],
            "email": claims["email"],
            "given_name": "Given",
            "family_name": "Family",
        }))
        .into_response(),
        None => StatusCode::UNAUTHORIZED.into_response(),
    }
}

// ============================================================================
// Management API
// ============================================================================

fn admin_authorized(s: &MockState, headers: &HeaderMap) -> bool {
    s.admin_calls.fetch_add(1, Ordering::SeqCst);
    !s.reject_admin_tokens.load(Ordering::SeqCst)
        && bearer(headers).is_some_and(|t| t.starts_with("admin-token-"))
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({"error": "User not found"})),
    )
        .into_response()
}

async fn list_users(
    State(s): State<Shared>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    if !admin_authorized(&s, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let owner = query
        .get("q")
        .and_then(|q| q.strip_prefix("created_by:"))
        .map(str::to_string);
    let username = query.get("username").cloned();

    let users: Vec<Value> = s
        .users
        .lock()
        .iter()
        .filter(|u| owner.as_ref().is_none_or(|o| u["attributes"]["created_by"][0] == *o))
        .filter(|u| username.as_ref().is_none_or(|n| u["username"] == *n))
        .cloned()
        .collect();
    Json(users).into_response()
}

async fn create_user(
    State(s): State<Shared>,
    headers: HeaderMap,
    UrlPath(realm): UrlPath<String>,
    Json(mut user): Json<Value>,
) -> Response {
    if !admin_authorized(&s, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let username = user["username"]
        .as_str()
        .or_else(|| user["email"].as_str())
        .unwrap_or_default()
        .to_string();
    if s.users.lock().iter().any(|u| u["username"] == username.as_str()) {
        return (
            StatusCode::CONFLICT,
            Json(json!({"errorMessage": "User exists with same username"})),
        )
            .into_response();
    }

    let id = format!("kc-{}", s.next_id.fetch_add(1, Ordering::SeqCst));
    if let Some(credentials) = user
        .as_object_mut()
        .and_then(|u| u.remove("credentials"))
    {
        let credential = &credentials[0];
        s.passwords.lock().insert(
            id.clone(),
            (
                credential["value"].as_str().unwrap_or_default().to_string(),
                credential["temporary"].as_bool().unwrap_or(false),
            ),
        );
    }
    user["id"] = json!(id);
    user["username"] = json!(username);
    user["createdTimestamp"] = json!(1_700_000_000_000_i64);
    s.users.lock().push(user);

    (
        StatusCode::CREATED,
        [(header::LOCATION, format!("http://mock/admin/realms/{realm}/users/{id}"))],
    )
        .into_response()
}

async fn get_user(
    State(s): State<Shared>,
    headers: HeaderMap,
    UrlPath((_realm, id)): UrlPath<(String, String)>,
) -> Response {
    if !admin_authorized(&s, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if s.readback_broken.load(Ordering::SeqCst) {
        return StatusCode::INTERNAL_SERVER_ERROR.into_response();
    }
    let user = s.users.lock().iter().find(|u| u["id"] == id.as_str()).cloned();
    match user {
        Some(user) => Json(user).into_response(),
        None => not_found(),
    }
}

async fn put_user(
    State(s): State<Shared>,
    headers: HeaderMap,
    UrlPath((_realm, id)): UrlPath<(String, String)>,
    Json(update): Json<Value>,
) -> Response {
    if !admin_authorized(&s, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut users = s.users.lock();
    match users.iter_mut().find(|u| u["id"] == id.as_str()) {
        Some(user) => {
            if let (Some(target), Some(fields)) = (user.as_object_mut(), update.as_object()) {
                for (key, value) in fields {
                    target.insert(key.clone(), value.clone());
                }
            }
            StatusCode::NO_CONTENT.into_response()
        }
        None => not_found(),
    }
}

async fn delete_user(
    State(s): State<Shared>,
    headers: HeaderMap,
    UrlPath((_realm, id)): UrlPath<(String, String)>,
) -> Response {
    if !admin_authorized(&s, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let mut users = s.users.lock();
    let before = users.len();
    users.retain(|u| u["id"] != id.as_str());
    if users.len() == before {
        not_found()
    } else {
        StatusCode::NO_CONTENT.into_response()
    }
}

async fn reset_password(
    State(s): State<Shared>,
    headers: HeaderMap,
    UrlPath((_realm, id)): UrlPath<(String, String)>,
    Json(body): Json<Value>,
) -> Response {
    if !admin_authorized(&s, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if !s.users.lock().iter().any(|u| u["id"] == id.as_str()) {
        return not_found();
    }
    s.passwords.lock().insert(
        id,
        (
            body["value"].as_str().unwrap_or_default().to_string(),
            body["temporary"].as_bool().unwrap_or(false),
        ),
    );
    StatusCode::NO_CONTENT.into_response()
}
