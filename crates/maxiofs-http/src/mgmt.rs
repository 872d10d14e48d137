//! The management REST API.
//!
//! Session-authenticated JSON surface consumed by the console: tenants,
//! users, access keys, buckets, cluster membership, replication rules, and
//! dynamic settings. Every mutating call appends an audit record. Login
//! goes through the [`crate::identity::IdentityStore`] seam; sessions are
//! bearer tokens with a TTL from the dynamic settings.

use std::sync::Arc;

use bytes::Bytes;
use dashmap::DashMap;
use http::{HeaderMap, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_cluster::manager::new_peer;
use maxiofs_cluster::replication::validate_rule;
use maxiofs_core::types::{
    AccessKey, AuditRecord, Bucket, ClusterNode, ReplicationRule, Role, Tenant, Tombstone, User,
};
use maxiofs_core::{DynamicSettings, Error, Result, ids};
use maxiofs_meta::keys;

use crate::body::ResponseBody;
use crate::identity::hash_password;
use crate::metrics;
use crate::s3::headers::http_date;
use crate::state::AppState;

type Response = http::Response<ResponseBody>;

// ---------------------------------------------------------------------------
// Sessions
// ---------------------------------------------------------------------------

/// One console session.
#[derive(Debug, Clone)]
pub struct Session {
    /// Bearer token.
    pub token: String,
    /// Logged-in user.
    pub user_id: Uuid,
    /// Login name, for audit records.
    pub username: String,
    /// Tenant scope; `None` for global accounts.
    pub tenant_id: Option<Uuid>,
    /// Whether the user is a global admin.
    pub is_global_admin: bool,
    /// Expiry, epoch seconds.
    pub expires_at: i64,
}

/// In-memory session registry.
#[derive(Debug, Default)]
pub struct SessionStore {
    sessions: DashMap<String, Session>,
}

impl SessionStore {
    /// An empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for `user` with the given TTL.
    pub fn create(&self, user: &User, ttl_secs: u64) -> Session {
        let session = Session {
            token: ids::random_token(32),
            user_id: user.id,
            username: user.username.clone(),
            tenant_id: user.tenant_id,
            is_global_admin: user.is_global_admin(),
            expires_at: ids::now_secs() + i64::try_from(ttl_secs).unwrap_or(3600),
        };
        self.sessions.insert(session.token.clone(), session.clone());
        session
    }

    /// Resolve a live session; expired entries are swept on access.
    #[must_use]
    pub fn get(&self, token: &str) -> Option<Session> {
        let session = self.sessions.get(token)?.clone();
        if session.expires_at <= ids::now_secs() {
            drop(self.sessions.remove(token));
            return None;
        }
        Some(session)
    }

    /// Drop a session (logout).
    pub fn remove(&self, token: &str) {
        self.sessions.remove(token);
    }
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// The hyper service for the management listener.
#[derive(Debug, Clone)]
pub struct MgmtService {
    state: Arc<AppState>,
}

impl MgmtService {
    /// Build the service over shared state.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }
}

impl hyper::service::Service<http::Request<hyper::body::Incoming>> for MgmtService {
    type Response = Response;
    type Error = std::convert::Infallible;
    type Future = std::pin::Pin<
        Box<dyn std::future::Future<Output = std::result::Result<Response, Self::Error>> + Send>,
    >;

    fn call(&self, req: http::Request<hyper::body::Incoming>) -> Self::Future {
        let state = Arc::clone(&self.state);
        Box::pin(async move {
            use http_body_util::BodyExt;
            let (parts, incoming) = req.into_parts();
            let body = match incoming.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(_) => Bytes::new(),
            };
            Ok(handle(&state, &parts, body).await)
        })
    }
}

/// Serve one management request over an already-collected body.
pub async fn handle(state: &Arc<AppState>, parts: &http::request::Parts, body: Bytes) -> Response {
    let path = parts.uri.path().to_owned();
    match path.as_str() {
        "/health" => {
            return json_response(StatusCode::OK, &json!({"status": "ok"}));
        }
        "/ready" => {
            return json_response(StatusCode::OK, &json!({"status": "ready"}));
        }
        "/metrics" => return metrics::response(state),
        _ => {}
    }

    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let result = route(state, parts, &segments, body).await;
    result.unwrap_or_else(|err| {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        json_response(status, &json!({"error": err.to_string(), "code": err.s3_code()}))
    })
}

async fn route(
    state: &Arc<AppState>,
    parts: &http::request::Parts,
    segments: &[&str],
    body: Bytes,
) -> Result<Response> {
    let method = &parts.method;

    // Login is the only unauthenticated API route.
    if segments == ["api", "auth", "login"] && method == http::Method::POST {
        return login(state, parts, &body);
    }

    let session = authenticate(state, &parts.headers)?;

    match (method.as_str(), segments) {
        ("GET", ["api", "auth", "me"]) => json_ok(&json!({
            "id": session.user_id,
            "username": session.username,
            "tenantId": session.tenant_id,
            "globalAdmin": session.is_global_admin,
        })),
        ("POST", ["api", "auth", "logout"]) => {
            state.sessions.remove(&session.token);
            json_ok(&json!({"status": "ok"}))
        }

        // Tenants (global admin only).
        ("GET", ["api", "tenants"]) => {
            require_global_admin(&session)?;
            let tenants: Vec<Tenant> = state.meta.scan_values("tenant:")?;
            json_ok(&tenants)
        }
        ("POST", ["api", "tenants"]) => create_tenant(state, &session, parts, &body),
        ("GET", ["api", "tenants", id]) => {
            require_global_admin(&session)?;
            json_ok(&load_tenant(state, id)?)
        }
        ("PUT", ["api", "tenants", id]) => update_tenant(state, &session, parts, id, &body),
        ("DELETE", ["api", "tenants", id]) => delete_tenant(state, &session, parts, id),
        ("GET", ["api", "tenants", id, "stats"]) => {
            require_global_admin(&session)?;
            let tenant = load_tenant(state, id)?;
            json_ok(&json!({
                "usedBytes": tenant.used_bytes,
                "maxBytes": tenant.max_bytes,
                "usedBuckets": tenant.used_buckets,
                "maxBuckets": tenant.max_buckets,
                "usedKeys": tenant.used_keys,
                "maxKeys": tenant.max_keys,
            }))
        }

        // Users.
        ("GET", ["api", "users"]) => {
            let users: Vec<User> = state.meta.scan_values("user:")?;
            let visible: Vec<serde_json::Value> = users
                .iter()
                .filter(|u| session.is_global_admin || u.tenant_id == session.tenant_id)
                .map(user_json)
                .collect();
            json_ok(&visible)
        }
        ("POST", ["api", "users"]) => create_user(state, &session, parts, &body),
        ("GET", ["api", "users", id]) => {
            let user = load_user(state, id)?;
            authorize_tenant_scope(&session, user.tenant_id)?;
            json_ok(&user_json(&user))
        }
        ("DELETE", ["api", "users", id]) => delete_user(state, &session, parts, id),
        ("POST", ["api", "users", id, "unlock"]) => {
            let user = load_user(state, id)?;
            authorize_tenant_scope(&session, user.tenant_id)?;
            state.identity.unlock(user.id)?;
            audit(state, &session, parts, "user.unlock", &user.username, "ok");
            json_ok(&json!({"status": "ok"}))
        }

        // Access keys.
        ("GET", ["api", "access-keys"]) => {
            let all: Vec<AccessKey> = state.meta.scan_values(&keys::access_key_prefix())?;
            let visible: Vec<serde_json::Value> = all
                .iter()
                .filter(|k| session.is_global_admin || k.tenant_id == session.tenant_id)
                .map(|k| {
                    json!({
                        "id": k.id,
                        "accessKeyId": k.access_key_id,
                        "userId": k.user_id,
                        "tenantId": k.tenant_id,
                    })
                })
                .collect();
            json_ok(&visible)
        }
        ("POST", ["api", "access-keys"]) => create_access_key(state, &session, parts, &body),
        ("DELETE", ["api", "access-keys", access_key_id]) => {
            delete_access_key(state, &session, parts, access_key_id)
        }

        // Buckets.
        ("GET", ["api", "buckets"]) => {
            let scope = if session.is_global_admin {
                None
            } else {
                session.tenant_id
            };
            json_ok(&state.engine.list_buckets(scope)?)
        }
        ("GET", ["api", "buckets", name]) => {
            let bucket = authorize_bucket(state, &session, name)?;
            json_ok(&bucket)
        }
        ("DELETE", ["api", "buckets", name]) => {
            authorize_bucket(state, &session, name)?;
            state.engine.delete_bucket(name).await?;
            state.router.invalidate(name);
            audit(state, &session, parts, "bucket.delete", name, "ok");
            json_ok(&json!({"status": "deleted"}))
        }
        ("GET", ["api", "buckets", name, "stats"]) => {
            authorize_bucket(state, &session, name)?;
            json_ok(&state.engine.bucket_stats(name)?)
        }
        ("GET", ["api", "buckets", name, "objects"]) => {
            authorize_bucket(state, &session, name)?;
            list_bucket_objects(state, parts, name)
        }
        ("GET", ["api", "buckets", name, "objects", "presign"]) => {
            authorize_bucket(state, &session, name)?;
            presign_object(state, &session, parts, name)
        }
        ("DELETE", ["api", "buckets", name, "objects"]) => {
            authorize_bucket(state, &session, name)?;
            delete_bucket_object(state, &session, parts, name).await
        }

        // Cluster.
        ("POST", ["api", "cluster", "initialize"]) => {
            require_global_admin(&session)?;
            let config = state.manager.initialize()?;
            audit(state, &session, parts, "cluster.initialize", "cluster", "ok");
            json_ok(&json!({
                "nodeId": config.node_id,
                "nodeToken": config.node_token,
            }))
        }
        ("GET", ["api", "cluster", "config"]) => {
            require_global_admin(&session)?;
            let config = state.manager.this_node();
            json_ok(&json!({
                "nodeId": config.node_id,
                "name": config.name,
                "region": config.region,
                "initialized": config.initialized_at.is_some(),
            }))
        }
        ("GET", ["api", "cluster", "nodes"]) => {
            require_global_admin(&session)?;
            json_ok(&state.manager.list_peers()?)
        }
        ("POST", ["api", "cluster", "nodes"]) => add_cluster_node(state, &session, parts, &body),
        ("GET", ["api", "cluster", "nodes", id]) => {
            require_global_admin(&session)?;
            let node_id: Uuid = parse_id(id)?;
            match state.manager.get_peer(node_id)? {
                Some(node) => json_ok(&node),
                None => Err(Error::invalid_argument("unknown node")),
            }
        }
        ("PUT", ["api", "cluster", "nodes", id]) => {
            update_cluster_node(state, &session, parts, id, &body)
        }
        ("DELETE", ["api", "cluster", "nodes", id]) => {
            require_global_admin(&session)?;
            let node_id: Uuid = parse_id(id)?;
            state.manager.remove_peer(node_id)?;
            audit(state, &session, parts, "cluster.node.remove", id, "ok");
            json_ok(&json!({"status": "removed"}))
        }
        ("GET", ["api", "cluster", "health"]) => {
            require_global_admin(&session)?;
            let peers = state.manager.list_peers()?;
            let summary: Vec<serde_json::Value> = peers
                .iter()
                .map(|p| {
                    json!({
                        "id": p.id,
                        "name": p.name,
                        "health": p.health.as_str(),
                        "latencyMs": p.latency_ms,
                        "lastCheckAt": p.last_check_at,
                        "lastSeenAt": p.last_seen_at,
                    })
                })
                .collect();
            json_ok(&summary)
        }
        ("GET", ["api", "cluster", "cache"]) => {
            require_global_admin(&session)?;
            let entries: Vec<serde_json::Value> = state
                .router
                .cache()
                .snapshot()
                .into_iter()
                .map(|(bucket, owner, ttl)| {
                    json!({"bucket": bucket, "ownerNodeId": owner, "ttlSeconds": ttl})
                })
                .collect();
            json_ok(&entries)
        }
        ("DELETE", ["api", "cluster", "cache"]) => {
            require_global_admin(&session)?;
            state.router.cache().clear();
            audit(state, &session, parts, "cluster.cache.clear", "cache", "ok");
            json_ok(&json!({"status": "cleared"}))
        }
        ("GET", ["api", "cluster", "buckets"]) => {
            require_global_admin(&session)?;
            let buckets = state.engine.list_buckets(None)?;
            let listing: Vec<serde_json::Value> = buckets
                .iter()
                .map(|b| json!({"name": b.name, "nodeId": b.node_id}))
                .collect();
            json_ok(&listing)
        }
        ("GET", ["api", "cluster", "buckets", bucket, "nodes"]) => {
            require_global_admin(&session)?;
            bucket_placement(state, bucket)
        }

        // Replication.
        ("GET", ["api", "cluster", "replication"]) => {
            require_global_admin(&session)?;
            json_ok(&state.meta.scan_values::<ReplicationRule>(&keys::replication_rule_prefix())?)
        }
        ("POST", ["api", "cluster", "replication"]) => {
            create_replication_rule(state, &session, parts, &body)
        }
        ("POST", ["api", "cluster", "replication", "bulk"]) => {
            create_bulk_replication(state, &session, parts, &body)
        }
        ("GET", ["api", "cluster", "replication", id]) => {
            require_global_admin(&session)?;
            json_ok(&load_rule(state, id)?)
        }
        ("PUT", ["api", "cluster", "replication", id]) => {
            update_replication_rule(state, &session, parts, id, &body)
        }
        ("DELETE", ["api", "cluster", "replication", id]) => {
            require_global_admin(&session)?;
            let rule = load_rule(state, id)?;
            state.meta.delete(&keys::replication_rule(rule.id))?;
            audit(state, &session, parts, "replication.delete", id, "ok");
            json_ok(&json!({"status": "deleted"}))
        }

        // Dynamic settings.
        ("GET", ["api", "settings"]) => {
            require_global_admin(&session)?;
            let snapshot = state.settings.read().clone();
            json_ok(&snapshot)
        }
        ("PUT", ["api", "settings"]) => update_settings(state, &session, parts, &body),

        _ => Err(Error::invalid_argument("unknown route")),
    }
}

// ---------------------------------------------------------------------------
// Auth helpers
// ---------------------------------------------------------------------------

fn authenticate(state: &AppState, request_headers: &HeaderMap) -> Result<Session> {
    let token = request_headers
        .get(http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(Error::Unauthorized)?;
    state.sessions.get(token).ok_or(Error::Unauthorized)
}

fn require_global_admin(session: &Session) -> Result<()> {
    if session.is_global_admin {
        Ok(())
    } else {
        Err(Error::AccessDenied)
    }
}

fn authorize_tenant_scope(session: &Session, tenant_id: Option<Uuid>) -> Result<()> {
    if session.is_global_admin || tenant_id == session.tenant_id {
        Ok(())
    } else {
        Err(Error::AccessDenied)
    }
}

fn authorize_bucket(state: &AppState, session: &Session, name: &str) -> Result<Bucket> {
    let bucket = state.engine.require_bucket(name)?;
    authorize_tenant_scope(session, Some(bucket.tenant_id))?;
    Ok(bucket)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

fn login(state: &Arc<AppState>, parts: &http::request::Parts, body: &[u8]) -> Result<Response> {
    let request: LoginRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid login body"))?;

    let policy = state.settings.read().clone();
    match state
        .identity
        .authenticate(&request.username, &request.password, &policy)
    {
        Ok(user) => {
            let session = state.sessions.create(&user, policy.session_timeout_s);
            write_audit(
                state,
                &request.username,
                user.tenant_id,
                "auth.login",
                "session",
                "ok",
                client_ip(parts),
            );
            json_ok(&json!({
                "token": session.token,
                "expiresAt": session.expires_at,
                "globalAdmin": session.is_global_admin,
            }))
        }
        Err(err) => {
            warn!(username = %request.username, "login failed");
            write_audit(
                state,
                &request.username,
                None,
                "auth.login",
                "session",
                "denied",
                client_ip(parts),
            );
            Err(err)
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateTenantRequest {
    name: String,
    display_name: Option<String>,
    #[serde(default)]
    max_bytes: u64,
    #[serde(default)]
    max_buckets: u64,
    #[serde(default)]
    max_keys: u64,
}

fn create_tenant(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let request: CreateTenantRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid tenant body"))?;
    if request.name.is_empty() {
        return Err(Error::invalid_argument("tenant name is required"));
    }

    let tenant = Tenant {
        id: Uuid::new_v4(),
        name: request.name.clone(),
        display_name: request.display_name.unwrap_or_else(|| request.name.clone()),
        max_bytes: request.max_bytes,
        used_bytes: 0,
        max_buckets: request.max_buckets,
        used_buckets: 0,
        max_keys: request.max_keys,
        used_keys: 0,
        updated_at: ids::now_secs(),
    };

    state.meta.update(|txn| {
        if txn.exists(&keys::tenant_name(&request.name))? {
            return Err(Error::Conflict {
                key: keys::tenant_name(&request.name),
            });
        }
        txn.put(&keys::tenant(tenant.id), &tenant)?;
        txn.put(&keys::tenant_name(&tenant.name), &tenant.id)
    })?;

    audit(state, session, parts, "tenant.create", &tenant.name, "ok");
    json_ok(&tenant)
}

fn update_tenant(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    id: &str,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let tenant_id: Uuid = parse_id(id)?;
    let request: CreateTenantRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid tenant body"))?;

    let updated = state.meta.update(|txn| {
        let mut tenant: Tenant = txn
            .get(&keys::tenant(tenant_id))?
            .ok_or_else(|| Error::invalid_argument("unknown tenant"))?;
        if let Some(display_name) = request.display_name.clone() {
            tenant.display_name = display_name;
        }
        tenant.max_bytes = request.max_bytes;
        tenant.max_buckets = request.max_buckets;
        tenant.max_keys = request.max_keys;
        tenant.updated_at = ids::now_secs();
        txn.put(&keys::tenant(tenant_id), &tenant)?;
        Ok(tenant)
    })?;

    audit(state, session, parts, "tenant.update", &updated.name, "ok");
    json_ok(&updated)
}

fn delete_tenant(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    id: &str,
) -> Result<Response> {
    require_global_admin(session)?;
    let tenant_id: Uuid = parse_id(id)?;
    let tenant = state
        .meta
        .get::<Tenant>(&keys::tenant(tenant_id))?
        .ok_or_else(|| Error::invalid_argument("unknown tenant"))?;

    if !tenant.is_deletable() {
        return Err(Error::Conflict {
            key: format!("tenant {} still owns resources", tenant.name),
        });
    }

    state.meta.update(|txn| {
        txn.delete(&keys::tenant(tenant_id))?;
        txn.delete(&keys::tenant_name(&tenant.name))?;
        tombstone(txn, "tenant", &tenant_id.to_string(), None)
    })?;
    audit(state, session, parts, "tenant.delete", &tenant.name, "ok");
    json_ok(&json!({"status": "deleted"}))
}

fn user_json(user: &User) -> serde_json::Value {
    json!({
        "id": user.id,
        "username": user.username,
        "tenantId": user.tenant_id,
        "roles": user.roles,
        "lockedUntil": user.locked_until,
        "failedAttempts": user.failed_attempts,
    })
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateUserRequest {
    username: String,
    password: String,
    tenant_id: Option<Uuid>,
    #[serde(default)]
    roles: Vec<Role>,
}

fn create_user(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    let request: CreateUserRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid user body"))?;

    // Tenant admins may only create users inside their own tenant.
    let tenant_id = if session.is_global_admin {
        request.tenant_id
    } else {
        authorize_tenant_scope(session, request.tenant_id)?;
        session.tenant_id
    };
    if request.username.is_empty() || request.password.is_empty() {
        return Err(Error::invalid_argument("username and password are required"));
    }

    let user = User {
        id: Uuid::new_v4(),
        tenant_id,
        username: request.username.clone(),
        password_hash: hash_password(&request.password),
        roles: if request.roles.is_empty() {
            vec![Role::User]
        } else {
            request.roles
        },
        updated_at: ids::now_secs(),
        locked_until: None,
        failed_attempts: 0,
    };

    state.meta.update(|txn| {
        if txn.exists(&keys::username(&user.username))? {
            return Err(Error::Conflict {
                key: keys::username(&user.username),
            });
        }
        txn.put(&keys::user(user.id), &user)?;
        txn.put(&keys::username(&user.username), &user.id)
    })?;

    audit(state, session, parts, "user.create", &user.username, "ok");
    json_ok(&user_json(&user))
}

fn delete_user(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    id: &str,
) -> Result<Response> {
    let user = load_user(state, id)?;
    authorize_tenant_scope(session, user.tenant_id)?;

    state.meta.update(|txn| {
        txn.delete(&keys::user(user.id))?;
        txn.delete(&keys::username(&user.username))?;
        tombstone(txn, "user", &user.id.to_string(), user.tenant_id)
    })?;
    audit(state, session, parts, "user.delete", &user.username, "ok");
    json_ok(&json!({"status": "deleted"}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateAccessKeyRequest {
    user_id: Uuid,
}

fn create_access_key(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    let request: CreateAccessKeyRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid body"))?;
    let user = state
        .meta
        .get::<User>(&keys::user(request.user_id))?
        .ok_or_else(|| Error::invalid_argument("unknown user"))?;
    authorize_tenant_scope(session, user.tenant_id)?;

    let access_key = AccessKey {
        id: Uuid::new_v4(),
        access_key_id: format!("MXF{}", ids::random_token(8).to_uppercase()),
        secret_key: ids::random_token(20),
        user_id: user.id,
        tenant_id: user.tenant_id,
    };

    if let Some(tenant_id) = user.tenant_id {
        state.meta.update(|txn| {
            maxiofs_engine::QuotaTracker::check_and_reserve(
                txn,
                tenant_id,
                maxiofs_engine::quota::QuotaDelta::keys(1),
            )?;
            txn.put(&keys::access_key(&access_key.access_key_id), &access_key)
        })?;
    } else {
        state
            .meta
            .put(&keys::access_key(&access_key.access_key_id), &access_key)?;
    }

    audit(
        state,
        session,
        parts,
        "accesskey.create",
        &access_key.access_key_id,
        "ok",
    );
    // The secret is returned exactly once, at creation.
    json_ok(&json!({
        "id": access_key.id,
        "accessKeyId": access_key.access_key_id,
        "secretKey": access_key.secret_key,
        "userId": access_key.user_id,
    }))
}

fn delete_access_key(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    access_key_id: &str,
) -> Result<Response> {
    let Some(record) = state
        .meta
        .get::<AccessKey>(&keys::access_key(access_key_id))?
    else {
        return json_ok(&json!({"status": "deleted"}));
    };
    authorize_tenant_scope(session, record.tenant_id)?;

    state.meta.update(|txn| {
        txn.delete(&keys::access_key(access_key_id))?;
        if let Some(tenant_id) = record.tenant_id {
            maxiofs_engine::QuotaTracker::release(
                txn,
                tenant_id,
                maxiofs_engine::quota::QuotaDelta::keys(1),
            )?;
        }
        tombstone(txn, "accesskey", access_key_id, record.tenant_id)
    })?;
    audit(state, session, parts, "accesskey.delete", access_key_id, "ok");
    json_ok(&json!({"status": "deleted"}))
}

fn list_bucket_objects(
    state: &Arc<AppState>,
    parts: &http::request::Parts,
    bucket: &str,
) -> Result<Response> {
    let query: Vec<(String, String)> = form_urlencoded::parse(
        parts.uri.query().unwrap_or("").as_bytes(),
    )
    .into_owned()
    .collect();
    let find = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let output = state.engine.list_objects(&maxiofs_engine::list::ListObjectsInput {
        bucket: bucket.to_owned(),
        prefix: find("prefix").unwrap_or_default(),
        delimiter: find("delimiter"),
        after_key: find("marker"),
        max_keys: find("maxKeys").and_then(|v| v.parse().ok()).unwrap_or(1000),
    })?;

    let objects: Vec<serde_json::Value> = output
        .objects
        .iter()
        .map(|o| {
            json!({
                "key": o.key,
                "size": o.size,
                "etag": o.etag,
                "lastModified": o.created_at,
                "versionId": o.wire_version_id(),
            })
        })
        .collect();
    json_ok(&json!({
        "objects": objects,
        "commonPrefixes": output.common_prefixes,
        "isTruncated": output.is_truncated,
        "nextMarker": output.next_after_key,
    }))
}

async fn delete_bucket_object(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    bucket: &str,
) -> Result<Response> {
    let key = form_urlencoded::parse(parts.uri.query().unwrap_or("").as_bytes())
        .find(|(k, _)| k == "key")
        .map(|(_, v)| v.into_owned())
        .ok_or_else(|| Error::invalid_argument("key query parameter required"))?;

    state
        .engine
        .delete_object(
            maxiofs_engine::WriteOrigin::Client,
            bucket,
            &key,
            None,
            session.is_global_admin,
        )
        .await?;
    audit(
        state,
        session,
        parts,
        "object.delete",
        &format!("{bucket}/{key}"),
        "ok",
    );
    json_ok(&json!({"status": "deleted"}))
}

/// Presign a GET or PUT for a console user, using one of their access keys.
fn presign_object(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    bucket: &str,
) -> Result<Response> {
    let query: Vec<(String, String)> = form_urlencoded::parse(
        parts.uri.query().unwrap_or("").as_bytes(),
    )
    .into_owned()
    .collect();
    let find = |name: &str| {
        query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    };

    let key = find("key").ok_or_else(|| Error::invalid_argument("key required"))?;
    let method = find("method").unwrap_or_else(|| "GET".to_owned());
    let expires: u64 = find("expires").and_then(|v| v.parse().ok()).unwrap_or(900);

    // Any access key of the logged-in user can carry the signature.
    let all: Vec<AccessKey> = state.meta.scan_values(&keys::access_key_prefix())?;
    let access_key = all
        .into_iter()
        .find(|k| k.user_id == session.user_id)
        .ok_or_else(|| Error::invalid_argument("user has no access keys"))?;

    let url = maxiofs_auth::presign_url(
        &method,
        &state.config.public_api_url,
        bucket,
        &key,
        &access_key.access_key_id,
        &access_key.secret_key,
        state.config.region.as_deref().unwrap_or("us-east-1"),
        expires,
        ids::now_secs(),
    )
    .map_err(Error::from)?;

    json_ok(&json!({"url": url, "expiresIn": expires}))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddNodeRequest {
    id: Uuid,
    name: String,
    endpoint: String,
    node_token: String,
    #[serde(default)]
    priority: u8,
    region: Option<String>,
}

fn add_cluster_node(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let request: AddNodeRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid node body"))?;

    let mut node = new_peer(
        request.id,
        &request.name,
        &request.endpoint,
        &request.node_token,
        request.priority,
    );
    node.region = request.region;
    let stored = state.manager.add_peer(node)?;
    audit(
        state,
        session,
        parts,
        "cluster.node.add",
        &stored.id.to_string(),
        "ok",
    );
    json_ok(&stored)
}

fn update_cluster_node(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    id: &str,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let node_id: Uuid = parse_id(id)?;
    let request: AddNodeRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid node body"))?;

    let mut node: ClusterNode = state
        .manager
        .get_peer(node_id)?
        .ok_or_else(|| Error::invalid_argument("unknown node"))?;
    node.name = request.name;
    node.endpoint = request.endpoint.trim_end_matches('/').to_owned();
    node.priority = request.priority;
    node.region = request.region;
    if !request.node_token.is_empty() {
        node.node_token = request.node_token;
    }
    let stored = state.manager.add_peer(node)?;
    audit(state, session, parts, "cluster.node.update", id, "ok");
    json_ok(&stored)
}

fn bucket_placement(state: &Arc<AppState>, bucket: &str) -> Result<Response> {
    let record = state.engine.require_bucket(bucket)?;
    let rules: Vec<ReplicationRule> =
        state.meta.scan_values(&keys::replication_rule_prefix())?;
    let replicas: Vec<Uuid> = rules
        .iter()
        .filter(|r| r.source_bucket == bucket && r.enabled)
        .map(|r| r.destination_node_id)
        .collect();
    json_ok(&json!({
        "bucket": bucket,
        "ownerNodeId": record.node_id,
        "replicaNodeIds": replicas,
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRuleRequest {
    source_bucket: String,
    destination_node_id: Uuid,
    destination_bucket: String,
    #[serde(default = "default_sync_interval")]
    sync_interval_s: u64,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default = "default_true")]
    replicate_deletes: bool,
    #[serde(default = "default_true")]
    replicate_metadata: bool,
    #[serde(default)]
    prefix_filter: String,
    #[serde(default = "default_priority")]
    priority: u8,
}

fn default_sync_interval() -> u64 {
    60
}
fn default_true() -> bool {
    true
}
fn default_priority() -> u8 {
    10
}

impl CreateRuleRequest {
    fn into_rule(self) -> ReplicationRule {
        ReplicationRule {
            id: Uuid::new_v4(),
            source_bucket: self.source_bucket,
            destination_node_id: self.destination_node_id,
            destination_bucket: self.destination_bucket,
            sync_interval_s: self.sync_interval_s,
            enabled: self.enabled,
            replicate_deletes: self.replicate_deletes,
            replicate_metadata: self.replicate_metadata,
            prefix_filter: self.prefix_filter,
            priority: self.priority,
            last_sync_at: None,
            last_error: None,
            objects_replicated: 0,
            bytes_replicated: 0,
            updated_at: ids::now_secs(),
        }
    }
}

fn create_replication_rule(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let request: CreateRuleRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid rule body"))?;
    let rule = request.into_rule();
    validate_rule(&rule, state.manager.this_node_id())?;
    state.engine.require_bucket(&rule.source_bucket)?;

    state.meta.put(&keys::replication_rule(rule.id), &rule)?;
    audit(
        state,
        session,
        parts,
        "replication.create",
        &rule.source_bucket,
        "ok",
    );
    json_ok(&rule)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BulkReplicationRequest {
    source_bucket: String,
    destination_node_ids: Vec<Uuid>,
    #[serde(default = "default_sync_interval")]
    sync_interval_s: u64,
}

fn create_bulk_replication(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let request: BulkReplicationRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid bulk body"))?;
    state.engine.require_bucket(&request.source_bucket)?;

    let local = state.manager.this_node_id();
    let mut created = Vec::new();
    // The local node is silently skipped so "replicate everywhere" is safe.
    for destination in request
        .destination_node_ids
        .iter()
        .filter(|id| **id != local)
    {
        let rule = ReplicationRule {
            id: Uuid::new_v4(),
            source_bucket: request.source_bucket.clone(),
            destination_node_id: *destination,
            destination_bucket: request.source_bucket.clone(),
            sync_interval_s: request.sync_interval_s,
            enabled: true,
            replicate_deletes: true,
            replicate_metadata: true,
            prefix_filter: String::new(),
            priority: default_priority(),
            last_sync_at: None,
            last_error: None,
            objects_replicated: 0,
            bytes_replicated: 0,
            updated_at: ids::now_secs(),
        };
        state.meta.put(&keys::replication_rule(rule.id), &rule)?;
        created.push(rule);
    }

    audit(
        state,
        session,
        parts,
        "replication.bulk",
        &request.source_bucket,
        "ok",
    );
    json_ok(&created)
}

fn update_replication_rule(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    id: &str,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let existing = load_rule(state, id)?;
    let request: CreateRuleRequest =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid rule body"))?;

    let mut rule = request.into_rule();
    rule.id = existing.id;
    rule.objects_replicated = existing.objects_replicated;
    rule.bytes_replicated = existing.bytes_replicated;
    rule.last_sync_at = existing.last_sync_at;
    validate_rule(&rule, state.manager.this_node_id())?;

    state.meta.put(&keys::replication_rule(rule.id), &rule)?;
    audit(state, session, parts, "replication.update", id, "ok");
    json_ok(&rule)
}

fn update_settings(
    state: &Arc<AppState>,
    session: &Session,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Response> {
    require_global_admin(session)?;
    let incoming: DynamicSettings = serde_json::from_slice(body)
        .map_err(|_| Error::invalid_argument("invalid settings body"))?;

    *state.settings.write() = incoming.clone();
    state.save_settings()?;
    audit(state, session, parts, "settings.update", "dynamic", "ok");
    json_ok(&incoming)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

fn load_tenant(state: &AppState, id: &str) -> Result<Tenant> {
    let tenant_id: Uuid = parse_id(id)?;
    state
        .meta
        .get(&keys::tenant(tenant_id))?
        .ok_or_else(|| Error::invalid_argument("unknown tenant"))
}

fn load_user(state: &AppState, id: &str) -> Result<User> {
    let user_id: Uuid = parse_id(id)?;
    state
        .meta
        .get(&keys::user(user_id))?
        .ok_or_else(|| Error::invalid_argument("unknown user"))
}

fn load_rule(state: &AppState, id: &str) -> Result<ReplicationRule> {
    let rule_id: Uuid = parse_id(id)?;
    state
        .meta
        .get(&keys::replication_rule(rule_id))?
        .ok_or_else(|| Error::invalid_argument("unknown replication rule"))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse()
        .map_err(|_| Error::invalid_argument("invalid id"))
}

/// Append a deletion-log row so reconciliation cannot resurrect the entity.
fn tombstone(
    txn: &mut maxiofs_meta::MetaTxn<'_>,
    kind: &str,
    entity_id: &str,
    tenant_id: Option<Uuid>,
) -> Result<()> {
    let deleted_at = ids::now_secs();
    let record = Tombstone {
        entity_kind: kind.to_owned(),
        entity_id: entity_id.to_owned(),
        deleted_at,
        tenant_id,
    };
    txn.put(&keys::tombstone(kind, deleted_at, entity_id), &record)
}

fn client_ip(parts: &http::request::Parts) -> Option<String> {
    parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').next().unwrap_or(v).trim().to_owned())
}

fn audit(
    state: &AppState,
    session: &Session,
    parts: &http::request::Parts,
    action: &str,
    resource: &str,
    status: &str,
) {
    write_audit(
        state,
        &session.username,
        session.tenant_id,
        action,
        resource,
        status,
        client_ip(parts),
    );
}

fn write_audit(
    state: &AppState,
    actor: &str,
    tenant: Option<Uuid>,
    action: &str,
    resource: &str,
    status: &str,
    ip: Option<String>,
) {
    let record = AuditRecord {
        timestamp: ids::now_secs(),
        actor: actor.to_owned(),
        tenant,
        action: action.to_owned(),
        resource: resource.to_owned(),
        status: status.to_owned(),
        ip,
    };
    let id = Uuid::new_v4();
    if let Err(e) = state.meta.put(&keys::audit(record.timestamp, id), &record) {
        // Audit writes must never fail the request.
        warn!(error = %e, action, "failed to write audit record");
    }
    debug!(actor, action, resource, status, "audit");
}

/// Drop audit rows older than the retention window. Returns how many were
/// removed.
pub fn gc_audit(state: &AppState) -> Result<u64> {
    let retention_days = state.settings.read().audit_retention_days;
    let cutoff = ids::now_secs() - i64::from(retention_days) * 86_400;
    state.meta.update(|txn| {
        let rows = txn.scan_prefix(&keys::audit_prefix(), None, usize::MAX)?;
        let mut removed = 0u64;
        for (row_key, bytes) in &rows {
            let record: AuditRecord = serde_json::from_slice(bytes).map_err(|e| {
                Error::Internal(anyhow::anyhow!("corrupt audit record at {row_key}: {e}"))
            })?;
            if record.timestamp < cutoff {
                txn.delete(row_key)?;
                removed += 1;
            }
        }
        Ok(removed)
    })
}

fn json_ok<T: serde::Serialize>(value: &T) -> Result<Response> {
    Ok(json_response(StatusCode::OK, value))
}

fn json_response<T: serde::Serialize>(status: StatusCode, value: &T) -> Response {
    let body = serde_json::to_vec(value).unwrap_or_default();
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .header(http::header::DATE, http_date(ids::now_secs()))
        .body(ResponseBody::full(body))
        .unwrap_or_else(|_| http::Response::new(ResponseBody::empty()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::s3::service::tests::harness;
    use http_body_util::BodyExt;

    async fn call(
        harness: &crate::s3::service::tests::TestHarness,
        method: &str,
        path: &str,
        token: Option<&str>,
        body: serde_json::Value,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = http::Request::builder()
            .method(method)
            .uri(format!("http://localhost:8081{path}"));
        if let Some(token) = token {
            builder = builder.header(http::header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let (parts, ()) = builder.body(()).unwrap().into_parts();
        let body_bytes = if body.is_null() {
            Bytes::new()
        } else {
            Bytes::from(serde_json::to_vec(&body).unwrap())
        };
        let response = handle(&harness.state, &parts, body_bytes).await;
        let status = response.status();
        let collected = response.into_body().collect().await.unwrap().to_bytes();
        let value = serde_json::from_slice(&collected).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    async fn login_as_admin(harness: &crate::s3::service::tests::TestHarness) -> String {
        // Promote the seeded user to global admin for management tests.
        let user_id: Uuid = harness
            .state
            .meta
            .get(&keys::username("tenant-admin"))
            .unwrap()
            .unwrap();
        let mut user: User = harness
            .state
            .meta
            .get(&keys::user(user_id))
            .unwrap()
            .unwrap();
        user.tenant_id = None;
        harness.state.meta.put(&keys::user(user_id), &user).unwrap();

        let (status, body) = call(
            harness,
            "POST",
            "/api/auth/login",
            None,
            json!({"username": "tenant-admin", "password": "pw"}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "login failed: {body}");
        body["token"].as_str().unwrap().to_owned()
    }

    #[tokio::test]
    async fn test_should_require_session_for_api_routes() {
        let harness = harness();
        let (status, _) = call(&harness, "GET", "/api/tenants", None, serde_json::Value::Null).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_should_reject_bad_login_and_audit_it() {
        let harness = harness();
        let (status, _) = call(
            &harness,
            "POST",
            "/api/auth/login",
            None,
            json!({"username": "tenant-admin", "password": "wrong"}),
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(harness.state.meta.count_prefix(&keys::audit_prefix()).unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_should_manage_tenant_lifecycle() {
        let harness = harness();
        let token = login_as_admin(&harness).await;

        let (status, created) = call(
            &harness,
            "POST",
            "/api/tenants",
            Some(&token),
            json!({"name": "acme", "maxBytes": 1000}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{created}");
        let tenant_id = created["id"].as_str().unwrap().to_owned();

        // Duplicate name conflicts.
        let (status, _) = call(
            &harness,
            "POST",
            "/api/tenants",
            Some(&token),
            json!({"name": "acme"}),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, stats) = call(
            &harness,
            "GET",
            &format!("/api/tenants/{tenant_id}/stats"),
            Some(&token),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(stats["maxBytes"], 1000);

        let (status, _) = call(
            &harness,
            "DELETE",
            &format!("/api/tenants/{tenant_id}"),
            Some(&token),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_should_create_user_and_access_key() {
        let harness = harness();
        let token = login_as_admin(&harness).await;

        let (status, user) = call(
            &harness,
            "POST",
            "/api/users",
            Some(&token),
            json!({"username": "bob", "password": "pw2", "roles": ["user"]}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{user}");
        let user_id = user["id"].as_str().unwrap().to_owned();

        let (status, key) = call(
            &harness,
            "POST",
            "/api/access-keys",
            Some(&token),
            json!({"userId": user_id}),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{key}");
        assert!(key["secretKey"].as_str().is_some(), "secret returned once");

        let access_key_id = key["accessKeyId"].as_str().unwrap().to_owned();
        let (status, _) = call(
            &harness,
            "DELETE",
            &format!("/api/access-keys/{access_key_id}"),
            Some(&token),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // Revocation leaves a tombstone so reconciliation cannot resurrect.
        assert!(harness.state.meta.count_prefix("tomb:accesskey:").unwrap() >= 1);
    }

    #[tokio::test]
    async fn test_should_update_dynamic_settings() {
        let harness = harness();
        let token = login_as_admin(&harness).await;

        let (status, _) = call(
            &harness,
            "PUT",
            "/api/settings",
            Some(&token),
            json!({"sessionTimeoutS": 120, "maintenanceMode": true}),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(harness.state.settings.read().maintenance_mode);
        assert_eq!(harness.state.settings.read().session_timeout_s, 120);

        // Persisted for the next boot.
        let stored = AppState::load_settings(&harness.state.meta).unwrap();
        assert!(stored.maintenance_mode);
    }

    #[tokio::test]
    async fn test_should_manage_replication_rules() {
        let harness = harness();
        let token = login_as_admin(&harness).await;

        // Need a source bucket and a destination peer.
        harness
            .state
            .engine
            .create_bucket(maxiofs_engine::bucket::CreateBucketInput {
                name: "src".to_owned(),
                tenant_id: harness.tenant_id,
                owner_user_id: Uuid::new_v4(),
                versioning: maxiofs_core::types::VersioningState::Off,
                object_lock_enabled: false,
                default_retention: None,
                encryption_enabled: false,
            })
            .unwrap();
        let peer_id = Uuid::new_v4();

        let (status, rule) = call(
            &harness,
            "POST",
            "/api/cluster/replication",
            Some(&token),
            json!({
                "sourceBucket": "src",
                "destinationNodeId": peer_id,
                "destinationBucket": "src",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK, "{rule}");

        // Self-replication is rejected.
        let (status, _) = call(
            &harness,
            "POST",
            "/api/cluster/replication",
            Some(&token),
            json!({
                "sourceBucket": "src",
                "destinationNodeId": harness.state.manager.this_node_id(),
                "destinationBucket": "src",
            }),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        // Bulk creation skips the local node.
        let (status, rules) = call(
            &harness,
            "POST",
            "/api/cluster/replication/bulk",
            Some(&token),
            json!({
                "sourceBucket": "src",
                "destinationNodeIds": [harness.state.manager.this_node_id(), peer_id],
            }),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(rules.as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_should_expire_sessions() {
        let harness = harness();
        harness.state.settings.write().session_timeout_s = 0;
        let token = login_as_admin(&harness).await;

        // TTL of zero expires immediately.
        let (status, _) = call(
            &harness,
            "GET",
            "/api/tenants",
            Some(&token),
            serde_json::Value::Null,
        )
        .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_should_gc_old_audit_records() {
        let harness = harness();
        let old = AuditRecord {
            timestamp: 1000,
            actor: "x".to_owned(),
            tenant: None,
            action: "a".to_owned(),
            resource: "r".to_owned(),
            status: "ok".to_owned(),
            ip: None,
        };
        harness
            .state
            .meta
            .put(&keys::audit(1000, Uuid::new_v4()), &old)
            .unwrap();

        let removed = gc_audit(&harness.state).unwrap();
        assert_eq!(removed, 1);
    }
}
