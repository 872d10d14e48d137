//! The S3 listener service.
//!
//! Request pipeline:
//!
//! 1. Intercept `/health`, `/ready`, `/metrics`, and `/_internal/*`.
//! 2. Resolve addressing and identify the operation.
//! 3. Collect the body and authenticate: a valid inter-node signature marks
//!    a forwarded request (already authenticated at the edge); otherwise
//!    presigned query auth, SigV4, or SigV2 applies.
//! 4. Route: serve locally, forward to the owning peer, or fail reads over
//!    to a replica. A peer answering 404/410 for a bucket we thought it
//!    owned invalidates the location cache and the request re-resolves
//!    once.
//! 5. Render engine errors as S3 XML error bodies.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::Service;
use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_auth::VerifiedCaller;
use maxiofs_cluster::RouteDecision;
use maxiofs_cluster::rpc::{
    SIGNED_HEADER_NODE, SIGNED_HEADER_NONCE, SIGNED_HEADER_SIGNATURE, SIGNED_HEADER_TIMESTAMP,
    SignedHeaders, verify_inbound,
};
use maxiofs_core::types::{ClusterNode, User};
use maxiofs_core::{Error, Result, ids};
use maxiofs_meta::keys;

use crate::body::ResponseBody;
use crate::internal;
use crate::metrics;
use crate::state::{AppState, MetaCredentials};

use super::handlers::{self, Caller, S3Response};
use super::headers::FORWARDED_TENANT_HEADER;
use super::router::S3Router;
use super::xml;

/// Admin flag on forwarded requests.
const FORWARDED_ADMIN_HEADER: &str = "x-maxiofs-admin";
/// Governance-bypass capability flag on forwarded requests.
const FORWARDED_BYPASS_HEADER: &str = "x-maxiofs-bypass";

/// The hyper service for the S3 listener.
#[derive(Debug, Clone)]
pub struct S3Service {
    state: Arc<AppState>,
    router: S3Router,
}

impl S3Service {
    /// Build the service over shared state.
    #[must_use]
    pub fn new(state: Arc<AppState>) -> Self {
        let router = S3Router::new(state.config.domain.clone());
        Self { state, router }
    }
}

impl Service<http::Request<Incoming>> for S3Service {
    type Response = http::Response<ResponseBody>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = std::result::Result<Self::Response, Self::Error>> + Send>>;

    fn call(&self, req: http::Request<Incoming>) -> Self::Future {
        let state = Arc::clone(&self.state);
        let router = self.router.clone();

        Box::pin(async move {
            let (parts, incoming) = req.into_parts();
            let body = match incoming.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    warn!(error = %e, "failed to read request body");
                    return Ok(error_response(
                        &Error::Internal(anyhow::anyhow!("failed to read request body")),
                        parts.uri.path(),
                    ));
                }
            };

            let response = handle_request(&state, &router, parts, body).await;
            Ok(finalize(response))
        })
    }
}

/// Add the common response headers.
fn finalize(mut response: S3Response) -> S3Response {
    let request_id = Uuid::new_v4().to_string();
    let headers = response.headers_mut();
    if let Ok(value) = http::HeaderValue::from_str(&request_id) {
        headers.insert("x-amz-request-id", value);
    }
    if let Ok(value) = http::HeaderValue::from_str(&super::headers::http_date(ids::now_secs())) {
        headers.insert(http::header::DATE, value);
    }
    headers.insert(
        http::header::SERVER,
        http::HeaderValue::from_static("MaxIOFS"),
    );
    response
}

/// The testable request pipeline over an already-collected body.
pub async fn handle_request(
    state: &Arc<AppState>,
    router: &S3Router,
    parts: http::request::Parts,
    body: Bytes,
) -> S3Response {
    let path = parts.uri.path().to_owned();

    // Operational endpoints bypass S3 processing entirely.
    match path.as_str() {
        "/health" => return health_response(state),
        "/ready" => return ready_response(),
        "/metrics" => return metrics::response(state),
        _ => {}
    }
    if path.starts_with("/_internal/") {
        return internal::handle(state, &parts, body).await;
    }

    match process(state, router, &parts, body).await {
        Ok(response) => response,
        Err(err) => error_response(&err, &path),
    }
}

async fn process(
    state: &Arc<AppState>,
    router: &S3Router,
    parts: &http::request::Parts,
    body: Bytes,
) -> Result<S3Response> {
    let ctx = router.resolve_parts(&parts.method, &parts.uri, &parts.headers)?;

    debug!(
        method = %parts.method,
        path = %parts.uri.path(),
        operation = %ctx.operation,
        "processing S3 request"
    );

    let (caller, forwarded) = authenticate(state, parts, &body)?;

    if ctx.operation.is_write() && state.settings.read().maintenance_mode {
        return Err(Error::unavailable("server is in maintenance mode"));
    }

    // Service-level and bucket-creating operations are always local; the
    // creating node becomes the owner.
    let bucket_scoped = ctx.bucket.clone().filter(|_| {
        !matches!(
            ctx.operation,
            super::operations::S3Operation::ListBuckets
                | super::operations::S3Operation::CreateBucket
        )
    });

    let Some(bucket_name) = bucket_scoped else {
        return handlers::dispatch(state, &caller, &ctx, &parts.headers, body).await;
    };

    // Forwarded requests are served locally: the sender already resolved
    // ownership to this node.
    if forwarded {
        return handlers::dispatch(state, &caller, &ctx, &parts.headers, body).await;
    }

    match state.router.route(&bucket_name, ctx.operation.is_write()).await? {
        RouteDecision::Local => {
            handlers::dispatch(state, &caller, &ctx, &parts.headers, body).await
        }
        RouteDecision::Forward(peer) => {
            let response =
                proxy(state, &peer, parts, &body, &caller, parts.uri.path()).await?;
            if response.status() == StatusCode::NOT_FOUND
                || response.status() == StatusCode::GONE
            {
                // The peer no longer owns the bucket: drop the cache entry
                // and resolve once more.
                state.router.invalidate(&bucket_name);
                match state
                    .router
                    .route(&bucket_name, ctx.operation.is_write())
                    .await?
                {
                    RouteDecision::Local => {
                        return handlers::dispatch(state, &caller, &ctx, &parts.headers, body)
                            .await;
                    }
                    RouteDecision::Forward(next_peer) if next_peer.id != peer.id => {
                        return proxy(state, &next_peer, parts, &body, &caller, parts.uri.path())
                            .await;
                    }
                    _ => {}
                }
            }
            Ok(response)
        }
        RouteDecision::ReadReplica {
            node,
            replica_bucket,
        } => {
            let replica_path = rewrite_bucket_path(parts.uri.path(), &bucket_name, &replica_bucket);
            proxy(state, &node, parts, &body, &caller, &replica_path).await
        }
    }
}

/// Authenticate the request; returns the caller and whether the request
/// arrived pre-authenticated from a peer.
fn authenticate(
    state: &Arc<AppState>,
    parts: &http::request::Parts,
    body: &Bytes,
) -> Result<(Caller, bool)> {
    // Forwarded requests carry the inter-node signature.
    if parts.headers.contains_key(SIGNED_HEADER_SIGNATURE) {
        let sender = internal::verify_signed_request(state, parts, body)?;
        debug!(sender = %sender, "accepted forwarded request");
        let tenant_id = super::headers::value(&parts.headers, FORWARDED_TENANT_HEADER)
            .and_then(|v| v.parse().ok());
        let caller = Caller {
            access_key_id: String::new(),
            tenant_id,
            user_id: None,
            is_global_admin: super::headers::value(&parts.headers, FORWARDED_ADMIN_HEADER)
                == Some("true"),
            can_bypass_governance: super::headers::value(&parts.headers, FORWARDED_BYPASS_HEADER)
                == Some("true"),
        };
        return Ok((caller, true));
    }

    let credentials = MetaCredentials::new(Arc::clone(&state.meta));
    let now = ids::now_secs();
    let query = parts.uri.query().unwrap_or("");

    let verified: VerifiedCaller = if maxiofs_auth::presigned::has_presigned_params(query) {
        maxiofs_auth::verify_presigned(parts, &credentials, now)?
    } else {
        let auth_header = parts
            .headers
            .get(http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(Error::AccessDenied)?;
        if maxiofs_auth::is_sigv2(auth_header) {
            maxiofs_auth::verify_sigv2(parts, &credentials, now)?
        } else {
            let body_hash = maxiofs_auth::hash_payload(body);
            maxiofs_auth::verify_sigv4(parts, &body_hash, &credentials, now)?
        }
    };

    let caller = caller_for(state, &credentials, &verified.access_key_id)?;
    Ok((caller, false))
}

/// Resolve the verified access key into a caller with roles.
fn caller_for(
    state: &AppState,
    credentials: &MetaCredentials,
    access_key_id: &str,
) -> Result<Caller> {
    let access_key = credentials
        .access_key(access_key_id)?
        .ok_or(Error::InvalidAccessKeyId)?;
    let user: Option<User> = state.meta.get(&keys::user(access_key.user_id))?;

    let is_global_admin = user.as_ref().is_some_and(User::is_global_admin);
    let can_bypass_governance = user
        .as_ref()
        .is_some_and(|u| u.roles.contains(&maxiofs_core::types::Role::Admin));

    Ok(Caller {
        access_key_id: access_key.access_key_id,
        tenant_id: access_key.tenant_id,
        user_id: Some(access_key.user_id),
        is_global_admin,
        can_bypass_governance,
    })
}

/// Forward a request to a peer, signing it with the cluster token and
/// carrying the authenticated caller.
async fn proxy(
    state: &Arc<AppState>,
    peer: &ClusterNode,
    parts: &http::request::Parts,
    body: &Bytes,
    caller: &Caller,
    path: &str,
) -> Result<S3Response> {
    let token = state
        .manager
        .node_token()
        .ok_or_else(|| Error::unavailable("cluster is not initialized"))?;

    let path_and_query = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    };
    let url = format!("{}{path_and_query}", peer.endpoint.trim_end_matches('/'));
    let method = reqwest::Method::from_bytes(parts.method.as_str().as_bytes())
        .map_err(|_| Error::invalid_argument("unsupported method"))?;

    let signed = SignedHeaders::create(
        state.manager.this_node_id(),
        &token,
        parts.method.as_str(),
        path,
        body,
    );

    let mut request = state
        .router
        .rpc()
        .http()
        .request(method, &url)
        .header(SIGNED_HEADER_NODE, signed.node_id.to_string())
        .header(SIGNED_HEADER_TIMESTAMP, signed.timestamp.to_string())
        .header(SIGNED_HEADER_NONCE, &signed.nonce)
        .header(SIGNED_HEADER_SIGNATURE, &signed.signature)
        .header(FORWARDED_ADMIN_HEADER, if caller.is_global_admin { "true" } else { "false" })
        .header(
            FORWARDED_BYPASS_HEADER,
            if caller.can_bypass_governance { "true" } else { "false" },
        );
    if let Some(tenant_id) = caller.tenant_id {
        request = request.header(FORWARDED_TENANT_HEADER, tenant_id.to_string());
    }
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) {
            request = request.header(name, value);
        }
    }

    debug!(peer = %peer.id, url = %url, "forwarding request");
    let upstream = request
        .body(body.clone())
        .send()
        .await
        .map_err(|e| Error::unavailable(format!("forwarding to {} failed: {e}", peer.id)))?;

    let status = StatusCode::from_u16(upstream.status().as_u16())
        .unwrap_or(StatusCode::BAD_GATEWAY);
    let mut builder = http::Response::builder().status(status);
    for (name, value) in upstream.headers() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    let payload = upstream
        .bytes()
        .await
        .map_err(|e| Error::unavailable(format!("reading peer response failed: {e}")))?;
    builder
        .body(ResponseBody::full(payload))
        .map_err(|e| Error::Internal(anyhow::anyhow!("build proxied response: {e}")))
}

/// Headers that must not cross a proxy hop.
fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name,
        "connection"
            | "keep-alive"
            | "proxy-authenticate"
            | "proxy-authorization"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "host"
            | "content-length"
            | "authorization"
    )
}

/// Swap the bucket segment of a path-style URI.
fn rewrite_bucket_path(path: &str, bucket: &str, replica_bucket: &str) -> String {
    let prefix = format!("/{bucket}");
    match path.strip_prefix(&prefix) {
        Some(rest) => format!("/{replica_bucket}{rest}"),
        None => path.to_owned(),
    }
}

/// Render a domain error as an S3 XML error response.
#[must_use]
pub fn error_response(err: &Error, resource: &str) -> S3Response {
    let status = StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    // 304 responses carry no body by definition.
    let body = if status == StatusCode::NOT_MODIFIED {
        ResponseBody::empty()
    } else {
        ResponseBody::full(xml::error_body(err.s3_code(), &err.to_string(), resource))
    };

    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/xml")
        .body(body)
        .unwrap_or_else(|_| {
            let mut fallback = http::Response::new(ResponseBody::empty());
            *fallback.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
            fallback
        })
}

fn health_response(state: &Arc<AppState>) -> S3Response {
    let body = serde_json::json!({
        "status": "ok",
        "node_id": state.manager.this_node_id(),
        "uptime_seconds": state.uptime_secs(),
    });
    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(ResponseBody::full(body.to_string()))
        .unwrap_or_else(|_| http::Response::new(ResponseBody::empty()))
}

fn ready_response() -> S3Response {
    http::Response::builder()
        .status(StatusCode::OK)
        .body(ResponseBody::full("ready"))
        .unwrap_or_else(|_| http::Response::new(ResponseBody::empty()))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use http_body_util::BodyExt as _;
    use maxiofs_auth::canonical::canonical_request;
    use maxiofs_auth::sigv4::{derive_signing_key, hash_payload, sign, string_to_sign};
    use maxiofs_cluster::{
        ClusterManager, LocationCache, ReplicationEngine, RequestRouter, RpcClient,
    };
    use maxiofs_core::Config;
    use maxiofs_core::types::{AccessKey, Role, Tenant};
    use maxiofs_engine::ObjectEngine;
    use sha2::{Digest, Sha256};
    use std::time::Duration;

    pub(crate) const TEST_AKID: &str = "AKIDMAXIOTEST";
    pub(crate) const TEST_SECRET: &str = "maxio-secret-key";

    pub(crate) struct TestHarness {
        pub state: Arc<AppState>,
        pub router: S3Router,
        pub tenant_id: Uuid,
        _dir: tempfile::TempDir,
    }

    /// Full application state over temp stores, with one tenant, one admin
    /// user, and one access key.
    pub(crate) fn harness() -> TestHarness {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = Arc::new(
            maxiofs_meta::MetaStore::open(dir.path().join("meta.redb")).unwrap(),
        );
        let blobs = Arc::new(maxiofs_blob::BlobStore::open(dir.path().join("objects")).unwrap());

        let tenant_id = Uuid::new_v4();
        let tenant = Tenant {
            id: tenant_id,
            name: "tenant-one".to_owned(),
            display_name: "Tenant One".to_owned(),
            max_bytes: 0,
            used_bytes: 0,
            max_buckets: 0,
            used_buckets: 0,
            max_keys: 0,
            used_keys: 0,
            updated_at: 0,
        };
        meta.put(&keys::tenant(tenant_id), &tenant).unwrap();

        let user = User {
            id: Uuid::new_v4(),
            tenant_id: Some(tenant_id),
            username: "tenant-admin".to_owned(),
            password_hash: crate::identity::hash_password("pw"),
            roles: vec![Role::Admin],
            updated_at: 0,
            locked_until: None,
            failed_attempts: 0,
        };
        meta.put(&keys::user(user.id), &user).unwrap();
        meta.put(&keys::username(&user.username), &user.id).unwrap();

        let access_key = AccessKey {
            id: Uuid::new_v4(),
            access_key_id: TEST_AKID.to_owned(),
            secret_key: TEST_SECRET.to_owned(),
            user_id: user.id,
            tenant_id: Some(tenant_id),
        };
        meta.put(&keys::access_key(TEST_AKID), &access_key).unwrap();

        let manager = ClusterManager::load(Arc::clone(&meta), "test-node", None).unwrap();
        let engine = ObjectEngine::new(
            Arc::clone(&meta),
            blobs,
            None,
            false,
            manager.this_node_id(),
            3,
        );
        let rpc = RpcClient::new(manager.this_node_id()).unwrap();
        let cache = Arc::new(LocationCache::new(Duration::from_secs(300)));
        let cluster_router = Arc::new(RequestRouter::new(
            Arc::clone(&meta),
            cache,
            Arc::clone(&manager),
            rpc.clone(),
        ));
        let replication = ReplicationEngine::new(
            Arc::clone(&meta),
            engine.clone(),
            Arc::clone(&manager),
            rpc,
            1,
        );
        let identity = Arc::new(crate::identity::MetaIdentityStore::new(Arc::clone(&meta)));

        let state = Arc::new(AppState {
            config: Config::default(),
            meta,
            engine,
            manager,
            router: cluster_router,
            replication,
            settings: parking_lot::RwLock::new(maxiofs_core::DynamicSettings::default()),
            sessions: crate::mgmt::SessionStore::new(),
            identity,
            started_at: ids::now_secs(),
        });
        let router = S3Router::new(state.config.domain.clone());

        TestHarness {
            state,
            router,
            tenant_id,
            _dir: dir,
        }
    }

    /// Build a SigV4-signed request the way an SDK would.
    pub(crate) fn signed_request(
        method: &str,
        path_and_query: &str,
        body: &[u8],
    ) -> (http::request::Parts, Bytes) {
        let now = chrono::Utc::now();
        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();
        let body_hash = hash_payload(body);

        let (path, query) = match path_and_query.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path_and_query, ""),
        };

        let host = "localhost:8080";
        let header_pairs = vec![
            ("host", host),
            ("x-amz-content-sha256", body_hash.as_str()),
            ("x-amz-date", amz_date.as_str()),
        ];
        let signed_names = vec!["host", "x-amz-content-sha256", "x-amz-date"];

        let canonical = canonical_request(method, path, query, &header_pairs, &signed_names, &body_hash);
        let canonical_hash = hex::encode(Sha256::digest(canonical.as_bytes()));
        let scope = format!("{date}/us-east-1/s3/aws4_request");
        let sts = string_to_sign(&amz_date, &scope, &canonical_hash);
        let key = derive_signing_key(TEST_SECRET, &date, "us-east-1", "s3");
        let signature = sign(&key, &sts);

        let authorization = format!(
            "AWS4-HMAC-SHA256 Credential={TEST_AKID}/{scope},\
             SignedHeaders=host;x-amz-content-sha256;x-amz-date,Signature={signature}"
        );

        let (parts, ()) = http::Request::builder()
            .method(method)
            .uri(format!("http://{host}{path_and_query}"))
            .header("host", host)
            .header("x-amz-content-sha256", &body_hash)
            .header("x-amz-date", &amz_date)
            .header(http::header::AUTHORIZATION, authorization)
            .body(())
            .unwrap()
            .into_parts();
        (parts, Bytes::copy_from_slice(body))
    }

    async fn send(
        harness: &TestHarness,
        method: &str,
        path_and_query: &str,
        body: &[u8],
    ) -> (StatusCode, HeaderMap, Bytes) {
        let (parts, body) = signed_request(method, path_and_query, body);
        let response = handle_request(&harness.state, &harness.router, parts, body).await;
        let (response_parts, response_body) = response.into_parts();
        let collected = response_body.collect().await.unwrap().to_bytes();
        (response_parts.status, response_parts.headers, collected)
    }

    #[tokio::test]
    async fn test_should_serve_health_and_ready() {
        let harness = harness();
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("http://localhost:8080/health")
            .body(())
            .unwrap()
            .into_parts();
        let response =
            handle_request(&harness.state, &harness.router, parts, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_should_reject_unsigned_requests_with_access_denied() {
        let harness = harness();
        let (parts, ()) = http::Request::builder()
            .method("GET")
            .uri("http://localhost:8080/some-bucket/key")
            .body(())
            .unwrap()
            .into_parts();
        let response =
            handle_request(&harness.state, &harness.router, parts, Bytes::new()).await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("<Code>AccessDenied</Code>"));
    }

    #[tokio::test]
    async fn test_should_put_and_get_object_through_full_pipeline() {
        let harness = harness();

        let (status, _, _) = send(&harness, "PUT", "/pipeline-bucket", b"").await;
        assert_eq!(status, StatusCode::OK);

        let payload = b"end to end payload";
        let (status, headers, _) =
            send(&harness, "PUT", "/pipeline-bucket/data.bin", payload).await;
        assert_eq!(status, StatusCode::OK);
        assert!(headers.contains_key(http::header::ETAG));

        let (status, headers, body) =
            send(&harness, "GET", "/pipeline-bucket/data.bin", b"").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_ref(), payload);
        assert_eq!(
            headers
                .get(http::header::CONTENT_LENGTH)
                .and_then(|v| v.to_str().ok()),
            Some("18")
        );

        let (status, _, body) = send(&harness, "GET", "/pipeline-bucket?list-type=2", b"").await;
        assert_eq!(status, StatusCode::OK);
        assert!(String::from_utf8_lossy(&body).contains("<Key>data.bin</Key>"));
    }

    #[tokio::test]
    async fn test_should_render_s3_error_for_missing_key() {
        let harness = harness();
        let (status, _, _) = send(&harness, "PUT", "/err-bucket", b"").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _, body) = send(&harness, "GET", "/err-bucket/ghost", b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("<Code>NoSuchKey</Code>"));
        assert!(text.contains("<Resource>"));
    }

    #[tokio::test]
    async fn test_should_serve_range_request() {
        let harness = harness();
        send(&harness, "PUT", "/range-bucket", b"").await;
        send(&harness, "PUT", "/range-bucket/k", b"hello world").await;

        // Signed headers do not include Range, so append it after signing.
        let (mut parts, body) = signed_request("GET", "/range-bucket/k", b"");
        parts
            .headers
            .insert("range", http::HeaderValue::from_static("bytes=6-10"));
        let response = handle_request(&harness.state, &harness.router, parts, body).await;
        assert_eq!(response.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            response
                .headers()
                .get(http::header::CONTENT_RANGE)
                .and_then(|v| v.to_str().ok()),
            Some("bytes 6-10/11")
        );
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body.as_ref(), b"world");
    }

    #[tokio::test]
    async fn test_should_refuse_writes_in_maintenance_mode() {
        let harness = harness();
        send(&harness, "PUT", "/maint-bucket", b"").await;

        harness.state.settings.write().maintenance_mode = true;
        let (status, _, body) = send(&harness, "PUT", "/maint-bucket/k", b"data").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(String::from_utf8_lossy(&body).contains("ServiceUnavailable"));

        // Reads still work.
        let (status, _, _) = send(&harness, "GET", "/maint-bucket?list-type=2", b"").await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn test_should_batch_delete_objects() {
        let harness = harness();
        send(&harness, "PUT", "/batch-bucket", b"").await;
        send(&harness, "PUT", "/batch-bucket/a", b"1").await;
        send(&harness, "PUT", "/batch-bucket/b", b"2").await;

        let delete_body = br"<Delete>
            <Object><Key>a</Key></Object>
            <Object><Key>b</Key></Object>
        </Delete>";
        let (status, _, body) =
            send(&harness, "POST", "/batch-bucket?delete", delete_body).await;
        assert_eq!(status, StatusCode::OK);
        let text = String::from_utf8_lossy(&body);
        assert!(text.contains("<Deleted>"));

        let (status, _, _) = send(&harness, "GET", "/batch-bucket/a", b"").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_should_rewrite_bucket_path_for_replica() {
        assert_eq!(
            rewrite_bucket_path("/b3/dir/key", "b3", "b3-copy"),
            "/b3-copy/dir/key"
        );
        assert_eq!(rewrite_bucket_path("/other/key", "b3", "x"), "/other/key");
    }

    #[test]
    fn test_should_strip_hop_by_hop_headers() {
        assert!(is_hop_by_hop("connection"));
        assert!(is_hop_by_hop("transfer-encoding"));
        assert!(is_hop_by_hop("host"));
        assert!(!is_hop_by_hop("x-amz-meta-team"));
        assert!(!is_hop_by_hop("content-type"));
    }
}
