//! `/_internal` peer endpoints.
//!
//! Every inbound request must carry the signed header set from
//! [`maxiofs_cluster::rpc`]; the sender is looked up in the peer registry
//! and unknown senders get 401 before anything else happens. Bodies are
//! JSON except for replication object writes, which carry the plaintext
//! payload plus metadata headers.

use std::sync::Arc;

use bytes::Bytes;
use http::StatusCode;
use percent_encoding::percent_decode_str;
use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_cluster::reconcile::StateSnapshot;
use maxiofs_cluster::router::BucketOwnerResponse;
use maxiofs_cluster::rpc::{
    SIGNED_HEADER_NODE, SIGNED_HEADER_NONCE, SIGNED_HEADER_SIGNATURE, SIGNED_HEADER_TIMESTAMP,
    SignedHeaders, verify_inbound,
};
use maxiofs_core::types::{AccessKey, Bucket, ClusterNode, Tenant, User};
use maxiofs_core::{Error, Result, ids};
use maxiofs_engine::WriteOrigin;
use maxiofs_engine::object::PutObjectInput;
use maxiofs_meta::keys;

use crate::body::ResponseBody;
use crate::s3::headers;
use crate::state::AppState;

type Response = http::Response<ResponseBody>;

/// Verify the signed header set of an inbound peer request. Returns the
/// sender's node id.
pub fn verify_signed_request(
    state: &Arc<AppState>,
    parts: &http::request::Parts,
    body: &[u8],
) -> Result<Uuid> {
    let header = |name: &str| -> Result<String> {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(ToOwned::to_owned)
            .ok_or(Error::Unauthorized)
    };

    let node_id: Uuid = header(SIGNED_HEADER_NODE)?
        .parse()
        .map_err(|_| Error::Unauthorized)?;
    let timestamp: i64 = header(SIGNED_HEADER_TIMESTAMP)?
        .parse()
        .map_err(|_| Error::Unauthorized)?;
    let signed = SignedHeaders {
        node_id,
        timestamp,
        nonce: header(SIGNED_HEADER_NONCE)?,
        signature: header(SIGNED_HEADER_SIGNATURE)?,
    };

    // The sender must be a registered peer; its stored token (or the
    // shared cluster token) verifies the signature.
    let peer: Option<ClusterNode> = state.meta.get(&keys::node(node_id))?;
    let token = match &peer {
        Some(peer) if !peer.node_token.is_empty() => Some(peer.node_token.clone()),
        Some(_) => state.manager.node_token(),
        None => None,
    };

    verify_inbound(
        parts.method.as_str(),
        parts.uri.path(),
        &signed,
        token.as_deref(),
        body,
        ids::now_secs(),
    )
}

/// Serve one `/_internal` request.
pub async fn handle(state: &Arc<AppState>, parts: &http::request::Parts, body: Bytes) -> Response {
    let sender = match verify_signed_request(state, parts, &body) {
        Ok(sender) => sender,
        Err(err) => {
            warn!(path = %parts.uri.path(), error = %err, "rejected internal request");
            return json_error(StatusCode::UNAUTHORIZED, "unauthorized");
        }
    };
    debug!(sender = %sender, path = %parts.uri.path(), "internal request");

    let path = parts.uri.path().to_owned();
    let method = parts.method.clone();

    let result = if let Some(rest) = path.strip_prefix("/_internal/object/") {
        match split_object_path(rest) {
            Some((bucket, key)) => match method {
                http::Method::PUT => replicated_put(state, parts, &bucket, &key, body).await,
                http::Method::DELETE => replicated_delete(state, &bucket, &key).await,
                _ => Err(Error::invalid_argument("unsupported method")),
            },
            None => Err(Error::invalid_argument("invalid object path")),
        }
    } else if path == "/_internal/tenant-sync" && method == http::Method::POST {
        tenant_sync(state, &body)
    } else if path == "/_internal/state-snapshot" && method == http::Method::GET {
        state_snapshot(state)
    } else if let Some(bucket) = path.strip_prefix("/_internal/bucket-owner/") {
        bucket_owner(state, bucket)
    } else {
        Err(Error::invalid_argument("unknown internal endpoint"))
    };

    result.unwrap_or_else(|err| {
        let status =
            StatusCode::from_u16(err.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        json_error(status, &err.to_string())
    })
}

fn split_object_path(rest: &str) -> Option<(String, String)> {
    let (bucket, key) = rest.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((
        percent_decode_str(bucket).decode_utf8_lossy().into_owned(),
        percent_decode_str(key).decode_utf8_lossy().into_owned(),
    ))
}

/// Apply a replicated PUT. The payload arrives as plaintext; this node
/// re-encrypts under its own key if the destination bucket asks for it, and
/// the write never cascades into this node's own replication queue.
async fn replicated_put(
    state: &Arc<AppState>,
    parts: &http::request::Parts,
    bucket: &str,
    key: &str,
    body: Bytes,
) -> Result<Response> {
    let output = state
        .engine
        .put_object(
            WriteOrigin::Replication,
            PutObjectInput {
                bucket: bucket.to_owned(),
                key: key.to_owned(),
                content_type: headers::value(&parts.headers, "content-type")
                    .map(ToOwned::to_owned),
                user_metadata: headers::user_metadata(&parts.headers),
                tags: Vec::new(),
                retention: None,
                legal_hold: false,
                if_match: None,
                if_none_match: None,
                bypass_governance: false,
            },
            body,
        )
        .await?;

    json_ok(&serde_json::json!({
        "etag": output.etag,
        "size": output.size,
        "version_id": output.version_id,
    }))
}

async fn replicated_delete(state: &Arc<AppState>, bucket: &str, key: &str) -> Result<Response> {
    state
        .engine
        .delete_object(WriteOrigin::Replication, bucket, key, None, false)
        .await?;
    Ok(empty(StatusCode::NO_CONTENT))
}

/// Last-writer-wins upsert of a pushed tenant record.
fn tenant_sync(state: &Arc<AppState>, body: &[u8]) -> Result<Response> {
    let incoming: Tenant =
        serde_json::from_slice(body).map_err(|_| Error::invalid_argument("invalid tenant body"))?;

    state.meta.update(|txn| {
        let key = keys::tenant(incoming.id);
        match txn.get::<Tenant>(&key)? {
            Some(local) if local.updated_at >= incoming.updated_at => Ok(()),
            _ => {
                txn.put(&key, &incoming)?;
                txn.put(&keys::tenant_name(&incoming.name), &incoming.id)
            }
        }
    })?;
    Ok(empty(StatusCode::OK))
}

/// Full management-state snapshot for stale-node reconciliation.
fn state_snapshot(state: &Arc<AppState>) -> Result<Response> {
    let snapshot = StateSnapshot {
        tenants: state.meta.scan_values::<Tenant>("tenant:")?,
        users: state.meta.scan_values::<User>("user:")?,
        access_keys: state.meta.scan_values::<AccessKey>(&keys::access_key_prefix())?,
    };
    json_ok(&snapshot)
}

/// Federated bucket resolution.
fn bucket_owner(state: &Arc<AppState>, bucket: &str) -> Result<Response> {
    let record: Option<Bucket> = state.meta.get(&keys::bucket(bucket))?;
    match record {
        Some(bucket) => json_ok(&BucketOwnerResponse {
            node_id: bucket.node_id,
        }),
        None => Err(Error::NoSuchBucket {
            bucket: bucket.to_owned(),
        }),
    }
}

fn json_ok<T: serde::Serialize>(value: &T) -> Result<Response> {
    let body = serde_json::to_vec(value)
        .map_err(|e| Error::Internal(anyhow::anyhow!("encode response: {e}")))?;
    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(ResponseBody::full(body))
        .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
}

fn json_error(status: StatusCode, message: &str) -> Response {
    let body = serde_json::json!({ "error": message }).to_string();
    http::Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(ResponseBody::full(body))
        .unwrap_or_else(|_| http::Response::new(ResponseBody::empty()))
}

fn empty(status: StatusCode) -> Response {
    http::Response::builder()
        .status(status)
        .body(ResponseBody::empty())
        .unwrap_or_else(|_| http::Response::new(ResponseBody::empty()))
}
