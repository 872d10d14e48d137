//! S3 operation handlers: typed dispatch into the engine.
//!
//! The service layer authenticates the caller and resolves routing; this
//! module executes the operation against the local engine and renders the
//! response. Cross-node forwarding never reaches these handlers.

use std::sync::Arc;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use tracing::debug;
use uuid::Uuid;

use maxiofs_core::types::{Bucket, VersioningState};
use maxiofs_core::{Error, Result};
use maxiofs_engine::WriteOrigin;
use maxiofs_engine::list::ListObjectsInput;
use maxiofs_engine::multipart::CreateMultipartInput;
use maxiofs_engine::object::{GetObjectInput, GetOutcome, PutObjectInput};

use crate::body::ResponseBody;
use crate::state::AppState;

use super::headers;
use super::operations::S3Operation;
use super::router::RoutingContext;
use super::xml;

/// The authenticated principal behind one S3 request.
#[derive(Debug, Clone)]
pub struct Caller {
    /// The access key that signed the request (empty on forwarded calls).
    pub access_key_id: String,
    /// The caller's tenant; `None` for global accounts.
    pub tenant_id: Option<Uuid>,
    /// The owning user.
    pub user_id: Option<Uuid>,
    /// Whether the caller is a global admin.
    pub is_global_admin: bool,
    /// Whether the caller may bypass GOVERNANCE retention.
    pub can_bypass_governance: bool,
}

/// An S3 response.
pub type S3Response = http::Response<ResponseBody>;

fn empty(status: StatusCode) -> Result<S3Response> {
    http::Response::builder()
        .status(status)
        .body(ResponseBody::empty())
        .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
}

fn xml_ok(body: Vec<u8>) -> Result<S3Response> {
    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::CONTENT_TYPE, "application/xml")
        .body(ResponseBody::full(body))
        .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
}

/// Load a bucket and enforce the tenant boundary.
fn authorize_bucket(state: &AppState, caller: &Caller, bucket: &str) -> Result<Bucket> {
    let record = state.engine.require_bucket(bucket)?;
    if caller.is_global_admin || caller.tenant_id == Some(record.tenant_id) {
        Ok(record)
    } else {
        // Hide other tenants' buckets entirely.
        Err(Error::NoSuchBucket {
            bucket: bucket.to_owned(),
        })
    }
}

fn require_bucket_name(ctx: &RoutingContext) -> Result<&str> {
    ctx.bucket
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("bucket required"))
}

fn require_key(ctx: &RoutingContext) -> Result<&str> {
    ctx.key
        .as_deref()
        .ok_or_else(|| Error::invalid_argument("object key required"))
}

fn version_param(ctx: &RoutingContext) -> Option<String> {
    ctx.query_value("versionId")
        .filter(|v| !v.is_empty())
        .map(ToOwned::to_owned)
}

/// Execute one locally routed operation.
#[allow(clippy::too_many_lines)]
pub async fn dispatch(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
    body: Bytes,
) -> Result<S3Response> {
    debug!(operation = %ctx.operation, bucket = ?ctx.bucket, key = ?ctx.key, "dispatching");

    match ctx.operation {
        S3Operation::ListBuckets => list_buckets(state, caller),
        S3Operation::CreateBucket => create_bucket(state, caller, ctx, request_headers),
        S3Operation::DeleteBucket => delete_bucket(state, caller, ctx).await,
        S3Operation::HeadBucket => {
            authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            empty(StatusCode::OK)
        }
        S3Operation::GetBucketLocation => {
            authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            xml_ok(xml::location_constraint(state.config.region.as_deref())?)
        }
        S3Operation::ListObjects | S3Operation::ListObjectsV2 => list_objects(state, caller, ctx),
        S3Operation::ListObjectVersions => list_versions(state, caller, ctx),
        S3Operation::GetBucketVersioning => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            xml_ok(xml::versioning_configuration(bucket.versioning)?)
        }
        S3Operation::PutBucketVersioning => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let requested = xml::parse_versioning(&body)?;
            state.engine.set_bucket_versioning(&bucket.name, requested)?;
            empty(StatusCode::OK)
        }
        S3Operation::GetBucketCors => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            match bucket.cors {
                Some(cors) => xml_ok(cors.into_bytes()),
                None => Err(Error::invalid_argument("no CORS configuration")),
            }
        }
        S3Operation::PutBucketCors => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let document = String::from_utf8(body.to_vec()).map_err(|_| Error::MalformedXml)?;
            state.engine.set_bucket_cors(&bucket.name, Some(document))?;
            empty(StatusCode::OK)
        }
        S3Operation::DeleteBucketCors => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            state.engine.set_bucket_cors(&bucket.name, None)?;
            empty(StatusCode::NO_CONTENT)
        }
        S3Operation::GetBucketPolicy => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            match bucket.policy {
                Some(policy) => http::Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, "application/json")
                    .body(ResponseBody::full(policy.into_bytes()))
                    .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}"))),
                None => Err(Error::invalid_argument("no bucket policy")),
            }
        }
        S3Operation::PutBucketPolicy => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let document = String::from_utf8(body.to_vec())
                .map_err(|_| Error::invalid_argument("policy must be UTF-8 JSON"))?;
            serde_json::from_str::<serde_json::Value>(&document)
                .map_err(|_| Error::invalid_argument("policy must be valid JSON"))?;
            state.engine.set_bucket_policy(&bucket.name, Some(document))?;
            empty(StatusCode::NO_CONTENT)
        }
        S3Operation::DeleteBucketPolicy => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            state.engine.set_bucket_policy(&bucket.name, None)?;
            empty(StatusCode::NO_CONTENT)
        }
        S3Operation::GetBucketNotification => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            match bucket.notifications {
                Some(config) => xml_ok(config.into_bytes()),
                None => xml_ok(b"<NotificationConfiguration/>".to_vec()),
            }
        }
        S3Operation::PutBucketNotification => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let document = String::from_utf8(body.to_vec()).map_err(|_| Error::MalformedXml)?;
            state
                .engine
                .set_bucket_notifications(&bucket.name, Some(document))?;
            empty(StatusCode::OK)
        }
        S3Operation::GetObjectLockConfig => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            if !bucket.object_lock_enabled {
                return Err(Error::invalid_argument(
                    "Object Lock is not enabled for this bucket",
                ));
            }
            xml_ok(xml::object_lock_configuration(true, bucket.default_retention)?)
        }
        S3Operation::PutObjectLockConfig => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let default_retention = xml::parse_object_lock_configuration(&body)?;
            state
                .engine
                .set_object_lock_config(&bucket.name, default_retention)?;
            empty(StatusCode::OK)
        }
        S3Operation::ListMultipartUploads => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let uploads = state.engine.list_multipart_uploads(&bucket.name)?;
            xml_ok(xml::list_multipart_uploads(&bucket.name, &uploads)?)
        }
        S3Operation::DeleteObjects => delete_objects(state, caller, ctx, request_headers, &body).await,

        S3Operation::PutObject => put_object(state, caller, ctx, request_headers, body).await,
        S3Operation::CopyObject => copy_object(state, caller, ctx, request_headers).await,
        S3Operation::GetObject => get_object(state, caller, ctx, request_headers, false).await,
        S3Operation::HeadObject => get_object(state, caller, ctx, request_headers, true).await,
        S3Operation::DeleteObject => delete_object(state, caller, ctx, request_headers).await,

        S3Operation::GetObjectTagging => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let tags = state.engine.get_object_tagging(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
            )?;
            xml_ok(xml::tagging(&tags)?)
        }
        S3Operation::PutObjectTagging => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let tags = xml::parse_tagging(&body)?;
            state.engine.put_object_tagging(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
                tags,
            )?;
            empty(StatusCode::OK)
        }
        S3Operation::DeleteObjectTagging => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            state.engine.delete_object_tagging(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
            )?;
            empty(StatusCode::NO_CONTENT)
        }
        S3Operation::GetObjectRetention => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let retention = state.engine.get_object_retention(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
            )?;
            xml_ok(xml::retention(retention)?)
        }
        S3Operation::PutObjectRetention => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let retention = xml::parse_retention(&body)?;
            let bypass =
                caller.can_bypass_governance && headers::bypass_governance(request_headers);
            state.engine.put_object_retention(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
                retention,
                bypass,
            )?;
            empty(StatusCode::OK)
        }
        S3Operation::GetObjectLegalHold => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let hold = state.engine.get_object_legal_hold(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
            )?;
            xml_ok(xml::legal_hold(hold)?)
        }
        S3Operation::PutObjectLegalHold => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let hold = xml::parse_legal_hold(&body)?;
            state.engine.put_object_legal_hold(
                &bucket.name,
                require_key(ctx)?,
                version_param(ctx).as_deref(),
                hold,
            )?;
            empty(StatusCode::OK)
        }
        S3Operation::GetObjectAcl => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            xml_ok(xml::object_acl(&bucket.tenant_id.to_string())?)
        }

        S3Operation::CreateMultipartUpload => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let upload = state.engine.create_multipart(CreateMultipartInput {
                bucket: bucket.name.clone(),
                key: require_key(ctx)?.to_owned(),
                content_type: headers::value(request_headers, "content-type")
                    .map(ToOwned::to_owned),
                user_metadata: headers::user_metadata(request_headers),
            })?;
            xml_ok(xml::initiate_multipart(&upload)?)
        }
        S3Operation::UploadPart => {
            authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let upload_id = ctx
                .query_value("uploadId")
                .ok_or_else(|| Error::invalid_argument("uploadId required"))?;
            let part_number: u32 = ctx
                .query_value("partNumber")
                .and_then(|v| v.parse().ok())
                .ok_or_else(|| Error::invalid_argument("invalid partNumber"))?;
            let etag = state.engine.upload_part(upload_id, part_number, body).await?;
            http::Response::builder()
                .status(StatusCode::OK)
                .header(http::header::ETAG, etag)
                .body(ResponseBody::empty())
                .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
        }
        S3Operation::CompleteMultipartUpload => {
            let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let key = require_key(ctx)?;
            let upload_id = ctx
                .query_value("uploadId")
                .ok_or_else(|| Error::invalid_argument("uploadId required"))?;
            let parts = xml::parse_complete_multipart(&body)?;
            let output = state.engine.complete_multipart(upload_id, &parts).await?;
            let location = format!("{}/{}/{key}", state.config.public_api_url, bucket.name);
            xml_ok(xml::complete_multipart(&bucket.name, key, &location, &output.etag)?)
        }
        S3Operation::AbortMultipartUpload => {
            authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let upload_id = ctx
                .query_value("uploadId")
                .ok_or_else(|| Error::invalid_argument("uploadId required"))?;
            state.engine.abort_multipart(upload_id).await?;
            empty(StatusCode::NO_CONTENT)
        }
        S3Operation::ListParts => {
            authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
            let upload_id = ctx
                .query_value("uploadId")
                .ok_or_else(|| Error::invalid_argument("uploadId required"))?;
            let (upload, parts) = state.engine.list_parts(upload_id)?;
            xml_ok(xml::list_parts(&upload, &parts)?)
        }
    }
}

// ---------------------------------------------------------------------------
// Individual handlers
// ---------------------------------------------------------------------------

fn list_buckets(state: &AppState, caller: &Caller) -> Result<S3Response> {
    let scope = if caller.is_global_admin {
        None
    } else {
        caller.tenant_id
    };
    let buckets = state.engine.list_buckets(scope)?;
    let entries: Vec<(String, i64)> = buckets
        .into_iter()
        .map(|b| (b.name, b.created_at))
        .collect();
    let owner = caller
        .tenant_id
        .map_or_else(|| "global".to_owned(), |t| t.to_string());
    xml_ok(xml::list_buckets(&owner, &entries)?)
}

fn create_bucket(
    state: &AppState,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
) -> Result<S3Response> {
    let name = require_bucket_name(ctx)?;
    let tenant_id = caller.tenant_id.ok_or(Error::AccessDenied)?;
    let object_lock_enabled = headers::value(request_headers, "x-amz-bucket-object-lock-enabled")
        .is_some_and(|v| v.eq_ignore_ascii_case("true"));

    state.engine.create_bucket(maxiofs_engine::bucket::CreateBucketInput {
        name: name.to_owned(),
        tenant_id,
        owner_user_id: caller.user_id.unwrap_or_else(Uuid::nil),
        versioning: VersioningState::Off,
        object_lock_enabled,
        default_retention: None,
        encryption_enabled: state.config.encryption_enabled,
    })?;
    state.router.invalidate(name);

    http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::LOCATION, format!("/{name}"))
        .body(ResponseBody::empty())
        .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
}

async fn delete_bucket(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    state.engine.delete_bucket(&bucket.name).await?;
    state.router.invalidate(&bucket.name);
    empty(StatusCode::NO_CONTENT)
}

fn list_objects(state: &AppState, caller: &Caller, ctx: &RoutingContext) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let prefix = ctx.query_value("prefix").unwrap_or("").to_owned();
    let delimiter = ctx
        .query_value("delimiter")
        .filter(|d| !d.is_empty())
        .map(ToOwned::to_owned);
    let max_keys = ctx
        .query_value("max-keys")
        .and_then(|v| v.parse().ok())
        .unwrap_or(1000);

    let v2 = ctx.operation == S3Operation::ListObjectsV2;
    let after_key = if v2 {
        ctx.query_value("continuation-token")
            .or_else(|| ctx.query_value("start-after"))
            .map(ToOwned::to_owned)
    } else {
        ctx.query_value("marker").map(ToOwned::to_owned)
    };

    let output = state.engine.list_objects(&ListObjectsInput {
        bucket: bucket.name.clone(),
        prefix: prefix.clone(),
        delimiter: delimiter.clone(),
        after_key: after_key.clone(),
        max_keys,
    })?;

    let body = if v2 {
        xml::list_objects_v2(
            &bucket.name,
            &prefix,
            delimiter.as_deref(),
            ctx.query_value("continuation-token"),
            max_keys,
            &output,
        )?
    } else {
        xml::list_objects_v1(
            &bucket.name,
            &prefix,
            delimiter.as_deref(),
            after_key.as_deref(),
            max_keys,
            &output,
        )?
    };
    xml_ok(body)
}

fn list_versions(state: &AppState, caller: &Caller, ctx: &RoutingContext) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let prefix = ctx.query_value("prefix").unwrap_or("");
    let output = state.engine.list_versions(
        &bucket.name,
        prefix,
        ctx.query_value("delimiter").filter(|d| !d.is_empty()),
        ctx.query_value("key-marker").filter(|m| !m.is_empty()),
        ctx.query_value("version-id-marker").filter(|m| !m.is_empty()),
        ctx.query_value("max-keys")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1000),
    )?;
    xml_ok(xml::list_versions(&bucket.name, prefix, &output)?)
}

async fn put_object(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
    body: Bytes,
) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let key = require_key(ctx)?;
    let (retention, legal_hold) = headers::object_lock_headers(request_headers)?;

    let output = state
        .engine
        .put_object(
            WriteOrigin::Client,
            PutObjectInput {
                bucket: bucket.name.clone(),
                key: key.to_owned(),
                content_type: headers::value(request_headers, "content-type")
                    .map(ToOwned::to_owned),
                user_metadata: headers::user_metadata(request_headers),
                tags: Vec::new(),
                retention,
                legal_hold,
                if_match: headers::value(request_headers, "if-match").map(ToOwned::to_owned),
                if_none_match: headers::value(request_headers, "if-none-match")
                    .map(ToOwned::to_owned),
                bypass_governance: caller.can_bypass_governance
                    && headers::bypass_governance(request_headers),
            },
            body,
        )
        .await?;

    let mut builder = http::Response::builder()
        .status(StatusCode::OK)
        .header(http::header::ETAG, &output.etag);
    if let Some(version_id) = &output.version_id {
        builder = builder.header("x-amz-version-id", version_id);
    }
    builder
        .body(ResponseBody::empty())
        .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
}

async fn copy_object(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
) -> Result<S3Response> {
    let dst_bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let dst_key = require_key(ctx)?;
    let (src_bucket_name, src_key, src_version) = headers::copy_source(request_headers)?;
    // The source must be readable by the same caller.
    authorize_bucket(state, caller, &src_bucket_name)?;

    let replace = headers::metadata_directive_is_replace(request_headers);
    let (retention, legal_hold) = headers::object_lock_headers(request_headers)?;

    let output = state
        .engine
        .copy_object(
            &src_bucket_name,
            &src_key,
            src_version.as_deref(),
            PutObjectInput {
                bucket: dst_bucket.name.clone(),
                key: dst_key.to_owned(),
                content_type: headers::value(request_headers, "content-type")
                    .map(ToOwned::to_owned),
                user_metadata: headers::user_metadata(request_headers),
                tags: Vec::new(),
                retention,
                legal_hold,
                if_match: None,
                if_none_match: None,
                bypass_governance: false,
            },
            replace,
        )
        .await?;

    xml_ok(xml::copy_object(&output.etag, maxiofs_core::ids::now_secs())?)
}

async fn get_object(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
    head_only: bool,
) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let key = require_key(ctx)?;

    let input = GetObjectInput {
        bucket: bucket.name.clone(),
        key: key.to_owned(),
        version_id: version_param(ctx),
        range: headers::parse_range(request_headers)?,
        if_match: headers::value(request_headers, "if-match").map(ToOwned::to_owned),
        if_none_match: headers::value(request_headers, "if-none-match").map(ToOwned::to_owned),
    };

    let outcome = if head_only {
        state.engine.head_object(&input)?
    } else {
        state.engine.get_object(input).await?
    };

    match outcome {
        GetOutcome::Found(found) => {
            let status = if found.content_range.is_some() {
                StatusCode::PARTIAL_CONTENT
            } else {
                StatusCode::OK
            };
            let mut builder = headers::apply_object_headers(
                http::Response::builder().status(status),
                &found.record,
            )
            .header(http::header::CONTENT_LENGTH, found.content_length);
            if let Some((start, end, total)) = found.content_range {
                builder =
                    builder.header(http::header::CONTENT_RANGE, format!("bytes {start}-{end}/{total}"));
            }
            let body = if head_only {
                ResponseBody::empty()
            } else {
                ResponseBody::stream(found.reader, found.content_length)
            };
            builder
                .body(body)
                .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
        }
        GetOutcome::DeleteMarker { version_id } => {
            // 404 that still names the marker.
            let body = xml::error_body("NoSuchKey", "The specified key does not exist", key);
            http::Response::builder()
                .status(StatusCode::NOT_FOUND)
                .header("x-amz-version-id", version_id)
                .header("x-amz-delete-marker", "true")
                .header(http::header::CONTENT_TYPE, "application/xml")
                .body(if head_only {
                    ResponseBody::empty()
                } else {
                    ResponseBody::full(body)
                })
                .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
        }
    }
}

async fn delete_object(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let bypass = caller.can_bypass_governance && headers::bypass_governance(request_headers);
    let outcome = state
        .engine
        .delete_object(
            WriteOrigin::Client,
            &bucket.name,
            require_key(ctx)?,
            version_param(ctx).as_deref(),
            bypass,
        )
        .await?;

    let mut builder = http::Response::builder().status(StatusCode::NO_CONTENT);
    if outcome.delete_marker {
        builder = builder.header("x-amz-delete-marker", "true");
    }
    if let Some(version_id) = &outcome.version_id {
        builder = builder.header("x-amz-version-id", version_id);
    }
    builder
        .body(ResponseBody::empty())
        .map_err(|e| Error::Internal(anyhow::anyhow!("build response: {e}")))
}

async fn delete_objects(
    state: &Arc<AppState>,
    caller: &Caller,
    ctx: &RoutingContext,
    request_headers: &HeaderMap,
    body: &[u8],
) -> Result<S3Response> {
    let bucket = authorize_bucket(state, caller, require_bucket_name(ctx)?)?;
    let (keys_to_delete, quiet) = xml::parse_batch_delete(body)?;
    let bypass = caller.can_bypass_governance && headers::bypass_governance(request_headers);

    let mut deleted = Vec::new();
    let mut errors = Vec::new();
    for (key, version_id) in keys_to_delete {
        match state
            .engine
            .delete_object(
                WriteOrigin::Client,
                &bucket.name,
                &key,
                version_id.as_deref(),
                bypass,
            )
            .await
        {
            Ok(outcome) => deleted.push((key, outcome.version_id)),
            Err(e) => errors.push((key, e.s3_code().to_owned(), e.to_string())),
        }
    }

    xml_ok(xml::delete_result(&deleted, &errors, quiet)?)
}
