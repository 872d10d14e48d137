//! Persisted domain records.
//!
//! Every record in the MetaStore is one of the serde structs in this module.
//! Timestamps are Unix epoch seconds, byte counts are `u64`, ids are UUIDs
//! unless a name doubles as the identity (bucket names are globally unique).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids;

// ---------------------------------------------------------------------------
// Tenant
// ---------------------------------------------------------------------------

/// A tenant: the isolation boundary that owns users, buckets, and quotas.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tenant {
    /// Tenant id.
    pub id: Uuid,
    /// Globally unique machine name.
    pub name: String,
    /// Human-facing name.
    pub display_name: String,
    /// Byte quota; 0 means unlimited.
    pub max_bytes: u64,
    /// Bytes currently consumed by live object versions.
    pub used_bytes: u64,
    /// Bucket quota; 0 means unlimited.
    pub max_buckets: u64,
    /// Buckets currently owned.
    pub used_buckets: u64,
    /// Access-key quota; 0 means unlimited.
    pub max_keys: u64,
    /// Access keys currently issued.
    pub used_keys: u64,
    /// Last mutation time, drives last-writer-wins reconciliation.
    pub updated_at: i64,
}

impl Tenant {
    /// A tenant may only be deleted once it owns nothing.
    #[must_use]
    pub fn is_deletable(&self) -> bool {
        self.used_buckets == 0 && self.used_keys == 0
    }
}

// ---------------------------------------------------------------------------
// User / roles
// ---------------------------------------------------------------------------

/// A role granted to a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Administrative rights within the user's scope.
    Admin,
    /// Regular object-storage user.
    User,
}

impl Role {
    /// String form used on the wire.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            other => Err(crate::Error::invalid_argument(format!(
                "unknown role: {other}"
            ))),
        }
    }
}

/// A console/management user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    /// User id.
    pub id: Uuid,
    /// Owning tenant; `None` marks a global account.
    pub tenant_id: Option<Uuid>,
    /// Globally unique login name.
    pub username: String,
    /// Opaque password hash; produced and checked by the identity layer.
    pub password_hash: String,
    /// Granted roles.
    pub roles: Vec<Role>,
    /// Last mutation time.
    pub updated_at: i64,
    /// Lockout expiry after repeated failed logins.
    pub locked_until: Option<i64>,
    /// Consecutive failed login attempts.
    pub failed_attempts: u32,
}

impl User {
    /// A global admin has no tenant and holds the admin role.
    #[must_use]
    pub fn is_global_admin(&self) -> bool {
        self.tenant_id.is_none() && self.roles.contains(&Role::Admin)
    }

    /// Whether the account is currently locked out.
    #[must_use]
    pub fn is_locked(&self, now: i64) -> bool {
        self.locked_until.is_some_and(|until| now < until)
    }
}

// ---------------------------------------------------------------------------
// AccessKey
// ---------------------------------------------------------------------------

/// An S3 access key pair bound to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessKey {
    /// Record id.
    pub id: Uuid,
    /// The public access key id (unique).
    pub access_key_id: String,
    /// The secret key.
    pub secret_key: String,
    /// Owning user.
    pub user_id: Uuid,
    /// Tenant, denormalized from the user for one-hop auth lookups.
    pub tenant_id: Option<Uuid>,
}

// ---------------------------------------------------------------------------
// Bucket
// ---------------------------------------------------------------------------

/// Bucket versioning state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VersioningState {
    /// Versioning was never enabled.
    #[default]
    Off,
    /// Every write creates a new version; deletes write markers.
    Enabled,
    /// New writes use the `null` version; old versions are retained.
    Suspended,
}

impl VersioningState {
    /// The S3 wire value (`Enabled` / `Suspended`); `Off` has no wire form.
    #[must_use]
    pub fn as_wire_str(&self) -> Option<&'static str> {
        match self {
            Self::Off => None,
            Self::Enabled => Some("Enabled"),
            Self::Suspended => Some("Suspended"),
        }
    }
}

/// Object Lock retention mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RetentionMode {
    /// Non-bypassable retention.
    Compliance,
    /// Retention bypassable by privileged callers.
    Governance,
}

impl RetentionMode {
    /// The S3 wire value.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliance => "COMPLIANCE",
            Self::Governance => "GOVERNANCE",
        }
    }
}

impl FromStr for RetentionMode {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "COMPLIANCE" => Ok(Self::Compliance),
            "GOVERNANCE" => Ok(Self::Governance),
            other => Err(crate::Error::invalid_argument(format!(
                "unknown retention mode: {other}"
            ))),
        }
    }
}

/// Retention applied to a single object version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Retention {
    /// Retention mode.
    pub mode: RetentionMode,
    /// Retain-until instant (epoch seconds).
    pub until: i64,
}

impl Retention {
    /// Whether the retention window is still open.
    #[must_use]
    pub fn is_active(&self, now: i64) -> bool {
        now < self.until
    }
}

/// Bucket-level default retention, applied to new versions at write time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefaultRetention {
    /// Retention mode for new versions.
    pub mode: RetentionMode,
    /// Retention period in seconds from write time.
    pub period_secs: u64,
}

/// A bucket record. Bucket names are globally unique across tenants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bucket {
    /// Globally unique name; doubles as the record identity.
    pub name: String,
    /// Owning tenant.
    pub tenant_id: Uuid,
    /// The user who created the bucket.
    pub owner_user_id: Uuid,
    /// The cluster node that owns the bucket's data.
    pub node_id: Uuid,
    /// Creation time.
    pub created_at: i64,
    /// Versioning state.
    pub versioning: VersioningState,
    /// Object Lock availability; immutable after create.
    pub object_lock_enabled: bool,
    /// Default retention applied to new versions.
    pub default_retention: Option<DefaultRetention>,
    /// Raw CORS configuration document, as received.
    pub cors: Option<String>,
    /// Raw bucket policy document, as received.
    pub policy: Option<String>,
    /// Raw notification configuration document, as received.
    pub notifications: Option<String>,
    /// Whether new objects are encrypted at rest.
    pub encryption_enabled: bool,
    /// Last mutation time.
    pub updated_at: i64,
}

// ---------------------------------------------------------------------------
// ObjectRecord
// ---------------------------------------------------------------------------

/// One object version (or delete marker) in a bucket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectRecord {
    /// Owning bucket name.
    pub bucket: String,
    /// Object key.
    pub key: String,
    /// Version id presented on the wire; `"null"` for non-versioned writes.
    pub version_id: String,
    /// Internal sort key; ascending order is newest-first. Equal to
    /// `version_id` except for `null` versions, which get a generated key.
    pub sort_key: String,
    /// Plaintext size in bytes; 0 for delete markers.
    pub size: u64,
    /// Quoted ETag (`"<md5>"` or composite `"<md5>-<n>"`).
    pub etag: String,
    /// MIME type.
    pub content_type: String,
    /// User metadata from `x-amz-meta-*` headers.
    pub user_metadata: HashMap<String, String>,
    /// Object tags.
    pub tags: Vec<(String, String)>,
    /// Creation time.
    pub created_at: i64,
    /// Whether the blob is AES-256-CTR encrypted.
    pub encrypted: bool,
    /// Hex-encoded 16-byte IV when encrypted.
    pub iv_hex: Option<String>,
    /// Per-version retention.
    pub retention: Option<Retention>,
    /// Legal hold flag; blocks deletion regardless of retention.
    pub legal_hold: bool,
    /// Whether this version is a delete marker (no payload).
    pub is_delete_marker: bool,
    /// Blob reference in the BlobStore; `None` for delete markers.
    pub blob_ref: Option<String>,
}

impl ObjectRecord {
    /// The version id to surface in `x-amz-version-id`, if any.
    #[must_use]
    pub fn wire_version_id(&self) -> Option<&str> {
        if self.version_id == ids::NULL_VERSION_ID {
            None
        } else {
            Some(&self.version_id)
        }
    }

    /// Whether any Object Lock protection currently applies.
    #[must_use]
    pub fn is_protected(&self, now: i64) -> bool {
        self.legal_hold || self.retention.is_some_and(|r| r.is_active(now))
    }
}

// ---------------------------------------------------------------------------
// Multipart uploads
// ---------------------------------------------------------------------------

/// An in-progress multipart upload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultipartUpload {
    /// Upload id.
    pub upload_id: String,
    /// Destination bucket.
    pub bucket: String,
    /// Destination key.
    pub key: String,
    /// Owning tenant (denormalized for quota release on abort).
    pub tenant_id: Uuid,
    /// Content type for the final object.
    pub content_type: String,
    /// User metadata for the final object.
    pub user_metadata: HashMap<String, String>,
    /// Whether parts are written encrypted.
    pub encrypted: bool,
    /// Initiation time.
    pub initiated_at: i64,
}

/// One uploaded part, stored as its own row so concurrent part uploads do
/// not contend on the upload record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadPart {
    /// Part number, 1-based.
    pub part_number: u32,
    /// Unquoted MD5 hex of the part's plaintext.
    pub etag: String,
    /// Part size in bytes.
    pub size: u64,
    /// Blob reference for the part payload.
    pub blob_ref: String,
    /// Hex IV when the part is encrypted.
    pub iv_hex: Option<String>,
    /// Upload time.
    pub uploaded_at: i64,
}

// ---------------------------------------------------------------------------
// Cluster
// ---------------------------------------------------------------------------

/// Health classification of a peer node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeHealth {
    /// Never probed.
    #[default]
    Unknown,
    /// Responding under one second.
    Healthy,
    /// Responding, but slowly (1-5 s).
    Degraded,
    /// Timed out or errored.
    Unavailable,
}

impl NodeHealth {
    /// String form used on the wire and in metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Healthy => "healthy",
            Self::Degraded => "degraded",
            Self::Unavailable => "unavailable",
        }
    }

    /// Whether the node can serve forwarded requests.
    #[must_use]
    pub fn is_reachable(&self) -> bool {
        matches!(self, Self::Healthy | Self::Degraded)
    }
}

/// A peer node in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node id.
    pub id: Uuid,
    /// Operator-assigned name.
    pub name: String,
    /// Base URL of the peer's S3 listener (scheme + host + port).
    pub endpoint: String,
    /// Shared HMAC secret for inter-node requests.
    pub node_token: String,
    /// Routing priority; lower wins when several replicas qualify.
    pub priority: u8,
    /// Optional region label.
    pub region: Option<String>,
    /// Last classified health.
    pub health: NodeHealth,
    /// Time of the last probe.
    pub last_check_at: Option<i64>,
    /// Time of the last successful probe.
    pub last_seen_at: Option<i64>,
    /// Latency of the last successful probe.
    pub latency_ms: Option<u64>,
    /// Advertised total capacity in bytes.
    pub capacity_total: u64,
    /// Advertised used capacity in bytes.
    pub capacity_used: u64,
    /// Number of buckets owned by the node.
    pub bucket_count: u64,
    /// Last mutation time.
    pub updated_at: i64,
}

/// A single health-probe observation, kept as history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSample {
    /// Probed node.
    pub node_id: Uuid,
    /// Probe time.
    pub checked_at: i64,
    /// Classified health.
    pub health: NodeHealth,
    /// Measured latency; absent on timeout.
    pub latency_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Replication
// ---------------------------------------------------------------------------

/// A bucket replication rule: copy PUT/DELETE events from a local source
/// bucket to a bucket on a peer node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationRule {
    /// Rule id.
    pub id: Uuid,
    /// Local source bucket name.
    pub source_bucket: String,
    /// Destination peer node.
    pub destination_node_id: Uuid,
    /// Destination bucket name on the peer.
    pub destination_bucket: String,
    /// Sync loop interval in seconds.
    pub sync_interval_s: u64,
    /// Whether the rule is active.
    pub enabled: bool,
    /// Whether DELETE events propagate.
    pub replicate_deletes: bool,
    /// Whether user metadata propagates.
    pub replicate_metadata: bool,
    /// Only keys with this prefix replicate; empty matches all.
    pub prefix_filter: String,
    /// Queue priority; higher drains first.
    pub priority: u8,
    /// Completion time of the most recent successful transfer.
    pub last_sync_at: Option<i64>,
    /// Most recent transfer error.
    pub last_error: Option<String>,
    /// Objects replicated since rule creation.
    pub objects_replicated: u64,
    /// Bytes replicated since rule creation.
    pub bytes_replicated: u64,
    /// Last mutation time.
    pub updated_at: i64,
}

impl ReplicationRule {
    /// Whether a mutation of `(bucket, key)` falls under this rule.
    #[must_use]
    pub fn matches(&self, bucket: &str, key: &str) -> bool {
        self.enabled
            && self.source_bucket == bucket
            && (self.prefix_filter.is_empty() || key.starts_with(&self.prefix_filter))
    }
}

/// Replicated operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReplicationOp {
    /// Push the current version to the destination.
    Put,
    /// Propagate a delete.
    Delete,
}

/// Lifecycle state of a queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for a worker.
    Pending,
    /// Claimed by a worker.
    InFlight,
    /// Transferred successfully. Terminal.
    Done,
    /// Attempts exhausted. Terminal.
    Failed,
}

/// A durable replication work item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationQueueEntry {
    /// Entry id.
    pub id: Uuid,
    /// The rule that produced this entry.
    pub rule_id: Uuid,
    /// Source bucket.
    pub bucket: String,
    /// Source key.
    pub key: String,
    /// Operation to replay on the destination.
    pub op: ReplicationOp,
    /// Current state.
    pub status: QueueStatus,
    /// Attempts so far.
    pub attempts: u32,
    /// Attempt ceiling before the entry fails terminally.
    pub max_attempts: u32,
    /// Earliest time the next attempt may run.
    pub next_attempt_at: i64,
    /// Most recent attempt error.
    pub last_error: Option<String>,
    /// Enqueue time.
    pub enqueued_at: i64,
}

// ---------------------------------------------------------------------------
// Tombstones / audit
// ---------------------------------------------------------------------------

/// Append-only deletion record; prevents resurrection of deleted entities
/// during stale-node reconciliation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tombstone {
    /// Entity kind (`bucket`, `object`, `user`, `accesskey`, ...).
    pub entity_kind: String,
    /// Entity identity within its kind.
    pub entity_id: String,
    /// Deletion time.
    pub deleted_at: i64,
    /// Owning tenant, when applicable.
    pub tenant_id: Option<Uuid>,
}

/// An audit-log record for an administrative mutation or auth event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Event time.
    pub timestamp: i64,
    /// Acting username, or `-` for unauthenticated events.
    pub actor: String,
    /// Tenant scope of the action.
    pub tenant: Option<Uuid>,
    /// Action name (`tenant.create`, `auth.login.failed`, ...).
    pub action: String,
    /// Affected resource.
    pub resource: String,
    /// Outcome (`ok`, `denied`, `error`).
    pub status: String,
    /// Client address.
    pub ip: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_identify_global_admin() {
        let user = User {
            id: Uuid::new_v4(),
            tenant_id: None,
            username: "root".to_owned(),
            password_hash: "x".to_owned(),
            roles: vec![Role::Admin],
            updated_at: 0,
            locked_until: None,
            failed_attempts: 0,
        };
        assert!(user.is_global_admin());

        let scoped = User {
            tenant_id: Some(Uuid::new_v4()),
            ..user.clone()
        };
        assert!(!scoped.is_global_admin());
    }

    #[test]
    fn test_should_report_lockout_window() {
        let mut user = User {
            id: Uuid::new_v4(),
            tenant_id: None,
            username: "alice".to_owned(),
            password_hash: "x".to_owned(),
            roles: vec![Role::User],
            updated_at: 0,
            locked_until: Some(100),
            failed_attempts: 3,
        };
        assert!(user.is_locked(50));
        assert!(!user.is_locked(150));
        user.locked_until = None;
        assert!(!user.is_locked(50));
    }

    #[test]
    fn test_should_gate_tenant_deletion_on_usage() {
        let mut tenant = Tenant {
            id: Uuid::new_v4(),
            name: "acme".to_owned(),
            display_name: "Acme".to_owned(),
            max_bytes: 0,
            used_bytes: 0,
            max_buckets: 0,
            used_buckets: 1,
            max_keys: 0,
            used_keys: 0,
            updated_at: 0,
        };
        assert!(!tenant.is_deletable());
        tenant.used_buckets = 0;
        assert!(tenant.is_deletable());
    }

    #[test]
    fn test_should_roundtrip_retention_mode() {
        assert_eq!(
            "COMPLIANCE".parse::<RetentionMode>().unwrap(),
            RetentionMode::Compliance
        );
        assert_eq!(RetentionMode::Governance.as_str(), "GOVERNANCE");
        assert!("compliance".parse::<RetentionMode>().is_err());
    }

    #[test]
    fn test_should_expose_versioning_wire_values() {
        assert_eq!(VersioningState::Off.as_wire_str(), None);
        assert_eq!(VersioningState::Enabled.as_wire_str(), Some("Enabled"));
        assert_eq!(VersioningState::Suspended.as_wire_str(), Some("Suspended"));
    }

    #[test]
    fn test_should_match_replication_rules_by_bucket_and_prefix() {
        let mut rule = ReplicationRule {
            id: Uuid::new_v4(),
            source_bucket: "photos".to_owned(),
            destination_node_id: Uuid::new_v4(),
            destination_bucket: "photos".to_owned(),
            sync_interval_s: 1,
            enabled: true,
            replicate_deletes: true,
            replicate_metadata: true,
            prefix_filter: "raw/".to_owned(),
            priority: 5,
            last_sync_at: None,
            last_error: None,
            objects_replicated: 0,
            bytes_replicated: 0,
            updated_at: 0,
        };
        assert!(rule.matches("photos", "raw/img.cr2"));
        assert!(!rule.matches("photos", "jpeg/img.jpg"));
        assert!(!rule.matches("docs", "raw/img.cr2"));
        rule.enabled = false;
        assert!(!rule.matches("photos", "raw/img.cr2"));
    }

    #[test]
    fn test_should_protect_record_under_legal_hold_or_retention() {
        let mut rec = ObjectRecord {
            bucket: "b".to_owned(),
            key: "k".to_owned(),
            version_id: "v1".to_owned(),
            sort_key: "v1".to_owned(),
            size: 3,
            etag: "\"abc\"".to_owned(),
            content_type: "text/plain".to_owned(),
            user_metadata: HashMap::new(),
            tags: Vec::new(),
            created_at: 0,
            encrypted: false,
            iv_hex: None,
            retention: None,
            legal_hold: false,
            is_delete_marker: false,
            blob_ref: Some("r".to_owned()),
        };
        assert!(!rec.is_protected(100));

        rec.retention = Some(Retention {
            mode: RetentionMode::Compliance,
            until: 200,
        });
        assert!(rec.is_protected(100));
        assert!(!rec.is_protected(300));

        rec.retention = None;
        rec.legal_hold = true;
        assert!(rec.is_protected(1_000_000));
    }

    #[test]
    fn test_should_hide_null_version_id_on_wire() {
        let rec = ObjectRecord {
            bucket: "b".to_owned(),
            key: "k".to_owned(),
            version_id: crate::ids::NULL_VERSION_ID.to_owned(),
            sort_key: "ffff".to_owned(),
            size: 0,
            etag: String::new(),
            content_type: String::new(),
            user_metadata: HashMap::new(),
            tags: Vec::new(),
            created_at: 0,
            encrypted: false,
            iv_hex: None,
            retention: None,
            legal_hold: false,
            is_delete_marker: false,
            blob_ref: None,
        };
        assert_eq!(rec.wire_version_id(), None);
    }

    #[test]
    fn test_should_classify_reachable_health_states() {
        assert!(NodeHealth::Healthy.is_reachable());
        assert!(NodeHealth::Degraded.is_reachable());
        assert!(!NodeHealth::Unavailable.is_reachable());
        assert!(!NodeHealth::Unknown.is_reachable());
    }

    #[test]
    fn test_should_serialize_queue_status_as_snake_case() {
        let json = serde_json::to_string(&QueueStatus::InFlight).unwrap();
        assert_eq!(json, "\"in_flight\"");
    }
}
