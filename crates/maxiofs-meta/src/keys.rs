//! Key layout for the MetaStore.
//!
//! All records share one ordered keyspace. Prefixes keep record families
//! apart; within a family, key components are joined so that the natural
//! byte order of the store matches the required iteration order:
//!
//! ```text
//! tenant:{tenant_id}
//! tenantname:{name}                      -> tenant_id (uniqueness index)
//! user:{user_id}
//! username:{username}                    -> user_id (uniqueness index)
//! accesskey:{access_key_id}
//! bucket:{bucket_name}
//! objcur:{bucket}\0{key}                 -> current-version pointer
//! object:{bucket}\0{key}\0{sort_key}     -> version rows, newest first
//! mpu:{upload_id}
//! mpupart:{upload_id}:{part:05}
//! node:{node_id}
//! cluster:config
//! replrule:{rule_id}
//! replq:{inv_priority:03}:{enqueued:020}:{entry_id}
//! tomb:{kind}:{deleted_at:020}:{entity_id}
//! audit:{timestamp:020}:{id}
//! healthhist:{node_id}:{checked_at:020}
//! settings:dynamic
//! ```
//!
//! Object rows use NUL (`\0`) as the component separator: NUL is rejected in
//! object keys at validation time and sorts before every permitted byte, so
//! listing order over the `objcur:` prefix is exactly S3's
//! ascending-by-key order even when one key is a prefix of another.

use uuid::Uuid;

/// Separator for object-row components. Never appears in validated keys.
pub const OBJECT_SEP: char = '\u{0}';

/// `tenant:{id}`
#[must_use]
pub fn tenant(id: Uuid) -> String {
    format!("tenant:{id}")
}

/// `tenantname:{name}`, the uniqueness index mapping name to id.
#[must_use]
pub fn tenant_name(name: &str) -> String {
    format!("tenantname:{name}")
}

/// `user:{id}`
#[must_use]
pub fn user(id: Uuid) -> String {
    format!("user:{id}")
}

/// `username:{username}`, the uniqueness index mapping login to id.
#[must_use]
pub fn username(name: &str) -> String {
    format!("username:{name}")
}

/// `accesskey:{access_key_id}`
#[must_use]
pub fn access_key(access_key_id: &str) -> String {
    format!("accesskey:{access_key_id}")
}

/// Prefix of all access-key rows.
#[must_use]
pub fn access_key_prefix() -> String {
    "accesskey:".to_owned()
}

/// `bucket:{name}`
#[must_use]
pub fn bucket(name: &str) -> String {
    format!("bucket:{name}")
}

/// Prefix of all bucket rows.
#[must_use]
pub fn bucket_prefix() -> String {
    "bucket:".to_owned()
}

/// Current-version pointer row for `(bucket, key)`.
#[must_use]
pub fn object_current(bucket: &str, key: &str) -> String {
    format!("objcur:{bucket}{OBJECT_SEP}{key}")
}

/// Prefix of all current-version pointers in a bucket, optionally narrowed
/// by a key prefix.
#[must_use]
pub fn object_current_prefix(bucket: &str, key_prefix: &str) -> String {
    format!("objcur:{bucket}{OBJECT_SEP}{key_prefix}")
}

/// Version row for `(bucket, key, sort_key)`.
#[must_use]
pub fn object_version(bucket: &str, key: &str, sort_key: &str) -> String {
    format!("object:{bucket}{OBJECT_SEP}{key}{OBJECT_SEP}{sort_key}")
}

/// Prefix of all version rows of one key (newest first in scan order).
#[must_use]
pub fn object_versions_prefix(bucket: &str, key: &str) -> String {
    format!("object:{bucket}{OBJECT_SEP}{key}{OBJECT_SEP}")
}

/// Prefix of all version rows in a bucket, optionally narrowed by key prefix.
#[must_use]
pub fn object_versions_bucket_prefix(bucket: &str, key_prefix: &str) -> String {
    format!("object:{bucket}{OBJECT_SEP}{key_prefix}")
}

/// `mpu:{upload_id}`
#[must_use]
pub fn multipart(upload_id: &str) -> String {
    format!("mpu:{upload_id}")
}

/// Prefix of all multipart upload records.
#[must_use]
pub fn multipart_prefix() -> String {
    "mpu:".to_owned()
}

/// `mpupart:{upload_id}:{part:05}`
#[must_use]
pub fn multipart_part(upload_id: &str, part_number: u32) -> String {
    format!("mpupart:{upload_id}:{part_number:05}")
}

/// Prefix of all part rows of one upload, ascending by part number.
#[must_use]
pub fn multipart_parts_prefix(upload_id: &str) -> String {
    format!("mpupart:{upload_id}:")
}

/// `node:{id}`
#[must_use]
pub fn node(id: Uuid) -> String {
    format!("node:{id}")
}

/// Prefix of all cluster-node rows.
#[must_use]
pub fn node_prefix() -> String {
    "node:".to_owned()
}

/// The singleton local cluster configuration record.
#[must_use]
pub fn cluster_config() -> String {
    "cluster:config".to_owned()
}

/// `replrule:{id}`
#[must_use]
pub fn replication_rule(id: Uuid) -> String {
    format!("replrule:{id}")
}

/// Prefix of all replication-rule rows.
#[must_use]
pub fn replication_rule_prefix() -> String {
    "replrule:".to_owned()
}

/// Replication queue row. Priority is inverted so that higher-priority rules
/// sort first, then oldest-first within a priority.
#[must_use]
pub fn replication_queue(priority: u8, enqueued_micros: u64, entry_id: Uuid) -> String {
    let inverted = u8::MAX - priority;
    format!("replq:{inverted:03}:{enqueued_micros:020}:{entry_id}")
}

/// Prefix of all replication queue rows, in claim order.
#[must_use]
pub fn replication_queue_prefix() -> String {
    "replq:".to_owned()
}

/// `tomb:{kind}:{deleted_at:020}:{entity_id}`
#[must_use]
pub fn tombstone(kind: &str, deleted_at: i64, entity_id: &str) -> String {
    let ts = u64::try_from(deleted_at).unwrap_or(0);
    format!("tomb:{kind}:{ts:020}:{entity_id}")
}

/// Prefix of all tombstones of one kind, ascending by deletion time.
#[must_use]
pub fn tombstone_prefix(kind: &str) -> String {
    format!("tomb:{kind}:")
}

/// `audit:{timestamp:020}:{id}`
#[must_use]
pub fn audit(timestamp: i64, id: Uuid) -> String {
    let ts = u64::try_from(timestamp).unwrap_or(0);
    format!("audit:{ts:020}:{id}")
}

/// Prefix of all audit rows, ascending by time.
#[must_use]
pub fn audit_prefix() -> String {
    "audit:".to_owned()
}

/// `healthhist:{node_id}:{checked_at:020}`
#[must_use]
pub fn health_history(node_id: Uuid, checked_at: i64) -> String {
    let ts = u64::try_from(checked_at).unwrap_or(0);
    format!("healthhist:{node_id}:{ts:020}")
}

/// Prefix of one node's health history, ascending by time.
#[must_use]
pub fn health_history_prefix(node_id: Uuid) -> String {
    format!("healthhist:{node_id}:")
}

/// The singleton dynamic-settings record.
#[must_use]
pub fn dynamic_settings() -> String {
    "settings:dynamic".to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_order_object_rows_by_key_even_with_shared_prefixes() {
        // "a" must list before "a!" and "a0": the NUL separator sorts before
        // every permitted key byte.
        let a = object_current("b", "a");
        let a_bang = object_current("b", "a!");
        let a_zero = object_current("b", "a0");
        assert!(a < a_bang);
        assert!(a < a_zero);
        assert!(a_bang < a_zero);
    }

    #[test]
    fn test_should_scope_version_prefix_to_exact_key() {
        let rows_of_a = object_versions_prefix("b", "a");
        let row_of_ax = object_version("b", "ax", "0001");
        assert!(!row_of_ax.starts_with(&rows_of_a));
    }

    #[test]
    fn test_should_order_queue_rows_by_priority_then_age() {
        let id = Uuid::new_v4();
        let high_old = replication_queue(200, 1_000, id);
        let high_new = replication_queue(200, 2_000, id);
        let low_old = replication_queue(10, 500, id);
        assert!(high_old < high_new);
        assert!(high_new < low_old);
    }

    #[test]
    fn test_should_pad_part_numbers_for_ascending_scan() {
        let p2 = multipart_part("u", 2);
        let p10 = multipart_part("u", 10);
        assert!(p2 < p10);
    }

    #[test]
    fn test_should_pad_timestamps_in_audit_keys() {
        let id = Uuid::nil();
        let early = audit(9, id);
        let late = audit(10, id);
        assert!(early < late);
    }
}
