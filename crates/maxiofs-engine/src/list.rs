//! Listings: objects (V1/V2) and versions.
//!
//! The `objcur:` pointer rows already sit in ascending key order, so a
//! listing is a bounded prefix scan with delimiter grouping on top. Markers
//! and continuation tokens are plain object keys, applied as exclusive
//! scan lower bounds.

use std::collections::BTreeSet;

use maxiofs_core::Result;
use maxiofs_core::types::ObjectRecord;
use maxiofs_meta::keys;

use crate::ObjectEngine;

/// Scan page size against the store.
const SCAN_CHUNK: usize = 1000;

/// Inputs shared by ListObjects V1 and V2.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsInput {
    /// Bucket to list.
    pub bucket: String,
    /// Key prefix filter.
    pub prefix: String,
    /// Delimiter for common-prefix grouping (typically `/`).
    pub delimiter: Option<String>,
    /// Exclusive lower bound: V1 `marker`, V2 `continuation-token` /
    /// `start-after`.
    pub after_key: Option<String>,
    /// Page size ceiling.
    pub max_keys: usize,
}

/// One page of a listing.
#[derive(Debug, Clone, Default)]
pub struct ListObjectsOutput {
    /// Current object versions, ascending by key. Delete markers excluded.
    pub objects: Vec<ObjectRecord>,
    /// Grouped common prefixes, ascending.
    pub common_prefixes: Vec<String>,
    /// Whether more results exist past this page.
    pub is_truncated: bool,
    /// Key to resume after (`NextMarker` / `NextContinuationToken`).
    pub next_after_key: Option<String>,
}

/// One page of a version listing.
#[derive(Debug, Clone, Default)]
pub struct ListVersionsOutput {
    /// Version rows (objects and delete markers), ascending by key then
    /// newest version first.
    pub versions: Vec<ObjectRecord>,
    /// Grouped common prefixes.
    pub common_prefixes: Vec<String>,
    /// Whether more results exist.
    pub is_truncated: bool,
    /// `(key, version_id)` to resume after.
    pub next_marker: Option<(String, String)>,
}

impl ObjectEngine {
    /// List current objects under a prefix with optional delimiter
    /// grouping. Serves both ListObjects and ListObjectsV2.
    pub fn list_objects(&self, input: &ListObjectsInput) -> Result<ListObjectsOutput> {
        self.require_bucket(&input.bucket)?;
        let max_keys = input.max_keys.clamp(1, 1000);
        let scan_prefix = keys::object_current_prefix(&input.bucket, &input.prefix);

        let mut output = ListObjectsOutput::default();
        let mut seen_prefixes: BTreeSet<String> = BTreeSet::new();
        let mut cursor = input
            .after_key
            .as_ref()
            .map(|k| keys::object_current(&input.bucket, k));

        'scan: loop {
            let rows =
                self.meta()
                    .scan_prefix(&scan_prefix, cursor.as_deref(), SCAN_CHUNK)?;
            if rows.is_empty() {
                break;
            }

            for (row_key, bytes) in &rows {
                cursor = Some(row_key.clone());
                let record: ObjectRecord = serde_json::from_slice(bytes).map_err(|e| {
                    maxiofs_core::Error::Internal(anyhow::anyhow!(
                        "corrupt record at {row_key}: {e}"
                    ))
                })?;
                if record.is_delete_marker {
                    continue;
                }

                // Delimiter grouping: everything between the prefix and the
                // next delimiter becomes one rolled-up entry.
                if let Some(delimiter) = input.delimiter.as_deref().filter(|d| !d.is_empty()) {
                    let rest = &record.key[input.prefix.len()..];
                    if let Some(pos) = rest.find(delimiter) {
                        let group = format!(
                            "{}{}{delimiter}",
                            input.prefix,
                            &rest[..pos]
                        );
                        if seen_prefixes.insert(group.clone()) {
                            if entry_count(&output) >= max_keys {
                                output.is_truncated = true;
                                output.next_after_key = last_entry_key(&output);
                                break 'scan;
                            }
                            output.common_prefixes.push(group);
                        }
                        continue;
                    }
                }

                if entry_count(&output) >= max_keys {
                    output.is_truncated = true;
                    output.next_after_key = last_entry_key(&output);
                    break 'scan;
                }
                output.objects.push(record);
            }

            if rows.len() < SCAN_CHUNK {
                break;
            }
        }

        Ok(output)
    }

    /// List stored versions (objects and delete markers) under a prefix.
    /// Natural row order already matches S3: ascending key, then newest
    /// version first.
    pub fn list_versions(
        &self,
        bucket: &str,
        prefix: &str,
        delimiter: Option<&str>,
        key_marker: Option<&str>,
        version_marker: Option<&str>,
        max_keys: usize,
    ) -> Result<ListVersionsOutput> {
        self.require_bucket(bucket)?;
        let max_keys = max_keys.clamp(1, 1000);
        let scan_prefix = keys::object_versions_bucket_prefix(bucket, prefix);

        // Resume point: after (key, version) when both given, otherwise
        // after all rows of key_marker.
        let mut cursor = match (key_marker, version_marker) {
            (Some(key), Some(version)) => Some(keys::object_version(bucket, key, version)),
            (Some(key), None) => {
                // The separator's successor skips every version row of the
                // marker key.
                Some(format!(
                    "{}{}",
                    keys::object_versions_prefix(bucket, key),
                    char::MAX
                ))
            }
            _ => None,
        };

        let mut output = ListVersionsOutput::default();
        let mut seen_prefixes: BTreeSet<String> = BTreeSet::new();

        'scan: loop {
            let rows = self
                .meta()
                .scan_prefix(&scan_prefix, cursor.as_deref(), SCAN_CHUNK)?;
            if rows.is_empty() {
                break;
            }

            for (row_key, bytes) in &rows {
                cursor = Some(row_key.clone());
                let record: ObjectRecord = serde_json::from_slice(bytes).map_err(|e| {
                    maxiofs_core::Error::Internal(anyhow::anyhow!(
                        "corrupt record at {row_key}: {e}"
                    ))
                })?;

                if let Some(delimiter) = delimiter.filter(|d| !d.is_empty()) {
                    let rest = &record.key[prefix.len()..];
                    if let Some(pos) = rest.find(delimiter) {
                        let group = format!("{prefix}{}{delimiter}", &rest[..pos]);
                        if seen_prefixes.insert(group.clone()) {
                            if output.versions.len() + output.common_prefixes.len() >= max_keys {
                                output.is_truncated = true;
                                break 'scan;
                            }
                            output.common_prefixes.push(group);
                        }
                        continue;
                    }
                }

                if output.versions.len() + output.common_prefixes.len() >= max_keys {
                    output.is_truncated = true;
                    output.next_marker = output
                        .versions
                        .last()
                        .map(|v| (v.key.clone(), v.version_id.clone()));
                    break 'scan;
                }
                output.versions.push(record);
            }

            if rows.len() < SCAN_CHUNK {
                break;
            }
        }

        Ok(output)
    }
}

fn entry_count(output: &ListObjectsOutput) -> usize {
    output.objects.len() + output.common_prefixes.len()
}

fn last_entry_key(output: &ListObjectsOutput) -> Option<String> {
    // The resume point is the lexicographically greatest entry returned.
    let last_object = output.objects.last().map(|o| o.key.clone());
    let last_prefix = output.common_prefixes.last().cloned();
    match (last_object, last_prefix) {
        (Some(o), Some(p)) => Some(o.max(p)),
        (Some(o), None) => Some(o),
        (None, Some(p)) => Some(p),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WriteOrigin;
    use crate::bucket::CreateBucketInput;
    use crate::testutil::{self, put_input};
    use bytes::Bytes;
    use maxiofs_core::types::VersioningState;

    async fn seeded_env(versioned: bool, keys_list: &[&str]) -> testutil::TestEnv {
        let env = testutil::env();
        env.engine
            .create_bucket(CreateBucketInput {
                name: "list".to_owned(),
                tenant_id: env.tenant_id,
                owner_user_id: env.user_id,
                versioning: if versioned {
                    VersioningState::Enabled
                } else {
                    VersioningState::Off
                },
                object_lock_enabled: false,
                default_retention: None,
                encryption_enabled: false,
            })
            .unwrap();
        for key in keys_list {
            env.engine
                .put_object(WriteOrigin::Client, put_input("list", key), Bytes::from_static(b"x"))
                .await
                .unwrap_or_else(|e| panic!("seed put {key} failed: {e}"));
        }
        env
    }

    fn list_input(prefix: &str, delimiter: Option<&str>, max_keys: usize) -> ListObjectsInput {
        ListObjectsInput {
            bucket: "list".to_owned(),
            prefix: prefix.to_owned(),
            delimiter: delimiter.map(ToOwned::to_owned),
            after_key: None,
            max_keys,
        }
    }

    #[tokio::test]
    async fn test_should_list_all_keys_sorted() {
        let env = seeded_env(false, &["zebra", "alpha", "mango"]).await;
        let output = env.engine.list_objects(&list_input("", None, 1000)).unwrap();
        let listed: Vec<&str> = output.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(listed, vec!["alpha", "mango", "zebra"]);
        assert!(!output.is_truncated);
    }

    #[tokio::test]
    async fn test_should_filter_by_prefix() {
        let env = seeded_env(false, &["logs/a", "logs/b", "data/c"]).await;
        let output = env
            .engine
            .list_objects(&list_input("logs/", None, 1000))
            .unwrap();
        assert_eq!(output.objects.len(), 2);
        assert!(output.objects.iter().all(|o| o.key.starts_with("logs/")));
    }

    #[tokio::test]
    async fn test_should_group_common_prefixes_with_delimiter() {
        let env = seeded_env(
            false,
            &["photos/2023/a.jpg", "photos/2024/b.jpg", "photos/2024/c.jpg", "readme.txt"],
        )
        .await;

        let output = env
            .engine
            .list_objects(&list_input("", Some("/"), 1000))
            .unwrap();
        assert_eq!(output.common_prefixes, vec!["photos/"]);
        assert_eq!(output.objects.len(), 1);
        assert_eq!(output.objects[0].key, "readme.txt");

        let nested = env
            .engine
            .list_objects(&list_input("photos/", Some("/"), 1000))
            .unwrap();
        assert_eq!(nested.common_prefixes, vec!["photos/2023/", "photos/2024/"]);
        assert!(nested.objects.is_empty());
    }

    #[tokio::test]
    async fn test_should_paginate_with_marker() {
        let env = seeded_env(false, &["a", "b", "c", "d", "e"]).await;

        let page1 = env.engine.list_objects(&list_input("", None, 2)).unwrap();
        assert_eq!(page1.objects.len(), 2);
        assert!(page1.is_truncated);
        assert_eq!(page1.next_after_key.as_deref(), Some("b"));

        let mut input = list_input("", None, 2);
        input.after_key = page1.next_after_key;
        let page2 = env.engine.list_objects(&input).unwrap();
        let listed: Vec<&str> = page2.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(listed, vec!["c", "d"]);

        let mut input = list_input("", None, 2);
        input.after_key = page2.next_after_key;
        let page3 = env.engine.list_objects(&input).unwrap();
        assert_eq!(page3.objects.len(), 1);
        assert!(!page3.is_truncated);
    }

    #[tokio::test]
    async fn test_should_hide_delete_markers_from_listing() {
        let env = seeded_env(true, &["kept", "gone"]).await;
        env.engine
            .delete_object(WriteOrigin::Client, "list", "gone", None, false)
            .await
            .unwrap();

        let output = env.engine.list_objects(&list_input("", None, 1000)).unwrap();
        let listed: Vec<&str> = output.objects.iter().map(|o| o.key.as_str()).collect();
        assert_eq!(listed, vec!["kept"]);
    }

    #[tokio::test]
    async fn test_should_list_versions_newest_first_per_key() {
        let env = seeded_env(true, &["k"]).await;
        // A second version of the same key.
        env.engine
            .put_object(WriteOrigin::Client, put_input("list", "k"), Bytes::from_static(b"v2"))
            .await
            .unwrap();

        let output = env
            .engine
            .list_versions("list", "", None, None, None, 1000)
            .unwrap();
        assert_eq!(output.versions.len(), 2);
        // Newest (larger created_at / smaller sort key) first.
        assert!(output.versions[0].sort_key < output.versions[1].sort_key);
        assert_eq!(output.versions[0].size, 2);
    }

    #[tokio::test]
    async fn test_should_include_markers_in_version_listing() {
        let env = seeded_env(true, &["k"]).await;
        env.engine
            .delete_object(WriteOrigin::Client, "list", "k", None, false)
            .await
            .unwrap();

        let output = env
            .engine
            .list_versions("list", "", None, None, None, 1000)
            .unwrap();
        assert_eq!(output.versions.len(), 2);
        assert!(output.versions[0].is_delete_marker, "marker is newest");
        assert!(!output.versions[1].is_delete_marker);
    }
}
