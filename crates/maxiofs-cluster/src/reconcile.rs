//! Stale-node reconciliation.
//!
//! A node that was absent longer than the stale window pulls a full state
//! snapshot from a healthy peer and merges it:
//!
//! - Tenants and users carry `updated_at` and merge last-writer-wins.
//! - Access keys carry no clock; they are adopted only when absent locally
//!   and not tombstoned, so a key revoked while the node was away stays
//!   revoked.
//!
//! Tombstones are retained for at least twice the stale window, which is
//! why a returning node cannot resurrect entities deleted during its
//! absence. Divergence the merge cannot express (writes on both sides) is
//! logged for the operator.

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use maxiofs_core::types::{AccessKey, ClusterNode, Tenant, Tombstone, User};
use maxiofs_core::{Error, Result, ids};
use maxiofs_meta::{MetaStore, keys};

use crate::manager::ClusterManager;
use crate::rpc::RpcClient;

/// Wire shape of `GET /_internal/state-snapshot`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StateSnapshot {
    /// All tenants on the serving node.
    pub tenants: Vec<Tenant>,
    /// All users.
    pub users: Vec<User>,
    /// All access keys.
    pub access_keys: Vec<AccessKey>,
}

/// Counters describing one merge.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeReport {
    /// Records adopted or updated from the snapshot.
    pub applied: u64,
    /// Records skipped because the local copy was newer.
    pub kept_local: u64,
    /// Records suppressed by tombstones.
    pub suppressed: u64,
}

/// Pulls and merges snapshots for a node returning from a long absence.
#[derive(Debug)]
pub struct Reconciler {
    meta: Arc<MetaStore>,
    manager: Arc<ClusterManager>,
    rpc: RpcClient,
    stale_window_secs: u64,
}

impl Reconciler {
    /// Build a reconciler with the configured stale window.
    #[must_use]
    pub fn new(
        meta: Arc<MetaStore>,
        manager: Arc<ClusterManager>,
        rpc: RpcClient,
        stale_window_secs: u64,
    ) -> Self {
        Self {
            meta,
            manager,
            rpc,
            stale_window_secs,
        }
    }

    /// Whether a last-seen gap makes a node stale.
    #[must_use]
    pub fn is_stale(&self, last_seen_at: Option<i64>, now: i64) -> bool {
        match last_seen_at {
            Some(seen) => now - seen > i64::try_from(self.stale_window_secs).unwrap_or(i64::MAX),
            None => false,
        }
    }

    /// Pull a snapshot from the first healthy peer and merge it.
    pub async fn pull_and_merge(&self) -> Result<MergeReport> {
        let token = self
            .manager
            .node_token()
            .ok_or_else(|| Error::unavailable("cluster is not initialized"))?;
        let mut peers = self.manager.reachable_peers()?;
        peers.sort_by_key(|p| p.priority);
        let Some(peer) = peers.first() else {
            return Err(Error::unavailable("no healthy peer to reconcile from"));
        };

        let snapshot = self.fetch_snapshot(&token, peer).await?;
        let report = self.merge(&snapshot)?;
        info!(
            peer = %peer.id,
            applied = report.applied,
            kept_local = report.kept_local,
            suppressed = report.suppressed,
            "state snapshot merged"
        );
        Ok(report)
    }

    async fn fetch_snapshot(&self, token: &str, peer: &ClusterNode) -> Result<StateSnapshot> {
        let response = self
            .rpc
            .send(
                token,
                &peer.endpoint,
                reqwest::Method::GET,
                "/_internal/state-snapshot",
                &[],
                Vec::new(),
            )
            .await?;
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "state-snapshot returned {}",
                response.status()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("decode state snapshot: {e}")))
    }

    /// Merge a snapshot into the local store.
    pub fn merge(&self, snapshot: &StateSnapshot) -> Result<MergeReport> {
        let tenant_tombs = self.tombstoned_ids("tenant")?;
        let user_tombs = self.tombstoned_ids("user")?;
        let key_tombs = self.tombstoned_ids("accesskey")?;

        let mut report = MergeReport::default();
        self.meta.update(|txn| {
            for tenant in &snapshot.tenants {
                if tenant_tombs.contains(&tenant.id.to_string()) {
                    report.suppressed += 1;
                    continue;
                }
                let key = keys::tenant(tenant.id);
                match txn.get::<Tenant>(&key)? {
                    Some(local) if local.updated_at >= tenant.updated_at => {
                        if local.updated_at > tenant.updated_at {
                            warn!(
                                tenant = %tenant.id,
                                "local tenant newer than snapshot; keeping local (check for split writes)"
                            );
                        }
                        report.kept_local += 1;
                    }
                    _ => {
                        txn.put(&key, tenant)?;
                        txn.put(&keys::tenant_name(&tenant.name), &tenant.id)?;
                        report.applied += 1;
                    }
                }
            }

            for user in &snapshot.users {
                if user_tombs.contains(&user.id.to_string()) {
                    report.suppressed += 1;
                    continue;
                }
                let key = keys::user(user.id);
                match txn.get::<User>(&key)? {
                    Some(local) if local.updated_at >= user.updated_at => {
                        report.kept_local += 1;
                    }
                    _ => {
                        txn.put(&key, user)?;
                        txn.put(&keys::username(&user.username), &user.id)?;
                        report.applied += 1;
                    }
                }
            }

            // Access keys have no updated_at: adopt only when locally
            // absent and never when tombstoned.
            for access_key in &snapshot.access_keys {
                if key_tombs.contains(&access_key.access_key_id) {
                    report.suppressed += 1;
                    continue;
                }
                let key = keys::access_key(&access_key.access_key_id);
                if txn.exists(&key)? {
                    report.kept_local += 1;
                } else {
                    txn.put(&key, access_key)?;
                    report.applied += 1;
                }
            }
            Ok(())
        })?;
        Ok(report)
    }

    /// Drop tombstones older than twice the stale window. Returns how many
    /// were removed.
    pub fn gc_tombstones(&self) -> Result<u64> {
        let retention = self.stale_window_secs.saturating_mul(2);
        let cutoff = ids::now_secs() - i64::try_from(retention).unwrap_or(i64::MAX);
        self.meta.update(|txn| {
            let rows = txn.scan_prefix("tomb:", None, usize::MAX)?;
            let mut removed = 0u64;
            for (row_key, bytes) in &rows {
                let tombstone: Tombstone = serde_json::from_slice(bytes).map_err(|e| {
                    Error::Internal(anyhow::anyhow!("corrupt tombstone at {row_key}: {e}"))
                })?;
                if tombstone.deleted_at < cutoff {
                    txn.delete(row_key)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }

    fn tombstoned_ids(&self, kind: &str) -> Result<HashSet<String>> {
        let tombstones: Vec<Tombstone> = self.meta.scan_values(&keys::tombstone_prefix(kind))?;
        Ok(tombstones.into_iter().map(|t| t.entity_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    struct ReconcileEnv {
        reconciler: Reconciler,
        meta: Arc<MetaStore>,
        _dir: tempfile::TempDir,
    }

    fn reconcile_env() -> ReconcileEnv {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let manager = ClusterManager::load(Arc::clone(&meta), "node-a", None).unwrap();
        let rpc = RpcClient::new(manager.this_node_id()).unwrap();
        let reconciler = Reconciler::new(Arc::clone(&meta), manager, rpc, 3600);
        ReconcileEnv {
            reconciler,
            meta,
            _dir: dir,
        }
    }

    fn tenant(id: Uuid, name: &str, updated_at: i64) -> Tenant {
        Tenant {
            id,
            name: name.to_owned(),
            display_name: name.to_owned(),
            max_bytes: 0,
            used_bytes: 0,
            max_buckets: 0,
            used_buckets: 0,
            max_keys: 0,
            used_keys: 0,
            updated_at,
        }
    }

    fn access_key(id: &str) -> AccessKey {
        AccessKey {
            id: Uuid::new_v4(),
            access_key_id: id.to_owned(),
            secret_key: "s".to_owned(),
            user_id: Uuid::new_v4(),
            tenant_id: None,
        }
    }

    #[test]
    fn test_should_detect_staleness_from_last_seen_gap() {
        let env = reconcile_env();
        let now = 100_000;
        assert!(env.reconciler.is_stale(Some(now - 4000), now));
        assert!(!env.reconciler.is_stale(Some(now - 100), now));
        assert!(!env.reconciler.is_stale(None, now), "never-seen is not stale");
    }

    #[test]
    fn test_should_apply_newer_snapshot_records() {
        let env = reconcile_env();
        let id = Uuid::new_v4();
        env.meta.put(&keys::tenant(id), &tenant(id, "acme", 100)).unwrap();

        let snapshot = StateSnapshot {
            tenants: vec![tenant(id, "acme", 200)],
            ..StateSnapshot::default()
        };
        let report = env.reconciler.merge(&snapshot).unwrap();
        assert_eq!(report.applied, 1);

        let merged: Tenant = env.meta.get(&keys::tenant(id)).unwrap().unwrap();
        assert_eq!(merged.updated_at, 200);
    }

    #[test]
    fn test_should_keep_newer_local_records() {
        let env = reconcile_env();
        let id = Uuid::new_v4();
        env.meta.put(&keys::tenant(id), &tenant(id, "acme", 300)).unwrap();

        let snapshot = StateSnapshot {
            tenants: vec![tenant(id, "acme", 200)],
            ..StateSnapshot::default()
        };
        let report = env.reconciler.merge(&snapshot).unwrap();
        assert_eq!(report.kept_local, 1);
        assert_eq!(report.applied, 0);

        let kept: Tenant = env.meta.get(&keys::tenant(id)).unwrap().unwrap();
        assert_eq!(kept.updated_at, 300);
    }

    #[test]
    fn test_should_suppress_tombstoned_entities() {
        let env = reconcile_env();
        let id = Uuid::new_v4();

        // The tenant was deleted locally while the snapshot's node was away.
        let now = ids::now_secs();
        let tombstone = Tombstone {
            entity_kind: "tenant".to_owned(),
            entity_id: id.to_string(),
            deleted_at: now,
            tenant_id: None,
        };
        env.meta
            .put(&keys::tombstone("tenant", now, &id.to_string()), &tombstone)
            .unwrap();

        let snapshot = StateSnapshot {
            tenants: vec![tenant(id, "ghost", now + 100)],
            ..StateSnapshot::default()
        };
        let report = env.reconciler.merge(&snapshot).unwrap();
        assert_eq!(report.suppressed, 1);
        assert!(
            env.meta.get_raw(&keys::tenant(id)).unwrap().is_none(),
            "tombstoned tenant must not resurrect"
        );
    }

    #[test]
    fn test_should_adopt_unknown_access_keys_but_never_tombstoned_ones() {
        let env = reconcile_env();
        let now = ids::now_secs();

        let revoked = Tombstone {
            entity_kind: "accesskey".to_owned(),
            entity_id: "AKREVOKED".to_owned(),
            deleted_at: now,
            tenant_id: None,
        };
        env.meta
            .put(&keys::tombstone("accesskey", now, "AKREVOKED"), &revoked)
            .unwrap();

        let snapshot = StateSnapshot {
            access_keys: vec![access_key("AKNEW"), access_key("AKREVOKED")],
            ..StateSnapshot::default()
        };
        let report = env.reconciler.merge(&snapshot).unwrap();
        assert_eq!(report.applied, 1);
        assert_eq!(report.suppressed, 1);
        assert!(env.meta.get_raw(&keys::access_key("AKNEW")).unwrap().is_some());
        assert!(env.meta.get_raw(&keys::access_key("AKREVOKED")).unwrap().is_none());
    }

    #[test]
    fn test_should_gc_tombstones_past_double_window() {
        let env = reconcile_env();
        let now = ids::now_secs();

        // One inside the retention window (2 * 3600), one far outside.
        for (age, id) in [(1000, "fresh"), (10_000, "old")] {
            let tombstone = Tombstone {
                entity_kind: "object".to_owned(),
                entity_id: id.to_owned(),
                deleted_at: now - age,
                tenant_id: None,
            };
            env.meta
                .put(&keys::tombstone("object", now - age, id), &tombstone)
                .unwrap();
        }

        let removed = env.reconciler.gc_tombstones().unwrap();
        assert_eq!(removed, 1);
        assert_eq!(env.meta.count_prefix("tomb:object:").unwrap(), 1);
    }
}
