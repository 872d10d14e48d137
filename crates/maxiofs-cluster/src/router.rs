//! Request routing: who serves a bucket.
//!
//! For each S3 request the router resolves the bucket's owner (location
//! cache, then the local MetaStore, then federated resolution across
//! peers), and decides:
//!
//! 1. owned locally → serve from the local engine;
//! 2. owner reachable → forward to the owner;
//! 3. owner down → reads may fail over to a healthy replication
//!    destination; writes get `ServiceUnavailable` (a replica is never
//!    implicitly promoted to accept writes).
//!
//! A peer answering "not my bucket" invalidates the cache entry and the
//! resolution restarts once.

use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, warn};
use uuid::Uuid;

use maxiofs_core::types::{Bucket, ClusterNode, ReplicationRule};
use maxiofs_core::{Error, Result};
use maxiofs_meta::{MetaStore, keys};

use crate::cache::LocationCache;
use crate::manager::ClusterManager;
use crate::rpc::RpcClient;

/// Where a request should be served.
#[derive(Debug, Clone)]
pub enum RouteDecision {
    /// The bucket is owned by this node.
    Local,
    /// Forward to the owning peer.
    Forward(ClusterNode),
    /// The owner is down; serve reads from this replica, which holds the
    /// bucket under `replica_bucket`.
    ReadReplica {
        /// The replica peer.
        node: ClusterNode,
        /// Bucket name on the replica.
        replica_bucket: String,
    },
}

/// Wire shape of `GET /_internal/bucket-owner/{bucket}`.
#[derive(Debug, Deserialize, serde::Serialize)]
pub struct BucketOwnerResponse {
    /// The owning node id.
    pub node_id: Uuid,
}

/// Owner resolution and failover policy.
#[derive(Debug)]
pub struct RequestRouter {
    meta: Arc<MetaStore>,
    cache: Arc<LocationCache>,
    manager: Arc<ClusterManager>,
    rpc: RpcClient,
}

impl RequestRouter {
    /// Build a router.
    #[must_use]
    pub fn new(
        meta: Arc<MetaStore>,
        cache: Arc<LocationCache>,
        manager: Arc<ClusterManager>,
        rpc: RpcClient,
    ) -> Self {
        Self {
            meta,
            cache,
            manager,
            rpc,
        }
    }

    /// The location cache, for invalidation hooks.
    #[must_use]
    pub fn cache(&self) -> &Arc<LocationCache> {
        &self.cache
    }

    /// The signed RPC client used for forwarding.
    #[must_use]
    pub fn rpc(&self) -> &RpcClient {
        &self.rpc
    }

    /// Decide where a request for `bucket` is served.
    pub async fn route(&self, bucket: &str, is_write: bool) -> Result<RouteDecision> {
        let local_id = self.manager.this_node_id();
        let owner = self.resolve_owner(bucket).await?;

        if owner == local_id {
            return Ok(RouteDecision::Local);
        }

        let peer = self.manager.get_peer(owner)?.ok_or_else(|| {
            // The cache pointed at a node that has since been removed.
            self.cache.invalidate(bucket);
            Error::unavailable(format!("owner of bucket {bucket} is not registered"))
        })?;

        if peer.health.is_reachable() {
            return Ok(RouteDecision::Forward(peer));
        }

        // Owner is down. Reads may fail over to a replica.
        if !is_write {
            if let Some((replica, replica_bucket)) = self.find_replica(bucket, owner)? {
                debug!(
                    bucket,
                    owner = %owner,
                    replica = %replica.id,
                    "owner unavailable, failing read over to replica"
                );
                return Ok(RouteDecision::ReadReplica {
                    node: replica,
                    replica_bucket,
                });
            }
        }

        Err(Error::unavailable(format!(
            "owner of bucket {bucket} is unavailable"
        )))
    }

    /// Evict a bucket from the location cache (create/delete, "not my
    /// bucket" responses).
    pub fn invalidate(&self, bucket: &str) {
        self.cache.invalidate(bucket);
    }

    /// Resolve the owning node id: cache, local MetaStore, then peers.
    async fn resolve_owner(&self, bucket: &str) -> Result<Uuid> {
        if let Some(owner) = self.cache.lookup(bucket) {
            return Ok(owner);
        }

        // A locally registered bucket names its owner directly.
        if let Some(record) = self.meta.get::<Bucket>(&keys::bucket(bucket))? {
            self.cache.insert(bucket, record.node_id);
            return Ok(record.node_id);
        }

        // Federated resolution: ask reachable peers, best (lowest priority
        // value) first.
        let Some(token) = self.manager.node_token() else {
            return Err(Error::NoSuchBucket {
                bucket: bucket.to_owned(),
            });
        };
        let mut peers = self.manager.reachable_peers()?;
        peers.sort_by_key(|p| p.priority);

        for peer in peers {
            match self.ask_peer_for_owner(&token, &peer, bucket).await {
                Ok(Some(owner)) => {
                    self.cache.insert(bucket, owner);
                    return Ok(owner);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(peer = %peer.id, bucket, error = %e, "bucket-owner query failed");
                }
            }
        }

        Err(Error::NoSuchBucket {
            bucket: bucket.to_owned(),
        })
    }

    async fn ask_peer_for_owner(
        &self,
        token: &str,
        peer: &ClusterNode,
        bucket: &str,
    ) -> Result<Option<Uuid>> {
        let path = format!("/_internal/bucket-owner/{bucket}");
        let response = self
            .rpc
            .send(
                token,
                &peer.endpoint,
                reqwest::Method::GET,
                &path,
                &[],
                Vec::new(),
            )
            .await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Error::unavailable(format!(
                "bucket-owner query returned {}",
                response.status()
            )));
        }
        let owner: BucketOwnerResponse = response
            .json()
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("decode bucket-owner response: {e}")))?;
        Ok(Some(owner.node_id))
    }

    /// A healthy replication destination for `bucket`, preferring lower
    /// priority values.
    fn find_replica(&self, bucket: &str, owner: Uuid) -> Result<Option<(ClusterNode, String)>> {
        let rules: Vec<ReplicationRule> =
            self.meta.scan_values(&keys::replication_rule_prefix())?;

        let mut candidates: Vec<(ClusterNode, String)> = Vec::new();
        for rule in rules
            .iter()
            .filter(|r| r.enabled && r.source_bucket == bucket)
        {
            if rule.destination_node_id == owner {
                continue;
            }
            if let Some(node) = self.manager.get_peer(rule.destination_node_id)? {
                if node.health.is_reachable() {
                    candidates.push((node, rule.destination_bucket.clone()));
                }
            }
        }
        candidates.sort_by_key(|(node, _)| node.priority);
        Ok(candidates.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::new_peer;
    use maxiofs_core::types::{NodeHealth, VersioningState};
    use std::time::Duration;

    struct RouterEnv {
        router: RequestRouter,
        manager: Arc<ClusterManager>,
        meta: Arc<MetaStore>,
        _dir: tempfile::TempDir,
    }

    fn router_env() -> RouterEnv {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let manager = ClusterManager::load(Arc::clone(&meta), "node-a", None).unwrap();
        let cache = Arc::new(LocationCache::new(Duration::from_secs(300)));
        let rpc = RpcClient::new(manager.this_node_id()).unwrap();
        let router = RequestRouter::new(Arc::clone(&meta), cache, Arc::clone(&manager), rpc);
        RouterEnv {
            router,
            manager,
            meta,
            _dir: dir,
        }
    }

    fn put_bucket(env: &RouterEnv, name: &str, node_id: Uuid) {
        let bucket = Bucket {
            name: name.to_owned(),
            tenant_id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            node_id,
            created_at: 0,
            versioning: VersioningState::Off,
            object_lock_enabled: false,
            default_retention: None,
            cors: None,
            policy: None,
            notifications: None,
            encryption_enabled: false,
            updated_at: 0,
        };
        env.meta.put(&keys::bucket(name), &bucket).unwrap();
    }

    #[tokio::test]
    async fn test_should_route_local_bucket_locally() {
        let env = router_env();
        put_bucket(&env, "mine", env.manager.this_node_id());

        let decision = env.router.route("mine", true).await.unwrap();
        assert!(matches!(decision, RouteDecision::Local));
        // The resolution is now cached.
        assert_eq!(
            env.router.cache().lookup("mine"),
            Some(env.manager.this_node_id())
        );
    }

    #[tokio::test]
    async fn test_should_forward_to_reachable_owner() {
        let env = router_env();
        let owner_id = Uuid::new_v4();
        let mut peer = new_peer(owner_id, "node-b", "http://node-b:8080", "tok", 0);
        peer.health = NodeHealth::Healthy;
        env.manager.add_peer(peer).unwrap();
        put_bucket(&env, "theirs", owner_id);

        let decision = env.router.route("theirs", true).await.unwrap();
        match decision {
            RouteDecision::Forward(node) => assert_eq!(node.id, owner_id),
            other => panic!("expected Forward, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_should_fail_write_when_owner_down_without_promotion() {
        let env = router_env();
        let owner_id = Uuid::new_v4();
        let mut peer = new_peer(owner_id, "node-b", "http://node-b:8080", "tok", 0);
        peer.health = NodeHealth::Unavailable;
        env.manager.add_peer(peer).unwrap();
        put_bucket(&env, "theirs", owner_id);

        let result = env.router.route("theirs", true).await;
        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_should_fail_read_over_to_healthy_replica() {
        let env = router_env();
        let owner_id = Uuid::new_v4();
        let replica_id = Uuid::new_v4();

        let mut owner = new_peer(owner_id, "owner", "http://owner:8080", "tok", 0);
        owner.health = NodeHealth::Unavailable;
        env.manager.add_peer(owner).unwrap();

        let mut replica = new_peer(replica_id, "replica", "http://replica:8080", "tok", 5);
        replica.health = NodeHealth::Healthy;
        env.manager.add_peer(replica).unwrap();

        put_bucket(&env, "b3", owner_id);

        let rule = ReplicationRule {
            id: Uuid::new_v4(),
            source_bucket: "b3".to_owned(),
            destination_node_id: replica_id,
            destination_bucket: "b3-copy".to_owned(),
            sync_interval_s: 1,
            enabled: true,
            replicate_deletes: true,
            replicate_metadata: true,
            prefix_filter: String::new(),
            priority: 5,
            last_sync_at: None,
            last_error: None,
            objects_replicated: 0,
            bytes_replicated: 0,
            updated_at: 0,
        };
        env.meta.put(&keys::replication_rule(rule.id), &rule).unwrap();

        let decision = env.router.route("b3", false).await.unwrap();
        match decision {
            RouteDecision::ReadReplica {
                node,
                replica_bucket,
            } => {
                assert_eq!(node.id, replica_id);
                assert_eq!(replica_bucket, "b3-copy");
            }
            other => panic!("expected ReadReplica, got {other:?}"),
        }

        // The same situation refuses writes.
        let result = env.router.route("b3", true).await;
        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_should_report_missing_bucket_in_single_node_mode() {
        let env = router_env();
        let result = env.router.route("ghost", false).await;
        assert!(matches!(result, Err(Error::NoSuchBucket { .. })));
    }

    #[tokio::test]
    async fn test_should_invalidate_cache_for_removed_owner() {
        let env = router_env();
        let gone = Uuid::new_v4();
        env.router.cache().insert("b", gone);
        put_bucket(&env, "b", gone);

        // Owner is cached but not registered as a peer.
        let result = env.router.route("b", false).await;
        assert!(matches!(result, Err(Error::ServiceUnavailable { .. })));
        assert_eq!(env.router.cache().lookup("b"), None);
    }
}
