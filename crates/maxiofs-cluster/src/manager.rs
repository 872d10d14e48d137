//! Local node identity and the peer registry.
//!
//! Every node carries a [`LocalNodeConfig`] persisted under
//! `cluster:config`: its id, name, region, and the shared `node_token`.
//! The token is generated with 256 bits of entropy when the operator
//! initializes the cluster, and handed to joining nodes out of band. Peers
//! are plain [`ClusterNode`] rows.

use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use maxiofs_core::types::{ClusterNode, NodeHealth};
use maxiofs_core::{Error, Result, ids};
use maxiofs_meta::{MetaStore, keys};

/// This node's persisted cluster identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalNodeConfig {
    /// Node id, fixed for the node's lifetime.
    pub node_id: Uuid,
    /// Operator-assigned name.
    pub name: String,
    /// Optional region label.
    pub region: Option<String>,
    /// Shared cluster HMAC secret; empty until the cluster is initialized.
    pub node_token: String,
    /// When the cluster was initialized on this node, if ever.
    pub initialized_at: Option<i64>,
}

/// Node identity plus peer registry.
#[derive(Debug)]
pub struct ClusterManager {
    meta: Arc<MetaStore>,
    local: RwLock<LocalNodeConfig>,
}

impl ClusterManager {
    /// Load the local identity, creating one on first start.
    pub fn load(meta: Arc<MetaStore>, name: &str, region: Option<String>) -> Result<Arc<Self>> {
        let local = match meta.get::<LocalNodeConfig>(&keys::cluster_config())? {
            Some(existing) => existing,
            None => {
                let fresh = LocalNodeConfig {
                    node_id: Uuid::new_v4(),
                    name: name.to_owned(),
                    region,
                    node_token: String::new(),
                    initialized_at: None,
                };
                meta.put(&keys::cluster_config(), &fresh)?;
                info!(node_id = %fresh.node_id, "created node identity");
                fresh
            }
        };

        Ok(Arc::new(Self {
            meta,
            local: RwLock::new(local),
        }))
    }

    /// This node's id.
    #[must_use]
    pub fn this_node_id(&self) -> Uuid {
        self.local.read().node_id
    }

    /// A snapshot of the local configuration.
    #[must_use]
    pub fn this_node(&self) -> LocalNodeConfig {
        self.local.read().clone()
    }

    /// The shared cluster secret, if the cluster is initialized.
    #[must_use]
    pub fn node_token(&self) -> Option<String> {
        let token = self.local.read().node_token.clone();
        (!token.is_empty()).then_some(token)
    }

    /// Initialize clustering: mint a fresh 256-bit node token.
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if the cluster was already initialized; the
    /// operator must explicitly tear down first, token rotation is not a
    /// side effect.
    pub fn initialize(&self) -> Result<LocalNodeConfig> {
        let mut local = self.local.write();
        if local.initialized_at.is_some() {
            return Err(Error::Conflict {
                key: keys::cluster_config(),
            });
        }
        local.node_token = ids::random_token(32);
        local.initialized_at = Some(ids::now_secs());
        self.meta.put(&keys::cluster_config(), &*local)?;
        info!(node_id = %local.node_id, "cluster initialized, node token minted");
        Ok(local.clone())
    }

    /// Join an existing cluster with an operator-provided token.
    pub fn join(&self, node_token: String) -> Result<LocalNodeConfig> {
        if node_token.len() < 32 {
            return Err(Error::invalid_argument("node token is too short"));
        }
        let mut local = self.local.write();
        local.node_token = node_token;
        local.initialized_at = Some(ids::now_secs());
        self.meta.put(&keys::cluster_config(), &*local)?;
        info!(node_id = %local.node_id, "joined cluster");
        Ok(local.clone())
    }

    /// Register (or update) a peer.
    pub fn add_peer(&self, mut node: ClusterNode) -> Result<ClusterNode> {
        if node.id == self.this_node_id() {
            return Err(Error::invalid_argument(
                "a node cannot be registered as its own peer",
            ));
        }
        node.updated_at = ids::now_secs();
        self.meta.put(&keys::node(node.id), &node)?;
        debug!(peer = %node.id, endpoint = %node.endpoint, "peer registered");
        Ok(node)
    }

    /// Remove a peer. Idempotent.
    pub fn remove_peer(&self, node_id: Uuid) -> Result<()> {
        self.meta.delete(&keys::node(node_id))?;
        debug!(peer = %node_id, "peer removed");
        Ok(())
    }

    /// Load one peer.
    pub fn get_peer(&self, node_id: Uuid) -> Result<Option<ClusterNode>> {
        self.meta.get(&keys::node(node_id))
    }

    /// All registered peers.
    pub fn list_peers(&self) -> Result<Vec<ClusterNode>> {
        self.meta.scan_values(&keys::node_prefix())
    }

    /// Peers currently able to serve forwarded requests.
    pub fn reachable_peers(&self) -> Result<Vec<ClusterNode>> {
        Ok(self
            .list_peers()?
            .into_iter()
            .filter(|peer| peer.health.is_reachable())
            .collect())
    }

    /// Whether any peers exist (cluster mode vs. single-node).
    pub fn is_clustered(&self) -> Result<bool> {
        Ok(!self.list_peers()?.is_empty())
    }
}

/// Build a bare peer record for registration.
#[must_use]
pub fn new_peer(id: Uuid, name: &str, endpoint: &str, node_token: &str, priority: u8) -> ClusterNode {
    ClusterNode {
        id,
        name: name.to_owned(),
        endpoint: endpoint.trim_end_matches('/').to_owned(),
        node_token: node_token.to_owned(),
        priority,
        region: None,
        health: NodeHealth::Unknown,
        last_check_at: None,
        last_seen_at: None,
        latency_ms: None,
        capacity_total: 0,
        capacity_used: 0,
        bucket_count: 0,
        updated_at: ids::now_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_manager() -> (tempfile::TempDir, Arc<ClusterManager>) {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let manager = ClusterManager::load(meta, "node-a", None)
            .unwrap_or_else(|e| panic!("load failed: {e}"));
        (dir, manager)
    }

    #[test]
    fn test_should_persist_identity_across_reloads() {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let first = ClusterManager::load(Arc::clone(&meta), "node-a", None).unwrap();
        let id = first.this_node_id();
        drop(first);

        let second = ClusterManager::load(meta, "node-a", None).unwrap();
        assert_eq!(second.this_node_id(), id);
    }

    #[test]
    fn test_should_mint_token_on_initialize_once() {
        let (_dir, manager) = open_manager();
        assert!(manager.node_token().is_none());

        let config = manager.initialize().unwrap();
        assert_eq!(config.node_token.len(), 64, "256 bits as hex");
        assert!(manager.node_token().is_some());

        // A second initialize must not silently rotate the secret.
        assert!(matches!(
            manager.initialize(),
            Err(Error::Conflict { .. })
        ));
    }

    #[test]
    fn test_should_join_with_operator_token() {
        let (_dir, manager) = open_manager();
        let token = maxiofs_core::ids::random_token(32);
        manager.join(token.clone()).unwrap();
        assert_eq!(manager.node_token(), Some(token));

        assert!(manager.join("short".to_owned()).is_err());
    }

    #[test]
    fn test_should_register_list_and_remove_peers() {
        let (_dir, manager) = open_manager();
        let peer_id = Uuid::new_v4();
        let peer = new_peer(peer_id, "node-b", "http://node-b:8080/", "tok", 10);
        let stored = manager.add_peer(peer).unwrap();
        assert_eq!(stored.endpoint, "http://node-b:8080", "trailing slash trimmed");

        assert_eq!(manager.list_peers().unwrap().len(), 1);
        assert!(manager.get_peer(peer_id).unwrap().is_some());
        assert!(manager.is_clustered().unwrap());

        manager.remove_peer(peer_id).unwrap();
        manager.remove_peer(peer_id).unwrap();
        assert!(manager.list_peers().unwrap().is_empty());
    }

    #[test]
    fn test_should_reject_self_registration() {
        let (_dir, manager) = open_manager();
        let own = new_peer(manager.this_node_id(), "me", "http://me", "tok", 0);
        assert!(matches!(
            manager.add_peer(own),
            Err(Error::InvalidArgument { .. })
        ));
    }

    #[test]
    fn test_should_filter_reachable_peers() {
        let (_dir, manager) = open_manager();
        let mut healthy = new_peer(Uuid::new_v4(), "h", "http://h", "tok", 0);
        healthy.health = NodeHealth::Healthy;
        let mut down = new_peer(Uuid::new_v4(), "d", "http://d", "tok", 0);
        down.health = NodeHealth::Unavailable;
        manager.add_peer(healthy).unwrap();
        manager.add_peer(down).unwrap();

        let reachable = manager.reachable_peers().unwrap();
        assert_eq!(reachable.len(), 1);
        assert_eq!(reachable[0].name, "h");
    }
}
