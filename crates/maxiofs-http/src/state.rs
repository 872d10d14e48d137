//! Shared application state handed to every HTTP service.

use std::sync::Arc;

use parking_lot::RwLock;

use maxiofs_auth::{AuthError, CredentialStore};
use maxiofs_cluster::{ClusterManager, ReplicationEngine, RequestRouter};
use maxiofs_core::types::AccessKey;
use maxiofs_core::{Config, DynamicSettings, ids};
use maxiofs_engine::ObjectEngine;
use maxiofs_meta::{MetaStore, keys};

use crate::identity::IdentityStore;
use crate::mgmt::SessionStore;

/// Everything a request handler may need. Constructed once at startup and
/// shared behind an `Arc`.
pub struct AppState {
    /// Static configuration.
    pub config: Config,
    /// The metadata store.
    pub meta: Arc<MetaStore>,
    /// The object engine.
    pub engine: ObjectEngine,
    /// Cluster identity and peers.
    pub manager: Arc<ClusterManager>,
    /// Request router (owner resolution, forwarding).
    pub router: Arc<RequestRouter>,
    /// Replication worker pool (for stats and queue depth).
    pub replication: Arc<ReplicationEngine>,
    /// Runtime-mutable settings.
    pub settings: RwLock<DynamicSettings>,
    /// Management sessions.
    pub sessions: SessionStore,
    /// Console login verification.
    pub identity: Arc<dyn IdentityStore>,
    /// Process start time, for uptime reporting.
    pub started_at: i64,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("started_at", &self.started_at)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Persist the current dynamic settings.
    pub fn save_settings(&self) -> maxiofs_core::Result<()> {
        let snapshot = self.settings.read().clone();
        self.meta.put(&keys::dynamic_settings(), &snapshot)
    }

    /// Load persisted dynamic settings, defaulting when absent.
    pub fn load_settings(meta: &MetaStore) -> maxiofs_core::Result<DynamicSettings> {
        Ok(meta
            .get::<DynamicSettings>(&keys::dynamic_settings())?
            .unwrap_or_default())
    }

    /// Seconds since process start.
    #[must_use]
    pub fn uptime_secs(&self) -> i64 {
        ids::now_secs() - self.started_at
    }
}

/// Secret-key lookups backed by the MetaStore's access-key rows.
#[derive(Debug, Clone)]
pub struct MetaCredentials {
    meta: Arc<MetaStore>,
}

impl MetaCredentials {
    /// Build a credential store over `meta`.
    #[must_use]
    pub fn new(meta: Arc<MetaStore>) -> Self {
        Self { meta }
    }

    /// Full access-key record, for tenant derivation after verification.
    pub fn access_key(&self, access_key_id: &str) -> maxiofs_core::Result<Option<AccessKey>> {
        self.meta.get(&keys::access_key(access_key_id))
    }
}

impl CredentialStore for MetaCredentials {
    fn secret_for(&self, access_key_id: &str) -> Result<String, AuthError> {
        self.meta
            .get::<AccessKey>(&keys::access_key(access_key_id))
            .ok()
            .flatten()
            .map(|record| record.secret_key)
            .ok_or_else(|| AuthError::UnknownAccessKey(access_key_id.to_owned()))
    }
}
