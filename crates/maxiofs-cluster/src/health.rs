//! Peer health checking.
//!
//! One background task probes every registered peer each interval with a
//! bounded concurrent fan-out. A probe is a GET on the peer's `/health`
//! with a five-second deadline; the wall latency classifies the peer:
//! under one second `healthy`, up to five `degraded`, anything else
//! `unavailable`. Each probe updates exactly one node row (health, latency,
//! check time, and `last_seen_at` only on success) and appends one history
//! row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use maxiofs_core::types::{ClusterNode, HealthSample, NodeHealth};
use maxiofs_core::{Result, ids};
use maxiofs_meta::{MetaStore, keys};

use crate::manager::ClusterManager;

/// Probe deadline.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Latency ceiling for `healthy`.
const HEALTHY_LATENCY: Duration = Duration::from_secs(1);

/// Concurrent probes in flight.
const PROBE_FANOUT: usize = 8;

/// Classify a probe result.
#[must_use]
pub fn classify(latency: Option<Duration>) -> NodeHealth {
    match latency {
        Some(elapsed) if elapsed < HEALTHY_LATENCY => NodeHealth::Healthy,
        Some(elapsed) if elapsed <= PROBE_TIMEOUT => NodeHealth::Degraded,
        _ => NodeHealth::Unavailable,
    }
}

/// The periodic health prober.
#[derive(Debug)]
pub struct HealthChecker {
    meta: Arc<MetaStore>,
    manager: Arc<ClusterManager>,
    http: reqwest::Client,
    interval: Duration,
}

impl HealthChecker {
    /// Build a checker probing every `interval`.
    pub fn new(
        meta: Arc<MetaStore>,
        manager: Arc<ClusterManager>,
        interval: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(PROBE_TIMEOUT)
            .timeout(PROBE_TIMEOUT)
            .build()
            .map_err(|e| {
                maxiofs_core::Error::Internal(anyhow::anyhow!("build health client: {e}"))
            })?;
        Ok(Self {
            meta,
            manager,
            http,
            interval,
        })
    }

    /// Run until `shutdown` flips to `true`. One probe round per interval.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_s = self.interval.as_secs(), "health checker started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.probe_all().await {
                        warn!(error = %e, "health probe round failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health checker stopping");
                        return;
                    }
                }
            }
        }
    }

    /// Probe every peer once, with bounded fan-out.
    pub async fn probe_all(&self) -> Result<()> {
        let peers = self.manager.list_peers()?;
        if peers.is_empty() {
            return Ok(());
        }

        let results: Vec<(ClusterNode, Option<Duration>)> = futures::stream::iter(peers)
            .map(|peer| {
                let http = self.http.clone();
                async move {
                    let latency = probe_one(&http, &peer).await;
                    (peer, latency)
                }
            })
            .buffer_unordered(PROBE_FANOUT)
            .collect()
            .await;

        for (peer, latency) in results {
            self.record(&peer, latency)?;
        }
        Ok(())
    }

    /// Persist one probe observation: the node row plus a history row.
    fn record(&self, peer: &ClusterNode, latency: Option<Duration>) -> Result<()> {
        let health = classify(latency);
        let now = ids::now_secs();
        let latency_ms = latency.map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX));

        self.meta.update(|txn| {
            // The peer may have been removed while the probe ran.
            let Some(mut node) = txn.get::<ClusterNode>(&keys::node(peer.id))? else {
                return Ok(());
            };
            if node.health != health {
                debug!(
                    peer = %node.id,
                    from = node.health.as_str(),
                    to = health.as_str(),
                    "peer health transition"
                );
            }
            node.health = health;
            node.last_check_at = Some(now);
            node.latency_ms = latency_ms;
            if latency.is_some() {
                node.last_seen_at = Some(now);
            }
            node.updated_at = now;
            txn.put(&keys::node(peer.id), &node)?;

            let sample = HealthSample {
                node_id: peer.id,
                checked_at: now,
                health,
                latency_ms,
            };
            txn.put(&keys::health_history(peer.id, now), &sample)
        })
    }
}

/// Probe one peer; `None` means timeout or transport error.
async fn probe_one(http: &reqwest::Client, peer: &ClusterNode) -> Option<Duration> {
    let url = format!("{}/health", peer.endpoint.trim_end_matches('/'));
    let started = Instant::now();
    match http.get(&url).send().await {
        Ok(response) if response.status().is_success() => Some(started.elapsed()),
        Ok(response) => {
            debug!(peer = %peer.id, status = %response.status(), "health probe non-success");
            None
        }
        Err(e) => {
            debug!(peer = %peer.id, error = %e, "health probe failed");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manager::new_peer;
    use uuid::Uuid;

    #[test]
    fn test_should_classify_latency_bands() {
        assert_eq!(
            classify(Some(Duration::from_millis(50))),
            NodeHealth::Healthy
        );
        assert_eq!(
            classify(Some(Duration::from_millis(999))),
            NodeHealth::Healthy
        );
        assert_eq!(
            classify(Some(Duration::from_millis(1500))),
            NodeHealth::Degraded
        );
        assert_eq!(classify(Some(Duration::from_secs(5))), NodeHealth::Degraded);
        assert_eq!(classify(Some(Duration::from_secs(6))), NodeHealth::Unavailable);
        assert_eq!(classify(None), NodeHealth::Unavailable);
    }

    fn checker_env() -> (tempfile::TempDir, HealthChecker, Arc<ClusterManager>) {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = Arc::new(MetaStore::open(dir.path().join("meta.redb")).unwrap());
        let manager = ClusterManager::load(Arc::clone(&meta), "node-a", None).unwrap();
        let checker =
            HealthChecker::new(meta, Arc::clone(&manager), Duration::from_secs(30)).unwrap();
        (dir, checker, manager)
    }

    #[tokio::test]
    async fn test_should_mark_unreachable_peer_unavailable_and_keep_last_seen() {
        let (_dir, checker, manager) = checker_env();
        // Port 9 is unassigned on loopback; the probe fails fast.
        let peer_id = Uuid::new_v4();
        let mut peer = new_peer(peer_id, "dead", "http://127.0.0.1:9", "tok", 0);
        peer.last_seen_at = Some(12345);
        manager.add_peer(peer).unwrap();

        checker.probe_all().await.unwrap();

        let stored = manager.get_peer(peer_id).unwrap().unwrap();
        assert_eq!(stored.health, NodeHealth::Unavailable);
        assert!(stored.last_check_at.is_some());
        assert_eq!(
            stored.last_seen_at,
            Some(12345),
            "failed probes must not advance last_seen_at"
        );
        assert_eq!(stored.latency_ms, None);
    }

    #[tokio::test]
    async fn test_should_append_health_history_per_probe() {
        let (_dir, checker, manager) = checker_env();
        let peer_id = Uuid::new_v4();
        manager
            .add_peer(new_peer(peer_id, "dead", "http://127.0.0.1:9", "tok", 0))
            .unwrap();

        checker.probe_all().await.unwrap();

        let history = checker
            .meta
            .scan_prefix(&keys::health_history_prefix(peer_id), None, usize::MAX)
            .unwrap();
        assert_eq!(history.len(), 1);
    }

    #[tokio::test]
    async fn test_should_do_nothing_without_peers() {
        let (_dir, checker, _manager) = checker_env();
        checker.probe_all().await.unwrap();
    }
}
