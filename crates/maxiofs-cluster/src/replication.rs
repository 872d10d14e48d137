//! Asynchronous bucket replication.
//!
//! Object mutations enqueue durable [`ReplicationQueueEntry`] rows inside
//! the committing transaction (see the engine). A pool of workers drains
//! the queue: each claims the highest-priority runnable entry by flipping
//! its status `pending → in_flight` inside a write transaction (redb
//! serializes writers, so a claim can never be won twice), pushes the
//! object or delete to the destination over signed RPC, and finishes the
//! entry as `done` or reschedules it with exponential backoff until
//! `attempts` reaches the ceiling, after which it parks as `failed`.
//!
//! Workers never block client writes: when a destination is down the queue
//! simply grows, and the depth is exported for operators.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use maxiofs_core::types::{
    ClusterNode, QueueStatus, ReplicationOp, ReplicationQueueEntry, ReplicationRule,
};
use maxiofs_core::{Error, Result, ids};
use maxiofs_engine::object::{GetObjectInput, GetOutcome};
use maxiofs_engine::ObjectEngine;
use maxiofs_meta::{MetaStore, keys};

use crate::manager::ClusterManager;
use crate::rpc::RpcClient;

/// Idle poll interval when the queue is empty.
const IDLE_POLL: Duration = Duration::from_secs(1);

/// Backoff ceiling between attempts.
const MAX_BACKOFF_SECS: u64 = 300;

/// Rows examined per claim scan.
const CLAIM_SCAN_CHUNK: usize = 128;

/// Exponential backoff: `2^attempts` seconds, capped.
#[must_use]
pub fn backoff_secs(attempts: u32) -> u64 {
    2u64.saturating_pow(attempts).min(MAX_BACKOFF_SECS)
}

/// The replication worker pool.
#[derive(Debug)]
pub struct ReplicationEngine {
    meta: Arc<MetaStore>,
    engine: ObjectEngine,
    manager: Arc<ClusterManager>,
    rpc: RpcClient,
    workers: usize,
}

impl ReplicationEngine {
    /// Build a pool of `workers` workers.
    #[must_use]
    pub fn new(
        meta: Arc<MetaStore>,
        engine: ObjectEngine,
        manager: Arc<ClusterManager>,
        rpc: RpcClient,
        workers: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            meta,
            engine,
            manager,
            rpc,
            workers: workers.max(1),
        })
    }

    /// Requeue entries a previous process left `in_flight`. Run once at
    /// startup before spawning workers.
    pub fn recover_orphaned_claims(&self) -> Result<u64> {
        let recovered = self.meta.update(|txn| {
            let rows = txn.scan_prefix(&keys::replication_queue_prefix(), None, usize::MAX)?;
            let mut recovered = 0u64;
            for (row_key, bytes) in &rows {
                let mut entry: ReplicationQueueEntry =
                    serde_json::from_slice(bytes).map_err(|e| {
                        Error::Internal(anyhow::anyhow!("corrupt queue entry at {row_key}: {e}"))
                    })?;
                if entry.status == QueueStatus::InFlight {
                    entry.status = QueueStatus::Pending;
                    txn.put(row_key, &entry)?;
                    recovered += 1;
                }
            }
            Ok(recovered)
        })?;
        if recovered > 0 {
            info!(recovered, "requeued orphaned in-flight replication entries");
        }
        Ok(recovered)
    }

    /// Spawn the worker tasks. They run until `shutdown` flips to `true`.
    pub fn spawn(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        (0..self.workers)
            .map(|worker_id| {
                let pool = Arc::clone(self);
                let mut shutdown = shutdown.clone();
                tokio::spawn(async move {
                    debug!(worker_id, "replication worker started");
                    loop {
                        if *shutdown.borrow() {
                            break;
                        }
                        match pool.work_once().await {
                            Ok(true) => {}
                            Ok(false) => {
                                tokio::select! {
                                    () = tokio::time::sleep(IDLE_POLL) => {}
                                    _ = shutdown.changed() => {}
                                }
                            }
                            Err(e) => {
                                warn!(worker_id, error = %e, "replication worker iteration failed");
                                tokio::time::sleep(IDLE_POLL).await;
                            }
                        }
                    }
                    debug!(worker_id, "replication worker stopped");
                })
            })
            .collect()
    }

    /// Claim and process one entry. Returns whether anything was claimed.
    pub async fn work_once(&self) -> Result<bool> {
        let Some((row_key, entry)) = self.claim_next()? else {
            return Ok(false);
        };
        self.process(&row_key, entry).await?;
        Ok(true)
    }

    /// Claim the first runnable entry (`pending` with a due
    /// `next_attempt_at`) in queue order.
    fn claim_next(&self) -> Result<Option<(String, ReplicationQueueEntry)>> {
        let now = ids::now_secs();
        self.meta.update(|txn| {
            let mut cursor: Option<String> = None;
            loop {
                let rows = txn.scan_prefix(
                    &keys::replication_queue_prefix(),
                    cursor.as_deref(),
                    CLAIM_SCAN_CHUNK,
                )?;
                if rows.is_empty() {
                    return Ok(None);
                }
                for (row_key, bytes) in &rows {
                    cursor = Some(row_key.clone());
                    let mut entry: ReplicationQueueEntry = serde_json::from_slice(bytes)
                        .map_err(|e| {
                            Error::Internal(anyhow::anyhow!(
                                "corrupt queue entry at {row_key}: {e}"
                            ))
                        })?;
                    if entry.status == QueueStatus::Pending && entry.next_attempt_at <= now {
                        entry.status = QueueStatus::InFlight;
                        txn.put(row_key, &entry)?;
                        return Ok(Some((row_key.clone(), entry)));
                    }
                }
                if rows.len() < CLAIM_SCAN_CHUNK {
                    return Ok(None);
                }
            }
        })
    }

    /// Execute one claimed entry.
    async fn process(&self, row_key: &str, entry: ReplicationQueueEntry) -> Result<()> {
        let Some(rule) = self
            .meta
            .get::<ReplicationRule>(&keys::replication_rule(entry.rule_id))?
        else {
            // The rule was deleted; the entry has nowhere to go.
            debug!(entry = %entry.id, "dropping entry for removed rule");
            return self.finish(row_key, entry, QueueStatus::Done, None, 0);
        };

        let destination = self.manager.get_peer(rule.destination_node_id)?;
        let Some(destination) = destination.filter(|node| node.health.is_reachable()) else {
            // Destination down or gone: release the claim with backoff but
            // without consuming an attempt.
            return self.release(row_key, entry, "destination unavailable");
        };

        let result = match entry.op {
            ReplicationOp::Put => self.push_object(&rule, &destination, &entry).await,
            ReplicationOp::Delete => self.push_delete(&rule, &destination, &entry).await,
        };

        match result {
            Ok(bytes) => {
                debug!(
                    entry = %entry.id,
                    bucket = %entry.bucket,
                    key = %entry.key,
                    destination = %destination.id,
                    "replication transfer succeeded"
                );
                self.finish(row_key, entry, QueueStatus::Done, None, bytes)
            }
            Err(e) => {
                let attempts = entry.attempts + 1;
                let message = e.to_string();
                warn!(
                    entry = %entry.id,
                    bucket = %entry.bucket,
                    key = %entry.key,
                    attempts,
                    error = %message,
                    "replication transfer failed"
                );
                if attempts < entry.max_attempts {
                    self.retry(row_key, entry, attempts, &message)
                } else {
                    self.finish_failed(row_key, entry, attempts, &message)
                }
            }
        }
    }

    /// Push the current version of the entry's key. Returns bytes sent.
    async fn push_object(
        &self,
        rule: &ReplicationRule,
        destination: &ClusterNode,
        entry: &ReplicationQueueEntry,
    ) -> Result<u64> {
        let outcome = self
            .engine
            .get_object(GetObjectInput {
                bucket: entry.bucket.clone(),
                key: entry.key.clone(),
                ..GetObjectInput::default()
            })
            .await;

        let found = match outcome {
            Ok(GetOutcome::Found(found)) => found,
            // The object vanished between enqueue and transfer; the
            // corresponding delete event carries the news.
            Ok(GetOutcome::DeleteMarker { .. }) | Err(Error::NoSuchKey { .. }) => return Ok(0),
            Err(e) => return Err(e),
        };

        let mut reader = found.reader;
        let mut body = Vec::with_capacity(usize::try_from(found.content_length).unwrap_or(0));
        reader
            .read_to_end(&mut body)
            .await
            .map_err(|e| Error::Internal(anyhow::anyhow!("read replication source: {e}")))?;

        let mut headers = vec![(
            "content-type".to_owned(),
            found.record.content_type.clone(),
        )];
        if rule.replicate_metadata {
            for (name, value) in &found.record.user_metadata {
                headers.push((format!("x-amz-meta-{name}"), value.clone()));
            }
        }

        let token = self.node_token()?;
        let path = format!(
            "/_internal/object/{}/{}",
            rule.destination_bucket, entry.key
        );
        let sent = body.len() as u64;
        let response = self
            .rpc
            .send(
                &token,
                &destination.endpoint,
                reqwest::Method::PUT,
                &path,
                &headers,
                body,
            )
            .await?;

        if response.status().is_success() {
            Ok(sent)
        } else {
            Err(Error::unavailable(format!(
                "destination returned {}",
                response.status()
            )))
        }
    }

    /// Propagate a delete to the destination.
    async fn push_delete(
        &self,
        rule: &ReplicationRule,
        destination: &ClusterNode,
        entry: &ReplicationQueueEntry,
    ) -> Result<u64> {
        let token = self.node_token()?;
        let path = format!(
            "/_internal/object/{}/{}",
            rule.destination_bucket, entry.key
        );
        let response = self
            .rpc
            .send(
                &token,
                &destination.endpoint,
                reqwest::Method::DELETE,
                &path,
                &[],
                Vec::new(),
            )
            .await?;

        // 404 means the destination never had the key; the delete is moot.
        if response.status().is_success() || response.status() == reqwest::StatusCode::NOT_FOUND {
            Ok(0)
        } else {
            Err(Error::unavailable(format!(
                "destination returned {}",
                response.status()
            )))
        }
    }

    /// Terminal success: entry done, rule statistics advanced.
    fn finish(
        &self,
        row_key: &str,
        mut entry: ReplicationQueueEntry,
        status: QueueStatus,
        error: Option<String>,
        bytes: u64,
    ) -> Result<()> {
        entry.status = status;
        entry.last_error = error;
        let rule_id = entry.rule_id;
        self.meta.update(|txn| {
            txn.put(row_key, &entry)?;
            if let Some(mut rule) =
                txn.get::<ReplicationRule>(&keys::replication_rule(rule_id))?
            {
                rule.objects_replicated += 1;
                rule.bytes_replicated += bytes;
                rule.last_sync_at = Some(ids::now_secs());
                rule.last_error = None;
                txn.put(&keys::replication_rule(rule_id), &rule)?;
            }
            Ok(())
        })
    }

    /// Transient failure: consume an attempt and reschedule.
    fn retry(
        &self,
        row_key: &str,
        mut entry: ReplicationQueueEntry,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        entry.status = QueueStatus::Pending;
        entry.attempts = attempts;
        entry.next_attempt_at = ids::now_secs() + i64::try_from(backoff_secs(attempts)).unwrap_or(0);
        entry.last_error = Some(error.to_owned());
        self.record_rule_error(&entry, error)?;
        self.meta.update(|txn| txn.put(row_key, &entry))
    }

    /// Attempts exhausted: park as failed.
    fn finish_failed(
        &self,
        row_key: &str,
        mut entry: ReplicationQueueEntry,
        attempts: u32,
        error: &str,
    ) -> Result<()> {
        entry.status = QueueStatus::Failed;
        entry.attempts = attempts;
        entry.last_error = Some(error.to_owned());
        self.record_rule_error(&entry, error)?;
        self.meta.update(|txn| txn.put(row_key, &entry))
    }

    /// Destination unreachable: release the claim without consuming an
    /// attempt.
    fn release(&self, row_key: &str, mut entry: ReplicationQueueEntry, reason: &str) -> Result<()> {
        entry.status = QueueStatus::Pending;
        entry.next_attempt_at =
            ids::now_secs() + i64::try_from(backoff_secs(entry.attempts + 1)).unwrap_or(0);
        entry.last_error = Some(reason.to_owned());
        self.meta.update(|txn| txn.put(row_key, &entry))
    }

    fn record_rule_error(&self, entry: &ReplicationQueueEntry, error: &str) -> Result<()> {
        self.meta.update(|txn| {
            if let Some(mut rule) =
                txn.get::<ReplicationRule>(&keys::replication_rule(entry.rule_id))?
            {
                rule.last_error = Some(error.to_owned());
                txn.put(&keys::replication_rule(entry.rule_id), &rule)?;
            }
            Ok(())
        })
    }

    fn node_token(&self) -> Result<String> {
        self.manager
            .node_token()
            .ok_or_else(|| Error::unavailable("cluster is not initialized"))
    }

    /// Entries not yet terminal, for the backpressure gauge.
    pub fn queue_depth(&self) -> Result<u64> {
        let entries: Vec<ReplicationQueueEntry> = self
            .meta
            .scan_values(&keys::replication_queue_prefix())?;
        Ok(entries
            .iter()
            .filter(|e| matches!(e.status, QueueStatus::Pending | QueueStatus::InFlight))
            .count() as u64)
    }

    /// Purge terminal entries older than `retention_secs`. Returns how
    /// many were removed.
    pub fn purge_terminal(&self, retention_secs: u64) -> Result<u64> {
        let cutoff = ids::now_secs() - i64::try_from(retention_secs).unwrap_or(i64::MAX);
        self.meta.update(|txn| {
            let rows = txn.scan_prefix(&keys::replication_queue_prefix(), None, usize::MAX)?;
            let mut purged = 0u64;
            for (row_key, bytes) in &rows {
                let entry: ReplicationQueueEntry = serde_json::from_slice(bytes).map_err(|e| {
                    Error::Internal(anyhow::anyhow!("corrupt queue entry at {row_key}: {e}"))
                })?;
                let terminal = matches!(entry.status, QueueStatus::Done | QueueStatus::Failed);
                if terminal && entry.enqueued_at < cutoff {
                    txn.delete(row_key)?;
                    purged += 1;
                }
            }
            Ok(purged)
        })
    }
}

/// Reject rules that would replicate a bucket onto its own node.
pub fn validate_rule(rule: &ReplicationRule, local_node_id: Uuid) -> Result<()> {
    if rule.destination_node_id == local_node_id {
        return Err(Error::invalid_argument(
            "replication destination must be a different node",
        ));
    }
    if rule.source_bucket.is_empty() || rule.destination_bucket.is_empty() {
        return Err(Error::invalid_argument(
            "source and destination buckets are required",
        ));
    }
    if rule.sync_interval_s == 0 {
        return Err(Error::invalid_argument("sync interval must be positive"));
    }
    Ok(())
}
