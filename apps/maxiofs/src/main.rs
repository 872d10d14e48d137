//! MaxIOFS server binary.
//!
//! Runs two listeners (the S3 API and the management console API), the
//! health-check loop, the replication worker pool, and the background
//! garbage collectors. Both listeners drain gracefully on SIGINT.
//!
//! # Usage
//!
//! ```text
//! maxiofs --data-dir /var/lib/maxiofs --listen 0.0.0.0:8080
//! ```
//!
//! Every flag can also come from the environment (`MAXIOFS_*`).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as HttpConnBuilder;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use maxiofs_blob::BlobStore;
use maxiofs_cluster::{
    ClusterManager, HealthChecker, LocationCache, Reconciler, ReplicationEngine, RequestRouter,
    RpcClient,
};
use maxiofs_core::types::Role;
use maxiofs_core::{Config, ids};
use maxiofs_crypto::MasterKey;
use maxiofs_engine::ObjectEngine;
use maxiofs_http::identity::{MetaIdentityStore, hash_password};
use maxiofs_http::mgmt::{MgmtService, SessionStore};
use maxiofs_http::s3::S3Service;
use maxiofs_http::{AppState, mgmt};
use maxiofs_meta::{MetaStore, keys};

/// Server version reported in logs.
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Interval between background garbage-collection passes.
const GC_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Parser)]
#[command(name = "maxiofs", version, about = "S3-compatible object storage server")]
struct Cli {
    /// Root directory for blobs, metadata, and keys.
    #[arg(long, env = "MAXIOFS_DATA_DIR", default_value = "/var/lib/maxiofs")]
    data_dir: PathBuf,

    /// Bind address of the S3 listener.
    #[arg(long, env = "MAXIOFS_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Bind address of the management/console listener.
    #[arg(long, env = "MAXIOFS_CONSOLE_LISTEN", default_value = "0.0.0.0:8081")]
    console_listen: String,

    /// Log level filter (overridden by RUST_LOG).
    #[arg(long, env = "MAXIOFS_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Externally reachable S3 URL, used in presigned URLs.
    #[arg(long, env = "MAXIOFS_PUBLIC_API_URL", default_value = "http://localhost:8080")]
    public_api_url: String,

    /// Externally reachable console URL.
    #[arg(long, env = "MAXIOFS_PUBLIC_CONSOLE_URL", default_value = "http://localhost:8081")]
    public_console_url: String,

    /// TLS certificate path. TLS is expected to terminate upstream; the
    /// flag is accepted for config parity and surfaced in logs.
    #[arg(long, env = "MAXIOFS_TLS_CERT")]
    tls_cert: Option<PathBuf>,

    /// TLS key path.
    #[arg(long, env = "MAXIOFS_TLS_KEY")]
    tls_key: Option<PathBuf>,

    /// Encrypt new objects at rest.
    #[arg(long = "encryption-enabled", env = "MAXIOFS_ENCRYPTION_ENABLED")]
    encryption_enabled: bool,

    /// Path to the 32-byte master key (defaults to data-dir/keys/master.key).
    #[arg(long = "encryption-master-key", env = "MAXIOFS_ENCRYPTION_MASTER_KEY")]
    encryption_master_key: Option<PathBuf>,

    /// Days of audit records to retain.
    #[arg(long = "audit-retention-days", env = "MAXIOFS_AUDIT_RETENTION_DAYS", default_value_t = 90)]
    audit_retention_days: u32,

    /// Seconds between peer health probes.
    #[arg(long = "cluster-health-interval", env = "MAXIOFS_HEALTH_INTERVAL", default_value_t = 30)]
    health_interval: u64,

    /// Location-cache TTL in seconds.
    #[arg(long = "cluster-cache-ttl", env = "MAXIOFS_CACHE_TTL", default_value_t = 300)]
    cache_ttl: u64,

    /// Replication worker count.
    #[arg(long = "replication-worker-count", env = "MAXIOFS_REPLICATION_WORKERS", default_value_t = 5)]
    replication_workers: usize,

    /// Domain suffix for virtual-host-style bucket addressing.
    #[arg(long, env = "MAXIOFS_DOMAIN", default_value = "s3.localhost")]
    domain: String,

    /// Region label reported by this node.
    #[arg(long, env = "MAXIOFS_REGION")]
    region: Option<String>,

    /// Node name used for cluster identity.
    #[arg(long = "node-name", env = "MAXIOFS_NODE_NAME", default_value = "maxiofs")]
    node_name: String,
}

impl Cli {
    fn into_config(self) -> Config {
        Config {
            data_dir: self.data_dir,
            listen: self.listen,
            console_listen: self.console_listen,
            log_level: self.log_level,
            public_api_url: self.public_api_url,
            public_console_url: self.public_console_url,
            tls_cert: self.tls_cert,
            tls_key: self.tls_key,
            encryption_enabled: self.encryption_enabled,
            encryption_master_key: self.encryption_master_key,
            audit_retention_days: self.audit_retention_days,
            health_interval_s: self.health_interval,
            cache_ttl_s: self.cache_ttl,
            replication_workers: self.replication_workers,
            domain: self.domain,
            region: self.region,
            ..Config::default()
        }
    }
}

/// Initialize the tracing subscriber. `RUST_LOG` wins over the flag.
fn init_tracing(log_level: &str) -> Result<()> {
    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        EnvFilter::try_new(log_level)
            .with_context(|| format!("invalid log level filter: {log_level}"))?
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
    Ok(())
}

/// Load the master key, generating one on first start when encryption is on.
fn load_master_key(config: &Config) -> Result<Option<MasterKey>> {
    let path = config
        .encryption_master_key
        .clone()
        .unwrap_or_else(|| config.default_master_key_path());

    if path.exists() {
        let key = MasterKey::load(&path)
            .with_context(|| format!("loading master key from {}", path.display()))?;
        info!(path = %path.display(), "master key loaded");
        return Ok(Some(key));
    }

    if config.encryption_enabled {
        let key = MasterKey::generate();
        key.save(&path)
            .with_context(|| format!("writing master key to {}", path.display()))?;
        info!(path = %path.display(), "generated new master key");
        return Ok(Some(key));
    }

    Ok(None)
}

/// Create the default global admin on first start.
fn bootstrap_admin(meta: &MetaStore) -> Result<()> {
    let users = meta.scan_prefix("user:", None, 1)?;
    if !users.is_empty() {
        return Ok(());
    }

    let password =
        std::env::var("MAXIOFS_ADMIN_PASSWORD").unwrap_or_else(|_| ids::random_token(12));
    let user = maxiofs_core::types::User {
        id: uuid::Uuid::new_v4(),
        tenant_id: None,
        username: "admin".to_owned(),
        password_hash: hash_password(&password),
        roles: vec![Role::Admin],
        updated_at: ids::now_secs(),
        locked_until: None,
        failed_attempts: 0,
    };
    meta.put(&keys::user(user.id), &user)?;
    meta.put(&keys::username(&user.username), &user.id)?;

    // Printed once; never logged again or stored in clear.
    info!(username = "admin", password = %password, "created initial admin account");
    Ok(())
}

/// Accept connections on `listener` and serve `service` until shutdown.
async fn serve<S>(name: &'static str, listener: TcpListener, service: S) -> Result<()>
where
    S: hyper::service::Service<
            http::Request<hyper::body::Incoming>,
            Response = http::Response<maxiofs_http::body::ResponseBody>,
            Error = std::convert::Infallible,
        > + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send,
{
    let graceful = hyper_util::server::graceful::GracefulShutdown::new();
    let http = HttpConnBuilder::new(TokioExecutor::new());

    let shutdown = async {
        tokio::signal::ctrl_c().await.ok();
        info!(listener = name, "received shutdown signal, draining connections");
    };
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                let (stream, peer_addr) = match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        warn!(listener = name, error = %e, "failed to accept connection");
                        continue;
                    }
                };
                let svc = service.clone();
                let conn = http.serve_connection(TokioIo::new(stream), svc);
                let conn = graceful.watch(conn.into_owned());
                tokio::spawn(async move {
                    if let Err(e) = conn.await {
                        error!(peer_addr = %peer_addr, error = %e, "connection error");
                    }
                });
            }
            () = &mut shutdown => break,
        }
    }

    graceful.shutdown().await;
    info!(listener = name, "connections drained");
    Ok(())
}

/// Periodic housekeeping: multipart GC, tombstone GC, audit GC, queue purge.
async fn run_gc_loop(
    state: Arc<AppState>,
    reconciler: Arc<Reconciler>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(GC_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match state.engine.gc_stale_uploads(state.config.multipart_gc_age_s).await {
                    Ok(0) => {}
                    Ok(collected) => info!(collected, "aborted stale multipart uploads"),
                    Err(e) => warn!(error = %e, "multipart GC failed"),
                }
                match reconciler.gc_tombstones() {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned tombstones"),
                    Err(e) => warn!(error = %e, "tombstone GC failed"),
                }
                match mgmt::gc_audit(&state) {
                    Ok(0) => {}
                    Ok(removed) => info!(removed, "pruned audit records"),
                    Err(e) => warn!(error = %e, "audit GC failed"),
                }
                match state.replication.purge_terminal(state.config.stale_window_s) {
                    Ok(0) => {}
                    Ok(purged) => info!(purged, "purged terminal replication entries"),
                    Err(e) => warn!(error = %e, "replication queue purge failed"),
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let node_name = cli.node_name.clone();
    let config = cli.into_config();
    init_tracing(&config.log_level)?;

    info!(
        version = VERSION,
        listen = %config.listen,
        console_listen = %config.console_listen,
        data_dir = %config.data_dir.display(),
        encryption = config.encryption_enabled,
        "starting MaxIOFS"
    );
    if config.tls_cert.is_some() || config.tls_key.is_some() {
        warn!("TLS flags are set; terminate TLS at the load balancer in front of MaxIOFS");
    }

    // Storage plane.
    let meta = Arc::new(MetaStore::open(config.metadata_dir().join("meta.redb"))?);
    let blobs = Arc::new(BlobStore::open(config.objects_dir())?);
    let master_key = load_master_key(&config)?;
    bootstrap_admin(&meta)?;

    // Cluster plane.
    let manager = ClusterManager::load(Arc::clone(&meta), &node_name, config.region.clone())?;
    let rpc = RpcClient::new(manager.this_node_id())?;
    let cache = Arc::new(LocationCache::new(Duration::from_secs(config.cache_ttl_s)));
    let router = Arc::new(RequestRouter::new(
        Arc::clone(&meta),
        cache,
        Arc::clone(&manager),
        rpc.clone(),
    ));

    let engine = ObjectEngine::new(
        Arc::clone(&meta),
        blobs,
        master_key,
        config.encryption_enabled,
        manager.this_node_id(),
        config.replication_max_attempts,
    );

    let replication = ReplicationEngine::new(
        Arc::clone(&meta),
        engine.clone(),
        Arc::clone(&manager),
        rpc.clone(),
        config.replication_workers,
    );
    replication.recover_orphaned_claims()?;

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&meta),
        Arc::clone(&manager),
        rpc,
        config.stale_window_s,
    ));

    // A node rejoining an initialized cluster pulls the latest management
    // state before serving.
    if manager.is_clustered()? && manager.node_token().is_some() {
        match reconciler.pull_and_merge().await {
            Ok(report) => info!(applied = report.applied, "reconciled state from peers"),
            Err(e) => warn!(error = %e, "startup reconciliation skipped"),
        }
    }

    // Shared state.
    let settings = AppState::load_settings(&meta)?;
    let identity = Arc::new(MetaIdentityStore::new(Arc::clone(&meta)));
    let state = Arc::new(AppState {
        config: config.clone(),
        meta,
        engine,
        manager: Arc::clone(&manager),
        router,
        replication: Arc::clone(&replication),
        settings: parking_lot::RwLock::new(settings),
        sessions: SessionStore::new(),
        identity,
        started_at: ids::now_secs(),
    });

    // Background tasks.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health = HealthChecker::new(
        Arc::clone(&state.meta),
        Arc::clone(&manager),
        Duration::from_secs(config.health_interval_s),
    )?;
    let health_task = tokio::spawn(health.run(shutdown_rx.clone()));
    let worker_tasks = replication.spawn(shutdown_rx.clone());
    let gc_task = tokio::spawn(run_gc_loop(
        Arc::clone(&state),
        Arc::clone(&reconciler),
        shutdown_rx,
    ));

    // Listeners.
    let s3_addr: SocketAddr = config
        .listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.listen))?;
    let console_addr: SocketAddr = config
        .console_listen
        .parse()
        .with_context(|| format!("invalid bind address: {}", config.console_listen))?;

    let s3_listener = TcpListener::bind(s3_addr)
        .await
        .with_context(|| format!("failed to bind S3 listener to {s3_addr}"))?;
    let console_listener = TcpListener::bind(console_addr)
        .await
        .with_context(|| format!("failed to bind console listener to {console_addr}"))?;

    info!(s3 = %s3_addr, console = %console_addr, "listening");

    let s3_service = S3Service::new(Arc::clone(&state));
    let mgmt_service = MgmtService::new(Arc::clone(&state));

    let (s3_result, console_result) = tokio::join!(
        serve("s3", s3_listener, s3_service),
        serve("console", console_listener, mgmt_service),
    );
    s3_result?;
    console_result?;

    // Stop background tasks and flush state.
    shutdown_tx.send(true).ok();
    health_task.await.ok();
    gc_task.await.ok();
    for task in worker_tasks {
        task.await.ok();
    }
    state.save_settings()?;
    info!("shutdown complete");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_build_config_from_cli_defaults() {
        let cli = Cli::parse_from(["maxiofs"]);
        let config = cli.into_config();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.console_listen, "0.0.0.0:8081");
        assert_eq!(config.replication_workers, 5);
        assert_eq!(config.health_interval_s, 30);
    }

    #[test]
    fn test_should_override_config_from_flags() {
        let cli = Cli::parse_from([
            "maxiofs",
            "--listen",
            "127.0.0.1:9000",
            "--cluster-health-interval",
            "5",
            "--replication-worker-count",
            "2",
            "--encryption-enabled",
        ]);
        let config = cli.into_config();
        assert_eq!(config.listen, "127.0.0.1:9000");
        assert_eq!(config.health_interval_s, 5);
        assert_eq!(config.replication_workers, 2);
        assert!(config.encryption_enabled);
    }

    #[test]
    fn test_should_bootstrap_admin_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let meta = MetaStore::open(dir.path().join("meta.redb")).unwrap();

        bootstrap_admin(&meta).unwrap();
        let first = meta.scan_prefix("user:", None, 10).unwrap();
        assert_eq!(first.len(), 1);

        // A second boot must not create a duplicate.
        bootstrap_admin(&meta).unwrap();
        let second = meta.scan_prefix("user:", None, 10).unwrap();
        assert_eq!(second.len(), 1);
    }
}
