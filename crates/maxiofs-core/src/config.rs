//! Server configuration.
//!
//! [`Config`] is the static configuration fixed at process start (the binary
//! populates it from CLI flags and environment variables).
//! [`DynamicSettings`] are runtime-mutable and persisted in the MetaStore so
//! they survive restarts and can be changed through the management API
//! without one.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Static server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Root directory for blobs, metadata, and keys.
    pub data_dir: PathBuf,
    /// Bind address of the S3 listener.
    pub listen: String,
    /// Bind address of the management/console listener.
    pub console_listen: String,
    /// Log level filter (overridden by `RUST_LOG`).
    pub log_level: String,
    /// Externally reachable S3 URL, used in presigned URLs.
    pub public_api_url: String,
    /// Externally reachable console URL.
    pub public_console_url: String,
    /// TLS certificate path; TLS is terminated upstream when unset.
    pub tls_cert: Option<PathBuf>,
    /// TLS key path.
    pub tls_key: Option<PathBuf>,
    /// Whether new objects are encrypted at rest (requires a master key).
    pub encryption_enabled: bool,
    /// Path to the 32-byte master key file.
    pub encryption_master_key: Option<PathBuf>,
    /// Days of audit records to retain.
    pub audit_retention_days: u32,
    /// Seconds between peer health probes.
    pub health_interval_s: u64,
    /// Location-cache TTL in seconds.
    pub cache_ttl_s: u64,
    /// Replication worker count.
    pub replication_workers: usize,
    /// Domain suffix for virtual-host-style bucket addressing.
    pub domain: String,
    /// Region label reported by this node.
    pub region: Option<String>,
    /// Last-seen gap after which a peer counts as stale.
    pub stale_window_s: u64,
    /// Age after which initiated multipart uploads are garbage-collected.
    pub multipart_gc_age_s: u64,
    /// Replication attempt ceiling per queue entry.
    pub replication_max_attempts: u32,
    /// Queue depth above which the backpressure gauge trips.
    pub replication_queue_warn_depth: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/maxiofs"),
            listen: "0.0.0.0:8080".to_owned(),
            console_listen: "0.0.0.0:8081".to_owned(),
            log_level: "info".to_owned(),
            public_api_url: "http://localhost:8080".to_owned(),
            public_console_url: "http://localhost:8081".to_owned(),
            tls_cert: None,
            tls_key: None,
            encryption_enabled: false,
            encryption_master_key: None,
            audit_retention_days: 90,
            health_interval_s: 30,
            cache_ttl_s: 300,
            replication_workers: 5,
            domain: "s3.localhost".to_owned(),
            region: None,
            stale_window_s: 86_400,
            multipart_gc_age_s: 7 * 86_400,
            replication_max_attempts: 10,
            replication_queue_warn_depth: 10_000,
        }
    }
}

impl Config {
    /// Load configuration from environment variables on top of defaults.
    ///
    /// The binary layers CLI flags on top of this.
    #[must_use]
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("MAXIOFS_DATA_DIR") {
            config.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("MAXIOFS_LISTEN") {
            config.listen = v;
        }
        if let Ok(v) = std::env::var("MAXIOFS_CONSOLE_LISTEN") {
            config.console_listen = v;
        }
        if let Ok(v) = std::env::var("MAXIOFS_LOG_LEVEL") {
            config.log_level = v;
        }
        if let Ok(v) = std::env::var("MAXIOFS_PUBLIC_API_URL") {
            config.public_api_url = v;
        }
        if let Ok(v) = std::env::var("MAXIOFS_PUBLIC_CONSOLE_URL") {
            config.public_console_url = v;
        }
        if let Ok(v) = std::env::var("MAXIOFS_ENCRYPTION_ENABLED") {
            config.encryption_enabled = v == "1" || v.eq_ignore_ascii_case("true");
        }
        if let Ok(v) = std::env::var("MAXIOFS_ENCRYPTION_MASTER_KEY") {
            config.encryption_master_key = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("MAXIOFS_HEALTH_INTERVAL") {
            if let Ok(n) = v.parse() {
                config.health_interval_s = n;
            }
        }
        if let Ok(v) = std::env::var("MAXIOFS_CACHE_TTL") {
            if let Ok(n) = v.parse() {
                config.cache_ttl_s = n;
            }
        }
        if let Ok(v) = std::env::var("MAXIOFS_REPLICATION_WORKERS") {
            if let Ok(n) = v.parse() {
                config.replication_workers = n;
            }
        }
        if let Ok(v) = std::env::var("MAXIOFS_DOMAIN") {
            config.domain = v;
        }
        if let Ok(v) = std::env::var("MAXIOFS_REGION") {
            config.region = Some(v);
        }

        config
    }

    /// Directory holding MetaStore files.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    /// Directory holding object blobs.
    #[must_use]
    pub fn objects_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    /// Default master-key path under the data dir.
    #[must_use]
    pub fn default_master_key_path(&self) -> PathBuf {
        self.data_dir.join("keys").join("master.key")
    }
}

// ---------------------------------------------------------------------------
// DynamicSettings
// ---------------------------------------------------------------------------

/// Runtime-mutable settings, persisted under `settings:dynamic`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicSettings {
    /// Management session lifetime in seconds.
    pub session_timeout_s: u64,
    /// Failed login attempts before lockout.
    pub max_failed_attempts: u32,
    /// Lockout duration in seconds.
    pub lockout_duration_s: u64,
    /// Per-client request ceiling per minute; 0 disables limiting.
    pub rate_limit_per_minute: u32,
    /// When set, S3 writes are refused with `ServiceUnavailable`.
    pub maintenance_mode: bool,
    /// Days of audit records to retain; overrides the static config.
    pub audit_retention_days: u32,
}

impl Default for DynamicSettings {
    fn default() -> Self {
        Self {
            session_timeout_s: 3600,
            max_failed_attempts: 5,
            lockout_duration_s: 900,
            rate_limit_per_minute: 0,
            maintenance_mode: false,
            audit_retention_days: 90,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_create_default_config() {
        let config = Config::default();
        assert_eq!(config.listen, "0.0.0.0:8080");
        assert_eq!(config.console_listen, "0.0.0.0:8081");
        assert_eq!(config.health_interval_s, 30);
        assert_eq!(config.cache_ttl_s, 300);
        assert_eq!(config.replication_workers, 5);
        assert!(!config.encryption_enabled);
    }

    #[test]
    fn test_should_derive_data_subdirectories() {
        let config = Config {
            data_dir: PathBuf::from("/srv/maxiofs"),
            ..Config::default()
        };
        assert_eq!(config.metadata_dir(), PathBuf::from("/srv/maxiofs/metadata"));
        assert_eq!(config.objects_dir(), PathBuf::from("/srv/maxiofs/objects"));
        assert_eq!(
            config.default_master_key_path(),
            PathBuf::from("/srv/maxiofs/keys/master.key")
        );
    }

    #[test]
    fn test_should_default_dynamic_settings() {
        let settings = DynamicSettings::default();
        assert_eq!(settings.session_timeout_s, 3600);
        assert_eq!(settings.max_failed_attempts, 5);
        assert!(!settings.maintenance_mode);
    }

    #[test]
    fn test_should_roundtrip_dynamic_settings_with_missing_fields() {
        // Older records without newer fields must still deserialize.
        let settings: DynamicSettings =
            serde_json::from_str(r#"{"sessionTimeoutS": 60}"#).unwrap();
        assert_eq!(settings.session_timeout_s, 60);
        assert_eq!(settings.max_failed_attempts, 5);
    }
}
