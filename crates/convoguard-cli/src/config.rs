use convoguard_channels::{BreakerConfig, OutboundConfig, WhatsAppConfig};
use convoguard_compliance::{AuditLogConfig, RetentionPolicy};
use convoguard_core::ConvoResult;
use convoguard_orchestrator::OrchestratorConfig;
use convoguard_security::{Environment, RateLimitConfig};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Top-level `convoguard.toml`.
#[derive(Debug, Deserialize)]
pub struct ConvoGuardConfig {
    /// Deployment environment; production refuses to run without a key.
    #[serde(default)]
    pub environment: Environment,
    /// Root for session files and the audit database.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// HTTP ingress.
    #[serde(default)]
    pub server: ServerConfig,
    /// State cache sizing.
    #[serde(default)]
    pub cache: CacheConfig,
    /// Per-sender admission.
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Outbound circuit breaker.
    #[serde(default)]
    pub breaker: BreakerConfig,
    /// Session store timeouts and retries.
    #[serde(default)]
    pub store: OrchestratorConfig,
    /// Session key sources.
    #[serde(default)]
    pub encryption: EncryptionConfig,
    /// Retention windows and erasure grace period.
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Reply delivery.
    #[serde(default)]
    pub outbound: OutboundSection,
    /// Audit trail storage and writer.
    #[serde(default)]
    pub audit: AuditSection,
    /// Background job intervals.
    #[serde(default)]
    pub schedule: ScheduleConfig,
}

impl ConvoGuardConfig {
    /// Reject settings that would only fail later, inside a background job.
    pub fn validate(&self) -> ConvoResult<()> {
        self.retention.validate()
    }

    /// Directory holding the encrypted session files.
    pub fn sessions_dir(&self) -> PathBuf {
        self.data_dir.join("sessions")
    }

    /// SQLite file for the audit trail. Relative paths live under `data_dir`.
    pub fn audit_db_path(&self) -> PathBuf {
        resolve_under(&self.data_dir, &self.audit.sqlite_path)
    }
}

fn resolve_under(base: &Path, path: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base.join(path)
    }
}

/// HTTP ingress settings.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Bearer keys accepted under `/v1`. Empty disables auth.
    #[serde(default)]
    pub api_keys: Vec<String>,
    /// Events buffered between ingress and the orchestrator.
    #[serde(default = "default_inbound_queue")]
    pub inbound_queue: usize,
    /// Events processed concurrently.
    #[serde(default = "default_max_in_flight")]
    pub max_in_flight: usize,
    /// How long shutdown waits for accepted events to finish, in seconds.
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_keys: vec![],
            inbound_queue: default_inbound_queue(),
            max_in_flight: default_max_in_flight(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

/// State cache settings.
#[derive(Debug, Deserialize)]
pub struct CacheConfig {
    /// Sessions kept hot.
    #[serde(default = "default_cache_capacity")]
    pub capacity: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
        }
    }
}

/// Where session keys come from. Keys themselves never live in the file.
#[derive(Debug, Deserialize)]
pub struct EncryptionConfig {
    /// Environment variable holding the current base64 key.
    #[serde(default = "default_key_env")]
    pub key_env: String,
    /// Version stamped on blobs sealed with the current key.
    #[serde(default = "default_key_version")]
    pub key_version: u32,
    /// Older keys still needed to open existing records.
    #[serde(default)]
    pub retired: Vec<RetiredKey>,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            key_env: default_key_env(),
            key_version: default_key_version(),
            retired: vec![],
        }
    }
}

/// A previous key, kept so older records stay readable.
#[derive(Debug, Clone, Deserialize)]
pub struct RetiredKey {
    /// Version stamped on blobs sealed with this key.
    pub version: u32,
    /// Environment variable holding it.
    pub key_env: String,
}

/// `[outbound]`: delivery policy plus the WhatsApp adapter.
#[derive(Debug, Default, Deserialize)]
pub struct OutboundSection {
    /// What happens to replies while the upstream is down.
    #[serde(flatten)]
    pub delivery: OutboundConfig,
    /// WhatsApp Cloud API settings.
    #[serde(default)]
    pub whatsapp: WhatsAppConfig,
}

/// `[audit]`: database location plus writer retry settings.
#[derive(Debug, Deserialize)]
pub struct AuditSection {
    /// Audit database; relative to `data_dir` unless absolute.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: PathBuf,
    /// Background writer retries.
    #[serde(flatten)]
    pub writer: AuditLogConfig,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            writer: AuditLogConfig::default(),
        }
    }
}

/// Intervals of the background jobs run by `serve`.
#[derive(Debug, Deserialize)]
pub struct ScheduleConfig {
    /// Retention sweep.
    #[serde(default = "default_retention_interval_secs")]
    pub retention_interval_secs: u64,
    /// Due erasure processing.
    #[serde(default = "default_deletion_interval_secs")]
    pub deletion_interval_secs: u64,
    /// Redelivery of parked replies.
    #[serde(default = "default_flush_interval_secs")]
    pub flush_interval_secs: u64,
    /// Forgetting idle senders in the rate limiter.
    #[serde(default = "default_limiter_cleanup_interval_secs")]
    pub limiter_cleanup_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            retention_interval_secs: default_retention_interval_secs(),
            deletion_interval_secs: default_deletion_interval_secs(),
            flush_interval_secs: default_flush_interval_secs(),
            limiter_cleanup_interval_secs: default_limiter_cleanup_interval_secs(),
        }
    }
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}
fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    3000
}
fn default_inbound_queue() -> usize {
    1_024
}
fn default_max_in_flight() -> usize {
    64
}
fn default_drain_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    100
}
fn default_key_env() -> String {
    "CONVOGUARD_ENCRYPTION_KEY".to_string()
}
fn default_key_version() -> u32 {
    1
}
fn default_sqlite_path() -> PathBuf {
    PathBuf::from("audit.db")
}
fn default_retention_interval_secs() -> u64 {
    3_600
}
fn default_deletion_interval_secs() -> u64 {
    300
}
fn default_flush_interval_secs() -> u64 {
    15
}
fn default_limiter_cleanup_interval_secs() -> u64 {
    300
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use convoguard_channels::UnavailablePolicy;

    #[test]
    fn empty_file_gives_defaults() {
        let config: ConvoGuardConfig = toml::from_str("").unwrap();
        assert_eq!(config.environment, Environment::Development);
        assert_eq!(config.cache.capacity, 100);
        assert_eq!(config.rate_limit.threshold, 50);
        assert_eq!(config.rate_limit.window_secs, 60);
        assert_eq!(config.breaker.failure_threshold, 5);
        assert_eq!(config.breaker.reset_timeout_ms, 60_000);
        assert_eq!(config.encryption.key_env, "CONVOGUARD_ENCRYPTION_KEY");
        assert_eq!(config.retention.deletion_grace_hours, 72);
        assert_eq!(config.outbound.delivery.on_unavailable, UnavailablePolicy::Queue);
        assert_eq!(config.audit_db_path(), PathBuf::from("./data").join("audit.db"));
    }

    #[test]
    fn sections_override_defaults() {
        let raw = r#"
            environment = "production"
            data_dir = "/var/lib/convoguard"

            [server]
            port = 8080
            api_keys = ["k1"]

            [store]
            timeout_ms = 2000
            [store.retry]
            max_retries = 1

            [encryption]
            key_version = 3
            [[encryption.retired]]
            version = 2
            key_env = "CONVOGUARD_KEY_V2"

            [outbound]
            on_unavailable = "drop"
            queue_capacity = 10
            [outbound.whatsapp]
            phone_number_id = "1234"

            [audit]
            sqlite_path = "/tmp/audit.db"
            max_retries = 2
        "#;
        let config: ConvoGuardConfig = toml::from_str(raw).unwrap();
        assert_eq!(config.environment, Environment::Production);
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.store.timeout_ms, 2000);
        assert_eq!(config.store.retry.max_retries, 1);
        assert_eq!(config.encryption.key_version, 3);
        assert_eq!(config.encryption.retired[0].key_env, "CONVOGUARD_KEY_V2");
        assert_eq!(config.outbound.delivery.on_unavailable, UnavailablePolicy::Drop);
        assert_eq!(config.outbound.delivery.queue_capacity, 10);
        assert_eq!(config.outbound.whatsapp.phone_number_id, "1234");
        assert_eq!(config.audit.writer.max_retries, 2);
        assert_eq!(config.audit_db_path(), PathBuf::from("/tmp/audit.db"));
        assert_eq!(config.sessions_dir(), PathBuf::from("/var/lib/convoguard/sessions"));
    }

    #[test]
    fn out_of_range_retention_fails_validation() {
        let config: ConvoGuardConfig = toml::from_str("[retention]\nartifact_days = 9999999999").unwrap();
        assert!(config.validate().is_err());
        let config: ConvoGuardConfig = toml::from_str("").unwrap();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.drain_timeout_secs, 30);
        assert_eq!(config.rate_limit.idle_secs, 600);
    }

    #[test]
    fn unknown_environment_is_rejected() {
        assert!(toml::from_str::<ConvoGuardConfig>("environment = \"staging\"").is_err());
    }
}
