pub mod sources;

use std::path::PathBuf;
use std::time::Duration;

use crate::ConfigLoadError;

pub const DEFAULT_CAPABILITY: &str = "car";
pub const DEFAULT_QUEUE_PREFIX: &str = "det.";
pub const DEFAULT_RENEW_EVERY: Duration = Duration::from_secs(5);
pub const DEFAULT_LEASE_EXTENSION: Duration = Duration::from_secs(20);
pub const DEFAULT_LEASE_TTL: Duration = Duration::from_secs(60);
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_CONTROL_PREFETCH: usize = 3;
pub const DEFAULT_EVENT_PREFETCH: usize = 50;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_millis(1_000);
pub const DEFAULT_DB_MAX_CONNECTIONS: u32 = 5;
pub const DEFAULT_STREAM_MAX_LEN: usize = 100_000;

#[derive(Debug, Clone)]
pub struct Config {
    pub broker: BrokerConfig,
    pub database: DatabaseConfig,
    pub identity: IdentityConfig,
    pub worker: WorkerConfig,
    pub janitor: JanitorConfig,
    pub ingest: IngestConfig,
    pub metadata: ConfigMetadata,
}

impl Config {
    /// Broker URL, or the error that makes a broker-backed role unstartable.
    pub fn require_broker_url(&self) -> Result<&str, ConfigLoadError> {
        self.broker
            .url
            .as_deref()
            .ok_or(ConfigLoadError::MissingSetting {
                key: sources::BROKER_URL,
            })
    }

    pub fn require_database_url(&self) -> Result<&str, ConfigLoadError> {
        self.database
            .url
            .as_deref()
            .ok_or(ConfigLoadError::MissingSetting {
                key: sources::DB_URL,
            })
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub url: Option<String>,
    pub queue_prefix: String,
    /// Fixed delay between reconnect attempts.
    pub reconnect_delay: Duration,
    /// Approximate cap on entries kept per stream when publishing.
    pub stream_max_len: usize,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

#[derive(Debug, Clone)]
pub struct IdentityConfig {
    /// Explicit identity; overrides the role-derived default.
    pub worker_id: Option<String>,
    pub hostname: String,
}

impl IdentityConfig {
    /// `worker_id` if set, else `<role>-<hostname>`.
    pub fn for_role(&self, role: &str) -> String {
        self.worker_id
            .clone()
            .unwrap_or_else(|| format!("{role}-{}", self.hostname))
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub capability: String,
    pub renew_every: Duration,
    pub lease_extension: Duration,
    /// Lease length for start messages that carry no TTL.
    pub default_lease_ttl: Duration,
    pub control_prefetch: usize,
}

#[derive(Debug, Clone)]
pub struct JanitorConfig {
    pub interval: Duration,
}

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub event_prefetch: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
