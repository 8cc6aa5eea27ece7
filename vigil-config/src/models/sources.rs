use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::ConfigLoadError;

pub const BROKER_URL: &str = "BROKER_URL";
pub const DB_URL: &str = "DB_URL";
pub const DATABASE_URL: &str = "DATABASE_URL";
pub const DB_MAX_CONNECTIONS: &str = "DB_MAX_CONNECTIONS";
pub const WORKER_ID: &str = "WORKER_ID";
pub const HOSTNAME: &str = "HOSTNAME";
pub const CAPABILITY: &str = "CAPABILITY";
pub const QUEUE_PREFIX: &str = "QUEUE_PREFIX";
pub const RENEW_EVERY_SEC: &str = "RENEW_EVERY_SEC";
pub const LEASE_EXT_SEC: &str = "LEASE_EXT_SEC";
pub const DEFAULT_LEASE_TTL_SEC: &str = "DEFAULT_LEASE_TTL_SEC";
pub const JANITOR_INTERVAL: &str = "JANITOR_INTERVAL";
pub const CONTROL_PREFETCH: &str = "CONTROL_PREFETCH";
pub const EVENT_PREFETCH: &str = "EVENT_PREFETCH";
pub const RECONNECT_DELAY_MS: &str = "RECONNECT_DELAY_MS";
pub const STREAM_MAX_LEN: &str = "STREAM_MAX_LEN";
pub const CONFIG_PATH: &str = "VIGIL_CONFIG_PATH";

/// Raw configuration as defined in a TOML file. Durations are humantime
/// strings such as `"5s"` or `"1500ms"`.
#[derive(Debug, Default, Clone, Deserialize, Serialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub broker: FileBrokerConfig,
    #[serde(default)]
    pub database: FileDatabaseConfig,
    #[serde(default)]
    pub worker: FileWorkerConfig,
    #[serde(default)]
    pub janitor: FileJanitorConfig,
    #[serde(default)]
    pub ingest: FileIngestConfig,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileBrokerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub queue_prefix: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_delay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream_max_len: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileDatabaseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<u32>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileWorkerConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capability: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_every: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lease_extension: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_lease_ttl: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_prefetch: Option<usize>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileJanitorConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize, Serialize)]
pub struct FileIngestConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_prefetch: Option<usize>,
}

/// Environment-derived configuration values. Unset and blank variables are
/// both treated as absent.
#[derive(Debug, Default, Clone)]
pub struct EnvConfig {
    pub broker_url: Option<String>,
    pub database_url: Option<String>,
    pub db_max_connections: Option<u32>,
    pub worker_id: Option<String>,
    pub hostname: Option<String>,
    pub capability: Option<String>,
    pub queue_prefix: Option<String>,
    pub renew_every_secs: Option<u64>,
    pub lease_ext_secs: Option<u64>,
    pub default_lease_ttl_secs: Option<u64>,
    pub janitor_interval_secs: Option<u64>,
    pub control_prefetch: Option<usize>,
    pub event_prefetch: Option<usize>,
    pub reconnect_delay_ms: Option<u64>,
    pub stream_max_len: Option<usize>,
    pub config_path: Option<PathBuf>,
}

impl EnvConfig {
    /// Snapshot the process environment.
    pub fn gather() -> Result<Self, ConfigLoadError> {
        Self::from_vars(std::env::vars())
    }

    /// Build from key/value pairs; a later pair for the same key wins.
    pub fn from_vars<I, K, V>(vars: I) -> Result<Self, ConfigLoadError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let vars: HashMap<String, String> = vars
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .filter(|(_, v)| !v.trim().is_empty())
            .collect();
        let text = |key: &str| vars.get(key).map(|v| v.trim().to_string());

        Ok(Self {
            broker_url: text(BROKER_URL),
            database_url: text(DB_URL).or_else(|| text(DATABASE_URL)),
            db_max_connections: number(&vars, DB_MAX_CONNECTIONS)?,
            worker_id: text(WORKER_ID),
            hostname: text(HOSTNAME),
            capability: text(CAPABILITY),
            queue_prefix: vars.get(QUEUE_PREFIX).cloned(),
            renew_every_secs: number(&vars, RENEW_EVERY_SEC)?,
            lease_ext_secs: number(&vars, LEASE_EXT_SEC)?,
            default_lease_ttl_secs: number(&vars, DEFAULT_LEASE_TTL_SEC)?,
            janitor_interval_secs: number(&vars, JANITOR_INTERVAL)?,
            control_prefetch: number(&vars, CONTROL_PREFETCH)?,
            event_prefetch: number(&vars, EVENT_PREFETCH)?,
            reconnect_delay_ms: number(&vars, RECONNECT_DELAY_MS)?,
            stream_max_len: number(&vars, STREAM_MAX_LEN)?,
            config_path: text(CONFIG_PATH).map(PathBuf::from),
        })
    }
}

fn number<T: std::str::FromStr>(
    vars: &HashMap<String, String>,
    key: &'static str,
) -> Result<Option<T>, ConfigLoadError> {
    vars.get(key)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|_| ConfigLoadError::InvalidNumber {
                    key,
                    value: raw.clone(),
                })
        })
        .transpose()
}
