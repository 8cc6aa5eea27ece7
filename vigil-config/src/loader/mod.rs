pub mod error;

use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use tracing::debug;
use url::Url;

use crate::models::{
    BrokerConfig, Config, ConfigMetadata, DEFAULT_CAPABILITY, DEFAULT_CONTROL_PREFETCH,
    DEFAULT_DB_MAX_CONNECTIONS, DEFAULT_EVENT_PREFETCH, DEFAULT_JANITOR_INTERVAL,
    DEFAULT_LEASE_EXTENSION, DEFAULT_LEASE_TTL, DEFAULT_QUEUE_PREFIX, DEFAULT_RECONNECT_DELAY,
    DEFAULT_RENEW_EVERY, DEFAULT_STREAM_MAX_LEN, DatabaseConfig, IdentityConfig, IngestConfig,
    JanitorConfig, WorkerConfig,
    sources::{self, EnvConfig, FileConfig},
};
use error::ConfigLoadError;

pub const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["vigil.toml", "config/vigil.toml"];

const FALLBACK_HOSTNAME: &str = "localhost";

#[derive(Debug, Default, Clone)]
pub struct ConfigLoaderOptions {
    pub config_path: Option<PathBuf>,
    pub env_file: Option<PathBuf>,
}

#[derive(Debug, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    pub fn with_config_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.config_path = Some(path.into());
        self
    }

    pub fn with_env_file<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.options.env_file = Some(path.into());
        self
    }

    /// Defaults, then the TOML file, then `.env`, then the process
    /// environment. The `.env` file is read, not exported: real environment
    /// variables always win over it.
    pub fn load(&self) -> Result<Config, ConfigLoadError> {
        let (dotenv, env_file_loaded) = self.read_env_file()?;
        let env = EnvConfig::from_vars(dotenv.into_iter().chain(std::env::vars()))?;
        self.load_with_env(env, env_file_loaded)
    }

    /// Compose against an explicit environment snapshot.
    pub fn load_with_env(
        &self,
        env: EnvConfig,
        env_file_loaded: bool,
    ) -> Result<Config, ConfigLoadError> {
        let (file, config_path) = self.load_file_config(&env)?;
        compose(file.unwrap_or_default(), env, config_path, env_file_loaded)
    }

    fn read_env_file(&self) -> Result<(Vec<(String, String)>, bool), ConfigLoadError> {
        let iter = match &self.options.env_file {
            Some(path) => dotenvy::from_path_iter(path),
            None => dotenvy::dotenv_iter(),
        };
        let iter = match iter {
            Ok(iter) => iter,
            Err(dotenvy::Error::Io(_)) => return Ok((Vec::new(), false)),
            Err(err) => return Err(err.into()),
        };
        let pairs = iter.collect::<Result<Vec<_>, _>>()?;
        Ok((pairs, true))
    }

    fn load_file_config(
        &self,
        env: &EnvConfig,
    ) -> Result<(Option<FileConfig>, Option<PathBuf>), ConfigLoadError> {
        let explicit = self
            .options
            .config_path
            .clone()
            .or_else(|| env.config_path.clone());

        let path = match explicit {
            Some(path) if !path.exists() => {
                return Err(ConfigLoadError::MissingConfig { path });
            }
            Some(path) => path,
            None => match DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(Path::new)
                .find(|candidate| candidate.exists())
            {
                Some(found) => found.to_path_buf(),
                None => return Ok((None, None)),
            },
        };

        let contents = fs::read_to_string(&path).map_err(|source| ConfigLoadError::Io {
            path: path.clone(),
            source,
        })?;
        let file: FileConfig = toml::from_str(&contents).map_err(|source| {
            ConfigLoadError::Parse {
                path: path.clone(),
                source,
            }
        })?;
        debug!(path = %path.display(), "loaded config file");

        Ok((Some(file), Some(path)))
    }
}

fn compose(
    file: FileConfig,
    env: EnvConfig,
    config_path: Option<PathBuf>,
    env_file_loaded: bool,
) -> Result<Config, ConfigLoadError> {
    let FileConfig {
        broker: file_broker,
        database: file_database,
        worker: file_worker,
        janitor: file_janitor,
        ingest: file_ingest,
    } = file;

    let broker_url = env.broker_url.or(file_broker.url);
    if let Some(url) = broker_url.as_deref() {
        validate_url(sources::BROKER_URL, url)?;
    }
    let database_url = env.database_url.or(file_database.url);
    if let Some(url) = database_url.as_deref() {
        validate_url(sources::DB_URL, url)?;
    }

    let broker = BrokerConfig {
        url: broker_url,
        queue_prefix: env
            .queue_prefix
            .or(file_broker.queue_prefix)
            .unwrap_or_else(|| DEFAULT_QUEUE_PREFIX.to_string()),
        reconnect_delay: pick_duration(
            sources::RECONNECT_DELAY_MS,
            env.reconnect_delay_ms.map(Duration::from_millis),
            file_broker.reconnect_delay,
            DEFAULT_RECONNECT_DELAY,
        )?,
        stream_max_len: env
            .stream_max_len
            .or(file_broker.stream_max_len)
            .unwrap_or(DEFAULT_STREAM_MAX_LEN),
    };

    let database = DatabaseConfig {
        url: database_url,
        max_connections: env
            .db_max_connections
            .or(file_database.max_connections)
            .unwrap_or(DEFAULT_DB_MAX_CONNECTIONS),
    };

    let identity = IdentityConfig {
        worker_id: env.worker_id.or(file_worker.id),
        hostname: env.hostname.unwrap_or_else(system_hostname),
    };

    let worker = WorkerConfig {
        capability: env
            .capability
            .or(file_worker.capability)
            .unwrap_or_else(|| DEFAULT_CAPABILITY.to_string()),
        renew_every: pick_duration(
            sources::RENEW_EVERY_SEC,
            env.renew_every_secs.map(Duration::from_secs),
            file_worker.renew_every,
            DEFAULT_RENEW_EVERY,
        )?,
        lease_extension: pick_duration(
            sources::LEASE_EXT_SEC,
            env.lease_ext_secs.map(Duration::from_secs),
            file_worker.lease_extension,
            DEFAULT_LEASE_EXTENSION,
        )?,
        default_lease_ttl: pick_duration(
            sources::DEFAULT_LEASE_TTL_SEC,
            env.default_lease_ttl_secs.map(Duration::from_secs),
            file_worker.default_lease_ttl,
            DEFAULT_LEASE_TTL,
        )?,
        control_prefetch: env
            .control_prefetch
            .or(file_worker.control_prefetch)
            .unwrap_or(DEFAULT_CONTROL_PREFETCH),
    };

    let janitor = JanitorConfig {
        interval: pick_duration(
            sources::JANITOR_INTERVAL,
            env.janitor_interval_secs.map(Duration::from_secs),
            file_janitor.interval,
            DEFAULT_JANITOR_INTERVAL,
        )?,
    };

    let ingest = IngestConfig {
        event_prefetch: env
            .event_prefetch
            .or(file_ingest.event_prefetch)
            .unwrap_or(DEFAULT_EVENT_PREFETCH),
    };

    let config = Config {
        broker,
        database,
        identity,
        worker,
        janitor,
        ingest,
        metadata: ConfigMetadata {
            config_path,
            env_file_loaded,
        },
    };
    validate(&config)?;
    Ok(config)
}

fn pick_duration(
    key: &'static str,
    from_env: Option<Duration>,
    from_file: Option<String>,
    default: Duration,
) -> Result<Duration, ConfigLoadError> {
    if let Some(duration) = from_env {
        return Ok(duration);
    }
    match from_file {
        Some(raw) => humantime::parse_duration(raw.trim()).map_err(|source| {
            ConfigLoadError::InvalidDuration {
                key,
                value: raw,
                source,
            }
        }),
        None => Ok(default),
    }
}

fn validate_url(key: &'static str, raw: &str) -> Result<(), ConfigLoadError> {
    Url::parse(raw)
        .map(|_| ())
        .map_err(|source| ConfigLoadError::InvalidUrl { key, source })
}

fn validate(config: &Config) -> Result<(), ConfigLoadError> {
    let whole_seconds = [
        (sources::RENEW_EVERY_SEC, config.worker.renew_every),
        (sources::LEASE_EXT_SEC, config.worker.lease_extension),
        (sources::DEFAULT_LEASE_TTL_SEC, config.worker.default_lease_ttl),
        (sources::JANITOR_INTERVAL, config.janitor.interval),
    ];
    for (key, duration) in whole_seconds {
        if duration.as_secs() == 0 {
            return Err(ConfigLoadError::Invalid {
                key,
                reason: "must be at least one second".into(),
            });
        }
    }
    // Leases are written in whole seconds; a fraction would be dropped.
    let lease_lengths = [
        (sources::LEASE_EXT_SEC, config.worker.lease_extension),
        (sources::DEFAULT_LEASE_TTL_SEC, config.worker.default_lease_ttl),
    ];
    for (key, duration) in lease_lengths {
        if duration.subsec_nanos() != 0 {
            return Err(ConfigLoadError::Invalid {
                key,
                reason: format!(
                    "must be a whole number of seconds, got {}",
                    humantime::format_duration(duration)
                ),
            });
        }
    }
    if config.broker.reconnect_delay.is_zero() {
        return Err(ConfigLoadError::Invalid {
            key: sources::RECONNECT_DELAY_MS,
            reason: "must be greater than zero".into(),
        });
    }

    let counts = [
        (sources::CONTROL_PREFETCH, config.worker.control_prefetch),
        (sources::EVENT_PREFETCH, config.ingest.event_prefetch),
        (sources::STREAM_MAX_LEN, config.broker.stream_max_len),
        (
            sources::DB_MAX_CONNECTIONS,
            config.database.max_connections as usize,
        ),
    ];
    for (key, count) in counts {
        if count == 0 {
            return Err(ConfigLoadError::Invalid {
                key,
                reason: "must be greater than zero".into(),
            });
        }
    }

    if config.worker.capability.trim().is_empty() {
        return Err(ConfigLoadError::Invalid {
            key: sources::CAPABILITY,
            reason: "must not be empty".into(),
        });
    }
    Ok(())
}

fn system_hostname() -> String {
    fs::read_to_string("/etc/hostname")
        .ok()
        .map(|raw| raw.trim().to_string())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| FALLBACK_HOSTNAME.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn env(vars: &[(&str, &str)]) -> EnvConfig {
        EnvConfig::from_vars(vars.iter().copied()).unwrap()
    }

    #[test]
    fn defaults_apply_without_file_or_env() {
        let config = compose(
            FileConfig::default(),
            env(&[(sources::HOSTNAME, "node-7")]),
            None,
            false,
        )
        .unwrap();

        assert_eq!(config.worker.capability, "car");
        assert_eq!(config.worker.renew_every, Duration::from_secs(5));
        assert_eq!(config.worker.lease_extension, Duration::from_secs(20));
        assert_eq!(config.worker.default_lease_ttl, Duration::from_secs(60));
        assert_eq!(config.worker.control_prefetch, 3);
        assert_eq!(config.janitor.interval, Duration::from_secs(5));
        assert_eq!(config.ingest.event_prefetch, 50);
        assert_eq!(config.broker.reconnect_delay, Duration::from_secs(1));
        assert_eq!(config.broker.queue_prefix, "det.");
        assert_eq!(config.identity.for_role("car"), "car-node-7");
        assert!(config.require_broker_url().is_err());
        assert!(config.require_database_url().is_err());
    }

    #[test]
    fn env_overrides_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [worker]
            capability = "person"
            renew_every = "10s"
            control_prefetch = 8
            "#,
        )
        .unwrap();
        let config = compose(
            file,
            env(&[(sources::RENEW_EVERY_SEC, "2")]),
            None,
            false,
        )
        .unwrap();

        assert_eq!(config.worker.capability, "person");
        assert_eq!(config.worker.renew_every, Duration::from_secs(2));
        assert_eq!(config.worker.control_prefetch, 8);
    }

    #[test]
    fn rejects_zero_intervals_and_prefetch() {
        for (key, value) in [
            (sources::RENEW_EVERY_SEC, "0"),
            (sources::JANITOR_INTERVAL, "0"),
            (sources::CONTROL_PREFETCH, "0"),
            (sources::EVENT_PREFETCH, "0"),
            (sources::RECONNECT_DELAY_MS, "0"),
        ] {
            let err = compose(FileConfig::default(), env(&[(key, value)]), None, false)
                .unwrap_err();
            assert!(
                matches!(err, ConfigLoadError::Invalid { key: k, .. } if k == key),
                "{key}={value} should be rejected, got {err}"
            );
        }
    }

    #[test]
    fn rejects_sub_second_lease_durations_from_file() {
        let file: FileConfig = toml::from_str(
            r#"
            [worker]
            lease_extension = "500ms"
            "#,
        )
        .unwrap();
        assert!(compose(file, EnvConfig::default(), None, false).is_err());
    }

    #[test]
    fn rejects_fractional_lease_seconds() {
        for (section_key, key) in [
            ("lease_extension", sources::LEASE_EXT_SEC),
            ("default_lease_ttl", sources::DEFAULT_LEASE_TTL_SEC),
        ] {
            let file: FileConfig =
                toml::from_str(&format!("[worker]\n{section_key} = \"1500ms\"\n")).unwrap();
            let err = compose(file, EnvConfig::default(), None, false).unwrap_err();
            assert!(
                matches!(err, ConfigLoadError::Invalid { key: k, .. } if k == key),
                "{section_key} should be rejected, got {err}"
            );
        }

        // Intervals are only slept on, so fractions are fine there.
        let file: FileConfig = toml::from_str(
            "[worker]\nrenew_every = \"1500ms\"\nlease_extension = \"2s\"\n",
        )
        .unwrap();
        let config = compose(file, EnvConfig::default(), None, false).unwrap();
        assert_eq!(config.worker.renew_every, Duration::from_millis(1_500));
    }

    #[test]
    fn stream_max_len_layers_like_other_counts() {
        let file: FileConfig = toml::from_str("[broker]\nstream_max_len = 500\n").unwrap();
        let config = compose(file.clone(), EnvConfig::default(), None, false).unwrap();
        assert_eq!(config.broker.stream_max_len, 500);

        let config = compose(file, env(&[(sources::STREAM_MAX_LEN, "40")]), None, false).unwrap();
        assert_eq!(config.broker.stream_max_len, 40);

        let config = compose(FileConfig::default(), EnvConfig::default(), None, false).unwrap();
        assert_eq!(config.broker.stream_max_len, DEFAULT_STREAM_MAX_LEN);

        let zero = env(&[(sources::STREAM_MAX_LEN, "0")]);
        assert!(compose(FileConfig::default(), zero, None, false).is_err());
    }

    #[test]
    fn rejects_malformed_urls_and_durations() {
        let err = compose(
            FileConfig::default(),
            env(&[(sources::BROKER_URL, "not a url")]),
            None,
            false,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidUrl { .. }));

        let file: FileConfig = toml::from_str("[janitor]\ninterval = \"soon\"\n").unwrap();
        let err = compose(file, EnvConfig::default(), None, false).unwrap_err();
        assert!(matches!(err, ConfigLoadError::InvalidDuration { .. }));
    }
}
