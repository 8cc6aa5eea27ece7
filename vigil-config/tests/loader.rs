use std::fs;
use std::time::Duration;

use tempfile::TempDir;
use vigil_config::{ConfigLoadError, ConfigLoader, EnvConfig};

fn write(dir: &TempDir, name: &str, contents: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    fs::write(&path, contents).unwrap();
    path
}

const FULL_FILE: &str = r#"
[broker]
url = "redis://broker.internal:6379/0"
queue_prefix = "cams."
reconnect_delay = "250ms"

[database]
url = "postgres://vigil@db.internal/vigil"
max_connections = 12

[worker]
id = "car-from-file"
capability = "car"
renew_every = "3s"
lease_extension = "30s"
default_lease_ttl = "2m"
control_prefetch = 4

[janitor]
interval = "7s"

[ingest]
event_prefetch = 80
"#;

#[test]
fn file_values_are_used_when_env_is_silent() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "vigil.toml", FULL_FILE);

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(EnvConfig::default(), false)
        .unwrap();

    assert_eq!(config.require_broker_url().unwrap(), "redis://broker.internal:6379/0");
    assert_eq!(
        config.require_database_url().unwrap(),
        "postgres://vigil@db.internal/vigil"
    );
    assert_eq!(config.database.max_connections, 12);
    assert_eq!(config.broker.queue_prefix, "cams.");
    assert_eq!(config.broker.reconnect_delay, Duration::from_millis(250));
    assert_eq!(config.identity.for_role("car"), "car-from-file");
    assert_eq!(config.worker.renew_every, Duration::from_secs(3));
    assert_eq!(config.worker.lease_extension, Duration::from_secs(30));
    assert_eq!(config.worker.default_lease_ttl, Duration::from_secs(120));
    assert_eq!(config.worker.control_prefetch, 4);
    assert_eq!(config.janitor.interval, Duration::from_secs(7));
    assert_eq!(config.ingest.event_prefetch, 80);
    assert_eq!(config.metadata.config_path.as_deref(), Some(path.as_path()));
}

#[test]
fn environment_overrides_file() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "vigil.toml", FULL_FILE);
    let env = EnvConfig::from_vars([
        ("BROKER_URL", "redis://other:6379"),
        ("WORKER_ID", "car-from-env"),
        ("LEASE_EXT_SEC", "45"),
        ("EVENT_PREFETCH", "10"),
    ])
    .unwrap();

    let config = ConfigLoader::new()
        .with_config_path(&path)
        .load_with_env(env, false)
        .unwrap();

    assert_eq!(config.require_broker_url().unwrap(), "redis://other:6379");
    assert_eq!(config.identity.for_role("car"), "car-from-env");
    assert_eq!(config.worker.lease_extension, Duration::from_secs(45));
    assert_eq!(config.ingest.event_prefetch, 10);
    assert_eq!(config.worker.renew_every, Duration::from_secs(3));
}

#[test]
fn config_path_from_env_is_honoured() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "custom.toml", "[worker]\ncapability = \"person\"\n");
    let env = EnvConfig::from_vars([("VIGIL_CONFIG_PATH", path.to_string_lossy().to_string())])
        .unwrap();

    let config = ConfigLoader::new().load_with_env(env, false).unwrap();
    assert_eq!(config.worker.capability, "person");
}

#[test]
fn explicit_missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let err = ConfigLoader::new()
        .with_config_path(dir.path().join("absent.toml"))
        .load_with_env(EnvConfig::default(), false)
        .unwrap_err();
    assert!(matches!(err, ConfigLoadError::MissingConfig { .. }));
}

#[test]
fn unknown_sections_and_bad_toml_are_rejected() {
    let dir = TempDir::new().unwrap();
    let unknown = write(&dir, "unknown.toml", "[amqp]\nurl = \"amqp://x\"\n");
    let broken = write(&dir, "broken.toml", "[worker\ncapability = car\n");

    for path in [unknown, broken] {
        let err = ConfigLoader::new()
            .with_config_path(&path)
            .load_with_env(EnvConfig::default(), false)
            .unwrap_err();
        assert!(matches!(err, ConfigLoadError::Parse { .. }), "{err}");
    }
}

#[test]
fn env_file_values_are_read() {
    let dir = TempDir::new().unwrap();
    let config_path = write(&dir, "vigil.toml", "");
    let env_path = write(
        &dir,
        "test.env",
        "VIGIL_TEST_ONLY=1\nQUEUE_PREFIX=from-dotenv.\n",
    );

    let config = ConfigLoader::new()
        .with_config_path(&config_path)
        .with_env_file(&env_path)
        .load()
        .unwrap();

    assert!(config.metadata.env_file_loaded);
    if std::env::var_os("QUEUE_PREFIX").is_none() {
        assert_eq!(config.broker.queue_prefix, "from-dotenv.");
    }
}

#[test]
fn missing_env_file_is_not_an_error() {
    let dir = TempDir::new().unwrap();
    let config_path = write(&dir, "vigil.toml", "");

    let config = ConfigLoader::new()
        .with_config_path(&config_path)
        .with_env_file(dir.path().join("nope.env"))
        .load()
        .unwrap();
    assert!(!config.metadata.env_file_loaded);
}
