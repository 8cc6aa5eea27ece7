//! Configuration for Vigil processes.
//!
//! Settings compose from built-in defaults, an optional `vigil.toml`, a
//! `.env` file and the process environment, in increasing precedence. Every
//! role reads the same [`Config`]; each binary subcommand then checks only
//! the settings it needs.

pub mod loader;
pub mod models;

pub use loader::{ConfigLoader, ConfigLoaderOptions, DEFAULT_CONFIG_LOCATIONS, error::ConfigLoadError};
pub use models::sources::{EnvConfig, FileConfig};
pub use models::{
    BrokerConfig, Config, ConfigMetadata, DatabaseConfig, IdentityConfig, IngestConfig,
    JanitorConfig, WorkerConfig,
};
