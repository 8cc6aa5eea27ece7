//! # Vigil
//!
//! Process entry point for every Vigil role:
//!
//! - `vigil worker` consumes control messages for one capability and keeps
//!   the resulting leases alive
//! - `vigil janitor` expires leases whose owner stopped renewing
//! - `vigil ingest` persists detection events
//! - `vigil db migrate` applies the schema and exits

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args as ClapArgs, Parser, Subcommand};
use sqlx::{PgPool, postgres::PgPoolOptions};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use vigil_config::{Config, ConfigLoader};
use vigil_core::{
    Capability, CommandConsumer, ConsumerSettings, EventIngestor, IngestorSettings, LeaseJanitor,
    LeaseRenewer, PostgresLeaseStore, QueueNames, RedisStreamBroker, RetryPolicy, WorkerId,
};

#[derive(Parser, Debug)]
#[command(name = "vigil")]
#[command(about = "Lease-based work assignment for camera detection workers")]
struct Cli {
    /// Path to a vigil.toml (defaults to ./vigil.toml or ./config/vigil.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Path to a .env file (defaults to ./.env)
    #[arg(long, global = true)]
    env_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Consume start/stop/params for one capability and renew its leases
    Worker(WorkerArgs),
    /// Periodically expire leases past their deadline
    Janitor,
    /// Persist detection events from the event queue
    Ingest,
    #[command(subcommand)]
    Db(DbCommand),
}

#[derive(ClapArgs, Debug)]
struct WorkerArgs {
    /// Capability to serve (overrides config)
    #[arg(long, env = "CAPABILITY")]
    capability: Option<String>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Apply database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,sqlx=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = load_config(&cli)?;

    match cli.command {
        Command::Worker(args) => run_worker(&config, args).await,
        Command::Janitor => run_janitor(&config).await,
        Command::Ingest => run_ingest(&config).await,
        Command::Db(DbCommand::Migrate) => run_db_migrate(&config).await,
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut loader = ConfigLoader::new();
    if let Some(path) = &cli.config {
        loader = loader.with_config_path(path);
    }
    if let Some(path) = &cli.env_file {
        loader = loader.with_env_file(path);
    }
    let config = loader.load().context("failed to load configuration")?;

    if config.metadata.env_file_loaded {
        info!("loaded .env file");
    }
    if let Some(path) = &config.metadata.config_path {
        info!(path = %path.display(), "loaded config file");
    }
    Ok(config)
}

/// Pool that connects on first use, so an unreachable database at startup
/// is retried by the roles instead of aborting the process.
fn lazy_pool(config: &Config) -> anyhow::Result<PgPool> {
    let url = config.require_database_url()?;
    PgPoolOptions::new()
        .max_connections(config.database.max_connections)
        .connect_lazy(url)
        .context("invalid database URL")
}

fn open_broker(config: &Config) -> anyhow::Result<Arc<RedisStreamBroker>> {
    let url = config.require_broker_url()?;
    let broker = RedisStreamBroker::open(url)
        .context("invalid broker URL")?
        .with_max_len(config.broker.stream_max_len);
    Ok(Arc::new(broker))
}

fn whole_secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("shutdown requested");
                trigger.cancel();
            }
            Err(err) => warn!(error = %err, "unable to listen for ctrl-c"),
        }
    });
    token
}

async fn run_worker(config: &Config, args: WorkerArgs) -> anyhow::Result<()> {
    let capability = Capability::new(
        args.capability
            .unwrap_or_else(|| config.worker.capability.clone()),
    )?;
    let worker_id = WorkerId::new(config.identity.for_role(capability.as_str()));
    let broker = open_broker(config)?;
    let store = Arc::new(PostgresLeaseStore::from_pool(lazy_pool(config)?));

    info!(
        capability = %capability,
        worker_id = %worker_id,
        "starting worker"
    );

    let mut settings = ConsumerSettings::new(capability.clone(), worker_id.clone());
    settings.queues = QueueNames::new(config.broker.queue_prefix.clone());
    settings.default_lease_ttl_secs = whole_secs(config.worker.default_lease_ttl);
    settings.prefetch = config.worker.control_prefetch;
    settings.retry = RetryPolicy::FixedDelay(config.broker.reconnect_delay);

    let consumer = CommandConsumer::new(store.clone(), broker, settings);
    let renewer = LeaseRenewer::new(store, capability, worker_id)
        .with_interval(config.worker.renew_every)
        .with_extension(config.worker.lease_extension);

    let shutdown = shutdown_on_ctrl_c();
    let renew_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { renewer.run(shutdown).await }
    });
    let consume_task = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { consumer.run(shutdown).await }
    });

    let consumed = consume_task.await.context("command consumer task panicked")?;
    // The renewer must not outlive the consumer it extends leases for.
    shutdown.cancel();
    renew_task.await.context("lease renewer task panicked")?;

    consumed.context("command consumer stopped")?;
    info!("worker stopped");
    Ok(())
}

async fn run_janitor(config: &Config) -> anyhow::Result<()> {
    let store = Arc::new(PostgresLeaseStore::from_pool(lazy_pool(config)?));
    info!(
        janitor_id = %config.identity.for_role("janitor"),
        "starting janitor"
    );

    let janitor = LeaseJanitor::new(store).with_interval(config.janitor.interval);
    janitor.run(shutdown_on_ctrl_c()).await;
    info!("janitor stopped");
    Ok(())
}

async fn run_ingest(config: &Config) -> anyhow::Result<()> {
    let broker = open_broker(config)?;
    let store = Arc::new(PostgresLeaseStore::from_pool(lazy_pool(config)?));

    let mut settings = IngestorSettings::new(config.identity.for_role("ingestor"));
    settings.queues = QueueNames::new(config.broker.queue_prefix.clone());
    settings.prefetch = config.ingest.event_prefetch;
    settings.retry = RetryPolicy::FixedDelay(config.broker.reconnect_delay);

    let ingestor = EventIngestor::new(store, broker, settings);
    ingestor
        .run(shutdown_on_ctrl_c())
        .await
        .context("event ingestor stopped")?;
    info!("ingestor stopped");
    Ok(())
}

async fn run_db_migrate(config: &Config) -> anyhow::Result<()> {
    let url = config.require_database_url()?;
    let pool = PgPoolOptions::new()
        .max_connections(1)
        .connect(url)
        .await
        .context("failed to connect to PostgreSQL for migration")?;
    vigil_core::MIGRATOR
        .run(&pool)
        .await
        .context("database migration failed")?;
    info!("Database migrations applied successfully");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_parses_every_role() {
        let cli = Cli::try_parse_from(["vigil", "worker", "--capability", "person"]).unwrap();
        assert!(matches!(
            cli.command,
            Command::Worker(WorkerArgs { capability: Some(ref c) }) if c == "person"
        ));

        let cli = Cli::try_parse_from(["vigil", "--config", "x.toml", "janitor"]).unwrap();
        assert!(matches!(cli.command, Command::Janitor));
        assert_eq!(cli.config, Some(PathBuf::from("x.toml")));

        let cli = Cli::try_parse_from(["vigil", "db", "migrate"]).unwrap();
        assert!(matches!(cli.command, Command::Db(DbCommand::Migrate)));

        assert!(Cli::try_parse_from(["vigil"]).is_err());
    }

    #[test]
    fn whole_secs_saturates() {
        assert_eq!(whole_secs(Duration::from_millis(2_500)), 2);
        assert_eq!(whole_secs(Duration::MAX), i64::MAX);
    }
}
