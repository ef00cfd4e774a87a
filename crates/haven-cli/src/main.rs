//! `haven`: inspect and repair a Haven data directory.

mod logging;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use haven_core::{ErrorLogEntry, HavenConfig, OperationStatus, QueuedOperation, SystemClock};
use haven_runtime::reporting::ERROR_LOG_KEY;
use haven_runtime::{
    CacheStore, Environment, FileStore, HttpNetworkClient, QueueLedger, StoreGuard, StoreRegion,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "haven")]
#[command(about = "Diagnostics for the Haven offline-continuity store", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Data directory of the durable store
    #[arg(long, global = true, env = "HAVEN_DATA_DIR", default_value = "haven-data")]
    data_dir: PathBuf,

    /// Configuration file (YAML or JSON)
    #[arg(long, global = true, env = "HAVEN_CONFIG")]
    config: Option<PathBuf>,

    /// Print JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    /// Log more
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Inspect or repair the offline queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Show the most recent handled errors
    Errors {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },

    /// Maintain the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Validate configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Detect store and network capabilities
    Env {
        /// URL to probe for reachability
        #[arg(long)]
        health_url: Option<String>,
    },
}

#[derive(Subcommand)]
enum QueueAction {
    /// List queued operations, oldest first
    List {
        #[arg(long, value_enum)]
        status: Option<StatusArg>,

        #[arg(long)]
        collection: Option<String>,
    },

    /// Put a failed operation back into automatic replay
    Retry { id: Uuid },

    /// Remove queued operations
    Purge {
        /// Only this collection
        #[arg(long, required_unless_present = "all")]
        collection: Option<String>,

        /// Every operation
        #[arg(long, conflicts_with = "collection")]
        all: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Remove entries older than their category TTL
    Sweep,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Check a configuration file against the schema
    Check { file: PathBuf },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Pending,
    InFlight,
    Failed,
    Synced,
}

impl From<StatusArg> for OperationStatus {
    fn from(arg: StatusArg) -> Self {
        match arg {
            StatusArg::Pending => OperationStatus::Pending,
            StatusArg::InFlight => OperationStatus::InFlight,
            StatusArg::Failed => OperationStatus::Failed,
            StatusArg::Synced => OperationStatus::Synced,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_with_level(if cli.verbose { "debug" } else { "warn" });

    if let Commands::Config {
        action: ConfigAction::Check { file },
    } = &cli.command
    {
        return cmd_config_check(file, cli.json);
    }

    let config = match &cli.config {
        Some(path) => HavenConfig::from_file(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => HavenConfig::default(),
    };
    let store = open_store(&cli.data_dir, &config)?;

    match cli.command {
        Commands::Queue { action } => cmd_queue(action, store, cli.json).await,
        Commands::Errors { limit } => cmd_errors(store, limit, cli.json).await,
        Commands::Cache {
            action: CacheAction::Sweep,
        } => cmd_cache_sweep(store, &config, cli.json).await,
        Commands::Env { health_url } => cmd_env(store, &config, health_url, cli.json).await,
        Commands::Config { .. } => Ok(()),
    }
}

fn open_store(dir: &Path, config: &HavenConfig) -> Result<StoreGuard> {
    let file = FileStore::open(dir)
        .with_context(|| format!("opening data directory {}", dir.display()))?;
    Ok(StoreGuard::new(Arc::new(file), config.timeouts.storage))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn cmd_queue(action: QueueAction, store: StoreGuard, json: bool) -> Result<()> {
    let ledger = QueueLedger::new(store);
    match action {
        QueueAction::List { status, collection } => {
            let status = status.map(OperationStatus::from);
            let ops: Vec<QueuedOperation> = ledger
                .load()
                .await?
                .into_iter()
                .filter(|op| status.map_or(true, |s| op.status == s))
                .filter(|op| collection.as_deref().map_or(true, |c| op.collection == c))
                .collect();
            if json {
                return print_json(&ops);
            }
            if ops.is_empty() {
                println!("Queue is empty");
                return Ok(());
            }
            for op in &ops {
                println!(
                    "{:>6}  {}  {:<9} {:<6} {}/{}  attempts {}/{}",
                    op.sequence,
                    op.id,
                    op.status.to_string(),
                    op.kind.to_string(),
                    op.collection,
                    op.record_id,
                    op.attempts,
                    op.max_attempts
                );
                if let Some(err) = &op.last_error {
                    println!("        last error: {err}");
                }
            }
            Ok(())
        }
        QueueAction::Retry { id } => {
            let op = ledger.retry(id).await?;
            if json {
                return print_json(&op);
            }
            println!("Requeued {} ({}/{})", op.id, op.collection, op.record_id);
            Ok(())
        }
        QueueAction::Purge { collection, all } => {
            if !all && collection.is_none() {
                bail!("pass --collection <name> or --all");
            }
            let removed = ledger.purge(collection.as_deref()).await?;
            if json {
                return print_json(&serde_json::json!({ "removed": removed }));
            }
            println!("Removed {removed} operation(s)");
            Ok(())
        }
    }
}

async fn cmd_errors(store: StoreGuard, limit: usize, json: bool) -> Result<()> {
    let entries: Vec<ErrorLogEntry> = store
        .get(StoreRegion::ErrorLog, ERROR_LOG_KEY)
        .await?
        .unwrap_or_default();
    let recent: Vec<&ErrorLogEntry> = entries.iter().rev().take(limit).collect();
    if json {
        return print_json(&recent);
    }
    if recent.is_empty() {
        println!("No errors recorded");
        return Ok(());
    }
    for entry in recent {
        println!(
            "{}  {:<24} {}",
            entry.timestamp.format("%Y-%m-%d %H:%M:%S"),
            entry.kind.to_string(),
            entry.message
        );
        for (key, value) in &entry.context {
            println!("    {key}={value}");
        }
    }
    Ok(())
}

async fn cmd_cache_sweep(store: StoreGuard, config: &HavenConfig, json: bool) -> Result<()> {
    let cache = CacheStore::new(store, config.cache.clone(), Arc::new(SystemClock));
    let report = cache.sweep().await?;
    if json {
        return print_json(&report);
    }
    println!(
        "Examined {}, removed {} expired and {} corrupt",
        report.examined, report.expired, report.corrupt
    );
    Ok(())
}

fn cmd_config_check(file: &Path, json: bool) -> Result<()> {
    let config = HavenConfig::from_file(file)
        .with_context(|| format!("{} is not a valid configuration", file.display()))?;
    if json {
        return print_json(&config);
    }
    println!("{} is valid", file.display());
    println!(
        "  circuit breaker: {} failures, open for {:?}, {} probe successes",
        config.circuit_breaker.failure_threshold,
        config.circuit_breaker.open_timeout,
        config.circuit_breaker.half_open_success_threshold
    );
    println!(
        "  retry: {} retries from {:?}, factor {}, jitter {}",
        config.retry.max_retries,
        config.retry.base_delay,
        config.retry.backoff_factor,
        config.retry.jitter
    );
    println!(
        "  queue: {} attempts, error log keeps {}",
        config.queue.max_attempts, config.error_log.max_size
    );
    Ok(())
}

async fn cmd_env(
    store: StoreGuard,
    config: &HavenConfig,
    health_url: Option<String>,
    json: bool,
) -> Result<()> {
    let mut network = HttpNetworkClient::new(config.timeouts.network)?;
    if let Some(url) = health_url {
        network = network.with_health_url(url);
    }
    let env = Environment::detect(&store, &network, &SystemClock).await;
    if json {
        return print_json(&env);
    }
    println!("store:           {} ({})", env.store, env.store_backend);
    println!("network:         {}", if env.network_reachable { "reachable" } else { "unreachable" });
    println!("background sync: {}", if env.background_sync { "available" } else { "unavailable" });
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use clap::CommandFactory;
    use haven_core::{OperationDraft, OperationKind};
    use serde_json::json;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_purge_needs_a_target() {
        assert!(Cli::try_parse_from(["haven", "queue", "purge"]).is_err());
        assert!(Cli::try_parse_from(["haven", "queue", "purge", "--all"]).is_ok());
        assert!(Cli::try_parse_from(["haven", "queue", "purge", "--all", "--collection", "meals"]).is_err());
    }

    #[tokio::test]
    async fn test_retry_and_purge_against_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(dir.path(), &HavenConfig::default()).unwrap();
        let ledger = QueueLedger::new(store.clone());
        let mut op = QueuedOperation::from_draft(
            OperationDraft::new(OperationKind::Delete, "meals", "m1", json!(null)),
            1,
            5,
            Utc::now(),
        );
        op.status = OperationStatus::Failed;
        ledger.save(&op).await.unwrap();

        cmd_queue(QueueAction::Retry { id: op.id }, store.clone(), true)
            .await
            .unwrap();
        assert_eq!(
            ledger.find(op.id).await.unwrap().unwrap().status,
            OperationStatus::Pending
        );

        cmd_queue(
            QueueAction::Purge {
                collection: Some("meals".to_string()),
                all: false,
            },
            store,
            true,
        )
        .await
        .unwrap();
        assert!(ledger.load().await.unwrap().is_empty());
    }
}
