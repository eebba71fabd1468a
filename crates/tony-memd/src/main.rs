use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::json;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tony_core::MemoryConfig;
use tony_memory::{MemoryFacade, MemoryScheduler, RemoteStore, RestRemoteStore, SchedulerConfig};
use tony_storage::LocalStore;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "tony-memd")]
#[command(about = "Conversation memory maintenance for Tony", long_about = None)]
struct Cli {
    /// Config file (defaults to TONY_CONFIG_PATH or ~/.config/tony/memory.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    debug: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the periodic archive sweep until interrupted. Backups and eviction of live
    /// sessions belong to the process that serves conversations.
    Serve,
    /// List stored sessions with their unsynced record counts
    Sessions,
    /// Print the memory summary of a session
    Summary { session_id: String },
    /// Snapshot a session into its backup slot
    Backup { session_id: String },
    /// Refill a session's empty record sets from its backup
    Restore { session_id: String },
    /// Archive sessions idle for more than N days
    Cleanup {
        #[arg(long)]
        days: Option<i64>,
    },
    /// Count records never confirmed by the remote store
    Unsynced { session_id: String },
    /// Delete procedures stored under the legacy `query_pattern_*` names
    PrunePatterns { session_id: String },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let config = load_config(cli.config.as_deref())?;
    let store = Arc::new(LocalStore::open_in_dir(&config.data_dir).with_context(|| {
        format!(
            "failed to open memory store in {}",
            config.data_dir.display()
        )
    })?);

    match cli.command {
        Commands::Serve => serve(store, config),
        Commands::Summary { session_id } => {
            let facade = MemoryFacade::inspect(&session_id, store, remote_store(&config), &config)
                .context("failed to open session memory")?;
            print_json(&facade.summary()?)
        }
        Commands::Backup { session_id } => {
            let bytes = store
                .create_backup(&session_id)
                .context("backup failed")?;
            print_json(&json!({ "session_id": session_id, "bytes": bytes }))
        }
        Commands::Restore { session_id } => {
            let restored = store
                .restore_backup(&session_id)
                .context("restore failed")?;
            print_json(&json!({ "session_id": session_id, "restored": restored }))
        }
        Commands::Cleanup { days } => {
            let days = days.unwrap_or(config.archive_after_days);
            let archived = store
                .cleanup_sessions_older_than(days)
                .context("cleanup failed")?;
            print_json(&json!({ "days": days, "archived": archived }))
        }
        Commands::Sessions => {
            let mut sessions = Vec::new();
            for session_id in store.session_ids()? {
                let unsynced = store.unsynced_count(&session_id)?;
                sessions.push(json!({ "session_id": session_id, "unsynced": unsynced }));
            }
            print_json(&sessions)
        }
        Commands::Unsynced { session_id } => {
            let unsynced = store.unsynced_count(&session_id)?;
            print_json(&json!({ "session_id": session_id, "unsynced": unsynced }))
        }
        Commands::PrunePatterns { session_id } => {
            let facade = MemoryFacade::open(&session_id, store, remote_store(&config), &config)
                .context("failed to open session memory")?;
            let removed = facade
                .cleanup_old_procedural_patterns()
                .context("pattern cleanup failed")?;
            print_json(&json!({ "session_id": session_id, "removed": removed }))
        }
    }
}

fn serve(store: Arc<LocalStore>, config: MemoryConfig) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?;

    runtime.block_on(async {
        let scheduler = MemoryScheduler::start_archiver(
            store,
            SchedulerConfig::from_memory_config(&config),
        );
        info!(event = "memd_ready", data_dir = %config.data_dir.display());
        let signal = tokio::signal::ctrl_c().await;
        scheduler.shutdown().await;
        info!(event = "memd_stopped");
        signal.context("failed to listen for ctrl-c")
    })
}

fn remote_store(config: &MemoryConfig) -> Option<Arc<dyn RemoteStore>> {
    let remote = config.remote.as_ref()?;
    match RestRemoteStore::new(remote) {
        Ok(store) => Some(Arc::new(store) as Arc<dyn RemoteStore>),
        Err(err) => {
            warn!(event = "remote_store_disabled", error = %err);
            None
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<MemoryConfig> {
    let config = match path {
        Some(path) => MemoryConfig::load(path),
        None => MemoryConfig::load_default(),
    };
    config.context("failed to load memory config")
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else {
        env::var("TONY_LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_maintenance_subcommands() {
        let cli = Cli::try_parse_from(["tony-memd", "cleanup", "--days", "7"]).expect("parse");
        assert_eq!(cli.command, Commands::Cleanup { days: Some(7) });

        let cli = Cli::try_parse_from(["tony-memd", "--debug", "summary", "s1"]).expect("parse");
        assert!(cli.debug);
        assert_eq!(
            cli.command,
            Commands::Summary {
                session_id: "s1".to_string()
            }
        );
    }

    #[test]
    fn session_commands_require_an_id() {
        assert!(Cli::try_parse_from(["tony-memd", "backup"]).is_err());
        assert!(Cli::try_parse_from(["tony-memd", "prune-patterns"]).is_err());

        let cli = Cli::try_parse_from(["tony-memd", "prune-patterns", "s1"]).expect("parse");
        assert_eq!(
            cli.command,
            Commands::PrunePatterns {
                session_id: "s1".to_string()
            }
        );
        let cli = Cli::try_parse_from(["tony-memd", "sessions"]).expect("parse");
        assert_eq!(cli.command, Commands::Sessions);
    }

    #[test]
    fn explicit_missing_config_file_falls_back_to_defaults() {
        let dir = std::env::temp_dir().join("tony-memd-absent-config.toml");
        let config = load_config(Some(&dir)).expect("defaults");
        assert_eq!(config.short_term_k, tony_core::config::DEFAULT_SHORT_TERM_K);
    }
}
