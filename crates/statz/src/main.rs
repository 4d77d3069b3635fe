//! Statz service entry point.
//!
//! Loads configuration, sets up logging, opens the row store and runs the
//! requested command.

use anyhow::{Context, Result};
use statz_core::{MemoryRowStore, RowStore, SqliteRowStore, StatzService};
use std::sync::Arc;
use tracing::{error, info};

mod cli;
mod config;
mod logging;
mod serve;
mod signals;
mod stress;

use cli::{CliArgs, CliCommand};
use config::{AppConfig, StorageBackend};

/// Main application struct.
pub struct Application {
    config: AppConfig,
    command: CliCommand,
    service: StatzService,
}

impl Application {
    pub async fn new(args: CliArgs) -> Result<Self> {
        // Configuration comes first so logging can honour it.
        let mut config = AppConfig::load_from_file(&args.config_path).await?;

        if let Some(database) = args.database {
            config.storage.path = database;
            config.storage.backend = StorageBackend::Sqlite;
        }
        if let Some(log_level) = args.log_level {
            config.logging.level = log_level;
        }
        if args.json_logs {
            config.logging.json_format = true;
        }

        config.validate().context("Configuration validation failed")?;
        logging::setup_logging(&config.logging)?;

        let statz_config = config.to_statz_config()?;
        let store: Arc<dyn RowStore> = match config.storage.backend {
            StorageBackend::Sqlite => {
                let registry = Arc::new(statz_config.build_registry()?);
                Arc::new(SqliteRowStore::open(&config.storage.path, registry)?)
            }
            StorageBackend::Memory => {
                info!("Using in-memory storage, nothing will be kept after exit");
                Arc::new(MemoryRowStore::new())
            }
        };
        let service = StatzService::new(&statz_config, store)?;

        info!(
            "Statz v{} | Config: {} | Storage: {:?}",
            env!("CARGO_PKG_VERSION"),
            args.config_path.display(),
            config.storage.backend
        );
        if !statz_config.tracking_enabled {
            info!("Statistics tracking is disabled, updates will be ignored");
        }

        Ok(Self {
            config,
            command: args.command,
            service,
        })
    }

    pub async fn run(self) -> Result<()> {
        info!("Configuration Summary:");
        info!("  Flush interval: {}ms", self.config.flush.interval_ms);
        info!("  Max retries: {}", self.config.flush.max_retries);
        info!("  Cache refresh: {:?}", self.config.cache.refresh);
        if self.config.storage.backend == StorageBackend::Sqlite {
            info!("  Database: {}", self.config.storage.path.display());
        }

        match self.command {
            CliCommand::Serve => serve::run(self.service).await,
            CliCommand::Stress { iterations, players } => {
                let report = stress::run(&self.service, iterations, players).await?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        }
    }
}

#[tokio::main(flavor = "multi_thread")]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let app = Application::new(args).await?;
    if let Err(e) = app.run().await {
        error!("Statz stopped with an error: {:#}", e);
        return Err(e);
    }
    Ok(())
}
