//! Command-line interface for the orchestrator.
//!
//! `serve` wires configuration into the service and runs the HTTP surface;
//! `config` prints the resolved configuration for debugging.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use crate::access::StaticAccessProvider;
use crate::config::{Config, StoreKind};
use crate::core::{
    standard_pipeline, AuditLog, CommandStore, MemoryStore, OrchestratorService, SqliteStore,
};
use crate::http::{self, AppState, RateLimiters};

/// praetor - command/job orchestration core
#[derive(Parser, Debug)]
#[command(name = "praetor")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the orchestrator HTTP server
    Serve {
        /// Address to bind to (overrides config)
        #[arg(short, long)]
        address: Option<String>,
    },

    /// Show resolved configuration (debug)
    Config,
}

impl Cli {
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Serve { address } => serve(address).await,
            Commands::Config => show_config(),
        }
    }
}

async fn serve(address: Option<String>) -> Result<()> {
    let mut config = Config::load()?;
    if let Some(address) = address {
        config.listen_addr = address
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", address))?;
    }

    let store: Arc<dyn CommandStore> = match config.store_kind {
        StoreKind::Memory => {
            info!("using in-memory store");
            Arc::new(MemoryStore::new())
        }
        StoreKind::Sqlite => {
            if let Some(parent) = config.sqlite_path.parent() {
                std::fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create state directory {}", parent.display())
                })?;
            }
            info!(path = %config.sqlite_path.display(), "using sqlite store");
            Arc::new(SqliteStore::open(&config.sqlite_path)?)
        }
    };

    let audit = match &config.audit_path {
        Some(path) => Arc::new(AuditLog::open(path).await?),
        None => Arc::new(AuditLog::disabled()),
    };

    let service = Arc::new(OrchestratorService::new(
        store,
        standard_pipeline(&config.safety),
        audit,
    ));
    let access = Arc::new(StaticAccessProvider::new(config.access.clone()));
    let limits = Arc::new(RateLimiters::from_settings(&config.rate_limits));

    http::serve(config.listen_addr, AppState::new(service, access, limits)).await
}

fn show_config() -> Result<()> {
    let config = Config::load()?;
    println!("home:        {}", config.home.display());
    println!("listen_addr: {}", config.listen_addr);
    println!("store:       {:?}", config.store_kind);
    println!("sqlite_path: {}", config.sqlite_path.display());
    match &config.audit_path {
        Some(path) => println!("audit:       {}", path.display()),
        None => println!("audit:       disabled"),
    }
    match &config.config_file {
        Some(path) => println!("config_file: {}", path.display()),
        None => println!("config_file: (none found)"),
    }
    println!("orgs with access policies: {}", config.access.len());
    Ok(())
}
