//! Configuration for the orchestrator.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (PRAETOR_HOME, PRAETOR_LISTEN_ADDR, PRAETOR_DB)
//! 2. Config file (.praetor/config.yaml)
//! 3. Defaults (~/.praetor)
//!
//! Config file discovery searches the current directory and parents for
//! .praetor/config.yaml. Loading is pure: the resolved value is passed into
//! constructors, never cached in module state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::access::OrgAccessRecord;
use crate::core::SafetySettings;
use crate::http::RateLimitSettings;

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub safety: Option<SafetySettings>,

    #[serde(default)]
    pub rate_limits: Option<RateLimitSettings>,

    /// Per-org access policies for the static provider
    #[serde(default)]
    pub access: HashMap<String, OrgAccessRecord>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StoreConfig {
    pub kind: Option<StoreKind>,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AuditConfig {
    pub jsonl_path: Option<String>,
    #[serde(default)]
    pub disabled: bool,
}

/// Resolved configuration with absolute paths.
#[derive(Debug, Clone)]
pub struct Config {
    /// State directory (~/.praetor unless overridden)
    pub home: PathBuf,

    pub listen_addr: SocketAddr,

    pub store_kind: StoreKind,

    pub sqlite_path: PathBuf,

    /// None disables the audit sink
    pub audit_path: Option<PathBuf>,

    pub safety: SafetySettings,

    pub rate_limits: RateLimitSettings,

    pub access: HashMap<String, OrgAccessRecord>,

    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
}

const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9400";

impl Config {
    /// Load configuration from all sources.
    pub fn load() -> Result<Self> {
        let config_file = find_config_file();
        let file = match &config_file {
            Some(path) => load_config_file(path)?,
            None => ConfigFile::default(),
        };
        Self::resolve(file, config_file)
    }

    fn resolve(file: ConfigFile, config_file: Option<PathBuf>) -> Result<Self> {
        let default_home = dirs::home_dir()
            .context("Failed to determine home directory")?
            .join(".praetor");
        let home = std::env::var("PRAETOR_HOME")
            .map(PathBuf::from)
            .unwrap_or(default_home);

        let listen_addr = std::env::var("PRAETOR_LISTEN_ADDR")
            .ok()
            .or(file.server.listen_addr)
            .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string());
        let listen_addr: SocketAddr = listen_addr
            .parse()
            .with_context(|| format!("Invalid listen address '{}'", listen_addr))?;

        let sqlite_path = std::env::var("PRAETOR_DB")
            .map(PathBuf::from)
            .ok()
            .or_else(|| file.store.sqlite_path.as_ref().map(PathBuf::from))
            .unwrap_or_else(|| home.join("praetor.db"));

        let audit_path = if file.audit.disabled {
            None
        } else {
            Some(
                file.audit
                    .jsonl_path
                    .as_ref()
                    .map(PathBuf::from)
                    .unwrap_or_else(|| home.join("audit.jsonl")),
            )
        };

        Ok(Self {
            home,
            listen_addr,
            store_kind: file.store.kind.unwrap_or(StoreKind::Sqlite),
            sqlite_path,
            audit_path,
            safety: file.safety.unwrap_or_default(),
            rate_limits: file.rate_limits.unwrap_or_default(),
            access: file.access,
            config_file,
        })
    }
}

/// Find config file by searching current directory and parents.
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".praetor").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse a config file.
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}
