use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::engine::EnginePolicy;

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

/// Process configuration loaded from YAML.  Every field has a default, so an
/// empty document is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StorageConfig {
    /// Directory holding `routes.json`, `git/`, `www/` and `locks/`.
    #[serde(default = "default_storage_root")]
    pub root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            root: default_storage_root(),
        }
    }
}

fn default_storage_root() -> PathBuf {
    PathBuf::from("/var/lib/git-bundle-server")
}

// ---------------------------------------------------------------------------
// Web server
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    /// Seconds in-flight requests may keep running after shutdown starts.
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period: u64,
    /// Seconds before a single request is aborted.
    #[serde(default = "default_request_timeout")]
    pub request_timeout: u64,
    /// Seconds a registry snapshot is reused before `routes.json` is re-read.
    #[serde(default = "default_registry_refresh_interval")]
    pub registry_refresh_interval: u64,
    /// Serve plain HTTP when absent.
    #[serde(default)]
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            shutdown_grace_period: default_shutdown_grace_period(),
            request_timeout: default_request_timeout(),
            registry_refresh_interval: default_registry_refresh_interval(),
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout)
    }

    pub fn registry_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.registry_refresh_interval)
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_shutdown_grace_period() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    60
}

fn default_registry_refresh_interval() -> u64 {
    5
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TlsConfig {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
    #[serde(default)]
    pub min_version: TlsVersion,
    /// CA bundle for verifying client certificates.  Enables mutual TLS.
    #[serde(default)]
    pub client_ca_file: Option<PathBuf>,
}

/// Lowest TLS protocol version the server negotiates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
pub enum TlsVersion {
    #[default]
    #[serde(rename = "tls1.2")]
    #[value(name = "tls1.2")]
    Tls12,
    #[serde(rename = "tls1.3")]
    #[value(name = "tls1.3")]
    Tls13,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_git_binary")]
    pub git_binary: PathBuf,
    /// Seconds a clone or fetch may run before the update is abandoned.
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout: u64,
    /// Collapse the chain into a new base bundle at this many incrementals.
    #[serde(default)]
    pub max_incremental_bundles: Option<usize>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            git_binary: default_git_binary(),
            fetch_timeout: default_fetch_timeout(),
            max_incremental_bundles: None,
        }
    }
}

impl EngineConfig {
    pub fn policy(&self) -> EnginePolicy {
        EnginePolicy {
            fetch_timeout: Duration::from_secs(self.fetch_timeout),
            max_incremental_bundles: self.max_incremental_bundles,
        }
    }
}

fn default_git_binary() -> PathBuf {
    PathBuf::from("git")
}

fn default_fetch_timeout() -> u64 {
    600
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    #[serde(default = "bool_true")]
    pub enabled: bool,
    /// Seconds between update cycles.
    #[serde(default = "default_scheduler_interval")]
    pub interval: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_scheduler_interval(),
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }
}

fn bool_true() -> bool {
    true
}

fn default_scheduler_interval() -> u64 {
    3600
}

// ---------------------------------------------------------------------------
// Loader
// ---------------------------------------------------------------------------

/// Load and validate a [`Config`] from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    let config = parse_config(&contents)
        .with_context(|| format!("invalid config file: {}", path.display()))?;
    Ok(config)
}

/// Like [`load_config`], but a missing file yields [`Config::default`].
pub fn load_config_or_default<P: AsRef<Path>>(path: P) -> Result<Config> {
    let path = path.as_ref();
    if !path.exists() {
        return Ok(Config::default());
    }
    load_config(path)
}

fn parse_config(contents: &str) -> Result<Config> {
    // serde_yaml rejects an empty document; treat it as all-defaults.
    let config: Config = if contents.trim().is_empty() {
        Config::default()
    } else {
        serde_yaml::from_str(contents).context("failed to parse YAML")?
    };
    validate_config(&config)?;
    Ok(config)
}

/// Basic sanity checks that cannot be expressed purely with serde.
pub fn validate_config(config: &Config) -> Result<()> {
    anyhow::ensure!(
        !config.storage.root.as_os_str().is_empty(),
        "storage.root must not be empty"
    );
    anyhow::ensure!(
        config.server.request_timeout > 0,
        "server.request_timeout must be positive"
    );
    anyhow::ensure!(
        config.engine.fetch_timeout > 0,
        "engine.fetch_timeout must be positive"
    );
    anyhow::ensure!(
        config.engine.max_incremental_bundles != Some(0),
        "engine.max_incremental_bundles must be at least 1 when set"
    );
    anyhow::ensure!(
        config.scheduler.interval > 0,
        "scheduler.interval must be positive"
    );
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
