//! Configuration management.
//!
//! Supports a JSON config file merged with command-line overrides.
//! Pool and solo mode are selected by which section is present; when
//! both are configured, pool wins.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::miner::Algorithm;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Pool connection (pool mode).
    #[serde(default)]
    pub pool: Option<PoolConfig>,

    /// Node RPC connection (solo mode).
    #[serde(default)]
    pub node: Option<NodeConfig>,

    /// Mining configuration.
    #[serde(default)]
    pub mining: MiningConfig,

    /// Device enumeration and allow-list.
    #[serde(default)]
    pub devices: DeviceConfig,

    /// Stats reporting.
    #[serde(default)]
    pub stats: StatsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Pool URL (stratum+tcp://host:port or host:port).
    pub url: String,

    /// Wallet address shares are credited to.
    pub wallet: String,

    /// Worker name.
    #[serde(default = "default_worker_name")]
    pub worker: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Node JSON-RPC URL (http://host:port).
    pub url: String,

    /// Coinbase payout address.
    pub miner_address: String,

    /// Coinbase randomizer tag; devices salt it further.
    #[serde(default = "default_coinbase_tag")]
    pub coinbase_tag: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MiningConfig {
    /// Mining algorithm tag (see the registry).
    #[serde(default = "default_algorithm")]
    pub algorithm: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct DeviceConfig {
    /// Number of CPU devices (0 = one per logical core).
    #[serde(default)]
    pub count: usize,

    /// Device ids allowed to mine; empty allows all. Excluded devices
    /// still start so shutdown stays uniform.
    #[serde(default)]
    pub allow: Vec<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// Stats endpoint listen address; disabled when unset.
    #[serde(default)]
    pub listen: Option<String>,

    /// Write the stats JSON snapshot to this file.
    #[serde(default)]
    pub file: Option<PathBuf>,

    /// Global status interval in seconds.
    #[serde(default = "default_stats_interval")]
    pub interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Disable colored output.
    #[serde(default)]
    pub no_color: bool,

    /// Quiet mode.
    #[serde(default)]
    pub quiet: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pool: Some(PoolConfig {
                url: "stratum+tcp://pool.meridianchain.org:3333".to_string(),
                wallet: String::new(),
                worker: default_worker_name(),
            }),
            node: None,
            mining: MiningConfig::default(),
            devices: DeviceConfig::default(),
            stats: StatsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for MiningConfig {
    fn default() -> Self {
        Self {
            algorithm: default_algorithm(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            listen: None,
            file: None,
            interval_secs: default_stats_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            no_color: false,
            quiet: false,
        }
    }
}

impl Config {
    /// Load config from file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        let config: Config =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;
        Ok(config)
    }

    /// Save config to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("Failed to serialize config")?;
        fs::write(path.as_ref(), json).context("Failed to write config file")?;
        Ok(())
    }

    /// Get default config path
    pub fn default_path() -> Result<PathBuf> {
        let home = dirs::home_dir().context("Could not determine home directory")?;
        let config_dir = home.join(".meridian");
        fs::create_dir_all(&config_dir)?;
        Ok(config_dir.join("miner-config.json"))
    }

    /// Load config from default location
    pub fn load_default() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::from_file(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate configuration. Failures here are fatal: nothing has
    /// started yet.
    pub fn validate(&self) -> Result<()> {
        match (&self.pool, &self.node) {
            (None, None) => anyhow::bail!("either a pool or a node must be configured"),
            (Some(pool), _) => {
                if pool.wallet.is_empty() {
                    anyhow::bail!("wallet address is required for pool mining");
                }
                let url = pool
                    .url
                    .strip_prefix("stratum+tcp://")
                    .or_else(|| pool.url.strip_prefix("tcp://"))
                    .unwrap_or(&pool.url);
                if url.is_empty() || !url.contains(':') {
                    anyhow::bail!("pool URL must be host:port or stratum+tcp://host:port");
                }
            }
            (None, Some(node)) => {
                if !node.url.starts_with("http://") && !node.url.starts_with("https://") {
                    anyhow::bail!("node URL must start with http:// or https://");
                }
                if node.miner_address.is_empty() {
                    anyhow::bail!("miner address is required for solo mining");
                }
            }
        }

        if Algorithm::from_str(&self.mining.algorithm).is_none() {
            anyhow::bail!(
                "invalid algorithm: {}. valid: blake2bd, sha3d, blake3",
                self.mining.algorithm
            );
        }

        if self.stats.interval_secs == 0 {
            anyhow::bail!("stats interval must be at least 1 second");
        }
        Ok(())
    }
}

// Default value functions
fn default_worker_name() -> String {
    hostname::get()
        .unwrap_or_else(|_| "unknown".into())
        .to_string_lossy()
        .into_owned()
}

fn default_coinbase_tag() -> String {
    "meridian-miner".to_string()
}

fn default_algorithm() -> String {
    "blake2bd".to_string()
}

fn default_stats_interval() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}
