//! TOML configuration parsing and validation.
//!
//! Every section except `[db]` and `[analysis]` may be omitted; missing
//! keys fall back to the defaults below.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub analysis: AnalysisConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub repair: RepairConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// Upper bound on a single store operation driven by the engine.
    #[serde(default = "default_db_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_db_timeout_secs() -> u64 {
    10
}

#[derive(Debug, Deserialize, Clone)]
pub struct AnalysisConfig {
    pub base_url: String,
    /// Collection queried when a document has none recorded.
    #[serde(default = "default_collection")]
    pub collection: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: u64,
    /// Name of the environment variable holding a bearer token, if any.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

fn default_collection() -> String {
    "default".to_string()
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_max_retries() -> u32 {
    3
}
fn default_backoff_ms() -> u64 {
    1000
}

impl AnalysisConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Retry policy with `attempts` overriding `max_retries` when given.
    pub fn retry_policy(&self, attempts: Option<u32>) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts.unwrap_or(self.max_retries).max(1),
            // Fetch and reconcile together may each take a full timeout.
            attempt_timeout: self.timeout() * 2,
            backoff: Duration::from_millis(self.backoff_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7341".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_capacity")]
    pub capacity: u64,
    #[serde(default = "default_cache_ttl_secs")]
    pub ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_cache_capacity(),
            ttl_secs: default_cache_ttl_secs(),
        }
    }
}

fn default_cache_capacity() -> u64 {
    10_000
}
fn default_cache_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepairConfig {
    /// Documents repaired at once during a batch. Keep at 1 unless the
    /// analysis service is known to tolerate parallel load.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    /// Prefixes of the stored content blob that mark a bad migration.
    #[serde(default = "default_legacy_markers")]
    pub legacy_markers: Vec<String>,
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            legacy_markers: default_legacy_markers(),
        }
    }
}

fn default_concurrency() -> usize {
    1
}

fn default_legacy_markers() -> Vec<String> {
    vec!["\"".to_string(), "[object".to_string()]
}

impl Config {
    /// Configuration pointing at `db_path` and `base_url` with every other
    /// value defaulted.
    pub fn minimal(db_path: impl Into<PathBuf>, base_url: impl Into<String>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
                timeout_secs: default_db_timeout_secs(),
            },
            analysis: AnalysisConfig {
                base_url: base_url.into(),
                collection: default_collection(),
                timeout_secs: default_timeout_secs(),
                max_retries: default_max_retries(),
                backoff_ms: default_backoff_ms(),
                api_key_env: None,
            },
            server: ServerConfig::default(),
            cache: CacheConfig::default(),
            repair: RepairConfig::default(),
        }
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_secs(self.db.timeout_secs)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    let base = config.analysis.base_url.trim();
    if !(base.starts_with("http://") || base.starts_with("https://")) {
        anyhow::bail!("analysis.base_url must be an http(s) URL, got '{}'", base);
    }

    if config.analysis.collection.trim().is_empty() {
        anyhow::bail!("analysis.collection must not be empty");
    }

    if config.analysis.timeout_secs == 0 {
        anyhow::bail!("analysis.timeout_secs must be > 0");
    }

    if config.analysis.max_retries == 0 {
        anyhow::bail!("analysis.max_retries must be >= 1");
    }

    if config.db.timeout_secs == 0 {
        anyhow::bail!("db.timeout_secs must be > 0");
    }

    if config.repair.concurrency == 0 {
        anyhow::bail!("repair.concurrency must be >= 1");
    }

    if config.cache.capacity == 0 {
        anyhow::bail!("cache.capacity must be >= 1");
    }

    Ok(())
}
