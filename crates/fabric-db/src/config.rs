use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential backoff, no jitter -- the default retry strategy shape.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Constant,
    Linear,
    Exponential,
    Fibonacci,
    Jittered,
}

/// Default retry policy applied to resolvers that don't set their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicyConfig {
    pub max_attempts: u32,
    pub strategy: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_factor: f64,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: 200,
            max_delay_ms: 30_000,
            jitter_factor: 0.2,
        }
    }
}

/// Evolver tuning knobs (spec §4.7, §9 "rolling window default 256").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvolverConfig {
    pub window_size: usize,
    pub threshold_failures: usize,
    pub min_interval_sec: u64,
}

impl Default for EvolverConfig {
    fn default() -> Self {
        Self {
            window_size: 256,
            threshold_failures: 5,
            min_interval_sec: 60,
        }
    }
}

/// Full configuration descriptor for the fabric (spec §6).
///
/// Loaded from a TOML file, with every field overridable by a
/// `FABRIC_`-prefixed environment variable. Precedence: explicit value
/// passed to [`FabricConfig::new`]/CLI flag, then env var, then the TOML
/// file, then the compiled default -- mirroring the teacher's own
/// env-over-file-over-default precedence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Root directory for flat-file persistence (`registry/`, `masteries/`,
    /// `history/`, `evolver/`) and the embedded `metrics.db` file.
    pub data_dir: PathBuf,
    pub http_bind: String,
    pub api_port: u16,
    pub collection_interval_sec: u64,
    pub health_interval_sec: u64,
    pub metrics_retention_days: u32,
    pub history_ring_size: usize,
    pub default_retry: RetryPolicyConfig,
    pub evolver: EvolverConfig,
}

impl FabricConfig {
    pub const DEFAULT_DATA_DIR: &str = "./fabric-data";

    /// Build a config from environment variables, falling back to defaults.
    ///
    /// Priority: `FABRIC_DATA_DIR` / `FABRIC_HTTP_BIND` / `FABRIC_API_PORT`
    /// env vars, then the compile-time default.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(dir) = env::var("FABRIC_DATA_DIR") {
            cfg.data_dir = PathBuf::from(dir);
        }
        if let Ok(bind) = env::var("FABRIC_HTTP_BIND") {
            cfg.http_bind = bind;
        }
        if let Ok(port) = env::var("FABRIC_API_PORT") {
            if let Ok(port) = port.parse() {
                cfg.api_port = port;
            }
        }
        cfg
    }

    /// Merge a TOML document on top of [`FabricConfig::from_env`], with
    /// environment variables still taking precedence over the file.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        use anyhow::Context;
        let from_file: Self = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse config file {}", path.display()))?
        } else {
            Self::default()
        };
        let env_cfg = Self::from_env();
        Ok(Self {
            data_dir: if env::var("FABRIC_DATA_DIR").is_ok() {
                env_cfg.data_dir
            } else {
                from_file.data_dir
            },
            http_bind: if env::var("FABRIC_HTTP_BIND").is_ok() {
                env_cfg.http_bind
            } else {
                from_file.http_bind
            },
            api_port: if env::var("FABRIC_API_PORT").is_ok() {
                env_cfg.api_port
            } else {
                from_file.api_port
            },
            ..from_file
        })
    }

    pub fn metrics_db_path(&self) -> PathBuf {
        self.data_dir.join("metrics.db")
    }

    pub fn registry_dir(&self) -> PathBuf {
        self.data_dir.join("registry")
    }

    pub fn masteries_dir(&self) -> PathBuf {
        self.data_dir.join("masteries")
    }

    pub fn history_dir(&self) -> PathBuf {
        self.data_dir.join("history")
    }

    pub fn evolver_dir(&self) -> PathBuf {
        self.data_dir.join("evolver")
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_sec)
    }

    pub fn collection_interval(&self) -> Duration {
        Duration::from_secs(self.collection_interval_sec)
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(Self::DEFAULT_DATA_DIR),
            http_bind: "127.0.0.1".to_owned(),
            api_port: 8090,
            collection_interval_sec: 30,
            health_interval_sec: 15,
            metrics_retention_days: 14,
            history_ring_size: 200,
            default_retry: RetryPolicyConfig::default(),
            evolver: EvolverConfig::default(),
        }
    }
}
