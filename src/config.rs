use serde::Deserialize;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use crate::constants::backtest::{
    DEFAULT_FEE_RATE, DEFAULT_INITIAL_BALANCE, DEFAULT_PERIOD, EVAL_TIMEOUT, WARMUP_BARS,
};
use crate::constants::sandbox::DEFAULT_TIMEOUT;
use crate::error::ConfigError;

/// Environment variable naming an alternative config file.
pub const CONFIG_ENV: &str = "PROGRAM_TRADER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "config.yaml";

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct SandboxConfig {
    pub timeout_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_TIMEOUT.as_millis() as u64,
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct BacktestConfig {
    pub initial_balance: f64,
    pub fee_rate: f64,
    pub eval_timeout_ms: u64,
    pub warmup_bars: usize,
    pub period: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_balance: DEFAULT_INITIAL_BALANCE,
            fee_rate: DEFAULT_FEE_RATE,
            eval_timeout_ms: EVAL_TIMEOUT.as_millis() as u64,
            warmup_bars: WARMUP_BARS,
            period: DEFAULT_PERIOD.to_string(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    pub sandbox: SandboxConfig,
    pub backtest: BacktestConfig,
    /// Default tracing filter; `RUST_LOG` wins when set
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            sandbox: SandboxConfig::default(),
            backtest: BacktestConfig::default(),
            log_level: "info".to_string(),
        }
    }
}

impl AppConfig {
    /// Load from `$PROGRAM_TRADER_CONFIG`, falling back to `config.yaml`.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// A missing file yields the defaults; an unreadable or malformed one is
    /// an error.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, serde_yaml::Error> {
        // Strip BOM if present
        let content = content.strip_prefix('\u{feff}').unwrap_or(content);
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(content)
    }
}
