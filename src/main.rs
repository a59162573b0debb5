//! Program Trader CLI
//!
//! Commands:
//! - `validate`: statically screen a strategy file
//! - `execute`: run one decision cycle against a JSON market snapshot
//! - `backtest`: replay a strategy over historical klines and print the result

use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use program_trader::config::AppConfig;
use program_trader::data::{series_key, EmptyDataProvider, KlineSeries};
use program_trader::error::TradingError;
use program_trader::models::{Kline, MarketSnapshot, Position, StrategyParams};
use program_trader::services::backtest::BacktestEngine;
use program_trader::services::executor::SandboxExecutor;
use program_trader::services::validator::CodeValidator;

#[derive(Parser)]
#[command(name = "program_trader", about = "Validate and backtest sandboxed trading strategies")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Statically validate a strategy file.
    Validate {
        /// Strategy source file.
        file: PathBuf,
    },
    /// Run one decision cycle against a market snapshot.
    Execute {
        /// Strategy source file.
        file: PathBuf,

        /// JSON market snapshot: balances, trigger, prices and positions.
        #[arg(long)]
        snapshot: PathBuf,

        /// JSON object of strategy parameters.
        #[arg(long)]
        params: Option<PathBuf>,
    },
    /// Replay a strategy over historical klines.
    Backtest {
        /// Strategy source file.
        file: PathBuf,

        /// JSON klines: either a list of bars or a map of "{symbol}_{period}" to bars.
        #[arg(long)]
        klines: PathBuf,

        #[arg(long)]
        symbol: String,

        /// Bar period. Defaults to the configured period.
        #[arg(long)]
        period: Option<String>,

        /// JSON object of strategy parameters.
        #[arg(long)]
        params: Option<PathBuf>,

        /// Write the result JSON here instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        #[arg(long)]
        initial_balance: Option<f64>,

        #[arg(long)]
        fee_rate: Option<f64>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum KlineFile {
    Series(KlineSeries),
    Bars(Vec<Kline>),
}

#[derive(Deserialize)]
struct SnapshotFile {
    available_balance: f64,
    total_equity: f64,
    trigger_symbol: String,
    #[serde(default)]
    trigger_type: String,
    #[serde(default)]
    prices: HashMap<String, f64>,
    #[serde(default)]
    positions: HashMap<String, Position>,
}

impl From<SnapshotFile> for MarketSnapshot {
    fn from(file: SnapshotFile) -> Self {
        Self {
            available_balance: file.available_balance,
            total_equity: file.total_equity,
            trigger_symbol: file.trigger_symbol,
            trigger_type: file.trigger_type,
            prices: file.prices,
            positions: file.positions,
            data: Arc::new(EmptyDataProvider),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    let config = match AppConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}", TradingError::from(e));
            return ExitCode::from(2);
        }
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(Cli::parse(), &config).await {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::from(1),
        Err(e) => {
            error!("❌ {}", e);
            ExitCode::from(2)
        }
    }
}

/// Returns whether the command succeeded on its own terms.
async fn run(cli: Cli, config: &AppConfig) -> Result<bool, TradingError> {
    match cli.command {
        Commands::Validate { file } => {
            let source = fs::read_to_string(&file)?;
            let result = CodeValidator::new().validate(&source);
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(result.is_valid)
        }
        Commands::Execute {
            file,
            snapshot,
            params,
        } => {
            let source = fs::read_to_string(&file)?;
            let snapshot: SnapshotFile = serde_json::from_str(&fs::read_to_string(snapshot)?)?;
            let params = load_params(params.as_deref())?;

            let executor = SandboxExecutor::from(&config.sandbox);
            info!("🚀 Executing {} on {}", file.display(), snapshot.trigger_symbol);
            let result = executor
                .execute(&source, &MarketSnapshot::from(snapshot), &params)
                .await;
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(result.success)
        }
        Commands::Backtest {
            file,
            klines,
            symbol,
            period,
            params,
            output,
            initial_balance,
            fee_rate,
        } => {
            let source = fs::read_to_string(&file)?;
            let period = period.unwrap_or_else(|| config.backtest.period.clone());
            let series = load_klines(&klines, &symbol, &period)?;
            let params = load_params(params.as_deref())?;

            let mut settings = config.backtest.clone();
            if let Some(balance) = initial_balance {
                settings.initial_balance = balance;
            }
            if let Some(rate) = fee_rate {
                settings.fee_rate = rate;
            }
            let engine = BacktestEngine::from(&settings);

            info!("🚀 Backtesting {} on {} {}", file.display(), symbol, period);
            let result = engine.run(&source, &series, &symbol, &period, &params).await;

            let json = serde_json::to_string_pretty(&result)?;
            match output {
                Some(path) => {
                    fs::write(&path, json)?;
                    info!("💾 Result written to {}", path.display());
                }
                None => println!("{}", json),
            }
            Ok(result.success)
        }
    }
}

fn load_params(path: Option<&Path>) -> Result<StrategyParams, TradingError> {
    match path {
        Some(path) => Ok(serde_json::from_str(&fs::read_to_string(path)?)?),
        None => Ok(StrategyParams::new()),
    }
}

fn load_klines(path: &Path, symbol: &str, period: &str) -> Result<KlineSeries, TradingError> {
    let content = fs::read_to_string(path)?;
    Ok(match serde_json::from_str::<KlineFile>(&content)? {
        KlineFile::Series(series) => series,
        KlineFile::Bars(bars) => KlineSeries::from([(series_key(symbol, period), bars)]),
    })
}
