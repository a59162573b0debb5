//! Program Trader - sandboxed execution and backtesting of user trading strategies
//!
//! Strategies are small programs in a restricted scripting language. They are
//! statically screened, run against market snapshots under a hard deadline,
//! and replayed over historical bars for performance statistics.

pub mod config;
pub mod constants;
pub mod data;
pub mod error;
pub mod exchange;
pub mod models;
pub mod sandbox;
pub mod services;

// Re-export commonly used types
pub use config::AppConfig;
pub use error::{ScriptError, ScriptFault, TradingError};
pub use models::{Decision, MarketSnapshot, Position, StrategyParams};
pub use services::backtest::{BacktestEngine, BacktestResult};
pub use services::decision::validate_decision;
pub use services::executor::{ExecutionResult, SandboxExecutor};
pub use services::live::{LiveOutcome, LiveTrader};
pub use services::validator::{validate_strategy_code, CodeValidator, ValidationResult};
