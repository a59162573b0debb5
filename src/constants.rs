//! Application-wide constants and magic numbers
//!
//! This module centralizes the tuning values shared by the sandbox,
//! the decision rules and the backtest engine.

use std::time::Duration;

/// Sandbox execution limits
pub mod sandbox {
    use super::*;

    /// Default wall-clock budget for one strategy evaluation
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

    /// How long the controller waits for a cancelled worker to wind down
    pub const TEARDOWN_GRACE: Duration = Duration::from_millis(500);

    /// Maximum nesting of script function/method calls
    pub const MAX_CALL_DEPTH: usize = 64;

    /// Largest list `range()` may materialize
    pub const MAX_RANGE_LEN: i64 = 100_000;

    /// Largest list (items) or string (bytes) a script may build
    pub const MAX_COLLECTION_LEN: usize = 1_000_000;

    /// The deadline is read from the clock once every this many steps
    pub const DEADLINE_CHECK_INTERVAL: u64 = 64;

    /// Lines kept in one evaluation's log buffer; later lines are dropped
    pub const MAX_LOG_LINES: usize = 1_000;
}

/// Decision business rules
pub mod decision {
    pub const MIN_PORTION: f64 = 0.1;
    pub const MAX_PORTION: f64 = 1.0;
    pub const MIN_LEVERAGE: i64 = 1;
    pub const MAX_LEVERAGE: i64 = 50;

    pub const TIME_IN_FORCE: [&str; 3] = ["Ioc", "Gtc", "Alo"];
    pub const EXECUTION_MODES: [&str; 2] = ["market", "limit"];

    pub const DEFAULT_TIME_IN_FORCE: &str = "Ioc";
    pub const DEFAULT_EXECUTION_MODE: &str = "limit";
}

/// Backtest simulation
pub mod backtest {
    use super::*;

    /// Bars skipped before the first evaluation so history lookups are populated
    pub const WARMUP_BARS: usize = 50;

    /// Fewer bars than this aborts the run
    pub const MIN_BARS: usize = 10;

    /// Taker fee (0.06%)
    pub const DEFAULT_FEE_RATE: f64 = 0.0006;

    pub const DEFAULT_INITIAL_BALANCE: f64 = 10_000.0;

    /// Never commit more than 95% of the free balance to one entry
    pub const BALANCE_SAFETY_MARGIN: f64 = 0.95;

    /// Per-bar evaluation budget
    pub const EVAL_TIMEOUT: Duration = Duration::from_secs(2);

    pub const DEFAULT_PERIOD: &str = "5m";

    /// Default number of bars returned by `get_klines`
    pub const DEFAULT_KLINE_COUNT: usize = 50;

    pub const TRIGGER_SIGNAL: &str = "signal";
}

/// Logging event names for structured logging
pub mod events {
    pub const POSITION_OPENED: &str = "position_opened";
    pub const POSITION_CLOSED: &str = "position_closed";
    pub const EVALUATION_TIMEOUT: &str = "evaluation_timeout";
    pub const DECISION_REJECTED: &str = "decision_rejected";
    pub const ORDER_ROUTED: &str = "order_routed";
}
