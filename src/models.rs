use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::constants::decision::{DEFAULT_EXECUTION_MODE, DEFAULT_TIME_IN_FORCE};
use crate::data::provider::DataProvider;

/// Parameters handed to a strategy's `init` hook.
pub type StrategyParams = HashMap<String, ParamValue>;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Buy,
    Sell,
    Hold,
    Close,
}

impl ActionType {
    pub const ALL: [ActionType; 4] = [
        ActionType::Buy,
        ActionType::Sell,
        ActionType::Hold,
        ActionType::Close,
    ];

    /// Case-insensitive parse of a decision operation.
    pub fn from_operation(op: &str) -> Option<Self> {
        match op.trim().to_lowercase().as_str() {
            "buy" => Some(ActionType::Buy),
            "sell" => Some(ActionType::Sell),
            "hold" => Some(ActionType::Hold),
            "close" => Some(ActionType::Close),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ActionType::Buy => "buy",
            ActionType::Sell => "sell",
            ActionType::Hold => "hold",
            ActionType::Close => "close",
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured trading instruction returned by `should_trade`.
///
/// `operation` and the enumerated string fields stay as text: a strategy can
/// return anything, and rejecting bad values is the job of
/// [`validate_decision`](crate::services::decision::validate_decision).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub operation: String,
    pub symbol: String,
    pub target_portion_of_balance: f64,
    pub leverage: i64,
    pub max_price: Option<f64>,
    pub min_price: Option<f64>,
    pub time_in_force: String,
    pub tp_execution: String,
    pub sl_execution: String,
    pub reason: String,
    /// Explicit notional override; when absent the portion of balance is used.
    pub size_usd: Option<f64>,
}

impl Default for Decision {
    fn default() -> Self {
        Self {
            operation: ActionType::Hold.as_str().to_string(),
            symbol: String::new(),
            target_portion_of_balance: 0.0,
            leverage: 1,
            max_price: None,
            min_price: None,
            time_in_force: DEFAULT_TIME_IN_FORCE.to_string(),
            tp_execution: DEFAULT_EXECUTION_MODE.to_string(),
            sl_execution: DEFAULT_EXECUTION_MODE.to_string(),
            reason: String::new(),
            size_usd: None,
        }
    }
}

impl Decision {
    pub fn hold(symbol: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            ..Self::default()
        }
    }

    pub fn action(&self) -> Option<ActionType> {
        ActionType::from_operation(&self.operation)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PositionSide {
    Long,
    Short,
}

impl PositionSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionSide::Long => "long",
            PositionSide::Short => "short",
        }
    }
}

impl fmt::Display for PositionSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: i64,
    pub liquidation_price: f64,
}

impl Position {
    /// P&L of the whole position if it were closed at `price`.
    pub fn pnl_at(&self, price: f64) -> f64 {
        match self.side {
            PositionSide::Long => (price - self.entry_price) * self.size,
            PositionSide::Short => (self.entry_price - price) * self.size,
        }
    }

    pub fn mark_to_market(&mut self, price: f64) {
        self.unrealized_pnl = self.pnl_at(price);
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    /// Bar open time, epoch milliseconds
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    #[serde(default)]
    pub volume: Option<f64>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RegimeInfo {
    pub regime: String,
    pub conf: f64,
}

impl Default for RegimeInfo {
    fn default() -> Self {
        Self {
            regime: "noise".to_string(),
            conf: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub change_percent: f64,
    pub change_usd: f64,
}

/// Point-in-time view handed to one strategy evaluation.
#[derive(Clone)]
pub struct MarketSnapshot {
    pub available_balance: f64,
    pub total_equity: f64,
    pub trigger_symbol: String,
    pub trigger_type: String,
    pub prices: HashMap<String, f64>,
    pub positions: HashMap<String, Position>,
    pub data: Arc<dyn DataProvider>,
}

impl fmt::Debug for MarketSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketSnapshot")
            .field("available_balance", &self.available_balance)
            .field("total_equity", &self.total_equity)
            .field("trigger_symbol", &self.trigger_symbol)
            .field("trigger_type", &self.trigger_type)
            .field("prices", &self.prices)
            .field("positions", &self.positions)
            .finish_non_exhaustive()
    }
}
