use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::backtest::{
    BALANCE_SAFETY_MARGIN, DEFAULT_FEE_RATE, DEFAULT_INITIAL_BALANCE, EVAL_TIMEOUT, MIN_BARS,
    TRIGGER_SIGNAL, WARMUP_BARS,
};
use crate::constants::events;
use crate::data::{HistoricalDataProvider, KlineSeries};
use crate::error::TradingError;
use crate::models::{
    ActionType, Decision, Kline, MarketSnapshot, Position, PositionSide, StrategyParams,
};
use crate::services::decision::validate_decision;
use crate::services::executor::SandboxExecutor;
use crate::services::validator::CodeValidator;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradeAction {
    Open,
    Close,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BacktestTrade {
    pub timestamp: i64,
    pub symbol: String,
    pub side: PositionSide,
    pub action: TradeAction,
    pub price: f64,
    pub size: f64,
    /// Gross realized P&L; always 0 for opens
    pub pnl: f64,
    pub fee: f64,
    pub reason: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub timestamp: i64,
    pub equity: f64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub success: bool,
    pub error: Option<String>,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub total_pnl: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: f64,
    pub total_fees: f64,
    pub final_equity: f64,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<BacktestTrade>,
}

impl BacktestResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::default()
        }
    }
}

/// Replays a strategy over historical bars with single-position accounting.
#[derive(Clone, Debug)]
pub struct BacktestEngine {
    initial_balance: f64,
    fee_rate: f64,
    warmup: usize,
    executor: SandboxExecutor,
}

impl Default for BacktestEngine {
    fn default() -> Self {
        Self::new(DEFAULT_INITIAL_BALANCE, DEFAULT_FEE_RATE)
    }
}

impl BacktestEngine {
    pub fn new(initial_balance: f64, fee_rate: f64) -> Self {
        Self {
            initial_balance,
            fee_rate,
            warmup: WARMUP_BARS,
            executor: SandboxExecutor::new(EVAL_TIMEOUT),
        }
    }

    /// Number of leading bars that are never evaluated.
    pub fn with_warmup(mut self, warmup: usize) -> Self {
        self.warmup = warmup;
        self
    }

    pub fn with_eval_timeout(mut self, timeout: Duration) -> Self {
        self.executor = SandboxExecutor::new(timeout);
        self
    }

    pub fn initial_balance(&self) -> f64 {
        self.initial_balance
    }

    pub fn fee_rate(&self) -> f64 {
        self.fee_rate
    }

    pub async fn run(
        &self,
        source: &str,
        klines: &KlineSeries,
        symbol: &str,
        period: &str,
        params: &StrategyParams,
    ) -> BacktestResult {
        let provider = HistoricalDataProvider::new(klines.clone());
        self.run_with_provider(source, provider, symbol, period, params)
            .await
    }

    /// Same as [`run`](Self::run) but over a provider that may carry
    /// precomputed indicator, flow and regime tables.
    pub async fn run_with_provider(
        &self,
        source: &str,
        mut provider: HistoricalDataProvider,
        symbol: &str,
        period: &str,
        params: &StrategyParams,
    ) -> BacktestResult {
        let bars: Vec<Kline> = match provider.series(symbol, period) {
            Some(series) => series.to_vec(),
            None => return BacktestResult::failed("No kline data provided"),
        };
        if bars.len() < MIN_BARS {
            return BacktestResult::failed("Insufficient kline data");
        }

        let (validation, program) = CodeValidator::new().analyze(source);
        let program = match program {
            Some(program) if validation.is_valid => Arc::new(program),
            _ => {
                let error = TradingError::Validation(validation.errors).to_string();
                warn!("🚫 [BACKTEST] {}", error);
                return BacktestResult::failed(error);
            }
        };

        info!(
            "📊 [BACKTEST] {} {} over {} bars ({} .. {}), balance ${:.2}",
            symbol,
            period,
            bars.len(),
            format_timestamp(bars[0].timestamp),
            format_timestamp(bars[bars.len() - 1].timestamp),
            self.initial_balance
        );

        let mut book = Book::new(self.initial_balance);

        for (index, bar) in bars.iter().enumerate().skip(self.warmup) {
            provider.advance_to(index);
            let price = bar.close;
            book.mark(price);

            let snapshot = MarketSnapshot {
                available_balance: book.balance,
                total_equity: book.equity(),
                trigger_symbol: symbol.to_string(),
                trigger_type: TRIGGER_SIGNAL.to_string(),
                prices: HashMap::from([(symbol.to_string(), price)]),
                positions: book.positions(),
                data: provider.view(),
            };

            let result = self
                .executor
                .execute_program(program.clone(), &snapshot, params)
                .await;
            let mut decision = match (result.success, result.decision) {
                (true, Some(decision)) => decision,
                _ => {
                    debug!(
                        "⏭️ [BACKTEST] Bar {} skipped: {}",
                        index,
                        result.error.as_deref().unwrap_or("no decision")
                    );
                    continue;
                }
            };
            if decision.symbol.is_empty() {
                decision.symbol = symbol.to_string();
            }

            let (valid, errors) = validate_decision(&decision, &snapshot.positions);
            if !valid {
                warn!(
                    event = events::DECISION_REJECTED,
                    "🚫 [BACKTEST] Bar {} decision rejected: {}",
                    index,
                    errors.join("; ")
                );
                continue;
            }

            if decision.symbol == symbol {
                self.apply(&mut book, &decision, bar);
            } else {
                debug!(
                    "⏭️ [BACKTEST] Ignoring decision for {} in a {} backtest",
                    decision.symbol, symbol
                );
            }

            book.record(bar.timestamp);
        }

        let result = summarize(book);
        info!(
            "🏁 [BACKTEST] {} closed trades, win rate {:.1}%, pnl ${:.2}, max drawdown {:.2}%, final equity ${:.2}",
            result.total_trades,
            result.win_rate * 100.0,
            result.total_pnl,
            result.max_drawdown * 100.0,
            result.final_equity
        );
        result
    }

    fn apply(&self, book: &mut Book, decision: &Decision, bar: &Kline) {
        let price = bar.close;
        match (decision.action(), book.position.is_some()) {
            (Some(ActionType::Buy), false) => self.open(book, decision, bar, PositionSide::Long),
            (Some(ActionType::Sell), false) => self.open(book, decision, bar, PositionSide::Short),
            (Some(ActionType::Close), true) => {
                let Some(position) = book.position.take() else {
                    return;
                };
                let pnl = position.pnl_at(price);
                let fee = position.size * price * self.fee_rate;
                book.balance += pnl - fee;
                book.fees += fee;
                info!(
                    event = events::POSITION_CLOSED,
                    "🔒 [BACKTEST] Closed {} {} {:.6} @ {:.4} pnl {:.2} fee {:.4}",
                    position.side,
                    position.symbol,
                    position.size,
                    price,
                    pnl,
                    fee
                );
                book.trades.push(BacktestTrade {
                    timestamp: bar.timestamp,
                    symbol: position.symbol,
                    side: position.side,
                    action: TradeAction::Close,
                    price,
                    size: position.size,
                    pnl,
                    fee,
                    reason: decision.reason.clone(),
                });
            }
            _ => {}
        }
    }

    fn open(&self, book: &mut Book, decision: &Decision, bar: &Kline, side: PositionSide) {
        let price = bar.close;
        let requested = decision
            .size_usd
            .unwrap_or(decision.target_portion_of_balance * book.balance);
        let notional = requested.min(book.balance * BALANCE_SAFETY_MARGIN);
        if notional <= 0.0 || price <= 0.0 {
            debug!(
                "⏭️ [BACKTEST] Nothing to open: notional {:.2} at price {:.4}",
                notional, price
            );
            return;
        }

        let size = notional / price;
        let fee = size * price * self.fee_rate;
        book.balance -= fee;
        book.fees += fee;

        info!(
            event = events::POSITION_OPENED,
            "📈 [BACKTEST] Opened {} {} {:.6} @ {:.4} ({}x) fee {:.4}",
            side,
            decision.symbol,
            size,
            price,
            decision.leverage,
            fee
        );
        book.position = Some(Position {
            symbol: decision.symbol.clone(),
            side,
            size,
            entry_price: price,
            unrealized_pnl: 0.0,
            leverage: decision.leverage,
            liquidation_price: liquidation_price(side, price, decision.leverage),
        });
        book.trades.push(BacktestTrade {
            timestamp: bar.timestamp,
            symbol: decision.symbol.clone(),
            side,
            action: TradeAction::Open,
            price,
            size,
            pnl: 0.0,
            fee,
            reason: decision.reason.clone(),
        });
    }
}

impl From<&crate::config::BacktestConfig> for BacktestEngine {
    fn from(config: &crate::config::BacktestConfig) -> Self {
        Self::new(config.initial_balance, config.fee_rate)
            .with_warmup(config.warmup_bars)
            .with_eval_timeout(Duration::from_millis(config.eval_timeout_ms))
    }
}

/// Price at which the position's margin would be wiped out. Recorded only;
/// the simulation never liquidates.
pub fn liquidation_price(side: PositionSide, entry: f64, leverage: i64) -> f64 {
    let leverage = leverage.max(1) as f64;
    match side {
        PositionSide::Long => entry * (1.0 - 1.0 / leverage),
        PositionSide::Short => entry * (1.0 + 1.0 / leverage),
    }
}

/// Mean over sample standard deviation of per-point equity returns.
pub fn sharpe_ratio(curve: &[EquityPoint]) -> f64 {
    let returns: Vec<f64> = curve
        .windows(2)
        .map(|w| {
            if w[0].equity == 0.0 {
                0.0
            } else {
                (w[1].equity - w[0].equity) / w[0].equity
            }
        })
        .collect();
    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();
    if std_dev == 0.0 || !std_dev.is_finite() {
        return 0.0;
    }
    mean / std_dev
}

fn format_timestamp(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

/// Running account state for one backtest.
struct Book {
    balance: f64,
    position: Option<Position>,
    trades: Vec<BacktestTrade>,
    curve: Vec<EquityPoint>,
    fees: f64,
    peak: f64,
    max_drawdown: f64,
}

impl Book {
    fn new(initial_balance: f64) -> Self {
        Self {
            balance: initial_balance,
            position: None,
            trades: Vec::new(),
            curve: Vec::new(),
            fees: 0.0,
            peak: initial_balance,
            max_drawdown: 0.0,
        }
    }

    fn mark(&mut self, price: f64) {
        if let Some(position) = self.position.as_mut() {
            position.mark_to_market(price);
        }
    }

    fn equity(&self) -> f64 {
        self.balance + self.position.as_ref().map_or(0.0, |p| p.unrealized_pnl)
    }

    fn positions(&self) -> HashMap<String, Position> {
        self.position
            .iter()
            .map(|p| (p.symbol.clone(), p.clone()))
            .collect()
    }

    fn record(&mut self, timestamp: i64) {
        let equity = self.equity();
        self.curve.push(EquityPoint { timestamp, equity });
        if equity > self.peak {
            self.peak = equity;
        }
        if self.peak > 0.0 {
            let drawdown = (self.peak - equity) / self.peak;
            if drawdown > self.max_drawdown {
                self.max_drawdown = drawdown;
            }
        }
    }
}

fn summarize(book: Book) -> BacktestResult {
    let final_equity = book.equity();
    let closes: Vec<&BacktestTrade> = book
        .trades
        .iter()
        .filter(|t| t.action == TradeAction::Close)
        .collect();
    let winning_trades = closes.iter().filter(|t| t.pnl > 0.0).count();
    let total_trades = closes.len();
    let win_rate = if total_trades == 0 {
        0.0
    } else {
        winning_trades as f64 / total_trades as f64
    };
    let total_pnl = closes.iter().map(|t| t.pnl).sum();

    BacktestResult {
        success: true,
        error: None,
        total_trades,
        winning_trades,
        losing_trades: total_trades - winning_trades,
        win_rate,
        total_pnl,
        max_drawdown: book.max_drawdown,
        sharpe_ratio: sharpe_ratio(&book.curve),
        total_fees: book.fees,
        final_equity,
        equity_curve: book.curve,
        trades: book.trades,
    }
}
