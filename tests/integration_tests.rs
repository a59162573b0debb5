//! Integration tests for the program trader.
//! These tests drive the public API end to end: validation, sandboxed
//! execution and the backtest replay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use program_trader::data::{series_key, EmptyDataProvider, HistoricalDataProvider, IndicatorKey, KlineSeries};
use program_trader::models::{Kline, MarketSnapshot, ParamValue, Position, PositionSide, RegimeInfo, StrategyParams};
use program_trader::services::backtest::{BacktestEngine, TradeAction};
use program_trader::{validate_strategy_code, SandboxExecutor};

const MOMENTUM: &str = include_str!("../demos/strategies/momentum.strat");

fn bars(closes: &[f64]) -> Vec<Kline> {
    closes
        .iter()
        .enumerate()
        .map(|(i, close)| Kline {
            timestamp: 1_704_067_200_000 + i as i64 * 300_000,
            open: *close,
            high: close * 1.001,
            low: close * 0.999,
            close: *close,
            volume: Some(10.0),
        })
        .collect()
}

/// Flat, then a steady rally, then a slide.
fn trend_series() -> Vec<f64> {
    let mut closes = vec![100.0; 60];
    closes.extend((1..=40).map(|i| 100.0 + i as f64 * 0.5));
    closes.extend((1..=40).map(|i| 120.0 - i as f64 * 0.6));
    closes
}

fn klines(closes: &[f64]) -> KlineSeries {
    KlineSeries::from([(series_key("BTC", "5m"), bars(closes))])
}

/// Test that the bundled demo strategy passes validation cleanly
#[test]
fn test_demo_strategy_is_valid() {
    let result = validate_strategy_code(MOMENTUM);
    assert!(result.is_valid, "{:?}", result.errors);
    assert!(result.warnings.is_empty());
}

/// Test the complete flow from historical bars to backtest metrics
#[tokio::test]
async fn test_demo_strategy_backtest() {
    let closes = trend_series();
    let result = BacktestEngine::default()
        .run(MOMENTUM, &klines(&closes), "BTC", "5m", &StrategyParams::new())
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.equity_curve.len(), closes.len() - 50);
    assert!(!result.trades.is_empty(), "the rally should trigger an entry");
    assert_eq!(result.trades[0].action, TradeAction::Open);
    assert_eq!(result.trades[0].side, PositionSide::Long);
    assert!(result.trades[0].reason.starts_with("breakout"));

    // trades alternate open/close on the single position slot
    for (i, trade) in result.trades.iter().enumerate() {
        let expected = if i % 2 == 0 { TradeAction::Open } else { TradeAction::Close };
        assert_eq!(trade.action, expected);
    }

    let closed: Vec<_> = result.trades.iter().filter(|t| t.action == TradeAction::Close).collect();
    assert_eq!(result.total_trades, closed.len());
    assert_eq!(result.winning_trades + result.losing_trades, result.total_trades);
    let pnl: f64 = closed.iter().map(|t| t.pnl).sum();
    assert!((result.total_pnl - pnl).abs() < 1e-9);
    let fees: f64 = result.trades.iter().map(|t| t.fee).sum();
    assert!((result.total_fees - fees).abs() < 1e-9);

    let mut peak: f64 = 10_000.0;
    let mut worst: f64 = 0.0;
    for point in &result.equity_curve {
        peak = peak.max(point.equity);
        worst = worst.max((peak - point.equity) / peak);
    }
    assert!((result.max_drawdown - worst).abs() < 1e-12);
    assert_eq!(result.final_equity, result.equity_curve.last().unwrap().equity);
}

/// Test that strategy parameters change behaviour through init
#[tokio::test]
async fn test_params_flow_into_backtest() {
    let closes = trend_series();
    let params = StrategyParams::from([("threshold".to_string(), ParamValue::Float(10.0))]);
    let result = BacktestEngine::default()
        .run(MOMENTUM, &klines(&closes), "BTC", "5m", &params)
        .await;

    assert!(result.success);
    assert!(result.trades.is_empty(), "a 1000% threshold never triggers");
}

/// Test that precomputed indicator and regime tables reach the strategy at the right bar
#[tokio::test]
async fn test_indicator_tables_through_provider() {
    let source = r#"
class Oversold {
    fn init(self, params) { }
    fn should_trade(self, data) {
        let sym = data.trigger_symbol;
        let rsi = data.get_indicator(sym, "rsi", "5m");
        let regime = data.get_regime(sym, "5m");
        let change = data.get_price_change(sym, "5m");
        if len(data.positions) == 0 and rsi.get("value", 50) < 30 and regime.regime == "trend" {
            return Decision(operation: "buy", target_portion_of_balance: 0.2,
                            max_price: data.prices[sym] * 1.01,
                            reason: str(round(change.change_percent, 2)));
        }
        return Decision(operation: "hold");
    }
}
"#;
    let mut closes = vec![100.0; 60];
    closes[54] = 98.0;
    let provider = HistoricalDataProvider::new(klines(&closes))
        .with_values(
            IndicatorKey::new("BTC", "rsi", "5m", 53),
            HashMap::from([("value".to_string(), 20.0)]),
        )
        .with_values(
            IndicatorKey::new("BTC", "rsi", "5m", 54),
            HashMap::from([("value".to_string(), 25.0)]),
        )
        .with_regime("BTC", "5m", 54, RegimeInfo { regime: "trend".to_string(), conf: 0.8 });

    let result = BacktestEngine::default()
        .run_with_provider(source, provider, "BTC", "5m", &StrategyParams::new())
        .await;

    assert!(result.success, "{:?}", result.error);
    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.timestamp, bars(&closes)[54].timestamp);
    assert_eq!(trade.price, 98.0);
    assert_eq!(trade.reason, "-2.0");
}

/// Test that a runaway strategy costs a bounded amount of time per bar
#[tokio::test]
async fn test_runaway_strategy_is_cut_off_every_bar() {
    let source = r#"
class Spin {
    fn init(self, params) { }
    fn should_trade(self, data) {
        while true { }
        return Decision();
    }
}
"#;
    let started = std::time::Instant::now();
    let result = BacktestEngine::default()
        .with_warmup(45)
        .with_eval_timeout(Duration::from_millis(50))
        .run(source, &klines(&[100.0; 50]), "BTC", "5m", &StrategyParams::new())
        .await;

    assert!(result.success);
    assert!(result.equity_curve.is_empty());
    assert!(result.trades.is_empty());
    assert!(started.elapsed() < Duration::from_secs(10));
}

/// Test a live-style evaluation of the demo strategy against an open position
#[tokio::test]
async fn test_demo_strategy_exits_on_take_profit() {
    let snapshot = MarketSnapshot {
        available_balance: 5_000.0,
        total_equity: 5_250.0,
        trigger_symbol: "BTC".to_string(),
        trigger_type: "price_cross".to_string(),
        prices: HashMap::from([("BTC".to_string(), 105.0)]),
        positions: HashMap::from([(
            "BTC".to_string(),
            Position {
                symbol: "BTC".to_string(),
                side: PositionSide::Long,
                size: 50.0,
                entry_price: 100.0,
                unrealized_pnl: 250.0,
                leverage: 2,
                liquidation_price: 50.0,
            },
        )]),
        data: Arc::new(EmptyDataProvider),
    };

    let result = SandboxExecutor::default()
        .execute(MOMENTUM, &snapshot, &StrategyParams::new())
        .await;

    assert!(result.success, "{:?}", result.error);
    let decision = result.decision.unwrap();
    assert_eq!(decision.operation, "close");
    assert_eq!(decision.reason, "exit long");
    assert_eq!(decision.min_price, Some(105.0 * 0.995));
    assert_eq!(result.logs, vec!["exit BTC move 5.0"]);
}
