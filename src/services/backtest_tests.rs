//! Unit tests for the backtest engine - preconditions, accounting, metrics.

#[cfg(test)]
mod backtest_tests {
    use std::time::Duration;

    use crate::config::BacktestConfig;
    use crate::data::{series_key, KlineSeries};
    use crate::models::{Kline, PositionSide, StrategyParams};
    use crate::services::backtest::*;

    const HOLD: &str = r#"
class Hold {
    fn init(self, params) { }
    fn should_trade(self, data) { return Decision(operation: "hold"); }
}
"#;

    /// Long below 110, take profit at or above 110.
    const SWING_LONG: &str = r#"
class Swing {
    fn init(self, params) { }

    fn should_trade(self, data) {
        let sym = data.trigger_symbol;
        let price = data.prices[sym];
        if sym in data.positions {
            if price >= 110 {
                return Decision(operation: "close", target_portion_of_balance: 1.0,
                                min_price: price * 0.99, reason: "take profit");
            }
            return Decision(operation: "hold");
        }
        if price < 110 {
            return Decision(operation: "buy", target_portion_of_balance: 0.5,
                            leverage: 5, max_price: price * 1.01, reason: "entry");
        }
        return Decision(operation: "hold");
    }
}
"#;

    fn bar(i: usize, close: f64) -> Kline {
        Kline {
            timestamp: 1_700_000_000_000 + i as i64 * 300_000,
            open: close,
            high: close,
            low: close,
            close,
            volume: Some(1.0),
        }
    }

    fn series(closes: &[f64]) -> KlineSeries {
        let bars = closes.iter().enumerate().map(|(i, c)| bar(i, *c)).collect();
        KlineSeries::from([(series_key("BTC", "5m"), bars)])
    }

    /// 55 bars at `first`, then `second` to a total of `len`.
    fn step(first: f64, second: f64, len: usize) -> KlineSeries {
        let closes: Vec<f64> = (0..len).map(|i| if i < 55 { first } else { second }).collect();
        series(&closes)
    }

    async fn run(source: &str, klines: &KlineSeries) -> BacktestResult {
        BacktestEngine::default()
            .with_eval_timeout(Duration::from_secs(5))
            .run(source, klines, "BTC", "5m", &StrategyParams::new())
            .await
    }

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    // ============= Precondition Tests =============

    #[tokio::test]
    async fn test_missing_series() {
        let result = BacktestEngine::default()
            .run(HOLD, &series(&[100.0; 60]), "ETH", "5m", &StrategyParams::new())
            .await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("No kline data provided"));
    }

    #[tokio::test]
    async fn test_insufficient_bars() {
        let result = run(HOLD, &series(&[100.0; 9])).await;
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("Insufficient kline data"));
        assert!(result.equity_curve.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_source_aborts() {
        let source = format!("import os;\n{}", HOLD);
        let result = run(&source, &series(&[100.0; 60])).await;
        assert!(!result.success);
        assert_eq!(
            result.error.as_deref(),
            Some("Validation failed: Forbidden import: os (process control)")
        );
    }

    #[tokio::test]
    async fn test_fewer_bars_than_warmup_is_empty_success() {
        let result = run(SWING_LONG, &series(&[100.0; 30])).await;
        assert!(result.success);
        assert!(result.equity_curve.is_empty());
        assert!(result.trades.is_empty());
        assert_eq!(result.final_equity, 10_000.0);
    }

    // ============= Accounting Tests =============

    #[tokio::test]
    async fn test_always_hold_is_flat() {
        let result = run(HOLD, &series(&[100.0; 80])).await;

        assert!(result.success);
        assert_eq!(result.total_trades, 0);
        assert_eq!(result.total_pnl, 0.0);
        assert_eq!(result.total_fees, 0.0);
        assert_eq!(result.max_drawdown, 0.0);
        assert_eq!(result.sharpe_ratio, 0.0);
        assert_eq!(result.final_equity, 10_000.0);
        assert_eq!(result.equity_curve.len(), 30);
        assert!(result.equity_curve.iter().all(|p| p.equity == 10_000.0));
    }

    #[tokio::test]
    async fn test_open_then_close_on_rising_prices() {
        let result = run(SWING_LONG, &step(100.0, 120.0, 60)).await;
        assert!(result.success, "{:?}", result.error);

        assert_eq!(result.trades.len(), 2);
        let open = &result.trades[0];
        assert_eq!(open.action, TradeAction::Open);
        assert_eq!(open.side, PositionSide::Long);
        assert_eq!(open.price, 100.0);
        assert!(approx(open.size, 50.0));
        assert_eq!(open.pnl, 0.0);
        assert!(approx(open.fee, 3.0));
        assert_eq!(open.reason, "entry");

        let close = &result.trades[1];
        assert_eq!(close.action, TradeAction::Close);
        assert_eq!(close.price, 120.0);
        assert!(approx(close.pnl, (120.0 - 100.0) * 50.0));
        assert!(approx(close.fee, 3.6));
        assert_eq!(close.timestamp, bar(55, 0.0).timestamp);

        assert_eq!(result.total_trades, 1);
        assert_eq!(result.winning_trades, 1);
        assert_eq!(result.losing_trades, 0);
        assert_eq!(result.win_rate, 1.0);
        assert!(approx(result.total_pnl, 1_000.0));
        assert!(approx(result.total_fees, 6.6));
        // net balance change is gross pnl minus both fees
        assert!(approx(result.final_equity - 10_000.0, 1_000.0 - 3.0 - 3.6));
        assert!(approx(result.max_drawdown, 3.0 / 10_000.0));
        assert_eq!(result.equity_curve.len(), 10);
    }

    #[tokio::test]
    async fn test_short_round_trip_on_falling_prices() {
        let source = r#"
class Fade {
    fn init(self, params) { }
    fn should_trade(self, data) {
        let price = data.prices["BTC"];
        if len(data.positions) > 0 {
            if price <= 90 {
                return Decision(operation: "close", target_portion_of_balance: 1.0,
                                max_price: price * 1.01);
            }
            return Decision();
        }
        if price > 90 {
            return Decision(operation: "sell", target_portion_of_balance: 1.0,
                            min_price: price * 0.99);
        }
        return Decision();
    }
}
"#;
        let result = run(source, &step(100.0, 80.0, 60)).await;
        assert!(result.success, "{:?}", result.error);

        assert_eq!(result.trades[0].side, PositionSide::Short);
        // full portion is capped at 95% of the balance
        assert!(approx(result.trades[0].size, 9_500.0 / 100.0));
        assert!(approx(result.trades[1].pnl, 20.0 * 95.0));
        assert_eq!(result.winning_trades, 1);
    }

    #[tokio::test]
    async fn test_open_position_is_marked_to_market() {
        let source = SWING_LONG.replace("price >= 110", "price >= 1000");
        let result = run(&source, &step(100.0, 90.0, 60)).await;

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.total_trades, 0);
        let last = result.equity_curve.last().unwrap();
        // balance minus the entry fee plus the unrealized loss
        assert!(approx(last.equity, 10_000.0 - 3.0 - 10.0 * 50.0));
        assert!(approx(result.final_equity, last.equity));
        assert!(approx(result.max_drawdown, 503.0 / 10_000.0));
    }

    #[tokio::test]
    async fn test_size_usd_overrides_portion() {
        let source = SWING_LONG.replace("leverage: 5,", "leverage: 5, size_usd: 2000,");
        let result = run(&source, &step(100.0, 120.0, 60)).await;
        assert!(approx(result.trades[0].size, 20.0));
    }

    #[test]
    fn test_liquidation_price() {
        assert!(approx(liquidation_price(PositionSide::Long, 100.0, 5), 80.0));
        assert!(approx(liquidation_price(PositionSide::Short, 100.0, 4), 125.0));
        assert!(approx(liquidation_price(PositionSide::Long, 100.0, 0), 0.0));
    }

    // ============= Skip Tests =============

    #[tokio::test]
    async fn test_faulting_bars_are_skipped() {
        let source = r#"
class Broken {
    fn init(self, params) { }
    fn should_trade(self, data) { return 1 / 0; }
}
"#;
        let result = run(source, &series(&[100.0; 60])).await;
        assert!(result.success);
        assert!(result.trades.is_empty());
        assert!(result.equity_curve.is_empty());
        assert_eq!(result.final_equity, 10_000.0);
    }

    #[tokio::test]
    async fn test_semantically_invalid_decisions_are_skipped() {
        let source = SWING_LONG.replace(", max_price: price * 1.01", "");
        let result = run(&source, &step(100.0, 120.0, 60)).await;
        assert!(result.success);
        assert!(result.trades.is_empty());
        // skipped bars record nothing; held bars after the jump still do
        assert_eq!(result.equity_curve.len(), 5);
    }

    #[tokio::test]
    async fn test_decision_for_other_symbol_is_ignored() {
        let source = SWING_LONG.replace("reason: \"entry\"", "reason: \"entry\", symbol: \"ETH\"");
        let result = run(&source, &step(100.0, 120.0, 60)).await;
        assert!(result.trades.is_empty());
        assert_eq!(result.equity_curve.len(), 10);
    }

    // ============= Lookahead Tests =============

    #[tokio::test]
    async fn test_strategy_sees_only_bars_up_to_current() {
        let source = r#"
class Peek {
    fn init(self, params) { }
    fn should_trade(self, data) {
        let bars = data.get_klines("BTC", "5m", 1000);
        let last = bars[len(bars) - 1];
        return Decision(operation: "buy", target_portion_of_balance: 0.1,
                        max_price: last.close, reason: str(len(bars)) + "@" + str(last.close));
    }
}
"#;
        let closes: Vec<f64> = (0..70).map(|i| 100.0 + i as f64).collect();
        let result = run(source, &series(&closes)).await;

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].reason, "51@150.0");
        assert_eq!(result.trades[0].price, 150.0);
    }

    // ============= Metric Tests =============

    #[test]
    fn test_sharpe_ratio() {
        let curve = |values: &[f64]| -> Vec<EquityPoint> {
            values
                .iter()
                .enumerate()
                .map(|(i, e)| EquityPoint {
                    timestamp: i as i64,
                    equity: *e,
                })
                .collect()
        };

        assert_eq!(sharpe_ratio(&curve(&[])), 0.0);
        assert_eq!(sharpe_ratio(&curve(&[100.0, 110.0])), 0.0);
        assert_eq!(sharpe_ratio(&curve(&[100.0, 100.0, 100.0])), 0.0);

        let ratio = sharpe_ratio(&curve(&[100.0, 110.0, 104.5]));
        let expected = 0.025 / (2.0 * 0.075f64.powi(2)).sqrt();
        assert!((ratio - expected).abs() < 1e-9, "{}", ratio);
    }

    #[test]
    fn test_engine_from_config() {
        let config = BacktestConfig {
            initial_balance: 500.0,
            fee_rate: 0.001,
            ..BacktestConfig::default()
        };
        let engine = BacktestEngine::from(&config);
        assert_eq!(engine.initial_balance(), 500.0);
        assert_eq!(engine.fee_rate(), 0.001);
    }

    #[test]
    fn test_result_serializes_lowercase_enums() {
        let trade = BacktestTrade {
            timestamp: 1,
            symbol: "BTC".to_string(),
            side: PositionSide::Short,
            action: TradeAction::Open,
            price: 1.0,
            size: 1.0,
            pnl: 0.0,
            fee: 0.0,
            reason: String::new(),
        };
        let json = serde_json::to_value(&trade).unwrap();
        assert_eq!(json["side"], "short");
        assert_eq!(json["action"], "open");
    }
}
