//! Unit tests for the strategy interpreter - semantics, capability limits, cancellation.

#[cfg(test)]
mod interpreter_tests {
    use std::collections::HashMap;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::time::{Duration, Instant};

    use crate::constants::sandbox::MAX_COLLECTION_LEN;
    use crate::data::provider::{series_key, EmptyDataProvider, HistoricalDataProvider};
    use crate::error::{ScriptError, ScriptFault};
    use crate::models::{
        Decision, Kline, MarketSnapshot, ParamValue, Position, PositionSide, StrategyParams,
    };
    use crate::sandbox::{parse, Budget, LogBuffer, ScriptStrategy, Strategy};

    fn snapshot() -> MarketSnapshot {
        let mut prices = HashMap::new();
        prices.insert("BTC".to_string(), 100.0);
        prices.insert("ETH".to_string(), 10.0);
        MarketSnapshot {
            available_balance: 1_000.0,
            total_equity: 1_200.0,
            trigger_symbol: "BTC".to_string(),
            trigger_type: "signal".to_string(),
            prices,
            positions: HashMap::new(),
            data: Arc::new(EmptyDataProvider),
        }
    }

    fn strategy_with(body: &str) -> String {
        format!(
            "class T {{\n    fn should_trade(self, data) {{\n{}\n    }}\n}}\n",
            body
        )
    }

    fn load(source: &str, budget: Budget, logs: LogBuffer) -> Result<ScriptStrategy, ScriptFault> {
        let program = parse(source).expect("source parses");
        ScriptStrategy::load(&program, budget, logs)
    }

    fn decide_on(source: &str, snap: &MarketSnapshot) -> Result<Decision, ScriptFault> {
        let mut strategy = load(source, Budget::unlimited(), LogBuffer::default())?;
        strategy.init(&StrategyParams::new())?;
        strategy.should_trade(snap)
    }

    fn decide(source: &str) -> Result<Decision, ScriptFault> {
        decide_on(source, &snapshot())
    }

    /// Evaluate `expr` inside `should_trade` and return its `str()` form.
    fn eval_str(expr: &str) -> String {
        let source = strategy_with(&format!("return Decision(reason: str({}));", expr));
        decide(&source).expect("evaluates").reason
    }

    fn eval_err(body: &str) -> ScriptError {
        decide(&strategy_with(body)).unwrap_err().error
    }

    // ============= Arithmetic & operators =============

    #[test]
    fn test_arithmetic_precedence_and_division() {
        assert_eq!(eval_str("1 + 2 * 3"), "7");
        assert_eq!(eval_str("7 / 2"), "3.5");
        assert_eq!(eval_str("6 / 3"), "2.0");
        assert_eq!(eval_str("(1 + 2) * 3"), "9");
        assert_eq!(eval_str("2 * 1.5"), "3.0");
    }

    #[test]
    fn test_remainder_takes_sign_of_divisor() {
        assert_eq!(eval_str("7 % 3"), "1");
        assert_eq!(eval_str("-7 % 3"), "2");
        assert_eq!(eval_str("7 % -3"), "-2");
    }

    #[test]
    fn test_integer_overflow_is_a_fault() {
        assert_eq!(eval_err("return 9223372036854775807 + 1;"), ScriptError::IntegerOverflow);
    }

    #[test]
    fn test_division_by_zero_reports_line() {
        let fault = decide(&strategy_with("let a = 1;\nlet b = a / 0;\nreturn Decision();")).unwrap_err();
        assert_eq!(fault.error, ScriptError::DivisionByZero);
        assert_eq!(fault.line, 4);
        assert_eq!(fault.to_string().lines().next(), Some("line 4: division by zero"));
    }

    #[test]
    fn test_type_mismatch() {
        let err = eval_err("return 1 + \"a\";");
        assert!(matches!(err, ScriptError::TypeMismatch(msg) if msg.contains("'int' and 'str'")));
    }

    #[test]
    fn test_strings_and_membership() {
        assert_eq!(eval_str("\"ab\" + \"cd\""), "abcd");
        assert_eq!(eval_str("\"BT\" in \"BTC\""), "true");
        assert_eq!(eval_str("2 in [1, 2, 3]"), "true");
        assert_eq!(eval_str("\"x\" in {\"y\": 1}"), "false");
        assert_eq!(eval_str("\"btc\".upper()"), "BTC");
        assert_eq!(eval_str("\"BTCUSD\".startswith(\"BTC\")"), "true");
    }

    #[test]
    fn test_logical_operators_short_circuit() {
        assert_eq!(eval_str("none or \"fallback\""), "fallback");
        assert_eq!(eval_str("0 and 1 / 0"), "0");
        assert_eq!(eval_str("not []"), "true");
        assert_eq!(eval_str("1 < 2 and 2 <= 2"), "true");
    }

    #[test]
    fn test_int_float_equality() {
        assert_eq!(eval_str("1 == 1.0"), "true");
        assert_eq!(eval_str("[1, 2] == [1, 2]"), "true");
        assert_eq!(eval_str("1 != 2"), "true");
    }

    // ============= Collections =============

    #[test]
    fn test_list_operations() {
        let body = r#"
        let xs = [3, 1, 2];
        xs.append(5);
        let last = xs.pop();
        xs[0] = 10;
        xs[-1] += 1;
        return Decision(reason: str([xs, last, len(xs), xs.contains(10)]));
        "#;
        assert_eq!(decide(&strategy_with(body)).unwrap().reason, "[[10, 1, 3], 5, 3, true]");
    }

    #[test]
    fn test_index_out_of_range() {
        assert_eq!(
            eval_err("let xs = [1];\nreturn xs[3];"),
            ScriptError::IndexOutOfRange { index: 3, len: 1 }
        );
    }

    #[test]
    fn test_dict_operations() {
        let body = r#"
        let d = {"b": 2, "a": 1};
        d["c"] = 3;
        d["a"] += 10;
        let total = 0;
        for k, v in d.items() {
            total += v;
        }
        return Decision(reason: str([d.keys(), d.get("zz", -1), total]));
        "#;
        assert_eq!(
            decide(&strategy_with(body)).unwrap().reason,
            "[[\"a\", \"b\", \"c\"], -1, 16]"
        );
    }

    #[test]
    fn test_missing_dict_key() {
        assert_eq!(
            eval_err("let d = {};\nreturn d[\"nope\"];"),
            ScriptError::KeyNotFound("\"nope\"".to_string())
        );
    }

    #[test]
    fn test_builtins() {
        assert_eq!(eval_str("sum([1, 2, 3])"), "6");
        assert_eq!(eval_str("min(4, 2, 8)"), "2");
        assert_eq!(eval_str("max([1.5, 3.5])"), "3.5");
        assert_eq!(eval_str("abs(-3)"), "3");
        assert_eq!(eval_str("round(2.567, 2)"), "2.57");
        assert_eq!(eval_str("round(2.5)"), "3");
        assert_eq!(eval_str("int(\"42\") + int(3.9)"), "45");
        assert_eq!(eval_str("float(\"1.5\")"), "1.5");
        assert_eq!(eval_str("sorted([3, 1, 2], reverse: true)"), "[3, 2, 1]");
        assert_eq!(eval_str("list(reversed(range(3)))"), "[2, 1, 0]");
        assert_eq!(eval_str("range(0, 10, 3)"), "[0, 3, 6, 9]");
        assert_eq!(eval_str("enumerate([\"a\"], 1)"), "[[1, \"a\"]]");
        assert_eq!(eval_str("zip([1, 2], [3])"), "[[1, 3]]");
        assert_eq!(eval_str("any([0, 1]) and not all([0, 1])"), "true");
        assert_eq!(eval_str("type(1.0)"), "float");
        assert_eq!(eval_str("dict(a: 1)"), "{\"a\": 1}");
    }

    #[test]
    fn test_doubling_string_hits_size_limit() {
        let err = eval_err("let s = \"x\";\nfor i in range(27) { s = s + s; }\nreturn Decision();");
        assert_eq!(err, ScriptError::SizeLimit { kind: "string", limit: MAX_COLLECTION_LEN });
    }

    #[test]
    fn test_doubling_list_hits_size_limit() {
        let err = eval_err("let l = [0];\nfor i in range(30) { l = l + l; }\nreturn Decision();");
        assert_eq!(err, ScriptError::SizeLimit { kind: "list", limit: MAX_COLLECTION_LEN });
    }

    #[test]
    fn test_self_referencing_list_renders_bounded() {
        let source = strategy_with(
            "let l = [];\nfor i in range(50) { l.append(l); }\nreturn Decision(reason: str(l));",
        );
        let reason = decide(&source).expect("evaluates").reason;
        assert!(reason.starts_with("[["));
        assert!(reason.len() < 2 * MAX_COLLECTION_LEN);
    }

    #[test]
    fn test_range_is_capped() {
        assert!(matches!(eval_err("let r = range(1000000);\nreturn r;"), ScriptError::InvalidValue(_)));
    }

    #[test]
    fn test_math_module() {
        let source = "import math;\nfrom math import floor;\n".to_string()
            + &strategy_with("return Decision(reason: str([math.sqrt(16), floor(2.7), math.pow(2, 3)]));");
        assert_eq!(decide(&source).unwrap().reason, "[4.0, 2, 8.0]");
    }

    #[test]
    fn test_math_domain_error() {
        let source = "import math;\n".to_string() + &strategy_with("return math.sqrt(-1);");
        assert!(matches!(decide(&source).unwrap_err().error, ScriptError::InvalidValue(msg) if msg == "math domain error"));
    }

    // ============= Control flow & scope =============

    #[test]
    fn test_loops_with_break_and_continue() {
        let body = r#"
        let total = 0;
        let i = 0;
        while true {
            i += 1;
            if i > 10 { break; }
            if i % 2 == 0 { continue; }
            total += i;
        }
        return Decision(reason: str(total));
        "#;
        assert_eq!(decide(&strategy_with(body)).unwrap().reason, "25");
    }

    #[test]
    fn test_break_outside_loop() {
        assert_eq!(
            eval_err("break;"),
            ScriptError::LoopControlOutsideLoop("break".to_string())
        );
    }

    #[test]
    fn test_assignment_requires_let() {
        assert_eq!(
            eval_err("x = 1;\nreturn Decision();"),
            ScriptError::UndeclaredAssignment("x".to_string())
        );
    }

    #[test]
    fn test_functions_and_constants() {
        let source = r#"
let THRESHOLD = 0.5;

fn pct(a, b) { return (a - b) / b; }

class T {
    fn should_trade(self, data) {
        if pct(b: 100, a: 160) > THRESHOLD {
            return Decision(operation: "buy", reason: "up");
        }
        return Decision();
    }
}
"#;
        assert_eq!(decide(source).unwrap().reason, "up");
    }

    #[test]
    fn test_recursion_limit() {
        let source = "fn down(n) { return down(n + 1); }\n".to_string()
            + &strategy_with("return down(0);");
        let fault = decide(&source).unwrap_err();
        assert_eq!(fault.error, ScriptError::RecursionLimit(64));
    }

    #[test]
    fn test_traceback_names_frames() {
        let source = r#"
class T {
    fn helper(self, x) {
        return x / 0;
    }

    fn should_trade(self, data) {
        return self.helper(1);
    }
}
"#;
        let fault = decide(source).unwrap_err();
        assert_eq!(fault.error, ScriptError::DivisionByZero);
        assert_eq!(
            fault.trace,
            vec![
                "in T.should_trade (line 8)".to_string(),
                "in T.helper (line 4)".to_string()
            ]
        );
    }

    // ============= Capability limits =============

    #[test]
    fn test_forbidden_names_do_not_resolve() {
        assert_eq!(eval_err("return eval(\"1\");"), ScriptError::UndefinedName("eval".to_string()));
        assert_eq!(eval_err("return open(\"f\");"), ScriptError::UndefinedName("open".to_string()));
    }

    #[test]
    fn test_unlisted_import_is_unavailable_at_load() {
        let source = "import os;\n".to_string() + &strategy_with("return Decision();");
        let fault = decide(&source).unwrap_err();
        assert_eq!(fault.error, ScriptError::Unavailable("os".to_string()));
        assert_eq!(fault.line, 1);
    }

    #[test]
    fn test_snapshot_is_read_only() {
        assert!(matches!(
            eval_err("data.available_balance = 0;"),
            ScriptError::ReadOnlyAttribute { .. }
        ));
    }

    #[test]
    fn test_no_reflection_attributes() {
        assert!(matches!(
            eval_err("return self.__class__;"),
            ScriptError::NoAttribute { .. }
        ));
    }

    // ============= Strategy protocol =============

    #[test]
    fn test_decision_keyword_construction() {
        let body = r#"
        let d = Decision(action: ActionType.BUY, symbol: "BTC", target_portion_of_balance: 0.5,
                         leverage: 3, max_price: 101, reason: "breakout");
        d.time_in_force = "Gtc";
        return d;
        "#;
        let decision = decide(&strategy_with(body)).unwrap();
        assert_eq!(decision.operation, "buy");
        assert_eq!(decision.symbol, "BTC");
        assert_eq!(decision.target_portion_of_balance, 0.5);
        assert_eq!(decision.leverage, 3);
        assert_eq!(decision.max_price, Some(101.0));
        assert_eq!(decision.min_price, None);
        assert_eq!(decision.time_in_force, "Gtc");
        assert_eq!(decision.tp_execution, "limit");
    }

    #[test]
    fn test_decision_rejects_positional_and_unknown_arguments() {
        assert!(matches!(eval_err("return Decision(\"buy\");"), ScriptError::BadArguments { .. }));
        let err = eval_err("return Decision(colour: \"red\");");
        assert_eq!(
            err.to_string(),
            "Decision() got an unexpected keyword argument 'colour'"
        );
    }

    #[test]
    fn test_non_decision_return() {
        let fault = decide(&strategy_with("return {\"operation\": \"buy\"};")).unwrap_err();
        assert_eq!(fault.error, ScriptError::InvalidReturn("dict".to_string()));
        assert_eq!(fault.to_string(), "should_trade must return Decision, got dict");

        let fault = decide(&strategy_with("let x = 1;")).unwrap_err();
        assert_eq!(fault.error, ScriptError::InvalidReturn("none".to_string()));
    }

    #[test]
    fn test_missing_strategy_class() {
        let fault = load("fn helper() { return 1; }", Budget::unlimited(), LogBuffer::default())
            .err()
            .unwrap();
        assert_eq!(fault.error, ScriptError::NoStrategyClass);
    }

    #[test]
    fn test_init_receives_params_and_state_persists() {
        let source = r#"
class Counter {
    fn init(self, params) {
        self.limit = params.get("limit", 1);
        self.calls = 0;
    }

    fn should_trade(self, data) {
        self.calls += 1;
        if self.calls >= self.limit {
            return Decision(operation: "close", reason: str(self.calls));
        }
        return Decision(reason: str(self.calls));
    }
}
"#;
        let mut strategy = load(source, Budget::unlimited(), LogBuffer::default()).unwrap();
        let mut params = StrategyParams::new();
        params.insert("limit".to_string(), ParamValue::Int(2));
        strategy.init(&params).unwrap();
        assert_eq!(strategy.name(), "Counter");

        let first = strategy.should_trade(&snapshot()).unwrap();
        assert_eq!(first.operation, "hold");
        let second = strategy.should_trade(&snapshot()).unwrap();
        assert_eq!(second.operation, "close");
        assert_eq!(second.reason, "2");
    }

    #[test]
    fn test_log_and_print_fill_buffer() {
        let logs = LogBuffer::default();
        let source = strategy_with("log(\"price\", data.prices[\"BTC\"]);\nprint(\"done\");\nreturn Decision();");
        let mut strategy = load(&source, Budget::unlimited(), logs.clone()).unwrap();
        strategy.should_trade(&snapshot()).unwrap();
        assert_eq!(*logs.borrow(), vec!["price 100.0".to_string(), "done".to_string()]);
    }

    #[test]
    fn test_snapshot_fields_and_positions() {
        let mut snap = snapshot();
        snap.positions.insert(
            "BTC".to_string(),
            Position {
                symbol: "BTC".to_string(),
                side: PositionSide::Short,
                size: 2.0,
                entry_price: 110.0,
                unrealized_pnl: 20.0,
                leverage: 2,
                liquidation_price: 165.0,
            },
        );
        let body = r#"
        let pos = data.positions[data.trigger_symbol];
        return Decision(reason: str([data.available_balance, data.total_equity, data.trigger_type,
                                     pos.side, pos.size, pos.leverage, "ETH" in data.positions]));
        "#;
        let decision = decide_on(&strategy_with(body), &snap).unwrap();
        assert_eq!(decision.reason, "[1000.0, 1200.0, \"signal\", \"short\", 2.0, 2, false]");
    }

    #[test]
    fn test_get_klines_through_provider() {
        let bars: Vec<Kline> = (0..100)
            .map(|i| Kline {
                timestamp: i,
                open: i as f64,
                high: i as f64,
                low: i as f64,
                close: i as f64,
                volume: None,
            })
            .collect();
        let mut series = HashMap::new();
        series.insert(series_key("BTC", "5m"), bars);
        let mut provider = HistoricalDataProvider::new(series);
        provider.advance_to(60);
        let mut snap = snapshot();
        snap.data = provider.view();

        let body = r#"
        let bars = data.get_klines("BTC", "5m");
        let few = data.get_klines(symbol: "BTC", period: "5m", count: 3);
        let regime = data.get_regime("BTC", "5m");
        return Decision(reason: str([len(bars), bars[-1].close, len(few), few[0].close, regime.regime,
                                     bars[0].volume]));
        "#;
        let decision = decide_on(&strategy_with(body), &snap).unwrap();
        assert_eq!(decision.reason, "[50, 60.0, 3, 58.0, \"noise\", none]");
    }

    // ============= Cancellation =============

    #[test]
    fn test_cancel_flag_stops_evaluation() {
        let cancel = Arc::new(AtomicBool::new(true));
        let mut strategy = load(
            &strategy_with("while true { }"),
            Budget::new(cancel, None),
            LogBuffer::default(),
        )
        .unwrap();
        let fault = strategy.should_trade(&snapshot()).unwrap_err();
        assert!(fault.is_cancelled());
    }

    #[test]
    fn test_deadline_stops_infinite_loop() {
        let cancel = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + Duration::from_millis(50);
        let mut strategy = load(
            &strategy_with("let i = 0;\nwhile true { i += 1; }"),
            Budget::new(cancel.clone(), Some(deadline)),
            LogBuffer::default(),
        )
        .unwrap();
        let started = Instant::now();
        let fault = strategy.should_trade(&snapshot()).unwrap_err();
        assert!(fault.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(cancel.load(std::sync::atomic::Ordering::Relaxed));
    }
}
