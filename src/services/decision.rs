use std::collections::HashMap;

use crate::constants::decision::{
    EXECUTION_MODES, MAX_LEVERAGE, MAX_PORTION, MIN_LEVERAGE, MIN_PORTION, TIME_IN_FORCE,
};
use crate::models::{ActionType, Decision, Position, PositionSide};
use crate::sandbox::value::format_float;

/// Business-rule checks on a strategy decision.
///
/// `hold` is always valid. An unknown operation short-circuits with a single
/// error; otherwise every violated rule is reported.
pub fn validate_decision(decision: &Decision, positions: &HashMap<String, Position>) -> (bool, Vec<String>) {
    let Some(action) = decision.action() else {
        return (
            false,
            vec![format!(
                "Invalid operation: '{}'. Must be buy/sell/hold/close",
                decision.operation
            )],
        );
    };

    if action == ActionType::Hold {
        return (true, Vec::new());
    }

    let mut errors = Vec::new();

    let portion = decision.target_portion_of_balance;
    if !(MIN_PORTION..=MAX_PORTION).contains(&portion) {
        errors.push(format!(
            "target_portion_of_balance must be {}-{}, got {}",
            format_float(MIN_PORTION),
            format_float(MAX_PORTION),
            format_float(portion)
        ));
    }

    if !(MIN_LEVERAGE..=MAX_LEVERAGE).contains(&decision.leverage) {
        errors.push(format!(
            "leverage must be {}-{}, got {}",
            MIN_LEVERAGE, MAX_LEVERAGE, decision.leverage
        ));
    }

    match action {
        ActionType::Buy if decision.max_price.is_none() => {
            errors.push("max_price is required for buy operations".to_string());
        }
        ActionType::Sell if decision.min_price.is_none() => {
            errors.push("min_price is required for sell operations".to_string());
        }
        ActionType::Close => match positions.get(&decision.symbol).map(|p| p.side) {
            Some(PositionSide::Long) if decision.min_price.is_none() => {
                errors.push("min_price is required for closing LONG positions".to_string());
            }
            Some(PositionSide::Short) if decision.max_price.is_none() => {
                errors.push("max_price is required for closing SHORT positions".to_string());
            }
            _ => {}
        },
        _ => {}
    }

    if !TIME_IN_FORCE.contains(&decision.time_in_force.as_str()) {
        errors.push(format!(
            "time_in_force must be {}, got {}",
            TIME_IN_FORCE.join("/"),
            decision.time_in_force
        ));
    }
    if !EXECUTION_MODES.contains(&decision.tp_execution.as_str()) {
        errors.push(format!(
            "tp_execution must be {}, got {}",
            EXECUTION_MODES.join("/"),
            decision.tp_execution
        ));
    }
    if !EXECUTION_MODES.contains(&decision.sl_execution.as_str()) {
        errors.push(format!(
            "sl_execution must be {}, got {}",
            EXECUTION_MODES.join("/"),
            decision.sl_execution
        ));
    }

    (errors.is_empty(), errors)
}
