use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::constants::events;
use crate::error::TradingError;
use crate::exchange::{MarketFeed, OrderAck, OrderRouter};
use crate::models::{ActionType, StrategyParams};
use crate::sandbox::ast::Program;
use crate::services::decision::validate_decision;
use crate::services::executor::SandboxExecutor;
use crate::services::validator::CodeValidator;

/// What happened to one live trigger.
#[derive(Clone, Debug, PartialEq)]
pub enum LiveOutcome {
    Held,
    Rejected(Vec<String>),
    Routed(OrderAck),
    Failed(String),
}

/// Evaluates one strategy on live triggers and routes what it decides.
pub struct LiveTrader {
    program: Arc<Program>,
    params: StrategyParams,
    executor: SandboxExecutor,
    feed: Arc<dyn MarketFeed>,
    router: Arc<dyn OrderRouter>,
}

impl LiveTrader {
    /// Rejects source that fails static validation before any trigger fires.
    pub fn new(
        source: &str,
        params: StrategyParams,
        executor: SandboxExecutor,
        feed: Arc<dyn MarketFeed>,
        router: Arc<dyn OrderRouter>,
    ) -> Result<Self, TradingError> {
        let (validation, program) = CodeValidator::new().analyze(source);
        let program = match program {
            Some(program) if validation.is_valid => program,
            _ => return Err(TradingError::Validation(validation.errors)),
        };
        Ok(Self {
            program: Arc::new(program),
            params,
            executor,
            feed,
            router,
        })
    }

    pub async fn on_trigger(&self, symbol: &str, trigger_type: &str) -> LiveOutcome {
        let snapshot = match self.feed.snapshot(symbol, trigger_type).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                let err = TradingError::Feed(e.to_string());
                error!("❌ [LIVE] {} snapshot failed: {}", symbol, err);
                return LiveOutcome::Failed(err.to_string());
            }
        };

        let result = self
            .executor
            .execute_program(self.program.clone(), &snapshot, &self.params)
            .await;
        for line in &result.logs {
            info!("📝 [LIVE] {} | {}", symbol, line);
        }
        let mut decision = match (result.success, result.decision) {
            (true, Some(decision)) => decision,
            _ => {
                let err = result.error.unwrap_or_else(|| "no decision".to_string());
                warn!("⚠️ [LIVE] {} evaluation failed: {}", symbol, err);
                return LiveOutcome::Failed(err);
            }
        };
        if decision.symbol.is_empty() {
            decision.symbol = symbol.to_string();
        }

        let (valid, errors) = validate_decision(&decision, &snapshot.positions);
        if !valid {
            warn!(
                event = events::DECISION_REJECTED,
                "🚫 [LIVE] {} decision rejected: {}",
                decision.symbol,
                errors.join("; ")
            );
            return LiveOutcome::Rejected(errors);
        }
        if decision.action() == Some(ActionType::Hold) {
            return LiveOutcome::Held;
        }

        let client_order_id = Uuid::new_v4().to_string();
        match self.router.submit(&decision, &client_order_id).await {
            Ok(ack) => {
                info!(
                    event = events::ORDER_ROUTED,
                    "✅ [LIVE] {} {} via {} (client id {}, order {}, status {})",
                    decision.operation,
                    decision.symbol,
                    self.router.name(),
                    client_order_id,
                    ack.id,
                    ack.status
                );
                LiveOutcome::Routed(ack)
            }
            Err(e) => {
                let err = TradingError::Routing(e.to_string());
                error!("❌ [LIVE] {} {}: {}", decision.operation, decision.symbol, err);
                LiveOutcome::Failed(err.to_string())
            }
        }
    }
}
