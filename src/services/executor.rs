use std::cell::RefCell;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::SandboxConfig;
use crate::constants::events;
use crate::constants::sandbox::{DEFAULT_TIMEOUT, TEARDOWN_GRACE};
use crate::error::{ScriptFault, TradingError};
use crate::models::{Decision, MarketSnapshot, StrategyParams};
use crate::sandbox::ast::Program;
use crate::sandbox::{Budget, ScriptStrategy, Strategy};
use crate::services::validator::CodeValidator;

/// Outcome of one strategy decision cycle.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub decision: Option<Decision>,
    pub error: Option<String>,
    pub execution_time_ms: f64,
    pub logs: Vec<String>,
}

impl ExecutionResult {
    fn failed(error: String, execution_time_ms: f64, logs: Vec<String>) -> Self {
        Self {
            success: false,
            decision: None,
            error: Some(error),
            execution_time_ms,
            logs,
        }
    }
}

/// Runs untrusted strategy programs on a blocking worker under a deadline.
#[derive(Clone, Debug)]
pub struct SandboxExecutor {
    timeout: Duration,
    validator: CodeValidator,
}

impl Default for SandboxExecutor {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl SandboxExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            validator: CodeValidator::new(),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Validate `source` and run one decision cycle against `snapshot`.
    pub async fn execute(
        &self,
        source: &str,
        snapshot: &MarketSnapshot,
        params: &StrategyParams,
    ) -> ExecutionResult {
        let (validation, program) = self.validator.analyze(source);
        let program = match program {
            Some(program) if validation.is_valid => program,
            _ => {
                let error = TradingError::Validation(validation.errors).to_string();
                return ExecutionResult::failed(error, 0.0, Vec::new());
            }
        };
        self.execute_program(Arc::new(program), snapshot, params).await
    }

    /// Run an already validated program. Callers that evaluate the same
    /// source many times (the backtest loop) validate once and come here.
    pub async fn execute_program(
        &self,
        program: Arc<Program>,
        snapshot: &MarketSnapshot,
        params: &StrategyParams,
    ) -> ExecutionResult {
        let started = Instant::now();
        let cancel = Arc::new(AtomicBool::new(false));
        let budget = Budget::new(cancel.clone(), Some(started + self.timeout));
        let snapshot = snapshot.clone();
        let params = params.clone();

        let mut handle =
            tokio::task::spawn_blocking(move || evaluate(&program, budget, &snapshot, &params));

        let joined = match timeout(self.timeout, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                cancel.store(true, Ordering::Relaxed);
                let logs = match timeout(TEARDOWN_GRACE, &mut handle).await {
                    Ok(Ok((_, logs))) => logs,
                    Ok(Err(_)) => Vec::new(),
                    Err(_) => {
                        warn!(
                            event = events::EVALUATION_TIMEOUT,
                            "⏱️ [SANDBOX] Worker still running {}ms after cancellation",
                            TEARDOWN_GRACE.as_millis()
                        );
                        Vec::new()
                    }
                };
                return self.timed_out(logs);
            }
        };

        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        match joined {
            Ok((Ok(decision), logs)) => {
                debug!(
                    "🧮 [SANDBOX] Decision '{}' in {:.2}ms",
                    decision.operation, elapsed_ms
                );
                ExecutionResult {
                    success: true,
                    decision: Some(decision),
                    error: None,
                    execution_time_ms: elapsed_ms,
                    logs,
                }
            }
            Ok((Err(fault), logs)) if fault.is_cancelled() => self.timed_out(logs),
            Ok((Err(fault), logs)) => {
                debug!("❌ [SANDBOX] Strategy fault: {}", fault);
                ExecutionResult::failed(format!("Execution error: {}", fault), elapsed_ms, logs)
            }
            Err(join_error) => {
                warn!("💥 [SANDBOX] Strategy worker died: {}", join_error);
                ExecutionResult::failed(
                    format!("Execution error: strategy worker panicked: {}", join_error),
                    elapsed_ms,
                    Vec::new(),
                )
            }
        }
    }

    fn timed_out(&self, logs: Vec<String>) -> ExecutionResult {
        warn!(
            event = events::EVALUATION_TIMEOUT,
            "⏱️ [SANDBOX] Execution timed out after {}s",
            self.timeout.as_secs_f64()
        );
        ExecutionResult::failed(
            format!("Execution timed out after {}s", self.timeout.as_secs_f64()),
            self.timeout.as_millis() as f64,
            logs,
        )
    }
}

impl From<&SandboxConfig> for SandboxExecutor {
    fn from(config: &SandboxConfig) -> Self {
        Self::new(Duration::from_millis(config.timeout_ms))
    }
}

/// Worker body: everything here lives and dies on the blocking thread.
fn evaluate(
    program: &Program,
    budget: Budget,
    snapshot: &MarketSnapshot,
    params: &StrategyParams,
) -> (Result<Decision, ScriptFault>, Vec<String>) {
    let logs = Rc::new(RefCell::new(Vec::new()));
    let outcome = ScriptStrategy::load(program, budget, logs.clone()).and_then(|mut strategy| {
        strategy.init(params)?;
        strategy.should_trade(snapshot)
    });
    let lines = logs.take();
    (outcome, lines)
}
