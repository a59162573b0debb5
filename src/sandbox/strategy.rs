use std::rc::Rc;

use super::ast::Program;
use super::interpreter::{Budget, Interpreter, LogBuffer};
use super::value::{DictKey, Instance, Value};
use crate::error::{ScriptError, ScriptFault};
use crate::models::{Decision, MarketSnapshot, StrategyParams};

/// The decision protocol every strategy follows.
pub trait Strategy {
    fn name(&self) -> &str;

    /// Receive user parameters once, before the first decision.
    fn init(&mut self, params: &StrategyParams) -> Result<(), ScriptFault>;

    fn should_trade(&mut self, snapshot: &MarketSnapshot) -> Result<Decision, ScriptFault>;
}

/// A [`Strategy`] backed by an interpreted strategy class.
pub struct ScriptStrategy {
    interpreter: Interpreter,
    instance: Rc<Instance>,
}

impl ScriptStrategy {
    /// Load `program` and instantiate its strategy class (the first
    /// non-vocabulary class exposing `should_trade`).
    pub fn load(program: &Program, budget: Budget, logs: LogBuffer) -> Result<Self, ScriptFault> {
        let mut interpreter = Interpreter::new(budget, logs);
        interpreter.load(program)?;
        let class = interpreter
            .strategy_class()
            .ok_or(ScriptError::NoStrategyClass)?;
        let instance = interpreter.instantiate(&class);
        Ok(Self {
            interpreter,
            instance,
        })
    }
}

impl Strategy for ScriptStrategy {
    fn name(&self) -> &str {
        &self.instance.class.name
    }

    fn init(&mut self, params: &StrategyParams) -> Result<(), ScriptFault> {
        let dict = params
            .iter()
            .map(|(k, v)| (DictKey::Str(Rc::from(k.as_str())), Value::from_param(v)))
            .collect();
        let instance = self.instance.clone();
        self.interpreter
            .call_method(&instance, "init", vec![Value::dict(dict)])?;
        Ok(())
    }

    fn should_trade(&mut self, snapshot: &MarketSnapshot) -> Result<Decision, ScriptFault> {
        let instance = self.instance.clone();
        let data = Value::Snapshot(Rc::new(snapshot.clone()));
        let returned = self
            .interpreter
            .call_method(&instance, "should_trade", vec![data])?
            .ok_or(ScriptError::NoStrategyClass)?;
        match returned {
            Value::Decision(decision) => Ok(decision.borrow().clone()),
            other => Err(ScriptError::InvalidReturn(other.type_name()).into()),
        }
    }
}
