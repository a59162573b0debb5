//! Custom error types for the program trader
//!
//! Provides structured, typed errors instead of generic Box<dyn Error>

use std::fmt;
use thiserror::Error;

/// Top-level errors surfaced by the CLI and the live trading loop
#[derive(Error, Debug)]
pub enum TradingError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Validation failed: {}", .0.join("; "))]
    Validation(Vec<String>),

    #[error("Feed error: {0}")]
    Feed(String),

    #[error("Order routing error: {0}")]
    Routing(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Deserialization error: {0}")]
    Deserialization(#[from] serde_json::Error),
}

/// Configuration loading errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
}

/// A strategy source that does not parse
#[derive(Error, Debug, Clone, PartialEq)]
#[error("Line {line}: {message}")]
pub struct SyntaxError {
    pub line: usize,
    pub message: String,
}

impl SyntaxError {
    pub fn new(line: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            message: message.into(),
        }
    }
}

/// Runtime faults raised by strategy code inside the interpreter
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScriptError {
    #[error("name '{0}' is not defined")]
    UndefinedName(String),

    #[error("assignment to undeclared variable '{0}' (use 'let')")]
    UndeclaredAssignment(String),

    #[error("'{type_name}' object has no attribute '{attr}'")]
    NoAttribute { type_name: String, attr: String },

    #[error("attribute '{attr}' of '{type_name}' is read-only")]
    ReadOnlyAttribute { type_name: String, attr: String },

    #[error("type mismatch: {0}")]
    TypeMismatch(String),

    #[error("division by zero")]
    DivisionByZero,

    #[error("integer overflow")]
    IntegerOverflow,

    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("'{0}' object is not callable")]
    NotCallable(String),

    #[error("{name}() {message}")]
    BadArguments { name: String, message: String },

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("{kind} too large (limit {limit})")]
    SizeLimit { kind: &'static str, limit: usize },

    #[error("maximum call depth of {0} exceeded")]
    RecursionLimit(usize),

    #[error("'{0}' outside of a loop")]
    LoopControlOutsideLoop(String),

    #[error("module '{0}' is not available in the sandbox")]
    Unavailable(String),

    #[error("No valid strategy class found in code")]
    NoStrategyClass,

    #[error("should_trade must return Decision, got {0}")]
    InvalidReturn(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl ScriptError {
    pub fn bad_args(name: &str, message: impl Into<String>) -> Self {
        ScriptError::BadArguments {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        ScriptError::TypeMismatch(message.into())
    }
}

/// A [`ScriptError`] located in the source, with the script call stack at the
/// point of failure (outermost frame first).
#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFault {
    pub error: ScriptError,
    pub line: usize,
    pub trace: Vec<String>,
}

impl ScriptFault {
    pub fn new(error: ScriptError, line: usize) -> Self {
        Self {
            error,
            line,
            trace: Vec::new(),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.error == ScriptError::Cancelled
    }
}

impl From<ScriptError> for ScriptFault {
    fn from(error: ScriptError) -> Self {
        ScriptFault::new(error, 0)
    }
}

impl fmt::Display for ScriptFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.line > 0 {
            write!(f, "line {}: {}", self.line, self.error)?;
        } else {
            write!(f, "{}", self.error)?;
        }
        if !self.trace.is_empty() {
            write!(f, "\nTraceback (most recent call last):")?;
            for frame in &self.trace {
                write!(f, "\n  {}", frame)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for ScriptFault {}
