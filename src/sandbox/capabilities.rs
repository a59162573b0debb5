//! The single table of what strategy code may and may not name.
//!
//! The validator rejects everything listed as forbidden or not listed at all;
//! the interpreter resolves only what is listed as allowed. Both read this
//! module, so a name can never be blocked on one side and reachable on the
//! other.

use std::fmt;

/// Host capability a forbidden name would reach.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    ProcessControl,
    Filesystem,
    Network,
    RawSockets,
    Serialization,
    Reflection,
    Introspection,
    DynamicImport,
    DynamicEvaluation,
    Concurrency,
    Interactive,
    ProcessExit,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Capability::ProcessControl => "process control",
            Capability::Filesystem => "filesystem",
            Capability::Network => "network",
            Capability::RawSockets => "raw sockets",
            Capability::Serialization => "object serialization",
            Capability::Reflection => "reflection",
            Capability::Introspection => "introspection",
            Capability::DynamicImport => "dynamic import",
            Capability::DynamicEvaluation => "dynamic evaluation",
            Capability::Concurrency => "concurrency",
            Capability::Interactive => "interactive input",
            Capability::ProcessExit => "process exit",
        };
        f.write_str(label)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Forbidden(Capability),
    Unknown,
}

/// Modules strategy code may import.
pub const ALLOWED_MODULES: &[&str] = &["math"];

pub const FORBIDDEN_MODULES: &[(&str, Capability)] = &[
    ("os", Capability::ProcessControl),
    ("sys", Capability::ProcessControl),
    ("subprocess", Capability::ProcessControl),
    ("process", Capability::ProcessControl),
    ("shutil", Capability::Filesystem),
    ("pathlib", Capability::Filesystem),
    ("fs", Capability::Filesystem),
    ("io", Capability::Filesystem),
    ("socket", Capability::RawSockets),
    ("requests", Capability::Network),
    ("urllib", Capability::Network),
    ("http", Capability::Network),
    ("net", Capability::Network),
    ("pickle", Capability::Serialization),
    ("marshal", Capability::Serialization),
    ("shelve", Capability::Serialization),
    ("ctypes", Capability::Reflection),
    ("builtins", Capability::Reflection),
    ("__builtins__", Capability::Reflection),
    ("inspect", Capability::Introspection),
    ("importlib", Capability::DynamicImport),
    ("multiprocessing", Capability::Concurrency),
    ("threading", Capability::Concurrency),
    ("thread", Capability::Concurrency),
    ("asyncio", Capability::Concurrency),
];

/// Plain builtin functions resolvable by name.
pub const BUILTIN_FUNCTIONS: &[&str] = &[
    "abs", "min", "max", "sum", "len", "round", "int", "float", "str", "bool", "list", "dict",
    "range", "enumerate", "zip", "sorted", "reversed", "any", "all", "type", "print", "log",
];

/// Functions exposed by the `math` module.
pub const MATH_FUNCTIONS: &[&str] = &[
    "sqrt", "log", "log10", "exp", "pow", "floor", "ceil", "abs", "fabs",
];

/// Vocabulary types pre-bound in every evaluation; user classes may not reuse
/// these names.
pub const VOCABULARY_TYPES: &[&str] = &[
    "Decision",
    "ActionType",
    "MarketData",
    "MarketSnapshot",
    "Position",
    "Kline",
    "RegimeInfo",
];

pub const FORBIDDEN_FUNCTIONS: &[(&str, Capability)] = &[
    ("eval", Capability::DynamicEvaluation),
    ("exec", Capability::DynamicEvaluation),
    ("compile", Capability::DynamicEvaluation),
    ("open", Capability::Filesystem),
    ("input", Capability::Interactive),
    ("breakpoint", Capability::Interactive),
    ("__import__", Capability::DynamicImport),
    ("globals", Capability::Introspection),
    ("locals", Capability::Introspection),
    ("vars", Capability::Introspection),
    ("getattr", Capability::Reflection),
    ("setattr", Capability::Reflection),
    ("delattr", Capability::Reflection),
    ("hasattr", Capability::Reflection),
    ("exit", Capability::ProcessExit),
    ("quit", Capability::ProcessExit),
];

/// Classify an import path by its root module.
pub fn module_access(path: &str) -> Access {
    let root = path.split('.').next().unwrap_or(path);
    if let Some((_, cap)) = FORBIDDEN_MODULES.iter().find(|(name, _)| *name == root) {
        return Access::Forbidden(*cap);
    }
    if ALLOWED_MODULES.contains(&root) && root == path {
        return Access::Allowed;
    }
    Access::Unknown
}

pub fn function_access(name: &str) -> Access {
    if let Some((_, cap)) = FORBIDDEN_FUNCTIONS.iter().find(|(n, _)| *n == name) {
        return Access::Forbidden(*cap);
    }
    if BUILTIN_FUNCTIONS.contains(&name) {
        return Access::Allowed;
    }
    Access::Unknown
}

/// Names starting with a double underscore are host internals.
pub fn is_reflective_attribute(name: &str) -> bool {
    name.starts_with("__")
}

pub fn is_vocabulary_type(name: &str) -> bool {
    VOCABULARY_TYPES.contains(&name)
}
