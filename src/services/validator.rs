use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::sandbox::ast::{walk_exprs, ClassDef, ExprKind, Import, Item, Program};
use crate::sandbox::builtins::module_attribute;
use crate::sandbox::capabilities::{self, Access, Capability};
use crate::sandbox::parse;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub is_valid: bool,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    fn from_parts(errors: Vec<String>, warnings: Vec<String>) -> Self {
        Self {
            is_valid: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Static screening of strategy source: syntax, forbidden capabilities and
/// the strategy-class template. Never executes anything.
#[derive(Clone, Copy, Debug, Default)]
pub struct CodeValidator;

impl CodeValidator {
    pub fn new() -> Self {
        Self
    }

    pub fn validate(&self, source: &str) -> ValidationResult {
        self.analyze(source).0
    }

    /// Validate and hand back the parsed program so callers don't parse twice.
    /// The program is `None` only when the source does not parse.
    pub fn analyze(&self, source: &str) -> (ValidationResult, Option<Program>) {
        let program = match parse(source) {
            Ok(program) => program,
            Err(err) => {
                debug!("[VALIDATOR] Syntax error: {}", err);
                return (ValidationResult::from_parts(vec![err.to_string()], Vec::new()), None);
            }
        };

        let mut errors = self.check_security(&program);
        let (template_errors, warnings) = self.check_template(&program);
        errors.extend(template_errors);

        if !errors.is_empty() {
            debug!("[VALIDATOR] Rejected strategy: {}", errors.join("; "));
        }
        (ValidationResult::from_parts(errors, warnings), Some(program))
    }

    fn check_security(&self, program: &Program) -> Vec<String> {
        let mut errors = Vec::new();

        for item in &program.items {
            if let Item::Import(import) = item {
                check_import(import, &mut errors);
            }
        }

        walk_exprs(program, &mut |expr| match &expr.kind {
            ExprKind::Call { callee, .. } => {
                if let ExprKind::Name(name) = &callee.kind {
                    if let Access::Forbidden(capability) = capabilities::function_access(name) {
                        errors.push(format!("Forbidden function: {}() ({})", name, capability));
                    }
                }
            }
            ExprKind::Attribute { name, .. } if capabilities::is_reflective_attribute(name) => {
                errors.push(format!(
                    "Forbidden attribute: {} ({})",
                    name,
                    Capability::Reflection
                ));
            }
            _ => {}
        });

        errors
    }

    fn check_template(&self, program: &Program) -> (Vec<String>, Vec<String>) {
        let mut errors = Vec::new();
        let mut warnings = Vec::new();

        let classes: Vec<&ClassDef> = program
            .items
            .iter()
            .filter_map(|item| match item {
                Item::Class(class) => Some(class),
                _ => None,
            })
            .collect();

        if classes.is_empty() {
            errors.push("No class definition found. Strategy must define a class.".to_string());
            return (errors, warnings);
        }

        for class in &classes {
            if capabilities::is_vocabulary_type(&class.name) {
                errors.push(format!(
                    "Line {}: class '{}' shadows a built-in type",
                    class.line, class.name
                ));
            }
        }

        let candidates: Vec<&ClassDef> = classes
            .iter()
            .copied()
            .filter(|c| !capabilities::is_vocabulary_type(&c.name) && c.method("should_trade").is_some())
            .collect();

        let Some(strategy) = candidates.first() else {
            errors.push("Strategy class must have 'should_trade' method.".to_string());
            return (errors, warnings);
        };

        if candidates.len() > 1 {
            let names: Vec<&str> = candidates.iter().map(|c| c.name.as_str()).collect();
            errors.push(format!(
                "Multiple strategy classes found ({}). Define exactly one class with 'should_trade'.",
                names.join(", ")
            ));
        }

        if let Some(should_trade) = strategy.method("should_trade") {
            if should_trade.params.len() < 2 {
                errors.push("should_trade must accept 'data' parameter.".to_string());
            }
        }

        match strategy.method("init") {
            Some(init) if init.params.len() < 2 => {
                errors.push("init must accept 'params' parameter.".to_string());
            }
            Some(_) => {}
            None => {
                warnings.push("Consider adding 'init' method for parameter initialization.".to_string())
            }
        }

        (errors, warnings)
    }
}

fn check_import(import: &Import, errors: &mut Vec<String>) {
    match capabilities::module_access(&import.module) {
        Access::Forbidden(capability) => {
            errors.push(format!("Forbidden import: {} ({})", import.module, capability));
        }
        Access::Unknown => errors.push(format!("Unsupported import: {}", import.module)),
        Access::Allowed => {
            for name in &import.names {
                if module_attribute(&import.module, name).is_none() {
                    errors.push(format!("Unsupported import: {}.{}", import.module, name));
                }
            }
        }
    }
}

pub fn validate_strategy_code(source: &str) -> ValidationResult {
    CodeValidator::new().validate(source)
}
