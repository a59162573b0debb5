//! Restricted strategy language: parser, capability table and interpreter.

pub mod ast;
pub mod builtins;
pub mod capabilities;
pub mod interpreter;
pub mod lexer;
pub mod parser;
pub mod strategy;
pub mod value;

pub use interpreter::{Budget, Interpreter, LogBuffer};
pub use parser::parse;
pub use strategy::{ScriptStrategy, Strategy};

#[cfg(test)]
mod interpreter_tests;
#[cfg(test)]
mod parser_tests;
