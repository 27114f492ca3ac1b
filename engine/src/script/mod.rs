//! Restricted formula language used by cross-rate rules.
//!
//! A formula is a list of assignments evaluated top to bottom with decimal
//! arithmetic:
//!
//! ```text
//! # EUR/TRY from EUR/USD and the USD/TRY mid
//! usd = rate(usdTryAvgKey)
//! eur = rate(eurUsdAvgKey)
//! bid = round(eur.bid * usd.mid, defaultScale)
//! ask = round(eur.ask * usd.mid, defaultScale)
//! timestamp = max(usd.timestamp, eur.timestamp)
//! ```
//!
//! Sources are parsed once into a [`Script`] and evaluated against a set of
//! bindings and input rates. Nothing in the language can perform I/O.

mod interpreter;
mod lexer;
mod parser;

pub use interpreter::{Bindings, Evaluation, Value};

use thiserror::Error;

/// Errors raised while parsing or evaluating a formula.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum FormulaError {
    #[error("line {line}: unexpected character {ch:?}")]
    UnexpectedChar { line: usize, ch: char },

    #[error("line {line}: invalid number {text:?}")]
    InvalidNumber { line: usize, text: String },

    #[error("line {line}: unterminated string")]
    UnterminatedString { line: usize },

    #[error("line {line}: expected {expected}, found {found}")]
    Syntax {
        line: usize,
        expected: String,
        found: String,
    },

    #[error("line {line}: unknown function {name}")]
    UnknownFunction { line: usize, name: String },

    #[error("line {line}: {name} takes {expected} argument(s), got {got}")]
    Arity {
        line: usize,
        name: String,
        expected: usize,
        got: usize,
    },

    #[error("line {line}: unknown field .{field}")]
    UnknownField { line: usize, field: String },

    #[error("line {line}: undefined variable {name}")]
    UndefinedVariable { line: usize, name: String },

    #[error("line {line}: no input rate {key}")]
    UnknownRate { line: usize, key: String },

    #[error("line {line}: rate {key} has no {field}")]
    MissingField {
        line: usize,
        key: String,
        field: &'static str,
    },

    #[error("line {line}: {message}")]
    Type { line: usize, message: String },

    #[error("line {line}: division by zero")]
    DivisionByZero { line: usize },

    #[error("line {line}: arithmetic overflow")]
    Overflow { line: usize },

    #[error("formula did not assign {0}")]
    MissingResult(&'static str),

    #[error("result {0} is not numeric")]
    NonNumericResult(&'static str),

    #[error("result bid {bid} is above ask {ask}")]
    InvertedResult { bid: String, ask: String },

    #[error("no formula configured")]
    NoImplementation,

    #[error("cannot read formula {path}: {message}")]
    Read { path: String, message: String },
}

/// A parsed formula, ready to evaluate any number of times.
#[derive(Debug, Clone, PartialEq)]
pub struct Script {
    statements: Vec<parser::Statement>,
}

impl Script {
    /// Parse formula source.
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = lexer::tokenize(source)?;
        let statements = parser::Parser::new(tokens).parse_program()?;
        Ok(Self { statements })
    }

    /// Names assigned by the formula, in order of first assignment.
    pub fn assigned_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for stmt in &self.statements {
            if !names.contains(&stmt.target.as_str()) {
                names.push(&stmt.target);
            }
        }
        names
    }

    /// Evaluate against `bindings`.
    pub fn evaluate(&self, bindings: Bindings<'_>) -> Result<Evaluation, FormulaError> {
        interpreter::run(&self.statements, bindings)
    }
}
