use fxrelay_common::Rate;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use std::collections::HashMap;

use super::parser::{BinaryOp, Builtin, Expr, RateField, Statement};
use super::FormulaError;

const MAX_ROUND_SCALE: u32 = 28;

/// Runtime value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Number(Decimal),
    Text(String),
    /// A rate obtained through `rate(key)`.
    Rate { key: String, rate: Rate },
}

impl Value {
    fn type_name(&self) -> &'static str {
        match self {
            Value::Number(_) => "number",
            Value::Text(_) => "string",
            Value::Rate { .. } => "rate",
        }
    }

    pub fn as_number(&self) -> Option<Decimal> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }
}

/// Everything a formula can see.
pub struct Bindings<'a> {
    pub variables: HashMap<String, Value>,
    pub rates: &'a HashMap<String, Rate>,
    /// Value of `now()` in epoch milliseconds.
    pub now_ms: i64,
}

/// Outcome of evaluating a formula.
#[derive(Debug, Clone)]
pub struct Evaluation {
    pub variables: HashMap<String, Value>,
    /// Keys read through `rate(...)`, first-read order, deduplicated.
    pub rates_read: Vec<String>,
}

impl Evaluation {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.variables.get(name)
    }
}

struct Interpreter<'a> {
    variables: HashMap<String, Value>,
    rates: &'a HashMap<String, Rate>,
    now_ms: i64,
    rates_read: Vec<String>,
    line: usize,
}

pub(crate) fn run(statements: &[Statement], bindings: Bindings<'_>) -> Result<Evaluation, FormulaError> {
    let mut interp = Interpreter {
        variables: bindings.variables,
        rates: bindings.rates,
        now_ms: bindings.now_ms,
        rates_read: Vec::new(),
        line: 0,
    };

    for stmt in statements {
        interp.line = stmt.line;
        let value = interp.eval(&stmt.expr)?;
        interp.variables.insert(stmt.target.clone(), value);
    }

    Ok(Evaluation {
        variables: interp.variables,
        rates_read: interp.rates_read,
    })
}

impl<'a> Interpreter<'a> {
    fn eval(&mut self, expr: &Expr) -> Result<Value, FormulaError> {
        match expr {
            Expr::Number(n) => Ok(Value::Number(*n)),
            Expr::Str(s) => Ok(Value::Text(s.clone())),
            Expr::Var(name) => self
                .variables
                .get(name)
                .cloned()
                .ok_or_else(|| FormulaError::UndefinedVariable {
                    line: self.line,
                    name: name.clone(),
                }),
            Expr::Neg(inner) => {
                let n = self.number(inner)?;
                Ok(Value::Number(-n))
            }
            Expr::Binary { op, lhs, rhs } => {
                let a = self.number(lhs)?;
                let b = self.number(rhs)?;
                self.arith(*op, a, b).map(Value::Number)
            }
            Expr::Field { target, field } => {
                let value = self.eval(target)?;
                self.field(value, *field).map(Value::Number)
            }
            Expr::Call { func, args } => self.call(*func, args),
        }
    }

    fn number(&mut self, expr: &Expr) -> Result<Decimal, FormulaError> {
        let value = self.eval(expr)?;
        value.as_number().ok_or_else(|| FormulaError::Type {
            line: self.line,
            message: format!("expected number, found {}", value.type_name()),
        })
    }

    fn text(&mut self, expr: &Expr) -> Result<String, FormulaError> {
        match self.eval(expr)? {
            Value::Text(s) => Ok(s),
            other => Err(FormulaError::Type {
                line: self.line,
                message: format!("expected string, found {}", other.type_name()),
            }),
        }
    }

    fn arith(&self, op: BinaryOp, a: Decimal, b: Decimal) -> Result<Decimal, FormulaError> {
        let result = match op {
            BinaryOp::Add => a.checked_add(b),
            BinaryOp::Sub => a.checked_sub(b),
            BinaryOp::Mul => a.checked_mul(b),
            BinaryOp::Div => {
                if b.is_zero() {
                    return Err(FormulaError::DivisionByZero { line: self.line });
                }
                a.checked_div(b)
            }
        };
        result.ok_or(FormulaError::Overflow { line: self.line })
    }

    fn field(&self, value: Value, field: RateField) -> Result<Decimal, FormulaError> {
        let type_name = value.type_name();
        let Value::Rate { key, rate } = value else {
            return Err(FormulaError::Type {
                line: self.line,
                message: format!("cannot read .{} of {}", field.name(), type_name),
            });
        };
        let found = match field {
            RateField::Bid => rate.bid,
            RateField::Ask => rate.ask,
            RateField::Mid => rate.mid(),
            RateField::Timestamp => Some(Decimal::from(rate.timestamp)),
        };
        found.ok_or(FormulaError::MissingField {
            line: self.line,
            key,
            field: field.name(),
        })
    }

    fn lookup(&self, key: &str) -> Option<&Rate> {
        self.rates
            .get(key)
            .or_else(|| self.rates.get(&key.trim().to_uppercase()))
    }

    fn call(&mut self, func: Builtin, args: &[Expr]) -> Result<Value, FormulaError> {
        match func {
            Builtin::Rate => {
                let key = self.text(&args[0])?;
                let rate = self.lookup(&key).cloned().ok_or_else(|| FormulaError::UnknownRate {
                    line: self.line,
                    key: key.clone(),
                })?;
                if !self.rates_read.contains(&key) {
                    self.rates_read.push(key.clone());
                }
                Ok(Value::Rate { key, rate })
            }
            Builtin::Has => {
                let key = self.text(&args[0])?;
                let present = self.lookup(&key).is_some();
                Ok(Value::Number(if present { Decimal::ONE } else { Decimal::ZERO }))
            }
            Builtin::Round => {
                let value = self.number(&args[0])?;
                let scale = self.number(&args[1])?;
                let scale = self.scale(scale)?;
                Ok(Value::Number(
                    value.round_dp_with_strategy(scale, RoundingStrategy::MidpointAwayFromZero),
                ))
            }
            Builtin::Min => {
                let a = self.number(&args[0])?;
                let b = self.number(&args[1])?;
                Ok(Value::Number(a.min(b)))
            }
            Builtin::Max => {
                let a = self.number(&args[0])?;
                let b = self.number(&args[1])?;
                Ok(Value::Number(a.max(b)))
            }
            Builtin::Abs => {
                let a = self.number(&args[0])?;
                Ok(Value::Number(a.abs()))
            }
            Builtin::Now => Ok(Value::Number(Decimal::from(self.now_ms))),
        }
    }

    fn scale(&self, value: Decimal) -> Result<u32, FormulaError> {
        let invalid = || FormulaError::Type {
            line: self.line,
            message: format!("round scale must be an integer between 0 and {MAX_ROUND_SCALE}, got {value}"),
        };
        if !value.fract().is_zero() || value.is_sign_negative() || value > Decimal::from(MAX_ROUND_SCALE) {
            return Err(invalid());
        }
        value.to_u32().ok_or_else(invalid)
    }
}
