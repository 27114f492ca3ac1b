use rust_decimal::Decimal;

use super::lexer::{Token, TokenKind};
use super::FormulaError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RateField {
    Bid,
    Ask,
    Mid,
    Timestamp,
}

impl RateField {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "bid" => Some(RateField::Bid),
            "ask" => Some(RateField::Ask),
            "mid" => Some(RateField::Mid),
            "timestamp" => Some(RateField::Timestamp),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            RateField::Bid => "bid",
            RateField::Ask => "ask",
            RateField::Mid => "mid",
            RateField::Timestamp => "timestamp",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Builtin {
    Rate,
    Has,
    Round,
    Min,
    Max,
    Abs,
    Now,
}

impl Builtin {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "rate" => Some(Builtin::Rate),
            "has" => Some(Builtin::Has),
            "round" => Some(Builtin::Round),
            "min" => Some(Builtin::Min),
            "max" => Some(Builtin::Max),
            "abs" => Some(Builtin::Abs),
            "now" => Some(Builtin::Now),
            _ => None,
        }
    }

    fn arity(&self) -> usize {
        match self {
            Builtin::Now => 0,
            Builtin::Rate | Builtin::Has | Builtin::Abs => 1,
            Builtin::Round | Builtin::Min | Builtin::Max => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Expr {
    Number(Decimal),
    Str(String),
    Var(String),
    Neg(Box<Expr>),
    Binary {
        op: BinaryOp,
        lhs: Box<Expr>,
        rhs: Box<Expr>,
    },
    Call {
        func: Builtin,
        args: Vec<Expr>,
    },
    Field {
        target: Box<Expr>,
        field: RateField,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Statement {
    pub target: String,
    pub expr: Expr,
    pub line: usize,
}

/// Recursive-descent parser.
///
/// ```text
/// program   := (statement? SEP)* EOF
/// statement := IDENT '=' expr
/// expr      := term (('+' | '-') term)*
/// term      := unary (('*' | '/') unary)*
/// unary     := '-' unary | postfix
/// postfix   := primary ('.' IDENT)*
/// primary   := NUMBER | STRING | IDENT | IDENT '(' args? ')' | '(' expr ')'
/// ```
///
/// Expression trees deeper than [`MAX_DEPTH`] are rejected with a syntax error.
pub(crate) struct Parser {
    tokens: Vec<Token>,
    pos: usize,
    depth: usize,
}

/// Nesting limit for parentheses, unary minus, operator chains and field access.
pub(crate) const MAX_DEPTH: usize = 128;

impl Parser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            depth: 0,
        }
    }

    pub fn parse_program(mut self) -> Result<Vec<Statement>, FormulaError> {
        let mut statements = Vec::new();
        loop {
            match self.peek() {
                TokenKind::Eof => break,
                TokenKind::Separator => {
                    self.advance();
                }
                _ => {
                    statements.push(self.statement()?);
                    match self.peek() {
                        TokenKind::Separator | TokenKind::Eof => {}
                        _ => return Err(self.unexpected("end of statement")),
                    }
                }
            }
        }
        Ok(statements)
    }

    fn statement(&mut self) -> Result<Statement, FormulaError> {
        let line = self.line();
        let target = match self.peek().clone() {
            TokenKind::Ident(name) => {
                self.advance();
                name
            }
            _ => return Err(self.unexpected("assignment target")),
        };
        self.expect(TokenKind::Assign, "'='")?;
        let expr = self.expr()?;
        Ok(Statement { target, expr, line })
    }

    fn expr(&mut self) -> Result<Expr, FormulaError> {
        let base = self.depth;
        self.enter()?;
        let mut lhs = self.term()?;
        loop {
            let op = match self.peek() {
                TokenKind::Plus => BinaryOp::Add,
                TokenKind::Minus => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.term()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth = base;
        Ok(lhs)
    }

    fn term(&mut self) -> Result<Expr, FormulaError> {
        let base = self.depth;
        let mut lhs = self.unary()?;
        loop {
            let op = match self.peek() {
                TokenKind::Star => BinaryOp::Mul,
                TokenKind::Slash => BinaryOp::Div,
                _ => break,
            };
            self.advance();
            self.enter()?;
            let rhs = self.unary()?;
            lhs = Expr::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            };
        }
        self.depth = base;
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr, FormulaError> {
        if *self.peek() == TokenKind::Minus {
            self.advance();
            self.enter()?;
            let inner = self.unary()?;
            self.depth -= 1;
            return Ok(Expr::Neg(Box::new(inner)));
        }
        self.postfix()
    }

    fn postfix(&mut self) -> Result<Expr, FormulaError> {
        let base = self.depth;
        let mut expr = self.primary()?;
        while *self.peek() == TokenKind::Dot {
            self.enter()?;
            self.advance();
            let line = self.line();
            let name = match self.peek().clone() {
                TokenKind::Ident(name) => {
                    self.advance();
                    name
                }
                _ => return Err(self.unexpected("field name")),
            };
            let field = RateField::parse(&name)
                .ok_or(FormulaError::UnknownField { line, field: name })?;
            expr = Expr::Field {
                target: Box::new(expr),
                field,
            };
        }
        self.depth = base;
        Ok(expr)
    }

    fn primary(&mut self) -> Result<Expr, FormulaError> {
        let line = self.line();
        match self.peek().clone() {
            TokenKind::Number(n) => {
                self.advance();
                Ok(Expr::Number(n))
            }
            TokenKind::Str(s) => {
                self.advance();
                Ok(Expr::Str(s))
            }
            TokenKind::LParen => {
                self.advance();
                let inner = self.expr()?;
                self.expect(TokenKind::RParen, "')'")?;
                Ok(inner)
            }
            TokenKind::Ident(name) => {
                self.advance();
                if *self.peek() != TokenKind::LParen {
                    return Ok(Expr::Var(name));
                }
                self.advance();
                let func = Builtin::parse(&name)
                    .ok_or_else(|| FormulaError::UnknownFunction { line, name: name.clone() })?;
                let args = self.args()?;
                if args.len() != func.arity() {
                    return Err(FormulaError::Arity {
                        line,
                        name,
                        expected: func.arity(),
                        got: args.len(),
                    });
                }
                Ok(Expr::Call { func, args })
            }
            _ => Err(self.unexpected("expression")),
        }
    }

    fn args(&mut self) -> Result<Vec<Expr>, FormulaError> {
        let mut args = Vec::new();
        if *self.peek() == TokenKind::RParen {
            self.advance();
            return Ok(args);
        }
        loop {
            args.push(self.expr()?);
            match self.peek() {
                TokenKind::Comma => {
                    self.advance();
                }
                TokenKind::RParen => {
                    self.advance();
                    return Ok(args);
                }
                _ => return Err(self.unexpected("',' or ')'")),
            }
        }
    }

    fn peek(&self) -> &TokenKind {
        self.tokens
            .get(self.pos)
            .map(|t| &t.kind)
            .unwrap_or(&TokenKind::Eof)
    }

    fn line(&self) -> usize {
        self.tokens
            .get(self.pos)
            .or_else(|| self.tokens.last())
            .map_or(1, |t| t.line)
    }

    fn advance(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: TokenKind, expected: &str) -> Result<(), FormulaError> {
        if *self.peek() == kind {
            self.advance();
            Ok(())
        } else {
            Err(self.unexpected(expected))
        }
    }

    fn enter(&mut self) -> Result<(), FormulaError> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(FormulaError::Syntax {
                line: self.line(),
                expected: format!("at most {MAX_DEPTH} levels of nesting"),
                found: "deeper expression".to_string(),
            });
        }
        Ok(())
    }

    fn unexpected(&self, expected: &str) -> FormulaError {
        FormulaError::Syntax {
            line: self.line(),
            expected: expected.to_string(),
            found: self.peek().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::script::lexer::tokenize;
    use rust_decimal_macros::dec;

    fn parse(source: &str) -> Result<Vec<Statement>, FormulaError> {
        Parser::new(tokenize(source)?).parse_program()
    }

    #[test]
    fn test_precedence() {
        let stmts = parse("x = 1 + 2 * 3").unwrap();
        assert_eq!(
            stmts[0].expr,
            Expr::Binary {
                op: BinaryOp::Add,
                lhs: Box::new(Expr::Number(dec!(1))),
                rhs: Box::new(Expr::Binary {
                    op: BinaryOp::Mul,
                    lhs: Box::new(Expr::Number(dec!(2))),
                    rhs: Box::new(Expr::Number(dec!(3))),
                }),
            }
        );
    }

    #[test]
    fn test_call_and_field() {
        let stmts = parse("\n\nbid = rate(key).bid").unwrap();
        assert_eq!(stmts.len(), 1);
        assert_eq!(stmts[0].line, 3);
        assert_eq!(
            stmts[0].expr,
            Expr::Field {
                target: Box::new(Expr::Call {
                    func: Builtin::Rate,
                    args: vec![Expr::Var("key".into())],
                }),
                field: RateField::Bid,
            }
        );
    }

    #[test]
    fn test_unary_minus_and_parens() {
        let stmts = parse("x = -(1 - 2)").unwrap();
        assert!(matches!(stmts[0].expr, Expr::Neg(_)));
    }

    #[test]
    fn test_rejects_unknown_function_and_field() {
        assert!(matches!(
            parse("x = sqrt(2)"),
            Err(FormulaError::UnknownFunction { name, .. }) if name == "sqrt"
        ));
        assert!(matches!(
            parse("x = rate('A').spread"),
            Err(FormulaError::UnknownField { field, .. }) if field == "spread"
        ));
    }

    #[test]
    fn test_rejects_wrong_arity() {
        assert!(matches!(
            parse("x = round(1)"),
            Err(FormulaError::Arity { expected: 2, got: 1, .. })
        ));
        assert!(parse("x = now()").is_ok());
    }

    #[test]
    fn test_syntax_errors_report_line() {
        let err = parse("x = 1\ny = (2 + 3").unwrap_err();
        assert!(matches!(err, FormulaError::Syntax { line: 2, .. }));

        let err = parse("x = 1 2").unwrap_err();
        assert!(matches!(err, FormulaError::Syntax { line: 1, .. }));

        assert!(parse("= 3").is_err());
    }

    #[test]
    fn test_rejects_excessive_nesting() {
        let minus = format!("x = {}1", "-".repeat(10_000));
        assert!(matches!(parse(&minus), Err(FormulaError::Syntax { line: 1, .. })));

        let parens = format!("x = {}1{}", "(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(parse(&parens), Err(FormulaError::Syntax { .. })));

        let chain = format!("x = 1{}", " + 1".repeat(10_000));
        assert!(matches!(parse(&chain), Err(FormulaError::Syntax { .. })));

        let nested_calls = format!("x = {}1{}", "abs(".repeat(10_000), ")".repeat(10_000));
        assert!(matches!(parse(&nested_calls), Err(FormulaError::Syntax { .. })));
    }

    #[test]
    fn test_accepts_moderate_nesting() {
        let minus = format!("x = {}1", "-".repeat(40));
        assert!(parse(&minus).is_ok());

        let parens = format!("x = {}1{}", "(".repeat(20), ")".repeat(20));
        assert!(parse(&parens).is_ok());

        let chain = format!("x = 1{}", " + 1".repeat(50));
        assert!(parse(&chain).is_ok());
    }
}
