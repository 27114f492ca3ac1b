use rust_decimal::Decimal;
use std::fmt;
use std::str::FromStr;

use super::FormulaError;

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum TokenKind {
    Number(Decimal),
    Str(String),
    Ident(String),
    Plus,
    Minus,
    Star,
    Slash,
    LParen,
    RParen,
    Comma,
    Dot,
    Assign,
    /// Newline or `;`.
    Separator,
    Eof,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {}", n),
            TokenKind::Str(s) => write!(f, "string {:?}", s),
            TokenKind::Ident(s) => write!(f, "identifier {}", s),
            TokenKind::Plus => f.write_str("'+'"),
            TokenKind::Minus => f.write_str("'-'"),
            TokenKind::Star => f.write_str("'*'"),
            TokenKind::Slash => f.write_str("'/'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::Dot => f.write_str("'.'"),
            TokenKind::Assign => f.write_str("'='"),
            TokenKind::Separator => f.write_str("end of statement"),
            TokenKind::Eof => f.write_str("end of input"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Token {
    pub kind: TokenKind,
    pub line: usize,
}

pub(crate) fn tokenize(source: &str) -> Result<Vec<Token>, FormulaError> {
    let mut tokens = Vec::new();
    let mut chars = source.chars().peekable();
    let mut line = 1;

    while let Some(&c) = chars.peek() {
        let kind = match c {
            '\n' | ';' => {
                chars.next();
                let kind = TokenKind::Separator;
                tokens.push(Token { kind, line });
                if c == '\n' {
                    line += 1;
                }
                continue;
            }
            c if c.is_whitespace() => {
                chars.next();
                continue;
            }
            '#' => {
                while let Some(&c) = chars.peek() {
                    if c == '\n' {
                        break;
                    }
                    chars.next();
                }
                continue;
            }
            '+' => single(&mut chars, TokenKind::Plus),
            '-' => single(&mut chars, TokenKind::Minus),
            '*' => single(&mut chars, TokenKind::Star),
            '/' => single(&mut chars, TokenKind::Slash),
            '(' => single(&mut chars, TokenKind::LParen),
            ')' => single(&mut chars, TokenKind::RParen),
            ',' => single(&mut chars, TokenKind::Comma),
            '.' => single(&mut chars, TokenKind::Dot),
            '=' => single(&mut chars, TokenKind::Assign),
            '"' | '\'' => {
                let quote = c;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(ch) if ch == quote => break,
                        Some('\n') | None => return Err(FormulaError::UnterminatedString { line }),
                        Some(ch) => text.push(ch),
                    }
                }
                TokenKind::Str(text)
            }
            c if c.is_ascii_digit() => {
                let mut text = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                let value = Decimal::from_str(&text)
                    .map_err(|_| FormulaError::InvalidNumber { line, text: text.clone() })?;
                TokenKind::Number(value)
            }
            c if c.is_alphabetic() || c == '_' => {
                let mut text = String::new();
                while let Some(&ch) = chars.peek() {
                    if ch.is_alphanumeric() || ch == '_' {
                        text.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                TokenKind::Ident(text)
            }
            other => return Err(FormulaError::UnexpectedChar { line, ch: other }),
        };
        tokens.push(Token { kind, line });
    }

    tokens.push(Token {
        kind: TokenKind::Eof,
        line,
    });
    Ok(tokens)
}

fn single(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, kind: TokenKind) -> TokenKind {
    chars.next();
    kind
}
