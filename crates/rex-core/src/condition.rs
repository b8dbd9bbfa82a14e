// Rex Core - Boolean condition evaluator
//
// Guard conditions use a minimal expression language: literals
// (true/false/null, numbers, quoted strings), dotted variable references,
// comparisons (== != < <= > >=), not/and/or (symbolic or word form), and
// parentheses. Evaluation failures are deterministic errors attributed to
// the owning step by the dispatcher.

use serde_json::Value;

use crate::context::Context;
use crate::error::{RexError, RexResult};
use crate::template::resolve_path;

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Bool(bool),
    Null,
    Number(f64),
    Str(String),
    Ident(String),
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    Not,
    And,
    Or,
    LParen,
    RParen,
}

fn tokenize(input: &str) -> RexResult<Vec<Token>> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '=' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Eq);
                i += 2;
            }
            '!' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ne);
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Le);
                i += 2;
            }
            '<' => {
                tokens.push(Token::Lt);
                i += 1;
            }
            '>' if chars.get(i + 1) == Some(&'=') => {
                tokens.push(Token::Ge);
                i += 2;
            }
            '>' => {
                tokens.push(Token::Gt);
                i += 1;
            }
            '&' if chars.get(i + 1) == Some(&'&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if chars.get(i + 1) == Some(&'|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '"' | '\'' => {
                let quote = c;
                let start = i + 1;
                let mut j = start;
                while j < chars.len() && chars[j] != quote {
                    j += 1;
                }
                if j >= chars.len() {
                    return Err(RexError::condition(format!(
                        "Unterminated string literal in condition: {input}"
                    )));
                }
                tokens.push(Token::Str(chars[start..j].iter().collect()));
                i = j + 1;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let n = text.parse::<f64>().map_err(|_| {
                    RexError::condition(format!("Invalid number '{text}' in condition"))
                })?;
                tokens.push(Token::Number(n));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_ascii_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                tokens.push(match word.as_str() {
                    "true" => Token::Bool(true),
                    "false" => Token::Bool(false),
                    "null" => Token::Null,
                    "not" => Token::Not,
                    "and" => Token::And,
                    "or" => Token::Or,
                    _ => Token::Ident(word),
                });
            }
            other => {
                return Err(RexError::condition(format!(
                    "Unexpected character '{other}' in condition: {input}"
                )))
            }
        }
    }

    Ok(tokens)
}

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    context: &'a Context,
    source: &'a str,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn unexpected_end(&self) -> RexError {
        RexError::condition(format!("Unexpected end of condition: {}", self.source))
    }

    // or_expr := and_expr ( OR and_expr )*
    fn parse_or(&mut self) -> RexResult<Value> {
        let mut value = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.next();
            let rhs = self.parse_and()?;
            value = Value::Bool(truthy(&value) || truthy(&rhs));
        }
        Ok(value)
    }

    // and_expr := not_expr ( AND not_expr )*
    fn parse_and(&mut self) -> RexResult<Value> {
        let mut value = self.parse_not()?;
        while self.peek() == Some(&Token::And) {
            self.next();
            let rhs = self.parse_not()?;
            value = Value::Bool(truthy(&value) && truthy(&rhs));
        }
        Ok(value)
    }

    // not_expr := NOT not_expr | comparison
    fn parse_not(&mut self) -> RexResult<Value> {
        if self.peek() == Some(&Token::Not) {
            self.next();
            let value = self.parse_not()?;
            return Ok(Value::Bool(!truthy(&value)));
        }
        self.parse_comparison()
    }

    // comparison := primary ( (== | != | < | <= | > | >=) primary )?
    fn parse_comparison(&mut self) -> RexResult<Value> {
        let lhs = self.parse_primary()?;
        let op = match self.peek() {
            Some(Token::Eq) => Token::Eq,
            Some(Token::Ne) => Token::Ne,
            Some(Token::Lt) => Token::Lt,
            Some(Token::Le) => Token::Le,
            Some(Token::Gt) => Token::Gt,
            Some(Token::Ge) => Token::Ge,
            _ => return Ok(lhs),
        };
        self.next();
        let rhs = self.parse_primary()?;

        let result = match op {
            Token::Eq => values_equal(&lhs, &rhs),
            Token::Ne => !values_equal(&lhs, &rhs),
            op => {
                let (l, r) = match (as_number(&lhs), as_number(&rhs)) {
                    (Some(l), Some(r)) => (l, r),
                    _ => {
                        return Err(RexError::condition(format!(
                            "Ordered comparison requires numbers in condition: {}",
                            self.source
                        )))
                    }
                };
                match op {
                    Token::Lt => l < r,
                    Token::Le => l <= r,
                    Token::Gt => l > r,
                    Token::Ge => l >= r,
                    _ => unreachable!(),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    // primary := literal | variable | '(' or_expr ')'
    fn parse_primary(&mut self) -> RexResult<Value> {
        match self.next().ok_or_else(|| self.unexpected_end())? {
            Token::Bool(b) => Ok(Value::Bool(b)),
            Token::Null => Ok(Value::Null),
            Token::Number(n) => Ok(serde_json::Number::from_f64(n)
                .map(Value::Number)
                .unwrap_or(Value::Null)),
            Token::Str(s) => Ok(Value::String(s)),
            Token::Ident(path) => resolve_path(self.context, &path)
                .map(Clone::clone)
                .map_err(|e| RexError::condition(e.to_string())),
            Token::LParen => {
                let value = self.parse_or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(value),
                    _ => Err(RexError::condition(format!(
                        "Missing closing parenthesis in condition: {}",
                        self.source
                    ))),
                }
            }
            other => Err(RexError::condition(format!(
                "Unexpected token {other:?} in condition: {}",
                self.source
            ))),
        }
    }
}

fn as_number(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn values_equal(lhs: &Value, rhs: &Value) -> bool {
    match (as_number(lhs), as_number(rhs)) {
        (Some(l), Some(r)) => l == r,
        _ => lhs == rhs,
    }
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|n| n != 0.0).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Evaluate a guard condition against the context
pub fn evaluate_condition(expression: &str, context: &Context) -> RexResult<bool> {
    let tokens = tokenize(expression)?;
    if tokens.is_empty() {
        return Err(RexError::condition("Empty condition expression"));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        context,
        source: expression,
    };
    let value = parser.parse_or()?;
    if parser.pos != parser.tokens.len() {
        return Err(RexError::condition(format!(
            "Trailing tokens in condition: {expression}"
        )));
    }
    Ok(truthy(&value))
}
