//! Arithmetic expressions for `calc` transforms, e.g. `endsAt - startsAt`
//! or `(price * quantity) / 100`. Identifiers are value paths into the row.

use serde_json::Value;

use crate::error::CoreError;
use crate::path;
use crate::Row;

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Field(String),
    Neg(Box<Expr>),
    Binary(Box<Expr>, BinOp, Box<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Ident(String),
    Op(char),
    Open,
    Close,
}

fn tokenize(input: &str) -> Result<Vec<Token>, CoreError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = input.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' => i += 1,
            '+' | '-' | '*' | '/' => {
                tokens.push(Token::Op(c));
                i += 1;
            }
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = literal
                    .parse::<f64>()
                    .map_err(|_| CoreError::InvalidExpression(format!("bad number {literal}")))?;
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len()
                    && (chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => {
                return Err(CoreError::InvalidExpression(format!(
                    "unexpected character {other:?} in {input:?}"
                )));
            }
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    // expr := term (('+' | '-') term)*
    fn expr(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.term()?;
        while let Some(Token::Op(op @ ('+' | '-'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.term()?;
            let op = if op == '+' { BinOp::Add } else { BinOp::Sub };
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    // term := unary (('*' | '/') unary)*
    fn term(&mut self) -> Result<Expr, CoreError> {
        let mut left = self.unary()?;
        while let Some(Token::Op(op @ ('*' | '/'))) = self.peek().cloned() {
            self.pos += 1;
            let right = self.unary()?;
            let op = if op == '*' { BinOp::Mul } else { BinOp::Div };
            left = Expr::Binary(Box::new(left), op, Box::new(right));
        }
        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, CoreError> {
        if let Some(Token::Op('-')) = self.peek() {
            self.pos += 1;
            return Ok(Expr::Neg(Box::new(self.unary()?)));
        }
        self.atom()
    }

    fn atom(&mut self) -> Result<Expr, CoreError> {
        match self.next() {
            Some(Token::Number(n)) => Ok(Expr::Number(n)),
            Some(Token::Ident(name)) => Ok(Expr::Field(name)),
            Some(Token::Open) => {
                let inner = self.expr()?;
                match self.next() {
                    Some(Token::Close) => Ok(inner),
                    _ => Err(CoreError::InvalidExpression("missing ')'".into())),
                }
            }
            other => Err(CoreError::InvalidExpression(format!(
                "unexpected token {other:?}"
            ))),
        }
    }
}

impl Expr {
    pub fn parse(input: &str) -> Result<Self, CoreError> {
        let tokens = tokenize(input)?;
        if tokens.is_empty() {
            return Err(CoreError::InvalidExpression("empty expression".into()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let expr = parser.expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(CoreError::InvalidExpression(format!(
                "trailing input in {input:?}"
            )));
        }
        Ok(expr)
    }

    /// Evaluates against `row`. Missing or non-numeric fields, and division
    /// by zero, yield `None`.
    pub fn eval(&self, row: &Row) -> Option<f64> {
        match self {
            Expr::Number(n) => Some(*n),
            Expr::Field(name) => match path::lookup_in(row, name)? {
                Value::Number(n) => n.as_f64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            },
            Expr::Neg(inner) => inner.eval(row).map(|v| -v),
            Expr::Binary(left, op, right) => {
                let (l, r) = (left.eval(row)?, right.eval(row)?);
                match op {
                    BinOp::Add => Some(l + r),
                    BinOp::Sub => Some(l - r),
                    BinOp::Mul => Some(l * r),
                    BinOp::Div if r == 0.0 => None,
                    BinOp::Div => Some(l / r),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> Row {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn precedence_and_parentheses() {
        let data = Row::new();
        assert_eq!(Expr::parse("1 + 2 * 3").unwrap().eval(&data), Some(7.0));
        assert_eq!(Expr::parse("(1 + 2) * 3").unwrap().eval(&data), Some(9.0));
        assert_eq!(Expr::parse("-4 + 10").unwrap().eval(&data), Some(6.0));
    }

    #[test]
    fn fields_resolve_through_paths() {
        let data = row(json!({ "startsAt": 1000, "window": { "endsAt": 4500 } }));
        let expr = Expr::parse("window.endsAt - startsAt").unwrap();
        assert_eq!(expr.eval(&data), Some(3500.0));
    }

    #[test]
    fn missing_field_and_zero_division_yield_none() {
        let data = row(json!({ "a": 1 }));
        assert_eq!(Expr::parse("a + b").unwrap().eval(&data), None);
        assert_eq!(Expr::parse("a / 0").unwrap().eval(&data), None);
    }

    #[test]
    fn malformed_expressions_are_rejected() {
        assert!(Expr::parse("").is_err());
        assert!(Expr::parse("(1 + 2").is_err());
        assert!(Expr::parse("1 +").is_err());
        assert!(Expr::parse("a ; b").is_err());
        assert!(Expr::parse("1 2").is_err());
    }
}
