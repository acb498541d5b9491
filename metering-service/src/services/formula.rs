//! Arithmetic expressions for custom billing dimensions.
//!
//! A formula is parsed once into an [`Expr`] tree and evaluated per contract
//! against a fixed set of numeric variables. Literals, the whitelisted
//! variables, `+ - * / // % **`, unary signs, parentheses and the functions
//! `abs min max round int float` are accepted; anything else is a parse error.

use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// Base usage dimensions a formula may reference.
pub const BASE_DIMENSIONS: [&str; 4] = [
    "memory_byte_hours",
    "storage_allocated_byte_hours",
    "cpu_core_hours",
    "replica_hours",
];

pub const PRICE_SUFFIX: &str = "_price_per_unit";

#[derive(Debug, Error, PartialEq)]
pub enum FormulaError {
    #[error("invalid formula: {0}")]
    Parse(String),

    #[error("unknown variable '{0}'")]
    UnknownVariable(String),

    #[error("unsupported function '{0}'")]
    UnknownFunction(String),

    #[error("evaluation failed: {0}")]
    Evaluation(String),
}

/// Variable bindings for one evaluation.
pub type Variables = HashMap<String, f64>;

/// Names a formula may reference: each base dimension and its unit price.
pub fn allowed_variables() -> Vec<String> {
    BASE_DIMENSIONS
        .iter()
        .flat_map(|dim| [dim.to_string(), format!("{dim}{PRICE_SUFFIX}")])
        .collect()
}

/// A parsed formula, ready to evaluate.
#[derive(Debug, Clone, PartialEq)]
pub struct Formula {
    source: String,
    expr: Expr,
}

impl Formula {
    pub fn parse(source: &str) -> Result<Self, FormulaError> {
        let tokens = Lexer::new(source).collect::<Result<Vec<_>, _>>()?;
        if tokens.is_empty() {
            return Err(FormulaError::Parse("formula cannot be empty".into()));
        }

        let allowed = allowed_variables();
        let mut parser = Parser::new(tokens, &allowed);
        let expr = parser.parse_expression()?;
        parser.expect_end()?;

        Ok(Self {
            source: source.to_string(),
            expr,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    /// Evaluates against `vars`. Missing bindings read as 0.
    pub fn evaluate(&self, vars: &Variables) -> Result<f64, FormulaError> {
        self.expr.eval(vars)
    }
}

impl fmt::Display for Formula {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Number(f64),
    Variable(String),
    Negate(Box<Expr>),
    Binary(BinaryOp, Box<Expr>, Box<Expr>),
    Call(Function, Vec<Expr>),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    FloorDiv,
    Mod,
    Pow,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Function {
    Abs,
    Min,
    Max,
    Round,
    Int,
    Float,
}

impl Function {
    fn from_name(name: &str) -> Option<Self> {
        match name {
            "abs" => Some(Function::Abs),
            "min" => Some(Function::Min),
            "max" => Some(Function::Max),
            "round" => Some(Function::Round),
            "int" => Some(Function::Int),
            "float" => Some(Function::Float),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Function::Abs => "abs",
            Function::Min => "min",
            Function::Max => "max",
            Function::Round => "round",
            Function::Int => "int",
            Function::Float => "float",
        }
    }

    fn accepts(&self, arity: usize) -> bool {
        match self {
            Function::Abs | Function::Int | Function::Float => arity == 1,
            Function::Round => arity == 1 || arity == 2,
            Function::Min | Function::Max => arity >= 2,
        }
    }

    fn apply(&self, args: &[f64]) -> Result<f64, FormulaError> {
        match (self, args) {
            (Function::Abs, [x]) => Ok(x.abs()),
            (Function::Int, [x]) => {
                if x.is_finite() {
                    Ok(x.trunc())
                } else {
                    Err(FormulaError::Evaluation(format!(
                        "cannot convert {x} to integer"
                    )))
                }
            }
            (Function::Float, [x]) => Ok(*x),
            (Function::Round, [x]) => Ok(x.round_ties_even()),
            (Function::Round, [x, digits]) => {
                if digits.fract() != 0.0 {
                    return Err(FormulaError::Evaluation(
                        "round() digits must be an integer".into(),
                    ));
                }
                // f64 carries at most 17 significant digits.
                if *digits >= 17.0 {
                    return Ok(*x);
                }
                let scale = 10f64.powi(*digits as i32);
                if scale == 0.0 {
                    return Ok(0.0 * x);
                }
                let scaled = x * scale;
                if !scaled.is_finite() {
                    return Ok(*x);
                }
                Ok(scaled.round_ties_even() / scale)
            }
            (Function::Min, _) => Ok(args.iter().copied().fold(f64::INFINITY, f64::min)),
            (Function::Max, _) => Ok(args.iter().copied().fold(f64::NEG_INFINITY, f64::max)),
            _ => Err(FormulaError::Evaluation(format!(
                "{}() called with {} arguments",
                self.name(),
                args.len()
            ))),
        }
    }
}

impl Expr {
    fn eval(&self, vars: &Variables) -> Result<f64, FormulaError> {
        match self {
            Expr::Number(n) => Ok(*n),
            Expr::Variable(name) => Ok(vars.get(name).copied().unwrap_or(0.0)),
            Expr::Negate(inner) => Ok(-inner.eval(vars)?),
            Expr::Binary(op, lhs, rhs) => {
                let a = lhs.eval(vars)?;
                let b = rhs.eval(vars)?;
                apply_binary(*op, a, b)
            }
            Expr::Call(function, args) => {
                let values = args
                    .iter()
                    .map(|arg| arg.eval(vars))
                    .collect::<Result<Vec<_>, _>>()?;
                function.apply(&values)
            }
        }
    }
}

fn apply_binary(op: BinaryOp, a: f64, b: f64) -> Result<f64, FormulaError> {
    let division_by_zero = || FormulaError::Evaluation("division by zero".into());
    match op {
        BinaryOp::Add => Ok(a + b),
        BinaryOp::Sub => Ok(a - b),
        BinaryOp::Mul => Ok(a * b),
        BinaryOp::Div => {
            if b == 0.0 {
                return Err(division_by_zero());
            }
            Ok(a / b)
        }
        BinaryOp::FloorDiv => {
            if b == 0.0 {
                return Err(division_by_zero());
            }
            Ok((a / b).floor())
        }
        BinaryOp::Mod => {
            if b == 0.0 {
                return Err(division_by_zero());
            }
            // Result takes the sign of the divisor.
            let r = a % b;
            if r != 0.0 && (r < 0.0) != (b < 0.0) {
                Ok(r + b)
            } else {
                Ok(r)
            }
        }
        BinaryOp::Pow => {
            if a == 0.0 && b < 0.0 {
                return Err(FormulaError::Evaluation(
                    "zero cannot be raised to a negative power".into(),
                ));
            }
            Ok(a.powf(b))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Number(f64),
    Identifier(String),
    Plus,
    Minus,
    Star,
    DoubleStar,
    Slash,
    DoubleSlash,
    Percent,
    LParen,
    RParen,
    Comma,
}

struct Lexer<'a> {
    input: &'a str,
    position: usize,
}

impl<'a> Lexer<'a> {
    fn new(input: &'a str) -> Self {
        Self { input, position: 0 }
    }
}

impl<'a> Iterator for Lexer<'a> {
    type Item = Result<Token, FormulaError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.consume_whitespace();
        let ch = self.peek_char()?;

        let token = if is_identifier_start(ch) {
            Ok(self.consume_identifier())
        } else if ch.is_ascii_digit() || ch == '.' {
            self.consume_number()
        } else {
            self.advance();
            match ch {
                '+' => Ok(Token::Plus),
                '-' => Ok(Token::Minus),
                '%' => Ok(Token::Percent),
                '(' => Ok(Token::LParen),
                ')' => Ok(Token::RParen),
                ',' => Ok(Token::Comma),
                '*' => {
                    if self.peek_char() == Some('*') {
                        self.advance();
                        Ok(Token::DoubleStar)
                    } else {
                        Ok(Token::Star)
                    }
                }
                '/' => {
                    if self.peek_char() == Some('/') {
                        self.advance();
                        Ok(Token::DoubleSlash)
                    } else {
                        Ok(Token::Slash)
                    }
                }
                _ => Err(FormulaError::Parse(format!("unexpected character '{ch}'"))),
            }
        };

        Some(token)
    }
}

impl<'a> Lexer<'a> {
    fn consume_whitespace(&mut self) {
        while let Some(ch) = self.peek_char() {
            if ch.is_whitespace() {
                self.advance();
            } else {
                break;
            }
        }
    }

    fn consume_identifier(&mut self) -> Token {
        let start = self.position;
        while let Some(ch) = self.peek_char() {
            if is_identifier_part(ch) {
                self.advance();
            } else {
                break;
            }
        }
        Token::Identifier(self.input[start..self.position].to_string())
    }

    fn consume_number(&mut self) -> Result<Token, FormulaError> {
        let start = self.position;
        while let Some(ch) = self.peek_char() {
            if ch.is_ascii_digit() || ch == '.' {
                self.advance();
            } else {
                break;
            }
        }

        if matches!(self.peek_char(), Some('e' | 'E')) {
            self.advance();
            if matches!(self.peek_char(), Some('+' | '-')) {
                self.advance();
            }
            while let Some(ch) = self.peek_char() {
                if ch.is_ascii_digit() {
                    self.advance();
                } else {
                    break;
                }
            }
        }

        let literal = &self.input[start..self.position];
        if self.peek_char().is_some_and(is_identifier_start) {
            return Err(FormulaError::Parse(format!(
                "invalid number literal '{literal}'"
            )));
        }

        literal
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| FormulaError::Parse(format!("invalid number literal '{literal}'")))
    }

    fn peek_char(&self) -> Option<char> {
        self.input[self.position..].chars().next()
    }

    fn next_char(&mut self) -> Option<char> {
        let ch = self.peek_char()?;
        self.position += ch.len_utf8();
        Some(ch)
    }

    fn advance(&mut self) {
        self.next_char();
    }
}

fn is_identifier_start(ch: char) -> bool {
    ch.is_ascii_alphabetic() || ch == '_'
}

fn is_identifier_part(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

struct Parser<'v> {
    tokens: Vec<Token>,
    position: usize,
    allowed: &'v [String],
}

impl<'v> Parser<'v> {
    fn new(tokens: Vec<Token>, allowed: &'v [String]) -> Self {
        Self {
            tokens,
            position: 0,
            allowed,
        }
    }

    fn parse_expression(&mut self) -> Result<Expr, FormulaError> {
        let mut expr = self.parse_term()?;
        loop {
            let op = match self.current_token() {
                Some(Token::Plus) => BinaryOp::Add,
                Some(Token::Minus) => BinaryOp::Sub,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_term()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_term(&mut self) -> Result<Expr, FormulaError> {
        let mut expr = self.parse_unary()?;
        loop {
            let op = match self.current_token() {
                Some(Token::Star) => BinaryOp::Mul,
                Some(Token::Slash) => BinaryOp::Div,
                Some(Token::DoubleSlash) => BinaryOp::FloorDiv,
                Some(Token::Percent) => BinaryOp::Mod,
                _ => break,
            };
            self.advance();
            let rhs = self.parse_unary()?;
            expr = Expr::Binary(op, Box::new(expr), Box::new(rhs));
        }
        Ok(expr)
    }

    fn parse_unary(&mut self) -> Result<Expr, FormulaError> {
        match self.current_token() {
            Some(Token::Minus) => {
                self.advance();
                Ok(Expr::Negate(Box::new(self.parse_unary()?)))
            }
            Some(Token::Plus) => {
                self.advance();
                self.parse_unary()
            }
            _ => self.parse_power(),
        }
    }

    // `**` binds tighter than unary minus on its left and is right-associative.
    fn parse_power(&mut self) -> Result<Expr, FormulaError> {
        let base = self.parse_primary()?;
        if self.current_token() == Some(&Token::DoubleStar) {
            self.advance();
            let exponent = self.parse_unary()?;
            return Ok(Expr::Binary(
                BinaryOp::Pow,
                Box::new(base),
                Box::new(exponent),
            ));
        }
        Ok(base)
    }

    fn parse_primary(&mut self) -> Result<Expr, FormulaError> {
        let token = self
            .current_token()
            .cloned()
            .ok_or_else(|| FormulaError::Parse("unexpected end of formula".into()))?;
        self.advance();

        match token {
            Token::Number(value) => Ok(Expr::Number(value)),
            Token::LParen => {
                let expr = self.parse_expression()?;
                self.expect(&Token::RParen, "')'")?;
                Ok(expr)
            }
            Token::Identifier(name) => {
                if self.current_token() == Some(&Token::LParen) {
                    self.advance();
                    self.parse_call(&name)
                } else if self.allowed.iter().any(|allowed| allowed == &name) {
                    Ok(Expr::Variable(name))
                } else {
                    Err(FormulaError::UnknownVariable(name))
                }
            }
            other => Err(FormulaError::Parse(format!("unexpected token {other:?}"))),
        }
    }

    fn parse_call(&mut self, name: &str) -> Result<Expr, FormulaError> {
        let function =
            Function::from_name(name).ok_or_else(|| FormulaError::UnknownFunction(name.into()))?;

        let mut args = Vec::new();
        if self.current_token() != Some(&Token::RParen) {
            loop {
                args.push(self.parse_expression()?);
                if self.current_token() == Some(&Token::Comma) {
                    self.advance();
                } else {
                    break;
                }
            }
        }
        self.expect(&Token::RParen, "')'")?;

        if !function.accepts(args.len()) {
            return Err(FormulaError::Parse(format!(
                "{}() does not take {} arguments",
                function.name(),
                args.len()
            )));
        }
        Ok(Expr::Call(function, args))
    }

    fn expect(&mut self, token: &Token, label: &str) -> Result<(), FormulaError> {
        if self.current_token() == Some(token) {
            self.advance();
            Ok(())
        } else {
            Err(FormulaError::Parse(format!("expected {label}")))
        }
    }

    fn expect_end(&self) -> Result<(), FormulaError> {
        if self.position >= self.tokens.len() {
            Ok(())
        } else {
            Err(FormulaError::Parse(
                "unexpected tokens after expression".into(),
            ))
        }
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn advance(&mut self) {
        if self.position < self.tokens.len() {
            self.position += 1;
        }
    }
}
