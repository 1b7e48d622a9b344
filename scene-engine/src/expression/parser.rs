// Expression Parser
// Parses tokens into an AST for condition expressions

use crate::expression::lexer::{LexError, Lexer, Token};

use std::fmt;
use thiserror::Error;

/// Abstract Syntax Tree node for expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    /// Null literal
    Null,

    /// Boolean literal
    Bool(bool),

    /// Number literal
    Number(f64),

    /// String literal
    String(String),

    /// State path reference: agv1.sensor, zones['a'].occupied
    Reference(Reference),

    /// Function call: contains(str, 'substr'), max(a, b)
    FunctionCall { name: String, args: Vec<Expr> },

    /// Index access on a computed value: max(a, b)[0]
    Index { object: Box<Expr>, index: Box<Expr> },

    /// Member access on a computed value: (a).length
    Member { object: Box<Expr>, property: String },

    /// Unary operation: !expr
    Unary { op: UnaryOp, expr: Box<Expr> },

    /// Binary operation: a == b, a && b
    Binary {
        op: BinaryOp,
        left: Box<Expr>,
        right: Box<Expr>,
    },

    /// Ternary/conditional: condition ? then : else
    Ternary {
        condition: Box<Expr>,
        then_expr: Box<Expr>,
        else_expr: Box<Expr>,
    },

    /// Array literal: [1, 2, 3]
    Array(Vec<Expr>),
}

/// Reference to a state path
#[derive(Debug, Clone, PartialEq)]
pub struct Reference {
    pub parts: Vec<ReferencePart>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReferencePart {
    /// Property access by name
    Property(String),
    /// Index access by key/index
    Index(Box<Expr>),
}

impl Reference {
    pub fn new(name: String) -> Self {
        Self {
            parts: vec![ReferencePart::Property(name)],
        }
    }

    pub fn with_property(mut self, name: String) -> Self {
        self.parts.push(ReferencePart::Property(name));
        self
    }

    pub fn with_index(mut self, index: Expr) -> Self {
        self.parts.push(ReferencePart::Index(Box::new(index)));
        self
    }

    /// Leading property names joined with '.', up to the first index access
    pub fn dotted_prefix(&self) -> String {
        self.parts
            .iter()
            .map_while(|part| match part {
                ReferencePart::Property(name) => Some(name.as_str()),
                ReferencePart::Index(_) => None,
            })
            .collect::<Vec<_>>()
            .join(".")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    Not, // !
    Neg, // - (unary minus)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    fn from_token(token: &Token) -> Option<Self> {
        let op = match token {
            Token::Plus => BinaryOp::Add,
            Token::Minus => BinaryOp::Sub,
            Token::Star => BinaryOp::Mul,
            Token::Slash => BinaryOp::Div,
            Token::Percent => BinaryOp::Mod,
            Token::Eq => BinaryOp::Eq,
            Token::Ne => BinaryOp::Ne,
            Token::Lt => BinaryOp::Lt,
            Token::Le => BinaryOp::Le,
            Token::Gt => BinaryOp::Gt,
            Token::Ge => BinaryOp::Ge,
            Token::And => BinaryOp::And,
            Token::Or => BinaryOp::Or,
            _ => return None,
        };
        Some(op)
    }

    /// Binding strength; every level is left-associative
    fn precedence(self) -> u8 {
        match self {
            BinaryOp::Or => 1,
            BinaryOp::And => 2,
            BinaryOp::Eq | BinaryOp::Ne => 3,
            BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => 4,
            BinaryOp::Add | BinaryOp::Sub => 5,
            BinaryOp::Mul | BinaryOp::Div | BinaryOp::Mod => 6,
        }
    }

    fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::Mod => "%",
            BinaryOp::Eq => "==",
            BinaryOp::Ne => "!=",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::Gt => ">",
            BinaryOp::Ge => ">=",
            BinaryOp::And => "&&",
            BinaryOp::Or => "||",
        }
    }
}

impl fmt::Display for BinaryOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

/// Parser error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("parse error at position {position}: {message}")]
pub struct ParseExprError {
    pub message: String,
    pub position: usize,
}

impl From<LexError> for ParseExprError {
    fn from(err: LexError) -> Self {
        Self {
            message: err.message,
            position: err.position,
        }
    }
}

/// Precedence-climbing parser for condition expressions.
///
/// `cond ? a : b` binds loosest, then the binary operators by
/// [`BinaryOp::precedence`], then prefix `!`/`-`, then postfix `.name`,
/// `[index]` and `.method(args)`.
pub struct ExprParser {
    tokens: Vec<Token>,
    position: usize,
}

impl ExprParser {
    pub fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            position: 0,
        }
    }

    /// Parse expression from string
    pub fn parse_str(input: &str) -> Result<Expr, ParseExprError> {
        let tokens = Lexer::new(input).tokenize()?;
        Self::new(tokens).parse()
    }

    /// Parse the whole token stream into one expression
    pub fn parse(&mut self) -> Result<Expr, ParseExprError> {
        if self.at_end() {
            return Err(self.error("empty expression"));
        }

        let expr = self.expression()?;
        if !self.at_end() {
            return Err(self.error(&format!("unexpected token: {}", self.peek())));
        }
        Ok(expr)
    }

    fn expression(&mut self) -> Result<Expr, ParseExprError> {
        let condition = self.binary(1)?;
        if !self.eat(&Token::Question) {
            return Ok(condition);
        }

        let then_expr = self.expression()?;
        self.require(&Token::Colon, "expected ':' in ternary expression")?;
        let else_expr = self.expression()?;
        Ok(Expr::Ternary {
            condition: Box::new(condition),
            then_expr: Box::new(then_expr),
            else_expr: Box::new(else_expr),
        })
    }

    fn binary(&mut self, min_precedence: u8) -> Result<Expr, ParseExprError> {
        let mut left = self.unary()?;

        while let Some(op) = BinaryOp::from_token(self.peek()) {
            let precedence = op.precedence();
            if precedence < min_precedence {
                break;
            }
            self.position += 1;
            let right = self.binary(precedence + 1)?;
            left = Expr::Binary {
                op,
                left: Box::new(left),
                right: Box::new(right),
            };
        }

        Ok(left)
    }

    fn unary(&mut self) -> Result<Expr, ParseExprError> {
        let op = if self.eat(&Token::Not) {
            UnaryOp::Not
        } else if self.eat(&Token::Minus) {
            UnaryOp::Neg
        } else {
            return self.postfix();
        };

        Ok(Expr::Unary {
            op,
            expr: Box::new(self.unary()?),
        })
    }

    fn postfix(&mut self) -> Result<Expr, ParseExprError> {
        let mut expr = self.primary()?;

        loop {
            if self.eat(&Token::LBracket) {
                let index = self.bracketed_index()?;
                expr = Expr::Index {
                    object: Box::new(expr),
                    index: Box::new(index),
                };
            } else if self.eat(&Token::Dot) {
                let property = self.property_name()?;
                expr = if self.eat(&Token::LParen) {
                    // The receiver becomes the first argument
                    let mut args = vec![expr];
                    args.extend(self.list(&Token::RParen)?);
                    Expr::FunctionCall {
                        name: property,
                        args,
                    }
                } else {
                    Expr::Member {
                        object: Box::new(expr),
                        property,
                    }
                };
            } else {
                return Ok(expr);
            }
        }
    }

    fn primary(&mut self) -> Result<Expr, ParseExprError> {
        let token = self.peek().clone();
        self.position += 1;

        let expr = match token {
            Token::Null => Expr::Null,
            Token::True => Expr::Bool(true),
            Token::False => Expr::Bool(false),
            Token::Number(n) => Expr::Number(n),
            Token::String(s) => Expr::String(s),
            Token::Identifier(name) if self.eat(&Token::LParen) => Expr::FunctionCall {
                name,
                args: self.list(&Token::RParen)?,
            },
            Token::Identifier(name) => Expr::Reference(self.reference(name)?),
            Token::LParen => {
                let inner = self.expression()?;
                self.require(&Token::RParen, "expected ')'")?;
                inner
            }
            Token::LBracket => Expr::Array(self.list(&Token::RBracket)?),
            other => {
                self.position -= 1;
                return Err(self.error(&format!("unexpected token: {}", other)));
            }
        };
        Ok(expr)
    }

    /// Path segments following a root identifier. A trailing `.name(` is a
    /// method call and is left for [`Self::postfix`].
    fn reference(&mut self, root: String) -> Result<Reference, ParseExprError> {
        let mut reference = Reference::new(root);

        loop {
            if self.check(&Token::Dot) {
                let method_call = matches!(self.peek_at(1), Token::Identifier(_))
                    && matches!(self.peek_at(2), Token::LParen);
                if method_call {
                    return Ok(reference);
                }
                self.position += 1;
                reference = reference.with_property(self.property_name()?);
            } else if self.eat(&Token::LBracket) {
                reference = reference.with_index(self.bracketed_index()?);
            } else {
                return Ok(reference);
            }
        }
    }

    /// Comma-separated expressions up to `close`; a trailing comma is allowed
    fn list(&mut self, close: &Token) -> Result<Vec<Expr>, ParseExprError> {
        let mut items = Vec::new();
        while !self.eat(close) {
            if self.at_end() {
                return Err(self.error(&format!("expected '{}'", close)));
            }
            items.push(self.expression()?);
            if !self.eat(&Token::Comma) {
                self.require(close, &format!("expected ',' or '{}'", close))?;
                break;
            }
        }
        Ok(items)
    }

    fn bracketed_index(&mut self) -> Result<Expr, ParseExprError> {
        let index = self.expression()?;
        self.require(&Token::RBracket, "expected ']'")?;
        Ok(index)
    }

    fn property_name(&mut self) -> Result<String, ParseExprError> {
        match self.peek().clone() {
            Token::Identifier(name) => {
                self.position += 1;
                Ok(name)
            }
            _ => Err(self.error("expected property name after '.'")),
        }
    }

    fn peek(&self) -> &Token {
        self.peek_at(0)
    }

    fn peek_at(&self, offset: usize) -> &Token {
        self.tokens
            .get(self.position + offset)
            .unwrap_or(&Token::Eof)
    }

    fn check(&self, token: &Token) -> bool {
        std::mem::discriminant(self.peek()) == std::mem::discriminant(token)
    }

    /// Consume the next token if it has the same kind as `token`
    fn eat(&mut self, token: &Token) -> bool {
        let matched = self.check(token);
        if matched {
            self.position += 1;
        }
        matched
    }

    fn require(&mut self, token: &Token, message: &str) -> Result<(), ParseExprError> {
        if self.eat(token) {
            Ok(())
        } else {
            Err(self.error(message))
        }
    }

    fn at_end(&self) -> bool {
        matches!(self.peek(), Token::Eof)
    }

    fn error(&self, message: &str) -> ParseExprError {
        ParseExprError {
            message: message.to_string(),
            position: self.position,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_literals() {
        assert_eq!(ExprParser::parse_str("null").unwrap(), Expr::Null);
        assert_eq!(ExprParser::parse_str("true").unwrap(), Expr::Bool(true));
        assert_eq!(ExprParser::parse_str("42").unwrap(), Expr::Number(42.0));
        assert_eq!(
            ExprParser::parse_str("'hello'").unwrap(),
            Expr::String("hello".to_string())
        );
    }

    #[test]
    fn test_parse_dotted_reference() {
        let Expr::Reference(reference) = ExprParser::parse_str("agv1.sensor.value").unwrap()
        else {
            panic!("expected reference");
        };
        assert_eq!(reference.dotted_prefix(), "agv1.sensor.value");
    }

    #[test]
    fn test_dotted_prefix_stops_at_index() {
        let Expr::Reference(reference) = ExprParser::parse_str("zones[0].occupied").unwrap()
        else {
            panic!("expected reference");
        };
        assert_eq!(reference.dotted_prefix(), "zones");
        assert_eq!(reference.parts.len(), 3);
    }

    #[test]
    fn test_parse_method_call_on_reference() {
        let expr = ExprParser::parse_str("agv1.name.startsWith('AG')").unwrap();
        let Expr::FunctionCall { name, args } = expr else {
            panic!("expected function call");
        };
        assert_eq!(name, "startsWith");
        assert_eq!(args.len(), 2);
        assert!(matches!(&args[0], Expr::Reference(r) if r.dotted_prefix() == "agv1.name"));
    }

    #[test]
    fn test_parse_precedence() {
        let expr = ExprParser::parse_str("a || b && c").unwrap();
        let Expr::Binary { op, right, .. } = expr else {
            panic!("expected binary");
        };
        assert_eq!(op, BinaryOp::Or);
        assert!(matches!(*right, Expr::Binary { op: BinaryOp::And, .. }));
    }

    #[test]
    fn test_parse_ternary_and_array() {
        assert!(matches!(
            ExprParser::parse_str("a ? 1 : 2").unwrap(),
            Expr::Ternary { .. }
        ));
        assert_eq!(
            ExprParser::parse_str("[1, 2,]").unwrap(),
            Expr::Array(vec![Expr::Number(1.0), Expr::Number(2.0)])
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(ExprParser::parse_str("").is_err());
        assert!(ExprParser::parse_str("a >").is_err());
        assert!(ExprParser::parse_str("(a").is_err());
        assert!(ExprParser::parse_str("a b").is_err());
    }
}
