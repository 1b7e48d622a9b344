// Expression Lexer
// Tokenizes condition expressions such as `agv1.speed > 2 && !agv1.blocked`

use std::fmt;
use thiserror::Error;

/// Token types for condition expressions
#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    // Literals
    Null,
    True,
    False,
    Number(f64),
    String(String),

    // Identifiers and references
    Identifier(String),

    // Operators
    Plus,     // +
    Minus,    // -
    Star,     // *
    Slash,    // /
    Percent,  // %
    Eq,       // ==
    Ne,       // !=
    Lt,       // <
    Le,       // <=
    Gt,       // >
    Ge,       // >=
    And,      // &&
    Or,       // ||
    Not,      // !
    Dot,      // .
    Comma,    // ,
    Colon,    // :
    Question, // ?

    // Delimiters
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    LBrace,   // {
    RBrace,   // }

    // End of input
    Eof,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let symbol = match self {
            Token::Number(n) => return write!(f, "{n}"),
            Token::String(s) => return write!(f, "'{s}'"),
            Token::Identifier(name) => return f.write_str(name),
            Token::Null => "null",
            Token::True => "true",
            Token::False => "false",
            Token::Plus => "+",
            Token::Minus => "-",
            Token::Star => "*",
            Token::Slash => "/",
            Token::Percent => "%",
            Token::Eq => "==",
            Token::Ne => "!=",
            Token::Lt => "<",
            Token::Le => "<=",
            Token::Gt => ">",
            Token::Ge => ">=",
            Token::And => "&&",
            Token::Or => "||",
            Token::Not => "!",
            Token::Dot => ".",
            Token::Comma => ",",
            Token::Colon => ":",
            Token::Question => "?",
            Token::LParen => "(",
            Token::RParen => ")",
            Token::LBracket => "[",
            Token::RBracket => "]",
            Token::LBrace => "{",
            Token::RBrace => "}",
            Token::Eof => "end of input",
        };
        f.write_str(symbol)
    }
}

/// Lexer error
#[derive(Debug, Clone, PartialEq, Error)]
#[error("lex error at position {position}: {message}")]
pub struct LexError {
    pub message: String,
    pub position: usize,
}

/// Lexer for condition expressions
pub struct Lexer<'a> {
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    position: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(input: &'a str) -> Self {
        Self {
            chars: input.char_indices().peekable(),
            position: 0,
        }
    }

    /// Tokenize the entire input
    pub fn tokenize(&mut self) -> Result<Vec<Token>, LexError> {
        let mut tokens = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token == Token::Eof;
            tokens.push(token);
            if done {
                return Ok(tokens);
            }
        }
    }

    /// Tokenize, skipping characters that do not form a token.
    ///
    /// Used where a partial token stream is more useful than an error.
    pub fn tokenize_lenient(&mut self) -> Vec<Token> {
        let mut tokens = Vec::new();

        loop {
            match self.next_token() {
                Ok(Token::Eof) => break,
                Ok(token) => tokens.push(token),
                Err(_) => {
                    // The failing character may already be consumed; make sure we progress
                    if self.chars.peek().map(|&(pos, _)| pos) == Some(self.position) {
                        self.chars.next();
                    }
                }
            }
        }

        tokens.push(Token::Eof);
        tokens
    }

    /// Get the next token
    pub fn next_token(&mut self) -> Result<Token, LexError> {
        self.take_while(char::is_whitespace);

        let Some(&(pos, ch)) = self.chars.peek() else {
            return Ok(Token::Eof);
        };
        self.position = pos;

        if ch == '\'' || ch == '"' {
            return self.read_string(ch);
        }
        if ch.is_ascii_digit() {
            return self.read_number();
        }
        if ch.is_alphabetic() || ch == '_' || ch == '$' {
            return Ok(keyword_or_identifier(
                self.take_while(|c| c.is_alphanumeric() || c == '_' || c == '$'),
            ));
        }

        self.chars.next();
        let token = match ch {
            '+' => Token::Plus,
            '-' => Token::Minus,
            '*' => Token::Star,
            '/' => Token::Slash,
            '%' => Token::Percent,
            '.' => Token::Dot,
            ',' => Token::Comma,
            ':' => Token::Colon,
            '?' => Token::Question,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '[' => Token::LBracket,
            ']' => Token::RBracket,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            '<' if self.eat('=') => Token::Le,
            '<' => Token::Lt,
            '>' if self.eat('=') => Token::Ge,
            '>' => Token::Gt,
            // `===` and `!==` are accepted as aliases
            '=' if self.eat('=') => {
                self.eat('=');
                Token::Eq
            }
            '!' if self.eat('=') => {
                self.eat('=');
                Token::Ne
            }
            '!' => Token::Not,
            '&' if self.eat('&') => Token::And,
            '|' if self.eat('|') => Token::Or,
            '=' | '&' | '|' => {
                return Err(self.error(pos, format!("expected '{ch}{ch}' operator")));
            }
            _ => return Err(self.error(pos, format!("unexpected character: '{ch}'"))),
        };
        Ok(token)
    }

    /// Consume `expected` if it is the next character
    fn eat(&mut self, expected: char) -> bool {
        self.chars.next_if(|&(_, c)| c == expected).is_some()
    }

    fn take_while(&mut self, pred: impl Fn(char) -> bool) -> String {
        let mut taken = String::new();
        while let Some((_, c)) = self.chars.next_if(|&(_, c)| pred(c)) {
            taken.push(c);
        }
        taken
    }

    fn error(&self, position: usize, message: String) -> LexError {
        LexError { message, position }
    }

    fn read_string(&mut self, quote: char) -> Result<Token, LexError> {
        let start = self.position;
        self.chars.next();

        let mut value = String::new();
        loop {
            value.push_str(&self.take_while(|c| c != quote));
            if !self.eat(quote) {
                return Err(self.error(start, "unterminated string".to_string()));
            }
            // A doubled quote is an escaped quote
            if !self.eat(quote) {
                return Ok(Token::String(value));
            }
            value.push(quote);
        }
    }

    fn read_number(&mut self) -> Result<Token, LexError> {
        let start = self.position;
        let mut literal = self.take_while(|c| c.is_ascii_digit());

        // Only a '.' followed by a digit starts a fraction, so `items.0` stays a path
        let mut lookahead = self.chars.clone();
        let fraction = matches!(lookahead.next(), Some((_, '.')))
            && matches!(lookahead.next(), Some((_, c)) if c.is_ascii_digit());
        if fraction {
            self.chars.next();
            literal.push('.');
            literal.push_str(&self.take_while(|c| c.is_ascii_digit()));
        }

        literal
            .parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(start, format!("invalid number: {literal}")))
    }
}

fn keyword_or_identifier(word: String) -> Token {
    match word.as_str() {
        "null" | "undefined" => Token::Null,
        "true" => Token::True,
        "false" => Token::False,
        _ => Token::Identifier(word),
    }
}
