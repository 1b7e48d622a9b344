// Expression Module
// Condition language: lexing, parsing, evaluation and dependency extraction

pub mod dependencies;
pub mod evaluator;
pub mod functions;
pub mod lexer;
pub mod parser;

pub use dependencies::extract_dependencies;
pub use evaluator::{Environment, EvalError, Evaluator, ExpressionEngine, ExpressionEvaluator};
pub use functions::BuiltinFunctions;
pub use lexer::{LexError, Lexer, Token};
pub use parser::{BinaryOp, Expr, ExprParser, ParseExprError, Reference, ReferencePart, UnaryOp};
