pub mod keywords;
mod lexer;
pub mod token;

pub use lexer::{lex, Lexer};
pub use token::{Keyword, LiteralKind, Punctuator, Span, Token, TokenKind};
