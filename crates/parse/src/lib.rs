pub mod ast;
mod parser;

pub use ast::*;
pub use parser::{parse_program, parse_source, Parser};
