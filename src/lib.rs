pub mod analyser;
pub mod binary;
pub mod diagnostic;
pub mod instruction;
pub mod lexeme;
pub mod lexer;
pub mod listing;
pub mod program;
pub mod span;
pub mod symtab;
pub mod types;
pub mod vm;

pub use diagnostic::{Diagnostic, ErrorCode};
pub use program::Program;

use lexeme::Lexeme;
use lexer::Lexer;
use span::Spanned;

/// Tokenize a C0 source file. The first lexical error aborts the scan.
pub fn tokenize_source(source: &str) -> Result<Vec<Spanned<Lexeme>>, Diagnostic> {
    Lexer::new(source).tokenize()
}

/// Compile a C0 source file to a bytecode program: constants pool, `.start`
/// sequence and function table. The first error aborts the pass.
pub fn compile_source(source: &str) -> Result<Program, Diagnostic> {
    let tokens = tokenize_source(source)?;
    analyser::analyse(tokens)
}
