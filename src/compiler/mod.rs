pub mod chunk;
pub mod compiler;
mod rle;
mod scanner;
mod token;
mod util;

use thiserror::Error;

pub use scanner::ScannerError;

type Result<T> = std::result::Result<T, CompileError>;

#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("Number of compiler errors: {}", .0.len())]
    Collected(Vec<CompileError>),

    #[error("[line {line}] Error{location}: {message}")]
    ParseError {
        line: u64,
        location: String,
        message: &'static str,
    },

    #[error("Error parsing number: {}", .0)]
    ParseFloatError(#[from] std::num::ParseFloatError),

    #[error("Could not find token while parsing (should not happen)")]
    TokenNotFound,
}
