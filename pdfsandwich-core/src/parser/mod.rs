//! PDF file parsing
//!
//! Reads a PDF byte image into the arena object model in [`crate::objects`]:
//! lexing ([`lexer`]), object syntax ([`object`]), stream filters
//! ([`filters`]), cross-reference tables and streams ([`xref`]), the
//! document reader ([`reader`]) and content-stream operators ([`content`]).
//!
//! The reader is deliberately lenient where real scanners' output demands
//! it (broken xref offsets fall back to an object scan) and strict where
//! the pipeline's contract demands it (a file without a `%PDF-` signature
//! is rejected up front, never "repaired" into a partial output).

pub mod content;
pub mod filters;
pub mod lexer;
pub mod object;
pub mod reader;
pub mod xref;

pub use content::{ContentOp, ContentParser, OperatorClass};
pub use lexer::{Lexer, Token};
pub use object::parse_object;
pub use reader::PdfReader;
pub use xref::{XrefEntry, XrefTable};

use thiserror::Error;

pub type ParseResult<T> = Result<T, ParseError>;

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("syntax error at byte {position}: {message}")]
    SyntaxError { position: usize, message: String },

    #[error("unexpected token: expected {expected}, found {found}")]
    UnexpectedToken { expected: String, found: String },

    #[error("missing required key: /{0}")]
    MissingKey(String),

    #[error("invalid cross-reference table: {0}")]
    InvalidXref(String),

    #[error("unsupported filter: {0}")]
    UnsupportedFilter(String),

    #[error("stream decode failed: {0}")]
    StreamDecode(String),

    #[error("file does not start with a PDF signature")]
    NotAPdf,

    #[error("unexpected end of file")]
    UnexpectedEof,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<ParseError> for crate::error::PdfError {
    fn from(err: ParseError) -> Self {
        crate::error::PdfError::ParseError(err.to_string())
    }
}
