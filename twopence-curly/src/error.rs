//! Errors raised while loading curly documents.

use std::path::PathBuf;
use thiserror::Error;

/// Document loading errors
#[derive(Debug, Error)]
pub enum CurlyError {
    /// File could not be read
    #[error("Failed to read {}: {source}", path.display())]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Grammar violation
    #[error("{path}:{line}:{column}: {message}")]
    Syntax {
        /// File (or `<memory>`)
        path: String,
        /// 1-based line
        line: usize,
        /// 1-based column
        column: usize,
        /// Parser message
        message: String,
    },

    /// `include` target missing in every search location
    #[error("Required file not found: {path} (included from {from})")]
    IncludeNotFound {
        /// Path as written in the include statement
        path: String,
        /// Including file and line
        from: String,
    },

    /// A file includes itself, directly or indirectly
    #[error("Circular include detected: {0}")]
    CircularInclude(String),
}

/// Result type for document loading
pub type CurlyResult<T> = Result<T, CurlyError>;
