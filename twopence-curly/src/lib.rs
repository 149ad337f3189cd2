//! Curly configuration documents.
//!
//! A curly document is a sequence of attributes (`features systemd, zypper;`)
//! and named blocks (`platform "leap-15.3" { ... }`), with `include "file";`
//! statements spliced in place. This crate lexes, parses and loads such
//! documents into a [`Block`] tree and writes block trees back out.
//!
//! ```
//! use twopence_curly::parse_str;
//!
//! let root = parse_str("node client { role default; }").unwrap();
//! let node = root.block("node", "client").unwrap();
//! assert_eq!(node.get("role"), Some("default"));
//! ```

pub mod document;
pub mod error;
pub mod lexer;
pub mod loader;
pub mod parser;
pub mod syntax_kind;

pub use document::{Attribute, Block, Include, Item, quote};
pub use error::{CurlyError, CurlyResult};
pub use loader::{Document, Loader};
pub use parser::{Parse, ParseError, parse};

/// Parse a document from memory without include support.
///
/// # Errors
///
/// Returns the first syntax error, or `IncludeNotFound` if the text
/// contains an include statement.
pub fn parse_str(source: &str) -> CurlyResult<Block> {
    let root = loader::parse_source(source, "<memory>")?;

    if let Some(include) = root.items.iter().find_map(|item| match item {
        Item::Include(include) => Some(include),
        _ => None,
    }) {
        return Err(CurlyError::IncludeNotFound {
            path: include.path.clone(),
            from: format!("<memory>:{}", include.line),
        });
    }

    Ok(root)
}
