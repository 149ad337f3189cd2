// Document loader
// Reads curly files and splices `include` statements with search paths

use crate::document::{Block, Item};
use crate::error::{CurlyError, CurlyResult};
use crate::lexer::line_col;
use crate::parser::parse;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A loaded document with all includes spliced in place.
#[derive(Debug, Clone)]
pub struct Document {
    /// Root block (kind `root`)
    pub root: Block,
    /// File the document was loaded from
    pub path: Option<PathBuf>,
    /// SHA-256 of the root file content
    pub checksum: String,
    /// Every file read, root first
    pub sources: Vec<PathBuf>,
}

/// Loads and caches curly files
#[derive(Debug, Default)]
pub struct Loader {
    /// Search paths for include files (in priority order)
    search_paths: Vec<PathBuf>,
    /// Cache of already parsed files, before include expansion
    cache: HashMap<PathBuf, Block>,
    /// Files being expanded, to detect circular includes
    parsing_stack: Vec<PathBuf>,
}

impl Loader {
    /// Create a loader without search paths
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a search path for include files
    pub fn add_search_path<P: Into<PathBuf>>(&mut self, path: P) {
        let path = path.into();
        if !self.search_paths.contains(&path) {
            self.search_paths.push(path);
        }
    }

    /// Add multiple search paths at once
    pub fn add_search_paths<I, P>(&mut self, paths: I)
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        for path in paths {
            self.add_search_path(path);
        }
    }

    /// Load a document, failing if it does not exist.
    ///
    /// # Errors
    ///
    /// I/O, syntax and include errors of the file or anything it includes.
    pub fn load(&mut self, path: &Path) -> CurlyResult<Document> {
        let canonical = canonicalize(path)?;
        let content = read(&canonical)?;
        let checksum = format!("{:x}", Sha256::digest(content.as_bytes()));

        let mut sources = Vec::new();
        let root = self.expand_file(&canonical, &mut sources)?;

        Ok(Document {
            root,
            path: Some(canonical),
            checksum,
            sources,
        })
    }

    /// Load a document that may legitimately be absent.
    ///
    /// # Errors
    ///
    /// Same as [`Loader::load`] when the file exists.
    pub fn load_optional(&mut self, path: &Path) -> CurlyResult<Option<Document>> {
        if !path.exists() {
            debug!("Optional config {} not present", path.display());
            return Ok(None);
        }
        self.load(path).map(Some)
    }

    /// Parse a document from memory. Includes resolve against `base_dir`
    /// and the search paths.
    ///
    /// # Errors
    ///
    /// Syntax errors in `source` and include errors.
    pub fn load_str(&mut self, source: &str, base_dir: &Path) -> CurlyResult<Document> {
        let checksum = format!("{:x}", Sha256::digest(source.as_bytes()));
        let mut root = parse_source(source, "<memory>")?;
        let mut sources = Vec::new();
        root.items = self.expand_items(root.items, base_dir, "<memory>", &mut sources)?;

        Ok(Document {
            root,
            path: None,
            checksum,
            sources,
        })
    }

    fn expand_file(&mut self, path: &Path, sources: &mut Vec<PathBuf>) -> CurlyResult<Block> {
        if self.parsing_stack.iter().any(|p| p == path) {
            let mut chain: Vec<String> = self
                .parsing_stack
                .iter()
                .map(|p| p.display().to_string())
                .collect();
            chain.push(path.display().to_string());
            return Err(CurlyError::CircularInclude(chain.join(" -> ")));
        }

        let parsed = match self.cache.get(path) {
            Some(cached) => cached.clone(),
            None => {
                debug!("Parsing {}", path.display());
                let content = read(path)?;
                let mut block = parse_source(&content, &path.display().to_string())?;
                block.set_origin(path);
                let _ = self.cache.insert(path.to_path_buf(), block.clone());
                block
            }
        };
        sources.push(path.to_path_buf());

        self.parsing_stack.push(path.to_path_buf());
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        let result = self.expand_items(parsed.items, base_dir, &path.display().to_string(), sources);
        let _ = self.parsing_stack.pop();

        let mut root = Block::new("root", None);
        root.origin = Some(path.to_path_buf());
        root.items = result?;
        Ok(root)
    }

    fn expand_items(
        &mut self,
        items: Vec<Item>,
        base_dir: &Path,
        from: &str,
        sources: &mut Vec<PathBuf>,
    ) -> CurlyResult<Vec<Item>> {
        let mut expanded = Vec::with_capacity(items.len());

        for item in items {
            match item {
                Item::Include(include) => {
                    let Some(found) = self.find_include_file(&include.path, base_dir) else {
                        warn!("Include {} not found (from {}:{})", include.path, from, include.line);
                        return Err(CurlyError::IncludeNotFound {
                            path: include.path,
                            from: format!("{from}:{}", include.line),
                        });
                    };
                    let canonical = canonicalize(&found)?;
                    let included = self.expand_file(&canonical, sources)?;
                    expanded.extend(included.items);
                }
                Item::Block(mut block) => {
                    let items = std::mem::take(&mut block.items);
                    block.items = self.expand_items(items, base_dir, from, sources)?;
                    expanded.push(Item::Block(block));
                }
                attr @ Item::Attribute(_) => expanded.push(attr),
            }
        }

        Ok(expanded)
    }

    /// Find an include file by searching all search paths
    fn find_include_file(&self, include_path: &str, base_dir: &Path) -> Option<PathBuf> {
        let candidate = Path::new(include_path);
        if candidate.is_absolute() {
            return candidate.exists().then(|| candidate.to_path_buf());
        }

        // First try relative to the including file's directory
        let relative_path = base_dir.join(include_path);
        if relative_path.exists() {
            return Some(relative_path);
        }

        // Then try each search path
        self.search_paths
            .iter()
            .map(|search_path| search_path.join(include_path))
            .find(|candidate| candidate.exists())
    }
}

fn read(path: &Path) -> CurlyResult<String> {
    fs::read_to_string(path).map_err(|source| CurlyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn canonicalize(path: &Path) -> CurlyResult<PathBuf> {
    fs::canonicalize(path).map_err(|source| CurlyError::Io {
        path: path.to_path_buf(),
        source,
    })
}

pub(crate) fn parse_source(source: &str, name: &str) -> CurlyResult<Block> {
    parse(source).ok().map_err(|errors| {
        let first = &errors[0];
        let (line, column) = line_col(source, first.span.start);
        CurlyError::Syntax {
            path: name.to_string(),
            line,
            column,
            message: first.message.clone(),
        }
    })
}
