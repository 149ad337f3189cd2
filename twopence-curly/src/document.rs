//! Block tree of a curly document and its writer.

use std::fmt::Write as _;
use std::path::{Path, PathBuf};

/// A named attribute with zero or more values, e.g. `features systemd, zypper;`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    /// Attribute keyword
    pub name: String,
    /// Values in source order
    pub values: Vec<String>,
}

impl Attribute {
    /// Create an attribute from a name and its values.
    pub fn new<I, S>(name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.to_string(),
            values: values.into_iter().map(Into::into).collect(),
        }
    }
}

/// `include "path";` statement, replaced by the included items on load.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Include {
    /// Path as written
    pub path: String,
    /// Line of the statement
    pub line: usize,
}

/// One statement inside a block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Item {
    /// `name value, value;`
    Attribute(Attribute),
    /// `kind "name" { ... }`
    Block(Block),
    /// Unresolved include
    Include(Include),
}

/// A block: keyword, optional name, ordered items.
///
/// The document itself is a block of kind `root` without a name.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Block {
    /// Block keyword (`platform`, `build`, `stage`, ...)
    pub kind: String,
    /// Block name, if any
    pub name: Option<String>,
    /// Attributes, nested blocks and includes in source order
    pub items: Vec<Item>,
    /// File the block was read from
    pub origin: Option<PathBuf>,
    /// Line of the block header (0 for synthesized blocks)
    pub line: usize,
}

impl Block {
    /// Create an empty block.
    #[must_use]
    pub fn new(kind: &str, name: Option<&str>) -> Self {
        Self {
            kind: kind.to_string(),
            name: name.map(str::to_string),
            ..Self::default()
        }
    }

    /// Name of the block, or an empty string for anonymous blocks.
    #[must_use]
    pub fn name_or_empty(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Iterate attributes in source order.
    pub fn attributes(&self) -> impl Iterator<Item = &Attribute> {
        self.items.iter().filter_map(|item| match item {
            Item::Attribute(attr) => Some(attr),
            _ => None,
        })
    }

    /// Iterate nested blocks in source order.
    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.items.iter().filter_map(|item| match item {
            Item::Block(block) => Some(block),
            _ => None,
        })
    }

    /// Iterate nested blocks of one kind.
    pub fn blocks_of<'a>(&'a self, kind: &'a str) -> impl Iterator<Item = &'a Block> + 'a {
        self.blocks().filter(move |block| block.kind == kind)
    }

    /// Find a nested block by kind and name.
    #[must_use]
    pub fn block(&self, kind: &str, name: &str) -> Option<&Block> {
        self.blocks()
            .find(|block| block.kind == kind && block.name.as_deref() == Some(name))
    }

    /// First value of the last occurrence of an attribute.
    ///
    /// Later occurrences override earlier ones.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes()
            .filter(|attr| attr.name == name)
            .last()
            .and_then(|attr| attr.values.first())
            .map(String::as_str)
    }

    /// All values of every occurrence of an attribute, in order.
    #[must_use]
    pub fn values(&self, name: &str) -> Vec<&str> {
        self.attributes()
            .filter(|attr| attr.name == name)
            .flat_map(|attr| attr.values.iter().map(String::as_str))
            .collect()
    }

    /// Boolean attribute. A bare flag (`reboot;`) is `true`.
    ///
    /// Returns `None` when the attribute is absent or its value is not a
    /// recognised boolean.
    #[must_use]
    pub fn flag(&self, name: &str) -> Option<bool> {
        let attr = self.attributes().filter(|attr| attr.name == name).last()?;
        match attr.values.first().map(String::as_str) {
            None | Some("true" | "yes" | "on" | "1") => Some(true),
            Some("false" | "no" | "off" | "0") => Some(false),
            Some(_) => None,
        }
    }

    /// Replace all occurrences of an attribute with a single one.
    pub fn set<I, S>(&mut self, name: &str, values: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.items
            .retain(|item| !matches!(item, Item::Attribute(attr) if attr.name == name));
        self.items.push(Item::Attribute(Attribute::new(name, values)));
    }

    /// Append an attribute occurrence.
    pub fn push_attribute(&mut self, attr: Attribute) {
        self.items.push(Item::Attribute(attr));
    }

    /// Append a nested block.
    pub fn push_block(&mut self, block: Block) {
        self.items.push(Item::Block(block));
    }

    /// Record the origin file on this block and every nested block.
    pub fn set_origin(&mut self, path: &Path) {
        self.origin = Some(path.to_path_buf());
        for item in &mut self.items {
            if let Item::Block(block) = item {
                block.set_origin(path);
            }
        }
    }

    /// Render the block back to curly syntax.
    ///
    /// A `root` block renders its items only.
    #[must_use]
    pub fn to_curly(&self) -> String {
        let mut out = String::new();
        if self.kind == "root" && self.name.is_none() {
            write_items(&mut out, &self.items, 0);
        } else {
            write_block(&mut out, self, 0);
        }
        out
    }
}

fn write_items(out: &mut String, items: &[Item], depth: usize) {
    for item in items {
        match item {
            Item::Attribute(attr) => {
                indent(out, depth);
                out.push_str(&attr.name);
                if !attr.values.is_empty() {
                    out.push(' ');
                    let values: Vec<String> = attr.values.iter().map(|v| quote(v)).collect();
                    out.push_str(&values.join(", "));
                }
                out.push_str(";\n");
            }
            Item::Block(block) => write_block(out, block, depth),
            Item::Include(include) => {
                indent(out, depth);
                let _ = writeln!(out, "include {};", quote(&include.path));
            }
        }
    }
}

fn write_block(out: &mut String, block: &Block, depth: usize) {
    indent(out, depth);
    out.push_str(&block.kind);
    if let Some(name) = &block.name {
        out.push(' ');
        out.push_str(&quote(name));
    }
    out.push_str(" {\n");
    write_items(out, &block.items, depth + 1);
    indent(out, depth);
    out.push_str("}\n");
}

fn indent(out: &mut String, depth: usize) {
    for _ in 0..depth {
        out.push('\t');
    }
}

/// Quote a value unless it lexes as a single bare word.
#[must_use]
pub fn quote(value: &str) -> String {
    let bare = !value.is_empty()
        && value.chars().enumerate().all(|(i, c)| {
            c.is_ascii_alphanumeric() || "_./:@+~-".contains(c) || (i > 0 && c == '=')
        });
    if bare {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\t' => out.push_str("\\t"),
            other => out.push(other),
        }
    }
    out.push('"');
    out
}
