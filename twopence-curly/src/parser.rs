// Recursive descent parser for curly documents
// Collects errors and keeps going so one pass reports every problem

use crate::document::{Attribute, Block, Include, Item};
use crate::lexer::{Lexer, Token, line_col, unquote};
use crate::syntax_kind::SyntaxKind;
use std::fmt;
use std::ops::Range;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseError {
    pub message: String,
    pub span: Range<usize>,
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:?}", self.message, self.span)
    }
}

#[derive(Debug)]
pub struct Parse {
    pub root: Block,
    pub errors: Vec<ParseError>,
}

impl Parse {
    pub fn ok(self) -> Result<Block, Vec<ParseError>> {
        if self.errors.is_empty() {
            Ok(self.root)
        } else {
            Err(self.errors)
        }
    }
}

struct Parser<'a> {
    input: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    errors: Vec<ParseError>,
}

pub fn parse(input: &str) -> Parse {
    let tokens = Lexer::tokenize(input)
        .into_iter()
        .filter(|t| !t.kind.is_trivia())
        .collect();

    let mut parser = Parser {
        input,
        tokens,
        pos: 0,
        errors: Vec::new(),
    };

    let items = parser.items(false);
    let mut root = Block::new("root", None);
    root.items = items;

    Parse {
        root,
        errors: parser.errors,
    }
}

impl Parser<'_> {
    fn items(&mut self, nested: bool) -> Vec<Item> {
        let mut items = Vec::new();

        loop {
            match self.current() {
                SyntaxKind::EOF => {
                    if nested {
                        self.error("Unexpected end of file, expected '}'".to_string());
                    }
                    break;
                }
                SyntaxKind::R_BRACE => {
                    if nested {
                        break;
                    }
                    self.error("Unexpected '}'".to_string());
                    self.bump();
                }
                SyntaxKind::SEMICOLON => self.bump(),
                SyntaxKind::WORD => {
                    if let Some(item) = self.statement() {
                        items.push(item);
                    }
                }
                other => {
                    self.error(format!("Unexpected token: {other:?}"));
                    self.recover();
                }
            }
        }

        items
    }

    fn statement(&mut self) -> Option<Item> {
        let keyword = self.current_text();
        let line = self.current_line();
        self.bump();

        let mut values = Vec::new();
        while self.current().is_value() {
            values.push(self.value_text());
            self.bump();
            if self.at(SyntaxKind::COMMA) {
                self.bump();
                if !self.current().is_value() {
                    self.error("Expected value after ','".to_string());
                }
            }
        }

        match self.current() {
            SyntaxKind::SEMICOLON => {
                self.bump();
                if keyword == "include" {
                    if values.len() == 1 {
                        let path = values.remove(0);
                        return Some(Item::Include(Include { path, line }));
                    }
                    self.error("include takes exactly one path".to_string());
                    return None;
                }
                Some(Item::Attribute(Attribute {
                    name: keyword,
                    values,
                }))
            }
            SyntaxKind::L_BRACE => {
                if values.len() > 1 {
                    self.error(format!("Block '{keyword}' takes at most one name"));
                }
                self.bump();
                let items = self.items(true);
                self.expect(SyntaxKind::R_BRACE);
                if self.at(SyntaxKind::SEMICOLON) {
                    self.bump();
                }
                Some(Item::Block(Block {
                    kind: keyword,
                    name: values.into_iter().next(),
                    items,
                    origin: None,
                    line,
                }))
            }
            other => {
                self.error(format!(
                    "Expected ';' or '{{' after '{keyword}', found {other:?}"
                ));
                self.recover();
                None
            }
        }
    }

    // Skip to the end of the current statement without leaving the block
    fn recover(&mut self) {
        while !self.at_eof() {
            match self.current() {
                SyntaxKind::SEMICOLON => {
                    self.bump();
                    return;
                }
                SyntaxKind::R_BRACE => return,
                _ => self.bump(),
            }
        }
    }

    fn current(&self) -> SyntaxKind {
        self.tokens.get(self.pos).map_or(SyntaxKind::EOF, |t| t.kind)
    }

    fn current_token(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn current_text(&self) -> String {
        self.current_token().map(|t| t.text.clone()).unwrap_or_default()
    }

    fn current_line(&self) -> usize {
        let offset = self.current_token().map_or(0, |t| t.span.start);
        line_col(self.input, offset).0
    }

    fn value_text(&self) -> String {
        match self.current_token() {
            Some(token) if token.kind == SyntaxKind::STRING => unquote(&token.text),
            Some(token) => token.text.clone(),
            None => String::new(),
        }
    }

    fn at(&self, kind: SyntaxKind) -> bool {
        self.current() == kind
    }

    fn at_eof(&self) -> bool {
        self.pos >= self.tokens.len() || self.at(SyntaxKind::EOF)
    }

    fn bump(&mut self) {
        if self.pos < self.tokens.len() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, kind: SyntaxKind) -> bool {
        if self.at(kind) {
            self.bump();
            true
        } else {
            self.error(format!("Expected {:?}, found {:?}", kind, self.current()));
            false
        }
    }

    fn error(&mut self, message: String) {
        let span = self.current_token().map_or(0..0, |t| t.span.clone());
        self.errors.push(ParseError { message, span });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_and_block() {
        let input = r#"
# base platform
platform "leap-15.3" {
    vendor suse;
    features systemd, zypper;
    repository oss {
        url "http://download.opensuse.org/distribution/leap/15.3/repo/oss/";
    }
}
"#;
        let root = parse(input).ok().unwrap();
        let platform = root.block("platform", "leap-15.3").unwrap();

        assert_eq!(platform.line, 3);
        assert_eq!(platform.get("vendor"), Some("suse"));
        assert_eq!(platform.values("features"), vec!["systemd", "zypper"]);
        let repo = platform.block("repository", "oss").unwrap();
        assert!(repo.get("url").unwrap().ends_with("/oss/"));
    }

    #[test]
    fn test_include_statement() {
        let root = parse("include \"platforms/leap.conf\";\nnode client { role client; }")
            .ok()
            .unwrap();

        assert_eq!(
            root.items[0],
            Item::Include(Include {
                path: "platforms/leap.conf".to_string(),
                line: 1
            })
        );
        assert!(root.block("node", "client").is_some());
    }

    #[test]
    fn test_ordered_repeated_attributes() {
        let root = parse("stage build { run \"a\"; call zypper, install; run b; reboot; };")
            .ok()
            .unwrap();
        let stage = root.block("stage", "build").unwrap();
        let names: Vec<&str> = stage.attributes().map(|a| a.name.as_str()).collect();

        assert_eq!(names, vec!["run", "call", "run", "reboot"]);
        assert_eq!(stage.values("call"), vec!["zypper", "install"]);
    }

    #[test]
    fn test_anonymous_block() {
        let root = parse("build selinux { compatibility { requires systemd; } }")
            .ok()
            .unwrap();
        let build = root.block("build", "selinux").unwrap();
        let compat = build.blocks_of("compatibility").next().unwrap();

        assert_eq!(compat.name, None);
        assert_eq!(compat.values("requires"), vec!["systemd"]);
    }

    #[test]
    fn test_errors_are_collected() {
        let parse = parse("os leap\nplatform a { vendor suse; }\n}\nnode x { role");
        let errors = parse.errors.clone();

        assert!(errors.len() >= 2);
        assert!(errors.iter().any(|e| e.message.contains("Unexpected '}'")));
        // Recovery keeps later statements
        assert!(parse.root.block("node", "x").is_some());
    }

    #[test]
    fn test_block_with_two_names() {
        let errors = parse("platform a b { }").ok().unwrap_err();
        assert!(errors[0].message.contains("at most one name"));
    }
}
