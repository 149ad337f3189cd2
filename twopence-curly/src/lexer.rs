// Lexer for curly documents using logos

use crate::syntax_kind::SyntaxKind;
use logos::Logos;
use std::ops::Range;

#[derive(Debug, Clone)]
pub struct Token {
    pub kind: SyntaxKind,
    pub text: String,
    pub span: Range<usize>,
}

pub struct Lexer;

impl Lexer {
    pub fn tokenize(input: &str) -> Vec<Token> {
        let mut inner = SyntaxKind::lexer(input);
        let mut tokens = Vec::new();

        while let Some(kind) = inner.next() {
            let kind = kind.unwrap_or(SyntaxKind::ERROR_TOKEN);
            let span = inner.span();
            let text = inner.slice().to_string();
            tokens.push(Token { kind, text, span });
        }

        // Always add EOF token
        let len = input.len();
        tokens.push(Token {
            kind: SyntaxKind::EOF,
            text: String::new(),
            span: len..len,
        });

        tokens
    }
}

/// Strip the quotes of a STRING token and resolve its escapes.
pub fn unquote(text: &str) -> String {
    let inner = text
        .strip_prefix('"')
        .and_then(|t| t.strip_suffix('"'))
        .unwrap_or(text);

    let mut out = String::with_capacity(inner.len());
    let mut chars = inner.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('t') => out.push('\t'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}

/// 1-based line and column of a byte offset.
pub fn line_col(input: &str, offset: usize) -> (usize, usize) {
    let prefix = &input[..offset.min(input.len())];
    let line = prefix.matches('\n').count() + 1;
    let column = prefix.rfind('\n').map_or(prefix.len(), |nl| prefix.len() - nl - 1) + 1;
    (line, column)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(input: &str) -> Vec<SyntaxKind> {
        Lexer::tokenize(input)
            .into_iter()
            .map(|t| t.kind)
            .filter(|k| !k.is_trivia())
            .collect()
    }

    #[test]
    fn test_attribute() {
        let tokens = Lexer::tokenize("features systemd, zypper;");

        assert_eq!(tokens[0].kind, SyntaxKind::WORD);
        assert_eq!(tokens[0].text, "features");
        assert_eq!(tokens[1].kind, SyntaxKind::WHITESPACE);
        assert_eq!(tokens[2].kind, SyntaxKind::WORD);
        assert_eq!(tokens[3].kind, SyntaxKind::COMMA);
        assert_eq!(tokens[5].text, "zypper");
        assert_eq!(tokens[6].kind, SyntaxKind::SEMICOLON);
        assert_eq!(tokens[7].kind, SyntaxKind::EOF);
    }

    #[test]
    fn test_block_header() {
        assert_eq!(
            kinds("platform \"leap-15.3\" {\n}"),
            vec![
                SyntaxKind::WORD,
                SyntaxKind::STRING,
                SyntaxKind::L_BRACE,
                SyntaxKind::R_BRACE,
                SyntaxKind::EOF
            ]
        );
    }

    #[test]
    fn test_comment() {
        let tokens = Lexer::tokenize("# leading comment\nos leap;");
        assert_eq!(tokens[0].kind, SyntaxKind::COMMENT);
        assert_eq!(tokens[1].kind, SyntaxKind::NEWLINE);
        assert_eq!(tokens[2].kind, SyntaxKind::WORD);
    }

    #[test]
    fn test_words_with_punctuation() {
        let tokens = Lexer::tokenize("url http://download.opensuse.org/distribution/leap/15.3/repo/oss/;");
        assert_eq!(tokens[2].kind, SyntaxKind::WORD);
        assert!(tokens[2].text.starts_with("http://"));
    }

    #[test]
    fn test_unquote_escapes() {
        assert_eq!(unquote(r#""say \"hi\"\n""#), "say \"hi\"\n");
        assert_eq!(unquote(r#""c:\\tmp""#), "c:\\tmp");
    }

    #[test]
    fn test_line_col() {
        let input = "a;\nbb;\n  c;";
        assert_eq!(line_col(input, 0), (1, 1));
        assert_eq!(line_col(input, 3), (2, 1));
        assert_eq!(line_col(input, 9), (3, 3));
    }
}
