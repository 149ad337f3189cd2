// Token kinds for curly documents

use logos::Logos;

#[allow(non_camel_case_types)]
#[derive(Logos, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u16)]
pub enum SyntaxKind {
    // Delimiters
    #[token("{")]
    L_BRACE = 0,
    #[token("}")]
    R_BRACE,
    #[token(";")]
    SEMICOLON,
    #[token(",")]
    COMMA,

    // Double quoted, backslash escapes
    #[regex(r#""([^"\\]|\\.)*""#)]
    STRING,

    // Bare words: keywords, names, paths, versions
    #[regex(r"[A-Za-z0-9_./:@+~\-][A-Za-z0-9_./:@+~=\-]*")]
    WORD,

    #[regex(r"#[^\n]*")]
    COMMENT,

    #[token("\n")]
    NEWLINE,

    // Whitespace (not newline)
    #[regex(r"[ \t\r]+")]
    WHITESPACE,

    // Error token (logos 0.14+ doesn't use #[error])
    ERROR_TOKEN,

    // End marker
    EOF,
}

impl SyntaxKind {
    pub fn is_trivia(self) -> bool {
        matches!(
            self,
            SyntaxKind::WHITESPACE | SyntaxKind::NEWLINE | SyntaxKind::COMMENT
        )
    }

    pub fn is_value(self) -> bool {
        matches!(self, SyntaxKind::STRING | SyntaxKind::WORD)
    }
}
