//! Token types for the Malthusia lexer.
//!
//! Defines [`TokenKind`] covering every lexeme of the robot language and
//! [`Token`], which pairs a kind with a source [`Span`].

use malthusia_types::Span;
use std::fmt;

/// Keywords the parser understands.
pub const ALL_KEYWORDS: &[&str] = &[
    "and", "as", "assert", "break", "continue", "def", "del", "elif", "else", "except", "False",
    "for", "from", "global", "if", "import", "in", "is", "lambda", "None", "not", "or", "pass",
    "raise", "return", "True", "try", "while",
];

/// Python keywords that are reserved but not part of the robot language.
pub const RESERVED_WORDS: &[&str] = &[
    "async", "await", "class", "finally", "nonlocal", "with", "yield",
];

// ─────────────────────────────────────────────────────────────────────
// Token
// ─────────────────────────────────────────────────────────────────────

/// A single token produced by the lexer.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

// ─────────────────────────────────────────────────────────────────────
// TokenKind
// ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    // ── Literals ──────────────────────────────────────────────
    Int(i64),
    Float(f64),
    /// Plain string, or an f-string without replacement fields.
    Str(String),
    Identifier(String),

    // ── f-strings ─────────────────────────────────────────────
    /// Text before the first `{` of an f-string.
    FStringStart(String),
    /// Text between two replacement fields.
    FStringPart(String),
    /// Text after the last replacement field, up to the closing quote.
    FStringEnd(String),
    /// `{` opening a replacement field.
    InterpolationStart,
    /// `}` closing a replacement field.
    InterpolationEnd,
    /// The text after `:` in a replacement field, e.g. `.2f`.
    FormatSpec(String),

    // ── Keywords ──────────────────────────────────────────────
    And,
    As,
    Assert,
    Break,
    Continue,
    Def,
    Del,
    Elif,
    Else,
    Except,
    False,
    For,
    From,
    Global,
    If,
    Import,
    In,
    Is,
    Lambda,
    None,
    Not,
    Or,
    Pass,
    Raise,
    Return,
    True,
    Try,
    While,
    /// A reserved word the language does not support (`class`, `with`, ...).
    Reserved(&'static str),

    // ── Operators ─────────────────────────────────────────────
    Plus,
    Minus,
    Star,
    StarStar,
    Slash,
    SlashSlash,
    Percent,
    Eq,
    EqEq,
    NotEq,
    Less,
    LessEq,
    Greater,
    GreaterEq,
    PlusEq,
    MinusEq,
    StarEq,
    SlashEq,
    SlashSlashEq,
    PercentEq,

    // ── Punctuation ───────────────────────────────────────────
    Dot,
    Comma,
    Colon,
    /// `->` before a return annotation.
    Arrow,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,

    // ── Layout ────────────────────────────────────────────────
    Newline,
    Indent,
    Dedent,
    Eof,
}

impl TokenKind {
    /// Map a word to its keyword token, if it is one.
    pub fn from_keyword(word: &str) -> Option<TokenKind> {
        let kind = match word {
            "and" => Self::And,
            "as" => Self::As,
            "assert" => Self::Assert,
            "break" => Self::Break,
            "continue" => Self::Continue,
            "def" => Self::Def,
            "del" => Self::Del,
            "elif" => Self::Elif,
            "else" => Self::Else,
            "except" => Self::Except,
            "False" => Self::False,
            "for" => Self::For,
            "from" => Self::From,
            "global" => Self::Global,
            "if" => Self::If,
            "import" => Self::Import,
            "in" => Self::In,
            "is" => Self::Is,
            "lambda" => Self::Lambda,
            "None" => Self::None,
            "not" => Self::Not,
            "or" => Self::Or,
            "pass" => Self::Pass,
            "raise" => Self::Raise,
            "return" => Self::Return,
            "True" => Self::True,
            "try" => Self::Try,
            "while" => Self::While,
            other => {
                return RESERVED_WORDS
                    .iter()
                    .copied()
                    .find(|w| *w == other)
                    .map(Self::Reserved)
            }
        };
        Some(kind)
    }

    /// Whether this is an augmented-assignment operator such as `+=`.
    pub fn is_aug_assign(&self) -> bool {
        matches!(
            self,
            Self::PlusEq
                | Self::MinusEq
                | Self::StarEq
                | Self::SlashEq
                | Self::SlashSlashEq
                | Self::PercentEq
        )
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Str(s) => write!(f, "{s:?}"),
            Self::Identifier(name) => write!(f, "{name}"),
            Self::FStringStart(_) | Self::FStringPart(_) | Self::FStringEnd(_) => {
                write!(f, "f-string")
            }
            Self::InterpolationStart => write!(f, "{{"),
            Self::InterpolationEnd => write!(f, "}}"),
            Self::FormatSpec(spec) => write!(f, ":{spec}"),
            Self::Reserved(word) => write!(f, "{word}"),
            Self::Newline => write!(f, "newline"),
            Self::Indent => write!(f, "indent"),
            Self::Dedent => write!(f, "dedent"),
            Self::Eof => write!(f, "end of file"),
            other => write!(f, "{}", other.symbol()),
        }
    }
}

impl TokenKind {
    fn symbol(&self) -> &'static str {
        match self {
            Self::And => "and",
            Self::As => "as",
            Self::Assert => "assert",
            Self::Break => "break",
            Self::Continue => "continue",
            Self::Def => "def",
            Self::Del => "del",
            Self::Elif => "elif",
            Self::Else => "else",
            Self::Except => "except",
            Self::False => "False",
            Self::For => "for",
            Self::From => "from",
            Self::Global => "global",
            Self::If => "if",
            Self::Import => "import",
            Self::In => "in",
            Self::Is => "is",
            Self::Lambda => "lambda",
            Self::None => "None",
            Self::Not => "not",
            Self::Or => "or",
            Self::Pass => "pass",
            Self::Raise => "raise",
            Self::Return => "return",
            Self::True => "True",
            Self::Try => "try",
            Self::While => "while",
            Self::Plus => "+",
            Self::Minus => "-",
            Self::Star => "*",
            Self::StarStar => "**",
            Self::Slash => "/",
            Self::SlashSlash => "//",
            Self::Percent => "%",
            Self::Eq => "=",
            Self::EqEq => "==",
            Self::NotEq => "!=",
            Self::Less => "<",
            Self::LessEq => "<=",
            Self::Greater => ">",
            Self::GreaterEq => ">=",
            Self::PlusEq => "+=",
            Self::MinusEq => "-=",
            Self::StarEq => "*=",
            Self::SlashEq => "/=",
            Self::SlashSlashEq => "//=",
            Self::PercentEq => "%=",
            Self::Dot => ".",
            Self::Comma => ",",
            Self::Colon => ":",
            Self::Arrow => "->",
            Self::LParen => "(",
            Self::RParen => ")",
            Self::LBracket => "[",
            Self::RBracket => "]",
            Self::LBrace => "{",
            Self::RBrace => "}",
            _ => "?",
        }
    }
}
