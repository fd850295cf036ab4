//! Token definitions

use logos::Logos;

/// Token of the method description language
#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(skip r"[ \t\n\r]+")]
#[logos(skip r"//[^\n]*")]
pub enum Token {
    // Keywords
    #[token("method")]
    Method,
    #[token("param")]
    Param,
    #[token("array")]
    Array,
    #[token("for")]
    For,
    #[token("check")]
    Check,
    #[token("store")]
    Store,
    #[token("after")]
    After,
    #[token("if")]
    If,
    #[token("throw")]
    Throw,
    #[token("continue")]
    Continue,
    #[token("break")]
    Break,
    #[token("in")]
    In,
    #[token("unsigned")]
    Unsigned,
    #[token("long")]
    Long,
    #[token("opaque")]
    Opaque,

    // Types
    #[token("i32")]
    TyI32,
    #[token("i64")]
    TyI64,

    // Literals: magnitudes only, a leading `-` is a separate token
    #[regex(r"[0-9]+L", |lex| lex.slice().trim_end_matches('L').parse::<i128>().ok(), priority = 3)]
    LongLit(i128),
    #[regex(r"[0-9]+", |lex| lex.slice().parse::<i128>().ok(), priority = 2)]
    IntLit(i128),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string(), priority = 1)]
    Ident(String),

    // Operators
    #[token("+=")]
    PlusEq,
    #[token("-=")]
    MinusEq,
    #[token("+")]
    Plus,
    #[token("-")]
    Minus,
    #[token("*")]
    Star,
    #[token("<<")]
    Shl,
    #[token("==")]
    EqEq,
    #[token("!=")]
    NotEq,
    #[token("<=")]
    LtEq,
    #[token(">=")]
    GtEq,
    #[token("<")]
    Lt,
    #[token(">")]
    Gt,
    #[token("||")]
    OrOr,
    #[token("&&")]
    AndAnd,
    #[token("=")]
    Eq,

    // Delimiters
    #[token("(")]
    LParen,
    #[token(")")]
    RParen,
    #[token("{")]
    LBrace,
    #[token("}")]
    RBrace,
    #[token("[")]
    LBracket,
    #[token("]")]
    RBracket,

    // Punctuation
    #[token(",")]
    Comma,
    #[token(";")]
    Semi,
    #[token(":")]
    Colon,
    #[token("@")]
    At,
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Token::Method => write!(f, "method"),
            Token::Param => write!(f, "param"),
            Token::Array => write!(f, "array"),
            Token::For => write!(f, "for"),
            Token::Check => write!(f, "check"),
            Token::Store => write!(f, "store"),
            Token::After => write!(f, "after"),
            Token::If => write!(f, "if"),
            Token::Throw => write!(f, "throw"),
            Token::Continue => write!(f, "continue"),
            Token::Break => write!(f, "break"),
            Token::In => write!(f, "in"),
            Token::Unsigned => write!(f, "unsigned"),
            Token::Long => write!(f, "long"),
            Token::Opaque => write!(f, "opaque"),
            Token::TyI32 => write!(f, "i32"),
            Token::TyI64 => write!(f, "i64"),
            Token::LongLit(n) => write!(f, "{n}L"),
            Token::IntLit(n) => write!(f, "{n}"),
            Token::Ident(s) => write!(f, "{s}"),
            Token::PlusEq => write!(f, "+="),
            Token::MinusEq => write!(f, "-="),
            Token::Plus => write!(f, "+"),
            Token::Minus => write!(f, "-"),
            Token::Star => write!(f, "*"),
            Token::Shl => write!(f, "<<"),
            Token::EqEq => write!(f, "=="),
            Token::NotEq => write!(f, "!="),
            Token::LtEq => write!(f, "<="),
            Token::GtEq => write!(f, ">="),
            Token::Lt => write!(f, "<"),
            Token::Gt => write!(f, ">"),
            Token::OrOr => write!(f, "||"),
            Token::AndAnd => write!(f, "&&"),
            Token::Eq => write!(f, "="),
            Token::LParen => write!(f, "("),
            Token::RParen => write!(f, ")"),
            Token::LBrace => write!(f, "{{"),
            Token::RBrace => write!(f, "}}"),
            Token::LBracket => write!(f, "["),
            Token::RBracket => write!(f, "]"),
            Token::Comma => write!(f, ","),
            Token::Semi => write!(f, ";"),
            Token::Colon => write!(f, ":"),
            Token::At => write!(f, "@"),
        }
    }
}
