//! Lexer implementation using logos

mod token;

pub use token::Token;

use std::fmt;
use std::ops::Range;

use crate::error::{RceError, Result};
use logos::Logos;

/// Byte range of a token or construct in a method description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Span { start, end }
    }

    /// From the start of `self` to the end of `last`
    pub fn to(self, last: Span) -> Span {
        Span { start: self.start, end: last.end.max(self.end) }
    }

    pub fn range(self) -> Range<usize> {
        self.start..self.end
    }
}

impl From<Range<usize>> for Span {
    fn from(range: Range<usize>) -> Self {
        Span::new(range.start, range.end)
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// Tokenize a method description
pub fn tokenize(source: &str) -> Result<Vec<(Token, Span)>> {
    let mut tokens = Vec::new();
    let mut lexer = Token::lexer(source);

    while let Some(result) = lexer.next() {
        let span = Span::from(lexer.span());
        match result {
            Ok(token) => tokens.push((token, span)),
            Err(_) => {
                return Err(RceError::lexer(
                    format!("unexpected character: {:?}", lexer.slice()),
                    span,
                ));
            }
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<Token> {
        tokenize(source).unwrap().into_iter().map(|(t, _)| t).collect()
    }

    #[test]
    fn test_tokenize_empty() {
        assert!(tokenize("").unwrap().is_empty());
    }

    #[test]
    fn test_tokenize_keywords() {
        assert_eq!(
            kinds("method param array for check store after"),
            vec![Token::Method, Token::Param, Token::Array, Token::For, Token::Check, Token::Store, Token::After]
        );
        assert_eq!(kinds("i32 i64 in"), vec![Token::TyI32, Token::TyI64, Token::In]);
    }

    #[test]
    fn test_tokenize_literals() {
        assert_eq!(kinds("42 7L"), vec![Token::IntLit(42), Token::LongLit(7)]);
        assert_eq!(kinds("9223372036854775808"), vec![Token::IntLit(9223372036854775808)]);
        assert_eq!(kinds("-5"), vec![Token::Minus, Token::IntLit(5)]);
    }

    #[test]
    fn test_tokenize_operators() {
        assert_eq!(
            kinds("+= -= << <= < || &&"),
            vec![Token::PlusEq, Token::MinusEq, Token::Shl, Token::LtEq, Token::Lt, Token::OrOr, Token::AndAnd]
        );
    }

    #[test]
    fn test_keyword_prefix_is_identifier() {
        assert_eq!(kinds("index i32x"), vec![Token::Ident("index".into()), Token::Ident("i32x".into())]);
    }

    #[test]
    fn test_tokenize_spans() {
        let tokens = tokenize("check c0").unwrap();
        assert_eq!(tokens[0].1, Span::new(0, 5));
        assert_eq!(tokens[1].1, Span::new(6, 8));
    }

    #[test]
    fn test_span_covers_construct() {
        let tokens = tokenize("a[i + 1]").unwrap();
        let whole = tokens[0].1.to(tokens[5].1);
        assert_eq!(whole.range(), 0..8);
        assert_eq!(whole.to_string(), "0..8");
    }

    #[test]
    fn test_tokenize_skips_comments() {
        assert_eq!(kinds("store // trailing\nafter"), vec![Token::Store, Token::After]);
    }

    #[test]
    fn test_unexpected_character() {
        let err = tokenize("a[i] / 2").unwrap_err();
        assert_eq!(err.span(), Some(Span::new(5, 6)));
        assert!(matches!(err, RceError::Lexer { .. }));
    }
}
