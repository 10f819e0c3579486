//! The token definition for the clause-list literal language.
//!
//! The language is the list-of-tuples shape an LLM emits for a simple filter,
//! e.g. `[('state', '=', 'posted'), '|', ('active', '=', True)]`.

/// A token is a single unit of the language, with a specific kind and location.
#[derive(Debug, Clone, PartialEq)]
pub struct Token<'a> {
    pub kind: TokenKind<'a>,
    pub span: Span,
}

/// The kind of a token.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind<'a> {
    // Literal keywords
    True,  // "True" / "true"
    False, // "False" / "false"
    None,  // "None" / "null"

    // Literals
    Identifier(&'a str),
    /// The raw string content between the quotes, escapes not yet resolved.
    String(&'a str),
    Integer(i64),
    Float(f64),

    // Punctuation
    LParen,   // (
    RParen,   // )
    LBracket, // [
    RBracket, // ]
    Comma,    // ,

    // Special
    /// A string literal whose closing quote never appeared.
    UnterminatedString,
    Illegal, // An illegal/unknown character
}

/// Represents a span in the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Span {
    /// The starting byte offset.
    pub start: usize,
    /// The ending byte offset.
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }
}
