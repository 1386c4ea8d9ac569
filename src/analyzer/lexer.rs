//! Tokenizer for Python-like workflow scripts.
//!
//! Only what the analyzer needs is modelled: string literals (all quote
//! styles and prefixes), numbers, identifiers and single-character
//! punctuation. Comments and whitespace are skipped. Brackets must balance.

use std::fmt;

use logos::{Logos, Span};

use crate::errors::AnalyzerError;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum LexerError {
    #[default]
    UnexpectedCharacter,
    UnterminatedString,
    InvalidEscape,
    InvalidNumber,
    IntegerOverflow,
}

impl fmt::Display for LexerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexerError::UnexpectedCharacter => write!(f, "unexpected character"),
            LexerError::UnterminatedString => write!(f, "unterminated string literal"),
            LexerError::InvalidEscape => write!(f, "invalid escape sequence"),
            LexerError::InvalidNumber => write!(f, "invalid number literal"),
            LexerError::IntegerOverflow => write!(f, "integer literal out of range"),
        }
    }
}

/// A string literal with escapes resolved. `formatted` marks f-strings,
/// whose runtime value is not known statically.
#[derive(Debug, Clone, PartialEq)]
pub struct StringLit {
    pub value: String,
    pub formatted: bool,
}

#[derive(Logos, Debug, Clone, PartialEq)]
#[logos(error = LexerError)]
#[logos(skip r"([ \t\r\n\f]|\\\r?\n)+")]
pub enum Token {
    /// Opening quote with an optional prefix; the callback consumes the
    /// body up to the matching close.
    #[regex(r#"[rRbBuUfF]{0,2}["']"#, lex_string)]
    Str(StringLit),

    /// Signed decimal integer. The sign is part of the literal so that
    /// `i64::MIN` survives a render and re-lex.
    #[regex(r"-?[0-9][0-9_]*", lex_int)]
    Int(i64),

    #[regex(r"0[xX][0-9a-fA-F_]+", |lex| lex_radix(lex, 16))]
    #[regex(r"0[oO][0-7_]+", |lex| lex_radix(lex, 8))]
    #[regex(r"0[bB][01_]+", |lex| lex_radix(lex, 2))]
    Radix(i64),

    #[regex(
        r"-?([0-9][0-9_]*\.[0-9_]*|\.[0-9][0-9_]*)([eE][+-]?[0-9]+)?|-?[0-9][0-9_]*[eE][+-]?[0-9]+",
        lex_float
    )]
    Float(f64),

    /// Complex literals such as `2j` are never numeric slots.
    #[regex(r"[0-9][0-9_]*(\.[0-9_]*)?([eE][+-]?[0-9]+)?[jJ]")]
    Imaginary,

    /// Integer literal outside the i64 range: synthesized by [`tokenize`],
    /// not directly lexed.
    Wide(String),

    #[regex(r"[a-zA-Z_][a-zA-Z0-9_]*", |lex| lex.slice().to_string())]
    Ident(String),

    #[regex(r#"[^ \t\r\n\f#"'a-zA-Z0-9_\\]"#, lex_punct)]
    Punct(char),

    #[regex(r"#[^\r\n]*", allow_greedy = true)]
    Comment,
}

/// A value paired with its byte range in the source.
#[derive(Debug, Clone, PartialEq)]
pub struct Spanned<T> {
    pub token: T,
    pub span: Span,
}

impl<T> Spanned<T> {
    pub fn new(token: T, span: Span) -> Self {
        Self { token, span }
    }
}

/// Tokenize a script, dropping comments and checking bracket balance.
pub fn tokenize(source: &str) -> Result<Vec<Spanned<Token>>, AnalyzerError> {
    let mut tokens = Vec::new();
    let mut brackets: Vec<(char, usize)> = Vec::new();

    for (result, span) in Token::lexer(source).spanned() {
        let token = match result {
            Ok(Token::Comment) => continue,
            Ok(token) => token,
            Err(LexerError::IntegerOverflow) => Token::Wide(source[span.clone()].to_string()),
            Err(e) => return Err(unparsable(span.start, e.to_string())),
        };
        if let Token::Punct(c) = token {
            check_bracket(&mut brackets, c, span.start)?;
        }
        tokens.push(Spanned::new(token, span));
    }

    if let Some((open, offset)) = brackets.pop() {
        return Err(unparsable(offset, format!("unclosed '{}'", open)));
    }
    Ok(tokens)
}

fn unparsable(offset: usize, reason: impl Into<String>) -> AnalyzerError {
    AnalyzerError::UnparsableDefinition {
        offset,
        reason: reason.into(),
    }
}

fn check_bracket(
    brackets: &mut Vec<(char, usize)>,
    c: char,
    offset: usize,
) -> Result<(), AnalyzerError> {
    let expected = match c {
        '(' | '[' | '{' => {
            brackets.push((c, offset));
            return Ok(());
        }
        ')' => '(',
        ']' => '[',
        '}' => '{',
        _ => return Ok(()),
    };
    match brackets.pop() {
        Some((open, _)) if open == expected => Ok(()),
        Some((open, _)) => Err(unparsable(offset, format!("'{}' closes '{}'", c, open))),
        None => Err(unparsable(offset, format!("unmatched '{}'", c))),
    }
}

fn lex_punct(lex: &mut logos::Lexer<Token>) -> Result<char, LexerError> {
    lex.slice().chars().next().ok_or(LexerError::UnexpectedCharacter)
}

fn lex_int(lex: &mut logos::Lexer<Token>) -> Result<i64, LexerError> {
    let digits: String = lex.slice().chars().filter(|c| *c != '_').collect();
    digits.parse().map_err(|_| LexerError::IntegerOverflow)
}

fn lex_radix(lex: &mut logos::Lexer<Token>, radix: u32) -> Result<i64, LexerError> {
    let digits: String = lex.slice()[2..].chars().filter(|c| *c != '_').collect();
    i64::from_str_radix(&digits, radix).map_err(|_| LexerError::IntegerOverflow)
}

fn lex_float(lex: &mut logos::Lexer<Token>) -> Result<f64, LexerError> {
    let literal: String = lex.slice().chars().filter(|c| *c != '_').collect();
    literal.parse().map_err(|_| LexerError::InvalidNumber)
}

/// Consume a string body after its opening quote.
fn lex_string(lex: &mut logos::Lexer<Token>) -> Result<StringLit, LexerError> {
    let opening = lex.slice();
    let quote = opening.chars().last().ok_or(LexerError::UnterminatedString)?;
    let prefix = opening[..opening.len() - 1].to_ascii_lowercase();
    let raw = prefix.contains('r');
    let formatted = prefix.contains('f');

    let rest = lex.remainder();
    let closing: String = std::iter::repeat_n(quote, 3).collect();
    let triple = rest.starts_with(&closing[..2]);
    let (body_start, delimiter) = if triple {
        (2, closing.as_str())
    } else {
        (0, &closing[..1])
    };

    let body = &rest[body_start..];
    let mut chars = body.char_indices();
    let end = loop {
        let Some((idx, c)) = chars.next() else {
            return Err(LexerError::UnterminatedString);
        };
        match c {
            '\\' => {
                if chars.next().is_none() {
                    return Err(LexerError::UnterminatedString);
                }
            }
            '\n' if !triple => return Err(LexerError::UnterminatedString),
            c if c == quote && body[idx..].starts_with(delimiter) => break idx,
            _ => {}
        }
    };

    let value = if raw {
        body[..end].to_string()
    } else {
        decode_escapes(&body[..end])?
    };
    lex.bump(body_start + end + delimiter.len());
    Ok(StringLit { value, formatted })
}

/// Resolve backslash escapes in a non-raw string body.
fn decode_escapes(body: &str) -> Result<String, LexerError> {
    let mut out = String::with_capacity(body.len());
    let mut chars = body.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(next) = chars.next() else {
            return Err(LexerError::InvalidEscape);
        };
        match next {
            '\n' => {}
            '\r' => {
                if chars.peek() == Some(&'\n') {
                    chars.next();
                }
            }
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'n' => out.push('\n'),
            'r' => out.push('\r'),
            't' => out.push('\t'),
            '0' => out.push('\0'),
            'a' => out.push('\u{07}'),
            'b' => out.push('\u{08}'),
            'f' => out.push('\u{0c}'),
            'v' => out.push('\u{0b}'),
            'x' | 'u' | 'U' => {
                let width = match next {
                    'x' => 2,
                    'u' => 4,
                    _ => 8,
                };
                let hex: String = chars.by_ref().take(width).collect();
                if hex.len() != width || !hex.chars().all(|h| h.is_ascii_hexdigit()) {
                    return Err(LexerError::InvalidEscape);
                }
                let decoded = u32::from_str_radix(&hex, 16)
                    .ok()
                    .and_then(char::from_u32)
                    .ok_or(LexerError::InvalidEscape)?;
                out.push(decoded);
            }
            other => {
                out.push('\\');
                out.push(other);
            }
        }
    }
    Ok(out)
}
