//! Structural view of argument-parser definitions in a workflow script.

use std::ops::Range;

use super::lexer::{Spanned, StringLit, Token};
use super::SlotValue;

/// Value of a keyword argument inside an `add_argument(...)` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// A literal with a statically known value.
    Literal { value: SlotValue, span: Range<usize> },
    /// A string whose exact value is known but which is used as a name or
    /// help text rather than a slot.
    Text(String),
    /// Anything else: `None`, names, calls, f-strings, arithmetic.
    Opaque,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Keyword {
    pub name: String,
    pub value: ArgValue,
}

/// One `<parser>.add_argument(...)` call.
#[derive(Debug, Clone, PartialEq)]
pub struct ArgumentCall {
    pub span: Range<usize>,
    /// Positional string arguments (`"--width3"`, `"-w"`).
    pub flags: Vec<String>,
    pub keywords: Vec<Keyword>,
}

impl ArgumentCall {
    pub fn keyword(&self, name: &str) -> Option<&ArgValue> {
        self.keywords
            .iter()
            .find(|k| k.name == name)
            .map(|k| &k.value)
    }

    /// Destination name the parsed value is stored under.
    pub fn dest(&self) -> Option<String> {
        if let Some(ArgValue::Literal {
            value: SlotValue::Text(dest),
            ..
        }) = self.keyword("dest")
        {
            return Some(dest.clone());
        }
        let flag = self
            .flags
            .iter()
            .find(|f| f.starts_with("--"))
            .or_else(|| self.flags.first())?;
        let name = flag.trim_start_matches('-').replace('-', "_");
        if name.is_empty() { None } else { Some(name) }
    }

    pub fn help(&self) -> Option<&str> {
        match self.keyword("help")? {
            ArgValue::Literal {
                value: SlotValue::Text(help),
                ..
            } => Some(help),
            ArgValue::Text(help) => Some(help),
            _ => None,
        }
    }
}

/// Find every `.add_argument(` call in the token stream.
pub fn argument_calls(tokens: &[Spanned<Token>]) -> Vec<ArgumentCall> {
    let mut calls = Vec::new();
    let mut i = 0;
    while i + 2 < tokens.len() {
        let is_call = tokens[i].token == Token::Punct('.')
            && matches!(&tokens[i + 1].token, Token::Ident(name) if name == "add_argument")
            && tokens[i + 2].token == Token::Punct('(');
        if !is_call {
            i += 1;
            continue;
        }
        let open = i + 2;
        let Some(close) = matching_paren(tokens, open) else {
            break;
        };
        calls.push(parse_call(tokens, open, close));
        i = close + 1;
    }
    calls
}

fn matching_paren(tokens: &[Spanned<Token>], open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (idx, token) in tokens.iter().enumerate().skip(open) {
        match token.token {
            Token::Punct('(' | '[' | '{') => depth += 1,
            Token::Punct(')' | ']' | '}') => {
                depth -= 1;
                if depth == 0 {
                    return Some(idx);
                }
            }
            _ => {}
        }
    }
    None
}

fn parse_call(tokens: &[Spanned<Token>], open: usize, close: usize) -> ArgumentCall {
    let mut call = ArgumentCall {
        span: tokens[open - 2].span.start..tokens[close].span.end,
        flags: Vec::new(),
        keywords: Vec::new(),
    };
    for arg in split_arguments(&tokens[open + 1..close]) {
        if arg.is_empty() {
            continue;
        }
        let is_keyword = arg.len() >= 2
            && matches!(arg[0].token, Token::Ident(_))
            && arg[1].token == Token::Punct('=')
            && arg.get(2).map(|t| &t.token) != Some(&Token::Punct('='));
        if is_keyword {
            let Token::Ident(name) = &arg[0].token else {
                continue;
            };
            call.keywords.push(Keyword {
                name: name.clone(),
                value: classify_value(&arg[2..]),
            });
        } else if let [
            Spanned {
                token:
                    Token::Str(StringLit {
                        value,
                        formatted: false,
                    }),
                ..
            },
        ] = arg
        {
            call.flags.push(value.clone());
        }
    }
    call
}

/// Split call arguments on top-level commas.
fn split_arguments(tokens: &[Spanned<Token>]) -> Vec<&[Spanned<Token>]> {
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;
    for (idx, token) in tokens.iter().enumerate() {
        match token.token {
            Token::Punct('(' | '[' | '{') => depth += 1,
            Token::Punct(')' | ']' | '}') => depth = depth.saturating_sub(1),
            Token::Punct(',') if depth == 0 => {
                parts.push(&tokens[start..idx]);
                start = idx + 1;
            }
            _ => {}
        }
    }
    parts.push(&tokens[start..]);
    parts
}

fn classify_value(tokens: &[Spanned<Token>]) -> ArgValue {
    match tokens {
        [Spanned { token, span }] => match token {
            Token::Str(StringLit {
                value,
                formatted: false,
            }) => ArgValue::Literal {
                value: SlotValue::Text(value.clone()),
                span: span.clone(),
            },
            Token::Int(n) | Token::Radix(n) => ArgValue::Literal {
                value: SlotValue::Integer(*n),
                span: span.clone(),
            },
            Token::Float(x) => ArgValue::Literal {
                value: SlotValue::Float(*x),
                span: span.clone(),
            },
            _ => ArgValue::Opaque,
        },
        // `- 3`: sign separated from the literal by whitespace.
        [
            Spanned {
                token: Token::Punct('-'),
                span: sign,
            },
            Spanned { token, span },
        ] => {
            let value = match token {
                Token::Int(n) | Token::Radix(n) => n.checked_neg().map(SlotValue::Integer),
                Token::Float(x) => Some(SlotValue::Float(-x)),
                _ => None,
            };
            match value {
                Some(value) => ArgValue::Literal {
                    value,
                    span: sign.start..span.end,
                },
                None => ArgValue::Opaque,
            }
        }
        // Implicitly concatenated strings: value is known, but there is no
        // single literal span to rewrite.
        many if !many.is_empty()
            && many.iter().all(|t| {
                matches!(
                    t.token,
                    Token::Str(StringLit {
                        formatted: false,
                        ..
                    })
                )
            }) =>
        {
            let joined: String = many
                .iter()
                .filter_map(|t| match &t.token {
                    Token::Str(lit) => Some(lit.value.as_str()),
                    _ => None,
                })
                .collect();
            ArgValue::Text(joined)
        }
        _ => ArgValue::Opaque,
    }
}

#[cfg(test)]
mod tests {
    use super::super::lexer::tokenize;
    use super::*;

    fn calls(src: &str) -> Vec<ArgumentCall> {
        argument_calls(&tokenize(src).unwrap())
    }

    #[test]
    fn test_parses_flags_and_keywords() {
        let src = r#"parser.add_argument("--queue-size", "-q", type=int, default=1, help="How many")"#;
        let parsed = calls(src);
        assert_eq!(parsed.len(), 1);
        let call = &parsed[0];
        assert_eq!(call.flags, vec!["--queue-size", "-q"]);
        assert_eq!(call.dest().as_deref(), Some("queue_size"));
        assert_eq!(call.help(), Some("How many"));
        assert!(matches!(call.keyword("type"), Some(ArgValue::Opaque)));
        match call.keyword("default") {
            Some(ArgValue::Literal { value, span }) => {
                assert_eq!(value, &SlotValue::Integer(1));
                assert_eq!(&src[span.clone()], "1");
            }
            other => panic!("Expected literal default, got {other:?}"),
        }
    }

    #[test]
    fn test_negative_and_opaque_defaults() {
        let parsed = calls(
            "p.add_argument('--a', default=-3)\np.add_argument('--b', default=None)\np.add_argument('--c', default=os.getcwd())\np.add_argument('--d', default=- 0x10)",
        );
        assert_eq!(parsed.len(), 4);
        assert!(matches!(
            parsed[0].keyword("default"),
            Some(ArgValue::Literal {
                value: SlotValue::Integer(-3),
                ..
            })
        ));
        assert_eq!(parsed[1].keyword("default"), Some(&ArgValue::Opaque));
        assert_eq!(parsed[2].keyword("default"), Some(&ArgValue::Opaque));
        assert!(matches!(
            parsed[3].keyword("default"),
            Some(ArgValue::Literal {
                value: SlotValue::Integer(-16),
                ..
            })
        ));
    }

    #[test]
    fn test_dest_keyword_wins() {
        let parsed = calls(r#"p.add_argument("-W", "--wide", dest="width", default=512)"#);
        assert_eq!(parsed[0].dest().as_deref(), Some("width"));
    }

    #[test]
    fn test_nested_brackets_do_not_split_arguments() {
        let parsed = calls(r#"p.add_argument("--size", default=1, choices=[1, 2, (3, 4)], help="x")"#);
        assert_eq!(parsed[0].keywords.len(), 3);
        assert_eq!(parsed[0].help(), Some("x"));
    }

    #[test]
    fn test_ignores_other_calls() {
        assert!(calls("add_argument('--x', default=1)\nparser.parse_args()").is_empty());
    }
}
