//! Lenient Python tokenizer.
//!
//! Never fails: an unterminated string becomes a `Str` token with
//! `terminated: false` and scanning resumes at the next line, so the same
//! tokenizer serves the structural detector and snippet normalization.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenKind {
    Name,
    Number,
    Str { terminated: bool, triple: bool },
    Op,
    Open,
    Close,
    Comment,
    /// End of a physical line (emitted inside brackets too)
    Newline,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub text: String,
    /// 1-based line of the first character
    pub line: u32,
    /// 1-based character column of the first character
    pub column: u32,
}

impl Token {
    /// Characters the token covers on its first line
    pub fn width(&self) -> u32 {
        let first_line = self.text.split('\n').next().unwrap_or("");
        first_line.chars().count().max(1) as u32
    }

    pub fn end_column(&self) -> u32 {
        self.column + self.width()
    }

    pub fn is_op(&self, op: &str) -> bool {
        self.kind == TokenKind::Op && self.text == op
    }
}

const OPS3: &[&str] = &["**=", "//=", ">>=", "<<=", "..."];
const OPS2: &[&str] = &[
    "==", "!=", "<=", ">=", "->", "**", "//", "<<", ">>", ":=", "+=", "-=", "*=", "/=", "%=",
    "&=", "|=", "^=", "@=",
];

const STRING_PREFIXES: &[&str] = &[
    "r", "u", "b", "f", "br", "rb", "fr", "rf",
];

struct Cursor {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
}

impl Cursor {
    fn new(src: &str) -> Self {
        Self {
            chars: src.chars().filter(|c| *c != '\r').collect(),
            pos: 0,
            line: 1,
            column: 1,
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn starts_with(&self, s: &str) -> bool {
        s.chars()
            .enumerate()
            .all(|(i, c)| self.peek_at(i) == Some(c))
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }
}

/// Tokenize Python source. Whitespace and line continuations are dropped.
pub fn tokenize(src: &str) -> Vec<Token> {
    let mut cur = Cursor::new(src);
    let mut tokens = Vec::new();

    while let Some(c) = cur.peek() {
        let (line, column) = (cur.line, cur.column);

        if c == '\n' {
            cur.bump();
            tokens.push(Token {
                kind: TokenKind::Newline,
                text: "\n".to_string(),
                line,
                column,
            });
            continue;
        }

        if c == ' ' || c == '\t' || c == '\x0c' {
            cur.bump();
            continue;
        }

        if c == '\\' && cur.peek_at(1) == Some('\n') {
            cur.bump();
            cur.bump();
            continue;
        }

        if c == '#' {
            let mut text = String::new();
            while let Some(ch) = cur.peek() {
                if ch == '\n' {
                    break;
                }
                text.push(ch);
                cur.bump();
            }
            tokens.push(Token {
                kind: TokenKind::Comment,
                text,
                line,
                column,
            });
            continue;
        }

        if c == '\'' || c == '"' {
            tokens.push(lex_string(&mut cur, String::new(), line, column));
            continue;
        }

        if c.is_ascii_digit() || (c == '.' && cur.peek_at(1).map_or(false, |n| n.is_ascii_digit())) {
            tokens.push(lex_number(&mut cur, line, column));
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let mut text = String::new();
            while let Some(ch) = cur.peek() {
                if ch.is_alphanumeric() || ch == '_' {
                    text.push(ch);
                    cur.bump();
                } else {
                    break;
                }
            }
            let quote_follows = matches!(cur.peek(), Some('\'') | Some('"'));
            if quote_follows && STRING_PREFIXES.contains(&text.to_ascii_lowercase().as_str()) {
                tokens.push(lex_string(&mut cur, text, line, column));
            } else {
                tokens.push(Token {
                    kind: TokenKind::Name,
                    text,
                    line,
                    column,
                });
            }
            continue;
        }

        if matches!(c, '(' | '[' | '{') || matches!(c, ')' | ']' | '}') {
            cur.bump();
            let kind = if matches!(c, '(' | '[' | '{') {
                TokenKind::Open
            } else {
                TokenKind::Close
            };
            tokens.push(Token {
                kind,
                text: c.to_string(),
                line,
                column,
            });
            continue;
        }

        let op = OPS3
            .iter()
            .chain(OPS2.iter())
            .find(|op| cur.starts_with(op))
            .map(|op| op.to_string());
        let text = match op {
            Some(op) => {
                for _ in 0..op.chars().count() {
                    cur.bump();
                }
                op
            }
            None => {
                cur.bump();
                c.to_string()
            }
        };
        tokens.push(Token {
            kind: TokenKind::Op,
            text,
            line,
            column,
        });
    }

    tokens
}

fn lex_string(cur: &mut Cursor, prefix: String, line: u32, column: u32) -> Token {
    let mut text = prefix;
    let quote = match cur.bump() {
        Some(q) => q,
        None => {
            return Token {
                kind: TokenKind::Str {
                    terminated: false,
                    triple: false,
                },
                text,
                line,
                column,
            }
        }
    };
    text.push(quote);

    let triple = cur.peek() == Some(quote) && cur.peek_at(1) == Some(quote);
    if triple {
        text.push(quote);
        text.push(quote);
        cur.bump();
        cur.bump();
    }

    let mut terminated = false;
    while let Some(ch) = cur.peek() {
        if ch == '\\' {
            text.push(ch);
            cur.bump();
            if let Some(escaped) = cur.bump() {
                text.push(escaped);
            }
            continue;
        }
        if ch == '\n' && !triple {
            break;
        }
        if ch == quote {
            if !triple {
                text.push(ch);
                cur.bump();
                terminated = true;
                break;
            }
            if cur.peek_at(1) == Some(quote) && cur.peek_at(2) == Some(quote) {
                for _ in 0..3 {
                    text.push(quote);
                    cur.bump();
                }
                terminated = true;
                break;
            }
        }
        text.push(ch);
        cur.bump();
    }

    Token {
        kind: TokenKind::Str { terminated, triple },
        text,
        line,
        column,
    }
}

fn lex_number(cur: &mut Cursor, line: u32, column: u32) -> Token {
    let mut text = String::new();
    while let Some(ch) = cur.peek() {
        let exponent_sign = (ch == '+' || ch == '-')
            && matches!(text.chars().last(), Some('e') | Some('E'))
            && !text.starts_with("0x")
            && !text.starts_with("0X");
        if ch.is_ascii_alphanumeric() || ch == '_' || ch == '.' || exponent_sign {
            text.push(ch);
            cur.bump();
        } else {
            break;
        }
    }
    Token {
        kind: TokenKind::Number,
        text,
        line,
        column,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(src: &str) -> Vec<TokenKind> {
        tokenize(src).into_iter().map(|t| t.kind).collect()
    }

    #[test]
    fn test_simple_statement() {
        let tokens = tokenize("x = 1/0");
        let texts: Vec<&str> = tokens.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["x", "=", "1", "/", "0"]);
        assert_eq!(tokens[2].column, 5);
    }

    #[test]
    fn test_unterminated_string_resumes_next_line() {
        let tokens = tokenize("s = 'abc\nx = 2");
        assert_eq!(
            tokens[2].kind,
            TokenKind::Str {
                terminated: false,
                triple: false
            }
        );
        assert_eq!(tokens[3].kind, TokenKind::Newline);
        assert_eq!(tokens[4].line, 2);
    }

    #[test]
    fn test_triple_quoted_spans_lines() {
        let tokens = tokenize("s = \"\"\"a\nb\"\"\"\nx");
        assert_eq!(
            tokens[2].kind,
            TokenKind::Str {
                terminated: true,
                triple: true
            }
        );
        assert_eq!(tokens[4].line, 3);
    }

    #[test]
    fn test_prefixed_string_and_escapes() {
        let tokens = tokenize(r#"f'it\'s {x}'"#);
        assert_eq!(tokens.len(), 1);
        assert!(matches!(tokens[0].kind, TokenKind::Str { terminated: true, .. }));
    }

    #[test]
    fn test_multichar_operators_and_brackets() {
        assert_eq!(
            kinds("a **= (b)"),
            vec![
                TokenKind::Name,
                TokenKind::Op,
                TokenKind::Open,
                TokenKind::Name,
                TokenKind::Close
            ]
        );
        assert!(tokenize("x := 1")[1].is_op(":="));
    }

    #[test]
    fn test_comment_and_continuation() {
        let tokens = tokenize("x = 1 + \\\n  2  # two");
        assert_eq!(tokens.last().map(|t| t.kind), Some(TokenKind::Comment));
        assert!(tokens.iter().all(|t| t.kind != TokenKind::Newline));
    }

    #[test]
    fn test_exponent_number() {
        let tokens = tokenize("1e-5+2");
        assert_eq!(tokens[0].text, "1e-5");
        assert!(tokens[1].is_op("+"));
    }
}
