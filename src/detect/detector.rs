//! Structural syntax checks for Python snippets.
//!
//! Runs in-process without an interpreter. Messages follow the wording of
//! CPython 3.10+ so learners see the same text the interpreter would print.

use crate::config::types::{Error, ErrorKind, Position};
use crate::detect::lexer::{tokenize, Token, TokenKind};

const COMPOUND_KEYWORDS: &[&str] = &[
    "if", "elif", "else", "for", "while", "def", "class", "try", "except", "finally", "with",
];

/// Keywords only when the line is shaped like a block header
const SOFT_KEYWORDS: &[&str] = &["match", "case"];

/// Scan `code` and return syntax errors and warnings ordered by position.
///
/// At most one syntax error is reported per logical line. A bracket that is
/// never closed swallows the rest of the file, so scanning stops there.
pub fn detect(code: &str) -> Vec<Error> {
    let lines: Vec<&str> = code.split('\n').map(|l| l.trim_end_matches('\r')).collect();
    let mut scan = Scan::new(&lines);
    scan.run(&tokenize(code));

    let mut errors = scan.errors;
    errors.sort_by_key(|e| (e.position, e.kind.merge_rank()));
    errors
}

struct OpenBracket {
    ch: char,
    line: u32,
    column: u32,
}

struct BlockHeader {
    keyword: String,
    line: u32,
    /// The header itself was malformed; a missing body is not reported again
    malformed: bool,
}

struct Scan<'a> {
    lines: &'a [&'a str],
    errors: Vec<Error>,
    indents: Vec<u32>,
    brackets: Vec<OpenBracket>,
    /// Significant tokens of the current logical line
    logical: Vec<Token>,
    /// Set when the previous logical line ended with a block-opening `:`
    pending_block: Option<BlockHeader>,
    /// The current logical line already produced a syntax error
    line_failed: bool,
}

impl<'a> Scan<'a> {
    fn new(lines: &'a [&'a str]) -> Self {
        Self {
            lines,
            errors: Vec::new(),
            indents: vec![0],
            brackets: Vec::new(),
            logical: Vec::new(),
            pending_block: None,
            line_failed: false,
        }
    }

    fn run(&mut self, tokens: &[Token]) {
        for token in tokens {
            match token.kind {
                TokenKind::Comment => continue,
                TokenKind::Newline => {
                    if self.brackets.is_empty() {
                        self.end_logical_line();
                    }
                    continue;
                }
                _ => {}
            }

            if self.logical.is_empty() {
                self.start_logical_line(token);
            }

            if self.line_failed {
                self.logical.push(token.clone());
                continue;
            }

            match token.kind {
                TokenKind::Str {
                    terminated: false,
                    triple,
                } => {
                    self.unterminated_string(token, triple);
                    if triple {
                        return;
                    }
                }
                TokenKind::Open => {
                    self.brackets.push(OpenBracket {
                        ch: first_char(&token.text),
                        line: token.line,
                        column: token.column,
                    });
                }
                TokenKind::Close => self.close_bracket(token),
                _ => {}
            }

            self.logical.push(token.clone());
        }

        if let Some(open) = self.brackets.pop() {
            self.syntax_error(
                "SyntaxError",
                format!("'{}' was never closed", open.ch),
                Position::new(open.line, open.column, 1),
            );
            return;
        }

        self.end_logical_line();

        if let Some(header) = self.pending_block.take().filter(|h| !h.malformed) {
            let line = self.lines.len() as u32 + 1;
            self.push(
                ErrorKind::Syntax,
                "IndentationError",
                expected_block_message(&header),
                Position::new(line, 1, 1),
            );
        }
    }

    fn start_logical_line(&mut self, first: &Token) {
        self.line_failed = false;
        let raw = self.line_text(first.line);
        let indent: String = raw
            .chars()
            .take_while(|c| matches!(c, ' ' | '\t' | '\x0c'))
            .collect();

        if indent.contains(' ') && indent.contains('\t') {
            self.push(
                ErrorKind::Warning,
                "TabError",
                "inconsistent use of tabs and spaces in indentation".to_string(),
                Position::new(first.line, 1, indent.chars().count() as u32),
            );
        }

        // Continuation lines inherit the indentation of their logical line
        if first.column != indent.chars().count() as u32 + 1 {
            return;
        }

        let width = indent_width(&indent);
        let top = self.indents.last().copied().unwrap_or(0);
        let at = Position::new(first.line, first.column, first.width());

        if let Some(header) = self.pending_block.take() {
            if width > top {
                self.indents.push(width);
            } else if !header.malformed {
                self.syntax_error("IndentationError", expected_block_message(&header), at);
            }
            return;
        }

        if width > top {
            self.syntax_error("IndentationError", "unexpected indent".to_string(), at);
            self.indents.push(width);
        } else if width < top {
            while self.indents.last().map_or(false, |&w| w > width) {
                self.indents.pop();
            }
            if self.indents.last().copied() != Some(width) {
                self.syntax_error(
                    "IndentationError",
                    "unindent does not match any outer indentation level".to_string(),
                    at,
                );
                self.indents.push(width);
            }
        }
    }

    fn end_logical_line(&mut self) {
        let tokens = std::mem::take(&mut self.logical);
        if tokens.is_empty() {
            return;
        }

        let Some(keyword) = compound_keyword(&tokens) else {
            return;
        };

        if self.line_failed {
            self.pending_block = Some(BlockHeader {
                keyword,
                line: tokens[0].line,
                malformed: true,
            });
            return;
        }

        let mut depth = 0i32;
        let mut colon_at = None;
        for (idx, token) in tokens.iter().enumerate() {
            match token.kind {
                TokenKind::Open => depth += 1,
                TokenKind::Close => depth -= 1,
                TokenKind::Op if depth == 0 && token.text == ":" => {
                    // `lambda:` inside a header does not close it
                    let lambda_open = tokens[..idx]
                        .iter()
                        .rev()
                        .take_while(|t| !t.is_op(":"))
                        .any(|t| t.kind == TokenKind::Name && t.text == "lambda");
                    if !lambda_open {
                        colon_at = Some(idx);
                        break;
                    }
                }
                _ => {}
            }
        }

        match colon_at {
            None => {
                let last = &tokens[tokens.len() - 1];
                self.syntax_error(
                    "SyntaxError",
                    "expected ':'".to_string(),
                    Position::new(last.line, last.end_column(), 1),
                );
                self.pending_block = Some(BlockHeader {
                    keyword,
                    line: tokens[0].line,
                    malformed: true,
                });
            }
            Some(idx) if idx + 1 == tokens.len() => {
                self.pending_block = Some(BlockHeader {
                    keyword,
                    line: tokens[0].line,
                    malformed: false,
                });
            }
            Some(_) => {}
        }
    }

    fn close_bracket(&mut self, token: &Token) {
        let closer = first_char(&token.text);
        let at = Position::new(token.line, token.column, 1);
        match self.brackets.pop() {
            None => {
                self.syntax_error("SyntaxError", format!("unmatched '{}'", closer), at);
            }
            Some(open) if matching_close(open.ch) != closer => {
                let message = if open.line == token.line {
                    format!(
                        "closing parenthesis '{}' does not match opening parenthesis '{}'",
                        closer, open.ch
                    )
                } else {
                    format!(
                        "closing parenthesis '{}' does not match opening parenthesis '{}' on line {}",
                        closer, open.ch, open.line
                    )
                };
                self.syntax_error("SyntaxError", message, at);
                self.brackets.clear();
            }
            Some(_) => {}
        }
    }

    fn unterminated_string(&mut self, token: &Token, triple: bool) {
        let (message, detected) = if triple {
            ("unterminated triple-quoted string literal", self.lines.len())
        } else {
            ("unterminated string literal", token.line as usize)
        };
        let line_rest = self
            .line_text(token.line)
            .chars()
            .count()
            .saturating_sub(token.column as usize - 1)
            .max(1);
        self.syntax_error(
            "SyntaxError",
            format!("{} (detected at line {})", message, detected),
            Position::new(token.line, token.column, line_rest as u32),
        );
        self.brackets.clear();
    }

    fn syntax_error(&mut self, name: &str, message: String, position: Position) {
        if self.line_failed {
            return;
        }
        self.line_failed = true;
        self.push(ErrorKind::Syntax, name, message, position);
    }

    fn push(&mut self, kind: ErrorKind, name: &str, message: String, position: Position) {
        let snippet = self.line_text(position.line).trim().to_string();
        self.errors
            .push(Error::new(kind, name, message, position, snippet));
    }

    fn line_text(&self, line: u32) -> &str {
        line.checked_sub(1)
            .and_then(|idx| self.lines.get(idx as usize))
            .copied()
            .unwrap_or("")
    }
}

fn compound_keyword(tokens: &[Token]) -> Option<String> {
    let mut first = tokens.first()?;
    if first.kind == TokenKind::Name && first.text == "async" {
        first = tokens.get(1)?;
    }
    if first.kind != TokenKind::Name {
        return None;
    }
    if COMPOUND_KEYWORDS.contains(&first.text.as_str()) {
        return Some(first.text.clone());
    }
    soft_keyword_header(tokens).then(|| first.text.clone())
}

/// `match x:` and `case 1:` open blocks, while `match = 1`, `match(x)` and
/// `case.attr` are ordinary statements. Brackets are balanced at the end of a
/// logical line, so a trailing `:` is top-level.
fn soft_keyword_header(tokens: &[Token]) -> bool {
    let (Some(first), Some(second), Some(last)) = (tokens.first(), tokens.get(1), tokens.last()) else {
        return false;
    };
    SOFT_KEYWORDS.contains(&first.text.as_str())
        && tokens.len() >= 3
        && last.is_op(":")
        && (second.kind != TokenKind::Op || second.text == "-")
}

fn expected_block_message(header: &BlockHeader) -> String {
    let what = match header.keyword.as_str() {
        "def" => "function definition".to_string(),
        "class" => "class definition".to_string(),
        other => format!("'{}' statement", other),
    };
    format!(
        "expected an indented block after {} on line {}",
        what, header.line
    )
}

fn indent_width(indent: &str) -> u32 {
    let mut width = 0u32;
    for c in indent.chars() {
        match c {
            '\t' => width = (width / 8 + 1) * 8,
            '\x0c' => width = 0,
            _ => width += 1,
        }
    }
    width
}

fn first_char(text: &str) -> char {
    text.chars().next().unwrap_or(' ')
}

fn matching_close(open: char) -> char {
    match open {
        '(' => ')',
        '[' => ']',
        '{' => '}',
        other => other,
    }
}
