//! Deterministic error signatures.
//!
//! A signature identifies the *shape* of a mistake: literal values and
//! user-chosen identifiers are normalized away so that `x = 1/0` and
//! `total = 5/0` share one cache entry.

use crate::config::types::ErrorKind;
use crate::detect::lexer::{tokenize, TokenKind};
use sha2::{Digest, Sha256};

pub const SIGNATURE_LEN: usize = 16;

const SEPARATOR: u8 = 0x1f;

const KEYWORDS: &[&str] = &[
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global", "if",
    "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return", "try",
    "while", "with", "yield",
];

const BUILTINS: &[&str] = &[
    "abs", "all", "any", "bool", "dict", "enumerate", "filter", "float", "input", "int",
    "isinstance", "len", "list", "map", "max", "min", "open", "print", "range", "reversed",
    "round", "set", "sorted", "str", "sum", "tuple", "type", "zip",
];

/// `sha256(kind 0x1f normalized_message 0x1f normalized_pattern)`, first 16 hex chars.
///
/// The exception name is folded into the message as `Name: message` before
/// normalization, matching how the interpreter prints it.
pub fn derive_signature(kind: ErrorKind, name: &str, raw_message: &str, snippet: &str) -> String {
    let message = if name.is_empty() {
        normalize_message(raw_message)
    } else {
        normalize_message(&format!("{}: {}", name, raw_message))
    };
    let pattern = normalize_code_pattern(snippet);

    let mut hasher = Sha256::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(message.as_bytes());
    hasher.update([SEPARATOR]);
    hasher.update(pattern.as_bytes());
    let digest = hex::encode(hasher.finalize());
    digest[..SIGNATURE_LEN].to_string()
}

/// Strip run-specific details from an error message.
pub fn normalize_message(message: &str) -> String {
    let message = strip_detected_suffix(message);
    let chars: Vec<char> = message.chars().collect();
    let mut out = String::with_capacity(chars.len());
    let mut i = 0;

    let boundary = |idx: usize| idx == 0 || !is_word_char(chars[idx - 1]);

    while i < chars.len() {
        let c = chars[i];

        if (c == '\'' || c == '"') && boundary(i) {
            if let Some(end) = closing_quote(&chars, i) {
                out.push_str("'_'");
                i = end + 1;
                continue;
            }
        }

        if c == '0'
            && boundary(i)
            && matches!(chars.get(i + 1), Some('x') | Some('X'))
            && chars.get(i + 2).map_or(false, |h| h.is_ascii_hexdigit())
        {
            i += 2;
            while i < chars.len() && chars[i].is_ascii_hexdigit() {
                i += 1;
            }
            out.push_str("ADDR");
            continue;
        }

        if c.is_ascii_digit() && boundary(i) {
            while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.' || chars[i] == '_') {
                i += 1;
            }
            out.push('N');
            continue;
        }

        if c.is_whitespace() {
            while i < chars.len() && chars[i].is_whitespace() {
                i += 1;
            }
            if !out.is_empty() && i < chars.len() {
                out.push(' ');
            }
            continue;
        }

        out.push(c);
        i += 1;
    }

    out.trim().to_string()
}

/// Reduce a source line to its token structure.
pub fn normalize_code_pattern(snippet: &str) -> String {
    let mut out = String::new();
    for token in tokenize(snippet.trim()) {
        match token.kind {
            TokenKind::Name => {
                let text = token.text.as_str();
                if KEYWORDS.contains(&text) || BUILTINS.contains(&text) {
                    out.push_str(text);
                } else {
                    out.push_str("ID");
                }
            }
            TokenKind::Number => out.push_str("NUM"),
            TokenKind::Str { .. } => out.push_str("STR"),
            TokenKind::Op | TokenKind::Open | TokenKind::Close => out.push_str(&token.text),
            TokenKind::Comment | TokenKind::Newline => {}
        }
    }
    out
}

fn is_word_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_'
}

fn closing_quote(chars: &[char], open: usize) -> Option<usize> {
    let quote = chars[open];
    (open + 1..chars.len()).find(|&j| {
        chars[j] == quote && chars.get(j + 1).map_or(true, |n| !is_word_char(*n))
    })
}

fn strip_detected_suffix(message: &str) -> &str {
    match message.find(" (detected at line ") {
        Some(idx) => {
            let rest = &message[idx..];
            match rest.find(')') {
                Some(close) if close + 1 == rest.len() => &message[..idx],
                _ => message,
            }
        }
        None => message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_message_normalization() {
        assert_eq!(
            normalize_message("name 'total' is not defined"),
            "name '_' is not defined"
        );
        assert_eq!(
            normalize_message("unterminated string literal (detected at line 12)"),
            "unterminated string literal"
        );
        assert_eq!(
            normalize_message("object at 0x7f3a2b1c   has   no len"),
            "object at ADDR has no len"
        );
        assert_eq!(
            normalize_message("list index 10 out of range for x2"),
            "list index N out of range for x2"
        );
    }

    #[test]
    fn test_apostrophe_is_not_a_quote() {
        assert_eq!(
            normalize_message("can't multiply sequence by non-int of type 'float'"),
            "can't multiply sequence by non-int of type '_'"
        );
    }

    #[test]
    fn test_code_pattern_keeps_structure() {
        assert_eq!(normalize_code_pattern("x = 1/0"), "ID=NUM/NUM");
        assert_eq!(normalize_code_pattern("  print('hi'"), "print(STR");
        assert_eq!(
            normalize_code_pattern("if n in items:  # check"),
            "ifIDinID:"
        );
    }

    #[test]
    fn test_renamed_identifiers_collide() {
        let a = derive_signature(ErrorKind::Runtime, "ZeroDivisionError", "division by zero", "x = 1/0");
        let b = derive_signature(
            ErrorKind::Runtime,
            "ZeroDivisionError",
            "division by zero",
            "total = 5/0",
        );
        assert_eq!(a, b);
        assert_eq!(a.len(), SIGNATURE_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_kind_and_structure_change_signature() {
        let base = derive_signature(ErrorKind::Runtime, "NameError", "name 'x' is not defined", "print(x)");
        let kind = derive_signature(ErrorKind::Warning, "NameError", "name 'x' is not defined", "print(x)");
        let shape = derive_signature(ErrorKind::Runtime, "NameError", "name 'x' is not defined", "print(x + 1)");
        let name = derive_signature(ErrorKind::Runtime, "TypeError", "name 'x' is not defined", "print(x)");
        assert_ne!(base, kind);
        assert_ne!(base, shape);
        assert_ne!(base, name);
    }

    proptest! {
        #[test]
        fn prop_signature_is_deterministic(msg in ".{0,80}", snippet in ".{0,80}") {
            let a = derive_signature(ErrorKind::Syntax, "SyntaxError", &msg, &snippet);
            let b = derive_signature(ErrorKind::Syntax, "SyntaxError", &msg, &snippet);
            prop_assert_eq!(&a, &b);
            prop_assert_eq!(a.len(), SIGNATURE_LEN);
        }

        #[test]
        fn prop_identifier_choice_is_irrelevant(ident in "[a-z][a-z0-9_]{0,10}", n in 0u32..10_000) {
            prop_assume!(!KEYWORDS.contains(&ident.as_str()) && !BUILTINS.contains(&ident.as_str()));
            let snippet = format!("{} = {} / 0", ident, n);
            let a = derive_signature(ErrorKind::Runtime, "ZeroDivisionError", "division by zero", &snippet);
            let b = derive_signature(ErrorKind::Runtime, "ZeroDivisionError", "division by zero", "x = 1/0");
            prop_assert_eq!(a, b);
        }
    }
}
