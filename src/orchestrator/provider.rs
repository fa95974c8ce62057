/// Explanation providers
use crate::config::types::{Error, ErrorKind, Explanation, ProviderError};

/// Source of explanation text for an error. Treated as opaque and possibly
/// slow or failing; callers hold no cache or history lock while calling it.
pub trait ExplanationProvider: Send + Sync {
    fn generate(&self, error: &Error) -> std::result::Result<Explanation, ProviderError>;

    fn name(&self) -> &str {
        "provider"
    }
}

struct Rule {
    /// Matches the error name exactly, or any name when empty
    name: &'static str,
    /// Lowercase substring of the message, or any message when empty
    message: &'static str,
    explanation: &'static str,
    fix: &'static str,
}

const RULES: &[Rule] = &[
    Rule {
        name: "NameError",
        message: "not defined",
        explanation: "You are using a variable before assigning a value.",
        fix: "Assign the name before this line, or check its spelling.",
    },
    Rule {
        name: "UnboundLocalError",
        message: "",
        explanation: "A local variable is read before it is assigned inside this function.",
        fix: "Assign it earlier in the function, or declare it `global`/`nonlocal`.",
    },
    Rule {
        name: "IndentationError",
        message: "",
        explanation: "The indentation of this line does not fit the surrounding block.",
        fix: "Indent the block body consistently, usually by four spaces.",
    },
    Rule {
        name: "TabError",
        message: "",
        explanation: "Tabs and spaces are mixed in the indentation.",
        fix: "Use spaces only for indentation.",
    },
    Rule {
        name: "SyntaxError",
        message: "never closed",
        explanation: "A bracket or parenthesis is opened but never closed.",
        fix: "Add the matching closing bracket.",
    },
    Rule {
        name: "SyntaxError",
        message: "unterminated string",
        explanation: "A string starts with a quote but never ends.",
        fix: "Close the string with the same quote character it starts with.",
    },
    Rule {
        name: "SyntaxError",
        message: "expected ':'",
        explanation: "A statement that opens a block must end with a colon.",
        fix: "Add `:` at the end of the line.",
    },
    Rule {
        name: "SyntaxError",
        message: "",
        explanation: "There is a syntax mistake. Check brackets or colons.",
        fix: "Compare the line with the expected form of the statement.",
    },
    Rule {
        name: "ZeroDivisionError",
        message: "",
        explanation: "The code divides by zero.",
        fix: "Check the divisor is not zero before dividing.",
    },
    Rule {
        name: "TypeError",
        message: "",
        explanation: "An operation was applied to a value of the wrong type.",
        fix: "Convert the values to compatible types, e.g. with `int()` or `str()`.",
    },
    Rule {
        name: "IndexError",
        message: "",
        explanation: "A list or string is indexed past its end.",
        fix: "Check the index is smaller than `len(...)`.",
    },
    Rule {
        name: "KeyError",
        message: "",
        explanation: "A dictionary is read with a key it does not contain.",
        fix: "Use `.get(key)` or check `key in d` first.",
    },
    Rule {
        name: "AttributeError",
        message: "",
        explanation: "The value has no attribute or method with this name.",
        fix: "Check the spelling and the type of the value.",
    },
    Rule {
        name: "ValueError",
        message: "",
        explanation: "A function received a value of the right type but an unusable content.",
        fix: "Validate the input before converting or using it.",
    },
    Rule {
        name: "RecursionError",
        message: "",
        explanation: "A function calls itself without reaching a base case.",
        fix: "Add or fix the condition that stops the recursion.",
    },
    Rule {
        name: "Timeout",
        message: "",
        explanation: "The program ran longer than allowed, often because of an endless loop.",
        fix: "Check that every loop condition eventually becomes false.",
    },
    Rule {
        name: "MemoryLimit",
        message: "",
        explanation: "The program used more memory than allowed.",
        fix: "Avoid building very large lists or strings, or process data in pieces.",
    },
    Rule {
        name: "Security",
        message: "",
        explanation: "The program tried to use a resource that is not available here, such as files, the network or other processes.",
        fix: "Keep the program to computation and printing.",
    },
    Rule {
        name: "Crashed",
        message: "",
        explanation: "The program stopped abnormally.",
        fix: "Run it again; if it keeps happening, simplify the code around the last output.",
    },
    Rule {
        name: "SandboxUnavailable",
        message: "",
        explanation: "The code could not be run right now.",
        fix: "Try again later.",
    },
];

const GENERIC_EXPLANATION: &str = "An error occurred. Please check your code.";
const GENERIC_FIX: &str = "Read the error message and the highlighted line carefully.";

/// Generic text used when no provider result is available. Never cached.
pub fn fallback_explanation(error: &Error) -> Explanation {
    Explanation {
        error_name: error.name.clone(),
        explanation_text: GENERIC_EXPLANATION.to_string(),
        suggested_fix: GENERIC_FIX.to_string(),
    }
}

/// Local provider that explains common errors by name and message
#[derive(Debug, Default, Clone, Copy)]
pub struct RuleBasedProvider;

impl RuleBasedProvider {
    pub fn new() -> Self {
        Self
    }

    fn lookup(error: &Error) -> Option<&'static Rule> {
        let message = error.raw_message.to_lowercase();
        RULES.iter().find(|rule| {
            (rule.name.is_empty() || rule.name == error.name)
                && (rule.message.is_empty() || message.contains(rule.message))
        })
    }
}

impl ExplanationProvider for RuleBasedProvider {
    fn generate(&self, error: &Error) -> std::result::Result<Explanation, ProviderError> {
        if let Some(rule) = Self::lookup(error) {
            return Ok(Explanation {
                error_name: error.name.clone(),
                explanation_text: rule.explanation.to_string(),
                suggested_fix: rule.fix.to_string(),
            });
        }

        if error.kind == ErrorKind::Syntax || error.raw_message.to_lowercase().contains("syntax") {
            return Ok(Explanation {
                error_name: error.name.clone(),
                explanation_text: "There is a syntax mistake. Check brackets or colons.".to_string(),
                suggested_fix: "Compare the line with the expected form of the statement.".to_string(),
            });
        }

        Ok(fallback_explanation(error))
    }

    fn name(&self) -> &str {
        "rules"
    }
}
