/// Tracks string-literal state while scanning expression or argument text.
///
/// The parser and the expression evaluator both need to walk over spans of
/// template text without treating delimiters or operator characters inside
/// quoted strings as syntactic. They share this tracker so that the two
/// components agree on what counts as "inside a string".
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct QuoteState {
    quote: Option<char>,
    escaped: bool,
}

impl QuoteState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Feed the next character. Returns `true` if the character was consumed
    /// as part of a string literal (including its delimiters).
    pub(crate) fn update(&mut self, c: char) -> bool {
        if self.escaped {
            self.escaped = false;
            return true;
        }
        match self.quote {
            Some(q) => {
                if c == '\\' {
                    self.escaped = true;
                } else if c == q {
                    self.quote = None;
                }
                true
            }
            None => {
                if c == '"' || c == '\'' || c == '`' {
                    self.quote = Some(c);
                    true
                } else {
                    false
                }
            }
        }
    }

    pub(crate) fn in_quote(&self) -> bool {
        self.quote.is_some()
    }
}

/// Split `text` on every top-level occurrence of `separator`, respecting
/// quotes and parentheses. Always returns at least one element.
pub(crate) fn split_top_level<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut parts = Vec::new();
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut idx = 0usize;
    let bytes_len = text.len();
    while idx < bytes_len {
        let c = match text[idx..].chars().next() {
            Some(c) => c,
            None => break,
        };
        let char_len = c.len_utf8();
        if quotes.update(c) {
            idx += char_len;
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0 && text[idx..].starts_with(separator) {
                    parts.push(&text[start..idx]);
                    idx += separator.len();
                    start = idx;
                    continue;
                }
            }
        }
        idx += char_len;
    }
    parts.push(&text[start..]);
    parts
}

/// Operator tokens that distinguish a full expression span from a
/// word-by-word helper argument list. Ordered longest-first so that
/// scanning never matches a prefix of a longer operator.
pub(crate) const EXPRESSION_OPERATORS: [&str; 11] = [
    "===", "!==", "==", "!=", ">=", "<=", ">", "<", "&&", "||", "!",
];

/// Returns `true` if `text` contains any comparison/boolean operator at the
/// top level (outside quotes and parentheses).
pub(crate) fn contains_expression_operator(text: &str) -> bool {
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    for (idx, c) in text.char_indices() {
        if quotes.update(c) {
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ => {
                if depth == 0
                    && EXPRESSION_OPERATORS
                        .iter()
                        .any(|op| text[idx..].starts_with(op))
                {
                    return true;
                }
            }
        }
    }
    false
}

/// Returns `true` if `text` contains a top-level *binary* arithmetic
/// operator. `*`, `/` and `%` always count; `+`/`-` only when preceded
/// by an operand (so unary minus and `1e-5` exponents do not trigger).
pub(crate) fn contains_arithmetic_operator(text: &str) -> bool {
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    let mut prev: Option<char> = None;
    let mut prev_prev: Option<char> = None;
    for c in text.chars() {
        if quotes.update(c) {
            prev_prev = prev;
            prev = Some(c);
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '*' | '/' | '%' if depth == 0 => {
                if prev.is_some_and(|p| !matches!(p, '+' | '-' | '*' | '/' | '%')) {
                    return true;
                }
            }
            '+' | '-' if depth == 0 => {
                let exponent = matches!(prev, Some('e' | 'E'))
                    && prev_prev.is_some_and(|p| p.is_ascii_digit() || p == '.');
                if prev.is_some_and(|p| !matches!(p, '+' | '-' | '*' | '/' | '%')) && !exponent {
                    return true;
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            prev_prev = prev;
            prev = Some(c);
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ntest::timeout(100)]
    fn test_split_top_level() {
        assert_eq!(split_top_level("a || b || c", "||"), vec!["a ", " b ", " c"]);
        assert_eq!(split_top_level("a", "||"), vec!["a"]);
        assert_eq!(split_top_level(r#"'x||y' || z"#, "||"), vec!["'x||y' ", " z"]);
        assert_eq!(split_top_level("(a || b) && c", "||"), vec!["(a || b) && c"]);
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_escaped_quote_stays_in_string() {
        assert_eq!(
            split_top_level(r#""a \" || b" || c"#, "||"),
            vec![r#""a \" || b" "#, " c"]
        );
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_operator_detection() {
        assert!(contains_expression_operator("age > 18"));
        assert!(contains_expression_operator("!active"));
        assert!(contains_expression_operator(r#"tier === "gold""#));
        assert!(!contains_expression_operator("items"));
        assert!(!contains_expression_operator(r#"label "a > b""#));
        assert!(!contains_expression_operator("(gt a b) other"));
    }

    #[test]
    #[ntest::timeout(100)]
    fn test_arithmetic_detection() {
        assert!(contains_arithmetic_operator("price * quantity"));
        assert!(contains_arithmetic_operator("a - b"));
        assert!(!contains_arithmetic_operator("-5"));
        assert!(!contains_arithmetic_operator("1e-5"));
        assert!(!contains_arithmetic_operator(r#"format "%Y""#));
    }
}
