use serde_json::Value;

use crate::context::Context;
use crate::scan::{QuoteState, split_top_level};
use crate::value::{loose_eq, number_value, strict_eq, to_number, truthy, value_to_string};

/// A malformed expression. Evaluation failures are non-fatal at render
/// time: the renderer logs them and contributes empty output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct EvalError {
    pub message: String,
}

impl EvalError {
    fn new<T: Into<String>>(message: T) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Expression error: {}", self.message)
    }
}

impl std::error::Error for EvalError {}

type EvalResult = Result<Value, EvalError>;

/// Evaluate an expression span against a context.
///
/// Precedence, lowest to highest: `||` -> `&&` -> comparisons ->
/// additive/multiplicative arithmetic -> unary `!` -> literals and
/// dotted-path lookups. Splitting is quote-aware throughout, with the
/// same algorithm the parser uses for argument spans.
pub(crate) fn evaluate(text: &str, context: &Context) -> EvalResult {
    let text = text.trim();
    if text.is_empty() {
        return Ok(Value::Null);
    }
    eval_or(text, context)
}

// `||` short-circuits to the first truthy operand, or `false` when every
// operand is falsy.
fn eval_or(text: &str, context: &Context) -> EvalResult {
    let parts = split_top_level(text, "||");
    if parts.len() == 1 {
        return eval_and(text, context);
    }
    for part in parts {
        let value = eval_and(part.trim(), context)?;
        if truthy(&value) {
            return Ok(value);
        }
    }
    Ok(Value::Bool(false))
}

// `&&` short-circuits to `false` on the first falsy operand, otherwise
// yields the last operand evaluated.
fn eval_and(text: &str, context: &Context) -> EvalResult {
    let parts = split_top_level(text, "&&");
    if parts.len() == 1 {
        return eval_comparison(text, context);
    }
    let mut last = Value::Bool(false);
    for part in parts {
        let value = eval_comparison(part.trim(), context)?;
        if !truthy(&value) {
            return Ok(Value::Bool(false));
        }
        last = value;
    }
    Ok(last)
}

const COMPARISON_OPERATORS: [&str; 8] = ["===", "!==", "==", "!=", ">=", "<=", ">", "<"];

fn eval_comparison(text: &str, context: &Context) -> EvalResult {
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    for (idx, c) in text.char_indices() {
        if quotes.update(c) {
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            _ if depth == 0 => {
                for op in COMPARISON_OPERATORS {
                    if text[idx..].starts_with(op) {
                        let left = eval_additive(text[..idx].trim(), context)?;
                        let right = eval_additive(text[idx + op.len()..].trim(), context)?;
                        return Ok(Value::Bool(apply_comparison(op, &left, &right)));
                    }
                }
            }
            _ => {}
        }
    }
    eval_additive(text, context)
}

fn apply_comparison(op: &str, left: &Value, right: &Value) -> bool {
    match op {
        "===" => strict_eq(left, right),
        "!==" => !strict_eq(left, right),
        "==" => loose_eq(left, right),
        "!=" => !loose_eq(left, right),
        // Ordering coerces both sides to numeric; a side that refuses to
        // coerce compares as NaN, i.e. always false.
        _ => {
            let (Some(x), Some(y)) = (to_number(left), to_number(right)) else {
                return false;
            };
            match op {
                ">" => x > y,
                "<" => x < y,
                ">=" => x >= y,
                "<=" => x <= y,
                _ => false,
            }
        }
    }
}

/// Split on binary `+`/`-`, leaving unary minus and scientific-notation
/// exponents (`1e-5`) intact. Each tuple carries the operator that
/// precedes the operand (`None` for the first).
fn split_additive(text: &str) -> Vec<(Option<char>, &str)> {
    let mut parts = Vec::new();
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    let mut prev: Option<char> = None;
    let mut prev_prev: Option<char> = None;
    let mut pending: Option<char> = None;
    for (idx, c) in text.char_indices() {
        if quotes.update(c) {
            prev_prev = prev;
            prev = Some(c);
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '+' | '-' if depth == 0 => {
                let exponent = matches!(prev, Some('e' | 'E'))
                    && prev_prev.is_some_and(|p| p.is_ascii_digit() || p == '.');
                let binary = prev
                    .is_some_and(|p| !matches!(p, '+' | '-' | '*' | '/' | '%'))
                    && !exponent;
                if binary {
                    parts.push((pending.take(), &text[start..idx]));
                    pending = Some(c);
                    start = idx + 1;
                    prev_prev = prev;
                    prev = Some(c);
                    continue;
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            prev_prev = prev;
            prev = Some(c);
        }
    }
    parts.push((pending, &text[start..]));
    parts
}

fn eval_additive(text: &str, context: &Context) -> EvalResult {
    let terms = split_additive(text);
    if terms.len() == 1 {
        return eval_multiplicative(text, context);
    }
    let mut acc = f64::NAN;
    for (index, (op, span)) in terms.iter().enumerate() {
        let value = eval_multiplicative(span.trim(), context)?;
        let number = to_number(&value).unwrap_or(f64::NAN);
        if index == 0 {
            acc = number;
        } else {
            match op {
                Some('+') => acc += number,
                Some('-') => acc -= number,
                _ => return Err(EvalError::new(format!("bad additive chain: '{}'", text))),
            }
        }
    }
    Ok(number_value(acc))
}

fn eval_multiplicative(text: &str, context: &Context) -> EvalResult {
    let mut quotes = QuoteState::new();
    let mut depth = 0usize;
    let mut boundaries: Vec<(usize, char)> = Vec::new();
    let mut prev: Option<char> = None;
    for (idx, c) in text.char_indices() {
        if quotes.update(c) {
            prev = Some(c);
            continue;
        }
        match c {
            '(' => depth += 1,
            ')' => depth = depth.saturating_sub(1),
            '*' | '/' | '%' if depth == 0 => {
                if prev.is_some_and(|p| !matches!(p, '+' | '-' | '*' | '/' | '%')) {
                    boundaries.push((idx, c));
                }
            }
            _ => {}
        }
        if !c.is_whitespace() {
            prev = Some(c);
        }
    }
    if boundaries.is_empty() {
        return eval_unary(text, context);
    }
    let mut acc = f64::NAN;
    let mut start = 0usize;
    let mut pending: Option<char> = None;
    for (idx, op) in boundaries.into_iter().chain(std::iter::once((text.len(), ' '))) {
        let span = text[start..idx].trim();
        let value = eval_unary(span, context)?;
        let number = to_number(&value).unwrap_or(f64::NAN);
        match pending {
            None => acc = number,
            Some('*') => acc *= number,
            Some('/') => acc /= number,
            Some('%') => acc %= number,
            Some(_) => return Err(EvalError::new(format!("bad arithmetic chain: '{}'", text))),
        }
        pending = Some(op);
        start = idx + 1;
    }
    Ok(number_value(acc))
}

fn eval_unary(text: &str, context: &Context) -> EvalResult {
    if let Some(rest) = text.strip_prefix('!') {
        let value = eval_unary(rest.trim(), context)?;
        return Ok(Value::Bool(!truthy(&value)));
    }
    eval_primary(text, context)
}

fn eval_primary(text: &str, context: &Context) -> EvalResult {
    if text.is_empty() {
        return Ok(Value::Null);
    }
    if is_quoted(text, '"') || is_quoted(text, '\'') {
        return Ok(Value::String(unescape(&text[1..text.len() - 1])));
    }
    if is_quoted(text, '`') {
        return eval_template_literal(&text[1..text.len() - 1], context);
    }
    match text {
        "true" => return Ok(Value::Bool(true)),
        "false" => return Ok(Value::Bool(false)),
        "null" | "undefined" => return Ok(Value::Null),
        _ => {}
    }
    if let Ok(number) = text.parse::<f64>() {
        return Ok(number_value(number));
    }
    if is_path(text) {
        return Ok(context.lookup(text).unwrap_or(Value::Null));
    }
    Err(EvalError::new(format!("unparseable expression: '{}'", text)))
}

fn is_quoted(text: &str, quote: char) -> bool {
    text.len() >= 2 && text.starts_with(quote) && text.ends_with(quote)
}

fn is_path(text: &str) -> bool {
    !text.is_empty()
        && text
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '@' | '$' | '-'))
}

fn unescape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c == '\\' {
            match chars.next() {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('\'') => out.push('\''),
                Some('"') => out.push('"'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
        } else {
            out.push(c);
        }
    }
    out
}

/// Backtick template literal: `${...}` spans are evaluated recursively
/// and stringified (absent/null become empty), with escape sequences for
/// newline, tab, backslash, backtick and dollar.
fn eval_template_literal(inner: &str, context: &Context) -> EvalResult {
    let mut out = String::new();
    let bytes_len = inner.len();
    let mut idx = 0usize;
    while idx < bytes_len {
        let c = match inner[idx..].chars().next() {
            Some(c) => c,
            None => break,
        };
        if c == '\\' {
            let next = inner[idx + 1..].chars().next();
            match next {
                Some('n') => out.push('\n'),
                Some('t') => out.push('\t'),
                Some('\\') => out.push('\\'),
                Some('`') => out.push('`'),
                Some('$') => out.push('$'),
                Some(other) => {
                    out.push('\\');
                    out.push(other);
                }
                None => out.push('\\'),
            }
            idx += 1 + next.map_or(0, char::len_utf8);
            continue;
        }
        if c == '$' && inner[idx..].starts_with("${") {
            let body = &inner[idx + 2..];
            let close = find_interpolation_end(body).ok_or_else(|| {
                EvalError::new("unterminated '${' in template literal".to_string())
            })?;
            let value = evaluate(&body[..close], context)?;
            out.push_str(&value_to_string(&value));
            idx += 2 + close + 1;
            continue;
        }
        out.push(c);
        idx += c.len_utf8();
    }
    Ok(Value::String(out))
}

fn find_interpolation_end(text: &str) -> Option<usize> {
    let mut quotes = QuoteState::new();
    for (idx, c) in text.char_indices() {
        if quotes.update(c) {
            continue;
        }
        if c == '}' {
            return Some(idx);
        }
    }
    None
}
