use serde_json::Value;

/// Template-author-visible truthiness.
///
/// Falsy values: absent/null, `false`, the empty string, the empty
/// sequence, and the strings `"false"` and `"0"`. Everything else is
/// truthy. These rules are unusual but load-bearing: templates in the
/// wild rely on `"0"` and `"false"` reading as false.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !(s.is_empty() || s == "false" || s == "0"),
        Value::Array(items) => !items.is_empty(),
        Value::Number(_) | Value::Object(_) => true,
    }
}

/// Render a value as output text. Absent/null values contribute nothing,
/// integral numbers print without a trailing `.0`, and containers fall
/// back to compact JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                i.to_string()
            } else if let Some(u) = n.as_u64() {
                u.to_string()
            } else {
                n.as_f64().map_or_else(String::new, |f| f.to_string())
            }
        }
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => {
            serde_json::to_string(value).unwrap_or_default()
        }
    }
}

/// Numeric coercion for arithmetic and ordering comparisons.
pub(crate) fn to_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        Value::Bool(true) => Some(1.0),
        Value::Bool(false) => Some(0.0),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Wrap an arithmetic result, collapsing integral floats so that
/// `5 + 10` renders as `15` rather than `15.0`. Non-finite results
/// become null (absent).
pub(crate) fn number_value(f: f64) -> Value {
    if !f.is_finite() {
        return Value::Null;
    }
    if f.fract() == 0.0 && f.abs() < 9_007_199_254_740_992.0 {
        #[allow(
            clippy::cast_possible_truncation,
            reason = "fract() == 0.0 and magnitude checked above"
        )]
        return Value::from(f as i64);
    }
    Value::from(f)
}

/// Permissive equality (`==`/`!=`): null only equals null, otherwise
/// compare numerically when both sides coerce, else compare the
/// stringified forms.
pub(crate) fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Null, _) | (_, Value::Null) => false,
        _ => {
            if let (Some(x), Some(y)) = (to_number(a), to_number(b)) {
                x == y
            } else {
                value_to_string(a) == value_to_string(b)
            }
        }
    }
}

/// Strict equality (`===`/`!==`): same kind and same value. Numbers
/// compare by numeric value regardless of integer/float representation.
pub(crate) fn strict_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}
