//! Template interpolation over `{{ expr }}` placeholders.

use serde_json::{Map, Value};

use crate::eval::{evaluate, stringify, EvalError};
use crate::variables::Variables;

/// Maximum re-interpolation depth before a template chain is considered
/// cyclic.
pub const MAX_DEPTH: usize = 64;

/// Recursively resolve placeholders in a value against the context.
///
/// A string that is exactly one placeholder takes the evaluated value
/// natively (type-preserving); otherwise placeholder results are
/// stringified and concatenated. Produced strings containing further
/// placeholders are re-interpolated up to [`MAX_DEPTH`]. Mappings and
/// sequences are rebuilt element-wise; other scalars pass through.
pub fn interpolate(value: &Value, variables: &Variables) -> Result<Value, EvalError> {
    interpolate_at(value, variables, 0)
}

fn interpolate_at(value: &Value, variables: &Variables, depth: usize) -> Result<Value, EvalError> {
    match value {
        Value::String(s) => interpolate_str(s, variables, depth),
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(interpolate_at(item, variables, depth)?);
            }
            Ok(Value::Array(out))
        }
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, item) in map {
                out.insert(key.clone(), interpolate_at(item, variables, depth)?);
            }
            Ok(Value::Object(out))
        }
        other => Ok(other.clone()),
    }
}

fn interpolate_str(text: &str, variables: &Variables, depth: usize) -> Result<Value, EvalError> {
    if depth >= MAX_DEPTH {
        return Err(EvalError::depth_exceeded(text));
    }

    let pieces = split_template(text);

    // Fast path: no placeholders at all, only unescaping to do.
    if !pieces.iter().any(|p| matches!(p, Piece::Expr(_))) {
        let literal: String = pieces
            .iter()
            .map(|p| match p {
                Piece::Text(t) => t.as_str(),
                Piece::Expr(_) => unreachable!(),
            })
            .collect();
        return Ok(Value::String(literal));
    }

    // Whole string is one placeholder: keep the native value.
    if let [Piece::Expr(expr)] = pieces.as_slice() {
        let result = evaluate(expr, variables)?;
        return reinterpolate(result, variables, depth);
    }

    let mut out = String::new();
    for piece in &pieces {
        match piece {
            Piece::Text(t) => out.push_str(t),
            Piece::Expr(expr) => {
                let result = evaluate(expr, variables)?;
                let result = reinterpolate(result, variables, depth)?;
                out.push_str(&stringify(&result));
            }
        }
    }
    Ok(Value::String(out))
}

/// A placeholder may itself evaluate to a template; resolve it with the
/// depth counter so cycles fail instead of looping.
fn reinterpolate(value: Value, variables: &Variables, depth: usize) -> Result<Value, EvalError> {
    match &value {
        Value::String(s) if has_placeholder(s) => interpolate_str(s, variables, depth + 1),
        _ => Ok(value),
    }
}

pub fn has_placeholder(text: &str) -> bool {
    split_template(text).iter().any(|p| matches!(p, Piece::Expr(_)))
}

enum Piece {
    Text(String),
    Expr(String),
}

/// Split a template into literal text and `{{ … }}` expression pieces.
/// `\{` and `\}` escape braces in literal text.
fn split_template(text: &str) -> Vec<Piece> {
    let chars: Vec<char> = text.chars().collect();
    let mut pieces = Vec::new();
    let mut literal = String::new();
    let mut i = 0;

    while i < chars.len() {
        if chars[i] == '\\' && i + 1 < chars.len() && (chars[i + 1] == '{' || chars[i + 1] == '}') {
            literal.push(chars[i + 1]);
            i += 2;
            continue;
        }
        if chars[i] == '{' && i + 1 < chars.len() && chars[i + 1] == '{' {
            // Scan ahead for the matching close.
            let mut j = i + 2;
            let mut expr = String::new();
            let mut closed = false;
            while j < chars.len() {
                if chars[j] == '\\'
                    && j + 1 < chars.len()
                    && (chars[j + 1] == '{' || chars[j + 1] == '}')
                {
                    expr.push('\\');
                    expr.push(chars[j + 1]);
                    j += 2;
                    continue;
                }
                if chars[j] == '}' && j + 1 < chars.len() && chars[j + 1] == '}' {
                    closed = true;
                    break;
                }
                expr.push(chars[j]);
                j += 1;
            }
            if closed {
                if !literal.is_empty() {
                    pieces.push(Piece::Text(std::mem::take(&mut literal)));
                }
                // Escaped braces inside the expression become literal braces
                // for the evaluator's string literals.
                let expr = expr.replace("\\{", "{").replace("\\}", "}");
                pieces.push(Piece::Expr(expr.trim().to_string()));
                i = j + 2;
                continue;
            }
        }
        literal.push(chars[i]);
        i += 1;
    }

    if !literal.is_empty() {
        pieces.push(Piece::Text(literal));
    }
    pieces
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Variables {
        Variables::from_value(value)
    }

    #[test]
    fn test_plain_values_are_idempotent() {
        let vars = ctx(json!({"a": 1}));
        for value in [
            json!("no placeholders here"),
            json!(42),
            json!([1, "two", null]),
            json!({"k": "v"}),
        ] {
            assert_eq!(interpolate(&value, &vars).unwrap(), value);
        }
    }

    #[test]
    fn test_single_placeholder_preserves_type() {
        let vars = ctx(json!({"n": 42, "xs": [1, 2], "m": {"k": 1}}));
        assert_eq!(interpolate(&json!("{{ n }}"), &vars).unwrap(), json!(42));
        assert_eq!(interpolate(&json!("{{ xs }}"), &vars).unwrap(), json!([1, 2]));
        assert_eq!(
            interpolate(&json!("{{ m }}"), &vars).unwrap(),
            json!({"k": 1})
        );
    }

    #[test]
    fn test_mixed_template_stringifies() {
        let vars = ctx(json!({"name": "Elvis", "age": 42}));
        assert_eq!(
            interpolate(&json!("{{ name }} is {{ age }}"), &vars).unwrap(),
            json!("Elvis is 42")
        );
    }

    #[test]
    fn test_nested_containers_interpolate() {
        let vars = ctx(json!({"who": "bob"}));
        assert_eq!(
            interpolate(&json!({"greeting": ["hi {{ who }}"]}), &vars).unwrap(),
            json!({"greeting": ["hi bob"]})
        );
    }

    #[test]
    fn test_chained_templates_resolve() {
        let vars = ctx(json!({"a": "{{ b }}", "b": "{{ c }}", "c": 99}));
        assert_eq!(interpolate(&json!("{{ a }}"), &vars).unwrap(), json!(99));
    }

    #[test]
    fn test_cyclic_templates_fail() {
        let vars = ctx(json!({"a": "{{ b }}", "b": "{{ a }}"}));
        let err = interpolate(&json!("{{ a }}"), &vars).unwrap_err();
        assert!(err.to_string().contains("failed to evaluate"));
    }

    #[test]
    fn test_escaped_braces_are_literal() {
        let vars = ctx(json!({"n": 1}));
        assert_eq!(
            interpolate(&json!("\\{\\{ n \\}\\}"), &vars).unwrap(),
            json!("{{ n }}")
        );
    }

    #[test]
    fn test_expression_placeholders() {
        let vars = ctx(json!({"xs": [1, 2, 3]}));
        assert_eq!(
            interpolate(&json!("total={{ sum(xs) }}"), &vars).unwrap(),
            json!("total=6")
        );
    }
}
