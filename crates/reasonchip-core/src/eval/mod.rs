//! Safe expression evaluation against a variable context.
//!
//! Expressions see the variable tree as an attribute-addressable object
//! plus a fixed set of pure builtins. There is no I/O, no module access
//! and no reflection into process internals; any name that is neither a
//! variable nor a builtin fails to evaluate.

mod builtins;
mod lexer;
mod parser;

use serde_json::{Map, Number, Value};
use thiserror::Error;

use crate::variables::Variables;

pub use builtins::type_name;
pub use parser::Statement;

use parser::{BinaryOp, Expr, Parser, UnaryOp};

#[derive(Debug, Error)]
pub enum EvalErrorKind {
    #[error("syntax error: {0}")]
    Syntax(String),
    #[error("unknown variable '{0}'")]
    UnknownName(String),
    #[error("unknown function '{0}'")]
    UnknownFunction(String),
    #[error("unknown method '{name}' on {target}")]
    UnknownMethod { target: &'static str, name: String },
    #[error("type error: {0}")]
    Type(String),
    #[error("division by zero")]
    DivisionByZero,
    #[error("interpolation depth limit exceeded")]
    DepthExceeded,
}

/// An evaluation failure carrying the source expression and the cause.
#[derive(Debug, Error)]
#[error("failed to evaluate '{expr}'")]
pub struct EvalError {
    pub expr: String,
    #[source]
    pub kind: EvalErrorKind,
}

impl EvalError {
    pub fn depth_exceeded(expr: impl Into<String>) -> Self {
        Self {
            expr: expr.into(),
            kind: EvalErrorKind::DepthExceeded,
        }
    }
}

/// Value-based truthiness: null, false, zero, and empty containers are
/// falsey.
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0).unwrap_or(true),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Human rendering used by interpolation and `str()`: strings pass
/// through unquoted, null renders empty, containers render as JSON.
pub fn stringify(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Evaluate an expression against the variable context.
pub fn evaluate(expr: &str, variables: &Variables) -> Result<Value, EvalError> {
    let tokens = lexer::tokenize(expr, expr)?;
    let ast = Parser::new(&tokens, expr).parse_expression()?;
    eval_expr(&ast, variables).map_err(|kind| EvalError {
        expr: expr.to_string(),
        kind,
    })
}

/// Evaluate an expression in boolean context.
pub fn evaluate_predicate(expr: &str, variables: &Variables) -> Result<bool, EvalError> {
    Ok(truthy(&evaluate(expr, variables)?))
}

/// Parse a code body into statements without evaluating it.
pub fn parse_program(body: &str) -> Result<Vec<Statement>, EvalError> {
    let tokens = lexer::tokenize(body, body)?;
    Parser::new(&tokens, body).parse_program()
}

/// Run a code body against a scratch scope. Each statement assigns the
/// value of its right-hand expression into the scope.
pub fn run_program(body: &str, scope: &mut Variables) -> Result<(), EvalError> {
    for statement in parse_program(body)? {
        let value = eval_expr(&statement.value, scope).map_err(|kind| EvalError {
            expr: body.to_string(),
            kind,
        })?;
        scope
            .set(&statement.target, value)
            .map_err(|err| EvalError {
                expr: body.to_string(),
                kind: EvalErrorKind::Type(err.to_string()),
            })?;
    }
    Ok(())
}

fn eval_expr(expr: &Expr, variables: &Variables) -> Result<Value, EvalErrorKind> {
    match expr {
        Expr::Null => Ok(Value::Null),
        Expr::Bool(b) => Ok(Value::Bool(*b)),
        Expr::Int(i) => Ok(Value::Number((*i).into())),
        Expr::Float(f) => Ok(Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null)),
        Expr::Str(s) => Ok(Value::String(s.clone())),
        Expr::List(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                out.push(eval_expr(item, variables)?);
            }
            Ok(Value::Array(out))
        }
        Expr::Map(entries) => {
            let mut map = Map::new();
            for (key, value) in entries {
                map.insert(key.clone(), eval_expr(value, variables)?);
            }
            Ok(Value::Object(map))
        }
        Expr::Name(name) => variables
            .root()
            .get(name)
            .cloned()
            .ok_or_else(|| EvalErrorKind::UnknownName(name.clone())),
        Expr::Attr(target, name) => {
            let value = eval_expr(target, variables)?;
            match &value {
                Value::Object(map) => map
                    .get(name)
                    .cloned()
                    .ok_or_else(|| EvalErrorKind::UnknownName(name.clone())),
                Value::Array(items) => match name.parse::<usize>() {
                    Ok(idx) => items
                        .get(idx)
                        .cloned()
                        .ok_or_else(|| EvalErrorKind::Type("sequence index out of range".into())),
                    Err(_) => Err(EvalErrorKind::Type(format!(
                        "cannot read attribute '{name}' of a list"
                    ))),
                },
                other => Err(EvalErrorKind::Type(format!(
                    "cannot read attribute '{}' of {}",
                    name,
                    type_name(other)
                ))),
            }
        }
        Expr::Index(target, index) => {
            let value = eval_expr(target, variables)?;
            let key = eval_expr(index, variables)?;
            match (&value, &key) {
                (Value::Array(items), Value::Number(n)) => {
                    let len = items.len() as i64;
                    let mut idx = n
                        .as_i64()
                        .ok_or_else(|| EvalErrorKind::Type("index must be an integer".into()))?;
                    if idx < 0 {
                        idx += len;
                    }
                    items
                        .get(idx.max(0) as usize)
                        .filter(|_| idx >= 0)
                        .cloned()
                        .ok_or_else(|| EvalErrorKind::Type("sequence index out of range".into()))
                }
                (Value::Object(map), Value::String(key)) => map
                    .get(key)
                    .cloned()
                    .ok_or_else(|| EvalErrorKind::UnknownName(key.clone())),
                (Value::String(s), Value::Number(n)) => {
                    let chars: Vec<char> = s.chars().collect();
                    let len = chars.len() as i64;
                    let mut idx = n
                        .as_i64()
                        .ok_or_else(|| EvalErrorKind::Type("index must be an integer".into()))?;
                    if idx < 0 {
                        idx += len;
                    }
                    if idx < 0 || idx >= len {
                        return Err(EvalErrorKind::Type("string index out of range".into()));
                    }
                    Ok(Value::String(chars[idx as usize].to_string()))
                }
                (target, key) => Err(EvalErrorKind::Type(format!(
                    "cannot index {} with {}",
                    type_name(target),
                    type_name(key)
                ))),
            }
        }
        Expr::Call(name, args) => {
            if !builtins::is_builtin(name) {
                return Err(EvalErrorKind::UnknownFunction(name.clone()));
            }
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, variables)?);
            }
            builtins::call(name, values)
        }
        Expr::Method(target, name, args) => {
            let value = eval_expr(target, variables)?;
            let mut values = Vec::with_capacity(args.len());
            for arg in args {
                values.push(eval_expr(arg, variables)?);
            }
            call_method(&value, name, values)
        }
        Expr::Unary(op, inner) => {
            let value = eval_expr(inner, variables)?;
            match op {
                UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                UnaryOp::Neg => match &value {
                    Value::Number(n) if n.is_i64() => Ok(Value::Number((-n.as_i64().unwrap()).into())),
                    Value::Number(n) => Ok(Number::from_f64(-n.as_f64().unwrap_or(0.0))
                        .map(Value::Number)
                        .unwrap_or(Value::Null)),
                    other => Err(EvalErrorKind::Type(format!(
                        "cannot negate {}",
                        type_name(other)
                    ))),
                },
            }
        }
        Expr::Binary(op, left, right) => eval_binary(*op, left, right, variables),
    }
}

fn eval_binary(
    op: BinaryOp,
    left: &Expr,
    right: &Expr,
    variables: &Variables,
) -> Result<Value, EvalErrorKind> {
    // Short-circuit forms first.
    match op {
        BinaryOp::And => {
            let lhs = eval_expr(left, variables)?;
            if !truthy(&lhs) {
                return Ok(lhs);
            }
            return eval_expr(right, variables);
        }
        BinaryOp::Or => {
            let lhs = eval_expr(left, variables)?;
            if truthy(&lhs) {
                return Ok(lhs);
            }
            return eval_expr(right, variables);
        }
        _ => {}
    }

    let lhs = eval_expr(left, variables)?;
    let rhs = eval_expr(right, variables)?;

    match op {
        BinaryOp::Add => match (&lhs, &rhs) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Array(a), Value::Array(b)) => {
                let mut out = a.clone();
                out.extend(b.iter().cloned());
                Ok(Value::Array(out))
            }
            _ => numeric_op(&lhs, &rhs, "+", |a, b| a.checked_add(b), |a, b| a + b),
        },
        BinaryOp::Sub => numeric_op(&lhs, &rhs, "-", |a, b| a.checked_sub(b), |a, b| a - b),
        BinaryOp::Mul => numeric_op(&lhs, &rhs, "*", |a, b| a.checked_mul(b), |a, b| a * b),
        BinaryOp::Div => {
            let b = rhs
                .as_f64()
                .ok_or_else(|| EvalErrorKind::Type("'/' on non-number".into()))?;
            let a = lhs
                .as_f64()
                .ok_or_else(|| EvalErrorKind::Type("'/' on non-number".into()))?;
            if b == 0.0 {
                return Err(EvalErrorKind::DivisionByZero);
            }
            Ok(Number::from_f64(a / b)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        BinaryOp::Mod => match (lhs.as_i64(), rhs.as_i64()) {
            (Some(_), Some(0)) => Err(EvalErrorKind::DivisionByZero),
            (Some(a), Some(b)) => Ok(Value::Number(a.rem_euclid(b).into())),
            _ => Err(EvalErrorKind::Type("'%' on non-integer".into())),
        },
        BinaryOp::Eq => Ok(Value::Bool(values_equal(&lhs, &rhs))),
        BinaryOp::Ne => Ok(Value::Bool(!values_equal(&lhs, &rhs))),
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ord = match (&lhs, &rhs) {
                (Value::Number(_), Value::Number(_)) => lhs
                    .as_f64()
                    .unwrap()
                    .partial_cmp(&rhs.as_f64().unwrap())
                    .ok_or_else(|| EvalErrorKind::Type("cannot order NaN".into()))?,
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => {
                    return Err(EvalErrorKind::Type(format!(
                        "cannot order {} and {}",
                        type_name(&lhs),
                        type_name(&rhs)
                    )))
                }
            };
            let result = match op {
                BinaryOp::Lt => ord == std::cmp::Ordering::Less,
                BinaryOp::Le => ord != std::cmp::Ordering::Greater,
                BinaryOp::Gt => ord == std::cmp::Ordering::Greater,
                BinaryOp::Ge => ord != std::cmp::Ordering::Less,
                _ => unreachable!(),
            };
            Ok(Value::Bool(result))
        }
        BinaryOp::In | BinaryOp::NotIn => {
            let contained = match &rhs {
                Value::Array(items) => items.iter().any(|item| values_equal(item, &lhs)),
                Value::Object(map) => lhs.as_str().map(|key| map.contains_key(key)).unwrap_or(false),
                Value::String(haystack) => lhs
                    .as_str()
                    .map(|needle| haystack.contains(needle))
                    .unwrap_or(false),
                other => {
                    return Err(EvalErrorKind::Type(format!(
                        "'in' on {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::Bool(contained ^ (op == BinaryOp::NotIn)))
        }
        BinaryOp::And | BinaryOp::Or => unreachable!("handled above"),
    }
}

fn numeric_op(
    lhs: &Value,
    rhs: &Value,
    symbol: &str,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    float_op: impl Fn(f64, f64) -> f64,
) -> Result<Value, EvalErrorKind> {
    match (lhs, rhs) {
        (Value::Number(a), Value::Number(b)) if a.is_i64() && b.is_i64() => {
            match int_op(a.as_i64().unwrap(), b.as_i64().unwrap()) {
                Some(result) => Ok(Value::Number(result.into())),
                None => Err(EvalErrorKind::Type(format!("integer overflow in '{symbol}'"))),
            }
        }
        (Value::Number(a), Value::Number(b)) => {
            let result = float_op(a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            Ok(Number::from_f64(result)
                .map(Value::Number)
                .unwrap_or(Value::Null))
        }
        (a, b) => Err(EvalErrorKind::Type(format!(
            "'{symbol}' on {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

/// Equality with int/float coercion.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            x == y || x.as_f64().zip(y.as_f64()).map(|(x, y)| x == y).unwrap_or(false)
        }
        _ => a == b,
    }
}

fn call_method(target: &Value, name: &str, args: Vec<Value>) -> Result<Value, EvalErrorKind> {
    let unknown = || EvalErrorKind::UnknownMethod {
        target: type_name(target),
        name: name.to_string(),
    };
    let str_arg = |idx: usize| -> Result<String, EvalErrorKind> {
        args.get(idx)
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| EvalErrorKind::Type(format!("{name}() expects a string argument")))
    };

    match target {
        Value::String(s) => match name {
            "upper" => Ok(Value::String(s.to_uppercase())),
            "lower" => Ok(Value::String(s.to_lowercase())),
            "strip" => Ok(Value::String(s.trim().to_string())),
            "split" => {
                let parts: Vec<Value> = if args.is_empty() {
                    s.split_whitespace()
                        .map(|p| Value::String(p.to_string()))
                        .collect()
                } else {
                    let sep = str_arg(0)?;
                    s.split(sep.as_str())
                        .map(|p| Value::String(p.to_string()))
                        .collect()
                };
                Ok(Value::Array(parts))
            }
            "join" => {
                let items = args
                    .first()
                    .and_then(|v| v.as_array())
                    .ok_or_else(|| EvalErrorKind::Type("join() expects a sequence".into()))?;
                let parts: Vec<String> = items.iter().map(stringify).collect();
                Ok(Value::String(parts.join(s)))
            }
            "replace" => {
                let from = str_arg(0)?;
                let to = str_arg(1)?;
                Ok(Value::String(s.replace(&from, &to)))
            }
            "startswith" => Ok(Value::Bool(s.starts_with(&str_arg(0)?))),
            "endswith" => Ok(Value::Bool(s.ends_with(&str_arg(0)?))),
            _ => Err(unknown()),
        },
        Value::Array(items) => match name {
            "count" => {
                let needle = args
                    .first()
                    .ok_or_else(|| EvalErrorKind::Type("count() expects an argument".into()))?;
                Ok(Value::Number(
                    (items.iter().filter(|item| values_equal(item, needle)).count() as i64).into(),
                ))
            }
            "index" => {
                let needle = args
                    .first()
                    .ok_or_else(|| EvalErrorKind::Type("index() expects an argument".into()))?;
                items
                    .iter()
                    .position(|item| values_equal(item, needle))
                    .map(|idx| Value::Number((idx as i64).into()))
                    .ok_or_else(|| EvalErrorKind::Type("value not in sequence".into()))
            }
            _ => Err(unknown()),
        },
        Value::Object(map) => match name {
            "get" => {
                let key = str_arg(0)?;
                Ok(map
                    .get(&key)
                    .cloned()
                    .unwrap_or_else(|| args.get(1).cloned().unwrap_or(Value::Null)))
            }
            "keys" => Ok(Value::Array(
                map.keys().cloned().map(Value::String).collect(),
            )),
            "values" => Ok(Value::Array(map.values().cloned().collect())),
            "items" => Ok(Value::Array(
                map.iter()
                    .map(|(k, v)| Value::Array(vec![Value::String(k.clone()), v.clone()]))
                    .collect(),
            )),
            _ => Err(unknown()),
        },
        _ => Err(unknown()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ctx(value: Value) -> Variables {
        Variables::from_value(value)
    }

    #[test]
    fn test_variable_lookup_and_arithmetic() {
        let vars = ctx(json!({"x": 5, "user": {"age": 42}}));
        assert_eq!(evaluate("x + 1", &vars).unwrap(), json!(6));
        assert_eq!(evaluate("user.age", &vars).unwrap(), json!(42));
        assert_eq!(evaluate("user['age'] / 2", &vars).unwrap(), json!(21.0));
    }

    #[test]
    fn test_predicate_truthiness() {
        let vars = ctx(json!({"x": 5, "items": []}));
        assert!(evaluate_predicate("x > 4 and x < 6", &vars).unwrap());
        assert!(!evaluate_predicate("items", &vars).unwrap());
        assert!(evaluate_predicate("not items", &vars).unwrap());
    }

    #[test]
    fn test_unknown_name_fails() {
        let vars = ctx(json!({}));
        let err = evaluate("nonexistent", &vars).unwrap_err();
        assert!(matches!(err.kind, EvalErrorKind::UnknownName(_)));
        assert_eq!(err.expr, "nonexistent");
    }

    #[test]
    fn test_forbidden_names_fail() {
        let vars = ctx(json!({}));
        assert!(evaluate("__import__('os')", &vars).is_err());
        assert!(evaluate("open('/etc/passwd')", &vars).is_err());
    }

    #[test]
    fn test_short_circuit_skips_bad_operand() {
        let vars = ctx(json!({"present": true}));
        assert!(evaluate_predicate("present or missing", &vars).unwrap());
        assert!(!evaluate_predicate("not present and missing", &vars).unwrap());
    }

    #[test]
    fn test_membership_and_comparison() {
        let vars = ctx(json!({"xs": [1, 2, 3], "m": {"k": 1}, "s": "hello"}));
        assert!(evaluate_predicate("2 in xs", &vars).unwrap());
        assert!(evaluate_predicate("'k' in m", &vars).unwrap());
        assert!(evaluate_predicate("'ell' in s", &vars).unwrap());
        assert!(evaluate_predicate("4 not in xs", &vars).unwrap());
        assert!(evaluate_predicate("'abc' < 'abd'", &vars).unwrap());
    }

    #[test]
    fn test_methods() {
        let vars = ctx(json!({"s": " hi ", "xs": ["a", "b"], "m": {"k": 7}}));
        assert_eq!(evaluate("s.strip().upper()", &vars).unwrap(), json!("HI"));
        assert_eq!(evaluate("','.join(xs)", &vars).unwrap(), json!("a,b"));
        assert_eq!(evaluate("m.get('missing', 0)", &vars).unwrap(), json!(0));
        assert_eq!(evaluate("xs.index('b')", &vars).unwrap(), json!(1));
    }

    #[test]
    fn test_list_and_map_literals() {
        let vars = ctx(json!({}));
        assert_eq!(
            evaluate("[\"a\",\"b\"]", &vars).unwrap(),
            json!(["a", "b"])
        );
        assert_eq!(
            evaluate("{name: 'bob', 'age': 9}", &vars).unwrap(),
            json!({"name": "bob", "age": 9})
        );
    }

    #[test]
    fn test_negative_index() {
        let vars = ctx(json!({"xs": [1, 2, 3]}));
        assert_eq!(evaluate("xs[-1]", &vars).unwrap(), json!(3));
    }

    #[test]
    fn test_run_program_binds_result() {
        let mut scope = ctx(json!({"a": 2}));
        run_program("b = a * 3\nresult = b + 1", &mut scope).unwrap();
        assert_eq!(scope.get("result"), Some(&json!(7)));
    }
}
