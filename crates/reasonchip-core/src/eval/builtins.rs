//! The fixed set of pure builtin functions exposed to expressions.

use serde_json::{json, Map, Number, Value};

use super::{stringify, truthy, EvalErrorKind};

type BuiltinResult = Result<Value, EvalErrorKind>;

pub const BUILTIN_NAMES: &[&str] = &[
    "abs", "min", "max", "sum", "round", "pow", "len", "int", "float", "str", "bool", "list",
    "tuple", "dict", "sorted", "reversed", "enumerate", "range", "all", "any", "repr", "format",
    "type", "isinstance", "iter", "next", "escape", "unescape",
];

pub fn is_builtin(name: &str) -> bool {
    BUILTIN_NAMES.contains(&name)
}

fn type_error(message: impl Into<String>) -> EvalErrorKind {
    EvalErrorKind::Type(message.into())
}

fn arity(name: &str, args: &[Value], min: usize, max: usize) -> Result<(), EvalErrorKind> {
    if args.len() < min || args.len() > max {
        return Err(type_error(format!(
            "{name}() takes {min}..={max} arguments, got {}",
            args.len()
        )));
    }
    Ok(())
}

fn as_f64(value: &Value) -> Option<f64> {
    value.as_f64()
}

fn number(value: f64) -> Value {
    Number::from_f64(value).map(Value::Number).unwrap_or(Value::Null)
}

/// Iterable view used by sum/min/max/all/any/sorted and friends.
fn iterable(name: &str, value: &Value) -> Result<Vec<Value>, EvalErrorKind> {
    match value {
        Value::Array(items) => Ok(items.clone()),
        Value::String(s) => Ok(s.chars().map(|c| Value::String(c.to_string())).collect()),
        Value::Object(map) => Ok(map.keys().cloned().map(Value::String).collect()),
        other => Err(type_error(format!(
            "{name}() expects an iterable, got {}",
            type_name(other)
        ))),
    }
}

pub fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "int",
        Value::Number(_) => "float",
        Value::String(_) => "str",
        Value::Array(_) => "list",
        Value::Object(_) => "dict",
    }
}

/// Total ordering over numbers and strings, for sorted/min/max.
fn compare(a: &Value, b: &Value) -> Result<std::cmp::Ordering, EvalErrorKind> {
    match (a, b) {
        (Value::Number(_), Value::Number(_)) => {
            let (x, y) = (as_f64(a).unwrap(), as_f64(b).unwrap());
            x.partial_cmp(&y)
                .ok_or_else(|| type_error("cannot order NaN"))
        }
        (Value::String(x), Value::String(y)) => Ok(x.cmp(y)),
        _ => Err(type_error(format!(
            "cannot order {} and {}",
            type_name(a),
            type_name(b)
        ))),
    }
}

pub fn call(name: &str, args: Vec<Value>) -> BuiltinResult {
    match name {
        "abs" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Number(n) if n.is_i64() => Ok(json!(n.as_i64().unwrap().abs())),
                Value::Number(n) => Ok(number(n.as_f64().unwrap_or(0.0).abs())),
                other => Err(type_error(format!("abs() on {}", type_name(other)))),
            }
        }
        "min" | "max" => {
            arity(name, &args, 1, usize::MAX)?;
            let items = if args.len() == 1 {
                iterable(name, &args[0])?
            } else {
                args
            };
            let mut iter = items.into_iter();
            let mut best = iter
                .next()
                .ok_or_else(|| type_error(format!("{name}() of empty sequence")))?;
            for item in iter {
                let ord = compare(&item, &best)?;
                let take = if name == "min" {
                    ord == std::cmp::Ordering::Less
                } else {
                    ord == std::cmp::Ordering::Greater
                };
                if take {
                    best = item;
                }
            }
            Ok(best)
        }
        "sum" => {
            arity(name, &args, 1, 1)?;
            let items = iterable(name, &args[0])?;
            let mut int_total: i64 = 0;
            let mut float_total = 0.0;
            let mut all_ints = true;
            for item in &items {
                match item {
                    Value::Number(n) if n.is_i64() => int_total += n.as_i64().unwrap(),
                    Value::Number(n) => {
                        all_ints = false;
                        float_total += n.as_f64().unwrap_or(0.0);
                    }
                    other => {
                        return Err(type_error(format!("sum() over {}", type_name(other))));
                    }
                }
            }
            if all_ints {
                Ok(json!(int_total))
            } else {
                Ok(number(float_total + int_total as f64))
            }
        }
        "round" => {
            arity(name, &args, 1, 2)?;
            let value = as_f64(&args[0]).ok_or_else(|| type_error("round() on non-number"))?;
            let digits = match args.get(1) {
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| type_error("round() digits must be an integer"))?,
                None => 0,
            };
            let factor = 10f64.powi(digits as i32);
            let rounded = (value * factor).round() / factor;
            if digits <= 0 {
                Ok(json!(rounded as i64))
            } else {
                Ok(number(rounded))
            }
        }
        "pow" => {
            arity(name, &args, 2, 2)?;
            match (&args[0], &args[1]) {
                (Value::Number(a), Value::Number(b)) if a.is_i64() && b.is_i64() => {
                    let exp = b.as_i64().unwrap();
                    if exp >= 0 {
                        let exp = u32::try_from(exp)
                            .map_err(|_| type_error("pow() exponent too large"))?;
                        a.as_i64()
                            .unwrap()
                            .checked_pow(exp)
                            .map(|v| json!(v))
                            .ok_or_else(|| type_error("integer overflow in pow()"))
                    } else {
                        Ok(number((a.as_i64().unwrap() as f64).powi(exp as i32)))
                    }
                }
                (a, b) => {
                    let (x, y) = (
                        as_f64(a).ok_or_else(|| type_error("pow() on non-number"))?,
                        as_f64(b).ok_or_else(|| type_error("pow() on non-number"))?,
                    );
                    Ok(number(x.powf(y)))
                }
            }
        }
        "len" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::String(s) => Ok(json!(s.chars().count())),
                Value::Array(items) => Ok(json!(items.len())),
                Value::Object(map) => Ok(json!(map.len())),
                other => Err(type_error(format!("len() on {}", type_name(other)))),
            }
        }
        "int" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Number(n) if n.is_i64() => Ok(args[0].clone()),
                Value::Number(n) => Ok(json!(n.as_f64().unwrap_or(0.0).trunc() as i64)),
                Value::Bool(b) => Ok(json!(*b as i64)),
                Value::String(s) => s
                    .trim()
                    .parse::<i64>()
                    .map(|v| json!(v))
                    .map_err(|_| type_error(format!("int() cannot parse '{s}'"))),
                other => Err(type_error(format!("int() on {}", type_name(other)))),
            }
        }
        "float" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Number(n) => Ok(number(n.as_f64().unwrap_or(0.0))),
                Value::Bool(b) => Ok(number(*b as i64 as f64)),
                Value::String(s) => s
                    .trim()
                    .parse::<f64>()
                    .map(number)
                    .map_err(|_| type_error(format!("float() cannot parse '{s}'"))),
                other => Err(type_error(format!("float() on {}", type_name(other)))),
            }
        }
        "str" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(stringify(&args[0])))
        }
        "bool" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(truthy(&args[0])))
        }
        "list" | "tuple" | "iter" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Array(iterable(name, &args[0])?))
        }
        "dict" => {
            arity(name, &args, 1, 1)?;
            match &args[0] {
                Value::Object(_) => Ok(args[0].clone()),
                Value::Array(items) => {
                    let mut map = Map::new();
                    for pair in items {
                        match pair.as_array() {
                            Some(kv) if kv.len() == 2 => {
                                let key = match &kv[0] {
                                    Value::String(s) => s.clone(),
                                    other => stringify(other),
                                };
                                map.insert(key, kv[1].clone());
                            }
                            _ => return Err(type_error("dict() expects key/value pairs")),
                        }
                    }
                    Ok(Value::Object(map))
                }
                other => Err(type_error(format!("dict() on {}", type_name(other)))),
            }
        }
        "sorted" => {
            arity(name, &args, 1, 2)?;
            let mut items = iterable(name, &args[0])?;
            let mut failed = None;
            items.sort_by(|a, b| match compare(a, b) {
                Ok(ord) => ord,
                Err(err) => {
                    failed.get_or_insert(err);
                    std::cmp::Ordering::Equal
                }
            });
            if let Some(err) = failed {
                return Err(err);
            }
            if args.get(1).map(truthy).unwrap_or(false) {
                items.reverse();
            }
            Ok(Value::Array(items))
        }
        "reversed" => {
            arity(name, &args, 1, 1)?;
            let mut items = iterable(name, &args[0])?;
            items.reverse();
            Ok(Value::Array(items))
        }
        "enumerate" => {
            arity(name, &args, 1, 2)?;
            let start = match args.get(1) {
                Some(v) => v
                    .as_i64()
                    .ok_or_else(|| type_error("enumerate() start must be an integer"))?,
                None => 0,
            };
            let items = iterable(name, &args[0])?;
            Ok(Value::Array(
                items
                    .into_iter()
                    .enumerate()
                    .map(|(i, item)| json!([start + i as i64, item]))
                    .collect(),
            ))
        }
        "range" => {
            arity(name, &args, 1, 3)?;
            let int_arg = |v: &Value| {
                v.as_i64()
                    .ok_or_else(|| type_error("range() arguments must be integers"))
            };
            let (start, stop, step) = match args.len() {
                1 => (0, int_arg(&args[0])?, 1),
                2 => (int_arg(&args[0])?, int_arg(&args[1])?, 1),
                _ => (int_arg(&args[0])?, int_arg(&args[1])?, int_arg(&args[2])?),
            };
            if step == 0 {
                return Err(type_error("range() step must not be zero"));
            }
            let mut items = Vec::new();
            let mut i = start;
            while (step > 0 && i < stop) || (step < 0 && i > stop) {
                items.push(json!(i));
                i += step;
                if items.len() > 1_000_000 {
                    return Err(type_error("range() too large"));
                }
            }
            Ok(Value::Array(items))
        }
        "all" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(iterable(name, &args[0])?.iter().all(truthy)))
        }
        "any" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::Bool(iterable(name, &args[0])?.iter().any(truthy)))
        }
        "repr" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(args[0].to_string()))
        }
        "format" => {
            arity(name, &args, 1, 2)?;
            Ok(Value::String(stringify(&args[0])))
        }
        "type" => {
            arity(name, &args, 1, 1)?;
            Ok(Value::String(type_name(&args[0]).to_string()))
        }
        "isinstance" => {
            arity(name, &args, 2, 2)?;
            let actual = type_name(&args[0]);
            let matches = match &args[1] {
                Value::String(expected) => type_matches(actual, expected),
                Value::Array(options) => options
                    .iter()
                    .filter_map(|v| v.as_str())
                    .any(|expected| type_matches(actual, expected)),
                other => {
                    return Err(type_error(format!(
                        "isinstance() type must be a string, got {}",
                        type_name(other)
                    )))
                }
            };
            Ok(Value::Bool(matches))
        }
        "next" => {
            arity(name, &args, 1, 2)?;
            let items = iterable(name, &args[0])?;
            match items.into_iter().next() {
                Some(first) => Ok(first),
                None => match args.into_iter().nth(1) {
                    Some(default) => Ok(default),
                    None => Err(type_error("next() on empty sequence")),
                },
            }
        }
        "escape" => {
            arity(name, &args, 1, 1)?;
            let s = args[0]
                .as_str()
                .ok_or_else(|| type_error("escape() expects a string"))?;
            Ok(Value::String(s.replace('{', "\\{").replace('}', "\\}")))
        }
        "unescape" => {
            arity(name, &args, 1, 1)?;
            let s = args[0]
                .as_str()
                .ok_or_else(|| type_error("unescape() expects a string"))?;
            Ok(Value::String(s.replace("\\{", "{").replace("\\}", "}")))
        }
        other => Err(EvalErrorKind::UnknownFunction(other.to_string())),
    }
}

fn type_matches(actual: &str, expected: &str) -> bool {
    // "number" accepts both numeric kinds.
    actual == expected || (expected == "number" && (actual == "int" || actual == "float"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_builtins() {
        assert_eq!(call("abs", vec![json!(-5)]).unwrap(), json!(5));
        assert_eq!(call("sum", vec![json!([1, 2, 3])]).unwrap(), json!(6));
        assert_eq!(call("min", vec![json!(3), json!(1)]).unwrap(), json!(1));
        assert_eq!(call("round", vec![json!(2.6)]).unwrap(), json!(3));
        assert_eq!(call("pow", vec![json!(2), json!(10)]).unwrap(), json!(1024));
    }

    #[test]
    fn test_sequence_builtins() {
        assert_eq!(
            call("sorted", vec![json!([3, 1, 2])]).unwrap(),
            json!([1, 2, 3])
        );
        assert_eq!(
            call("reversed", vec![json!([1, 2])]).unwrap(),
            json!([2, 1])
        );
        assert_eq!(
            call("enumerate", vec![json!(["a", "b"])]).unwrap(),
            json!([[0, "a"], [1, "b"]])
        );
        assert_eq!(call("range", vec![json!(3)]).unwrap(), json!([0, 1, 2]));
        assert_eq!(call("len", vec![json!({"a": 1})]).unwrap(), json!(1));
    }

    #[test]
    fn test_conversions_and_predicates() {
        assert_eq!(call("int", vec![json!("42")]).unwrap(), json!(42));
        assert_eq!(call("str", vec![json!(7)]).unwrap(), json!("7"));
        assert_eq!(call("bool", vec![json!("")]).unwrap(), json!(false));
        assert_eq!(call("type", vec![json!(1.5)]).unwrap(), json!("float"));
        assert_eq!(
            call("isinstance", vec![json!(1), json!("int")]).unwrap(),
            json!(true)
        );
        assert_eq!(call("all", vec![json!([1, 0])]).unwrap(), json!(false));
        assert_eq!(call("any", vec![json!([0, 2])]).unwrap(), json!(true));
    }

    #[test]
    fn test_escape_roundtrip() {
        let escaped = call("escape", vec![json!("{{x}}")]).unwrap();
        assert_eq!(escaped, json!("\\{\\{x\\}\\}"));
        assert_eq!(call("unescape", vec![escaped]).unwrap(), json!("{{x}}"));
    }

    #[test]
    fn test_unknown_function_is_rejected() {
        assert!(matches!(
            call("open", vec![]),
            Err(EvalErrorKind::UnknownFunction(_))
        ));
    }
}
