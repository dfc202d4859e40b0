//! Structural validation of chip payloads against a JSON-Schema subset.
//!
//! Supported keywords: `type` (string or array of strings), `const`,
//! `enum`, `required`, `properties`, `additionalProperties: false`,
//! `items`. A null schema accepts anything.
//!
//! Validation walks the payload once, driven by the keywords the schema
//! actually carries, and collects every violation instead of stopping at
//! the first; the chip gets one message naming all of them.

use serde_json::Value;

const KNOWN_KINDS: &[&str] = &[
    "null", "boolean", "integer", "number", "string", "array", "object",
];

/// JSON kind name of a value, as used in `type` specs and diagnostics.
fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.as_i64().is_some() || n.as_u64().is_some() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Whether a value satisfies one expected kind name. `number` covers
/// both numeric kinds.
fn kind_accepts(expected: &str, value: &Value) -> bool {
    expected == kind_of(value) || (expected == "number" && value.is_number())
}

/// Check that a schema document itself is well-formed.
pub fn check_schema(schema: &Value) -> Result<(), String> {
    if schema.is_null() {
        return Ok(());
    }
    let rules = schema
        .as_object()
        .ok_or_else(|| "schema must be a mapping".to_string())?;
    if let Some(type_spec) = rules.get("type") {
        let names: Vec<&str> = match type_spec {
            Value::String(name) => vec![name.as_str()],
            Value::Array(names) => {
                if names.iter().any(|n| !n.is_string()) {
                    return Err("schema.type entries must be strings".to_string());
                }
                names.iter().filter_map(Value::as_str).collect()
            }
            _ => return Err("schema.type must be a string or array".to_string()),
        };
        for name in names {
            if !KNOWN_KINDS.contains(&name) {
                return Err(format!("unknown schema type '{name}'"));
            }
        }
    }
    if let Some(properties) = rules.get("properties") {
        let map = properties
            .as_object()
            .ok_or_else(|| "schema.properties must be a mapping".to_string())?;
        for (key, child) in map {
            check_schema(child).map_err(|reason| format!("properties.{key}: {reason}"))?;
        }
    }
    if let Some(items) = rules.get("items") {
        check_schema(items).map_err(|reason| format!("items: {reason}"))?;
    }
    Ok(())
}

pub fn validate(value: &Value, schema: &Value) -> Result<(), String> {
    let mut violations = Vec::new();
    collect(value, schema, "$", &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(violations.join("; "))
    }
}

fn collect(value: &Value, schema: &Value, path: &str, out: &mut Vec<String>) {
    if schema.is_null() {
        return;
    }
    let Some(rules) = schema.as_object() else {
        out.push(format!("{path}: schema must be a mapping"));
        return;
    };

    for (keyword, spec) in rules {
        match keyword.as_str() {
            "type" => check_type_rule(value, spec, path, out),
            "const" => {
                if value != spec {
                    out.push(format!("{path}: must equal the constant {spec}"));
                }
            }
            "enum" => check_enum(value, spec, path, out),
            "required" => check_required(value, spec, path, out),
            "properties" => {
                check_properties(value, spec, rules.get("additionalProperties"), path, out)
            }
            // Consumed alongside `properties`.
            "additionalProperties" => {}
            "items" => check_items(value, spec, path, out),
            // Unknown keywords are inert in this subset.
            _ => {}
        }
    }
}

fn check_type_rule(value: &Value, spec: &Value, path: &str, out: &mut Vec<String>) {
    let allowed: Vec<&str> = match spec {
        Value::String(name) => vec![name.as_str()],
        Value::Array(names) => names.iter().filter_map(Value::as_str).collect(),
        _ => {
            out.push(format!("{path}: malformed type spec"));
            return;
        }
    };
    if !allowed.iter().any(|name| kind_accepts(name, value)) {
        out.push(format!(
            "{path}: expected {}, found {}",
            allowed.join(" or "),
            kind_of(value)
        ));
    }
}

fn check_enum(value: &Value, spec: &Value, path: &str, out: &mut Vec<String>) {
    match spec.as_array() {
        Some(options) if options.contains(value) => {}
        Some(_) => out.push(format!("{path}: not one of the permitted values")),
        None => out.push(format!("{path}: malformed enum spec")),
    }
}

fn check_required(value: &Value, spec: &Value, path: &str, out: &mut Vec<String>) {
    let Some(object) = value.as_object() else {
        out.push(format!(
            "{path}: required fields need an object, found {}",
            kind_of(value)
        ));
        return;
    };
    for key in spec.as_array().into_iter().flatten().filter_map(Value::as_str) {
        if !object.contains_key(key) {
            out.push(format!("{path}: field '{key}' is required but missing"));
        }
    }
}

/// Walk the payload's own fields: known ones recurse into their schema,
/// unknown ones are rejected when the schema is sealed.
fn check_properties(
    value: &Value,
    spec: &Value,
    additional: Option<&Value>,
    path: &str,
    out: &mut Vec<String>,
) {
    let Some(properties) = spec.as_object() else {
        out.push(format!("{path}: malformed properties spec"));
        return;
    };
    let Some(object) = value.as_object() else {
        out.push(format!(
            "{path}: properties need an object, found {}",
            kind_of(value)
        ));
        return;
    };

    let sealed = additional.and_then(Value::as_bool) == Some(false);
    for (key, field) in object {
        match properties.get(key) {
            Some(field_schema) => collect(field, field_schema, &format!("{path}.{key}"), out),
            None if sealed => out.push(format!("{path}: field '{key}' is not allowed")),
            None => {}
        }
    }
}

fn check_items(value: &Value, spec: &Value, path: &str, out: &mut Vec<String>) {
    let Some(items) = value.as_array() else {
        out.push(format!(
            "{path}: items need an array, found {}",
            kind_of(value)
        ));
        return;
    };
    for (i, item) in items.iter().enumerate() {
        collect(item, spec, &format!("{path}[{i}]"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_null_schema_accepts_anything() {
        assert!(validate(&json!({"any": ["thing"]}), &Value::Null).is_ok());
    }

    #[test]
    fn test_required_and_types() {
        let schema = json!({
            "type": "object",
            "properties": {"count": {"type": "integer"}},
            "required": ["count"]
        });
        assert!(validate(&json!({"count": 3}), &schema).is_ok());
        let err = validate(&json!({"count": "x"}), &schema).unwrap_err();
        assert!(err.contains("expected integer, found string"));
        let err = validate(&json!({}), &schema).unwrap_err();
        assert!(err.contains("'count' is required but missing"));
    }

    #[test]
    fn test_integer_satisfies_number() {
        let schema = json!({"type": "number"});
        assert!(validate(&json!(3), &schema).is_ok());
        assert!(validate(&json!(3.5), &schema).is_ok());
        assert!(validate(&json!("3"), &schema).is_err());
    }

    #[test]
    fn test_additional_properties_rejected() {
        let schema = json!({
            "type": "object",
            "properties": {"s": {"type": "string"}},
            "additionalProperties": false
        });
        let err = validate(&json!({"s": "ok", "extra": 1}), &schema).unwrap_err();
        assert!(err.contains("field 'extra' is not allowed"));
    }

    #[test]
    fn test_const_and_enum() {
        assert!(validate(&json!("a"), &json!({"enum": ["a", "b"]})).is_ok());
        let err = validate(&json!("z"), &json!({"enum": ["a", "b"]})).unwrap_err();
        assert!(err.contains("permitted values"));
        let err = validate(&json!(2), &json!({"const": 1})).unwrap_err();
        assert!(err.contains("constant"));
    }

    #[test]
    fn test_items_validate_each_element() {
        let schema = json!({"type": "array", "items": {"type": "string"}});
        assert!(validate(&json!(["a", "b"]), &schema).is_ok());
        let err = validate(&json!(["a", 2]), &schema).unwrap_err();
        assert!(err.contains("$[1]"));
    }

    #[test]
    fn test_every_violation_is_reported() {
        let schema = json!({
            "type": "object",
            "properties": {
                "a": {"type": "integer"},
                "b": {"type": "string"}
            },
            "required": ["a", "b"]
        });
        let err = validate(&json!({"a": "oops"}), &schema).unwrap_err();
        assert!(err.contains("$.a: expected integer"));
        assert!(err.contains("'b' is required but missing"));
    }

    #[test]
    fn test_check_schema_rejects_malformed() {
        assert!(check_schema(&json!({"type": "object"})).is_ok());
        assert!(check_schema(&json!({"type": "banana"})).is_err());
        assert!(check_schema(&json!(["not", "a", "schema"])).is_err());
        assert!(check_schema(&json!({"properties": {"x": {"type": "nope"}}})).is_err());
    }
}
