//! String manipulation chips.

use std::sync::Arc;

use serde_json::{json, Value};

use reasonchip_core::{Chip, ChipMeta, Chipset, FnChip};

fn request_schema(extra: Value) -> Value {
    let mut properties = json!({"s": {"type": "string"}});
    if let (Some(base), Some(more)) = (properties.as_object_mut(), extra.as_object()) {
        for (key, value) in more {
            base.insert(key.clone(), value.clone());
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": ["s"],
        "additionalProperties": false
    })
}

fn response_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"result": {}},
        "required": ["result"]
    })
}

fn s_of(request: &Value) -> String {
    request
        .get("s")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

pub struct StringsChipset;

impl Chipset for StringsChipset {
    fn namespace(&self) -> &str {
        "strings"
    }

    fn chips(&self) -> Vec<Arc<dyn Chip>> {
        vec![
            Arc::new(
                FnChip::new(
                    "strings.upper",
                    ChipMeta::new(request_schema(json!({})), response_schema()),
                    |request| async move { Ok(json!({"result": s_of(&request).to_uppercase()})) },
                )
                .with_description("Uppercase a string"),
            ),
            Arc::new(
                FnChip::new(
                    "strings.lower",
                    ChipMeta::new(request_schema(json!({})), response_schema()),
                    |request| async move { Ok(json!({"result": s_of(&request).to_lowercase()})) },
                )
                .with_description("Lowercase a string"),
            ),
            Arc::new(
                FnChip::new(
                    "strings.strip",
                    ChipMeta::new(request_schema(json!({})), response_schema()),
                    |request| async move { Ok(json!({"result": s_of(&request).trim()})) },
                )
                .with_description("Trim surrounding whitespace"),
            ),
            Arc::new(
                FnChip::new(
                    "strings.split",
                    ChipMeta::new(
                        request_schema(json!({"sep": {"type": "string"}})),
                        response_schema(),
                    ),
                    |request| async move {
                        let s = s_of(&request);
                        let parts: Vec<&str> = match request.get("sep").and_then(Value::as_str) {
                            Some(sep) => s.split(sep).collect(),
                            None => s.split_whitespace().collect(),
                        };
                        Ok(json!({"result": parts}))
                    },
                )
                .with_description("Split a string into parts"),
            ),
            Arc::new(
                FnChip::new(
                    "strings.join",
                    ChipMeta::new(
                        json!({
                            "type": "object",
                            "properties": {
                                "parts": {"type": "array", "items": {"type": "string"}},
                                "sep": {"type": "string"}
                            },
                            "required": ["parts"],
                            "additionalProperties": false
                        }),
                        response_schema(),
                    ),
                    |request| async move {
                        let sep = request
                            .get("sep")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .to_string();
                        let parts: Vec<String> = request
                            .get("parts")
                            .and_then(Value::as_array)
                            .map(|items| {
                                items
                                    .iter()
                                    .filter_map(Value::as_str)
                                    .map(str::to_string)
                                    .collect()
                            })
                            .unwrap_or_default();
                        Ok(json!({"result": parts.join(&sep)}))
                    },
                )
                .with_description("Join parts with a separator"),
            ),
            Arc::new(
                FnChip::new(
                    "strings.replace",
                    ChipMeta::new(
                        request_schema(json!({
                            "from": {"type": "string"},
                            "to": {"type": "string"}
                        })),
                        response_schema(),
                    ),
                    |request| async move {
                        let s = s_of(&request);
                        let from = request.get("from").and_then(Value::as_str).unwrap_or("");
                        let to = request.get("to").and_then(Value::as_str).unwrap_or("");
                        let result = if from.is_empty() {
                            s
                        } else {
                            s.replace(from, to)
                        };
                        Ok(json!({"result": result}))
                    },
                )
                .with_description("Replace occurrences of a substring"),
            ),
        ]
    }
}
