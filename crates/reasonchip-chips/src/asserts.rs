//! Chips for failing and checking inside pipelines.

use std::sync::Arc;

use serde_json::{json, Value};

use reasonchip_core::{evaluate_predicate, Chip, ChipMeta, Chipset, FnChip, Variables};

pub struct AssertsChipset;

impl Chipset for AssertsChipset {
    fn namespace(&self) -> &str {
        "asserts"
    }

    fn chips(&self) -> Vec<Arc<dyn Chip>> {
        vec![
            Arc::new(
                FnChip::new(
                    "asserts.fail",
                    ChipMeta::new(
                        json!({
                            "type": "object",
                            "properties": {"message": {"type": "string"}},
                            "additionalProperties": false
                        }),
                        json!({
                            "type": "object",
                            "properties": {
                                "status": {"type": "string"},
                                "error": {"type": "string"}
                            },
                            "required": ["status"]
                        }),
                    ),
                    |request| async move {
                        let message = request
                            .get("message")
                            .and_then(Value::as_str)
                            .unwrap_or("deliberate failure");
                        Ok(json!({"status": "error", "error": message}))
                    },
                )
                .with_description("Always report a structured failure"),
            ),
            Arc::new(
                FnChip::new(
                    "asserts.that",
                    ChipMeta::new(
                        json!({
                            "type": "object",
                            "properties": {
                                "condition": {},
                                "message": {"type": "string"}
                            },
                            "required": ["condition"],
                            "additionalProperties": false
                        }),
                        json!({
                            "type": "object",
                            "properties": {
                                "status": {"type": "string"},
                                "error": {"type": "string"}
                            },
                            "required": ["status"]
                        }),
                    ),
                    |request| async move {
                        let holds = match request.get("condition") {
                            // Expression strings are evaluated against the
                            // request's own fields; anything else is tested
                            // for truthiness.
                            Some(Value::String(expr)) => {
                                let scope = Variables::from_value(request.clone());
                                evaluate_predicate(expr, &scope).unwrap_or(false)
                            }
                            Some(value) => reasonchip_core::eval::truthy(value),
                            None => false,
                        };
                        if holds {
                            Ok(json!({"status": "ok"}))
                        } else {
                            let message = request
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("condition not met");
                            Ok(json!({"status": "error", "error": message}))
                        }
                    },
                )
                .with_description("Check a condition, reporting failure structurally"),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chip(name: &str) -> Arc<dyn Chip> {
        AssertsChipset
            .chips()
            .into_iter()
            .find(|chip| chip.name() == name)
            .unwrap()
    }

    #[test]
    fn test_fail_reports_message() {
        let out =
            tokio_test::block_on(chip("asserts.fail").run(json!({"message": "nope"}))).unwrap();
        assert_eq!(out, json!({"status": "error", "error": "nope"}));
    }

    #[test]
    fn test_that_truthiness() {
        let out =
            tokio_test::block_on(chip("asserts.that").run(json!({"condition": true}))).unwrap();
        assert_eq!(out["status"], json!("ok"));
        let out =
            tokio_test::block_on(chip("asserts.that").run(json!({"condition": 0}))).unwrap();
        assert_eq!(out["status"], json!("error"));
    }
}
