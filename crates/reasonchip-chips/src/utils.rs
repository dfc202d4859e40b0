//! General-purpose utility chips.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};

use reasonchip_core::{Chip, ChipMeta, Chipset, FnChip};

pub struct UtilsChipset;

impl Chipset for UtilsChipset {
    fn namespace(&self) -> &str {
        "utils"
    }

    fn chips(&self) -> Vec<Arc<dyn Chip>> {
        vec![
            Arc::new(
                FnChip::new(
                    "utils.echo",
                    ChipMeta::new(
                        json!({
                            "type": "object",
                            "properties": {"value": {}},
                            "required": ["value"],
                            "additionalProperties": false
                        }),
                        json!({
                            "type": "object",
                            "properties": {"value": {}},
                            "required": ["value"]
                        }),
                    ),
                    |request| async move {
                        Ok(json!({"value": request.get("value").cloned().unwrap_or(Value::Null)}))
                    },
                )
                .with_description("Return the given value unchanged"),
            ),
            Arc::new(
                FnChip::new(
                    "utils.sleep",
                    ChipMeta::new(
                        json!({
                            "type": "object",
                            "properties": {"seconds": {"type": "number"}},
                            "required": ["seconds"],
                            "additionalProperties": false
                        }),
                        json!({
                            "type": "object",
                            "properties": {"status": {"type": "string"}},
                            "required": ["status"]
                        }),
                    ),
                    |request| async move {
                        let seconds = request
                            .get("seconds")
                            .and_then(Value::as_f64)
                            .unwrap_or(0.0)
                            .max(0.0);
                        tokio::time::sleep(Duration::from_secs_f64(seconds)).await;
                        Ok(json!({"status": "ok"}))
                    },
                )
                .with_description("Suspend for a number of seconds"),
            ),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_echo_returns_value() {
        let chip = UtilsChipset
            .chips()
            .into_iter()
            .find(|chip| chip.name() == "utils.echo")
            .unwrap();
        let out = tokio_test::block_on(chip.run(json!({"value": [1, 2]}))).unwrap();
        assert_eq!(out, json!({"value": [1, 2]}));
    }

    #[test]
    fn test_sleep_zero_completes() {
        let chip = UtilsChipset
            .chips()
            .into_iter()
            .find(|chip| chip.name() == "utils.sleep")
            .unwrap();
        let out = tokio_test::block_on(chip.run(json!({"seconds": 0}))).unwrap();
        assert_eq!(out, json!({"status": "ok"}));
    }
}
