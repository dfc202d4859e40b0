//! Assembling run variables from files and `--set` overrides.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::Value;

use reasonchip_core::Variables;

/// Deep-merge the given JSON files in order, then apply dotted `--set`
/// overrides. A `--set` value is parsed as JSON when possible, falling
/// back to a plain string.
pub fn assemble(files: &[PathBuf], sets: &[String]) -> Result<Value> {
    let mut variables = Variables::new();

    for file in files {
        let tree = load_file(file)?;
        variables.merge_value(&tree);
    }

    for raw in sets {
        let Some((key, value)) = raw.split_once('=') else {
            bail!("invalid --set '{raw}', expected key=value");
        };
        let value = serde_json::from_str::<Value>(value)
            .unwrap_or_else(|_| Value::String(value.to_string()));
        variables
            .set(key, value)
            .with_context(|| format!("cannot set '{key}'"))?;
    }

    Ok(variables.into_value())
}

fn load_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read variable file {}", path.display()))?;
    let tree: Value = serde_json::from_str(&content)
        .with_context(|| format!("invalid JSON in {}", path.display()))?;
    if !tree.is_object() {
        bail!("variable file {} must hold a JSON object", path.display());
    }
    Ok(tree)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn json_file(dir: &tempfile::TempDir, name: &str, content: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn test_files_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = json_file(&dir, "a.json", r#"{"x": 1, "nested": {"a": 1}}"#);
        let b = json_file(&dir, "b.json", r#"{"nested": {"b": 2}}"#);
        let merged = assemble(&[a, b], &[]).unwrap();
        assert_eq!(merged, json!({"x": 1, "nested": {"a": 1, "b": 2}}));
    }

    #[test]
    fn test_set_overrides_with_json_and_strings() {
        let merged = assemble(
            &[],
            &[
                "count=3".to_string(),
                "flag=true".to_string(),
                "name=elvis".to_string(),
                "nested.key=[1,2]".to_string(),
            ],
        )
        .unwrap();
        assert_eq!(
            merged,
            json!({"count": 3, "flag": true, "name": "elvis", "nested": {"key": [1, 2]}})
        );
    }

    #[test]
    fn test_bad_set_rejected() {
        assert!(assemble(&[], &["no-equals".to_string()]).is_err());
    }

    #[test]
    fn test_non_object_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = json_file(&dir, "bad.json", "[1, 2]");
        assert!(assemble(&[path], &[]).is_err());
    }
}
