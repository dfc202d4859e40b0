//! Loads pipeline collections from directory trees of YAML documents.
//!
//! A pipeline file is a YAML sequence of task nodes. The pipeline name is
//! the dotted path of the file relative to the collection root with the
//! suffix removed (`chatbot/app/entry.yml` → `chatbot.app.entry`),
//! prefixed with the collection name when one is given.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;

use crate::pipeline::{Pipeline, PipelineCollection, Task};

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: invalid YAML")]
    Yaml {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{path}: pipeline document must be a sequence of tasks")]
    NotASequence { path: String },
    #[error("{path}: task {task}: {reason}")]
    InvalidTask {
        path: String,
        task: String,
        reason: String,
    },
    #[error("duplicate pipeline name '{name}' (from {path})")]
    Duplicate { name: String, path: String },
}

#[derive(Debug, Default)]
pub struct PipelineLoader;

impl PipelineLoader {
    pub fn new() -> Self {
        Self
    }

    /// Load every pipeline beneath the given collection roots.
    pub fn load_collections(
        &self,
        roots: &HashMap<String, PathBuf>,
    ) -> Result<PipelineCollection, LoadError> {
        let mut pipelines = PipelineCollection::new();
        for (collection, root) in roots {
            self.load_tree(collection, root, &mut pipelines)?;
        }
        Ok(pipelines)
    }

    pub fn load_tree(
        &self,
        collection: &str,
        root: &Path,
        pipelines: &mut PipelineCollection,
    ) -> Result<(), LoadError> {
        for relative in walk_yaml_files(root)? {
            let full = root.join(&relative);
            let name = pipeline_name(collection, &relative);
            let Some(pipeline) = self.load_file(&full, &name)? else {
                continue;
            };
            if pipelines
                .insert(name.clone(), Arc::new(pipeline))
                .is_some()
            {
                return Err(LoadError::Duplicate {
                    name,
                    path: full.display().to_string(),
                });
            }
            tracing::info!(pipeline = %name, path = %full.display(), "loaded pipeline");
        }
        Ok(())
    }

    /// Load one pipeline file. Empty documents yield None.
    pub fn load_file(&self, path: &Path, name: &str) -> Result<Option<Pipeline>, LoadError> {
        let display = path.display().to_string();
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: display.clone(),
            source,
        })?;
        self.load_str(&content, name, &display)
    }

    pub fn load_str(
        &self,
        content: &str,
        name: &str,
        path: &str,
    ) -> Result<Option<Pipeline>, LoadError> {
        if content.trim().is_empty() {
            return Ok(None);
        }
        let document: serde_yaml::Value =
            serde_yaml::from_str(content).map_err(|source| LoadError::Yaml {
                path: path.to_string(),
                source,
            })?;
        if document.is_null() {
            return Ok(None);
        }
        if !document.is_sequence() {
            return Err(LoadError::NotASequence {
                path: path.to_string(),
            });
        }
        let tasks: Vec<Task> =
            serde_yaml::from_str(content).map_err(|source| LoadError::Yaml {
                path: path.to_string(),
                source,
            })?;
        for (i, task) in tasks.iter().enumerate() {
            task.check().map_err(|reason| LoadError::InvalidTask {
                path: path.to_string(),
                task: task.label(i),
                reason,
            })?;
        }
        Ok(Some(Pipeline::new(name, tasks)))
    }
}

fn pipeline_name(collection: &str, relative: &Path) -> String {
    let mut dotted = relative
        .with_extension("")
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(".");
    if !collection.is_empty() {
        dotted = format!("{collection}.{dotted}");
    }
    dotted
}

/// All `*.yml` / `*.yaml` files under a root, relative paths, sorted.
/// Files and directories with a `_` prefix are skipped.
fn walk_yaml_files(root: &Path) -> Result<Vec<PathBuf>, LoadError> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|source| LoadError::Io {
            path: dir.display().to_string(),
            source,
        })?;
        for entry in entries {
            let entry = entry.map_err(|source| LoadError::Io {
                path: dir.display().to_string(),
                source,
            })?;
            let path = entry.path();
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('_') {
                continue;
            }
            if path.is_dir() {
                stack.push(path);
            } else if matches!(
                path.extension().and_then(|e| e.to_str()),
                Some("yml") | Some("yaml")
            ) {
                if let Ok(relative) = path.strip_prefix(root) {
                    found.push(relative.to_path_buf());
                }
            }
        }
    }
    found.sort();
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_names_follow_tree_layout() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "entry.yml", "- comment: top\n");
        write(dir.path(), "app/flow.yml", "- comment: nested\n");
        write(dir.path(), "_private.yml", "- comment: skipped\n");

        let loader = PipelineLoader::new();
        let mut roots = HashMap::new();
        roots.insert("chatbot".to_string(), dir.path().to_path_buf());
        let pipelines = loader.load_collections(&roots).unwrap();

        assert!(pipelines.contains_key("chatbot.entry"));
        assert!(pipelines.contains_key("chatbot.app.flow"));
        assert_eq!(pipelines.len(), 2);
    }

    #[test]
    fn test_empty_collection_name_is_unprefixed() {
        let dir = tempfile::tempdir().unwrap();
        write(dir.path(), "solo.yml", "- comment: top\n");

        let loader = PipelineLoader::new();
        let mut roots = HashMap::new();
        roots.insert(String::new(), dir.path().to_path_buf());
        let pipelines = loader.load_collections(&roots).unwrap();
        assert!(pipelines.contains_key("solo"));
    }

    #[test]
    fn test_empty_documents_are_skipped() {
        let loader = PipelineLoader::new();
        assert!(loader.load_str("", "x", "x.yml").unwrap().is_none());
        assert!(loader.load_str("# only a comment\n", "x", "x.yml").unwrap().is_none());
    }

    #[test]
    fn test_non_sequence_document_fails() {
        let loader = PipelineLoader::new();
        let err = loader.load_str("key: value\n", "x", "x.yml").unwrap_err();
        assert!(matches!(err, LoadError::NotASequence { .. }));
    }

    #[test]
    fn test_invalid_task_reports_label() {
        let loader = PipelineLoader::new();
        let err = loader
            .load_str(
                "- name: bad\n  chip: a\n  run_async: true\n",
                "x",
                "x.yml",
            )
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("bad"));
        assert!(message.contains("run_async"));
    }
}
