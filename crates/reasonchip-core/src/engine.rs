//! The engine owns the pipeline collection and chip registry and creates
//! one processor per run.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::loader::{LoadError, PipelineLoader};
use crate::pipeline::{Pipeline, PipelineCollection, Task};
use crate::processor::{PipelineResolver, Processor, ProcessorError, WAIT_FOR_CHIP};
use crate::registry::Registry;
use crate::schema;
use crate::variables::Variables;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Load(#[from] LoadError),
    #[error("pipeline '{pipeline}' task {task}: references unknown pipeline '{target}'")]
    UnknownPipelineRef {
        pipeline: String,
        task: String,
        target: String,
    },
    #[error("pipeline '{pipeline}' task {task}: references unknown chip '{target}'")]
    UnknownChipRef {
        pipeline: String,
        task: String,
        target: String,
    },
    #[error("chip '{chip}' has an invalid {side} schema: {reason}")]
    InvalidSchema {
        chip: String,
        side: &'static str,
        reason: String,
    },
    #[error("unknown entry pipeline '{0}'")]
    UnknownEntry(String),
    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

impl EngineError {
    /// True when the run ended because its cancellation token fired.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, EngineError::Processor(err) if err.is_cancelled())
    }
}

/// Resolver bound to a loaded collection.
struct CollectionResolver {
    pipelines: PipelineCollection,
}

impl PipelineResolver for CollectionResolver {
    fn resolve(&self, name: &str) -> Option<Arc<Pipeline>> {
        self.pipelines.get(name).cloned()
    }
}

pub struct Engine {
    pipelines: PipelineCollection,
    registry: Arc<Registry>,
    resolver: Arc<CollectionResolver>,
}

impl Engine {
    pub fn new(pipelines: PipelineCollection, registry: Arc<Registry>) -> Self {
        let resolver = Arc::new(CollectionResolver {
            pipelines: pipelines.clone(),
        });
        Self {
            pipelines,
            registry,
            resolver,
        }
    }

    /// Load collections from disk, then validate cross-references.
    pub fn load(
        roots: &HashMap<String, PathBuf>,
        registry: Arc<Registry>,
    ) -> Result<Self, EngineError> {
        let loader = PipelineLoader::new();
        let pipelines = loader.load_collections(roots)?;
        let engine = Self::new(pipelines, registry);
        engine.validate()?;
        Ok(engine)
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn pipeline_names(&self) -> Vec<&str> {
        self.pipelines.keys().map(String::as_str).collect()
    }

    /// Recheck collection invariants: every dispatch/branch target exists,
    /// every chip reference resolves, every registered schema parses.
    pub fn validate(&self) -> Result<(), EngineError> {
        for (name, pipeline) in &self.pipelines {
            for (i, task) in pipeline.tasks.iter().enumerate() {
                self.validate_task(name, task, i)?;
            }
        }
        for (name, chip) in self.registry.iter() {
            let meta = chip.metadata();
            schema::check_schema(&meta.request_schema).map_err(|reason| {
                EngineError::InvalidSchema {
                    chip: name.to_string(),
                    side: "request",
                    reason,
                }
            })?;
            schema::check_schema(&meta.response_schema).map_err(|reason| {
                EngineError::InvalidSchema {
                    chip: name.to_string(),
                    side: "response",
                    reason,
                }
            })?;
        }
        Ok(())
    }

    fn validate_task(&self, pipeline: &str, task: &Task, index: usize) -> Result<(), EngineError> {
        let target = match task {
            Task::Dispatch(t) => Some(&t.dispatch),
            Task::Branch(t) => Some(&t.branch),
            _ => None,
        };
        if let Some(target) = target {
            if !self.pipelines.contains_key(target) {
                return Err(EngineError::UnknownPipelineRef {
                    pipeline: pipeline.to_string(),
                    task: task.label(index),
                    target: target.clone(),
                });
            }
        }
        if let Task::Chip(t) = task {
            if t.chip != WAIT_FOR_CHIP && self.registry.lookup(&t.chip).is_none() {
                return Err(EngineError::UnknownChipRef {
                    pipeline: pipeline.to_string(),
                    task: task.label(index),
                    target: t.chip.clone(),
                });
            }
        }
        if let Task::TaskSet(t) = task {
            for (i, nested) in t.tasks.iter().enumerate() {
                self.validate_task(pipeline, nested, i)?;
            }
        }
        Ok(())
    }

    /// Run the named entry pipeline to completion.
    pub async fn run(&self, entry: &str, variables: Value) -> Result<Value, EngineError> {
        self.run_cancellable(entry, variables, CancellationToken::new())
            .await
    }

    /// Run with an externally owned cancellation token; the run returns
    /// promptly from its next suspension point once the token fires.
    pub async fn run_cancellable(
        &self,
        entry: &str,
        variables: Value,
        token: CancellationToken,
    ) -> Result<Value, EngineError> {
        let pipeline = self
            .resolver
            .resolve(entry)
            .ok_or_else(|| EngineError::UnknownEntry(entry.to_string()))?;

        tracing::info!(pipeline = %entry, "starting run");
        let processor = Processor::with_cancellation(
            self.resolver.clone(),
            self.registry.clone(),
            token,
        );
        let result = processor
            .run(&pipeline, Variables::from_value(variables))
            .await?;
        tracing::info!(pipeline = %entry, "run finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChipMeta, FnChip};
    use serde_json::json;

    fn collection(pairs: &[(&str, &str)]) -> PipelineCollection {
        pairs
            .iter()
            .map(|(name, yaml)| {
                (
                    name.to_string(),
                    Arc::new(Pipeline::new(*name, serde_yaml::from_str(yaml).unwrap())),
                )
            })
            .collect()
    }

    fn empty_registry() -> Arc<Registry> {
        Arc::new(Registry::new())
    }

    #[test]
    fn test_run_entry_pipeline() {
        let engine = Engine::new(
            collection(&[("main", "- return: done\n")]),
            empty_registry(),
        );
        let result = tokio_test::block_on(engine.run("main", json!({}))).unwrap();
        assert_eq!(result, json!("done"));
    }

    #[test]
    fn test_unknown_entry() {
        let engine = Engine::new(collection(&[]), empty_registry());
        let err = tokio_test::block_on(engine.run("ghost", json!({}))).unwrap_err();
        assert!(matches!(err, EngineError::UnknownEntry(_)));
    }

    #[test]
    fn test_validate_rejects_unknown_dispatch_target() {
        let engine = Engine::new(
            collection(&[("main", "- dispatch: missing.pipeline\n")]),
            empty_registry(),
        );
        let err = engine.validate().unwrap_err();
        assert!(matches!(err, EngineError::UnknownPipelineRef { .. }));
    }

    #[test]
    fn test_validate_rejects_unknown_chip() {
        let engine = Engine::new(
            collection(&[("main", "- tasks:\n    - chip: ghost.chip\n")]),
            empty_registry(),
        );
        let err = engine.validate().unwrap_err();
        assert!(matches!(err, EngineError::UnknownChipRef { .. }));
    }

    #[test]
    fn test_validate_allows_wait_for() {
        let engine = Engine::new(
            collection(&[("main", "- chip: wait_for\n  params: {handle: h}\n")]),
            empty_registry(),
        );
        assert!(engine.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_chip_schema() {
        let mut registry = Registry::new();
        registry
            .register(Arc::new(FnChip::new(
                "broken",
                ChipMeta::new(json!({"type": "banana"}), Value::Null),
                |_| async move { Ok(Value::Null) },
            )))
            .unwrap();
        let engine = Engine::new(collection(&[]), Arc::new(registry));
        let err = engine.validate().unwrap_err();
        assert!(matches!(err, EngineError::InvalidSchema { .. }));
    }
}
