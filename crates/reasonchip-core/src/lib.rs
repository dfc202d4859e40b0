//! # ReasonChip core
//!
//! The execution substrate for declarative YAML pipelines: a nested
//! variable context with safe expression evaluation, a typed task model
//! with its loader, a chip registry, and the recursive asynchronous
//! processor driven by an engine.

pub mod engine;
pub mod eval;
pub mod flow;
pub mod interpolate;
pub mod loader;
pub mod pipeline;
pub mod processor;
pub mod registry;
pub mod schema;
pub mod variables;

pub use engine::{Engine, EngineError};
pub use eval::{evaluate, evaluate_predicate, EvalError};
pub use flow::Flow;
pub use interpolate::interpolate;
pub use loader::{LoadError, PipelineLoader};
pub use pipeline::{Pipeline, PipelineCollection, Task};
pub use processor::{PipelineResolver, Processor, ProcessorError, WAIT_FOR_CHIP};
pub use registry::{Chip, ChipError, ChipMeta, Chipset, FnChip, Registry, RegistryError};
pub use variables::Variables;
