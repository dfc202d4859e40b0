//! The pipeline interpreter.
//!
//! A processor executes one run: it walks a flow of tasks, gates them on
//! `when`, materializes scopes, expands loops, dispatches nested
//! pipelines, invokes chips and applies result bindings. Return and
//! Terminate are unwinding signals, not errors; cancellation propagates
//! through every suspension point.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::{json, Map, Value};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use thiserror::Error;

use crate::eval::{self, EvalError};
use crate::flow::Flow;
use crate::interpolate::interpolate;
use crate::pipeline::{
    ChipTask, CodeTask, DispatchTask, KeyResultInto, Pipeline, Task, TaskLogLevel,
    TaskSetTask,
};
use crate::registry::Registry;
use crate::schema;
use crate::variables::{PathError, Variables};

/// Chip name the processor intercepts to consume async handles.
pub const WAIT_FOR_CHIP: &str = "wait_for";

const HANDLE_KEY: &str = "$async_handle";

#[derive(Debug, Error)]
pub enum ProcessorError {
    #[error("in pipeline '{pipeline}', task {task}")]
    Task {
        pipeline: String,
        task: String,
        #[source]
        source: Box<ProcessorError>,
    },
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("assertion failed: {expr}")]
    AssertionFailed { expr: String },
    #[error("unknown pipeline '{0}'")]
    UnknownPipeline(String),
    #[error("unknown chip '{0}'")]
    UnknownChip(String),
    #[error("invalid parameters for chip '{chip}': {reason}")]
    ChipInvalidInput { chip: String, reason: String },
    #[error("params must interpolate to a mapping, got {got}")]
    ParamsNotAMapping { got: &'static str },
    #[error("loop value is not a sequence or mapping")]
    LoopNotIterable,
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("unknown async handle")]
    UnknownHandle,
    #[error("wait_for requires a handle produced by run_async")]
    NotAHandle,
    #[error("async task panicked: {0}")]
    JoinFailed(String),
    #[error("run cancelled")]
    Cancelled,
}

impl ProcessorError {
    /// True when the error, possibly under task context frames, is a
    /// cancellation.
    pub fn is_cancelled(&self) -> bool {
        match self {
            ProcessorError::Cancelled => true,
            ProcessorError::Task { source, .. } => source.is_cancelled(),
            _ => false,
        }
    }
}

/// Resolves pipeline names for dispatch and branch tasks; supplied by the
/// engine so the processor never holds the engine itself.
pub trait PipelineResolver: Send + Sync {
    fn resolve(&self, name: &str) -> Option<Arc<Pipeline>>;
}

impl<F> PipelineResolver for F
where
    F: Fn(&str) -> Option<Arc<Pipeline>> + Send + Sync,
{
    fn resolve(&self, name: &str) -> Option<Arc<Pipeline>> {
        self(name)
    }
}

/// Unwinding signals: errors abort the run, Terminate carries the overall
/// result.
enum Unwind {
    Error(ProcessorError),
    Terminate(Value),
}

impl From<ProcessorError> for Unwind {
    fn from(err: ProcessorError) -> Self {
        Unwind::Error(err)
    }
}

impl From<EvalError> for Unwind {
    fn from(err: EvalError) -> Self {
        Unwind::Error(err.into())
    }
}

impl From<PathError> for Unwind {
    fn from(err: PathError) -> Self {
        Unwind::Error(err.into())
    }
}

type TaskValue = Option<Value>;
type TaskResult = Result<TaskValue, Unwind>;

struct AsyncHandle {
    join: JoinHandle<TaskResult>,
    token: CancellationToken,
}

/// State shared by one run and all tasks it spawns.
struct RunContext {
    resolver: Arc<dyn PipelineResolver>,
    registry: Arc<Registry>,
    handles: Mutex<HashMap<Uuid, AsyncHandle>>,
    token: CancellationToken,
}

impl RunContext {
    async fn abort_handles(&self) {
        let mut handles = self.handles.lock().await;
        for (_, handle) in handles.drain() {
            handle.token.cancel();
            handle.join.abort();
        }
    }
}

enum TaskOutcome {
    Skipped,
    Value(TaskValue),
    Return(Value),
    Branch(Arc<Pipeline>),
}

pub struct Processor {
    resolver: Arc<dyn PipelineResolver>,
    registry: Arc<Registry>,
    token: CancellationToken,
}

impl Processor {
    pub fn new(resolver: Arc<dyn PipelineResolver>, registry: Arc<Registry>) -> Self {
        Self::with_cancellation(resolver, registry, CancellationToken::new())
    }

    pub fn with_cancellation(
        resolver: Arc<dyn PipelineResolver>,
        registry: Arc<Registry>,
        token: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            registry,
            token,
        }
    }

    /// Execute a pipeline to completion and yield its result value.
    pub async fn run(
        &self,
        pipeline: &Arc<Pipeline>,
        variables: Variables,
    ) -> Result<Value, ProcessorError> {
        let ctx = Arc::new(RunContext {
            resolver: self.resolver.clone(),
            registry: self.registry.clone(),
            handles: Mutex::new(HashMap::new()),
            token: self.token.clone(),
        });

        let mut flow = Flow::new(&pipeline.tasks);
        let mut vars = variables;
        let result = run_flow(&ctx, &mut flow, &mut vars, &pipeline.name).await;

        // Whatever happened, unconsumed handles are cancelled.
        ctx.abort_handles().await;

        match result {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Ok(Value::Null),
            Err(Unwind::Terminate(value)) => {
                tracing::info!(pipeline = %pipeline.name, "run terminated with result");
                Ok(value)
            }
            Err(Unwind::Error(err)) => Err(err),
        }
    }
}

/// Execute tasks from the front of the flow until it drains or a Return
/// unwinds it. `Ok(Some(v))` is a returned value, `Ok(None)` plain
/// completion.
fn run_flow<'a>(
    ctx: &'a Arc<RunContext>,
    flow: &'a mut Flow,
    vars: &'a mut Variables,
    pipeline: &'a str,
) -> BoxFuture<'a, Result<TaskValue, Unwind>> {
    async move {
        let mut index = 0usize;
        while let Some(task) = flow.take_front() {
            if ctx.token.is_cancelled() {
                return Err(ProcessorError::Cancelled.into());
            }

            let outcome = run_task(ctx, &task, vars, pipeline)
                .await
                .map_err(|unwind| match unwind {
                    Unwind::Error(source) => Unwind::Error(ProcessorError::Task {
                        pipeline: pipeline.to_string(),
                        task: task.label(index),
                        source: Box::new(source),
                    }),
                    terminate => terminate,
                })?;

            match outcome {
                TaskOutcome::Skipped | TaskOutcome::Value(_) => {}
                TaskOutcome::Return(value) => return Ok(Some(value)),
                TaskOutcome::Branch(target) => {
                    tracing::debug!(pipeline = %pipeline, branch = %target.name, "branching");
                    flow.clear();
                    flow.push_front(&target.tasks);
                }
            }
            index += 1;
        }
        Ok(None)
    }
    .boxed()
}

async fn run_task(
    ctx: &Arc<RunContext>,
    task: &Arc<Task>,
    vars: &mut Variables,
    pipeline: &str,
) -> Result<TaskOutcome, Unwind> {
    if let Task::Comment(_) = task.as_ref() {
        return Ok(TaskOutcome::Skipped);
    }

    if let Some(when) = task_when(task) {
        if !eval::evaluate_predicate(when, vars).map_err(ProcessorError::from)? {
            tracing::trace!(task = %task.label(0), "skipped by when condition");
            return Ok(TaskOutcome::Skipped);
        }
    }

    log_task(task, pipeline);

    match task.as_ref() {
        Task::Comment(_) => unreachable!("handled above"),
        Task::Terminate(t) => {
            let value = interpolate(&t.terminate, vars).map_err(ProcessorError::from)?;
            Err(Unwind::Terminate(value))
        }
        Task::Return(t) => {
            let value = interpolate(&t.value, vars).map_err(ProcessorError::from)?;
            Ok(TaskOutcome::Return(value))
        }
        Task::Assert(t) => {
            for expr in t.checks.expressions() {
                if !eval::evaluate_predicate(expr, vars).map_err(ProcessorError::from)? {
                    return Err(ProcessorError::AssertionFailed {
                        expr: expr.to_string(),
                    }
                    .into());
                }
            }
            Ok(TaskOutcome::Value(None))
        }
        Task::Declare(t) => {
            let declared = interpolate(&Value::Object(t.declare.clone()), vars)
                .map_err(ProcessorError::from)?;
            vars.merge_value(&declared);
            Ok(TaskOutcome::Value(None))
        }
        Task::Branch(t) => {
            let target = ctx
                .resolver
                .resolve(&t.branch)
                .ok_or_else(|| ProcessorError::UnknownPipeline(t.branch.clone()))?;
            if let Some(variables) = &t.variables {
                let fixed = interpolate(&Value::Object(variables.clone()), vars)
                    .map_err(ProcessorError::from)?;
                vars.merge_value(&fixed);
            }
            if let Some(params) = &t.params {
                let fixed = interpolate_params(params, vars)?;
                vars.merge(&fixed);
            }
            Ok(TaskOutcome::Branch(target))
        }
        Task::TaskSet(_) | Task::Dispatch(_) | Task::Chip(_) | Task::Code(_) => {
            run_loopable(ctx, task, vars, pipeline).await
        }
    }
}

/// Shared path for the four loopable, scoped, result-bound kinds.
async fn run_loopable(
    ctx: &Arc<RunContext>,
    task: &Arc<Task>,
    vars: &mut Variables,
    pipeline: &str,
) -> Result<TaskOutcome, Unwind> {
    let common = LoopableFields::of(task);

    let mut scope = vars.child();
    if let Some(variables) = common.variables {
        let fixed =
            interpolate(&Value::Object(variables.clone()), vars).map_err(ProcessorError::from)?;
        scope.merge_value(&fixed);
    }

    let Some(loop_spec) = common.loop_over else {
        let value = execute_body(ctx, task, &mut scope, pipeline).await?;
        return apply_bindings(&common, value, vars, None);
    };

    let items = loop_items(loop_spec, &scope)?;
    let total = items.len();
    scope.set("loop.length", json!(total))?;

    let mut last = TaskOutcome::Value(None);
    for (i, item) in items.into_iter().enumerate() {
        scope.set("item", item)?;
        scope.set("loop.index", json!(i + 1))?;
        scope.set("loop.index0", json!(i))?;
        scope.set("loop.first", json!(i == 0))?;
        scope.set("loop.last", json!(i + 1 == total))?;
        scope.set("loop.even", json!((i + 1) % 2 == 0))?;
        scope.set("loop.odd", json!((i + 1) % 2 == 1))?;
        scope.set("loop.revindex", json!(total - i))?;
        scope.set("loop.revindex0", json!(total - i - 1))?;

        let value = execute_body(ctx, task, &mut scope, pipeline).await?;
        last = apply_bindings(&common, value, vars, Some(&mut scope))?;
        if matches!(last, TaskOutcome::Return(_)) {
            return Ok(last);
        }
    }
    Ok(last)
}

/// The common attributes of the loopable kinds, borrowed from the task.
struct LoopableFields<'a> {
    variables: Option<&'a Map<String, Value>>,
    loop_over: Option<&'a Value>,
    run_async: bool,
    store_result_as: Option<&'a str>,
    append_result_into: Option<&'a str>,
    key_result_into: Option<&'a KeyResultInto>,
    return_result: bool,
}

impl<'a> LoopableFields<'a> {
    fn of(task: &'a Task) -> Self {
        match task {
            Task::TaskSet(t) => Self::from_parts(
                &t.variables,
                &t.loop_over,
                t.run_async,
                &t.store_result_as,
                &t.append_result_into,
                &t.key_result_into,
                t.return_result,
            ),
            Task::Dispatch(t) => Self::from_parts(
                &t.variables,
                &t.loop_over,
                t.run_async,
                &t.store_result_as,
                &t.append_result_into,
                &t.key_result_into,
                t.return_result,
            ),
            Task::Chip(t) => Self::from_parts(
                &t.variables,
                &t.loop_over,
                t.run_async,
                &t.store_result_as,
                &t.append_result_into,
                &t.key_result_into,
                t.return_result,
            ),
            Task::Code(t) => Self::from_parts(
                &t.variables,
                &t.loop_over,
                t.run_async,
                &t.store_result_as,
                &t.append_result_into,
                &t.key_result_into,
                t.return_result,
            ),
            _ => unreachable!("not a loopable task"),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn from_parts(
        variables: &'a Option<Map<String, Value>>,
        loop_over: &'a Option<Value>,
        run_async: bool,
        store: &'a Option<String>,
        append: &'a Option<String>,
        key: &'a Option<KeyResultInto>,
        return_result: bool,
    ) -> Self {
        Self {
            variables: variables.as_ref(),
            loop_over: loop_over.as_ref(),
            run_async,
            store_result_as: store.as_deref(),
            append_result_into: append.as_deref(),
            key_result_into: key.as_ref(),
            return_result,
        }
    }
}

/// Evaluate a `loop` attribute into its ordered iteration items.
fn loop_items(spec: &Value, scope: &Variables) -> Result<Vec<Value>, Unwind> {
    let resolved = match spec {
        Value::String(expr) => {
            if crate::interpolate::has_placeholder(expr) {
                interpolate(spec, scope).map_err(ProcessorError::from)?
            } else {
                eval::evaluate(expr, scope).map_err(ProcessorError::from)?
            }
        }
        other => interpolate(other, scope).map_err(ProcessorError::from)?,
    };
    match resolved {
        Value::Array(items) => Ok(items),
        // A mapping iterates {key, value} items in key order.
        Value::Object(map) => Ok(map
            .into_iter()
            .map(|(key, value)| json!({"key": key, "value": value}))
            .collect()),
        _ => Err(ProcessorError::LoopNotIterable.into()),
    }
}

/// Run the kind-specific body once, honoring `run_async`.
async fn execute_body(
    ctx: &Arc<RunContext>,
    task: &Arc<Task>,
    scope: &mut Variables,
    pipeline: &str,
) -> TaskResult {
    let common = LoopableFields::of(task);
    if common.run_async {
        let handle = spawn_body(ctx, task, scope.child(), pipeline.to_string()).await;
        return Ok(Some(handle));
    }

    match task.as_ref() {
        Task::TaskSet(t) => run_taskset(ctx, t, scope, pipeline).await,
        Task::Dispatch(t) => run_dispatch(ctx, t, scope).await,
        Task::Chip(t) => run_chip(ctx, t, scope).await,
        Task::Code(t) => run_code(t, scope).map(Some),
        _ => unreachable!("not a loopable task"),
    }
}

async fn run_taskset(
    ctx: &Arc<RunContext>,
    t: &TaskSetTask,
    scope: &mut Variables,
    pipeline: &str,
) -> TaskResult {
    let wrapped: Vec<Arc<Task>> = t.tasks.iter().cloned().map(Arc::new).collect();
    let mut flow = Flow::new(&wrapped);
    run_flow(ctx, &mut flow, scope, pipeline).await
}

async fn run_dispatch(ctx: &Arc<RunContext>, t: &DispatchTask, scope: &mut Variables) -> TaskResult {
    let target = ctx
        .resolver
        .resolve(&t.dispatch)
        .ok_or_else(|| ProcessorError::UnknownPipeline(t.dispatch.clone()))?;
    let mut inner_scope = scope.child();
    if let Some(params) = &t.params {
        let fixed = interpolate_params(params, scope)?;
        inner_scope.merge(&fixed);
    }
    let mut flow = Flow::new(&target.tasks);
    run_flow(ctx, &mut flow, &mut inner_scope, &target.name).await
}

async fn run_chip(ctx: &Arc<RunContext>, t: &ChipTask, scope: &mut Variables) -> TaskResult {
    let request = match &t.params {
        Some(params) => interpolate(params, scope).map_err(ProcessorError::from)?,
        None => json!({}),
    };

    if t.chip == WAIT_FOR_CHIP {
        return wait_for(ctx, &request).await.map(Some);
    }

    let chip = ctx
        .registry
        .lookup(&t.chip)
        .ok_or_else(|| ProcessorError::UnknownChip(t.chip.clone()))?;
    let meta = chip.metadata();

    if let Err(reason) = schema::validate(&request, &meta.request_schema) {
        return Err(ProcessorError::ChipInvalidInput {
            chip: t.chip.clone(),
            reason,
        }
        .into());
    }

    // Chip failures do not unwind: they surface as structured responses.
    let invocation = chip.run(request);
    let response = tokio::select! {
        _ = ctx.token.cancelled() => return Err(ProcessorError::Cancelled.into()),
        response = invocation => response,
    };

    let response = match response {
        Ok(response) => match schema::validate(&response, &meta.response_schema) {
            Ok(()) => response,
            Err(reason) => {
                tracing::warn!(chip = %t.chip, %reason, "chip response failed validation");
                json!({"status": "error", "error": reason})
            }
        },
        Err(err) => {
            tracing::warn!(chip = %t.chip, error = %err, "chip invocation failed");
            json!({"status": "error", "error": err.to_string()})
        }
    };
    Ok(Some(response))
}

fn run_code(t: &CodeTask, scope: &mut Variables) -> Result<Value, Unwind> {
    let mut scratch = scope.child();
    if let Some(params) = &t.params {
        let fixed = interpolate_params(params, scope)?;
        scratch.merge(&fixed);
    }
    eval::run_program(&t.code, &mut scratch).map_err(ProcessorError::from)?;
    Ok(scratch.get("result").cloned().unwrap_or(Value::Null))
}

/// Spawn the body of a `run_async` task and produce its opaque handle
/// value.
async fn spawn_body(
    ctx: &Arc<RunContext>,
    task: &Arc<Task>,
    scope: Variables,
    pipeline: String,
) -> Value {
    let id = Uuid::new_v4();
    let token = ctx.token.child_token();
    let spawn_ctx = Arc::new(RunContext {
        resolver: ctx.resolver.clone(),
        registry: ctx.registry.clone(),
        handles: Mutex::new(HashMap::new()),
        token: token.clone(),
    });
    let task = task.clone();

    let join = tokio::spawn(async move {
        let mut scope = scope;
        let result = match task.as_ref() {
            Task::TaskSet(t) => run_taskset(&spawn_ctx, t, &mut scope, &pipeline).await,
            Task::Dispatch(t) => run_dispatch(&spawn_ctx, t, &mut scope).await,
            Task::Chip(t) => run_chip(&spawn_ctx, t, &mut scope).await,
            Task::Code(t) => run_code(t, &mut scope).map(Some),
            _ => unreachable!("not a loopable task"),
        };
        spawn_ctx.abort_handles().await;
        result
    });

    ctx.handles
        .lock()
        .await
        .insert(id, AsyncHandle { join, token });
    tracing::debug!(handle = %id, "spawned async task");
    json!({ HANDLE_KEY: id.to_string() })
}

fn handle_id(value: &Value) -> Option<Uuid> {
    let raw = match value {
        Value::Object(map) => map.get(HANDLE_KEY)?.as_str()?,
        Value::String(raw) => raw.as_str(),
        _ => return None,
    };
    Uuid::parse_str(raw).ok()
}

/// The well-known `wait_for` chip: await an async handle, with an
/// optional deadline in seconds.
async fn wait_for(ctx: &Arc<RunContext>, request: &Value) -> Result<Value, Unwind> {
    let handle_value = request
        .get("handle")
        .ok_or(ProcessorError::NotAHandle)?;
    let id = handle_id(handle_value).ok_or(ProcessorError::NotAHandle)?;
    let deadline = request
        .get("timeout")
        .and_then(Value::as_f64)
        .map(Duration::from_secs_f64);

    let mut handle = ctx
        .handles
        .lock()
        .await
        .remove(&id)
        .ok_or(ProcessorError::UnknownHandle)?;

    let waited = tokio::select! {
        _ = ctx.token.cancelled() => None,
        joined = wait_with_deadline(&mut handle.join, deadline) => Some(joined),
    };
    let Some(joined) = waited else {
        handle.token.cancel();
        handle.join.abort();
        return Err(ProcessorError::Cancelled.into());
    };

    match joined {
        None => {
            // Deadline passed: the task keeps running, the handle stays
            // valid for a later wait.
            ctx.handles.lock().await.insert(id, handle);
            Ok(json!({"status": "timeout"}))
        }
        Some(Ok(result)) => match result {
            Ok(Some(value)) => Ok(value),
            Ok(None) => Ok(Value::Null),
            Err(unwind) => Err(unwind),
        },
        Some(Err(join_err)) => {
            if join_err.is_cancelled() {
                Err(ProcessorError::Cancelled.into())
            } else {
                Err(ProcessorError::JoinFailed(join_err.to_string()).into())
            }
        }
    }
}

async fn wait_with_deadline(
    join: &mut JoinHandle<TaskResult>,
    deadline: Option<Duration>,
) -> Option<Result<TaskResult, tokio::task::JoinError>> {
    match deadline {
        Some(duration) => tokio::time::timeout(duration, join).await.ok(),
        None => Some(join.await),
    }
}

/// Apply the result-binding rules to a produced value. Writes go to the
/// parent scope and mirror into the loop scope so later iterations
/// observe accumulated state.
fn apply_bindings(
    common: &LoopableFields<'_>,
    value: TaskValue,
    vars: &mut Variables,
    mut loop_scope: Option<&mut Variables>,
) -> Result<TaskOutcome, Unwind> {
    let Some(value) = value else {
        return Ok(TaskOutcome::Value(None));
    };

    if let Some(name) = common.store_result_as {
        vars.set(name, value.clone()).map_err(ProcessorError::from)?;
        if let Some(scope) = loop_scope.as_deref_mut() {
            scope.set(name, value.clone()).map_err(ProcessorError::from)?;
        }
    }

    if let Some(name) = common.append_result_into {
        vars.append(name, value.clone()).map_err(ProcessorError::from)?;
        if let Some(scope) = loop_scope.as_deref_mut() {
            scope
                .append(name, value.clone())
                .map_err(ProcessorError::from)?;
        }
    }

    if let Some(key_into) = common.key_result_into {
        let path = format!("{}.{}", key_into.path, key_into.key);
        vars.set(&path, value.clone()).map_err(ProcessorError::from)?;
        if let Some(scope) = loop_scope.as_deref_mut() {
            scope.set(&path, value.clone()).map_err(ProcessorError::from)?;
        }
    }

    if common.return_result {
        return Ok(TaskOutcome::Return(value));
    }
    Ok(TaskOutcome::Value(Some(value)))
}

fn interpolate_params(params: &Value, scope: &Variables) -> Result<Map<String, Value>, Unwind> {
    let fixed = interpolate(params, scope).map_err(ProcessorError::from)?;
    match fixed {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Map::new()),
        other => Err(ProcessorError::ParamsNotAMapping {
            got: eval::type_name(&other),
        }
        .into()),
    }
}

fn task_when(task: &Task) -> Option<&str> {
    match task {
        Task::TaskSet(t) => t.when.as_deref(),
        Task::Dispatch(t) => t.when.as_deref(),
        Task::Branch(t) => t.when.as_deref(),
        Task::Chip(t) => t.when.as_deref(),
        Task::Code(t) => t.when.as_deref(),
        Task::Assert(t) => t.when.as_deref(),
        Task::Return(t) => t.when.as_deref(),
        Task::Declare(t) => t.when.as_deref(),
        Task::Comment(_) => None,
        Task::Terminate(t) => t.when.as_deref(),
    }
}

fn task_log(task: &Task) -> Option<TaskLogLevel> {
    match task {
        Task::TaskSet(t) => t.log,
        Task::Dispatch(t) => t.log,
        Task::Branch(t) => t.log,
        Task::Chip(t) => t.log,
        Task::Code(t) => t.log,
        Task::Assert(t) => t.log,
        Task::Declare(t) => t.log,
        _ => None,
    }
}

fn log_task(task: &Task, pipeline: &str) {
    let label = task.name().unwrap_or("unnamed");
    match task_log(task) {
        Some(TaskLogLevel::Info) => {
            tracing::info!(pipeline = %pipeline, task = %label, kind = %task.kind(), "running task")
        }
        Some(TaskLogLevel::Debug) => {
            tracing::debug!(pipeline = %pipeline, task = %label, kind = %task.kind(), "running task")
        }
        Some(TaskLogLevel::Trace) => {
            tracing::trace!(pipeline = %pipeline, task = %label, kind = %task.kind(), "running task")
        }
        None => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ChipMeta, FnChip};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pipeline(name: &str, yaml: &str) -> Arc<Pipeline> {
        Arc::new(Pipeline::new(name, serde_yaml::from_str(yaml).unwrap()))
    }

    fn no_pipelines() -> Arc<dyn PipelineResolver> {
        Arc::new(|_: &str| -> Option<Arc<Pipeline>> { None })
    }

    fn registry_with(chips: Vec<Arc<dyn crate::registry::Chip>>) -> Arc<Registry> {
        let mut registry = Registry::new();
        for chip in chips {
            registry.register(chip).unwrap();
        }
        Arc::new(registry)
    }

    fn upper_chip() -> Arc<dyn crate::registry::Chip> {
        Arc::new(FnChip::new(
            "strings.upper",
            ChipMeta::new(
                json!({"type": "object", "properties": {"s": {"type": "string"}}, "required": ["s"]}),
                Value::Null,
            ),
            |request| async move {
                let s = request.get("s").and_then(Value::as_str).unwrap_or("");
                Ok(json!({"result": s.to_uppercase()}))
            },
        ))
    }

    fn run(
        pipeline: &Arc<Pipeline>,
        registry: Arc<Registry>,
        resolver: Arc<dyn PipelineResolver>,
        variables: Value,
    ) -> Result<Value, ProcessorError> {
        let processor = Processor::new(resolver, registry);
        tokio_test::block_on(processor.run(pipeline, Variables::from_value(variables)))
    }

    #[test]
    fn test_declare_and_return_interpolation() {
        let p = pipeline(
            "t",
            r#"
- declare:
    a: "Hi, {{name}}"
- return: "{{a}}!"
"#,
        );
        let result = run(&p, registry_with(vec![]), no_pipelines(), json!({"name": "Elvis"}));
        assert_eq!(result.unwrap(), json!("Hi, Elvis!"));
    }

    #[test]
    fn test_when_false_skips_chip() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = calls.clone();
        let fail = Arc::new(FnChip::new("asserts.fail", ChipMeta::open(), move |_| {
            let seen = seen.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                Ok(json!({"status": "error"}))
            }
        }));
        let p = pipeline(
            "t",
            r#"
- declare: {x: 5}
- chip: asserts.fail
  when: "x > 10"
- return: ok
"#,
        );
        let result = run(&p, registry_with(vec![fail]), no_pipelines(), json!({}));
        assert_eq!(result.unwrap(), json!("ok"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_loop_append_result_into() {
        let p = pipeline(
            "t",
            r#"
- chip: strings.upper
  loop: "[\"a\",\"b\"]"
  append_result_into: out
  params:
    s: "{{item}}"
- return: "{{out}}"
"#,
        );
        let result = run(&p, registry_with(vec![upper_chip()]), no_pipelines(), json!({}));
        assert_eq!(
            result.unwrap(),
            json!([{"result": "A"}, {"result": "B"}])
        );
    }

    #[test]
    fn test_loop_store_result_keeps_last_value() {
        let echo = Arc::new(FnChip::new("utils.echo", ChipMeta::open(), |request| async move {
            Ok(request)
        }));
        let p = pipeline(
            "t",
            r#"
- chip: utils.echo
  loop: "[1, 2, 3]"
  params: {value: "{{ item }}"}
  store_result_as: last_echo
- return: "{{ last_echo.value }}"
"#,
        );
        let result = run(&p, registry_with(vec![echo]), no_pipelines(), json!({}));
        assert_eq!(result.unwrap(), json!(3));
    }

    #[test]
    fn test_loop_over_sequence_with_return_result() {
        let p = pipeline(
            "t",
            r#"
- tasks:
    - return:
        item: "{{ item }}"
        first: "{{ loop.first }}"
        last: "{{ loop.last }}"
        revindex: "{{ loop.revindex }}"
  loop: "['a', 'b', 'c']"
  append_result_into: out
- return: "{{ out }}"
"#,
        );
        let result = run(&p, registry_with(vec![]), no_pipelines(), json!({})).unwrap();
        assert_eq!(
            result,
            json!([
                {"item": "a", "first": true, "last": false, "revindex": 3},
                {"item": "b", "first": false, "last": false, "revindex": 2},
                {"item": "c", "first": false, "last": true, "revindex": 1},
            ])
        );
    }

    #[test]
    fn test_loop_over_mapping_iterates_key_order() {
        let p = pipeline(
            "t",
            r#"
- tasks:
    - return: "{{ item.key }}={{ item.value }}"
  loop: "{{ config }}"
  append_result_into: out
- return: "{{ out }}"
"#,
        );
        let result = run(
            &p,
            registry_with(vec![]),
            no_pipelines(),
            json!({"config": {"b": 2, "a": 1}}),
        )
        .unwrap();
        assert_eq!(result, json!(["a=1", "b=2"]));
    }

    #[test]
    fn test_taskset_return_exits_only_taskset() {
        let p = pipeline(
            "t",
            r#"
- tasks:
    - return: inner
  store_result_as: from_inner
- return: "outer {{ from_inner }}"
"#,
        );
        let result = run(&p, registry_with(vec![]), no_pipelines(), json!({}));
        assert_eq!(result.unwrap(), json!("outer inner"));
    }

    #[test]
    fn test_dispatch_runs_named_pipeline() {
        let sub = pipeline("lib.shout", "- return: \"{{ word }}!\"\n");
        let resolver: Arc<dyn PipelineResolver> = Arc::new(move |name: &str| {
            (name == "lib.shout").then(|| sub.clone())
        });
        let p = pipeline(
            "t",
            r#"
- dispatch: lib.shout
  params: {word: hey}
  store_result_as: shouted
- return: "{{ shouted }}"
"#,
        );
        let result = run(&p, registry_with(vec![]), resolver, json!({}));
        assert_eq!(result.unwrap(), json!("hey!"));
    }

    #[test]
    fn test_dispatch_unknown_pipeline_fails_with_context() {
        let p = pipeline("t", "- dispatch: nowhere\n  name: hop\n");
        let err = run(&p, registry_with(vec![]), no_pipelines(), json!({})).unwrap_err();
        let message = format!("{err}");
        assert!(message.contains("hop"));
        let mut cause: &dyn std::error::Error = &err;
        while let Some(source) = cause.source() {
            cause = source;
        }
        assert!(cause.to_string().contains("nowhere"));
    }

    #[test]
    fn test_branch_clears_current_flow() {
        let target = pipeline("other", "- return: from-branch\n");
        let resolver: Arc<dyn PipelineResolver> =
            Arc::new(move |name: &str| (name == "other").then(|| target.clone()));
        let p = pipeline(
            "t",
            r#"
- branch: other
- return: never-reached
"#,
        );
        let result = run(&p, registry_with(vec![]), resolver, json!({}));
        assert_eq!(result.unwrap(), json!("from-branch"));
    }

    #[test]
    fn test_terminate_aborts_whole_run() {
        let sub = pipeline("sub", "- terminate: \"stopped in {{ where }}\"\n");
        let resolver: Arc<dyn PipelineResolver> =
            Arc::new(move |name: &str| (name == "sub").then(|| sub.clone()));
        let p = pipeline(
            "t",
            r#"
- declare: {where: subflow}
- dispatch: sub
- return: never
"#,
        );
        let result = run(&p, registry_with(vec![]), resolver, json!({}));
        assert_eq!(result.unwrap(), json!("stopped in subflow"));
    }

    #[test]
    fn test_assert_failure_unwinds() {
        let p = pipeline("t", "- assert:\n    - \"1 == 1\"\n    - \"2 < 1\"\n");
        let err = run(&p, registry_with(vec![]), no_pipelines(), json!({})).unwrap_err();
        let mut cause: &dyn std::error::Error = &err;
        while let Some(source) = cause.source() {
            cause = source;
        }
        assert!(cause.to_string().contains("2 < 1"));
    }

    #[test]
    fn test_chip_error_surfaces_as_structured_response() {
        let bad = Arc::new(FnChip::new("flaky", ChipMeta::open(), |_| async move {
            Err(crate::registry::ChipError::new("boom"))
        }));
        let p = pipeline(
            "t",
            r#"
- chip: flaky
  store_result_as: r
- return: "{{ r }}"
"#,
        );
        let result = run(&p, registry_with(vec![bad]), no_pipelines(), json!({})).unwrap();
        assert_eq!(result["status"], json!("error"));
        assert!(result["error"].as_str().unwrap().contains("boom"));
    }

    #[test]
    fn test_chip_invalid_input_unwinds() {
        let p = pipeline("t", "- chip: strings.upper\n  params: {s: 42}\n");
        let err = run(&p, registry_with(vec![upper_chip()]), no_pipelines(), json!({}))
            .unwrap_err();
        let mut cause: &dyn std::error::Error = &err;
        while let Some(source) = cause.source() {
            cause = source;
        }
        assert!(cause.to_string().contains("strings.upper"));
    }

    #[test]
    fn test_code_task_result_binding() {
        let p = pipeline(
            "t",
            r#"
- code: |
    doubled = n * 2
    result = doubled + 1
  params: {n: "{{ base }}"}
  store_result_as: computed
- return: "{{ computed }}"
"#,
        );
        let result = run(&p, registry_with(vec![]), no_pipelines(), json!({"base": 20}));
        assert_eq!(result.unwrap(), json!(41));
    }

    #[test]
    fn test_key_result_into() {
        let p = pipeline(
            "t",
            r#"
- chip: strings.upper
  params: {s: hi}
  key_result_into: {path: outputs, key: shout}
- return: "{{ outputs.shout.result }}"
"#,
        );
        let result = run(&p, registry_with(vec![upper_chip()]), no_pipelines(), json!({}));
        assert_eq!(result.unwrap(), json!("HI"));
    }

    #[test]
    fn test_run_async_wait_for_roundtrip() {
        let p = pipeline(
            "t",
            r#"
- chip: strings.upper
  params: {s: deferred}
  run_async: true
  store_result_as: pending
- chip: wait_for
  params: {handle: "{{ pending }}"}
  store_result_as: done
- return: "{{ done.result }}"
"#,
        );
        let result = run(&p, registry_with(vec![upper_chip()]), no_pipelines(), json!({}));
        assert_eq!(result.unwrap(), json!("DEFERRED"));
    }

    #[test]
    fn test_wait_for_deadline_times_out() {
        let slow = Arc::new(FnChip::new("slow", ChipMeta::open(), |_| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({"status": "ok"}))
        }));
        let p = pipeline(
            "t",
            r#"
- chip: slow
  run_async: true
  store_result_as: pending
- chip: wait_for
  params: {handle: "{{ pending }}", timeout: 0.05}
  store_result_as: outcome
- return: "{{ outcome.status }}"
"#,
        );
        let result = run(&p, registry_with(vec![slow]), no_pipelines(), json!({}));
        assert_eq!(result.unwrap(), json!("timeout"));
    }

    #[test]
    fn test_cancellation_interrupts_run() {
        let slow = Arc::new(FnChip::new("slow", ChipMeta::open(), |_| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(json!({}))
        }));
        let p = pipeline("t", "- chip: slow\n");
        let token = CancellationToken::new();
        let processor =
            Processor::with_cancellation(no_pipelines(), registry_with(vec![slow]), token.clone());

        let err = tokio_test::block_on(async move {
            let run = processor.run(&p, Variables::new());
            tokio::pin!(run);
            let first = tokio::select! {
                result = &mut run => Some(result),
                _ = tokio::time::sleep(Duration::from_millis(20)) => None,
            };
            match first {
                Some(result) => result,
                None => {
                    token.cancel();
                    run.await
                }
            }
        })
        .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[test]
    fn test_append_into_scalar_fails() {
        let p = pipeline(
            "t",
            r#"
- declare: {out: scalar}
- chip: strings.upper
  params: {s: x}
  append_result_into: out
"#,
        );
        let err = run(&p, registry_with(vec![upper_chip()]), no_pipelines(), json!({}))
            .unwrap_err();
        let mut cause: &dyn std::error::Error = &err;
        while let Some(source) = cause.source() {
            cause = source;
        }
        assert!(cause.to_string().contains("not a sequence"));
    }
}
