//! The pipeline task model.
//!
//! A task node is a tagged variant discriminated by which kind key is
//! present in the source mapping: `tasks`, `dispatch`, `branch`, `chip`,
//! `code`, `assert`, `return`, `declare`, `comment`, `terminate`.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

/// Keys that select a task kind. `comment` doubles as a common attribute:
/// a node is a CommentTask only when no other kind key is present.
const KIND_KEYS: &[&str] = &[
    "tasks",
    "dispatch",
    "branch",
    "chip",
    "code",
    "assert",
    "return",
    "declare",
    "comment",
    "terminate",
];

/// Level at which the processor logs a task when `log` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskLogLevel {
    Info,
    Debug,
    Trace,
}

/// Target of `key_result_into`: store the value under `key` within the
/// mapping at `path`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeyResultInto {
    pub path: String,
    pub key: String,
}

/// `assert` accepts one expression or a sequence of expressions.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum AssertChecks {
    One(String),
    Many(Vec<String>),
}

impl AssertChecks {
    pub fn expressions(&self) -> Vec<&str> {
        match self {
            AssertChecks::One(expr) => vec![expr.as_str()],
            AssertChecks::Many(exprs) => exprs.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TaskSetTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    #[serde(rename = "loop")]
    pub loop_over: Option<Value>,
    #[serde(default)]
    pub run_async: bool,
    pub variables: Option<Map<String, Value>>,
    pub store_result_as: Option<String>,
    pub append_result_into: Option<String>,
    pub key_result_into: Option<KeyResultInto>,
    #[serde(default)]
    pub return_result: bool,
    pub tasks: Vec<Task>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DispatchTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    #[serde(rename = "loop")]
    pub loop_over: Option<Value>,
    #[serde(default)]
    pub run_async: bool,
    pub variables: Option<Map<String, Value>>,
    pub params: Option<Value>,
    pub store_result_as: Option<String>,
    pub append_result_into: Option<String>,
    pub key_result_into: Option<KeyResultInto>,
    #[serde(default)]
    pub return_result: bool,
    pub dispatch: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BranchTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    pub variables: Option<Map<String, Value>>,
    pub params: Option<Value>,
    pub branch: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChipTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    #[serde(rename = "loop")]
    pub loop_over: Option<Value>,
    #[serde(default)]
    pub run_async: bool,
    pub variables: Option<Map<String, Value>>,
    pub params: Option<Value>,
    pub store_result_as: Option<String>,
    pub append_result_into: Option<String>,
    pub key_result_into: Option<KeyResultInto>,
    #[serde(default)]
    pub return_result: bool,
    pub chip: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CodeTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    #[serde(rename = "loop")]
    pub loop_over: Option<Value>,
    #[serde(default)]
    pub run_async: bool,
    pub variables: Option<Map<String, Value>>,
    pub params: Option<Value>,
    pub store_result_as: Option<String>,
    pub append_result_into: Option<String>,
    pub key_result_into: Option<KeyResultInto>,
    #[serde(default)]
    pub return_result: bool,
    pub code: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssertTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    #[serde(rename = "assert")]
    pub checks: AssertChecks,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReturnTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    #[serde(rename = "return")]
    pub value: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeclareTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub log: Option<TaskLogLevel>,
    pub declare: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CommentTask {
    pub name: Option<String>,
    pub comment: Value,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerminateTask {
    pub name: Option<String>,
    pub comment: Option<String>,
    pub when: Option<String>,
    pub terminate: Value,
}

#[derive(Debug, Clone)]
pub enum Task {
    TaskSet(TaskSetTask),
    Dispatch(DispatchTask),
    Branch(BranchTask),
    Chip(ChipTask),
    Code(CodeTask),
    Assert(AssertTask),
    Return(ReturnTask),
    Declare(DeclareTask),
    Comment(CommentTask),
    Terminate(TerminateTask),
}

impl Task {
    pub fn name(&self) -> Option<&str> {
        match self {
            Task::TaskSet(t) => t.name.as_deref(),
            Task::Dispatch(t) => t.name.as_deref(),
            Task::Branch(t) => t.name.as_deref(),
            Task::Chip(t) => t.name.as_deref(),
            Task::Code(t) => t.name.as_deref(),
            Task::Assert(t) => t.name.as_deref(),
            Task::Return(t) => t.name.as_deref(),
            Task::Declare(t) => t.name.as_deref(),
            Task::Comment(t) => t.name.as_deref(),
            Task::Terminate(t) => t.name.as_deref(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::TaskSet(_) => "tasks",
            Task::Dispatch(_) => "dispatch",
            Task::Branch(_) => "branch",
            Task::Chip(_) => "chip",
            Task::Code(_) => "code",
            Task::Assert(_) => "assert",
            Task::Return(_) => "return",
            Task::Declare(_) => "declare",
            Task::Comment(_) => "comment",
            Task::Terminate(_) => "terminate",
        }
    }

    /// Label for error reporting: the task name, or its index when unnamed.
    pub fn label(&self, index: usize) -> String {
        match self.name() {
            Some(name) => name.to_string(),
            None => format!("#{index}"),
        }
    }

    /// Static validation beyond what serde enforces.
    pub fn check(&self) -> Result<(), String> {
        let (run_async, has_sink) = match self {
            Task::TaskSet(t) => (run_async_sink(t.run_async, &t.store_result_as, &t.append_result_into, &t.key_result_into, t.return_result)),
            Task::Dispatch(t) => (run_async_sink(t.run_async, &t.store_result_as, &t.append_result_into, &t.key_result_into, t.return_result)),
            Task::Chip(t) => (run_async_sink(t.run_async, &t.store_result_as, &t.append_result_into, &t.key_result_into, t.return_result)),
            Task::Code(t) => (run_async_sink(t.run_async, &t.store_result_as, &t.append_result_into, &t.key_result_into, t.return_result)),
            _ => (false, true),
        };
        if run_async && !has_sink {
            return Err(
                "run_async requires store_result_as, append_result_into, key_result_into \
                 or return_result"
                    .to_string(),
            );
        }
        if let Task::TaskSet(t) = self {
            for (i, task) in t.tasks.iter().enumerate() {
                task.check()
                    .map_err(|reason| format!("nested task {}: {reason}", task.label(i)))?;
            }
        }
        Ok(())
    }
}

fn run_async_sink(
    run_async: bool,
    store: &Option<String>,
    append: &Option<String>,
    key: &Option<KeyResultInto>,
    return_result: bool,
) -> (bool, bool) {
    (
        run_async,
        store.is_some() || append.is_some() || key.is_some() || return_result,
    )
}

impl<'de> Deserialize<'de> for Task {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        use serde::de::Error;

        let value = Value::deserialize(deserializer)?;
        let map = value
            .as_object()
            .ok_or_else(|| D::Error::custom("task node must be a mapping"))?;

        let mut kinds: Vec<&str> = KIND_KEYS
            .iter()
            .copied()
            .filter(|key| map.contains_key(*key))
            .collect();
        // `comment` only selects the kind when nothing else does.
        if kinds.len() > 1 {
            kinds.retain(|key| *key != "comment");
        }

        let kind = match kinds.as_slice() {
            [kind] => *kind,
            [] => {
                return Err(D::Error::custom(
                    "task node has no kind key (tasks, dispatch, branch, chip, code, assert, \
                     return, declare, comment, terminate)",
                ))
            }
            several => {
                return Err(D::Error::custom(format!(
                    "task node mixes kind keys: {}",
                    several.join(", ")
                )))
            }
        };

        let parsed = match kind {
            "tasks" => serde_json::from_value(value).map(Task::TaskSet),
            "dispatch" => serde_json::from_value(value).map(Task::Dispatch),
            "branch" => serde_json::from_value(value).map(Task::Branch),
            "chip" => serde_json::from_value(value).map(Task::Chip),
            "code" => serde_json::from_value(value).map(Task::Code),
            "assert" => serde_json::from_value(value).map(Task::Assert),
            "return" => serde_json::from_value(value).map(Task::Return),
            "declare" => serde_json::from_value(value).map(Task::Declare),
            "comment" => serde_json::from_value(value).map(Task::Comment),
            "terminate" => serde_json::from_value(value).map(Task::Terminate),
            _ => unreachable!(),
        };
        parsed.map_err(|err| D::Error::custom(format!("invalid {kind} task: {err}")))
    }
}

/// A named, immutable, ordered task list.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub name: String,
    pub tasks: Vec<Arc<Task>>,
}

impl Pipeline {
    pub fn new(name: impl Into<String>, tasks: Vec<Task>) -> Self {
        Self {
            name: name.into(),
            tasks: tasks.into_iter().map(Arc::new).collect(),
        }
    }
}

/// Dotted name → pipeline.
pub type PipelineCollection = HashMap<String, Arc<Pipeline>>;

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_tasks(yaml: &str) -> Result<Vec<Task>, serde_yaml::Error> {
        serde_yaml::from_str(yaml)
    }

    #[test]
    fn test_parse_each_kind() {
        let tasks = parse_tasks(
            r#"
- declare:
    greeting: hello
- chip: strings.upper
  params:
    s: "{{ greeting }}"
  store_result_as: shouted
- dispatch: other.pipeline
  when: "shouted"
- tasks:
    - comment: inner
- assert: "1 == 1"
- branch: somewhere.else
- code: |
    result = 1
- return: "{{ shouted }}"
- terminate: done
"#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 9);
        assert_eq!(tasks[0].kind(), "declare");
        assert_eq!(tasks[1].kind(), "chip");
        assert_eq!(tasks[8].kind(), "terminate");
    }

    #[test]
    fn test_comment_is_common_attribute_elsewhere() {
        let tasks = parse_tasks(
            r#"
- chip: utils.echo
  comment: a note on the chip call
  params: {value: 1}
"#,
        )
        .unwrap();
        assert_eq!(tasks[0].kind(), "chip");
    }

    #[test]
    fn test_zero_kind_keys_rejected() {
        let err = parse_tasks("- name: lonely\n").unwrap_err();
        assert!(err.to_string().contains("no kind key"));
    }

    #[test]
    fn test_multiple_kind_keys_rejected() {
        let err = parse_tasks("- chip: a\n  dispatch: b\n").unwrap_err();
        assert!(err.to_string().contains("mixes kind keys"));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse_tasks("- chip: a\n  bogus_field: 1\n").unwrap_err();
        assert!(err.to_string().contains("invalid chip task"));
    }

    #[test]
    fn test_run_async_requires_sink() {
        let tasks = parse_tasks("- chip: a\n  run_async: true\n").unwrap();
        assert!(tasks[0].check().is_err());

        let tasks = parse_tasks("- chip: a\n  run_async: true\n  store_result_as: h\n").unwrap();
        assert!(tasks[0].check().is_ok());
    }

    #[test]
    fn test_nested_taskset_checked() {
        let tasks = parse_tasks(
            r#"
- tasks:
    - chip: a
      run_async: true
"#,
        )
        .unwrap();
        let err = tasks[0].check().unwrap_err();
        assert!(err.contains("nested task"));
    }
}
