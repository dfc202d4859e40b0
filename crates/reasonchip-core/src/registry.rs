//! Chip abstraction and registry.
//!
//! A chip is an async function invocable from pipelines with a declared
//! request and response schema. Chips are black boxes to the processor:
//! they accept exactly one structured argument and return exactly one
//! structured value, capturing their own runtime failures in the
//! response.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

/// A chip handler failed in a way it could not capture itself.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct ChipError(pub String);

impl ChipError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Declared request/response schemas for a chip.
#[derive(Debug, Clone)]
pub struct ChipMeta {
    pub request_schema: Value,
    pub response_schema: Value,
}

impl ChipMeta {
    pub fn new(request_schema: Value, response_schema: Value) -> Self {
        Self {
            request_schema,
            response_schema,
        }
    }

    /// Schemaless: any request, any response.
    pub fn open() -> Self {
        Self::new(Value::Null, Value::Null)
    }
}

#[async_trait]
pub trait Chip: Send + Sync {
    /// Dotted chip name (must be unique within a registry).
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn metadata(&self) -> ChipMeta;

    async fn run(&self, request: Value) -> Result<Value, ChipError>;
}

/// A namespaced group of chips, registered together during discovery.
pub trait Chipset: Send + Sync {
    fn namespace(&self) -> &str;
    fn chips(&self) -> Vec<Arc<dyn Chip>>;
}

type ChipHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, ChipError>> + Send + Sync>;

/// Adapts an async closure plus schemas into a [`Chip`].
pub struct FnChip {
    name: String,
    description: String,
    meta: ChipMeta,
    handler: ChipHandler,
}

impl FnChip {
    pub fn new<F, Fut>(name: impl Into<String>, meta: ChipMeta, handler: F) -> Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Value, ChipError>> + Send + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            meta,
            handler: Arc::new(move |request| Box::pin(handler(request))),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[async_trait]
impl Chip for FnChip {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn metadata(&self) -> ChipMeta {
        self.meta.clone()
    }

    async fn run(&self, request: Value) -> Result<Value, ChipError> {
        (self.handler)(request).await
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("chip '{0}' is already registered")]
    Duplicate(String),
}

/// Name → chip mapping with module-prefix lookup fallback.
///
/// Immutable after startup: discovery and registration happen once,
/// before the first run.
#[derive(Default)]
pub struct Registry {
    chips: HashMap<String, Arc<dyn Chip>>,
    search_path: Vec<String>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a module prefix tried by bare-name lookups, most recently
    /// added first.
    pub fn add_search_path(&mut self, prefix: impl Into<String>) {
        let prefix = prefix.into();
        if !self.search_path.contains(&prefix) {
            self.search_path.push(prefix);
        }
    }

    pub fn register(&mut self, chip: Arc<dyn Chip>) -> Result<(), RegistryError> {
        let name = chip.name().to_string();
        if self.chips.contains_key(&name) {
            return Err(RegistryError::Duplicate(name));
        }
        tracing::debug!(chip = %name, "registered chip");
        self.chips.insert(name, chip);
        Ok(())
    }

    /// Register every chip of every chipset, adding each namespace to the
    /// search path.
    pub fn discover(&mut self, chipsets: &[&dyn Chipset]) -> Result<(), RegistryError> {
        for chipset in chipsets {
            self.add_search_path(chipset.namespace());
            for chip in chipset.chips() {
                self.register(chip)?;
            }
        }
        Ok(())
    }

    /// Exact name first, then each search-path prefix, most recent first.
    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Chip>> {
        if let Some(chip) = self.chips.get(name) {
            return Some(chip.clone());
        }
        for prefix in self.search_path.iter().rev() {
            if let Some(chip) = self.chips.get(&format!("{prefix}.{name}")) {
                return Some(chip.clone());
            }
        }
        None
    }

    pub fn names(&self) -> Vec<&str> {
        self.chips.keys().map(String::as_str).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Chip>)> {
        self.chips.iter().map(|(name, chip)| (name.as_str(), chip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn echo_chip(name: &str) -> Arc<dyn Chip> {
        Arc::new(FnChip::new(name, ChipMeta::open(), |request| async move {
            Ok(request)
        }))
    }

    #[test]
    fn test_register_and_lookup() {
        let mut registry = Registry::new();
        registry.register(echo_chip("utils.echo")).unwrap();
        assert!(registry.lookup("utils.echo").is_some());
        assert!(registry.lookup("echo").is_none());
    }

    #[test]
    fn test_search_path_fallback() {
        let mut registry = Registry::new();
        registry.register(echo_chip("utils.echo")).unwrap();
        registry.add_search_path("utils");
        assert!(registry.lookup("echo").is_some());
    }

    #[test]
    fn test_collision_is_fatal() {
        let mut registry = Registry::new();
        registry.register(echo_chip("dup")).unwrap();
        let err = registry.register(echo_chip("dup")).unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(_)));
    }

    #[test]
    fn test_fnchip_runs() {
        let chip = echo_chip("e");
        let out = tokio_test::block_on(chip.run(json!({"v": 1}))).unwrap();
        assert_eq!(out, json!({"v": 1}));
    }
}
