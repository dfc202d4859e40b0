//! Subcommand implementations.

pub mod broker;
pub mod run;
pub mod run_local;
pub mod worker;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use reasonchip_chips::register_builtins;
use reasonchip_config::ReasonChipConfig;
use reasonchip_core::{Engine, Registry};

use crate::cli::parse_collection;
use crate::exit::Exit;

/// Load the config file when given, defaults otherwise.
pub(crate) fn load_config(path: &Option<PathBuf>) -> Result<ReasonChipConfig, Exit> {
    match path {
        Some(path) => reasonchip_config::load_config(path).map_err(|err| {
            eprintln!("configuration error: {err}");
            Exit::ConfigError
        }),
        None => Ok(ReasonChipConfig::default()),
    }
}

/// Merge config collections with `--collection` flags (flags win on a
/// name clash) and load a validated engine over the builtin chipsets.
pub(crate) fn build_engine(
    config: &ReasonChipConfig,
    collection_flags: &[String],
) -> Result<Arc<Engine>, Exit> {
    let mut roots: HashMap<String, PathBuf> = config.worker.collections.clone();
    for raw in collection_flags {
        let (name, path) = parse_collection(raw).map_err(|message| {
            eprintln!("{message}");
            Exit::InvalidArgs
        })?;
        roots.insert(name, path);
    }

    let mut registry = Registry::new();
    register_builtins(&mut registry).map_err(|err| {
        eprintln!("chip registration failed: {err}");
        Exit::ConfigError
    })?;

    Engine::load(&roots, Arc::new(registry)).map(Arc::new).map_err(|err| {
        eprintln!("failed to load pipelines: {err}");
        Exit::ConfigError
    })
}
