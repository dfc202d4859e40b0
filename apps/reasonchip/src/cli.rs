//! Command-line definitions.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use uuid::Uuid;

#[derive(Debug, Parser)]
#[command(name = "reasonchip", version, about = "Distributed YAML pipeline engine")]
pub struct Cli {
    /// Set a log level, optionally scoped to one logger:
    /// `debug` or `reasonchip_net=trace`. Repeatable.
    #[arg(long = "log-level", value_name = "[LOGGER=]LEVEL", global = true)]
    pub log_level: Vec<String>,

    /// Configuration file.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run a broker routing clients to workers.
    Broker(BrokerArgs),
    /// Run a worker serving pipeline runs to a broker.
    Worker(WorkerArgs),
    /// Run a pipeline remotely through a broker.
    Run(RunArgs),
    /// Run a pipeline in-process, without a broker.
    RunLocal(RunLocalArgs),
}

#[derive(Debug, Args)]
pub struct BrokerArgs {
    /// URI clients connect to (overrides the config file).
    #[arg(long, value_name = "URI")]
    pub client_listen: Option<String>,

    /// URI workers connect to (overrides the config file).
    #[arg(long, value_name = "URI")]
    pub worker_listen: Option<String>,
}

#[derive(Debug, Args)]
pub struct WorkerArgs {
    /// Broker URI to serve (overrides the config file).
    #[arg(long, value_name = "URI")]
    pub broker: Option<String>,

    /// Root of a pipeline collection, as name=path. Repeatable.
    #[arg(long = "collection", value_name = "NAME=PATH")]
    pub collections: Vec<String>,

    /// Concurrent run capacity (overrides the config file).
    #[arg(long, value_name = "N")]
    pub workers: Option<usize>,

    /// Reconnect to the broker after transport loss.
    #[arg(long)]
    pub reconnect: bool,
}

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Name of the pipeline to run.
    #[arg(value_name = "PIPELINE")]
    pub pipeline: String,

    /// Broker client URI (overrides the config file).
    #[arg(long, value_name = "URI")]
    pub broker: Option<String>,

    /// JSON variable file; later files deep-merge over earlier ones.
    /// Repeatable.
    #[arg(long = "variables", value_name = "FILE")]
    pub variables: Vec<PathBuf>,

    /// Set one variable as key=value (dotted keys allowed). Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,

    /// Cookie labeling this run.
    #[arg(long, value_name = "UUID")]
    pub cookie: Option<Uuid>,
}

#[derive(Debug, Args)]
pub struct RunLocalArgs {
    /// Name of the pipeline to run.
    #[arg(value_name = "PIPELINE")]
    pub pipeline: String,

    /// Root of a pipeline collection, as name=path. Repeatable.
    #[arg(long = "collection", value_name = "NAME=PATH")]
    pub collections: Vec<String>,

    /// JSON variable file; later files deep-merge over earlier ones.
    /// Repeatable.
    #[arg(long = "variables", value_name = "FILE")]
    pub variables: Vec<PathBuf>,

    /// Set one variable as key=value (dotted keys allowed). Repeatable.
    #[arg(long = "set", value_name = "KEY=VALUE")]
    pub set: Vec<String>,
}

/// Split one `name=path` collection argument.
pub fn parse_collection(raw: &str) -> Result<(String, PathBuf), String> {
    match raw.split_once('=') {
        Some((name, path)) if !path.is_empty() => Ok((name.to_string(), PathBuf::from(path))),
        _ => Err(format!("invalid collection '{raw}', expected name=path")),
    }
}
