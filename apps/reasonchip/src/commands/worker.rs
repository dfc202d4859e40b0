//! `reasonchip worker`

use std::path::PathBuf;

use reasonchip_net::{TransportUri, Worker};

use crate::cli::WorkerArgs;
use crate::exit::Exit;
use crate::{logging, signals};

pub async fn run(config_path: Option<PathBuf>, log_flags: Vec<String>, args: WorkerArgs) -> Exit {
    let config = match super::load_config(&config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    logging::init(&config.logging, &log_flags);

    let engine = match super::build_engine(&config, &args.collections) {
        Ok(engine) => engine,
        Err(code) => return code,
    };
    if engine.pipeline_names().is_empty() {
        tracing::warn!("no pipelines loaded; the worker will reject every run");
    }

    let broker_uri = args.broker.unwrap_or_else(|| config.worker.broker.clone());
    let broker_uri: TransportUri = match broker_uri.parse() {
        Ok(uri) => uri,
        Err(err) => {
            eprintln!("invalid broker uri: {err}");
            return Exit::ConfigError;
        }
    };

    let capacity = args.workers.unwrap_or(config.worker.workers);
    if capacity == 0 {
        eprintln!("--workers must be greater than zero");
        return Exit::InvalidArgs;
    }
    let reconnect = args.reconnect || config.worker.reconnect;

    let worker = Worker::new(broker_uri, engine, capacity).with_reconnect(reconnect);
    let shutdown = signals::shutdown_token();
    match worker.run(shutdown).await {
        Ok(()) => Exit::Ok,
        Err(err) => {
            eprintln!("worker failed: {err}");
            Exit::TransportError
        }
    }
}
