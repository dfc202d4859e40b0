//! `reasonchip broker`

use std::path::PathBuf;

use reasonchip_net::{server_transport, Broker, TransportUri};

use crate::cli::BrokerArgs;
use crate::exit::Exit;
use crate::{logging, signals};

pub async fn run(config_path: Option<PathBuf>, log_flags: Vec<String>, args: BrokerArgs) -> Exit {
    let config = match super::load_config(&config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    logging::init(&config.logging, &log_flags);

    let client_uri = args
        .client_listen
        .unwrap_or_else(|| config.broker.client_listen.clone());
    let worker_uri = args
        .worker_listen
        .unwrap_or_else(|| config.broker.worker_listen.clone());

    let (client_uri, worker_uri) = match (
        client_uri.parse::<TransportUri>(),
        worker_uri.parse::<TransportUri>(),
    ) {
        (Ok(client), Ok(worker)) => (client, worker),
        (Err(err), _) | (_, Err(err)) => {
            eprintln!("invalid listen uri: {err}");
            return Exit::ConfigError;
        }
    };

    let client_transport = match server_transport(&client_uri) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("cannot build client listener: {err}");
            return Exit::TransportError;
        }
    };
    let worker_transport = match server_transport(&worker_uri) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("cannot build worker listener: {err}");
            return Exit::TransportError;
        }
    };

    let broker = Broker::new(client_transport, worker_transport);
    if let Err(err) = broker.start().await {
        eprintln!("broker failed to start: {err}");
        return Exit::TransportError;
    }
    tracing::info!(client = %client_uri, worker = %worker_uri, "broker serving");

    signals::shutdown_token().cancelled().await;
    broker.shutdown().await;
    Exit::Ok
}
