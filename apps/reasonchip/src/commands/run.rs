//! `reasonchip run` — execute a pipeline remotely, emit a JSON result.

use std::path::PathBuf;

use serde_json::json;

use reasonchip_net::{client_transport, Api, ClientError, Multiplexor, ResultCode, TransportUri};

use crate::cli::RunArgs;
use crate::exit::Exit;
use crate::{logging, signals, vars};

pub async fn run(config_path: Option<PathBuf>, log_flags: Vec<String>, args: RunArgs) -> Exit {
    let config = match super::load_config(&config_path) {
        Ok(config) => config,
        Err(code) => return code,
    };
    logging::init(&config.logging, &log_flags);

    let variables = match vars::assemble(&args.variables, &args.set) {
        Ok(variables) => variables,
        Err(err) => {
            eprintln!("{err:#}");
            return Exit::InvalidArgs;
        }
    };

    let broker_uri = args
        .broker
        .unwrap_or_else(|| config.broker.client_listen.clone());
    let broker_uri: TransportUri = match broker_uri.parse() {
        Ok(uri) => uri,
        Err(err) => {
            eprintln!("invalid broker uri: {err}");
            return Exit::ConfigError;
        }
    };

    let transport = match client_transport(&broker_uri) {
        Ok(transport) => transport,
        Err(err) => {
            eprintln!("cannot build transport: {err}");
            return Exit::TransportError;
        }
    };
    let mux = Multiplexor::new(transport);
    if let Err(err) = mux.start().await {
        eprintln!("cannot reach broker at {broker_uri}: {err}");
        return Exit::TransportError;
    }

    // The first interrupt cancels the remote run; the terminal RESULT
    // still arrives with rc=CANCELLED.
    let cancel = signals::shutdown_token();

    let api = Api::new(mux.clone());
    let outcome = api
        .run_pipeline(&args.pipeline, variables, args.cookie, Some(cancel))
        .await;
    mux.stop().await;

    match outcome {
        Ok(outcome) => {
            let document = json!({
                "rc": outcome.rc.as_str(),
                "result": outcome.result,
                "error": outcome.error,
                "stacktrace": outcome.stacktrace,
            });
            println!("{}", serde_json::to_string_pretty(&document).unwrap_or_default());
            match outcome.rc {
                ResultCode::Ok => Exit::Ok,
                ResultCode::Cancelled => Exit::Cancelled,
                ResultCode::BrokerLost => Exit::TransportError,
                _ => Exit::RemoteError,
            }
        }
        Err(ClientError::BrokerLost) => {
            eprintln!("connection to the broker was lost");
            Exit::TransportError
        }
        Err(err) => {
            eprintln!("run failed: {err}");
            Exit::GeneralError
        }
    }
}
