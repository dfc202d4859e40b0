//! `reasonchip run-local` — execute a pipeline in-process.

use std::path::PathBuf;

use serde_json::json;

use crate::cli::RunLocalArgs;
use crate::exit::Exit;
use crate::{logging, signals, vars};

pub async fn run(config_path: Option<PathBuf>, log_flags: Vec<String>, args: RunLocalArgs) -> Exit {
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

    let engine = match super::build_engine(&config, &args.collections) {
        Ok(engine) => engine,
        Err(code) => return code,
    };

    let cancel = signals::shutdown_token();
    let outcome = engine
        .run_cancellable(&args.pipeline, variables, cancel)
        .await;

    match outcome {
        Ok(result) => {
            let document = json!({"rc": "OK", "result": result});
            println!("{}", serde_json::to_string_pretty(&document).unwrap_or_default());
            Exit::Ok
        }
        Err(err) if err.is_cancelled() => {
            let document = json!({"rc": "CANCELLED"});
            println!("{}", serde_json::to_string_pretty(&document).unwrap_or_default());
            Exit::Cancelled
        }
        Err(err) => {
            let chain = error_chain(&err);
            let document = json!({
                "rc": "ERROR",
                "error": err.to_string(),
                "stacktrace": chain,
            });
            println!("{}", serde_json::to_string_pretty(&document).unwrap_or_default());
            Exit::GeneralError
        }
    }
}

fn error_chain(err: &dyn std::error::Error) -> Vec<String> {
    let mut chain = vec![err.to_string()];
    let mut cursor = err.source();
    while let Some(cause) = cursor {
        chain.push(cause.to_string());
        cursor = cause.source();
    }
    chain
}
