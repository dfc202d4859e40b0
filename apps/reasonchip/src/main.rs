mod cli;
mod commands;
mod exit;
mod logging;
mod signals;
mod vars;

use clap::Parser;

use cli::{Cli, Command};

#[tokio::main]
async fn main() -> std::process::ExitCode {
    let cli = Cli::parse();
    let code = match cli.command {
        Command::Broker(args) => commands::broker::run(cli.config, cli.log_level, args).await,
        Command::Worker(args) => commands::worker::run(cli.config, cli.log_level, args).await,
        Command::Run(args) => commands::run::run(cli.config, cli.log_level, args).await,
        Command::RunLocal(args) => commands::run_local::run(cli.config, cli.log_level, args).await,
    };
    code.into()
}
