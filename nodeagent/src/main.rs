use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeitwork_nodeagent::agent::NodeAgent;
use zeitwork_nodeagent::args::Args;

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    trace!(args = ?args, "parsed args");

    let agent = match NodeAgent::init(&args).await {
        Ok(agent) => agent,
        Err(error) => {
            error!(
                error = &error as &dyn std::error::Error,
                "failed to initialize the node agent"
            );
            return ExitCode::FAILURE;
        }
    };

    let shutdown = zeitwork_common::shutdown::signal_token();
    agent.run(shutdown).await;

    info!("node agent stopped cleanly");
    ExitCode::SUCCESS
}
