use std::process::ExitCode;

use clap::Parser;
use tracing::{error, info, trace};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeitwork_listener::args::Args;
use zeitwork_listener::stream;

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

    let shutdown = zeitwork_common::shutdown::signal_token();

    match stream::run(args, shutdown).await {
        Ok(()) => {
            info!("listener stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(
                error = &error as &dyn std::error::Error,
                "listener exited with an error"
            );
            ExitCode::FAILURE
        }
    }
}
