use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use axum_server::Handle;
use clap::Parser;
use tokio::sync::mpsc;
use tracing::{error, info, trace, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use zeitwork_edge::args::Args;
use zeitwork_edge::issuer::Issuer;
use zeitwork_edge::proxy;
use zeitwork_edge::routes::{self, RouteTable};
use zeitwork_edge::storage::CertStore;
use zeitwork_edge::tls::{make_tls_acceptor, ChainAndPrivateKey};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

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

    match run(args).await {
        Ok(()) => {
            info!("edge stopped cleanly");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(
                error = &error as &dyn std::error::Error,
                "edge exited with an error"
            );
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> zeitwork_edge::Result<()> {
    let pool = zeitwork_common::db::connect_and_migrate(&args.database_url).await?;
    let shutdown = zeitwork_common::shutdown::signal_token();

    let routes = Arc::new(RouteTable::default());
    match routes.refresh(&pool).await {
        Ok(count) => info!(routes = count, "initial route table loaded"),
        Err(error) => warn!(
            error = &error as &dyn std::error::Error,
            "initial route refresh failed, starting with an empty table"
        ),
    }

    let (miss_tx, miss_rx) = mpsc::channel(64);
    let (resolver, acceptor) = make_tls_acceptor(miss_tx.clone());

    // Until ACME has issued something, serve a self-signed certificate for
    // the edge's own hostname so the listener is never certificate-less.
    let self_signed = rcgen::generate_simple_self_signed(vec![args.hostname.clone()])
        .map_err(|e| zeitwork_edge::EdgeError::Tls(e.to_string()))?;
    let bootstrap = ChainAndPrivateKey::from_der(
        vec![self_signed
            .serialize_der()
            .map_err(|e| zeitwork_edge::EdgeError::Tls(e.to_string()))?],
        self_signed.serialize_private_key_der(),
    );
    resolver.serve_default(bootstrap).await?;

    let store = CertStore::new(pool.clone());
    let issuer = Arc::new(Issuer::new(
        pool.clone(),
        store,
        Arc::clone(&resolver),
        args.hostname.clone(),
        args.acme_email.clone(),
        args.acme_directory.clone(),
    ));

    match issuer.warm_from_store().await {
        Ok(count) => info!(certificates = count, "stored certificates loaded"),
        Err(error) => warn!(
            error = &error as &dyn std::error::Error,
            "could not warm certificates from storage"
        ),
    }

    // Kick off issuance for our own hostname if it is not covered yet.
    let _ = miss_tx.try_send(args.hostname.clone());

    let refresh_handle = tokio::spawn(routes::refresh_task(
        Arc::clone(&routes),
        pool.clone(),
        Duration::from_secs(args.refresh_secs),
        shutdown.clone(),
    ));

    let issuer_handle = tokio::spawn({
        let issuer = Arc::clone(&issuer);
        let shutdown = shutdown.clone();
        async move { issuer.run(miss_rx, shutdown).await }
    });
    let renewal_handle = tokio::spawn({
        let issuer = Arc::clone(&issuer);
        let shutdown = shutdown.clone();
        async move { issuer.renewal_task(shutdown).await }
    });

    let https_handle = Handle::new();
    let http_handle = Handle::new();

    // Drain both listeners when the shutdown signal arrives.
    tokio::spawn({
        let shutdown = shutdown.clone();
        let https_handle = https_handle.clone();
        let http_handle = http_handle.clone();
        async move {
            shutdown.cancelled().await;
            info!("draining edge listeners");
            https_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
            http_handle.graceful_shutdown(Some(DRAIN_TIMEOUT));
        }
    });

    let https_server = axum_server::bind(args.https_addr)
        .acceptor(acceptor)
        .handle(https_handle)
        .serve(
            proxy::router(Arc::clone(&routes))
                .into_make_service_with_connect_info::<SocketAddr>(),
        );

    let http_server = axum_server::bind(args.http_addr)
        .handle(http_handle)
        .serve(proxy::redirect_router().into_make_service());

    info!(https = %args.https_addr, http = %args.http_addr, "edge serving");

    let (https_result, http_result) = tokio::join!(https_server, http_server);
    https_result?;
    http_result?;

    refresh_handle.abort();
    issuer_handle.abort();
    renewal_handle.abort();

    Ok(())
}
