use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Returns a token that is cancelled when the process receives SIGINT or
/// SIGTERM. Every long-running loop selects on it; once cancelled, components
/// stop accepting work, flush, and return.
pub fn signal_token() -> CancellationToken {
    let token = CancellationToken::new();

    let cancel = token.clone();
    tokio::spawn(async move {
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(error) => {
                tracing::error!(
                    error = &error as &dyn std::error::Error,
                    "could not install SIGTERM handler"
                );
                return;
            }
        };

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = sigterm.recv() => {},
        }

        info!("shutdown signal received");
        cancel.cancel();
    });

    token
}
