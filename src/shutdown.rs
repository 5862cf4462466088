use tokio_util::sync::CancellationToken;

/// Install a handler that cancels the returned token on SIGINT or SIGTERM.
/// In-flight work should watch the token and wind down.
pub fn install_shutdown_handler() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();

    tokio::spawn(async move {
        wait_for_signal().await;
        trigger.cancel();
    });

    token
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            tracing::warn!(error = %e, "Failed to install SIGTERM handler");
            return interrupt().await;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, cancelling outstanding jobs");
        }
        _ = interrupt() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    interrupt().await
}

async fn interrupt() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received SIGINT, cancelling outstanding jobs"),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await
        }
    }
}
