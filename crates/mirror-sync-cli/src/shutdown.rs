use tokio_util::sync::CancellationToken;

/// Cancel `token` on the first Ctrl+C or SIGTERM.
///
/// A second Ctrl+C exits immediately.
pub fn cancel_on_signal(token: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        tracing::warn!("shutdown requested, stopping in-flight syncs");
        token.cancel();

        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Force quit!");
            std::process::exit(130);
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(error) => {
            tracing::warn!(%error, "could not listen for SIGTERM");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
