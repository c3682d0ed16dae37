//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for SIGINT (Ctrl-C) and, on Unix, SIGTERM
//! - Translate the first one into a shutdown trigger carrying its reason
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - There is no reload signal; configuration is fixed at startup

use crate::lifecycle::shutdown::{Shutdown, ShutdownReason};

/// Wait until a termination signal arrives, then trigger `shutdown`.
pub async fn wait_for_shutdown(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let reason = tokio::select! {
        _ = ctrl_c => ShutdownReason::Interrupt,
        _ = terminate => ShutdownReason::Terminate,
    };
    shutdown.trigger(reason);
}
