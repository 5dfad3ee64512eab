use crate::logger::{self, LogTag};
use crate::service::Service;
use std::sync::Arc;

/// Close the service and exit on SIGINT or SIGTERM
///
/// The task ends quietly if the service closes for another reason first.
pub(crate) fn hook(service: Arc<Service>) {
    let closing = service.closing();
    tokio::spawn(async move {
        let signal = tokio::select! {
            _ = closing.cancelled() => return,
            signal = wait_for_signal() => signal,
        };
        let Some(signal) = signal else {
            return;
        };

        service.on_signal(signal).await;
        std::process::exit(0);
    });
}

async fn wait_for_signal() -> Option<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                logger::error(LogTag::System, &format!("Failed to bind SIGINT: {}", e));
                return None;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                logger::error(LogTag::System, &format!("Failed to bind SIGTERM: {}", e));
                return None;
            }
        };

        tokio::select! {
            _ = sigint.recv() => Some("SIGINT"),
            _ = sigterm.recv() => Some("SIGTERM"),
        }
    }

    #[cfg(not(unix))]
    {
        match tokio::signal::ctrl_c().await {
            Ok(()) => Some("CTRL_C"),
            Err(e) => {
                logger::error(
                    LogTag::System,
                    &format!("Failed to listen for shutdown signal: {}", e),
                );
                None
            }
        }
    }
}
