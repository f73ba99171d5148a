//! Process signal handling

use std::fmt;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Signal that asked the gateway to stop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopSignal {
    Interrupt,
    Terminate,
}

impl fmt::Display for StopSignal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopSignal::Interrupt => f.write_str("SIGINT"),
            StopSignal::Terminate => f.write_str("SIGTERM"),
        }
    }
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        },
        Err(e) => {
            warn!("SIGTERM not handled ({}), stop the gateway with Ctrl+C", e);
            std::future::pending::<()>().await;
        },
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await;
}

/// Resolve on the first stop signal
pub async fn next_stop_signal() -> StopSignal {
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                // Without a Ctrl+C handler only SIGTERM can stop the process
                warn!("Ctrl+C not handled: {}", e);
                terminate().await;
                return StopSignal::Terminate;
            }
            StopSignal::Interrupt
        },
        _ = terminate() => StopSignal::Terminate,
    }
}

/// Cancel `token` on the first stop signal; returns early if `token` is cancelled elsewhere
pub fn cancel_on_signal(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            signal = next_stop_signal() => {
                info!("{} received, stopping gateway", signal);
                token.cancel();
            },
            _ = token.cancelled() => {},
        }
    })
}
