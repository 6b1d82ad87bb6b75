//! Component lifecycle
//!
//! Long-running components are independent tasks reporting termination on
//! one fan-in channel; the supervisor is its only reader. There are no
//! task-to-task references: shutdown coordination is the root cancellation
//! token in one direction and `Exit` messages in the other.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::signal;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Bound on how long shutdown waits for components after cancelling.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Termination report from a component task.
#[derive(Debug)]
pub struct Exit {
    pub id: &'static str,
    pub err: Option<String>,
}

/// Spawn a component task that reports its termination on `exit_tx`.
pub fn spawn_component<F, E>(id: &'static str, exit_tx: mpsc::Sender<Exit>, fut: F)
where
    F: Future<Output = Result<(), E>> + Send + 'static,
    E: Display,
{
    tokio::spawn(async move {
        let err = fut.await.err().map(|e| e.to_string());
        let _ = exit_tx.send(Exit { id, err }).await;
    });
}

/// Run until a shutdown trigger (an OS signal, any component exiting, or
/// the completion channel closing), then cancel the root token and wait,
/// bounded, for the remaining components.
///
/// Returns whether any component reported an error.
pub async fn supervise(
    cancel: CancellationToken,
    mut exit_rx: mpsc::Receiver<Exit>,
    mut remaining: usize,
) -> bool {
    let mut failed = false;

    tokio::select! {
        _ = shutdown_signal() => info!("Got signal, exiting"),
        exit = exit_rx.recv() => match exit {
            Some(exit) => {
                remaining = remaining.saturating_sub(1);
                failed |= log_exit(&exit);
            }
            None => remaining = 0,
        },
    }

    cancel.cancel();

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    while remaining > 0 {
        match tokio::time::timeout_at(deadline, exit_rx.recv()).await {
            Ok(Some(exit)) => {
                remaining = remaining.saturating_sub(1);
                failed |= log_exit(&exit);
            }
            Ok(None) => break,
            Err(_) => {
                warn!(remaining, "Timed out waiting for component shutdown");
                break;
            }
        }
    }

    failed
}

fn log_exit(exit: &Exit) -> bool {
    match &exit.err {
        Some(err) => {
            error!(id = exit.id, error = %err, "Component failed");
            true
        }
        None => {
            info!(id = exit.id, "Component finished");
            false
        }
    }
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_supervise_stops_after_all_components_exit() {
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = mpsc::channel(4);

        spawn_component::<_, std::convert::Infallible>("one", exit_tx.clone(), async {
            Ok(())
        });
        {
            let cancel = cancel.clone();
            spawn_component::<_, std::convert::Infallible>("two", exit_tx.clone(), async move {
                cancel.cancelled().await;
                Ok(())
            });
        }
        drop(exit_tx);

        let failed = tokio::time::timeout(Duration::from_secs(5), supervise(cancel.clone(), exit_rx, 2))
            .await
            .expect("supervisor did not finish");
        assert!(!failed);
        assert!(cancel.is_cancelled());
    }

    #[tokio::test]
    async fn test_supervise_reports_component_failure() {
        let cancel = CancellationToken::new();
        let (exit_tx, exit_rx) = mpsc::channel(4);

        spawn_component("broken", exit_tx.clone(), async {
            Err::<(), _>(std::io::Error::other("bang"))
        });
        drop(exit_tx);

        let failed = tokio::time::timeout(Duration::from_secs(5), supervise(cancel, exit_rx, 1))
            .await
            .expect("supervisor did not finish");
        assert!(failed);
    }
}
