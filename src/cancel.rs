//! Cooperative cancellation.
//!
//! A run shares one [`CancellationToken`]. It is set once (typically from an
//! interrupt) and never reset; each batch attempt derives a child token so a
//! batch timeout can stop its own workers without touching the parent.
//! Workers only look at the token at checkpoints: before a fetch or assembly
//! attempt, during backoff sleeps, and at every batch state transition.

pub use tokio_util::sync::CancellationToken;

use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Cancel `token` when the process receives Ctrl-C (SIGINT).
///
/// The listener ends on its own once the token is cancelled by anyone else,
/// so dropping or awaiting the handle is optional.
pub fn cancel_on_ctrl_c(token: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::select! {
            res = tokio::signal::ctrl_c() => match res {
                Ok(()) => {
                    info!("Interrupt received, stopping after in-flight attempts");
                    token.cancel();
                }
                Err(e) => warn!("Could not listen for Ctrl-C: {}", e),
            },
            _ = token.cancelled() => {}
        }
    })
}
