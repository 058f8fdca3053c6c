//! Ctrl-C handling: the first interrupt cancels the run, the second exits.

use std::future::Future;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Exit status used when the user interrupts twice.
pub const FORCED_EXIT_CODE: i32 = 130;

/// Wait for interrupts produced by `next_signal`.
///
/// The first one cancels `token` so in-flight work can wind down and the
/// checkpoint is kept. The second calls `force_exit`. Returns when the signal
/// source fails or after `force_exit` returns.
pub async fn watch_interrupts<S, Fut, E>(
    mut next_signal: S,
    token: CancellationToken,
    force_exit: impl FnOnce(),
) where
    S: FnMut() -> Fut,
    Fut: Future<Output = Result<(), E>>,
    E: std::fmt::Display,
{
    if let Err(e) = next_signal().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
        return;
    }
    warn!("Interrupted, stopping after in-flight work. Press Ctrl-C again to exit now");
    token.cancel();

    if let Err(e) = next_signal().await {
        error!(error = %e, "Cannot listen for Ctrl-C");
        return;
    }
    warn!("Interrupted again, exiting without waiting");
    force_exit();
}
