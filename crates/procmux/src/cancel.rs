//! Timeout guard and abort bridge. Both converge on the shared kill path and
//! disarm themselves when the process exits first.

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use procmux_core::{KillSignal, ProcessEvent, ProcmuxError};

use crate::handle::{KillCause, Killer};

/// One-shot timer that kills the child with the configured signal on expiry.
pub(crate) fn arm_timeout(killer: Killer, kill_signal: KillSignal, timeout: Duration) {
    let exit = killer.shared.exit_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = exit.cancelled() => {}
            _ = tokio::time::sleep(timeout) => {
                let millis = timeout.as_millis() as u64;
                debug!(millis, "timeout expired, killing process");
                let _ = killer.kill_for(&kill_signal, KillCause::Timeout(millis));
            }
        }
    });
}

/// Mirrors cancellation of the caller's token onto the kill path. A token
/// that is already cancelled at spawn time still goes through a task, so the
/// error is observed asynchronously like every other event.
pub(crate) fn bridge_abort(killer: Killer, kill_signal: KillSignal, token: CancellationToken) {
    let exit = killer.shared.exit_token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = exit.cancelled() => return,
            _ = token.cancelled() => {}
        }
        debug!("abort requested, killing process");
        let _ = killer.kill_for(&kill_signal, KillCause::Abort);
        killer.shared.emit(ProcessEvent::error(ProcmuxError::Aborted));
    });
}
