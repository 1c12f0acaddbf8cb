//! # Shutdown sequencer helpers.
//!
//! When the event loop ends — host pipe lost, terminating signal, or a
//! `{shutdown}` command — the daemon must leave no children behind:
//!
//! ```text
//! arm alarm(-alarm secs)        hard exit backstop
//! SIGTERM own process group     reaches every spawned child at once
//! drain up to 6 seconds         escalation passes + exit delivery
//! exit with the latched status
//! ```
//!
//! The drain loop itself lives in the daemon (it owns the registry); this
//! module holds the two process-level helpers.

use std::time::Duration;

use tokio::task::JoinHandle;

/// Window the drain loop gets before remaining children are abandoned.
pub(crate) const SHUTDOWN_GRACE: Duration = Duration::from_secs(6);

/// Arms the hard-exit backstop.
///
/// If the drain loop hangs on an unkillable child, the process still exits
/// with `status` once `budget` elapses.
pub(crate) fn arm_alarm(budget: Duration, status: i32) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(budget).await;
        tracing::error!(?budget, status, "shutdown alarm fired, exiting hard");
        std::process::exit(status);
    })
}

/// SIGTERMs the daemon's own process group.
///
/// Only meaningful when the daemon is the group leader (main promotes it
/// with `setpgid` at startup); embedded in another process group — the
/// in-process test harness — this is skipped so we don't shoot the host.
pub(crate) fn terminate_process_group() {
    // SAFETY: plain syscalls on process ids.
    unsafe {
        if libc::getpgrp() != libc::getpid() {
            tracing::debug!("not the process group leader, skipping group SIGTERM");
            return;
        }
        libc::kill(0, libc::SIGTERM);
    }
}
