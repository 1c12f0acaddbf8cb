//! # Signal intake.
//!
//! One background task owns the OS signal streams and translates them into
//! the daemon's two latched facts: *we are terminating* and *the host pipe
//! is broken*. The event loop only ever looks at the shared
//! [`SignalState`] and the cancellation token; no signal context touches
//! daemon state directly.
//!
//! ## Signals
//! - `SIGINT` / `SIGTERM` / `SIGHUP` — latch termination, cancel the loop
//! - `SIGPIPE` — additionally marks the host pipe invalid, so shutdown
//!   skips further notifications
//!
//! `SIGCHLD` is deliberately absent: child reaping belongs to the runtime's
//! process driver, and exits reach the loop through each child's monitor
//! task.

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;

/// Facts latched by the signal task, read by the event loop.
#[derive(Debug, Default)]
pub struct SignalState {
    terminated: AtomicI32,
    pipe_broken: AtomicBool,
}

impl SignalState {
    /// Fresh state with nothing latched.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Exit status latched by a terminating signal (`0` when none arrived).
    pub fn latched(&self) -> i32 {
        self.terminated.load(Ordering::Relaxed)
    }

    /// True once SIGPIPE told us the host pipe is gone.
    pub fn pipe_broken(&self) -> bool {
        self.pipe_broken.load(Ordering::Relaxed)
    }
}

/// Installs the handlers and spawns the intake task.
///
/// The task waits for the first terminating signal, records it, and cancels
/// `token`; the event loop observes the cancellation at its next
/// suspension point.
pub fn install(token: CancellationToken, state: Arc<SignalState>) -> io::Result<()> {
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigpipe = signal(SignalKind::pipe())?;

    tokio::spawn(async move {
        let broken_pipe = tokio::select! {
            _ = sigint.recv() => false,
            _ = sigterm.recv() => false,
            _ = sighup.recv() => false,
            _ = sigpipe.recv() => true,
        };
        if broken_pipe {
            state.pipe_broken.store(true, Ordering::Relaxed);
        }
        state.terminated.store(1, Ordering::Relaxed);
        tracing::debug!(broken_pipe, "terminating signal received");
        token.cancel();
    });
    Ok(())
}
