//! # Error types used by the procvisor daemon.
//!
//! This module defines two main error enums:
//!
//! - [`CommandError`] failures of a single host command; serialized back to
//!   the host as an `{error, Reason}` reply and never fatal to the daemon.
//! - [`DaemonError`] unrecoverable conditions (host pipe loss, framing
//!   corruption); each carries the process exit status the daemon latches.
//!
//! Both types provide an `as_label` helper for logs. [`CommandError`]
//! additionally knows whether its reason travels as an atom or as a string
//! on the wire ([`CommandError::reason`]).

use std::time::Duration;

use nix::errno::Errno;
use thiserror::Error;

/// Wire representation of an error reason.
///
/// The protocol distinguishes atom reasons (`badarg`, `esrch`, `eperm`) from
/// free-form string reasons (option validator messages, spawn failures).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reason {
    /// Reply `{error, Atom}`.
    Atom(String),
    /// Reply `{error, "text"}` (a charlist on the wire).
    Text(String),
}

/// # Errors produced while serving a single host command.
///
/// These are reported to the host at the request's transaction id and the
/// event loop continues. None of them terminate the daemon.
#[non_exhaustive]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Malformed command arguments or options.
    #[error("badarg")]
    BadArg,

    /// Command atom was not recognized.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// An option list failed validation (duplicate, bad value, bad redirect).
    #[error("{0}")]
    BadOption(String),

    /// Target pid is not registered or no longer alive.
    #[error("pid not alive")]
    NotAlive,

    /// Target pid failed the liveness probe.
    #[error("pid not alive (err: {0})")]
    NotAliveErrno(i32),

    /// A privileged operation was refused.
    #[error("{0}")]
    Privilege(String),

    /// Spawning the child failed before it could exec.
    #[error("Couldn't start pid: {0}")]
    SpawnFailed(String),

    /// Signal number was rejected by the kernel.
    #[error("Invalid signal: {0}")]
    InvalidSignal(i32),

    /// The custom kill command could not be started; SIGTERM was used.
    #[error("bad kill command - using SIGTERM")]
    BadKillCommand,

    /// A syscall failed; reported as an errno atom where one exists.
    #[error("{0}")]
    Sys(Errno),
}

impl CommandError {
    /// Returns a short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            CommandError::BadArg => "badarg",
            CommandError::UnknownCommand(_) => "unknown_command",
            CommandError::BadOption(_) => "bad_option",
            CommandError::NotAlive | CommandError::NotAliveErrno(_) => "not_alive",
            CommandError::Privilege(_) => "privilege",
            CommandError::SpawnFailed(_) => "spawn_failed",
            CommandError::InvalidSignal(_) => "invalid_signal",
            CommandError::BadKillCommand => "bad_kill_command",
            CommandError::Sys(_) => "sys",
        }
    }

    /// Maps the error onto its wire reason.
    ///
    /// Atom vs string follows the protocol contract: `badarg` and errno
    /// names are atoms, everything descriptive is a string.
    pub fn reason(&self) -> Reason {
        match self {
            CommandError::BadArg => Reason::Atom("badarg".into()),
            CommandError::Sys(errno) => Reason::Atom(errno_atom(*errno)),
            other => Reason::Text(other.to_string()),
        }
    }
}

/// Lowercase errno atom (`esrch`, `eperm`, `einval`, ...).
///
/// Unknown errnos fall back to the kernel's description text, still sent as
/// an atom so hosts can match on the reason.
fn errno_atom(errno: Errno) -> String {
    match errno {
        Errno::ESRCH => "esrch".into(),
        Errno::EPERM => "eperm".into(),
        Errno::EINVAL => "einval".into(),
        other => other.desc().to_ascii_lowercase(),
    }
}

/// # Fatal daemon conditions.
///
/// Any of these breaks the event loop and starts the shutdown sequencer.
/// [`DaemonError::exit_status`] is the status the process ultimately exits
/// with (after the children have been terminated).
#[non_exhaustive]
#[derive(Error, Debug)]
pub enum DaemonError {
    /// The host pipe reached EOF or failed mid-frame.
    #[error("host pipe lost: {0}")]
    PipeLost(#[source] std::io::Error),

    /// A frame arrived but its envelope could not be decoded.
    #[error("undecodable command frame")]
    FrameDecode,

    /// Writing a reply or notification to the host failed.
    #[error("host write failed: {0}")]
    SendFailed(#[source] std::io::Error),

    /// A terminating OS signal was received.
    #[error("terminating signal received")]
    Terminated,

    /// Shutdown grace period exceeded; children had to be abandoned.
    #[error("shutdown grace {grace:?} exceeded; still alive: {stuck:?}")]
    GraceExceeded {
        /// The configured grace duration.
        grace: Duration,
        /// Pids that did not die in time.
        stuck: Vec<i32>,
    },
}

impl DaemonError {
    /// Process exit status latched for this condition.
    ///
    /// The numbering is part of the external contract with the host
    /// launcher: `0` clean, `1` signal, `12` frame decode, `13` host write,
    /// `90 + errno` for pipe read failures.
    pub fn exit_status(&self) -> i32 {
        match self {
            DaemonError::PipeLost(err) => 90 + err.raw_os_error().unwrap_or(1),
            DaemonError::FrameDecode => 12,
            DaemonError::SendFailed(_) => 13,
            DaemonError::Terminated => 1,
            DaemonError::GraceExceeded { .. } => 1,
        }
    }

    /// Returns a short stable label (snake_case) for logs.
    pub fn as_label(&self) -> &'static str {
        match self {
            DaemonError::PipeLost(_) => "pipe_lost",
            DaemonError::FrameDecode => "frame_decode",
            DaemonError::SendFailed(_) => "send_failed",
            DaemonError::Terminated => "terminated",
            DaemonError::GraceExceeded { .. } => "grace_exceeded",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn badarg_travels_as_atom() {
        assert_eq!(CommandError::BadArg.reason(), Reason::Atom("badarg".into()));
    }

    #[test]
    fn errno_reasons_use_lowercase_atoms() {
        assert_eq!(
            CommandError::Sys(Errno::ESRCH).reason(),
            Reason::Atom("esrch".into())
        );
        assert_eq!(
            CommandError::Sys(Errno::EPERM).reason(),
            Reason::Atom("eperm".into())
        );
    }

    #[test]
    fn descriptive_errors_travel_as_strings() {
        let err = CommandError::SpawnFailed("no such file".into());
        assert_eq!(
            err.reason(),
            Reason::Text("Couldn't start pid: no such file".into())
        );
    }

    #[test]
    fn pipe_loss_status_encodes_errno() {
        let err = DaemonError::PipeLost(std::io::Error::from_raw_os_error(32));
        assert_eq!(err.exit_status(), 122);
    }
}
