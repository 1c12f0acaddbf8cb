//! # procvisor
//!
//! **Procvisor** is a long-running OS process supervisor daemon. It is
//! started by a controlling host program and speaks a framed, tagged-term
//! protocol over a byte pipe pair: the host asks it to spawn, adopt,
//! signal, feed, and stop child processes; the daemon streams back their
//! stdout/stderr and exactly one exit notification per child.
//!
//! ## Features
//!
//! | Area              | Description                                                      | Key types / entry points                |
//! |-------------------|------------------------------------------------------------------|-----------------------------------------|
//! | **Protocol**      | 2-byte framed external-term-format commands and replies.         | [`protocol::FrameReader`], [`protocol::term`] |
//! | **Lifecycle**     | Spawn with redirections/credentials, adopt, stop with escalation.| [`Daemon`], [`protocol::SpawnOptions`]  |
//! | **Stdio**         | Queued stdin, chunked stdout/stderr forwarding, ordered exits.   | `{stdin, Pid, Data}`, `{stdout, Pid, B}`|
//! | **Privileges**    | Root drop with a retained {setuid, kill, sys_nice} cap set.      | [`drop_privileges`], [`Privilege`]      |
//! | **Shutdown**      | Alarm-bounded group termination on signal or pipe loss.          | [`Daemon::run`]                         |
//! | **Errors**        | Per-command replies vs latched fatal statuses.                   | [`CommandError`], [`DaemonError`]       |
//!
//! ## Protocol sketch
//! ```text
//! host → {TransId, {run, "echo hi", [{stdout, pipe}]}}
//! host ← {TransId, {ok, Pid}}
//! host ← {0, {stdout, Pid, <<"hi\n">>}}
//! host ← {0, {exit_status, Pid, 0}}
//! ```
//!
//! The daemon binary wires this crate to the launcher's pipe pair; the
//! library surface exists so the full protocol can be driven through
//! in-memory transports in tests.

mod config;
mod core;
mod error;
mod events;
mod privilege;

pub mod protocol;

// ---- Public re-exports ----

pub use crate::config::Config;
pub use crate::core::{install as install_signal_intake, Daemon, SignalState};
pub use crate::error::{CommandError, DaemonError, Reason};
pub use crate::events::{ChildEvent, OutStream};
pub use crate::privilege::{drop_privileges, Privilege, PrivilegeError};
