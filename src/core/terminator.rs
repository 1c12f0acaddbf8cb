//! # Terminator: graceful-to-forceful kill escalation.
//!
//! A stop request walks one ladder, first match wins:
//!
//! ```text
//! sigkill already sent      → no-op (silent)
//! attempt already in flight → past deadline? SIGKILL child + helper
//! custom kill command set   → spawn helper, arm deadline
//! otherwise                 → SIGTERM, arm deadline
//!                             SIGTERM undeliverable → SIGKILL now
//!                             SIGKILL undeliverable → abandon as zombie
//! ```
//!
//! ## Rules
//! - At most one SIGTERM and one SIGKILL per child, ever
//! - The host gets **at most one reply** per stop request; the kill-command
//!   fallback reports its error and suppresses the later `ok`
//! - An abandoned child is removed without an exit event
//! - Negative pids are never signalled: the daemon leads its own process
//!   group, and `kill(-1, …)` would take it down with everything else

use nix::errno::Errno;
use tokio::time::Instant;

use crate::config::Config;
use crate::core::registry::Registry;
use crate::core::spawner;
use crate::error::CommandError;
use crate::events::EventSender;
use crate::protocol::options::SpawnOptions;

/// What the escalation needs besides the registry.
pub(crate) struct StopCtx<'a> {
    pub cfg: &'a Config,
    pub events: &'a EventSender,
}

/// Sends `signal` to a single pid, refusing group targets.
pub(crate) fn send_signal(pid: i32, signal: i32) -> Result<(), Errno> {
    if pid < 0 {
        tracing::debug!(pid, signal, "negative-pid kill prohibited");
        return Err(Errno::EINVAL);
    }
    // SAFETY: plain syscall on integers.
    if unsafe { libc::kill(pid, signal) } < 0 {
        Err(Errno::last())
    } else {
        Ok(())
    }
}

/// Liveness probe: signal 0 checks deliverability without side effects.
pub(crate) fn probe(pid: i32) -> Result<(), Errno> {
    send_signal(pid, 0)
}

/// Maps a failed `kill(2)` onto the protocol's error shapes.
pub(crate) fn map_kill_error(signal: i32, errno: Errno) -> CommandError {
    match errno {
        Errno::EINVAL => CommandError::InvalidSignal(signal),
        other => CommandError::Sys(other),
    }
}

/// Serves a `{stop, Pid}` command: registry lookup, liveness probe, then
/// the escalation ladder. `None` means no reply is owed.
pub(crate) fn stop_by_pid(
    registry: &mut Registry,
    pid: i32,
    now: Instant,
    ctx: &StopCtx<'_>,
) -> Option<Result<(), CommandError>> {
    if !registry.contains(pid) {
        return Some(Err(CommandError::NotAlive));
    }
    if let Err(errno) = probe(pid) {
        return Some(Err(CommandError::NotAliveErrno(errno as i32)));
    }
    stop_attempt(registry, pid, now, ctx)
}

/// One pass of the escalation ladder for `pid`.
///
/// Re-entrant by design: repeated calls are no-ops (`sigkill_sent`) or
/// deadline checks (`sigterm_sent`), so a `stop` command and the loop's
/// deadline tick can share this path.
pub(crate) fn stop_attempt(
    registry: &mut Registry,
    pid: i32,
    now: Instant,
    ctx: &StopCtx<'_>,
) -> Option<Result<(), CommandError>> {
    let (sigterm_sent, sigkill_sent, kill_helper, deadline, kill_cmd, kill_timeout) = {
        let record = registry.get_mut(pid)?;
        (
            record.sigterm_sent,
            record.sigkill_sent,
            record.kill_helper,
            record.deadline,
            record.kill_cmd.clone(),
            record.kill_timeout,
        )
    };

    if sigkill_sent {
        return None;
    }

    if sigterm_sent || kill_helper.is_some() {
        if sigterm_sent && deadline.is_some_and(|deadline| now >= deadline) {
            let _ = send_signal(pid, libc::SIGKILL);
            if let Some(helper) = kill_helper {
                let _ = send_signal(helper, libc::SIGKILL);
            }
            tracing::debug!(pid, "escalated to SIGKILL");
            if let Some(record) = registry.get_mut(pid) {
                record.sigkill_sent = true;
            }
        }
        return Some(Ok(()));
    }

    // First attempt. A failing kill command reports its error once and the
    // SIGTERM fallback below stays silent.
    let mut reply: Option<Result<(), CommandError>> = None;
    if let Some(kill_cmd) = kill_cmd {
        let opts = SpawnOptions::with_kill_timeout(ctx.cfg.kill_timeout);
        let extra = [("CHILD_PID", pid.to_string())];
        match spawner::spawn(&kill_cmd, &opts, ctx.cfg, ctx.events, &extra) {
            Ok(parts) => {
                tracing::debug!(pid, helper = parts.pid, "kill command started");
                registry.register_helper(parts.pid, pid, parts.monitor);
                if let Some(record) = registry.get_mut(pid) {
                    record.kill_helper = Some(parts.pid);
                    record.deadline = Some(now + kill_timeout);
                    record.sigterm_sent = true;
                }
                return Some(Ok(()));
            }
            Err(err) => {
                tracing::debug!(pid, %err, "kill command failed, falling back to SIGTERM");
                reply = Some(Err(CommandError::BadKillCommand));
            }
        }
    }

    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => {
            tracing::debug!(pid, timeout = ?kill_timeout, "sent SIGTERM");
            if let Some(record) = registry.get_mut(pid) {
                record.deadline = Some(now + kill_timeout);
                record.sigterm_sent = true;
            }
            reply.get_or_insert(Ok(()));
        }
        Err(errno) => {
            reply.get_or_insert(Err(map_kill_error(libc::SIGTERM, errno)));
            match send_signal(pid, libc::SIGKILL) {
                Ok(()) => {
                    tracing::debug!(pid, "SIGTERM undeliverable, sent SIGKILL");
                    if let Some(record) = registry.get_mut(pid) {
                        record.sigterm_sent = true;
                        record.sigkill_sent = true;
                        record.deadline = Some(now);
                    }
                }
                Err(_) => {
                    tracing::warn!(pid, "cannot signal child at all, abandoning as zombie");
                    if let Some(record) = registry.remove(pid) {
                        record.teardown();
                    }
                }
            }
        }
    }
    reply
}

/// Escalates every child whose deadline has passed. Loop-tick path: never
/// replies to the host.
pub(crate) fn check_deadlines(registry: &mut Registry, now: Instant, ctx: &StopCtx<'_>) {
    for pid in registry.due_for_escalation(now) {
        let _ = stop_attempt(registry, pid, now, ctx);
    }
}
