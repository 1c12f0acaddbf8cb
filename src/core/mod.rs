//! Runtime core: orchestration and lifecycle.
//!
//! This module contains the embedded implementation of the procvisor
//! daemon. The only public API re-exported from here is [`Daemon`] and the
//! signal intake. Everything else is an internal building block the daemon
//! wires together.
//!
//! ## Files & responsibilities
//! - **daemon.rs**: the owning context; runs the select loop over host
//!   frames, child events, signals and deadlines; dispatches commands;
//!   delivers exits; drives the shutdown drain.
//! - **registry.rs**: authoritative `pid → ChildRecord` map plus the
//!   kill-helper index; single removal point; deadline scans.
//! - **spawner.rs**: `$SHELL -c` command construction, stdio redirection,
//!   pre-exec credentials, env merge, nice; starts pump/monitor tasks.
//! - **pump.rs**: per-child stdio workers (stdout/stderr chunk forwarding,
//!   stdin queue writer, bounded post-exit drain).
//! - **terminator.rs**: graceful-to-forceful kill escalation with
//!   per-child deadlines and custom kill-command helpers.
//! - **signals.rs**: OS signal intake; latches termination facts and
//!   cancels the runtime token.
//! - **shutdown.rs**: process-level shutdown helpers (hard-exit alarm,
//!   group SIGTERM) and the grace constant.
//!
//! ## Event data-plane (who produces & who consumes)
//!
//! Producers (send [`ChildEvent`](crate::events::ChildEvent)s):
//! - **output pumps** → `Output{pid, stream, bytes}` per chunk read
//! - **monitor tasks** → `Exited{pid, status}`, strictly after the pumps
//!
//! Consumer:
//! - **Daemon::run()** (single owner of all mutable state)
//!     - forwards output as `{0, {stdout|stderr, Pid, Data}}`
//!     - delivers exits as `{0, {exit_status, Pid, Status}}`, then removes
//!       the record
//!     - swallows helper exits via the helper index
//!
//! ## Wiring (module-level flow)
//! ```text
//! main
//!   └─ parses CLI, drops privileges, opens the host pipe pair,
//!      installs signal intake, calls Daemon::run()
//!
//! Daemon::run()
//!   ├─ FrameReader.next() ──► decode ──► handle_command()
//!   │      ├─ run/shell ──► spawner::spawn ──► registry.insert
//!   │      ├─ manage ─────► registry.insert (adopted)
//!   │      ├─ stop ───────► terminator::stop_by_pid
//!   │      ├─ kill ───────► terminator::send_signal
//!   │      ├─ list ───────► registry.pids
//!   │      ├─ stdin ──────► record.queue_stdin
//!   │      └─ shutdown ───► break
//!   ├─ events_rx.recv() ──► output forward / exit delivery
//!   ├─ token.cancelled() ─► break (signal intake latched the status)
//!   └─ sleep_until(min(deadline, tick)) ─► escalation + liveness probes
//! ```
//!
//! ## Shutdown timeline
//! ```text
//! loop breaks → finalize(): arm alarm(-alarm) → group SIGTERM
//! → ≤ 6s drain: stop_attempt per child, SIGKILL helpers, deliver exits
//! → exit with the latched status
//! ```

mod daemon;
mod pump;
mod registry;
mod shutdown;
mod signals;
mod spawner;
mod terminator;

pub use daemon::Daemon;
pub use signals::{install, SignalState};
