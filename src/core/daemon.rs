//! # Daemon: the owning context and its event loop.
//!
//! The [`Daemon`] owns every piece of mutable state — the framed host pipe,
//! the child registry, the latched exit status — and runs the single loop
//! that interleaves host commands, child events, signals, and escalation
//! deadlines.
//!
//! ## Architecture
//! ```text
//! host pipe ──► FrameReader ──┐
//! pump/monitor tasks ──mpsc──►┼──► Daemon::run()
//! signal task ──token────────►┤      │
//! deadline/idle timer ───────►┘      ├──► dispatch one command
//!                                    ├──► forward output / deliver exit
//!                                    ├──► escalation + liveness tick
//!                                    └──► break → finalize()
//!
//! finalize():  arm alarm ─► group SIGTERM ─► drain ≤ 6s ─► exit status
//! ```
//!
//! ## Rules
//! - Commands are served in pipe order, exactly one per loop pass
//! - Replies echo the request's transaction id; notifications carry id 0
//! - A child's output events all precede its exit event (monitor contract)
//! - The loop never sleeps past the nearest escalation deadline, nor past
//!   the idle tick that drives adopted-process liveness probes
//! - Any host write failure invalidates the pipe and ends the loop

use std::io;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use nix::errno::Errno;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::registry::{ChildRecord, Registry};
use crate::core::signals::SignalState;
use crate::core::terminator::{self, StopCtx};
use crate::core::{shutdown, spawner};
use crate::error::{CommandError, DaemonError};
use crate::events::{self, ChildEvent, EventReceiver, EventSender};
use crate::privilege::Privilege;
use crate::protocol::command::{self, Command};
use crate::protocol::frame::{FrameReader, FrameWriter};

/// Raw status reported when a liveness probe, not the kernel, detected the
/// death (adopted processes cannot be reaped).
const PROBE_STATUS: i32 = -1;

/// The process supervisor daemon.
///
/// Generic over the host transport so the whole protocol surface can be
/// driven end-to-end through in-memory pipes in tests.
pub struct Daemon<R, W> {
    cfg: Config,
    privilege: Privilege,
    reader: FrameReader<R>,
    writer: FrameWriter<W>,
    registry: Registry,
    events_tx: EventSender,
    events_rx: EventReceiver,
    token: CancellationToken,
    signals: Arc<SignalState>,
    pipe_valid: bool,
    status: i32,
}

impl<R, W> Daemon<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Builds a daemon over the given host transport.
    ///
    /// `token` is cancelled by the signal intake (or by an embedding test);
    /// `signals` carries the latched termination facts.
    pub fn new(
        cfg: Config,
        privilege: Privilege,
        reader: R,
        writer: W,
        token: CancellationToken,
        signals: Arc<SignalState>,
    ) -> Self {
        let (events_tx, events_rx) = events::channel(cfg.event_capacity);
        Self {
            cfg,
            privilege,
            reader: FrameReader::new(reader),
            writer: FrameWriter::new(writer),
            registry: Registry::new(),
            events_tx,
            events_rx,
            token,
            signals,
            pipe_valid: true,
            status: 0,
        }
    }

    /// Runs until shutdown, then sequences termination of every child.
    ///
    /// Returns the exit status the process should end with.
    pub async fn run(mut self) -> i32 {
        loop {
            let wake = self.next_wake();
            tokio::select! {
                biased;
                _ = self.token.cancelled() => {
                    self.status = self.signals.latched();
                    break;
                }
                frame = self.reader.next() => {
                    if self.handle_frame(frame).await.is_break() {
                        break;
                    }
                }
                Some(event) = self.events_rx.recv() => {
                    if self.handle_event(event).await.is_break() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(wake) => {
                    if self.tick().await.is_break() {
                        break;
                    }
                }
            }
        }
        self.finalize().await
    }

    /// Never sleep past the nearest escalation deadline or the idle tick.
    fn next_wake(&self) -> Instant {
        let tick = Instant::now() + self.cfg.kill_timeout;
        match self.registry.nearest_deadline() {
            Some(deadline) => deadline.min(tick),
            None => tick,
        }
    }

    // ---- Host frames ----

    async fn handle_frame(&mut self, frame: io::Result<Option<Bytes>>) -> ControlFlow<()> {
        let payload = match frame {
            Ok(Some(payload)) => payload,
            Ok(None) => {
                tracing::debug!("host closed the pipe");
                self.pipe_valid = false;
                return self.fatal(DaemonError::PipeLost(io::ErrorKind::UnexpectedEof.into()));
            }
            Err(err) => {
                self.pipe_valid = false;
                return self.fatal(DaemonError::PipeLost(err));
            }
        };
        let request =
            match command::decode_request(&payload, &self.privilege, self.cfg.kill_timeout) {
                Ok(request) => request,
                Err(fatal) => return self.fatal(fatal),
            };
        match request.body {
            Ok(cmd) => self.handle_command(request.trans_id, cmd).await,
            Err(err) => {
                tracing::debug!(label = err.as_label(), "rejecting command");
                self.send_reply(command::error_reply(request.trans_id, &err))
                    .await
            }
        }
    }

    /// Latches the exit status and breaks the loop. Whether the pipe is
    /// still usable for shutdown notifications is the caller's call.
    fn fatal(&mut self, err: DaemonError) -> ControlFlow<()> {
        tracing::warn!(label = err.as_label(), %err, "fatal daemon condition");
        self.status = err.exit_status();
        ControlFlow::Break(())
    }

    async fn handle_command(&mut self, trans_id: i64, cmd: Command) -> ControlFlow<()> {
        match cmd {
            Command::Shutdown => {
                self.status = 0;
                ControlFlow::Break(())
            }
            Command::Manage { pid, opts } => {
                self.registry.insert(ChildRecord::adopted(
                    pid,
                    opts.kill_cmd.clone(),
                    opts.kill_timeout,
                ));
                self.send_reply(command::ok_pid_reply(trans_id, pid)).await
            }
            Command::Run { cmd, opts } => {
                match spawner::spawn(&cmd, &opts, &self.cfg, &self.events_tx, &[]) {
                    Ok(parts) => {
                        let pid = parts.pid;
                        self.registry.insert(ChildRecord::spawned(
                            pid,
                            cmd,
                            opts.kill_cmd.clone(),
                            opts.kill_timeout,
                            parts.stdin,
                            parts.io_token,
                            parts.monitor,
                        ));
                        self.send_reply(command::ok_pid_reply(trans_id, pid)).await
                    }
                    Err(err) => self.send_reply(command::error_reply(trans_id, &err)).await,
                }
            }
            Command::Stop { pid } => {
                let now = Instant::now();
                let reply = {
                    let ctx = StopCtx {
                        cfg: &self.cfg,
                        events: &self.events_tx,
                    };
                    terminator::stop_by_pid(&mut self.registry, pid, now, &ctx)
                };
                match reply {
                    Some(Ok(())) => self.send_reply(command::ok_reply(trans_id)).await,
                    Some(Err(err)) => {
                        self.send_reply(command::error_reply(trans_id, &err)).await
                    }
                    None => ControlFlow::Continue(()),
                }
            }
            Command::Kill { pid, signal } => {
                if self.privilege.superuser() && !self.registry.contains(pid) {
                    let err = CommandError::Privilege(
                        "Cannot kill a pid not managed by this application".into(),
                    );
                    return self.send_reply(command::error_reply(trans_id, &err)).await;
                }
                match terminator::send_signal(pid, signal) {
                    Ok(()) => self.send_reply(command::ok_reply(trans_id)).await,
                    Err(errno) => {
                        let err = terminator::map_kill_error(signal, errno);
                        self.send_reply(command::error_reply(trans_id, &err)).await
                    }
                }
            }
            Command::List => {
                self.send_reply(command::pid_list_reply(trans_id, &self.registry.pids()))
                    .await
            }
            Command::Stdin { pid, data } => {
                match self.registry.get_mut(pid) {
                    Some(record) => record.queue_stdin(data),
                    None => {
                        tracing::debug!(pid, len = data.len(), "stdin for unknown pid dropped");
                    }
                }
                ControlFlow::Continue(())
            }
        }
    }

    // ---- Child events ----

    async fn handle_event(&mut self, event: ChildEvent) -> ControlFlow<()> {
        match event {
            ChildEvent::Output { pid, stream, data } => {
                if self.registry.contains(pid) {
                    self.send_notification(command::output_message(stream, pid, &data))
                        .await
                } else {
                    ControlFlow::Continue(())
                }
            }
            ChildEvent::Exited { pid, status } => self.deliver_exit(pid, status).await,
        }
    }

    /// Delivers one exit: children get an `exit_status` message, helpers
    /// are swallowed, strangers are discarded.
    async fn deliver_exit(&mut self, pid: i32, status: i32) -> ControlFlow<()> {
        if let Some(record) = self.registry.remove(pid) {
            // Termination requested through us reports as a clean exit.
            let status = if record.sigterm_sent { 0 } else { status };
            record.teardown();
            tracing::debug!(pid, status, "child exited");
            return self
                .send_notification(command::exit_status_message(pid, status))
                .await;
        }
        if let Some(child) = self.registry.take_helper(pid) {
            tracing::debug!(helper = pid, child, "kill helper finished");
            if let Some(record) = self.registry.get_mut(child) {
                if record.kill_helper == Some(pid) {
                    record.kill_helper = None;
                }
            }
        } else {
            tracing::debug!(pid, "discarding exit of unknown pid");
        }
        ControlFlow::Continue(())
    }

    // ---- Timer ----

    /// Escalation deadlines plus the adopted-process liveness probe.
    async fn tick(&mut self) -> ControlFlow<()> {
        let now = Instant::now();
        {
            let ctx = StopCtx {
                cfg: &self.cfg,
                events: &self.events_tx,
            };
            terminator::check_deadlines(&mut self.registry, now, &ctx);
        }
        self.probe_managed().await
    }

    /// Adopted pids cannot be reaped; ESRCH from the probe is their exit.
    async fn probe_managed(&mut self) -> ControlFlow<()> {
        for pid in self.registry.managed_pids() {
            if terminator::probe(pid) == Err(Errno::ESRCH)
                && self.deliver_exit(pid, PROBE_STATUS).await.is_break()
            {
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    // ---- Host writes ----

    async fn send_reply(&mut self, payload: Vec<u8>) -> ControlFlow<()> {
        self.send_host(payload, 13).await
    }

    async fn send_notification(&mut self, payload: Vec<u8>) -> ControlFlow<()> {
        self.send_host(payload, 1).await
    }

    async fn send_host(&mut self, payload: Vec<u8>, fail_status: i32) -> ControlFlow<()> {
        if !self.pipe_valid {
            return ControlFlow::Continue(());
        }
        match self.writer.send(&payload).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                tracing::warn!(%err, "host write failed");
                self.pipe_valid = false;
                self.status = fail_status;
                ControlFlow::Break(())
            }
        }
    }

    // ---- Shutdown ----

    /// Kills every remaining child within the grace window, then returns
    /// the latched exit status.
    async fn finalize(mut self) -> i32 {
        if self.signals.pipe_broken() {
            self.pipe_valid = false;
        }
        let status = self.status;
        tracing::debug!(status, alarm = ?self.cfg.alarm, "shutting down");

        let _alarm = shutdown::arm_alarm(self.cfg.alarm, status);
        shutdown::terminate_process_group();

        let deadline = Instant::now() + shutdown::SHUTDOWN_GRACE;
        while !self.registry.is_empty() && Instant::now() < deadline {
            let now = Instant::now();
            {
                let ctx = StopCtx {
                    cfg: &self.cfg,
                    events: &self.events_tx,
                };
                for pid in self.registry.pids() {
                    let _ = terminator::stop_attempt(&mut self.registry, pid, now, &ctx);
                }
            }
            for helper in self.registry.helper_pids() {
                let _ = terminator::send_signal(helper, libc::SIGKILL);
            }
            let _ = self.probe_managed().await;

            match tokio::time::timeout(Duration::from_millis(200), self.events_rx.recv()).await
            {
                Ok(Some(event)) => {
                    let _ = self.handle_event(event).await;
                }
                Ok(None) => break,
                Err(_) => {}
            }
        }
        if !self.registry.is_empty() {
            tracing::warn!(stuck = ?self.registry.pids(), "children survived the shutdown grace");
        }
        tracing::debug!(status, "exiting");
        status
    }
}
