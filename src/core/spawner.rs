//! # Spawner: turns validated options into a running, monitored child.
//!
//! Builds a `tokio::process::Command` for `$SHELL -c Cmd`, wires the
//! requested stdio redirections, applies credentials inside the forked
//! child, and starts the per-child worker tasks (output pumps, stdin
//! writer, exit monitor).
//!
//! ## Stdio resolution
//! ```text
//! default  → stdin /dev/null, stdout/stderr inherited
//! pipe     → kept by the daemon (queue or forwarding)
//! null     → /dev/null
//! close    → descriptor closed in the child (pre-exec)
//! stdout   → stderr duplicated onto stdout (pre-exec dup2)
//! stderr   → stdout duplicated onto stderr (pre-exec dup2)
//! file     → opened 0644, truncated or appended
//! ```
//!
//! ## Rules
//! - The forked child applies uid, then gid, then the working directory,
//!   so the `cd` access check runs under the requested credentials; any
//!   pre-exec failure surfaces as a spawn error to the host, nothing
//!   half-started is left behind
//! - A `nice` failure is a warning, not a spawn failure
//! - The caller environment is merged over the daemon's; caller keys win

use std::collections::HashMap;
use std::io;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;

use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::core::pump::{self, StdinHandle};
use crate::error::CommandError;
use crate::events::{ChildEvent, EventSender, OutStream};
use crate::protocol::options::{SpawnOptions, StdioDevice};

/// Everything the registry needs to record a freshly spawned child.
pub(crate) struct ChildParts {
    /// The new pid.
    pub pid: i32,
    /// Stdin queue handle, when stdin was piped.
    pub stdin: Option<StdinHandle>,
    /// Token that cuts off the output pumps.
    pub io_token: CancellationToken,
    /// Task awaiting the exit; reports through the event channel.
    pub monitor: JoinHandle<()>,
}

/// Spawns `$SHELL -c cmd` per `opts` and starts its worker tasks.
///
/// `extra_env` is layered on top of the merged environment; the terminator
/// uses it to hand `CHILD_PID` to kill-command helpers.
pub(crate) fn spawn(
    cmd_text: &str,
    opts: &SpawnOptions,
    cfg: &Config,
    events: &EventSender,
    extra_env: &[(&str, String)],
) -> Result<ChildParts, CommandError> {
    let shell = std::env::var("SHELL")
        .map_err(|_| CommandError::SpawnFailed("SHELL environment variable not set".into()))?;

    let mut command = Command::new(shell);
    command.arg("-c").arg(cmd_text);

    if !opts.env.is_empty() {
        command.env_clear();
        command.envs(merged_env(&opts.env));
    }
    for (key, value) in extra_env {
        command.env(key, value);
    }

    let mut close_fds: Vec<i32> = Vec::new();
    let mut dup2s: Vec<(i32, i32)> = Vec::new();
    configure_stdio(&mut command, opts, &mut close_fds, &mut dup2s)?;

    let uid = opts.user.as_ref().map(|(_, uid)| *uid);
    let gid = opts.group;
    // The working directory changes after the credential drop, so the
    // access check runs against the requested user, not the daemon.
    let cwd = match &opts.cd {
        Some(dir) => Some(std::ffi::CString::new(dir.as_str()).map_err(|_| {
            CommandError::SpawnFailed(format!("Cannot chdir to '{dir}'"))
        })?),
        None => None,
    };
    // SAFETY: the closure runs in the forked child before exec and only
    // performs async-signal-safe syscalls on pre-built arguments.
    unsafe {
        command.pre_exec(move || {
            for fd in &close_fds {
                libc::close(*fd);
            }
            for (src, dst) in &dup2s {
                if libc::dup2(*src, *dst) < 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(uid) = uid {
                if libc::setresuid(uid, uid, uid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(gid) = gid {
                if libc::setgid(gid) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            if let Some(dir) = &cwd {
                if libc::chdir(dir.as_ptr()) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
            Ok(())
        });
    }

    let mut child = command
        .spawn()
        .map_err(|err| CommandError::SpawnFailed(err.to_string()))?;
    let pid = match child.id() {
        Some(pid) => pid as i32,
        None => return Err(CommandError::SpawnFailed("child exited during spawn".into())),
    };
    tracing::debug!(pid, cmd = cmd_text, "started child");

    if let Some(nice) = opts.nice {
        // SAFETY: plain syscall on the new pid.
        let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS as _, pid as _, nice) };
        if rc != 0 {
            tracing::warn!(
                pid,
                nice,
                err = %io::Error::last_os_error(),
                "cannot set priority"
            );
        }
    }

    let io_token = CancellationToken::new();
    let mut pumps = Vec::new();
    if let Some(stdout) = child.stdout.take() {
        pumps.push(pump::spawn_output_pump(
            stdout,
            pid,
            OutStream::Stdout,
            cfg.read_chunk,
            events.clone(),
            io_token.clone(),
        ));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(pump::spawn_output_pump(
            stderr,
            pid,
            OutStream::Stderr,
            cfg.read_chunk,
            events.clone(),
            io_token.clone(),
        ));
    }
    let stdin = child.stdin.take().map(|fd| pump::spawn_stdin_writer(fd, pid));

    let monitor = spawn_monitor(
        child,
        pid,
        pumps,
        io_token.clone(),
        cfg.drain_window,
        events.clone(),
    );

    Ok(ChildParts {
        pid,
        stdin,
        io_token,
        monitor,
    })
}

/// Awaits the exit, lets the output pumps drain, then reports.
///
/// EOF reaches the pumps once the child is gone; a grandchild holding the
/// pipe open only gets the bounded drain window before the descriptors are
/// cut. The `Exited` event is sent strictly after both pumps stop, which is
/// what keeps trailing output ahead of the exit notification.
fn spawn_monitor(
    mut child: Child,
    pid: i32,
    pumps: Vec<JoinHandle<()>>,
    io_token: CancellationToken,
    drain_window: std::time::Duration,
    events: EventSender,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let status = match child.wait().await {
            Ok(status) => status.into_raw(),
            Err(err) => {
                tracing::error!(pid, %err, "wait on child failed");
                -1
            }
        };
        let aborts: Vec<_> = pumps.iter().map(|handle| handle.abort_handle()).collect();
        let drain = futures::future::join_all(pumps);
        if tokio::time::timeout(drain_window, drain).await.is_err() {
            tracing::debug!(pid, "drain window elapsed, cutting output pumps");
            for handle in aborts {
                handle.abort();
            }
        }
        io_token.cancel();
        let _ = events.send(ChildEvent::Exited { pid, status }).await;
    })
}

/// Maps each stream device onto `Stdio` plus pre-exec work.
fn configure_stdio(
    command: &mut Command,
    opts: &SpawnOptions,
    close_fds: &mut Vec<i32>,
    dup2s: &mut Vec<(i32, i32)>,
) -> Result<(), CommandError> {
    const STREAMS: [&str; 3] = ["stdin", "stdout", "stderr"];

    for (fd, device) in opts.stdio.iter().enumerate() {
        let stdio = match device {
            StdioDevice::Default => {
                if fd == 0 {
                    Stdio::null()
                } else {
                    Stdio::inherit()
                }
            }
            StdioDevice::Pipe => Stdio::piped(),
            StdioDevice::Null => Stdio::null(),
            StdioDevice::Close => {
                close_fds.push(fd as i32);
                Stdio::inherit()
            }
            StdioDevice::ToStdout => {
                dup2s.push((1, 2));
                Stdio::inherit()
            }
            StdioDevice::ToStderr => {
                dup2s.push((2, 1));
                Stdio::inherit()
            }
            StdioDevice::File { path, append } => {
                let file = open_redirect_file(fd, path, *append).map_err(|err| {
                    CommandError::SpawnFailed(format!(
                        "Failed to redirect {} to file: {err}",
                        STREAMS[fd]
                    ))
                })?;
                Stdio::from(file)
            }
        };
        match fd {
            0 => command.stdin(stdio),
            1 => command.stdout(stdio),
            _ => command.stderr(stdio),
        };
    }
    Ok(())
}

fn open_redirect_file(fd: usize, path: &str, append: bool) -> io::Result<std::fs::File> {
    if fd == 0 {
        return std::fs::File::open(path);
    }
    std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .append(append)
        .truncate(!append)
        .mode(0o644)
        .open(path)
}

/// Merges caller-provided entries over the daemon's environment.
///
/// Caller keys win; every other inherited key is preserved. `"K=V"` strings
/// and `{K, V}` tuples arrive here already split, so both spellings produce
/// the same map.
fn merged_env(overrides: &[(String, String)]) -> HashMap<String, String> {
    let mut env: HashMap<String, String> = std::env::vars().collect();
    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }
    env
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn test_cfg() -> Config {
        Config {
            drain_window: Duration::from_millis(500),
            ..Config::default()
        }
    }

    fn ensure_shell() {
        if std::env::var("SHELL").is_err() {
            std::env::set_var("SHELL", "/bin/sh");
        }
    }

    #[test]
    fn merged_env_prefers_caller_entries() {
        std::env::set_var("PROCVISOR_TEST_KEEP", "inherited");
        let merged = merged_env(&[("PROCVISOR_TEST_KEEP".into(), "override".into())]);
        assert_eq!(merged["PROCVISOR_TEST_KEEP"], "override");
        assert!(merged.contains_key("PATH"));
    }

    #[tokio::test]
    async fn spawn_pipes_output_and_reports_exit_last() {
        ensure_shell();
        let cfg = test_cfg();
        let (events_tx, mut events_rx) = crate::events::channel(64);
        let mut opts = SpawnOptions::with_kill_timeout(Duration::from_secs(5));
        opts.stdio[1] = StdioDevice::Pipe;

        let parts = spawn("echo hi", &opts, &cfg, &events_tx, &[]).unwrap();
        assert!(parts.pid > 0);

        let mut output = Vec::new();
        loop {
            match events_rx.recv().await.unwrap() {
                ChildEvent::Output { data, .. } => output.extend_from_slice(&data),
                ChildEvent::Exited { pid, status } => {
                    assert_eq!(pid, parts.pid);
                    assert_eq!(status, 0);
                    break;
                }
            }
        }
        assert_eq!(output, b"hi\n");
    }

    #[tokio::test]
    async fn spawn_reports_signal_exits_in_the_raw_status() {
        ensure_shell();
        let cfg = test_cfg();
        let (events_tx, mut events_rx) = crate::events::channel(64);
        let opts = SpawnOptions::with_kill_timeout(Duration::from_secs(5));

        let parts = spawn("kill -9 $$", &opts, &cfg, &events_tx, &[]).unwrap();
        loop {
            if let ChildEvent::Exited { pid, status } = events_rx.recv().await.unwrap() {
                assert_eq!(pid, parts.pid);
                assert_eq!(status & 0x7f, 9);
                break;
            }
        }
    }

    #[tokio::test]
    async fn extra_env_reaches_the_child() {
        ensure_shell();
        let cfg = test_cfg();
        let (events_tx, mut events_rx) = crate::events::channel(64);
        let mut opts = SpawnOptions::with_kill_timeout(Duration::from_secs(5));
        opts.stdio[1] = StdioDevice::Pipe;

        spawn(
            "echo $CHILD_PID",
            &opts,
            &cfg,
            &events_tx,
            &[("CHILD_PID", "1234".into())],
        )
        .unwrap();

        let mut output = Vec::new();
        loop {
            match events_rx.recv().await.unwrap() {
                ChildEvent::Output { data, .. } => output.extend_from_slice(&data),
                ChildEvent::Exited { .. } => break,
            }
        }
        assert_eq!(output, b"1234\n");
    }

    #[tokio::test]
    async fn env_option_merges_over_the_daemon_environment() {
        ensure_shell();
        let cfg = test_cfg();
        let (events_tx, mut events_rx) = crate::events::channel(64);
        let mut opts = SpawnOptions::with_kill_timeout(Duration::from_secs(5));
        opts.stdio[1] = StdioDevice::Pipe;
        opts.env = vec![("PV_MARK".into(), "42".into())];

        spawn("echo $PV_MARK:$HOME", &opts, &cfg, &events_tx, &[]).unwrap();

        let mut output = Vec::new();
        loop {
            match events_rx.recv().await.unwrap() {
                ChildEvent::Output { data, .. } => output.extend_from_slice(&data),
                ChildEvent::Exited { .. } => break,
            }
        }
        let text = String::from_utf8(output).unwrap();
        assert!(text.starts_with("42:"));
    }
}
