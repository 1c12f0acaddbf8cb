//! Daemon entry point: CLI, privilege drop, host pipe wiring.

use std::ffi::OsString;
use std::os::fd::{FromRawFd, OwnedFd};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::net::unix::pipe;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use procvisor::{drop_privileges, install_signal_intake, Config, Daemon, Privilege, SignalState};

/// Port-side OS process supervisor.
///
/// Started by a controlling host program; speaks a framed term protocol
/// over descriptors 0/1 (or 3/4 with `-n`) and supervises child processes
/// on the host's behalf.
#[derive(Parser, Debug)]
#[command(name = "procvisor", version)]
struct Args {
    /// Use marshalling file descriptors 3 and 4 instead of 0 and 1.
    #[arg(short = 'n')]
    alt_fds: bool,

    /// Seconds to live after receiving SIGTERM/SIGINT before hard-exiting.
    #[arg(long, default_value_t = 12)]
    alarm: u64,

    /// Turn on diagnostic tracing to stderr (1 = debug, 2+ = trace).
    #[arg(long, num_args = 0..=1, default_missing_value = "1")]
    debug: Option<u8>,

    /// If started by root, run as this user.
    #[arg(long)]
    user: Option<String>,

    /// Comma-separated list of users children may be spawned as.
    #[arg(long, value_delimiter = ',')]
    limit_users: Vec<String>,
}

/// Host launchers historically pass single-dash long flags (`-alarm 10`).
/// Map those spellings onto the GNU ones before clap sees them.
fn normalize_args() -> Vec<OsString> {
    std::env::args_os()
        .enumerate()
        .map(|(index, arg)| {
            if index == 0 {
                return arg;
            }
            match arg.to_str() {
                Some("-alarm") => OsString::from("--alarm"),
                Some("-debug") => OsString::from("--debug"),
                Some("-user") => OsString::from("--user"),
                Some("-limit-users") => OsString::from("--limit-users"),
                _ => arg,
            }
        })
        .collect()
}

fn init_tracing(debug: u8) {
    let default = match debug {
        0 => "warn",
        1 => "procvisor=debug",
        _ => "procvisor=trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default)),
        )
        .with_writer(std::io::stderr)
        .init();
}

fn main() {
    let args = Args::parse_from(normalize_args());
    let debug = args.debug.unwrap_or(0);
    init_tracing(debug);

    let cfg = Config {
        use_alt_fds: args.alt_fds,
        alarm: Duration::from_secs(args.alarm),
        debug,
        run_user: args.user,
        limit_users: args.limit_users,
        ..Config::default()
    };

    // Lead our own process group so shutdown can TERM every child at once
    // without ever touching pid -1.
    // SAFETY: plain syscall on our own pid.
    unsafe {
        libc::setpgid(0, 0);
    }

    let privilege = match drop_privileges(&cfg) {
        Ok(privilege) => privilege,
        Err(err) => {
            eprintln!("procvisor: {err}");
            std::process::exit(err.exit_status());
        }
    };

    match run_daemon(cfg, privilege) {
        Ok(status) => std::process::exit(status),
        Err(err) => {
            eprintln!("procvisor: {err:#}");
            std::process::exit(10);
        }
    }
}

fn run_daemon(cfg: Config, privilege: Privilege) -> anyhow::Result<i32> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    runtime.block_on(async move {
        let (read_fd, write_fd) = cfg.host_fds();
        // SAFETY: the launcher hands us these descriptors and nothing else
        // in the process uses them; we take ownership exactly once.
        let read_end = unsafe { OwnedFd::from_raw_fd(read_fd) };
        let write_end = unsafe { OwnedFd::from_raw_fd(write_fd) };
        let reader = pipe::Receiver::from_file(std::fs::File::from(read_end))
            .with_context(|| format!("opening host pipe on fd {read_fd}"))?;
        let writer = pipe::Sender::from_file(std::fs::File::from(write_end))
            .with_context(|| format!("opening host pipe on fd {write_fd}"))?;

        let token = CancellationToken::new();
        let signals = SignalState::new();
        install_signal_intake(token.clone(), signals.clone())
            .context("installing signal handlers")?;

        let daemon = Daemon::new(cfg, privilege, reader, writer, token, signals);
        Ok(daemon.run().await)
    })
}
