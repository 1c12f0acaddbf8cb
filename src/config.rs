//! # Global runtime configuration.
//!
//! Provides [`Config`] centralized settings for the daemon runtime.
//!
//! Config is assembled once in `main` from the command line and then shared
//! read-only by every component: the event loop, the spawner, the stdio
//! pumps, and the shutdown sequencer.
//!
//! ## Sentinel values
//! - `debug = 0` → only warnings reach stderr
//! - `kill_timeout` doubles as the event-loop idle tick: the loop never
//!   sleeps longer than this, so per-child deadlines and adopted-process
//!   liveness are re-checked at least that often.

use std::time::Duration;

/// Global configuration for the daemon runtime.
///
/// Defines:
/// - **Host transport**: which descriptor pair carries the framed protocol
/// - **Shutdown behavior**: alarm budget after a terminating signal
/// - **Termination defaults**: per-child grace before SIGKILL
/// - **Stdio pumping**: chunk size and post-exit drain window
/// - **Privilege**: the drop target user and the spawn-user allow-list
#[derive(Clone, Debug)]
pub struct Config {
    /// Use descriptors 3/4 for the host pipe instead of 0/1.
    pub use_alt_fds: bool,

    /// Seconds the daemon may live after a terminating signal before the
    /// hard-exit alarm fires.
    pub alarm: Duration,

    /// Diagnostic verbosity on stderr (`0` = warnings, `1` = debug,
    /// `2+` = trace).
    pub debug: u8,

    /// User to drop to when started as root (`-user`).
    pub run_user: Option<String>,

    /// When non-empty, the only user names children may be spawned as.
    pub limit_users: Vec<String>,

    /// Default grace between the first stop attempt and SIGKILL.
    ///
    /// Also bounds the event loop's sleep, so escalation deadlines are
    /// observed even on an otherwise idle daemon.
    pub kill_timeout: Duration,

    /// Maximum bytes read from a child's stdout/stderr per chunk.
    pub read_chunk: usize,

    /// How long to wait for trailing child output after an exit before the
    /// output descriptors are force-closed.
    pub drain_window: Duration,

    /// Capacity of the child-event channel between pump tasks and the loop.
    pub event_capacity: usize,
}

impl Config {
    /// Descriptor pair carrying the framed host protocol.
    #[inline]
    pub fn host_fds(&self) -> (i32, i32) {
        if self.use_alt_fds { (3, 4) } else { (0, 1) }
    }
}

impl Default for Config {
    /// Default configuration:
    ///
    /// - `use_alt_fds = false` (frame over stdin/stdout)
    /// - `alarm = 12s` (post-signal lifetime budget)
    /// - `debug = 0` (warnings only)
    /// - `kill_timeout = 5s` (grace before SIGKILL, and the loop tick)
    /// - `read_chunk = 4096`
    /// - `drain_window = 500ms`
    /// - `event_capacity = 1024`
    fn default() -> Self {
        Self {
            use_alt_fds: false,
            alarm: Duration::from_secs(12),
            debug: 0,
            run_user: None,
            limit_users: Vec::new(),
            kill_timeout: Duration::from_secs(5),
            read_chunk: 4096,
            drain_window: Duration::from_millis(500),
            event_capacity: 1024,
        }
    }
}
