//! # Child registry: the authoritative map of managed processes.
//!
//! One [`ChildRecord`] per managed pid, plus a secondary index for the
//! short-lived helpers running custom kill commands. The registry is owned
//! by the event loop; worker tasks never touch it.
//!
//! ## Rules
//! - A pid is present iff its exit has not yet been delivered to the host
//! - Records are removed in exactly two places: exit delivery, and the
//!   abandoned-zombie path when both SIGTERM and SIGKILL fail
//! - A helper index entry exists iff the helper is alive; helper exits are
//!   swallowed, never reported
//! - `sigkill_sent` implies `sigterm_sent` (escalation is monotonic)

use std::collections::HashMap;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::core::pump::StdinHandle;

/// Run-time state of one managed child process.
#[derive(Debug)]
pub(crate) struct ChildRecord {
    /// OS pid.
    pub pid: i32,
    /// Original command text (documentation only).
    pub command: String,
    /// True when the pid was adopted rather than spawned.
    pub managed: bool,
    /// Custom kill command run instead of the first SIGTERM.
    pub kill_cmd: Option<String>,
    /// Pid of the live kill-command helper, if one is running.
    pub kill_helper: Option<i32>,
    /// Grace between the first stop attempt and SIGKILL.
    pub kill_timeout: Duration,
    /// SIGTERM (or the kill command) has been issued.
    pub sigterm_sent: bool,
    /// SIGKILL has been issued. Implies `sigterm_sent`.
    pub sigkill_sent: bool,
    /// When the next escalation step fires. Unset before any stop attempt.
    pub deadline: Option<Instant>,
    /// Queue handle for the child's piped stdin.
    pub stdin: Option<StdinHandle>,
    /// Cancels lingering output pumps when the record is torn down.
    io_token: CancellationToken,
    /// The task awaiting the child's exit.
    monitor: Option<JoinHandle<()>>,
}

impl ChildRecord {
    /// Record for a process we forked ourselves.
    pub fn spawned(
        pid: i32,
        command: String,
        kill_cmd: Option<String>,
        kill_timeout: Duration,
        stdin: Option<StdinHandle>,
        io_token: CancellationToken,
        monitor: JoinHandle<()>,
    ) -> Self {
        Self {
            pid,
            command,
            managed: false,
            kill_cmd,
            kill_helper: None,
            kill_timeout,
            sigterm_sent: false,
            sigkill_sent: false,
            deadline: None,
            stdin,
            io_token,
            monitor: Some(monitor),
        }
    }

    /// Record for an externally started process we merely adopt.
    ///
    /// Adopted pids have no stdio to pump and nothing to reap; liveness is
    /// probed by the event loop.
    pub fn adopted(pid: i32, kill_cmd: Option<String>, kill_timeout: Duration) -> Self {
        Self {
            pid,
            command: "managed pid".into(),
            managed: true,
            kill_cmd,
            kill_helper: None,
            kill_timeout,
            sigterm_sent: false,
            sigkill_sent: false,
            deadline: None,
            stdin: None,
            io_token: CancellationToken::new(),
            monitor: None,
        }
    }

    /// Queues bytes for the child's stdin.
    ///
    /// Silently drops the payload when stdin was never piped or the writer
    /// already closed on error.
    pub fn queue_stdin(&mut self, data: Vec<u8>) {
        match &self.stdin {
            Some(handle) if handle.push(data) => {}
            Some(_) => {
                tracing::debug!(pid = self.pid, "stdin writer gone, dropping payload");
                self.stdin = None;
            }
            None => {
                tracing::debug!(pid = self.pid, "no stdin pipe, dropping payload");
            }
        }
    }

    /// Stops every worker task and closes the remaining descriptors.
    pub fn teardown(mut self) {
        self.io_token.cancel();
        if let Some(handle) = self.stdin.take() {
            handle.close();
        }
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
    }
}

/// Book-keeping for one live kill-command helper.
#[derive(Debug)]
pub(crate) struct HelperRecord {
    /// The child this helper is trying to kill.
    pub child: i32,
    monitor: JoinHandle<()>,
}

/// Authoritative mapping of managed children and kill helpers.
#[derive(Debug, Default)]
pub(crate) struct Registry {
    children: HashMap<i32, ChildRecord>,
    helpers: HashMap<i32, HelperRecord>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a record, tearing down any stale record at the same pid.
    pub fn insert(&mut self, record: ChildRecord) {
        if let Some(stale) = self.children.insert(record.pid, record) {
            tracing::debug!(pid = stale.pid, "replacing stale child record");
            stale.teardown();
        }
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn get_mut(&mut self, pid: i32) -> Option<&mut ChildRecord> {
        self.children.get_mut(&pid)
    }

    /// Removes a record; the caller decides whether an exit is reported.
    pub fn remove(&mut self, pid: i32) -> Option<ChildRecord> {
        self.children.remove(&pid)
    }

    /// Sorted pids, the `{list}` reply.
    pub fn pids(&self) -> Vec<i32> {
        let mut pids: Vec<i32> = self.children.keys().copied().collect();
        pids.sort_unstable();
        pids
    }

    /// Pids of adopted children, for the liveness probe pass.
    pub fn managed_pids(&self) -> Vec<i32> {
        self.children
            .values()
            .filter(|record| record.managed)
            .map(|record| record.pid)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Earliest pending escalation deadline, bounding the loop's sleep.
    pub fn nearest_deadline(&self) -> Option<Instant> {
        self.children
            .values()
            .filter(|record| !record.sigkill_sent)
            .filter_map(|record| record.deadline)
            .min()
    }

    /// Pids whose escalation deadline has passed.
    pub fn due_for_escalation(&self, now: Instant) -> Vec<i32> {
        self.children
            .values()
            .filter(|record| !record.sigkill_sent)
            .filter(|record| record.deadline.is_some_and(|deadline| now >= deadline))
            .map(|record| record.pid)
            .collect()
    }

    /// Registers a live kill helper for `child`.
    pub fn register_helper(&mut self, helper: i32, child: i32, monitor: JoinHandle<()>) {
        self.helpers.insert(helper, HelperRecord { child, monitor });
    }

    /// Claims a helper exit; returns the child it belonged to.
    pub fn take_helper(&mut self, helper: i32) -> Option<i32> {
        self.helpers.remove(&helper).map(|record| {
            record.monitor.abort();
            record.child
        })
    }

    /// Pids of all live helpers.
    pub fn helper_pids(&self) -> Vec<i32> {
        self.helpers.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adopted(pid: i32) -> ChildRecord {
        ChildRecord::adopted(pid, None, Duration::from_secs(5))
    }

    #[test]
    fn list_is_sorted() {
        let mut registry = Registry::new();
        for pid in [30, 10, 20] {
            registry.insert(adopted(pid));
        }
        assert_eq!(registry.pids(), vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn nearest_deadline_ignores_killed_children() {
        let mut registry = Registry::new();
        let now = Instant::now();

        let mut early = adopted(1);
        early.sigterm_sent = true;
        early.sigkill_sent = true;
        early.deadline = Some(now);
        registry.insert(early);

        let mut late = adopted(2);
        late.sigterm_sent = true;
        late.deadline = Some(now + Duration::from_secs(3));
        registry.insert(late);

        assert_eq!(
            registry.nearest_deadline(),
            Some(now + Duration::from_secs(3))
        );
        assert_eq!(
            registry.due_for_escalation(now + Duration::from_secs(4)),
            vec![2]
        );
    }

    #[tokio::test]
    async fn helper_exits_resolve_to_their_child() {
        let mut registry = Registry::new();
        registry.insert(adopted(100));
        let monitor = tokio::spawn(async {});
        registry.register_helper(4242, 100, monitor);
        assert_eq!(registry.take_helper(4242), Some(100));
        assert_eq!(registry.take_helper(4242), None);
    }
}
