//! # Child events delivered to the event loop.
//!
//! Pump and monitor tasks are the only other writers in the system; they
//! hand everything to the loop through one bounded mpsc channel. The loop is
//! the sole consumer and the sole owner of mutable state, so ordering per
//! child falls out of channel FIFO plus one rule: a child's monitor sends
//! [`ChildEvent::Exited`] only after its output pumps have finished.
//!
//! ```text
//! stdout pump ──┐
//! stderr pump ──┼──► mpsc ──► Daemon loop ──► framed host pipe
//! monitor     ──┘
//! ```

use bytes::Bytes;
use tokio::sync::mpsc;

/// Which output stream a chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutStream {
    /// Child stdout.
    Stdout,
    /// Child stderr.
    Stderr,
}

impl OutStream {
    /// Protocol atom for this stream.
    pub fn as_atom(&self) -> &'static str {
        match self {
            OutStream::Stdout => "stdout",
            OutStream::Stderr => "stderr",
        }
    }
}

/// One event from a child's worker tasks.
#[derive(Debug)]
pub enum ChildEvent {
    /// A chunk read from the child's stdout or stderr.
    Output {
        /// Child pid.
        pid: i32,
        /// Which stream produced the chunk.
        stream: OutStream,
        /// The bytes read (never empty).
        data: Bytes,
    },
    /// The child (or a kill helper) was reaped.
    ///
    /// Sent after both output pumps have drained, so every `Output` for
    /// this pid precedes it in the channel.
    Exited {
        /// Child or helper pid.
        pid: i32,
        /// Raw wait status word.
        status: i32,
    },
}

/// Sending side handed to every pump and monitor task.
pub type EventSender = mpsc::Sender<ChildEvent>;

/// Receiving side owned by the event loop.
pub type EventReceiver = mpsc::Receiver<ChildEvent>;

/// Creates the child-event channel.
pub fn channel(capacity: usize) -> (EventSender, EventReceiver) {
    mpsc::channel(capacity.max(1))
}
