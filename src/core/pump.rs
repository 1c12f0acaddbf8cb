//! # Stdio pump: per-child pipe I/O workers.
//!
//! Each piped stream of a child gets its own small task:
//!
//! - **Output pumps** (stdout/stderr) read chunks and forward them to the
//!   event loop, which frames them for the host.
//! - **Stdin writer** drains a queue of buffers into the child's stdin.
//!
//! ```text
//! {stdin, Pid, Data} ─► queue ─► stdin writer ─► child fd 0
//! child fd 1 ─► stdout pump ─► ChildEvent::Output ─► host
//! child fd 2 ─► stderr pump ─► ChildEvent::Output ─► host
//! ```
//!
//! ## Rules
//! - Chunks are at most `Config::read_chunk` bytes; every chunk crosses an
//!   await point, so one chatty child cannot starve the loop
//! - EOF or a read error closes the pump (and with it the descriptor)
//! - A write error closes stdin and discards the remaining queue
//! - The per-child cancellation token cuts pumps off when a record is torn
//!   down or the post-exit drain window ends

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::events::{ChildEvent, EventSender, OutStream};

/// Handle to a child's stdin writer task.
#[derive(Debug)]
pub(crate) struct StdinHandle {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    task: JoinHandle<()>,
}

impl StdinHandle {
    /// Queues one buffer. Returns false once the writer has closed.
    pub fn push(&self, data: Vec<u8>) -> bool {
        self.tx.send(data).is_ok()
    }

    /// Drops the queue and closes the descriptor immediately.
    pub fn close(self) {
        self.task.abort();
    }
}

/// Spawns the writer task that drains the stdin queue into the child.
pub(crate) fn spawn_stdin_writer(mut stdin: ChildStdin, pid: i32) -> StdinHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let task = tokio::spawn(async move {
        while let Some(buf) = rx.recv().await {
            if let Err(err) = stdin.write_all(&buf).await {
                tracing::debug!(pid, %err, "stdin write failed, closing");
                return; // drops stdin: fd closes, queue is discarded
            }
        }
        // Queue sender gone: close stdin so the child sees EOF.
    });
    StdinHandle { tx, task }
}

/// Spawns an output pump forwarding `reader` to the event loop.
pub(crate) fn spawn_output_pump<R>(
    reader: R,
    pid: i32,
    stream: OutStream,
    chunk_size: usize,
    events: EventSender,
    token: CancellationToken,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(pump_output(reader, pid, stream, chunk_size, events, token))
}

async fn pump_output<R>(
    mut reader: R,
    pid: i32,
    stream: OutStream,
    chunk_size: usize,
    events: EventSender,
    token: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    loop {
        tokio::select! {
            res = reader.read(&mut buf) => match res {
                Ok(0) => break, // EOF: child closed its end
                Ok(n) => {
                    let event = ChildEvent::Output {
                        pid,
                        stream,
                        data: Bytes::copy_from_slice(&buf[..n]),
                    };
                    if events.send(event).await.is_err() {
                        break;
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    tracing::debug!(pid, stream = stream.as_atom(), %err, "output read failed");
                    break;
                }
            },
            _ = token.cancelled() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_is_chunked_and_ordered() {
        let (events_tx, mut events_rx) = crate::events::channel(16);
        let (mut writer, reader) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let pump = spawn_output_pump(reader, 9, OutStream::Stdout, 4, events_tx, token);

        use tokio::io::AsyncWriteExt;
        writer.write_all(b"abcdefgh").await.unwrap();
        drop(writer); // EOF

        let mut collected = Vec::new();
        while let Some(ChildEvent::Output { pid, data, .. }) = events_rx.recv().await {
            assert_eq!(pid, 9);
            assert!(data.len() <= 4);
            collected.extend_from_slice(&data);
        }
        assert_eq!(collected, b"abcdefgh");
        pump.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_stops_an_idle_pump() {
        let (events_tx, _events_rx) = crate::events::channel(16);
        let (_writer, reader) = tokio::io::duplex(64);
        let token = CancellationToken::new();
        let pump = spawn_output_pump(reader, 9, OutStream::Stderr, 4096, events_tx, token.clone());

        token.cancel();
        pump.await.unwrap();
    }
}
