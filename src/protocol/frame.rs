//! # Length-prefixed framing over the host pipe.
//!
//! Every message travels as a 2-byte big-endian length followed by the term
//! payload. [`FrameReader`] is a cancellation-safe state machine: it can sit
//! in a `tokio::select!` branch and never lose a partially accumulated
//! frame. [`FrameWriter`] writes a whole frame and flushes; writes happen
//! from the event loop's dispatch arms, never inside a race, so no write
//! state machine is needed.
//!
//! ## EOF semantics
//! - EOF on a frame boundary → `Ok(None)` (host closed cleanly)
//! - EOF mid-frame → `UnexpectedEof` error

use std::io;
use std::mem::take;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const HEADER_LEN: usize = 2;

/// Reads length-prefixed frames from the host pipe.
pub struct FrameReader<R> {
    reader: R,
    state: ReadState,
}

enum ReadState {
    /// Accumulating the 2-byte length prefix.
    Header { buf: BytesMut }, // buf.len() <= 2
    /// Accumulating a body of exactly `len` bytes.
    Body { len: usize, buf: BytesMut }, // buf.len() <= len
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    /// Creates a framer over `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            state: ReadState::Header {
                buf: BytesMut::with_capacity(HEADER_LEN),
            },
        }
    }

    /// Reads the next frame.
    ///
    /// Cancellation safe: when used in a `tokio::select!` branch, dropping
    /// the future preserves all accumulated bytes, so no frame is ever torn.
    pub async fn next(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            match &mut self.state {
                ReadState::Header { buf } if buf.len() < HEADER_LEN => {
                    let n = self.reader.read_buf(buf).await?;
                    if n == 0 {
                        if buf.is_empty() {
                            // Ended on a frame boundary: clean end of stream.
                            return Ok(None);
                        }
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                }
                ReadState::Header { buf } => {
                    let len = buf.get_u16() as usize;
                    self.state = ReadState::Body {
                        len,
                        buf: BytesMut::with_capacity(len),
                    };
                }
                ReadState::Body { len, buf } if buf.len() < *len => {
                    let n = self.reader.read_buf(buf).await?;
                    if n == 0 {
                        return Err(io::ErrorKind::UnexpectedEof.into());
                    }
                }
                ReadState::Body { buf, .. } => {
                    let frame = take(buf).freeze();
                    self.state = ReadState::Header {
                        buf: BytesMut::with_capacity(HEADER_LEN),
                    };
                    return Ok(Some(frame));
                }
            }
        }
    }
}

/// Writes length-prefixed frames to the host pipe.
pub struct FrameWriter<W> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    /// Creates a frame writer over `writer`.
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Writes one frame and flushes it.
    ///
    /// Payloads longer than the 2-byte prefix can express are rejected with
    /// `InvalidInput`; the daemon's own messages are chunk-bounded well
    /// below that.
    pub async fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        let len = u16::try_from(payload.len()).map_err(|_| {
            io::Error::new(io::ErrorKind::InvalidInput, "frame exceeds u16 length")
        })?;
        self.writer.write_all(&len.to_be_bytes()).await?;
        self.writer.write_all(payload).await?;
        self.writer.flush().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn roundtrip_many_frames() {
        let (client, server) = tokio::io::duplex(256);
        let (read_half, _keep) = tokio::io::split(server);
        let (_keep2, write_half) = tokio::io::split(client);

        let mut reader = FrameReader::new(read_half);
        let mut writer = FrameWriter::new(write_half);

        for i in 0..64u16 {
            let payload = vec![i as u8; usize::from(i)];
            writer.send(&payload).await.unwrap();
            let frame = reader.next().await.unwrap().unwrap();
            assert_eq!(&frame[..], &payload[..]);
        }
    }

    #[tokio::test]
    async fn partial_frames_reassemble() {
        // Header and body trickle in byte by byte.
        let (mut client, server) = tokio::io::duplex(16);
        let (read_half, _keep) = tokio::io::split(server);
        let mut reader = FrameReader::new(read_half);

        let feeder = tokio::spawn(async move {
            use tokio::io::AsyncWriteExt;
            for byte in [0u8, 3, b'a', b'b', b'c'] {
                client.write_all(&[byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
            client
        });

        let frame = reader.next().await.unwrap().unwrap();
        assert_eq!(&frame[..], b"abc");
        drop(feeder.await.unwrap());
        assert!(reader.next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn eof_mid_frame_is_an_error() {
        let (mut client, server) = tokio::io::duplex(16);
        let (read_half, _keep) = tokio::io::split(server);
        let mut reader = FrameReader::new(read_half);

        use tokio::io::AsyncWriteExt;
        client.write_all(&[0u8, 10, b'x']).await.unwrap();
        drop(client);

        let err = reader.next().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[tokio::test]
    async fn oversized_payload_is_rejected() {
        let (client, _server) = tokio::io::duplex(16);
        let (_r, write_half) = tokio::io::split(client);
        let mut writer = FrameWriter::new(write_half);
        let huge = vec![0u8; usize::from(u16::MAX) + 1];
        let err = writer.send(&huge).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
