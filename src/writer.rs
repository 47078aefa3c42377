//! Dedicated sender task: the single point where frames meet the transport.
//!
//! Every outbound frame — application PSH, control frames, keepalive NOPs —
//! funnels through one mpsc channel of [`WriteRequest`]s. A dedicated task
//! drains the channel and writes `[header][payload]` with scatter/gather I/O,
//! answering each request over its one-shot reply channel. Channel admission
//! order is the session's total outbound frame order.
//!
//! ```text
//! Stream 1 ─┐
//! Stream 2 ─┼─► mpsc::Sender<WriteRequest> ─► Sender Task ─► Transport
//! Session  ─┘
//! ```

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::{KeymuxError, Result};
use crate::protocol::HEADER_SIZE;

/// A frame queued for the sender task.
#[derive(Debug)]
pub(crate) struct WriteRequest {
    /// Pre-encoded 8-byte header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes, already encrypted if the frame is an encrypted PSH.
    pub payload: Bytes,
    /// Answered with the payload bytes written (0 on failure).
    pub reply: oneshot::Sender<Result<usize>>,
}

/// Spawn the sender task owning the transport's write half.
///
/// The task exits when the request channel closes or the die signal fires.
/// On a clean drain it shuts the write half down (flushes the FIN); on die it
/// simply drops the half so the transport tears down without blocking.
pub(crate) fn spawn_send_loop<W>(
    writer: W,
    requests: mpsc::Receiver<WriteRequest>,
    die: watch::Receiver<bool>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(send_loop(writer, requests, die))
}

async fn send_loop<W>(
    mut writer: W,
    mut requests: mpsc::Receiver<WriteRequest>,
    mut die: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let request = tokio::select! {
            _ = die.changed() => return,
            request = requests.recv() => match request {
                Some(request) => request,
                None => {
                    let _ = writer.shutdown().await;
                    return;
                }
            },
        };

        // A stalled transport must not pin the task past session death.
        let outcome = tokio::select! {
            res = write_frame(&mut writer, &request.header, &request.payload) => res,
            _ = die.changed() => {
                let _ = request.reply.send(Err(KeymuxError::BrokenPipe));
                return;
            }
        };

        let reply = match outcome {
            Ok(()) => Ok(request.payload.len()),
            Err(err) => Err(err.into()),
        };
        let _ = request.reply.send(reply);
    }
}

/// Write one frame with vectored I/O, handling partial writes.
async fn write_frame<W>(
    writer: &mut W,
    header: &[u8; HEADER_SIZE],
    payload: &[u8],
) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if payload.is_empty() {
        writer.write_all(header).await?;
    } else {
        let total = HEADER_SIZE + payload.len();
        let mut written = 0;
        while written < total {
            let slices = remaining_slices(header, payload, written);
            let n = writer.write_vectored(&slices).await?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "write_vectored returned 0",
                ));
            }
            written += n;
        }
    }
    writer.flush().await
}

/// Build the IoSlice pair for whatever is left after `skip` bytes.
fn remaining_slices<'a>(
    header: &'a [u8; HEADER_SIZE],
    payload: &'a [u8],
    skip: usize,
) -> Vec<IoSlice<'a>> {
    if skip < HEADER_SIZE {
        vec![IoSlice::new(&header[skip..]), IoSlice::new(payload)]
    } else {
        vec![IoSlice::new(&payload[skip - HEADER_SIZE..])]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{Command, Header};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    fn request(payload: &'static [u8]) -> (WriteRequest, oneshot::Receiver<Result<usize>>) {
        let (reply, rx) = oneshot::channel();
        let header = Header::new(Command::Psh, 1, payload.len() as u16).encode();
        (
            WriteRequest {
                header,
                payload: Bytes::from_static(payload),
                reply,
            },
            rx,
        )
    }

    #[test]
    fn test_remaining_slices_no_skip() {
        let header = [0u8; HEADER_SIZE];
        let slices = remaining_slices(&header, b"hello", 0);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE);
        assert_eq!(slices[1].len(), 5);
    }

    #[test]
    fn test_remaining_slices_partial_header() {
        let header = [0u8; HEADER_SIZE];
        let slices = remaining_slices(&header, b"hello", 3);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), HEADER_SIZE - 3);
    }

    #[test]
    fn test_remaining_slices_into_payload() {
        let header = [0u8; HEADER_SIZE];
        let slices = remaining_slices(&header, b"hello", HEADER_SIZE + 2);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 3);
    }

    #[tokio::test]
    async fn test_send_loop_writes_header_then_payload() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(4);
        let (_die_tx, die_rx) = watch::channel(false);
        let _task = spawn_send_loop(client, rx, die_rx);

        let (req, reply) = request(b"hello");
        tx.send(req).await.unwrap();
        assert_eq!(reply.await.unwrap().unwrap(), 5);

        let mut buf = vec![0u8; HEADER_SIZE + 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[HEADER_SIZE..], b"hello");
    }

    #[tokio::test]
    async fn test_send_loop_preserves_admission_order() {
        let (client, mut server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel(8);
        let (_die_tx, die_rx) = watch::channel(false);
        let _task = spawn_send_loop(client, rx, die_rx);

        let mut replies = Vec::new();
        for payload in [b"aa" as &[u8], b"bb", b"cc"] {
            let (reply_tx, reply_rx) = oneshot::channel();
            let header = Header::new(Command::Psh, 9, payload.len() as u16).encode();
            tx.send(WriteRequest {
                header,
                payload: Bytes::copy_from_slice(payload),
                reply: reply_tx,
            })
            .await
            .unwrap();
            replies.push(reply_rx);
        }
        for reply in replies {
            assert_eq!(reply.await.unwrap().unwrap(), 2);
        }

        let mut buf = vec![0u8; 3 * (HEADER_SIZE + 2)];
        server.read_exact(&mut buf).await.unwrap();
        let payloads: Vec<&[u8]> = buf
            .chunks(HEADER_SIZE + 2)
            .map(|frame| &frame[HEADER_SIZE..])
            .collect();
        assert_eq!(payloads, vec![b"aa" as &[u8], b"bb", b"cc"]);
    }

    #[tokio::test]
    async fn test_send_loop_exits_on_die() {
        let (client, _server) = tokio::io::duplex(16);
        let (_tx, rx) = mpsc::channel::<WriteRequest>(1);
        let (die_tx, die_rx) = watch::channel(false);
        let task = spawn_send_loop(client, rx, die_rx);

        die_tx.send_replace(true);
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("sender task should observe die")
            .unwrap();
    }

    #[tokio::test]
    async fn test_send_loop_exits_when_channel_drains() {
        let (client, _server) = tokio::io::duplex(4096);
        let (tx, rx) = mpsc::channel::<WriteRequest>(1);
        let (_die_tx, die_rx) = watch::channel(false);
        let task = spawn_send_loop(client, rx, die_rx);

        drop(tx);
        tokio::time::timeout(Duration::from_millis(500), task)
            .await
            .expect("sender task should exit on channel close")
            .unwrap();
    }
}
