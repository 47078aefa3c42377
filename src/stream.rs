//! Per-stream logical endpoint.
//!
//! A [`Stream`] is one bidirectional byte channel inside a session. Reads
//! drain a FIFO of payload chunks the receive pump pushed in; writes fragment
//! into PSH frames and funnel through the session's sender task. The stream
//! holds only a weak back-reference to the session internals — the session
//! owns its streams, never the other way around.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{KeymuxError, Result};
use crate::protocol::Command;
use crate::session::SessionInner;

/// Received-but-unread payload chunks, in arrival order.
#[derive(Debug, Default)]
struct RecvBuffer {
    chunks: VecDeque<Bytes>,
    buffered: usize,
}

/// Shared stream state: the session's stream table holds one of these per
/// live stream id, and the public [`Stream`] handle wraps the same allocation.
#[derive(Debug)]
pub(crate) struct StreamCore {
    sid: u32,
    rx: Mutex<RecvBuffer>,
    read_event: Notify,
    rst: AtomicBool,
    local_closed: AtomicBool,
    session_closed: AtomicBool,
    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
}

impl StreamCore {
    pub fn new(sid: u32) -> Self {
        Self {
            sid,
            rx: Mutex::new(RecvBuffer::default()),
            read_event: Notify::new(),
            rst: AtomicBool::new(false),
            local_closed: AtomicBool::new(false),
            session_closed: AtomicBool::new(false),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
        }
    }

    /// Append an inbound PSH payload and wake a reader.
    pub fn push_bytes(&self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        {
            let mut rx = self.rx.lock().unwrap();
            rx.buffered += data.len();
            rx.chunks.push_back(data);
        }
        self.read_event.notify_one();
    }

    /// Record a peer RST and wake all readers.
    pub fn mark_rst(&self) {
        self.rst.store(true, Ordering::Release);
        self.read_event.notify_waiters();
    }

    /// Record session death and wake all readers.
    pub fn mark_session_closed(&self) {
        self.session_closed.store(true, Ordering::Release);
        self.read_event.notify_waiters();
    }

    /// Drain the buffer, returning the byte count still owed to the bucket.
    pub fn recycle_tokens(&self) -> usize {
        let mut rx = self.rx.lock().unwrap();
        rx.chunks.clear();
        std::mem::take(&mut rx.buffered)
    }

    /// Copy up to `buf.len()` buffered bytes out, or `None` if empty.
    fn try_read(&self, buf: &mut [u8]) -> Option<usize> {
        let mut rx = self.rx.lock().unwrap();
        if rx.buffered == 0 {
            return None;
        }
        let mut n = 0;
        while n < buf.len() {
            let Some(chunk) = rx.chunks.front_mut() else {
                break;
            };
            let take = chunk.len().min(buf.len() - n);
            buf[n..n + take].copy_from_slice(&chunk[..take]);
            n += take;
            if take == chunk.len() {
                rx.chunks.pop_front();
            } else {
                let _ = chunk.split_to(take);
            }
        }
        rx.buffered -= n;
        Some(n)
    }

    fn has_data(&self) -> bool {
        self.rx.lock().unwrap().buffered > 0
    }
}

/// A logical bidirectional byte channel within a session.
///
/// Obtained from [`Session::open_stream`](crate::Session::open_stream) or
/// [`Session::accept_stream`](crate::Session::accept_stream). Dropping the
/// handle without [`close`](Stream::close) unregisters the stream and
/// recycles its tokens, but sends no RST to the peer.
#[derive(Debug)]
pub struct Stream {
    core: Arc<StreamCore>,
    session: Weak<SessionInner>,
}

impl Stream {
    pub(crate) fn new(core: Arc<StreamCore>, session: Weak<SessionInner>) -> Self {
        Self { core, session }
    }

    /// The stream identifier. Odd for client-originated streams, even for
    /// server-originated ones.
    pub fn sid(&self) -> u32 {
        self.core.sid
    }

    /// Read buffered bytes into `buf`, blocking until data arrives or the
    /// stream terminates.
    ///
    /// Buffered data is drained before any terminal state is reported. Then:
    /// `ConnectionReset` after a peer RST, `BrokenPipe` after session death,
    /// `Ok(0)` (EOF) after a local close, `Timeout` past the read deadline.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            if let Some(n) = self.core.try_read(buf) {
                if let Some(session) = self.session.upgrade() {
                    session.return_tokens(n);
                }
                return Ok(n);
            }
            if self.core.rst.load(Ordering::Acquire) {
                return Err(KeymuxError::ConnectionReset);
            }
            if self.core.session_closed.load(Ordering::Acquire) || self.session.strong_count() == 0
            {
                return Err(KeymuxError::BrokenPipe);
            }
            if self.core.local_closed.load(Ordering::Acquire) {
                return Ok(0);
            }

            let notified = self.core.read_event.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            // Re-check after registering so a wakeup cannot slip between the
            // checks above and the await below.
            if self.core.has_data()
                || self.core.rst.load(Ordering::Acquire)
                || self.core.session_closed.load(Ordering::Acquire)
                || self.core.local_closed.load(Ordering::Acquire)
            {
                continue;
            }

            let deadline = *self.core.read_deadline.lock().unwrap();
            match deadline {
                Some(at) => tokio::select! {
                    _ = notified => {}
                    _ = tokio::time::sleep_until(at) => return Err(KeymuxError::Timeout),
                },
                None => notified.await,
            }
        }
    }

    /// Write `buf` to the peer, fragmenting into PSH frames of at most the
    /// session's `max_frame_size`.
    ///
    /// Returns the payload bytes handed to the transport. Fails with
    /// `BrokenPipe` on a closed/RST stream or dead session, and with
    /// `Timeout` past the write deadline (earlier fragments may already have
    /// been delivered).
    pub async fn write(&self, buf: &[u8]) -> Result<usize> {
        let session = self.session.upgrade().ok_or(KeymuxError::BrokenPipe)?;
        if self.is_terminated() {
            return Err(KeymuxError::BrokenPipe);
        }

        let deadline = *self.core.write_deadline.lock().unwrap();
        let mut sent = 0;
        for chunk in buf.chunks(session.max_frame_size()) {
            if self.is_terminated() {
                return Err(KeymuxError::BrokenPipe);
            }
            let push = session.write_data(self.core.sid, chunk);
            let n = match deadline {
                Some(at) => tokio::time::timeout_at(at, push)
                    .await
                    .map_err(|_| KeymuxError::Timeout)??,
                None => push.await?,
            };
            sent += n;
        }
        Ok(sent)
    }

    /// Close the stream: best-effort RST to the peer, unregister from the
    /// session, recycle outstanding tokens.
    ///
    /// The first call returns `Ok(())`; subsequent calls `BrokenPipe`.
    pub async fn close(&self) -> Result<()> {
        if self.core.local_closed.swap(true, Ordering::AcqRel) {
            return Err(KeymuxError::BrokenPipe);
        }
        self.core.read_event.notify_waiters();
        if let Some(session) = self.session.upgrade() {
            if !session.is_closed() {
                let _ = session
                    .write_frame(Command::Rst, self.core.sid, Bytes::new())
                    .await;
            }
            session.stream_closed(self.core.sid);
        }
        Ok(())
    }

    /// Set both the read and write deadlines. `None` disables them.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    /// Set the deadline observed by in-flight and future `read` calls.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.core.read_deadline.lock().unwrap() = deadline;
        self.core.read_event.notify_waiters();
    }

    /// Set the deadline observed by future `write` calls.
    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.core.write_deadline.lock().unwrap() = deadline;
    }

    fn is_terminated(&self) -> bool {
        self.core.local_closed.load(Ordering::Acquire)
            || self.core.rst.load(Ordering::Acquire)
            || self.core.session_closed.load(Ordering::Acquire)
    }
}

impl Drop for Stream {
    fn drop(&mut self) {
        if !self.core.local_closed.swap(true, Ordering::AcqRel) {
            self.core.read_event.notify_waiters();
            if let Some(session) = self.session.upgrade() {
                session.stream_closed(self.core.sid);
            }
        }
    }
}
