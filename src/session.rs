//! Session core: transport ownership, demultiplexing, flow control,
//! keepalive, and the key-exchange state machine.
//!
//! A session turns one reliable byte stream into many logical streams. Four
//! long-lived tasks run per session:
//!
//! - the **receive pump**, sole owner of the transport's read half, gated by
//!   the token bucket;
//! - the **sender task** ([`crate::writer`]), sole owner of the write half;
//! - the **keepalive watchdog**, emitting NOPs and detecting silent peers;
//! - on encrypted clients, the **handshake driver**, which installs the
//!   session key and sends KXR.
//!
//! Lifecycle: `Handshaking → Ready → Dying → Dead`. The single `die` watch
//! channel is the global cancellation source; flipping it exactly once
//! unblocks every waiter, marks every stream, and lets the tasks drop their
//! transport halves, which closes the connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadHalf};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::{debug, error};

use crate::bucket::TokenBucket;
use crate::config::Config;
use crate::crypto::{self, CipherState};
use crate::error::{KeymuxError, Result};
use crate::protocol::{Command, Frame, Header, HEADER_SIZE, MAX_PAYLOAD_SIZE};
use crate::stream::{Stream, StreamCore};
use crate::writer::{self, WriteRequest};

/// Capacity of the outbound frame channel feeding the sender task.
const SEND_QUEUE_CAPACITY: usize = 64;

/// A multiplexed connection carrying many logical streams.
///
/// # Example
///
/// ```no_run
/// use keymux::{Config, Session};
///
/// # async fn run(tcp: tokio::net::TcpStream) -> keymux::Result<()> {
/// let session = Session::client(tcp, Config::default())?;
/// let stream = session.open_stream().await?;
/// stream.write(b"hello").await?;
/// # Ok(())
/// # }
/// ```
pub struct Session {
    inner: Arc<SessionInner>,
}

pub(crate) struct SessionInner {
    config: Config,
    is_client: bool,
    encrypted: bool,
    /// Handshake deadline, fixed at session creation.
    handshake_deadline: Instant,

    next_stream_id: AtomicU32,
    streams: Mutex<HashMap<u32, Arc<StreamCore>>>,
    bucket: TokenBucket,

    writes: mpsc::Sender<WriteRequest>,
    die: watch::Sender<bool>,
    accepts: tokio::sync::Mutex<mpsc::Receiver<Stream>>,
    accept_deadline: Mutex<Option<Instant>>,

    data_ready: AtomicBool,

    /// Guards the single key-install transition (server: KXR, client: KXS).
    handshake_latch: AtomicBool,
    /// Edge-triggered readiness signal; flipped at most once.
    ready: watch::Sender<bool>,
    tx_cipher: Mutex<CipherState>,
    rx_cipher: Mutex<CipherState>,
}

impl Session {
    /// Create the client side of a session over `transport`.
    ///
    /// Encryption is enabled when `config.server_public_key` is set; the key
    /// handshake starts immediately in the background.
    pub fn client<T>(transport: T, config: Config) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, true)
    }

    /// Create the server side of a session over `transport`.
    ///
    /// Encryption is enabled when `config.server_private_key` is set; the
    /// server waits for the client's KXR.
    pub fn server<T>(transport: T, config: Config) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        Self::new(transport, config, false)
    }

    fn new<T>(transport: T, config: Config, is_client: bool) -> Result<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        config.validate()?;
        let encrypted = if is_client {
            config.server_public_key.is_some()
        } else {
            config.server_private_key.is_some()
        };

        let (read_half, write_half) = tokio::io::split(transport);
        let (writes_tx, writes_rx) = mpsc::channel(SEND_QUEUE_CAPACITY);
        let (accepts_tx, accepts_rx) = mpsc::channel(config.accept_backlog);
        let (die_tx, _) = watch::channel(false);
        // Plaintext sessions are born ready.
        let (ready_tx, _) = watch::channel(!encrypted);

        let cipher = |enabled: bool| {
            if enabled {
                CipherState::Pending
            } else {
                CipherState::NotRequired
            }
        };

        let inner = Arc::new(SessionInner {
            handshake_deadline: Instant::now() + config.key_handshake_timeout,
            bucket: TokenBucket::new(config.max_receive_buffer),
            next_stream_id: AtomicU32::new(if is_client { 1 } else { 2 }),
            streams: Mutex::new(HashMap::new()),
            writes: writes_tx,
            die: die_tx,
            accepts: tokio::sync::Mutex::new(accepts_rx),
            accept_deadline: Mutex::new(None),
            data_ready: AtomicBool::new(false),
            handshake_latch: AtomicBool::new(false),
            ready: ready_tx,
            tx_cipher: Mutex::new(cipher(encrypted)),
            rx_cipher: Mutex::new(cipher(encrypted)),
            config,
            is_client,
            encrypted,
        });

        tokio::spawn(recv_loop(inner.clone(), read_half, accepts_tx));
        writer::spawn_send_loop(write_half, writes_rx, inner.die.subscribe());
        tokio::spawn(keepalive_loop(inner.clone()));
        if is_client && encrypted {
            tokio::spawn(exchange_keys(inner.clone()));
        }

        let role = if is_client { "client" } else { "server" };
        debug!(role, encrypted, "session started");
        Ok(Session { inner })
    }

    /// Open a new locally-originated stream.
    ///
    /// Blocks until encryption is ready (up to `key_handshake_timeout` from
    /// session creation), sends SYN, and registers the stream.
    pub async fn open_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        if inner.is_closed() {
            return Err(KeymuxError::BrokenPipe);
        }
        inner.require_encryption().await?;

        let sid = inner.next_stream_id.fetch_add(2, Ordering::Relaxed);
        let core = Arc::new(StreamCore::new(sid));
        inner.streams.lock().unwrap().insert(sid, core.clone());

        if let Err(err) = inner.write_frame(Command::Syn, sid, Bytes::new()).await {
            inner.streams.lock().unwrap().remove(&sid);
            return Err(err);
        }
        Ok(Stream::new(core, Arc::downgrade(inner)))
    }

    /// Block until the peer opens a stream.
    ///
    /// Races the accept queue against session death and the optional session
    /// deadline ([`set_deadline`](Session::set_deadline)).
    pub async fn accept_stream(&self) -> Result<Stream> {
        let inner = &self.inner;
        inner.require_encryption().await?;

        let deadline = *inner.accept_deadline.lock().unwrap();
        let mut die = inner.die.subscribe();
        let mut accepts = inner.accepts.lock().await;

        match deadline {
            Some(at) => tokio::select! {
                stream = accepts.recv() => stream.ok_or(KeymuxError::BrokenPipe),
                _ = die.wait_for(|dead| *dead) => Err(KeymuxError::BrokenPipe),
                _ = tokio::time::sleep_until(at) => Err(KeymuxError::Timeout),
            },
            None => tokio::select! {
                stream = accepts.recv() => stream.ok_or(KeymuxError::BrokenPipe),
                _ = die.wait_for(|dead| *dead) => Err(KeymuxError::BrokenPipe),
            },
        }
    }

    /// Close the session and every stream on it.
    ///
    /// The first call returns `Ok(())`; subsequent calls `BrokenPipe`.
    pub fn close(&self) -> Result<()> {
        self.inner.close()
    }

    /// Whether the session has died.
    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    /// Number of currently registered streams (0 once closed).
    pub fn num_streams(&self) -> usize {
        if self.is_closed() {
            return 0;
        }
        self.inner.streams.lock().unwrap().len()
    }

    /// Set the deadline observed by [`accept_stream`](Session::accept_stream).
    /// `None` disables it.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        *self.inner.accept_deadline.lock().unwrap() = deadline;
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("is_client", &self.inner.is_client)
            .field("encrypted", &self.inner.encrypted)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl SessionInner {
    pub(crate) fn is_closed(&self) -> bool {
        *self.die.borrow()
    }

    pub(crate) fn max_frame_size(&self) -> usize {
        self.config.max_frame_size
    }

    fn close(&self) -> Result<()> {
        if self.die.send_replace(true) {
            return Err(KeymuxError::BrokenPipe);
        }
        debug!("session closing");
        let cores: Vec<Arc<StreamCore>> = {
            let mut streams = self.streams.lock().unwrap();
            streams.drain().map(|(_, core)| core).collect()
        };
        for core in cores {
            core.mark_session_closed();
        }
        // Wake a pump parked on the bucket so it observes death.
        self.bucket.nudge();
        Ok(())
    }

    fn close_internal(&self) {
        let _ = self.close();
    }

    /// Wait for the encryption-ready signal, bounded by the session-relative
    /// handshake deadline.
    async fn require_encryption(&self) -> Result<()> {
        if !self.encrypted {
            return Ok(());
        }
        let mut ready = self.ready.subscribe();
        let outcome = tokio::time::timeout_at(self.handshake_deadline, ready.wait_for(|ready| *ready))
            .await;
        match outcome {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(KeymuxError::BrokenPipe),
            Err(_) => Err(KeymuxError::EncryptionNotReady),
        }
    }

    /// Queue a control frame (never encrypted) and wait for the write result.
    pub(crate) async fn write_frame(
        &self,
        cmd: Command,
        stream_id: u32,
        payload: Bytes,
    ) -> Result<usize> {
        debug_assert!(cmd != Command::Psh);
        let frame = Frame::with_payload(cmd, stream_id, payload);
        let header = frame.header().encode();
        let permit = self.reserve_send_slot().await?;
        let (reply_tx, reply_rx) = oneshot::channel();
        permit.send(WriteRequest {
            header,
            payload: frame.payload,
            reply: reply_tx,
        });
        reply_rx.await.unwrap_or(Err(KeymuxError::BrokenPipe))
    }

    /// Queue one PSH fragment, encrypting in place right before admission so
    /// the outbound keystream advances in channel order.
    pub(crate) async fn write_data(&self, stream_id: u32, chunk: &[u8]) -> Result<usize> {
        debug_assert!(chunk.len() <= self.config.max_frame_size);
        let permit = self.reserve_send_slot().await?;
        let (reply_tx, reply_rx) = oneshot::channel();

        let mut payload = BytesMut::with_capacity(chunk.len());
        payload.extend_from_slice(chunk);
        if self.encrypted {
            // Encryption and channel admission stay inside one critical
            // section; the permit makes the send non-blocking.
            let mut cipher = self.tx_cipher.lock().unwrap();
            cipher.apply(&mut payload)?;
            let header = Header::new(Command::Psh, stream_id, payload.len() as u16).encode();
            permit.send(WriteRequest {
                header,
                payload: payload.freeze(),
                reply: reply_tx,
            });
        } else {
            let header = Header::new(Command::Psh, stream_id, payload.len() as u16).encode();
            permit.send(WriteRequest {
                header,
                payload: payload.freeze(),
                reply: reply_tx,
            });
        }
        reply_rx.await.unwrap_or(Err(KeymuxError::BrokenPipe))
    }

    async fn reserve_send_slot(&self) -> Result<mpsc::Permit<'_, WriteRequest>> {
        let mut die = self.die.subscribe();
        if *die.borrow() {
            return Err(KeymuxError::BrokenPipe);
        }
        tokio::select! {
            permit = self.writes.reserve() => permit.map_err(|_| KeymuxError::BrokenPipe),
            _ = die.wait_for(|dead| *dead) => Err(KeymuxError::BrokenPipe),
        }
    }

    /// Pay tokens back after a stream read.
    pub(crate) fn return_tokens(&self, n: usize) {
        self.bucket.restore(n);
    }

    /// Unregister a stream and recycle its unread tokens.
    pub(crate) fn stream_closed(&self, sid: u32) {
        let core = self.streams.lock().unwrap().remove(&sid);
        if let Some(core) = core {
            self.bucket.restore(core.recycle_tokens());
        }
    }

    fn install_cipher(&self, key: &[u8; crypto::SESSION_KEY_SIZE]) {
        self.tx_cipher.lock().unwrap().install(key);
        self.rx_cipher.lock().unwrap().install(key);
    }

    fn mark_ready(&self) {
        self.ready.send_replace(true);
    }
}

/// Read one frame; PSH payloads are decrypted in place before dispatch.
async fn read_frame<T>(
    inner: &SessionInner,
    rd: &mut ReadHalf<T>,
    header_buf: &mut [u8; HEADER_SIZE],
    payload_buf: &mut [u8],
) -> Result<Frame>
where
    T: AsyncRead,
{
    rd.read_exact(header_buf).await?;
    let header = Header::decode(header_buf)?;

    let len = header.length as usize;
    let payload = if len > 0 {
        rd.read_exact(&mut payload_buf[..len]).await?;
        if inner.encrypted && header.cmd == Command::Psh {
            inner.rx_cipher.lock().unwrap().apply(&mut payload_buf[..len])?;
        }
        Bytes::copy_from_slice(&payload_buf[..len])
    } else {
        Bytes::new()
    };

    Ok(Frame {
        cmd: header.cmd,
        stream_id: header.stream_id,
        payload,
    })
}

/// The receive pump: token gate, frame read, dispatch.
async fn recv_loop<T>(inner: Arc<SessionInner>, mut rd: ReadHalf<T>, accepts: mpsc::Sender<Stream>)
where
    T: AsyncRead + Send + 'static,
{
    let mut die = inner.die.subscribe();
    let mut header_buf = [0u8; HEADER_SIZE];
    let mut payload_buf = vec![0u8; MAX_PAYLOAD_SIZE];

    loop {
        tokio::select! {
            _ = inner.bucket.acquire() => {}
            _ = die.wait_for(|dead| *dead) => return,
        }
        if inner.is_closed() {
            return;
        }

        let frame = tokio::select! {
            read = read_frame(&inner, &mut rd, &mut header_buf, &mut payload_buf) => match read {
                Ok(frame) => frame,
                Err(err) => {
                    debug!(%err, "receive pump stopping");
                    inner.close_internal();
                    return;
                }
            },
            _ = die.wait_for(|dead| *dead) => return,
        };

        inner.data_ready.store(true, Ordering::Release);

        match frame.cmd {
            Command::Nop => {}
            Command::Syn => {
                let core = {
                    let mut streams = inner.streams.lock().unwrap();
                    if streams.contains_key(&frame.stream_id) || inner.is_closed() {
                        None
                    } else {
                        let core = Arc::new(StreamCore::new(frame.stream_id));
                        streams.insert(frame.stream_id, core.clone());
                        Some(core)
                    }
                };
                if let Some(core) = core {
                    let stream = Stream::new(core, Arc::downgrade(&inner));
                    // A full accept queue stalls the pump on purpose: that is
                    // the backpressure against an application that never
                    // accepts.
                    tokio::select! {
                        sent = accepts.send(stream) => { let _ = sent; }
                        _ = die.wait_for(|dead| *dead) => return,
                    }
                }
            }
            Command::Psh => {
                let streams = inner.streams.lock().unwrap();
                if let Some(core) = streams.get(&frame.stream_id) {
                    inner.bucket.consume(frame.payload.len());
                    core.push_bytes(frame.payload);
                }
                // PSH for an unknown id is dropped silently.
            }
            Command::Rst => {
                if let Some(core) = inner.streams.lock().unwrap().get(&frame.stream_id) {
                    core.mark_rst();
                }
            }
            Command::Kxr => {
                if inner.is_client || !inner.encrypted {
                    error!("unexpected KXR frame");
                    inner.close_internal();
                    return;
                }
                if !inner.handshake_latch.swap(true, Ordering::AcqRel) {
                    let server_key = inner
                        .config
                        .server_private_key
                        .as_ref()
                        .expect("encrypted server sessions carry a private key");
                    match crypto::open_sealed_secret(server_key, &frame.payload) {
                        Ok(key) => {
                            inner.install_cipher(&key);
                            let _ = inner
                                .write_frame(Command::Kxs, 0, frame.payload.clone())
                                .await;
                            inner.mark_ready();
                            debug!("key exchange complete");
                        }
                        Err(err) => {
                            error!(%err, "key exchange failed");
                            inner.close_internal();
                            return;
                        }
                    }
                }
            }
            Command::Kxs => {
                if !inner.encrypted {
                    error!("unexpected KXS frame");
                    inner.close_internal();
                    return;
                }
                if inner.is_client {
                    // A KXS can only legitimately answer our KXR, and the
                    // cipher is installed before the KXR goes out.
                    if !inner.tx_cipher.lock().unwrap().is_installed() {
                        error!("KXS before any key exchange request");
                        inner.close_internal();
                        return;
                    }
                    if !inner.handshake_latch.swap(true, Ordering::AcqRel) {
                        let _ = inner
                            .write_frame(Command::Kxs, 0, frame.payload.clone())
                            .await;
                        debug!("key exchange complete");
                    }
                    inner.mark_ready();
                } else if inner.handshake_latch.load(Ordering::Acquire) {
                    // Echo of our own KXS; readiness already fired.
                    inner.mark_ready();
                } else {
                    error!("KXS before any key exchange request");
                    inner.close_internal();
                    return;
                }
            }
        }
    }
}

/// Keepalive watchdog: periodic NOPs, death on a silent peer.
async fn keepalive_loop(inner: Arc<SessionInner>) {
    let mut die = inner.die.subscribe();
    let start = Instant::now();
    let mut ping = tokio::time::interval_at(
        start + inner.config.keep_alive_interval,
        inner.config.keep_alive_interval,
    );
    let mut timeout = tokio::time::interval_at(
        start + inner.config.keep_alive_timeout,
        inner.config.keep_alive_timeout,
    );

    loop {
        tokio::select! {
            _ = ping.tick() => {
                let _ = inner.write_frame(Command::Nop, 0, Bytes::new()).await;
                // Nudge a pump that might be parked on an empty bucket.
                inner.bucket.nudge();
            }
            _ = timeout.tick() => {
                if !inner.data_ready.swap(false, Ordering::AcqRel) {
                    debug!("keepalive timeout, closing session");
                    inner.close_internal();
                    return;
                }
            }
            _ = die.changed() => return,
        }
    }
}

/// Client-side handshake driver: derive, install, send KXR.
async fn exchange_keys(inner: Arc<SessionInner>) {
    let server_public = inner
        .config
        .server_public_key
        .expect("encrypted client sessions carry the server public key");

    let (ephemeral, ephemeral_public) = crypto::generate_keypair();
    // One ECDH per handshake; both working keys expand from its output.
    let sealed = crypto::derive_shared_secret(&ephemeral, &server_public).and_then(|shared| {
        let session_key = crypto::derive_session_key(&shared);
        // Install before KXR goes out so any subsequent PSH can encrypt.
        inner.install_cipher(&session_key);
        let seal_key = crypto::derive_seal_key(&shared);
        crypto::seal_secret(&session_key, &ephemeral_public, &seal_key)
    });

    match sealed {
        Ok(sealed) => {
            if inner
                .write_frame(Command::Kxr, 0, Bytes::from(sealed))
                .await
                .is_err()
            {
                inner.close_internal();
                return;
            }
            inner.bucket.nudge();
        }
        Err(err) => {
            error!(%err, "key exchange setup failed");
            inner.close_internal();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;

    fn plaintext_pair() -> (Session, Session) {
        let (a, b) = duplex(256 * 1024);
        let client = Session::client(a, Config::default()).unwrap();
        let server = Session::server(b, Config::default()).unwrap();
        (client, server)
    }

    #[tokio::test]
    async fn test_client_ids_are_odd_server_ids_even() {
        let (client, server) = plaintext_pair();

        let c1 = client.open_stream().await.unwrap();
        let c2 = client.open_stream().await.unwrap();
        assert_eq!(c1.sid() % 2, 1);
        assert_eq!(c2.sid() % 2, 1);
        assert_ne!(c1.sid(), c2.sid());

        let s1 = server.open_stream().await.unwrap();
        assert_eq!(s1.sid() % 2, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (client, _server) = plaintext_pair();
        assert!(client.close().is_ok());
        assert!(matches!(client.close(), Err(KeymuxError::BrokenPipe)));
        assert!(client.is_closed());
    }

    #[tokio::test]
    async fn test_open_stream_after_close_fails() {
        let (client, _server) = plaintext_pair();
        client.close().unwrap();
        assert!(matches!(
            client.open_stream().await,
            Err(KeymuxError::BrokenPipe)
        ));
        assert_eq!(client.num_streams(), 0);
    }

    #[tokio::test]
    async fn test_accept_deadline_times_out() {
        let (_client, server) = plaintext_pair();
        server.set_deadline(Some(Instant::now() + std::time::Duration::from_millis(50)));
        let result = server.accept_stream().await;
        assert!(matches!(result, Err(KeymuxError::Timeout)));
    }
}
