//! # Transport Abstraction
//!
//! A [`Transport`] is a full-duplex, message-framed pipe over a reliable
//! byte stream. Three implementations share the contract:
//!
//! - [`tcp::TcpTransport`]: plain TCP with a 4-byte little-endian length
//!   prefix per frame
//! - [`tls::TlsTransport`]: the same framing over a TLS 1.2/1.3 stream
//! - [`websocket::WsTransport`]: one binary WebSocket message per frame
//!   (the WebSocket layer provides its own framing; no prefix is added)
//!
//! ## Duplex discipline
//!
//! Each established stream has exactly one reader task, started by
//! [`Transport::receive`], which decodes frames and feeds them into an
//! `mpsc` channel, the *receive session*. The session ends on orderly peer
//! close, fatal framing/codec errors, or cancellation; the channel closing
//! is the consumer's end-of-sequence signal. Writers serialize on a
//! per-stream async lock that covers the complete framed write, so two
//! concurrent `send` calls can never interleave their bytes.
//!
//! ## Lifecycle observation
//!
//! Transports publish [`ConnectionStatus`] transitions on a broadcast
//! channel. Repeated transitions into the same status are suppressed, which
//! keeps `Disconnected` a once-per-session event no matter how teardown is
//! reached.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::codec::Codec;
use crate::defaults;
use crate::error::{Result, SbmError};
use crate::message::Message;

pub mod tcp;
pub mod tls;
pub mod websocket;

pub use tcp::TcpTransport;
pub use tls::{TlsClientOptions, TlsServerOptions, TlsTransport};
pub use websocket::WsTransport;

/// Connection lifecycle states observable through
/// [`Transport::subscribe_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    /// A first connect attempt is underway.
    Connecting,
    /// The stream is established and ready for traffic.
    Connected,
    /// A connect attempt after a previous established session is underway.
    Reconnecting,
    /// A stream was re-established after a previous session.
    Reconnected,
    /// The stream is gone; the receive session (if any) has ended.
    Disconnected,
    /// An authentication handshake is in flight.
    Authenticating,
    /// The peer acknowledged authentication.
    Authenticated,
    /// Connect exhausted its retries or hit an unrecoverable error.
    Failed,
    /// Connect was cancelled mid-attempt or mid-backoff.
    Cancelled,
}

/// Boxed read half of an established stream.
pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half of an established stream.
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Object-safe alias for a bidirectional byte stream, used where a whole
/// stream (not split halves) must be type-erased, e.g. under a WebSocket.
pub(crate) trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

/// Boxed bidirectional stream.
pub(crate) type BoxedStream = Box<dyn AsyncStream>;

/// Generic full-duplex framed transport.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the stream, retrying with exponential backoff
    /// (`base_delay * 2^(attempt-1)`) up to `max_retries` attempts.
    ///
    /// Emits `Connecting` on entry, `Connected` on success, `Failed` after
    /// exhaustion or on an unrecoverable error, and `Cancelled` if the
    /// transport is closed mid-attempt. Server-accepted transports are
    /// constructed pre-connected; `connect` on them is a no-op.
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> Result<()>;

    /// Encode and write one message as a single frame. Concurrent callers
    /// serialize on the per-stream write lock; frames never interleave.
    async fn send(&self, message: &Message) -> Result<()>;

    /// Start the receive session: a single reader task that decodes frames
    /// into the returned channel. One session per established stream; the
    /// channel closes when the session ends.
    fn receive(&self) -> Result<mpsc::Receiver<Message>>;

    /// Note that an authentication handshake has begun (status only).
    fn on_authenticating(&self);

    /// Note that the peer acknowledged authentication (status only).
    fn on_authenticated(&self);

    /// Tear the stream down. Idempotent; cancels in-flight reads and emits
    /// `Disconnected`.
    async fn close(&self) -> Result<()>;

    /// Snapshot of the current connection status.
    fn status(&self) -> ConnectionStatus;

    /// Subscribe to status transitions.
    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus>;
}

// ---------------------------------------------------------------------------
// Status fan-out
// ---------------------------------------------------------------------------

/// Current status plus a broadcast channel of transitions. Setting the same
/// status twice emits nothing, so terminal events stay single-shot.
pub(crate) struct StatusCell {
    current: Mutex<ConnectionStatus>,
    tx: broadcast::Sender<ConnectionStatus>,
}

impl StatusCell {
    pub(crate) fn new() -> Self {
        let (tx, _) = broadcast::channel(defaults::STATUS_BUFFER_EVENTS);
        Self {
            current: Mutex::new(ConnectionStatus::Disconnected),
            tx,
        }
    }

    pub(crate) fn set(&self, status: ConnectionStatus) {
        let mut current = self.current.lock();
        if *current == status {
            return;
        }
        *current = status;
        drop(current);
        debug!(?status, "connection status changed");
        let _ = self.tx.send(status);
    }

    pub(crate) fn get(&self) -> ConnectionStatus {
        *self.current.lock()
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Length-prefixed framing
// ---------------------------------------------------------------------------

/// Read one `[u32-le length][payload]` frame.
///
/// Returns `Ok(None)` on orderly peer close: a clean EOF at the prefix or
/// mid-payload. A declared length beyond `max_frame_bytes` is a fatal
/// framing error.
pub(crate) async fn read_frame<R>(reader: &mut R, max_frame_bytes: usize) -> Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut len_bytes = [0u8; 4];
    match reader.read_exact(&mut len_bytes).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    if len > max_frame_bytes {
        return Err(SbmError::Framing(format!(
            "declared frame length {len} exceeds maximum {max_frame_bytes}"
        )));
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload).await {
        Ok(_) => Ok(Some(payload)),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write one frame: length prefix and payload, flushed. Callers must hold
/// the stream's write lock across the whole call.
pub(crate) async fn write_frame<W>(writer: &mut W, payload: &[u8]) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let len = payload.len() as u32;
    writer.write_all(&len.to_le_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Shared byte-stream engine
// ---------------------------------------------------------------------------

/// The framed-stream engine shared by the TCP and TLS transports: installed
/// read/write halves, the write lock, the reader task, and status fan-out.
pub(crate) struct StreamCore {
    codec: Arc<dyn Codec>,
    max_frame_bytes: usize,
    reader: Mutex<Option<BoxedReader>>,
    writer: tokio::sync::Mutex<Option<BoxedWriter>>,
    status: StatusCell,
    cancel: CancellationToken,
    was_connected: AtomicBool,
}

impl StreamCore {
    pub(crate) fn new(codec: Arc<dyn Codec>, max_frame_bytes: usize) -> Self {
        Self {
            codec,
            max_frame_bytes,
            reader: Mutex::new(None),
            writer: tokio::sync::Mutex::new(None),
            status: StatusCell::new(),
            cancel: CancellationToken::new(),
            was_connected: AtomicBool::new(false),
        }
    }

    /// Install freshly established halves and flip the status to
    /// `Connected` (or `Reconnected` for a repeat session).
    pub(crate) async fn install(&self, reader: BoxedReader, writer: BoxedWriter) {
        *self.reader.lock() = Some(reader);
        *self.writer.lock().await = Some(writer);
        let again = self.was_connected.swap(true, Ordering::SeqCst);
        self.status.set(if again {
            ConnectionStatus::Reconnected
        } else {
            ConnectionStatus::Connected
        });
    }

    pub(crate) fn is_connected(&self) -> bool {
        matches!(
            self.status.get(),
            ConnectionStatus::Connected
                | ConnectionStatus::Reconnected
                | ConnectionStatus::Authenticating
                | ConnectionStatus::Authenticated
        )
    }

    pub(crate) fn has_had_session(&self) -> bool {
        self.was_connected.load(Ordering::SeqCst)
    }

    pub(crate) fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub(crate) fn status_cell(&self) -> &StatusCell {
        &self.status
    }

    /// Encode and write one message under the write lock.
    pub(crate) async fn send(&self, message: &Message) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(SbmError::NotConnected)?;
        write_frame(writer, &bytes).await
    }

    /// Take the read half and spawn the session's reader task.
    pub(crate) fn begin_receive(self: &Arc<Self>) -> Result<mpsc::Receiver<Message>> {
        let mut reader = self
            .reader
            .lock()
            .take()
            .ok_or(SbmError::NotConnected)?;

        let (tx, rx) = mpsc::channel(defaults::RECEIVE_BUFFER_MESSAGES);
        let core = Arc::clone(self);
        let codec = self.codec.clone();
        let max_frame_bytes = self.max_frame_bytes;
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break "cancelled",
                    frame = read_frame(reader.as_mut(), max_frame_bytes) => match frame {
                        Ok(Some(bytes)) => match codec.decode(&bytes) {
                            Ok(message) => {
                                if tx.send(message).await.is_err() {
                                    break "consumer dropped";
                                }
                            }
                            Err(e) => {
                                warn!(error = %e, "receive session ending on decode failure");
                                break "decode error";
                            }
                        },
                        Ok(None) => break "peer closed",
                        Err(SbmError::Transport(ref e))
                            if e.kind() == std::io::ErrorKind::Interrupted =>
                        {
                            debug!("read interrupted; retrying");
                        }
                        Err(e) => {
                            warn!(error = %e, "receive session failed");
                            break "read error";
                        }
                    },
                }
            };
            debug!(reason, "receive session ended");
            core.status.set(ConnectionStatus::Disconnected);
        });

        Ok(rx)
    }

    /// Idempotent teardown: cancel the reader, shut the write half down,
    /// drop both halves, emit `Disconnected`.
    pub(crate) async fn close(&self) {
        self.cancel.cancel();
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.lock().take();
        self.status.set(ConnectionStatus::Disconnected);
    }
}

// ---------------------------------------------------------------------------
// Connect/backoff loop
// ---------------------------------------------------------------------------

/// Boxed dial attempt used by [`connect_with_backoff`].
pub(crate) type DialFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Run `dial` up to `max_retries` times with exponential backoff, emitting
/// the connect-path statuses along the way. Transient faults retry;
/// unrecoverable errors short-circuit with `Failed`; cancellation during
/// backoff surfaces as [`SbmError::Cancelled`] with a `Cancelled` status.
///
/// The success status is *not* emitted here; callers flip it once the
/// established stream is fully installed.
pub(crate) async fn connect_with_backoff<T>(
    status: &StatusCell,
    cancel: &CancellationToken,
    reconnecting: bool,
    max_retries: u32,
    base_delay: Duration,
    mut dial: impl FnMut() -> DialFuture<T>,
) -> Result<T> {
    status.set(if reconnecting {
        ConnectionStatus::Reconnecting
    } else {
        ConnectionStatus::Connecting
    });

    let attempts = max_retries.max(1);
    let mut last_error = String::from("no attempt made");

    for attempt in 1..=attempts {
        if cancel.is_cancelled() {
            status.set(ConnectionStatus::Cancelled);
            return Err(SbmError::Cancelled);
        }

        match dial().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => {
                warn!(attempt, error = %e, "connect attempt failed");
                last_error = e.to_string();
                if attempt < attempts {
                    let delay = base_delay * 2u32.saturating_pow(attempt - 1);
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = cancel.cancelled() => {
                            status.set(ConnectionStatus::Cancelled);
                            return Err(SbmError::Cancelled);
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, "unrecoverable connect failure");
                status.set(ConnectionStatus::Failed);
                return Err(e);
            }
        }
    }

    status.set(ConnectionStatus::Failed);
    Err(SbmError::ConnectFailed {
        attempts,
        last_error,
    })
}
