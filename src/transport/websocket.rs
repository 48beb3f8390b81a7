//! WebSocket transport.
//!
//! Each codec-encoded message travels as exactly one binary WebSocket
//! message with no extra length prefix; the WebSocket layer supplies its
//! own framing, and the library reassembles fragmented inbound messages
//! before they surface here. A `Close` message ends the receive session
//! cleanly.
//!
//! The client side dials `ws://host:port/` or `wss://host:port/` URLs,
//! reusing the TLS policy machinery for `wss`. The server side sniffs the
//! HTTP request head on an accepted stream so that non-WebSocket requests
//! can be answered with a plain `400 Bad Request` before the upgrade
//! handshake is attempted.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_rustls::TlsConnector;
use tokio_tungstenite::tungstenite::http::Uri;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::tcp::tune_socket;
use super::tls::{client_tls_config, TlsClientOptions};
use super::{connect_with_backoff, BoxedStream, ConnectionStatus, StatusCell, Transport};
use crate::codec::{Codec, MessagePackCodec};
use crate::defaults;
use crate::error::{Result, SbmError};
use crate::message::Message;

/// A WebSocket session over a type-erased byte stream; covers plain TCP,
/// client TLS, and server TLS uniformly.
pub(crate) type WsIo = WebSocketStream<BoxedStream>;

/// Largest HTTP request head accepted during the server-side upgrade sniff.
const MAX_REQUEST_HEAD: usize = 16 * 1024;

fn ws_fault(e: WsError) -> SbmError {
    match e {
        WsError::Io(io) => SbmError::Transport(io),
        other => SbmError::Framing(other.to_string()),
    }
}

/// Binary-message framed transport over WebSocket.
pub struct WsTransport {
    url: String,
    tls: Option<TlsClientOptions>,
    codec: Arc<dyn Codec>,
    max_frame_bytes: usize,
    sink: tokio::sync::Mutex<Option<SplitSink<WsIo, WsMessage>>>,
    source: Mutex<Option<SplitStream<WsIo>>>,
    status: Arc<StatusCell>,
    cancel: CancellationToken,
    was_connected: AtomicBool,
}

impl WsTransport {
    /// Client-side transport dialing `url` (`ws://...` or `wss://...`)
    /// with the reference codec and default frame ceiling. For `wss` the
    /// URL host doubles as the TLS server name with full verification.
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_codec(url, None, Arc::new(MessagePackCodec), defaults::MAX_FRAME_BYTES)
    }

    /// Client-side `wss` transport with an explicit TLS policy.
    pub fn with_tls(url: impl Into<String>, tls: TlsClientOptions) -> Self {
        Self::with_codec(
            url,
            Some(tls),
            Arc::new(MessagePackCodec),
            defaults::MAX_FRAME_BYTES,
        )
    }

    /// Client-side transport with every knob exposed.
    pub fn with_codec(
        url: impl Into<String>,
        tls: Option<TlsClientOptions>,
        codec: Arc<dyn Codec>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            url: url.into(),
            tls,
            codec,
            max_frame_bytes,
            sink: tokio::sync::Mutex::new(None),
            source: Mutex::new(None),
            status: Arc::new(StatusCell::new()),
            cancel: CancellationToken::new(),
            was_connected: AtomicBool::new(false),
        }
    }

    /// Wrap an already-upgraded server-side session. The transport starts
    /// out connected; `connect` on it is a no-op.
    pub(crate) fn from_accepted(
        ws: WsIo,
        codec: Arc<dyn Codec>,
        max_frame_bytes: usize,
    ) -> Self {
        let (sink, source) = ws.split();
        let status = Arc::new(StatusCell::new());
        status.set(ConnectionStatus::Connected);
        Self {
            url: "<accepted>".into(),
            tls: None,
            codec,
            max_frame_bytes,
            sink: tokio::sync::Mutex::new(Some(sink)),
            source: Mutex::new(Some(source)),
            status,
            cancel: CancellationToken::new(),
            was_connected: AtomicBool::new(true),
        }
    }

    fn is_connected(&self) -> bool {
        matches!(
            self.status.get(),
            ConnectionStatus::Connected
                | ConnectionStatus::Reconnected
                | ConnectionStatus::Authenticating
                | ConnectionStatus::Authenticated
        )
    }

    async fn install(&self, ws: WsIo) {
        let (sink, source) = ws.split();
        *self.sink.lock().await = Some(sink);
        *self.source.lock() = Some(source);
        let again = self.was_connected.swap(true, Ordering::SeqCst);
        self.status.set(if again {
            ConnectionStatus::Reconnected
        } else {
            ConnectionStatus::Connected
        });
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }

        let uri: Uri = self
            .url
            .parse()
            .map_err(|e| SbmError::Config(format!("invalid websocket url: {e}")))?;
        let secure = match uri.scheme_str() {
            Some("ws") => false,
            Some("wss") => true,
            other => {
                return Err(SbmError::Config(format!(
                    "unsupported websocket scheme: {other:?}"
                )))
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| SbmError::Config("websocket url has no host".into()))?
            .to_string();
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let connector = if secure {
            let options = self
                .tls
                .clone()
                .unwrap_or_else(|| TlsClientOptions::new(host.clone()));
            let server_name = ServerName::try_from(options.server_name.clone())
                .map_err(|e| SbmError::Config(format!("invalid TLS server name: {e}")))?;
            Some((TlsConnector::from(client_tls_config(&options)?), server_name))
        } else {
            None
        };

        let url = self.url.clone();
        let ws = connect_with_backoff(
            &self.status,
            &self.cancel,
            self.was_connected.load(Ordering::SeqCst),
            max_retries,
            base_delay,
            move || {
                let url = url.clone();
                let host = host.clone();
                let connector = connector.clone();
                Box::pin(async move {
                    let tcp = TcpStream::connect((host.as_str(), port)).await?;
                    tune_socket(&tcp)?;
                    let stream: BoxedStream = match &connector {
                        Some((tls, name)) => Box::new(tls.connect(name.clone(), tcp).await?),
                        None => Box::new(tcp),
                    };
                    let (ws, _response) =
                        tokio_tungstenite::client_async(url.as_str(), stream)
                            .await
                            .map_err(|e| {
                                SbmError::Framing(format!("websocket handshake failed: {e}"))
                            })?;
                    Ok(ws)
                })
            },
        )
        .await?;

        debug!(url = %self.url, "websocket session established");
        self.install(ws).await;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        let bytes = self.codec.encode(message)?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(SbmError::NotConnected)?;
        sink.send(WsMessage::binary(bytes)).await.map_err(ws_fault)
    }

    fn receive(&self) -> Result<mpsc::Receiver<Message>> {
        let mut source = self
            .source
            .lock()
            .take()
            .ok_or(SbmError::NotConnected)?;

        let (tx, rx) = mpsc::channel(defaults::RECEIVE_BUFFER_MESSAGES);
        let codec = self.codec.clone();
        let max_frame_bytes = self.max_frame_bytes;
        let cancel = self.cancel.clone();
        let status = self.status.clone();

        tokio::spawn(async move {
            let reason = loop {
                tokio::select! {
                    _ = cancel.cancelled() => break "cancelled",
                    item = source.next() => match item {
                        Some(Ok(WsMessage::Binary(bytes))) => {
                            if bytes.len() > max_frame_bytes {
                                warn!(
                                    len = bytes.len(),
                                    "inbound websocket message exceeds frame ceiling"
                                );
                                break "oversized message";
                            }
                            match codec.decode(&bytes) {
                                Ok(message) => {
                                    if tx.send(message).await.is_err() {
                                        break "consumer dropped";
                                    }
                                }
                                Err(e) => {
                                    warn!(error = %e, "receive session ending on decode failure");
                                    break "decode error";
                                }
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) => break "peer closed",
                        Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => {}
                        Some(Ok(_)) => {
                            debug!("ignoring non-binary websocket message");
                        }
                        Some(Err(e)) => {
                            warn!(error = %e, "receive session failed");
                            break "read error";
                        }
                        None => break "stream ended",
                    },
                }
            };
            debug!(reason, "receive session ended");
            status.set(ConnectionStatus::Disconnected);
        });

        Ok(rx)
    }

    fn on_authenticating(&self) {
        self.status.set(ConnectionStatus::Authenticating);
    }

    fn on_authenticated(&self) {
        self.status.set(ConnectionStatus::Authenticated);
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        if let Some(mut sink) = self.sink.lock().await.take() {
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
        }
        self.source.lock().take();
        self.status.set(ConnectionStatus::Disconnected);
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.status.get()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Server-side upgrade handling
// ---------------------------------------------------------------------------

/// Sniff the HTTP request head on an accepted stream and perform the
/// WebSocket upgrade.
///
/// Returns `Ok(None)` when the request was not a WebSocket upgrade: the
/// peer gets `400 Bad Request` and the stream is closed. The consumed head
/// bytes are replayed into the handshake via [`Rewind`], so the upgrade
/// machinery sees the request from its first byte.
pub(crate) async fn accept_websocket(mut io: BoxedStream) -> Result<Option<WsIo>> {
    let mut head = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        if head.len() > MAX_REQUEST_HEAD {
            return Err(SbmError::Framing(
                "oversized websocket handshake request".into(),
            ));
        }
        let n = io.read(&mut chunk).await?;
        if n == 0 {
            // Peer hung up mid-handshake.
            return Ok(None);
        }
        head.extend_from_slice(&chunk[..n]);
        if head.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }

    if !is_websocket_upgrade(&head) {
        debug!("rejecting non-websocket http request");
        io.write_all(b"HTTP/1.1 400 Bad Request\r\nconnection: close\r\ncontent-length: 0\r\n\r\n")
            .await?;
        let _ = io.shutdown().await;
        return Ok(None);
    }

    let rewound: BoxedStream = Box::new(Rewind::new(head, io));
    let ws = tokio_tungstenite::accept_async(rewound)
        .await
        .map_err(|e| SbmError::Framing(format!("websocket handshake failed: {e}")))?;
    Ok(Some(ws))
}

fn is_websocket_upgrade(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    text.lines().any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    })
}

/// Replays already-consumed bytes ahead of the inner stream. Used to hand a
/// sniffed request head back to the WebSocket handshake.
struct Rewind {
    prefix: Vec<u8>,
    pos: usize,
    inner: BoxedStream,
}

impl Rewind {
    fn new(prefix: Vec<u8>, inner: BoxedStream) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl AsyncRead for Rewind {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.pos < this.prefix.len() {
            let n = buf.remaining().min(this.prefix.len() - this.pos);
            buf.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for Rewind {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}
