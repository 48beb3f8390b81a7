//! Plain-TCP transport.
//!
//! Client side dials with exponential backoff; server side wraps streams
//! already accepted by a listener. Either way the established stream is
//! split into boxed halves and handed to the shared [`StreamCore`] engine,
//! which owns framing, the write lock, and the reader task.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{
    connect_with_backoff, ConnectionStatus, StreamCore, Transport,
};
use crate::codec::{Codec, MessagePackCodec};
use crate::defaults;
use crate::error::Result;
use crate::message::Message;

/// Disable Nagle and enable keepalive on an established TCP stream.
pub(crate) fn tune_socket(stream: &TcpStream) -> Result<()> {
    let sock = socket2::SockRef::from(stream);
    sock.set_nodelay(true)?;
    sock.set_keepalive(true)?;
    Ok(())
}

/// Length-prefix framed messaging over plain TCP.
pub struct TcpTransport {
    addr: String,
    core: Arc<StreamCore>,
}

impl TcpTransport {
    /// Client-side transport dialing `addr` (`host:port`) with the
    /// reference codec and default frame ceiling.
    pub fn new(addr: impl Into<String>) -> Self {
        Self::with_codec(addr, Arc::new(MessagePackCodec), defaults::MAX_FRAME_BYTES)
    }

    /// Client-side transport with an explicit codec and frame ceiling.
    pub fn with_codec(
        addr: impl Into<String>,
        codec: Arc<dyn Codec>,
        max_frame_bytes: usize,
    ) -> Self {
        Self {
            addr: addr.into(),
            core: Arc::new(StreamCore::new(codec, max_frame_bytes)),
        }
    }

    /// Wrap a stream already accepted by a listener. The transport starts
    /// out connected; `connect` on it is a no-op.
    pub async fn from_accepted(
        stream: TcpStream,
        codec: Arc<dyn Codec>,
        max_frame_bytes: usize,
    ) -> Result<Self> {
        tune_socket(&stream)?;
        let addr = stream
            .peer_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| "<unknown>".into());
        let core = Arc::new(StreamCore::new(codec, max_frame_bytes));
        let (reader, writer) = tokio::io::split(stream);
        core.install(Box::new(reader), Box::new(writer)).await;
        Ok(Self { addr, core })
    }

    /// The peer address this transport dials or was accepted from.
    pub fn addr(&self) -> &str {
        &self.addr
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn connect(&self, max_retries: u32, base_delay: Duration) -> Result<()> {
        if self.core.is_connected() {
            return Ok(());
        }

        let dial_addr = self.addr.clone();
        let stream = connect_with_backoff(
            self.core.status_cell(),
            self.core.cancel_token(),
            self.core.has_had_session(),
            max_retries,
            base_delay,
            move || {
                let addr = dial_addr.clone();
                Box::pin(async move {
                    let stream = TcpStream::connect(&addr).await?;
                    tune_socket(&stream)?;
                    Ok(stream)
                })
            },
        )
        .await?;

        debug!(addr = %self.addr, "tcp stream established");
        let (reader, writer) = tokio::io::split(stream);
        self.core.install(Box::new(reader), Box::new(writer)).await;
        Ok(())
    }

    async fn send(&self, message: &Message) -> Result<()> {
        self.core.send(message).await
    }

    fn receive(&self) -> Result<mpsc::Receiver<Message>> {
        self.core.begin_receive()
    }

    fn on_authenticating(&self) {
        self.core.status_cell().set(ConnectionStatus::Authenticating);
    }

    fn on_authenticated(&self) {
        self.core.status_cell().set(ConnectionStatus::Authenticated);
    }

    async fn close(&self) -> Result<()> {
        self.core.close().await;
        Ok(())
    }

    fn status(&self) -> ConnectionStatus {
        self.core.status_cell().get()
    }

    fn subscribe_status(&self) -> broadcast::Receiver<ConnectionStatus> {
        self.core.status_cell().subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn loopback_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let transport = TcpTransport::from_accepted(
                stream,
                Arc::new(MessagePackCodec),
                defaults::MAX_FRAME_BYTES,
            )
            .await
            .unwrap();
            let mut rx = transport.receive().unwrap();
            let inbound = rx.recv().await.unwrap();
            assert_eq!(inbound.channel, "ping");
            transport
                .send(&Message::new("pong", json!("back")))
                .await
                .unwrap();
            // Hold the transport open until the peer has read the reply.
            let _ = rx.recv().await;
        });

        let client = TcpTransport::new(addr.to_string());
        client.connect(3, Duration::from_millis(10)).await.unwrap();
        assert_eq!(client.status(), ConnectionStatus::Connected);

        let mut rx = client.receive().unwrap();
        client.send(&Message::new("ping", json!("hi"))).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.channel, "pong");

        client.close().await.unwrap();
        server.await.unwrap();
    }

    #[tokio::test]
    async fn connect_failure_exhausts_retries() {
        // Bind-then-drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let client = TcpTransport::new(addr.to_string());
        let mut status_rx = client.subscribe_status();
        let err = client.connect(2, Duration::from_millis(5)).await.unwrap_err();
        assert!(matches!(
            err,
            crate::error::SbmError::ConnectFailed { attempts: 2, .. }
        ));

        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Connecting);
        assert_eq!(status_rx.recv().await.unwrap(), ConnectionStatus::Failed);
        assert_eq!(client.status(), ConnectionStatus::Failed);
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = TcpTransport::new("127.0.0.1:1");
        client.close().await.unwrap();
        client.close().await.unwrap();
        assert_eq!(client.status(), ConnectionStatus::Disconnected);
    }
}
