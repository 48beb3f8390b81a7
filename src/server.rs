//! # Server Endpoint
//!
//! A [`ServerSocket`] owns a listener (plain TCP, TLS, or WebSocket,
//! chosen at construction) and a registry of connected clients. Every
//! accepted stream is wrapped in its own transport and
//! [`ConnectedClient`] dispatcher:
//!
//! 1. transport construction (TLS server handshake / WebSocket upgrade)
//! 2. fresh client id, registry insert, id announcement to the peer
//! 3. `on_client_connected` callbacks, strictly before the first dispatch
//! 4. inbound loop start
//!
//! Connection teardown is event-driven: each connected-client dispatcher
//! emits a final `Disconnected` event, which removes the registry entry and
//! runs the `on_client_disconnected` callbacks; the server never polls.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Weak};

use futures_util::future::join_all;
use parking_lot::RwLock;
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::{AuthContext, AuthHandlerFn, AuthRequest, ConnectedClient};
use crate::codec::{Codec, MessagePackCodec};
use crate::defaults;
use crate::dispatcher::{ErrorHandlerFn, EventKind};
use crate::error::{Result, SbmError};
use crate::message::{Message, CLIENT_ID_CHANNEL};
use crate::transport::tls::{build_acceptor, TlsServerOptions};
use crate::transport::websocket::accept_websocket;
use crate::transport::{
    BoxedStream, ConnectionStatus, TcpTransport, TlsTransport, Transport, WsTransport,
};

/// The listener flavor a server speaks.
pub enum ListenerKind {
    /// Length-prefixed frames over plain TCP.
    Tcp,
    /// Length-prefixed frames over TLS.
    Tls(TlsServerOptions),
    /// Binary WebSocket messages over plain TCP (`ws://`).
    WebSocket,
    /// Binary WebSocket messages over TLS (`wss://`).
    WebSocketTls(TlsServerOptions),
}

/// Server construction parameters.
pub struct ServerConfig {
    /// Bind address, `host:port`. Port 0 picks an ephemeral port; the
    /// bound address is returned from [`ServerSocket::start`].
    pub bind_addr: String,
    pub listener: ListenerKind,
    /// When set, unauthenticated clients may only speak the handshake
    /// channel; everything else is dropped per message.
    pub disallow_anonymous: bool,
    /// Inbound frame ceiling applied to every accepted connection.
    pub max_frame_bytes: usize,
}

impl ServerConfig {
    pub fn tcp(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            listener: ListenerKind::Tcp,
            disallow_anonymous: false,
            max_frame_bytes: defaults::MAX_FRAME_BYTES,
        }
    }

    pub fn tls(bind_addr: impl Into<String>, options: TlsServerOptions) -> Self {
        Self {
            listener: ListenerKind::Tls(options),
            ..Self::tcp(bind_addr)
        }
    }

    pub fn websocket(bind_addr: impl Into<String>) -> Self {
        Self {
            listener: ListenerKind::WebSocket,
            ..Self::tcp(bind_addr)
        }
    }

    pub fn websocket_tls(bind_addr: impl Into<String>, options: TlsServerOptions) -> Self {
        Self {
            listener: ListenerKind::WebSocketTls(options),
            ..Self::tcp(bind_addr)
        }
    }

    /// Reject non-handshake traffic from unauthenticated clients.
    pub fn disallow_anonymous(mut self) -> Self {
        self.disallow_anonymous = true;
        self
    }
}

type ClientCallbackFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type ClientCallbackFn = Arc<dyn Fn(Arc<ConnectedClient>) -> ClientCallbackFuture + Send + Sync>;

/// Multi-client server endpoint.
pub struct ServerSocket {
    config: ServerConfig,
    codec: Arc<dyn Codec>,
    clients: RwLock<HashMap<Uuid, Arc<ConnectedClient>>>,
    auth_handler: RwLock<Option<AuthHandlerFn>>,
    error_handler: RwLock<Option<ErrorHandlerFn>>,
    connected_callbacks: RwLock<Vec<ClientCallbackFn>>,
    disconnected_callbacks: RwLock<Vec<ClientCallbackFn>>,
    cancel: CancellationToken,
    local_addr: RwLock<Option<SocketAddr>>,
}

impl ServerSocket {
    /// Create a server with the reference codec.
    pub fn new(config: ServerConfig) -> Arc<Self> {
        Self::with_codec(config, Arc::new(MessagePackCodec))
    }

    /// Create a server with an explicit codec shared by every accepted
    /// connection.
    pub fn with_codec(config: ServerConfig, codec: Arc<dyn Codec>) -> Arc<Self> {
        Arc::new(Self {
            config,
            codec,
            clients: RwLock::new(HashMap::new()),
            auth_handler: RwLock::new(None),
            error_handler: RwLock::new(None),
            connected_callbacks: RwLock::new(Vec::new()),
            disconnected_callbacks: RwLock::new(Vec::new()),
            cancel: CancellationToken::new(),
            local_addr: RwLock::new(None),
        })
    }

    /// Install the credential-verification callback consulted by every
    /// handshake.
    pub fn set_auth_handler<F, Fut>(&self, f: F)
    where
        F: Fn(AuthRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = AuthContext> + Send + 'static,
    {
        *self.auth_handler.write() = Some(Arc::new(move |request| Box::pin(f(request))));
    }

    /// Install the error-reply hook propagated to every connected-client
    /// dispatcher.
    pub fn set_error_handler<F>(&self, f: F)
    where
        F: Fn(&Message, &anyhow::Error) -> Option<Message> + Send + Sync + 'static,
    {
        *self.error_handler.write() = Some(Arc::new(f));
    }

    /// Run `f` for every newly accepted client, before its first dispatch.
    pub fn on_client_connected<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<ConnectedClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.connected_callbacks
            .write()
            .push(Arc::new(move |client| Box::pin(f(client))));
    }

    /// Run `f` after a client's connection ends and its registry entry is
    /// gone.
    pub fn on_client_disconnected<F, Fut>(&self, f: F)
    where
        F: Fn(Arc<ConnectedClient>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.disconnected_callbacks
            .write()
            .push(Arc::new(move |client| Box::pin(f(client))));
    }

    /// Bind the listener and spawn the accept loop. Returns the bound
    /// address.
    pub async fn start(self: &Arc<Self>) -> Result<SocketAddr> {
        // Certificate problems surface here, not per connection.
        let acceptor = match &self.config.listener {
            ListenerKind::Tls(options) | ListenerKind::WebSocketTls(options) => {
                Some(build_acceptor(options)?)
            }
            _ => None,
        };

        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let addr = listener.local_addr()?;
        *self.local_addr.write() = Some(addr);
        info!(%addr, "server listening");

        let this = Arc::clone(self);
        tokio::spawn(async move { this.accept_loop(listener, acceptor).await });
        Ok(addr)
    }

    async fn accept_loop(self: Arc<Self>, listener: TcpListener, acceptor: Option<TlsAcceptor>) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "accepted connection");
                        let this = Arc::clone(&self);
                        let acceptor = acceptor.clone();
                        tokio::spawn(async move {
                            if let Err(e) = this.admit(stream, acceptor).await {
                                warn!(%peer, error = %e, "failed to admit client");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }

    /// Wrap one accepted stream into a connected client and start it.
    async fn admit(self: &Arc<Self>, stream: TcpStream, acceptor: Option<TlsAcceptor>) -> Result<()> {
        let transport: Arc<dyn Transport> = match &self.config.listener {
            ListenerKind::Tcp => Arc::new(
                TcpTransport::from_accepted(
                    stream,
                    self.codec.clone(),
                    self.config.max_frame_bytes,
                )
                .await?,
            ),
            ListenerKind::Tls(_) => {
                let acceptor = acceptor
                    .ok_or_else(|| SbmError::Config("missing TLS acceptor".into()))?;
                Arc::new(
                    TlsTransport::from_accepted(
                        stream,
                        &acceptor,
                        self.codec.clone(),
                        self.config.max_frame_bytes,
                    )
                    .await?,
                )
            }
            ListenerKind::WebSocket => {
                match accept_websocket(Box::new(stream) as BoxedStream).await? {
                    Some(ws) => Arc::new(WsTransport::from_accepted(
                        ws,
                        self.codec.clone(),
                        self.config.max_frame_bytes,
                    )),
                    // Answered with 400 and closed; nothing to admit.
                    None => return Ok(()),
                }
            }
            ListenerKind::WebSocketTls(_) => {
                let acceptor = acceptor
                    .ok_or_else(|| SbmError::Config("missing TLS acceptor".into()))?;
                let tls = acceptor.accept(stream).await?;
                match accept_websocket(Box::new(tls) as BoxedStream).await? {
                    Some(ws) => Arc::new(WsTransport::from_accepted(
                        ws,
                        self.codec.clone(),
                        self.config.max_frame_bytes,
                    )),
                    None => return Ok(()),
                }
            }
        };

        let client_id = Uuid::new_v4();
        let client = ConnectedClient::new(
            client_id,
            transport,
            self.auth_handler.read().clone(),
            self.error_handler.read().clone(),
            self.config.disallow_anonymous,
        );

        self.clients.write().insert(client_id, client.clone());

        // Announce the assigned identity before any application traffic.
        let announced = client
            .dispatcher()
            .send(Message::new(
                CLIENT_ID_CHANNEL,
                json!({"ClientId": client_id.to_string()}),
            ))
            .await;
        if let Err(e) = announced {
            self.clients.write().remove(&client_id);
            return Err(e);
        }

        let connected: Vec<ClientCallbackFn> = self.connected_callbacks.read().clone();
        for callback in connected {
            callback(client.clone()).await;
        }

        // Registry cleanup rides the dispatcher's final Disconnected event.
        let server: Weak<ServerSocket> = Arc::downgrade(self);
        client.dispatcher().on_event_typed::<ConnectionStatus, _, _>(
            EventKind::ConnectionStatusChanged,
            move |status| {
                let server = server.clone();
                async move {
                    if *status == ConnectionStatus::Disconnected {
                        if let Some(server) = server.upgrade() {
                            server.drop_client(client_id).await;
                        }
                    }
                }
            },
        );

        if let Err(e) = client.dispatcher().start() {
            self.clients.write().remove(&client_id);
            return Err(e);
        }
        info!(%client_id, "client connected");
        Ok(())
    }

    async fn drop_client(&self, id: Uuid) {
        let removed = self.clients.write().remove(&id);
        if let Some(client) = removed {
            // Release the dispatcher and its transport; a peer-initiated
            // disconnect must not leave the connection's tasks behind.
            client.dispose().await;
            info!(client_id = %id, "client disconnected");
            let callbacks: Vec<ClientCallbackFn> = self.disconnected_callbacks.read().clone();
            for callback in callbacks {
                callback(client.clone()).await;
            }
        }
    }

    /// Fan `message` out to every connected client concurrently. Individual
    /// send failures are logged, not propagated.
    pub async fn broadcast(&self, message: Message) {
        let clients: Vec<Arc<ConnectedClient>> = self.clients.read().values().cloned().collect();
        debug!(recipients = clients.len(), channel = %message.channel, "broadcast");
        let sends = clients.into_iter().map(|client| {
            let message = message.clone();
            async move {
                if let Err(e) = client.send(message).await {
                    warn!(client_id = %client.client_id(), error = %e, "broadcast send failed");
                }
            }
        });
        join_all(sends).await;
    }

    /// Send `message` to one client, stamping it as targeted at the
    /// recipient.
    pub async fn send_to_client(&self, id: Uuid, mut message: Message) -> Result<()> {
        let client = self
            .clients
            .read()
            .get(&id)
            .cloned()
            .ok_or(SbmError::ClientNotConnected(id))?;
        message.target_id = Some(id);
        client.send(message).await
    }

    /// Look a connected client up by id.
    pub fn client(&self, id: Uuid) -> Option<Arc<ConnectedClient>> {
        self.clients.read().get(&id).cloned()
    }

    /// Ids of all currently connected clients.
    pub fn client_ids(&self) -> Vec<Uuid> {
        self.clients.read().keys().copied().collect()
    }

    /// Number of currently connected clients.
    pub fn client_count(&self) -> usize {
        self.clients.read().len()
    }

    /// Drop a client from the registry without touching its connection.
    /// Returns whether an entry was removed.
    pub fn remove_client(&self, id: Uuid) -> bool {
        self.clients.write().remove(&id).is_some()
    }

    /// The bound address, once [`start`](Self::start) has returned.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.read()
    }

    /// Stop accepting and dispose every connected client. Idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let clients: Vec<Arc<ConnectedClient>> = {
            let mut map = self.clients.write();
            map.drain().map(|(_, client)| client).collect()
        };
        for client in clients {
            client.dispose().await;
        }
        info!("server stopped");
    }
}
