//! # SBM: Simple Bidirectional Messaging
//!
//! A framework for symmetric, channel-addressed message exchange over a
//! long-lived connection. A server accepts many clients; each side may
//! register channel handlers, send fire-and-forget messages, issue
//! requests that correlate with replies, and observe connection-lifecycle
//! events. Messages are length-prefixed, binary-serialized payloads.
//!
//! ## Architecture
//!
//! ```text
//! bytes ⇄ Transport ⇄ Codec ⇄ Message ⇄ Dispatcher ⇄ Handlers
//! ```
//!
//! - [`transport`]: framed full-duplex streams over TCP, TLS, or WebSocket,
//!   with connect/retry, status events, and graceful teardown
//! - [`codec`]: the pluggable byte-level message codec (MessagePack
//!   reference implementation)
//! - [`dispatcher`]: per-connection handler registry, inbound loop, reply
//!   correlation with timeouts, and event bus
//! - [`client`] / [`server`]: the two endpoint flavors; both sides are
//!   symmetric from the dispatcher down
//! - [`auth`]: the challenge/response handshake and access-control guards
//!   layered on dispatch
//!
//! ## A minimal echo pair
//!
//! ```no_run
//! use std::sync::Arc;
//! use serde_json::json;
//! use sbm::{ClientSocket, Message, ServerConfig, ServerSocket, TcpTransport};
//!
//! # async fn run() -> sbm::Result<()> {
//! let server = ServerSocket::new(ServerConfig::tcp("127.0.0.1:0"));
//! server.on_client_connected(|client| async move {
//!     client.dispatcher().on_request("echo", |msg: Message| async move {
//!         let data = msg.data.clone().unwrap_or_default();
//!         Ok(Some(Message::from_reply(&msg, data)))
//!     });
//! });
//! let addr = server.start().await?;
//!
//! let client = ClientSocket::new(Arc::new(TcpTransport::new(addr.to_string())));
//! client.connect().await?;
//! let reply = client.send_request(Message::new("echo", json!("hi"))).await?;
//! assert_eq!(reply.data, Some(json!("hi")));
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod client;
pub mod codec;
pub mod dispatcher;
pub mod error;
pub mod logging;
pub mod message;
pub mod server;
pub mod transport;

pub use auth::{AuthContext, AuthRequest, AuthStatus, ConnectedClient};
pub use client::ClientSocket;
pub use codec::{Codec, MessagePackCodec};
pub use dispatcher::{Dispatcher, EventArg, EventKind, Registration};
pub use error::{Result, SbmError};
pub use message::{Message, AUTH_CHANNEL, CLIENT_ID_CHANNEL, SERVER_ID};
pub use server::{ListenerKind, ServerConfig, ServerSocket};
pub use transport::{
    ConnectionStatus, TcpTransport, TlsClientOptions, TlsServerOptions, TlsTransport, Transport,
    WsTransport,
};

/// The current crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default tuning values shared across the crate.
pub mod defaults {
    use std::time::Duration;

    /// Timeout applied by `send_request` when none is given.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

    /// Connect attempts made by `ClientSocket::connect`.
    pub const CONNECT_RETRIES: u32 = 5;

    /// Base backoff delay between connect attempts.
    pub const CONNECT_BASE_DELAY: Duration = Duration::from_millis(250);

    /// Largest inbound frame a transport will accept.
    pub const MAX_FRAME_BYTES: usize = 16 * 1024 * 1024;

    /// Depth of a receive session's message channel.
    pub const RECEIVE_BUFFER_MESSAGES: usize = 256;

    /// Depth of the connection-status broadcast channel.
    pub const STATUS_BUFFER_EVENTS: usize = 64;
}
