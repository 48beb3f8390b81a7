//! # Client Endpoint
//!
//! A [`ClientSocket`] owns one transport and one dispatcher. It initiates
//! the connection, adopts the server-assigned identity announced on the
//! internal `_client_id_` channel, and runs the authentication handshake on
//! the reserved `_auth_` channel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tracing::debug;
use uuid::Uuid;

use crate::defaults;
use crate::dispatcher::{Dispatcher, EventArg, EventKind, Registration};
use crate::error::Result;
use crate::message::{Message, AUTH_CHANNEL, CLIENT_ID_CHANNEL};
use crate::transport::Transport;

/// Client endpoint: one transport, one dispatcher, one connection.
pub struct ClientSocket {
    transport: Arc<dyn Transport>,
    dispatcher: Arc<Dispatcher>,
}

impl ClientSocket {
    /// Wrap `transport` into a client endpoint. The endpoint starts with a
    /// fresh random identity and adopts the server-assigned one as soon as
    /// it is announced.
    pub fn new(transport: Arc<dyn Transport>) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(transport.clone()));
        let client = Arc::new(Self {
            transport,
            dispatcher,
        });

        let weak = Arc::downgrade(&client.dispatcher);
        client
            .dispatcher
            .on_message(CLIENT_ID_CHANNEL, move |message: Message| {
                let weak = weak.clone();
                async move {
                    let Some(dispatcher) = weak.upgrade() else {
                        return Ok(());
                    };
                    let id = message
                        .field_str("ClientId")
                        .and_then(|raw| Uuid::parse_str(raw).ok())
                        .ok_or_else(|| anyhow::anyhow!("malformed client id announcement"))?;
                    debug!(%id, "adopted server-assigned client id");
                    dispatcher.set_own_id(id);
                    dispatcher
                        .broadcast_event(
                            EventKind::ClientIdReceived,
                            Some(Arc::new(id) as EventArg),
                        )
                        .await;
                    Ok(())
                }
            });

        client
    }

    /// The dispatcher, for handler and event registration.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// This endpoint's current identity (server-assigned once announced).
    pub fn client_id(&self) -> Uuid {
        self.dispatcher.own_id()
    }

    /// Connect with the default retry budget and start dispatching.
    pub async fn connect(&self) -> Result<()> {
        self.connect_with(defaults::CONNECT_RETRIES, defaults::CONNECT_BASE_DELAY)
            .await
    }

    /// Connect with an explicit retry budget and start dispatching.
    pub async fn connect_with(&self, max_retries: u32, base_delay: Duration) -> Result<()> {
        self.transport.connect(max_retries, base_delay).await?;
        self.dispatcher.start()
    }

    /// Run the authentication handshake. Returns the server's verdict.
    ///
    /// Builds an `_auth_` request carrying `{Id, Key, Scope?}`, awaits the
    /// correlated `{Success}` reply, and flips the transport status to
    /// `Authenticated` on success.
    pub async fn authenticate(
        &self,
        id: &str,
        key: &str,
        scope: Option<&str>,
    ) -> Result<bool> {
        self.transport.on_authenticating();

        let mut payload = json!({"Id": id, "Key": key});
        if let Some(scope) = scope {
            payload["Scope"] = json!(scope);
        }

        let reply = self
            .dispatcher
            .send_request(Message::new(AUTH_CHANNEL, payload))
            .await?;
        let success = reply.field_bool("Success").unwrap_or(false);
        if success {
            self.transport.on_authenticated();
        }
        Ok(success)
    }

    /// Fire-and-forget send.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.dispatcher.send(message).await
    }

    /// Request/response with the default timeout.
    pub async fn send_request(&self, request: Message) -> Result<Message> {
        self.dispatcher.send_request(request).await
    }

    /// Request/response with an explicit timeout.
    pub async fn send_request_timeout(
        &self,
        request: Message,
        timeout: Duration,
    ) -> Result<Message> {
        self.dispatcher.send_request_timeout(request, timeout).await
    }

    /// Subscribe to dispatcher events (connection status, id assignment).
    pub fn on_event<F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        F: Fn(Option<EventArg>) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        self.dispatcher.on_event(kind, f)
    }

    /// Tear the connection down. Idempotent.
    pub async fn close(&self) {
        self.dispatcher.dispose().await;
    }
}
