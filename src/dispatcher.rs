//! # Message Dispatch Engine
//!
//! A [`Dispatcher`] owns one [`Transport`] and everything that happens to a
//! message after the wire: the per-channel handler registry, the single
//! inbound loop, reply stamping, request/response correlation, and the
//! event bus.
//!
//! ## Handler model
//!
//! Handlers register against a channel in four surface shapes (async or
//! sync, replying or fire-and-forget), all normalized onto one internal
//! contract `Fn(Message) -> Future<anyhow::Result<Option<Message>>>`. Every
//! registration returns a [`Registration`], an idempotent unregister
//! capability. Multiple handlers per channel are permitted and all run, in
//! registration order; only replies produced by *responding* handlers go
//! back to the peer.
//!
//! ## Inbound loop
//!
//! One task drains the transport's receive session. Per message it applies
//! the gate predicate, snapshots the channel's handler list (so a handler
//! may unregister itself or register new handlers mid-dispatch), and runs
//! the handlers sequentially, preserving arrival order per channel. A
//! failing handler is logged (or answered through the configured error
//! handler, if it was a responding handler) and never tears the loop down.
//! When the loop exits, a single `Disconnected` event fires.
//!
//! ## Request/response
//!
//! [`Dispatcher::send_request`] registers a one-shot handler on the derived
//! reply channel *before* sending the request, so a fast reply cannot slip
//! through the gap. The one-shot filters on `reply_to`, resolves the
//! caller's future exactly once, and removes itself; losing the race
//! against the timeout removes it too.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use futures_util::FutureExt;
use parking_lot::{Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::defaults;
use crate::error::{Result, SbmError};
use crate::message::Message;
use crate::transport::{ConnectionStatus, Transport};

/// Event kinds observable on a dispatcher's event bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The transport's connection status changed; the argument is a
    /// [`ConnectionStatus`].
    ConnectionStatusChanged,
    /// The server assigned this endpoint its client id; the argument is a
    /// [`Uuid`].
    ClientIdReceived,
}

/// Dynamically typed event argument. Typed subscribers downcast via
/// [`Dispatcher::on_event_typed`].
pub type EventArg = Arc<dyn Any + Send + Sync>;

type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Option<Message>>> + Send>>;
type HandlerFn = Arc<dyn Fn(Message) -> HandlerFuture + Send + Sync>;
type EventFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type EventFn = Arc<dyn Fn(Option<EventArg>) -> EventFuture + Send + Sync>;
type GateFn = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// Hook that turns a responding handler's failure into a reply message.
pub type ErrorHandlerFn = Arc<dyn Fn(&Message, &anyhow::Error) -> Option<Message> + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    id: u64,
    is_responding: bool,
    func: HandlerFn,
}

#[derive(Clone)]
struct EventEntry {
    id: u64,
    func: EventFn,
}

type HandlerRegistry = Arc<Mutex<HashMap<String, Vec<HandlerEntry>>>>;
type EventRegistry = Arc<Mutex<HashMap<EventKind, Vec<EventEntry>>>>;

/// Idempotent unregister capability returned by every registration.
///
/// Invoking [`unregister`](Registration::unregister) removes exactly the
/// handler that produced it; a second invocation is a no-op. When a
/// channel's (or event kind's) handler list drains, the registry entry is
/// purged.
#[derive(Clone)]
pub struct Registration {
    inner: Arc<RegistrationInner>,
}

enum RegistrationTarget {
    Channel {
        channel: String,
        registry: Weak<Mutex<HashMap<String, Vec<HandlerEntry>>>>,
    },
    Event {
        kind: EventKind,
        registry: Weak<Mutex<HashMap<EventKind, Vec<EventEntry>>>>,
    },
}

struct RegistrationInner {
    id: u64,
    target: RegistrationTarget,
}

impl Registration {
    /// Remove the associated handler. Idempotent.
    pub fn unregister(&self) {
        match &self.inner.target {
            RegistrationTarget::Channel { channel, registry } => {
                if let Some(registry) = registry.upgrade() {
                    let mut map = registry.lock();
                    if let Some(list) = map.get_mut(channel) {
                        list.retain(|entry| entry.id != self.inner.id);
                        if list.is_empty() {
                            map.remove(channel);
                        }
                    }
                }
            }
            RegistrationTarget::Event { kind, registry } => {
                if let Some(registry) = registry.upgrade() {
                    let mut map = registry.lock();
                    if let Some(list) = map.get_mut(kind) {
                        list.retain(|entry| entry.id != self.inner.id);
                        if list.is_empty() {
                            map.remove(kind);
                        }
                    }
                }
            }
        }
    }
}

/// Per-connection dispatch engine. Shared via `Arc`; all methods take
/// `&self`.
pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    handlers: HandlerRegistry,
    events: EventRegistry,
    own_id: RwLock<Uuid>,
    next_registration_id: AtomicU64,
    gate: RwLock<Option<GateFn>>,
    error_handler: RwLock<Option<ErrorHandlerFn>>,
    cancel: CancellationToken,
    started: AtomicBool,
    disposed: AtomicBool,
    disconnect_emitted: AtomicBool,
}

impl Dispatcher {
    /// Create a dispatcher over `transport` with a fresh random identity.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            handlers: Arc::new(Mutex::new(HashMap::new())),
            events: Arc::new(Mutex::new(HashMap::new())),
            own_id: RwLock::new(Uuid::new_v4()),
            next_registration_id: AtomicU64::new(1),
            gate: RwLock::new(None),
            error_handler: RwLock::new(None),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            disconnect_emitted: AtomicBool::new(false),
        }
    }

    /// The identity stamped into `sender_id` on every outgoing message.
    pub fn own_id(&self) -> Uuid {
        *self.own_id.read()
    }

    /// Replace the outgoing identity (server assignment, or the zero id
    /// for server-side dispatchers).
    pub fn set_own_id(&self, id: Uuid) {
        *self.own_id.write() = id;
    }

    /// The transport this dispatcher owns.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Install the inbound admission predicate. A message failing the gate
    /// is logged and dropped before any handler runs.
    pub fn set_gate(&self, gate: GateFn) {
        *self.gate.write() = Some(gate);
    }

    /// Install the hook that synthesizes error replies for failing
    /// responding handlers.
    pub fn set_error_handler(&self, handler: ErrorHandlerFn) {
        *self.error_handler.write() = Some(handler);
    }

    // -----------------------------------------------------------------------
    // Registration
    // -----------------------------------------------------------------------

    fn add_handler(&self, channel: String, is_responding: bool, func: HandlerFn) -> Registration {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .lock()
            .entry(channel.clone())
            .or_default()
            .push(HandlerEntry {
                id,
                is_responding,
                func,
            });
        Registration {
            inner: Arc::new(RegistrationInner {
                id,
                target: RegistrationTarget::Channel {
                    channel,
                    registry: Arc::downgrade(&self.handlers),
                },
            }),
        }
    }

    /// Register an async responding handler: a returned `Some(reply)` is
    /// stamped and sent back to the peer.
    pub fn on_request<F, Fut>(&self, channel: impl Into<String>, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Option<Message>>> + Send + 'static,
    {
        self.add_handler(
            channel.into(),
            true,
            Arc::new(move |message| Box::pin(f(message))),
        )
    }

    /// Register an async fire-and-forget handler; it never produces a
    /// reply.
    pub fn on_message<F, Fut>(&self, channel: impl Into<String>, f: F) -> Registration
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.add_handler(
            channel.into(),
            false,
            Arc::new(move |message| {
                let fut = f(message);
                Box::pin(async move {
                    fut.await?;
                    Ok(None)
                })
            }),
        )
    }

    /// Register a synchronous responding handler.
    pub fn on_request_sync<F>(&self, channel: impl Into<String>, f: F) -> Registration
    where
        F: Fn(Message) -> anyhow::Result<Option<Message>> + Send + Sync + 'static,
    {
        self.add_handler(
            channel.into(),
            true,
            Arc::new(move |message| {
                let out = f(message);
                Box::pin(async move { out })
            }),
        )
    }

    /// Register a synchronous fire-and-forget handler.
    pub fn on_message_sync<F>(&self, channel: impl Into<String>, f: F) -> Registration
    where
        F: Fn(Message) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.add_handler(
            channel.into(),
            false,
            Arc::new(move |message| {
                let out = f(message).map(|_| None);
                Box::pin(async move { out })
            }),
        )
    }

    fn add_event_handler(&self, kind: EventKind, func: EventFn) -> Registration {
        let id = self.next_registration_id.fetch_add(1, Ordering::Relaxed);
        self.events
            .lock()
            .entry(kind)
            .or_default()
            .push(EventEntry { id, func });
        Registration {
            inner: Arc::new(RegistrationInner {
                id,
                target: RegistrationTarget::Event {
                    kind,
                    registry: Arc::downgrade(&self.events),
                },
            }),
        }
    }

    /// Subscribe to an event kind with an async callback.
    pub fn on_event<F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        F: Fn(Option<EventArg>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_event_handler(kind, Arc::new(move |arg| Box::pin(f(arg))))
    }

    /// Subscribe to an event kind with a synchronous callback.
    pub fn on_event_sync<F>(&self, kind: EventKind, f: F) -> Registration
    where
        F: Fn(Option<EventArg>) + Send + Sync + 'static,
    {
        self.add_event_handler(
            kind,
            Arc::new(move |arg| {
                f(arg);
                Box::pin(async {})
            }),
        )
    }

    /// Subscribe with a typed callback. Arguments that fail the downcast
    /// are skipped with a debug log.
    pub fn on_event_typed<T, F, Fut>(&self, kind: EventKind, f: F) -> Registration
    where
        T: Send + Sync + 'static,
        F: Fn(Arc<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.add_event_handler(
            kind,
            Arc::new(move |arg| -> EventFuture {
                match arg.and_then(|a| a.downcast::<T>().ok()) {
                    Some(value) => Box::pin(f(value)),
                    None => {
                        debug!(?kind, "event argument type mismatch; skipping callback");
                        Box::pin(async {})
                    }
                }
            }),
        )
    }

    /// Channels with at least one live handler. Intended for diagnostics
    /// and tests.
    pub fn registered_channels(&self) -> Vec<String> {
        self.handlers.lock().keys().cloned().collect()
    }

    /// Whether `channel` currently has any handler.
    pub fn has_handlers(&self, channel: &str) -> bool {
        self.handlers.lock().contains_key(channel)
    }

    // -----------------------------------------------------------------------
    // Sending
    // -----------------------------------------------------------------------

    /// Stamp the sender identity and hand the message to the transport.
    pub async fn send(&self, mut message: Message) -> Result<()> {
        message.sender_id = self.own_id();
        self.transport.send(&message).await
    }

    /// Stamp correlation fields onto `reply` and send it.
    pub(crate) async fn send_reply(&self, request: &Message, mut reply: Message) -> Result<()> {
        reply.reply_to = Some(request.message_id);
        reply.target_id = Some(request.sender_id);
        reply.sender_id = self.own_id();
        self.transport.send(&reply).await
    }

    /// Send `request` and await the correlated reply with the default
    /// timeout.
    pub async fn send_request(&self, request: Message) -> Result<Message> {
        self.send_request_timeout(request, defaults::REQUEST_TIMEOUT)
            .await
    }

    /// Send `request` and await the correlated reply, failing with
    /// [`SbmError::Timeout`] when `timeout` elapses first.
    pub async fn send_request_timeout(
        &self,
        mut request: Message,
        timeout: Duration,
    ) -> Result<Message> {
        request.sender_id = self.own_id();
        let request_id = request.message_id;
        let reply_channel = request.reply_channel();

        let (reply_tx, reply_rx) = oneshot::channel::<Message>();
        let reply_tx = Arc::new(Mutex::new(Some(reply_tx)));
        let self_unregister: Arc<OnceLock<Registration>> = Arc::new(OnceLock::new());

        let handler_cell = self_unregister.clone();
        let registration = self.on_message(reply_channel, move |reply: Message| {
            let reply_tx = reply_tx.clone();
            let handler_cell = handler_cell.clone();
            async move {
                if reply.reply_to == Some(request_id) {
                    if let Some(tx) = reply_tx.lock().take() {
                        let _ = tx.send(reply);
                    }
                    if let Some(registration) = handler_cell.get() {
                        registration.unregister();
                    }
                }
                Ok(())
            }
        });
        let _ = self_unregister.set(registration.clone());

        // The one-shot is registered before the request leaves, so a reply
        // racing the send cannot be lost.
        if let Err(e) = self.transport.send(&request).await {
            registration.unregister();
            return Err(e);
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(reply)) => {
                registration.unregister();
                Ok(reply)
            }
            Ok(Err(_)) => {
                registration.unregister();
                Err(SbmError::Cancelled)
            }
            Err(_) => {
                registration.unregister();
                Err(SbmError::Timeout(timeout))
            }
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    /// Invoke every callback registered for `kind` with `arg`. Callback
    /// panics are caught and logged, never propagated.
    pub async fn broadcast_event(&self, kind: EventKind, arg: Option<EventArg>) {
        let snapshot: Vec<EventEntry> = self
            .events
            .lock()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for entry in snapshot {
            let fut = (entry.func)(arg.clone());
            if AssertUnwindSafe(fut).catch_unwind().await.is_err() {
                warn!(?kind, "event callback panicked");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Inbound loop
    // -----------------------------------------------------------------------

    /// Start the inbound loop and the status forwarder. Must be called
    /// once, after the transport is connected.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SbmError::Config("dispatcher already started".into()));
        }

        let inbound = self.transport.receive()?;
        let status_rx = self.transport.subscribe_status();

        let forwarder = Arc::clone(self);
        tokio::spawn(async move { forwarder.forward_status(status_rx).await });

        let this = Arc::clone(self);
        tokio::spawn(async move { this.inbound_loop(inbound).await });
        Ok(())
    }

    /// Relay transport status transitions onto the event bus.
    /// `Disconnected` is withheld here: the inbound loop emits it exactly
    /// once on exit, so observers see it strictly after the last dispatch.
    async fn forward_status(
        self: Arc<Self>,
        mut status_rx: tokio::sync::broadcast::Receiver<ConnectionStatus>,
    ) {
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                status = status_rx.recv() => match status {
                    Ok(ConnectionStatus::Disconnected) => {}
                    Ok(status) => {
                        self.broadcast_event(
                            EventKind::ConnectionStatusChanged,
                            Some(Arc::new(status) as EventArg),
                        )
                        .await;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status observer lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn inbound_loop(self: Arc<Self>, mut inbound: mpsc::Receiver<Message>) {
        debug!("inbound loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                next = inbound.recv() => match next {
                    Some(message) => self.dispatch(message).await,
                    None => break,
                },
            }
        }
        debug!("inbound loop exited");
        // The loop owns the dispatcher's active lifetime: once it exits,
        // cancel so the status forwarder terminates with it.
        self.cancel.cancel();
        self.emit_disconnected().await;
    }

    async fn emit_disconnected(&self) {
        if self.disconnect_emitted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.broadcast_event(
            EventKind::ConnectionStatusChanged,
            Some(Arc::new(ConnectionStatus::Disconnected) as EventArg),
        )
        .await;
    }

    async fn dispatch(&self, message: Message) {
        let allowed = self
            .gate
            .read()
            .as_ref()
            .map_or(true, |gate| gate(&message));
        if !allowed {
            warn!(channel = %message.channel, "dropping message rejected by gate");
            return;
        }

        // Snapshot so handlers may mutate the registry mid-dispatch.
        let snapshot: Vec<HandlerEntry> = self
            .handlers
            .lock()
            .get(&message.channel)
            .cloned()
            .unwrap_or_default();

        if snapshot.is_empty() {
            debug!(channel = %message.channel, "no handler registered");
            return;
        }

        for entry in snapshot {
            match (entry.func)(message.clone()).await {
                Ok(Some(reply)) => {
                    if entry.is_responding {
                        if let Err(e) = self.send_reply(&message, reply).await {
                            warn!(channel = %message.channel, error = %e, "failed to send reply");
                        }
                    } else {
                        debug!(
                            channel = %message.channel,
                            "discarding reply from fire-and-forget handler"
                        );
                    }
                }
                Ok(None) => {}
                Err(error) => {
                    if entry.is_responding {
                        let synthesized = self
                            .error_handler
                            .read()
                            .as_ref()
                            .and_then(|handler| handler(&message, &error));
                        if let Some(reply) = synthesized {
                            if let Err(e) = self.send_reply(&message, reply).await {
                                warn!(
                                    channel = %message.channel,
                                    error = %e,
                                    "failed to send error reply"
                                );
                            }
                            continue;
                        }
                    }
                    warn!(channel = %message.channel, error = %error, "handler failed");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Shutdown
    // -----------------------------------------------------------------------

    /// Cancel the inbound loop and release the transport. Idempotent.
    /// Outstanding `send_request` futures keep waiting and resolve by
    /// timeout rather than cancellation.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        debug!("disposing dispatcher");
        self.cancel.cancel();
        if let Err(e) = self.transport.close().await {
            debug!(error = %e, "transport close reported an error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MessagePackCodec;
    use crate::message::SERVER_ID;
    use crate::transport::StreamCore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use tokio::sync::broadcast;

    /// In-memory transport backed by the shared framed-stream engine over a
    /// duplex pipe. `pair` returns both ends, already connected.
    struct PipeTransport {
        core: Arc<StreamCore>,
    }

    impl PipeTransport {
        async fn pair() -> (Arc<PipeTransport>, Arc<PipeTransport>) {
            let (left, right) = tokio::io::duplex(256 * 1024);
            let mut ends = Vec::new();
            for stream in [left, right] {
                let core = Arc::new(StreamCore::new(
                    Arc::new(MessagePackCodec),
                    defaults::MAX_FRAME_BYTES,
                ));
                let (reader, writer) = tokio::io::split(stream);
                core.install(Box::new(reader), Box::new(writer)).await;
                ends.push(Arc::new(PipeTransport { core }));
            }
            let second = ends.pop().unwrap();
            let first = ends.pop().unwrap();
            (first, second)
        }
    }

    #[async_trait]
    impl Transport for PipeTransport {
        async fn connect(&self, _max_retries: u32, _base_delay: Duration) -> Result<()> {
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

    async fn wired_pair() -> (Arc<Dispatcher>, Arc<Dispatcher>) {
        let (a, b) = PipeTransport::pair().await;
        let left = Arc::new(Dispatcher::new(a));
        let right = Arc::new(Dispatcher::new(b));
        left.start().unwrap();
        right.start().unwrap();
        (left, right)
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_purges_channel() {
        let (left, _right) = PipeTransport::pair().await;
        let dispatcher = Arc::new(Dispatcher::new(left));

        let first = dispatcher.on_message_sync("topic", |_| Ok(()));
        let second = dispatcher.on_message_sync("topic", |_| Ok(()));
        assert!(dispatcher.has_handlers("topic"));

        first.unregister();
        assert!(dispatcher.has_handlers("topic"));
        first.unregister(); // no-op
        second.unregister();
        assert!(!dispatcher.has_handlers("topic"));
        assert!(dispatcher.registered_channels().is_empty());
    }

    #[tokio::test]
    async fn request_reply_round_trip() {
        let (client, server) = wired_pair().await;
        server.set_own_id(SERVER_ID);

        server.on_request("echo", |msg: Message| async move {
            let data = msg.data.clone().unwrap_or_default();
            Ok(Some(Message::from_reply(&msg, data)))
        });

        let request = Message::new("echo", json!("hi"));
        let request_id = request.message_id;
        let reply = client.send_request(request).await.unwrap();

        assert_eq!(reply.reply_to, Some(request_id));
        assert_eq!(reply.channel, format!("echo_reply_{request_id}"));
        assert_eq!(reply.data, Some(json!("hi")));
        assert_eq!(reply.sender_id, SERVER_ID);
        assert_eq!(reply.target_id, Some(client.own_id()));

        // The one-shot reply handler removed itself.
        assert!(client.registered_channels().is_empty());
    }

    #[tokio::test]
    async fn zero_timeout_fails_immediately_and_unregisters() {
        let (client, _server) = wired_pair().await;

        let err = client
            .send_request_timeout(Message::new("slow", json!(1)), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, SbmError::Timeout(_)));
        assert!(client.registered_channels().is_empty());
    }

    #[tokio::test]
    async fn request_times_out_when_unanswered() {
        let (client, _server) = wired_pair().await;

        let err = client
            .send_request_timeout(Message::new("slow", json!(1)), Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, SbmError::Timeout(d) if d == Duration::from_millis(100)));
        assert!(client.registered_channels().is_empty());
    }

    #[tokio::test]
    async fn all_handlers_run_in_registration_order() {
        let (client, server) = wired_pair().await;

        let order = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = oneshot::channel::<()>();
        let done_tx = Arc::new(Mutex::new(Some(done_tx)));

        let o1 = order.clone();
        server.on_message("fan", move |_| {
            let o1 = o1.clone();
            async move {
                o1.lock().push(1);
                Ok(())
            }
        });
        let o2 = order.clone();
        server.on_message("fan", move |_| {
            let o2 = o2.clone();
            let done_tx = done_tx.clone();
            async move {
                o2.lock().push(2);
                if let Some(tx) = done_tx.lock().take() {
                    let _ = tx.send(());
                }
                Ok(())
            }
        });

        client.send(Message::new("fan", json!(0))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), done_rx)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(*order.lock(), vec![1, 2]);
    }

    #[tokio::test]
    async fn failing_handler_synthesizes_error_reply_when_configured() {
        let (client, server) = wired_pair().await;

        server.set_error_handler(Arc::new(|request, error| {
            Some(Message::from_reply(
                request,
                json!({"Success": false, "Message": error.to_string()}),
            ))
        }));
        server.on_request("explode", |_msg: Message| async move {
            Err(anyhow::anyhow!("boom"))
        });

        let reply = client
            .send_request_timeout(Message::new("explode", json!(0)), Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(reply.field_bool("Success"), Some(false));
        assert_eq!(reply.field_str("Message"), Some("boom"));
    }

    #[tokio::test]
    async fn failing_handler_without_hook_is_swallowed() {
        let (client, server) = wired_pair().await;

        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        server.on_request("explode", move |_msg: Message| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err(anyhow::anyhow!("boom"))
            }
        });

        // No error handler: the request goes unanswered and times out, but
        // the inbound loop stays alive for later traffic.
        let err = client
            .send_request_timeout(Message::new("explode", json!(0)), Duration::from_millis(150))
            .await
            .unwrap_err();
        assert!(matches!(err, SbmError::Timeout(_)));

        client.send(Message::new("explode", json!(1))).await.unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            while calls.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn gate_drops_messages_silently() {
        let (client, server) = wired_pair().await;

        let seen = Arc::new(AtomicUsize::new(0));
        let s = seen.clone();
        server.on_message("blocked", move |_| {
            let s = s.clone();
            async move {
                s.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        });
        server.set_gate(Arc::new(|message| message.channel != "blocked"));

        client.send(Message::new("blocked", json!(0))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(seen.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn event_bus_broadcasts_and_typed_downcast_works() {
        let (left, _right) = PipeTransport::pair().await;
        let dispatcher = Arc::new(Dispatcher::new(left));

        let plain = Arc::new(AtomicUsize::new(0));
        let typed = Arc::new(Mutex::new(None));

        let p = plain.clone();
        dispatcher.on_event_sync(EventKind::ClientIdReceived, move |_| {
            p.fetch_add(1, Ordering::SeqCst);
        });
        let t = typed.clone();
        let registration =
            dispatcher.on_event_typed::<Uuid, _, _>(EventKind::ClientIdReceived, move |id| {
                let t = t.clone();
                async move {
                    *t.lock() = Some(*id);
                }
            });

        let id = Uuid::new_v4();
        dispatcher
            .broadcast_event(EventKind::ClientIdReceived, Some(Arc::new(id) as EventArg))
            .await;
        assert_eq!(plain.load(Ordering::SeqCst), 1);
        assert_eq!(*typed.lock(), Some(id));

        // A mismatched payload is skipped by the typed subscriber.
        dispatcher
            .broadcast_event(
                EventKind::ClientIdReceived,
                Some(Arc::new("oops".to_string()) as EventArg),
            )
            .await;
        assert_eq!(*typed.lock(), Some(id));
        assert_eq!(plain.load(Ordering::SeqCst), 2);

        registration.unregister();
        registration.unregister();
        dispatcher
            .broadcast_event(EventKind::ClientIdReceived, Some(Arc::new(Uuid::new_v4()) as EventArg))
            .await;
        assert_eq!(*typed.lock(), Some(id));
    }

    #[tokio::test]
    async fn disconnected_event_fires_exactly_once() {
        let (client, server) = wired_pair().await;

        let disconnects = Arc::new(AtomicUsize::new(0));
        let d = disconnects.clone();
        client.on_event_typed::<ConnectionStatus, _, _>(
            EventKind::ConnectionStatusChanged,
            move |status| {
                let d = d.clone();
                async move {
                    if *status == ConnectionStatus::Disconnected {
                        d.fetch_add(1, Ordering::SeqCst);
                    }
                }
            },
        );

        server.dispose().await;
        tokio::time::timeout(Duration::from_secs(2), async {
            while disconnects.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Disposing our own side too must not produce a second event.
        client.dispose().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(disconnects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn double_start_is_rejected() {
        let (left, _right) = PipeTransport::pair().await;
        let dispatcher = Arc::new(Dispatcher::new(left));
        dispatcher.start().unwrap();
        assert!(matches!(dispatcher.start(), Err(SbmError::Config(_))));
    }
}
