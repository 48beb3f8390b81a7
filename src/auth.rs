//! # Authentication Gate and Access Control
//!
//! Server-side authentication is layered on ordinary dispatch: every
//! accepted connection gets a [`ConnectedClient`], whose dispatcher carries
//! a pre-registered responding handler on the reserved `_auth_` channel.
//! The handshake reads `Id` / `Key` / `Scope` from the request payload,
//! consults the server's auth handler, stores the resulting
//! [`AuthContext`], and answers `{Success: bool}`.
//!
//! When anonymous traffic is disallowed, the dispatcher's gate predicate
//! rejects every non-handshake message until the connection reaches
//! `Authenticated`. The check runs per message, so traffic raced ahead of the
//! handshake is dropped rather than queued.
//!
//! Handlers running on a connected client can enforce finer-grained policy
//! through the `require_*` guards, which fail with
//! [`SbmError::Unauthorized`].

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use parking_lot::RwLock;
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::dispatcher::{Dispatcher, ErrorHandlerFn};
use crate::error::{Result, SbmError};
use crate::message::{Message, AUTH_CHANNEL, SERVER_ID};
use crate::transport::Transport;

/// Parameters extracted from an `_auth_` handshake request.
#[derive(Debug, Clone)]
pub struct AuthRequest {
    pub id: String,
    pub key: String,
    pub scope: Option<String>,
}

/// Per-connection authentication record established by the handshake.
///
/// Created empty when the connection is accepted, replaced atomically when
/// the handshake completes, and never mutated afterwards.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub user_id: Option<String>,
    pub roles: HashSet<String>,
    pub scope: Option<String>,
    /// Whether the credentials were accepted.
    pub success: bool,
    /// When `false` on a failed handshake, the connection is torn down
    /// right after the verdict reply.
    pub is_connection_allowed: bool,
    /// Application-defined baggage attached by the auth handler.
    pub session_data: Option<Value>,
}

impl AuthContext {
    /// A successful context for `user_id` holding `roles`.
    pub fn allowed<I, S>(user_id: impl Into<String>, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            user_id: Some(user_id.into()),
            roles: roles.into_iter().map(Into::into).collect(),
            scope: None,
            success: true,
            is_connection_allowed: true,
            session_data: None,
        }
    }

    /// A failed context that still lets the connection linger.
    pub fn denied() -> Self {
        Self {
            is_connection_allowed: true,
            ..Self::default()
        }
    }

    /// A failed context that closes the connection after the reply.
    pub fn denied_and_disconnect() -> Self {
        Self::default()
    }

    /// Attach a scope to the context.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }
}

/// Handshake progression for one connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthStatus {
    /// No handshake attempted yet.
    Anonymous,
    /// A handshake request is being evaluated.
    Authenticating,
    /// The handshake succeeded.
    Authenticated,
    /// The most recent handshake failed.
    Failed,
}

/// Server-side auth callback: credentials in, verdict out.
pub type AuthHandlerFn =
    Arc<dyn Fn(AuthRequest) -> Pin<Box<dyn Future<Output = AuthContext> + Send>> + Send + Sync>;

struct AuthState {
    status: AuthStatus,
    context: AuthContext,
}

/// One accepted connection on the server: a dispatcher plus the
/// authentication state guarding it.
///
/// Outgoing traffic from a connected client is stamped with the server
/// identity ([`SERVER_ID`]); `client_id` is the peer's assigned identity.
pub struct ConnectedClient {
    client_id: Uuid,
    dispatcher: Arc<Dispatcher>,
    auth: Arc<RwLock<AuthState>>,
}

impl ConnectedClient {
    /// Wrap an accepted transport. Installs the handshake handler, the
    /// anonymous gate (when requested), and the server's error handler.
    pub(crate) fn new(
        client_id: Uuid,
        transport: Arc<dyn Transport>,
        auth_handler: Option<AuthHandlerFn>,
        error_handler: Option<ErrorHandlerFn>,
        disallow_anonymous: bool,
    ) -> Arc<Self> {
        let dispatcher = Arc::new(Dispatcher::new(transport));
        dispatcher.set_own_id(SERVER_ID);
        if let Some(handler) = error_handler {
            dispatcher.set_error_handler(handler);
        }

        let auth = Arc::new(RwLock::new(AuthState {
            status: AuthStatus::Anonymous,
            context: AuthContext::default(),
        }));

        if disallow_anonymous {
            // Evaluated per message: only the handshake itself may pass
            // until this connection is authenticated.
            let gate_auth = auth.clone();
            dispatcher.set_gate(Arc::new(move |message: &Message| {
                if message.channel == AUTH_CHANNEL {
                    return true;
                }
                let state = gate_auth.read();
                state.status == AuthStatus::Authenticated && state.context.success
            }));
        }

        let client = Arc::new(Self {
            client_id,
            dispatcher,
            auth,
        });
        client.register_handshake(auth_handler);
        client
    }

    fn register_handshake(self: &Arc<Self>, auth_handler: Option<AuthHandlerFn>) {
        let auth = self.auth.clone();
        let transport = self.dispatcher.transport().clone();
        let dispatcher = Arc::downgrade(&self.dispatcher);
        let client_id = self.client_id;

        self.dispatcher.on_request(AUTH_CHANNEL, move |message: Message| {
            let auth = auth.clone();
            let auth_handler = auth_handler.clone();
            let transport = transport.clone();
            let dispatcher = dispatcher.clone();
            async move {
                auth.write().status = AuthStatus::Authenticating;

                let request = AuthRequest {
                    id: message.field_str("Id").unwrap_or_default().to_string(),
                    key: message.field_str("Key").unwrap_or_default().to_string(),
                    scope: message.field_str("Scope").map(str::to_string),
                };
                debug!(client_id = %client_id, user = %request.id, "handshake received");

                let context = match &auth_handler {
                    Some(handler) => handler(request).await,
                    // Without a configured auth handler every handshake
                    // succeeds with an empty context.
                    None => AuthContext {
                        success: true,
                        is_connection_allowed: true,
                        ..AuthContext::default()
                    },
                };

                let success = context.success;
                let connection_allowed = context.is_connection_allowed;
                {
                    let mut state = auth.write();
                    state.context = context;
                    state.status = if success {
                        AuthStatus::Authenticated
                    } else {
                        AuthStatus::Failed
                    };
                }

                if success {
                    info!(client_id = %client_id, "client authenticated");
                    transport.on_authenticated();
                    Ok(Some(Message::from_reply(&message, json!({"Success": true}))))
                } else if connection_allowed {
                    warn!(client_id = %client_id, "authentication failed");
                    Ok(Some(Message::from_reply(&message, json!({"Success": false}))))
                } else {
                    warn!(client_id = %client_id, "authentication failed; closing connection");
                    // Push the verdict out before the stream goes away,
                    // then close explicitly instead of returning a reply.
                    if let Some(dispatcher) = dispatcher.upgrade() {
                        let reply = Message::from_reply(&message, json!({"Success": false}));
                        if let Err(e) = dispatcher.send_reply(&message, reply).await {
                            debug!(error = %e, "failed to deliver rejection reply");
                        }
                    }
                    let _ = transport.close().await;
                    Ok(None)
                }
            }
        });
    }

    /// The identity the server assigned to this connection.
    pub fn client_id(&self) -> Uuid {
        self.client_id
    }

    /// The dispatcher carrying this connection's handlers.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Current handshake state.
    pub fn auth_status(&self) -> AuthStatus {
        self.auth.read().status
    }

    /// Snapshot of the established context.
    pub fn auth_context(&self) -> AuthContext {
        self.auth.read().context.clone()
    }

    /// Send a message to this client.
    pub async fn send(&self, message: Message) -> Result<()> {
        self.dispatcher.send(message).await
    }

    /// Send a request to this client and await the correlated reply.
    pub async fn send_request(&self, request: Message) -> Result<Message> {
        self.dispatcher.send_request(request).await
    }

    /// Tear the connection down. Idempotent.
    pub async fn dispose(&self) {
        self.dispatcher.dispose().await;
    }

    // -----------------------------------------------------------------------
    // Guards
    // -----------------------------------------------------------------------

    /// Fail unless the handshake completed successfully.
    pub fn require_authenticated(&self) -> Result<()> {
        let state = self.auth.read();
        if state.status == AuthStatus::Authenticated && state.context.success {
            Ok(())
        } else {
            Err(SbmError::Unauthorized("authentication required".into()))
        }
    }

    /// Fail unless authenticated with `role` (and `scope`, when given).
    pub fn require_role(&self, role: &str, scope: Option<&str>) -> Result<()> {
        self.require_authenticated()?;
        let state = self.auth.read();
        if !state.context.roles.contains(role) {
            return Err(SbmError::Unauthorized(format!("role '{role}' required")));
        }
        if let Some(scope) = scope {
            if state.context.scope.as_deref() != Some(scope) {
                return Err(SbmError::Unauthorized(format!("scope '{scope}' required")));
            }
        }
        Ok(())
    }

    /// Fail unless authenticated with at least one listed role and at
    /// least one listed scope. `None` means unconstrained.
    pub fn require_any(&self, roles: Option<&[&str]>, scopes: Option<&[&str]>) -> Result<()> {
        self.require_authenticated()?;
        let state = self.auth.read();
        if let Some(roles) = roles {
            if !roles.iter().any(|role| state.context.roles.contains(*role)) {
                return Err(SbmError::Unauthorized(format!(
                    "one of roles {roles:?} required"
                )));
            }
        }
        if let Some(scopes) = scopes {
            if !scopes
                .iter()
                .any(|scope| state.context.scope.as_deref() == Some(*scope))
            {
                return Err(SbmError::Unauthorized(format!(
                    "one of scopes {scopes:?} required"
                )));
            }
        }
        Ok(())
    }

    /// Fail unless authenticated with every listed role and every listed
    /// scope. `None` means unconstrained.
    pub fn require_all(&self, roles: Option<&[&str]>, scopes: Option<&[&str]>) -> Result<()> {
        self.require_authenticated()?;
        let state = self.auth.read();
        if let Some(roles) = roles {
            if let Some(missing) = roles
                .iter()
                .find(|role| !state.context.roles.contains(**role))
            {
                return Err(SbmError::Unauthorized(format!(
                    "role '{missing}' required"
                )));
            }
        }
        if let Some(scopes) = scopes {
            if let Some(unmatched) = scopes
                .iter()
                .find(|scope| state.context.scope.as_deref() != Some(**scope))
            {
                return Err(SbmError::Unauthorized(format!(
                    "scope '{unmatched}' required"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authenticated_client(context: AuthContext) -> Arc<ConnectedClient> {
        let client = sample_client();
        {
            let mut state = client.auth.write();
            state.status = AuthStatus::Authenticated;
            state.context = context;
        }
        client
    }

    fn sample_client() -> Arc<ConnectedClient> {
        // A transport that is never used: guard checks are pure state.
        struct NullTransport;

        #[async_trait::async_trait]
        impl Transport for NullTransport {
            async fn connect(
                &self,
                _max_retries: u32,
                _base_delay: std::time::Duration,
            ) -> Result<()> {
                Ok(())
            }
            async fn send(&self, _message: &Message) -> Result<()> {
                Ok(())
            }
            fn receive(&self) -> Result<tokio::sync::mpsc::Receiver<Message>> {
                Err(SbmError::NotConnected)
            }
            fn on_authenticating(&self) {}
            fn on_authenticated(&self) {}
            async fn close(&self) -> Result<()> {
                Ok(())
            }
            fn status(&self) -> crate::transport::ConnectionStatus {
                crate::transport::ConnectionStatus::Connected
            }
            fn subscribe_status(
                &self,
            ) -> tokio::sync::broadcast::Receiver<crate::transport::ConnectionStatus> {
                tokio::sync::broadcast::channel(1).1
            }
        }

        ConnectedClient::new(Uuid::new_v4(), Arc::new(NullTransport), None, None, false)
    }

    #[test]
    fn guards_reject_anonymous_connections() {
        let client = sample_client();
        assert!(matches!(
            client.require_authenticated(),
            Err(SbmError::Unauthorized(_))
        ));
        assert!(client.require_role("admin", None).is_err());
        assert!(client.require_any(None, None).is_err());
    }

    #[test]
    fn role_and_scope_guards() {
        let client = authenticated_client(
            AuthContext::allowed("u", ["admin", "ops"]).with_scope("prod"),
        );

        assert!(client.require_authenticated().is_ok());
        assert!(client.require_role("admin", None).is_ok());
        assert!(client.require_role("admin", Some("prod")).is_ok());
        assert!(client.require_role("admin", Some("dev")).is_err());
        assert!(client.require_role("viewer", None).is_err());

        assert!(client.require_any(Some(&["viewer", "ops"]), None).is_ok());
        assert!(client.require_any(Some(&["viewer"]), None).is_err());
        assert!(client.require_any(None, Some(&["dev", "prod"])).is_ok());

        assert!(client.require_all(Some(&["admin", "ops"]), None).is_ok());
        assert!(client.require_all(Some(&["admin", "viewer"]), None).is_err());
        assert!(client.require_all(None, Some(&["prod"])).is_ok());
        assert!(client.require_all(None, Some(&["prod", "dev"])).is_err());

        // Unconstrained guards only require authentication.
        assert!(client.require_any(None, None).is_ok());
        assert!(client.require_all(None, None).is_ok());
    }

    #[test]
    fn failed_context_fails_guards_even_after_handshake() {
        let client = authenticated_client(AuthContext::denied());
        assert!(client.require_authenticated().is_err());
    }

    #[test]
    fn context_constructors() {
        let ok = AuthContext::allowed("u", ["admin"]);
        assert!(ok.success && ok.is_connection_allowed);
        assert_eq!(ok.user_id.as_deref(), Some("u"));

        let denied = AuthContext::denied();
        assert!(!denied.success && denied.is_connection_allowed);

        let cut = AuthContext::denied_and_disconnect();
        assert!(!cut.success && !cut.is_connection_allowed);
    }
}
