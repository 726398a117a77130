//! Request/response calls and subscriptions over a [`Connection`].

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::Value;
use tokio::sync::oneshot;

use crate::{
    connection::{Connection, ConnectionHandler, HandlerId, TransportError},
    protocol::{Envelope, RpcNotification, RpcRequest, RpcResponse, kind},
};

/// Callback invoked with the `result` of every notification for a subscription.
pub type NotificationHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Subscription id assigned by the remote side.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub String);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// RPC error.
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("connection closed while `{method}` was outstanding")]
    ConnectionClosed { method: String },
    #[error("`{method}` failed with code {code}: {message}")]
    Remote {
        method: String,
        code: i64,
        message: String,
    },
    #[error("`{method}` timed out after {timeout:?}")]
    Timeout { method: String, timeout: Duration },
    #[error("unexpected result from `{method}`: {source}")]
    Decode {
        method: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

/// Channel configuration.
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    /// Reject calls that get no response within this time. `None` waits until
    /// the response or the connection closing.
    pub call_timeout: Option<Duration>,
}

impl RpcConfig {
    #[must_use]
    pub const fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = Some(timeout);
        self
    }
}

struct PendingSubscription {
    service: String,
    method: String,
    instance: Option<String>,
    handler: NotificationHandler,
}

struct PendingCall {
    method: String,
    tx: oneshot::Sender<Result<Value, RpcError>>,
    /// Set for `{service}_subscribe` calls; registered when the response lands.
    subscription: Option<PendingSubscription>,
}

struct Subscription {
    service: String,
    method: String,
    instance: Option<String>,
    handler: NotificationHandler,
}

#[derive(Default)]
struct ChannelState {
    next_id: u64,
    pending: HashMap<u64, PendingCall>,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    /// Subscriptions cleared by a connection close and not yet unsubscribed.
    dropped: HashSet<SubscriptionId>,
}

fn lock(state: &Mutex<ChannelState>) -> MutexGuard<'_, ChannelState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Routes inbound RPC frames to pending calls and subscription handlers.
struct Dispatcher {
    state: Arc<Mutex<ChannelState>>,
}

impl Dispatcher {
    fn resolve(&self, message: &Envelope) {
        let response: RpcResponse = match message.decode() {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed RPC response");
                return;
            }
        };

        let mut state = lock(&self.state);
        let Some(call) = state.pending.remove(&response.id) else {
            tracing::debug!(id = response.id, "Response for unknown or abandoned call");
            return;
        };

        let outcome = match (response.error, response.result) {
            (Some(error), _) => Err(RpcError::Remote {
                method: call.method.clone(),
                code: error.code,
                message: error.message,
            }),
            (None, result) => Ok(result.unwrap_or(Value::Null)),
        };

        let outcome = match (outcome, call.subscription) {
            (Ok(value), Some(sub)) => match serde_json::from_value::<String>(value.clone()) {
                Ok(id) => {
                    tracing::debug!(
                        subscription = %id,
                        service = %sub.service,
                        method = %sub.method,
                        instance = ?sub.instance,
                        "Subscribed"
                    );
                    state.subscriptions.insert(
                        SubscriptionId(id),
                        Subscription {
                            service: sub.service,
                            method: sub.method,
                            instance: sub.instance,
                            handler: sub.handler,
                        },
                    );
                    Ok(value)
                }
                Err(source) => Err(RpcError::Decode {
                    method: call.method.clone(),
                    source,
                }),
            },
            (outcome, _) => outcome,
        };
        drop(state);

        // The caller may have given up on the call.
        let _ = call.tx.send(outcome);
    }

    fn notify(&self, message: &Envelope) {
        let notification: RpcNotification = match message.decode() {
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(error = %e, "Malformed RPC notification");
                return;
            }
        };

        let id = SubscriptionId(notification.subscription);
        let handler = lock(&self.state)
            .subscriptions
            .get(&id)
            .map(|s| Arc::clone(&s.handler));

        match handler {
            Some(handler) => handler(notification.result),
            None => tracing::trace!(subscription = %id, "Notification for inactive subscription"),
        }
    }
}

impl ConnectionHandler for Dispatcher {
    fn on_message(&self, message: &Envelope) {
        match message.kind.as_str() {
            kind::RPC_RESPONSE => self.resolve(message),
            kind::RPC_NOTIFICATION => self.notify(message),
            _ => {}
        }
    }

    fn on_close(&self) {
        let (pending, dropped) = {
            let mut state = lock(&self.state);
            let pending: Vec<PendingCall> = state.pending.drain().map(|(_, c)| c).collect();
            let cleared: Vec<SubscriptionId> = state.subscriptions.drain().map(|(id, _)| id).collect();
            let dropped = cleared.len();
            state.dropped.extend(cleared);
            (pending, dropped)
        };
        tracing::debug!(
            pending = pending.len(),
            subscriptions = dropped,
            "Connection closed, rejecting outstanding calls"
        );
        for call in pending {
            let _ = call.tx.send(Err(RpcError::ConnectionClosed {
                method: call.method,
            }));
        }
    }
}

/// Call/subscribe/unsubscribe abstraction over one [`Connection`].
///
/// Subscriptions live until unsubscribed or until the connection closes;
/// the remote side forgets them on reconnect, so they are not replayed.
/// Unsubscribing one that a close already dropped succeeds without a call.
pub struct RpcChannel {
    conn: Arc<dyn Connection>,
    state: Arc<Mutex<ChannelState>>,
    handler_id: HandlerId,
    config: RpcConfig,
}

impl RpcChannel {
    /// Attach a channel to `conn`.
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>, config: RpcConfig) -> Self {
        let state = Arc::new(Mutex::new(ChannelState::default()));
        let handler_id = conn.subscribe_handler(Arc::new(Dispatcher {
            state: Arc::clone(&state),
        }));
        Self {
            conn,
            state,
            handler_id,
            config,
        }
    }

    /// The underlying connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<dyn Connection> {
        &self.conn
    }

    /// Call `service.method` and wait for its result.
    ///
    /// # Errors
    /// Returns error if sending fails, the remote reports an error, the
    /// connection closes first, or the configured call timeout expires.
    pub async fn call(
        &self,
        service: &str,
        method: &str,
        params: Vec<Value>,
    ) -> Result<Value, RpcError> {
        self.request(format!("{service}_{method}"), params, None)
            .await
    }

    /// Send `service.method` without waiting for a response.
    ///
    /// # Errors
    /// Returns error if the frame cannot be sent.
    pub fn fire(&self, service: &str, method: &str, params: Vec<Value>) -> Result<(), RpcError> {
        let id = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            state.next_id
        };
        let method = format!("{service}_{method}");
        tracing::debug!(method = %method, id, "Sending RPC request without response");
        self.send_request(id, method, params)
    }

    /// Subscribe `handler` to `service.method`, optionally for one instance.
    ///
    /// The handler is live as soon as the remote acknowledges; notifications
    /// that follow the acknowledgement are never dropped.
    ///
    /// # Errors
    /// Returns error if the subscribe call fails.
    pub async fn subscribe(
        &self,
        service: &str,
        method: &str,
        handler: NotificationHandler,
        instance: Option<&str>,
    ) -> Result<SubscriptionId, RpcError> {
        let mut params = vec![Value::from(method)];
        if let Some(instance) = instance {
            params.push(Value::from(instance));
        }
        let pending = PendingSubscription {
            service: service.to_string(),
            method: method.to_string(),
            instance: instance.map(str::to_string),
            handler,
        };
        let value = self
            .request(format!("{service}_subscribe"), params, Some(pending))
            .await?;
        serde_json::from_value(value)
            .map(SubscriptionId)
            .map_err(|source| RpcError::Decode {
                method: format!("{service}_subscribe"),
                source,
            })
    }

    /// Stop delivery for `id` and tell the remote side.
    ///
    /// Local delivery stops before the unsubscribe call is sent.
    ///
    /// # Errors
    /// Returns error if `id` is not an active subscription or the call fails.
    pub async fn unsubscribe(&self, id: &SubscriptionId) -> Result<(), RpcError> {
        let subscription = {
            let mut state = lock(&self.state);
            if state.dropped.remove(id) {
                tracing::debug!(subscription = %id, "Subscription already dropped by connection close");
                return Ok(());
            }
            state
                .subscriptions
                .remove(id)
                .ok_or_else(|| RpcError::UnknownSubscription(id.clone()))?
        };
        tracing::debug!(
            subscription = %id,
            service = %subscription.service,
            method = %subscription.method,
            instance = ?subscription.instance,
            "Unsubscribing"
        );
        self.request(
            format!("{}_unsubscribe", subscription.service),
            vec![Value::from(id.0.as_str())],
            None,
        )
        .await
        .map(|_| ())
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        lock(&self.state).subscriptions.len()
    }

    /// Number of calls awaiting a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        lock(&self.state).pending.len()
    }

    async fn request(
        &self,
        method: String,
        params: Vec<Value>,
        subscription: Option<PendingSubscription>,
    ) -> Result<Value, RpcError> {
        let (id, rx) = {
            let mut state = lock(&self.state);
            state.next_id += 1;
            let id = state.next_id;
            let (tx, rx) = oneshot::channel();
            state.pending.insert(
                id,
                PendingCall {
                    method: method.clone(),
                    tx,
                    subscription,
                },
            );
            (id, rx)
        };

        if let Err(e) = self.send_request(id, method.clone(), params) {
            lock(&self.state).pending.remove(&id);
            tracing::debug!(method = %method, id, error = %e, "RPC request not sent");
            return Err(e);
        }
        tracing::debug!(method = %method, id, "Sent RPC request");

        let received = match self.config.call_timeout {
            Some(limit) => {
                if let Ok(received) = tokio::time::timeout(limit, rx).await {
                    received
                } else {
                    lock(&self.state).pending.remove(&id);
                    tracing::warn!(method = %method, id, timeout = ?limit, "RPC response timeout");
                    return Err(RpcError::Timeout {
                        method,
                        timeout: limit,
                    });
                }
            }
            None => rx.await,
        };

        // A dropped sender means the call was discarded without an answer.
        received.unwrap_or(Err(RpcError::ConnectionClosed { method }))
    }

    fn send_request(&self, id: u64, method: String, params: Vec<Value>) -> Result<(), RpcError> {
        let request = RpcRequest { id, method, params };
        tracing::trace!(request = ?request, "RPC request body");
        let envelope = Envelope::new(kind::RPC_REQUEST, &request).map_err(TransportError::from)?;
        self.conn.send(envelope)?;
        Ok(())
    }
}

impl Drop for RpcChannel {
    fn drop(&mut self) {
        self.conn.unsubscribe_handler(self.handler_id);
    }
}
