//! In-process loopback connection.
//!
//! [`MemoryConnection`] is the client half handed to the session layer;
//! [`RemoteEnd`] plays the remote runner. Frames sent by the client queue up
//! on the remote end, and frames delivered by the remote reach the client's
//! handlers synchronously.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use uuid::Uuid;

use crate::{
    connection::{Connection, ConnectionHandler, HandlerId, HandlerSet, TransportError},
    protocol::{
        Envelope, EnvironmentEvent, RpcErrorBody, RpcNotification, RpcRequest, RpcResponse, kind,
    },
};

#[derive(Debug, Clone, PartialEq, Eq)]
enum Status {
    Connecting,
    Open(String),
    Closed,
}

/// Client half of a loopback connection.
pub struct MemoryConnection {
    status: Mutex<Status>,
    handlers: HandlerSet,
    outbound: mpsc::UnboundedSender<Envelope>,
}

impl MemoryConnection {
    /// Create a connection and its remote end. The connection starts out
    /// connecting; call [`RemoteController::open`] to open it.
    #[must_use]
    pub fn pair() -> (Arc<Self>, RemoteEnd) {
        let (outbound, inbound) = mpsc::unbounded_channel();
        let conn = Arc::new(Self {
            status: Mutex::new(Status::Connecting),
            handlers: HandlerSet::new(),
            outbound,
        });
        let remote = RemoteEnd {
            controller: RemoteController {
                conn: Arc::clone(&conn),
                subscriptions: Arc::new(Mutex::new(HashMap::new())),
            },
            inbound,
        };
        (conn, remote)
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    fn status(&self) -> MutexGuard<'_, Status> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Connection for MemoryConnection {
    fn is_open(&self) -> bool {
        matches!(*self.status(), Status::Open(_))
    }

    fn is_closed(&self) -> bool {
        *self.status() == Status::Closed
    }

    fn session_id(&self) -> Option<String> {
        match &*self.status() {
            Status::Open(id) => Some(id.clone()),
            _ => None,
        }
    }

    fn subscribe_handler(&self, handler: Arc<dyn ConnectionHandler>) -> HandlerId {
        self.handlers.insert(handler)
    }

    fn unsubscribe_handler(&self, id: HandlerId) {
        self.handlers.remove(id);
    }

    fn send(&self, message: Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        tracing::trace!(kind = %message.kind, "Loopback send");
        self.outbound
            .send(message)
            .map_err(|_| TransportError::Closed)
    }
}

struct RemoteSubscription {
    service: String,
    method: String,
    instance: Option<String>,
}

/// Drives the client half: opens, closes, and delivers frames.
#[derive(Clone)]
pub struct RemoteController {
    conn: Arc<MemoryConnection>,
    subscriptions: Arc<Mutex<HashMap<String, RemoteSubscription>>>,
}

impl RemoteController {
    /// Open (or reopen) the connection with a fresh remote session id.
    pub fn open(&self, session_id: &str) {
        *self.conn.status() = Status::Open(session_id.to_string());
        tracing::debug!(session_id, "Loopback opened");
        self.conn.handlers.emit_open(session_id);
    }

    /// Drop the connection. The remote side forgets its subscriptions.
    pub fn close(&self) {
        *self.conn.status() = Status::Closed;
        self.lock_subscriptions().clear();
        tracing::debug!("Loopback closed");
        self.conn.handlers.emit_close();
    }

    /// Deliver a frame to the client. Frames are dropped while not open.
    pub fn deliver(&self, message: &Envelope) -> bool {
        if !self.conn.is_open() {
            tracing::debug!(kind = %message.kind, "Dropping frame, loopback not open");
            return false;
        }
        self.conn.handlers.emit_message(message);
        true
    }

    /// Serialize and deliver a payload under `kind`.
    pub fn deliver_as<P: Serialize>(&self, kind: &str, payload: &P) -> bool {
        match Envelope::new(kind, payload) {
            Ok(envelope) => self.deliver(&envelope),
            Err(e) => {
                tracing::warn!(kind, error = %e, "Failed to encode loopback frame");
                false
            }
        }
    }

    /// Deliver an environment event.
    pub fn deliver_event(&self, event: &EnvironmentEvent) -> bool {
        match event.to_envelope() {
            Ok(envelope) => self.deliver(&envelope),
            Err(e) => {
                tracing::warn!(kind = event.kind(), error = %e, "Failed to encode loopback event");
                false
            }
        }
    }

    /// Answer call `id`.
    pub fn respond(&self, id: u64, outcome: Result<Value, RpcErrorBody>) -> bool {
        let response = match outcome {
            Ok(result) => RpcResponse {
                id,
                result: Some(result),
                error: None,
            },
            Err(error) => RpcResponse {
                id,
                result: None,
                error: Some(error),
            },
        };
        self.deliver_as(kind::RPC_RESPONSE, &response)
    }

    /// Push a notification for `subscription`.
    pub fn notify(&self, subscription: &str, result: Value) -> bool {
        self.deliver_as(
            kind::RPC_NOTIFICATION,
            &RpcNotification {
                subscription: subscription.to_string(),
                result,
            },
        )
    }

    /// Handle `{service}_subscribe` and `{service}_unsubscribe` against the
    /// built-in subscription table. `None` for any other method.
    #[must_use]
    pub fn accept_subscription(&self, request: &RpcRequest) -> Option<Result<Value, RpcErrorBody>> {
        let (service, method) = request.service_method();
        match method {
            "subscribe" => {
                let Some(event) = request.params.first().and_then(Value::as_str) else {
                    return Some(Err(RpcErrorBody::new(-32602, "missing event name")));
                };
                let id = Uuid::new_v4().simple().to_string();
                self.lock_subscriptions().insert(
                    id.clone(),
                    RemoteSubscription {
                        service: service.to_string(),
                        method: event.to_string(),
                        instance: request
                            .params
                            .get(1)
                            .and_then(Value::as_str)
                            .map(str::to_string),
                    },
                );
                Some(Ok(Value::String(id)))
            }
            "unsubscribe" => {
                let id = request.params.first().and_then(Value::as_str).unwrap_or("");
                Some(if self.lock_subscriptions().remove(id).is_some() {
                    Ok(Value::Bool(true))
                } else {
                    Err(RpcErrorBody::new(-32602, format!("unknown subscription {id}")))
                })
            }
            _ => None,
        }
    }

    /// Notify every subscriber of `service.method` for `instance`.
    /// Returns the number of notifications delivered.
    pub fn notify_subscribers(
        &self,
        service: &str,
        method: &str,
        instance: Option<&str>,
        result: &Value,
    ) -> usize {
        let targets: Vec<String> = self
            .lock_subscriptions()
            .iter()
            .filter(|(_, s)| {
                s.service == service && s.method == method && s.instance.as_deref() == instance
            })
            .map(|(id, _)| id.clone())
            .collect();
        targets
            .iter()
            .filter(|id| self.notify(id, result.clone()))
            .count()
    }

    /// Number of subscriptions the remote side holds.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.lock_subscriptions().len()
    }

    fn lock_subscriptions(&self) -> MutexGuard<'_, HashMap<String, RemoteSubscription>> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Remote half of a loopback connection.
pub struct RemoteEnd {
    controller: RemoteController,
    inbound: mpsc::UnboundedReceiver<Envelope>,
}

impl RemoteEnd {
    /// A handle for driving the client half.
    #[must_use]
    pub fn controller(&self) -> RemoteController {
        self.controller.clone()
    }

    /// Next frame the client sent.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.inbound.recv().await
    }

    /// Next frame the client sent, if one is queued.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.inbound.try_recv().ok()
    }

    /// Next frame of `kind`, skipping others.
    pub async fn recv_kind(&mut self, kind: &str) -> Option<Envelope> {
        while let Some(message) = self.inbound.recv().await {
            if message.kind == kind {
                return Some(message);
            }
            tracing::trace!(kind = %message.kind, wanted = kind, "Skipping loopback frame");
        }
        None
    }

    /// Answer client frames with `service` until the client half is dropped.
    pub fn serve<S>(mut self, service: S) -> JoinHandle<()>
    where
        S: RemoteService + 'static,
    {
        tokio::spawn(async move {
            while let Some(message) = self.inbound.recv().await {
                let remote = &self.controller;
                if message.kind != kind::RPC_REQUEST {
                    service.handle_message(remote, message).await;
                    continue;
                }
                let request: RpcRequest = match message.decode() {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::warn!(error = %e, "Malformed request on loopback");
                        continue;
                    }
                };
                let id = request.id;
                let outcome = match remote.accept_subscription(&request) {
                    Some(outcome) => outcome,
                    None => service.handle_request(remote, request).await,
                };
                remote.respond(id, outcome);
            }
        })
    }
}

/// Scripted remote runner for [`RemoteEnd::serve`].
#[async_trait]
pub trait RemoteService: Send + Sync {
    /// Answer a call other than subscribe/unsubscribe.
    async fn handle_request(
        &self,
        remote: &RemoteController,
        request: RpcRequest,
    ) -> Result<Value, RpcErrorBody>;

    /// Handle a non-RPC frame.
    async fn handle_message(&self, _remote: &RemoteController, _message: Envelope) {}
}
