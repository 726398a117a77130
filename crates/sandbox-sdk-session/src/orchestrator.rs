//! Subscription batches around dependent calls, and exit-driven teardown.

use std::{future::Future, sync::Arc, time::Duration};

use futures::future::{OptionFuture, join_all};
use sandbox_sdk_core::{DeferredCompletion, SettledError, SettledResults, settle_all};
use sandbox_sdk_transport::{
    ConnectionHandler, NotificationHandler, RpcChannel, RpcError, SubscriptionId,
};
use serde_json::Value;

use crate::error::SessionError;

/// One subscription of a batch.
pub struct SubscribeRequest {
    pub service: String,
    pub method: String,
    pub instance: Option<String>,
    pub handler: NotificationHandler,
}

impl SubscribeRequest {
    #[must_use]
    pub fn new(service: &str, method: &str, handler: NotificationHandler) -> Self {
        Self {
            service: service.to_string(),
            method: method.to_string(),
            instance: None,
            handler,
        }
    }

    #[must_use]
    pub fn for_instance(mut self, instance: &str) -> Self {
        self.instance = Some(instance.to_string());
        self
    }
}

/// Callback run once after an instance exited and its subscriptions are gone.
pub type ExitCallback = Box<dyn FnOnce(Value) + Send>;

/// Exit signal of one terminal or process, and the teardown that follows it.
#[derive(Clone, Default)]
pub struct ExitBridge {
    exited: DeferredCompletion<Value>,
    torn_down: DeferredCompletion<(), SettledError>,
}

impl ExitBridge {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscription handler that signals the exit.
    #[must_use]
    pub fn exit_handler(&self) -> NotificationHandler {
        let exited = self.exited.clone();
        Arc::new(move |value: Value| {
            exited.fulfill(value);
        })
    }

    /// Signal the exit locally. Returns false if it was already signalled.
    pub fn signal_exit(&self, value: Value) -> bool {
        self.exited.fulfill(value)
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.exited.is_settled()
    }

    /// Whether the backing subscriptions were torn down.
    #[must_use]
    pub fn is_torn_down(&self) -> bool {
        self.torn_down.is_settled()
    }

    /// Wait for the exit signal.
    pub async fn exited(&self) -> Value {
        self.exited.wait().await.unwrap_or(Value::Null)
    }

    /// Wait for the teardown that follows the exit.
    ///
    /// # Errors
    /// Returns the aggregated unsubscribe failures.
    pub async fn torn_down(&self) -> Result<(), SettledError> {
        self.torn_down.wait().await
    }
}

/// Treats a dropped connection as the instance exiting. The remote forgets
/// the instance's subscriptions on reconnect, so no exit would ever arrive.
struct ExitOnClose {
    instance: String,
    bridge: ExitBridge,
}

impl ConnectionHandler for ExitOnClose {
    fn on_close(&self) {
        if self.bridge.signal_exit(Value::Null) {
            tracing::debug!(instance = %self.instance, "Connection closed, treating instance as exited");
        }
    }
}

/// Establishes subscription batches and sequences stop/exit/teardown.
#[derive(Clone)]
pub struct SubscriptionOrchestrator {
    rpc: Arc<RpcChannel>,
    exit_timeout: Duration,
}

impl SubscriptionOrchestrator {
    #[must_use]
    pub const fn new(rpc: Arc<RpcChannel>, exit_timeout: Duration) -> Self {
        Self { rpc, exit_timeout }
    }

    #[must_use]
    pub const fn rpc(&self) -> &Arc<RpcChannel> {
        &self.rpc
    }

    /// Subscribe a batch concurrently. `None` entries are skipped and come
    /// back as `None`.
    ///
    /// # Errors
    /// If any subscribe fails, the successful ones are unsubscribed and the
    /// first failure is returned.
    pub async fn establish(
        &self,
        requests: Vec<Option<SubscribeRequest>>,
    ) -> Result<Vec<Option<SubscriptionId>>, RpcError> {
        let rpc = &self.rpc;
        let outcomes = join_all(requests.into_iter().map(|request| {
            OptionFuture::from(request.map(|r| async move {
                rpc.subscribe(&r.service, &r.method, r.handler, r.instance.as_deref())
                    .await
            }))
        }))
        .await;

        let mut ids = Vec::with_capacity(outcomes.len());
        let mut first_error = None;
        for outcome in outcomes {
            match outcome {
                Some(Ok(id)) => ids.push(Some(id)),
                Some(Err(e)) => {
                    ids.push(None);
                    first_error.get_or_insert(e);
                }
                None => ids.push(None),
            }
        }

        let Some(error) = first_error else {
            return Ok(ids);
        };
        tracing::debug!(error = %error, "Subscription batch failed, rolling back");
        let teardown = unsubscribe_all(&self.rpc, ids.into_iter().flatten()).await;
        log_teardown_errors(&teardown, "Rolling back subscription batch");
        Err(error)
    }

    /// Establish `requests`, then issue the dependent call.
    ///
    /// # Errors
    /// Returns the subscribe or call failure. When the call fails every
    /// established subscription is unsubscribed first; teardown failures are
    /// only logged.
    pub async fn start<F, Fut>(
        &self,
        requests: Vec<Option<SubscribeRequest>>,
        call: F,
    ) -> Result<Vec<Option<SubscriptionId>>, SessionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, RpcError>>,
    {
        let ids = self.establish(requests).await?;
        if let Err(e) = call().await {
            let teardown = unsubscribe_all(&self.rpc, ids.iter().flatten().cloned()).await;
            log_teardown_errors(&teardown, "Unsubscribing after failed start");
            return Err(e.into());
        }
        Ok(ids)
    }

    /// Once `bridge` signals exit, unsubscribe `ids`, run `on_exit`, then
    /// mark the bridge torn down. A connection close also signals the exit.
    pub fn bridge_exit(
        &self,
        instance: &str,
        bridge: &ExitBridge,
        ids: Vec<SubscriptionId>,
        on_exit: Option<ExitCallback>,
    ) {
        let rpc = Arc::clone(&self.rpc);
        let bridge = bridge.clone();
        let instance = instance.to_string();
        // Registered after the channel's own handler, so the channel has
        // already dropped its subscriptions when this one runs.
        let close_handler = rpc.connection().subscribe_handler(Arc::new(ExitOnClose {
            instance: instance.clone(),
            bridge: bridge.clone(),
        }));
        tokio::spawn(async move {
            let value = bridge.exited().await;
            rpc.connection().unsubscribe_handler(close_handler);
            tracing::debug!(instance = %instance, subscriptions = ids.len(), "Instance exited, tearing down");

            let teardown = unsubscribe_all(&rpc, ids).await;
            log_teardown_errors(&teardown, "Unsubscribing after exit");
            if let Some(on_exit) = on_exit {
                on_exit(value);
            }
            bridge
                .torn_down
                .settle(teardown.error().map_or(Ok(()), Err));
        });
    }

    /// Issue `stop_call`, then wait for the exit and the teardown whatever
    /// the call returned.
    ///
    /// The exit wait is bounded by the exit timeout; when it expires the exit
    /// is signalled locally so the subscriptions are still released.
    ///
    /// # Errors
    /// Returns the stop call's error if it failed, otherwise the aggregated
    /// teardown failures.
    pub async fn stop<Fut>(
        &self,
        instance: &str,
        bridge: &ExitBridge,
        stop_call: Fut,
    ) -> Result<(), SessionError>
    where
        Fut: Future<Output = Result<Value, RpcError>>,
    {
        let call_result = stop_call.await;
        if let Err(e) = &call_result {
            tracing::debug!(instance, error = %e, "Stop call failed, waiting for exit anyway");
        }

        if tokio::time::timeout(self.exit_timeout, bridge.exited())
            .await
            .is_err()
        {
            tracing::warn!(
                instance,
                timeout = ?self.exit_timeout,
                "No exit notification, treating instance as exited"
            );
            bridge.signal_exit(Value::Null);
        }

        let teardown = bridge.torn_down().await;
        call_result?;
        teardown?;
        Ok(())
    }

    /// Unsubscribe every id concurrently.
    pub async fn unsubscribe_all(
        &self,
        ids: impl IntoIterator<Item = SubscriptionId>,
    ) -> SettledResults<()> {
        unsubscribe_all(&self.rpc, ids).await
    }
}

async fn unsubscribe_all(
    rpc: &RpcChannel,
    ids: impl IntoIterator<Item = SubscriptionId>,
) -> SettledResults<()> {
    settle_all(
        ids.into_iter()
            .map(|id| async move { rpc.unsubscribe(&id).await }),
    )
    .await
}

fn log_teardown_errors(results: &SettledResults<()>, context: &str) {
    if let Some(errors) = results.format_errors() {
        tracing::error!(errors = %errors, "{context}");
    }
}

#[cfg(test)]
mod tests {
    use sandbox_sdk_transport::{
        RpcConfig, RpcErrorBody, RpcRequest,
        memory::{MemoryConnection, RemoteEnd},
        protocol::kind,
    };
    use serde_json::json;

    use super::*;

    fn orchestrator() -> (SubscriptionOrchestrator, RemoteEnd) {
        let (conn, remote) = MemoryConnection::pair();
        remote.controller().open("s1");
        let rpc = Arc::new(RpcChannel::new(conn, RpcConfig::default()));
        (
            SubscriptionOrchestrator::new(rpc, Duration::from_secs(10)),
            remote,
        )
    }

    fn noop() -> NotificationHandler {
        Arc::new(|_: Value| {})
    }

    async fn next_request(remote: &mut RemoteEnd) -> RpcRequest {
        remote
            .recv_kind(kind::RPC_REQUEST)
            .await
            .unwrap()
            .decode()
            .unwrap()
    }

    #[tokio::test]
    async fn test_skipped_entries_stay_none() {
        let (orch, mut remote) = orchestrator();
        let controller = remote.controller();
        let establish = tokio::spawn({
            let orch = orch.clone();
            async move {
                orch.establish(vec![
                    None,
                    Some(SubscribeRequest::new("terminal", "onData", noop()).for_instance("t1")),
                ])
                .await
            }
        });

        let request = next_request(&mut remote).await;
        assert_eq!(request.params, vec![json!("onData"), json!("t1")]);
        controller.respond(request.id, Ok(json!("sub-1")));

        let ids = establish.await.unwrap().unwrap();
        assert_eq!(ids, vec![None, Some(SubscriptionId("sub-1".into()))]);
    }

    #[tokio::test]
    async fn test_failed_call_unsubscribes_and_returns_call_error() {
        let (orch, mut remote) = orchestrator();
        let controller = remote.controller();
        let rpc = Arc::clone(orch.rpc());
        let start = tokio::spawn(async move {
            orch.start(
                vec![Some(SubscribeRequest::new("terminal", "onData", noop()))],
                || async move { rpc.call("terminal", "start", vec![json!("t1")]).await },
            )
            .await
        });

        let subscribe = next_request(&mut remote).await;
        controller.respond(subscribe.id, Ok(json!("sub-1")));
        let call = next_request(&mut remote).await;
        assert_eq!(call.method, "terminal_start");
        controller.respond(call.id, Err(RpcErrorBody::new(1, "no tty")));

        let unsubscribe = next_request(&mut remote).await;
        assert_eq!(unsubscribe.method, "terminal_unsubscribe");
        assert_eq!(unsubscribe.params, vec![json!("sub-1")]);
        // A failing teardown does not replace the call's error.
        controller.respond(unsubscribe.id, Err(RpcErrorBody::new(2, "gone")));

        let err = start.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("no tty"));
    }

    #[tokio::test]
    async fn test_connection_close_signals_exit() {
        let (orch, remote) = orchestrator();
        let bridge = ExitBridge::new();
        orch.bridge_exit("t1", &bridge, Vec::new(), None);
        assert!(orch.rpc().connection().is_open());

        remote.controller().close();
        assert!(bridge.has_exited());
        bridge.torn_down().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_forces_exit_after_timeout() {
        let (orch, _remote) = orchestrator();
        let bridge = ExitBridge::new();
        orch.bridge_exit("p1", &bridge, Vec::new(), None);

        let result = orch
            .stop("p1", &bridge, async { Ok::<_, RpcError>(Value::Null) })
            .await;
        assert!(result.is_ok());
        assert!(bridge.has_exited());
        assert!(bridge.is_torn_down());
    }
}
