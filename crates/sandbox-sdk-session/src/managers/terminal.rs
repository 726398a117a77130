//! Interactive terminal sessions.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{Handler, generate_id, typed};
use crate::{
    error::SessionError,
    orchestrator::{ExitBridge, ExitCallback, SubscribeRequest, SubscriptionOrchestrator},
};

pub(crate) const SERVICE: &str = "terminal";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TerminalSize {
    pub cols: u16,
    pub rows: u16,
}

impl Default for TerminalSize {
    fn default() -> Self {
        Self { cols: 80, rows: 24 }
    }
}

/// Process running inside a terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildProcess {
    pub pid: u32,
    pub cmd: String,
}

/// Options for [`TerminalManager::create_session`].
pub struct TerminalOptions {
    pub on_data: Handler<String>,
    pub on_child_processes_change: Option<Handler<Vec<ChildProcess>>>,
    /// Runs once after the terminal exited and its subscriptions are gone.
    pub on_exit: Option<Box<dyn FnOnce() + Send>>,
    pub size: TerminalSize,
    /// Generated when absent.
    pub terminal_id: Option<String>,
}

impl TerminalOptions {
    #[must_use]
    pub fn new(on_data: impl Fn(String) + Send + Sync + 'static) -> Self {
        Self {
            on_data: Arc::new(on_data),
            on_child_processes_change: None,
            on_exit: None,
            size: TerminalSize::default(),
            terminal_id: None,
        }
    }

    #[must_use]
    pub fn on_child_processes_change(
        mut self,
        f: impl Fn(Vec<ChildProcess>) + Send + Sync + 'static,
    ) -> Self {
        self.on_child_processes_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_exit(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(f));
        self
    }

    #[must_use]
    pub const fn with_size(mut self, size: TerminalSize) -> Self {
        self.size = size;
        self
    }

    #[must_use]
    pub fn with_terminal_id(mut self, id: impl Into<String>) -> Self {
        self.terminal_id = Some(id.into());
        self
    }
}

/// Starts terminals and kills processes inside them.
pub struct TerminalManager {
    orchestrator: SubscriptionOrchestrator,
}

impl TerminalManager {
    pub(crate) const fn new(orchestrator: SubscriptionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Kill a process running in any terminal.
    ///
    /// # Errors
    /// Returns error if the call fails.
    pub async fn kill_process(&self, pid: u32) -> Result<(), SessionError> {
        tracing::debug!(pid, "Killing terminal process");
        self.orchestrator
            .rpc()
            .call(SERVICE, "killProcess", vec![Value::from(pid)])
            .await?;
        Ok(())
    }

    /// Subscribe to the terminal's events, then start it.
    ///
    /// # Errors
    /// Returns error if a subscription or the start call fails; nothing is
    /// left subscribed in that case.
    pub async fn create_session(
        &self,
        options: TerminalOptions,
    ) -> Result<TerminalSession, SessionError> {
        let TerminalOptions {
            on_data,
            on_child_processes_change,
            on_exit,
            size,
            terminal_id,
        } = options;
        let terminal_id = terminal_id.unwrap_or_else(generate_id);
        let bridge = ExitBridge::new();
        tracing::debug!(terminal_id = %terminal_id, cols = size.cols, rows = size.rows, "Creating terminal session");

        let requests = vec![
            Some(
                SubscribeRequest::new(SERVICE, "onData", typed("onData", move |d: String| on_data(d)))
                    .for_instance(&terminal_id),
            ),
            on_child_processes_change.map(|f| {
                SubscribeRequest::new(
                    SERVICE,
                    "onChildProcessesChange",
                    typed("onChildProcessesChange", move |p: Vec<ChildProcess>| f(p)),
                )
                .for_instance(&terminal_id)
            }),
            Some(
                SubscribeRequest::new(SERVICE, "onExit", bridge.exit_handler())
                    .for_instance(&terminal_id),
            ),
        ];

        let rpc = Arc::clone(self.orchestrator.rpc());
        let params = vec![
            Value::from(terminal_id.as_str()),
            Value::from(size.cols),
            Value::from(size.rows),
        ];
        let ids = self
            .orchestrator
            .start(requests, || async move { rpc.call(SERVICE, "start", params).await })
            .await?;

        let on_exit = on_exit.map(|f| Box::new(move |_: Value| f()) as ExitCallback);
        self.orchestrator.bridge_exit(
            &terminal_id,
            &bridge,
            ids.into_iter().flatten().collect(),
            on_exit,
        );

        Ok(TerminalSession {
            terminal_id,
            orchestrator: self.orchestrator.clone(),
            bridge,
        })
    }
}

/// A started terminal.
pub struct TerminalSession {
    terminal_id: String,
    orchestrator: SubscriptionOrchestrator,
    bridge: ExitBridge,
}

impl TerminalSession {
    #[must_use]
    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    /// Whether the terminal reported its exit.
    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.bridge.has_exited()
    }

    /// Write input to the terminal.
    ///
    /// # Errors
    /// Returns error if the call fails.
    pub async fn send_data(&self, data: &str) -> Result<(), SessionError> {
        self.call("data", vec![Value::from(data)]).await
    }

    /// # Errors
    /// Returns error if the call fails.
    pub async fn resize(&self, size: TerminalSize) -> Result<(), SessionError> {
        tracing::debug!(terminal_id = %self.terminal_id, cols = size.cols, rows = size.rows, "Resizing terminal");
        self.call("resize", vec![Value::from(size.cols), Value::from(size.rows)])
            .await
    }

    /// Destroy the terminal and wait until it exited and its subscriptions
    /// are torn down, even if the destroy call fails.
    ///
    /// # Errors
    /// Returns the destroy call's error, otherwise any teardown failure.
    pub async fn destroy(&self) -> Result<(), SessionError> {
        tracing::debug!(terminal_id = %self.terminal_id, "Destroying terminal");
        let rpc = self.orchestrator.rpc();
        let stop_call = rpc.call(
            SERVICE,
            "destroy",
            vec![Value::from(self.terminal_id.as_str())],
        );
        self.orchestrator
            .stop(&self.terminal_id, &self.bridge, stop_call)
            .await
    }

    async fn call(&self, method: &str, args: Vec<Value>) -> Result<(), SessionError> {
        let mut params = vec![Value::from(self.terminal_id.as_str())];
        params.extend(args);
        self.orchestrator
            .rpc()
            .call(SERVICE, method, params)
            .await?;
        Ok(())
    }
}
