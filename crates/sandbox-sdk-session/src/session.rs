//! Session facade over one connection.

use std::sync::{Arc, Mutex, PoisonError};

use sandbox_sdk_transport::{Connection, RpcChannel, SubscriptionId};

use crate::{
    config::SessionConfig,
    error::SessionError,
    managers::{
        CodeSnippetExecState, CodeSnippetManager, FilesystemManager, Handler, OpenedPort,
        OutputMessage, ProcessManager, TerminalManager, code_snippet, typed,
    },
    orchestrator::{SubscribeRequest, SubscriptionOrchestrator},
};

/// Session-wide code snippet callbacks. Each one is subscribed only when set.
#[derive(Clone, Default)]
pub struct CodeSnippetOptions {
    pub on_state_change: Option<Handler<CodeSnippetExecState>>,
    pub on_stdout: Option<Handler<OutputMessage>>,
    pub on_stderr: Option<Handler<OutputMessage>>,
    pub on_scan_ports: Option<Handler<Vec<OpenedPort>>>,
}

impl CodeSnippetOptions {
    #[must_use]
    pub fn on_state_change(
        mut self,
        f: impl Fn(CodeSnippetExecState) + Send + Sync + 'static,
    ) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_stdout(mut self, f: impl Fn(OutputMessage) + Send + Sync + 'static) -> Self {
        self.on_stdout = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_stderr(mut self, f: impl Fn(OutputMessage) + Send + Sync + 'static) -> Self {
        self.on_stderr = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_scan_ports(mut self, f: impl Fn(Vec<OpenedPort>) + Send + Sync + 'static) -> Self {
        self.on_scan_ports = Some(Arc::new(f));
        self
    }
}

#[derive(Clone, Default)]
pub struct SessionOptions {
    pub config: SessionConfig,
    pub code_snippet: CodeSnippetOptions,
}

impl SessionOptions {
    #[must_use]
    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn with_code_snippet(mut self, code_snippet: CodeSnippetOptions) -> Self {
        self.code_snippet = code_snippet;
        self
    }
}

/// Capability managers sharing one RPC channel.
pub struct Session {
    orchestrator: SubscriptionOrchestrator,
    snippet_subscriptions: Mutex<Vec<SubscriptionId>>,
    code_snippet: CodeSnippetManager,
    filesystem: FilesystemManager,
    terminal: TerminalManager,
    process: ProcessManager,
}

impl Session {
    /// Attach to `conn` and establish the session-wide code snippet subscriptions.
    ///
    /// # Errors
    /// Returns error if any of those subscriptions fails; the others are rolled back.
    pub async fn open(
        conn: Arc<dyn Connection>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let SessionOptions {
            config,
            code_snippet: snippet,
        } = options;
        tracing::debug!(session_id = ?conn.session_id(), "Opening session");

        let rpc = Arc::new(RpcChannel::new(conn, config.rpc.clone()));
        let orchestrator = SubscriptionOrchestrator::new(rpc, config.exit_timeout);

        let service = code_snippet::SERVICE;
        let requests = vec![
            snippet.on_state_change.clone().map(|f| {
                SubscribeRequest::new(
                    service,
                    "state",
                    typed("state", move |s: CodeSnippetExecState| f(s)),
                )
            }),
            snippet.on_stderr.clone().map(|f| {
                SubscribeRequest::new(service, "stderr", typed("stderr", move |m: OutputMessage| f(m)))
            }),
            snippet.on_stdout.clone().map(|f| {
                SubscribeRequest::new(service, "stdout", typed("stdout", move |m: OutputMessage| f(m)))
            }),
            snippet.on_scan_ports.clone().map(|f| {
                SubscribeRequest::new(
                    service,
                    "scanOpenedPorts",
                    typed("scanOpenedPorts", move |p: Vec<OpenedPort>| f(p)),
                )
            }),
        ];
        let ids = orchestrator.establish(requests).await?;

        Ok(Self {
            snippet_subscriptions: Mutex::new(ids.into_iter().flatten().collect()),
            code_snippet: CodeSnippetManager::new(orchestrator.clone(), snippet.on_state_change),
            filesystem: FilesystemManager::new(orchestrator.clone()),
            terminal: TerminalManager::new(orchestrator.clone()),
            process: ProcessManager::new(orchestrator.clone()),
            orchestrator,
        })
    }

    #[must_use]
    pub const fn code_snippet(&self) -> &CodeSnippetManager {
        &self.code_snippet
    }

    #[must_use]
    pub const fn filesystem(&self) -> &FilesystemManager {
        &self.filesystem
    }

    #[must_use]
    pub const fn terminal(&self) -> &TerminalManager {
        &self.terminal
    }

    #[must_use]
    pub const fn process(&self) -> &ProcessManager {
        &self.process
    }

    /// The underlying RPC channel.
    #[must_use]
    pub fn rpc(&self) -> &RpcChannel {
        self.orchestrator.rpc()
    }

    /// Tear down the session-wide subscriptions.
    ///
    /// # Errors
    /// Returns the aggregated unsubscribe failures.
    pub async fn close(&self) -> Result<(), SessionError> {
        let ids = std::mem::take(
            &mut *self
                .snippet_subscriptions
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        tracing::debug!(subscriptions = ids.len(), "Closing session");
        self.orchestrator.unsubscribe_all(ids).await.into_result()?;
        Ok(())
    }
}
