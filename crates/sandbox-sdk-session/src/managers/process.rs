//! Background processes.

use std::{collections::HashMap, sync::Arc};

use serde_json::{Value, json};

use super::{Handler, OutputMessage, generate_id, typed};
use crate::{
    error::SessionError,
    orchestrator::{ExitBridge, ExitCallback, SubscribeRequest, SubscriptionOrchestrator},
};

pub(crate) const SERVICE: &str = "process";

/// Options for [`ProcessManager::start`].
pub struct ProcessOptions {
    pub cmd: String,
    pub on_stdout: Option<Handler<OutputMessage>>,
    pub on_stderr: Option<Handler<OutputMessage>>,
    /// Runs once after the process exited and its subscriptions are gone.
    pub on_exit: Option<Box<dyn FnOnce() + Send>>,
    pub env_vars: HashMap<String, String>,
    /// Working directory (default: `/`).
    pub rootdir: String,
    /// Generated when absent.
    pub process_id: Option<String>,
}

impl ProcessOptions {
    #[must_use]
    pub fn new(cmd: impl Into<String>) -> Self {
        Self {
            cmd: cmd.into(),
            on_stdout: None,
            on_stderr: None,
            on_exit: None,
            env_vars: HashMap::new(),
            rootdir: "/".to_string(),
            process_id: None,
        }
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
    pub fn on_exit(mut self, f: impl FnOnce() + Send + 'static) -> Self {
        self.on_exit = Some(Box::new(f));
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env_vars.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_rootdir(mut self, rootdir: impl Into<String>) -> Self {
        self.rootdir = rootdir.into();
        self
    }

    #[must_use]
    pub fn with_process_id(mut self, id: impl Into<String>) -> Self {
        self.process_id = Some(id.into());
        self
    }
}

/// Starts processes in the environment.
pub struct ProcessManager {
    orchestrator: SubscriptionOrchestrator,
}

impl ProcessManager {
    pub(crate) const fn new(orchestrator: SubscriptionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// Subscribe to the process's events, then start it.
    ///
    /// When the process exits on its own the subscriptions are torn down
    /// and `on_exit` runs.
    ///
    /// # Errors
    /// Returns error if a subscription or the start call fails; nothing is
    /// left subscribed in that case.
    pub async fn start(&self, options: ProcessOptions) -> Result<Process, SessionError> {
        let ProcessOptions {
            cmd,
            on_stdout,
            on_stderr,
            on_exit,
            env_vars,
            rootdir,
            process_id,
        } = options;
        let process_id = process_id.unwrap_or_else(generate_id);
        let bridge = ExitBridge::new();
        tracing::debug!(process_id = %process_id, cmd = %cmd, rootdir = %rootdir, "Starting process");

        let output = |method: &'static str, f: Handler<OutputMessage>| {
            SubscribeRequest::new(SERVICE, method, typed(method, move |m: OutputMessage| f(m)))
                .for_instance(&process_id)
        };
        let requests = vec![
            Some(
                SubscribeRequest::new(SERVICE, "onExit", bridge.exit_handler())
                    .for_instance(&process_id),
            ),
            on_stdout.map(|f| output("onStdout", f)),
            on_stderr.map(|f| output("onStderr", f)),
        ];

        let rpc = Arc::clone(self.orchestrator.rpc());
        let params = vec![
            Value::from(process_id.as_str()),
            Value::from(cmd),
            json!(env_vars),
            Value::from(rootdir),
        ];
        let ids = self
            .orchestrator
            .start(requests, || async move { rpc.call(SERVICE, "start", params).await })
            .await?;

        let on_exit = on_exit.map(|f| Box::new(move |_: Value| f()) as ExitCallback);
        self.orchestrator.bridge_exit(
            &process_id,
            &bridge,
            ids.into_iter().flatten().collect(),
            on_exit,
        );

        Ok(Process {
            process_id,
            orchestrator: self.orchestrator.clone(),
            bridge,
        })
    }
}

/// A started process.
pub struct Process {
    process_id: String,
    orchestrator: SubscriptionOrchestrator,
    bridge: ExitBridge,
}

impl Process {
    #[must_use]
    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    #[must_use]
    pub fn has_exited(&self) -> bool {
        self.bridge.has_exited()
    }

    /// Wait until the process exited and its subscriptions are torn down.
    ///
    /// # Errors
    /// Returns the aggregated unsubscribe failures.
    pub async fn wait(&self) -> Result<(), SessionError> {
        self.bridge.exited().await;
        self.bridge.torn_down().await?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the call fails.
    pub async fn send_stdin(&self, data: &str) -> Result<(), SessionError> {
        self.orchestrator
            .rpc()
            .call(
                SERVICE,
                "stdin",
                vec![Value::from(self.process_id.as_str()), Value::from(data)],
            )
            .await?;
        Ok(())
    }

    /// Kill the process and wait until it exited and its subscriptions are
    /// torn down, even if the kill call fails.
    ///
    /// # Errors
    /// Returns the kill call's error, otherwise any teardown failure.
    pub async fn kill(&self) -> Result<(), SessionError> {
        tracing::debug!(process_id = %self.process_id, "Killing process");
        let stop_call = self.orchestrator.rpc().call(
            SERVICE,
            "kill",
            vec![Value::from(self.process_id.as_str())],
        );
        self.orchestrator
            .stop(&self.process_id, &self.bridge, stop_call)
            .await
    }
}
