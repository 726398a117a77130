//! Evaluation context: drives one remote environment and mirrors its state.
//!
//! The context listens to the connection directly. Every (re)open restarts
//! the mirrored environment and sends a fresh start; push events are folded
//! into the mirror or handed to the caller's callbacks. File reads and writes
//! complete when the matching push event arrives, not when the request is sent.

use std::sync::{
    Arc, Mutex, MutexGuard, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use sandbox_sdk_core::{OutputLog, OutputSource, Template, join_remote, split_remote};
use sandbox_sdk_transport::{
    Connection, ConnectionHandler, Envelope, EnvironmentEvent, EnvironmentRequest, HandlerId,
    protocol::{
        CmdExitPayload, CmdOutPayload, ExecCmdPayload, GetFilePayload, PathRequest, StartPayload,
        WriteFilePayload,
    },
};
use uuid::Uuid;

use crate::{
    config::ContextConfig,
    environment::{EnvironmentState, FsNode, FsNodeType, RunningEnvironment},
    error::ContextError,
    listeners::ListenerRegistry,
};

/// Transport availability as reported to `on_session_change`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionStatus {
    Connected { session_id: String },
    Connecting,
}

pub type CmdOutHandler = Arc<dyn Fn(&CmdOutPayload) + Send + Sync>;
pub type CmdExitHandler = Arc<dyn Fn(&CmdExitPayload) + Send + Sync>;
pub type SessionChangeHandler = Arc<dyn Fn(&SessionStatus) + Send + Sync>;
pub type EnvChangeHandler = Arc<dyn Fn(&RunningEnvironment) + Send + Sync>;

/// Options for [`EvaluationContext::new`].
#[derive(Clone, Default)]
pub struct ContextOptions {
    /// Environment id; generated when absent.
    pub environment_id: Option<String>,
    pub config: ContextConfig,
    /// Command output, including failed exits as a stderr payload.
    pub on_cmd_out: Option<CmdOutHandler>,
    /// Every command exit, successful or not.
    pub on_cmd_exit: Option<CmdExitHandler>,
    pub on_session_change: Option<SessionChangeHandler>,
    /// Fired on creation and when the environment becomes ready.
    pub on_env_change: Option<EnvChangeHandler>,
}

impl ContextOptions {
    #[must_use]
    pub fn with_environment_id(mut self, id: impl Into<String>) -> Self {
        self.environment_id = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_config(mut self, config: ContextConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn on_cmd_out(mut self, f: impl Fn(&CmdOutPayload) + Send + Sync + 'static) -> Self {
        self.on_cmd_out = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_cmd_exit(mut self, f: impl Fn(&CmdExitPayload) + Send + Sync + 'static) -> Self {
        self.on_cmd_exit = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_session_change(
        mut self,
        f: impl Fn(&SessionStatus) + Send + Sync + 'static,
    ) -> Self {
        self.on_session_change = Some(Arc::new(f));
        self
    }

    #[must_use]
    pub fn on_env_change(
        mut self,
        f: impl Fn(&RunningEnvironment) + Send + Sync + 'static,
    ) -> Self {
        self.on_env_change = Some(Arc::new(f));
        self
    }
}

struct ContextInner {
    conn: Arc<dyn Connection>,
    env: Mutex<RunningEnvironment>,
    file_listeners: ListenerRegistry<String>,
    write_listeners: ListenerRegistry<()>,
    options: ContextOptions,
}

impl ContextInner {
    fn env(&self) -> MutexGuard<'_, RunningEnvironment> {
        self.env.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn environment_id(&self) -> String {
        self.env().id.clone()
    }

    fn send(&self, request: &EnvironmentRequest) -> Result<(), ContextError> {
        tracing::trace!(request = ?request, "Sending environment request");
        self.conn.send(request.to_envelope()?)?;
        Ok(())
    }

    fn restart(&self) -> Result<(), ContextError> {
        let (id, template) = {
            let mut env = self.env();
            let next = env.clone().restarted();
            *env = next;
            (env.id.clone(), env.template.id.clone())
        };
        tracing::debug!(
            environment_id = %id,
            session_id = ?self.conn.session_id(),
            "Restarting environment"
        );
        self.send(&EnvironmentRequest::Start(StartPayload {
            environment_id: id,
            template,
        }))
    }

    fn handle_open(&self, session_id: &str) {
        if let Err(e) = self.restart() {
            tracing::warn!(error = %e, "Failed to send environment start");
        }
        if let Some(f) = &self.options.on_session_change {
            f(&SessionStatus::Connected {
                session_id: session_id.to_string(),
            });
        }
    }

    fn handle_close(&self) {
        if let Some(f) = &self.options.on_session_change {
            f(&SessionStatus::Connecting);
        }
    }

    fn env_changed(&self) {
        if let Some(f) = &self.options.on_env_change {
            let snapshot = self.env().clone();
            f(&snapshot);
        }
    }

    fn handle_event(&self, event: EnvironmentEvent) {
        match event {
            EnvironmentEvent::StartAck(_) => {
                self.env().state = EnvironmentState::Ready;
                tracing::debug!("Environment ready");
                self.env_changed();
            }
            EnvironmentEvent::CmdOut(payload) => {
                if let Some(f) = &self.options.on_cmd_out {
                    f(&payload);
                }
            }
            EnvironmentEvent::CmdExit(payload) => {
                if let Some(f) = &self.options.on_cmd_exit {
                    f(&payload);
                }
                let Some(error) = &payload.error else {
                    return;
                };
                if let Some(f) = &self.options.on_cmd_out {
                    f(&CmdOutPayload {
                        environment_id: payload.environment_id.clone(),
                        execution_id: payload.execution_id.clone(),
                        stdout: None,
                        stderr: Some(error.clone()),
                    });
                }
            }
            EnvironmentEvent::FsEventWrite(payload) => {
                let resolved = self.write_listeners.offer(
                    &payload.path,
                    payload.correlation_id.as_deref(),
                    &(),
                );
                tracing::trace!(path = %payload.path, resolved, "File written");
            }
            EnvironmentEvent::FsEventCreate(payload) => {
                let (dir, name) = split_remote(&payload.path);
                let node = FsNode::new(name, FsNodeType::from_remote(&payload.node_type));
                self.env().filesystem.add_node(dir, node);
            }
            EnvironmentEvent::FsEventRemove(payload) => {
                let (dir, name) = split_remote(&payload.path);
                self.env().filesystem.remove_node(dir, name);
            }
            EnvironmentEvent::FileContent(payload) => {
                self.env()
                    .filesystem
                    .set_file_content(&payload.path, payload.content.as_str());
                self.file_listeners.offer(
                    &payload.path,
                    payload.correlation_id.as_deref(),
                    &payload.content,
                );
            }
            EnvironmentEvent::DirContent(payload) => {
                let content = payload
                    .content
                    .iter()
                    .map(|entry| {
                        let (_, name) = split_remote(&entry.path);
                        FsNode::new(name, FsNodeType::from_remote(&entry.node_type))
                    })
                    .collect();
                self.env().filesystem.set_dir(&payload.dir_path, content);
            }
            EnvironmentEvent::Stdout(payload) => {
                self.env().log_output(payload.message, OutputSource::Stdout);
            }
            EnvironmentEvent::Stderr(payload) => {
                self.env().log_output(payload.message, OutputSource::Stderr);
            }
        }
    }
}

impl ConnectionHandler for ContextInner {
    fn on_open(&self, session_id: &str) {
        self.handle_open(session_id);
    }

    fn on_message(&self, message: &Envelope) {
        if !message.is_environment() {
            return;
        }
        tracing::trace!(kind = %message.kind, payload = %message.payload, "Handling message from remote runner");

        let event = match EnvironmentEvent::decode(message) {
            Ok(Some(event)) => event,
            Ok(None) => {
                tracing::warn!(kind = %message.kind, "Unknown message type");
                return;
            }
            Err(e) => {
                tracing::warn!(kind = %message.kind, error = %e, "Malformed environment message");
                return;
            }
        };

        let own_id = self.environment_id();
        if event.environment_id() != own_id {
            tracing::debug!(
                kind = event.kind(),
                environment_id = event.environment_id(),
                expected = %own_id,
                "Ignoring event for another environment"
            );
            return;
        }
        self.handle_event(event);
    }

    fn on_close(&self) {
        self.handle_close();
    }
}

/// Coordinates one remote environment's lifecycle and I/O.
pub struct EvaluationContext {
    inner: Arc<ContextInner>,
    handler_id: HandlerId,
    destroyed: AtomicBool,
}

impl EvaluationContext {
    /// Attach a context to `conn`. If the connection is already open the
    /// environment is started right away, otherwise on the next open.
    #[must_use]
    pub fn new(conn: Arc<dyn Connection>, template: Template, options: ContextOptions) -> Self {
        let env = match &options.environment_id {
            Some(id) => RunningEnvironment::with_id(id.clone(), template),
            None => RunningEnvironment::new(template),
        };
        tracing::debug!(environment_id = %env.id, template = %env.template.id, "Creating evaluation context");

        let inner = Arc::new(ContextInner {
            conn: Arc::clone(&conn),
            env: Mutex::new(env),
            file_listeners: ListenerRegistry::new(),
            write_listeners: ListenerRegistry::new(),
            options,
        });
        let handler: Arc<dyn ConnectionHandler> = Arc::clone(&inner) as Arc<dyn ConnectionHandler>;
        let handler_id = conn.subscribe_handler(handler);

        match conn.session_id() {
            Some(session_id) if conn.is_open() => inner.handle_open(&session_id),
            _ if conn.is_closed() => inner.handle_close(),
            _ => {}
        }
        inner.env_changed();

        Self {
            inner,
            handler_id,
            destroyed: AtomicBool::new(false),
        }
    }

    /// Reset the mirror to a starting environment and send a new start.
    ///
    /// # Errors
    /// Returns error if the start message cannot be sent. The mirror is reset either way.
    pub fn restart(&self) -> Result<(), ContextError> {
        self.inner.restart()
    }

    /// Detach from the connection and drop pending listeners.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!(environment_id = %self.inner.environment_id(), "Destroying evaluation context");
        self.inner.conn.unsubscribe_handler(self.handler_id);
        self.inner.file_listeners.clear();
        self.inner.write_listeners.clear();
    }

    /// Fetch a file's content from the environment.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent, or no matching content
    /// arrives within the file timeout.
    pub async fn get_file(&self, path: &str) -> Result<String, ContextError> {
        let environment_id = self.inner.environment_id();
        tracing::debug!(environment_id = %environment_id, path, "Get file");

        let correlation_id = Uuid::new_v4().to_string();
        let (_guard, rx) = self
            .inner
            .file_listeners
            .register(path, Some(correlation_id.clone()));

        self.inner.send(&EnvironmentRequest::GetFile(GetFilePayload {
            environment_id,
            path: path.to_string(),
            correlation_id: Some(correlation_id),
        }))?;

        match tokio::time::timeout(self.inner.options.config.file_timeout, rx).await {
            Ok(Ok(content)) => Ok(content),
            Ok(Err(_)) => Err(ContextError::Destroyed),
            Err(_) => {
                tracing::warn!(path, "Timed out waiting for file content");
                Err(ContextError::FileTimeout {
                    path: path.to_string(),
                })
            }
        }
    }

    /// Write a file and wait until the environment reports the write.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent, or no matching write
    /// event arrives within the file timeout.
    pub async fn update_file(&self, path: &str, content: &str) -> Result<(), ContextError> {
        let environment_id = self.inner.environment_id();
        tracing::debug!(environment_id = %environment_id, path, "Update file");

        let correlation_id = Uuid::new_v4().to_string();
        let (_guard, rx) = self
            .inner
            .write_listeners
            .register(path, Some(correlation_id.clone()));

        self.inner.send(&EnvironmentRequest::WriteFile(WriteFilePayload {
            environment_id,
            path: path.to_string(),
            content: content.to_string(),
            correlation_id: Some(correlation_id),
        }))?;

        match tokio::time::timeout(self.inner.options.config.file_timeout, rx).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(ContextError::Destroyed),
            Err(_) => {
                tracing::warn!(path, "Timed out waiting for file write");
                Err(ContextError::WriteTimeout {
                    path: path.to_string(),
                })
            }
        }
    }

    /// Remove a file. Completion is observed through the mirror.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent.
    pub fn delete_file(&self, path: &str) -> Result<(), ContextError> {
        tracing::debug!(path, "Delete file");
        self.inner
            .send(&EnvironmentRequest::RemoveFile(self.path_request(path)))
    }

    /// # Errors
    /// Returns error if the request cannot be sent.
    pub fn create_dir(&self, path: &str) -> Result<(), ContextError> {
        tracing::debug!(path, "Create dir");
        self.inner
            .send(&EnvironmentRequest::CreateDir(self.path_request(path)))
    }

    /// Ask for a directory listing. The answer replaces the mirrored listing.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent.
    pub fn list_dir(&self, path: &str) -> Result<(), ContextError> {
        tracing::debug!(path, "List dir");
        self.inner
            .send(&EnvironmentRequest::ListDir(self.path_request(path)))
    }

    /// Write `code` to `/src/{execution_id}{ext}` and run it with the
    /// template's command. Does nothing if the template cannot run code.
    ///
    /// # Errors
    /// Returns error if the command cannot be built or a message cannot be sent.
    pub fn execute_code(&self, execution_id: &str, code: &str) -> Result<(), ContextError> {
        let (environment_id, template) = {
            let env = self.inner.env();
            (env.id.clone(), env.template.clone())
        };
        tracing::debug!(environment_id = %environment_id, execution_id, "Execute code");

        let filepath = join_remote("/src", &format!("{execution_id}{}", template.file_extension));
        let vm_filepath = join_remote(&template.root_dir, &filepath);
        let Some(command) = template.to_command(&vm_filepath)? else {
            tracing::debug!(template = %template.id, "Template cannot run code");
            return Ok(());
        };

        self.inner.send(&EnvironmentRequest::WriteFile(WriteFilePayload {
            environment_id: environment_id.clone(),
            path: filepath,
            content: code.to_string(),
            correlation_id: None,
        }))?;
        self.inner.send(&EnvironmentRequest::ExecCmd(ExecCmdPayload {
            environment_id,
            execution_id: execution_id.to_string(),
            command,
        }))
    }

    /// Run a shell command in the environment.
    ///
    /// # Errors
    /// Returns error if the request cannot be sent.
    pub fn execute_command(&self, execution_id: &str, command: &str) -> Result<(), ContextError> {
        tracing::debug!(execution_id, command, "Execute shell command");
        self.inner.send(&EnvironmentRequest::ExecCmd(ExecCmdPayload {
            environment_id: self.inner.environment_id(),
            execution_id: execution_id.to_string(),
            command: command.to_string(),
        }))
    }

    /// Snapshot of the mirrored environment.
    #[must_use]
    pub fn environment(&self) -> RunningEnvironment {
        self.inner.env().clone()
    }

    #[must_use]
    pub fn environment_id(&self) -> String {
        self.inner.environment_id()
    }

    /// Environment-level output log.
    #[must_use]
    pub fn output(&self) -> Arc<OutputLog> {
        Arc::clone(&self.inner.env().output)
    }

    /// Pending `get_file` listeners.
    #[must_use]
    pub fn file_listener_count(&self) -> usize {
        self.inner.file_listeners.len()
    }

    /// Pending `update_file` listeners.
    #[must_use]
    pub fn write_listener_count(&self) -> usize {
        self.inner.write_listeners.len()
    }

    fn path_request(&self, path: &str) -> PathRequest {
        PathRequest {
            environment_id: self.inner.environment_id(),
            path: path.to_string(),
        }
    }
}

impl Drop for EvaluationContext {
    fn drop(&mut self) {
        self.destroy();
    }
}
