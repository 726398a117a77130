//! Drives a session and an evaluation context against an in-process remote.
//!
//! Run with: cargo run -p loopback-demo
//!
//! Set `RUST_LOG=debug` to see the frames going back and forth.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use sandbox_sdk_core::Template;
use sandbox_sdk_session::{
    CodeSnippetOptions, ContextOptions, EvaluationContext, ProcessOptions, Session,
    SessionOptions, TerminalOptions,
};
use sandbox_sdk_transport::{
    Envelope, EnvironmentEvent, EnvironmentRequest, RpcErrorBody, RpcRequest,
    memory::{MemoryConnection, RemoteController, RemoteService},
    protocol::{
        CmdExitPayload, CmdOutPayload, EnvironmentRef, FileContentPayload, FsWritePayload,
    },
};
use serde_json::{Value, json};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Remote that keeps files in memory and echoes instead of running anything.
#[derive(Default)]
struct EchoRunner {
    files: Mutex<HashMap<String, String>>,
}

impl EchoRunner {
    fn files(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.files.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl RemoteService for EchoRunner {
    async fn handle_request(
        &self,
        remote: &RemoteController,
        request: RpcRequest,
    ) -> Result<Value, RpcErrorBody> {
        let instance = request
            .params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match request.method.as_str() {
            "codeSnippet_run" => Ok(json!("Running")),
            "terminal_start" | "process_start" => Ok(Value::Null),
            "terminal_data" => {
                let data = request.params.get(1).cloned().unwrap_or(Value::Null);
                remote.notify_subscribers("terminal", "onData", Some(&instance), &data);
                Ok(Value::Null)
            }
            "terminal_destroy" => {
                remote.notify_subscribers("terminal", "onExit", Some(&instance), &Value::Null);
                Ok(Value::Bool(true))
            }
            "process_kill" => {
                remote.notify_subscribers("process", "onExit", Some(&instance), &Value::Null);
                Ok(Value::Null)
            }
            other => Err(RpcErrorBody::new(-32601, format!("method not found: {other}"))),
        }
    }

    async fn handle_message(&self, remote: &RemoteController, message: Envelope) {
        let request = match EnvironmentRequest::decode(&message) {
            Ok(Some(request)) => request,
            Ok(None) => return,
            Err(e) => {
                tracing::warn!(kind = %message.kind, error = %e, "Bad environment request");
                return;
            }
        };
        let reply = match request {
            EnvironmentRequest::Start(p) => EnvironmentEvent::StartAck(EnvironmentRef {
                environment_id: p.environment_id,
            }),
            EnvironmentRequest::WriteFile(p) => {
                self.files().insert(p.path.clone(), p.content);
                EnvironmentEvent::FsEventWrite(FsWritePayload {
                    environment_id: p.environment_id,
                    path: p.path,
                    correlation_id: p.correlation_id,
                })
            }
            EnvironmentRequest::GetFile(p) => {
                let content = self.files().get(&p.path).cloned().unwrap_or_default();
                EnvironmentEvent::FileContent(FileContentPayload {
                    environment_id: p.environment_id,
                    path: p.path,
                    content,
                    correlation_id: p.correlation_id,
                })
            }
            EnvironmentRequest::ExecCmd(p) => {
                remote.deliver_event(&EnvironmentEvent::CmdOut(CmdOutPayload {
                    environment_id: p.environment_id.clone(),
                    execution_id: p.execution_id.clone(),
                    stdout: Some(format!("$ {}\n", p.command)),
                    stderr: None,
                }));
                EnvironmentEvent::CmdExit(CmdExitPayload {
                    environment_id: p.environment_id,
                    execution_id: p.execution_id,
                    error: None,
                })
            }
            other => {
                tracing::debug!(kind = other.kind(), "Not handled by the echo runner");
                return;
            }
        };
        remote.deliver_event(&reply);
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let (conn, remote) = MemoryConnection::pair();
    let controller = remote.controller();
    let server = remote.serve(EchoRunner::default());
    controller.open("demo-session");

    let session = Session::open(
        conn.clone(),
        SessionOptions::default().with_code_snippet(
            CodeSnippetOptions::default()
                .on_state_change(|state| tracing::info!(?state, "Code snippet state")),
        ),
    )
    .await?;
    session.code_snippet().run("print('hi')", &HashMap::new()).await?;

    let terminal = session
        .terminal()
        .create_session(
            TerminalOptions::new(|data| tracing::info!(%data, "Terminal output"))
                .on_exit(|| tracing::info!("Terminal exited")),
        )
        .await?;
    terminal.send_data("echo hello\n").await?;
    terminal.destroy().await?;

    let process = session
        .process()
        .start(ProcessOptions::new("sleep 60").on_exit(|| tracing::info!("Process exited")))
        .await?;
    process.kill().await?;

    let template = Template::builtin("python3").ok_or("missing python3 template")?;
    let ctx = EvaluationContext::new(
        conn,
        template,
        ContextOptions::default()
            .on_cmd_out(|out| tracing::info!(stdout = ?out.stdout, "Command output")),
    );
    ctx.update_file("/src/main.py", "print(1)").await?;
    let content = ctx.get_file("/src/main.py").await?;
    tracing::info!(%content, ready = ctx.environment().is_ready(), "Read back file");
    ctx.execute_code("demo", "print(2)")?;

    ctx.destroy();
    session.close().await?;
    server.abort();
    Ok(())
}
