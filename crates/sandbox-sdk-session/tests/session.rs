//! Session managers against a scripted loopback remote.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use sandbox_sdk_session::{
    CodeSnippetExecState, CodeSnippetOptions, FileInfo, OutputMessage, ProcessOptions, Session,
    SessionOptions, TerminalOptions,
};
use sandbox_sdk_transport::{
    RpcErrorBody, RpcRequest,
    memory::{MemoryConnection, RemoteController, RemoteEnd, RemoteService},
    protocol::kind,
};
use serde_json::{Value, json};

/// Answers manager calls the way a sandbox runner would.
#[derive(Default)]
struct Runner {
    fail_start: bool,
    /// Reject kills, and report the exit a little later.
    reject_kill: bool,
    calls: Arc<Mutex<Vec<String>>>,
}

impl Runner {
    fn instance(request: &RpcRequest) -> String {
        request
            .params
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string()
    }
}

#[async_trait]
impl RemoteService for Runner {
    async fn handle_request(
        &self,
        remote: &RemoteController,
        request: RpcRequest,
    ) -> Result<Value, RpcErrorBody> {
        self.calls.lock().unwrap().push(request.method.clone());
        let id = Self::instance(&request);
        match request.method.as_str() {
            "terminal_start" | "process_start" if self.fail_start => {
                Err(RpcErrorBody::new(1, "no capacity"))
            }
            "terminal_start" | "process_start" | "filesystem_writeFile"
            | "filesystem_removeFile" => Ok(Value::Null),
            "terminal_data" => {
                let data = request.params.get(1).cloned().unwrap_or(Value::Null);
                remote.notify_subscribers("terminal", "onData", Some(&id), &data);
                Ok(Value::Null)
            }
            "terminal_destroy" => {
                remote.notify_subscribers("terminal", "onExit", Some(&id), &Value::Null);
                Ok(Value::Bool(true))
            }
            "process_stdin" => {
                let line = request.params.get(1).and_then(Value::as_str).unwrap_or_default();
                let message = json!({ "type": "Stdout", "line": line, "timestamp": 1 });
                remote.notify_subscribers("process", "onStdout", Some(&id), &message);
                Ok(Value::Null)
            }
            "process_kill" if self.reject_kill => {
                let remote = remote.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    remote.notify_subscribers("process", "onExit", Some(&id), &Value::Null);
                });
                Err(RpcErrorBody::new(2, "kill failed"))
            }
            "process_kill" => {
                remote.notify_subscribers("process", "onExit", Some(&id), &Value::Null);
                Ok(Value::Null)
            }
            "codeSnippet_run" => Ok(json!("Running")),
            "codeSnippet_stop" => Ok(json!("Stopped")),
            "filesystem_readFile" => Ok(json!(format!("content of {id}"))),
            "filesystem_listAllFiles" => Ok(json!([
                { "isDir": true, "name": "src" },
                { "isDir": false, "name": "main.py" },
            ])),
            other => Err(RpcErrorBody::new(-32601, format!("method not found: {other}"))),
        }
    }
}

async fn serve(runner: Runner, options: SessionOptions) -> (Session, RemoteController) {
    let (conn, remote) = MemoryConnection::pair();
    let controller = remote.controller();
    controller.open("session-1");
    remote.serve(runner);
    let session = Session::open(conn, options).await.unwrap();
    (session, controller)
}

async fn next_request(remote: &mut RemoteEnd) -> RpcRequest {
    remote
        .recv_kind(kind::RPC_REQUEST)
        .await
        .unwrap()
        .decode()
        .unwrap()
}

fn flag() -> (Arc<AtomicBool>, impl FnOnce() + Send + 'static) {
    let flag = Arc::new(AtomicBool::new(false));
    let setter = {
        let flag = Arc::clone(&flag);
        move || flag.store(true, Ordering::SeqCst)
    };
    (flag, setter)
}

#[tokio::test]
async fn test_code_snippet_subscriptions_live_for_the_session() {
    let states = Arc::new(Mutex::new(Vec::new()));
    let snippet = CodeSnippetOptions::default()
        .on_state_change({
            let states = Arc::clone(&states);
            move |s| states.lock().unwrap().push(s)
        })
        .on_stdout(|_| {});
    let (session, controller) = serve(
        Runner::default(),
        SessionOptions::default().with_code_snippet(snippet),
    )
    .await;
    assert_eq!(controller.subscription_count(), 2);

    let state = session
        .code_snippet()
        .run("print(1)", &HashMap::new())
        .await
        .unwrap();
    assert_eq!(state, CodeSnippetExecState::Running);
    assert_eq!(
        session.code_snippet().stop().await.unwrap(),
        CodeSnippetExecState::Stopped
    );

    // Pushed state changes reach the same callback.
    controller.notify_subscribers("codeSnippet", "state", None, &json!("Stopped"));
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            CodeSnippetExecState::Running,
            CodeSnippetExecState::Stopped,
            CodeSnippetExecState::Stopped,
        ]
    );

    session.close().await.unwrap();
    assert_eq!(controller.subscription_count(), 0);
    assert_eq!(session.rpc().subscription_count(), 0);
}

#[tokio::test]
async fn test_filesystem_calls() {
    let (session, _controller) = serve(Runner::default(), SessionOptions::default()).await;
    let fs = session.filesystem();

    assert_eq!(fs.read_file("/code/a.py").await.unwrap(), "content of /code/a.py");
    fs.write_file("/code/a.py", "x").await.unwrap();
    fs.remove_file("/code/a.py").await.unwrap();
    let files = fs.list_all_files("/code").await.unwrap();
    assert_eq!(
        files,
        vec![
            FileInfo {
                is_dir: true,
                name: "src".into()
            },
            FileInfo {
                is_dir: false,
                name: "main.py".into()
            },
        ]
    );
}

#[tokio::test]
async fn test_unknown_remote_method_surfaces_remote_error() {
    let (session, _controller) = serve(Runner::default(), SessionOptions::default()).await;
    let err = session.terminal().kill_process(42).await.unwrap_err();
    assert!(err.to_string().contains("method not found"));
}

#[tokio::test]
async fn test_terminal_echo_and_destroy() {
    let data = Arc::new(Mutex::new(Vec::new()));
    let (exited, on_exit) = flag();
    let (session, controller) = serve(Runner::default(), SessionOptions::default()).await;

    let terminal = session
        .terminal()
        .create_session(
            TerminalOptions::new({
                let data = Arc::clone(&data);
                move |d| data.lock().unwrap().push(d)
            })
            .on_exit(on_exit)
            .with_terminal_id("t1"),
        )
        .await
        .unwrap();
    assert_eq!(terminal.terminal_id(), "t1");
    assert_eq!(controller.subscription_count(), 2);

    terminal.send_data("ls\n").await.unwrap();
    assert_eq!(*data.lock().unwrap(), vec!["ls\n".to_string()]);

    terminal.destroy().await.unwrap();
    assert!(terminal.has_exited());
    assert!(exited.load(Ordering::SeqCst));
    assert_eq!(controller.subscription_count(), 0);
    assert_eq!(session.rpc().subscription_count(), 0);
}

#[tokio::test]
async fn test_failed_start_leaves_nothing_subscribed() {
    let runner = Runner {
        fail_start: true,
        ..Runner::default()
    };
    let calls = Arc::clone(&runner.calls);
    let (session, controller) = serve(runner, SessionOptions::default()).await;
    let (exited, on_exit) = flag();

    let result = session
        .process()
        .start(
            ProcessOptions::new("sleep 1")
                .on_stdout(|_| {})
                .on_stderr(|_| {})
                .on_exit(on_exit),
        )
        .await;

    let err = result.err().unwrap();
    assert!(err.to_string().contains("no capacity"));
    assert_eq!(controller.subscription_count(), 0);
    assert_eq!(session.rpc().subscription_count(), 0);
    assert!(!exited.load(Ordering::SeqCst));
    assert_eq!(*calls.lock().unwrap(), vec!["process_start".to_string()]);
}

#[tokio::test]
async fn test_process_output_and_natural_exit() {
    let lines = Arc::new(Mutex::new(Vec::new()));
    let (exited, on_exit) = flag();
    let (session, controller) = serve(Runner::default(), SessionOptions::default()).await;

    let process = session
        .process()
        .start(
            ProcessOptions::new("cat")
                .on_stdout({
                    let lines = Arc::clone(&lines);
                    move |m: OutputMessage| lines.lock().unwrap().push(m.line)
                })
                .on_exit(on_exit)
                .with_process_id("p1"),
        )
        .await
        .unwrap();
    process.send_stdin("hello").await.unwrap();
    assert_eq!(*lines.lock().unwrap(), vec!["hello".to_string()]);

    controller.notify_subscribers("process", "onExit", Some("p1"), &Value::Null);
    process.wait().await.unwrap();

    assert!(process.has_exited());
    assert!(exited.load(Ordering::SeqCst));
    assert_eq!(controller.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_rejected_kill_still_waits_for_exit_and_teardown() {
    let runner = Runner {
        reject_kill: true,
        ..Runner::default()
    };
    let (session, controller) = serve(runner, SessionOptions::default()).await;
    let (exited, on_exit) = flag();

    let process = session
        .process()
        .start(
            ProcessOptions::new("sleep 100")
                .on_stdout(|_| {})
                .on_exit(on_exit)
                .with_process_id("p2"),
        )
        .await
        .unwrap();
    assert_eq!(controller.subscription_count(), 2);

    let started = tokio::time::Instant::now();
    let err = process.kill().await.unwrap_err();

    assert!(err.to_string().contains("kill failed"));
    assert!(started.elapsed() >= Duration::from_millis(50));
    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(process.has_exited());
    assert!(exited.load(Ordering::SeqCst));
    assert_eq!(controller.subscription_count(), 0);
    assert_eq!(session.rpc().subscription_count(), 0);
}

#[tokio::test]
async fn test_partial_subscribe_failure_rolls_back_without_start() {
    let (conn, mut remote) = MemoryConnection::pair();
    let controller = remote.controller();
    controller.open("session-1");
    let session = Arc::new(Session::open(conn, SessionOptions::default()).await.unwrap());

    let start = tokio::spawn({
        let session = Arc::clone(&session);
        async move {
            session
                .process()
                .start(ProcessOptions::new("ls").on_stdout(|_| {}).with_process_id("p3"))
                .await
                .map(|p| p.process_id().to_string())
        }
    });

    let on_exit = next_request(&mut remote).await;
    let on_stdout = next_request(&mut remote).await;
    assert_eq!(on_exit.params, vec![json!("onExit"), json!("p3")]);
    assert_eq!(on_stdout.params, vec![json!("onStdout"), json!("p3")]);

    let accepted = controller.accept_subscription(&on_exit).unwrap();
    controller.respond(on_exit.id, accepted.clone());
    controller.respond(on_stdout.id, Err(RpcErrorBody::new(3, "no such event")));

    let unsubscribe = next_request(&mut remote).await;
    assert_eq!(unsubscribe.method, "process_unsubscribe");
    assert_eq!(unsubscribe.params, vec![accepted.unwrap()]);
    controller.respond(unsubscribe.id, Ok(Value::Bool(true)));

    let err = start.await.unwrap().unwrap_err();
    assert!(err.to_string().contains("no such event"));
    assert!(remote.try_recv().is_none());
    assert_eq!(session.rpc().subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_handles_survive_a_reconnect() {
    let snippet = CodeSnippetOptions::default().on_stdout(|_| {});
    let (session, controller) = serve(
        Runner::default(),
        SessionOptions::default().with_code_snippet(snippet),
    )
    .await;
    let (exited, on_exit) = flag();
    let process = session
        .process()
        .start(
            ProcessOptions::new("sleep 100")
                .on_stdout(|_| {})
                .on_exit(on_exit)
                .with_process_id("p1"),
        )
        .await
        .unwrap();

    controller.close();
    controller.open("session-2");
    assert!(process.has_exited());
    assert_eq!(session.rpc().subscription_count(), 0);

    let started = tokio::time::Instant::now();
    process.kill().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));
    assert!(exited.load(Ordering::SeqCst));

    session.close().await.unwrap();
    assert_eq!(controller.subscription_count(), 0);
}
