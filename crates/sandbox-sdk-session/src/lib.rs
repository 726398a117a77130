//! Session layer for the sandbox SDK.
//!
//! Provides:
//! - `Session` - Code snippet, filesystem, terminal and process managers over one RPC channel
//! - `SubscriptionOrchestrator` - Subscription batches, rollback and exit-driven teardown
//! - `EvaluationContext` - Environment mirror driven by push notifications

pub mod config;
pub mod context;
pub mod environment;
pub mod error;
pub mod listeners;
pub mod managers;
pub mod orchestrator;
pub mod session;

pub use config::{ContextConfig, SessionConfig};
pub use context::{ContextOptions, EvaluationContext, SessionStatus};
pub use environment::{EnvironmentState, Filesystem, FsNode, FsNodeType, RunningEnvironment};
pub use error::{ContextError, SessionError};
pub use managers::{
    ChildProcess, CodeSnippetExecState, FileInfo, OpenedPort, OutputMessage, Process,
    ProcessOptions, TerminalOptions, TerminalSession, TerminalSize,
};
pub use orchestrator::{ExitBridge, SubscribeRequest, SubscriptionOrchestrator};
pub use session::{CodeSnippetOptions, Session, SessionOptions};
