//! Capability managers exposed by a [`Session`](crate::Session).

pub mod code_snippet;
pub mod filesystem;
pub mod process;
pub mod terminal;

use std::sync::Arc;

use sandbox_sdk_transport::NotificationHandler;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;
use uuid::Uuid;

use crate::error::SessionError;

pub use code_snippet::{CodeSnippetExecState, CodeSnippetManager, OpenedPort};
pub use filesystem::{FileInfo, FilesystemManager};
pub use process::{Process, ProcessManager, ProcessOptions};
pub use terminal::{ChildProcess, TerminalManager, TerminalOptions, TerminalSession, TerminalSize};

/// Output line pushed by code snippets and processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputMessage {
    #[serde(rename = "type", default)]
    pub kind: String,
    pub line: String,
    #[serde(default)]
    pub timestamp: u64,
}

/// Callback taking a decoded notification payload.
pub type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

/// Wrap `f` so it receives notifications decoded into `T`. Payloads that do
/// not decode are logged and dropped.
pub(crate) fn typed<T, F>(method: &'static str, f: F) -> NotificationHandler
where
    T: DeserializeOwned,
    F: Fn(T) + Send + Sync + 'static,
{
    Arc::new(move |value: Value| match serde_json::from_value::<T>(value) {
        Ok(payload) => f(payload),
        Err(e) => tracing::warn!(method, error = %e, "Unexpected notification payload"),
    })
}

pub(crate) fn decode<T: DeserializeOwned>(
    method: &'static str,
    value: Value,
) -> Result<T, SessionError> {
    serde_json::from_value(value).map_err(|source| SessionError::Decode { method, source })
}

/// Default terminal/process id.
pub(crate) fn generate_id() -> String {
    let mut id = Uuid::new_v4().simple().to_string();
    id.truncate(12);
    id
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::json;

    use super::*;

    #[test]
    fn test_generated_ids_are_short_and_distinct() {
        let a = generate_id();
        let b = generate_id();
        assert_eq!(a.len(), 12);
        assert_ne!(a, b);
    }

    #[test]
    fn test_typed_handler_drops_bad_payloads() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handler = typed::<OutputMessage, _>("onStdout", {
            let seen = Arc::clone(&seen);
            move |m| seen.lock().unwrap().push(m.line)
        });

        handler(json!({ "type": "Stdout", "line": "hello", "timestamp": 1 }));
        handler(json!(42));
        assert_eq!(*seen.lock().unwrap(), vec!["hello".to_string()]);
    }
}
