//! Code snippet execution.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::{Handler, decode};
use crate::{error::SessionError, orchestrator::SubscriptionOrchestrator};

pub(crate) const SERVICE: &str = "codeSnippet";

/// Execution state reported by the code snippet service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CodeSnippetExecState {
    Running,
    Stopped,
}

/// Port found listening in the environment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OpenedPort {
    pub state: String,
    pub ip: String,
    pub port: u16,
}

/// Runs and stops the environment's code snippet.
pub struct CodeSnippetManager {
    orchestrator: SubscriptionOrchestrator,
    on_state_change: Option<Handler<CodeSnippetExecState>>,
}

impl CodeSnippetManager {
    pub(crate) const fn new(
        orchestrator: SubscriptionOrchestrator,
        on_state_change: Option<Handler<CodeSnippetExecState>>,
    ) -> Self {
        Self {
            orchestrator,
            on_state_change,
        }
    }

    /// Run `code` with extra environment variables.
    ///
    /// # Errors
    /// Returns error if the call fails or returns an unknown state.
    pub async fn run(
        &self,
        code: &str,
        env_vars: &HashMap<String, String>,
    ) -> Result<CodeSnippetExecState, SessionError> {
        tracing::debug!(bytes = code.len(), "Running code snippet");
        let value = self
            .orchestrator
            .rpc()
            .call(SERVICE, "run", vec![Value::from(code), json!(env_vars)])
            .await?;
        Ok(self.report(decode("codeSnippet_run", value)?))
    }

    /// Stop the running snippet.
    ///
    /// # Errors
    /// Returns error if the call fails or returns an unknown state.
    pub async fn stop(&self) -> Result<CodeSnippetExecState, SessionError> {
        tracing::debug!("Stopping code snippet");
        let value = self
            .orchestrator
            .rpc()
            .call(SERVICE, "stop", Vec::new())
            .await?;
        Ok(self.report(decode("codeSnippet_stop", value)?))
    }

    fn report(&self, state: CodeSnippetExecState) -> CodeSnippetExecState {
        if let Some(f) = &self.on_state_change {
            f(state);
        }
        state
    }
}
