//! Remote filesystem calls.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::decode;
use crate::{error::SessionError, orchestrator::SubscriptionOrchestrator};

pub(crate) const SERVICE: &str = "filesystem";

/// Entry returned by [`FilesystemManager::list_all_files`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileInfo {
    pub is_dir: bool,
    pub name: String,
}

/// Request/response file operations, independent of the environment mirror.
pub struct FilesystemManager {
    orchestrator: SubscriptionOrchestrator,
}

impl FilesystemManager {
    pub(crate) const fn new(orchestrator: SubscriptionOrchestrator) -> Self {
        Self { orchestrator }
    }

    /// List the entries of directory `path`.
    ///
    /// # Errors
    /// Returns error if the call fails or the listing cannot be decoded.
    pub async fn list_all_files(&self, path: &str) -> Result<Vec<FileInfo>, SessionError> {
        tracing::debug!(path, "Listing files");
        let value = self.call("listAllFiles", vec![Value::from(path)]).await?;
        decode("filesystem_listAllFiles", value)
    }

    /// # Errors
    /// Returns error if the call fails.
    pub async fn remove_file(&self, path: &str) -> Result<(), SessionError> {
        tracing::debug!(path, "Removing file");
        self.call("removeFile", vec![Value::from(path)]).await?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the call fails.
    pub async fn write_file(&self, path: &str, content: &str) -> Result<(), SessionError> {
        tracing::debug!(path, bytes = content.len(), "Writing file");
        self.call("writeFile", vec![Value::from(path), Value::from(content)])
            .await?;
        Ok(())
    }

    /// # Errors
    /// Returns error if the call fails or does not return a string.
    pub async fn read_file(&self, path: &str) -> Result<String, SessionError> {
        tracing::debug!(path, "Reading file");
        let value = self.call("readFile", vec![Value::from(path)]).await?;
        decode("filesystem_readFile", value)
    }

    async fn call(&self, method: &str, params: Vec<Value>) -> Result<Value, SessionError> {
        Ok(self
            .orchestrator
            .rpc()
            .call(SERVICE, method, params)
            .await?)
    }
}
