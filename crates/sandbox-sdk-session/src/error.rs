//! Session and evaluation context errors.

use sandbox_sdk_core::{SettledError, TemplateError};
use sandbox_sdk_transport::{RpcError, TransportError};

/// Session facade error.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Rpc(#[from] RpcError),
    #[error("teardown failed: {0}")]
    Teardown(#[from] SettledError),
    #[error("unexpected `{method}` result: {source}")]
    Decode {
        method: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

/// Evaluation context error.
#[derive(Debug, thiserror::Error)]
pub enum ContextError {
    #[error("Error retrieving file {path}: timeout")]
    FileTimeout { path: String },
    #[error("File {path} not written to VM: timeout")]
    WriteTimeout { path: String },
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Evaluation context destroyed")]
    Destroyed,
    #[error("Template error: {0}")]
    Template(#[from] TemplateError),
}
