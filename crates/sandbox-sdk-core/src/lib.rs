//! Core utilities for the sandbox session SDK.
//!
//! This crate provides the building blocks shared by the transport and
//! session layers:
//! - `SettledResults` - Aggregate outcomes of concurrent operations
//! - `DeferredCompletion` - Single-assignment completion settled by another task
//! - `OutputLog` - Broadcast + history of environment output
//! - `Template` - Environment templates and remote path helpers

pub mod deferred;
pub mod output;
pub mod settled;
pub mod template;

pub use deferred::{CompletionError, DeferredCompletion};
pub use output::{OutputEntry, OutputLog, OutputSource};
pub use settled::{Failure, Outcome, SettledError, SettledResults, settle_all, settle_optional};
pub use template::{Template, TemplateError, join_remote, split_remote};
