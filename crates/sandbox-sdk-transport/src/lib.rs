//! Transport layer for the sandbox session SDK.
//!
//! Provides:
//! - Wire envelope and message taxonomy
//! - Connection contract consumed by the session layer
//! - RPC channel (calls, subscriptions, notifications)
//! - In-process loopback connection (feature: memory)

pub mod connection;
pub mod protocol;
pub mod rpc;

#[cfg(feature = "memory")]
pub mod memory;

pub use connection::{Connection, ConnectionHandler, HandlerId, HandlerSet, TransportError};
pub use protocol::{Envelope, EnvironmentEvent, EnvironmentRequest, RpcErrorBody, RpcRequest};
pub use rpc::{NotificationHandler, RpcChannel, RpcConfig, RpcError, SubscriptionId};
