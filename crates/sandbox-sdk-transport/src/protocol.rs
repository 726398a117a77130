//! Wire envelope and message taxonomy.
//!
//! Every frame is an [`Envelope`]: a message kind plus a JSON payload. RPC
//! frames carry request/response/notification payloads; environment frames
//! carry the `RunningEnvironment.*` requests and push events.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Message kinds.
pub mod kind {
    pub const RPC_REQUEST: &str = "Rpc.Request";
    pub const RPC_RESPONSE: &str = "Rpc.Response";
    pub const RPC_NOTIFICATION: &str = "Rpc.Notification";

    pub const RPC_PREFIX: &str = "Rpc.";
    pub const ENVIRONMENT_PREFIX: &str = "RunningEnvironment.";

    // Client -> remote
    pub const START: &str = "RunningEnvironment.Start";
    pub const GET_FILE: &str = "RunningEnvironment.GetFile";
    pub const WRITE_FILE: &str = "RunningEnvironment.WriteFile";
    pub const REMOVE_FILE: &str = "RunningEnvironment.RemoveFile";
    pub const CREATE_DIR: &str = "RunningEnvironment.CreateDir";
    pub const LIST_DIR: &str = "RunningEnvironment.ListDir";
    pub const EXEC_CMD: &str = "RunningEnvironment.ExecCmd";

    // Remote -> client
    pub const START_ACK: &str = "RunningEnvironment.StartAck";
    pub const CMD_OUT: &str = "RunningEnvironment.CmdOut";
    pub const CMD_EXIT: &str = "RunningEnvironment.CmdExit";
    pub const FS_EVENT_WRITE: &str = "RunningEnvironment.FSEventWrite";
    pub const FS_EVENT_CREATE: &str = "RunningEnvironment.FSEventCreate";
    pub const FS_EVENT_REMOVE: &str = "RunningEnvironment.FSEventRemove";
    pub const FILE_CONTENT: &str = "RunningEnvironment.FileContent";
    pub const DIR_CONTENT: &str = "RunningEnvironment.DirContent";
    pub const STDOUT: &str = "RunningEnvironment.Stdout";
    pub const STDERR: &str = "RunningEnvironment.Stderr";
}

/// One frame on the connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    /// Build an envelope from a serializable payload.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn new<P: Serialize>(kind: &str, payload: &P) -> Result<Self, serde_json::Error> {
        Ok(Self {
            kind: kind.to_string(),
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Decode the payload.
    ///
    /// # Errors
    /// Returns error if the payload does not match `P`.
    pub fn decode<P: DeserializeOwned>(&self) -> Result<P, serde_json::Error> {
        P::deserialize(&self.payload)
    }

    /// Whether this is an RPC frame.
    #[must_use]
    pub fn is_rpc(&self) -> bool {
        self.kind.starts_with(kind::RPC_PREFIX)
    }

    /// Whether this is a `RunningEnvironment.*` frame.
    #[must_use]
    pub fn is_environment(&self) -> bool {
        self.kind.starts_with(kind::ENVIRONMENT_PREFIX)
    }
}

// ---------------------------------------------------------------------------
// RPC payloads
// ---------------------------------------------------------------------------

/// Outgoing call. `method` is `"{service}_{method}"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

impl RpcRequest {
    /// Split `method` into `(service, method)`.
    #[must_use]
    pub fn service_method(&self) -> (&str, &str) {
        self.method
            .split_once('_')
            .unwrap_or((self.method.as_str(), ""))
    }
}

/// Error body of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcErrorBody {
    pub code: i64,
    pub message: String,
}

impl RpcErrorBody {
    #[must_use]
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Answer to an [`RpcRequest`] with the same `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcErrorBody>,
}

/// Push for a live subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcNotification {
    pub subscription: String,
    #[serde(default)]
    pub result: Value,
}

// ---------------------------------------------------------------------------
// Environment payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub template: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentRef {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
}

/// Request addressed at one remote path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathRequest {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetFilePayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub path: String,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteFilePayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub path: String,
    pub content: String,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecCmdPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    #[serde(rename = "executionID")]
    pub execution_id: String,
    pub command: String,
}

/// Output of a command started with `ExecCmd`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdOutPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    #[serde(rename = "executionID")]
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CmdExitPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    #[serde(rename = "executionID")]
    pub execution_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A file was written. Carries the request's correlation id when the remote echoes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsWritePayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub path: String,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FsCreatePayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub path: String,
    /// `"Directory"` or `"File"`.
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileContentPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub path: String,
    pub content: String,
    #[serde(
        rename = "correlationID",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    pub path: String,
    /// `"Directory"` or `"File"`.
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DirContentPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub dir_path: String,
    #[serde(default)]
    pub content: Vec<DirEntry>,
}

/// Environment-level stdout/stderr line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputPayload {
    #[serde(rename = "environmentID")]
    pub environment_id: String,
    pub message: String,
}

/// Whether a remote node type string denotes a directory.
#[must_use]
pub fn is_directory(node_type: &str) -> bool {
    node_type == "Directory"
}

/// Requests the client sends to the remote environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentRequest {
    Start(StartPayload),
    GetFile(GetFilePayload),
    WriteFile(WriteFilePayload),
    RemoveFile(PathRequest),
    CreateDir(PathRequest),
    ListDir(PathRequest),
    ExecCmd(ExecCmdPayload),
}

impl EnvironmentRequest {
    /// Message kind of this request.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Start(_) => kind::START,
            Self::GetFile(_) => kind::GET_FILE,
            Self::WriteFile(_) => kind::WRITE_FILE,
            Self::RemoveFile(_) => kind::REMOVE_FILE,
            Self::CreateDir(_) => kind::CREATE_DIR,
            Self::ListDir(_) => kind::LIST_DIR,
            Self::ExecCmd(_) => kind::EXEC_CMD,
        }
    }

    /// Wrap into an envelope.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let kind = self.kind();
        match self {
            Self::Start(p) => Envelope::new(kind, p),
            Self::GetFile(p) => Envelope::new(kind, p),
            Self::WriteFile(p) => Envelope::new(kind, p),
            Self::RemoveFile(p) | Self::CreateDir(p) | Self::ListDir(p) => Envelope::new(kind, p),
            Self::ExecCmd(p) => Envelope::new(kind, p),
        }
    }

    /// Decode a request frame. `Ok(None)` if the kind is not a request.
    ///
    /// # Errors
    /// Returns error if the kind is known but the payload is malformed.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, serde_json::Error> {
        Ok(Some(match envelope.kind.as_str() {
            kind::START => Self::Start(envelope.decode()?),
            kind::GET_FILE => Self::GetFile(envelope.decode()?),
            kind::WRITE_FILE => Self::WriteFile(envelope.decode()?),
            kind::REMOVE_FILE => Self::RemoveFile(envelope.decode()?),
            kind::CREATE_DIR => Self::CreateDir(envelope.decode()?),
            kind::LIST_DIR => Self::ListDir(envelope.decode()?),
            kind::EXEC_CMD => Self::ExecCmd(envelope.decode()?),
            _ => return Ok(None),
        }))
    }
}

/// Push events the remote environment emits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvironmentEvent {
    StartAck(EnvironmentRef),
    CmdOut(CmdOutPayload),
    CmdExit(CmdExitPayload),
    FsEventWrite(FsWritePayload),
    FsEventCreate(FsCreatePayload),
    FsEventRemove(PathRequest),
    FileContent(FileContentPayload),
    DirContent(DirContentPayload),
    Stdout(OutputPayload),
    Stderr(OutputPayload),
}

impl EnvironmentEvent {
    /// Decode an event frame. `Ok(None)` if the kind is not a known event.
    ///
    /// # Errors
    /// Returns error if the kind is known but the payload is malformed.
    pub fn decode(envelope: &Envelope) -> Result<Option<Self>, serde_json::Error> {
        Ok(Some(match envelope.kind.as_str() {
            kind::START_ACK => Self::StartAck(envelope.decode()?),
            kind::CMD_OUT => Self::CmdOut(envelope.decode()?),
            kind::CMD_EXIT => Self::CmdExit(envelope.decode()?),
            kind::FS_EVENT_WRITE => Self::FsEventWrite(envelope.decode()?),
            kind::FS_EVENT_CREATE => Self::FsEventCreate(envelope.decode()?),
            kind::FS_EVENT_REMOVE => Self::FsEventRemove(envelope.decode()?),
            kind::FILE_CONTENT => Self::FileContent(envelope.decode()?),
            kind::DIR_CONTENT => Self::DirContent(envelope.decode()?),
            kind::STDOUT => Self::Stdout(envelope.decode()?),
            kind::STDERR => Self::Stderr(envelope.decode()?),
            _ => return Ok(None),
        }))
    }

    /// Message kind of this event.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::StartAck(_) => kind::START_ACK,
            Self::CmdOut(_) => kind::CMD_OUT,
            Self::CmdExit(_) => kind::CMD_EXIT,
            Self::FsEventWrite(_) => kind::FS_EVENT_WRITE,
            Self::FsEventCreate(_) => kind::FS_EVENT_CREATE,
            Self::FsEventRemove(_) => kind::FS_EVENT_REMOVE,
            Self::FileContent(_) => kind::FILE_CONTENT,
            Self::DirContent(_) => kind::DIR_CONTENT,
            Self::Stdout(_) => kind::STDOUT,
            Self::Stderr(_) => kind::STDERR,
        }
    }

    /// Environment the event belongs to.
    #[must_use]
    pub fn environment_id(&self) -> &str {
        match self {
            Self::StartAck(p) => &p.environment_id,
            Self::CmdOut(p) => &p.environment_id,
            Self::CmdExit(p) => &p.environment_id,
            Self::FsEventWrite(p) => &p.environment_id,
            Self::FsEventCreate(p) => &p.environment_id,
            Self::FsEventRemove(p) => &p.environment_id,
            Self::FileContent(p) => &p.environment_id,
            Self::DirContent(p) => &p.environment_id,
            Self::Stdout(p) | Self::Stderr(p) => &p.environment_id,
        }
    }

    /// Wrap into an envelope.
    ///
    /// # Errors
    /// Returns error if the payload cannot be serialized.
    pub fn to_envelope(&self) -> Result<Envelope, serde_json::Error> {
        let kind = self.kind();
        match self {
            Self::StartAck(p) => Envelope::new(kind, p),
            Self::CmdOut(p) => Envelope::new(kind, p),
            Self::CmdExit(p) => Envelope::new(kind, p),
            Self::FsEventWrite(p) => Envelope::new(kind, p),
            Self::FsEventCreate(p) => Envelope::new(kind, p),
            Self::FsEventRemove(p) => Envelope::new(kind, p),
            Self::FileContent(p) => Envelope::new(kind, p),
            Self::DirContent(p) => Envelope::new(kind, p),
            Self::Stdout(p) | Self::Stderr(p) => Envelope::new(kind, p),
        }
    }
}
