//! Message types for the host⇆guest agent channel.
//!
//! The agent is an external collaborator: this crate only describes the
//! shape of the one operation the core depends on, `CreateContainer`, plus a
//! cheap `Ping` used to confirm the vsock connection is accepted before the
//! real request is sent.

use serde::{Deserialize, Serialize};

/// Wire format revision. Bumped whenever a variant's fields change.
pub const PROTOCOL_VERSION: u16 = 1;

/// Fixed vsock port the guest agent listens on.
pub const AGENT_PORT: u32 = 1024;

/// Request sent by the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Liveness probe, sent once per dial attempt before the real request.
    Ping,
    /// Ask the agent to create and start a container.
    CreateContainer(CreateContainerReq),
}

/// Response sent by the guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Reply to [`Request::Ping`].
    Pong {
        /// The agent's protocol version, for mismatch detection by the caller.
        protocol_version: u16,
    },
    /// Reply to [`Request::CreateContainer`].
    ContainerCreated(CreateContainerResp),
    /// The agent rejected the request.
    Error(ErrorInfo),
}

/// Parameters for creating one container inside the guest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerReq {
    /// Caller-chosen container id (the VM id is reused for this in practice).
    pub container_id: String,
    /// `argv` for the container's entry process; never empty.
    pub process_args: Vec<String>,
    /// Path to the rootfs as seen from inside the guest (e.g. the virtio-fs
    /// mount point, or the root device when no agent-side mount is needed).
    pub rootfs_path: String,
}

/// Outcome of a `CreateContainer` request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateContainerResp {
    /// Echoes [`CreateContainerReq::container_id`].
    pub container_id: String,
    /// Guest-side pid of the container's entry process, if it started.
    pub pid: u32,
    /// Terminal or transient status of the create attempt.
    pub status: ContainerStatus,
    /// Present when `status` is [`ContainerStatus::Failed`].
    pub error_message: Option<String>,
}

/// Status reported for a container create attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    /// The entry process started.
    Running,
    /// The runtime refused or failed to start the entry process.
    Failed,
}

/// An error returned in place of a normal response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Coarse classification, for callers that branch on error kind.
    pub code: ErrorCode,
    /// Human-readable detail, surfaced verbatim in diagnostics.
    pub message: String,
}

impl ErrorInfo {
    /// Builds an [`ErrorInfo`] from a code and a message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for ErrorInfo {}

/// Coarse agent-side error classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The caller's protocol version is incompatible with the agent's.
    VersionMismatch,
    /// The request was structurally invalid (empty `process_args`, etc).
    InvalidRequest,
    /// The underlying OCI runtime invocation failed unexpectedly.
    Internal,
}
