//! Composed error taxonomy for the VM controller.
//!
//! Every sub-crate's own `Error` enum is folded in as a variant via
//! `#[from]`, so a caller sees one coherent type without losing the
//! underlying cause.

/// Alias for `Result<T, micropod::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by VM controller operations.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The caller supplied an unparsable image reference.
    #[error("invalid image reference: {0}")]
    InvalidRef(String),

    /// The caller supplied a malformed `host:guest` port mapping.
    #[error("invalid port mapping: {0}")]
    InvalidPortMapping(String),

    /// Any other caller input that fails validation before any resource is acquired.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Unknown VM id or image reference in the local store.
    #[error("not found")]
    NotFound,

    /// A registry `add` named an id already present.
    #[error("already exists")]
    AlreadyExists,

    /// Network provisioning failed.
    #[error("network setup failed: {0}")]
    NetworkError(#[from] micropod_net::Error),

    /// Rootfs materialization failed.
    #[error("rootfs provisioning failed: {0}")]
    RootfsError(#[from] micropod_rootfs::Error),

    /// Image store operation failed.
    #[error("image store failed: {0}")]
    ImageError(#[from] micropod_oci::Error),

    /// Firecracker process supervision or API sequencing failed.
    #[error("firecracker launch failed: {0}")]
    LaunchError(#[from] micropod_firecracker::Error),

    /// The agent dial loop exhausted its retry budget.
    #[error("guest agent never became reachable over vsock")]
    AgentUnreachable,

    /// The agent rejected or failed the `CreateContainer` request.
    #[error("container failed to start: {error_message}")]
    ContainerStartFailed {
        /// Detail reported by the guest agent.
        error_message: String,
    },

    /// The host⇆guest wire protocol failed to frame or decode a message.
    #[error("agent protocol error: {0}")]
    Protocol(#[from] micropod_proto::CodecError),

    /// Caller cancellation observed between retries or awaits.
    #[error("operation cancelled")]
    Cancelled,

    /// A violated invariant that does not fit any of the above; the process
    /// may still continue serving unrelated VMs.
    #[error("internal error: {0}")]
    Internal(String),

    /// Catch-all I/O failure distinct from the above layers' own `Io` variants.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Registry file contents did not parse as JSON.
    #[error("registry file corrupt: {0}")]
    Json(#[from] serde_json::Error),
}
