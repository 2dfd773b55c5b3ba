//! Wire protocol for the host⇆guest agent channel used by `micropod`.
//!
//! The guest agent itself is an external collaborator; this crate exists so
//! the host-side dialer and the (out-of-tree) agent share one definition of
//! the message shapes and the framing that carries them.

mod codec;
mod message;

pub use codec::{CodecError, MAX_FRAME, recv, send};
pub use message::{
    AGENT_PORT, ContainerStatus, CreateContainerReq, CreateContainerResp, ErrorCode, ErrorInfo,
    PROTOCOL_VERSION, Request, Response,
};
