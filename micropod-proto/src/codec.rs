//! Length-prefixed postcard framing over an async byte stream.
//!
//! Wire format: a 4-byte big-endian length prefix followed by that many
//! bytes of postcard-encoded payload. Symmetric for both directions of the
//! vsock stream.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame. The agent protocol only ever carries small
/// control messages, so anything past this is almost certainly a corrupted
/// length prefix rather than a legitimate oversized request.
pub const MAX_FRAME: u32 = 1024 * 1024;

/// Framing failures, distinct from the [`crate::ErrorInfo`] carried *inside*
/// a well-formed [`crate::Response::Error`].
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The transport failed or was closed mid-frame.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The length prefix exceeded [`MAX_FRAME`].
    #[error("frame of {0} bytes exceeds the {MAX_FRAME}-byte limit")]
    FrameTooLarge(u32),
    /// The payload did not decode as the expected type.
    #[error("postcard decode error: {0}")]
    Decode(#[from] postcard::Error),
}

/// Result type for framing operations.
pub type Result<T> = std::result::Result<T, CodecError>;

/// Encodes `value` and writes it as one length-prefixed frame.
pub async fn send<W, T>(writer: &mut W, value: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let payload = postcard::to_allocvec(value)?;
    let len = u32::try_from(payload.len()).map_err(|_| CodecError::FrameTooLarge(u32::MAX))?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(&payload).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame and decodes it as `T`.
pub async fn recv<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0_u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut buf = vec![0_u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(postcard::from_bytes(&buf)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{ContainerStatus, CreateContainerReq, CreateContainerResp, Request, Response};

    #[tokio::test]
    async fn roundtrips_request() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let req = Request::CreateContainer(CreateContainerReq {
            container_id: "c1".into(),
            process_args: vec!["/bin/sh".into()],
            rootfs_path: "/mnt/rootfs".into(),
        });
        send(&mut a, &req).await.unwrap();
        let decoded: Request = recv(&mut b).await.unwrap();
        match decoded {
            Request::CreateContainer(r) => assert_eq!(r.container_id, "c1"),
            Request::Ping => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn roundtrips_response() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let resp = Response::ContainerCreated(CreateContainerResp {
            container_id: "c1".into(),
            pid: 42,
            status: ContainerStatus::Running,
            error_message: None,
        });
        send(&mut a, &resp).await.unwrap();
        let decoded: Response = recv(&mut b).await.unwrap();
        match decoded {
            Response::ContainerCreated(r) => assert_eq!(r.pid, 42),
            _ => panic!("wrong variant"),
        }
    }

    #[tokio::test]
    async fn rejects_oversized_frame() {
        let (mut a, mut b) = tokio::io::duplex(16);
        a.write_all(&(MAX_FRAME + 1).to_be_bytes()).await.unwrap();
        let err = recv::<_, Request>(&mut b).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
    }
}
