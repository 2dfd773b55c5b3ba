//! Host-side dialer for the guest agent RPC channel.
//!
//! Firecracker exposes vsock as a Unix socket on the host: a client connects
//! to that socket, writes `CONNECT <port>\n`, and on success the same
//! connection becomes a byte-stream to whatever is listening on that port
//! inside the guest. From there the channel carries `micropod-proto`'s
//! length-prefixed postcard frames.

use std::path::Path;
use std::time::Duration;

use micropod_proto::{AGENT_PORT, CreateContainerReq, CreateContainerResp, Request, Response};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::timeout;

use crate::error::{Error, Result};

/// An established, handshaked connection to one VM's guest agent.
#[derive(Debug)]
pub struct AgentClient {
    stream: UnixStream,
}

impl AgentClient {
    /// Dials `uds_path`, performs the Firecracker vsock `CONNECT` handshake
    /// against [`AGENT_PORT`], then confirms the agent is listening with a
    /// `Ping`/`Pong` round trip. Bounded by `per_attempt_timeout`.
    pub async fn dial(uds_path: &Path, per_attempt_timeout: Duration) -> Result<Self> {
        timeout(per_attempt_timeout, Self::dial_inner(uds_path))
            .await
            .map_err(|_| Error::AgentUnreachable)?
    }

    async fn dial_inner(uds_path: &Path) -> Result<Self> {
        let mut stream = UnixStream::connect(uds_path).await.map_err(|_| Error::AgentUnreachable)?;
        stream
            .write_all(format!("CONNECT {AGENT_PORT}\n").as_bytes())
            .await
            .map_err(|_| Error::AgentUnreachable)?;

        let status_line = read_line(&mut stream).await.map_err(|_| Error::AgentUnreachable)?;
        if !status_line.starts_with("OK") {
            return Err(Error::AgentUnreachable);
        }

        micropod_proto::send(&mut stream, &Request::Ping).await.map_err(|_| Error::AgentUnreachable)?;
        match micropod_proto::recv::<_, Response>(&mut stream).await {
            Ok(Response::Pong { .. }) => Ok(Self { stream }),
            _ => Err(Error::AgentUnreachable),
        }
    }

    /// Dials repeatedly until an agent answers or `attempts` is exhausted.
    /// Task cancellation at an `.await` point (the inter-attempt sleep, or
    /// the attempt itself) is the caller's mechanism for aborting this loop
    /// early — there is no separate cancellation token to thread through.
    pub async fn dial_with_retry(
        uds_path: &Path,
        attempts: u32,
        interval: Duration,
        per_attempt_timeout: Duration,
    ) -> Result<Self> {
        for attempt in 0..attempts {
            if let Ok(client) = Self::dial(uds_path, per_attempt_timeout).await {
                return Ok(client);
            }
            if attempt + 1 < attempts {
                tokio::time::sleep(interval).await;
            }
        }
        Err(Error::AgentUnreachable)
    }

    /// Sends `CreateContainer` and returns the agent's response verbatim.
    /// The caller (the controller) decides what a non-`Running` status means.
    pub async fn create_container(&mut self, req: CreateContainerReq) -> Result<CreateContainerResp> {
        micropod_proto::send(&mut self.stream, &Request::CreateContainer(req)).await?;
        match micropod_proto::recv::<_, Response>(&mut self.stream).await? {
            Response::ContainerCreated(resp) => Ok(resp),
            Response::Error(e) => Err(Error::ContainerStartFailed { error_message: e.to_string() }),
            Response::Pong { .. } => Err(Error::Internal("agent replied Pong to CreateContainer".to_owned())),
        }
    }
}

async fn read_line(stream: &mut UnixStream) -> std::io::Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0_u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == b'\n' {
            break;
        }
        bytes.push(byte[0]);
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dial_times_out_against_nothing_listening() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no.sock");
        let err = AgentClient::dial(&missing, Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, Error::AgentUnreachable));
    }

    #[tokio::test]
    async fn dial_with_retry_exhausts_against_nothing_listening() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("no.sock");
        let err = AgentClient::dial_with_retry(&missing, 2, Duration::from_millis(1), Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AgentUnreachable));
    }
}
