//! HTTP client for the Firecracker API over a Unix stream socket.
//!
//! Grounded in the same `hyper`/`hyperlocal` idiom used by production
//! Firecracker SDKs: one persistent client bound to a Unix socket path, a
//! thin `request`/`parse_response` core, and manual wrappers for the
//! path-parameterized endpoints.

use std::path::{Path, PathBuf};

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::Client;
use hyperlocal::{UnixClientExt, UnixConnector, Uri as UnixUri};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use serde::Serialize;

use crate::dto;

/// Errors talking to the Firecracker API.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("hyper http error: {0}")]
    Http(#[from] hyper::http::Error),

    #[error("hyper error: {0}")]
    Hyper(#[from] hyper::Error),

    #[error("request error: {0}")]
    Request(#[from] hyper_util::client::legacy::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Firecracker rejected the request (4xx/5xx), with its own error body.
    #[error("firecracker API error ({status}): {message}")]
    Firecracker { status: StatusCode, message: String },
}

/// A client bound to one VM's Firecracker API socket.
#[derive(Debug, Clone)]
pub struct FirecrackerApiClient {
    client: Client<UnixConnector, Full<Bytes>>,
    socket_path: PathBuf,
}

impl FirecrackerApiClient {
    /// Binds a client to `socket_path`. Does not connect until first use.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            client: Client::unix(),
            socket_path: socket_path.into(),
        }
    }

    /// The socket path this client talks to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    async fn request(&self, method: Method, path: &str, body: Full<Bytes>) -> Result<Response<Incoming>, ApiError> {
        let uri: Uri = UnixUri::new(&self.socket_path, path).into();
        let req = Request::builder()
            .method(method)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(body)?;
        Ok(self.client.request(req).await?)
    }

    async fn expect_success(&self, response: Response<Incoming>) -> Result<(), ApiError> {
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body = response.into_body().collect().await?.to_bytes();
        let message = serde_json::from_slice::<dto::ApiErrorBody>(&body)
            .map(|e| e.fault_message)
            .unwrap_or_else(|_| String::from_utf8_lossy(&body).into_owned());
        Err(ApiError::Firecracker { status, message })
    }

    async fn get_json<T: for<'de> serde::Deserialize<'de>>(&self, path: &str) -> Result<T, ApiError> {
        let response = self.request(Method::GET, path, Full::new(Bytes::new())).await?;
        let status = response.status();
        let body = response.into_body().collect().await?.to_bytes();
        if !status.is_success() {
            let message = serde_json::from_slice::<dto::ApiErrorBody>(&body)
                .map(|e| e.fault_message)
                .unwrap_or_default();
            return Err(ApiError::Firecracker { status, message });
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn put_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let bytes = serde_json::to_vec(body)?;
        let response = self.request(Method::PUT, path, Full::new(Bytes::from(bytes))).await?;
        self.expect_success(response).await
    }

    async fn patch_json<T: Serialize>(&self, path: &str, body: &T) -> Result<(), ApiError> {
        let bytes = serde_json::to_vec(body)?;
        let response = self.request(Method::PATCH, path, Full::new(Bytes::from(bytes))).await?;
        self.expect_success(response).await
    }

    /// `GET /`.
    pub async fn get_instance_info(&self) -> Result<dto::InstanceInfo, ApiError> {
        self.get_json("/").await
    }

    /// `PUT /boot-source`.
    pub async fn put_boot_source(&self, boot_source: &dto::BootSource) -> Result<(), ApiError> {
        self.put_json("/boot-source", boot_source).await
    }

    /// `PUT /machine-config`.
    pub async fn put_machine_config(&self, config: &dto::MachineConfiguration) -> Result<(), ApiError> {
        self.put_json("/machine-config", config).await
    }

    /// `PUT /vsock`.
    pub async fn put_vsock(&self, vsock: &dto::Vsock) -> Result<(), ApiError> {
        self.put_json("/vsock", vsock).await
    }

    /// `PUT /actions`.
    pub async fn put_actions(&self, action: &dto::InstanceActionInfo) -> Result<(), ApiError> {
        self.put_json("/actions", action).await
    }

    /// `PATCH /vm`.
    pub async fn patch_vm(&self, state: &dto::VmUpdateState) -> Result<(), ApiError> {
        self.patch_json("/vm", state).await
    }

    /// `PUT /drives/{drive_id}` — path-parameterized, so built manually.
    pub async fn put_drive(&self, drive: &dto::Drive) -> Result<(), ApiError> {
        let encoded = utf8_percent_encode(&drive.drive_id, NON_ALPHANUMERIC);
        self.put_json(&format!("/drives/{encoded}"), drive).await
    }

    /// `PUT /network-interfaces/{iface_id}` — path-parameterized.
    pub async fn put_network_interface(&self, iface: &dto::NetworkInterface) -> Result<(), ApiError> {
        let encoded = utf8_percent_encode(&iface.iface_id, NON_ALPHANUMERIC);
        self.put_json(&format!("/network-interfaces/{encoded}"), iface).await
    }

    /// `PUT /fs/{tag}` — path-parameterized.
    pub async fn put_fs(&self, fs: &dto::FsDevice) -> Result<(), ApiError> {
        let encoded = utf8_percent_encode(&fs.tag, NON_ALPHANUMERIC);
        self.put_json(&format!("/fs/{encoded}"), fs).await
    }
}
