//! Wire shapes for the handful of Firecracker API endpoints the driver uses.
//! Field names follow Firecracker's own API exactly.

use serde::{Deserialize, Serialize};

/// `PUT /boot-source`.
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<String>,
    pub boot_args: String,
}

/// `PUT /drives/{id}`.
#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// `PUT /machine-config`.
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfiguration {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub smt: bool,
}

/// `PUT /network-interfaces/{iface}`.
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// `PUT /vsock`.
#[derive(Debug, Clone, Serialize)]
pub struct Vsock {
    pub vsock_id: String,
    pub guest_cid: u32,
    pub uds_path: String,
}

/// `PUT /fs/{tag}` — a shared host directory exposed to the guest over
/// virtio-fs, for the flat-directory rootfs strategy.
#[derive(Debug, Clone, Serialize)]
pub struct FsDevice {
    pub fs_id: String,
    pub tag: String,
    pub shared_dir: String,
}

/// `PUT /actions`.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceActionInfo {
    pub action_type: ActionType,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "PascalCase")]
pub enum ActionType {
    InstanceStart,
    SendCtrlAltDel,
}

/// `PATCH /vm`.
#[derive(Debug, Clone, Serialize)]
pub struct VmUpdateState {
    pub state: VmStateValue,
}

#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStateValue {
    Paused,
    Resumed,
}

/// `GET /`.
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    pub id: String,
    pub state: InstanceState,
    #[serde(default)]
    pub vmm_version: String,
    #[serde(default)]
    pub app_name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum InstanceState {
    NotStarted,
    Running,
    Paused,
}

/// Firecracker's standard error body.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    #[serde(default)]
    pub fault_message: String,
}
