//! Durable VM registry: a flat, ordered sequence of [`VMRecord`]s persisted
//! as one JSON document, mutated under a single writer discipline (read,
//! compute, atomic replace).

use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::error::{Error, Result};

/// Lifecycle state of a [`VMRecord`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmLifecycleState {
    Creating,
    Running,
    Stopping,
    Dead,
}

/// How a VM's rootfs is realized on the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RootfsRecord {
    /// A host directory shared into the guest via virtio-fs.
    FlatDir {
        /// Host-side path to the unpacked tree.
        path: PathBuf,
    },
    /// A device-mapper `snapshot` node stacked on a shared read-only base.
    Cow {
        /// `/dev/mapper/<snap-name>` node handed to Firecracker as a drive.
        device_path: PathBuf,
        /// Deterministic device-mapper name of the snapshot target.
        snapshot_name: String,
        /// Deterministic device-mapper name of the shared base this overlays.
        base_name: String,
    },
}

/// Per-VM network assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkRecord {
    /// Host-side tap device name.
    pub tap_name: String,
    /// The `/24` slot index this VM was assigned, so the allocator can
    /// recompute the taken set without reparsing `guest_ip`.
    pub slot: u16,
    /// Guest IPv4 address, e.g. `172.18.7.2`.
    pub guest_ip: String,
    /// Gateway IPv4 address, e.g. `172.18.7.1`.
    pub gateway_ip: String,
    /// Locally-administered guest MAC address.
    pub guest_mac: String,
    /// Outbound host interface the MASQUERADE rule matched against.
    pub out_interface: String,
    /// `host_port -> guest_port` publishing map.
    pub published: BTreeMap<u16, u16>,
}

/// The unit of durable state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VMRecord {
    /// Opaque identifier, unique across the registry.
    pub id: String,
    /// Caller-supplied image reference string.
    pub image_ref: String,
    /// Current lifecycle state.
    pub state: VmLifecycleState,
    /// OS process id of the VMM; 0 if unknown.
    pub firecracker_pid: u32,
    /// Absolute path to the Firecracker control socket.
    pub api_socket_path: PathBuf,
    /// How this VM's rootfs is realized on the host.
    pub rootfs_handle: RootfsRecord,
    /// Absolute path to the guest kernel image used.
    pub kernel_path: PathBuf,
    /// Network assignment, absent for VMs launched without networking.
    pub network: Option<NetworkRecord>,
    /// Absolute path to the host-side vsock Unix socket.
    pub vsock_uds_path: PathBuf,
    /// File receiving VMM stdout/stderr and guest console.
    pub log_path: PathBuf,
    /// Set on first successful agent RPC.
    pub agent_connected: bool,
    /// Unix timestamp (seconds) of record creation.
    pub created_at: u64,
}

/// The persisted VM registry.
///
/// All mutations go through `read_all` → modify → `write_all`, guarded by an
/// in-process [`RwLock`]: readers take a shared guard, writers an exclusive
/// one, so the read-modify-write cycle over the file never interleaves with
/// a concurrent one from the same process.
#[derive(Debug)]
pub struct Registry {
    path: PathBuf,
    guard: RwLock<()>,
}

impl Registry {
    /// Opens a registry backed by the JSON file at `path`. The file need not
    /// exist yet; a missing file is treated as an empty sequence.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), guard: RwLock::new(()) }
    }

    /// Returns all records, reconciled liveness aside (callers that need
    /// reconciliation do it themselves; see `controller::list_vms`).
    pub async fn list(&self) -> Result<Vec<VMRecord>> {
        let _guard = self.guard.read().await;
        self.read_all()
    }

    /// Returns the record with `id`, or `NotFound`.
    pub async fn get_by_id(&self, id: &str) -> Result<VMRecord> {
        let _guard = self.guard.read().await;
        self.read_all()?.into_iter().find(|r| r.id == id).ok_or(Error::NotFound)
    }

    /// Appends `record`. Rejects a duplicate id with `AlreadyExists`.
    pub async fn add(&self, record: VMRecord) -> Result<()> {
        let _guard = self.guard.write().await;
        let mut records = self.read_all()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::AlreadyExists);
        }
        records.push(record);
        self.write_all(&records)
    }

    /// Removes and returns the record with `id`, or `NotFound`.
    pub async fn remove(&self, id: &str) -> Result<VMRecord> {
        let _guard = self.guard.write().await;
        let mut records = self.read_all()?;
        let index = records.iter().position(|r| r.id == id).ok_or(Error::NotFound)?;
        let removed = records.remove(index);
        self.write_all(&records)?;
        Ok(removed)
    }

    /// Updates the `state` field of the record with `id`, or `NotFound`.
    pub async fn update_state(&self, id: &str, state: VmLifecycleState) -> Result<()> {
        let _guard = self.guard.write().await;
        let mut records = self.read_all()?;
        let record = records.iter_mut().find(|r| r.id == id).ok_or(Error::NotFound)?;
        record.state = state;
        self.write_all(&records)
    }

    fn read_all(&self) -> Result<Vec<VMRecord>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    fn write_all(&self, records: &[VMRecord]) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(parent)?;
        let bytes = serde_json::to_vec_pretty(records)?;
        let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.persist(&self.path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Current Unix timestamp in seconds, for stamping [`VMRecord::created_at`].
pub fn now_unix() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> VMRecord {
        VMRecord {
            id: id.to_owned(),
            image_ref: "library/alpine:latest".to_owned(),
            state: VmLifecycleState::Running,
            firecracker_pid: 0,
            api_socket_path: PathBuf::from("/tmp/api.sock"),
            rootfs_handle: RootfsRecord::FlatDir { path: PathBuf::from("/tmp/rootfs") },
            kernel_path: PathBuf::from("/tmp/vmlinux"),
            network: Some(NetworkRecord {
                tap_name: "tap-abcdefgh".to_owned(),
                slot: 7,
                guest_ip: "172.18.7.2".to_owned(),
                gateway_ip: "172.18.7.1".to_owned(),
                guest_mac: "AA:FC:00:00:00:07".to_owned(),
                out_interface: "eth0".to_owned(),
                published: BTreeMap::new(),
            }),
            vsock_uds_path: PathBuf::from("/tmp/vsock.sock"),
            log_path: PathBuf::from("/tmp/log"),
            agent_connected: true,
            created_at: now_unix(),
        }
    }

    #[tokio::test]
    async fn missing_file_is_an_empty_sequence() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        let record = sample("vm-1");
        registry.add(record.clone()).await.unwrap();
        let fetched = registry.get_by_id("vm-1").await.unwrap();
        assert_eq!(fetched.id, record.id);
    }

    #[tokio::test]
    async fn duplicate_add_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.add(sample("vm-1")).await.unwrap();
        let err = registry.add(sample("vm-1")).await.unwrap_err();
        assert!(matches!(err, Error::AlreadyExists));
    }

    #[tokio::test]
    async fn add_then_remove_then_get_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.add(sample("vm-1")).await.unwrap();
        registry.remove("vm-1").await.unwrap();
        let err = registry.get_by_id("vm-1").await.unwrap_err();
        assert!(matches!(err, Error::NotFound));
    }

    #[tokio::test]
    async fn update_state_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        registry.add(sample("vm-1")).await.unwrap();
        registry.update_state("vm-1", VmLifecycleState::Stopping).await.unwrap();
        registry.update_state("vm-1", VmLifecycleState::Stopping).await.unwrap();
        let fetched = registry.get_by_id("vm-1").await.unwrap();
        assert_eq!(fetched.state, VmLifecycleState::Stopping);
    }

    #[tokio::test]
    async fn unknown_id_operations_are_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let registry = Registry::new(dir.path().join("registry.json"));
        assert!(matches!(registry.remove("ghost").await.unwrap_err(), Error::NotFound));
        assert!(matches!(
            registry.update_state("ghost", VmLifecycleState::Dead).await.unwrap_err(),
            Error::NotFound
        ));
    }
}
