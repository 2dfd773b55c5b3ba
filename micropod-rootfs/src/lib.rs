//! Rootfs provisioning for `micropod`.
//!
//! Two strategies, picked per VM by the caller:
//!
//! - [`flatdir`] — unpack the image into a plain directory, shared with the
//!   guest over virtio-fs.
//! - [`cow`] — a shared read-only ext4 base plus a per-VM device-mapper
//!   `snapshot` overlay.

mod cmd;
mod cow;
mod flatdir;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use micropod_oci::Oci;
use tokio::sync::Mutex;

pub use cow::CowSnapshot;
pub use flatdir::FlatDir;

/// Result type for rootfs provisioning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from rootfs provisioning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image store returned an error while pulling or unpacking.
    #[error(transparent)]
    Image(#[from] micropod_oci::Error),

    /// An external tool (`losetup`, `dmsetup`, `mkfs.ext4`, ...) failed.
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// An invariant was violated that should not be reachable from caller input.
    #[error("internal error: {0}")]
    Internal(String),

    /// Filesystem I/O error not otherwise classified above.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// A provisioned rootfs, ready to hand to the Firecracker driver.
#[derive(Debug, Clone)]
pub enum RootfsHandle {
    /// Strategy A.
    FlatDir(FlatDir),
    /// Strategy B.
    Cow(CowSnapshot),
}

impl RootfsHandle {
    /// The path/device the VM should boot from.
    pub fn path_on_host(&self) -> String {
        match self {
            Self::FlatDir(f) => f.path.display().to_string(),
            Self::Cow(c) => c.device_path.clone(),
        }
    }
}

/// Configures which strategy [`Provisioner::provision`] uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Strategy A (the default, per DESIGN.md's resolution of the spec's
    /// Open Question).
    #[default]
    FlatDir,
    /// Strategy B.
    Cow,
}

/// Per-ref and per-VM-id lock table, mirroring the image store's own.
#[derive(Default)]
struct LockTable {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockTable {
    async fn lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().await;
        table.entry(key.to_owned()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }
}

/// Provisions and tears down VM rootfs trees/devices.
///
/// Holds no in-process record of which CoW base mappings exist or how many
/// snapshots reference them: each process (a one-shot CLI invocation, or a
/// long-running controller) rederives that from the kernel's device-mapper
/// state plus the registry's live VM records, so cross-process teardown and
/// [`Provisioner::gc`] work correctly even though no two invocations share
/// memory.
pub struct Provisioner {
    oci: Arc<Oci>,
    work_dir: PathBuf,
    ref_locks: LockTable,
    id_locks: LockTable,
}

impl Provisioner {
    /// Creates a provisioner rooted at `work_dir` for flat-dir trees and CoW
    /// scratch files.
    pub fn new(oci: Arc<Oci>, work_dir: PathBuf) -> Self {
        Self { oci, work_dir, ref_locks: LockTable::default(), id_locks: LockTable::default() }
    }

    /// Materializes a rootfs for `vm_id` from `reference`, per `strategy`.
    pub async fn provision(&self, vm_id: &str, reference: &str, strategy: Strategy) -> Result<RootfsHandle> {
        let id_guard = self.id_locks.lock(vm_id).await;
        let _id_held = id_guard.lock().await;

        match strategy {
            Strategy::FlatDir => {
                self.oci.pull(reference).await?;
                let handle = flatdir::provision(&self.oci, reference, &self.work_dir, vm_id).await?;
                Ok(RootfsHandle::FlatDir(handle))
            }
            Strategy::Cow => self.provision_cow(vm_id, reference).await.map(RootfsHandle::Cow),
        }
    }

    async fn provision_cow(&self, vm_id: &str, reference: &str) -> Result<CowSnapshot> {
        self.oci.pull(reference).await?;
        let base_file = self.oci.create_base_image(reference).await?;
        let base_size = std::fs::metadata(&base_file)?.len();

        let ref_guard = self.ref_locks.lock(reference).await;
        let base_name = {
            let _ref_held = ref_guard.lock().await;
            cow::ensure_base_mapping(&base_file, reference).await?
        };

        let cow_dir = self.work_dir.join("cow");
        cow::create_snapshot(vm_id, &base_name, base_size, &cow_dir).await
    }

    /// Reconstructs a CoW handle for `vm_id` from just its deterministic
    /// device-mapper names, for tearing down a snapshot whose in-memory
    /// handle was lost (e.g. the controller reconciling state after a
    /// restart from the registry alone).
    pub async fn reconstruct_cow(&self, vm_id: &str, base_name: &str) -> Result<RootfsHandle> {
        let cow_dir = self.work_dir.join("cow");
        cow::reconstruct(vm_id, base_name, &cow_dir).await.map(RootfsHandle::Cow)
    }

    /// Tears down a previously provisioned rootfs. Idempotent.
    pub async fn teardown(&self, handle: &RootfsHandle) -> Result<()> {
        match handle {
            RootfsHandle::FlatDir(f) => flatdir::teardown(f).await,
            RootfsHandle::Cow(snapshot) => {
                cow::teardown_snapshot(snapshot).await;
                Ok(())
            }
        }
    }

    /// GC() — removes base mappings with no surviving snapshot.
    ///
    /// Rederives the live set from scratch on every call instead of trusting
    /// any process-local bookkeeping: `live_refs` lists the image references
    /// still referenced by running VMs (as reported by the registry), and
    /// the set of base mappings that actually exist is read straight from
    /// device-mapper. This is what makes GC correct when it runs in a
    /// process other than the one that created a given base mapping (e.g.
    /// one `micropod run` invocation and a later, separate `micropod list`).
    pub async fn gc(&self, live_refs: &[String]) -> Result<()> {
        let live_names: std::collections::HashSet<String> =
            live_refs.iter().map(|r| cow::base_name_for(r)).collect();

        for name in cow::list_base_mappings().await? {
            if !live_names.contains(&name) {
                cow::remove_base_mapping(&name).await?;
            }
        }
        Ok(())
    }
}
