//! Strategy B: ext4 base image + device-mapper `linear`/`snapshot` CoW
//! overlay, one snapshot per VM.

use std::path::Path;

use sha2::{Digest, Sha256};

use crate::cmd::{run, run_best_effort};
use crate::{Error, Result};

const SECTOR_SIZE: u64 = 512;
/// `dmsetup snapshot` chunk size, in sectors (4 KiB).
const SNAPSHOT_CHUNK_SECTORS: u64 = 8;
/// CoW file size relative to the base image.
const COW_SIZE_DIVISOR: u64 = 10;
const COW_MIN_BYTES: u64 = 4 * 1024 * 1024;

/// A live CoW snapshot device for one VM.
#[derive(Debug, Clone)]
pub struct CowSnapshot {
    /// `/dev/mapper/<snap-name>` block device the VM boots from.
    pub device_path: String,
    snapshot_name: String,
    cow_loop_device: String,
    cow_file: std::path::PathBuf,
    base_name: String,
}

impl CowSnapshot {
    /// The device-mapper name of this snapshot, exposed for bookkeeping.
    pub fn name(&self) -> &str {
        &self.snapshot_name
    }

    /// The name of the base mapping this snapshot overlays, so the caller
    /// can decrement its refcount on teardown.
    pub fn base_name(&self) -> &str {
        &self.base_name
    }
}

/// Deterministic device-mapper name for a ref's base mapping.
pub fn base_name_for(reference: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(reference.as_bytes());
    format!("micropod-base-{:x}", hasher.finalize())[..26].to_owned()
}

fn snapshot_name_for(vm_id: &str) -> String {
    format!("micropod-snap-{vm_id}")
}

/// Ensures a read-only `linear` base mapping exists for `base_file`, creating
/// it (and its backing loop device) if absent. Returns the mapping name.
pub async fn ensure_base_mapping(base_file: &Path, reference: &str) -> Result<String> {
    let name = base_name_for(reference);
    if dm_device_exists(&name).await? {
        return Ok(name);
    }

    let loop_dev = attach_loop(base_file).await?;
    let result = async {
        let sectors = device_size_sectors(&loop_dev).await?;
        let table = format!("0 {sectors} linear {loop_dev} 0");
        dm_create(&name, &table).await
    }
    .await;

    if result.is_err() {
        detach_loop(&loop_dev).await;
    }
    result?;
    Ok(name)
}

/// Creates a per-VM CoW snapshot over `base_name`, sized relative to `base_size`.
pub async fn create_snapshot(vm_id: &str, base_name: &str, base_size: u64, cow_dir: &Path) -> Result<CowSnapshot> {
    let snap_name = snapshot_name_for(vm_id);
    let cow_size = (base_size / COW_SIZE_DIVISOR).max(COW_MIN_BYTES);
    let cow_file = cow_dir.join(format!("{vm_id}.cow"));

    tokio::fs::create_dir_all(cow_dir).await?;
    let file = std::fs::File::create(&cow_file)?;
    file.set_len(cow_size)?;
    drop(file);

    let cow_loop = attach_loop(&cow_file).await?;
    let result = async {
        let base_dev = format!("/dev/mapper/{base_name}");
        let sectors = device_size_sectors(&base_dev).await?;
        let table = format!("0 {sectors} snapshot {base_dev} {cow_loop} P {SNAPSHOT_CHUNK_SECTORS}");
        dm_create(&snap_name, &table).await
    }
    .await;

    if let Err(e) = result {
        detach_loop(&cow_loop).await;
        let _ = std::fs::remove_file(&cow_file);
        return Err(e);
    }

    Ok(CowSnapshot {
        device_path: format!("/dev/mapper/{snap_name}"),
        snapshot_name: snap_name,
        cow_loop_device: cow_loop,
        cow_file,
        base_name: base_name.to_owned(),
    })
}

/// Reconstructs a handle for a snapshot already on disk, from just the
/// deterministic names derivable from `vm_id` and `base_name`. Used to tear
/// down a snapshot whose original `CowSnapshot` was never kept in memory.
pub async fn reconstruct(vm_id: &str, base_name: &str, cow_dir: &Path) -> Result<CowSnapshot> {
    let snapshot_name = snapshot_name_for(vm_id);
    let cow_loop_device = backing_loop_device(&snapshot_name).await?.unwrap_or_default();
    let cow_file = cow_dir.join(format!("{vm_id}.cow"));
    Ok(CowSnapshot {
        device_path: format!("/dev/mapper/{snapshot_name}"),
        snapshot_name,
        cow_loop_device,
        cow_file,
        base_name: base_name.to_owned(),
    })
}

/// Removes a snapshot's mapping, detaches its CoW loop device, and deletes
/// its CoW file. The underlying base mapping is left untouched.
pub async fn teardown_snapshot(snapshot: &CowSnapshot) {
    run_best_effort("dmsetup", &["remove", &snapshot.snapshot_name]).await;
    detach_loop(&snapshot.cow_loop_device).await;
    if let Err(e) = std::fs::remove_file(&snapshot.cow_file) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!(error = %e, file = %snapshot.cow_file.display(), "failed to remove orphaned CoW file");
        }
    }
}

/// Removes a base mapping and its loop device. Callers must have already
/// established the refcount is zero.
pub async fn remove_base_mapping(base_name: &str) -> Result<()> {
    let loop_dev = backing_loop_device(base_name).await?;
    run("dmsetup", &["remove", base_name]).await?;
    if let Some(loop_dev) = loop_dev {
        detach_loop(&loop_dev).await;
    }
    Ok(())
}

async fn dm_device_exists(name: &str) -> Result<bool> {
    match run("dmsetup", &["info", "-c", "--noheadings", "-o", "name", name]).await {
        Ok(_) => Ok(true),
        Err(Error::CommandFailed(_)) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Lists every base mapping currently known to device-mapper, read straight
/// from the kernel rather than any process-local bookkeeping, so a fresh
/// process (e.g. a one-shot CLI invocation) sees mappings created by an
/// earlier one.
pub async fn list_base_mappings() -> Result<Vec<String>> {
    let output = match run("dmsetup", &["info", "-c", "--noheadings", "-o", "name"]).await {
        Ok(output) => output,
        Err(Error::CommandFailed(_)) => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    Ok(output
        .lines()
        .map(str::trim)
        .filter(|name| name.starts_with("micropod-base-"))
        .map(str::to_owned)
        .collect())
}

async fn backing_loop_device(dm_name: &str) -> Result<Option<String>> {
    let table = run("dmsetup", &["table", dm_name]).await?;
    Ok(table
        .split_whitespace()
        .find(|tok| tok.starts_with("/dev/loop"))
        .map(str::to_owned))
}

async fn dm_create(name: &str, table: &str) -> Result<()> {
    use std::process::Stdio;
    use tokio::io::AsyncWriteExt;
    use tokio::process::Command;

    let mut child = Command::new("dmsetup")
        .args(["create", name])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(stdin) = child.stdin.as_mut() {
        stdin.write_all(table.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
    }

    let output = child.wait_with_output().await?;
    if !output.status.success() {
        return Err(Error::CommandFailed(format!(
            "dmsetup create {name}: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

async fn attach_loop(file: &Path) -> Result<String> {
    run("losetup", &["--show", "-f", path_str(file)?]).await
}

async fn detach_loop(device: &str) {
    run_best_effort("losetup", &["-d", device]).await;
}

async fn device_size_sectors(device: &str) -> Result<u64> {
    let bytes: u64 = run("blockdev", &["--getsize64", device])
        .await?
        .parse()
        .map_err(|_| Error::Internal(format!("unparseable device size for {device}")))?;
    Ok(bytes / SECTOR_SIZE)
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| Error::Internal(format!("non-UTF-8 path: {}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_name_is_deterministic_and_valid() {
        let a = base_name_for("library/alpine:latest");
        let b = base_name_for("library/alpine:latest");
        let c = base_name_for("library/alpine:3.19");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '-'));
    }

    /// Exercises the real loop/dmsetup path. Requires root and both
    /// `losetup`/`dmsetup` on `PATH`; skipped otherwise rather than failing.
    #[tokio::test]
    async fn full_snapshot_lifecycle_against_real_devicemapper() {
        if !has_root_and_tools().await {
            eprintln!("skipping: requires root plus losetup/dmsetup");
            return;
        }

        let dir = tempfile::tempdir().unwrap();
        let base_file = dir.path().join("base.img");
        std::fs::File::create(&base_file).unwrap().set_len(16 * 1024 * 1024).unwrap();
        run("mkfs.ext4", &["-q", "-F", base_file.to_str().unwrap()]).await.unwrap();

        let reference = "test/lifecycle:latest";
        let base_name = ensure_base_mapping(&base_file, reference).await.unwrap();
        let base_size = std::fs::metadata(&base_file).unwrap().len();

        let snapshot = create_snapshot("vm-test", &base_name, base_size, dir.path()).await.unwrap();
        assert!(std::path::Path::new(&snapshot.device_path).exists());

        teardown_snapshot(&snapshot).await;
        remove_base_mapping(&base_name).await.unwrap();
    }

    async fn has_root_and_tools() -> bool {
        #[cfg(unix)]
        let is_root = nix::unistd::Uid::effective().is_root();
        #[cfg(not(unix))]
        let is_root = false;

        is_root && run("losetup", &["--version"]).await.is_ok() && run("dmsetup", &["--version"]).await.is_ok()
    }
}
