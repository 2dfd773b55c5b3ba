//! Strategy A: an unpacked directory shared with the guest over virtio-fs.

use std::path::{Path, PathBuf};

use micropod_oci::Oci;

use crate::Result;

/// A rootfs materialized as a plain directory tree.
#[derive(Debug, Clone)]
pub struct FlatDir {
    /// Host path to the unpacked tree.
    pub path: PathBuf,
}

/// Unpacks `reference` into a freshly created directory named after `vm_id`.
pub async fn provision(oci: &Oci, reference: &str, work_dir: &Path, vm_id: &str) -> Result<FlatDir> {
    let path = work_dir.join(vm_id);
    oci.unpack(reference, &path).await?;
    Ok(FlatDir { path })
}

/// Removes the unpacked tree. Missing is not an error.
pub async fn teardown(handle: &FlatDir) -> Result<()> {
    match tokio::fs::remove_dir_all(&handle.path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn teardown_of_missing_directory_is_not_an_error() {
        let handle = FlatDir { path: PathBuf::from("/nonexistent/does/not/exist") };
        teardown(&handle).await.unwrap();
    }

    #[tokio::test]
    async fn provision_unpacks_into_a_directory_named_after_the_vm_id() {
        let store_dir = tempfile::tempdir().unwrap();
        let work_dir = tempfile::tempdir().unwrap();
        let oci = Arc::new(Oci::open_at(store_dir.path()).unwrap());

        let err = provision(&oci, "  ", work_dir.path(), "vm-1").await.unwrap_err();
        assert!(matches!(err, crate::Error::Image(micropod_oci::Error::InvalidRef(_))));
    }
}
