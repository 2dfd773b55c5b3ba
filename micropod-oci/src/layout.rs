//! On-disk OCI Image Layout: `oci-layout` marker, `index.json`, and
//! content-addressed `blobs/sha256/<hex>`.
//!
//! Interoperable with any conformant OCI tooling: the marker, index shape,
//! and blob addressing follow the OCI Image Layout specification exactly,
//! rather than a private format.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{Error, Result};

const LAYOUT_VERSION: &str = "1.0.0";
const REF_ANNOTATION: &str = "org.opencontainers.image.ref.name";

#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// An OCI content descriptor, as stored in `index.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    /// Media type of the referenced blob.
    #[serde(rename = "mediaType")]
    pub media_type: String,
    /// `sha256:<hex>` digest of the referenced blob.
    pub digest: String,
    /// Size of the referenced blob, in bytes.
    pub size: u64,
    /// Free-form annotations; the ref name lives under [`REF_ANNOTATION`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

impl Descriptor {
    /// Returns the value of the image-reference annotation, if present.
    pub fn reference(&self) -> Option<&str> {
        self.annotations
            .as_ref()
            .and_then(|a| a.get(REF_ANNOTATION))
            .map(String::as_str)
    }
}

/// The top-level `index.json` document.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Index {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    /// One entry per locally stored image, keyed by the ref annotation.
    pub manifests: Vec<Descriptor>,
}

/// A content-addressed OCI Image Layout rooted at a directory.
#[derive(Debug, Clone)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    /// Opens (creating if necessary) a layout rooted at `root`.
    pub fn open(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root.join("blobs").join("sha256"))?;

        let marker_path = root.join("oci-layout");
        if !marker_path.is_file() {
            let marker = LayoutMarker {
                image_layout_version: LAYOUT_VERSION.to_owned(),
            };
            write_atomic(&marker_path, &serde_json::to_vec_pretty(&marker)?)?;
        }

        let index_path = root.join("index.json");
        if !index_path.is_file() {
            write_atomic(&index_path, &serde_json::to_vec_pretty(&Index::default())?)?;
        }

        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Path to the blob backing `digest` (not guaranteed to exist).
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        let hex = digest
            .strip_prefix("sha256:")
            .ok_or_else(|| Error::IntegrityError(format!("unsupported digest algorithm: {digest}")))?;
        Ok(self.root.join("blobs").join("sha256").join(hex))
    }

    /// Writes `data` into the blob store, returning its digest.
    ///
    /// Idempotent: if a blob with the resulting digest already exists, the
    /// write is skipped. This is how pulling an image whose layers are
    /// already cached avoids touching disk for those layers.
    pub fn write_blob(&self, data: &[u8]) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(data);
        let digest = format!("sha256:{:x}", hasher.finalize());

        let path = self.blob_path(&digest)?;
        if !path.is_file() {
            write_atomic(&path, data)?;
        }
        Ok(digest)
    }

    /// Reads the full contents of `index.json`.
    pub fn read_index(&self) -> Result<Index> {
        let path = self.root.join("index.json");
        let bytes = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Atomically replaces `index.json`.
    fn write_index(&self, index: &Index) -> Result<()> {
        write_atomic(&self.root.join("index.json"), &serde_json::to_vec_pretty(index)?)
    }

    /// Finds the manifest descriptor stored under `reference`, if any.
    pub fn find_by_ref(&self, reference: &str) -> Result<Option<Descriptor>> {
        let index = self.read_index()?;
        Ok(index
            .manifests
            .into_iter()
            .find(|d| d.reference() == Some(reference)))
    }

    /// Inserts or replaces the manifest descriptor for `reference`.
    pub fn upsert_ref(&self, reference: &str, mut descriptor: Descriptor) -> Result<()> {
        let mut annotations = descriptor.annotations.take().unwrap_or_default();
        annotations.insert(REF_ANNOTATION.to_owned(), reference.to_owned());
        descriptor.annotations = Some(annotations);

        let mut index = self.read_index()?;
        index.manifests.retain(|d| d.reference() != Some(reference));
        index.manifests.push(descriptor);
        self.write_index(&index)
    }

    /// Removes the manifest descriptor for `reference`, if present.
    pub fn remove_ref(&self, reference: &str) -> Result<()> {
        let mut index = self.read_index()?;
        index.manifests.retain(|d| d.reference() != Some(reference));
        self.write_index(&index)
    }

    /// Path to the standalone ext4 base image file for `reference`, kept
    /// outside `blobs/` since it is a derived artifact, not content-addressed.
    pub fn base_image_path(&self, reference: &str) -> Result<PathBuf> {
        let dir = self.root.join("bases");
        std::fs::create_dir_all(&dir)?;
        Ok(dir.join(slugify(reference)).with_extension("ext4"))
    }
}

/// Replaces path-hostile characters in a reference string so it is safe to
/// use as a single path component.
fn slugify(reference: &str) -> String {
    reference
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

/// Writes `data` to `path` via a sibling temp file plus rename, so readers
/// never observe a partially written file.
fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path.parent().ok_or_else(|| {
        Error::Internal("write_atomic target has no parent directory".to_owned())
    })?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    tmp.write_all(data)?;
    tmp.persist(path)
        .map_err(|e| Error::Io(e.error))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_blob_is_content_addressed_and_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::open(dir.path()).unwrap();

        let d1 = layout.write_blob(b"hello").unwrap();
        let d2 = layout.write_blob(b"hello").unwrap();
        assert_eq!(d1, d2);
        assert!(layout.blob_path(&d1).unwrap().is_file());
    }

    #[test]
    fn upsert_and_find_ref_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = Layout::open(dir.path()).unwrap();

        let digest = layout.write_blob(b"{}").unwrap();
        layout
            .upsert_ref(
                "library/alpine:latest",
                Descriptor {
                    media_type: "application/vnd.oci.image.manifest.v1+json".into(),
                    digest: digest.clone(),
                    size: 2,
                    annotations: None,
                },
            )
            .unwrap();

        let found = layout.find_by_ref("library/alpine:latest").unwrap().unwrap();
        assert_eq!(found.digest, digest);

        layout.remove_ref("library/alpine:latest").unwrap();
        assert!(layout.find_by_ref("library/alpine:latest").unwrap().is_none());
    }
}
