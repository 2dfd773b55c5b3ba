//! OCI image store for `micropod`.
//!
//! Images are kept on disk as a real [OCI Image
//! Layout](https://github.com/opencontainers/image-spec/blob/main/image-layout.md):
//! a top-level `oci-layout` marker, an `index.json` enumerating stored
//! images by reference, and content-addressed `blobs/sha256/<hex>` for
//! manifests, configs, and layers. Any conformant OCI tool can read it.
//!
//! # Architecture
//!
//! ```text
//! Oci (public API)
//!  ├── Layout (oci-layout + index.json + blobs/sha256/*)
//!  ├── extract (whiteout-aware layer application)
//!  └── oci_client::Client (registry communication)
//! ```

mod base;
mod extract;
mod layout;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use layout::{Descriptor, Layout};
use oci_client::client::ClientConfig;
use oci_client::secrets::RegistryAuth;
use tokio::sync::Mutex;

/// Accepted layer media types (OCI + Docker).
const ACCEPTED_MEDIA_TYPES: &[&str] = &[
    "application/vnd.oci.image.layer.v1.tar+gzip",
    "application/vnd.docker.image.rootfs.diff.tar.gzip",
];

const MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// Result type for image store operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from image store operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The image reference string could not be parsed.
    #[error("invalid image reference: {0}")]
    InvalidRef(String),

    /// The image was not found locally.
    #[error("image not found: {0}")]
    NotFound(String),

    /// The registry could not be reached or returned a transport error.
    #[error("registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A downloaded blob's content did not match its expected digest, or the
    /// on-disk layout is otherwise internally inconsistent.
    #[error("integrity error: {0}")]
    IntegrityError(String),

    /// The store's filesystem ran out of space.
    #[error("storage full: {0}")]
    StorageFull(String),

    /// An invariant was violated that should not be reachable from caller input.
    #[error("internal error: {0}")]
    Internal(String),

    /// Filesystem I/O error not otherwise classified above.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error reading/writing the layout.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Subset of the OCI image configuration relevant to launching a container.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct ImageConfig {
    /// Default command (`CMD`).
    #[serde(default, alias = "Cmd")]
    pub cmd: Option<Vec<String>>,
    /// Default entrypoint (`ENTRYPOINT`).
    #[serde(default, alias = "Entrypoint")]
    pub entrypoint: Option<Vec<String>>,
    /// Default environment variables.
    #[serde(default, alias = "Env")]
    pub env: Option<Vec<String>>,
    /// Default working directory.
    #[serde(default, alias = "WorkingDir")]
    pub working_dir: Option<String>,
    /// Default user (from `USER`).
    #[serde(default, alias = "User")]
    pub user: Option<String>,
    /// Exposed ports (from `EXPOSE`).
    #[serde(default, alias = "ExposedPorts")]
    pub exposed_ports: Option<serde_json::Value>,
}

impl ImageConfig {
    /// Combines `Entrypoint ++ Cmd` into the default `process_args`.
    pub fn command(&self) -> Vec<String> {
        let mut parts = Vec::new();
        if let Some(ep) = &self.entrypoint {
            parts.extend(ep.iter().cloned());
        }
        if let Some(cmd) = &self.cmd {
            parts.extend(cmd.iter().cloned());
        }
        parts
    }
}

/// In-memory view of a stored image.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ImageView {
    /// The reference this image was stored under.
    pub reference: String,
    /// Digest of the image manifest.
    pub manifest_digest: String,
    /// Ordered layer digests, outermost-last.
    pub layer_digests: Vec<String>,
}

/// Configuration for opening an [`Oci`] store.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Root directory of the OCI Image Layout.
    pub store_dir: PathBuf,
    /// Registry authentication. Defaults to anonymous.
    pub auth: RegistryAuth,
}

/// Per-reference locks, so concurrent Pull/Unpack on the same ref serialize
/// while distinct refs proceed in parallel.
#[derive(Debug, Default)]
struct RefLocks {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RefLocks {
    async fn lock(&self, reference: &str) -> Arc<Mutex<()>> {
        let mut table = self.locks.lock().await;
        table
            .entry(reference.to_owned())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// OCI image manager backed by a content-addressed [`Layout`].
pub struct Oci {
    layout: Layout,
    client: oci_client::Client,
    auth: RegistryAuth,
    ref_locks: RefLocks,
}

impl std::fmt::Debug for Oci {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Oci").field("layout", &self.layout).finish()
    }
}

impl Oci {
    /// Opens (or creates) the image store at `config.store_dir`.
    pub fn open_with(config: OciConfig) -> Result<Self> {
        let layout = Layout::open(&config.store_dir)?;
        let client = oci_client::Client::new(ClientConfig::default());
        Ok(Self {
            layout,
            client,
            auth: config.auth,
            ref_locks: RefLocks::default(),
        })
    }

    /// Opens (or creates) the image store rooted at `store_dir` with anonymous auth.
    pub fn open_at(store_dir: &Path) -> Result<Self> {
        Self::open_with(OciConfig {
            store_dir: store_dir.to_path_buf(),
            auth: RegistryAuth::Anonymous,
        })
    }

    /// Returns the cached view without network access if
    /// `reference` is already stored locally.
    #[tracing::instrument(skip(self), fields(reference))]
    pub async fn pull(&self, reference: &str) -> Result<ImageView> {
        let parsed = parse_reference(reference)?;
        let canonical = parsed.to_string();

        let guard = self.ref_locks.lock(&canonical).await;
        let _held = guard.lock().await;

        if let Some(view) = self.cached_view(&canonical)? {
            return Ok(view);
        }

        let image_data = self
            .client
            .pull(&parsed, &self.auth, ACCEPTED_MEDIA_TYPES.to_vec())
            .await
            .map_err(|e| Error::RegistryUnavailable(e.to_string()))?;

        let mut layer_digests = Vec::with_capacity(image_data.layers.len());
        let mut layer_sizes = Vec::with_capacity(image_data.layers.len());
        for layer in &image_data.layers {
            layer_digests.push(self.layout.write_blob(&layer.data)?);
            layer_sizes.push(layer.data.len() as u64);
        }

        let config_digest = self.layout.write_blob(&image_data.config.data)?;
        let config_size = image_data.config.data.len() as u64;
        let manifest_bytes = build_manifest_json(&config_digest, config_size, &layer_digests, &layer_sizes);
        let manifest_digest = self.layout.write_blob(&manifest_bytes)?;

        self.layout.upsert_ref(
            &canonical,
            Descriptor {
                media_type: MANIFEST_MEDIA_TYPE.to_owned(),
                digest: manifest_digest.clone(),
                size: manifest_bytes.len() as u64,
                annotations: None,
            },
        )?;

        Ok(ImageView {
            reference: canonical,
            manifest_digest,
            layer_digests,
        })
    }

    /// Returns the stored view for `reference`, or [`Error::NotFound`].
    pub fn get(&self, reference: &str) -> Result<ImageView> {
        let canonical = parse_reference(reference)?.to_string();
        self.cached_view(&canonical)?
            .ok_or_else(|| Error::NotFound(canonical))
    }

    /// Returns every reference stored in the index.
    pub fn list(&self) -> Result<Vec<ImageView>> {
        self.layout
            .read_index()?
            .manifests
            .iter()
            .filter_map(|d| d.reference())
            .map(|r| self.cached_view(r))
            .filter_map(Result::transpose)
            .collect()
    }

    /// Removes `reference` from the index. The underlying blobs are left in
    /// place for a future garbage-collection pass.
    pub fn delete(&self, reference: &str) -> Result<()> {
        let canonical = parse_reference(reference)?.to_string();
        self.layout.remove_ref(&canonical)
    }

    /// `dest` is created if missing.
    pub async fn unpack(&self, reference: &str, dest: &Path) -> Result<()> {
        self.unpack_with(reference, dest, false).await
    }

    async fn unpack_with(&self, reference: &str, dest: &Path, privileged: bool) -> Result<()> {
        let view = self.get(reference)?;
        std::fs::create_dir_all(dest)?;

        let layer_paths = view
            .layer_digests
            .iter()
            .map(|d| self.layout.blob_path(d))
            .collect::<Result<Vec<_>>>()?;

        let dest = dest.to_path_buf();
        tokio::task::spawn_blocking(move || extract::unpack_layers(&layer_paths, &dest, privileged))
            .await
            .map_err(|e| Error::Internal(e.to_string()))?
    }

    /// Unpacks to a temp directory, sizes it
    /// with headroom, formats ext4, and populates it. Idempotent per `ref`:
    /// a base file already present for this ref is reused as-is.
    #[tracing::instrument(skip(self), fields(reference))]
    pub async fn create_base_image(&self, reference: &str) -> Result<PathBuf> {
        let canonical = parse_reference(reference)?.to_string();
        let guard = self.ref_locks.lock(&canonical).await;
        let _held = guard.lock().await;

        let dest = self.base_image_path(&canonical)?;
        if dest.is_file() {
            return Ok(dest);
        }

        let tmp = tempfile::TempDir::new()?;
        self.unpack_with(&canonical, tmp.path(), true).await?;

        let tmp_dest = dest.with_extension("tmp");
        base::build_ext4_image(tmp.path(), &tmp_dest).await?;
        std::fs::rename(&tmp_dest, &dest)?;
        Ok(dest)
    }

    fn base_image_path(&self, canonical: &str) -> Result<PathBuf> {
        self.layout.base_image_path(canonical)
    }

    /// Reads back the image's OCI config blob as an [`ImageConfig`].
    pub fn image_config(&self, reference: &str) -> Result<ImageConfig> {
        let canonical = parse_reference(reference)?.to_string();
        let descriptor = self
            .layout
            .find_by_ref(&canonical)?
            .ok_or_else(|| Error::NotFound(canonical))?;
        let manifest_bytes = std::fs::read(self.layout.blob_path(&descriptor.digest)?)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;
        let config_bytes = std::fs::read(self.layout.blob_path(&manifest.config.digest)?)?;
        let wrapper: ConfigWrapper = serde_json::from_slice(&config_bytes)?;
        Ok(wrapper.config.unwrap_or_default())
    }

    fn cached_view(&self, canonical: &str) -> Result<Option<ImageView>> {
        let Some(descriptor) = self.layout.find_by_ref(canonical)? else {
            return Ok(None);
        };
        let manifest_bytes = std::fs::read(self.layout.blob_path(&descriptor.digest)?)?;
        let manifest: Manifest = serde_json::from_slice(&manifest_bytes)?;
        Ok(Some(ImageView {
            reference: canonical.to_owned(),
            manifest_digest: descriptor.digest,
            layer_digests: manifest.layers.into_iter().map(|l| l.digest).collect(),
        }))
    }
}

/// Minimal manifest shape we write and read back; a strict subset of the OCI
/// Image Manifest schema (config + ordered layers).
#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct Manifest {
    #[serde(rename = "schemaVersion")]
    schema_version: u32,
    config: ManifestRef,
    layers: Vec<ManifestRef>,
}

#[derive(Debug, serde::Serialize, serde::Deserialize)]
struct ManifestRef {
    #[serde(rename = "mediaType")]
    media_type: String,
    digest: String,
    size: u64,
}

#[derive(Debug, serde::Deserialize)]
struct ConfigWrapper {
    config: Option<ImageConfig>,
}

fn build_manifest_json(
    config_digest: &str,
    config_size: u64,
    layer_digests: &[String],
    layer_sizes: &[u64],
) -> Vec<u8> {
    let manifest = Manifest {
        schema_version: 2,
        config: ManifestRef {
            media_type: "application/vnd.oci.image.config.v1+json".to_owned(),
            digest: config_digest.to_owned(),
            size: config_size,
        },
        layers: layer_digests
            .iter()
            .zip(layer_sizes)
            .map(|(d, size)| ManifestRef {
                media_type: "application/vnd.oci.image.layer.v1.tar+gzip".to_owned(),
                digest: d.clone(),
                size: *size,
            })
            .collect(),
    };
    serde_json::to_vec_pretty(&manifest).unwrap_or_default()
}

/// Parses an image string into an [`oci_client::Reference`], mapping parse
/// failures to [`Error::InvalidRef`].
fn parse_reference(image: &str) -> Result<oci_client::Reference> {
    image
        .parse()
        .map_err(|e: oci_client::ParseError| Error::InvalidRef(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_before_pull_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let oci = Oci::open_at(dir.path()).unwrap();
        let err = oci.get("library/alpine:latest").unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn invalid_reference_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let oci = Oci::open_at(dir.path()).unwrap();
        let err = oci.get("  ").unwrap_err();
        assert!(matches!(err, Error::InvalidRef(_)));
    }
}
