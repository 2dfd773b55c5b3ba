//! Process-wide configuration: durable directories and the handful of
//! environment overrides the rest of the core reads through this value
//! rather than `std::env` directly.

use std::path::{Path, PathBuf};

const HOME_VAR: &str = "MICROPOD_HOME";
const FIRECRACKER_BIN_VAR: &str = "MICROPOD_FIRECRACKER_BIN";
const LOG_VAR: &str = "MICROPOD_LOG";
const PRODUCT_DIR: &str = "micropod";

/// Resolved, immutable configuration threaded through the controller and its
/// collaborators. Construct once at process start via [`Config::resolve`];
/// tests build one directly against a [`tempfile::TempDir`] via [`Config::at`].
#[derive(Debug, Clone)]
pub struct Config {
    home: PathBuf,
    firecracker_bin: Option<PathBuf>,
    log_filter: String,
}

impl Config {
    /// Resolves configuration from the environment.
    ///
    /// `MICROPOD_HOME` overrides the root directory; the default is the
    /// platform data/config directory joined with `micropod`.
    pub fn resolve() -> Self {
        let home = std::env::var_os(HOME_VAR).map_or_else(default_home, PathBuf::from);
        let firecracker_bin = std::env::var_os(FIRECRACKER_BIN_VAR).map(PathBuf::from);
        let log_filter = std::env::var(LOG_VAR).unwrap_or_else(|_| "info".to_owned());
        Self { home, firecracker_bin, log_filter }
    }

    /// Builds a config rooted at an explicit directory, bypassing the
    /// environment entirely. Used by tests against a [`tempfile::TempDir`].
    pub fn at(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into(), firecracker_bin: None, log_filter: "info".to_owned() }
    }

    /// The root configuration directory.
    pub fn home(&self) -> &Path {
        &self.home
    }

    /// Explicit Firecracker binary override, if set.
    pub fn firecracker_bin(&self) -> Option<&Path> {
        self.firecracker_bin.as_deref()
    }

    /// The `MICROPOD_LOG` filter string (e.g. for `tracing_subscriber::EnvFilter`).
    pub fn log_filter(&self) -> &str {
        &self.log_filter
    }

    /// Guest kernel image path.
    pub fn kernel_path(&self) -> PathBuf {
        self.home.join("kernel").join("vmlinux")
    }

    /// VM registry file path. Created lazily on first write.
    pub fn registry_path(&self) -> PathBuf {
        self.home.join("registry.json")
    }

    /// Rootfs working area (per-VM directories and CoW files).
    pub fn rootfs_dir(&self) -> PathBuf {
        self.home.join("rootfs")
    }

    /// Image store root, an OCI image layout.
    pub fn images_dir(&self) -> PathBuf {
        self.home.join("images")
    }

    /// Logs directory (VMM stdout/stderr, guest console).
    pub fn logs_dir(&self) -> PathBuf {
        self.home.join("logs")
    }

    /// Directory holding per-VM Firecracker API sockets and vsock UDS paths.
    pub fn sockets_dir(&self) -> PathBuf {
        self.home.join("sockets")
    }

    /// The fixed, minimal boot rootfs used for the `flat_dir` strategy: a
    /// small read-only image carrying the guest agent, with the container's
    /// own unpacked tree shared in separately over virtio-fs. The `cow`
    /// strategy boots its snapshot device directly and never touches this.
    pub fn agent_carrier_rootfs_path(&self) -> PathBuf {
        self.home.join("kernel").join("rootfs.ext4")
    }
}

fn default_home() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::config_dir)
        .unwrap_or_else(std::env::temp_dir)
        .join(PRODUCT_DIR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_paths_nest_under_home() {
        let cfg = Config::at("/srv/micropod");
        assert_eq!(cfg.kernel_path(), Path::new("/srv/micropod/kernel/vmlinux"));
        assert_eq!(cfg.registry_path(), Path::new("/srv/micropod/registry.json"));
        assert_eq!(cfg.rootfs_dir(), Path::new("/srv/micropod/rootfs"));
        assert_eq!(cfg.images_dir(), Path::new("/srv/micropod/images"));
        assert_eq!(cfg.logs_dir(), Path::new("/srv/micropod/logs"));
    }

    #[test]
    fn log_filter_defaults_to_info() {
        let cfg = Config::at("/tmp/x");
        assert_eq!(cfg.log_filter(), "info");
    }
}
