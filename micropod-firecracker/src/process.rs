//! Process supervision and API sequencing for one Firecracker VMM instance.

use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::time::timeout;

use crate::api::{ApiError, FirecrackerApiClient};
use crate::dto;

const SOCKET_WAIT_TIMEOUT: Duration = Duration::from_secs(10);
const GRACEFUL_STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors from process supervision / API sequencing.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to spawn firecracker: {0}")]
    Spawn(#[from] std::io::Error),

    #[error("firecracker binary not found (checked override and PATH)")]
    BinaryNotFound,

    #[error("timed out waiting for api socket to appear")]
    SocketTimeout,

    #[error("firecracker API error: {0}")]
    Api(#[from] ApiError),

    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

/// `Uninitialized → Configuring → Running → Stopping → Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Uninitialized,
    Configuring,
    Running,
    Stopping,
    Stopped,
}

/// Everything needed to launch and configure one Firecracker instance.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    pub kernel_image_path: String,
    pub boot_args_suffix: String,
    pub rootfs_path_on_host: String,
    pub rootfs_read_only: bool,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub network: Option<NetworkConfig>,
    pub vsock: Option<VsockConfig>,
    pub fs: Option<FsConfig>,
}

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub host_dev_name: String,
    pub guest_mac: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VsockConfig {
    pub guest_cid: u32,
    pub uds_path: String,
}

#[derive(Debug, Clone)]
pub struct FsConfig {
    pub tag: String,
    pub shared_dir: String,
}

const BOOT_ARGS_BASE: &str = "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw";

/// Resolves the Firecracker binary: an explicit override first, else a
/// `PATH` search.
pub fn resolve_binary(override_path: Option<&Path>) -> Result<PathBuf, Error> {
    if let Some(path) = override_path {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(Error::BinaryNotFound);
    }
    std::env::var_os("PATH")
        .and_then(|paths| {
            std::env::split_paths(&paths).find_map(|dir| {
                let candidate = dir.join("firecracker");
                candidate.is_file().then_some(candidate)
            })
        })
        .ok_or(Error::BinaryNotFound)
}

/// One supervised Firecracker process plus its bound API client.
#[derive(Debug)]
pub struct FirecrackerProcess {
    socket_path: PathBuf,
    child: Child,
    client: FirecrackerApiClient,
    state: State,
    detached: bool,
}

impl FirecrackerProcess {
    /// Spawns `binary`, removing any stale socket first, waits for the API
    /// socket to appear, then applies `config` and issues `InstanceStart`.
    ///
    /// On any failure the process is killed and the socket removed before
    /// the error is returned, so a caller never has to clean up a half-live
    /// process.
    pub async fn launch(
        binary: &Path,
        socket_path: &Path,
        config: &LaunchConfig,
        log_file: Option<&Path>,
    ) -> Result<Self, Error> {
        let _ = std::fs::remove_file(socket_path);

        let (stdout, stderr) = match log_file {
            Some(path) => {
                let out = std::fs::File::create(path)?;
                let err = out.try_clone()?;
                (Stdio::from(out), Stdio::from(err))
            }
            None => (Stdio::null(), Stdio::null()),
        };

        let mut command = Command::new(binary);
        command
            .arg("--api-sock")
            .arg(socket_path)
            .stdin(Stdio::inherit())
            .stdout(stdout)
            .stderr(stderr);
        // Its own process group, so controller-side signal handling never
        // accidentally reaches the VMM process.
        unsafe {
            command.pre_exec(|| {
                if libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        let child = command.spawn()?;

        if let Err(e) = wait_for_socket(socket_path).await {
            let mut child = child;
            let _ = child.start_kill();
            let _ = std::fs::remove_file(socket_path);
            return Err(e);
        }

        let client = FirecrackerApiClient::new(socket_path);
        let mut process =
            Self { socket_path: socket_path.to_path_buf(), child, client, state: State::Configuring, detached: false };

        if let Err(e) = process.apply_and_start(config).await {
            let _ = process.child.start_kill();
            let _ = std::fs::remove_file(socket_path);
            return Err(e);
        }

        process.state = State::Running;
        Ok(process)
    }

    async fn apply_and_start(&self, config: &LaunchConfig) -> Result<(), Error> {
        self.client
            .put_boot_source(&dto::BootSource {
                kernel_image_path: config.kernel_image_path.clone(),
                initrd_path: None,
                boot_args: format!("{BOOT_ARGS_BASE} {}", config.boot_args_suffix).trim().to_owned(),
            })
            .await?;

        self.client
            .put_drive(&dto::Drive {
                drive_id: "rootfs".to_owned(),
                path_on_host: config.rootfs_path_on_host.clone(),
                is_root_device: true,
                is_read_only: config.rootfs_read_only,
            })
            .await?;

        self.client
            .put_machine_config(&dto::MachineConfiguration {
                vcpu_count: config.vcpu_count,
                mem_size_mib: config.mem_size_mib,
                smt: false,
            })
            .await?;

        if let Some(net) = &config.network {
            self.client
                .put_network_interface(&dto::NetworkInterface {
                    iface_id: "eth0".to_owned(),
                    host_dev_name: net.host_dev_name.clone(),
                    guest_mac: net.guest_mac.clone(),
                })
                .await?;
        }

        if let Some(vsock) = &config.vsock {
            self.client
                .put_vsock(&dto::Vsock {
                    vsock_id: "vsock0".to_owned(),
                    guest_cid: vsock.guest_cid,
                    uds_path: vsock.uds_path.clone(),
                })
                .await?;
        }

        if let Some(fs) = &config.fs {
            self.client
                .put_fs(&dto::FsDevice {
                    fs_id: fs.tag.clone(),
                    tag: fs.tag.clone(),
                    shared_dir: fs.shared_dir.clone(),
                })
                .await?;
        }

        self.client
            .put_actions(&dto::InstanceActionInfo { action_type: dto::ActionType::InstanceStart })
            .await?;

        Ok(())
    }

    /// Current lifecycle state.
    pub fn state(&self) -> State {
        self.state
    }

    /// OS pid of the supervised process, if still spawned.
    pub fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    /// Signal-0 liveness probe.
    pub fn is_running(&self) -> bool {
        match self.pid() {
            Some(pid) => unsafe { libc::kill(pid as libc::pid_t, 0) == 0 },
            None => false,
        }
    }

    /// Graceful shutdown (`SendCtrlAltDel`), escalating to a force-kill after
    /// [`GRACEFUL_STOP_TIMEOUT`]. A no-op when already stopped.
    pub async fn stop(&mut self) -> Result<(), Error> {
        if self.state == State::Stopped {
            return Ok(());
        }
        self.state = State::Stopping;

        let _ = self
            .client
            .put_actions(&dto::InstanceActionInfo { action_type: dto::ActionType::SendCtrlAltDel })
            .await;

        if timeout(GRACEFUL_STOP_TIMEOUT, self.child.wait()).await.is_err() {
            let _ = self.child.start_kill();
            let _ = self.child.wait().await;
        }

        let _ = std::fs::remove_file(&self.socket_path);
        self.state = State::Stopped;
        Ok(())
    }

    /// Waits for the process to exit, without signaling it.
    pub async fn wait(&mut self) -> Result<(), Error> {
        self.child.wait().await?;
        self.state = State::Stopped;
        Ok(())
    }

    /// Disowns the child so dropping this handle does not kill the process.
    ///
    /// The controller calls this once a VM's record is durably committed:
    /// from that point the process is supervised by its pid in the registry,
    /// not by this in-memory handle.
    pub fn detach(mut self) {
        self.detached = true;
    }
}

impl Drop for FirecrackerProcess {
    fn drop(&mut self) {
        if !self.detached {
            let _ = self.child.start_kill();
        }
    }
}

async fn wait_for_socket(socket_path: &Path) -> Result<(), Error> {
    timeout(SOCKET_WAIT_TIMEOUT, async {
        loop {
            if tokio::net::UnixStream::connect(socket_path).await.is_ok() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .map_err(|_| Error::SocketTimeout)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_binary_rejects_missing_override() {
        let err = resolve_binary(Some(Path::new("/nonexistent/firecracker"))).unwrap_err();
        assert!(matches!(err, Error::BinaryNotFound));
    }

    #[test]
    fn resolve_binary_accepts_existing_override() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let resolved = resolve_binary(Some(file.path())).unwrap();
        assert_eq!(resolved, file.path());
    }

    #[test]
    fn boot_args_compose_base_plus_suffix() {
        let merged = format!("{BOOT_ARGS_BASE} ip=dhcp").trim().to_owned();
        assert!(merged.starts_with("console=ttyS0"));
        assert!(merged.ends_with("ip=dhcp"));
    }
}
