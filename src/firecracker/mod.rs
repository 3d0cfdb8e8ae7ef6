//! Firecracker driver: one process per VM.
//!
//! Two responsibilities, composed by [`VmmProcess::launch`]:
//!
//! - **Process supervision**: resolve the binary, spawn it in its own
//!   process group with the console redirected to the VM's log file, reap
//!   the child in a background waiter, probe liveness, stop gracefully
//!   with a force-kill fallback.
//! - **API sequencing**: wait for the control socket, then PUT boot
//!   source, root drive, machine config, network interface, vsock, and
//!   virtio-fs resources in order before `InstanceStart`. Any non-2xx
//!   aborts the launch: the process is killed and the socket removed.
//!
//! ```text
//! Uninitialized ──spawn──▶ Configuring ──InstanceStart──▶ Running
//!                               │                            │ stop()
//!                               ▼ (API failure: kill)        ▼
//!                            Stopped ◀──────────────── Stopping
//! ```

pub mod api;

use crate::constants::{
    API_SOCKET_POLL_INTERVAL, API_SOCKET_TIMEOUT, BASE_BOOT_ARGS, VM_SHUTDOWN_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::network::NetworkConfig;
use api::{Action, BootSource, Drive, FirecrackerClient, FsDevice, MachineConfig, NetworkInterface, Vsock};
use std::fs;
use std::os::unix::process::CommandExt;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Vsock device configuration for a launch.
#[derive(Debug, Clone)]
pub struct VsockSpec {
    pub guest_cid: u32,
    pub uds_path: PathBuf,
}

/// Virtio-fs device configuration for a launch.
#[derive(Debug, Clone)]
pub struct VirtioFsSpec {
    pub tag: String,
    pub shared_dir: PathBuf,
}

/// Everything needed to boot one VM.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Guest kernel image.
    pub kernel_path: PathBuf,
    /// Root block device (`path_on_host` of the rootfs drive).
    pub rootfs_path: PathBuf,
    /// vCPU count.
    pub vcpus: i64,
    /// Memory in MiB.
    pub memory_mib: i64,
    /// Appended to the fixed base boot args (e.g. the static-IP directive).
    pub boot_args_suffix: String,
    /// Optional tap-backed network interface.
    pub network: Option<NetworkConfig>,
    /// Optional vsock device for agent communication.
    pub vsock: Option<VsockSpec>,
    /// Optional virtio-fs share.
    pub virtio_fs: Option<VirtioFsSpec>,
    /// Control socket path.
    pub api_socket_path: PathBuf,
    /// Receives VMM stdout/stderr and the guest console.
    pub log_path: Option<PathBuf>,
}

/// Driver lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmmState {
    Uninitialized,
    Configuring,
    Running,
    Stopping,
    Stopped,
}

/// A supervised Firecracker process and its API client.
pub struct VmmProcess {
    pid: i32,
    state: VmmState,
    client: FirecrackerClient,
    api_socket_path: PathBuf,
}

impl VmmProcess {
    /// Spawns and fully configures a VM, returning the running driver.
    ///
    /// On any configuration failure the spawned process is killed and the
    /// socket removed before the error is returned.
    pub async fn launch(config: LaunchConfig) -> Result<Self> {
        let mut vmm = Self::spawn(&config)?;
        if let Err(e) = vmm.configure(&config).await {
            warn!(error = %e, "launch failed, killing Firecracker process");
            vmm.force_kill();
            return Err(e);
        }
        vmm.state = VmmState::Running;
        info!(pid = vmm.pid, socket = %vmm.api_socket_path.display(), "VM started");
        Ok(vmm)
    }

    /// Spawns the Firecracker process without configuring it.
    fn spawn(config: &LaunchConfig) -> Result<Self> {
        resolve_binary()?;

        // A stale socket from a previous run would wedge the API server.
        match fs::remove_file(&config.api_socket_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::LaunchError(format!(
                    "failed to remove stale socket {}: {e}",
                    config.api_socket_path.display()
                )))
            }
        }

        let mut command = Command::new("firecracker");
        command
            .arg("--api-sock")
            .arg(&config.api_socket_path)
            .stdin(Stdio::inherit());
        command.process_group(0);

        if let Some(log_path) = &config.log_path {
            let log = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(log_path)
                .map_err(|e| {
                    Error::LaunchError(format!(
                        "failed to open log file {}: {e}",
                        log_path.display()
                    ))
                })?;
            let log_err = log.try_clone().map_err(|e| {
                Error::LaunchError(format!("failed to clone log handle: {e}"))
            })?;
            command.stdout(log).stderr(log_err);
        }

        let mut child = command
            .spawn()
            .map_err(|e| Error::LaunchError(format!("failed to start firecracker: {e}")))?;
        let pid = child.id() as i32;

        debug!(pid, socket = %config.api_socket_path.display(), "spawned firecracker");

        // Reap the child in the background so it never lingers as a zombie.
        std::thread::spawn(move || {
            let _ = child.wait();
        });

        Ok(Self {
            pid,
            state: VmmState::Configuring,
            client: FirecrackerClient::new(&config.api_socket_path),
            api_socket_path: config.api_socket_path.clone(),
        })
    }

    /// Issues the configuration sequence and starts the instance.
    async fn configure(&mut self, config: &LaunchConfig) -> Result<()> {
        self.wait_for_socket().await?;

        let boot_args = if config.boot_args_suffix.is_empty() {
            BASE_BOOT_ARGS.to_string()
        } else {
            format!("{BASE_BOOT_ARGS} {}", config.boot_args_suffix)
        };
        self.client
            .put(
                "/boot-source",
                &BootSource {
                    kernel_image_path: config.kernel_path.to_string_lossy().into_owned(),
                    boot_args,
                },
            )
            .await?;

        self.client
            .put(
                "/drives/rootfs",
                &Drive {
                    drive_id: "rootfs".to_string(),
                    path_on_host: config.rootfs_path.to_string_lossy().into_owned(),
                    is_root_device: true,
                    is_read_only: false,
                },
            )
            .await?;

        self.client
            .put(
                "/machine-config",
                &MachineConfig {
                    vcpu_count: config.vcpus,
                    mem_size_mib: config.memory_mib,
                    smt: false,
                },
            )
            .await?;

        if let Some(network) = &config.network {
            self.client
                .put(
                    "/network-interfaces/eth0",
                    &NetworkInterface {
                        iface_id: "eth0".to_string(),
                        host_dev_name: network.tap_device.clone(),
                        guest_mac: network.guest_mac.clone(),
                    },
                )
                .await?;
        }

        if let Some(vsock) = &config.vsock {
            self.client
                .put(
                    "/vsock",
                    &Vsock {
                        guest_cid: vsock.guest_cid,
                        uds_path: vsock.uds_path.to_string_lossy().into_owned(),
                    },
                )
                .await?;
        }

        if let Some(virtio_fs) = &config.virtio_fs {
            self.client
                .put(
                    &format!("/fs/{}", virtio_fs.tag),
                    &FsDevice {
                        tag: virtio_fs.tag.clone(),
                        shared_dir: virtio_fs.shared_dir.to_string_lossy().into_owned(),
                    },
                )
                .await?;
        }

        self.client.put("/actions", &Action::instance_start()).await
    }

    /// Waits (bounded) for the API socket to appear.
    async fn wait_for_socket(&self) -> Result<()> {
        let deadline = Instant::now() + API_SOCKET_TIMEOUT;
        while Instant::now() < deadline {
            if self.api_socket_path.exists() {
                return Ok(());
            }
            tokio::time::sleep(API_SOCKET_POLL_INTERVAL).await;
        }
        Err(Error::SocketTimeout {
            path: self.api_socket_path.clone(),
            duration: API_SOCKET_TIMEOUT,
        })
    }

    /// Returns the VMM process id.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Returns the driver state.
    pub fn state(&self) -> VmmState {
        self.state
    }

    /// Probes whether the VMM process is alive.
    pub fn is_running(&self) -> bool {
        is_process_running(self.pid)
    }

    /// Stops the VM: graceful shutdown first, force-kill after the bounded
    /// timeout. A no-op once stopped.
    pub async fn stop(&mut self) -> Result<()> {
        if self.state == VmmState::Stopped {
            return Ok(());
        }
        self.state = VmmState::Stopping;

        if self.is_running() {
            // Graceful first. The guest may be past listening, so a failed
            // request just moves us to the kill path.
            if let Err(e) = self.client.put("/actions", &Action::send_ctrl_alt_del()).await {
                debug!(pid = self.pid, error = %e, "graceful shutdown request failed");
            }

            let deadline = Instant::now() + VM_SHUTDOWN_TIMEOUT;
            while self.is_running() && Instant::now() < deadline {
                tokio::time::sleep(API_SOCKET_POLL_INTERVAL).await;
            }

            if self.is_running() {
                warn!(pid = self.pid, "graceful shutdown timed out, force-killing");
                kill_process(self.pid);
            }
        }

        self.remove_socket();
        self.state = VmmState::Stopped;
        info!(pid = self.pid, "VM stopped");
        Ok(())
    }

    /// Waits for the VMM process to exit.
    pub async fn wait(&self) {
        while self.is_running() {
            tokio::time::sleep(API_SOCKET_POLL_INTERVAL).await;
        }
    }

    fn force_kill(&mut self) {
        kill_process(self.pid);
        self.remove_socket();
        self.state = VmmState::Stopped;
    }

    fn remove_socket(&self) {
        if let Err(e) = fs::remove_file(&self.api_socket_path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(socket = %self.api_socket_path.display(), error = %e, "failed to remove socket");
            }
        }
    }
}

/// Verifies the Firecracker binary is reachable on PATH.
fn resolve_binary() -> Result<()> {
    let status = Command::new("firecracker")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::LaunchError(format!(
            "firecracker --version exited with {status}"
        ))),
        Err(e) => Err(Error::LaunchError(format!(
            "firecracker binary not available in PATH: {e}"
        ))),
    }
}

/// Signal-0 probe for process liveness.
pub fn is_process_running(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    // SAFETY: signal 0 performs permission and existence checks only.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Sends SIGKILL, ignoring already-dead processes.
pub fn kill_process(pid: i32) {
    if pid <= 0 {
        return;
    }
    // SAFETY: killing a pid we spawned (or recorded) with SIGKILL.
    let ret = unsafe { libc::kill(pid, libc::SIGKILL) };
    if ret != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() != Some(libc::ESRCH) {
            warn!(pid, error = %err, "failed to kill process");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_zero_is_never_running() {
        assert!(!is_process_running(0));
        assert!(!is_process_running(-1));
    }

    #[test]
    fn own_process_is_running() {
        let pid = std::process::id() as i32;
        assert!(is_process_running(pid));
    }

    #[test]
    fn boot_args_keep_the_fixed_base() {
        // The base string is load-bearing for the guest: serial console,
        // no PCI probing, and the root block device name.
        assert!(BASE_BOOT_ARGS.contains("console=ttyS0"));
        assert!(BASE_BOOT_ARGS.contains("root=/dev/vda"));
        assert!(BASE_BOOT_ARGS.contains("pci=off"));
    }
}
