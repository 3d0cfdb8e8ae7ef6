//! The VM controller.
//!
//! Drives the image store, rootfs provisioner, network provisioner, and
//! Firecracker driver in sequence for `run`, and unwinds them in reverse
//! for `stop` and dead-VM reconciliation.
//!
//! ## Failure compensation
//!
//! `run_vm` accumulates a rollback closure for every resource it acquires;
//! on any failure the list is drained in reverse order before the primary
//! error is returned, so a failed run leaves no tap devices, rootfs
//! artifacts, sockets, or processes behind. Rollback failures are logged
//! but never replace the primary cause. The registry record is committed
//! only after every resource is acquired and the agent has confirmed the
//! container, so a record implies a complete VM.
//!
//! ## Reconciliation
//!
//! `list_vms` probes each record's VMM pid; dead records are marked,
//! cleaned up best-effort, and removed before the list is returned, so the
//! registry converges on the truth even after crashes.

use crate::agent::{AgentClient, ContainerStatus, CreateContainerRequest};
use crate::config::Config;
use crate::constants::{
    API_SOCKET_POLL_INTERVAL, DEFAULT_VCPUS, DEFAULT_VM_MEMORY_MIB, GUEST_CID,
    GUEST_ROOTFS_PATH, LOG_POLL_INTERVAL, VIRTIOFS_MOUNT_TAG, VM_SHUTDOWN_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::firecracker::api::{Action, FirecrackerClient};
use crate::firecracker::{
    is_process_running, kill_process, LaunchConfig, VirtioFsSpec, VmmProcess, VsockSpec,
};
use crate::image::{ImageService, ImageStore};
use crate::network;
use crate::rootfs::{self, RootfsArtifact, RootfsProvisioner, RootfsStrategy};
use crate::state::{VmRecord, VmState, VmStore};
use chrono::Utc;
use std::fs;
use std::io::{BufRead, BufReader, Write};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

// =============================================================================
// Rollback
// =============================================================================

/// Reverse-order list of compensation closures accumulated during run_vm.
struct Rollback {
    steps: Vec<(&'static str, Box<dyn FnOnce() + Send>)>,
}

impl Rollback {
    fn new() -> Self {
        Self { steps: Vec::new() }
    }

    fn push(&mut self, name: &'static str, step: impl FnOnce() + Send + 'static) {
        self.steps.push((name, Box::new(step)));
    }

    /// Drains the list in reverse acquisition order.
    fn run(mut self) {
        while let Some((name, step)) = self.steps.pop() {
            debug!(step = name, "rolling back");
            step();
        }
    }
}

// =============================================================================
// Manager
// =============================================================================

/// Mints a fresh VM id.
///
/// Tap names, API sockets, and vsock sockets are all derived from the id's
/// first 8 hex characters (Linux caps interface names at 15 bytes), so the
/// id must be random from its leading bytes. A time-ordered id would share
/// that prefix across every launch in the same timestamp window.
pub fn mint_vm_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Orchestrates the full VM lifecycle.
pub struct Manager {
    config: Config,
    store: VmStore,
    images: Arc<dyn ImageService>,
    rootfs: RootfsProvisioner,
}

impl Manager {
    /// Creates a manager from the process-wide configuration.
    pub fn new() -> Result<Self> {
        Self::with_config(Config::resolve())
    }

    /// Creates a manager over an explicit configuration.
    pub fn with_config(config: Config) -> Result<Self> {
        config.ensure_root()?;
        let store = VmStore::new(config.registry_path());
        let images: Arc<dyn ImageService> = Arc::new(ImageStore::new(config.image_dir()?)?);
        let rootfs = RootfsProvisioner::new(images.clone(), config.rootfs_dir()?)?;
        Ok(Self {
            config,
            store,
            images,
            rootfs,
        })
    }

    /// Returns the VM registry.
    pub fn store(&self) -> &VmStore {
        &self.store
    }

    /// Returns the resolved configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    // =========================================================================
    // RunVM
    // =========================================================================

    /// Pulls the image, materializes a rootfs, boots a VM, and asks the
    /// guest agent to start the container. Returns the fresh VM id.
    pub async fn run_vm(&self, image_ref: &str, publish: &[String]) -> Result<String> {
        let vm_id = mint_vm_id();
        info!(vm_id, image = image_ref, "starting VM");

        let mut rollback = Rollback::new();

        // 1. Network.
        let net = network::setup(&vm_id, publish)?;
        {
            let net = net.clone();
            rollback.push("network", move || network::teardown(&net));
        }

        // 2. Image.
        if let Err(e) = self.images.pull(image_ref).await {
            rollback.run();
            return Err(e);
        }

        // 3. Rootfs.
        let strategy = self.config.rootfs_strategy;
        let artifact = match self.rootfs.provision(&vm_id, image_ref, strategy).await {
            Ok(artifact) => artifact,
            Err(e) => {
                rollback.run();
                return Err(e);
            }
        };
        let rootfs_handle = match artifact.rootfs_handle() {
            Ok(handle) => handle,
            Err(e) => {
                rollback.run();
                return Err(e);
            }
        };
        {
            let artifact_for_rollback = artifact.clone();
            rollback.push("rootfs", move || {
                if let Err(e) = rootfs::release(&artifact_for_rollback) {
                    warn!(error = %e, "rootfs rollback failed");
                }
            });
        }

        // 4. Launch.
        let launch = match self.build_launch_config(&vm_id, &net, &artifact, strategy) {
            Ok(launch) => launch,
            Err(e) => {
                rollback.run();
                return Err(e);
            }
        };
        let api_socket_path = launch.api_socket_path.clone();
        let vsock_uds_path = launch
            .vsock
            .as_ref()
            .map(|v| v.uds_path.clone())
            .unwrap_or_default();
        let log_path = launch.log_path.clone().unwrap_or_default();
        let kernel_path = launch.kernel_path.clone();

        let mut vmm = match VmmProcess::launch(launch).await {
            Ok(vmm) => vmm,
            Err(e) => {
                rollback.run();
                return Err(e);
            }
        };
        {
            let pid = vmm.pid();
            let api_socket = api_socket_path.clone();
            let vsock_uds = vsock_uds_path.clone();
            rollback.push("vm", move || {
                kill_process(pid);
                let _ = fs::remove_file(&api_socket);
                let _ = fs::remove_file(&vsock_uds);
            });
        }

        // 5. Dial the agent through guest boot.
        let agent = AgentClient::new(&vsock_uds_path);
        if let Err(e) = agent.wait_ready().await {
            rollback.run();
            return Err(e);
        }

        // 6. Start the container.
        let process_args = match self.default_process_args(image_ref).await {
            Ok(args) => args,
            Err(e) => {
                rollback.run();
                return Err(e);
            }
        };
        let guest_rootfs = match strategy {
            RootfsStrategy::VirtioFs => GUEST_ROOTFS_PATH.to_string(),
            RootfsStrategy::CowDevice => "/".to_string(),
        };

        debug!(vm_id, args = ?process_args, "sending CreateContainer to agent");
        let response = match agent
            .create_container(CreateContainerRequest {
                container_id: vm_id.clone(),
                process_args,
                rootfs_path: guest_rootfs,
            })
            .await
        {
            Ok(response) => response,
            Err(e) => {
                rollback.run();
                return Err(e);
            }
        };
        if response.status != ContainerStatus::Running {
            rollback.run();
            return Err(Error::ContainerStartFailed {
                message: response.error_message,
            });
        }

        // 7. Commit.
        let record = VmRecord {
            id: vm_id.clone(),
            image_ref: image_ref.to_string(),
            state: VmState::Running,
            firecracker_pid: vmm.pid(),
            api_socket_path,
            rootfs_handle,
            kernel_path,
            network: Some(net),
            vsock_uds_path,
            log_path,
            agent_connected: true,
            created_at: Utc::now(),
        };
        if let Err(e) = self.store.add(record) {
            let _ = vmm.stop().await;
            rollback.run();
            return Err(e);
        }

        info!(vm_id, pid = vmm.pid(), "VM running");
        Ok(vm_id)
    }

    fn build_launch_config(
        &self,
        vm_id: &str,
        net: &network::NetworkConfig,
        artifact: &RootfsArtifact,
        strategy: RootfsStrategy,
    ) -> Result<LaunchConfig> {
        let kernel_path = self.config.kernel_path();
        if !kernel_path.exists() {
            return Err(Error::LaunchError(format!(
                "kernel not found at {}",
                kernel_path.display()
            )));
        }

        let (rootfs_path, virtio_fs) = match (strategy, artifact) {
            (RootfsStrategy::VirtioFs, RootfsArtifact::FlatDir { path }) => {
                let agent_rootfs = self.config.agent_rootfs_path();
                if !agent_rootfs.exists() {
                    return Err(Error::LaunchError(format!(
                        "agent rootfs not found at {}",
                        agent_rootfs.display()
                    )));
                }
                (
                    agent_rootfs,
                    Some(VirtioFsSpec {
                        tag: VIRTIOFS_MOUNT_TAG.to_string(),
                        shared_dir: path.clone(),
                    }),
                )
            }
            (RootfsStrategy::CowDevice, RootfsArtifact::CowSnapshot { device_path, .. }) => {
                (device_path.clone(), None)
            }
            _ => {
                return Err(Error::Internal(format!(
                    "rootfs artifact does not match strategy {strategy:?}"
                )))
            }
        };

        let vsock_uds_path = self.config.vsock_uds_path(vm_id);
        // Firecracker refuses to bind over a stale socket.
        match fs::remove_file(&vsock_uds_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::LaunchError(format!("stale vsock socket: {e}"))),
        }

        Ok(LaunchConfig {
            kernel_path,
            rootfs_path,
            vcpus: DEFAULT_VCPUS,
            memory_mib: DEFAULT_VM_MEMORY_MIB,
            boot_args_suffix: net.ip_boot_arg(),
            network: Some(net.clone()),
            vsock: Some(VsockSpec {
                guest_cid: GUEST_CID,
                uds_path: vsock_uds_path,
            }),
            virtio_fs,
            api_socket_path: self.config.api_socket_path(vm_id),
            log_path: Some(self.config.log_path(vm_id)?),
        })
    }

    /// Default process args from the image config: entrypoint ++ cmd, with
    /// a shell fallback when the image defines neither.
    async fn default_process_args(&self, image_ref: &str) -> Result<Vec<String>> {
        let config = self.images.config(image_ref).await?;
        let args = config.process_args();
        if args.is_empty() {
            Ok(vec!["/bin/sh".to_string()])
        } else {
            Ok(args)
        }
    }

    // =========================================================================
    // ListVMs
    // =========================================================================

    /// Returns live records. Records whose VMM is gone are reconciled
    /// (resources released, record removed) before returning.
    pub async fn list_vms(&self) -> Result<Vec<VmRecord>> {
        let mut live = Vec::new();
        for record in self.store.list()? {
            if is_process_running(record.firecracker_pid) {
                live.push(record);
            } else {
                self.reconcile_dead(record);
            }
        }
        Ok(live)
    }

    /// Cleanup failures here are logged and swallowed: the registry must
    /// always make progress toward consistency.
    fn reconcile_dead(&self, record: VmRecord) {
        info!(vm_id = %record.id, "reconciling dead VM");
        if let Err(e) = self.store.update_state(&record.id, VmState::Dead) {
            debug!(vm_id = %record.id, error = %e, "could not mark record dead");
        }
        self.release_record_resources(&record);
        if let Err(e) = self.store.remove(&record.id) {
            warn!(vm_id = %record.id, error = %e, "failed to remove dead record");
        }
    }

    // =========================================================================
    // StopVM
    // =========================================================================

    /// Stops a VM and removes its record. Individual cleanup failures are
    /// recorded but do not abort subsequent steps.
    pub async fn stop_vm(&self, vm_id: &str) -> Result<()> {
        let record = self.store.get_by_id(vm_id)?;
        info!(vm_id, "stopping VM");

        if let Err(e) = self.store.update_state(vm_id, VmState::Stopping) {
            debug!(vm_id, error = %e, "could not mark record stopping");
        }

        if record.api_socket_path.exists() {
            self.graceful_shutdown(&record).await;
        } else if is_process_running(record.firecracker_pid) {
            kill_process(record.firecracker_pid);
        }

        self.release_record_resources(&record);
        self.store.remove(vm_id)?;

        info!(vm_id, "VM stopped and cleaned up");
        Ok(())
    }

    /// Ctrl-Alt-Del through the API, then a bounded wait, then SIGKILL.
    async fn graceful_shutdown(&self, record: &VmRecord) {
        let client = FirecrackerClient::new(&record.api_socket_path);
        if let Err(e) = client.put("/actions", &Action::send_ctrl_alt_del()).await {
            debug!(vm_id = %record.id, error = %e, "graceful shutdown request failed");
        }

        let deadline = Instant::now() + VM_SHUTDOWN_TIMEOUT;
        while is_process_running(record.firecracker_pid) && Instant::now() < deadline {
            tokio::time::sleep(API_SOCKET_POLL_INTERVAL).await;
        }
        if is_process_running(record.firecracker_pid) {
            warn!(vm_id = %record.id, pid = record.firecracker_pid, "force-killing VM");
            kill_process(record.firecracker_pid);
        }
    }

    /// Releases everything a record owns: network, rootfs, sockets.
    fn release_record_resources(&self, record: &VmRecord) {
        if let Some(net) = &record.network {
            network::teardown(net);
        }
        rootfs::release_handle(&record.id, &record.rootfs_handle);

        for socket in [&record.vsock_uds_path, &record.api_socket_path] {
            if let Err(e) = fs::remove_file(socket) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(vm_id = %record.id, socket = %socket.display(), error = %e, "failed to remove socket");
                }
            }
        }
    }

    // =========================================================================
    // Logs
    // =========================================================================

    /// Streams a VM's log file in follow mode: read to EOF, then poll for
    /// growth. Returns when the VM's record disappears.
    pub fn follow_logs(&self, vm_id: &str, writer: &mut impl Write) -> Result<()> {
        let record = self.store.get_by_id(vm_id)?;
        let file = fs::File::open(&record.log_path)?;
        let mut reader = BufReader::new(file);

        loop {
            let mut line = String::new();
            if reader.read_line(&mut line)? > 0 {
                writer.write_all(line.as_bytes())?;
                writer.flush()?;
                continue;
            }
            // At EOF: stop once the VM is gone, otherwise wait for growth.
            if self.store.get_by_id(vm_id).is_err() {
                return Ok(());
            }
            std::thread::sleep(LOG_POLL_INTERVAL);
        }
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Removes base device-mapper mappings no live record references.
    pub fn gc_unused_bases(&self) -> Result<usize> {
        rootfs::gc_unused_bases(&self.store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn manager(temp: &TempDir) -> Manager {
        Manager::with_config(Config::with_root(temp.path().join("micropod"))).unwrap()
    }

    #[test]
    fn missing_kernel_is_a_launch_error() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);

        let net = network::NetworkConfig::allocate("vm-1", &[]).unwrap();
        let artifact = RootfsArtifact::FlatDir {
            path: temp.path().join("flat/vm-1"),
        };
        let result =
            mgr.build_launch_config("vm-1", &net, &artifact, RootfsStrategy::VirtioFs);
        match result {
            Err(Error::LaunchError(msg)) => assert!(msg.contains("kernel")),
            other => panic!("expected LaunchError, got {other:?}"),
        }
        assert!(mgr.store().list().unwrap().is_empty());
    }

    #[tokio::test]
    async fn stop_vm_on_unknown_id_is_not_found() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        assert!(matches!(
            mgr.stop_vm("no-such-vm").await,
            Err(Error::VmNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn invalid_publish_spec_fails_fast() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);
        let result = mgr.run_vm("alpine:latest", &["8080".to_string()]).await;
        assert!(matches!(result, Err(Error::InvalidPortMapping(_))));
        assert!(mgr.store().list().unwrap().is_empty());
    }

    #[test]
    fn per_vm_paths_are_pairwise_distinct_for_minted_ids() {
        let temp = TempDir::new().unwrap();
        let mgr = manager(&temp);

        // Back-to-back ids from the real minter: the derived socket paths
        // truncate to the first 8 characters, so this catches any id scheme
        // whose leading bytes repeat across a burst of launches.
        let ids: Vec<String> = (0..64).map(|_| mint_vm_id()).collect();

        let mut sockets: Vec<PathBuf> = Vec::new();
        for id in &ids {
            sockets.push(mgr.config().api_socket_path(id));
            sockets.push(mgr.config().vsock_uds_path(id));
        }
        let unique: std::collections::HashSet<_> = sockets.iter().collect();
        assert_eq!(unique.len(), sockets.len());
    }
}
