//! Durable path resolution.
//!
//! A process-wide [`Config`] is resolved once at startup. The root directory
//! comes from the `MICROPOD_CONFIG_DIR` environment variable, falling back
//! to the user's config directory joined with the product segment
//! (`~/.config/micropod` on Linux). Everything the orchestrator persists
//! lives underneath it:
//!
//! ```text
//! <root>/
//! ├── vmlinux/vmlinux.elf   guest kernel (provided by the operator)
//! ├── agent-rootfs.ext4     agent-carrier rootfs (provided by the operator)
//! ├── vms.json              VM registry
//! ├── images/               OCI image store
//! ├── rootfs/               rootfs working area (flat trees, bases, CoW files)
//! └── logs/                 per-VM console logs
//! ```

use crate::constants::{CONFIG_DIR_ENV, CONFIG_DIR_NAME, ROOTFS_STRATEGY_ENV};
use crate::error::Result;
use crate::rootfs::RootfsStrategy;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Resolved durable directories plus the per-process strategy choice.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root configuration directory.
    config_dir: PathBuf,
    /// Which rootfs strategy RunVM uses.
    pub rootfs_strategy: RootfsStrategy,
}

impl Config {
    /// Resolves the config root from the environment or the user's config
    /// directory. Does not create anything; directories are created on
    /// demand by the accessors that need them.
    pub fn resolve() -> Self {
        let config_dir = match std::env::var_os(CONFIG_DIR_ENV) {
            Some(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(CONFIG_DIR_NAME),
        };
        let rootfs_strategy = match std::env::var(ROOTFS_STRATEGY_ENV).ok().as_deref() {
            Some("cow") => RootfsStrategy::CowDevice,
            Some("virtiofs") | None => RootfsStrategy::default(),
            Some(other) => {
                warn!(value = other, "unknown rootfs strategy, using virtiofs");
                RootfsStrategy::default()
            }
        };
        debug!(config_dir = %config_dir.display(), ?rootfs_strategy, "resolved config root");
        Self {
            config_dir,
            rootfs_strategy,
        }
    }

    /// Creates a config rooted at an explicit directory.
    pub fn with_root(config_dir: PathBuf) -> Self {
        Self {
            config_dir,
            rootfs_strategy: RootfsStrategy::default(),
        }
    }

    /// Returns the config root directory.
    pub fn root(&self) -> &Path {
        &self.config_dir
    }

    /// Ensures the config root exists.
    pub fn ensure_root(&self) -> Result<()> {
        fs::create_dir_all(&self.config_dir)?;
        Ok(())
    }

    /// Path of the guest kernel image. Never auto-created.
    pub fn kernel_path(&self) -> PathBuf {
        self.config_dir.join("vmlinux").join("vmlinux.elf")
    }

    /// Path of the agent-carrier rootfs image. Never auto-created.
    pub fn agent_rootfs_path(&self) -> PathBuf {
        self.config_dir.join("agent-rootfs.ext4")
    }

    /// Path of the VM registry file. Created lazily on first write by the
    /// registry itself.
    pub fn registry_path(&self) -> PathBuf {
        self.config_dir.join("vms.json")
    }

    /// Rootfs working area, created on demand.
    pub fn rootfs_dir(&self) -> Result<PathBuf> {
        self.ensure_subdir("rootfs")
    }

    /// Image store directory, created on demand.
    pub fn image_dir(&self) -> Result<PathBuf> {
        self.ensure_subdir("images")
    }

    /// Logs directory, created on demand.
    pub fn logs_dir(&self) -> Result<PathBuf> {
        self.ensure_subdir("logs")
    }

    /// Per-VM console log path. The file is created empty if absent so the
    /// Firecracker process can append to it from the first write.
    pub fn log_path(&self, vm_id: &str) -> Result<PathBuf> {
        let path = self.logs_dir()?.join(format!("{vm_id}.log"));
        if !path.exists() {
            fs::File::create(&path)?;
        }
        Ok(path)
    }

    /// Firecracker API socket path for a VM, deterministic from the id.
    pub fn api_socket_path(&self, vm_id: &str) -> PathBuf {
        let short = &vm_id[..vm_id.len().min(8)];
        PathBuf::from("/tmp").join(format!("firecracker-{short}.sock"))
    }

    /// Host-side vsock Unix socket path for a VM, deterministic from the id.
    pub fn vsock_uds_path(&self, vm_id: &str) -> PathBuf {
        PathBuf::from("/tmp").join(format!("micropod-vsock-{vm_id}"))
    }

    fn ensure_subdir(&self, name: &str) -> Result<PathBuf> {
        let dir = self.config_dir.join(name);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}
