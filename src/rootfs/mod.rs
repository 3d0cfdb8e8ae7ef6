//! Rootfs provisioning.
//!
//! Produces the thing a VM boots from, under one of two strategies:
//!
//! - **VirtioFs**: the image is unpacked into a per-VM directory under the
//!   rootfs working area and shared into the guest via virtio-fs. The VM
//!   boots the agent-carrier image; the agent runs the container against
//!   the shared tree.
//! - **CowDevice**: a shared read-only ext4 base is stacked with a per-VM
//!   device-mapper snapshot; the VM boots the snapshot node directly.
//!
//! The artifacts form a tagged variant set with a common capability
//! surface: each yields a persistable [`RootfsHandle`] and knows how to
//! release itself. Base mappings are shared and reference-counted through
//! the registry; [`gc_unused_bases`] removes bases no live record
//! references.
//!
//! No in-process maps survive between calls: base existence is probed from
//! `/dev/mapper` and the live-snapshot set is rederived from the registry,
//! so a restarted host process recovers correctly.

pub mod cow;

use crate::error::{Error, Result};
use crate::image::ImageService;
use crate::state::{RootfsHandle, VmStore};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Which rootfs strategy the controller materializes per VM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RootfsStrategy {
    /// Flat unpacked tree shared via virtio-fs.
    #[default]
    VirtioFs,
    /// Device-mapper CoW snapshot over a shared ext4 base.
    CowDevice,
}

/// A materialized rootfs.
#[derive(Debug, Clone)]
pub enum RootfsArtifact {
    /// Layer-reduced tree, shared via virtio-fs under a fixed mount tag.
    FlatDir { path: PathBuf },
    /// Shared read-only ext4 file. Never owned by a single VM; removed only
    /// by image deletion.
    BaseImage { path: PathBuf },
    /// Per-VM writable snapshot node.
    CowSnapshot {
        dm_name: String,
        base_name: String,
        cow_backing_path: PathBuf,
        device_path: PathBuf,
    },
}

impl RootfsArtifact {
    /// The persistable handle recorded in the VM registry.
    ///
    /// Base images are shared and never belong to a record, so asking for
    /// their handle is an invariant violation.
    pub fn rootfs_handle(&self) -> Result<RootfsHandle> {
        match self {
            Self::FlatDir { path } => Ok(RootfsHandle::VirtioFsDir { path: path.clone() }),
            Self::CowSnapshot {
                dm_name,
                base_name,
                cow_backing_path,
                device_path,
            } => Ok(RootfsHandle::BlockDevice {
                device_path: device_path.clone(),
                dm_name: dm_name.clone(),
                base_name: base_name.clone(),
                cow_path: cow_backing_path.clone(),
            }),
            Self::BaseImage { path } => Err(Error::Internal(format!(
                "base image {} is shared, not a per-VM rootfs",
                path.display()
            ))),
        }
    }
}

/// Materializes and releases rootfs artifacts.
pub struct RootfsProvisioner {
    images: Arc<dyn ImageService>,
    work_dir: PathBuf,
    ref_locks: KeyedLocks,
    id_locks: KeyedLocks,
}

/// Per-key async mutexes, created on first use.
struct KeyedLocks(Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>);

impl KeyedLocks {
    fn new() -> Self {
        Self(Mutex::new(HashMap::new()))
    }

    fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.0.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }
}

impl RootfsProvisioner {
    /// Creates a provisioner working under `work_dir` (the rootfs working
    /// area from the config).
    pub fn new(images: Arc<dyn ImageService>, work_dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&work_dir)?;
        Ok(Self {
            images,
            work_dir,
            ref_locks: KeyedLocks::new(),
            id_locks: KeyedLocks::new(),
        })
    }

    fn flat_dir(&self, vm_id: &str) -> PathBuf {
        self.work_dir.join("flat").join(vm_id)
    }

    fn cow_path(&self, vm_id: &str) -> PathBuf {
        self.work_dir.join("cow").join(format!("{vm_id}.cow"))
    }

    /// Materializes a rootfs for a VM under the given strategy.
    ///
    /// Concurrent calls for the same VM id serialize; distinct ids proceed
    /// in parallel.
    pub async fn provision(
        &self,
        vm_id: &str,
        reference: &str,
        strategy: RootfsStrategy,
    ) -> Result<RootfsArtifact> {
        let id_lock = self.id_locks.get(vm_id);
        let _id_guard = id_lock.lock().await;

        match strategy {
            RootfsStrategy::VirtioFs => self.provision_flat(vm_id, reference).await,
            RootfsStrategy::CowDevice => self.provision_cow(vm_id, reference).await,
        }
    }

    async fn provision_flat(&self, vm_id: &str, reference: &str) -> Result<RootfsArtifact> {
        let dest = self.flat_dir(vm_id);
        fs::create_dir_all(&dest)?;

        if let Err(e) = self.images.unpack(reference, &dest).await {
            let _ = fs::remove_dir_all(&dest);
            return Err(e);
        }

        info!(vm_id, dest = %dest.display(), "flat rootfs ready");
        Ok(RootfsArtifact::FlatDir { path: dest })
    }

    async fn provision_cow(&self, vm_id: &str, reference: &str) -> Result<RootfsArtifact> {
        let base_image = self.images.create_base_image(reference).await?;

        // Base mapping creation for the same ref must not race itself; the
        // kernel-side device-mapper table is effectively single-writer.
        let lock = self.ref_locks.get(reference);
        let base = {
            let _guard = lock.lock().await;
            cow::create_base_device(reference, &base_image)?
        };

        let snapshot = cow::create_snapshot_device(vm_id, &base, &self.cow_path(vm_id))?;

        info!(vm_id, device = %snapshot.device_path.display(), "cow rootfs ready");
        Ok(RootfsArtifact::CowSnapshot {
            dm_name: snapshot.name,
            base_name: snapshot.base_name,
            cow_backing_path: snapshot.cow_path,
            device_path: snapshot.device_path,
        })
    }

}

/// Releases a per-VM artifact. Shared bases persist; use
/// [`gc_unused_bases`] to retire them.
pub fn release(artifact: &RootfsArtifact) -> Result<()> {
    match artifact {
        RootfsArtifact::FlatDir { path } => fs::remove_dir_all(path).map_err(|e| {
            Error::RootfsError(format!("failed to remove {}: {e}", path.display()))
        }),
        RootfsArtifact::CowSnapshot {
            dm_name,
            base_name,
            cow_backing_path,
            device_path,
        } => cow::remove_snapshot_device(&cow::SnapshotDevice {
            name: dm_name.clone(),
            base_name: base_name.clone(),
            cow_loop_device: snapshot_cow_loop(dm_name)?,
            cow_path: cow_backing_path.clone(),
            device_path: device_path.clone(),
        }),
        RootfsArtifact::BaseImage { .. } => Ok(()),
    }
}

/// Releases the rootfs recorded in a registry handle. Used by StopVM and
/// dead-VM reconciliation, where only the persisted handle survives.
pub fn release_handle(vm_id: &str, handle: &RootfsHandle) {
    match handle {
        RootfsHandle::VirtioFsDir { path } => {
            if let Err(e) = fs::remove_dir_all(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(vm_id, path = %path.display(), error = %e, "failed to remove rootfs dir");
                }
            }
        }
        RootfsHandle::BlockDevice {
            dm_name, cow_path, ..
        } => match snapshot_cow_loop(dm_name) {
            Ok(cow_loop) => {
                let snapshot = cow::SnapshotDevice {
                    name: dm_name.clone(),
                    base_name: String::new(),
                    cow_loop_device: cow_loop,
                    cow_path: cow_path.clone(),
                    device_path: cow::device_path(dm_name),
                };
                if let Err(e) = cow::remove_snapshot_device(&snapshot) {
                    warn!(vm_id, dm_name, error = %e, "failed to remove snapshot device");
                }
            }
            Err(_) => {
                // Mapping state is unknown; fall back to derived names.
                cow::remove_snapshot_by_name(vm_id, cow_path);
            }
        },
    }
}

/// Removes every base mapping with zero live snapshots referencing it.
///
/// The live set is rederived from the registry, not process memory.
pub fn gc_unused_bases(store: &VmStore) -> Result<usize> {
    let mut in_use: HashSet<String> = HashSet::new();
    for record in store.list()? {
        if let RootfsHandle::BlockDevice { base_name, .. } = record.rootfs_handle {
            in_use.insert(base_name);
        }
    }

    let mut removed = 0;
    for base in cow::list_devices(crate::constants::BASE_DEVICE_PREFIX)? {
        if in_use.contains(&base) {
            continue;
        }
        debug!(base, "removing unreferenced base device");
        match cow::remove_base_device(&base) {
            Ok(()) => removed += 1,
            Err(e) => warn!(base, error = %e, "failed to remove base device"),
        }
    }
    Ok(removed)
}

/// Reads the CoW loop device out of a live snapshot table, e.g.
/// `0 131072 snapshot 254:0 /dev/loop5 P 8` (field 4).
fn snapshot_cow_loop(dm_name: &str) -> Result<String> {
    let output = std::process::Command::new("dmsetup")
        .args(["table", dm_name])
        .output()
        .map_err(|e| Error::RootfsError(format!("failed to execute dmsetup: {e}")))?;
    if !output.status.success() {
        return Err(Error::RootfsError(format!(
            "dmsetup table {dm_name} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    String::from_utf8_lossy(&output.stdout)
        .split_whitespace()
        .nth(4)
        .map(str::to_string)
        .ok_or_else(|| Error::RootfsError(format!("unexpected snapshot table for {dm_name}")))
}
