//! Loop-device and device-mapper plumbing for copy-on-write rootfs.
//!
//! A shared read-only base is a `linear` target over a loop device backed
//! by the image's ext4 file; each VM stacks a `snapshot` target on it whose
//! CoW store is a second loop device over a per-VM sparse file:
//!
//! ```text
//! <ref>.ext4 ──losetup──▶ /dev/loopN ──linear──▶ /dev/mapper/micropod-base-<ref>
//!                                                        │ origin
//! <vm>.cow  ──losetup──▶ /dev/loopM ──snapshot──────────▶ /dev/mapper/micropod-vm-<vm>
//! ```
//!
//! Loop device lifetimes nest strictly inside the mapping lifetimes: every
//! failure path detaches what it attached, and removal detaches before
//! deleting the backing file.

use crate::constants::{BASE_DEVICE_PREFIX, COW_MIN_BYTES, SNAPSHOT_DEVICE_PREFIX};
use crate::error::{Error, Result};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// Shared read-only base mapping for one image reference.
#[derive(Debug, Clone)]
pub struct BaseDevice {
    /// Device-mapper target name.
    pub name: String,
    /// Loop device backing the linear target.
    pub loop_device: String,
    /// The ext4 file the loop device is attached to.
    pub image_path: PathBuf,
    /// Size of the ext4 file in bytes.
    pub size: u64,
}

/// Per-VM writable snapshot stacked on a base.
#[derive(Debug, Clone)]
pub struct SnapshotDevice {
    /// Device-mapper target name.
    pub name: String,
    /// Name of the base this snapshot originates from.
    pub base_name: String,
    /// Loop device backing the CoW store.
    pub cow_loop_device: String,
    /// The sparse CoW file.
    pub cow_path: PathBuf,
    /// The node handed to Firecracker as the root drive.
    pub device_path: PathBuf,
}

/// Device-mapper name for an image reference's base.
pub fn base_device_name(reference: &str) -> String {
    let name = reference.replace(['/', ':', '.'], "_");
    format!("{BASE_DEVICE_PREFIX}{name}")
}

/// Device-mapper name for a VM's snapshot.
pub fn snapshot_device_name(vm_id: &str) -> String {
    format!("{SNAPSHOT_DEVICE_PREFIX}{vm_id}")
}

/// Node path for a device-mapper name.
pub fn device_path(name: &str) -> PathBuf {
    PathBuf::from("/dev/mapper").join(name)
}

/// Creates the base mapping for an image, or adopts an existing one.
///
/// Adoption reads the live table for the loop device rather than trusting
/// any in-process state, so a restarted host process recovers correctly.
pub fn create_base_device(reference: &str, image_path: &Path) -> Result<BaseDevice> {
    let name = base_device_name(reference);
    let size = fs::metadata(image_path)
        .map_err(|e| Error::RootfsError(format!("failed to stat base image: {e}")))?
        .len();

    if device_path(&name).exists() {
        let loop_device = table_backing_device(&name)?;
        debug!(name, loop_device, "adopting existing base device");
        return Ok(BaseDevice {
            name,
            loop_device,
            image_path: image_path.to_path_buf(),
            size,
        });
    }

    let loop_device = attach_loop(image_path)?;
    let sectors = match device_sectors(&loop_device) {
        Ok(sectors) => sectors,
        Err(e) => {
            detach_loop(&loop_device);
            return Err(e);
        }
    };

    let table = format!("0 {sectors} linear {loop_device} 0");
    if let Err(e) = dmsetup_create(&name, &table, true) {
        detach_loop(&loop_device);
        return Err(e);
    }

    info!(name, loop_device, size, "created base device");
    Ok(BaseDevice {
        name,
        loop_device,
        image_path: image_path.to_path_buf(),
        size,
    })
}

/// Creates a per-VM snapshot over `base`, backed by a fresh sparse CoW file
/// at `cow_path` sized at a tenth of the base.
pub fn create_snapshot_device(
    vm_id: &str,
    base: &BaseDevice,
    cow_path: &Path,
) -> Result<SnapshotDevice> {
    let name = snapshot_device_name(vm_id);
    let cow_size = (base.size / 10).max(COW_MIN_BYTES);

    if let Some(parent) = cow_path.parent() {
        fs::create_dir_all(parent)
            .map_err(|e| Error::RootfsError(format!("failed to create cow directory: {e}")))?;
    }
    let file = fs::File::create(cow_path)
        .map_err(|e| Error::RootfsError(format!("failed to create cow file: {e}")))?;
    file.set_len(cow_size)
        .map_err(|e| Error::RootfsError(format!("failed to size cow file: {e}")))?;
    drop(file);

    let cow_loop = match attach_loop(cow_path) {
        Ok(device) => device,
        Err(e) => {
            let _ = fs::remove_file(cow_path);
            return Err(e);
        }
    };

    let base_path = device_path(&base.name);
    let result = device_sectors(&base_path.to_string_lossy()).and_then(|sectors| {
        let table = format!(
            "0 {sectors} snapshot {} {cow_loop} P 8",
            base_path.display()
        );
        dmsetup_create(&name, &table, false)
    });

    if let Err(e) = result {
        detach_loop(&cow_loop);
        let _ = fs::remove_file(cow_path);
        return Err(e);
    }

    info!(name, base = %base.name, cow = %cow_path.display(), "created snapshot device");
    Ok(SnapshotDevice {
        device_path: device_path(&name),
        name,
        base_name: base.name.clone(),
        cow_loop_device: cow_loop,
        cow_path: cow_path.to_path_buf(),
    })
}

/// Removes a snapshot mapping, its CoW loop device, and its backing file.
///
/// A CoW file that refuses to delete is cheap to orphan: the failure is
/// logged and teardown continues.
pub fn remove_snapshot_device(snapshot: &SnapshotDevice) -> Result<()> {
    remove_mapping(&snapshot.name)?;
    detach_loop(&snapshot.cow_loop_device);
    if let Err(e) = fs::remove_file(&snapshot.cow_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(cow = %snapshot.cow_path.display(), error = %e, "failed to remove cow file");
        }
    }
    Ok(())
}

/// Removes a snapshot by derived names alone, for records whose snapshot
/// was never observed by this process.
pub fn remove_snapshot_by_name(vm_id: &str, cow_path: &Path) {
    let name = snapshot_device_name(vm_id);
    debug!(name, "removing snapshot by derived name");
    if let Err(e) = remove_mapping(&name) {
        debug!(name, error = %e, "snapshot mapping removal failed (may not exist)");
    }
    if let Err(e) = fs::remove_file(cow_path) {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(cow = %cow_path.display(), error = %e, "failed to remove cow file");
        }
    }
}

/// Removes a base mapping and detaches its loop device.
pub fn remove_base_device(name: &str) -> Result<()> {
    let loop_device = table_backing_device(name)?;
    remove_mapping(name)?;
    detach_loop(&loop_device);
    info!(name, "removed base device");
    Ok(())
}

/// Removes a device-mapper mapping by name.
pub fn remove_mapping(name: &str) -> Result<()> {
    run(&["dmsetup", "remove", name])?;
    Ok(())
}

/// Lists device-mapper names carrying the given prefix.
pub fn list_devices(prefix: &str) -> Result<Vec<String>> {
    let output = run(&["dmsetup", "ls"])?;
    Ok(output
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .filter(|name| name.starts_with(prefix))
        .map(str::to_string)
        .collect())
}

/// Reads the backing device out of a mapping's table, e.g.
/// `0 131072 linear /dev/loop3 0` yields `/dev/loop3`.
fn table_backing_device(name: &str) -> Result<String> {
    let table = run(&["dmsetup", "table", name])?;
    table
        .split_whitespace()
        .nth(3)
        .map(str::to_string)
        .ok_or_else(|| Error::RootfsError(format!("unexpected table for {name}: {table}")))
}

fn attach_loop(path: &Path) -> Result<String> {
    let output = run(&["losetup", "--find", "--show", &path.to_string_lossy()])?;
    Ok(output.trim().to_string())
}

fn detach_loop(device: &str) {
    if let Err(e) = run(&["losetup", "-d", device]) {
        warn!(device, error = %e, "failed to detach loop device");
    }
}

/// Device size in 512-byte sectors.
fn device_sectors(device: &str) -> Result<u64> {
    let output = run(&["blockdev", "--getsz", device])?;
    output
        .trim()
        .parse()
        .map_err(|e| Error::RootfsError(format!("bad sector count for {device}: {e}")))
}

fn dmsetup_create(name: &str, table: &str, readonly: bool) -> Result<()> {
    let mut argv = vec!["dmsetup", "create", name];
    if readonly {
        argv.push("--readonly");
    }

    let mut child = Command::new(argv[0])
        .args(&argv[1..])
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| Error::RootfsError(format!("failed to execute dmsetup: {e}")))?;

    child
        .stdin
        .take()
        .ok_or_else(|| Error::RootfsError("dmsetup stdin unavailable".to_string()))?
        .write_all(table.as_bytes())
        .map_err(|e| Error::RootfsError(format!("failed to write dmsetup table: {e}")))?;

    let output = child
        .wait_with_output()
        .map_err(|e| Error::RootfsError(format!("dmsetup did not exit: {e}")))?;
    if !output.status.success() {
        return Err(Error::RootfsError(format!(
            "dmsetup create {name} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(())
}

fn run(argv: &[&str]) -> Result<String> {
    let output = Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|e| Error::RootfsError(format!("failed to execute {argv:?}: {e}")))?;
    if !output.status.success() {
        return Err(Error::RootfsError(format!(
            "{argv:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_names_are_deterministic() {
        assert_eq!(
            base_device_name("library/alpine:latest"),
            "micropod-base-library_alpine_latest"
        );
        assert_eq!(snapshot_device_name("vm-1"), "micropod-vm-vm-1");
        assert_eq!(
            device_path("micropod-vm-vm-1"),
            PathBuf::from("/dev/mapper/micropod-vm-vm-1")
        );
    }

    #[test]
    fn distinct_refs_get_distinct_bases() {
        assert_ne!(
            base_device_name("alpine:3.18"),
            base_device_name("alpine:3.19")
        );
    }
}
