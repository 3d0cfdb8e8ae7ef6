//! Base ext4 image creation.
//!
//! Turns an unpacked filesystem tree into a formatted ext4 file that
//! device-mapper can stack snapshots on. The file is sized from the tree
//! with 20% headroom and a 64 MiB floor, created sparse, formatted, and
//! populated with ownership and modes preserved.
//!
//! Formatting and population shell out to `mkfs.ext4`, `mount`, and `cp`;
//! the caller must be privileged.

use crate::constants::BASE_IMAGE_MIN_MIB;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use tracing::{debug, info, warn};

/// Creates an ext4 image at `target` containing the tree at `source`.
///
/// On any failure the partially-built image file is removed.
pub fn create_ext4_from_dir(source: &Path, target: &Path) -> Result<()> {
    let tree_size = dir_size(source)?;
    // 20% headroom for filesystem metadata.
    let padded = tree_size + tree_size / 5;
    let size_mib = (padded / (1024 * 1024)).max(BASE_IMAGE_MIN_MIB);

    debug!(
        source = %source.display(),
        target = %target.display(),
        size_mib,
        "creating base ext4 image"
    );

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(Error::from_store_io)?;
    }

    let file = fs::File::create(target).map_err(Error::from_store_io)?;
    file.set_len(size_mib * 1024 * 1024)
        .map_err(Error::from_store_io)?;
    drop(file);

    if let Err(e) = format_and_populate(source, target) {
        let _ = fs::remove_file(target);
        return Err(e);
    }

    info!(target = %target.display(), size_mib, "base ext4 image ready");
    Ok(())
}

fn format_and_populate(source: &Path, target: &Path) -> Result<()> {
    run(&[
        "mkfs.ext4",
        "-F",
        "-q",
        &target.to_string_lossy(),
    ])?;

    let mount_point = mount_point_for(target);
    fs::create_dir_all(&mount_point).map_err(Error::from_store_io)?;

    run(&[
        "mount",
        "-o",
        "loop",
        &target.to_string_lossy(),
        &mount_point.to_string_lossy(),
    ])?;

    // `cp -a` preserves ownership, modes, and symlinks.
    let copy_result = run(&[
        "cp",
        "-a",
        &format!("{}/.", source.display()),
        &mount_point.to_string_lossy(),
    ]);

    if let Err(e) = run(&["umount", &mount_point.to_string_lossy()]) {
        warn!(mount_point = %mount_point.display(), error = %e, "unmount failed");
    }
    let _ = fs::remove_dir(&mount_point);

    copy_result
}

fn mount_point_for(target: &Path) -> PathBuf {
    let name = target
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    PathBuf::from("/tmp").join(format!("micropod-mount-{name}"))
}

/// Total byte size of the regular files under `dir`.
fn dir_size(dir: &Path) -> Result<u64> {
    let mut total = 0u64;
    for entry in fs::read_dir(dir).map_err(Error::from_store_io)? {
        let entry = entry.map_err(Error::from_store_io)?;
        let meta = fs::symlink_metadata(entry.path()).map_err(Error::from_store_io)?;
        if meta.is_dir() {
            total += dir_size(&entry.path())?;
        } else if meta.is_file() {
            total += meta.len();
        }
    }
    Ok(total)
}

fn run(argv: &[&str]) -> Result<()> {
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
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn dir_size_sums_files_recursively() {
        let temp = TempDir::new().unwrap();
        fs::create_dir(temp.path().join("sub")).unwrap();
        fs::File::create(temp.path().join("a"))
            .unwrap()
            .write_all(&[0u8; 100])
            .unwrap();
        fs::File::create(temp.path().join("sub/b"))
            .unwrap()
            .write_all(&[0u8; 50])
            .unwrap();
        assert_eq!(dir_size(temp.path()).unwrap(), 150);
    }

    #[test]
    fn mount_point_is_target_derived() {
        let a = mount_point_for(Path::new("/x/alpine_latest.ext4"));
        let b = mount_point_for(Path::new("/x/nginx_latest.ext4"));
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp"));
    }
}
