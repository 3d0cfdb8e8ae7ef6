//! Layer extraction with whiteout handling.
//!
//! Layers are applied to the destination *in order*, later layers
//! overwriting earlier ones. Whiteout entries encode deletions:
//!
//! - `.wh.<name>` deletes the sibling `<name>` contributed by an earlier
//!   layer (file or whole tree).
//! - `.wh..wh..opq` marks the parent directory opaque: everything the
//!   directory holds when the marker is seen (earlier layers' contributions)
//!   is discarded; entries added later in the same layer survive.
//!
//! Whiteout entries are never materialized. Any entry whose cleaned path
//! escapes the destination is skipped, as are device and FIFO entries when
//! the process is unprivileged.

use crate::constants::{OPAQUE_WHITEOUT, WHITEOUT_PREFIX};
use crate::error::{Error, Result};
use flate2::read::GzDecoder;
use std::fs;
use std::io::{self, Read};
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use tar::{Archive, EntryType};
use tracing::debug;

/// Extracts one layer blob to `dest`, decompressing according to its media
/// type (`+gzip` suffixed types are gunzipped, plain `tar` is read as-is).
pub fn extract_layer_blob<R: Read>(reader: R, media_type: &str, dest: &Path) -> Result<()> {
    if media_type.ends_with("gzip") {
        apply_layer(GzDecoder::new(reader), dest)
    } else {
        apply_layer(reader, dest)
    }
}

/// Applies one uncompressed tar stream to `dest`.
pub fn apply_layer<R: Read>(reader: R, dest: &Path) -> Result<()> {
    let mut archive = Archive::new(reader);

    for entry in archive.entries().map_err(Error::from_store_io)? {
        let mut entry = entry.map_err(Error::from_store_io)?;
        let raw_path = entry.path().map_err(Error::from_store_io)?.into_owned();

        let Some(rel) = sanitize_entry_path(&raw_path) else {
            debug!(path = %raw_path.display(), "skipping entry escaping destination");
            continue;
        };

        let name = rel.file_name().and_then(|n| n.to_str()).unwrap_or("");
        if name == OPAQUE_WHITEOUT {
            let parent = dest.join(rel.parent().unwrap_or(Path::new("")));
            clear_directory(&parent)?;
            continue;
        }
        if let Some(victim) = name.strip_prefix(WHITEOUT_PREFIX) {
            let target = dest.join(rel.parent().unwrap_or(Path::new(""))).join(victim);
            remove_existing(&target).map_err(Error::from_store_io)?;
            continue;
        }

        let target = dest.join(&rel);
        let mode = entry.header().mode().unwrap_or(0o644) & 0o7777;

        match entry.header().entry_type() {
            EntryType::Directory => {
                if let Ok(meta) = fs::symlink_metadata(&target) {
                    if !meta.is_dir() {
                        remove_existing(&target).map_err(Error::from_store_io)?;
                    }
                }
                fs::create_dir_all(&target).map_err(Error::from_store_io)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(Error::from_store_io)?;
            }

            EntryType::Regular | EntryType::Continuous => {
                ensure_parent(&target)?;
                remove_existing(&target).map_err(Error::from_store_io)?;
                let mut file = fs::File::create(&target).map_err(Error::from_store_io)?;
                io::copy(&mut entry, &mut file).map_err(Error::from_store_io)?;
                fs::set_permissions(&target, fs::Permissions::from_mode(mode))
                    .map_err(Error::from_store_io)?;
            }

            EntryType::Symlink => {
                let Some(link) = entry.link_name().map_err(Error::from_store_io)? else {
                    continue;
                };
                ensure_parent(&target)?;
                remove_existing(&target).map_err(Error::from_store_io)?;
                std::os::unix::fs::symlink(&link, &target).map_err(Error::from_store_io)?;
            }

            EntryType::Link => {
                let Some(link) = entry.link_name().map_err(Error::from_store_io)? else {
                    continue;
                };
                let Some(source_rel) = sanitize_entry_path(&link) else {
                    debug!(link = %link.display(), "skipping hardlink escaping destination");
                    continue;
                };
                ensure_parent(&target)?;
                remove_existing(&target).map_err(Error::from_store_io)?;
                fs::hard_link(dest.join(&source_rel), &target).map_err(Error::from_store_io)?;
            }

            kind @ (EntryType::Char | EntryType::Block | EntryType::Fifo) => {
                if !is_privileged() {
                    debug!(path = %rel.display(), "skipping device node (unprivileged)");
                    continue;
                }
                let major = entry.header().device_major().ok().flatten().unwrap_or(0);
                let minor = entry.header().device_minor().ok().flatten().unwrap_or(0);
                ensure_parent(&target)?;
                remove_existing(&target).map_err(Error::from_store_io)?;
                make_node(&target, kind, mode, major, minor).map_err(Error::from_store_io)?;
            }

            _ => {
                debug!(path = %rel.display(), "skipping unsupported entry type");
            }
        }
    }

    Ok(())
}

/// Cleans a tar entry path into a destination-relative path.
///
/// Leading roots are stripped, `.` components dropped, and `..` resolved
/// in-place. Returns `None` when the cleaned path would escape the
/// destination or collapses to nothing.
pub fn sanitize_entry_path(raw: &Path) -> Option<PathBuf> {
    let mut clean = PathBuf::new();
    for component in raw.components() {
        match component {
            Component::Normal(part) => clean.push(part),
            Component::ParentDir => {
                if !clean.pop() {
                    return None;
                }
            }
            Component::CurDir | Component::RootDir | Component::Prefix(_) => {}
        }
    }
    if clean.as_os_str().is_empty() {
        None
    } else {
        Some(clean)
    }
}

/// Removes everything inside `dir` (but not `dir` itself). Missing
/// directories are fine: the opaque marker may precede the directory entry.
fn clear_directory(dir: &Path) -> Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(Error::from_store_io(e)),
    };
    for entry in entries {
        let entry = entry.map_err(Error::from_store_io)?;
        remove_existing(&entry.path()).map_err(Error::from_store_io)?;
    }
    Ok(())
}

fn remove_existing(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn ensure_parent(target: &Path) -> Result<()> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).map_err(Error::from_store_io)?;
    }
    Ok(())
}

fn is_privileged() -> bool {
    // SAFETY: geteuid has no failure modes.
    unsafe { libc::geteuid() == 0 }
}

fn make_node(target: &Path, kind: EntryType, mode: u32, major: u32, minor: u32) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    let path = CString::new(target.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))?;
    let type_bits = match kind {
        EntryType::Char => libc::S_IFCHR,
        EntryType::Block => libc::S_IFBLK,
        _ => libc::S_IFIFO,
    };
    let dev = libc::makedev(major, minor);
    // SAFETY: path is a valid NUL-terminated C string.
    let ret = unsafe { libc::mknod(path.as_ptr(), type_bits | mode, dev) };
    if ret != 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}
