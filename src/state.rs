//! Durable VM registry.
//!
//! A flat ordered sequence of [`VmRecord`]s persisted as one JSON document.
//! Every mutation follows a single-writer discipline: read the file, compute
//! the new sequence in memory, and atomically replace the file (write to a
//! sibling temp path, then rename). Readers take a shared guard, writers an
//! exclusive one; no transaction spans multiple calls.
//!
//! Unknown JSON fields are ignored on read so newer writers stay compatible
//! with older readers. A missing registry file reads as the empty list; the
//! file is created lazily by the first write.

use crate::error::{Error, Result};
use crate::network::NetworkConfig;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::debug;

// =============================================================================
// Records
// =============================================================================

/// Lifecycle state of a VM record.
///
/// ```text
/// Creating ──▶ Running ──▶ Stopping
///     │           │            │
///     └───────────┴────────────┴──▶ Dead (reconciled + removed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub enum VmState {
    /// Resources are being acquired; the VM is not yet committed.
    Creating,
    /// The agent confirmed container startup.
    Running,
    /// Teardown is in progress.
    Stopping,
    /// The VMM process is gone; the record awaits reconciliation.
    Dead,
}

impl std::fmt::Display for VmState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Creating => write!(f, "Creating"),
            Self::Running => write!(f, "Running"),
            Self::Stopping => write!(f, "Stopping"),
            Self::Dead => write!(f, "Dead"),
        }
    }
}

/// Persisted form of a VM's rootfs, tagged by strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum RootfsHandle {
    /// Host directory shared into the guest via virtio-fs.
    #[serde(rename_all = "camelCase")]
    VirtioFsDir { path: PathBuf },
    /// Device-mapper snapshot node booted as the guest root.
    #[serde(rename_all = "camelCase")]
    BlockDevice {
        device_path: PathBuf,
        dm_name: String,
        base_name: String,
        cow_path: PathBuf,
    },
}

/// The unit of durable state: one record per VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecord {
    /// Opaque 128-bit identifier, string-encoded.
    pub id: String,
    /// Caller-supplied image reference.
    pub image_ref: String,
    /// Lifecycle state.
    pub state: VmState,
    /// OS process id of the VMM; 0 if unknown.
    pub firecracker_pid: i32,
    /// Firecracker control socket path.
    pub api_socket_path: PathBuf,
    /// Materialized rootfs.
    pub rootfs_handle: RootfsHandle,
    /// Guest kernel used to boot this VM.
    pub kernel_path: PathBuf,
    /// Network allocation, if one was made.
    #[serde(default)]
    pub network: Option<NetworkConfig>,
    /// Host-side Unix socket Firecracker exposes for vsock.
    pub vsock_uds_path: PathBuf,
    /// File receiving VMM stdout/stderr and the guest console.
    pub log_path: PathBuf,
    /// Set on the first successful agent RPC.
    #[serde(default)]
    pub agent_connected: bool,
    /// Wall-clock creation time.
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Store
// =============================================================================

/// Registry of VM records backed by a single JSON file.
pub struct VmStore {
    file_path: PathBuf,
    lock: RwLock<()>,
}

impl VmStore {
    /// Opens the registry at the given path. The file itself is created
    /// lazily by the first mutation.
    pub fn new(file_path: PathBuf) -> Self {
        Self {
            file_path,
            lock: RwLock::new(()),
        }
    }

    /// Returns the backing file path.
    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// Appends a record. Duplicate ids are rejected.
    pub fn add(&self, record: VmRecord) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut records = self.load()?;
        if records.iter().any(|r| r.id == record.id) {
            return Err(Error::AlreadyExists { id: record.id });
        }
        debug!(id = %record.id, state = %record.state, "adding VM record");
        records.push(record);
        self.save(&records)
    }

    /// Returns the record with the given id.
    pub fn get_by_id(&self, id: &str) -> Result<VmRecord> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.load()?
            .into_iter()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::VmNotFound { id: id.to_string() })
    }

    /// Removes the record with the given id.
    pub fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut records = self.load()?;
        let before = records.len();
        records.retain(|r| r.id != id);
        if records.len() == before {
            return Err(Error::VmNotFound { id: id.to_string() });
        }
        debug!(id, "removing VM record");
        self.save(&records)
    }

    /// Returns all records in insertion order.
    pub fn list(&self) -> Result<Vec<VmRecord>> {
        let _guard = self.lock.read().unwrap_or_else(|e| e.into_inner());
        self.load()
    }

    /// Updates the state of the record with the given id. Repeating the same
    /// transition is equivalent to applying it once.
    pub fn update_state(&self, id: &str, state: VmState) -> Result<()> {
        let _guard = self.lock.write().unwrap_or_else(|e| e.into_inner());
        let mut records = self.load()?;
        let record = records
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| Error::VmNotFound { id: id.to_string() })?;
        record.state = state;
        self.save(&records)
    }

    fn load(&self) -> Result<Vec<VmRecord>> {
        let data = match fs::read(&self.file_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&data)?)
    }

    /// Replaces the file atomically: a partial write can never be observed.
    fn save(&self, records: &[VmRecord]) -> Result<()> {
        if let Some(parent) = self.file_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(records)?;
        let temp_path = self.file_path.with_extension("json.tmp");
        fs::write(&temp_path, &data)?;
        fs::rename(&temp_path, &self.file_path).map_err(|e| {
            let _ = fs::remove_file(&temp_path);
            Error::Io(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str) -> VmRecord {
        VmRecord {
            id: id.to_string(),
            image_ref: "alpine:latest".to_string(),
            state: VmState::Creating,
            firecracker_pid: 0,
            api_socket_path: PathBuf::from("/tmp/firecracker-test.sock"),
            rootfs_handle: RootfsHandle::VirtioFsDir {
                path: PathBuf::from("/tmp/rootfs"),
            },
            kernel_path: PathBuf::from("/tmp/vmlinux.elf"),
            network: None,
            vsock_uds_path: PathBuf::from("/tmp/micropod-vsock-test"),
            log_path: PathBuf::from("/tmp/test.log"),
            agent_connected: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let temp = TempDir::new().unwrap();
        let store = VmStore::new(temp.path().join("vms.json"));
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let temp = TempDir::new().unwrap();
        let store = VmStore::new(temp.path().join("vms.json"));
        store.add(record("vm-1")).unwrap();
        assert!(matches!(
            store.add(record("vm-1")),
            Err(Error::AlreadyExists { .. })
        ));
    }

    #[test]
    fn update_state_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let store = VmStore::new(temp.path().join("vms.json"));
        store.add(record("vm-1")).unwrap();
        store.update_state("vm-1", VmState::Running).unwrap();
        store.update_state("vm-1", VmState::Running).unwrap();
        assert_eq!(store.get_by_id("vm-1").unwrap().state, VmState::Running);
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vms.json");
        let store = VmStore::new(path.clone());
        store.add(record("vm-1")).unwrap();

        // Splice an unknown field into the persisted document.
        let mut docs: Vec<serde_json::Value> =
            serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
        docs[0]["futureField"] = serde_json::json!("ignored");
        fs::write(&path, serde_json::to_vec(&docs).unwrap()).unwrap();

        assert_eq!(store.get_by_id("vm-1").unwrap().id, "vm-1");
    }
}
