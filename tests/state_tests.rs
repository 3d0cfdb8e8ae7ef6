//! Tests for the durable VM registry.
//!
//! Validates the registry laws: add/get round-trips, removal, idempotent
//! state updates, atomic replacement, and durability across store handles.

use chrono::Utc;
use micropod::state::{RootfsHandle, VmRecord, VmState, VmStore};
use micropod::Error;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn record(id: &str) -> VmRecord {
    VmRecord {
        id: id.to_string(),
        image_ref: "library/alpine:latest".to_string(),
        state: VmState::Running,
        firecracker_pid: 4242,
        api_socket_path: PathBuf::from(format!("/tmp/firecracker-{id}.sock")),
        rootfs_handle: RootfsHandle::VirtioFsDir {
            path: PathBuf::from(format!("/work/flat/{id}")),
        },
        kernel_path: PathBuf::from("/cfg/vmlinux/vmlinux.elf"),
        network: None,
        vsock_uds_path: PathBuf::from(format!("/tmp/micropod-vsock-{id}")),
        log_path: PathBuf::from(format!("/cfg/logs/{id}.log")),
        agent_connected: true,
        created_at: Utc::now(),
    }
}

// =============================================================================
// Round-trip Laws
// =============================================================================

#[test]
fn add_then_get_returns_the_record() {
    let temp = TempDir::new().unwrap();
    let store = VmStore::new(temp.path().join("vms.json"));

    let original = record("vm-1");
    store.add(original.clone()).unwrap();

    let loaded = store.get_by_id("vm-1").unwrap();
    assert_eq!(loaded.id, original.id);
    assert_eq!(loaded.image_ref, original.image_ref);
    assert_eq!(loaded.state, original.state);
    assert_eq!(loaded.firecracker_pid, original.firecracker_pid);
    assert_eq!(loaded.rootfs_handle, original.rootfs_handle);
    assert_eq!(loaded.vsock_uds_path, original.vsock_uds_path);
    assert!(loaded.agent_connected);
}

#[test]
fn add_remove_get_is_not_found() {
    let temp = TempDir::new().unwrap();
    let store = VmStore::new(temp.path().join("vms.json"));

    store.add(record("vm-1")).unwrap();
    store.remove("vm-1").unwrap();

    assert!(matches!(
        store.get_by_id("vm-1"),
        Err(Error::VmNotFound { .. })
    ));
}

#[test]
fn two_sequential_state_updates_equal_one() {
    let temp = TempDir::new().unwrap();
    let store = VmStore::new(temp.path().join("vms.json"));

    store.add(record("vm-1")).unwrap();
    store.update_state("vm-1", VmState::Stopping).unwrap();
    let once = store.get_by_id("vm-1").unwrap();

    store.update_state("vm-1", VmState::Stopping).unwrap();
    let twice = store.get_by_id("vm-1").unwrap();

    assert_eq!(once.state, twice.state);
    assert_eq!(twice.state, VmState::Stopping);
}

// =============================================================================
// Error Cases
// =============================================================================

#[test]
fn mutations_on_unknown_ids_are_not_found() {
    let temp = TempDir::new().unwrap();
    let store = VmStore::new(temp.path().join("vms.json"));

    assert!(matches!(
        store.get_by_id("ghost"),
        Err(Error::VmNotFound { .. })
    ));
    assert!(matches!(
        store.remove("ghost"),
        Err(Error::VmNotFound { .. })
    ));
    assert!(matches!(
        store.update_state("ghost", VmState::Dead),
        Err(Error::VmNotFound { .. })
    ));
}

#[test]
fn duplicate_add_is_rejected_and_leaves_one_record() {
    let temp = TempDir::new().unwrap();
    let store = VmStore::new(temp.path().join("vms.json"));

    store.add(record("vm-1")).unwrap();
    assert!(matches!(
        store.add(record("vm-1")),
        Err(Error::AlreadyExists { .. })
    ));
    assert_eq!(store.list().unwrap().len(), 1);
}

// =============================================================================
// Durability
// =============================================================================

#[test]
fn records_survive_a_fresh_store_handle() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("vms.json");

    let store = VmStore::new(path.clone());
    store.add(record("vm-1")).unwrap();
    store.add(record("vm-2")).unwrap();
    drop(store);

    let reopened = VmStore::new(path);
    let records = reopened.list().unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].id, "vm-1");
    assert_eq!(records[1].id, "vm-2");
}

#[test]
fn removed_ids_are_absent_from_the_file_on_disk() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("vms.json");
    let store = VmStore::new(path.clone());

    store.add(record("vm-keep")).unwrap();
    store.add(record("vm-drop")).unwrap();
    store.remove("vm-drop").unwrap();

    let raw = fs::read_to_string(&path).unwrap();
    assert!(raw.contains("vm-keep"));
    assert!(!raw.contains("vm-drop"));
}

#[test]
fn no_temp_file_lingers_after_mutations() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("vms.json");
    let store = VmStore::new(path.clone());

    store.add(record("vm-1")).unwrap();
    store.update_state("vm-1", VmState::Dead).unwrap();
    store.remove("vm-1").unwrap();

    let leftovers: Vec<_> = fs::read_dir(temp.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path() != path)
        .collect();
    assert!(leftovers.is_empty(), "leftovers: {leftovers:?}");
}

#[test]
fn registry_file_is_created_lazily() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("vms.json");
    let store = VmStore::new(path.clone());

    assert!(store.list().unwrap().is_empty());
    assert!(!path.exists(), "reads must not create the file");

    store.add(record("vm-1")).unwrap();
    assert!(path.exists());
}

// =============================================================================
// Persisted Format
// =============================================================================

#[test]
fn document_is_a_json_array_with_stable_field_names() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("vms.json");
    let store = VmStore::new(path.clone());
    store.add(record("vm-1")).unwrap();

    let docs: Vec<serde_json::Value> =
        serde_json::from_slice(&fs::read(&path).unwrap()).unwrap();
    assert_eq!(docs.len(), 1);

    let doc = &docs[0];
    for field in [
        "id",
        "imageRef",
        "state",
        "firecrackerPid",
        "apiSocketPath",
        "rootfsHandle",
        "kernelPath",
        "vsockUdsPath",
        "logPath",
        "agentConnected",
        "createdAt",
    ] {
        assert!(doc.get(field).is_some(), "missing field {field}");
    }
    assert_eq!(doc["state"], "Running");
}

#[test]
fn block_device_handles_round_trip() {
    let temp = TempDir::new().unwrap();
    let store = VmStore::new(temp.path().join("vms.json"));

    let mut rec = record("vm-cow");
    rec.rootfs_handle = RootfsHandle::BlockDevice {
        device_path: PathBuf::from("/dev/mapper/micropod-vm-vm-cow"),
        dm_name: "micropod-vm-vm-cow".to_string(),
        base_name: "micropod-base-alpine_latest".to_string(),
        cow_path: PathBuf::from("/work/cow/vm-cow.cow"),
    };
    store.add(rec.clone()).unwrap();

    let loaded = store.get_by_id("vm-cow").unwrap();
    assert_eq!(loaded.rootfs_handle, rec.rootfs_handle);
}
