//! # micropod
//!
//! **OCI containers in Firecracker microVMs.**
//!
//! micropod runs standard OCI container images inside hardware-isolated
//! microVMs instead of shared-kernel namespaces. The host-side controller
//! pulls an image, materializes its root filesystem, boots a Firecracker
//! VM carrying a minimal guest distribution plus an in-guest agent, and
//! delegates container creation to that agent over a vsock-transported RPC
//! channel.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────────┐
//! │  Host                                                              │
//! │                                                                    │
//! │  Manager (run / list / stop / logs)                                │
//! │    │                                                               │
//! │    ├─▶ ImageStore      OCI pull → layout → unpack / base ext4      │
//! │    ├─▶ RootfsProvisioner  FlatDir (virtio-fs) │ CoW snapshot (dm)  │
//! │    ├─▶ network         tap + /24 + NAT + port publishing           │
//! │    ├─▶ VmmProcess      spawn firecracker, PUT config, supervise    │
//! │    ├─▶ AgentClient     vsock UDS dial → CreateContainer            │
//! │    └─▶ VmStore         durable JSON registry, atomic replace       │
//! │                                                                    │
//! │  ┌──────────────────────────────────────────────────────────────┐  │
//! │  │  MicroVM (Firecracker)                                       │  │
//! │  │  kernel + agent rootfs                                       │  │
//! │  │  agent ──runc──▶ container  (rootfs via virtio-fs or /dev/vda)│ │
//! │  └──────────────────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! `run` flows left to right; `stop` and dead-VM reconciliation unwind in
//! reverse. Every resource a VM owns (tap device, rootfs artifact, loop
//! devices, device-mapper nodes, sockets) belongs to exactly one registry
//! record, and the record is committed only after the guest agent confirms
//! the container is running. On any failure `run` drains its accumulated
//! rollback list in reverse order, so partial launches leave nothing
//! behind.
//!
//! # Example
//!
//! ```rust,ignore
//! use micropod::Manager;
//!
//! #[tokio::main]
//! async fn main() -> micropod::Result<()> {
//!     let manager = Manager::new()?;
//!     let vm_id = manager.run_vm("alpine:latest", &["8080:80".to_string()]).await?;
//!     println!("VM started successfully with ID: {vm_id}");
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod config;
pub mod constants;
pub mod error;
pub mod firecracker;
pub mod image;
pub mod manager;
pub mod network;
pub mod rootfs;
pub mod state;

pub use config::Config;
pub use error::{Error, Result};
pub use image::{ImageService, ImageStore, StoredImage};
pub use manager::Manager;
pub use network::NetworkConfig;
pub use rootfs::{RootfsArtifact, RootfsStrategy};
pub use state::{RootfsHandle, VmRecord, VmState, VmStore};
