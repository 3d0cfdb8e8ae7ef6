//! Constants for the VM lifecycle orchestrator.
//!
//! All limits, timeouts, and well-known names are defined here to ensure
//! consistency and prevent magic numbers throughout the codebase.

use std::time::Duration;

// =============================================================================
// Configuration
// =============================================================================

/// Environment variable overriding the config root directory.
pub const CONFIG_DIR_ENV: &str = "MICROPOD_CONFIG_DIR";

/// Product segment appended to the user's config directory.
pub const CONFIG_DIR_NAME: &str = "micropod";

/// Environment variable selecting the rootfs strategy (`virtiofs` | `cow`).
pub const ROOTFS_STRATEGY_ENV: &str = "MICROPOD_ROOTFS_STRATEGY";

// =============================================================================
// Image Limits
// =============================================================================

/// Maximum OCI image reference length (bytes).
/// Prevents injection attacks via overly long image names.
pub const MAX_IMAGE_REF_LEN: usize = 512;

/// Maximum size of a single OCI layer (512 MiB).
/// Prevents disk exhaustion from malicious images.
pub const MAX_LAYER_SIZE: u64 = 512 * 1024 * 1024;

/// Maximum number of layers in an OCI image.
pub const MAX_LAYERS: usize = 128;

/// Maximum manifest size (1 MiB).
pub const MAX_MANIFEST_SIZE: usize = 1024 * 1024;

/// Maximum config blob size (1 MiB).
pub const MAX_CONFIG_SIZE: usize = 1024 * 1024;

// =============================================================================
// VM Resources
// =============================================================================

/// Default vCPUs for microVMs.
pub const DEFAULT_VCPUS: i64 = 1;

/// Default memory for microVMs (512 MiB).
pub const DEFAULT_VM_MEMORY_MIB: i64 = 512;

/// Guest CID assigned to the VM's vsock device.
pub const GUEST_CID: u32 = 3;

// =============================================================================
// Timeouts
// =============================================================================

/// Timeout for image pull operations.
pub const IMAGE_PULL_TIMEOUT: Duration = Duration::from_secs(300);

/// Per-request timeout for Firecracker API calls.
pub const API_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Maximum wait for the Firecracker API socket to appear.
pub const API_SOCKET_TIMEOUT: Duration = Duration::from_secs(10);

/// Poll interval while waiting for the API socket.
pub const API_SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Graceful shutdown window before force-killing a VM.
pub const VM_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Number of attempts when dialing the guest agent.
pub const AGENT_DIAL_ATTEMPTS: u32 = 30;

/// Delay between agent dial attempts.
pub const AGENT_DIAL_INTERVAL: Duration = Duration::from_secs(1);

/// Per-attempt connect timeout when dialing the guest agent.
pub const AGENT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Poll interval while following a VM log file.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

// =============================================================================
// Rootfs Sizing
// =============================================================================

/// Minimum base ext4 image size (MiB).
pub const BASE_IMAGE_MIN_MIB: u64 = 64;

/// Minimum CoW backing file size (8 MiB).
pub const COW_MIN_BYTES: u64 = 8 * 1024 * 1024;

// =============================================================================
// Device and Socket Naming
// =============================================================================

/// Prefix for shared read-only base device-mapper targets.
pub const BASE_DEVICE_PREFIX: &str = "micropod-base-";

/// Prefix for per-VM snapshot device-mapper targets.
pub const SNAPSHOT_DEVICE_PREFIX: &str = "micropod-vm-";

/// Prefix for per-VM tap devices. The 8-character id prefix is appended.
pub const TAP_DEVICE_PREFIX: &str = "tap-";

/// First two octets of the per-VM point-to-point subnets.
pub const SUBNET_BASE: &str = "172.18";

/// Locally-administered OUI prefix for guest MAC addresses.
pub const GUEST_MAC_PREFIX: &str = "02:FC:00:00";

// =============================================================================
// Guest Layout
// =============================================================================

/// Virtio-fs mount tag exporting the container rootfs to the guest.
pub const VIRTIOFS_MOUNT_TAG: &str = "container_rootfs";

/// Path where the guest agent mounts the virtio-fs share.
pub const GUEST_ROOTFS_PATH: &str = "/container_rootfs";

/// Vsock port the guest agent listens on.
pub const AGENT_VSOCK_PORT: u32 = 1024;

/// Kernel boot arguments common to every VM. A caller suffix (e.g. the
/// static-IP directive consumed by the guest init) is appended.
pub const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off root=/dev/vda rw";

// =============================================================================
// OCI Layout
// =============================================================================

/// Version written to the top-level `oci-layout` marker file.
pub const OCI_LAYOUT_VERSION: &str = "1.0.0";

/// Annotation key recording the original reference on index entries.
pub const REF_NAME_ANNOTATION: &str = "org.opencontainers.image.ref.name";

/// OCI Image Manifest media type.
pub const OCI_IMAGE_MANIFEST_MEDIA_TYPE: &str = "application/vnd.oci.image.manifest.v1+json";

/// OCI Image Config media type.
pub const OCI_IMAGE_CONFIG_MEDIA_TYPE: &str = "application/vnd.oci.image.config.v1+json";

/// OCI Layer media type (gzip compressed).
pub const OCI_LAYER_MEDIA_TYPE_GZIP: &str = "application/vnd.oci.image.layer.v1.tar+gzip";

/// OCI Layer media type (uncompressed).
pub const OCI_LAYER_MEDIA_TYPE_TAR: &str = "application/vnd.oci.image.layer.v1.tar";

/// Docker layer media type (gzip compressed). Registries still serve these
/// for the bulk of public images.
pub const DOCKER_LAYER_MEDIA_TYPE_GZIP: &str =
    "application/vnd.docker.image.rootfs.diff.tar.gzip";

// =============================================================================
// Whiteouts
// =============================================================================

/// Prefix marking a tar entry as a whiteout.
pub const WHITEOUT_PREFIX: &str = ".wh.";

/// Basename marking the parent directory as opaque.
pub const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";
