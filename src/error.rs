//! Error types for the VM lifecycle orchestrator.

use std::path::PathBuf;
use std::time::Duration;

/// Result type alias for orchestrator operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while orchestrating VMs.
///
/// Every failure surfaces as exactly one of these kinds; lower layers map
/// their causes into the matching variant before returning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Caller Input
    // =========================================================================
    /// Image reference failed to parse or validate.
    #[error("invalid image reference '{reference}': {reason}")]
    InvalidRef { reference: String, reason: String },

    /// Port publish specification was not `host:guest`.
    #[error("invalid port mapping '{0}' (expected host:guest)")]
    InvalidPortMapping(String),

    /// Other invalid caller input.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    // =========================================================================
    // Lookup
    // =========================================================================
    /// Unknown VM id in the registry.
    #[error("VM not found: {id}")]
    VmNotFound { id: String },

    /// Image reference not present in the local store.
    #[error("image not found locally: {reference}")]
    ImageNotFound { reference: String },

    /// Duplicate VM id on registry add.
    #[error("VM already exists: {id}")]
    AlreadyExists { id: String },

    // =========================================================================
    // Image Store
    // =========================================================================
    /// The remote registry could not be reached or refused the request.
    #[error("registry unavailable for '{reference}': {reason}")]
    RegistryUnavailable { reference: String, reason: String },

    /// A fetched blob did not match its declared digest.
    #[error("integrity error for {digest}: {reason}")]
    IntegrityError { digest: String, reason: String },

    /// The image store ran out of disk space.
    #[error("storage full: {0}")]
    StorageFull(String),

    // =========================================================================
    // RunVM Step Failures
    // =========================================================================
    /// Host network setup failed.
    #[error("network setup failed: {0}")]
    NetworkError(String),

    /// Rootfs materialization or release failed.
    #[error("rootfs provisioning failed: {0}")]
    RootfsError(String),

    /// Firecracker process or configuration failed before InstanceStart.
    #[error("VM launch failed: {0}")]
    LaunchError(String),

    // =========================================================================
    // Firecracker Interaction
    // =========================================================================
    /// The API socket did not appear within the allowed window.
    #[error("timed out after {duration:?} waiting for socket {path}")]
    SocketTimeout { path: PathBuf, duration: Duration },

    /// Firecracker answered with a non-2xx status.
    #[error("Firecracker API error ({status}): {body}")]
    FirecrackerApi { status: u16, body: String },

    // =========================================================================
    // Agent Interaction
    // =========================================================================
    /// The guest agent never accepted a connection.
    #[error("guest agent unreachable after {attempts} attempts: {reason}")]
    AgentUnreachable { attempts: u32, reason: String },

    /// The agent reported a non-RUNNING container status.
    #[error("container failed to start in guest: {message}")]
    ContainerStartFailed { message: String },

    // =========================================================================
    // Control Flow
    // =========================================================================
    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// Violated invariant. The process may continue serving other VMs.
    #[error("internal error: {0}")]
    Internal(String),

    // =========================================================================
    // Carriers
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Maps an I/O error onto the image-store taxonomy: `ENOSPC` becomes
    /// [`Error::StorageFull`], everything else stays an I/O error.
    pub fn from_store_io(err: std::io::Error) -> Self {
        if err.raw_os_error() == Some(libc::ENOSPC) {
            Error::StorageFull(err.to_string())
        } else {
            Error::Io(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_step() {
        let err = Error::NetworkError("tap creation failed".to_string());
        assert!(err.to_string().contains("network"));

        let err = Error::FirecrackerApi {
            status: 400,
            body: "bad drive".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("bad drive"));
    }

    #[test]
    fn io_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: Error = io.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
