//! Wire protocol for the guest agent.
//!
//! The agent inside the VM drives `runc` against the shared rootfs and
//! exposes one operation in the MVP. Messages are newline-delimited,
//! self-describing JSON:
//!
//! ```text
//! Host                                     Guest (agent)
//!   |                                          |
//!   |  {"action":"create_container",...}\n     |
//!   |----------------------------------------->|
//!   |                                          |
//!   |  {"containerId":...,"status":"RUNNING"}\n|
//!   |<-----------------------------------------|
//! ```
//!
//! The host only depends on this shape; the agent's internals are opaque.

use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// Maximum number of process arguments.
pub const MAX_PROCESS_ARGS: usize = 256;

/// Maximum length of a single process argument.
pub const MAX_PROCESS_ARG_LEN: usize = 4096;

// =============================================================================
// Requests
// =============================================================================

/// Request from host to guest agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Request {
    /// Create and start a container against the shared rootfs.
    CreateContainer(CreateContainerRequest),
}

/// Payload of [`Request::CreateContainer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerRequest {
    /// Container identifier (the VM id in the MVP).
    pub container_id: String,
    /// argv of the container's init process.
    pub process_args: Vec<String>,
    /// Rootfs path as seen inside the guest.
    pub rootfs_path: String,
}

// =============================================================================
// Responses
// =============================================================================

/// Container status reported by the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContainerStatus {
    #[serde(rename = "RUNNING")]
    Running,
    #[serde(rename = "FAILED")]
    Failed,
}

/// Response to [`Request::CreateContainer`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateContainerResponse {
    /// Echoed container identifier.
    pub container_id: String,
    /// Pid of the container's init inside the guest; 0 if unknown.
    #[serde(default)]
    pub pid: u32,
    /// Whether the container came up.
    pub status: ContainerStatus,
    /// Populated when `status` is `FAILED`.
    #[serde(default)]
    pub error_message: String,
}

// =============================================================================
// Wire Format Helpers
// =============================================================================

impl Request {
    /// Serializes the request to a JSON line (with trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        let mut json = serde_json::to_string(self)?;
        json.push('\n');
        Ok(json)
    }
}

impl CreateContainerResponse {
    /// Deserializes a response from one JSON line.
    pub fn from_json(s: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(s.trim())
    }
}
