//! Guest agent RPC: wire protocol and the host-side vsock client.

mod client;
pub mod protocol;

pub use client::AgentClient;
pub use protocol::{ContainerStatus, CreateContainerRequest, CreateContainerResponse};
