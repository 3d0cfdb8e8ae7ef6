//! Firecracker control API client.
//!
//! Firecracker exposes its control plane as HTTP 1.1 over a Unix stream
//! socket; every resource is configured with a `PUT` carrying a JSON body.
//! A 2xx response means success; anything else surfaces as
//! [`Error::FirecrackerApi`] with the response body attached.

use crate::constants::API_REQUEST_TIMEOUT;
use crate::error::{Error, Result};
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper_util::client::legacy::Client;
use hyperlocal::UnixConnector;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

type HyperClient = Client<UnixConnector, Full<Bytes>>;

// =============================================================================
// API Resource Bodies
// =============================================================================

/// `PUT /boot-source`
#[derive(Debug, Clone, Serialize)]
pub struct BootSource {
    pub kernel_image_path: String,
    pub boot_args: String,
}

/// `PUT /drives/{id}`
#[derive(Debug, Clone, Serialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: String,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

/// `PUT /machine-config`
#[derive(Debug, Clone, Serialize)]
pub struct MachineConfig {
    pub vcpu_count: i64,
    pub mem_size_mib: i64,
    pub smt: bool,
}

/// `PUT /network-interfaces/{iface}`
#[derive(Debug, Clone, Serialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    pub guest_mac: String,
}

/// `PUT /vsock`
#[derive(Debug, Clone, Serialize)]
pub struct Vsock {
    pub guest_cid: u32,
    pub uds_path: String,
}

/// `PUT /fs/{tag}`
#[derive(Debug, Clone, Serialize)]
pub struct FsDevice {
    pub tag: String,
    pub shared_dir: String,
}

/// `PUT /actions`
#[derive(Debug, Clone, Serialize)]
pub struct Action {
    pub action_type: String,
}

impl Action {
    pub fn instance_start() -> Self {
        Self {
            action_type: "InstanceStart".to_string(),
        }
    }

    pub fn send_ctrl_alt_del() -> Self {
        Self {
            action_type: "SendCtrlAltDel".to_string(),
        }
    }
}

// =============================================================================
// Client
// =============================================================================

/// Client for one Firecracker process's API socket.
pub struct FirecrackerClient {
    client: HyperClient,
    socket_path: PathBuf,
}

impl FirecrackerClient {
    /// Creates a client for the given API socket.
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        let client = Client::builder(hyper_util::rt::TokioExecutor::new()).build(UnixConnector);
        Self {
            client,
            socket_path: socket_path.into(),
        }
    }

    /// Returns the socket path this client talks to.
    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// PUTs a JSON resource, enforcing the per-request timeout.
    pub async fn put<T: Serialize>(&self, endpoint: &str, body: &T) -> Result<()> {
        let uri: hyper::Uri = hyperlocal::Uri::new(&self.socket_path, endpoint).into();
        let json = serde_json::to_string(body)?;

        debug!(endpoint, "PUT to Firecracker API");

        let request = hyper::Request::builder()
            .method(hyper::Method::PUT)
            .uri(uri)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(json)))
            .map_err(|e| Error::Internal(format!("failed to build API request: {e}")))?;

        let response = tokio::time::timeout(API_REQUEST_TIMEOUT, self.client.request(request))
            .await
            .map_err(|_| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("API request to {endpoint} timed out"),
                ))
            })?
            .map_err(|e| {
                Error::Io(std::io::Error::other(format!(
                    "API request to {endpoint} failed: {e}"
                )))
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .into_body()
                .collect()
                .await
                .map(|b| String::from_utf8_lossy(&b.to_bytes()).into_owned())
                .unwrap_or_default();
            return Err(Error::FirecrackerApi {
                status: status.as_u16(),
                body,
            });
        }

        Ok(())
    }
}
