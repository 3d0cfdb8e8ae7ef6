//! Host-side client for the guest agent.
//!
//! The guest listens on vsock port 1024; Firecracker exports that byte
//! stream as a host Unix socket. Dialing therefore means connecting to the
//! UDS and performing Firecracker's vsock handshake (`CONNECT <port>\n`,
//! answered with `OK <assigned>\n`) before the framed JSON protocol flows.
//!
//! Each request opens a fresh connection; the boot-time retry loop makes
//! up to [`AGENT_DIAL_ATTEMPTS`] attempts at 1 s intervals with a bounded
//! per-attempt connect timeout, and honors caller cancellation between
//! attempts (dropping the future stops the loop).
//!
//! [`AGENT_DIAL_ATTEMPTS`]: crate::constants::AGENT_DIAL_ATTEMPTS

use crate::constants::{
    AGENT_DIAL_ATTEMPTS, AGENT_DIAL_INTERVAL, AGENT_DIAL_TIMEOUT, AGENT_VSOCK_PORT,
    API_REQUEST_TIMEOUT,
};
use crate::error::{Error, Result};
use crate::agent::protocol::{
    CreateContainerRequest, CreateContainerResponse, Request, MAX_PROCESS_ARGS,
    MAX_PROCESS_ARG_LEN,
};
use std::io;
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::time::timeout;
use tracing::{debug, info};

/// Client for one VM's guest agent.
#[derive(Debug, Clone)]
pub struct AgentClient {
    /// Host-side Unix socket Firecracker exports for vsock.
    uds_path: PathBuf,
    /// Guest vsock port the agent listens on.
    port: u32,
}

impl AgentClient {
    /// Creates a client for the given vsock UDS, targeting the default
    /// agent port.
    pub fn new(uds_path: impl Into<PathBuf>) -> Self {
        Self {
            uds_path: uds_path.into(),
            port: AGENT_VSOCK_PORT,
        }
    }

    /// Waits for the agent to accept connections, retrying through boot.
    ///
    /// Returns [`Error::AgentUnreachable`] after the attempt budget is
    /// exhausted.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut last_error = String::from("no attempt made");

        for attempt in 1..=AGENT_DIAL_ATTEMPTS {
            debug!(attempt, max = AGENT_DIAL_ATTEMPTS, "dialing guest agent");

            match timeout(AGENT_DIAL_TIMEOUT, self.dial()).await {
                Ok(Ok(_stream)) => {
                    info!(attempt, uds = %self.uds_path.display(), "guest agent reachable");
                    return Ok(());
                }
                Ok(Err(e)) => last_error = e.to_string(),
                Err(_) => last_error = format!("connect timed out after {AGENT_DIAL_TIMEOUT:?}"),
            }

            tokio::time::sleep(AGENT_DIAL_INTERVAL).await;
        }

        Err(Error::AgentUnreachable {
            attempts: AGENT_DIAL_ATTEMPTS,
            reason: last_error,
        })
    }

    /// Sends a CreateContainer request and returns the agent's verdict.
    ///
    /// Transport failures surface as [`Error::AgentUnreachable`]; a FAILED
    /// status is returned to the caller for policy handling.
    pub async fn create_container(
        &self,
        request: CreateContainerRequest,
    ) -> Result<CreateContainerResponse> {
        validate_process_args(&request.process_args)?;

        let stream = timeout(AGENT_DIAL_TIMEOUT, self.dial())
            .await
            .map_err(|_| Error::AgentUnreachable {
                attempts: 1,
                reason: format!("connect timed out after {AGENT_DIAL_TIMEOUT:?}"),
            })?
            .map_err(|e| Error::AgentUnreachable {
                attempts: 1,
                reason: e.to_string(),
            })?;

        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let line = Request::CreateContainer(request).to_json_line()?;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        // Container startup includes runc spawning inside the guest; give
        // it the standard request window rather than the dial window.
        let mut response_line = String::new();
        timeout(API_REQUEST_TIMEOUT, reader.read_line(&mut response_line))
            .await
            .map_err(|_| Error::AgentUnreachable {
                attempts: 1,
                reason: format!("agent response timed out after {API_REQUEST_TIMEOUT:?}"),
            })??;

        if response_line.is_empty() {
            return Err(Error::AgentUnreachable {
                attempts: 1,
                reason: "agent closed the connection without responding".to_string(),
            });
        }

        Ok(CreateContainerResponse::from_json(&response_line)?)
    }

    /// Connects to the vsock UDS and completes Firecracker's handshake.
    async fn dial(&self) -> io::Result<UnixStream> {
        let stream = UnixStream::connect(&self.uds_path).await?;
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        writer
            .write_all(format!("CONNECT {}\n", self.port).as_bytes())
            .await?;
        writer.flush().await?;

        let mut ack = String::new();
        reader.read_line(&mut ack).await?;
        if !ack.starts_with("OK ") {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("vsock handshake rejected: {}", ack.trim()),
            ));
        }

        reader
            .into_inner()
            .reunite(writer)
            .map_err(|e| io::Error::other(format!("failed to reunite stream halves: {e}")))
    }
}

/// Rejects oversized argument vectors before they cross the wire.
fn validate_process_args(args: &[String]) -> Result<()> {
    if args.is_empty() {
        return Err(Error::InvalidArgument(
            "process args cannot be empty".to_string(),
        ));
    }
    if args.len() > MAX_PROCESS_ARGS {
        return Err(Error::InvalidArgument(format!(
            "too many process arguments ({} > {MAX_PROCESS_ARGS})",
            args.len()
        )));
    }
    for (i, arg) in args.iter().enumerate() {
        if arg.len() > MAX_PROCESS_ARG_LEN {
            return Err(Error::InvalidArgument(format!(
                "process argument {i} exceeds {MAX_PROCESS_ARG_LEN} bytes"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_args_are_rejected() {
        assert!(matches!(
            validate_process_args(&[]),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn oversized_args_are_rejected() {
        let args = vec!["x".repeat(MAX_PROCESS_ARG_LEN + 1)];
        assert!(validate_process_args(&args).is_err());

        let many: Vec<String> = (0..=MAX_PROCESS_ARGS).map(|i| i.to_string()).collect();
        assert!(validate_process_args(&many).is_err());
    }

    #[test]
    fn normal_args_pass() {
        let args = vec!["/bin/sh".to_string(), "-c".to_string(), "true".to_string()];
        assert!(validate_process_args(&args).is_ok());
    }

    #[tokio::test]
    async fn unreachable_socket_exhausts_into_agent_unreachable() {
        // Point at a path nothing listens on; a single create_container
        // attempt must fail with the agent taxonomy, not a bare I/O error.
        let client = AgentClient::new("/tmp/micropod-test-no-such-socket");
        let result = client
            .create_container(CreateContainerRequest {
                container_id: "vm-x".to_string(),
                process_args: vec!["/bin/sh".to_string()],
                rootfs_path: "/container_rootfs".to_string(),
            })
            .await;
        assert!(matches!(result, Err(Error::AgentUnreachable { .. })));
    }
}
