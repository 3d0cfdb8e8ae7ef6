//! Tests for the error taxonomy.
//!
//! Every failure kind names its step and carries its cause; the single
//! stderr diagnostic line the CLI prints is built from these displays.

use micropod::Error;
use std::path::PathBuf;
use std::time::Duration;

#[test]
fn caller_input_errors_name_the_input() {
    let err = Error::InvalidRef {
        reference: "bad image".to_string(),
        reason: "contains invalid characters".to_string(),
    };
    assert!(err.to_string().contains("bad image"));
    assert!(err.to_string().contains("invalid characters"));

    let err = Error::InvalidPortMapping("8080".to_string());
    assert!(err.to_string().contains("8080"));
    assert!(err.to_string().contains("host:guest"));
}

#[test]
fn lookup_errors_name_the_key() {
    let err = Error::VmNotFound {
        id: "vm-404".to_string(),
    };
    assert!(err.to_string().contains("vm-404"));

    let err = Error::ImageNotFound {
        reference: "ghost:latest".to_string(),
    };
    assert!(err.to_string().contains("ghost:latest"));

    let err = Error::AlreadyExists {
        id: "vm-1".to_string(),
    };
    assert!(err.to_string().contains("vm-1"));
}

#[test]
fn step_failures_name_the_step() {
    assert!(Error::NetworkError("tap".into()).to_string().contains("network"));
    assert!(Error::RootfsError("dm".into()).to_string().contains("rootfs"));
    assert!(Error::LaunchError("fc".into()).to_string().contains("launch"));
}

#[test]
fn firecracker_errors_carry_status_and_body() {
    let err = Error::FirecrackerApi {
        status: 400,
        body: "Invalid request: drive not found".to_string(),
    };
    let text = err.to_string();
    assert!(text.contains("400"));
    assert!(text.contains("drive not found"));

    let err = Error::SocketTimeout {
        path: PathBuf::from("/tmp/firecracker-abc.sock"),
        duration: Duration::from_secs(10),
    };
    assert!(err.to_string().contains("/tmp/firecracker-abc.sock"));
}

#[test]
fn agent_errors_carry_the_attempt_budget() {
    let err = Error::AgentUnreachable {
        attempts: 30,
        reason: "connection refused".to_string(),
    };
    let text = err.to_string();
    assert!(text.contains("30"));
    assert!(text.contains("connection refused"));

    let err = Error::ContainerStartFailed {
        message: "runc run failed".to_string(),
    };
    assert!(err.to_string().contains("runc run failed"));
}

#[test]
fn io_and_serde_errors_convert_via_from() {
    let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied");
    let err: Error = io.into();
    assert!(matches!(err, Error::Io(_)));

    let bad_json = serde_json::from_str::<serde_json::Value>("{nope");
    let err: Error = bad_json.unwrap_err().into();
    assert!(matches!(err, Error::Serialization(_)));
}
