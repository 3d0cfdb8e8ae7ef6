//! Per-VM host network provisioning.
//!
//! Each VM gets a tap device, a point-to-point /24, NAT for outbound
//! traffic, and optional TCP port publishing. Allocation is deterministic
//! from the VM id: a stable hash picks an index `i` in `[1, 254]`, the guest
//! is `172.18.i.2/24`, the gateway `172.18.i.1/24`, and the MAC is a
//! locally-administered address derived from `i`. The tap name is
//! `tap-<id[:8]>`.
//!
//! Setup mutates the host with `ip`, `sysctl`, and `iptables`; teardown
//! mirrors every rule and device best-effort, so repeating it (or tearing
//! down a half-built config) is not an error.

use crate::constants::{GUEST_MAC_PREFIX, SUBNET_BASE, TAP_DEVICE_PREFIX};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Command;
use tracing::{debug, info, warn};

/// Network allocation for one VM, persisted inside its registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// Owning VM id.
    pub vm_id: String,
    /// Tap device name on the host.
    pub tap_device: String,
    /// Guest IPv4 address.
    pub guest_ip: String,
    /// Gateway IPv4 address (assigned to the tap device).
    pub gateway_ip: String,
    /// Prefix length of the point-to-point subnet.
    pub mask: String,
    /// Guest MAC address.
    pub guest_mac: String,
    /// Published ports, host port to guest port.
    pub port_mappings: BTreeMap<u16, u16>,
}

impl NetworkConfig {
    /// Computes the deterministic allocation for a VM id without touching
    /// the host.
    pub fn allocate(vm_id: &str, port_mappings: &[String]) -> Result<Self> {
        let index = hash_vm_id(vm_id) + 1;
        let short = &vm_id[..vm_id.len().min(8)];
        Ok(Self {
            vm_id: vm_id.to_string(),
            tap_device: format!("{TAP_DEVICE_PREFIX}{short}"),
            guest_ip: format!("{SUBNET_BASE}.{index}.2"),
            gateway_ip: format!("{SUBNET_BASE}.{index}.1"),
            mask: "24".to_string(),
            guest_mac: format!("{GUEST_MAC_PREFIX}:{index:02x}:{index:02x}"),
            port_mappings: parse_port_mappings(port_mappings)?,
        })
    }

    /// Kernel boot argument handing the guest its static address,
    /// e.g. `ip=172.18.7.2::172.18.7.1:255.255.255.0::eth0:none`.
    pub fn ip_boot_arg(&self) -> String {
        format!(
            "ip={}::{}:255.255.255.0::eth0:none",
            self.guest_ip, self.gateway_ip
        )
    }
}

/// Parses `host:guest` publish specifications into a map.
///
/// Anything that is not exactly two `:`-separated u16 values is rejected
/// with [`Error::InvalidPortMapping`]. Duplicate host ports collapse to the
/// last definition.
pub fn parse_port_mappings(mappings: &[String]) -> Result<BTreeMap<u16, u16>> {
    let mut result = BTreeMap::new();
    for mapping in mappings {
        let mut parts = mapping.split(':');
        let (host, guest) = match (parts.next(), parts.next(), parts.next()) {
            (Some(host), Some(guest), None) => (host, guest),
            _ => return Err(Error::InvalidPortMapping(mapping.clone())),
        };
        let host: u16 = host
            .parse()
            .map_err(|_| Error::InvalidPortMapping(mapping.clone()))?;
        let guest: u16 = guest
            .parse()
            .map_err(|_| Error::InvalidPortMapping(mapping.clone()))?;
        result.insert(host, guest);
    }
    Ok(result)
}

/// Stable hash of a VM id, confined to `[0, 253]`.
///
/// Deterministic so a record's addressing can be rederived from its id
/// alone. Collides once more than 254 VMs share a host, which is beyond
/// the single-host scale this allocator targets.
pub fn hash_vm_id(vm_id: &str) -> u32 {
    let mut hash: u32 = 0;
    for ch in vm_id.chars() {
        hash = (hash.wrapping_mul(31).wrapping_add(ch as u32)) % 254;
    }
    hash
}

/// Creates the tap device, addressing, and NAT rules for a VM.
///
/// On failure every resource acquired so far is released before the error
/// is returned, so a failed setup leaves the host untouched.
pub fn setup(vm_id: &str, port_mappings: &[String]) -> Result<NetworkConfig> {
    let config = NetworkConfig::allocate(vm_id, port_mappings)?;
    info!(
        vm_id,
        tap = %config.tap_device,
        guest_ip = %config.guest_ip,
        "setting up VM network"
    );

    create_tap_device(&config)?;

    if let Err(e) = setup_iptables(&config) {
        remove_tap_device(&config.tap_device);
        return Err(e);
    }

    Ok(config)
}

/// Removes the NAT rules and tap device for a VM.
///
/// Every step is best-effort and idempotent: a missing rule or device is
/// logged and skipped.
pub fn teardown(config: &NetworkConfig) {
    debug!(vm_id = %config.vm_id, tap = %config.tap_device, "tearing down VM network");

    if let Ok(iface) = default_interface() {
        run_quiet(&[
            "iptables", "-t", "nat", "-D", "POSTROUTING", "-s", &config.guest_ip, "-o", &iface,
            "-j", "MASQUERADE",
        ]);
    }

    for (host_port, guest_port) in &config.port_mappings {
        let dport = host_port.to_string();
        let dest = format!("{}:{}", config.guest_ip, guest_port);
        run_quiet(&[
            "iptables", "-t", "nat", "-D", "PREROUTING", "-p", "tcp", "--dport", &dport, "-j",
            "DNAT", "--to-destination", &dest,
        ]);
    }

    remove_tap_device(&config.tap_device);
}

fn create_tap_device(config: &NetworkConfig) -> Result<()> {
    let addr = format!("{}/{}", config.gateway_ip, config.mask);
    run(&["ip", "tuntap", "add", "dev", &config.tap_device, "mode", "tap"])?;
    run(&["ip", "addr", "add", &addr, "dev", &config.tap_device])?;
    run(&["ip", "link", "set", &config.tap_device, "up"])?;
    Ok(())
}

fn remove_tap_device(tap: &str) {
    // The device may already be gone.
    run_quiet(&["ip", "link", "delete", tap]);
}

fn setup_iptables(config: &NetworkConfig) -> Result<()> {
    run(&["sysctl", "-w", "net.ipv4.ip_forward=1"])?;

    let iface = default_interface()?;
    run(&[
        "iptables", "-t", "nat", "-A", "POSTROUTING", "-s", &config.guest_ip, "-o", &iface, "-j",
        "MASQUERADE",
    ])?;

    for (host_port, guest_port) in &config.port_mappings {
        let dport = host_port.to_string();
        let dest = format!("{}:{}", config.guest_ip, guest_port);
        run(&[
            "iptables", "-t", "nat", "-A", "PREROUTING", "-p", "tcp", "--dport", &dport, "-j",
            "DNAT", "--to-destination", &dest,
        ])?;
    }

    Ok(())
}

/// Discovers the default outbound interface by parsing the default route,
/// e.g. `default via 192.168.1.1 dev eth0 proto dhcp metric 100`.
fn default_interface() -> Result<String> {
    let output = run(&["ip", "route", "show", "default"])?;
    let mut fields = output.split_whitespace();
    while let Some(field) = fields.next() {
        if field == "dev" {
            if let Some(iface) = fields.next() {
                return Ok(iface.to_string());
            }
        }
    }
    Err(Error::NetworkError(
        "could not determine default interface".to_string(),
    ))
}

/// Runs a host command, failing with the captured stderr on non-zero exit.
fn run(argv: &[&str]) -> Result<String> {
    let output = Command::new(argv[0])
        .args(&argv[1..])
        .output()
        .map_err(|e| Error::NetworkError(format!("failed to execute {argv:?}: {e}")))?;
    if !output.status.success() {
        return Err(Error::NetworkError(format!(
            "{argv:?} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Runs a host command ignoring failure; used on teardown paths.
fn run_quiet(argv: &[&str]) {
    match Command::new(argv[0]).args(&argv[1..]).output() {
        Ok(output) if !output.status.success() => {
            debug!(
                cmd = ?argv,
                stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                "cleanup command failed (ignored)"
            );
        }
        Err(e) => warn!(cmd = ?argv, error = %e, "cleanup command could not run"),
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_accepts_host_guest_pairs() {
        let map =
            parse_port_mappings(&["8080:80".to_string(), "443:443".to_string()]).unwrap();
        assert_eq!(map.get(&8080), Some(&80));
        assert_eq!(map.get(&443), Some(&443));
    }

    #[test]
    fn parse_rejects_malformed_specs() {
        for bad in ["8080", "abc:80", "8080:def", "8080:80:90", "", ":", "65536:80"] {
            let result = parse_port_mappings(&[bad.to_string()]);
            assert!(
                matches!(result, Err(Error::InvalidPortMapping(_))),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn duplicate_host_ports_collapse_to_last() {
        let map =
            parse_port_mappings(&["8080:80".to_string(), "8080:90".to_string()]).unwrap();
        assert_eq!(map.get(&8080), Some(&90));
        assert_eq!(map.len(), 1);
    }

    #[test]
    fn hash_is_deterministic_and_bounded() {
        for id in ["", "vm-1", "vm-2", "0192d4f0-aaaa-bbbb-cccc-ddddeeeeffff"] {
            let a = hash_vm_id(id);
            let b = hash_vm_id(id);
            assert_eq!(a, b);
            assert!(a <= 253, "hash {a} out of range for {id:?}");
        }
    }

    #[test]
    fn allocation_shapes_addresses() {
        let config = NetworkConfig::allocate("vm-12345678", &[]).unwrap();
        assert_eq!(config.tap_device, "tap-vm-12345");
        assert!(config.guest_ip.starts_with("172.18."));
        assert!(config.guest_ip.ends_with(".2"));
        assert!(config.gateway_ip.ends_with(".1"));
        assert_eq!(config.mask, "24");
        assert!(config.guest_mac.starts_with("02:FC:00:00:"));
    }

    #[test]
    fn guest_and_gateway_share_a_subnet() {
        let config = NetworkConfig::allocate("vm-abcdef", &[]).unwrap();
        let guest_net: Vec<&str> = config.guest_ip.rsplitn(2, '.').collect();
        let gw_net: Vec<&str> = config.gateway_ip.rsplitn(2, '.').collect();
        assert_eq!(guest_net[1], gw_net[1]);
    }

    #[test]
    fn ip_boot_arg_names_eth0() {
        let config = NetworkConfig::allocate("vm-1", &[]).unwrap();
        let arg = config.ip_boot_arg();
        assert!(arg.starts_with("ip="));
        assert!(arg.contains(&config.guest_ip));
        assert!(arg.contains(&config.gateway_ip));
        assert!(arg.ends_with(":eth0:none"));
    }
}
