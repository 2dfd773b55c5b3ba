//! Host-side tap device and NAT/port-forward setup, driven entirely
//! through `ip`/`sysctl`/`iptables` subprocesses.

use std::process::Stdio;

use tokio::process::Command;

use crate::alloc::Slot;
use crate::{Error, Result};

/// A live network setup for one VM: tap device plus iptables rules.
#[derive(Debug, Clone)]
pub struct NetHandle {
    /// Host tap device name.
    pub tap_name: String,
    /// The assigned `/24` slot.
    pub slot: Slot,
    out_interface: String,
    published: Vec<(u16, u16)>,
}

impl NetHandle {
    /// Reconstructs a handle from its persisted fields, for tearing down a
    /// network setup whose original [`NetHandle`] was never kept in memory
    /// (e.g. reconciling a dead VM found only in the registry).
    pub fn reconstruct(tap_name: String, slot: Slot, out_interface: String, published: Vec<(u16, u16)>) -> Self {
        Self { tap_name, slot, out_interface, published }
    }

    /// The outbound host interface the MASQUERADE rule matched against.
    pub fn out_interface(&self) -> &str {
        &self.out_interface
    }

    /// The `host_port -> guest_port` pairs this handle's DNAT rules publish.
    pub fn published(&self) -> &[(u16, u16)] {
        &self.published
    }

    /// Guest IP address, for consumption by the boot-args builder and the
    /// Firecracker network-interface config.
    pub fn guest_ip(&self) -> String {
        self.slot.guest_ip()
    }

    /// Gateway IP address.
    pub fn gateway_ip(&self) -> String {
        self.slot.gateway_ip()
    }

    /// Guest MAC address.
    pub fn guest_mac(&self) -> String {
        self.slot.guest_mac()
    }
}

/// Derives an 8-character tap device name from `vm_id`.
pub fn tap_name(vm_id: &str) -> String {
    let prefix: String = vm_id.chars().take(8).collect();
    format!("tap-{prefix}")
}

/// Brings up a tap device for `slot`/`vm_id`, enables forwarding, and installs
/// MASQUERADE + per-port DNAT rules for `published` (host_port -> guest_port).
pub async fn setup(vm_id: &str, slot: Slot, published: &[(u16, u16)]) -> Result<NetHandle> {
    let tap = tap_name(vm_id);

    run("ip", &["tuntap", "add", "dev", &tap, "mode", "tap"]).await?;
    let gw = format!("{}/{}", slot.gateway_ip(), slot.prefix_len());
    if let Err(e) = run("ip", &["addr", "add", &gw, "dev", &tap]).await {
        run_best_effort("ip", &["link", "del", &tap]).await;
        return Err(e);
    }
    if let Err(e) = run("ip", &["link", "set", &tap, "up"]).await {
        run_best_effort("ip", &["link", "del", &tap]).await;
        return Err(e);
    }

    run_best_effort("sysctl", &["-w", "net.ipv4.ip_forward=1"]).await;

    let out_interface = match default_route_interface().await {
        Ok(iface) => iface,
        Err(e) => {
            run_best_effort("ip", &["link", "del", &tap]).await;
            return Err(e);
        }
    };

    let guest_ip = slot.guest_ip();
    if let Err(e) = run(
        "iptables",
        &[
            "-t", "nat", "-A", "POSTROUTING",
            "-s", &guest_ip, "-o", &out_interface, "-j", "MASQUERADE",
        ],
    )
    .await
    {
        run_best_effort("ip", &["link", "del", &tap]).await;
        return Err(e);
    }

    for &(host_port, guest_port) in published {
        let to = format!("{guest_ip}:{guest_port}");
        let host_port_s = host_port.to_string();
        if let Err(e) = run(
            "iptables",
            &[
                "-t", "nat", "-A", "PREROUTING",
                "-p", "tcp", "--dport", &host_port_s,
                "-j", "DNAT", "--to-destination", &to,
            ],
        )
        .await
        {
            teardown(&NetHandle {
                tap_name: tap.clone(),
                slot,
                out_interface: out_interface.clone(),
                published: published.to_vec(),
            })
            .await;
            return Err(e);
        }
    }

    Ok(NetHandle { tap_name: tap, slot, out_interface, published: published.to_vec() })
}

/// Removes DNAT rules, the MASQUERADE rule, and the tap device. Best-effort
/// and idempotent: a missing rule or device is not an error.
pub async fn teardown(handle: &NetHandle) {
    let guest_ip = handle.slot.guest_ip();

    for &(host_port, guest_port) in &handle.published {
        let to = format!("{guest_ip}:{guest_port}");
        let host_port_s = host_port.to_string();
        run_best_effort(
            "iptables",
            &[
                "-t", "nat", "-D", "PREROUTING",
                "-p", "tcp", "--dport", &host_port_s,
                "-j", "DNAT", "--to-destination", &to,
            ],
        )
        .await;
    }

    run_best_effort(
        "iptables",
        &[
            "-t", "nat", "-D", "POSTROUTING",
            "-s", &guest_ip, "-o", &handle.out_interface, "-j", "MASQUERADE",
        ],
    )
    .await;

    run_best_effort("ip", &["link", "del", &handle.tap_name]).await;
}

/// Parses `ip route show default` for the outbound interface name.
async fn default_route_interface() -> Result<String> {
    let out = run("ip", &["route", "show", "default"]).await?;
    out.split_whitespace()
        .zip(out.split_whitespace().skip(1))
        .find(|(tok, _)| *tok == "dev")
        .map(|(_, iface)| iface.to_owned())
        .ok_or(Error::NoDefaultRoute)
}

async fn run(program: &str, args: &[&str]) -> Result<String> {
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| Error::CommandFailed(format!("spawn {program}: {e}")))?;
    if !output.status.success() {
        return Err(Error::CommandFailed(format!(
            "{program} {}: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
}

async fn run_best_effort(program: &str, args: &[&str]) {
    if let Err(e) = run(program, args).await {
        tracing::warn!(error = %e, program, ?args, "best-effort network teardown command failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tap_name_truncates_to_eight_chars() {
        assert_eq!(tap_name("abcdefghijklmnop"), "tap-abcdefgh");
        assert_eq!(tap_name("abcdefgh"), "tap-abcdefgh");
    }

    #[test]
    fn default_route_parse_finds_dev_token() {
        let line = "default via 10.0.0.1 dev eth0 proto dhcp metric 100";
        let iface = line
            .split_whitespace()
            .zip(line.split_whitespace().skip(1))
            .find(|(tok, _)| *tok == "dev")
            .map(|(_, iface)| iface.to_owned());
        assert_eq!(iface.as_deref(), Some("eth0"));
    }
}
