//! Per-VM network provisioning for `micropod`.
//!
//! Each VM gets a `172.18.i.0/24` slot, a tap device, a MASQUERADE rule for
//! outbound traffic, and a DNAT rule per published port.

mod alloc;
mod portmap;
mod setup;

use std::collections::HashSet;

pub use alloc::Slot;
pub use portmap::parse_port_mappings;
pub use setup::NetHandle;

/// Result type for network provisioning operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors from network provisioning.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// All 254 `/24` slots are in use.
    #[error("network slots exhausted")]
    NetworkExhausted,

    /// A `host:guest` port-publish spec was malformed.
    #[error("invalid port mapping: {0}")]
    InvalidPortMapping(String),

    /// The host has no default route, so the outbound interface for
    /// MASQUERADE could not be determined.
    #[error("no default route found on host")]
    NoDefaultRoute,

    /// An external tool (`ip`, `iptables`, `sysctl`) failed.
    #[error("command failed: {0}")]
    CommandFailed(String),
}

/// Allocates a slot and brings up the tap device + NAT rules for `vm_id`.
///
/// `taken` is the set of slot indices already assigned to other live VMs,
/// per the registry; `published` are the parsed `host:guest` pairs.
pub async fn provision(
    vm_id: &str,
    taken: &HashSet<u16>,
    published: &[(u16, u16)],
) -> Result<NetHandle> {
    let slot = alloc::allocate(vm_id, taken)?;
    setup::setup(vm_id, slot, published).await
}

/// Tears down a previously provisioned network setup. Best-effort and
/// idempotent.
pub async fn teardown(handle: &NetHandle) {
    setup::teardown(handle).await;
}
