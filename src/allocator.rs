//! Address Allocator
//!
//! Computes next free private/external IPs and collision-free MAC
//! addresses. All functions are pure read-then-pick over the host and
//! its sibling collections: the document store enforces uniqueness at
//! write time, so a conflict on commit is an expected, retryable
//! condition, not a bug here.
//!
//! Free-address picks take the *last* element of the ascending candidate
//! list, i.e. the highest-valued free address. Callers needing a
//! specific address set it explicitly and bypass allocation.

use std::collections::HashSet;
use std::net::Ipv4Addr;

use crate::domain::{Guest, GuestId, Host, HostId, MacAddress, MacPrefix};
use crate::errors::{Error, Result};

/// All free private addresses for new guests on this host, ascending:
/// the usable IPs of the host's private network minus the gateway and
/// the addresses already assigned to the host's guests.
pub fn available_private_addresses(host: &Host, guests: &[Guest]) -> Vec<Ipv4Addr> {
    let gateway = host.private_network.gateway();
    let used: HashSet<Ipv4Addr> = guests
        .iter()
        .filter(|g| g.host_id == host.id)
        .filter_map(|g| g.private_address)
        .collect();

    host.private_network
        .list_ips()
        .into_iter()
        .filter(|ip| Some(*ip) != gateway && !used.contains(ip))
        .collect()
}

/// Next private address to assign: the highest-valued free one
pub fn next_private_address(host: &Host, guests: &[Guest]) -> Option<Ipv4Addr> {
    available_private_addresses(host, guests).last().copied()
}

/// All free external addresses on this host, ascending: every IPv4
/// address bound to the host's external interfaces minus the external
/// addresses already assigned to guests.
pub fn available_external_addresses(host: &Host, guests: &[Guest]) -> Vec<Ipv4Addr> {
    let used: HashSet<Ipv4Addr> = guests
        .iter()
        .filter(|g| g.host_id == host.id)
        .filter_map(|g| g.external_address)
        .collect();

    host.addresses
        .iter()
        .filter(|a| a.is_ipv4())
        .flat_map(|a| a.list_ips())
        .filter(|ip| !used.contains(ip))
        .collect()
}

/// Next external address to assign: the highest-valued free one
pub fn next_external_address(host: &Host, guests: &[Guest]) -> Option<Ipv4Addr> {
    available_external_addresses(host, guests).last().copied()
}

/// Generate a MAC address for a guest on `host`: fixed OUI, the host's
/// 2-byte prefix, and a 1-byte counter starting at 1, incremented past
/// addresses other guests already hold. `exclude` skips the guest being
/// (re)allocated so it can keep its own address.
///
/// Exhausting the counter byte is a hard allocation failure.
pub fn generate_mac_address(
    host: &Host,
    guests: &[Guest],
    exclude: Option<GuestId>,
) -> Result<MacAddress> {
    let prefix = host
        .mac_address_prefix
        .ok_or_else(|| Error::Validation(format!("host {} has no mac prefix", host.name)))?;

    let used: HashSet<MacAddress> = guests
        .iter()
        .filter(|g| g.host_id == host.id && Some(g.id) != exclude)
        .filter_map(|g| g.mac_address)
        .collect();

    for counter in 1..=u8::MAX {
        let candidate = MacAddress::for_guest(prefix, counter);
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
    }

    Err(Error::AllocationExhausted(format!(
        "no free MAC address left under prefix {prefix} on host {}",
        host.name
    )))
}

/// Generate a globally unique 2-byte MAC prefix for a host, scanning
/// upward from the configured starting prefix past prefixes other hosts
/// already hold.
///
/// Exhausting the 16-bit range is a hard allocation failure.
pub fn generate_mac_prefix(
    start: MacPrefix,
    hosts: &[Host],
    exclude: Option<HostId>,
) -> Result<MacPrefix> {
    let used: HashSet<MacPrefix> = hosts
        .iter()
        .filter(|h| Some(h.id) != exclude)
        .filter_map(|h| h.mac_address_prefix)
        .collect();

    let mut value = u32::from(start.value());
    while value < 1 << 16 {
        let candidate = MacPrefix::from_value(value as u16);
        if !used.contains(&candidate) {
            return Ok(candidate);
        }
        value += 1;
    }

    Err(Error::AllocationExhausted(
        "no free MAC prefix left in the 16-bit range".to_string(),
    ))
}
