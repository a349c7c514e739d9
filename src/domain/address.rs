//! Address Value Object
//!
//! A single IP or CIDR block with the derived helpers the allocator and
//! firewall compiler need: IP version, usable host IPs, gateway,
//! containment. IPv4 blocks can be enumerated; IPv6 blocks carry a
//! prefix but are never expanded into individual addresses.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;
use thiserror::Error;

/// Address validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("Invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("Invalid CIDR notation: {0}")]
    InvalidCidr(String),

    #[error("Invalid prefix length: {0} (must be 0-32 for IPv4, 0-128 for IPv6)")]
    InvalidPrefixLength(u8),
}

/// IP address with optional CIDR prefix
///
/// Invariants:
/// - Valid IP address format
/// - Prefix length within range for the IP version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct Address {
    address: IpAddr,
    prefix_length: Option<u8>,
}

impl Address {
    /// Parse an address from `"10.42.0.0/24"` or `"10.42.0.1"` notation
    pub fn new(cidr: impl AsRef<str>) -> Result<Self, AddressError> {
        let cidr = cidr.as_ref();

        if let Some((addr_str, prefix_str)) = cidr.split_once('/') {
            let address = IpAddr::from_str(addr_str)
                .map_err(|_| AddressError::InvalidIpAddress(addr_str.to_string()))?;

            let prefix_length = prefix_str
                .parse::<u8>()
                .map_err(|_| AddressError::InvalidCidr(cidr.to_string()))?;

            let max_prefix = match address {
                IpAddr::V4(_) => 32,
                IpAddr::V6(_) => 128,
            };
            if prefix_length > max_prefix {
                return Err(AddressError::InvalidPrefixLength(prefix_length));
            }

            Ok(Self {
                address,
                prefix_length: Some(prefix_length),
            })
        } else {
            let address = IpAddr::from_str(cidr)
                .map_err(|_| AddressError::InvalidIpAddress(cidr.to_string()))?;

            Ok(Self {
                address,
                prefix_length: None,
            })
        }
    }

    /// Wrap a bare IP address
    pub fn from_ip(ip: IpAddr) -> Self {
        Self {
            address: ip,
            prefix_length: None,
        }
    }

    /// The IP part of the address
    pub fn ip(&self) -> IpAddr {
        self.address
    }

    /// The prefix length, if CIDR notation was used
    pub fn prefix_length(&self) -> Option<u8> {
        self.prefix_length
    }

    /// IP version: 4 or 6
    pub fn ip_version(&self) -> u8 {
        match self.address {
            IpAddr::V4(_) => 4,
            IpAddr::V6(_) => 6,
        }
    }

    /// Check if this is an IPv4 address
    pub fn is_ipv4(&self) -> bool {
        matches!(self.address, IpAddr::V4(_))
    }

    /// Check if this is an IPv6 address
    pub fn is_ipv6(&self) -> bool {
        matches!(self.address, IpAddr::V6(_))
    }

    fn v4_bounds(&self) -> Option<(u32, u32, u8)> {
        let IpAddr::V4(ip) = self.address else {
            return None;
        };
        let prefix = self.prefix_length.unwrap_or(32);
        let mask = if prefix == 0 { 0 } else { u32::MAX << (32 - prefix) };
        let network = u32::from(ip) & mask;
        let broadcast = network | !mask;
        Some((network, broadcast, prefix))
    }

    /// Network address of the block (IPv4 CIDR only)
    pub fn network(&self) -> Option<Ipv4Addr> {
        self.v4_bounds().map(|(network, _, _)| Ipv4Addr::from(network))
    }

    /// Broadcast address of the block (IPv4 CIDR only)
    pub fn broadcast(&self) -> Option<Ipv4Addr> {
        self.v4_bounds().map(|(_, broadcast, _)| Ipv4Addr::from(broadcast))
    }

    /// All usable host IPs in the block, in ascending order.
    ///
    /// For IPv4 this excludes the network and broadcast addresses, except
    /// for /31 and /32 where every address in the block is usable. IPv6
    /// blocks are never enumerated and yield an empty list.
    pub fn list_ips(&self) -> Vec<Ipv4Addr> {
        let Some((network, broadcast, prefix)) = self.v4_bounds() else {
            return Vec::new();
        };

        if prefix >= 31 {
            return (network..=broadcast).map(Ipv4Addr::from).collect();
        }

        (network + 1..broadcast).map(Ipv4Addr::from).collect()
    }

    /// Gateway of the block: the first usable host IP (IPv4 CIDR only)
    pub fn gateway(&self) -> Option<Ipv4Addr> {
        self.list_ips().first().copied()
    }

    /// Whether the given IP falls inside this block
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.address, ip) {
            (IpAddr::V4(_), IpAddr::V4(other)) => {
                let Some((network, broadcast, _)) = self.v4_bounds() else {
                    return false;
                };
                let other = u32::from(other);
                network <= other && other <= broadcast
            }
            (IpAddr::V6(net), IpAddr::V6(other)) => {
                let prefix = u32::from(self.prefix_length.unwrap_or(128));
                if prefix == 0 {
                    return true;
                }
                let mask = u128::MAX << (128 - prefix);
                u128::from(net) & mask == u128::from(other) & mask
            }
            _ => false,
        }
    }

    /// CIDR notation string
    pub fn to_cidr(&self) -> String {
        if let Some(prefix) = self.prefix_length {
            format!("{}/{}", self.address, prefix)
        } else {
            self.address.to_string()
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_cidr())
    }
}

impl FromStr for Address {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<Address> for String {
    fn from(address: Address) -> String {
        address.to_cidr()
    }
}

impl TryFrom<String> for Address {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<IpAddr> for Address {
    fn from(ip: IpAddr) -> Self {
        Self::from_ip(ip)
    }
}

impl From<Ipv4Addr> for Address {
    fn from(ip: Ipv4Addr) -> Self {
        Self::from_ip(IpAddr::V4(ip))
    }
}

impl From<Ipv6Addr> for Address {
    fn from(ip: Ipv6Addr) -> Self {
        Self::from_ip(IpAddr::V6(ip))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parse_cidr() {
        let addr = Address::new("10.42.0.0/24").unwrap();
        assert_eq!(addr.ip().to_string(), "10.42.0.0");
        assert_eq!(addr.prefix_length(), Some(24));
        assert_eq!(addr.ip_version(), 4);
        assert_eq!(addr.to_cidr(), "10.42.0.0/24");
    }

    #[test]
    fn parse_bare_ip() {
        let addr = Address::new("192.168.1.10").unwrap();
        assert_eq!(addr.prefix_length(), None);
        assert_eq!(addr.to_cidr(), "192.168.1.10");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Address::new("999.999.999.999").is_err());
        assert!(Address::new("10.0.0.0/33").is_err());
        assert!(Address::new("2001:db8::1/129").is_err());
        assert!(Address::new("10.0.0.0/x").is_err());
    }

    #[test]
    fn list_ips_excludes_network_and_broadcast() {
        let net = Address::new("10.42.0.0/29").unwrap();
        let ips: Vec<String> = net.list_ips().iter().map(|ip| ip.to_string()).collect();
        assert_eq!(
            ips,
            vec![
                "10.42.0.1",
                "10.42.0.2",
                "10.42.0.3",
                "10.42.0.4",
                "10.42.0.5",
                "10.42.0.6"
            ]
        );
    }

    #[test]
    fn list_ips_small_prefixes() {
        let single = Address::new("10.0.0.5/32").unwrap();
        assert_eq!(single.list_ips(), vec![Ipv4Addr::new(10, 0, 0, 5)]);

        let pair = Address::new("10.0.0.4/31").unwrap();
        assert_eq!(
            pair.list_ips(),
            vec![Ipv4Addr::new(10, 0, 0, 4), Ipv4Addr::new(10, 0, 0, 5)]
        );
    }

    #[test]
    fn ipv6_is_never_enumerated() {
        let net = Address::new("2001:db8::/64").unwrap();
        assert!(net.list_ips().is_empty());
        assert!(net.gateway().is_none());
    }

    #[test]
    fn gateway_is_first_usable() {
        let net = Address::new("10.42.0.0/24").unwrap();
        assert_eq!(net.gateway(), Some(Ipv4Addr::new(10, 42, 0, 1)));
    }

    #[test]
    fn contains_v4() {
        let net = Address::new("10.42.0.0/24").unwrap();
        assert!(net.contains("10.42.0.254".parse().unwrap()));
        assert!(!net.contains("10.43.0.1".parse().unwrap()));
    }

    #[test]
    fn contains_v6() {
        let net = Address::new("2001:db8::/32").unwrap();
        assert!(net.contains("2001:db8:1::1".parse().unwrap()));
        assert!(!net.contains("2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn serde_round_trips_as_string() {
        let addr = Address::new("10.42.0.0/24").unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"10.42.0.0/24\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }
}
