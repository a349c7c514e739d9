//! MAC Address Value Objects
//!
//! Guest MAC addresses follow the fixed wire format
//! `00:16:3e:PP:PP:CC` - the Xen/KVM OUI, a 2-byte per-host prefix, and
//! a 1-byte guest counter. Prefix and counter render as uppercase hex
//! pairs; the OUI stays lowercase. The format is a storage contract.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Vendor prefix used for all generated guest MAC addresses
pub const MAC_OUI: [u8; 3] = [0x00, 0x16, 0x3e];

/// MAC validation error
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MacError {
    #[error("Invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("Invalid MAC prefix format: {0}")]
    InvalidMacPrefix(String),
}

fn parse_hex_octets(input: &str, expected: usize) -> Option<Vec<u8>> {
    let clean = input.replace([':', '-'], "");
    if clean.len() != expected * 2 {
        return None;
    }
    clean
        .as_bytes()
        .chunks(2)
        .map(|chunk| {
            std::str::from_utf8(chunk)
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        })
        .collect()
}

/// 2-byte per-host MAC prefix, globally unique across hosts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MacPrefix([u8; 2]);

impl MacPrefix {
    /// Parse from `"00:0A"` (colons and dashes optional, any case)
    pub fn new(prefix: impl AsRef<str>) -> Result<Self, MacError> {
        let prefix = prefix.as_ref();
        let octets = parse_hex_octets(prefix, 2)
            .ok_or_else(|| MacError::InvalidMacPrefix(prefix.to_string()))?;
        Ok(Self([octets[0], octets[1]]))
    }

    /// Prefix as a 16-bit counter value
    pub fn value(&self) -> u16 {
        u16::from_be_bytes(self.0)
    }

    /// Prefix from a 16-bit counter value
    pub fn from_value(value: u16) -> Self {
        Self(value.to_be_bytes())
    }

    /// The two prefix octets
    pub fn octets(&self) -> [u8; 2] {
        self.0
    }
}

impl fmt::Display for MacPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02X}:{:02X}", self.0[0], self.0[1])
    }
}

impl FromStr for MacPrefix {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<MacPrefix> for String {
    fn from(prefix: MacPrefix) -> String {
        prefix.to_string()
    }
}

impl TryFrom<String> for MacPrefix {
    type Error = MacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

/// 48-bit MAC address, unique per guest within its host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Parse with validation (colons and dashes optional, any case)
    pub fn new(mac: impl AsRef<str>) -> Result<Self, MacError> {
        let mac = mac.as_ref();
        let octets =
            parse_hex_octets(mac, 6).ok_or_else(|| MacError::InvalidMacAddress(mac.to_string()))?;
        let mut array = [0u8; 6];
        array.copy_from_slice(&octets);
        Ok(Self(array))
    }

    /// Build a guest MAC from the host prefix and a 1-byte counter
    pub fn for_guest(prefix: MacPrefix, counter: u8) -> Self {
        let [p0, p1] = prefix.octets();
        Self([MAC_OUI[0], MAC_OUI[1], MAC_OUI[2], p0, p1, counter])
    }

    /// The six octets
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // OUI renders lowercase, host prefix and counter uppercase
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02X}:{:02X}:{:02X}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = MacError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

impl TryFrom<String> for MacAddress {
    type Error = MacError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn guest_mac_wire_format() {
        let prefix = MacPrefix::new("00:0A").unwrap();
        let mac = MacAddress::for_guest(prefix, 1);
        assert_eq!(mac.to_string(), "00:16:3e:00:0A:01");

        let mac = MacAddress::for_guest(prefix, 0xfe);
        assert_eq!(mac.to_string(), "00:16:3e:00:0A:FE");
    }

    #[test]
    fn prefix_format_and_value() {
        let prefix = MacPrefix::from_value(0x00ab);
        assert_eq!(prefix.to_string(), "00:AB");
        assert_eq!(prefix.value(), 0x00ab);
        assert_eq!(MacPrefix::new("00:ab").unwrap(), prefix);
    }

    #[test]
    fn parse_accepts_separators_and_case() {
        assert!(MacAddress::new("00:16:3e:00:0a:01").is_ok());
        assert!(MacAddress::new("00-16-3E-00-0A-01").is_ok());
        assert!(MacAddress::new("00163e000a01").is_ok());
        assert!(MacAddress::new("00:16:3e:00:0a").is_err());
        assert!(MacAddress::new("zz:16:3e:00:0a:01").is_err());
    }

    #[test]
    fn parsed_equals_generated() {
        let prefix = MacPrefix::new("1f:2e").unwrap();
        let generated = MacAddress::for_guest(prefix, 3);
        let parsed = MacAddress::new("00:16:3E:1F:2E:03").unwrap();
        assert_eq!(generated, parsed);
    }
}
