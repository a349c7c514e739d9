//! Guest Entity
//!
//! A container/VM instance on a host. Network identity (private address
//! and MAC) is filled in by the create hook when not set explicitly.
//! Services are embedded and destroyed with the guest.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

use super::{valid_entity_name, GuestId, HasIssues, HostId, MacAddress, Service};
use crate::errors::{Error, Result};
use crate::state_machine::LifecycleState;

/// Parse a size string like `"10G"`, `"512M"`, `"2T"`, or plain bytes.
///
/// Suffixes are binary multiples (K/M/G/T). Case-insensitive, optional
/// trailing `B` and `iB` accepted.
pub fn parse_size_string(input: &str) -> Result<u64> {
    let trimmed = input.trim();
    let lower = trimmed.to_ascii_lowercase();
    let stripped = lower
        .strip_suffix("ib")
        .or_else(|| lower.strip_suffix('b'))
        .unwrap_or(&lower);

    let (digits, multiplier) = match stripped.chars().last() {
        Some('k') => (&stripped[..stripped.len() - 1], 1u64 << 10),
        Some('m') => (&stripped[..stripped.len() - 1], 1u64 << 20),
        Some('g') => (&stripped[..stripped.len() - 1], 1u64 << 30),
        Some('t') => (&stripped[..stripped.len() - 1], 1u64 << 40),
        _ => (stripped, 1u64),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::Validation(format!("invalid size string {input:?}")))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| Error::Validation(format!("size string {input:?} overflows")))
}

/// Guest aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Guest {
    pub id: GuestId,

    /// Owning host
    pub host_id: HostId,

    /// Unique within the host, `[a-z0-9\-_]+`
    pub name: String,

    /// Address inside the host's private network. Unique per host.
    pub private_address: Option<Ipv4Addr>,

    /// Public address NAT-mapped to the private address, if exposed
    pub external_address: Option<Ipv4Addr>,

    /// Unique within the host; generated from the host's MAC prefix
    pub mac_address: Option<MacAddress>,

    /// Additional hostnames served at the external address
    pub external_alt_names: Vec<String>,

    /// Root filesystem size in bytes
    pub root_fs_size: u64,

    /// Memory limit in bytes
    pub memory_size: u64,

    pub cpu_count: u32,

    pub deploy_state: LifecycleState,
    pub deploy_last_issue: Option<String>,

    /// Embedded services, owned by this guest
    pub services: Vec<Service>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Guest {
    pub const DEFAULT_ROOT_FS_SIZE: u64 = 10 * 1024 * 1024 * 1024;
    pub const DEFAULT_MEMORY_SIZE: u64 = 2 * 1024 * 1024 * 1024;
    pub const DEFAULT_CPU_COUNT: u32 = 2;

    /// Create a guest with validation. Network identity stays unset
    /// until the create hook allocates it.
    pub fn new(host_id: HostId, name: impl Into<String>) -> Result<Self> {
        let now = Utc::now();
        let guest = Self {
            id: GuestId::new(),
            host_id,
            name: name.into(),
            private_address: None,
            external_address: None,
            mac_address: None,
            external_alt_names: Vec::new(),
            root_fs_size: Self::DEFAULT_ROOT_FS_SIZE,
            memory_size: Self::DEFAULT_MEMORY_SIZE,
            cpu_count: Self::DEFAULT_CPU_COUNT,
            deploy_state: LifecycleState::default(),
            deploy_last_issue: None,
            services: Vec::new(),
            created_at: now,
            updated_at: now,
        };
        guest.validate_name()?;
        Ok(guest)
    }

    fn validate_name(&self) -> Result<()> {
        if !valid_entity_name(&self.name) {
            return Err(Error::Validation(format!(
                "guest name {:?} must match [a-z0-9\\-_]+",
                self.name
            )));
        }
        Ok(())
    }

    /// Validate before persisting. The create hook must have assigned
    /// the private address and MAC by this point.
    pub fn validate(&self) -> Result<()> {
        self.validate_name()?;
        if self.private_address.is_none() {
            return Err(Error::Validation(format!(
                "guest {} has no private address",
                self.name
            )));
        }
        if self.mac_address.is_none() {
            return Err(Error::Validation(format!(
                "guest {} has no mac address",
                self.name
            )));
        }
        Ok(())
    }

    /// Set memory size from a size string ("2G", "512M")
    pub fn set_memory_size(&mut self, size: &str) -> Result<()> {
        self.memory_size = parse_size_string(size)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Set root filesystem size from a size string
    pub fn set_root_fs_size(&mut self, size: &str) -> Result<()> {
        self.root_fs_size = parse_size_string(size)?;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Root of the guest's filesystem tree on the host
    pub fn base_path(&self) -> String {
        format!("/vm/{}", self.name)
    }

    /// Config directory below the guest root
    pub fn config_root_path(&self) -> String {
        format!("{}/etc", self.base_path())
    }

    /// Alt names joined for display/editing
    pub fn external_alt_names_string(&self) -> String {
        self.external_alt_names.join(",")
    }

    /// Set alt names from a comma-separated string
    pub fn set_external_alt_names_string(&mut self, value: &str) {
        self.external_alt_names = value
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();
        self.updated_at = Utc::now();
    }

    /// Whether the guest runs a service of the given kind
    pub fn has_service(&self, kind: &str) -> bool {
        self.services.iter().any(|s| s.kind.kind() == kind)
    }

    /// Services exposed at the external address
    pub fn public_services(&self) -> impl Iterator<Item = &Service> {
        self.services.iter().filter(|s| s.public_service)
    }

    /// Union of the OS components all services need, sorted and deduped
    pub fn components_needed(&self) -> Vec<&'static str> {
        let mut components: Vec<&'static str> = self
            .services
            .iter()
            .flat_map(|s| s.kind.components_needed())
            .collect();
        components.sort_unstable();
        components.dedup();
        components
    }

    /// Whether a new deploy may start
    pub fn deployable(&self) -> bool {
        self.deploy_state.is_deployable()
    }
}

impl HasIssues for Guest {
    fn last_issue(&self) -> Option<&str> {
        self.deploy_last_issue.as_deref()
    }

    fn set_last_issue(&mut self, issue: Option<String>) {
        self.deploy_last_issue = issue;
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ServiceKind;
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn guest() -> Guest {
        Guest::new(HostId::new(), "g1").unwrap()
    }

    #[test]
    fn defaults() {
        let guest = guest();
        assert_eq!(guest.root_fs_size, 10_737_418_240);
        assert_eq!(guest.memory_size, 2_147_483_648);
        assert_eq!(guest.cpu_count, 2);
        assert_eq!(guest.deploy_state, LifecycleState::NotStarted);
        assert_eq!(guest.base_path(), "/vm/g1");
        assert_eq!(guest.config_root_path(), "/vm/g1/etc");
    }

    #[test]
    fn validate_requires_network_identity() {
        let mut guest = guest();
        assert!(guest.validate().is_err());
        guest.private_address = Some(Ipv4Addr::new(10, 42, 0, 23));
        assert!(guest.validate().is_err());
        guest.mac_address = Some(MacAddress::new("00:16:3e:00:01:01").unwrap());
        assert!(guest.validate().is_ok());
    }

    #[test_case("2G", 2_147_483_648)]
    #[test_case("512M", 536_870_912)]
    #[test_case("1T", 1_099_511_627_776)]
    #[test_case("10k", 10_240)]
    #[test_case("4GiB", 4_294_967_296)]
    #[test_case("1024", 1024)]
    fn size_strings(input: &str, expected: u64) {
        assert_eq!(parse_size_string(input).unwrap(), expected);
    }

    #[test]
    fn size_string_rejects_garbage() {
        assert!(parse_size_string("ten gigs").is_err());
        assert!(parse_size_string("").is_err());
    }

    #[test]
    fn set_memory_size_from_string() {
        let mut guest = guest();
        guest.set_memory_size("4G").unwrap();
        assert_eq!(guest.memory_size, 4_294_967_296);
    }

    #[test]
    fn alt_names_round_trip() {
        let mut guest = guest();
        guest.set_external_alt_names_string("www.example.com, example.com");
        assert_eq!(
            guest.external_alt_names,
            vec!["www.example.com", "example.com"]
        );
        assert_eq!(
            guest.external_alt_names_string(),
            "www.example.com,example.com"
        );
    }

    #[test]
    fn components_needed_union() {
        let mut guest = guest();
        guest.services.push(Service::new(
            "web",
            ServiceKind::Nginx {
                port: 80,
                ssl_port: 443,
                ssl_supported: true,
            },
        ));
        guest
            .services
            .push(Service::new("db", ServiceKind::Mongodb { port: 27017 }));
        guest
            .services
            .push(Service::new("search", ServiceKind::Solr { port: 8983 }));

        assert_eq!(
            guest.components_needed(),
            vec!["java", "mongodb", "nginx", "ruby", "solr"]
        );
        assert!(guest.has_service("mongodb"));
        assert!(!guest.has_service("redis"));
    }
}
