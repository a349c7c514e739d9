//! Host Entity
//!
//! A physical machine hosting guests. The host exclusively owns its
//! address list and its private network block; every guest of the host
//! draws its private address from that block.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;

use super::{valid_entity_name, Address, HasIssues, HostId, MacPrefix};
use crate::errors::{Error, Result};
use crate::state_machine::LifecycleState;

/// Rollout stage of a host. Persists as a sparse byte code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum Stage {
    Pending,
    Testing,
    Staging,
    Production,
}

impl Stage {
    pub fn code(self) -> u8 {
        match self {
            Stage::Pending => 0x00,
            Stage::Testing => 0x10,
            Stage::Staging => 0x30,
            Stage::Production => 0x40,
        }
    }

    pub fn from_code(code: u8) -> Result<Self> {
        match code {
            0x00 => Ok(Stage::Pending),
            0x10 => Ok(Stage::Testing),
            0x30 => Ok(Stage::Staging),
            0x40 => Ok(Stage::Production),
            _ => Err(Error::Validation(format!("unknown stage code {code:#04x}"))),
        }
    }
}

impl Default for Stage {
    fn default() -> Self {
        Stage::Pending
    }
}

impl From<Stage> for u8 {
    fn from(stage: Stage) -> u8 {
        stage.code()
    }
}

impl TryFrom<u8> for Stage {
    type Error = Error;

    fn try_from(code: u8) -> Result<Self> {
        Self::from_code(code)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Pending => "pending",
            Stage::Testing => "testing",
            Stage::Staging => "staging",
            Stage::Production => "production",
        };
        write!(f, "{name}")
    }
}

/// Host aggregate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    pub id: HostId,

    /// Unique host name, `[a-z0-9\-_]+`
    pub name: String,

    /// CPU architecture of the host, decides which templates fit
    pub arch: String,

    pub stage: Stage,

    /// Public-facing address used for SSH and host services
    pub primary_address: Address,

    /// CIDR block dedicated to this host's guests
    pub private_network: Address,

    /// Additional address blocks bound to the host's external interfaces
    pub addresses: Vec<Address>,

    /// 2-byte MAC prefix, globally unique across hosts. Filled by the
    /// create hook when absent.
    pub mac_address_prefix: Option<MacPrefix>,

    /// Root password for the very first connect, before keys are rolled
    /// out. Cleared after initial deploy.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub initial_root_pw: Option<String>,

    /// Detected CPU count; negative means not probed yet
    pub cpu_count: i64,

    pub build_state: LifecycleState,
    pub build_last_issue: Option<String>,

    pub deploy_state: LifecycleState,
    pub deploy_last_issue: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Host {
    /// Create a host with validation
    pub fn new(
        name: impl Into<String>,
        primary_address: Address,
        private_network: Address,
    ) -> Result<Self> {
        let now = Utc::now();
        let host = Self {
            id: HostId::new(),
            name: name.into(),
            arch: "amd64".to_string(),
            stage: Stage::default(),
            primary_address,
            private_network,
            addresses: Vec::new(),
            mac_address_prefix: None,
            initial_root_pw: None,
            cpu_count: -1,
            build_state: LifecycleState::default(),
            build_last_issue: None,
            deploy_state: LifecycleState::default(),
            deploy_last_issue: None,
            created_at: now,
            updated_at: now,
        };
        host.validate_name()?;
        Ok(host)
    }

    fn validate_name(&self) -> Result<()> {
        if !valid_entity_name(&self.name) {
            return Err(Error::Validation(format!(
                "host name {:?} must match [a-z0-9\\-_]+",
                self.name
            )));
        }
        Ok(())
    }

    /// Validate before persisting. The create hook must have assigned a
    /// MAC prefix by this point.
    pub fn validate(&self) -> Result<()> {
        self.validate_name()?;
        if self.private_network.gateway().is_none() {
            return Err(Error::Validation(format!(
                "private network {} has no usable addresses",
                self.private_network
            )));
        }
        if self.mac_address_prefix.is_none() {
            return Err(Error::Validation(
                "host has no mac address prefix".to_string(),
            ));
        }
        Ok(())
    }

    /// The host's own address inside the private network (first usable
    /// IP, also the guests' gateway)
    pub fn private_address(&self) -> Option<Ipv4Addr> {
        self.private_network.gateway()
    }

    /// Name prefixed with the rollout stage, for operator listings
    pub fn name_with_stage(&self) -> String {
        format!("[{}] {}", self.stage, self.name)
    }

    /// Whether a new deploy may start
    pub fn deployable(&self) -> bool {
        self.deploy_state.is_deployable()
    }

    /// Whether a new build may start
    pub fn buildable(&self) -> bool {
        self.build_state.is_deployable()
    }
}

impl HasIssues for Host {
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
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    fn host() -> Host {
        Host::new(
            "h1",
            Address::new("198.51.100.10").unwrap(),
            Address::new("10.42.0.0/24").unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn new_host_defaults() {
        let host = host();
        assert_eq!(host.arch, "amd64");
        assert_eq!(host.stage, Stage::Pending);
        assert_eq!(host.deploy_state, LifecycleState::NotStarted);
        assert_eq!(host.cpu_count, -1);
        assert!(host.deployable());
    }

    #[test]
    fn name_format_is_enforced() {
        let result = Host::new(
            "Bad Name",
            Address::new("198.51.100.10").unwrap(),
            Address::new("10.42.0.0/24").unwrap(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn validate_requires_mac_prefix() {
        let mut host = host();
        assert!(host.validate().is_err());
        host.mac_address_prefix = Some(MacPrefix::new("00:01").unwrap());
        assert!(host.validate().is_ok());
    }

    #[test]
    fn private_address_is_gateway() {
        assert_eq!(
            host().private_address(),
            Some(Ipv4Addr::new(10, 42, 0, 1))
        );
    }

    #[test]
    fn name_with_stage() {
        let mut host = host();
        host.stage = Stage::Production;
        assert_eq!(host.name_with_stage(), "[production] h1");
    }

    #[test_case(0x00, Stage::Pending)]
    #[test_case(0x10, Stage::Testing)]
    #[test_case(0x30, Stage::Staging)]
    #[test_case(0x40, Stage::Production)]
    fn stage_codes(code: u8, stage: Stage) {
        assert_eq!(Stage::from_code(code).unwrap(), stage);
        assert_eq!(stage.code(), code);
    }

    #[test]
    fn stage_unknown_code_is_error() {
        assert!(Stage::from_code(0x20).is_err());
    }
}
