//! Address Resolution
//!
//! ip→name records maintained by operators, backing reverse-hostname
//! lookups without a live DNS query at call time.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

use super::Address;
use crate::errors::{Error, Result};

/// A single ip→name resolution record. The ip is unique in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressResolution {
    pub id: Uuid,
    pub ip: IpAddr,
    pub name: String,
    /// Whether forward resolution (name → ip) should be served
    pub active: bool,
    /// Whether the reverse (PTR) record should be served
    pub ptr_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AddressResolution {
    /// Create a record with name format validation
    pub fn new(ip: IpAddr, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        if !valid_fqdn(&name) {
            return Err(Error::Validation(format!(
                "resolution name {name:?} is not a valid hostname"
            )));
        }
        let now = Utc::now();
        Ok(Self {
            id: Uuid::now_v7(),
            ip,
            name,
            active: false,
            ptr_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// The record's address as a value object
    pub fn address(&self) -> Address {
        Address::from_ip(self.ip)
    }
}

/// `([\w-]+\.)*[\w\-]+\.\w{2,10}` - dotted labels with a 2-10 character
/// alphanumeric TLD
fn valid_fqdn(name: &str) -> bool {
    let labels: Vec<&str> = name.split('.').collect();
    if labels.len() < 2 {
        return false;
    }
    let tld = labels[labels.len() - 1];
    if tld.len() < 2 || tld.len() > 10 || !tld.chars().all(|c| c.is_alphanumeric() || c == '_') {
        return false;
    }
    labels[..labels.len() - 1].iter().all(|label| {
        !label.is_empty()
            && label
                .chars()
                .all(|c| c.is_alphanumeric() || c == '_' || c == '-')
    })
}
