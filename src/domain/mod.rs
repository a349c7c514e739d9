//! Domain entities and value objects
//!
//! Hosts own guests; guests own services. Addresses and services are
//! embedded in their parent aggregate and die with it. Entities validate
//! their invariants at construction and before every persist.

pub mod address;
pub mod guest;
pub mod host;
pub mod host_template;
pub mod mac;
pub mod resolution;
pub mod service;

pub use address::{Address, AddressError};
pub use guest::{parse_size_string, Guest};
pub use host::{Host, Stage};
pub use host_template::HostTemplate;
pub use mac::{MacAddress, MacError, MacPrefix, MAC_OUI};
pub use resolution::AddressResolution;
pub use service::{Service, ServiceKind};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            pub fn as_uuid(&self) -> Uuid {
                self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(Uuid::from_str(s)?))
            }
        }
    };
}

entity_id!(
    /// Host aggregate id
    HostId
);
entity_id!(
    /// Guest aggregate id
    GuestId
);
entity_id!(
    /// Host template aggregate id
    TemplateId
);

/// Uniform access to the issue text recorded by the last failed run
pub trait HasIssues {
    fn last_issue(&self) -> Option<&str>;
    fn set_last_issue(&mut self, issue: Option<String>);
}

/// Validate the `[a-z0-9\-_]+` entity name format shared by hosts and
/// guests
pub(crate) fn valid_entity_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}
