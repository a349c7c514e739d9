//! Guest Services
//!
//! Services are owned by their guest and destroyed with it. Every kind
//! shares one capability surface - `kind`, `used_ports`,
//! `components_needed`, `backupable` - dispatched over the variant tag.
//! The firewall compiler exposes `public_service` entries at the guest's
//! external address.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Service variant with per-kind configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServiceKind {
    Ssh {
        port: u16,
    },
    Nginx {
        port: u16,
        ssl_port: u16,
        ssl_supported: bool,
    },
    Mongodb {
        port: u16,
    },
    Redis {
        port: u16,
    },
    Solr {
        port: u16,
    },
    Tomcat {
        port: u16,
    },
    Backup,
    Monitoring,
}

impl ServiceKind {
    /// Protocol keyword used in firewall rules and job parameters
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceKind::Ssh { .. } => "ssh",
            ServiceKind::Nginx { .. } => "nginx",
            ServiceKind::Mongodb { .. } => "mongodb",
            ServiceKind::Redis { .. } => "redis",
            ServiceKind::Solr { .. } => "solr",
            ServiceKind::Tomcat { .. } => "tomcat",
            ServiceKind::Backup => "backup",
            ServiceKind::Monitoring => "monitoring",
        }
    }

    /// Ports the service listens on
    pub fn used_ports(&self) -> Vec<u16> {
        match self {
            ServiceKind::Ssh { port }
            | ServiceKind::Mongodb { port }
            | ServiceKind::Redis { port }
            | ServiceKind::Solr { port }
            | ServiceKind::Tomcat { port } => vec![*port],
            ServiceKind::Nginx {
                port,
                ssl_port,
                ssl_supported,
            } => {
                if *ssl_supported {
                    vec![*port, *ssl_port]
                } else {
                    vec![*port]
                }
            }
            ServiceKind::Backup | ServiceKind::Monitoring => Vec::new(),
        }
    }

    /// The primary (non-SSL) port, if the service has one
    pub fn port(&self) -> Option<u16> {
        match self {
            ServiceKind::Ssh { port }
            | ServiceKind::Nginx { port, .. }
            | ServiceKind::Mongodb { port }
            | ServiceKind::Redis { port }
            | ServiceKind::Solr { port }
            | ServiceKind::Tomcat { port } => Some(*port),
            ServiceKind::Backup | ServiceKind::Monitoring => None,
        }
    }

    /// SSL port when the service supports SSL
    pub fn ssl_port(&self) -> Option<u16> {
        match self {
            ServiceKind::Nginx {
                ssl_port,
                ssl_supported: true,
                ..
            } => Some(*ssl_port),
            _ => None,
        }
    }

    /// OS packages the guest image needs for this service
    pub fn components_needed(&self) -> Vec<&'static str> {
        match self {
            ServiceKind::Ssh { .. } => vec![],
            ServiceKind::Nginx { .. } => vec!["nginx", "ruby"],
            ServiceKind::Mongodb { .. } => vec!["mongodb"],
            ServiceKind::Redis { .. } => vec!["redis"],
            ServiceKind::Solr { .. } => vec!["java", "solr"],
            ServiceKind::Tomcat { .. } => vec!["java", "tomcat"],
            ServiceKind::Backup | ServiceKind::Monitoring => vec![],
        }
    }

    /// Whether this kind can produce backups
    pub fn backupable(&self) -> bool {
        matches!(
            self,
            ServiceKind::Mongodb { .. } | ServiceKind::Redis { .. } | ServiceKind::Solr { .. }
        )
    }
}

impl Default for ServiceKind {
    fn default() -> Self {
        ServiceKind::Ssh { port: 22 }
    }
}

/// A service instance embedded in a guest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    /// Stable synthetic id within the guest
    pub id: Uuid,
    pub name: String,
    /// Exposed at the guest's external address by the firewall compiler
    pub public_service: bool,
    has_backups: bool,
    pub kind: ServiceKind,
}

impl Service {
    pub fn new(name: impl Into<String>, kind: ServiceKind) -> Self {
        Self {
            id: Uuid::now_v7(),
            name: name.into(),
            public_service: false,
            has_backups: false,
            kind,
        }
    }

    pub fn public(mut self) -> Self {
        self.public_service = true;
        self
    }

    /// Enable backups. Ignored for kinds that cannot back up.
    pub fn set_has_backups(&mut self, state: bool) {
        self.has_backups = state && self.kind.backupable();
    }

    pub fn has_backups(&self) -> bool {
        self.has_backups
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nginx_ports_follow_ssl_support() {
        let plain = ServiceKind::Nginx {
            port: 80,
            ssl_port: 443,
            ssl_supported: false,
        };
        assert_eq!(plain.used_ports(), vec![80]);
        assert_eq!(plain.ssl_port(), None);

        let ssl = ServiceKind::Nginx {
            port: 80,
            ssl_port: 443,
            ssl_supported: true,
        };
        assert_eq!(ssl.used_ports(), vec![80, 443]);
        assert_eq!(ssl.ssl_port(), Some(443));
    }

    #[test]
    fn has_backups_requires_backupable_kind() {
        let mut nginx = Service::new("web", ServiceKind::Nginx {
            port: 80,
            ssl_port: 443,
            ssl_supported: false,
        });
        nginx.set_has_backups(true);
        assert!(!nginx.has_backups());

        let mut mongo = Service::new("db", ServiceKind::Mongodb { port: 27017 });
        mongo.set_has_backups(true);
        assert!(mongo.has_backups());
    }

    #[test]
    fn kind_keywords() {
        assert_eq!(ServiceKind::default().kind(), "ssh");
        assert_eq!(ServiceKind::Backup.kind(), "backup");
        assert_eq!(ServiceKind::Monitoring.used_ports(), Vec::<u16>::new());
    }
}
