//! Control plane configuration

use std::net::IpAddr;
use std::path::PathBuf;

use crate::domain::{Address, MacPrefix};

/// Configuration for the control plane
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Root directory for keys, images, and backups
    pub data_directory: PathBuf,
    /// Backup target directory; defaults below `data_directory`
    pub backup_directory: PathBuf,
    /// If true, skip rsyncing images on deploy
    pub skip_sync_images: bool,
    /// Connect to hosts via their external address. Useful for
    /// development boxes without the overlay VPN.
    pub use_external_ip: bool,
    /// DNS servers handed to guests
    pub dns_servers: Vec<IpAddr>,
    /// Starting prefix for host MAC prefix generation
    pub host_mac_address_prefix_init: MacPrefix,
    /// Site-to-site overlay network, exempted from masquerading
    pub overlay_network: Address,
    /// Enable the SSH_CHECK/SSH_ATTACKED deep-inspection chains instead
    /// of the recent-tracking rules
    pub ssh_deep_inspect: bool,
    /// Sources (IPs or CIDRs) exempt from SSH rate limiting
    pub trusted_ssh_sources: Vec<String>,
    /// Domain appended when a host has no resolvable mail hostname
    pub email_domain: Option<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        let data_directory = PathBuf::from("./data");
        Self {
            backup_directory: data_directory.join("backups"),
            data_directory,
            skip_sync_images: false,
            use_external_ip: false,
            dns_servers: vec![
                "1.1.1.1".parse().expect("valid literal"),
                "8.8.8.8".parse().expect("valid literal"),
                "9.9.9.10".parse().expect("valid literal"),
            ],
            host_mac_address_prefix_init: MacPrefix::from_value(0),
            overlay_network: Address::new("10.99.0.0/16").expect("valid literal"),
            ssh_deep_inspect: false,
            trusted_ssh_sources: Vec::new(),
            email_domain: None,
        }
    }
}

impl CloudConfig {
    /// Path of the SSH private key used for host connections
    pub fn ssh_key_path(&self) -> PathBuf {
        self.data_directory.join("keys/id_rsa")
    }
}
