//! Firewall Compiler
//!
//! Compiles a host's declarative exposure policy (addresses, exposed
//! services, NAT mappings) into three idempotent shell scripts and
//! pushes them to the host. Rule order is a correctness property: the
//! packet filter is first-match, so DNAT rules precede the shared SNAT
//! rule and masquerading follows all per-service rules. `stop` is the
//! correctness backstop; running `start` twice duplicates rules and
//! `stop` must still clear everything.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;

use crate::config::CloudConfig;
use crate::domain::{Guest, Host};
use crate::errors::Result;
use crate::executor::{exec_or_fail, RemoteSession};

const IP4TABLES: &str = "/sbin/iptables";
const IP6TABLES: &str = "/sbin/ip6tables";
const BRIDGE: &str = "lxdbr0";
const SHEBANG: &str = "#!/bin/sh\n";

/// Script directory relative to the target root
pub const SCRIPT_DIR: &str = "etc/cloud_model";

fn iptables_bin(address: &str) -> &'static str {
    if address.parse::<Ipv4Addr>().is_ok() {
        IP4TABLES
    } else {
        IP6TABLES
    }
}

/// Exposure spec for one service keyword at one address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub ports: Vec<u16>,
    pub proto: &'static str,
    /// Narrow the accept rule to one source host (IP or CIDR)
    pub source_host: Option<String>,
    /// Narrow the accept rule to one source port
    pub source_port: Option<u16>,
    /// Sources allowed to bypass SSH rate limiting
    pub trusted_sources: Vec<String>,
}

impl ServiceSpec {
    fn tcp(port: u16) -> Self {
        Self {
            ports: vec![port],
            proto: "tcp",
            source_host: None,
            source_port: None,
            trusted_sources: Vec::new(),
        }
    }

    fn udp(port: u16) -> Self {
        Self {
            ports: vec![port],
            proto: "udp",
            source_host: None,
            source_port: None,
            trusted_sources: Vec::new(),
        }
    }
}

/// Rule bucket for one address bound to the host
#[derive(Debug, Clone)]
pub struct AddressRules {
    /// Literal address the rules filter on
    pub address: String,
    pub interface: String,
    /// Private address of the guest this address DNATs to
    pub nat_target: Option<Ipv4Addr>,
    /// Service keyword to spec, in declaration order
    pub services: Vec<(String, ServiceSpec)>,
}

impl AddressRules {
    fn new(address: String) -> Self {
        Self {
            address,
            interface: "eth0".to_string(),
            nat_target: None,
            services: Vec::new(),
        }
    }

    fn push_port(&mut self, keyword: &str, port: u16) {
        match self.services.iter_mut().find(|(k, _)| k == keyword) {
            Some((_, spec)) => spec.ports.push(port),
            None => self.services.push((keyword.to_string(), ServiceSpec::tcp(port))),
        }
    }
}

/// Compiles one host's rule set into start/stop/list scripts
pub struct FirewallCompiler {
    rules: Vec<AddressRules>,
    host_address_blocks: Vec<String>,
    private_network: String,
    overlay_network: String,
    ssh_deep_inspect: bool,
}

impl FirewallCompiler {
    /// Build the rule set for a host and its guests.
    ///
    /// The primary address exposes the host's own services (SSH and the
    /// overlay VPN). IPv6 extra addresses expose the host services at
    /// the network's `::2` address. IPv4 extra blocks are expanded per
    /// IP; an IP held by a guest as external address is NAT-mapped to
    /// that guest's private address and exposes the guest's public
    /// services, with an extra `<kind>s` bucket for SSL ports.
    pub fn for_host(config: &CloudConfig, host: &Host, guests: &[Guest]) -> Self {
        let mut ssh = ServiceSpec::tcp(22);
        ssh.trusted_sources = config.trusted_ssh_sources.clone();
        let host_services: Vec<(String, ServiceSpec)> = vec![
            ("ssh".to_string(), ssh),
            ("tinc-tcp".to_string(), ServiceSpec::tcp(655)),
            ("tinc-udp".to_string(), ServiceSpec::udp(655)),
        ];

        let mut rules = Vec::new();

        let mut primary = AddressRules::new(host.primary_address.ip().to_string());
        primary.services = host_services.clone();
        rules.push(primary);

        for address in &host.addresses {
            if address.is_ipv6() {
                // The host's own address in an IPv6 block is ::2
                let mut entry = AddressRules::new(format!("{}2", address.ip()));
                entry.services = host_services.clone();
                rules.push(entry);
                continue;
            }

            for ip in address.list_ips() {
                let mut entry = AddressRules::new(ip.to_string());

                if let Some(guest) = guests
                    .iter()
                    .find(|g| g.external_address == Some(ip))
                {
                    entry.nat_target = guest.private_address;

                    for service in guest.public_services() {
                        if let Some(port) = service.kind.port() {
                            entry.push_port(service.kind.kind(), port);
                        }
                        if let Some(ssl_port) = service.kind.ssl_port() {
                            entry.push_port(&format!("{}s", service.kind.kind()), ssl_port);
                        }
                    }
                }

                rules.push(entry);
            }
        }

        Self {
            rules,
            host_address_blocks: host.addresses.iter().map(|a| a.to_cidr()).collect(),
            private_network: host.private_network.to_cidr(),
            overlay_network: config.overlay_network.to_cidr(),
            ssh_deep_inspect: config.ssh_deep_inspect,
        }
    }

    /// The compiled rule set, primary address first
    pub fn rules(&self) -> &[AddressRules] {
        &self.rules
    }

    /// Mutable rule set, for narrowing specs (source filters, extra
    /// trusted sources) before rendering
    pub fn rules_mut(&mut self) -> &mut [AddressRules] {
        &mut self.rules
    }

    fn nat_rules(
        &self,
        address: &str,
        port: u16,
        proto: &str,
        nat_target: Ipv4Addr,
    ) -> Vec<String> {
        let iptables = iptables_bin(address);
        vec![
            // External request
            format!(
                "{iptables} -t nat -A PREROUTING -p {proto} -d {address} --dport {port} -j DNAT --to-destination {nat_target}:{port}"
            ),
            // Request from the host itself
            format!(
                "{iptables} -t nat -A OUTPUT -p {proto} -o lo -d {address} --dport {port} -j DNAT --to {nat_target}:{port}"
            ),
            // Request from the guest bridge
            format!(
                "{iptables} -t nat -A OUTPUT -p {proto} -o {BRIDGE} -d {address} --dport {port} -j DNAT --to {nat_target}:{port}"
            ),
            // Return traffic keeps the external source, except inside
            // the overlay
            format!(
                "{iptables} -t nat -A POSTROUTING ! -s {} -d {nat_target} -j SNAT --to-source {address}",
                self.overlay_network
            ),
        ]
    }

    fn ssh_rules(
        &self,
        entry: &AddressRules,
        spec: &ServiceSpec,
        ssh_init_done: &mut BTreeSet<&'static str>,
    ) -> Vec<String> {
        let address = &entry.address;
        let interface = &entry.interface;
        let iptables = iptables_bin(address);
        let mut commands = Vec::new();

        if !self.ssh_deep_inspect && ssh_init_done.insert(iptables) {
            commands.push(format!("{iptables} -N SSH_ATTACKED"));
            commands.push(format!(
                "{iptables} -A SSH_ATTACKED -m recent --name SSH_brutes --set -j LOG --log-level 4 --log-prefix 'SSH attack: '"
            ));
            commands.push(format!("{iptables} -A SSH_ATTACKED -j REJECT"));
        }

        for &port in &spec.ports {
            // Trusted sources skip rate limiting entirely
            for source in &spec.trusted_sources {
                commands.push(format!(
                    "{iptables} -A INPUT -m conntrack --ctstate NEW -p tcp -s {source} -d {address} --dport {port} -j ACCEPT"
                ));
            }

            if self.ssh_deep_inspect {
                commands.push(format!(
                    "{iptables} -A INPUT -i {interface} -m conntrack --ctstate NEW -p tcp -d {address} --dport {port} -j SSH_CHECK"
                ));
            } else {
                commands.push(format!(
                    "{iptables} -A INPUT -i {interface} -p tcp -d {address} --dport {port} ! --syn -m conntrack --ctstate ESTABLISHED,RELATED -j ACCEPT"
                ));
                commands.push(format!(
                    "{iptables} -A INPUT -i {interface} -p tcp -d {address} --dport {port} --syn -m recent --name SSH_brutes --update --seconds 20 -j REJECT"
                ));
                commands.push(format!(
                    "{iptables} -A INPUT -i {interface} -p tcp -d {address} --dport {port} --syn -m recent --name sshconn --update --seconds 60 --hitcount 6 -j SSH_ATTACKED"
                ));
                commands.push(format!(
                    "{iptables} -A INPUT -i {interface} -p tcp -d {address} --dport {port} --syn -m recent --name sshconn --set"
                ));
                commands.push(format!(
                    "{iptables} -A INPUT -i {interface} -p tcp -d {address} --dport {port} --syn -j ACCEPT"
                ));
            }

            if let Some(nat_target) = entry.nat_target {
                commands.extend(self.nat_rules(address, port, "tcp", nat_target));
            }
        }

        commands
    }

    fn service_rules(&self, entry: &AddressRules, spec: &ServiceSpec) -> Vec<String> {
        let address = &entry.address;
        let iptables = iptables_bin(address);
        let proto = spec.proto;
        let mut commands = Vec::new();

        for &port in &spec.ports {
            let mut rule = format!(
                "{iptables} -A INPUT -i {} -m conntrack --ctstate NEW -p {proto}",
                entry.interface
            );
            // Source narrowing goes before the destination clauses
            if let Some(source) = &spec.source_host {
                rule.push_str(&format!(" -s {source}"));
            }
            if let Some(source_port) = spec.source_port {
                rule.push_str(&format!(" --sport {source_port}"));
            }
            rule.push_str(&format!(" -d {address} --dport {port} -j ACCEPT"));
            commands.push(rule);
        }

        if let Some(nat_target) = entry.nat_target {
            for &port in &spec.ports {
                commands.extend(self.nat_rules(address, port, proto, nat_target));
            }
        }

        commands
    }

    fn masquerade_rules(&self) -> Vec<String> {
        let mut commands = Vec::new();

        for block in &self.host_address_blocks {
            commands.push(format!(
                "{IP4TABLES} -I FORWARD -o {BRIDGE} -d {block} -j ACCEPT"
            ));
        }

        let net = &self.private_network;
        let overlay = &self.overlay_network;
        // Multicast and broadcast stay un-NATed
        commands.push(format!(
            "{IP4TABLES} -t nat -A POSTROUTING -s {net} -d 224.0.0.0/24 -j RETURN"
        ));
        commands.push(format!(
            "{IP4TABLES} -t nat -A POSTROUTING -s {net} -d 255.255.255.255/32 -j RETURN"
        ));
        commands.push(format!(
            "{IP4TABLES} -t nat -A POSTROUTING -s {net} ! -d {overlay} -p tcp -j MASQUERADE --to-ports 1024-65535"
        ));
        commands.push(format!(
            "{IP4TABLES} -t nat -A POSTROUTING -s {net} ! -d {overlay} -p udp -j MASQUERADE --to-ports 1024-65535"
        ));
        commands.push(format!(
            "{IP4TABLES} -t nat -A POSTROUTING -s {net} ! -d {overlay} -j MASQUERADE"
        ));

        commands
    }

    /// The `start` script body: installs all rules in first-match order
    pub fn start_script(&self) -> String {
        let mut commands = Vec::new();
        let mut interfaces = Vec::new();
        let mut ssh_init_done = BTreeSet::new();

        commands.push(format!("{IP4TABLES} -A FORWARD -i {BRIDGE} -j ACCEPT"));
        commands.push(format!("{IP4TABLES} -A FORWARD -o {BRIDGE} -j ACCEPT"));

        if self.ssh_deep_inspect {
            for iptables in [IP4TABLES, IP6TABLES] {
                commands.push(format!("{iptables} -N SSH_CHECK"));
                commands.push(format!("{iptables} -N SSH_ATTACKED"));
            }
        }

        for entry in &self.rules {
            if !interfaces.contains(&entry.interface) {
                interfaces.push(entry.interface.clone());
            }

            for (keyword, spec) in &entry.services {
                if keyword == "ssh" {
                    commands.extend(self.ssh_rules(entry, spec, &mut ssh_init_done));
                } else {
                    commands.extend(self.service_rules(entry, spec));
                }
            }
        }

        if self.ssh_deep_inspect {
            for iptables in [IP4TABLES, IP6TABLES] {
                commands.push(format!("{iptables} -A SSH_CHECK -m recent --set --name SSH"));
                commands.push(format!(
                    "{iptables} -A SSH_CHECK -m recent --update --seconds 60 --hitcount 4 --rttl --name SSH -j SSH_ATTACKED"
                ));
                commands.push(format!(
                    "{iptables} -A SSH_ATTACKED -j LOG --log-prefix 'SSH attack: ' --log-level 7"
                ));
                commands.push(format!("{iptables} -A SSH_ATTACKED -j REJECT"));
            }
        }

        commands.extend(self.masquerade_rules());

        for interface in &interfaces {
            for iptables in [IP4TABLES, IP6TABLES] {
                for proto in ["tcp", "udp"] {
                    commands.push(format!(
                        "{iptables} -A INPUT -i {interface} -m conntrack --ctstate NEW -p {proto} -j REJECT"
                    ));
                }
            }

            commands.push(format!(
                "{IP4TABLES} -A INPUT -i {interface} -p icmp --icmp-type timestamp-request -j DROP"
            ));
            commands.push(format!(
                "{IP4TABLES} -A OUTPUT -o {interface} -p icmp --icmp-type timestamp-reply -j DROP"
            ));
        }

        commands.join("\n")
    }

    /// The `stop` script body: flushes everything `start` may have
    /// installed, however many times it ran
    pub fn stop_script(&self) -> String {
        let mut commands = Vec::new();

        for iptables in [IP4TABLES, IP6TABLES] {
            for attrs in ["-F", "-t nat -F"] {
                commands.push(format!(
                    "{iptables} {attrs} || echo 'Warning: Cannot succeed {iptables} {attrs}'"
                ));
            }

            if self.ssh_deep_inspect {
                for attrs in ["-X SSH_ATTACKED", "-X SSH_CHECK"] {
                    commands.push(format!(
                        "{iptables} {attrs} || echo 'Failed to run: {iptables} {attrs}'"
                    ));
                }
            } else {
                commands.push(format!(
                    "{iptables} -X SSH_ATTACKED || echo 'Warning: Cannot undefine SSH_ATTACKED for {iptables}'"
                ));
            }
        }

        commands.join("\n")
    }

    /// The `list` script body: read-only dump of both tables
    pub fn list_script(&self) -> String {
        let mut commands = Vec::new();

        for iptables in [IP4TABLES, IP6TABLES] {
            commands.push("echo".to_string());
            commands.push(format!("echo 'List rules for {iptables}'"));
            commands.push("echo".to_string());
            commands.push(format!("{iptables} -L"));
            commands.push(format!("{iptables} -t nat -L"));
        }

        commands.join("\n")
    }

    /// Push the three scripts to the host, mode 0700, below `root`
    pub async fn write_scripts(&self, session: &mut dyn RemoteSession, root: &str) -> Result<()> {
        let dir = format!("{}/{SCRIPT_DIR}", root.trim_end_matches('/'));
        exec_or_fail(
            session,
            &format!("mkdir -p {dir}"),
            "Failed to create firewall script directory",
        )
        .await?;

        for (name, body) in [
            ("firewall_start", self.start_script()),
            ("firewall_stop", self.stop_script()),
            ("firewall_list", self.list_script()),
        ] {
            let mut content = String::with_capacity(SHEBANG.len() + body.len() + 1);
            content.push_str(SHEBANG);
            content.push_str(&body);
            content.push('\n');
            session
                .write_file(&format!("{dir}/{name}"), 0o700, &content)
                .await?;
        }

        Ok(())
    }
}
