use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::Duration;

use ipnetwork::IpNetwork;
use serde::Deserialize;
use thiserror::Error;

use crate::client::DynamicClientLimits;
use crate::constants::{
    DEFAULT_CLEANUP_DELAY_SECS, DEFAULT_MAX_CLIENTS, DEFAULT_MAX_CONNECTIONS,
    DEFAULT_MAX_PENDING_CLIENTS, DEFAULT_MAX_PENDING_PACKETS, MAX_CLEANUP_DELAY_SECS,
};
use crate::trie::PrefixTrie;
use crate::types::{PacketCode, Priority};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("No 'ipaddr' was specified in the 'udp' section")]
    MissingAddress,

    #[error("Multiple bind addresses were specified in the 'udp' section")]
    ConflictingAddresses,

    #[error("No 'port' was specified in the 'udp' section")]
    MissingPort,

    #[error("Unknown value for 'port_name = {0}'")]
    UnknownPortName(String),

    #[error("Invalid value for '{name}': {value} is not within {min}..={max}")]
    OutOfRange {
        name: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },

    #[error("Cannot (yet) use dynamic clients and connected sockets")]
    DynamicAndConnected,

    #[error("One or more 'network' entries MUST be specified for dynamic clients")]
    NoNetworks,

    #[error("Address family in entry 'network = {0}' does not match 'ipaddr'")]
    NetworkFamily(IpNetwork),

    #[error("Cannot add duplicate entry 'network = {0}'")]
    DuplicateNetwork(IpNetwork),

    #[error("Cannot add overlapping entry 'network = {0}'. Entry is completely enclosed inside of a previously defined network")]
    OverlappingNetwork(IpNetwork),

    #[error("Unknown packet type '{0}' in 'priority' section")]
    UnknownPacketType(String),
}

fn default_cleanup_delay() -> u64 {
    DEFAULT_CLEANUP_DELAY_SECS
}

fn default_max_clients() -> u32 {
    DEFAULT_MAX_CLIENTS
}

fn default_max_pending_clients() -> u32 {
    DEFAULT_MAX_PENDING_CLIENTS
}

fn default_max_pending_packets() -> u32 {
    DEFAULT_MAX_PENDING_PACKETS
}

fn default_idle_timeout() -> u64 {
    600
}

fn default_nak_lifetime() -> u64 {
    30
}

fn default_check_interval() -> u64 {
    30
}

/// The `dynamic_clients { ... }` block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DynamicClientConfig {
    pub network: Vec<IpNetwork>,

    #[serde(default = "default_max_clients")]
    pub max_clients: u32,

    #[serde(default = "default_max_pending_clients")]
    pub max_pending_clients: u32,

    #[serde(default = "default_max_pending_packets")]
    pub max_pending_packets: u32,

    /// Seconds; 0 disables idle expiry.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout: u64,

    #[serde(default = "default_nak_lifetime")]
    pub nak_lifetime: u64,

    #[serde(default = "default_check_interval")]
    pub check_interval: u64,
}

impl DynamicClientConfig {
    pub fn limits(&self) -> DynamicClientLimits {
        DynamicClientLimits {
            networks: self.network.clone(),
            max_clients: self.max_clients,
            max_pending_clients: self.max_pending_clients,
            max_pending_packets: self.max_pending_packets,
            idle_timeout: Duration::from_secs(self.idle_timeout),
            nak_lifetime: Duration::from_secs(self.nak_lifetime),
            check_interval: Duration::from_secs(self.check_interval),
        }
    }
}

/// One UDP listener block.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    pub ipaddr: Option<IpAddr>,
    pub ipv4addr: Option<Ipv4Addr>,
    pub ipv6addr: Option<Ipv6Addr>,

    pub interface: Option<String>,

    pub port: Option<u16>,
    pub port_name: Option<String>,

    /// SO_RCVBUF in bytes; clamped to at least 32.
    pub recv_buff: Option<usize>,

    /// Seconds an Access-Request reply stays cached for retransmissions.
    #[serde(default = "default_cleanup_delay")]
    pub cleanup_delay: u64,

    /// Enable per-flow connected child sockets.
    #[serde(default)]
    pub connected: bool,

    pub max_connections: Option<u32>,

    pub dynamic_clients: Option<DynamicClientConfig>,

    /// Per-code scheduling priority overrides, keyed by packet type name.
    #[serde(default)]
    pub priority: HashMap<String, u32>,
}

impl ListenerConfig {
    pub fn address(&self) -> Result<IpAddr, ConfigError> {
        let candidates = [
            self.ipaddr,
            self.ipv4addr.map(IpAddr::V4),
            self.ipv6addr.map(IpAddr::V6),
        ];

        let mut found = None;
        for candidate in candidates.into_iter().flatten() {
            if found.is_some() {
                return Err(ConfigError::ConflictingAddresses);
            }
            found = Some(candidate);
        }
        found.ok_or(ConfigError::MissingAddress)
    }

    /// Numeric `port`, or `port_name` resolved against the service
    /// database.
    pub fn resolve_port(&self) -> Result<u16, ConfigError> {
        if let Some(port) = self.port {
            return Ok(port);
        }

        let name = self.port_name.as_ref().ok_or(ConfigError::MissingPort)?;
        crate::server::lookup_service(name)
            .ok_or_else(|| ConfigError::UnknownPortName(name.clone()))
    }

    pub fn cleanup_delay(&self) -> Duration {
        Duration::from_secs(self.cleanup_delay)
    }

    pub fn max_connections(&self) -> u32 {
        self.max_connections.unwrap_or(DEFAULT_MAX_CONNECTIONS)
    }

    pub fn limits(&self) -> Option<DynamicClientLimits> {
        self.dynamic_clients.as_ref().map(|cfg| cfg.limits())
    }

    /// The scheduling priority for a code, with config overrides applied.
    pub fn priority_for(&self, code: PacketCode) -> Priority {
        self.priority
            .get(&code.to_string())
            .map(|&value| Priority(value))
            .unwrap_or_else(|| code.default_priority())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let address = self.address()?;
        self.resolve_port()?;

        check_range(
            "cleanup_delay",
            self.cleanup_delay,
            0,
            MAX_CLEANUP_DELAY_SECS,
        )?;

        if self.connected {
            let max = self.max_connections();
            check_range("max_connections", max as u64, 4, 65536)?;
        }

        for name in self.priority.keys() {
            if !known_packet_type(name) {
                return Err(ConfigError::UnknownPacketType(name.clone()));
            }
        }

        let Some(dynamic) = &self.dynamic_clients else {
            return Ok(());
        };

        if self.connected {
            return Err(ConfigError::DynamicAndConnected);
        }
        if dynamic.network.is_empty() {
            return Err(ConfigError::NoNetworks);
        }

        check_range("max_clients", dynamic.max_clients as u64, 1, 1 << 20)?;
        check_range(
            "max_pending_clients",
            dynamic.max_pending_clients as u64,
            4,
            2048,
        )?;
        check_range(
            "max_pending_packets",
            dynamic.max_pending_packets as u64,
            256,
            65536,
        )?;
        if dynamic.idle_timeout != 0 {
            check_range("idle_timeout", dynamic.idle_timeout, 30, 86400)?;
        }

        // Networks must share the bind family and be pairwise disjoint.
        let mut trie = PrefixTrie::new();
        for network in &dynamic.network {
            let family_matches = matches!(
                (network, address),
                (IpNetwork::V4(_), IpAddr::V4(_)) | (IpNetwork::V6(_), IpAddr::V6(_))
            );
            if !family_matches {
                return Err(ConfigError::NetworkFamily(*network));
            }

            if trie.get(network).is_some() {
                return Err(ConfigError::DuplicateNetwork(*network));
            }
            if trie.enclosing(network).is_some() {
                return Err(ConfigError::OverlappingNetwork(*network));
            }
            trie.insert(*network, ())
                .map_err(|_| ConfigError::DuplicateNetwork(*network))?;
        }

        Ok(())
    }
}

fn check_range(name: &'static str, value: u64, min: u64, max: u64) -> Result<(), ConfigError> {
    if value < min || value > max {
        return Err(ConfigError::OutOfRange {
            name,
            value,
            min,
            max,
        });
    }
    Ok(())
}

fn known_packet_type(name: &str) -> bool {
    [
        "Access-Request",
        "Accounting-Request",
        "CoA-Request",
        "Disconnect-Request",
        "Status-Server",
    ]
    .contains(&name)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> ListenerConfig {
        toml::from_str(
            r#"
            ipaddr = "203.0.113.1"
            port = 1812
            "#,
        )
        .unwrap()
    }

    #[test]
    fn minimal_config_validates() {
        let cfg = base();
        cfg.validate().unwrap();
        assert_eq!(cfg.resolve_port().unwrap(), 1812);
        assert_eq!(cfg.cleanup_delay, DEFAULT_CLEANUP_DELAY_SECS);
    }

    #[test]
    fn missing_address_is_fatal() {
        let cfg: ListenerConfig = toml::from_str("port = 1812").unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::MissingAddress)));
    }

    #[test]
    fn cleanup_delay_bound() {
        let cfg: ListenerConfig = toml::from_str(
            r#"
            ipaddr = "203.0.113.1"
            port = 1812
            cleanup_delay = 31
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::OutOfRange { .. })));
    }

    #[test]
    fn dynamic_clients_and_connected_conflict() {
        let cfg: ListenerConfig = toml::from_str(
            r#"
            ipaddr = "203.0.113.1"
            port = 1812
            connected = true

            [dynamic_clients]
            network = ["198.51.100.0/24"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::DynamicAndConnected)
        ));
    }

    #[test]
    fn overlapping_networks_rejected() {
        let cfg: ListenerConfig = toml::from_str(
            r#"
            ipaddr = "203.0.113.1"
            port = 1812

            [dynamic_clients]
            network = ["198.51.100.0/24", "198.51.100.128/25"]
            "#,
        )
        .unwrap();
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::OverlappingNetwork(_))
        ));
    }

    #[test]
    fn network_family_must_match_bind() {
        let cfg: ListenerConfig = toml::from_str(
            r#"
            ipaddr = "203.0.113.1"
            port = 1812

            [dynamic_clients]
            network = ["2001:db8::/32"]
            "#,
        )
        .unwrap();
        assert!(matches!(cfg.validate(), Err(ConfigError::NetworkFamily(_))));
    }

    #[test]
    fn priority_overrides() {
        let cfg: ListenerConfig = toml::from_str(
            r#"
            ipaddr = "203.0.113.1"
            port = 1812

            [priority]
            "Accounting-Request" = 3
            "#,
        )
        .unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.priority_for(PacketCode::AccountingRequest), Priority(3));
        assert_eq!(
            cfg.priority_for(PacketCode::AccessRequest),
            Priority::HIGH
        );
    }
}
