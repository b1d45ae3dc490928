// SPDX-License-Identifier: AGPL-3.0-or-later
//! Security policy engine
//!
//! Turns a declared trust list into the gateway's rule set. Nothing is
//! allowed unless an entry says so, in either direction.

use std::str::FromStr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{RdGateError, Result};

const COMPONENT: &str = "security";

/// Inclusive port range a rule applies to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PortRange {
    All,
    Single(u16),
    Range(u16, u16),
}

impl PortRange {
    /// Provider `FromPort`/`ToPort` pair for `protocol`, `None` when the
    /// protocol carries no ports
    ///
    /// Every port is `0-65535` for tcp and udp. For icmp the pair is the
    /// type/code wildcard `-1`.
    pub fn bounds_for(&self, protocol: Protocol) -> Option<(i32, i32)> {
        match (protocol, *self) {
            (Protocol::All, _) => None,
            (Protocol::Icmp, _) => Some((-1, -1)),
            (_, PortRange::All) => Some((0, u16::MAX as i32)),
            (_, PortRange::Single(port)) => Some((port as i32, port as i32)),
            (_, PortRange::Range(from, to)) => Some((from as i32, to as i32)),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        match *self {
            PortRange::All => true,
            PortRange::Single(p) => p == port,
            PortRange::Range(from, to) => (from..=to).contains(&port),
        }
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PortRange::All => write!(formatter, "all"),
            PortRange::Single(port) => write!(formatter, "{}", port),
            PortRange::Range(from, to) => write!(formatter, "{}-{}", from, to),
        }
    }
}

impl FromStr for PortRange {
    type Err = RdGateError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("all") {
            return Ok(PortRange::All);
        }

        let parse_port = |value: &str| {
            value.trim().parse::<u16>().map_err(|_| {
                RdGateError::configuration(COMPONENT, format!("invalid port '{}'", value))
            })
        };

        match s.split_once('-') {
            Some((from, to)) => {
                let (from, to) = (parse_port(from)?, parse_port(to)?);
                if from > to {
                    return Err(RdGateError::configuration(
                        COMPONENT,
                        format!("port range {}-{} is inverted", from, to),
                    ));
                }
                Ok(PortRange::Range(from, to))
            }
            None => Ok(PortRange::Single(parse_port(s)?)),
        }
    }
}

impl TryFrom<String> for PortRange {
    type Error = RdGateError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    All,
    Tcp,
    Udp,
    Icmp,
}

impl Protocol {
    pub fn ip_protocol(&self) -> &'static str {
        match self {
            Protocol::All => "-1",
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Ingress,
    Egress,
}

/// One declared trust: who may talk to the gateway, on which ports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustEntry {
    /// Single IPv4 host (`a.b.c.d`) or CIDR (`a.b.c.d/n`)
    pub peer: String,

    #[serde(default = "default_ports")]
    pub ports: PortRange,

    #[serde(default)]
    pub protocol: Protocol,

    #[serde(default)]
    pub direction: Direction,

    #[serde(default)]
    pub description: String,
}

impl TrustEntry {
    /// Every port and protocol from a single peer
    pub fn all_traffic(peer: &str, description: &str) -> Self {
        Self {
            peer: peer.to_string(),
            ports: PortRange::All,
            protocol: Protocol::All,
            direction: Direction::Ingress,
            description: description.to_string(),
        }
    }
}

/// A resolved allow rule
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Rule {
    pub peer: Ipv4Net,
    pub ports: PortRange,
    pub protocol: Protocol,
    pub direction: Direction,
    pub description: String,
}

impl Rule {
    /// Rule in the provider's inline security group form
    pub fn to_provider(&self) -> serde_json::Value {
        let mut rule = serde_json::json!({
            "CidrIp": self.peer.to_string(),
            "IpProtocol": self.protocol.ip_protocol(),
            "Description": self.description,
        });
        if let Some((from_port, to_port)) = self.ports.bounds_for(self.protocol) {
            rule["FromPort"] = from_port.into();
            rule["ToPort"] = to_port.into();
        }
        rule
    }
}

/// Deny-by-default rule set for the gateway instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SecurityPolicy {
    description: String,
    rules: Vec<Rule>,
}

impl SecurityPolicy {
    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    pub fn ingress(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.direction == Direction::Ingress)
    }

    pub fn egress(&self) -> impl Iterator<Item = &Rule> {
        self.rules.iter().filter(|r| r.direction == Direction::Egress)
    }

    /// Whether `protocol` traffic from `peer` is allowed in on `port`
    ///
    /// `port` is ignored for icmp and for rules covering every port.
    pub fn allows_ingress(&self, peer: std::net::Ipv4Addr, protocol: Protocol, port: u16) -> bool {
        self.ingress().any(|rule| {
            rule.peer.contains(&peer)
                && (rule.protocol == Protocol::All || rule.protocol == protocol)
                && (protocol == Protocol::Icmp || rule.ports.contains(port))
        })
    }

    /// Append a rule; nothing already allowed is ever taken away
    pub fn extend(&mut self, entry: &TrustEntry) -> Result<()> {
        let rule = resolve_entry(entry)?;
        if !self.rules.contains(&rule) {
            self.rules.push(rule);
        }
        Ok(())
    }
}

/// Build the policy for `entries`
///
/// `allow_all_outbound` adds an egress rule for `0.0.0.0/0`; it is off unless
/// configured.
pub fn build_policy(
    description: &str,
    entries: &[TrustEntry],
    allow_all_outbound: bool,
) -> Result<SecurityPolicy> {
    let mut policy = SecurityPolicy {
        description: description.to_string(),
        rules: Vec::with_capacity(entries.len() + 1),
    };

    for entry in entries {
        policy.extend(entry)?;
    }

    if allow_all_outbound {
        policy.extend(&TrustEntry {
            peer: "0.0.0.0/0".to_string(),
            ports: PortRange::All,
            protocol: Protocol::All,
            direction: Direction::Egress,
            description: "Allow all outbound traffic by default".to_string(),
        })?;
    }

    debug!(
        ingress = policy.ingress().count(),
        egress = policy.egress().count(),
        "Built security policy"
    );

    Ok(policy)
}

fn resolve_entry(entry: &TrustEntry) -> Result<Rule> {
    let peer = parse_peer(&entry.peer)?;

    if entry.ports != PortRange::All && !matches!(entry.protocol, Protocol::Tcp | Protocol::Udp) {
        return Err(RdGateError::configuration(
            COMPONENT,
            format!(
                "port range {} for peer {} requires tcp or udp",
                entry.ports, entry.peer
            ),
        ));
    }

    if entry.direction == Direction::Ingress
        && entry.ports == PortRange::All
        && entry.protocol == Protocol::All
    {
        warn!(peer = %peer, "Trusted peer is allowed all inbound traffic");
    }

    Ok(Rule {
        peer,
        ports: entry.ports,
        protocol: entry.protocol,
        direction: entry.direction,
        description: entry.description.clone(),
    })
}

/// Parse a single host or CIDR peer descriptor
pub fn parse_peer(peer: &str) -> Result<Ipv4Net> {
    let peer = peer.trim();
    let invalid = || {
        RdGateError::configuration(
            COMPONENT,
            format!("'{}' is not a valid IPv4 host or CIDR", peer),
        )
    };

    let net = if peer.contains('/') {
        peer.parse::<Ipv4Net>().map_err(|_| invalid())?
    } else {
        let addr = peer.parse::<std::net::Ipv4Addr>().map_err(|_| invalid())?;
        Ipv4Net::from(addr)
    };

    if net.trunc() != net {
        return Err(RdGateError::configuration(
            COMPONENT,
            format!("peer {} has host bits set (expected {})", net, net.trunc()),
        ));
    }

    Ok(net)
}

fn default_ports() -> PortRange {
    PortRange::All
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_trusted_peer_policy() {
        let entries = [TrustEntry::all_traffic("58.96.89.81/32", "Allow all from trusted ip")];
        let policy = build_policy("rdGateway", &entries, false).unwrap();

        assert_eq!(policy.rules().len(), 1);
        let rule = &policy.rules()[0];
        assert_eq!(rule.peer, "58.96.89.81/32".parse::<Ipv4Net>().unwrap());
        assert_eq!(rule.ports, PortRange::All);
        assert_eq!(rule.direction, Direction::Ingress);

        assert!(policy.allows_ingress("58.96.89.81".parse().unwrap(), Protocol::Tcp, 3389));
        assert!(policy.allows_ingress("58.96.89.81".parse().unwrap(), Protocol::Tcp, 443));
        assert!(!policy.allows_ingress("58.96.89.82".parse().unwrap(), Protocol::Tcp, 443));
        assert!(!policy.allows_ingress("10.0.0.1".parse().unwrap(), Protocol::Tcp, 22));
        assert_eq!(policy.egress().count(), 0);
    }

    #[test]
    fn test_empty_trust_list_denies_everything() {
        let policy = build_policy("rdGateway", &[], false).unwrap();
        assert!(policy.rules().is_empty());
        assert!(!policy.allows_ingress("58.96.89.81".parse().unwrap(), Protocol::Tcp, 443));
    }

    #[test]
    fn test_bare_host_is_slash_32() {
        assert_eq!(
            parse_peer("58.96.89.81").unwrap(),
            "58.96.89.81/32".parse::<Ipv4Net>().unwrap()
        );
    }

    #[test]
    fn test_malformed_peers_rejected() {
        for peer in ["", "58.96.89", "58.96.89.81/33", "not-an-ip", "58.96.89.81/24", "::1"] {
            assert!(
                matches!(parse_peer(peer), Err(RdGateError::ConfigurationError { .. })),
                "{} should be rejected",
                peer
            );
        }
    }

    #[test]
    fn test_port_range_parsing() {
        assert_eq!("all".parse::<PortRange>().unwrap(), PortRange::All);
        assert_eq!("3389".parse::<PortRange>().unwrap(), PortRange::Single(3389));
        assert_eq!("1000-2000".parse::<PortRange>().unwrap(), PortRange::Range(1000, 2000));
        assert!("2000-1000".parse::<PortRange>().is_err());
        assert!("70000".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_ports_require_tcp_or_udp() {
        let mut entry = TrustEntry::all_traffic("10.0.0.0/8", "rdp");
        entry.ports = PortRange::Single(3389);
        assert!(build_policy("p", &[entry.clone()], false).is_err());

        entry.protocol = Protocol::Tcp;
        let policy = build_policy("p", &[entry], false).unwrap();
        assert!(policy.allows_ingress("10.1.2.3".parse().unwrap(), Protocol::Tcp, 3389));
        assert!(!policy.allows_ingress("10.1.2.3".parse().unwrap(), Protocol::Tcp, 3390));
    }

    #[test]
    fn test_extend_never_narrows() {
        let mut policy =
            build_policy("p", &[TrustEntry::all_traffic("58.96.89.81/32", "")], false).unwrap();
        policy
            .extend(&TrustEntry::all_traffic("203.0.113.0/24", "office"))
            .unwrap();
        assert_eq!(policy.rules().len(), 2);
        assert!(policy.allows_ingress("58.96.89.81".parse().unwrap(), Protocol::Tcp, 1));

        // Duplicates are absorbed
        policy
            .extend(&TrustEntry::all_traffic("203.0.113.0/24", "office"))
            .unwrap();
        assert_eq!(policy.rules().len(), 2);
    }

    #[test]
    fn test_allow_all_outbound_is_opt_in() {
        let policy = build_policy("p", &[], true).unwrap();
        assert_eq!(policy.egress().count(), 1);
        assert_eq!(policy.ingress().count(), 0);
    }

    #[test]
    fn test_protocol_restricts_ingress() {
        let mut entry = TrustEntry::all_traffic("10.0.0.0/8", "rdp");
        entry.ports = PortRange::Single(3389);
        entry.protocol = Protocol::Tcp;
        let policy = build_policy("p", &[entry], false).unwrap();

        let peer = "10.1.2.3".parse().unwrap();
        assert!(policy.allows_ingress(peer, Protocol::Tcp, 3389));
        assert!(!policy.allows_ingress(peer, Protocol::Udp, 3389));
        assert!(!policy.allows_ingress(peer, Protocol::Icmp, 0));

        let open = build_policy("p", &[TrustEntry::all_traffic("10.0.0.0/8", "")], false).unwrap();
        assert!(open.allows_ingress(peer, Protocol::Udp, 3391));
        assert!(open.allows_ingress(peer, Protocol::Icmp, 0));
    }

    #[test]
    fn test_every_port_encoding_per_protocol() {
        let encode = |protocol: Protocol| {
            let mut entry = TrustEntry::all_traffic("58.96.89.81/32", "trusted");
            entry.protocol = protocol;
            resolve_entry(&entry).unwrap().to_provider()
        };

        for protocol in [Protocol::Tcp, Protocol::Udp] {
            let json = encode(protocol);
            assert_eq!(json["IpProtocol"], protocol.ip_protocol());
            assert_eq!(json["FromPort"], 0);
            assert_eq!(json["ToPort"], 65535);
        }

        let icmp = encode(Protocol::Icmp);
        assert_eq!(icmp["IpProtocol"], "icmp");
        assert_eq!(icmp["FromPort"], -1);
        assert_eq!(icmp["ToPort"], -1);
    }

    #[test]
    fn test_port_range_encoding_for_tcp() {
        let mut entry = TrustEntry::all_traffic("58.96.89.81/32", "gateway");
        entry.protocol = Protocol::Tcp;
        entry.ports = PortRange::Range(3389, 3391);
        let json = resolve_entry(&entry).unwrap().to_provider();
        assert_eq!(json["FromPort"], 3389);
        assert_eq!(json["ToPort"], 3391);
    }

    #[test]
    fn test_provider_rule_encoding() {
        let rule = resolve_entry(&TrustEntry::all_traffic("58.96.89.81/32", "trusted")).unwrap();
        let json = rule.to_provider();
        assert_eq!(json["CidrIp"], "58.96.89.81/32");
        assert_eq!(json["IpProtocol"], "-1");
        assert!(json.get("FromPort").is_none());
    }
}
