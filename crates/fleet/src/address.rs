//! Network address classification.
//!
//! Turns raw endpoints reported by a backend into typed addresses tagged
//! with a visibility scope. Which ranges or host names count as public or
//! cloud-local is backend knowledge, so it lives in a [`ScopeRules`] table
//! supplied with the backend configuration rather than in this module.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Kind of value an address holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressKind {
    HostName,
    Ipv4,
    Ipv6,
}

/// Visibility of an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkScope {
    /// Reachable from outside the cloud.
    Public,
    /// Reachable only inside the cloud or its private network.
    CloudLocal,
    /// Reachable only on the machine itself.
    MachineLocal,
    /// Reachable only on the local link.
    LinkLocal,
    #[serde(other)]
    Unknown,
}

impl fmt::Display for NetworkScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Public => write!(f, "public"),
            Self::CloudLocal => write!(f, "local-cloud"),
            Self::MachineLocal => write!(f, "local-machine"),
            Self::LinkLocal => write!(f, "link-local"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A classified network address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub value: String,
    pub kind: AddressKind,
    pub scope: NetworkScope,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.value, self.scope)
    }
}

/// An IP range in CIDR notation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cidr {
    network: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Range of `prefix` leading bits of `network`; `None` when the prefix
    /// is longer than the address.
    #[must_use]
    pub fn new(network: IpAddr, prefix: u8) -> Option<Self> {
        let max = if network.is_ipv4() { 32 } else { 128 };
        (prefix <= max).then_some(Self { network, prefix })
    }

    /// Whether `ip` falls inside this range. Mixed families never match.
    #[must_use]
    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.network, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(*ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX
                    .checked_shl(128 - u32::from(self.prefix))
                    .unwrap_or(0);
                u128::from(net) & mask == u128::from(*ip) & mask
            }
            _ => false,
        }
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("missing prefix length in {s:?}"))?;
        let network: IpAddr = addr
            .parse()
            .map_err(|e| format!("bad network address in {s:?}: {e}"))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|e| format!("bad prefix length in {s:?}: {e}"))?;
        Self::new(network, prefix).ok_or_else(|| format!("prefix length {prefix} too long in {s:?}"))
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// How a rule recognises an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScopeMatcher {
    /// IP literal inside the range.
    Cidr(Cidr),
    /// Host name equal to the suffix or ending in `.suffix`
    /// (case-insensitive).
    HostSuffix(String),
}

impl ScopeMatcher {
    fn matches(&self, value: &str, ip: Option<&IpAddr>) -> bool {
        match (self, ip) {
            (Self::Cidr(cidr), Some(ip)) => cidr.contains(ip),
            (Self::HostSuffix(suffix), None) => {
                let suffix = suffix.trim_matches('.').to_ascii_lowercase();
                // Whole labels only: "localhost" must not match "notlocalhost".
                value == suffix
                    || value
                        .strip_suffix(suffix.as_str())
                        .is_some_and(|head| head.ends_with('.'))
            }
            _ => false,
        }
    }
}

/// One entry of a scope table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeRule {
    #[serde(rename = "match", with = "serde_yaml::with::singleton_map")]
    pub matcher: ScopeMatcher,
    pub scope: NetworkScope,
}

/// Backend-specific mapping from endpoint patterns to scopes.
///
/// Rules are tried in order; the first match wins. Endpoints no rule
/// matches get the fallback scope for their kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ScopeRules {
    #[serde(default)]
    pub rules: Vec<ScopeRule>,
    #[serde(default = "unknown_scope")]
    pub ip_fallback: NetworkScope,
    #[serde(default = "unknown_scope")]
    pub hostname_fallback: NetworkScope,
}

fn unknown_scope() -> NetworkScope {
    NetworkScope::Unknown
}

impl Default for ScopeRules {
    fn default() -> Self {
        Self::empty()
    }
}

impl ScopeRules {
    /// A table with no rules; everything classifies as `Unknown`.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            rules: Vec::new(),
            ip_fallback: NetworkScope::Unknown,
            hostname_fallback: NetworkScope::Unknown,
        }
    }

    /// Conventional addressing: private and loopback ranges are local,
    /// every other IP literal is public.
    #[must_use]
    pub fn standard() -> Self {
        let cidr = |network: IpAddr, prefix: u8, scope| ScopeRule {
            matcher: ScopeMatcher::Cidr(Cidr { network, prefix }),
            scope,
        };
        let v4 = |a, b, c, d| IpAddr::V4(Ipv4Addr::new(a, b, c, d));
        let v6 = |head: u16| IpAddr::V6(Ipv6Addr::new(head, 0, 0, 0, 0, 0, 0, 0));
        Self {
            rules: vec![
                cidr(v4(127, 0, 0, 0), 8, NetworkScope::MachineLocal),
                cidr(IpAddr::V6(Ipv6Addr::LOCALHOST), 128, NetworkScope::MachineLocal),
                cidr(v4(169, 254, 0, 0), 16, NetworkScope::LinkLocal),
                cidr(v6(0xfe80), 10, NetworkScope::LinkLocal),
                cidr(v4(10, 0, 0, 0), 8, NetworkScope::CloudLocal),
                cidr(v4(172, 16, 0, 0), 12, NetworkScope::CloudLocal),
                cidr(v4(192, 168, 0, 0), 16, NetworkScope::CloudLocal),
                cidr(v6(0xfc00), 7, NetworkScope::CloudLocal),
                ScopeRule {
                    matcher: ScopeMatcher::HostSuffix(".internal".to_string()),
                    scope: NetworkScope::CloudLocal,
                },
                ScopeRule {
                    matcher: ScopeMatcher::HostSuffix("localhost".to_string()),
                    scope: NetworkScope::MachineLocal,
                },
            ],
            ip_fallback: NetworkScope::Public,
            hostname_fallback: NetworkScope::Unknown,
        }
    }

    /// Append a rule.
    #[must_use]
    pub fn with_rule(mut self, matcher: ScopeMatcher, scope: NetworkScope) -> Self {
        self.rules.push(ScopeRule { matcher, scope });
        self
    }

    /// Classify a raw endpoint. Never fails.
    #[must_use]
    pub fn classify(&self, raw: &str) -> Address {
        // Trailing dots are dropped before the IP check so "10.0.0.1." and
        // its canonical value classify alike.
        let trimmed = raw
            .trim_start()
            .trim_end_matches(|c: char| c == '.' || c.is_whitespace());
        let unbracketed = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .unwrap_or(trimmed);

        if let Ok(ip) = unbracketed.parse::<IpAddr>() {
            let kind = if ip.is_ipv4() {
                AddressKind::Ipv4
            } else {
                AddressKind::Ipv6
            };
            let value = ip.to_string();
            let scope = self.lookup(&value, Some(&ip), self.ip_fallback);
            return Address { value, kind, scope };
        }

        let value = trimmed.to_ascii_lowercase();
        let scope = if value.is_empty() {
            NetworkScope::Unknown
        } else {
            self.lookup(&value, None, self.hostname_fallback)
        };
        Address {
            value,
            kind: AddressKind::HostName,
            scope,
        }
    }

    /// Classify every endpoint, preserving order.
    #[must_use]
    pub fn classify_all<S: AsRef<str>>(&self, raw: &[S]) -> Vec<Address> {
        raw.iter().map(|r| self.classify(r.as_ref())).collect()
    }

    fn lookup(&self, value: &str, ip: Option<&IpAddr>, fallback: NetworkScope) -> NetworkScope {
        self.rules
            .iter()
            .find(|rule| rule.matcher.matches(value, ip))
            .map_or(fallback, |rule| rule.scope)
    }
}

/// Pick the address to advertise for `scope`, preferring host names.
#[must_use]
pub fn select_address(addresses: &[Address], scope: NetworkScope) -> Option<&Address> {
    addresses
        .iter()
        .filter(|a| a.scope == scope)
        .min_by_key(|a| a.kind != AddressKind::HostName)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ec2_like() -> ScopeRules {
        ScopeRules::empty()
            .with_rule(
                ScopeMatcher::HostSuffix(".internal.invalid".into()),
                NetworkScope::CloudLocal,
            )
            .with_rule(
                ScopeMatcher::HostSuffix(".testing.invalid".into()),
                NetworkScope::Public,
            )
            .with_rule(
                ScopeMatcher::Cidr("127.0.0.0/24".parse().unwrap()),
                NetworkScope::CloudLocal,
            )
            .with_rule(
                ScopeMatcher::Cidr("8.0.0.0/24".parse().unwrap()),
                NetworkScope::Public,
            )
    }

    #[test]
    fn test_kind_detection() {
        let rules = ScopeRules::empty();
        assert_eq!(rules.classify("10.0.0.1").kind, AddressKind::Ipv4);
        assert_eq!(rules.classify("2001:db8::1").kind, AddressKind::Ipv6);
        assert_eq!(rules.classify("[2001:db8::1]").kind, AddressKind::Ipv6);
        assert_eq!(rules.classify("example.com").kind, AddressKind::HostName);
        assert_eq!(rules.classify("10.0.0.256").kind, AddressKind::HostName);
    }

    #[test]
    fn test_unrecognised_is_unknown() {
        let rules = ScopeRules::empty();
        for raw in ["10.0.0.1", "example.com", "", "   ", "not an address!"] {
            assert_eq!(rules.classify(raw).scope, NetworkScope::Unknown, "{raw:?}");
        }
    }

    #[test]
    fn test_backend_table() {
        let rules = ec2_like();
        let cases = [
            ("i-1.testing.invalid", AddressKind::HostName, NetworkScope::Public),
            ("ip-1.internal.invalid", AddressKind::HostName, NetworkScope::CloudLocal),
            ("8.0.0.5", AddressKind::Ipv4, NetworkScope::Public),
            ("127.0.0.5", AddressKind::Ipv4, NetworkScope::CloudLocal),
        ];
        for (raw, kind, scope) in cases {
            let addr = rules.classify(raw);
            assert_eq!(addr.kind, kind, "{raw}");
            assert_eq!(addr.scope, scope, "{raw}");
        }
    }

    #[test]
    fn test_standard_table() {
        let rules = ScopeRules::standard();
        assert_eq!(rules.classify("10.1.2.3").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("172.20.0.1").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("172.32.0.1").scope, NetworkScope::Public);
        assert_eq!(rules.classify("192.168.1.1").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("127.0.0.1").scope, NetworkScope::MachineLocal);
        assert_eq!(rules.classify("::1").scope, NetworkScope::MachineLocal);
        assert_eq!(rules.classify("169.254.169.254").scope, NetworkScope::LinkLocal);
        assert_eq!(rules.classify("fe80::1").scope, NetworkScope::LinkLocal);
        assert_eq!(rules.classify("fd00::1").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("8.8.8.8").scope, NetworkScope::Public);
        assert_eq!(rules.classify("2001:db8::1").scope, NetworkScope::Public);
        assert_eq!(rules.classify("ip-10.ec2.internal").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("example.com").scope, NetworkScope::Unknown);
    }

    #[test]
    fn test_classify_is_idempotent() {
        let rules = ScopeRules::standard();
        for raw in [
            " 10.0.0.1 ",
            "[2001:DB8:0:0::1]",
            "Host.Example.COM.",
            "ip-10.EC2.Internal",
            "",
            "0000:0000::0001",
            "10.0.0.1.",
            "[fd00::1].",
            "Host.Example.COM . ",
            "...",
            " 8.8.8.8 .",
        ] {
            let first = rules.classify(raw);
            let second = rules.classify(&first.value);
            assert_eq!(first, second, "{raw:?}");
        }
    }

    #[test]
    fn test_trailing_dot_ip_is_an_ip() {
        let addr = ScopeRules::standard().classify("10.0.0.1.");
        assert_eq!(addr.value, "10.0.0.1");
        assert_eq!(addr.kind, AddressKind::Ipv4);
        assert_eq!(addr.scope, NetworkScope::CloudLocal);
    }

    #[test]
    fn test_host_suffix_matches_whole_labels() {
        let rules = ScopeRules::standard();
        assert_eq!(rules.classify("localhost").scope, NetworkScope::MachineLocal);
        assert_eq!(rules.classify("db.localhost").scope, NetworkScope::MachineLocal);
        assert_eq!(rules.classify("notlocalhost").scope, NetworkScope::Unknown);
        assert_eq!(rules.classify("ip-10.ec2.internal").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("xinternal").scope, NetworkScope::Unknown);
    }

    #[test]
    fn test_rules_yaml_round_trip() {
        let rules = ScopeRules::standard();
        let yaml = serde_yaml::to_string(&rules).unwrap();
        assert!(yaml.contains("cidr:"), "{yaml}");
        let back: ScopeRules = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, rules);
    }

    #[test]
    fn test_cidr_parsing() {
        assert!("10.0.0.0/33".parse::<Cidr>().is_err());
        assert!("10.0.0.0".parse::<Cidr>().is_err());
        let any: Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(&"203.0.113.9".parse().unwrap()));
        assert!(!any.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_rules_from_yaml() {
        let yaml = r"
rules:
  - match: { cidr: 10.0.0.0/8 }
    scope: cloud-local
  - match: { host-suffix: .compute.example }
    scope: public
ip-fallback: public
";
        let rules: ScopeRules = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(rules.classify("10.9.9.9").scope, NetworkScope::CloudLocal);
        assert_eq!(rules.classify("vm1.compute.example").scope, NetworkScope::Public);
        assert_eq!(rules.classify("1.1.1.1").scope, NetworkScope::Public);
        assert_eq!(rules.classify("other.example").scope, NetworkScope::Unknown);
    }

    #[test]
    fn test_select_address_prefers_hostname() {
        let rules = ec2_like();
        let addrs = rules.classify_all(&["8.0.0.1", "i-1.testing.invalid", "127.0.0.1"]);
        let public = select_address(&addrs, NetworkScope::Public).unwrap();
        assert_eq!(public.value, "i-1.testing.invalid");
        let local = select_address(&addrs, NetworkScope::CloudLocal).unwrap();
        assert_eq!(local.value, "127.0.0.1");
        assert!(select_address(&addrs, NetworkScope::LinkLocal).is_none());
    }
}
