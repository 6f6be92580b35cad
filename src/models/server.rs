use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::provider::ProviderId;

/// Tunnel protocols a server accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Protocol {
    OpenVpnUdp,
    OpenVpnTcp,
    WireGuard,
}

impl Protocol {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::OpenVpnUdp => "openvpn-udp",
            Protocol::OpenVpnTcp => "openvpn-tcp",
            Protocol::WireGuard => "wireguard",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "openvpn-udp" | "udp" => Ok(Protocol::OpenVpnUdp),
            "openvpn-tcp" | "tcp" => Ok(Protocol::OpenVpnTcp),
            "wireguard" | "wg" => Ok(Protocol::WireGuard),
            other => Err(AppError::Other(format!("unknown protocol {other:?}"))),
        }
    }
}

/// One catalog entry. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub provider: ProviderId,
    pub name: String,
    pub hostname: String,
    #[serde(default)]
    pub region: String,
    #[serde(default)]
    pub country: String,
    #[serde(default)]
    pub city: String,
    #[serde(default)]
    pub ips: Vec<IpAddr>,
    pub protocols: BTreeSet<Protocol>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wg_public_key: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
}

impl Server {
    /// Address to dial: the first catalog IP, if any.
    #[must_use]
    pub fn endpoint(&self) -> Option<IpAddr> {
        self.ips.first().copied()
    }

    /// Catalog entries need a name, a hostname and at least one protocol.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err(format!("server with hostname {:?} has no name", self.hostname));
        }
        if self.hostname.trim().is_empty() {
            return Err(format!("server {:?} has no hostname", self.name));
        }
        if self.protocols.is_empty() {
            return Err(format!("server {:?} lists no protocols", self.name));
        }
        if self.protocols.contains(&Protocol::WireGuard) && self.wg_public_key.is_none() {
            return Err(format!("wireguard server {:?} has no public key", self.name));
        }
        Ok(())
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let protocols: Vec<&str> = self.protocols.iter().map(|p| p.as_str()).collect();
        write!(
            f,
            "{:<24} {:>2}  {:<16} {:<32} {}",
            self.name,
            self.country,
            self.city,
            self.hostname,
            protocols.join(",")
        )
    }
}

/// Filter for catalog lookups. An empty set leaves that dimension unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionSpec {
    pub regions: BTreeSet<String>,
    pub countries: BTreeSet<String>,
    pub cities: BTreeSet<String>,
    pub hostnames: BTreeSet<String>,
    pub names: BTreeSet<String>,
    pub protocols: BTreeSet<Protocol>,
    pub tags: BTreeSet<String>,
}

fn any_eq_ignore_case(wanted: &BTreeSet<String>, value: &str) -> bool {
    wanted.is_empty() || wanted.iter().any(|w| w.eq_ignore_ascii_case(value))
}

impl SelectionSpec {
    #[must_use]
    pub fn matches(&self, server: &Server) -> bool {
        any_eq_ignore_case(&self.regions, &server.region)
            && any_eq_ignore_case(&self.countries, &server.country)
            && any_eq_ignore_case(&self.cities, &server.city)
            && any_eq_ignore_case(&self.hostnames, &server.hostname)
            && any_eq_ignore_case(&self.names, &server.name)
            && (self.protocols.is_empty()
                || self.protocols.iter().any(|p| server.protocols.contains(p)))
            && self.tags.iter().all(|tag| {
                server
                    .tags
                    .iter()
                    .any(|have| have.eq_ignore_ascii_case(tag))
            })
    }
}

#[cfg(test)]
pub(crate) fn make_server(
    provider: ProviderId,
    name: &str,
    country: &str,
    city: &str,
    protocols: &[Protocol],
) -> Server {
    Server {
        provider,
        name: name.to_string(),
        hostname: format!("{}.example.net", name.to_lowercase()),
        region: "Europe".to_string(),
        country: country.to_string(),
        city: city.to_string(),
        ips: vec!["198.51.100.7".parse().unwrap()],
        protocols: protocols.iter().copied().collect(),
        wg_public_key: protocols
            .contains(&Protocol::WireGuard)
            .then(|| "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()),
        tags: BTreeSet::new(),
    }
}
