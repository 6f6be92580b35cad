use std::collections::BTreeSet;

use reqwest::blocking::Client;
use serde::Deserialize;

use super::{country_code, CatalogUpdater};
use crate::error::{AppError, Result};
use crate::http;
use crate::models::{Protocol, Server};
use crate::provider::ProviderId;

const LOGICALS_URL: &str = "https://api.protonvpn.ch/vpn/logicals";
const CODE_SUCCESS: i64 = 1000;

/// Feature bitmask values of a logical server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerFeature {
    SecureCore = 1,
    Tor = 2,
    P2P = 4,
    Streaming = 8,
    Ipv6 = 16,
}

impl ServerFeature {
    const ALL: [ServerFeature; 5] = [
        ServerFeature::SecureCore,
        ServerFeature::Tor,
        ServerFeature::P2P,
        ServerFeature::Streaming,
        ServerFeature::Ipv6,
    ];

    fn tag(self) -> &'static str {
        match self {
            ServerFeature::SecureCore => "secure-core",
            ServerFeature::Tor => "tor",
            ServerFeature::P2P => "p2p",
            ServerFeature::Streaming => "streaming",
            ServerFeature::Ipv6 => "ipv6",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct PhysicalServer {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "EntryIP")]
    pub entry_ip: String,
    pub domain: String,
    pub status: i32,
    #[serde(rename = "X25519PublicKey")]
    pub x25519_public_key: Option<String>,
}

impl PhysicalServer {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == 1
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogicalServer {
    pub name: String,
    pub exit_country: String,
    pub domain: String,
    pub tier: i32,
    pub features: i32,
    pub region: Option<String>,
    pub city: Option<String>,
    pub status: i32,
    pub servers: Vec<PhysicalServer>,
}

impl LogicalServer {
    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.status == 1
    }

    #[must_use]
    pub fn has_feature(&self, feature: ServerFeature) -> bool {
        self.features & (feature as i32) != 0
    }

    /// First enabled physical server with a WireGuard key.
    #[must_use]
    pub fn best_physical(&self) -> Option<&PhysicalServer> {
        self.servers
            .iter()
            .find(|s| s.is_enabled() && s.x25519_public_key.is_some())
    }

    fn tags(&self) -> BTreeSet<String> {
        let mut tags: BTreeSet<String> = ServerFeature::ALL
            .into_iter()
            .filter(|f| self.has_feature(*f))
            .map(|f| f.tag().to_string())
            .collect();
        tags.insert(if self.tier == 0 { "free" } else { "plus" }.to_string());
        tags
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct LogicalsResponse {
    pub code: i64,
    pub logical_servers: Vec<LogicalServer>,
}

pub struct ProtonUpdater {
    client: Client,
}

impl ProtonUpdater {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl CatalogUpdater for ProtonUpdater {
    fn fetch(&self, provider: ProviderId) -> Result<Vec<Server>> {
        let response: LogicalsResponse =
            http::get_json(&self.client, LOGICALS_URL, "Proton logicals list")?;
        if response.code != CODE_SUCCESS {
            return Err(AppError::Other(format!(
                "Proton logicals list returned code {}",
                response.code
            )));
        }
        Ok(servers_from_logicals(provider, &response.logical_servers))
    }
}

/// Enabled logicals with at least one enabled physical server.
pub fn servers_from_logicals(provider: ProviderId, logicals: &[LogicalServer]) -> Vec<Server> {
    logicals
        .iter()
        .filter(|l| l.is_enabled())
        .filter_map(|logical| {
            let ips: Vec<_> = logical
                .servers
                .iter()
                .filter(|p| p.is_enabled())
                .filter_map(|p| p.entry_ip.parse().ok())
                .collect();
            if ips.is_empty() {
                return None;
            }
            let wg_public_key = logical
                .best_physical()
                .and_then(|p| p.x25519_public_key.clone());
            let mut protocols: BTreeSet<Protocol> =
                [Protocol::OpenVpnUdp, Protocol::OpenVpnTcp].into();
            if wg_public_key.is_some() {
                protocols.insert(Protocol::WireGuard);
            }
            Some(Server {
                provider,
                name: logical.name.clone(),
                hostname: logical.domain.clone(),
                region: logical.region.clone().unwrap_or_default(),
                country: country_code(&logical.exit_country),
                city: logical.city.clone().unwrap_or_default(),
                ips,
                protocols,
                wg_public_key,
                tags: logical.tags(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_logical(name: &str, country: &str, tier: i32, features: i32, status: i32) -> LogicalServer {
        LogicalServer {
            name: name.to_string(),
            exit_country: country.to_string(),
            domain: format!("{}.protonvpn.net", name.to_lowercase().replace('#', "-")),
            tier,
            features,
            region: None,
            city: Some("Zurich".to_string()),
            status,
            servers: vec![PhysicalServer {
                id: format!("phys-{}", name),
                entry_ip: "185.159.157.1".to_string(),
                domain: format!("node-{}.protonvpn.net", name.to_lowercase()),
                status: 1,
                x25519_public_key: Some("AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string()),
            }],
        }
    }

    #[test]
    fn test_logicals_to_servers() {
        let mut keyless = make_logical("US#2", "US", 2, 0, 1);
        keyless.servers[0].x25519_public_key = None;
        let logicals = vec![
            make_logical("CH#1", "ch", 0, 4 | 8, 1),
            keyless,
            make_logical("JP#1", "JP", 2, 1, 0),
        ];

        let servers = servers_from_logicals(ProviderId::Protonvpn, &logicals);
        assert_eq!(servers.len(), 2);

        let ch = &servers[0];
        assert_eq!(ch.country, "CH");
        assert!(ch.protocols.contains(&Protocol::WireGuard));
        let tags: Vec<_> = ch.tags.iter().map(String::as_str).collect();
        assert_eq!(tags, ["free", "p2p", "streaming"]);

        let us = &servers[1];
        assert!(!us.protocols.contains(&Protocol::WireGuard));
        assert!(us.tags.contains("plus"));
    }

    #[test]
    fn test_response_parsing() {
        let json = r#"{"Code": 1000, "LogicalServers": [{
            "ID": "l1", "Name": "SE#4", "EntryCountry": "SE", "ExitCountry": "SE",
            "Domain": "se-04.protonvpn.net", "Tier": 2, "Features": 16, "Region": null,
            "City": "Stockholm", "Score": 1.2, "Load": 40, "Status": 1,
            "Servers": [{"ID": "p1", "EntryIP": "185.159.156.10", "ExitIP": "185.159.156.11",
                         "Domain": "node-se-04.protonvpn.net", "Status": 1,
                         "X25519PublicKey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA="}]
        }]}"#;
        let response: LogicalsResponse = serde_json::from_str(json).unwrap();
        let servers = servers_from_logicals(ProviderId::Protonvpn, &response.logical_servers);
        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].hostname, "se-04.protonvpn.net");
        assert!(servers[0].tags.contains("ipv6"));
    }
}
