use std::collections::{BTreeSet, HashMap};
use std::net::IpAddr;

use reqwest::blocking::Client;
use serde::Deserialize;

use super::{country_code, CatalogUpdater};
use crate::error::Result;
use crate::http;
use crate::models::{Protocol, Server};
use crate::provider::ProviderId;

const RELAYS_URL: &str = "https://api.mullvad.net/app/v1/relays";

#[derive(Debug, Clone, Deserialize)]
pub struct MullvadManifest {
    pub locations: HashMap<String, MullvadLocation>,
    pub wireguard: MullvadRelays,
    #[serde(default)]
    pub openvpn: Option<MullvadRelays>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MullvadLocation {
    pub country: String,
    pub city: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MullvadRelays {
    pub relays: Vec<MullvadRelay>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MullvadRelay {
    pub hostname: String,
    /// Location key such as `se-sto`.
    pub location: String,
    pub active: bool,
    #[serde(default)]
    pub owned: bool,
    pub provider: String,
    pub ipv4_addr_in: String,
    #[serde(default)]
    pub ipv6_addr_in: Option<String>,
    #[serde(default)]
    pub public_key: Option<String>,
}

pub struct MullvadUpdater {
    client: Client,
}

impl MullvadUpdater {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl CatalogUpdater for MullvadUpdater {
    fn fetch(&self, provider: ProviderId) -> Result<Vec<Server>> {
        let manifest: MullvadManifest = http::get_json(&self.client, RELAYS_URL, "Mullvad relay list")?;
        Ok(servers_from_manifest(provider, &manifest))
    }
}

fn relay_server(
    provider: ProviderId,
    manifest: &MullvadManifest,
    relay: &MullvadRelay,
    protocols: BTreeSet<Protocol>,
) -> Server {
    let (country, city) = manifest
        .locations
        .get(&relay.location)
        .map(|l| (l.country.clone(), l.city.clone()))
        .unwrap_or_default();
    let mut ips: Vec<IpAddr> = relay.ipv4_addr_in.parse().into_iter().collect();
    ips.extend(
        relay
            .ipv6_addr_in
            .as_deref()
            .and_then(|ip| ip.parse::<IpAddr>().ok()),
    );
    let mut tags = BTreeSet::new();
    if relay.owned {
        tags.insert("owned".to_string());
    }
    if !relay.provider.is_empty() {
        tags.insert(format!("hosted-by:{}", relay.provider.to_ascii_lowercase()));
    }

    Server {
        provider,
        name: relay.hostname.clone(),
        hostname: format!("{}.relays.mullvad.net", relay.hostname),
        region: country_code(relay.location.split('-').next().unwrap_or_default()),
        country,
        city,
        ips,
        protocols,
        wg_public_key: relay.public_key.clone(),
        tags,
    }
}

/// Active relays only; WireGuard and OpenVPN relays are separate hosts.
pub fn servers_from_manifest(provider: ProviderId, manifest: &MullvadManifest) -> Vec<Server> {
    let wireguard = manifest
        .wireguard
        .relays
        .iter()
        .filter(|r| r.active)
        .map(|r| relay_server(provider, manifest, r, [Protocol::WireGuard].into()));
    let openvpn = manifest
        .openvpn
        .iter()
        .flat_map(|o| o.relays.iter())
        .filter(|r| r.active)
        .map(|r| {
            relay_server(
                provider,
                manifest,
                r,
                [Protocol::OpenVpnUdp, Protocol::OpenVpnTcp].into(),
            )
        });
    wireguard.chain(openvpn).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const FIXTURE: &str = r#"{
        "locations": {
            "se-sto": {"country": "Sweden", "city": "Stockholm", "latitude": 59.3, "longitude": 18.0},
            "ch-zrh": {"country": "Switzerland", "city": "Zurich"}
        },
        "wireguard": {
            "relays": [
                {"hostname": "se-sto-wg-001", "location": "se-sto", "active": true, "owned": true,
                 "provider": "31173", "ipv4_addr_in": "185.213.154.66", "ipv6_addr_in": "2a03:1b20:5:f011::a01f",
                 "public_key": "5JMPeO7gXIbR5CnUa/NPNK4L5GqUnreF0/Bozai4pl4="},
                {"hostname": "ch-zrh-wg-002", "location": "ch-zrh", "active": false,
                 "provider": "M247", "ipv4_addr_in": "193.32.127.67", "public_key": "x"}
            ],
            "port_ranges": [[53, 53]],
            "ipv4_gateway": "10.64.0.1"
        },
        "openvpn": {
            "relays": [
                {"hostname": "ch-zrh-ovpn-001", "location": "ch-zrh", "active": true,
                 "provider": "M247", "ipv4_addr_in": "193.32.127.80"}
            ]
        }
    }"#;

    #[test]
    fn test_manifest_to_servers() {
        let manifest: MullvadManifest = serde_json::from_str(FIXTURE).unwrap();
        let servers = servers_from_manifest(ProviderId::Mullvad, &manifest);
        assert_eq!(servers.len(), 2);

        let wg = &servers[0];
        assert_eq!(wg.name, "se-sto-wg-001");
        assert_eq!(wg.hostname, "se-sto-wg-001.relays.mullvad.net");
        assert_eq!(wg.country, "Sweden");
        assert_eq!(wg.region, "SE");
        assert_eq!(wg.ips.len(), 2);
        assert!(wg.tags.contains("owned"));
        assert!(wg.validate().is_ok());

        let ovpn = &servers[1];
        assert_eq!(ovpn.city, "Zurich");
        assert!(ovpn.protocols.contains(&Protocol::OpenVpnTcp));
        assert!(ovpn.wg_public_key.is_none());
        assert!(ovpn.validate().is_ok());
    }
}
