use std::collections::BTreeSet;

use reqwest::blocking::Client;
use serde::Deserialize;

use super::{country_code, CatalogUpdater};
use crate::error::Result;
use crate::http;
use crate::models::{Protocol, Server};
use crate::provider::ProviderId;

const SERVERS_URL: &str = "https://api.ivpn.net/v5/servers.json";

#[derive(Debug, Clone, Deserialize)]
pub struct IvpnManifest {
    #[serde(default)]
    pub wireguard: Vec<IvpnServer>,
    #[serde(default)]
    pub openvpn: Vec<IvpnServer>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IvpnServer {
    pub gateway: String,
    pub country_code: String,
    pub country: String,
    pub city: String,
    #[serde(default)]
    pub isp: String,
    pub hosts: Vec<IvpnHost>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IvpnHost {
    pub hostname: String,
    #[serde(default)]
    pub dns_name: String,
    pub host: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub load: f64,
}

pub struct IvpnUpdater {
    client: Client,
}

impl IvpnUpdater {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl CatalogUpdater for IvpnUpdater {
    fn fetch(&self, provider: ProviderId) -> Result<Vec<Server>> {
        let manifest: IvpnManifest = http::get_json(&self.client, SERVERS_URL, "IVPN server list")?;
        Ok(servers_from_manifest(provider, &manifest))
    }
}

fn host_servers<'a>(
    provider: ProviderId,
    group: &'a IvpnServer,
    protocols: &'a BTreeSet<Protocol>,
) -> impl Iterator<Item = Server> + 'a {
    group.hosts.iter().map(move |host| {
        let mut tags = BTreeSet::new();
        if !group.isp.is_empty() {
            tags.insert(format!("isp:{}", group.isp.to_ascii_lowercase()));
        }
        Server {
            provider,
            name: host.hostname.clone(),
            hostname: if host.dns_name.is_empty() {
                host.hostname.clone()
            } else {
                host.dns_name.clone()
            },
            region: group.gateway.split('.').next().unwrap_or_default().to_string(),
            country: country_code(&group.country_code),
            city: group.city.clone(),
            ips: host.host.parse().into_iter().collect(),
            protocols: protocols.clone(),
            wg_public_key: host.public_key.clone().filter(|k| !k.is_empty()),
            tags,
        }
    })
}

/// IVPN lists the same hostname under both protocols; those entries merge.
pub fn servers_from_manifest(provider: ProviderId, manifest: &IvpnManifest) -> Vec<Server> {
    let wireguard: BTreeSet<Protocol> = [Protocol::WireGuard].into();
    let openvpn: BTreeSet<Protocol> = [Protocol::OpenVpnUdp, Protocol::OpenVpnTcp].into();

    let mut servers: Vec<Server> = Vec::new();
    let entries = manifest
        .wireguard
        .iter()
        .flat_map(|g| host_servers(provider, g, &wireguard))
        .chain(
            manifest
                .openvpn
                .iter()
                .flat_map(|g| host_servers(provider, g, &openvpn)),
        );
    for entry in entries {
        match servers.iter_mut().find(|s| s.name == entry.name) {
            Some(existing) => {
                existing.protocols.extend(entry.protocols);
                if existing.wg_public_key.is_none() {
                    existing.wg_public_key = entry.wg_public_key;
                }
            }
            None => servers.push(entry),
        }
    }
    servers
}
