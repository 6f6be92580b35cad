use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use tracing::debug;

use super::CatalogUpdater;
use crate::error::{AppError, Result};
use crate::http::Unzipper;
use crate::models::{Protocol, Server};
use crate::provider::ProviderId;

/// Providers that publish their servers only as a zip of OpenVPN profiles.
pub struct OvpnArchiveUpdater {
    url: &'static str,
    unzipper: Arc<dyn Unzipper>,
    locate: fn(&str) -> (String, String),
}

impl OvpnArchiveUpdater {
    pub fn ipvanish(unzipper: Arc<dyn Unzipper>) -> Self {
        Self {
            url: "https://configs.ipvanish.com/openvpn/v2.6.0-0/configs.zip",
            unzipper,
            locate: ipvanish_location,
        }
    }

    pub fn torguard(unzipper: Arc<dyn Unzipper>) -> Self {
        Self {
            url: "https://torguard.net/downloads/OpenVPN-UDP-Linux.zip",
            unzipper,
            locate: torguard_location,
        }
    }

    pub fn vyprvpn(unzipper: Arc<dyn Unzipper>) -> Self {
        Self {
            url: "https://support.vyprvpn.com/hc/article_attachments/360052617332/Vypr_OpenVPN_20200320.zip",
            unzipper,
            locate: vyprvpn_location,
        }
    }
}

impl CatalogUpdater for OvpnArchiveUpdater {
    fn fetch(&self, provider: ProviderId) -> Result<Vec<Server>> {
        let members = self.unzipper.fetch_and_extract(self.url)?;
        debug!(provider = %provider, members = members.len(), "ovpn_archive_extracted");
        servers_from_archive(provider, &members, self.locate)
    }
}

/// Connection parameters of one `.ovpn` profile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub remotes: Vec<String>,
    pub protocols: BTreeSet<Protocol>,
}

fn proto_of(token: &str) -> Option<Protocol> {
    match token.to_ascii_lowercase().as_str() {
        "udp" | "udp4" | "udp6" => Some(Protocol::OpenVpnUdp),
        "tcp" | "tcp4" | "tcp6" | "tcp-client" => Some(Protocol::OpenVpnTcp),
        _ => None,
    }
}

/// Read `remote` and `proto` directives. A remote without its own transport
/// uses the profile's `proto`, which defaults to UDP.
pub fn parse_profile(text: &str) -> Profile {
    let mut remotes = Vec::new();
    let mut explicit = BTreeSet::new();
    let mut bare_remote = false;
    let mut default_proto = Protocol::OpenVpnUdp;

    for line in text.lines() {
        let line = line.trim();
        if line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        let mut fields = line.split_whitespace();
        match fields.next() {
            Some("remote") => {
                let Some(host) = fields.next() else {
                    continue;
                };
                if !remotes.iter().any(|r| r == host) {
                    remotes.push(host.to_string());
                }
                match fields.nth(1).and_then(proto_of) {
                    Some(proto) => {
                        explicit.insert(proto);
                    }
                    None => bare_remote = true,
                }
            }
            Some("proto") => {
                if let Some(proto) = fields.next().and_then(proto_of) {
                    default_proto = proto;
                }
            }
            _ => {}
        }
    }
    let mut protocols = explicit;
    if bare_remote {
        protocols.insert(default_proto);
    }
    Profile { remotes, protocols }
}

pub fn servers_from_archive(
    provider: ProviderId,
    members: &BTreeMap<String, Vec<u8>>,
    locate: fn(&str) -> (String, String),
) -> Result<Vec<Server>> {
    let mut servers: Vec<Server> = Vec::new();
    for (path, body) in members {
        let Some(stem) = path
            .rsplit('/')
            .next()
            .and_then(|file| file.strip_suffix(".ovpn"))
        else {
            continue;
        };
        let profile = parse_profile(&String::from_utf8_lossy(body));
        let Some(host) = profile.remotes.first() else {
            continue;
        };
        let ips: Vec<IpAddr> = profile
            .remotes
            .iter()
            .filter_map(|r| r.parse().ok())
            .collect();

        if let Some(existing) = servers.iter_mut().find(|s| &s.hostname == host) {
            existing.protocols.extend(profile.protocols);
            continue;
        }
        let (country, city) = locate(stem);
        servers.push(Server {
            provider,
            name: stem.to_string(),
            hostname: host.clone(),
            region: String::new(),
            country,
            city,
            ips,
            protocols: profile.protocols,
            wg_public_key: None,
            tags: BTreeSet::new(),
        });
    }
    if servers.is_empty() {
        return Err(AppError::Catalog(format!(
            "{provider} archive contained no usable .ovpn profiles"
        )));
    }
    Ok(servers)
}

/// `ipvanish-US-New-York-nyc-a01` -> (`US`, `New York`)
fn ipvanish_location(stem: &str) -> (String, String) {
    let rest = stem.strip_prefix("ipvanish-").unwrap_or(stem);
    let parts: Vec<&str> = rest.split('-').collect();
    match parts.as_slice() {
        [country, city @ .., _code, _server] => (country.to_string(), city.join(" ")),
        [country, ..] => (country.to_string(), String::new()),
        [] => (String::new(), String::new()),
    }
}

/// `TorGuard.USA-NEW-YORK` -> (`USA`, `NEW YORK`)
fn torguard_location(stem: &str) -> (String, String) {
    let rest = stem.strip_prefix("TorGuard.").unwrap_or(stem);
    match rest.split_once('-') {
        Some((country, city)) => (country.to_string(), city.replace('-', " ")),
        None => (rest.to_string(), String::new()),
    }
}

/// `Netherlands - Amsterdam` -> (`Netherlands`, `Amsterdam`)
fn vyprvpn_location(stem: &str) -> (String, String) {
    match stem.split_once(" - ") {
        Some((country, city)) => (country.trim().to_string(), city.trim().to_string()),
        None => (stem.trim().to_string(), String::new()),
    }
}
