//! VPN providers and server selection.
//!
//! Every [`ProviderId`] maps to exactly one [`Provider`] held by the
//! [`Registry`]. A provider reads candidates from the shared [`Storage`],
//! picks one with its own [`SelectionRng`] and, when it has an updater,
//! refreshes its slice of the catalog.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::models::{Protocol, SelectionSpec, Server};
use crate::storage::Storage;

pub mod registry;
pub mod selection;
pub mod updaters;

pub use registry::Registry;
pub use selection::SelectionRng;
use updaters::CatalogUpdater;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Custom,
    Cyberghost,
    Expressvpn,
    Fastestvpn,
    HideMyAss,
    Ipvanish,
    Ivpn,
    Mullvad,
    Nordvpn,
    Perfectprivacy,
    Privado,
    PrivateInternetAccess,
    Privatevpn,
    Protonvpn,
    Purevpn,
    Surfshark,
    Torguard,
    VpnUnlimited,
    Vyprvpn,
    Wevpn,
    Windscribe,
}

impl ProviderId {
    /// Every known provider. The registry is checked against this list.
    pub const ALL: [ProviderId; 21] = [
        ProviderId::Custom,
        ProviderId::Cyberghost,
        ProviderId::Expressvpn,
        ProviderId::Fastestvpn,
        ProviderId::HideMyAss,
        ProviderId::Ipvanish,
        ProviderId::Ivpn,
        ProviderId::Mullvad,
        ProviderId::Nordvpn,
        ProviderId::Perfectprivacy,
        ProviderId::Privado,
        ProviderId::PrivateInternetAccess,
        ProviderId::Privatevpn,
        ProviderId::Protonvpn,
        ProviderId::Purevpn,
        ProviderId::Surfshark,
        ProviderId::Torguard,
        ProviderId::VpnUnlimited,
        ProviderId::Vyprvpn,
        ProviderId::Wevpn,
        ProviderId::Windscribe,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderId::Custom => "custom",
            ProviderId::Cyberghost => "cyberghost",
            ProviderId::Expressvpn => "expressvpn",
            ProviderId::Fastestvpn => "fastestvpn",
            ProviderId::HideMyAss => "hidemyass",
            ProviderId::Ipvanish => "ipvanish",
            ProviderId::Ivpn => "ivpn",
            ProviderId::Mullvad => "mullvad",
            ProviderId::Nordvpn => "nordvpn",
            ProviderId::Perfectprivacy => "perfectprivacy",
            ProviderId::Privado => "privado",
            ProviderId::PrivateInternetAccess => "privateinternetaccess",
            ProviderId::Privatevpn => "privatevpn",
            ProviderId::Protonvpn => "protonvpn",
            ProviderId::Purevpn => "purevpn",
            ProviderId::Surfshark => "surfshark",
            ProviderId::Torguard => "torguard",
            ProviderId::VpnUnlimited => "vpnunlimited",
            ProviderId::Vyprvpn => "vyprvpn",
            ProviderId::Wevpn => "wevpn",
            ProviderId::Windscribe => "windscribe",
        }
    }

    /// Position in [`ProviderId::ALL`].
    #[must_use]
    pub fn ordinal(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = AppError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        // "Private Internet Access", "vpn-unlimited" and the like
        let wanted: String = s
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();
        match wanted.as_str() {
            "proton" => return Ok(ProviderId::Protonvpn),
            "vypr" => return Ok(ProviderId::Vyprvpn),
            "pia" => return Ok(ProviderId::PrivateInternetAccess),
            "hma" => return Ok(ProviderId::HideMyAss),
            _ => {}
        }
        ProviderId::ALL
            .into_iter()
            .find(|id| id.as_str() == wanted)
            .ok_or_else(|| AppError::UnknownProvider(s.to_string()))
    }
}

/// Sink for non-fatal problems found while refreshing catalogs.
pub trait Warner: Send + Sync {
    fn warn(&self, message: &str);
}

/// Forwards warnings to the log.
pub struct LogWarner;

impl Warner for LogWarner {
    fn warn(&self, message: &str) {
        warn!(warning = message, "provider_warning");
    }
}

pub struct Provider {
    id: ProviderId,
    storage: Arc<dyn Storage>,
    warner: Arc<dyn Warner>,
    rng: SelectionRng,
    updater: Option<Box<dyn CatalogUpdater>>,
}

impl Provider {
    pub fn new(
        id: ProviderId,
        storage: Arc<dyn Storage>,
        warner: Arc<dyn Warner>,
        rng: SelectionRng,
        updater: Option<Box<dyn CatalogUpdater>>,
    ) -> Self {
        Self {
            id,
            storage,
            warner,
            rng,
            updater,
        }
    }

    #[must_use]
    pub fn id(&self) -> ProviderId {
        self.id
    }

    #[must_use]
    pub fn supports_update(&self) -> bool {
        self.updater.is_some()
    }

    #[must_use]
    pub fn seed(&self) -> u64 {
        self.rng.seed()
    }

    /// Pick one server matching `spec`, uniformly among the candidates.
    pub fn select_server(&self, spec: &SelectionSpec) -> Result<Server> {
        if self.id == ProviderId::Custom {
            return custom_server(spec);
        }
        let candidates = self.storage.filter_servers(self.id, spec)?;
        if candidates.is_empty() {
            return Err(AppError::NoMatchingServer { provider: self.id });
        }
        let index = self.rng.pick(candidates.len());
        let server = candidates[index].clone();
        debug!(
            provider = %self.id,
            candidates = candidates.len(),
            index,
            server = %server.name,
            "provider_server_selected"
        );
        Ok(server)
    }

    pub fn select_server_by_name(&self, name: &str) -> Result<Server> {
        if self.id == ProviderId::Custom {
            let spec = SelectionSpec {
                hostnames: [name.to_string()].into(),
                ..Default::default()
            };
            return custom_server(&spec);
        }
        self.storage
            .get_server_by_name(self.id, name)
            .ok_or_else(|| AppError::ServerNotFound {
                provider: self.id,
                name: name.to_string(),
            })
    }

    /// Fetch a fresh catalog and swap it in. On error the previous catalog stays.
    /// Returns the number of servers stored.
    pub fn update_servers(&self) -> Result<usize> {
        let updater = self
            .updater
            .as_ref()
            .ok_or(AppError::UpdateUnsupported(self.id))?;

        info!(provider = %self.id, "catalog_update_start");
        let fetched = updater.fetch(self.id)?;
        let total = fetched.len();

        let mut names = BTreeSet::new();
        let mut servers = Vec::with_capacity(total);
        for server in fetched {
            if let Err(problem) = server.validate() {
                self.warner.warn(&format!("{}: skipping {}", self.id, problem));
                continue;
            }
            if !names.insert(server.name.to_ascii_lowercase()) {
                self.warner
                    .warn(&format!("{}: duplicate server name {:?}", self.id, server.name));
                continue;
            }
            servers.push(server);
        }
        if servers.is_empty() {
            return Err(AppError::Catalog(format!(
                "{} update returned no usable servers ({} fetched)",
                self.id, total
            )));
        }

        let count = servers.len();
        self.storage.set_servers(self.id, servers)?;
        info!(provider = %self.id, servers = count, skipped = total - count, "catalog_update_done");
        Ok(count)
    }
}

/// The custom provider has no catalog: the caller names exactly one host.
fn custom_server(spec: &SelectionSpec) -> Result<Server> {
    let mut hosts = spec.hostnames.iter();
    let (Some(host), None) = (hosts.next(), hosts.next()) else {
        return Err(AppError::NoMatchingServer {
            provider: ProviderId::Custom,
        });
    };
    let protocols: BTreeSet<Protocol> = if spec.protocols.is_empty() {
        [Protocol::OpenVpnUdp, Protocol::OpenVpnTcp, Protocol::WireGuard].into()
    } else {
        spec.protocols.clone()
    };
    Ok(Server {
        provider: ProviderId::Custom,
        name: host.clone(),
        hostname: host.clone(),
        region: String::new(),
        country: String::new(),
        city: String::new(),
        ips: host.parse::<IpAddr>().into_iter().collect(),
        protocols,
        wg_public_key: None,
        tags: BTreeSet::new(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::thread;

    use super::*;
    use crate::models::server::make_server;
    use crate::storage::CatalogStore;

    #[derive(Default)]
    pub(crate) struct RecordingWarner(pub Mutex<Vec<String>>);

    impl Warner for RecordingWarner {
        fn warn(&self, message: &str) {
            self.0.lock().unwrap().push(message.to_string());
        }
    }

    struct FixedUpdater(Result<Vec<Server>>);

    impl CatalogUpdater for FixedUpdater {
        fn fetch(&self, _provider: ProviderId) -> Result<Vec<Server>> {
            match &self.0 {
                Ok(servers) => Ok(servers.clone()),
                Err(e) => Err(AppError::Other(e.to_string())),
            }
        }
    }

    /// Alternates between two catalogs of different sizes on every fetch.
    struct GenerationUpdater(AtomicUsize);

    impl CatalogUpdater for GenerationUpdater {
        fn fetch(&self, provider: ProviderId) -> Result<Vec<Server>> {
            let round = self.0.fetch_add(1, Ordering::SeqCst);
            let (prefix, count) = if round % 2 == 0 { ("new", 80) } else { ("old", 50) };
            Ok((0..count)
                .map(|i| make_server(provider, &format!("{prefix}-{i:03}"), "SE", "Stockholm", &[Protocol::WireGuard]))
                .collect())
        }
    }

    fn seeded_store() -> Arc<CatalogStore> {
        let store = CatalogStore::new();
        let servers = (0..10)
            .map(|i| {
                make_server(
                    ProviderId::Mullvad,
                    &format!("se-sto-wg-{i:03}"),
                    "SE",
                    "Stockholm",
                    &[Protocol::WireGuard],
                )
            })
            .chain(std::iter::once(make_server(
                ProviderId::Mullvad,
                "ch-zrh-ovpn-001",
                "CH",
                "Zurich",
                &[Protocol::OpenVpnUdp],
            )))
            .collect();
        store.set_servers(ProviderId::Mullvad, servers).unwrap();
        Arc::new(store)
    }

    fn provider(
        store: Arc<CatalogStore>,
        seed: u64,
        updater: Option<Box<dyn CatalogUpdater>>,
        warner: Arc<dyn Warner>,
    ) -> Provider {
        Provider::new(ProviderId::Mullvad, store, warner, SelectionRng::from_seed(seed), updater)
    }

    #[test]
    fn test_selection_deterministic_for_seed() {
        let store = seeded_store();
        let a = provider(Arc::clone(&store), 99, None, Arc::new(LogWarner));
        let b = provider(store, 99, None, Arc::new(LogWarner));
        let spec = SelectionSpec {
            countries: ["SE".to_string()].into(),
            ..Default::default()
        };
        for _ in 0..20 {
            assert_eq!(
                a.select_server(&spec).unwrap().name,
                b.select_server(&spec).unwrap().name
            );
        }
    }

    #[test]
    fn test_selection_respects_filter() {
        let p = provider(seeded_store(), 7, None, Arc::new(LogWarner));
        let spec = SelectionSpec {
            protocols: [Protocol::OpenVpnUdp].into(),
            ..Default::default()
        };
        for _ in 0..10 {
            assert_eq!(p.select_server(&spec).unwrap().name, "ch-zrh-ovpn-001");
        }
    }

    #[test]
    fn test_empty_match_is_error() {
        let p = provider(seeded_store(), 7, None, Arc::new(LogWarner));
        let spec = SelectionSpec {
            countries: ["JP".to_string()].into(),
            ..Default::default()
        };
        assert!(matches!(
            p.select_server(&spec),
            Err(AppError::NoMatchingServer {
                provider: ProviderId::Mullvad
            })
        ));
    }

    #[test]
    fn test_select_by_name() {
        let p = provider(seeded_store(), 7, None, Arc::new(LogWarner));
        assert_eq!(
            p.select_server_by_name("se-sto-wg-004").unwrap().city,
            "Stockholm"
        );
        match p.select_server_by_name("us-nyc-wg-001") {
            Err(AppError::ServerNotFound { provider, name }) => {
                assert_eq!(provider, ProviderId::Mullvad);
                assert_eq!(name, "us-nyc-wg-001");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_update_without_updater() {
        let p = provider(seeded_store(), 7, None, Arc::new(LogWarner));
        assert!(matches!(
            p.update_servers(),
            Err(AppError::UpdateUnsupported(ProviderId::Mullvad))
        ));
    }

    #[test]
    fn test_update_skips_invalid_and_warns() {
        let store = seeded_store();
        let warner = Arc::new(RecordingWarner::default());
        let mut broken = make_server(ProviderId::Mullvad, "de-fra-wg-002", "DE", "Frankfurt", &[Protocol::WireGuard]);
        broken.wg_public_key = None;
        let fresh = vec![
            make_server(ProviderId::Mullvad, "de-fra-wg-001", "DE", "Frankfurt", &[Protocol::WireGuard]),
            broken,
            make_server(ProviderId::Mullvad, "DE-FRA-WG-001", "DE", "Frankfurt", &[Protocol::WireGuard]),
        ];
        let p = provider(
            Arc::clone(&store),
            7,
            Some(Box::new(FixedUpdater(Ok(fresh)))),
            warner.clone(),
        );

        assert_eq!(p.update_servers().unwrap(), 1);
        assert_eq!(store.len(ProviderId::Mullvad), 1);
        assert_eq!(warner.0.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_failed_update_keeps_catalog() {
        let store = seeded_store();
        let before = store.servers(ProviderId::Mullvad);

        let failing = provider(
            Arc::clone(&store),
            7,
            Some(Box::new(FixedUpdater(Err(AppError::Other("503".into()))))),
            Arc::new(LogWarner),
        );
        assert!(failing.update_servers().is_err());
        assert_eq!(store.servers(ProviderId::Mullvad), before);

        let empty = provider(
            Arc::clone(&store),
            7,
            Some(Box::new(FixedUpdater(Ok(Vec::new())))),
            Arc::new(LogWarner),
        );
        assert!(matches!(empty.update_servers(), Err(AppError::Catalog(_))));
        assert_eq!(store.servers(ProviderId::Mullvad), before);
    }

    #[test]
    fn test_selection_during_update_sees_whole_catalog() {
        let store = Arc::new(CatalogStore::new());
        let updating = provider(
            Arc::clone(&store),
            3,
            Some(Box::new(GenerationUpdater(AtomicUsize::new(1)))),
            Arc::new(LogWarner),
        );
        assert_eq!(updating.update_servers().unwrap(), 50);
        let updating = Arc::new(updating);

        let selectors: Vec<_> = (0..4)
            .map(|seed| {
                let selecting = provider(Arc::clone(&store), seed, None, Arc::new(LogWarner));
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let server = selecting.select_server(&SelectionSpec::default()).unwrap();
                        assert!(server.name.starts_with("old-") || server.name.starts_with("new-"));
                        let len = store.len(ProviderId::Mullvad);
                        assert!(len == 50 || len == 80, "catalog of {len} servers");
                    }
                })
            })
            .collect();

        let writer = {
            let updating = Arc::clone(&updating);
            thread::spawn(move || {
                for _ in 0..50 {
                    let count = updating.update_servers().unwrap();
                    assert!(count == 50 || count == 80);
                }
            })
        };
        writer.join().unwrap();
        for selector in selectors {
            selector.join().unwrap();
        }

        let final_names = store.servers(ProviderId::Mullvad);
        let old = final_names.iter().filter(|s| s.name.starts_with("old-")).count();
        assert!(old == 0 || old == final_names.len());
    }

    #[test]
    fn test_custom_provider_needs_one_host() {
        let p = Provider::new(
            ProviderId::Custom,
            Arc::new(CatalogStore::new()),
            Arc::new(LogWarner),
            SelectionRng::from_seed(1),
            None,
        );
        let spec = SelectionSpec {
            hostnames: ["203.0.113.9".to_string()].into(),
            protocols: [Protocol::WireGuard].into(),
            ..Default::default()
        };
        let server = p.select_server(&spec).unwrap();
        assert_eq!(server.endpoint(), Some("203.0.113.9".parse().unwrap()));
        assert_eq!(server.protocols.len(), 1);

        assert!(p.select_server(&SelectionSpec::default()).is_err());
        let two = SelectionSpec {
            hostnames: ["a.example".to_string(), "b.example".to_string()].into(),
            ..Default::default()
        };
        assert!(p.select_server(&two).is_err());
        assert!(p.select_server_by_name("vpn.example.org").unwrap().ips.is_empty());
    }

    #[test]
    fn test_provider_id_parse() {
        assert_eq!("Mullvad".parse::<ProviderId>().unwrap(), ProviderId::Mullvad);
        assert_eq!("proton".parse::<ProviderId>().unwrap(), ProviderId::Protonvpn);
        assert_eq!(
            "Private Internet Access".parse::<ProviderId>().unwrap(),
            ProviderId::PrivateInternetAccess
        );
        assert_eq!("vpn-unlimited".parse::<ProviderId>().unwrap(), ProviderId::VpnUnlimited);
        assert!(matches!(
            "examplevpn".parse::<ProviderId>(),
            Err(AppError::UnknownProvider(_))
        ));
        for (i, id) in ProviderId::ALL.iter().enumerate() {
            assert_eq!(id.ordinal(), i);
            assert_eq!(id.as_str().parse::<ProviderId>().unwrap(), *id);
        }
    }
}
