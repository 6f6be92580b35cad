use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use reqwest::blocking::Client;
use tracing::{debug, info};

use super::updaters::{CatalogUpdater, IvpnUpdater, MullvadUpdater, OvpnArchiveUpdater, ProtonUpdater};
use super::{Provider, ProviderId, SelectionRng, Warner};
use crate::http::Unzipper;
use crate::storage::Storage;

/// One [`Provider`] per [`ProviderId`], built once at startup.
pub struct Registry {
    providers: HashMap<ProviderId, Provider>,
    warner: Arc<dyn Warner>,
}

impl Registry {
    /// Build every provider. Each gets its own generator seeded from `clock`
    /// (nanoseconds since the epoch) offset by the provider's ordinal.
    ///
    /// # Panics
    ///
    /// When a provider in [`ProviderId::ALL`] was not registered.
    pub fn new(
        storage: Arc<dyn Storage>,
        clock: impl Fn() -> SystemTime,
        warner: Arc<dyn Warner>,
        client: Client,
        unzipper: Arc<dyn Unzipper>,
    ) -> Self {
        let base_seed = clock()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        debug!(seed = base_seed, "registry_seeded");

        let mut providers = HashMap::with_capacity(ProviderId::ALL.len());
        let mut register = |id: ProviderId, updater: Option<Box<dyn CatalogUpdater>>| {
            let rng = SelectionRng::from_seed(base_seed.wrapping_add(id.ordinal() as u64));
            let provider = Provider::new(id, Arc::clone(&storage), Arc::clone(&warner), rng, updater);
            providers.insert(id, provider);
        };

        // Catalogs for these come from `servers.json` only.
        for id in [
            ProviderId::Custom,
            ProviderId::Cyberghost,
            ProviderId::Expressvpn,
            ProviderId::Fastestvpn,
            ProviderId::HideMyAss,
            ProviderId::Nordvpn,
            ProviderId::Perfectprivacy,
            ProviderId::Privado,
            ProviderId::PrivateInternetAccess,
            ProviderId::Privatevpn,
            ProviderId::Purevpn,
            ProviderId::Surfshark,
            ProviderId::VpnUnlimited,
            ProviderId::Wevpn,
            ProviderId::Windscribe,
        ] {
            register(id, None);
        }
        register(
            ProviderId::Ipvanish,
            Some(Box::new(OvpnArchiveUpdater::ipvanish(Arc::clone(&unzipper)))),
        );
        register(ProviderId::Ivpn, Some(Box::new(IvpnUpdater::new(client.clone()))));
        register(ProviderId::Mullvad, Some(Box::new(MullvadUpdater::new(client.clone()))));
        register(ProviderId::Protonvpn, Some(Box::new(ProtonUpdater::new(client))));
        register(
            ProviderId::Torguard,
            Some(Box::new(OvpnArchiveUpdater::torguard(Arc::clone(&unzipper)))),
        );
        register(
            ProviderId::Vyprvpn,
            Some(Box::new(OvpnArchiveUpdater::vyprvpn(unzipper))),
        );

        Self::from_providers(providers, warner)
    }

    /// # Panics
    ///
    /// When `providers` does not hold exactly one entry per [`ProviderId`].
    pub fn from_providers(providers: HashMap<ProviderId, Provider>, warner: Arc<dyn Warner>) -> Self {
        assert_eq!(
            providers.len(),
            ProviderId::ALL.len(),
            "provider registry holds {} providers, expected {}",
            providers.len(),
            ProviderId::ALL.len()
        );
        Self { providers, warner }
    }

    /// # Panics
    ///
    /// When `id` has no provider. Identifiers from user input are checked by
    /// `ProviderId::from_str` before they get here.
    #[must_use]
    pub fn get(&self, id: ProviderId) -> &Provider {
        match self.providers.get(&id) {
            Some(provider) => provider,
            None => panic!("provider {id} is not registered"),
        }
    }

    /// Providers in [`ProviderId::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = &Provider> {
        ProviderId::ALL.iter().map(|id| self.get(*id))
    }

    /// Refresh every provider that has an updater. Failures go to the warner
    /// and do not stop the others. Returns how many providers were refreshed.
    pub fn update_all(&self) -> usize {
        let mut refreshed = 0;
        let updatable = ProviderId::ALL
            .iter()
            .filter_map(|id| self.providers.get(id))
            .filter(|p| p.supports_update());
        for provider in updatable {
            match provider.update_servers() {
                Ok(_) => refreshed += 1,
                Err(e) => self
                    .warner
                    .warn(&format!("updating {} failed: {}", provider.id(), e)),
            }
        }
        info!(refreshed, "catalog_update_all_done");
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use super::super::tests::RecordingWarner;
    use super::*;
    use crate::config::HttpSettings;
    use crate::error::{AppError, Result};
    use crate::http;
    use crate::models::SelectionSpec;
    use crate::storage::CatalogStore;

    struct NoArchives;

    impl Unzipper for NoArchives {
        fn fetch_and_extract(&self, url: &str) -> Result<BTreeMap<String, Vec<u8>>> {
            Err(AppError::Other(format!("offline: {url}")))
        }
    }

    fn fixed_clock() -> SystemTime {
        UNIX_EPOCH + Duration::from_nanos(1_700_000_000_123_456_789)
    }

    fn registry(warner: Arc<dyn Warner>) -> Registry {
        let client = http::client(&HttpSettings::default()).unwrap();
        Registry::new(
            Arc::new(CatalogStore::new()),
            fixed_clock,
            warner,
            client,
            Arc::new(NoArchives),
        )
    }

    #[test]
    fn test_registry_is_complete() {
        let registry = registry(Arc::new(RecordingWarner::default()));
        for id in ProviderId::ALL {
            assert_eq!(registry.get(id).id(), id);
        }
        assert_eq!(registry.iter().count(), 21);
        let updatable: Vec<ProviderId> = registry
            .iter()
            .filter(|p| p.supports_update())
            .map(Provider::id)
            .collect();
        assert_eq!(
            updatable,
            [
                ProviderId::Ipvanish,
                ProviderId::Ivpn,
                ProviderId::Mullvad,
                ProviderId::Protonvpn,
                ProviderId::Torguard,
                ProviderId::Vyprvpn,
            ]
        );
    }

    #[test]
    fn test_catalog_only_provider_selects_from_storage() {
        let store = Arc::new(CatalogStore::new());
        store
            .set_servers(
                ProviderId::Nordvpn,
                vec![crate::models::server::make_server(
                    ProviderId::Nordvpn,
                    "se123",
                    "SE",
                    "Stockholm",
                    &[crate::models::Protocol::OpenVpnUdp],
                )],
            )
            .unwrap();
        let client = http::client(&HttpSettings::default()).unwrap();
        let registry = Registry::new(
            store,
            fixed_clock,
            Arc::new(RecordingWarner::default()),
            client,
            Arc::new(NoArchives),
        );
        let nord = registry.get(ProviderId::Nordvpn);
        assert_eq!(nord.select_server(&SelectionSpec::default()).unwrap().name, "se123");
        assert!(matches!(
            nord.update_servers(),
            Err(AppError::UpdateUnsupported(ProviderId::Nordvpn))
        ));
    }

    #[test]
    fn test_seeds_differ_per_provider_and_follow_clock() {
        let a = registry(Arc::new(RecordingWarner::default()));
        let b = registry(Arc::new(RecordingWarner::default()));
        let seeds: std::collections::BTreeSet<u64> = a.iter().map(Provider::seed).collect();
        assert_eq!(seeds.len(), ProviderId::ALL.len());
        for id in ProviderId::ALL {
            assert_eq!(a.get(id).seed(), b.get(id).seed());
        }
    }

    #[test]
    #[should_panic(expected = "provider registry holds 1 providers")]
    fn test_incomplete_registry_panics() {
        let mut providers = HashMap::new();
        providers.insert(
            ProviderId::Mullvad,
            Provider::new(
                ProviderId::Mullvad,
                Arc::new(CatalogStore::new()),
                Arc::new(RecordingWarner::default()),
                SelectionRng::from_seed(0),
                None,
            ),
        );
        let _ = Registry::from_providers(providers, Arc::new(RecordingWarner::default()));
    }

    #[test]
    #[should_panic(expected = "is not registered")]
    fn test_unknown_lookup_panics() {
        let registry = Registry {
            providers: HashMap::new(),
            warner: Arc::new(RecordingWarner::default()),
        };
        let _ = registry.get(ProviderId::Ivpn);
    }

    #[test]
    fn test_update_all_reports_failures() {
        let warner = Arc::new(RecordingWarner::default());
        let registry = Registry {
            providers: HashMap::from([(
                ProviderId::Vyprvpn,
                Provider::new(
                    ProviderId::Vyprvpn,
                    Arc::new(CatalogStore::new()),
                    warner.clone(),
                    SelectionRng::from_seed(0),
                    Some(Box::new(OvpnArchiveUpdater::vyprvpn(Arc::new(NoArchives)))),
                ),
            )]),
            warner: warner.clone(),
        };
        assert_eq!(registry.update_all(), 0);
        assert_eq!(warner.0.lock().unwrap().len(), 1);
        assert!(warner.0.lock().unwrap()[0].starts_with("updating vyprvpn failed: offline"));
        assert!(matches!(
            registry
                .providers[&ProviderId::Vyprvpn]
                .select_server(&SelectionSpec::default()),
            Err(AppError::NoMatchingServer { .. })
        ));
    }
}
