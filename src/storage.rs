//! Server catalogs, one snapshot per provider.
//!
//! Readers clone the `Arc` of a provider's list under a short read lock and
//! filter outside it. Writers build the replacement list first and swap the
//! `Arc` under the write lock, so a selection sees either the old catalog or
//! the new one and never a mix. With a backing file the write happens under
//! the same lock, and the swap only follows a successful write.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::config;
use crate::error::{AppError, Result};
use crate::models::{SelectionSpec, Server};
use crate::provider::ProviderId;

/// Catalog access used by providers.
pub trait Storage: Send + Sync {
    fn filter_servers(&self, provider: ProviderId, spec: &SelectionSpec) -> Result<Vec<Server>>;
    fn get_server_by_name(&self, provider: ProviderId, name: &str) -> Option<Server>;
    /// Replace the whole catalog of `provider` in one step.
    fn set_servers(&self, provider: ProviderId, servers: Vec<Server>) -> Result<()>;
}

type Snapshot = Arc<Vec<Server>>;

#[derive(Default)]
pub struct CatalogStore {
    catalogs: RwLock<HashMap<ProviderId, Snapshot>>,
    path: Option<PathBuf>,
}

impl CatalogStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `servers.json` from the config directory; an absent file is an empty catalog.
    pub fn load() -> Result<Self> {
        Self::load_from(&config::catalog_path())
    }

    /// Load from `path` and write updates back to it.
    pub fn load_from(path: &Path) -> Result<Self> {
        let mut catalogs = HashMap::new();
        if path.exists() {
            let json = fs::read_to_string(path)?;
            let file: BTreeMap<ProviderId, Vec<Server>> = serde_json::from_str(&json)
                .map_err(|e| AppError::Catalog(format!("{}: {}", path.display(), e)))?;
            for (provider, servers) in file {
                if let Some(stray) = servers.iter().find(|s| s.provider != provider) {
                    return Err(AppError::Catalog(format!(
                        "server {:?} filed under {} belongs to {}",
                        stray.name, provider, stray.provider
                    )));
                }
                catalogs.insert(provider, Arc::new(servers));
            }
            debug!(path = %path.display(), providers = catalogs.len(), "catalog_loaded");
        }
        Ok(Self {
            catalogs: RwLock::new(catalogs),
            path: Some(path.to_path_buf()),
        })
    }

    fn snapshot(&self, provider: ProviderId) -> Snapshot {
        self.catalogs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&provider)
            .cloned()
            .unwrap_or_default()
    }

    /// All servers of `provider`.
    #[must_use]
    pub fn servers(&self, provider: ProviderId) -> Vec<Server> {
        self.snapshot(provider).as_ref().clone()
    }

    #[must_use]
    pub fn len(&self, provider: ProviderId) -> usize {
        self.snapshot(provider).len()
    }

    /// Write the catalogs to disk as they will look once `provider` holds
    /// `servers`. Called with the write lock held, before the swap.
    fn persist(
        &self,
        catalogs: &HashMap<ProviderId, Snapshot>,
        provider: ProviderId,
        servers: &[Server],
    ) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let mut file: BTreeMap<ProviderId, &[Server]> = catalogs
            .iter()
            .map(|(id, snapshot)| (*id, snapshot.as_slice()))
            .collect();
        file.insert(provider, servers);
        let json = serde_json::to_string_pretty(&file)?;
        config::write_private_file(path, json.as_bytes())?;
        Ok(())
    }
}

impl Storage for CatalogStore {
    fn filter_servers(&self, provider: ProviderId, spec: &SelectionSpec) -> Result<Vec<Server>> {
        let snapshot = self.snapshot(provider);
        Ok(snapshot.iter().filter(|s| spec.matches(s)).cloned().collect())
    }

    fn get_server_by_name(&self, provider: ProviderId, name: &str) -> Option<Server> {
        self.snapshot(provider)
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
            .cloned()
    }

    fn set_servers(&self, provider: ProviderId, servers: Vec<Server>) -> Result<()> {
        if let Some(stray) = servers.iter().find(|s| s.provider != provider) {
            return Err(AppError::Catalog(format!(
                "server {:?} belongs to {}, not {}",
                stray.name, stray.provider, provider
            )));
        }
        let count = servers.len();
        let mut catalogs = self.catalogs.write().unwrap_or_else(|e| e.into_inner());
        self.persist(&catalogs, provider, &servers)?;
        catalogs.insert(provider, Arc::new(servers));
        drop(catalogs);
        info!(provider = %provider, servers = count, "catalog_replaced");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::thread;

    use super::*;
    use crate::models::server::make_server;
    use crate::models::Protocol;

    fn numbered(provider: ProviderId, prefix: &str, count: usize) -> Vec<Server> {
        (0..count)
            .map(|i| make_server(provider, &format!("{prefix}-{i:03}"), "SE", "Stockholm", &[Protocol::WireGuard]))
            .collect()
    }

    #[test]
    fn test_filter_and_lookup() {
        let store = CatalogStore::new();
        store
            .set_servers(ProviderId::Mullvad, numbered(ProviderId::Mullvad, "se", 3))
            .unwrap();

        let all = store
            .filter_servers(ProviderId::Mullvad, &SelectionSpec::default())
            .unwrap();
        assert_eq!(all.len(), 3);
        assert!(store
            .filter_servers(ProviderId::Ivpn, &SelectionSpec::default())
            .unwrap()
            .is_empty());
        assert_eq!(
            store
                .get_server_by_name(ProviderId::Mullvad, "SE-001")
                .map(|s| s.name),
            Some("se-001".to_string())
        );
        assert!(store.get_server_by_name(ProviderId::Mullvad, "se-999").is_none());
    }

    #[test]
    fn test_set_servers_rejects_foreign_entries() {
        let store = CatalogStore::new();
        let err = store
            .set_servers(ProviderId::Ivpn, numbered(ProviderId::Mullvad, "se", 1))
            .unwrap_err();
        assert!(matches!(err, AppError::Catalog(_)));
        assert_eq!(store.len(ProviderId::Ivpn), 0);
    }

    #[test]
    fn test_persist_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("servers.json");

        let store = CatalogStore::load_from(&path).unwrap();
        assert_eq!(store.len(ProviderId::Mullvad), 0);
        store
            .set_servers(ProviderId::Mullvad, numbered(ProviderId::Mullvad, "se", 2))
            .unwrap();
        store
            .set_servers(ProviderId::Ivpn, numbered(ProviderId::Ivpn, "nl", 1))
            .unwrap();

        let reloaded = CatalogStore::load_from(&path).unwrap();
        assert_eq!(reloaded.servers(ProviderId::Mullvad), store.servers(ProviderId::Mullvad));
        assert_eq!(reloaded.len(ProviderId::Ivpn), 1);
    }

    #[test]
    fn test_failed_write_keeps_previous_catalog() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = CatalogStore::load_from(&dir.path().join("servers.json")).unwrap();
        store
            .set_servers(ProviderId::Mullvad, numbered(ProviderId::Mullvad, "se", 2))
            .unwrap();
        let before = store.servers(ProviderId::Mullvad);

        // A regular file where the catalog's parent directory should be.
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        store.path = Some(blocker.join("servers.json"));

        assert!(store
            .set_servers(ProviderId::Mullvad, numbered(ProviderId::Mullvad, "de", 5))
            .is_err());
        assert_eq!(store.servers(ProviderId::Mullvad), before);
        assert!(store
            .set_servers(ProviderId::Ivpn, numbered(ProviderId::Ivpn, "nl", 1))
            .is_err());
        assert_eq!(store.len(ProviderId::Ivpn), 0);
    }

    #[test]
    fn test_swap_is_atomic_for_readers() {
        let store = Arc::new(CatalogStore::new());
        store
            .set_servers(ProviderId::Mullvad, numbered(ProviderId::Mullvad, "old", 50))
            .unwrap();

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let seen = store
                            .filter_servers(ProviderId::Mullvad, &SelectionSpec::default())
                            .unwrap();
                        let old = seen.iter().filter(|s| s.name.starts_with("old-")).count();
                        let new = seen.iter().filter(|s| s.name.starts_with("new-")).count();
                        assert!(
                            (old == 50 && new == 0) || (old == 0 && new == 80),
                            "mixed catalog: {old} old, {new} new"
                        );
                    }
                })
            })
            .collect();

        for round in 0..50 {
            let (prefix, count) = if round % 2 == 0 { ("new", 80) } else { ("old", 50) };
            store
                .set_servers(ProviderId::Mullvad, numbered(ProviderId::Mullvad, prefix, count))
                .unwrap();
        }
        for reader in readers {
            reader.join().unwrap();
        }
    }
}
