use std::fs;
use std::path::Path;

use tracing::{info, warn};

use super::{RoutingConfigurator, SessionRecord, SetupParams};
use crate::config;
use crate::error::Result;
use crate::netlink::NetLinker;

impl SessionRecord {
    /// Persist to the default session file so a later process can tear down.
    pub fn save(&self) -> Result<()> {
        self.save_to(&config::session_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        config::write_private_file(path, json.as_bytes())?;
        info!(path = %path.display(), objects = self.installed.len(), "routing_session_saved");
        Ok(())
    }

    pub fn load() -> Result<Option<Self>> {
        Self::load_from(&config::session_path())
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>> {
        if !path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(path)?;
        Ok(Some(serde_json::from_str(&json)?))
    }

    pub fn remove() -> Result<()> {
        Self::remove_at(&config::session_path())
    }

    pub fn remove_at(path: &Path) -> Result<()> {
        if path.exists() {
            fs::remove_file(path)?;
            info!(path = %path.display(), "routing_session_removed");
        }
        Ok(())
    }
}

impl<N: NetLinker> RoutingConfigurator<N> {
    /// Set up routing and record the session at `path`.
    ///
    /// When either step fails everything this session holds is torn down,
    /// including a link from [`create_link`](Self::create_link), so no routing
    /// outlives the error without a record pointing at it.
    pub fn setup_recorded(&self, params: &SetupParams, path: &Path) -> Result<SessionRecord> {
        let result = self.setup(params).and_then(|()| {
            let session = self.session();
            session.save_to(path)?;
            Ok(session)
        });
        if result.is_err() {
            if let Err(cleanup) = self.teardown() {
                warn!(error = %cleanup, "routing_unrecorded_cleanup_failed");
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use nix::errno::Errno;

    use super::super::{Installed, OwnedLink, RoutingSettings};
    use super::*;
    use crate::netlink::{Family, LinkKind, MemoryNetLinker, Rule};

    fn params() -> SetupParams {
        SetupParams {
            link_name: "wg0".to_string(),
            assigned: "10.2.0.2/32".parse().unwrap(),
            server_endpoint: "198.51.100.7".parse().unwrap(),
            excluded: vec![],
            routed: vec![],
        }
    }

    #[test]
    fn test_setup_recorded_saves_session() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let linker = Arc::new(MemoryNetLinker::with_host_defaults());
        linker.insert_link("wg0", LinkKind::wireguard(), false);
        let configurator =
            RoutingConfigurator::new(Arc::clone(&linker), RoutingSettings::default()).unwrap();

        let session = configurator.setup_recorded(&params(), &path).unwrap();
        assert_eq!(session.installed.len(), 4);
        assert_eq!(SessionRecord::load_from(&path).unwrap(), Some(session));
    }

    #[test]
    fn test_unsaved_session_is_torn_down() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"").unwrap();
        let linker = Arc::new(MemoryNetLinker::with_host_defaults());
        let configurator =
            RoutingConfigurator::new(Arc::clone(&linker), RoutingSettings::default()).unwrap();
        configurator.create_link("wg0", &LinkKind::wireguard()).unwrap();
        let before = linker.snapshot();

        assert!(configurator
            .setup_recorded(&params(), &blocker.join("session.json"))
            .is_err());
        let state = linker.snapshot();
        assert!(state.rules.is_empty());
        assert!(state.routes.iter().all(|r| r.table != 51820));
        assert!(state.links.iter().all(|l| l.name != "wg0"));
        assert_eq!(state.addresses, before.addresses);
        assert!(!configurator.is_active());
    }

    #[test]
    fn test_failed_setup_deletes_created_link() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let linker = Arc::new(MemoryNetLinker::with_host_defaults());
        let configurator =
            RoutingConfigurator::new(Arc::clone(&linker), RoutingSettings::default()).unwrap();
        configurator.create_link("wg0", &LinkKind::wireguard()).unwrap();
        linker.fail_next("RuleAdd", Errno::EPERM);

        assert!(configurator.setup_recorded(&params(), &path).is_err());
        assert!(linker.link_by_name("wg0").unwrap_err().is_not_found());
        assert!(!path.exists());
    }

    #[test]
    fn test_session_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.json");
        let record = SessionRecord {
            link_name: Some("wg0".into()),
            owned_link: Some(OwnedLink {
                index: 7,
                name: "wg0".into(),
            }),
            installed: vec![Installed::Rule(Rule {
                family: Family::V4,
                source: None,
                destination: Some("198.51.100.7/32".parse().unwrap()),
                priority: 100,
                table: 254,
            })],
        };

        assert!(SessionRecord::load_from(&path).unwrap().is_none());
        record.save_to(&path).unwrap();
        assert_eq!(SessionRecord::load_from(&path).unwrap(), Some(record));

        SessionRecord::remove_at(&path).unwrap();
        assert!(!path.exists());
        SessionRecord::remove_at(&path).unwrap();
    }
}
