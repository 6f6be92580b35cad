//! Catalog updaters: fetch a provider's published server list and turn it
//! into [`Server`] entries. Validation and the catalog swap happen in
//! [`Provider::update_servers`](super::Provider::update_servers).

use crate::error::Result;
use crate::models::Server;
use crate::provider::ProviderId;

pub mod ivpn;
pub mod mullvad;
pub mod ovpn_archive;
pub mod proton;

pub use ivpn::IvpnUpdater;
pub use mullvad::MullvadUpdater;
pub use ovpn_archive::OvpnArchiveUpdater;
pub use proton::ProtonUpdater;

pub trait CatalogUpdater: Send + Sync {
    fn fetch(&self, provider: ProviderId) -> Result<Vec<Server>>;
}

/// Two-letter country codes are stored upper-case.
pub(crate) fn country_code(raw: &str) -> String {
    raw.trim().to_ascii_uppercase()
}
