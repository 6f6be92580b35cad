//! Tunnel policy routing.
//!
//! [`RoutingConfigurator::setup`] takes the host from "no VPN" to "everything
//! except the server endpoint and excluded prefixes goes through the tunnel
//! link" using a dedicated routing table plus two tiers of policy rules:
//!
//! ```text
//!   prio exclusion_priority  to <server>/32      lookup main
//!   prio exclusion_priority  to <excluded net>   lookup main
//!   prio catch_all_priority  from all            lookup <table>
//!   table <table>:  default dev <tunnel>
//! ```
//!
//! Every object installed is recorded; a failed setup unwinds the record in
//! reverse before returning, and teardown walks the same record.

use std::collections::BTreeSet;
use std::fmt;
use std::net::IpAddr;
use std::sync::{Mutex, MutexGuard};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::netlink::{Address, Family, LinkKind, NetLinker, Route, Rule, MAIN_TABLE};

pub mod session;

/// Rule priority of the kernel's own `from all lookup main` rule.
const KERNEL_MAIN_RULE_PRIORITY: u32 = 32766;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoutingSettings {
    /// Dedicated table holding the tunnel routes.
    pub table: u32,
    /// Priority of the rules sending the server endpoint and excluded prefixes to main.
    pub exclusion_priority: u32,
    /// Priority of the rule sending everything else to `table`.
    pub catch_all_priority: u32,
}

impl Default for RoutingSettings {
    fn default() -> Self {
        Self {
            table: 51820,
            exclusion_priority: 100,
            catch_all_priority: 101,
        }
    }
}

impl RoutingSettings {
    pub fn validate(&self) -> Result<()> {
        if matches!(self.table, 0 | 253..=255) {
            return Err(AppError::Config(format!(
                "routing table {} is reserved by the kernel",
                self.table
            )));
        }
        if self.exclusion_priority >= self.catch_all_priority {
            return Err(AppError::Config(format!(
                "exclusion priority {} must be lower than catch-all priority {}",
                self.exclusion_priority, self.catch_all_priority
            )));
        }
        if self.catch_all_priority >= KERNEL_MAIN_RULE_PRIORITY {
            return Err(AppError::Config(format!(
                "catch-all priority {} would be evaluated after the main table rule",
                self.catch_all_priority
            )));
        }
        Ok(())
    }
}

/// What the tunnel layer hands over once its link exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SetupParams {
    pub link_name: String,
    /// Address issued by the VPN server for the local end of the tunnel.
    pub assigned: IpNet,
    /// Real address of the VPN server; always kept off the tunnel.
    pub server_endpoint: IpAddr,
    /// Destinations that keep using the main table (LAN, management nets).
    pub excluded: Vec<IpNet>,
    /// Split tunnel: only these destinations use the tunnel. Empty routes everything.
    pub routed: Vec<IpNet>,
}

/// One kernel object put in place by the configurator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "object", rename_all = "snake_case")]
pub enum Installed {
    Address(Address),
    Route(Route),
    Rule(Rule),
}

impl Installed {
    fn remove_op(&self) -> &'static str {
        match self {
            Installed::Address(_) => "AddrDel",
            Installed::Route(_) => "RouteDel",
            Installed::Rule(_) => "RuleDel",
        }
    }
}

impl fmt::Display for Installed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Installed::Address(a) => write!(f, "address {}", a),
            Installed::Route(r) => write!(f, "route {}", r),
            Installed::Rule(r) => write!(f, "rule {}", r),
        }
    }
}

/// A link created through [`RoutingConfigurator::create_link`], deleted on teardown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnedLink {
    pub index: u32,
    pub name: String,
}

/// Routing state of the current tunnel session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub link_name: Option<String>,
    pub owned_link: Option<OwnedLink>,
    /// Objects in installation order.
    pub installed: Vec<Installed>,
}

impl SessionRecord {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.installed.is_empty() && self.owned_link.is_none()
    }
}

/// Installs and removes tunnel routing for one session at a time.
///
/// `setup` and `teardown` hold the session lock for their whole run, so two
/// callers never interleave mutations of the same table.
pub struct RoutingConfigurator<N: NetLinker> {
    linker: N,
    settings: RoutingSettings,
    session: Mutex<SessionRecord>,
}

impl<N: NetLinker> RoutingConfigurator<N> {
    pub fn new(linker: N, settings: RoutingSettings) -> Result<Self> {
        settings.validate()?;
        Ok(Self {
            linker,
            settings,
            session: Mutex::new(SessionRecord::default()),
        })
    }

    /// Resume a session recorded by an earlier process so it can be torn down.
    pub fn with_session(linker: N, settings: RoutingSettings, record: SessionRecord) -> Result<Self> {
        let configurator = Self::new(linker, settings)?;
        *configurator.lock() = record;
        Ok(configurator)
    }

    #[must_use]
    pub fn settings(&self) -> &RoutingSettings {
        &self.settings
    }

    #[must_use]
    pub fn linker(&self) -> &N {
        &self.linker
    }

    fn lock(&self) -> MutexGuard<'_, SessionRecord> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.lock().is_empty()
    }

    /// Copy of the current session record.
    #[must_use]
    pub fn session(&self) -> SessionRecord {
        self.lock().clone()
    }

    /// Objects currently installed, in installation order.
    #[must_use]
    pub fn installed(&self) -> Vec<Installed> {
        self.lock().installed.clone()
    }

    /// Create the tunnel link and take ownership of it; teardown deletes it.
    pub fn create_link(&self, name: &str, kind: &LinkKind) -> Result<u32> {
        let mut session = self.lock();
        self.linker.link_add(name, kind)?;
        let link = match self.linker.link_by_name(name) {
            Ok(link) => link,
            Err(e) => {
                self.discard_link(name);
                return Err(e);
            }
        };
        info!(interface = name, index = link.index, "routing_link_created");
        session.owned_link = Some(OwnedLink {
            index: link.index,
            name: name.to_string(),
        });
        Ok(link.index)
    }

    /// Delete a link this configurator just added but could not take ownership of.
    fn discard_link(&self, name: &str) {
        let found = self
            .linker
            .link_list()
            .map(|links| links.into_iter().find(|l| l.name == name));
        let result = match found {
            Ok(Some(link)) => self.linker.link_del(link.index),
            Ok(None) => Ok(()),
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => debug!(interface = name, "routing_link_discarded"),
            Err(e) => warn!(interface = name, error = %e, "routing_link_discard_failed"),
        }
    }

    /// Route traffic through the tunnel link. On error nothing installed by
    /// this call is left behind.
    pub fn setup(&self, params: &SetupParams) -> Result<()> {
        let mut session = self.lock();

        if !session.installed.is_empty() {
            info!(
                interface = params.link_name.as_str(),
                objects = session.installed.len(),
                "routing_setup_replacing_previous_session"
            );
            self.remove_installed(&mut session)?;
        }

        info!(
            interface = params.link_name.as_str(),
            address = %params.assigned,
            endpoint = %params.server_endpoint,
            excluded = params.excluded.len(),
            routed = params.routed.len(),
            table = self.settings.table,
            "routing_setup_start"
        );

        if let Err(e) = self.install(&mut session, params) {
            warn!(
                interface = params.link_name.as_str(),
                error = %e,
                objects = session.installed.len(),
                "routing_setup_failed_rolling_back"
            );
            self.rollback(&mut session);
            return Err(e);
        }
        session.link_name = Some(params.link_name.clone());

        info!(
            interface = params.link_name.as_str(),
            objects = session.installed.len(),
            "routing_setup_complete"
        );
        Ok(())
    }

    fn install(&self, session: &mut SessionRecord, params: &SetupParams) -> Result<()> {
        let link = self.linker.link_by_name(&params.link_name).map_err(|e| {
            if e.is_not_found() {
                AppError::LinkNotFound(params.link_name.clone())
            } else {
                e
            }
        })?;

        if !link.up {
            self.linker.link_set_up(link.index)?;
            debug!(interface = link.name.as_str(), "routing_link_up");
        }

        let address = Address {
            link_index: link.index,
            prefix: params.assigned,
        };
        record_created(session, self.linker.addr_add(&address), Installed::Address(address))?;

        let destinations = if params.routed.is_empty() {
            vec![default_net(Family::of_net(&params.assigned))]
        } else {
            params.routed.clone()
        };
        for destination in &destinations {
            let route = Route {
                destination: *destination,
                gateway: None,
                link_index: link.index,
                table: self.settings.table,
                metric: None,
            };
            self.linker.route_replace(&route)?;
            session.installed.push(Installed::Route(route));
        }

        // Exclusions must be live before the catch-all, or handshake traffic
        // to the server would be sent into the tunnel.
        let mut bypass = vec![IpNet::from(params.server_endpoint)];
        bypass.extend(params.excluded.iter().copied());
        for destination in bypass {
            let rule = Rule {
                family: Family::of_net(&destination),
                source: None,
                destination: Some(destination),
                priority: self.settings.exclusion_priority,
                table: MAIN_TABLE,
            };
            record_created(session, self.linker.rule_add(&rule), Installed::Rule(rule))?;
        }

        let families: BTreeSet<Family> = destinations.iter().map(Family::of_net).collect();
        for family in families {
            let rule = Rule {
                family,
                source: None,
                destination: None,
                priority: self.settings.catch_all_priority,
                table: self.settings.table,
            };
            record_created(session, self.linker.rule_add(&rule), Installed::Rule(rule))?;
        }

        Ok(())
    }

    fn rollback(&self, session: &mut SessionRecord) {
        if let Err(e) = self.remove_installed(session) {
            warn!(error = %e, "routing_rollback_incomplete");
        }
    }

    /// Remove all routing, then the link if it was created here.
    ///
    /// Every removal is attempted. Objects already gone count as removed;
    /// objects that could not be removed stay recorded for the next call.
    pub fn teardown(&self) -> Result<()> {
        let mut session = self.lock();
        if session.is_empty() {
            debug!("routing_teardown_nothing_installed");
            return Ok(());
        }
        info!(
            interface = session.link_name.as_deref().unwrap_or("-"),
            objects = session.installed.len(),
            owned_link = session.owned_link.is_some(),
            "routing_teardown_start"
        );

        let mut failed_ops = match self.remove_installed(&mut session) {
            Ok(()) => Vec::new(),
            Err(AppError::PartialTeardown { failed_ops }) => failed_ops,
            Err(e) => vec![e.to_string()],
        };

        if let Some(owned) = session.owned_link.clone() {
            match self.linker.link_del(owned.index) {
                Ok(()) => session.owned_link = None,
                Err(e) if e.is_not_found() => session.owned_link = None,
                Err(e) => failed_ops.push(format!("{} (link {})", e, owned.name)),
            }
        }

        if failed_ops.is_empty() {
            session.link_name = None;
            info!("routing_teardown_complete");
            Ok(())
        } else {
            warn!(failed = failed_ops.len(), "routing_teardown_incomplete");
            Err(AppError::PartialTeardown { failed_ops })
        }
    }

    /// Remove recorded objects newest first: rules, then routes, then the address.
    fn remove_installed(&self, session: &mut SessionRecord) -> Result<()> {
        let mut failed_ops = Vec::new();
        let mut remaining = Vec::new();

        for object in session.installed.drain(..).rev() {
            let result = match &object {
                Installed::Address(a) => self.linker.addr_del(a),
                Installed::Route(r) => self.linker.route_del(r),
                Installed::Rule(r) => self.linker.rule_del(r),
            };
            match result {
                Ok(()) => debug!(object = %object, "routing_object_removed"),
                Err(e) if e.is_not_found() => {
                    debug!(object = %object, "routing_object_already_absent")
                }
                Err(e) => {
                    warn!(
                        op = object.remove_op(),
                        object = %object,
                        error = %e,
                        "routing_object_remove_failed"
                    );
                    failed_ops.push(format!("{} ({})", e, object));
                    remaining.push(object);
                }
            }
        }

        remaining.reverse();
        session.installed = remaining;
        if failed_ops.is_empty() {
            Ok(())
        } else {
            Err(AppError::PartialTeardown { failed_ops })
        }
    }
}

/// Record `object` if this call created it. An object that already existed
/// counts as success but is left out of the record, so rollback and teardown
/// never remove something another party put in place.
fn record_created(session: &mut SessionRecord, result: Result<()>, object: Installed) -> Result<()> {
    match result {
        Ok(()) => {
            session.installed.push(object);
            Ok(())
        }
        Err(e) if e.is_already_exists() => {
            debug!(object = %object, "routing_object_preexisting");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

fn default_net(family: Family) -> IpNet {
    match family {
        Family::V6 => IpNet::V6(ipnet::Ipv6Net::default()),
        _ => IpNet::V4(ipnet::Ipv4Net::default()),
    }
}
