//! Route primitives: links, addresses, routes and policy rules.
//!
//! [`NetLinker`] is the only seam between the routing configurator and the
//! kernel. Every method is one synchronous request with no retries; failures
//! come back as [`AppError::OsRouting`](crate::error::AppError::OsRouting)
//! carrying the kernel errno untouched.
//!
//! Implementations:
//! - [`RtNetlink`] talks `NETLINK_ROUTE` on Linux (stubbed elsewhere)
//! - [`MemoryNetLinker`] keeps a routing stack in memory for tests and dry runs

use std::fmt;
use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod memory;
mod message;
#[cfg(target_os = "linux")]
mod rtnl;
#[cfg(not(target_os = "linux"))]
#[path = "rtnl_stub.rs"]
mod rtnl;

pub use memory::MemoryNetLinker;
pub use rtnl::RtNetlink;

/// The kernel's main routing table (`RT_TABLE_MAIN`).
pub const MAIN_TABLE: u32 = 254;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Family {
    All,
    V4,
    V6,
}

impl Family {
    #[must_use]
    pub fn of_addr(ip: &IpAddr) -> Self {
        match ip {
            IpAddr::V4(_) => Family::V4,
            IpAddr::V6(_) => Family::V6,
        }
    }

    #[must_use]
    pub fn of_net(net: &IpNet) -> Self {
        Self::of_addr(&net.addr())
    }

    /// `All` matches every concrete family.
    #[must_use]
    pub fn matches(self, other: Family) -> bool {
        self == Family::All || other == Family::All || self == other
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Family::All => write!(f, "all"),
            Family::V4 => write!(f, "inet"),
            Family::V6 => write!(f, "inet6"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "driver", rename_all = "snake_case")]
pub enum LinkKind {
    /// Virtual tunnel device; carries the driver name (`wireguard`, `tun`).
    Tunnel(String),
    Physical,
    Loopback,
}

impl LinkKind {
    #[must_use]
    pub fn wireguard() -> Self {
        LinkKind::Tunnel("wireguard".to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub up: bool,
    pub kind: LinkKind,
}

/// An IP prefix bound to a link.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Address {
    pub link_index: u32,
    pub prefix: IpNet,
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} dev #{}", self.prefix, self.link_index)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpNet,
    pub gateway: Option<IpAddr>,
    pub link_index: u32,
    pub table: u32,
    pub metric: Option<u32>,
}

impl Route {
    /// Route identity as the kernel sees it: table, destination and metric.
    #[must_use]
    pub fn same_key(&self, other: &Route) -> bool {
        self.table == other.table
            && self.destination == other.destination
            && self.metric.unwrap_or(0) == other.metric.unwrap_or(0)
    }
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev #{} table {}", self.link_index, self.table)?;
        if let Some(metric) = self.metric {
            write!(f, " metric {}", metric)?;
        }
        Ok(())
    }
}

/// Policy-routing rule: traffic matching the selectors looks up `table`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Rule {
    pub family: Family,
    pub source: Option<IpNet>,
    pub destination: Option<IpNet>,
    pub priority: u32,
    pub table: u32,
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} prio {}", self.family, self.priority)?;
        match &self.source {
            Some(src) => write!(f, " from {}", src)?,
            None => write!(f, " from all")?,
        }
        if let Some(dst) = &self.destination {
            write!(f, " to {}", dst)?;
        }
        write!(f, " lookup {}", self.table)
    }
}

/// Host routing primitives.
pub trait NetLinker: Send + Sync {
    fn addr_add(&self, addr: &Address) -> Result<()>;
    fn addr_del(&self, addr: &Address) -> Result<()>;
    fn addr_list(&self, link_index: u32, family: Family) -> Result<Vec<Address>>;

    fn link_add(&self, name: &str, kind: &LinkKind) -> Result<()>;
    fn link_del(&self, index: u32) -> Result<()>;
    fn link_list(&self) -> Result<Vec<Link>>;
    fn link_by_index(&self, index: u32) -> Result<Link>;
    fn link_by_name(&self, name: &str) -> Result<Link>;
    fn link_set_up(&self, index: u32) -> Result<()>;

    fn route_add(&self, route: &Route) -> Result<()>;
    fn route_del(&self, route: &Route) -> Result<()>;
    /// Create or overwrite the route with the same table, destination and metric.
    fn route_replace(&self, route: &Route) -> Result<()>;
    /// Routes of every table, optionally restricted to one egress link.
    fn route_list(&self, link_index: Option<u32>, family: Family) -> Result<Vec<Route>>;

    fn rule_add(&self, rule: &Rule) -> Result<()>;
    fn rule_del(&self, rule: &Rule) -> Result<()>;
    fn rule_list(&self, family: Family) -> Result<Vec<Rule>>;
}

impl<T: NetLinker + ?Sized> NetLinker for std::sync::Arc<T> {
    fn addr_add(&self, addr: &Address) -> Result<()> {
        (**self).addr_add(addr)
    }
    fn addr_del(&self, addr: &Address) -> Result<()> {
        (**self).addr_del(addr)
    }
    fn addr_list(&self, link_index: u32, family: Family) -> Result<Vec<Address>> {
        (**self).addr_list(link_index, family)
    }
    fn link_add(&self, name: &str, kind: &LinkKind) -> Result<()> {
        (**self).link_add(name, kind)
    }
    fn link_del(&self, index: u32) -> Result<()> {
        (**self).link_del(index)
    }
    fn link_list(&self) -> Result<Vec<Link>> {
        (**self).link_list()
    }
    fn link_by_index(&self, index: u32) -> Result<Link> {
        (**self).link_by_index(index)
    }
    fn link_by_name(&self, name: &str) -> Result<Link> {
        (**self).link_by_name(name)
    }
    fn link_set_up(&self, index: u32) -> Result<()> {
        (**self).link_set_up(index)
    }
    fn route_add(&self, route: &Route) -> Result<()> {
        (**self).route_add(route)
    }
    fn route_del(&self, route: &Route) -> Result<()> {
        (**self).route_del(route)
    }
    fn route_replace(&self, route: &Route) -> Result<()> {
        (**self).route_replace(route)
    }
    fn route_list(&self, link_index: Option<u32>, family: Family) -> Result<Vec<Route>> {
        (**self).route_list(link_index, family)
    }
    fn rule_add(&self, rule: &Rule) -> Result<()> {
        (**self).rule_add(rule)
    }
    fn rule_del(&self, rule: &Rule) -> Result<()> {
        (**self).rule_del(rule)
    }
    fn rule_list(&self, family: Family) -> Result<Vec<Rule>> {
        (**self).rule_list(family)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rule_display() {
        let rule = Rule {
            family: Family::V4,
            source: None,
            destination: Some("198.51.100.7/32".parse().unwrap()),
            priority: 100,
            table: MAIN_TABLE,
        };
        assert_eq!(
            rule.to_string(),
            "inet prio 100 from all to 198.51.100.7/32 lookup 254"
        );
    }

    #[test]
    fn test_route_same_key_ignores_link() {
        let a = Route {
            destination: "0.0.0.0/0".parse().unwrap(),
            gateway: None,
            link_index: 4,
            table: 51820,
            metric: None,
        };
        let mut b = a.clone();
        b.link_index = 9;
        assert!(a.same_key(&b));
        b.metric = Some(10);
        assert!(!a.same_key(&b));
    }

    #[test]
    fn test_family_matching() {
        assert!(Family::All.matches(Family::V6));
        assert!(Family::V4.matches(Family::V4));
        assert!(!Family::V4.matches(Family::V6));
        assert_eq!(Family::of_net(&"::/0".parse().unwrap()), Family::V6);
    }
}
