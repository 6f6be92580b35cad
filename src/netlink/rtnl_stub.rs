use nix::errno::Errno;

use super::{Address, Family, Link, LinkKind, NetLinker, Route, Rule};
use crate::error::{AppError, Result};

/// Placeholder on platforms without rtnetlink; every call fails with `EOPNOTSUPP`.
#[derive(Debug, Default)]
pub struct RtNetlink;

impl RtNetlink {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

fn unsupported<T>(op: &'static str) -> Result<T> {
    Err(AppError::OsRouting {
        op,
        cause: Errno::EOPNOTSUPP,
    })
}

impl NetLinker for RtNetlink {
    fn addr_add(&self, _addr: &Address) -> Result<()> {
        unsupported("AddrAdd")
    }
    fn addr_del(&self, _addr: &Address) -> Result<()> {
        unsupported("AddrDel")
    }
    fn addr_list(&self, _link_index: u32, _family: Family) -> Result<Vec<Address>> {
        unsupported("AddrList")
    }
    fn link_add(&self, _name: &str, _kind: &LinkKind) -> Result<()> {
        unsupported("LinkAdd")
    }
    fn link_del(&self, _index: u32) -> Result<()> {
        unsupported("LinkDel")
    }
    fn link_list(&self) -> Result<Vec<Link>> {
        unsupported("LinkList")
    }
    fn link_by_index(&self, _index: u32) -> Result<Link> {
        unsupported("LinkByIndex")
    }
    fn link_by_name(&self, _name: &str) -> Result<Link> {
        unsupported("LinkByName")
    }
    fn link_set_up(&self, _index: u32) -> Result<()> {
        unsupported("LinkSetUp")
    }
    fn route_add(&self, _route: &Route) -> Result<()> {
        unsupported("RouteAdd")
    }
    fn route_del(&self, _route: &Route) -> Result<()> {
        unsupported("RouteDel")
    }
    fn route_replace(&self, _route: &Route) -> Result<()> {
        unsupported("RouteReplace")
    }
    fn route_list(&self, _link_index: Option<u32>, _family: Family) -> Result<Vec<Route>> {
        unsupported("RouteList")
    }
    fn rule_add(&self, _rule: &Rule) -> Result<()> {
        unsupported("RuleAdd")
    }
    fn rule_del(&self, _rule: &Rule) -> Result<()> {
        unsupported("RuleDel")
    }
    fn rule_list(&self, _family: Family) -> Result<Vec<Rule>> {
        unsupported("RuleList")
    }
}
