//! In-memory routing stack.
//!
//! Mirrors the kernel's observable behaviour closely enough for the
//! configurator: duplicate creates fail with `EEXIST`, deletes of absent
//! objects fail with the errno the kernel would return, and deleting a link
//! drops its addresses and routes. Any operation can be made to fail on
//! demand, and every call is journaled.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::Mutex;

use ipnet::{IpNet, Ipv4Net};
use nix::errno::Errno;

use super::{Address, Family, Link, LinkKind, NetLinker, Route, Rule, MAIN_TABLE};
use crate::error::{AppError, Result};

const LOOPBACK_NET: Ipv4Net = Ipv4Net::new_assert(Ipv4Addr::LOCALHOST, 8);
const HOST_GATEWAY: Ipv4Addr = Ipv4Addr::new(192, 168, 1, 1);

/// Complete view of the fake stack, comparable across calls.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingState {
    pub links: Vec<Link>,
    pub addresses: Vec<Address>,
    pub routes: Vec<Route>,
    pub rules: Vec<Rule>,
}

#[derive(Debug, Default)]
struct Inner {
    state: RoutingState,
    next_index: u32,
    failures: HashMap<&'static str, Failure>,
    journal: Vec<String>,
}

#[derive(Debug, Clone, Copy)]
struct Failure {
    cause: Errno,
    /// Calls still allowed to succeed before the failure triggers.
    skip: usize,
    persistent: bool,
}

#[derive(Debug, Default)]
pub struct MemoryNetLinker {
    inner: Mutex<Inner>,
}

impl MemoryNetLinker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_index: 1,
                ..Inner::default()
            }),
        }
    }

    /// A stack resembling a fresh host: `lo`, `eth0` and a main-table default route.
    #[must_use]
    pub fn with_host_defaults() -> Self {
        let linker = Self::new();
        let lo = linker.insert_link("lo", LinkKind::Loopback, true);
        let eth0 = linker.insert_link("eth0", LinkKind::Physical, true);
        let mut inner = linker.lock();
        inner.state.addresses.push(Address {
            link_index: lo,
            prefix: IpNet::V4(LOOPBACK_NET),
        });
        inner.state.routes.push(Route {
            destination: IpNet::V4(Ipv4Net::default()),
            gateway: Some(IpAddr::V4(HOST_GATEWAY)),
            link_index: eth0,
            table: MAIN_TABLE,
            metric: Some(100),
        });
        drop(inner);
        linker
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add a link directly, bypassing failure injection; returns its index.
    pub fn insert_link(&self, name: &str, kind: LinkKind, up: bool) -> u32 {
        let mut inner = self.lock();
        let index = inner.next_index;
        inner.next_index += 1;
        inner.state.links.push(Link {
            index,
            name: name.to_string(),
            up,
            kind,
        });
        index
    }

    /// Make the next call of `op` (e.g. `"RuleAdd"`) fail with `cause`.
    pub fn fail_next(&self, op: &'static str, cause: Errno) {
        self.fail_after(op, 0, cause);
    }

    /// Let `skip` calls of `op` succeed, then fail the following one with `cause`.
    pub fn fail_after(&self, op: &'static str, skip: usize, cause: Errno) {
        self.lock().failures.insert(
            op,
            Failure {
                cause,
                skip,
                persistent: false,
            },
        );
    }

    /// Make every call of `op` fail with `cause` until [`clear_failures`](Self::clear_failures).
    pub fn fail_always(&self, op: &'static str, cause: Errno) {
        self.lock().failures.insert(
            op,
            Failure {
                cause,
                skip: 0,
                persistent: true,
            },
        );
    }

    pub fn clear_failures(&self) {
        self.lock().failures.clear();
    }

    #[must_use]
    pub fn snapshot(&self) -> RoutingState {
        self.lock().state.clone()
    }

    /// Operation names in call order, including failed calls.
    #[must_use]
    pub fn journal(&self) -> Vec<String> {
        self.lock().journal.clone()
    }

    /// Record the call and apply any injected failure, then run `f` on the state.
    fn call<T>(
        &self,
        op: &'static str,
        detail: String,
        f: impl FnOnce(&mut Inner) -> std::result::Result<T, Errno>,
    ) -> Result<T> {
        let mut inner = self.lock();
        inner.journal.push(if detail.is_empty() {
            op.to_string()
        } else {
            format!("{} {}", op, detail)
        });
        if let Some(failure) = inner.failures.get_mut(op) {
            if failure.skip > 0 {
                failure.skip -= 1;
            } else {
                let cause = failure.cause;
                if !failure.persistent {
                    inner.failures.remove(op);
                }
                return Err(AppError::OsRouting { op, cause });
            }
        }
        f(&mut inner).map_err(|cause| AppError::OsRouting { op, cause })
    }
}

fn link_exists(inner: &Inner, index: u32) -> std::result::Result<(), Errno> {
    if inner.state.links.iter().any(|l| l.index == index) {
        Ok(())
    } else {
        Err(Errno::ENODEV)
    }
}

impl NetLinker for MemoryNetLinker {
    fn addr_add(&self, addr: &Address) -> Result<()> {
        self.call("AddrAdd", addr.to_string(), |inner| {
            link_exists(inner, addr.link_index)?;
            if inner.state.addresses.contains(addr) {
                return Err(Errno::EEXIST);
            }
            inner.state.addresses.push(addr.clone());
            Ok(())
        })
    }

    fn addr_del(&self, addr: &Address) -> Result<()> {
        self.call("AddrDel", addr.to_string(), |inner| {
            let before = inner.state.addresses.len();
            inner.state.addresses.retain(|a| a != addr);
            if inner.state.addresses.len() == before {
                return Err(Errno::EADDRNOTAVAIL);
            }
            Ok(())
        })
    }

    fn addr_list(&self, link_index: u32, family: Family) -> Result<Vec<Address>> {
        self.call("AddrList", String::new(), |inner| {
            Ok(inner
                .state
                .addresses
                .iter()
                .filter(|a| a.link_index == link_index)
                .filter(|a| family.matches(Family::of_net(&a.prefix)))
                .cloned()
                .collect())
        })
    }

    fn link_add(&self, name: &str, kind: &LinkKind) -> Result<()> {
        self.call("LinkAdd", name.to_string(), |inner| {
            if inner.state.links.iter().any(|l| l.name == name) {
                return Err(Errno::EEXIST);
            }
            let index = inner.next_index;
            inner.next_index += 1;
            inner.state.links.push(Link {
                index,
                name: name.to_string(),
                up: false,
                kind: kind.clone(),
            });
            Ok(())
        })
    }

    fn link_del(&self, index: u32) -> Result<()> {
        self.call("LinkDel", format!("#{}", index), |inner| {
            link_exists(inner, index)?;
            inner.state.links.retain(|l| l.index != index);
            inner.state.addresses.retain(|a| a.link_index != index);
            inner.state.routes.retain(|r| r.link_index != index);
            Ok(())
        })
    }

    fn link_list(&self) -> Result<Vec<Link>> {
        self.call("LinkList", String::new(), |inner| Ok(inner.state.links.clone()))
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        self.call("LinkByIndex", format!("#{}", index), |inner| {
            inner
                .state
                .links
                .iter()
                .find(|l| l.index == index)
                .cloned()
                .ok_or(Errno::ENODEV)
        })
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.call("LinkByName", name.to_string(), |inner| {
            inner
                .state
                .links
                .iter()
                .find(|l| l.name == name)
                .cloned()
                .ok_or(Errno::ENODEV)
        })
    }

    fn link_set_up(&self, index: u32) -> Result<()> {
        self.call("LinkSetUp", format!("#{}", index), |inner| {
            let link = inner
                .state
                .links
                .iter_mut()
                .find(|l| l.index == index)
                .ok_or(Errno::ENODEV)?;
            link.up = true;
            Ok(())
        })
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        self.call("RouteAdd", route.to_string(), |inner| {
            link_exists(inner, route.link_index)?;
            if inner.state.routes.iter().any(|r| r.same_key(route)) {
                return Err(Errno::EEXIST);
            }
            inner.state.routes.push(route.clone());
            Ok(())
        })
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        self.call("RouteDel", route.to_string(), |inner| {
            let pos = inner
                .state
                .routes
                .iter()
                .position(|r| r.same_key(route) && r.link_index == route.link_index)
                .ok_or(Errno::ESRCH)?;
            inner.state.routes.remove(pos);
            Ok(())
        })
    }

    fn route_replace(&self, route: &Route) -> Result<()> {
        self.call("RouteReplace", route.to_string(), |inner| {
            link_exists(inner, route.link_index)?;
            match inner.state.routes.iter_mut().find(|r| r.same_key(route)) {
                Some(existing) => *existing = route.clone(),
                None => inner.state.routes.push(route.clone()),
            }
            Ok(())
        })
    }

    fn route_list(&self, link_index: Option<u32>, family: Family) -> Result<Vec<Route>> {
        self.call("RouteList", String::new(), |inner| {
            Ok(inner
                .state
                .routes
                .iter()
                .filter(|r| link_index.is_none_or(|idx| r.link_index == idx))
                .filter(|r| family.matches(Family::of_net(&r.destination)))
                .cloned()
                .collect())
        })
    }

    fn rule_add(&self, rule: &Rule) -> Result<()> {
        self.call("RuleAdd", rule.to_string(), |inner| {
            if inner.state.rules.contains(rule) {
                return Err(Errno::EEXIST);
            }
            inner.state.rules.push(rule.clone());
            Ok(())
        })
    }

    fn rule_del(&self, rule: &Rule) -> Result<()> {
        self.call("RuleDel", rule.to_string(), |inner| {
            let pos = inner
                .state
                .rules
                .iter()
                .position(|r| r == rule)
                .ok_or(Errno::ENOENT)?;
            inner.state.rules.remove(pos);
            Ok(())
        })
    }

    fn rule_list(&self, family: Family) -> Result<Vec<Rule>> {
        self.call("RuleList", String::new(), |inner| {
            let mut rules: Vec<Rule> = inner
                .state
                .rules
                .iter()
                .filter(|r| family.matches(r.family))
                .cloned()
                .collect();
            rules.sort_by_key(|r| r.priority);
            Ok(rules)
        })
    }
}
