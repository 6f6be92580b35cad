//! `NETLINK_ROUTE` backend.

use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicU32, Ordering};

use ipnet::IpNet;
use nix::errno::Errno;
use nix::sys::socket::{recv, send, socket, AddressFamily, MsgFlags, SockFlag, SockProtocol, SockType};
use tracing::trace;

use super::message::*;
use super::{Address, Family, Link, LinkKind, NetLinker, Route, Rule};
use crate::error::{AppError, Result};

const RECV_BUF_LEN: usize = 65536;

/// Kernel routing stack over a fresh `NETLINK_ROUTE` socket per request.
#[derive(Debug)]
pub struct RtNetlink {
    seq: AtomicU32,
}

impl Default for RtNetlink {
    fn default() -> Self {
        Self::new()
    }
}

fn os_err(op: &'static str, cause: Errno) -> AppError {
    AppError::OsRouting { op, cause }
}

fn family_byte(family: Family) -> u8 {
    match family {
        Family::All => AF_UNSPEC,
        Family::V4 => AF_INET,
        Family::V6 => AF_INET6,
    }
}

fn family_from_byte(af: u8) -> Family {
    match af {
        AF_INET => Family::V4,
        AF_INET6 => Family::V6,
        _ => Family::All,
    }
}

/// Tables above 255 do not fit the header byte and travel in an attribute.
fn table_byte(table: u32) -> u8 {
    if table > 255 {
        RT_TABLE_COMPAT
    } else {
        table as u8
    }
}

impl RtNetlink {
    #[must_use]
    pub fn new() -> Self {
        Self {
            seq: AtomicU32::new(1),
        }
    }

    fn next_seq(&self) -> u32 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    fn open(op: &'static str) -> Result<OwnedFd> {
        socket(
            AddressFamily::Netlink,
            SockType::Raw,
            SockFlag::SOCK_CLOEXEC,
            Some(SockProtocol::NetlinkRoute),
        )
        .map_err(|e| os_err(op, e))
    }

    /// Send a mutating request and wait for the kernel acknowledgement.
    fn request_ack(&self, op: &'static str, mut msg: NlMsg, seq: u32) -> Result<()> {
        let fd = Self::open(op)?;
        send(fd.as_raw_fd(), msg.finalize(), MsgFlags::empty()).map_err(|e| os_err(op, e))?;
        trace!(op, seq, "rtnl_request_sent");

        let mut buf = vec![0u8; RECV_BUF_LEN];
        loop {
            let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(|e| os_err(op, e))?;
            if n == 0 {
                return Err(os_err(op, Errno::EIO));
            }
            for reply in split_messages(&buf[..n]) {
                if reply.seq != seq {
                    continue;
                }
                if let Some(errno) = reply.errno() {
                    return if errno == 0 {
                        Ok(())
                    } else {
                        Err(os_err(op, Errno::from_raw(errno)))
                    };
                }
            }
        }
    }

    /// Send a request and collect every payload until `NLMSG_DONE` (or the
    /// single reply of a non-dump GET).
    fn request_collect(
        &self,
        op: &'static str,
        mut msg: NlMsg,
        seq: u32,
        dump: bool,
    ) -> Result<Vec<Vec<u8>>> {
        let fd = Self::open(op)?;
        send(fd.as_raw_fd(), msg.finalize(), MsgFlags::empty()).map_err(|e| os_err(op, e))?;

        let mut payloads = Vec::new();
        let mut buf = vec![0u8; RECV_BUF_LEN];
        'outer: loop {
            let n = recv(fd.as_raw_fd(), &mut buf, MsgFlags::empty()).map_err(|e| os_err(op, e))?;
            if n == 0 {
                break;
            }
            for reply in split_messages(&buf[..n]) {
                if reply.seq != seq {
                    continue;
                }
                match reply.msg_type {
                    NLMSG_DONE => break 'outer,
                    NLMSG_ERROR => match reply.errno() {
                        Some(0) | None => break 'outer,
                        Some(errno) => return Err(os_err(op, Errno::from_raw(errno))),
                    },
                    _ => {
                        payloads.push(reply.payload.to_vec());
                        if !dump {
                            break 'outer;
                        }
                    }
                }
            }
        }
        Ok(payloads)
    }

    fn link_request(&self, op: &'static str, index: u32, name: Option<&str>) -> Result<Link> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_GETLINK, NLM_F_REQUEST, seq);
        msg.add_ifinfo(AF_UNSPEC, index, 0, 0);
        if let Some(name) = name {
            msg.add_attr_str(IFLA_IFNAME, name);
        }
        let payloads = self.request_collect(op, msg, seq, false)?;
        payloads
            .first()
            .and_then(|p| parse_link(p))
            .ok_or_else(|| os_err(op, Errno::ENODEV))
    }

    fn addr_request(&self, op: &'static str, msg_type: u16, flags: u16, addr: &Address) -> Result<()> {
        let seq = self.next_seq();
        let ip = addr.prefix.addr();
        let mut msg = NlMsg::new(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags, seq);
        msg.add_ifaddr(af_of(&ip), addr.prefix.prefix_len(), RT_SCOPE_UNIVERSE, addr.link_index);
        msg.add_attr_ip(IFA_LOCAL, &ip);
        msg.add_attr_ip(IFA_ADDRESS, &ip);
        self.request_ack(op, msg, seq)
    }

    fn route_request(&self, op: &'static str, msg_type: u16, flags: u16, route: &Route) -> Result<()> {
        let seq = self.next_seq();
        let dst = route.destination;
        let scope = if route.gateway.is_some() {
            RT_SCOPE_UNIVERSE
        } else {
            RT_SCOPE_LINK
        };
        let mut msg = NlMsg::new(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags, seq);
        msg.add_rtmsg(
            af_of(&dst.addr()),
            dst.prefix_len(),
            0,
            table_byte(route.table),
            RTPROT_STATIC,
            scope,
            RTN_UNICAST,
        );
        msg.add_attr_u32(RTA_TABLE, route.table);
        if dst.prefix_len() > 0 {
            msg.add_attr_ip(RTA_DST, &dst.network());
        }
        if let Some(gw) = &route.gateway {
            msg.add_attr_ip(RTA_GATEWAY, gw);
        }
        msg.add_attr_u32(RTA_OIF, route.link_index);
        if let Some(metric) = route.metric {
            msg.add_attr_u32(RTA_PRIORITY, metric);
        }
        self.request_ack(op, msg, seq)
    }

    fn rule_request(&self, op: &'static str, msg_type: u16, flags: u16, rule: &Rule) -> Result<()> {
        let seq = self.next_seq();
        let family = match (rule.family, rule.source.or(rule.destination)) {
            (Family::All, Some(net)) => Family::of_net(&net),
            (family, _) => family,
        };
        let mut msg = NlMsg::new(msg_type, NLM_F_REQUEST | NLM_F_ACK | flags, seq);
        msg.add_rtmsg(
            family_byte(family),
            rule.destination.map_or(0, |n| n.prefix_len()),
            rule.source.map_or(0, |n| n.prefix_len()),
            table_byte(rule.table),
            0,
            0,
            FR_ACT_TO_TBL,
        );
        msg.add_attr_u32(FRA_PRIORITY, rule.priority);
        msg.add_attr_u32(FRA_TABLE, rule.table);
        if let Some(src) = &rule.source {
            msg.add_attr_ip(FRA_SRC, &src.network());
        }
        if let Some(dst) = &rule.destination {
            msg.add_attr_ip(FRA_DST, &dst.network());
        }
        self.request_ack(op, msg, seq)
    }
}

fn parse_link(payload: &[u8]) -> Option<Link> {
    if payload.len() < IFINFOMSG_LEN {
        return None;
    }
    let arp_type = read_u16(payload, 2);
    let index = read_i32(payload, 4) as u32;
    let flags = read_u32(payload, 8);

    let mut name = String::new();
    let mut driver: Option<String> = None;
    for (ty, val) in parse_attrs(&payload[IFINFOMSG_LEN..]) {
        match ty {
            IFLA_IFNAME => name = attr_str(val),
            IFLA_LINKINFO => {
                for (inner_ty, inner_val) in parse_attrs(val) {
                    if inner_ty == IFLA_INFO_KIND {
                        driver = Some(attr_str(inner_val));
                    }
                }
            }
            _ => {}
        }
    }

    let kind = if arp_type == ARPHRD_LOOPBACK {
        LinkKind::Loopback
    } else {
        match driver {
            Some(d) if matches!(d.as_str(), "wireguard" | "tun" | "ipip" | "gre" | "sit") => {
                LinkKind::Tunnel(d)
            }
            _ => LinkKind::Physical,
        }
    };
    Some(Link {
        index,
        name,
        up: flags & IFF_UP != 0,
        kind,
    })
}

fn parse_addr(payload: &[u8]) -> Option<Address> {
    if payload.len() < IFADDRMSG_LEN {
        return None;
    }
    let family = payload[0];
    let prefix_len = payload[1];
    let index = read_u32(payload, 4);

    let mut local = None;
    let mut address = None;
    for (ty, val) in parse_attrs(&payload[IFADDRMSG_LEN..]) {
        match ty {
            IFA_LOCAL => local = attr_ip(family, val),
            IFA_ADDRESS => address = attr_ip(family, val),
            _ => {}
        }
    }
    let ip = local.or(address)?;
    Some(Address {
        link_index: index,
        prefix: IpNet::new(ip, prefix_len).ok()?,
    })
}

fn unspecified(family: u8) -> Option<IpAddr> {
    match family {
        AF_INET => Some(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)),
        AF_INET6 => Some(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)),
        _ => None,
    }
}

fn parse_route(payload: &[u8]) -> Option<Route> {
    if payload.len() < RTMSG_LEN {
        return None;
    }
    let family = payload[0];
    let dst_len = payload[1];
    let mut table = u32::from(payload[4]);

    let mut dst = None;
    let mut gateway = None;
    let mut oif = 0u32;
    let mut metric = None;
    for (ty, val) in parse_attrs(&payload[RTMSG_LEN..]) {
        match ty {
            RTA_DST => dst = attr_ip(family, val),
            RTA_GATEWAY => gateway = attr_ip(family, val),
            RTA_OIF => oif = attr_u32(val).unwrap_or(0),
            RTA_PRIORITY => metric = attr_u32(val),
            RTA_TABLE => table = attr_u32(val).unwrap_or(table),
            _ => {}
        }
    }
    let dst = dst.or_else(|| unspecified(family))?;
    Some(Route {
        destination: IpNet::new(dst, dst_len).ok()?,
        gateway,
        link_index: oif,
        table,
        metric,
    })
}

fn parse_rule(payload: &[u8]) -> Option<Rule> {
    if payload.len() < RTMSG_LEN {
        return None;
    }
    let family = payload[0];
    let dst_len = payload[1];
    let src_len = payload[2];
    let mut table = u32::from(payload[4]);

    let mut source = None;
    let mut destination = None;
    let mut priority = 0u32;
    for (ty, val) in parse_attrs(&payload[RTMSG_LEN..]) {
        match ty {
            FRA_SRC => source = attr_ip(family, val).and_then(|ip| IpNet::new(ip, src_len).ok()),
            FRA_DST => {
                destination = attr_ip(family, val).and_then(|ip| IpNet::new(ip, dst_len).ok())
            }
            FRA_PRIORITY => priority = attr_u32(val).unwrap_or(0),
            FRA_TABLE => table = attr_u32(val).unwrap_or(table),
            _ => {}
        }
    }
    Some(Rule {
        family: family_from_byte(family),
        source,
        destination,
        priority,
        table,
    })
}

impl NetLinker for RtNetlink {
    fn addr_add(&self, addr: &Address) -> Result<()> {
        self.addr_request("AddrAdd", RTM_NEWADDR, NLM_F_CREATE | NLM_F_EXCL, addr)
    }

    fn addr_del(&self, addr: &Address) -> Result<()> {
        self.addr_request("AddrDel", RTM_DELADDR, 0, addr)
    }

    fn addr_list(&self, link_index: u32, family: Family) -> Result<Vec<Address>> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP, seq);
        msg.add_ifaddr(family_byte(family), 0, 0, 0);
        let payloads = self.request_collect("AddrList", msg, seq, true)?;
        Ok(payloads
            .iter()
            .filter_map(|p| parse_addr(p))
            .filter(|a| a.link_index == link_index)
            .filter(|a| family.matches(Family::of_net(&a.prefix)))
            .collect())
    }

    fn link_add(&self, name: &str, kind: &LinkKind) -> Result<()> {
        let LinkKind::Tunnel(driver) = kind else {
            return Err(os_err("LinkAdd", Errno::EOPNOTSUPP));
        };
        let seq = self.next_seq();
        let mut msg = NlMsg::new(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
            seq,
        );
        msg.add_ifinfo(AF_UNSPEC, 0, 0, 0);
        msg.add_attr_str(IFLA_IFNAME, name);
        let info = msg.attr_start(IFLA_LINKINFO);
        msg.add_attr_str(IFLA_INFO_KIND, driver);
        msg.attr_end(info);
        self.request_ack("LinkAdd", msg, seq)
    }

    fn link_del(&self, index: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        msg.add_ifinfo(AF_UNSPEC, index, 0, 0);
        self.request_ack("LinkDel", msg, seq)
    }

    fn link_list(&self) -> Result<Vec<Link>> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP, seq);
        msg.add_ifinfo(AF_UNSPEC, 0, 0, 0);
        let payloads = self.request_collect("LinkList", msg, seq, true)?;
        Ok(payloads.iter().filter_map(|p| parse_link(p)).collect())
    }

    fn link_by_index(&self, index: u32) -> Result<Link> {
        self.link_request("LinkByIndex", index, None)
    }

    fn link_by_name(&self, name: &str) -> Result<Link> {
        self.link_request("LinkByName", 0, Some(name))
    }

    fn link_set_up(&self, index: u32) -> Result<()> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK, seq);
        msg.add_ifinfo(AF_UNSPEC, index, IFF_UP, IFF_UP);
        self.request_ack("LinkSetUp", msg, seq)
    }

    fn route_add(&self, route: &Route) -> Result<()> {
        self.route_request("RouteAdd", RTM_NEWROUTE, NLM_F_CREATE | NLM_F_EXCL, route)
    }

    fn route_del(&self, route: &Route) -> Result<()> {
        self.route_request("RouteDel", RTM_DELROUTE, 0, route)
    }

    fn route_replace(&self, route: &Route) -> Result<()> {
        self.route_request("RouteReplace", RTM_NEWROUTE, NLM_F_CREATE | NLM_F_REPLACE, route)
    }

    fn route_list(&self, link_index: Option<u32>, family: Family) -> Result<Vec<Route>> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_GETROUTE, NLM_F_REQUEST | NLM_F_DUMP, seq);
        msg.add_rtmsg(family_byte(family), 0, 0, RT_TABLE_UNSPEC, 0, 0, 0);
        let payloads = self.request_collect("RouteList", msg, seq, true)?;
        Ok(payloads
            .iter()
            .filter_map(|p| parse_route(p))
            .filter(|r| link_index.is_none_or(|idx| r.link_index == idx))
            .collect())
    }

    fn rule_add(&self, rule: &Rule) -> Result<()> {
        self.rule_request("RuleAdd", RTM_NEWRULE, NLM_F_CREATE | NLM_F_EXCL, rule)
    }

    fn rule_del(&self, rule: &Rule) -> Result<()> {
        self.rule_request("RuleDel", RTM_DELRULE, 0, rule)
    }

    fn rule_list(&self, family: Family) -> Result<Vec<Rule>> {
        let seq = self.next_seq();
        let mut msg = NlMsg::new(RTM_GETRULE, NLM_F_REQUEST | NLM_F_DUMP, seq);
        msg.add_rtmsg(family_byte(family), 0, 0, RT_TABLE_UNSPEC, 0, 0, 0);
        let payloads = self.request_collect("RuleList", msg, seq, true)?;
        Ok(payloads.iter().filter_map(|p| parse_rule(p)).collect())
    }
}
