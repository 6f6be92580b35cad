//! rtnetlink message framing.
//!
//! Requests are built by hand the same way the kernel headers lay them out:
//! `nlmsghdr`, then the family header (`ifinfomsg`, `ifaddrmsg`, `rtmsg` or
//! `fib_rule_hdr`), then a run of 4-byte aligned `rtattr`s.

#![cfg_attr(not(target_os = "linux"), allow(dead_code))]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

// ---------------------------------------------------------------------------
// Message types (linux/rtnetlink.h)
// ---------------------------------------------------------------------------

pub const RTM_NEWLINK: u16 = 16;
pub const RTM_DELLINK: u16 = 17;
pub const RTM_GETLINK: u16 = 18;
pub const RTM_NEWADDR: u16 = 20;
pub const RTM_DELADDR: u16 = 21;
pub const RTM_GETADDR: u16 = 22;
pub const RTM_NEWROUTE: u16 = 24;
pub const RTM_DELROUTE: u16 = 25;
pub const RTM_GETROUTE: u16 = 26;
pub const RTM_NEWRULE: u16 = 32;
pub const RTM_DELRULE: u16 = 33;
pub const RTM_GETRULE: u16 = 34;

// ---------------------------------------------------------------------------
// Netlink flags / control messages
// ---------------------------------------------------------------------------

pub const NLM_F_REQUEST: u16 = 0x1;
pub const NLM_F_ACK: u16 = 0x4;
pub const NLM_F_REPLACE: u16 = 0x100;
pub const NLM_F_EXCL: u16 = 0x200;
pub const NLM_F_CREATE: u16 = 0x400;
pub const NLM_F_DUMP: u16 = 0x300;

pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;

const NLA_F_NESTED: u16 = 0x8000;
pub const NLMSG_HDRLEN: usize = 16;

pub const AF_UNSPEC: u8 = 0;
pub const AF_INET: u8 = 2;
pub const AF_INET6: u8 = 10;

// ---------------------------------------------------------------------------
// Links (linux/if_link.h, linux/if.h, linux/if_arp.h)
// ---------------------------------------------------------------------------

pub const IFINFOMSG_LEN: usize = 16;
pub const IFLA_IFNAME: u16 = 3;
pub const IFLA_LINKINFO: u16 = 18;
pub const IFLA_INFO_KIND: u16 = 1;
pub const IFF_UP: u32 = 0x1;
pub const ARPHRD_LOOPBACK: u16 = 772;

// ---------------------------------------------------------------------------
// Addresses (linux/if_addr.h)
// ---------------------------------------------------------------------------

pub const IFADDRMSG_LEN: usize = 8;
pub const IFA_ADDRESS: u16 = 1;
pub const IFA_LOCAL: u16 = 2;

// ---------------------------------------------------------------------------
// Routes and rules (linux/rtnetlink.h, linux/fib_rules.h)
// ---------------------------------------------------------------------------

pub const RTMSG_LEN: usize = 12;
pub const RTA_DST: u16 = 1;
pub const RTA_OIF: u16 = 4;
pub const RTA_GATEWAY: u16 = 5;
pub const RTA_PRIORITY: u16 = 6;
pub const RTA_TABLE: u16 = 15;

pub const RT_TABLE_UNSPEC: u8 = 0;
pub const RT_TABLE_COMPAT: u8 = 252;
pub const RTPROT_STATIC: u8 = 4;
pub const RT_SCOPE_UNIVERSE: u8 = 0;
pub const RT_SCOPE_LINK: u8 = 253;
pub const RTN_UNICAST: u8 = 1;

pub const FRA_DST: u16 = 1;
pub const FRA_SRC: u16 = 2;
pub const FRA_PRIORITY: u16 = 6;
pub const FRA_TABLE: u16 = 15;
pub const FR_ACT_TO_TBL: u8 = 1;

// ---------------------------------------------------------------------------
// Message builder
// ---------------------------------------------------------------------------

pub struct NlMsg {
    buf: Vec<u8>,
}

impl NlMsg {
    /// Create a new netlink message with nlmsghdr.
    pub fn new(msg_type: u16, flags: u16, seq: u32) -> Self {
        let mut buf = Vec::with_capacity(256);
        buf.extend_from_slice(&0u32.to_ne_bytes()); // len placeholder
        buf.extend_from_slice(&msg_type.to_ne_bytes());
        buf.extend_from_slice(&flags.to_ne_bytes());
        buf.extend_from_slice(&seq.to_ne_bytes());
        buf.extend_from_slice(&0u32.to_ne_bytes()); // pid = 0 (kernel fills it)
        Self { buf }
    }

    /// Append `ifinfomsg`.
    pub fn add_ifinfo(&mut self, family: u8, index: u32, flags: u32, change: u32) {
        self.buf.push(family);
        self.buf.push(0);
        self.buf.extend_from_slice(&0u16.to_ne_bytes()); // ifi_type
        self.buf.extend_from_slice(&(index as i32).to_ne_bytes());
        self.buf.extend_from_slice(&flags.to_ne_bytes());
        self.buf.extend_from_slice(&change.to_ne_bytes());
    }

    /// Append `ifaddrmsg`.
    pub fn add_ifaddr(&mut self, family: u8, prefix_len: u8, scope: u8, index: u32) {
        self.buf.push(family);
        self.buf.push(prefix_len);
        self.buf.push(0); // ifa_flags
        self.buf.push(scope);
        self.buf.extend_from_slice(&index.to_ne_bytes());
    }

    /// Append `rtmsg`. The same layout is shared by `fib_rule_hdr`, whose
    /// `protocol`/`scope` bytes are reserved and whose `type` byte is the action.
    #[allow(clippy::too_many_arguments)]
    pub fn add_rtmsg(
        &mut self,
        family: u8,
        dst_len: u8,
        src_len: u8,
        table: u8,
        protocol: u8,
        scope: u8,
        kind: u8,
    ) {
        self.buf.push(family);
        self.buf.push(dst_len);
        self.buf.push(src_len);
        self.buf.push(0); // tos
        self.buf.push(table);
        self.buf.push(protocol);
        self.buf.push(scope);
        self.buf.push(kind);
        self.buf.extend_from_slice(&0u32.to_ne_bytes()); // flags
    }

    /// Append a raw rtattr.
    pub fn add_attr(&mut self, ty: u16, data: &[u8]) {
        let rta_len = 4 + data.len();
        self.buf.extend_from_slice(&(rta_len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(data);
        let pad = (4 - (data.len() % 4)) % 4;
        self.buf.extend(std::iter::repeat_n(0u8, pad));
    }

    pub fn add_attr_str(&mut self, ty: u16, s: &str) {
        let mut data = s.as_bytes().to_vec();
        data.push(0);
        self.add_attr(ty, &data);
    }

    pub fn add_attr_u32(&mut self, ty: u16, v: u32) {
        self.add_attr(ty, &v.to_ne_bytes());
    }

    pub fn add_attr_ip(&mut self, ty: u16, ip: &IpAddr) {
        match ip {
            IpAddr::V4(a) => self.add_attr(ty, &a.octets()),
            IpAddr::V6(a) => self.add_attr(ty, &a.octets()),
        }
    }

    /// Begin a nested attribute; returns position of the length field for later patching.
    pub fn attr_start(&mut self, ty: u16) -> usize {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
        pos
    }

    pub fn attr_end(&mut self, pos: usize) {
        let len = (self.buf.len() - pos) as u16;
        self.buf[pos..pos + 2].copy_from_slice(&len.to_ne_bytes());
    }

    /// Fill in the nlmsghdr length and return the buffer.
    pub fn finalize(&mut self) -> &[u8] {
        let len = self.buf.len() as u32;
        self.buf[0..4].copy_from_slice(&len.to_ne_bytes());
        &self.buf
    }
}

// ---------------------------------------------------------------------------
// Parsing helpers
// ---------------------------------------------------------------------------

/// One message out of a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Reply<'a> {
    pub msg_type: u16,
    pub seq: u32,
    pub payload: &'a [u8],
}

impl Reply<'_> {
    /// Errno carried by an `NLMSG_ERROR` reply; 0 is a plain ACK.
    pub fn errno(&self) -> Option<i32> {
        if self.msg_type != NLMSG_ERROR || self.payload.len() < 4 {
            return None;
        }
        Some(-read_i32(self.payload, 0))
    }
}

/// Split a receive buffer into netlink messages.
pub fn split_messages(data: &[u8]) -> Vec<Reply<'_>> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + NLMSG_HDRLEN <= data.len() {
        let msg_len = read_u32(data, offset) as usize;
        if msg_len < NLMSG_HDRLEN || offset + msg_len > data.len() {
            break;
        }
        out.push(Reply {
            msg_type: read_u16(data, offset + 4),
            seq: read_u32(data, offset + 8),
            payload: &data[offset + NLMSG_HDRLEN..offset + msg_len],
        });
        offset += (msg_len + 3) & !3;
    }
    out
}

/// Parse a flat sequence of rtattrs.
pub fn parse_attrs(data: &[u8]) -> Vec<(u16, &[u8])> {
    let mut out = Vec::new();
    let mut offset = 0usize;
    while offset + 4 <= data.len() {
        let rta_len = read_u16(data, offset) as usize;
        if rta_len < 4 || offset + rta_len > data.len() {
            break;
        }
        let rta_type = read_u16(data, offset + 2) & !NLA_F_NESTED;
        out.push((rta_type, &data[offset + 4..offset + rta_len]));
        offset += (rta_len + 3) & !3;
    }
    out
}

pub fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_ne_bytes([data[offset], data[offset + 1]])
}

pub fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_ne_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub fn read_i32(data: &[u8], offset: usize) -> i32 {
    read_u32(data, offset) as i32
}

pub fn attr_u32(val: &[u8]) -> Option<u32> {
    (val.len() >= 4).then(|| read_u32(val, 0))
}

/// NUL-terminated attribute string.
pub fn attr_str(val: &[u8]) -> String {
    let end = val.iter().position(|b| *b == 0).unwrap_or(val.len());
    String::from_utf8_lossy(&val[..end]).into_owned()
}

pub fn attr_ip(family: u8, val: &[u8]) -> Option<IpAddr> {
    match family {
        AF_INET if val.len() == 4 => Some(IpAddr::V4(Ipv4Addr::new(
            val[0], val[1], val[2], val[3],
        ))),
        AF_INET6 if val.len() == 16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(val);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

pub fn af_of(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => AF_INET,
        IpAddr::V6(_) => AF_INET6,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attr_padding_and_length() {
        let mut msg = NlMsg::new(RTM_NEWLINK, NLM_F_REQUEST, 7);
        msg.add_ifinfo(AF_UNSPEC, 0, 0, 0);
        msg.add_attr_str(IFLA_IFNAME, "wg0");
        let buf = msg.finalize().to_vec();

        // 16 (nlmsghdr) + 16 (ifinfomsg) + 4 (rta hdr) + 4 ("wg0\0")
        assert_eq!(buf.len(), 40);
        assert_eq!(read_u32(&buf, 0), 40);
        assert_eq!(read_u16(&buf, 4), RTM_NEWLINK);
        assert_eq!(read_u32(&buf, 8), 7);

        let attrs = parse_attrs(&buf[NLMSG_HDRLEN + IFINFOMSG_LEN..]);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].0, IFLA_IFNAME);
        assert_eq!(attr_str(attrs[0].1), "wg0");
    }

    #[test]
    fn test_nested_attr_length_is_patched() {
        let mut msg = NlMsg::new(RTM_NEWLINK, NLM_F_REQUEST, 1);
        msg.add_ifinfo(AF_UNSPEC, 0, 0, 0);
        let pos = msg.attr_start(IFLA_LINKINFO);
        msg.add_attr_str(IFLA_INFO_KIND, "wireguard");
        msg.attr_end(pos);
        let buf = msg.finalize().to_vec();

        let attrs = parse_attrs(&buf[NLMSG_HDRLEN + IFINFOMSG_LEN..]);
        assert_eq!(attrs[0].0, IFLA_LINKINFO);
        let inner = parse_attrs(attrs[0].1);
        assert_eq!(inner[0].0, IFLA_INFO_KIND);
        assert_eq!(attr_str(inner[0].1), "wireguard");
    }

    #[test]
    fn test_split_messages_reads_error_reply() {
        // nlmsghdr(NLMSG_ERROR) + nlmsgerr.error = -EEXIST (17)
        let mut msg = NlMsg::new(NLMSG_ERROR, 0, 42);
        msg.add_attr_u32(0, 0); // placeholder to make room
        let mut buf = msg.finalize().to_vec();
        buf[NLMSG_HDRLEN..NLMSG_HDRLEN + 4].copy_from_slice(&(-17i32).to_ne_bytes());

        let replies = split_messages(&buf);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].seq, 42);
        assert_eq!(replies[0].errno(), Some(17));
    }

    #[test]
    fn test_attr_ip_decodes_both_families() {
        assert_eq!(
            attr_ip(AF_INET, &[10, 2, 0, 2]),
            Some("10.2.0.2".parse().unwrap())
        );
        let v6: IpAddr = "fd00::2".parse().unwrap();
        let IpAddr::V6(raw) = v6 else { unreachable!() };
        assert_eq!(attr_ip(AF_INET6, &raw.octets()), Some(v6));
        assert_eq!(attr_ip(AF_INET, &[1, 2, 3]), None);
    }
}
