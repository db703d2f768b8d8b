//! Synchronous route-netlink client
//!
//! A thin layer over a raw `AF_NETLINK`/`NETLINK_ROUTE` socket: `repr(C)`
//! message headers, manual TLV attribute building, blocking send/recv.
//! Every operation translates kernel failures into typed errors that keep
//! the original errno.

use std::mem;
use std::net::IpAddr;
use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use log::debug;

use crate::errors::{kind_for_errno, Error, ErrorKind, Result};
use crate::network::addr::{Family, NetAddr};

const NETLINK_ROUTE: i32 = 0;

// Message types
pub(crate) const RTM_NEWLINK: u16 = 16;
pub(crate) const RTM_DELLINK: u16 = 17;
pub(crate) const RTM_GETLINK: u16 = 18;
pub(crate) const RTM_NEWADDR: u16 = 20;
pub(crate) const RTM_GETADDR: u16 = 22;
pub(crate) const RTM_NEWROUTE: u16 = 24;
pub(crate) const RTM_NEWNEIGH: u16 = 28;
pub(crate) const RTM_DELNEIGH: u16 = 29;
pub(crate) const RTM_NEWQDISC: u16 = 36;
pub(crate) const RTM_DELQDISC: u16 = 37;
pub(crate) const RTM_GETQDISC: u16 = 38;
pub(crate) const RTM_NEWTCLASS: u16 = 40;
pub(crate) const RTM_DELTCLASS: u16 = 41;
pub(crate) const RTM_GETTCLASS: u16 = 42;
pub(crate) const RTM_NEWTFILTER: u16 = 44;
pub(crate) const RTM_DELTFILTER: u16 = 45;

const NLMSG_NOOP: u16 = 1;
const NLMSG_ERROR: u16 = 2;
const NLMSG_DONE: u16 = 3;

// Header flags
pub(crate) const NLM_F_REQUEST: u16 = 0x0001;
pub(crate) const NLM_F_ACK: u16 = 0x0004;
pub(crate) const NLM_F_REPLACE: u16 = 0x0100;
pub(crate) const NLM_F_EXCL: u16 = 0x0200;
pub(crate) const NLM_F_CREATE: u16 = 0x0400;
pub(crate) const NLM_F_DUMP: u16 = 0x0300;

// Link attributes
const IFLA_ADDRESS: u16 = 1;
const IFLA_IFNAME: u16 = 3;
const IFLA_MTU: u16 = 4;
const IFLA_LINK: u16 = 5;
const IFLA_QDISC: u16 = 6;
const IFLA_STATS: u16 = 7;
const IFLA_MASTER: u16 = 10;
const IFLA_LINKINFO: u16 = 18;
const IFLA_STATS64: u16 = 23;
const IFLA_GROUP: u16 = 27;
const IFLA_NET_NS_FD: u16 = 28;

const IFLA_INFO_KIND: u16 = 1;
const IFLA_INFO_DATA: u16 = 2;

const VETH_INFO_PEER: u16 = 1;
const IFLA_MACVLAN_MODE: u16 = 1;
const IFLA_IPVLAN_MODE: u16 = 1;

// Address attributes
const IFA_ADDRESS: u16 = 1;
const IFA_LOCAL: u16 = 2;
const IFA_FLAGS: u16 = 8;

pub(crate) const IFA_F_TENTATIVE: u32 = 0x40;

// Route attributes
const RTA_DST: u16 = 1;
const RTA_OIF: u16 = 4;
const RTA_GATEWAY: u16 = 5;

// Neighbour attributes
const NDA_DST: u16 = 1;
const NTF_PROXY: u8 = 0x08;
const NUD_PERMANENT: u16 = 0x80;

// Scopes, tables and types
pub(crate) const RT_SCOPE_UNIVERSE: u8 = 0;
const RT_SCOPE_LINK: u8 = 253;
pub(crate) const RT_SCOPE_HOST: u8 = 254;
const RT_TABLE_MAIN: u8 = 254;
const RTPROT_BOOT: u8 = 3;
const RTN_UNICAST: u8 = 1;

// Interface flags
pub(crate) const IFF_UP: u32 = 0x1;
pub(crate) const IFF_LOOPBACK: u32 = 0x8;
pub(crate) const IFF_RUNNING: u32 = 0x40;

/// Multicast group for IPv6 address notifications
const RTMGRP_IPV6_IFADDR: u32 = 0x100;

const NLA_F_NESTED: u16 = 1 << 15;
const NLA_HEADER_SIZE: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct NlMsgHdr {
    nlmsg_len: u32,
    nlmsg_type: u16,
    nlmsg_flags: u16,
    nlmsg_seq: u32,
    nlmsg_pid: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct IfInfoMsg {
    pub ifi_family: u8,
    _pad: u8,
    pub ifi_type: u16,
    pub ifi_index: i32,
    pub ifi_flags: u32,
    pub ifi_change: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct IfAddrMsg {
    ifa_family: u8,
    ifa_prefixlen: u8,
    ifa_flags: u8,
    ifa_scope: u8,
    ifa_index: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct RtMsg {
    rtm_family: u8,
    rtm_dst_len: u8,
    rtm_src_len: u8,
    rtm_tos: u8,
    rtm_table: u8,
    rtm_protocol: u8,
    rtm_scope: u8,
    rtm_type: u8,
    rtm_flags: u32,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct NdMsg {
    ndm_family: u8,
    _pad1: u8,
    _pad2: u16,
    ndm_ifindex: i32,
    ndm_state: u16,
    ndm_flags: u8,
    ndm_type: u8,
}

/// Outgoing request under construction: header space, a fixed `repr(C)`
/// body, then TLV attributes padded to 4 bytes.
pub(crate) struct NlRequest {
    buf: Vec<u8>,
    ty: u16,
    flags: u16,
}

impl NlRequest {
    pub fn new(ty: u16, flags: u16) -> Self {
        Self {
            buf: vec![0u8; mem::size_of::<NlMsgHdr>()],
            ty,
            flags,
        }
    }

    pub fn push<T: Copy>(&mut self, value: &T) {
        let bytes = unsafe {
            std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>())
        };
        self.buf.extend_from_slice(bytes);
    }

    pub fn attr(&mut self, ty: u16, data: &[u8]) {
        let len = NLA_HEADER_SIZE + data.len();
        let padded = (len + 3) & !3;
        self.buf.extend_from_slice(&(len as u16).to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(data);
        self.buf.resize(self.buf.len() + padded - len, 0);
    }

    pub fn attr_str(&mut self, ty: u16, value: &str) {
        let mut data = value.as_bytes().to_vec();
        data.push(0);
        self.attr(ty, &data);
    }

    pub fn attr_u32(&mut self, ty: u16, value: u32) {
        self.attr(ty, &value.to_ne_bytes());
    }

    /// Open a nested attribute; returns a cookie for [`Self::end_nest`]
    pub fn begin_nest(&mut self, ty: u16) -> usize {
        let pos = self.buf.len();
        self.buf.extend_from_slice(&0u16.to_ne_bytes());
        self.buf.extend_from_slice(&(ty | NLA_F_NESTED).to_ne_bytes());
        pos
    }

    pub fn end_nest(&mut self, pos: usize) {
        let len = (self.buf.len() - pos) as u16;
        self.buf[pos..pos + 2].copy_from_slice(&len.to_ne_bytes());
    }

    fn finish(mut self, seq: u32) -> Vec<u8> {
        let hdr = NlMsgHdr {
            nlmsg_len: self.buf.len() as u32,
            nlmsg_type: self.ty,
            nlmsg_flags: self.flags,
            nlmsg_seq: seq,
            nlmsg_pid: 0,
        };
        let bytes = unsafe {
            std::slice::from_raw_parts(&hdr as *const _ as *const u8, mem::size_of::<NlMsgHdr>())
        };
        self.buf[..mem::size_of::<NlMsgHdr>()].copy_from_slice(bytes);
        self.buf
    }
}

/// Iterate TLV attributes in a payload; the nested bit is stripped
pub(crate) fn parse_attrs(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut attrs = Vec::new();
    let mut offset = 0usize;
    while offset + NLA_HEADER_SIZE <= buf.len() {
        let len = u16::from_ne_bytes([buf[offset], buf[offset + 1]]) as usize;
        let ty = u16::from_ne_bytes([buf[offset + 2], buf[offset + 3]]) & !NLA_F_NESTED;
        if len < NLA_HEADER_SIZE || offset + len > buf.len() {
            break;
        }
        attrs.push((ty, &buf[offset + NLA_HEADER_SIZE..offset + len]));
        offset += (len + 3) & !3;
    }
    attrs
}

fn attr_u32_value(data: &[u8]) -> Option<u32> {
    data.get(..4).map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
}

fn attr_str_value(data: &[u8]) -> String {
    let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    String::from_utf8_lossy(&data[..end]).into_owned()
}

/// Per-link counters from the kernel statistics attribute
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub rx_bytes: u64,
    pub rx_packets: u64,
    pub rx_dropped: u64,
    pub tx_bytes: u64,
    pub tx_packets: u64,
    pub tx_dropped: u64,
}

/// One entry of the link cache
#[derive(Debug, Clone, Default)]
pub struct LinkInfo {
    pub index: i32,
    pub name: String,
    pub kind: String,
    pub flags: u32,
    pub mtu: u32,
    pub link: i32,
    pub master: i32,
    pub group: u32,
    pub qdisc: String,
    pub stats: LinkStats,
}

impl LinkInfo {
    pub fn is_loopback(&self) -> bool {
        self.flags & IFF_LOOPBACK != 0
    }

    pub fn is_running(&self) -> bool {
        self.flags & IFF_RUNNING != 0
    }
}

/// One entry of the address cache
#[derive(Debug, Clone)]
pub struct AddrInfo {
    pub ifindex: i32,
    pub scope: u8,
    pub flags: u32,
    pub addr: NetAddr,
}

fn parse_link(payload: &[u8]) -> Option<LinkInfo> {
    if payload.len() < mem::size_of::<IfInfoMsg>() {
        return None;
    }
    let ifi = unsafe { &*(payload.as_ptr() as *const IfInfoMsg) };
    let mut info = LinkInfo {
        index: ifi.ifi_index,
        flags: ifi.ifi_flags,
        ..Default::default()
    };

    for (ty, data) in parse_attrs(&payload[mem::size_of::<IfInfoMsg>()..]) {
        match ty {
            IFLA_IFNAME => info.name = attr_str_value(data),
            IFLA_MTU => info.mtu = attr_u32_value(data).unwrap_or(0),
            IFLA_LINK => info.link = attr_u32_value(data).unwrap_or(0) as i32,
            IFLA_MASTER => info.master = attr_u32_value(data).unwrap_or(0) as i32,
            IFLA_GROUP => info.group = attr_u32_value(data).unwrap_or(0),
            IFLA_QDISC => info.qdisc = attr_str_value(data),
            IFLA_LINKINFO => {
                for (sub, subdata) in parse_attrs(data) {
                    if sub == IFLA_INFO_KIND {
                        info.kind = attr_str_value(subdata);
                    }
                }
            }
            IFLA_STATS64 => {
                let u64_at = |i: usize| {
                    data.get(i * 8..i * 8 + 8)
                        .map(|b| u64::from_ne_bytes(b.try_into().unwrap()))
                        .unwrap_or(0)
                };
                // struct rtnl_link_stats64: rx_packets, tx_packets, rx_bytes,
                // tx_bytes, rx_errors, tx_errors, rx_dropped, tx_dropped, ...
                info.stats = LinkStats {
                    rx_packets: u64_at(0),
                    tx_packets: u64_at(1),
                    rx_bytes: u64_at(2),
                    tx_bytes: u64_at(3),
                    rx_dropped: u64_at(6),
                    tx_dropped: u64_at(7),
                };
            }
            IFLA_STATS if info.stats == LinkStats::default() => {
                let u32_at = |i: usize| {
                    data.get(i * 4..i * 4 + 4)
                        .map(|b| u32::from_ne_bytes(b.try_into().unwrap()))
                        .unwrap_or(0) as u64
                };
                info.stats = LinkStats {
                    rx_packets: u32_at(0),
                    tx_packets: u32_at(1),
                    rx_bytes: u32_at(2),
                    tx_bytes: u32_at(3),
                    rx_dropped: u32_at(6),
                    tx_dropped: u32_at(7),
                };
            }
            _ => {}
        }
    }
    Some(info)
}

fn parse_addr(payload: &[u8]) -> Option<AddrInfo> {
    if payload.len() < mem::size_of::<IfAddrMsg>() {
        return None;
    }
    let ifa = unsafe { &*(payload.as_ptr() as *const IfAddrMsg) };
    let mut local: Option<IpAddr> = None;
    let mut address: Option<IpAddr> = None;
    let mut flags = ifa.ifa_flags as u32;

    for (ty, data) in parse_attrs(&payload[mem::size_of::<IfAddrMsg>()..]) {
        let ip = match (ifa.ifa_family as i32, data.len()) {
            (libc::AF_INET, 4) => {
                let bytes: [u8; 4] = data.try_into().ok()?;
                Some(IpAddr::from(bytes))
            }
            (libc::AF_INET6, 16) => {
                let bytes: [u8; 16] = data.try_into().ok()?;
                Some(IpAddr::from(bytes))
            }
            _ => None,
        };
        match ty {
            IFA_LOCAL => local = ip,
            IFA_ADDRESS => address = ip,
            IFA_FLAGS => flags = attr_u32_value(data).unwrap_or(flags),
            _ => {}
        }
    }

    let ip = local.or(address)?;
    let addr = NetAddr::new(ip, ifa.ifa_prefixlen).ok()?;
    Some(AddrInfo {
        ifindex: ifa.ifa_index as i32,
        scope: ifa.ifa_scope,
        flags,
        addr,
    })
}

fn family_of(addr: &NetAddr) -> u8 {
    match addr.family() {
        Family::V4 => libc::AF_INET as u8,
        Family::V6 => libc::AF_INET6 as u8,
    }
}

pub(crate) fn kernel_error(errno: i32, desc: impl Into<String>) -> Error {
    Error::from_errno(kind_for_errno(errno), errno, desc.into())
}

/// Blocking route-netlink socket
pub struct Netlink {
    fd: OwnedFd,
    seq: u32,
}

impl Netlink {
    /// Open and bind a route-netlink socket
    pub fn connect() -> Result<Self> {
        Self::connect_groups(0)
    }

    fn connect_groups(groups: u32) -> Result<Self> {
        let fd = unsafe {
            libc::socket(
                libc::AF_NETLINK,
                libc::SOCK_RAW | libc::SOCK_CLOEXEC,
                NETLINK_ROUTE,
            )
        };
        if fd < 0 {
            return Err(Error::os(ErrorKind::Unknown, "socket(AF_NETLINK)"));
        }
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut addr: libc::sockaddr_nl = unsafe { mem::zeroed() };
        addr.nl_family = libc::AF_NETLINK as u16;
        addr.nl_pid = 0;
        addr.nl_groups = groups;
        let ret = unsafe {
            libc::bind(
                fd.as_raw_fd(),
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_nl>() as u32,
            )
        };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, "bind(AF_NETLINK)"));
        }
        Ok(Self { fd, seq: 0 })
    }

    /// Socket subscribed to IPv6 address notifications (autoconf waits)
    pub fn connect_ipv6_notifications() -> Result<Self> {
        Self::connect_groups(RTMGRP_IPV6_IFADDR)
    }

    pub fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn next_seq(&mut self) -> u32 {
        self.seq = self.seq.wrapping_add(1);
        self.seq
    }

    fn send(&self, msg: &[u8], desc: &str) -> Result<()> {
        let ret = unsafe {
            libc::send(
                self.fd.as_raw_fd(),
                msg.as_ptr() as *const libc::c_void,
                msg.len(),
                0,
            )
        };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, format!("netlink send: {}", desc)));
        }
        Ok(())
    }

    fn recv_datagram(&self, buf: &mut [u8], desc: &str) -> Result<usize> {
        let len = unsafe {
            libc::recv(
                self.fd.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                0,
            )
        };
        if len < 0 {
            return Err(Error::os(ErrorKind::Unknown, format!("netlink recv: {}", desc)));
        }
        Ok(len as usize)
    }

    /// Bound the next receive; used only by the autoconf notifier
    pub fn set_recv_timeout(&self, timeout: Duration) -> Result<()> {
        let tv = libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };
        let ret = unsafe {
            libc::setsockopt(
                self.fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_RCVTIMEO,
                &tv as *const _ as *const libc::c_void,
                mem::size_of::<libc::timeval>() as u32,
            )
        };
        if ret < 0 {
            return Err(Error::os(ErrorKind::Unknown, "setsockopt(SO_RCVTIMEO)"));
        }
        Ok(())
    }

    /// Wait for any subscribed notification; `Ok(false)` means timeout
    pub fn wait_notification(&self) -> Result<bool> {
        let mut buf = [0u8; 8192];
        match self.recv_datagram(&mut buf, "notification") {
            Ok(_) => Ok(true),
            Err(e) if e.errno == libc::EAGAIN || e.errno == libc::EWOULDBLOCK => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Send a request and consume the kernel ack
    pub(crate) fn transact(&mut self, req: NlRequest, desc: &str) -> Result<()> {
        let seq = self.next_seq();
        self.send(&req.finish(seq), desc)?;

        let mut buf = vec![0u8; 65536];
        loop {
            let len = self.recv_datagram(&mut buf, desc)?;
            for (ty, payload) in split_messages(&buf[..len]) {
                match ty {
                    NLMSG_NOOP => continue,
                    NLMSG_ERROR => {
                        let code = payload
                            .get(..4)
                            .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
                            .unwrap_or(-libc::EIO);
                        if code == 0 {
                            return Ok(());
                        }
                        return Err(kernel_error(-code, desc.to_string()));
                    }
                    _ => continue,
                }
            }
        }
    }

    /// Send a dump request and collect payloads of the expected type
    pub(crate) fn dump(&mut self, req: NlRequest, expect: u16, desc: &str) -> Result<Vec<Vec<u8>>> {
        let seq = self.next_seq();
        self.send(&req.finish(seq), desc)?;

        let mut results = Vec::new();
        let mut buf = vec![0u8; 65536];
        loop {
            let len = self.recv_datagram(&mut buf, desc)?;
            for (ty, payload) in split_messages(&buf[..len]) {
                match ty {
                    NLMSG_DONE => return Ok(results),
                    NLMSG_ERROR => {
                        let code = payload
                            .get(..4)
                            .map(|b| i32::from_ne_bytes(b.try_into().unwrap()))
                            .unwrap_or(-libc::EIO);
                        if code != 0 {
                            return Err(kernel_error(-code, desc.to_string()));
                        }
                    }
                    t if t == expect => results.push(payload.to_vec()),
                    _ => {}
                }
            }
        }
    }

    /// Enumerate all links
    pub fn dump_links(&mut self) -> Result<Vec<LinkInfo>> {
        let mut req = NlRequest::new(RTM_GETLINK, NLM_F_REQUEST | NLM_F_DUMP);
        req.push(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ..Default::default()
        });
        let payloads = self.dump(req, RTM_NEWLINK, "dump links")?;
        Ok(payloads.iter().filter_map(|p| parse_link(p)).collect())
    }

    /// Enumerate links, optionally hiding loopback and non-running ones
    pub fn open_links(&mut self, all: bool, require_running: bool) -> Result<Vec<LinkInfo>> {
        let links = self.dump_links()?;
        if all {
            return Ok(links);
        }
        Ok(links
            .into_iter()
            .filter(|l| !l.is_loopback() && (!require_running || l.is_running()))
            .collect())
    }

    /// Look a link up by name
    pub fn link_by_name(&mut self, name: &str) -> Result<LinkInfo> {
        self.dump_links()?
            .into_iter()
            .find(|l| l.name == name)
            .ok_or_else(|| {
                Error::from_errno(
                    ErrorKind::Unknown,
                    libc::ENODEV,
                    format!("link {} not found", name),
                )
            })
    }

    /// Enumerate all addresses
    pub fn dump_addrs(&mut self) -> Result<Vec<AddrInfo>> {
        let mut req = NlRequest::new(RTM_GETADDR, NLM_F_REQUEST | NLM_F_DUMP);
        req.push(&IfAddrMsg::default());
        let payloads = self.dump(req, RTM_NEWADDR, "dump addrs")?;
        Ok(payloads.iter().filter_map(|p| parse_addr(p)).collect())
    }

    /// Create a veth pair: `name` appears inside `netns_fd`, `peer` stays here
    pub fn add_veth(
        &mut self,
        name: &str,
        peer: &str,
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
        netns_fd: Option<RawFd>,
    ) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        req.push(&IfInfoMsg::default());
        req.attr_str(IFLA_IFNAME, name);
        if let Some(hw) = hw {
            req.attr(IFLA_ADDRESS, &hw);
        }
        if let Some(mtu) = mtu {
            req.attr_u32(IFLA_MTU, mtu);
        }
        if let Some(fd) = netns_fd {
            req.attr_u32(IFLA_NET_NS_FD, fd as u32);
        }

        let linkinfo = req.begin_nest(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "veth");
        let data = req.begin_nest(IFLA_INFO_DATA);
        let peer_nest = req.begin_nest(VETH_INFO_PEER);
        req.push(&IfInfoMsg::default());
        req.attr_str(IFLA_IFNAME, peer);
        req.end_nest(peer_nest);
        req.end_nest(data);
        req.end_nest(linkinfo);

        debug!("add veth {} peer {}", name, peer);
        self.transact(req, &format!("add veth {}", name))
    }

    fn add_vlan_link(
        &mut self,
        name: &str,
        kind: &str,
        master_index: i32,
        mode_attr: (u16, Vec<u8>),
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
    ) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWLINK,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        req.push(&IfInfoMsg::default());
        req.attr_str(IFLA_IFNAME, name);
        req.attr_u32(IFLA_LINK, master_index as u32);
        if let Some(hw) = hw {
            req.attr(IFLA_ADDRESS, &hw);
        }
        if let Some(mtu) = mtu {
            req.attr_u32(IFLA_MTU, mtu);
        }

        let linkinfo = req.begin_nest(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, kind);
        let data = req.begin_nest(IFLA_INFO_DATA);
        req.attr(mode_attr.0, &mode_attr.1);
        req.end_nest(data);
        req.end_nest(linkinfo);

        debug!("add {} {} on link {}", kind, name, master_index);
        self.transact(req, &format!("add {} {}", kind, name))
    }

    /// Create a macvlan on top of `master_index`
    pub fn add_macvlan(
        &mut self,
        name: &str,
        master_index: i32,
        mode: u32,
        hw: Option<[u8; 6]>,
        mtu: Option<u32>,
    ) -> Result<()> {
        self.add_vlan_link(
            name,
            "macvlan",
            master_index,
            (IFLA_MACVLAN_MODE, mode.to_ne_bytes().to_vec()),
            hw,
            mtu,
        )
    }

    /// Create an ipvlan on top of `master_index`
    pub fn add_ipvlan(
        &mut self,
        name: &str,
        master_index: i32,
        mode: u16,
        mtu: Option<u32>,
    ) -> Result<()> {
        self.add_vlan_link(
            name,
            "ipvlan",
            master_index,
            (IFLA_IPVLAN_MODE, mode.to_ne_bytes().to_vec()),
            None,
            mtu,
        )
    }

    /// Move a link into another network namespace, renaming it on the way
    pub fn change_ns(&mut self, index: i32, new_name: &str, netns_fd: RawFd) -> Result<()> {
        let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: index,
            ..Default::default()
        });
        req.attr_str(IFLA_IFNAME, new_name);
        req.attr_u32(IFLA_NET_NS_FD, netns_fd as u32);
        self.transact(req, &format!("change netns of link {}", index))
    }

    /// Delete a link
    pub fn remove(&mut self, index: i32) -> Result<()> {
        let mut req = NlRequest::new(RTM_DELLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: index,
            ..Default::default()
        });
        self.transact(req, &format!("remove link {}", index))
    }

    /// Bring a link up
    pub fn up(&mut self, index: i32) -> Result<()> {
        let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: index,
            ifi_flags: IFF_UP,
            ifi_change: IFF_UP,
            ..Default::default()
        });
        self.transact(req, &format!("link {} up", index))
    }

    /// Enslave a link to a bridge
    pub fn enslave(&mut self, index: i32, master_index: i32) -> Result<()> {
        let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: index,
            ..Default::default()
        });
        req.attr_u32(IFLA_MASTER, master_index as u32);
        self.transact(req, &format!("enslave link {}", index))
    }

    /// Assign an address with its prefix to a link
    pub fn set_ip(&mut self, index: i32, addr: &NetAddr) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWADDR,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        );
        req.push(&IfAddrMsg {
            ifa_family: family_of(addr),
            ifa_prefixlen: addr.prefix(),
            ifa_index: index as u32,
            ..Default::default()
        });
        let octets = addr.octets();
        req.attr(IFA_LOCAL, &octets);
        req.attr(IFA_ADDRESS, &octets);
        self.transact(req, &format!("set ip {} on link {}", addr, index))
    }

    /// Install a default route through `gw`
    pub fn set_default_gw(&mut self, index: i32, gw: &NetAddr) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        );
        req.push(&RtMsg {
            rtm_family: family_of(gw),
            rtm_dst_len: 0,
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_UNIVERSE,
            rtm_type: RTN_UNICAST,
            ..Default::default()
        });
        req.attr(RTA_GATEWAY, &gw.octets());
        req.attr_u32(RTA_OIF, index as u32);
        self.transact(req, &format!("default gw {} via link {}", gw, index))
    }

    /// Install a direct (on-link) route to `addr`
    pub fn add_direct_route(&mut self, index: i32, addr: &NetAddr) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWROUTE,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        );
        req.push(&RtMsg {
            rtm_family: family_of(addr),
            rtm_dst_len: addr.prefix(),
            rtm_table: RT_TABLE_MAIN,
            rtm_protocol: RTPROT_BOOT,
            rtm_scope: RT_SCOPE_LINK,
            rtm_type: RTN_UNICAST,
            ..Default::default()
        });
        req.attr(RTA_DST, &addr.octets());
        req.attr_u32(RTA_OIF, index as u32);
        self.transact(req, &format!("direct route {} via link {}", addr, index))
    }

    /// Add or remove a proxy ARP/NDP entry so the kernel answers for `addr`
    pub fn proxy_neighbour(&mut self, index: i32, addr: &NetAddr, add: bool) -> Result<()> {
        let (ty, flags) = if add {
            (RTM_NEWNEIGH, NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE)
        } else {
            (RTM_DELNEIGH, NLM_F_REQUEST | NLM_F_ACK)
        };
        let mut req = NlRequest::new(ty, flags);
        req.push(&NdMsg {
            ndm_family: family_of(addr),
            ndm_ifindex: index,
            ndm_state: NUD_PERMANENT,
            ndm_flags: NTF_PROXY,
            ..Default::default()
        });
        req.attr(NDA_DST, &addr.octets());
        self.transact(
            req,
            &format!(
                "{} proxy neighbour {} on link {}",
                if add { "add" } else { "del" },
                addr,
                index
            ),
        )
    }
}

fn split_messages(buf: &[u8]) -> Vec<(u16, &[u8])> {
    let mut messages = Vec::new();
    let mut offset = 0usize;
    let hdr_len = mem::size_of::<NlMsgHdr>();
    while offset + hdr_len <= buf.len() {
        let hdr = unsafe { &*(buf.as_ptr().add(offset) as *const NlMsgHdr) };
        let len = hdr.nlmsg_len as usize;
        if len < hdr_len || offset + len > buf.len() {
            break;
        }
        messages.push((hdr.nlmsg_type, &buf[offset + hdr_len..offset + len]));
        offset += (len + 3) & !3;
    }
    messages
}

/// Block until `name` holds a global, non-tentative IPv6 address, or fail
/// after `timeout`. Router advertisements land asynchronously, so this
/// subscribes to address notifications and re-checks on every event.
pub fn wait_ipv6_address(name: &str, timeout: Duration) -> Result<()> {
    use std::time::Instant;

    let notifier = Netlink::connect_ipv6_notifications()?;
    let mut nl = Netlink::connect()?;
    let link = nl.link_by_name(name)?;
    let deadline = Instant::now() + timeout;

    loop {
        let ready = nl.dump_addrs()?.iter().any(|a| {
            a.ifindex == link.index
                && a.addr.family() == Family::V6
                && a.scope == RT_SCOPE_UNIVERSE
                && a.flags & IFA_F_TENTATIVE == 0
        });
        if ready {
            return Ok(());
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(Error::from_errno(
                ErrorKind::Unknown,
                libc::ETIMEDOUT,
                format!("autoconf timeout on {}", name),
            ));
        }
        notifier.set_recv_timeout(deadline - now)?;
        if !notifier.wait_notification()? {
            return Err(Error::from_errno(
                ErrorKind::Unknown,
                libc::ETIMEDOUT,
                format!("autoconf timeout on {}", name),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attr_padding_is_four_bytes() {
        let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_REQUEST);
        req.attr_str(IFLA_IFNAME, "eth0");
        // header(16) + nla header(4) + "eth0\0"(5) padded to 8
        let msg = req.finish(1);
        assert_eq!(msg.len(), 16 + 4 + 8);
        assert_eq!(u16::from_ne_bytes([msg[16], msg[17]]), 9);
    }

    #[test]
    fn attrs_roundtrip_through_parser() {
        let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_REQUEST);
        req.attr_str(IFLA_IFNAME, "veth1");
        req.attr_u32(IFLA_MTU, 1400);
        let msg = req.finish(1);
        let attrs = parse_attrs(&msg[16..]);
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, IFLA_IFNAME);
        assert_eq!(attr_str_value(attrs[0].1), "veth1");
        assert_eq!(attrs[1].0, IFLA_MTU);
        assert_eq!(attr_u32_value(attrs[1].1), Some(1400));
    }

    #[test]
    fn nested_attrs_carry_the_nested_flag() {
        let mut req = NlRequest::new(RTM_NEWLINK, NLM_F_REQUEST);
        let nest = req.begin_nest(IFLA_LINKINFO);
        req.attr_str(IFLA_INFO_KIND, "macvlan");
        req.end_nest(nest);
        let msg = req.finish(1);

        let attrs = parse_attrs(&msg[16..]);
        assert_eq!(attrs.len(), 1);
        assert_eq!(attrs[0].0, IFLA_LINKINFO);
        let inner = parse_attrs(attrs[0].1);
        assert_eq!(inner.len(), 1);
        assert_eq!(attr_str_value(inner[0].1), "macvlan");
    }

    #[test]
    fn link_payload_roundtrip() {
        let mut req = NlRequest::new(RTM_NEWLINK, 0);
        req.push(&IfInfoMsg {
            ifi_family: libc::AF_UNSPEC as u8,
            ifi_index: 5,
            ifi_flags: IFF_UP | IFF_RUNNING,
            ..Default::default()
        });
        req.attr_str(IFLA_IFNAME, "eth2");
        req.attr_u32(IFLA_MTU, 9000);
        req.attr_u32(IFLA_GROUP, 7);
        req.attr_str(IFLA_QDISC, "htb");
        let msg = req.finish(1);

        let info = parse_link(&msg[16..]).unwrap();
        assert_eq!(info.index, 5);
        assert_eq!(info.name, "eth2");
        assert_eq!(info.mtu, 9000);
        assert_eq!(info.group, 7);
        assert_eq!(info.qdisc, "htb");
        assert!(info.is_running());
        assert!(!info.is_loopback());
    }

    #[test]
    fn truncated_attrs_are_ignored() {
        let buf = [6u8, 0, 3, 0, 1];
        assert!(parse_attrs(&buf).is_empty());
    }

    #[test]
    #[ignore = "requires a live netlink socket"]
    fn dump_links_finds_loopback() {
        let mut nl = Netlink::connect().unwrap();
        let links = nl.dump_links().unwrap();
        assert!(links.iter().any(|l| l.is_loopback()));
    }
}
