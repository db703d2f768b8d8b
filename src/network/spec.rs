//! Textual network specification: parsing and realisation
//!
//! A container's network is described by lines like:
//!
//! ```text
//! none
//! inherited | host
//! container <name>
//! netns <name>
//! steal <dev>                        (legacy alias: "host <dev>")
//! macvlan <master> <name> [type [mtu [hw]]]
//! ipvlan <master> <name> [mode [mtu]]
//! veth <name> <bridge> [mtu [hw]]
//! L3 [name [master]]
//! NAT [name]
//! MTU <name> <int>
//! autoconf <name>
//! ```
//!
//! [`NetSpec::parse`] validates the grammar; [`NetEnv`] materialises the
//! parsed spec against a parent [`Network`] and a target namespace.

use std::path::Path;
use std::sync::Arc;

use log::{error, warn};

use crate::config::{NetworkConfig, PatternMap};
use crate::errors::{Error, ErrorKind, Result};
use crate::isolation::namespace::NamespaceHandle;
use crate::network::addr::{Family, NetAddr};
use crate::network::tc::{container_class, CONTAINER_ID_MIN, PORTO_ROOT_CLASS};
use crate::network::{NetRegistry, Network, L3_PREFIX, VETH_PREFIX};
use crate::utils::{crc32, get_tid};

const MACVLAN_MODES: &[(&str, u32)] = &[
    ("private", 1),
    ("vepa", 2),
    ("bridge", 4),
    ("passthru", 8),
];

const IPVLAN_MODES: &[(&str, u16)] = &[("l2", 0), ("l3", 1)];

pub fn valid_macvlan_type(kind: &str) -> bool {
    MACVLAN_MODES.iter().any(|(name, _)| *name == kind)
}

pub fn valid_ipvlan_mode(mode: &str) -> bool {
    IPVLAN_MODES.iter().any(|(name, _)| *name == mode)
}

fn macvlan_mode(kind: &str) -> u32 {
    MACVLAN_MODES
        .iter()
        .find(|(name, _)| *name == kind)
        .map(|(_, mode)| *mode)
        .unwrap_or(4)
}

fn ipvlan_mode(mode: &str) -> u16 {
    IPVLAN_MODES
        .iter()
        .find(|(name, _)| *name == mode)
        .map(|(_, mode)| *mode)
        .unwrap_or(0)
}

/// `XX:XX:XX:XX:XX:XX` with hex bytes
pub fn valid_mac(hw: &str) -> bool {
    parse_mac(hw).is_some()
}

pub fn parse_mac(hw: &str) -> Option<[u8; 6]> {
    let mut bytes = [0u8; 6];
    let mut count = 0;
    for part in hw.split(':') {
        if count == 6 || part.len() != 2 {
            return None;
        }
        bytes[count] = u8::from_str_radix(part, 16).ok()?;
        count += 1;
    }
    if count == 6 {
        Some(bytes)
    } else {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MacVlanSpec {
    pub master: String,
    pub name: String,
    pub kind: String,
    pub mtu: Option<u32>,
    pub hw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpVlanSpec {
    pub master: String,
    pub name: String,
    pub mode: String,
    pub mtu: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VethSpec {
    pub name: String,
    pub bridge: Option<String>,
    pub mtu: Option<u32>,
    pub hw: Option<String>,
    /// Deterministic parent-end name: `portove-<container_id>-<seq>`
    pub peer: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct L3Spec {
    pub name: String,
    pub master: Option<String>,
    pub mtu: Option<u32>,
    pub nat: bool,
    pub addrs: Vec<NetAddr>,
}

/// Per-interface static address assignment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpSpec {
    pub iface: String,
    pub addr: NetAddr,
}

/// Per-interface default gateway
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GwSpec {
    pub iface: String,
    pub addr: NetAddr,
}

/// Parsed network specification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NetSpec {
    /// Create a fresh empty netns (the default)
    pub new_netns: bool,
    pub inherited: bool,
    pub none: bool,
    pub steal: Vec<String>,
    pub macvlan: Vec<MacVlanSpec>,
    pub ipvlan: Vec<IpVlanSpec>,
    pub veth: Vec<VethSpec>,
    pub l3: Vec<L3Spec>,
    pub autoconf: Vec<String>,
    pub netns_name: Option<String>,
    pub ct_name: Option<String>,
}

impl NetSpec {
    /// Parse the line-separated specification of container `id`
    pub fn parse(id: u32, lines: &[String]) -> Result<Self> {
        let mut spec = NetSpec {
            new_netns: true,
            ..Default::default()
        };
        let mut veth_seq = 0u32;

        if lines.is_empty() {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "network configuration is not specified",
            ));
        }

        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.is_empty() {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid net in: {}", line),
                ));
            }

            let mut kind = fields[0];
            if kind == "host" && fields.len() == 1 {
                kind = "inherited";
            }

            match kind {
                "none" => spec.none = true,
                "inherited" => {
                    spec.new_netns = false;
                    spec.inherited = true;
                }
                // "host <dev>" is the legacy spelling of steal
                "steal" | "host" => {
                    if fields.len() != 2 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid net in: {}", line),
                        ));
                    }
                    spec.steal.push(fields[1].to_string());
                }
                "container" => {
                    if fields.len() != 2 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid net in: {}", line),
                        ));
                    }
                    spec.new_netns = false;
                    spec.ct_name = Some(fields[1].to_string());
                }
                "netns" => {
                    if fields.len() != 2 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid netns in: {}", line),
                        ));
                    }
                    let name = fields[1];
                    if !Path::new("/var/run/netns").join(name).exists() {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("net namespace not found: {}", name),
                        ));
                    }
                    spec.new_netns = false;
                    spec.netns_name = Some(name.to_string());
                }
                "macvlan" => {
                    if fields.len() < 3 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid macvlan in: {}", line),
                        ));
                    }
                    let mut mvlan = MacVlanSpec {
                        master: fields[1].to_string(),
                        name: fields[2].to_string(),
                        kind: "bridge".to_string(),
                        mtu: None,
                        hw: None,
                    };
                    if fields.len() > 3 {
                        if !valid_macvlan_type(fields[3]) {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid macvlan type {}", fields[3]),
                            ));
                        }
                        mvlan.kind = fields[3].to_string();
                    }
                    if fields.len() > 4 {
                        mvlan.mtu = Some(fields[4].parse().map_err(|_| {
                            Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid macvlan mtu {}", fields[4]),
                            )
                        })?);
                    }
                    if fields.len() > 5 {
                        if !valid_mac(fields[5]) {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid macvlan address {}", fields[5]),
                            ));
                        }
                        mvlan.hw = Some(fields[5].to_string());
                    }
                    spec.macvlan.push(mvlan);
                }
                "ipvlan" => {
                    if fields.len() < 3 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid ipvlan in: {}", line),
                        ));
                    }
                    let mut ipvlan = IpVlanSpec {
                        master: fields[1].to_string(),
                        name: fields[2].to_string(),
                        mode: "l2".to_string(),
                        mtu: None,
                    };
                    if fields.len() > 3 {
                        if !valid_ipvlan_mode(fields[3]) {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid ipvlan mode {}", fields[3]),
                            ));
                        }
                        ipvlan.mode = fields[3].to_string();
                    }
                    if fields.len() > 4 {
                        ipvlan.mtu = Some(fields[4].parse().map_err(|_| {
                            Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid ipvlan mtu {}", fields[4]),
                            )
                        })?);
                    }
                    spec.ipvlan.push(ipvlan);
                }
                "veth" => {
                    if fields.len() < 3 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid veth in: {}", line),
                        ));
                    }
                    let mut veth = VethSpec {
                        name: fields[1].to_string(),
                        bridge: match fields[2] {
                            "" | "-" => None,
                            bridge => Some(bridge.to_string()),
                        },
                        mtu: None,
                        hw: None,
                        peer: format!("{}{}-{}", VETH_PREFIX, id, veth_seq),
                    };
                    veth_seq += 1;
                    if fields.len() > 3 {
                        veth.mtu = Some(fields[3].parse().map_err(|_| {
                            Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid veth mtu {}", fields[3]),
                            )
                        })?);
                    }
                    if fields.len() > 4 {
                        if !valid_mac(fields[4]) {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                format!("invalid veth address {}", fields[4]),
                            ));
                        }
                        veth.hw = Some(fields[4].to_string());
                    }
                    spec.veth.push(veth);
                }
                "L3" => {
                    spec.l3.push(L3Spec {
                        name: fields.get(1).unwrap_or(&"eth0").to_string(),
                        master: fields.get(2).map(|s| s.to_string()),
                        mtu: None,
                        nat: false,
                        addrs: Vec::new(),
                    });
                }
                "NAT" => {
                    spec.l3.push(L3Spec {
                        name: fields.get(1).unwrap_or(&"eth0").to_string(),
                        master: None,
                        mtu: None,
                        nat: true,
                        addrs: Vec::new(),
                    });
                }
                "MTU" => {
                    if fields.len() != 3 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid MTU in: {}", line),
                        ));
                    }
                    let mtu: u32 = fields[2].parse().map_err(|_| {
                        Error::new(ErrorKind::InvalidValue, format!("invalid MTU in: {}", line))
                    })?;
                    spec.set_mtu(fields[1], mtu)?;
                }
                "autoconf" => {
                    if fields.len() != 2 {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            format!("invalid autoconf in: {}", line),
                        ));
                    }
                    spec.autoconf.push(fields[1].to_string());
                }
                _ => {
                    return Err(Error::new(
                        ErrorKind::InvalidValue,
                        format!("unknown network type: {}", kind),
                    ));
                }
            }
        }

        spec.validate()?;
        Ok(spec)
    }

    /// MTU overrides name a previously declared link
    fn set_mtu(&mut self, name: &str, mtu: u32) -> Result<()> {
        for link in &mut self.l3 {
            if link.name == name {
                link.mtu = Some(mtu);
                return Ok(());
            }
        }
        for link in &mut self.veth {
            if link.name == name {
                link.mtu = Some(mtu);
                return Ok(());
            }
        }
        for link in &mut self.macvlan {
            if link.name == name {
                link.mtu = Some(mtu);
                return Ok(());
            }
        }
        for link in &mut self.ipvlan {
            if link.name == name {
                link.mtu = Some(mtu);
                return Ok(());
            }
        }
        Err(Error::new(
            ErrorKind::InvalidValue,
            format!("link not found: {}", name),
        ))
    }

    fn validate(&self) -> Result<()> {
        let single = self.none as usize
            + self.inherited as usize
            + self.ct_name.is_some() as usize
            + self.netns_name.is_some() as usize;
        let mixed = self.steal.len()
            + self.macvlan.len()
            + self.ipvlan.len()
            + self.veth.len()
            + self.l3.len();

        if single > 1 || (single == 1 && mixed > 0) {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                "none/host/inherited/container/netns can't be mixed with other types",
            ));
        }
        Ok(())
    }
}

/// Realisation context: the parsed spec plus everything needed to build
/// the namespace and hand it to the launcher
#[derive(Default)]
pub struct NetEnv {
    pub id: u32,
    /// Id of the parent container; 0 puts the class under the porto root
    pub parent_id: u16,
    pub hostname: Option<String>,
    pub spec: NetSpec,
    pub ip: Vec<IpSpec>,
    pub gw: Vec<GwSpec>,
    /// Bring every device up even without addresses
    pub net_up: bool,
    /// The ip list changed during realisation and must be persisted
    pub save_ip: bool,

    /// Per-device class priority, guarantee and limit of this container
    pub net_prio: PatternMap<u64>,
    pub net_guarantee: PatternMap<u64>,
    pub net_limit: PatternMap<u64>,

    pub netns: Option<NamespaceHandle>,
    pub net: Option<Arc<Network>>,
    pub parent_net: Option<Arc<Network>>,
}

impl NetEnv {
    /// Parse `iface addr` lines; addresses of L3 links must be host ones
    pub fn parse_ip(&mut self, lines: &[String]) -> Result<()> {
        self.ip.clear();
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid ip address/prefix in: {}", line),
                ));
            }
            let ip = IpSpec {
                iface: fields[0].to_string(),
                addr: NetAddr::parse(fields[1])?,
            };
            for l3 in &mut self.spec.l3 {
                if l3.name == ip.iface {
                    if !ip.addr.is_host() {
                        return Err(Error::new(
                            ErrorKind::InvalidValue,
                            "invalid ip prefix for L3 network",
                        ));
                    }
                    l3.addrs.push(ip.addr);
                }
            }
            self.ip.push(ip);
        }
        Ok(())
    }

    /// Render the current address assignments back to `iface addr` lines
    pub fn format_ip(&self) -> Vec<String> {
        self.ip
            .iter()
            .map(|ip| format!("{} {}/{}", ip.iface, ip.addr.ip(), ip.addr.prefix()))
            .collect()
    }

    /// Parse `iface gateway` lines
    pub fn parse_gw(&mut self, lines: &[String]) -> Result<()> {
        self.gw.clear();
        for line in lines {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() != 2 {
                return Err(Error::new(
                    ErrorKind::InvalidValue,
                    format!("invalid gateway address in: {}", line),
                ));
            }
            self.gw.push(GwSpec {
                iface: fields[0].to_string(),
                addr: NetAddr::parse(fields[1])?,
            });
        }
        Ok(())
    }

    /// Stable MAC for generated interfaces: `02:` plus bytes mixed from
    /// the interface and host names.
    pub fn generate_hw(&self, name: &str) -> Option<String> {
        let hostname = self.hostname.as_deref()?;
        let n = crc32(name.as_bytes());
        let h = crc32(hostname.as_bytes());
        Some(format!(
            "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            n & 0xFF,
            (h >> 24) & 0xFF,
            (h >> 16) & 0xFF,
            (h >> 8) & 0xFF,
            h & 0xFF,
        ))
    }

    fn parent(&self) -> Result<&Arc<Network>> {
        self.parent_net
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "parent network not prepared"))
    }

    fn target(&self) -> Result<&Arc<Network>> {
        self.net
            .as_ref()
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "network not prepared"))
    }

    fn netns_fd(&self) -> Result<std::os::unix::io::RawFd> {
        self.netns
            .as_ref()
            .map(|ns| ns.raw_fd())
            .ok_or_else(|| Error::new(ErrorKind::InvalidState, "netns not prepared"))
    }

    /// Register this container's HTB class on every managed device of its
    /// network, under the parent container's class (the porto root for
    /// top-level containers). Overrides come from the container's
    /// priority/guarantee/limit pattern maps.
    pub fn register_traffic_classes(&self) -> Result<()> {
        if self.id < CONTAINER_ID_MIN as u32 || self.id > u16::MAX as u32 {
            return Err(Error::new(
                ErrorKind::InvalidValue,
                format!("invalid container id {}", self.id),
            ));
        }
        let parent = if self.parent_id >= CONTAINER_ID_MIN {
            container_class(self.parent_id)
        } else {
            PORTO_ROOT_CLASS
        };
        self.target()?.create_class(
            container_class(self.id as u16),
            parent,
            &self.net_prio,
            &self.net_guarantee,
            &self.net_limit,
        )
    }

    /// Drop the container's class subtree at teardown; ids outside the
    /// container range have no class to remove
    pub fn remove_traffic_classes(&self) -> Result<()> {
        if self.id < CONTAINER_ID_MIN as u32 || self.id > u16::MAX as u32 {
            return Ok(());
        }
        self.target()?.destroy_class(container_class(self.id as u16))
    }

    fn configure_veth(&mut self, veth: &VethSpec) -> Result<()> {
        let parent = self.parent()?.clone();
        let netns_fd = self.netns_fd()?;

        let hw = veth
            .hw
            .clone()
            .or_else(|| self.generate_hw(&format!("{}{}", veth.name, veth.peer)));
        let hw = hw.as_deref().and_then(parse_mac);

        parent.with_netlink(|nl| {
            nl.add_veth(&veth.name, &veth.peer, hw, veth.mtu, Some(netns_fd))?;

            if let Some(bridge) = &veth.bridge {
                let bridge_link = nl.link_by_name(bridge)?;
                let peer_link = nl.link_by_name(&veth.peer)?;
                nl.enslave(peer_link.index, bridge_link.index)?;
                nl.up(peer_link.index)?;
            }
            Ok(())
        })
    }

    fn configure_l3(&mut self, mut l3: L3Spec) -> Result<L3Spec> {
        let parent = self.parent()?.clone();
        let target = self.target()?.clone();
        let netns_fd = self.netns_fd()?;

        if l3.nat && l3.addrs.is_empty() {
            l3.addrs = parent.get_nat_address()?;
            for addr in &l3.addrs {
                self.ip.push(IpSpec {
                    iface: l3.name.clone(),
                    addr: *addr,
                });
            }
            self.save_ip = true;
        }

        let (gate4, gate6, mtu) = parent.gate_address(&l3.addrs)?;
        if l3.mtu.is_none() {
            l3.mtu = mtu;
        }

        for addr in &l3.addrs {
            match addr.family() {
                Family::V4 if gate4.is_none() => {
                    return Err(Error::new(ErrorKind::InvalidValue, "ipv4 gateway not found"));
                }
                Family::V6 if gate6.is_none() => {
                    return Err(Error::new(ErrorKind::InvalidValue, "ipv6 gateway not found"));
                }
                _ => {}
            }
        }

        let peer_name = parent.new_device_name(L3_PREFIX)?;
        let peer_index = parent.with_netlink(|nl| {
            nl.add_veth(&l3.name, &peer_name, None, l3.mtu, Some(netns_fd))?;
            Ok(nl.link_by_name(&peer_name)?.index)
        })?;

        target.with_netlink(|nl| {
            let link = nl.link_by_name(&l3.name)?;
            nl.up(link.index)?;

            for gate in [&gate4, &gate6].into_iter().flatten() {
                nl.add_direct_route(link.index, gate)?;
                nl.set_default_gw(link.index, gate)?;
            }
            Ok(())
        })?;

        for gate in [&gate4, &gate6].into_iter().flatten() {
            parent.with_netlink(|nl| nl.proxy_neighbour(peer_index, gate, true))?;
        }

        for addr in &l3.addrs {
            parent.with_netlink(|nl| nl.add_direct_route(peer_index, addr))?;
            let master = l3.master.as_ref().map(|m| parent.match_device(m));
            parent.add_announce(addr, master.as_deref())?;
        }

        Ok(l3)
    }

    /// Realise the virtual interfaces in order: steal, ipvlan, macvlan,
    /// veth, L3/NAT; then loopback, a device refresh, and address and
    /// gateway assignment inside the namespace.
    pub fn configure_interfaces(&mut self) -> Result<()> {
        let parent = self.parent()?.clone();
        let target = self.target()?.clone();
        let netns_fd = self.netns_fd()?;
        let tid = get_tid();
        let mut links: Vec<String> = Vec::new();

        for dev in &self.spec.steal.clone() {
            parent.with_netlink(|nl| {
                let link = nl.link_by_name(dev)?;
                nl.change_ns(link.index, dev, netns_fd)
            })?;
            links.push(dev.clone());
        }

        for ipvlan in &self.spec.ipvlan.clone() {
            let master = parent.match_device(&ipvlan.master);
            let transient = format!("piv{}", tid);
            parent.with_netlink(|nl| {
                let master_link = nl.link_by_name(&master)?;
                nl.add_ipvlan(&transient, master_link.index, ipvlan_mode(&ipvlan.mode), ipvlan.mtu)?;
                let link = nl.link_by_name(&transient)?;
                if let Err(e) = nl.change_ns(link.index, &ipvlan.name, netns_fd) {
                    let _ = nl.remove(link.index);
                    return Err(e);
                }
                Ok(())
            })?;
            links.push(ipvlan.name.clone());
        }

        for mvlan in &self.spec.macvlan.clone() {
            let master = parent.match_device(&mvlan.master);
            let hw = mvlan
                .hw
                .clone()
                .or_else(|| self.generate_hw(&format!("{}{}", master, mvlan.name)));
            let hw = hw.as_deref().and_then(parse_mac);

            let transient = format!("pmv{}", tid);
            parent.with_netlink(|nl| {
                let master_link = nl.link_by_name(&master)?;
                nl.add_macvlan(&transient, master_link.index, macvlan_mode(&mvlan.kind), hw, mvlan.mtu)?;
                let link = nl.link_by_name(&transient)?;
                if let Err(e) = nl.change_ns(link.index, &mvlan.name, netns_fd) {
                    let _ = nl.remove(link.index);
                    return Err(e);
                }
                Ok(())
            })?;
            links.push(mvlan.name.clone());
        }

        for veth in &self.spec.veth.clone() {
            self.configure_veth(veth)?;
            links.push(veth.name.clone());
        }

        let l3specs: Vec<L3Spec> = self.spec.l3.drain(..).collect();
        for l3 in l3specs {
            let configured = self.configure_l3(l3)?;
            links.push(configured.name.clone());
            self.spec.l3.push(configured);
        }

        target.with_netlink(|nl| {
            let lo = nl.link_by_name("lo")?;
            nl.up(lo.index)
        })?;

        target.refresh_devices()?;
        target.clear_new_managed();

        for name in &links {
            if target.device_index(name).is_none() {
                return Err(Error::new(
                    ErrorKind::Unknown,
                    format!("network device {} not found", name),
                ));
            }
        }

        for name in target.device_names() {
            if !self.net_up {
                let wanted = self.ip.iter().any(|ip| ip.iface == name)
                    || self.gw.iter().any(|gw| gw.iface == name)
                    || self.spec.autoconf.iter().any(|ac| *ac == name);
                if !wanted {
                    continue;
                }
            }

            target.with_netlink(|nl| {
                let link = nl.link_by_name(&name)?;
                nl.up(link.index)?;

                for ip in self.ip.iter().filter(|ip| ip.iface == name) {
                    nl.set_ip(link.index, &ip.addr)?;
                }
                for gw in self.gw.iter().filter(|gw| gw.iface == name) {
                    nl.set_default_gw(link.index, &gw.addr)?;
                }
                Ok(())
            })?;
        }

        Ok(())
    }

    /// Build or find the target namespace for the parsed spec, then
    /// register the container's traffic classes on it.
    ///
    /// `inherited` and `container` sources need the holder to resolve the
    /// donor first and call [`NetEnv::adopt`] instead; everything else is
    /// handled here.
    pub fn prepare(&mut self, registry: &NetRegistry, cfg: &Arc<NetworkConfig>) -> Result<()> {
        if self.spec.new_netns {
            let (net, netns) = Network::connect_new(cfg.clone())?;
            let net = Arc::new(net);
            self.net = Some(net.clone());
            self.netns = Some(netns);
            self.parent_net = registry.host();

            let configured = self
                .configure_interfaces()
                .and_then(|_| self.register_traffic_classes());
            if let Err(e) = configured {
                if let Err(cleanup) = self.destroy_network() {
                    warn!("network cleanup failed: {}", cleanup);
                }
                return Err(e);
            }

            if let Some(ns) = &self.netns {
                registry.add(ns.inode()?, &net);
            }
            return Ok(());
        }

        if let Some(name) = &self.spec.netns_name {
            let netns = NamespaceHandle::open_path(&Path::new("/var/run/netns").join(name))?;
            let inode = netns.inode()?;

            let net = match registry.get(inode) {
                Some(net) => net,
                None => {
                    let net = Arc::new(Network::connect_netns(cfg.clone(), &netns)?);
                    net.refresh_devices()?;
                    net.clear_new_managed();
                    registry.add(inode, &net);
                    net
                }
            };
            self.net = Some(net);
            self.netns = Some(netns);
            self.parent_net = registry.host();
            return self.register_traffic_classes();
        }

        Err(Error::new(
            ErrorKind::InvalidState,
            "inherited/container network requires a resolved donor namespace",
        ))
    }

    /// Adopt a donor namespace (inherited or borrowed from a container);
    /// the holder calls [`NetEnv::register_traffic_classes`] once the
    /// donor is wired up.
    pub fn adopt(&mut self, netns: NamespaceHandle, net: Arc<Network>) {
        self.netns = Some(netns);
        self.net = Some(net);
    }

    /// Tear down the container's classes and parent-side state:
    /// announced routes and NAT addresses
    pub fn destroy_network(&mut self) -> Result<()> {
        let mut result = None;

        if self.net.is_some() {
            if let Err(e) = self.remove_traffic_classes() {
                error!("cannot remove traffic classes: {}", e);
                result.get_or_insert(e);
            }
        }

        let parent = match &self.parent_net {
            Some(parent) => parent.clone(),
            None => {
                return match result {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        };

        for l3 in &self.spec.l3 {
            for addr in &l3.addrs {
                if let Err(e) = parent.del_announce(addr) {
                    error!("cannot remove announce {}: {}", addr, e);
                    result.get_or_insert(e);
                }
            }
            if l3.nat {
                if let Err(e) = parent.put_nat_address(&l3.addrs) {
                    error!("cannot put NAT address: {}", e);
                    result.get_or_insert(e);
                }
                self.ip.retain(|ip| ip.iface != l3.name);
                self.save_ip = true;
            }
        }

        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lines(spec: &[&str]) -> Vec<String> {
        spec.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parse_macvlan_full() {
        let spec = NetSpec::parse(
            1,
            &lines(&["macvlan eth0 mv0 bridge 1400 02:aa:bb:cc:dd:ee"]),
        )
        .unwrap();
        assert_eq!(
            spec.macvlan,
            vec![MacVlanSpec {
                master: "eth0".into(),
                name: "mv0".into(),
                kind: "bridge".into(),
                mtu: Some(1400),
                hw: Some("02:aa:bb:cc:dd:ee".into()),
            }]
        );
    }

    #[test]
    fn parse_macvlan_defaults() {
        let spec = NetSpec::parse(1, &lines(&["macvlan eth* mv0"])).unwrap();
        assert_eq!(spec.macvlan[0].kind, "bridge");
        assert_eq!(spec.macvlan[0].mtu, None);
    }

    #[test]
    fn parse_macvlan_invalid_type() {
        let err = NetSpec::parse(1, &lines(&["macvlan eth0 mv0 foo"])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
        assert!(err.text.contains("macvlan type"));
    }

    #[test]
    fn parse_ipvlan_modes() {
        let spec = NetSpec::parse(1, &lines(&["ipvlan eth0 iv0 l3 1450"])).unwrap();
        assert_eq!(spec.ipvlan[0].mode, "l3");
        assert_eq!(spec.ipvlan[0].mtu, Some(1450));

        assert!(NetSpec::parse(1, &lines(&["ipvlan eth0 iv0 l4"])).is_err());
    }

    #[test]
    fn parse_veth_peer_names_are_deterministic() {
        let spec = NetSpec::parse(7, &lines(&["veth eth0 br0", "veth eth1 br0"])).unwrap();
        assert_eq!(spec.veth[0].peer, "portove-7-0");
        assert_eq!(spec.veth[1].peer, "portove-7-1");
    }

    #[test]
    fn parse_veth_rejects_bad_mac() {
        let err = NetSpec::parse(1, &lines(&["veth eth0 br0 1500 xx:yy"])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
    }

    #[test]
    fn parse_l3_and_nat_defaults() {
        let spec = NetSpec::parse(1, &lines(&["L3", "NAT natdev"])).unwrap();
        assert_eq!(spec.l3[0].name, "eth0");
        assert!(!spec.l3[0].nat);
        assert_eq!(spec.l3[1].name, "natdev");
        assert!(spec.l3[1].nat);
    }

    #[test]
    fn parse_mtu_override_applies_to_declared_link() {
        let spec = NetSpec::parse(1, &lines(&["veth eth0 br0", "MTU eth0 1400"])).unwrap();
        assert_eq!(spec.veth[0].mtu, Some(1400));

        let err = NetSpec::parse(1, &lines(&["veth eth0 br0", "MTU wrong 1400"])).unwrap_err();
        assert!(err.text.contains("link not found"));
    }

    #[test]
    fn parse_steal_and_legacy_host() {
        let spec = NetSpec::parse(1, &lines(&["steal eth0", "host eth1"])).unwrap();
        assert_eq!(spec.steal, vec!["eth0".to_string(), "eth1".to_string()]);
        assert!(spec.new_netns);
    }

    #[test]
    fn parse_bare_host_means_inherited() {
        let spec = NetSpec::parse(1, &lines(&["host"])).unwrap();
        assert!(spec.inherited);
        assert!(!spec.new_netns);
    }

    #[test]
    fn parse_none_conflicts_with_interfaces() {
        let err = NetSpec::parse(1, &lines(&["none", "veth eth0 br0"])).unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidValue);
        assert!(err.text.contains("can't be mixed"));
    }

    #[test]
    fn parse_inherited_conflicts_with_none() {
        assert!(NetSpec::parse(1, &lines(&["none", "inherited"])).is_err());
    }

    #[test]
    fn parse_container_excludes_interfaces() {
        assert!(NetSpec::parse(1, &lines(&["container other", "steal eth0"])).is_err());
        let spec = NetSpec::parse(1, &lines(&["container other"])).unwrap();
        assert_eq!(spec.ct_name.as_deref(), Some("other"));
        assert!(!spec.new_netns);
    }

    #[test]
    fn parse_empty_spec_is_an_error() {
        assert!(NetSpec::parse(1, &[]).is_err());
        assert!(NetSpec::parse(1, &lines(&["bogus eth0"])).is_err());
    }

    #[test]
    fn parse_autoconf() {
        let spec = NetSpec::parse(1, &lines(&["steal eth0", "autoconf eth0"])).unwrap();
        assert_eq!(spec.autoconf, vec!["eth0".to_string()]);
        assert!(NetSpec::parse(1, &lines(&["autoconf"])).is_err());
    }

    #[test]
    fn mac_validation() {
        assert!(valid_mac("02:aa:bb:cc:dd:ee"));
        assert!(!valid_mac("02:aa:bb:cc:dd"));
        assert!(!valid_mac("02:aa:bb:cc:dd:zz"));
        assert!(!valid_mac("02-aa-bb-cc-dd-ee"));
        assert_eq!(
            parse_mac("02:aa:bb:cc:dd:ee"),
            Some([0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE])
        );
    }

    #[test]
    fn generated_mac_mixes_name_and_hostname() {
        let env = NetEnv {
            hostname: Some("host".to_string()),
            ..Default::default()
        };
        let n = crc32(b"mv0portove-1-0");
        let h = crc32(b"host");
        let expected = format!(
            "02:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            n & 0xFF,
            (h >> 24) & 0xFF,
            (h >> 16) & 0xFF,
            (h >> 8) & 0xFF,
            h & 0xFF
        );
        assert_eq!(env.generate_hw("mv0portove-1-0"), Some(expected));
        assert_eq!(env.generate_hw("mv0portove-1-0").unwrap(), "02:35:cf:27:13:fd");
    }

    #[test]
    fn generated_mac_requires_hostname() {
        let env = NetEnv::default();
        assert_eq!(env.generate_hw("eth0"), None);
    }

    #[test]
    fn ip_lines_feed_l3_addresses() {
        let mut env = NetEnv {
            spec: NetSpec::parse(1, &lines(&["L3 eth0"])).unwrap(),
            ..Default::default()
        };
        env.parse_ip(&lines(&["eth0 10.1.2.3", "other 10.0.0.1/24"]))
            .unwrap();
        assert_eq!(env.spec.l3[0].addrs.len(), 1);
        assert_eq!(env.ip.len(), 2);

        // L3 links take host addresses only
        let err = env.parse_ip(&lines(&["eth0 10.1.2.0/24"])).unwrap_err();
        assert!(err.text.contains("L3"));
    }

    #[test]
    fn gw_lines_parse() {
        let mut env = NetEnv::default();
        env.parse_gw(&lines(&["eth0 192.168.1.1"])).unwrap();
        assert_eq!(env.gw[0].iface, "eth0");
        assert!(env.parse_gw(&lines(&["eth0"])).is_err());
    }

    #[test]
    fn format_ip_roundtrips() {
        let mut env = NetEnv::default();
        env.parse_ip(&lines(&["eth0 10.0.0.5"])).unwrap();
        assert_eq!(env.format_ip(), vec!["eth0 10.0.0.5/32".to_string()]);
    }

    #[test]
    fn traffic_classes_reject_ids_colliding_with_the_skeleton() {
        // ids below the container range would overwrite the fixed classes
        for id in [0u32, 1, 2, 3] {
            let env = NetEnv {
                id,
                ..Default::default()
            };
            let err = env.register_traffic_classes().unwrap_err();
            assert_eq!(err.kind, ErrorKind::InvalidValue);
        }
    }

    #[test]
    fn traffic_classes_need_a_prepared_network() {
        let env = NetEnv {
            id: 4,
            ..Default::default()
        };
        let err = env.register_traffic_classes().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
        let err = env.remove_traffic_classes().unwrap_err();
        assert_eq!(err.kind, ErrorKind::InvalidState);
    }

    #[test]
    fn removing_classes_for_out_of_range_ids_is_a_no_op() {
        let env = NetEnv::default();
        env.remove_traffic_classes().unwrap();
    }
}
