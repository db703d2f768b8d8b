//! Network layer: device discovery, HTB bandwidth isolation and virtual
//! interface provisioning per container network namespace
//!
//! One [`Network`] exists per netns inode. It owns the netlink socket, the
//! reconciled device list and the NAT pool, all behind one mutex; shared
//! holders keep an `Arc<Network>` and the process-wide [`NetRegistry`]
//! keeps weak references only.

pub mod addr;
pub mod bitmap;
pub mod device;
pub mod netlink;
pub mod spec;
pub mod tc;

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error, info, warn};

use crate::config::{NetworkConfig, PatternMap};
use crate::errors::{Error, ErrorKind, Result};
use crate::isolation::namespace::{NamespaceHandle, NetnsGuard, NsKind};
use crate::utils::{get_tid, set_sysctl, string_match};

use addr::{Family, NetAddr};
use bitmap::BitmapAllocator;
use device::NetworkDevice;
use netlink::{AddrInfo, LinkInfo, Netlink, RT_SCOPE_HOST};
use tc::{HtbClassParams, TcHandle, DEFAULT_CLASS, LEAF_QDISC, PORTO_ROOT_CLASS, ROOT_CLASS, ROOT_QDISC};

/// Interface-name prefixes reserved for internally generated veth ends;
/// `refresh_devices` never tracks them.
pub const VETH_PREFIX: &str = "portove-";
pub const L3_PREFIX: &str = "L3-";

/// Rate-to-quantum divisor of the root HTB qdisc
const HTB_RATE2QUANTUM: u32 = 10;
/// Class priority when the config has no override
const NET_DEFAULT_PRIO: u64 = 3;

/// Statistics selector for [`Network::device_stat`] and
/// [`Network::class_stat`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetStat {
    RxBytes,
    RxPackets,
    RxDrops,
    TxBytes,
    TxPackets,
    TxDrops,
    Bytes,
    Packets,
    Drops,
    Overlimits,
}

/// NAT address pool: `base + slot` per configured family
#[derive(Debug, Default)]
pub struct NatPool {
    base_v4: Option<NetAddr>,
    base_v6: Option<NetAddr>,
    bitmap: BitmapAllocator,
}

impl NatPool {
    pub fn configure(&mut self, base_v4: Option<NetAddr>, base_v6: Option<NetAddr>, count: usize) {
        self.base_v4 = base_v4;
        self.base_v6 = base_v6;
        self.bitmap.resize(count);
    }

    /// Allocate the next slot and materialize its addresses
    pub fn get(&mut self) -> Result<Vec<NetAddr>> {
        let slot = self
            .bitmap
            .get()
            .map_err(|e| Error::new(e.kind, format!("cannot allocate NAT address: {}", e.text)))?;
        let mut addrs = Vec::new();
        if let Some(base) = &self.base_v4 {
            addrs.push(base.add_offset(slot as u64));
        }
        if let Some(base) = &self.base_v6 {
            addrs.push(base.add_offset(slot as u64));
        }
        Ok(addrs)
    }

    /// Return a slot computed from the first address matching a base family
    pub fn put(&mut self, addrs: &[NetAddr]) -> Result<()> {
        for addr in addrs {
            let base = match addr.family() {
                Family::V4 => &self.base_v4,
                Family::V6 => &self.base_v6,
            };
            if let Some(base) = base {
                return self.bitmap.put(addr.offset_from(base) as usize);
            }
        }
        Ok(())
    }
}

struct NetState {
    nl: Netlink,
    devices: Vec<NetworkDevice>,
    nat: NatPool,
    /// Set once new managed devices got their queue set up, so the holder
    /// re-applies container classes
    new_managed_devices: bool,
    iface_seq: u32,
}

/// A network namespace with its device list and HTB trees
pub struct Network {
    cfg: Arc<NetworkConfig>,
    /// Container-owned namespace: every device is managed and the default
    /// class keeps the kernel default leaf qdisc
    managed_namespace: bool,
    state: Mutex<NetState>,
}

impl Network {
    fn with_client(cfg: Arc<NetworkConfig>, nl: Netlink, managed_namespace: bool) -> Self {
        Self {
            cfg,
            managed_namespace,
            state: Mutex::new(NetState {
                nl,
                devices: Vec::new(),
                nat: NatPool::default(),
                new_managed_devices: false,
                iface_seq: 0,
            }),
        }
    }

    /// Connect in the current network namespace
    pub fn connect(cfg: Arc<NetworkConfig>, managed_namespace: bool) -> Result<Self> {
        Ok(Self::with_client(cfg, Netlink::connect()?, managed_namespace))
    }

    /// Connect inside `netns`, restoring the original namespace afterwards
    pub fn connect_netns(cfg: Arc<NetworkConfig>, netns: &NamespaceHandle) -> Result<Self> {
        let _guard = NetnsGuard::enter(netns)?;
        Self::connect(cfg, true)
    }

    /// Create a fresh network namespace, connect inside it and hand its
    /// descriptor back. Duplicate address detection is disabled up front so
    /// statically assigned addresses are usable immediately.
    pub fn connect_new(cfg: Arc<NetworkConfig>) -> Result<(Self, NamespaceHandle)> {
        let (_guard, netns) = NetnsGuard::enter_new()?;
        let net = Self::connect(cfg, true)?;
        set_sysctl("net.ipv6.conf.all.accept_dad", "0")?;
        set_sysctl("net.ipv6.conf.default.accept_dad", "0")?;
        Ok((net, netns))
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_managed_namespace(&self) -> bool {
        self.managed_namespace
    }

    /// Install the NAT pool (host network only)
    pub fn setup_nat(&self) -> Result<()> {
        let base_v4 = match &self.cfg.nat_first_ipv4 {
            Some(s) => Some(NetAddr::parse(s)?),
            None => None,
        };
        let base_v6 = match &self.cfg.nat_first_ipv6 {
            Some(s) => Some(NetAddr::parse(s)?),
            None => None,
        };
        self.lock()
            .nat
            .configure(base_v4, base_v6, self.cfg.nat_count as usize);
        Ok(())
    }

    pub fn get_nat_address(&self) -> Result<Vec<NetAddr>> {
        self.lock().nat.get()
    }

    pub fn put_nat_address(&self, addrs: &[NetAddr]) -> Result<()> {
        self.lock().nat.put(addrs)
    }

    /// Reload the link cache and reconcile it with the known device list.
    /// Newly seen managed devices get their HTB skeleton installed; the
    /// first per-device failure is reported after the whole sweep.
    pub fn refresh_devices(&self) -> Result<()> {
        let mut state = self.lock();
        self.refresh_devices_locked(&mut state)
    }

    fn refresh_devices_locked(&self, state: &mut NetState) -> Result<()> {
        let links = state.nl.dump_links()?;

        for dev in &mut state.devices {
            dev.missing = true;
        }

        for link in &links {
            if skip_link(link, self.managed_namespace) {
                continue;
            }

            let mut dev = NetworkDevice::new(link, &self.cfg);
            if self.managed_namespace {
                dev.managed = true;
            }

            let mut found = false;
            for known in &mut state.devices {
                if known.name != dev.name || known.index != dev.index {
                    continue;
                }
                *known = dev.clone();
                if known.managed && link.qdisc != "htb" {
                    info!("missing qdisc on {}, rebuilding", known.desc());
                } else {
                    known.prepared = true;
                }
                found = true;
                break;
            }
            if !found {
                if !dev.managed {
                    info!("unmanaged device {}", dev.desc());
                } else {
                    debug!("new network device {}", dev.desc());
                }
                state.devices.push(dev);
            }
        }

        state.devices.retain(|dev| {
            if dev.missing {
                info!("delete network device {}", dev.desc());
            }
            !dev.missing
        });

        let mut first_error = None;
        let pending: Vec<usize> = state
            .devices
            .iter()
            .enumerate()
            .filter(|(_, d)| d.managed && !d.prepared)
            .map(|(i, _)| i)
            .collect();
        for i in pending {
            let dev = state.devices[i].clone();
            match self.setup_queue(&mut state.nl, &dev) {
                Ok(()) => {
                    state.devices[i].prepared = true;
                    state.new_managed_devices = true;
                }
                Err(e) => {
                    error!("cannot setup queue for {}: {}", dev.desc(), e);
                    first_error.get_or_insert(e);
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Refresh devices and report whether managed devices were (re)prepared
    /// since the last call, in which case the holder must re-apply the
    /// container classes.
    pub fn refresh_classes(&self, force: bool) -> Result<bool> {
        let mut state = self.lock();
        self.refresh_devices_locked(&mut state)?;
        let dirty = std::mem::take(&mut state.new_managed_devices);
        Ok(force || dirty)
    }

    /// Forget the dirty flag, e.g. right after initial setup
    pub fn clear_new_managed(&self) {
        self.lock().new_managed_devices = false;
    }

    /// Install the fixed HTB skeleton on one device
    fn setup_queue(&self, nl: &mut Netlink, dev: &NetworkDevice) -> Result<()> {
        info!("setup queue for network device {}", dev.desc());

        let cfg = &self.cfg;

        if !nl.qdisc_check(dev.index, ROOT_QDISC, tc::TC_H_ROOT, "htb")? {
            if let Err(e) = nl.qdisc_del(dev.index, ROOT_QDISC, tc::TC_H_ROOT) {
                if !e.is_not_found() {
                    debug!("cannot remove stale root qdisc on {}: {}", dev.desc(), e);
                }
            }
            nl.htb_qdisc_add(dev.index, ROOT_QDISC, DEFAULT_CLASS.minor(), HTB_RATE2QUANTUM)?;
        }

        nl.cgroup_filter_add(dev.index, ROOT_QDISC)?;

        // unconfigured rates stay 0: "no guarantee", mapped to 1 bps by
        // the clamp; the ceil stays the device rate (0 = device maximum)
        let prio = NET_DEFAULT_PRIO;
        let rate = dev.get_uint(&cfg.device_rate, 0);
        let ceil = rate;
        self.add_class(nl, dev, ROOT_CLASS, ROOT_QDISC, prio, rate, ceil)?;

        let rate = dev.get_uint(&cfg.default_rate, 0);
        self.add_class(nl, dev, DEFAULT_CLASS, ROOT_CLASS, prio, rate, ceil)?;

        if !self.managed_namespace {
            let kind = dev.get_string(&cfg.default_qdisc, "pfifo_fast");
            let limit = dev.get_uint(&cfg.default_qdisc_limit, 0);
            let quantum = dev.get_uint(&cfg.default_qdisc_quantum, dev.mtu as u64 * 2);
            if !nl.qdisc_check(dev.index, LEAF_QDISC, DEFAULT_CLASS, &kind)? {
                nl.leaf_qdisc_add(dev.index, LEAF_QDISC, DEFAULT_CLASS, &kind, limit, quantum)?;
            }
        }

        let rate = dev.get_uint(&cfg.porto_rate, 0);
        self.add_class(nl, dev, PORTO_ROOT_CLASS, ROOT_CLASS, prio, rate, ceil)?;

        Ok(())
    }

    /// Create one HTB class with fully derived parameters
    fn add_class(
        &self,
        nl: &mut Netlink,
        dev: &NetworkDevice,
        handle: TcHandle,
        parent: TcHandle,
        prio: u64,
        rate: u64,
        ceil: u64,
    ) -> Result<()> {
        let device_rate = dev.get_uint(&self.cfg.device_rate, i32::MAX as u64);
        let (rate, ceil) = tc::clamp_rates(rate, ceil, device_rate);

        let params = HtbClassParams {
            prio: prio as u32,
            rate,
            ceil,
            quantum: dev.get_uint(&self.cfg.device_quantum, dev.mtu as u64 * 2) as u32,
            rbuffer: dev.get_uint(&self.cfg.htb_rbuffer, dev.mtu as u64 * 10) as u32,
            cbuffer: dev.get_uint(&self.cfg.htb_cbuffer, dev.mtu as u64 * 10) as u32,
        };
        nl.class_add(dev.index, handle, parent, &params)
    }

    /// Create a class on every managed device. Per-device overrides come
    /// from the pattern maps; the first error is returned once all devices
    /// were attempted.
    pub fn create_class(
        &self,
        handle: TcHandle,
        parent: TcHandle,
        prio: &PatternMap<u64>,
        rate: &PatternMap<u64>,
        ceil: &PatternMap<u64>,
    ) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut result = None;

        for dev in state.devices.iter().filter(|d| d.managed) {
            let (prio, rate, ceil) = class_request(dev, &self.cfg, handle, prio, rate, ceil);
            if let Err(e) = self.add_class(&mut state.nl, dev, handle, parent, prio, rate, ceil) {
                warn!("cannot add tc class on {}: {}", dev.desc(), e);
                result.get_or_insert(e);
            }
        }

        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Delete a class subtree on every managed device
    pub fn destroy_class(&self, handle: TcHandle) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut result = None;

        for dev in state.devices.iter().filter(|d| d.managed) {
            if let Err(e) = state.nl.class_del_deep(dev.index, handle) {
                warn!("cannot del tc class on {}: {}", dev.desc(), e);
                result.get_or_insert(e);
            }
        }

        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Tear the HTB trees down before dropping the namespace
    pub fn destroy(&self) -> Result<()> {
        info!("removing network");
        let mut state = self.lock();
        let state = &mut *state;

        for dev in state.devices.iter().filter(|d| d.managed) {
            if let Err(e) = state.nl.qdisc_del(dev.index, ROOT_QDISC, tc::TC_H_ROOT) {
                if !e.is_not_found() {
                    error!("cannot remove htb on {}: {}", dev.desc(), e);
                }
            }
        }
        Ok(())
    }

    /// Per-device link statistics by device name
    pub fn device_stat(&self, kind: NetStat) -> Result<BTreeMap<String, u64>> {
        let mut state = self.lock();
        let state = &mut *state;
        let links = state.nl.dump_links()?;

        let mut stat = BTreeMap::new();
        for dev in &state.devices {
            match links.iter().find(|l| l.index == dev.index) {
                Some(link) => {
                    let value = match kind {
                        NetStat::RxBytes => link.stats.rx_bytes,
                        NetStat::RxPackets => link.stats.rx_packets,
                        NetStat::RxDrops => link.stats.rx_dropped,
                        NetStat::TxBytes => link.stats.tx_bytes,
                        NetStat::TxPackets => link.stats.tx_packets,
                        NetStat::TxDrops => link.stats.tx_dropped,
                        _ => {
                            return Err(Error::new(
                                ErrorKind::InvalidValue,
                                "unsupported link statistic",
                            ))
                        }
                    };
                    stat.insert(dev.name.clone(), value);
                }
                None => warn!("cannot find device {}", dev.desc()),
            }
        }
        Ok(stat)
    }

    /// Per-device class statistics for `handle` by device name
    pub fn class_stat(&self, handle: TcHandle, kind: NetStat) -> Result<BTreeMap<String, u64>> {
        match kind {
            NetStat::Bytes | NetStat::Packets | NetStat::Drops | NetStat::Overlimits => {}
            _ => return self.device_stat(kind),
        }

        let mut state = self.lock();
        let state = &mut *state;
        let mut stat = BTreeMap::new();

        for dev in state.devices.iter().filter(|d| d.managed && d.prepared) {
            let classes = state.nl.dump_classes(dev.index)?;
            match classes.iter().find(|c| c.handle == handle.0) {
                Some(class) => {
                    let value = match kind {
                        NetStat::Bytes => class.bytes,
                        NetStat::Packets => class.packets,
                        NetStat::Drops => class.drops,
                        NetStat::Overlimits => class.overlimits,
                        _ => unreachable!(),
                    };
                    stat.insert(dev.name.clone(), value);
                }
                None => warn!("cannot find tc class {} at {}", handle, dev.desc()),
            }
        }
        Ok(stat)
    }

    /// Find gateways and a path MTU for the candidate addresses
    pub fn gate_address(
        &self,
        candidates: &[NetAddr],
    ) -> Result<(Option<NetAddr>, Option<NetAddr>, Option<u32>)> {
        let mut state = self.lock();
        let state = &mut *state;
        let addrs = state.nl.dump_addrs()?;
        let links = state.nl.dump_links()?;

        let mtus: HashMap<i32, u32> = links.iter().map(|l| (l.index, l.mtu)).collect();
        Ok(select_gateways(&addrs, &mtus, candidates))
    }

    /// Add proxy-neighbour entries announcing `addr`. With a `master` the
    /// entry lands on that device, otherwise on every device that can
    /// reach the address directly.
    pub fn add_announce(&self, addr: &NetAddr, master: Option<&str>) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;

        if let Some(master) = master {
            let index = state
                .devices
                .iter()
                .find(|d| d.name == master)
                .map(|d| d.index)
                .ok_or_else(|| {
                    Error::new(
                        ErrorKind::InvalidValue,
                        format!("master link not found: {}", master),
                    )
                })?;
            return state.nl.proxy_neighbour(index, addr, true);
        }

        let local = state.nl.dump_addrs()?;
        for dev in &state.devices {
            let reachable = local
                .iter()
                .any(|a| a.ifindex == dev.index && a.addr.prefix_contains(addr));
            if reachable {
                state.nl.proxy_neighbour(dev.index, addr, true)?;
            }
        }
        Ok(())
    }

    /// Drop the proxy-neighbour entries for `addr` on every device.
    /// Deletion keeps going past failures and reports the first one.
    pub fn del_announce(&self, addr: &NetAddr) -> Result<()> {
        let mut state = self.lock();
        let state = &mut *state;
        let mut result = None;

        for dev in &state.devices {
            if let Err(e) = state.nl.proxy_neighbour(dev.index, addr, false) {
                if !e.is_not_found() {
                    result.get_or_insert(e);
                }
            }
        }
        match result {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Next free name with `prefix`; gives up after 100 occupied slots
    pub fn new_device_name(&self, prefix: &str) -> Result<String> {
        let mut state = self.lock();
        let state = &mut *state;
        for _ in 0..100 {
            let name = format!("{}{}", prefix, state.iface_seq);
            state.iface_seq = state.iface_seq.wrapping_add(1);
            if state.nl.link_by_name(&name).is_err() {
                return Ok(name);
            }
        }
        Err(Error::new(
            ErrorKind::ResourceNotAvailable,
            format!("no free device name with prefix {}", prefix),
        ))
    }

    /// Resolve a device-name pattern against the known devices
    pub fn match_device(&self, pattern: &str) -> String {
        let state = self.lock();
        for dev in &state.devices {
            if string_match(&dev.name, pattern) {
                return dev.name.clone();
            }
        }
        pattern.to_string()
    }

    pub fn device_index(&self, name: &str) -> Option<i32> {
        self.lock()
            .devices
            .iter()
            .find(|d| d.name == name)
            .map(|d| d.index)
    }

    pub fn device_names(&self) -> Vec<String> {
        self.lock().devices.iter().map(|d| d.name.clone()).collect()
    }

    /// Run `f` with the netlink client locked
    pub(crate) fn with_netlink<T>(&self, f: impl FnOnce(&mut Netlink) -> Result<T>) -> Result<T> {
        let mut state = self.lock();
        f(&mut state.nl)
    }
}

/// Requested prio/rate/ceil for one class on one device, before clamping.
/// Explicit map entries win; unconfigured rates fall back to the daemon's
/// per-kind rate map for the handle, and an unconfigured ceil to the
/// device rate (0 means the device maximum).
fn class_request(
    dev: &NetworkDevice,
    cfg: &NetworkConfig,
    handle: TcHandle,
    prio: &PatternMap<u64>,
    rate: &PatternMap<u64>,
    ceil: &PatternMap<u64>,
) -> (u64, u64, u64) {
    let def = if handle == ROOT_CLASS {
        dev.get_uint(&cfg.device_rate, 0)
    } else if handle == PORTO_ROOT_CLASS {
        dev.get_uint(&cfg.porto_rate, 0)
    } else {
        dev.get_uint(&cfg.container_rate, 0)
    };
    (
        dev.get_uint(prio, NET_DEFAULT_PRIO),
        dev.get_uint(rate, def),
        dev.get_uint(ceil, dev.get_uint(&cfg.device_rate, 0)),
    )
}

/// Links `refresh_devices` never tracks: loopback, internally generated
/// veth ends, and (in the host namespace) links that are not running.
fn skip_link(link: &LinkInfo, managed_namespace: bool) -> bool {
    if link.is_loopback() {
        return true;
    }
    if !managed_namespace && !link.is_running() {
        return true;
    }
    if link.kind == "veth" && (link.name.starts_with(VETH_PREFIX) || link.name.starts_with(L3_PREFIX))
    {
        return true;
    }
    false
}

/// Pick gateways for the candidate addresses from the local address cache:
/// prefer the most specific local address whose prefix contains the
/// candidate, fall back to any non-host address of the same family, and
/// report the smallest MTU of the links holding matching addresses.
fn select_gateways(
    locals: &[AddrInfo],
    mtus: &HashMap<i32, u32>,
    candidates: &[NetAddr],
) -> (Option<NetAddr>, Option<NetAddr>, Option<u32>) {
    let mut gate4: Option<NetAddr> = None;
    let mut gate6: Option<NetAddr> = None;
    let mut mtu: Option<u32> = None;

    for local in locals {
        if local.scope == RT_SCOPE_HOST {
            continue;
        }
        for candidate in candidates {
            if local.addr.family() != candidate.family() {
                continue;
            }

            let gate = match candidate.family() {
                Family::V4 => &mut gate4,
                Family::V6 => &mut gate6,
            };

            // any gateway of the right family as a fallback
            if gate.is_none() {
                *gate = Some(local.addr);
            }

            if local.addr.prefix_contains(candidate) {
                // keep the most specific containing prefix
                let replace = match gate {
                    Some(g) => !g.prefix_contains(candidate) || local.addr.prefix() > g.prefix(),
                    None => true,
                };
                if replace {
                    *gate = Some(local.addr);
                }

                if let Some(link_mtu) = mtus.get(&local.ifindex) {
                    mtu = Some(match mtu {
                        Some(m) => m.min(*link_mtu),
                        None => *link_mtu,
                    });
                }
            }
        }
    }

    (gate4.map(|g| g.host()), gate6.map(|g| g.host()), mtu)
}

/// Process-wide registry of live networks, keyed by netns inode.
/// Holds weak references only and prunes dead entries on every insert.
#[derive(Default)]
pub struct NetRegistry {
    networks: Mutex<HashMap<u64, Weak<Network>>>,
    host: Mutex<Option<Arc<Network>>>,
}

impl NetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, inode: u64, net: &Arc<Network>) {
        let mut networks = self
            .networks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        networks.insert(inode, Arc::downgrade(net));
        networks.retain(|_, weak| weak.strong_count() > 0);
    }

    pub fn get(&self, inode: u64) -> Option<Arc<Network>> {
        self.networks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&inode)
            .and_then(|weak| weak.upgrade())
    }

    /// The host network singleton, set once at daemon start
    pub fn set_host(&self, net: Arc<Network>) {
        *self
            .host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(net);
    }

    pub fn host(&self) -> Option<Arc<Network>> {
        self.host
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Periodic sweep: refresh every live namespace
    pub fn refresh_networks(&self) {
        let nets: Vec<Arc<Network>> = self
            .networks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter_map(|weak| weak.upgrade())
            .collect();
        for net in nets {
            if let Err(e) = net.refresh_classes(false) {
                error!("network refresh failed: {}", e);
            }
        }
    }

    /// Bootstrap the host network: connect in the daemon's namespace,
    /// discover devices, install queues and the NAT pool.
    pub fn init_host_network(&self, cfg: Arc<NetworkConfig>) -> Result<Arc<Network>> {
        let net = Arc::new(Network::connect(cfg, false)?);
        let netns = NamespaceHandle::open(get_tid(), NsKind::Net)?;

        self.add(netns.inode()?, &net);

        net.refresh_devices()?;
        net.clear_new_managed();
        net.setup_nat()?;

        self.set_host(net.clone());
        Ok(net)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    fn local(addr: &str, prefix: u8, ifindex: i32, scope: u8) -> AddrInfo {
        let parsed = NetAddr::parse(addr).unwrap();
        AddrInfo {
            ifindex,
            scope,
            flags: 0,
            addr: NetAddr::new(parsed.ip(), prefix).unwrap(),
        }
    }

    #[test]
    fn nat_pool_hands_out_sequential_addresses() {
        let mut pool = NatPool::default();
        pool.configure(Some(NetAddr::parse("10.0.0.1").unwrap()), None, 3);

        assert_eq!(pool.get().unwrap()[0].to_string(), "10.0.0.1");
        assert_eq!(pool.get().unwrap()[0].to_string(), "10.0.0.2");
        assert_eq!(pool.get().unwrap()[0].to_string(), "10.0.0.3");

        let err = pool.get().unwrap_err();
        assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);
    }

    #[test]
    fn nat_pool_put_recovers_slot_by_offset() {
        let mut pool = NatPool::default();
        pool.configure(Some(NetAddr::parse("10.0.0.1").unwrap()), None, 3);

        let _a = pool.get().unwrap();
        let b = pool.get().unwrap();
        let _c = pool.get().unwrap();

        pool.put(&b).unwrap();
        assert_eq!(pool.get().unwrap()[0].to_string(), "10.0.0.2");
    }

    #[test]
    fn nat_pool_dual_family() {
        let mut pool = NatPool::default();
        pool.configure(
            Some(NetAddr::parse("192.168.100.1").unwrap()),
            Some(NetAddr::parse("fd00::1").unwrap()),
            8,
        );
        let addrs = pool.get().unwrap();
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[0].to_string(), "192.168.100.1");
        assert_eq!(addrs[1].to_string(), "fd00::1");

        // returning either family's address frees the same slot
        pool.put(&addrs).unwrap();
        assert_eq!(pool.get().unwrap()[0].to_string(), "192.168.100.1");
    }

    #[test]
    fn skip_link_filters_reserved_veth_names() {
        let veth = |name: &str| LinkInfo {
            name: name.to_string(),
            kind: "veth".to_string(),
            flags: netlink::IFF_RUNNING,
            ..Default::default()
        };
        assert!(skip_link(&veth("portove-1-0"), false));
        assert!(skip_link(&veth("L3-0"), false));
        assert!(!skip_link(&veth("veth-user"), false));
        // only veth links are filtered by prefix
        let mut not_veth = veth("L3-0");
        not_veth.kind = "ether".to_string();
        assert!(!skip_link(&not_veth, false));
    }

    #[test]
    fn skip_link_honours_loopback_and_running() {
        let mut link = LinkInfo {
            name: "lo".to_string(),
            flags: netlink::IFF_LOOPBACK | netlink::IFF_RUNNING,
            ..Default::default()
        };
        assert!(skip_link(&link, false));
        assert!(skip_link(&link, true));

        link.flags = 0;
        link.name = "eth0".to_string();
        // down links are ignored in the host namespace only
        assert!(skip_link(&link, false));
        assert!(!skip_link(&link, true));
    }

    #[test]
    fn gateway_prefers_containing_prefix() {
        let locals = vec![local("10.0.0.1", 8, 2, 0), local("192.168.1.1", 24, 3, 0)];
        let mtus = HashMap::from([(2, 9000), (3, 1500)]);
        let candidate = NetAddr::parse("192.168.1.50").unwrap();

        let (gate4, gate6, mtu) = select_gateways(&locals, &mtus, &[candidate]);
        assert_eq!(gate4.unwrap().to_string(), "192.168.1.1");
        assert!(gate6.is_none());
        assert_eq!(mtu, Some(1500));
    }

    #[test]
    fn gateway_prefers_the_most_specific_prefix() {
        let locals = vec![
            local("192.168.0.1", 16, 2, 0),
            local("192.168.1.1", 24, 3, 0),
        ];
        let candidate = NetAddr::parse("192.168.1.50").unwrap();
        let (gate4, _, _) = select_gateways(&locals, &HashMap::new(), &[candidate]);
        assert_eq!(gate4.unwrap().to_string(), "192.168.1.1");
    }

    #[test]
    fn gateway_falls_back_to_any_family_address() {
        let locals = vec![local("10.0.0.1", 24, 2, 0)];
        let mtus = HashMap::new();
        let candidate = NetAddr::parse("172.16.0.5").unwrap();

        let (gate4, _, mtu) = select_gateways(&locals, &mtus, &[candidate]);
        assert_eq!(gate4.unwrap().to_string(), "10.0.0.1");
        assert_eq!(mtu, None);
    }

    #[test]
    fn gateway_skips_host_scope() {
        let locals = vec![local("10.0.0.1", 24, 2, RT_SCOPE_HOST)];
        let candidate = NetAddr::parse("10.0.0.5").unwrap();
        let (gate4, gate6, _) = select_gateways(&locals, &HashMap::new(), &[candidate]);
        assert!(gate4.is_none());
        assert!(gate6.is_none());
    }

    #[test]
    fn gateway_result_is_host_address() {
        let locals = vec![local("192.168.1.1", 24, 2, 0)];
        let candidate = NetAddr::parse("192.168.1.50").unwrap();
        let (gate4, _, _) = select_gateways(&locals, &HashMap::new(), &[candidate]);
        assert!(gate4.unwrap().is_host());
    }

    fn device(cfg: &NetworkConfig) -> NetworkDevice {
        let link = LinkInfo {
            index: 2,
            name: "eth0".to_string(),
            mtu: 1500,
            ..Default::default()
        };
        NetworkDevice::new(&link, cfg)
    }

    #[test]
    fn class_request_defaults_mean_no_guarantee() {
        // nothing configured: rate 0 (mapped to 1 bps by the clamp),
        // ceil 0 (the device maximum), default priority
        let cfg = NetworkConfig::default();
        let dev = device(&cfg);
        let empty = PatternMap::default();

        for handle in [ROOT_CLASS, PORTO_ROOT_CLASS, tc::container_class(4)] {
            let (prio, rate, ceil) = class_request(&dev, &cfg, handle, &empty, &empty, &empty);
            assert_eq!(prio, NET_DEFAULT_PRIO);
            assert_eq!(rate, 0, "rate default for {}", handle);
            assert_eq!(ceil, 0, "ceil default for {}", handle);
        }
    }

    #[test]
    fn class_request_rate_default_follows_the_handle_kind() {
        let cfg = NetworkConfig {
            device_rate: PatternMap::parse("default: 2000000000").unwrap(),
            porto_rate: PatternMap::parse("default: 500000000").unwrap(),
            container_rate: PatternMap::parse("default: 100000000").unwrap(),
            ..Default::default()
        };
        let dev = device(&cfg);
        let empty = PatternMap::default();

        let (_, rate, ceil) = class_request(&dev, &cfg, ROOT_CLASS, &empty, &empty, &empty);
        assert_eq!(rate, 2_000_000_000);
        assert_eq!(ceil, 2_000_000_000);

        let (_, rate, _) = class_request(&dev, &cfg, PORTO_ROOT_CLASS, &empty, &empty, &empty);
        assert_eq!(rate, 500_000_000);

        let (_, rate, _) = class_request(&dev, &cfg, tc::container_class(7), &empty, &empty, &empty);
        assert_eq!(rate, 100_000_000);
    }

    #[test]
    fn class_request_map_entries_override_config_defaults() {
        let cfg = NetworkConfig {
            container_rate: PatternMap::parse("default: 100").unwrap(),
            ..Default::default()
        };
        let dev = device(&cfg);
        let prio = PatternMap::parse("eth*: 5").unwrap();
        let rate = PatternMap::parse("eth0: 1000; default: 10").unwrap();
        let ceil = PatternMap::parse("wlan*: 7").unwrap();

        let (p, r, c) = class_request(&dev, &cfg, tc::container_class(4), &prio, &rate, &ceil);
        assert_eq!(p, 5);
        assert_eq!(r, 1000);
        // no ceil pattern matches eth0, and device_rate is unset
        assert_eq!(c, 0);
    }
}
