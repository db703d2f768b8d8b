//! Traffic-control plumbing: handles, HTB wire structures and the
//! qdisc/class/filter operations built on the netlink client.
//!
//! Every managed device carries the same skeleton:
//!
//! ```text
//! 1:0 root htb qdisc
//!  |
//! 1:1 device rate class
//!  |
//!  +- 1:2 default class (+ leaf qdisc in the host namespace)
//!  |
//!  +- 1:3 porto root class
//!      |
//!      +- 1:<id> one class per container, id >= 4
//! ```

use std::fmt;
use std::sync::OnceLock;

use log::{debug, warn};

use crate::errors::Result;
use crate::network::netlink::{
    Netlink, NlRequest, RTM_DELQDISC, RTM_DELTCLASS, RTM_DELTFILTER, RTM_GETQDISC, RTM_GETTCLASS,
    RTM_NEWQDISC, RTM_NEWTCLASS, RTM_NEWTFILTER, NLM_F_ACK, NLM_F_CREATE, NLM_F_DUMP, NLM_F_EXCL,
    NLM_F_REPLACE, NLM_F_REQUEST,
};

/// 32-bit qdisc/class identifier packing a 16-bit major and minor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TcHandle(pub u32);

impl TcHandle {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self(((major as u32) << 16) | minor as u32)
    }

    pub fn major(self) -> u16 {
        (self.0 >> 16) as u16
    }

    pub fn minor(self) -> u16 {
        self.0 as u16
    }
}

impl fmt::Display for TcHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.major(), self.minor())
    }
}

/// Magic parent meaning "root of the device"
pub const TC_H_ROOT: TcHandle = TcHandle(0xFFFF_FFFF);

/// Root HTB qdisc on each managed device
pub const ROOT_QDISC: TcHandle = TcHandle::new(1, 0);
/// Device rate container under the root qdisc
pub const ROOT_CLASS: TcHandle = TcHandle::new(1, 1);
/// Sink for unclassified traffic
pub const DEFAULT_CLASS: TcHandle = TcHandle::new(1, 2);
/// Parent of all per-container classes
pub const PORTO_ROOT_CLASS: TcHandle = TcHandle::new(1, 3);
/// Leaf qdisc attached beneath [`DEFAULT_CLASS`] in the host namespace
pub const LEAF_QDISC: TcHandle = TcHandle::new(2, 0);
/// Container ids below this collide with the fixed skeleton
pub const CONTAINER_ID_MIN: u16 = 4;

/// Class handle of a container id
pub const fn container_class(id: u16) -> TcHandle {
    TcHandle::new(1, id)
}

// TC attributes
const TCA_KIND: u16 = 1;
const TCA_OPTIONS: u16 = 2;
const TCA_STATS: u16 = 3;
const TCA_STATS2: u16 = 7;

const TCA_STATS_BASIC: u16 = 1;
const TCA_STATS_QUEUE: u16 = 3;

// HTB options (linux/pkt_sched.h)
const TCA_HTB_PARMS: u16 = 1;
const TCA_HTB_INIT: u16 = 2;
const TCA_HTB_CTAB: u16 = 3;
const TCA_HTB_RTAB: u16 = 4;

const HTB_VERSION: u32 = 3;

// fq_codel options
const TCA_FQ_CODEL_LIMIT: u16 = 2;
const TCA_FQ_CODEL_QUANTUM: u16 = 6;

/// Modern kernels compute rates internally; a zeroed table triggers the
/// `rtab[0] == 0` fast path in `__detect_linklayer()` and is treated as
/// Ethernet without inspection.
const DEFAULT_RATE_TABLE: [u8; 1024] = [0u8; 1024];

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
struct TcMsg {
    tcm_family: u8,
    _pad1: u8,
    _pad2: u16,
    tcm_ifindex: i32,
    tcm_handle: u32,
    tcm_parent: u32,
    tcm_info: u32,
}

/// The kernel's `tc_ratespec`
#[derive(Debug, Clone, Copy, Default)]
struct TcRateSpec {
    cell_log: u8,
    linklayer: u8,
    overhead: u16,
    cell_align: i16,
    mpu: u16,
    rate: u32,
}

impl TcRateSpec {
    fn to_bytes(self) -> [u8; 12] {
        let mut buf = [0u8; 12];
        buf[0] = self.cell_log;
        buf[1] = self.linklayer;
        buf[2..4].copy_from_slice(&self.overhead.to_ne_bytes());
        buf[4..6].copy_from_slice(&self.cell_align.to_ne_bytes());
        buf[6..8].copy_from_slice(&self.mpu.to_ne_bytes());
        buf[8..12].copy_from_slice(&self.rate.to_ne_bytes());
        buf
    }
}

/// The kernel's `tc_htb_glob`, sent inside `TCA_OPTIONS`/`TCA_HTB_INIT`
#[derive(Debug, Clone, Copy)]
struct HtbGlob {
    version: u32,
    rate2quantum: u32,
    defcls: u32,
    debug: u32,
    direct_pkts: u32,
}

impl HtbGlob {
    fn as_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(20);
        buf.extend_from_slice(&self.version.to_ne_bytes());
        buf.extend_from_slice(&self.rate2quantum.to_ne_bytes());
        buf.extend_from_slice(&self.defcls.to_ne_bytes());
        buf.extend_from_slice(&self.debug.to_ne_bytes());
        buf.extend_from_slice(&self.direct_pkts.to_ne_bytes());
        buf
    }
}

/// The kernel's `tc_htb_opt`, sent inside `TCA_OPTIONS`/`TCA_HTB_PARMS`
#[derive(Debug, Clone, Copy)]
struct HtbOpt {
    rate: TcRateSpec,
    ceil: TcRateSpec,
    buffer: u32,
    cbuffer: u32,
    quantum: u32,
    level: u32,
    prio: u32,
}

impl HtbOpt {
    fn as_bytes(self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(44);
        buf.extend_from_slice(&self.rate.to_bytes());
        buf.extend_from_slice(&self.ceil.to_bytes());
        buf.extend_from_slice(&self.buffer.to_ne_bytes());
        buf.extend_from_slice(&self.cbuffer.to_ne_bytes());
        buf.extend_from_slice(&self.quantum.to_ne_bytes());
        buf.extend_from_slice(&self.level.to_ne_bytes());
        buf.extend_from_slice(&self.prio.to_ne_bytes());
        buf
    }
}

/// Ticks per microsecond of the kernel packet scheduler, from
/// `/proc/net/psched` (the iproute2 `tc_core_init` conversion)
fn tick_in_usec() -> f64 {
    static TICKS: OnceLock<f64> = OnceLock::new();
    *TICKS.get_or_init(|| {
        let read = || -> Option<f64> {
            let content = std::fs::read_to_string("/proc/net/psched").ok()?;
            let mut iter = content.split_whitespace();
            let t2us = u32::from_str_radix(iter.next()?, 16).ok()?;
            let us2t = u32::from_str_radix(iter.next()?, 16).ok()?;
            Some(t2us as f64 / us2t as f64)
        };
        read().unwrap_or_else(|| {
            warn!("cannot read /proc/net/psched, assuming 1 tick per usec");
            1.0
        })
    })
}

/// Transmission time of `bytes` at `rate` bytes/s, in scheduler ticks
fn xmit_ticks(bytes: u64, rate: u64) -> u32 {
    if rate == 0 {
        return 0;
    }
    (bytes as f64 * 1_000_000.0 / rate as f64 * tick_in_usec()) as u32
}

/// Clamp requested HTB rate and ceil against the device limit.
///
/// A zero rate means "no guarantee" but the kernel rejects it, so it maps
/// to 1 bps. Rates stay below `INT32_MAX` to avoid overflows in the
/// 32-bit ratespec. A zero or oversized ceil becomes the device maximum,
/// and ceil never drops below rate.
pub fn clamp_rates(rate: u64, ceil: u64, device_rate: u64) -> (u64, u64) {
    let max_rate = device_rate.min(i32::MAX as u64).max(1);
    let rate = rate.clamp(1, max_rate);
    let ceil = if ceil == 0 || ceil > max_rate {
        max_rate
    } else {
        ceil
    };
    (rate, ceil.max(rate))
}

/// Fully derived parameters of one HTB class
#[derive(Debug, Clone, Copy)]
pub struct HtbClassParams {
    pub prio: u32,
    pub rate: u64,
    pub ceil: u64,
    pub quantum: u32,
    pub rbuffer: u32,
    pub cbuffer: u32,
}

/// One entry of a per-device class dump
#[derive(Debug, Clone, Default)]
pub struct TcClassInfo {
    pub handle: u32,
    pub parent: u32,
    pub kind: String,
    pub rate: u32,
    pub ceil: u32,
    pub bytes: u64,
    pub packets: u64,
    pub drops: u64,
    pub overlimits: u64,
}

/// One entry of a qdisc dump
#[derive(Debug, Clone, Default)]
pub struct TcQdiscInfo {
    pub ifindex: i32,
    pub handle: u32,
    pub parent: u32,
    pub kind: String,
}

/// Breadth-first descendants of `root` (inclusive) over a class dump;
/// reversing the result yields a safe leaf-first deletion order.
pub(crate) fn collect_descendants(classes: &[(u32, u32)], root: u32) -> Vec<u32> {
    let mut handles = vec![root];
    let mut i = 0;
    while i < handles.len() {
        for &(handle, parent) in classes {
            if parent == handles[i] && !handles.contains(&handle) {
                handles.push(handle);
            }
        }
        i += 1;
    }
    handles
}

fn parse_tc(payload: &[u8]) -> Option<(TcMsg, Vec<(u16, Vec<u8>)>)> {
    use crate::network::netlink::parse_attrs;

    if payload.len() < std::mem::size_of::<TcMsg>() {
        return None;
    }
    let tcm = unsafe { *(payload.as_ptr() as *const TcMsg) };
    let attrs = parse_attrs(&payload[std::mem::size_of::<TcMsg>()..])
        .into_iter()
        .map(|(t, d)| (t, d.to_vec()))
        .collect();
    Some((tcm, attrs))
}

fn parse_class(payload: &[u8]) -> Option<TcClassInfo> {
    use crate::network::netlink::parse_attrs;

    let (tcm, attrs) = parse_tc(payload)?;
    let mut info = TcClassInfo {
        handle: tcm.tcm_handle,
        parent: tcm.tcm_parent,
        ..Default::default()
    };

    for (ty, data) in &attrs {
        match *ty {
            TCA_KIND => {
                let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                info.kind = String::from_utf8_lossy(&data[..end]).into_owned();
            }
            TCA_OPTIONS => {
                for (sub, subdata) in parse_attrs(data) {
                    if sub == TCA_HTB_PARMS && subdata.len() >= 44 {
                        // tc_htb_opt: rate spec at 0, ceil spec at 12,
                        // the u32 rate value lives at offset 8 of each
                        info.rate = u32::from_ne_bytes(subdata[8..12].try_into().ok()?);
                        info.ceil = u32::from_ne_bytes(subdata[20..24].try_into().ok()?);
                    }
                }
            }
            TCA_STATS2 => {
                for (sub, subdata) in parse_attrs(data) {
                    match sub {
                        TCA_STATS_BASIC if subdata.len() >= 12 => {
                            info.bytes = u64::from_ne_bytes(subdata[0..8].try_into().ok()?);
                            info.packets =
                                u32::from_ne_bytes(subdata[8..12].try_into().ok()?) as u64;
                        }
                        TCA_STATS_QUEUE if subdata.len() >= 20 => {
                            info.drops = u32::from_ne_bytes(subdata[8..12].try_into().ok()?) as u64;
                            info.overlimits =
                                u32::from_ne_bytes(subdata[16..20].try_into().ok()?) as u64;
                        }
                        _ => {}
                    }
                }
            }
            TCA_STATS if data.len() >= 32 => {
                // legacy struct tc_stats
                info.bytes = u64::from_ne_bytes(data[0..8].try_into().ok()?);
                info.packets = u32::from_ne_bytes(data[8..12].try_into().ok()?) as u64;
                info.drops = u32::from_ne_bytes(data[12..16].try_into().ok()?) as u64;
                info.overlimits = u32::from_ne_bytes(data[16..20].try_into().ok()?) as u64;
            }
            _ => {}
        }
    }
    Some(info)
}

impl Netlink {
    /// Install the root HTB qdisc routing unclassified traffic to
    /// `default_minor` with the given rate-to-quantum divisor.
    pub fn htb_qdisc_add(
        &mut self,
        ifindex: i32,
        handle: TcHandle,
        default_minor: u16,
        rate2quantum: u32,
    ) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWQDISC,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        );
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: handle.0,
            tcm_parent: TC_H_ROOT.0,
            ..Default::default()
        });
        req.attr_str(TCA_KIND, "htb");
        let opts = req.begin_nest(TCA_OPTIONS);
        req.attr(
            TCA_HTB_INIT,
            &HtbGlob {
                version: HTB_VERSION,
                rate2quantum,
                defcls: default_minor as u32,
                debug: 0,
                direct_pkts: 0,
            }
            .as_bytes(),
        );
        req.end_nest(opts);

        debug!("add htb qdisc {} on ifindex {}", handle, ifindex);
        self.transact(req, &format!("add htb qdisc on ifindex {}", ifindex))
    }

    /// Attach a leaf qdisc of `kind` below `parent`. Supported kinds
    /// mirror the qdiscs the config may name: `pfifo_fast` (no options),
    /// `pfifo`/`bfifo`, `sfq` and `fq_codel`.
    pub fn leaf_qdisc_add(
        &mut self,
        ifindex: i32,
        handle: TcHandle,
        parent: TcHandle,
        kind: &str,
        limit: u64,
        quantum: u64,
    ) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWQDISC,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        );
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: handle.0,
            tcm_parent: parent.0,
            ..Default::default()
        });
        req.attr_str(TCA_KIND, kind);
        match kind {
            "pfifo" | "bfifo" => {
                // struct tc_fifo_qopt
                req.attr(TCA_OPTIONS, &(limit as u32).to_ne_bytes());
            }
            "sfq" => {
                // struct tc_sfq_qopt
                let mut opt = Vec::with_capacity(20);
                opt.extend_from_slice(&(quantum as u32).to_ne_bytes());
                opt.extend_from_slice(&0i32.to_ne_bytes()); // perturb_period
                opt.extend_from_slice(&(limit as u32).to_ne_bytes());
                opt.extend_from_slice(&0u32.to_ne_bytes()); // divisor
                opt.extend_from_slice(&0u32.to_ne_bytes()); // flows
                req.attr(TCA_OPTIONS, &opt);
            }
            "fq_codel" => {
                let opts = req.begin_nest(TCA_OPTIONS);
                if limit != 0 {
                    req.attr_u32(TCA_FQ_CODEL_LIMIT, limit as u32);
                }
                if quantum != 0 {
                    req.attr_u32(TCA_FQ_CODEL_QUANTUM, quantum as u32);
                }
                req.end_nest(opts);
            }
            _ => {}
        }

        debug!("add {} qdisc {} under {} on ifindex {}", kind, handle, parent, ifindex);
        self.transact(req, &format!("add {} qdisc on ifindex {}", kind, ifindex))
    }

    pub fn qdisc_del(&mut self, ifindex: i32, handle: TcHandle, parent: TcHandle) -> Result<()> {
        let mut req = NlRequest::new(RTM_DELQDISC, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: handle.0,
            tcm_parent: parent.0,
            ..Default::default()
        });
        self.transact(req, &format!("del qdisc {} on ifindex {}", handle, ifindex))
    }

    pub fn dump_qdiscs(&mut self, ifindex: i32) -> Result<Vec<TcQdiscInfo>> {
        let mut req = NlRequest::new(RTM_GETQDISC, NLM_F_REQUEST | NLM_F_DUMP);
        req.push(&TcMsg::default());
        let payloads = self.dump(req, RTM_NEWQDISC, "dump qdiscs")?;
        Ok(payloads
            .iter()
            .filter_map(|p| {
                let (tcm, attrs) = parse_tc(p)?;
                if tcm.tcm_ifindex != ifindex {
                    return None;
                }
                let mut info = TcQdiscInfo {
                    ifindex: tcm.tcm_ifindex,
                    handle: tcm.tcm_handle,
                    parent: tcm.tcm_parent,
                    ..Default::default()
                };
                for (ty, data) in &attrs {
                    if *ty == TCA_KIND {
                        let end = data.iter().position(|&b| b == 0).unwrap_or(data.len());
                        info.kind = String::from_utf8_lossy(&data[..end]).into_owned();
                    }
                }
                Some(info)
            })
            .collect())
    }

    /// Whether a qdisc of `kind` sits at `handle`/`parent` already
    pub fn qdisc_check(
        &mut self,
        ifindex: i32,
        handle: TcHandle,
        parent: TcHandle,
        kind: &str,
    ) -> Result<bool> {
        Ok(self
            .dump_qdiscs(ifindex)?
            .iter()
            .any(|q| q.handle == handle.0 && q.parent == parent.0 && q.kind == kind))
    }

    /// Create or update an HTB class
    pub fn class_add(
        &mut self,
        ifindex: i32,
        handle: TcHandle,
        parent: TcHandle,
        params: &HtbClassParams,
    ) -> Result<()> {
        let mut req = NlRequest::new(
            RTM_NEWTCLASS,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_REPLACE,
        );
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: handle.0,
            tcm_parent: parent.0,
            ..Default::default()
        });
        req.attr_str(TCA_KIND, "htb");

        let rate_spec = TcRateSpec {
            linklayer: 1, // TC_LINKLAYER_ETHERNET
            cell_align: -1,
            rate: params.rate as u32,
            ..Default::default()
        };
        let ceil_spec = TcRateSpec {
            rate: params.ceil as u32,
            ..rate_spec
        };
        let opt = HtbOpt {
            rate: rate_spec,
            ceil: ceil_spec,
            buffer: xmit_ticks(params.rbuffer as u64, params.rate),
            cbuffer: xmit_ticks(params.cbuffer as u64, params.ceil),
            quantum: params.quantum,
            level: 0,
            prio: params.prio,
        };

        let opts = req.begin_nest(TCA_OPTIONS);
        req.attr(TCA_HTB_PARMS, &opt.as_bytes());
        req.attr(TCA_HTB_RTAB, &DEFAULT_RATE_TABLE);
        req.attr(TCA_HTB_CTAB, &DEFAULT_RATE_TABLE);
        req.end_nest(opts);

        debug!(
            "add htb class {} under {} rate {} ceil {} on ifindex {}",
            handle, parent, params.rate, params.ceil, ifindex
        );
        self.transact(req, &format!("add class {} on ifindex {}", handle, ifindex))
    }

    pub fn class_del(&mut self, ifindex: i32, handle: TcHandle) -> Result<()> {
        let mut req = NlRequest::new(RTM_DELTCLASS, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: handle.0,
            ..Default::default()
        });
        self.transact(req, &format!("del class {} on ifindex {}", handle, ifindex))
    }

    /// Delete a class; on `EBUSY` walk the class tree and delete the whole
    /// subtree leaf-first. `ENOENT` at any step is not an error.
    pub fn class_del_deep(&mut self, ifindex: i32, handle: TcHandle) -> Result<()> {
        let err = match self.class_del(ifindex, handle) {
            Ok(()) => return Ok(()),
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) if e.is_busy() => e,
            Err(e) => return Err(e),
        };
        debug!("class {} busy, removing subtree: {}", handle, err);

        let classes: Vec<(u32, u32)> = self
            .dump_classes(ifindex)?
            .iter()
            .map(|c| (c.handle, c.parent))
            .collect();
        for h in collect_descendants(&classes, handle.0).into_iter().rev() {
            match self.class_del(ifindex, TcHandle(h)) {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn dump_classes(&mut self, ifindex: i32) -> Result<Vec<TcClassInfo>> {
        let mut req = NlRequest::new(RTM_GETTCLASS, NLM_F_REQUEST | NLM_F_DUMP);
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            ..Default::default()
        });
        let payloads = self.dump(req, RTM_NEWTCLASS, "dump classes")?;
        Ok(payloads.iter().filter_map(|p| parse_class(p)).collect())
    }

    /// Replace the cgroup packet classifier under `parent` at prio 10
    pub fn cgroup_filter_add(&mut self, ifindex: i32, parent: TcHandle) -> Result<()> {
        if let Err(e) = self.cgroup_filter_del(ifindex, parent) {
            if !e.is_not_found() {
                return Err(e);
            }
        }
        let mut req = NlRequest::new(
            RTM_NEWTFILTER,
            NLM_F_REQUEST | NLM_F_ACK | NLM_F_CREATE | NLM_F_EXCL,
        );
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: 1,
            tcm_parent: parent.0,
            tcm_info: filter_info(),
            ..Default::default()
        });
        req.attr_str(TCA_KIND, "cgroup");
        self.transact(req, &format!("add cgroup filter on ifindex {}", ifindex))
    }

    pub fn cgroup_filter_del(&mut self, ifindex: i32, parent: TcHandle) -> Result<()> {
        let mut req = NlRequest::new(RTM_DELTFILTER, NLM_F_REQUEST | NLM_F_ACK);
        req.push(&TcMsg {
            tcm_ifindex: ifindex,
            tcm_handle: 1,
            tcm_parent: parent.0,
            tcm_info: filter_info(),
            ..Default::default()
        });
        self.transact(req, &format!("del cgroup filter on ifindex {}", ifindex))
    }
}

/// Filter prio 10, protocol ETH_P_ALL packed into `tcm_info`
fn filter_info() -> u32 {
    const FILTER_PRIO: u32 = 10;
    const ETH_P_ALL: u16 = 0x0003;
    (FILTER_PRIO << 16) | ETH_P_ALL.to_be() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_packs_major_and_minor() {
        let handle = TcHandle::new(1, 3);
        assert_eq!(handle.0, 0x0001_0003);
        assert_eq!(handle.major(), 1);
        assert_eq!(handle.minor(), 3);
        assert_eq!(handle.to_string(), "1:3");
    }

    #[test]
    fn skeleton_handles() {
        assert_eq!(ROOT_QDISC.0, 0x0001_0000);
        assert_eq!(ROOT_CLASS.0, 0x0001_0001);
        assert_eq!(DEFAULT_CLASS.0, 0x0001_0002);
        assert_eq!(PORTO_ROOT_CLASS.0, 0x0001_0003);
        assert_eq!(container_class(4).0, 0x0001_0004);
        assert_eq!(container_class(4).major(), ROOT_QDISC.major());
    }

    #[test]
    fn rate_clamping() {
        // configured device rate 2e9, request above it
        assert_eq!(
            clamp_rates(5_000_000_000, 0, 2_000_000_000),
            (2_000_000_000, 2_000_000_000)
        );
        // zero rate is a minimal guarantee, not an error
        assert_eq!(clamp_rates(0, 0, 2_000_000_000).0, 1);
        // device rate above INT32_MAX is clamped
        let (rate, ceil) = clamp_rates(u64::MAX, u64::MAX, u64::MAX);
        assert_eq!(rate, i32::MAX as u64);
        assert_eq!(ceil, i32::MAX as u64);
        // ceil below rate is lifted to rate
        assert_eq!(clamp_rates(1000, 10, 2_000_000_000), (1000, 1000));
        // in-range values pass through
        assert_eq!(clamp_rates(100, 200, 2_000_000_000), (100, 200));
    }

    #[test]
    fn descendants_are_collected_breadth_first() {
        // 1:3 -> {1:4, 1:5}, 1:5 -> {1:6}
        let classes = vec![
            (0x0001_0004, 0x0001_0003),
            (0x0001_0005, 0x0001_0003),
            (0x0001_0006, 0x0001_0005),
            (0x0001_0002, 0x0001_0001),
        ];
        let handles = collect_descendants(&classes, 0x0001_0003);
        assert_eq!(handles, vec![0x0001_0003, 0x0001_0004, 0x0001_0005, 0x0001_0006]);

        // reverse order deletes leaves before their parents
        let reversed: Vec<u32> = handles.into_iter().rev().collect();
        assert_eq!(reversed, vec![0x0001_0006, 0x0001_0005, 0x0001_0004, 0x0001_0003]);
    }

    #[test]
    fn delete_order_for_flat_tree() {
        let classes = vec![(0x0001_0004, 0x0001_0003), (0x0001_0005, 0x0001_0003)];
        let order: Vec<u32> = collect_descendants(&classes, 0x0001_0003)
            .into_iter()
            .rev()
            .collect();
        assert_eq!(order, vec![0x0001_0005, 0x0001_0004, 0x0001_0003]);
    }

    #[test]
    fn htb_struct_sizes_match_kernel() {
        let glob = HtbGlob {
            version: HTB_VERSION,
            rate2quantum: 10,
            defcls: 2,
            debug: 0,
            direct_pkts: 0,
        };
        assert_eq!(glob.as_bytes().len(), 20);

        let opt = HtbOpt {
            rate: TcRateSpec::default(),
            ceil: TcRateSpec::default(),
            buffer: 0,
            cbuffer: 0,
            quantum: 0,
            level: 0,
            prio: 0,
        };
        assert_eq!(opt.as_bytes().len(), 44);
        assert_eq!(TcRateSpec::default().to_bytes().len(), 12);
    }

    #[test]
    fn htb_parms_rate_offsets() {
        let opt = HtbOpt {
            rate: TcRateSpec {
                rate: 1000,
                ..Default::default()
            },
            ceil: TcRateSpec {
                rate: 2000,
                ..Default::default()
            },
            buffer: 0,
            cbuffer: 0,
            quantum: 0,
            level: 0,
            prio: 0,
        };
        let bytes = opt.as_bytes();
        assert_eq!(u32::from_ne_bytes(bytes[8..12].try_into().unwrap()), 1000);
        assert_eq!(u32::from_ne_bytes(bytes[20..24].try_into().unwrap()), 2000);
    }

    #[test]
    fn filter_info_packs_prio_and_protocol() {
        let info = filter_info();
        assert_eq!(info >> 16, 10);
        assert_eq!((info & 0xFFFF) as u16, 0x0300);
    }

    #[test]
    fn zero_rate_xmit_time_is_zero() {
        assert_eq!(xmit_ticks(1500, 0), 0);
    }
}
