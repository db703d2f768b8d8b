//! Daemon configuration
//!
//! Network tunables are pattern-keyed maps: the key is a device-name glob,
//! the reserved key `default` is the fallback. In the config file a map is a
//! single string of `pattern: value` pairs separated by semicolons, e.g.
//! `"eth*: 125000000; default: 1250000000"`.

use std::fmt;
use std::io::{BufRead, BufReader, Read};
use std::marker::PhantomData;
use std::path::Path;
use std::str::FromStr;

use log::{info, warn};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;

use crate::errors::{Error, ErrorKind, Result};
use crate::utils::{get_sysctl, string_match};

/// Ordered pattern → value map with `default` as the last-resort key
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PatternMap<T> {
    entries: Vec<(String, T)>,
}

impl<T> PatternMap<T> {
    pub fn new(entries: Vec<(String, T)>) -> Self {
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Exact match first, then glob match in declaration order, then the
    /// `default` entry.
    pub fn get(&self, name: &str) -> Option<&T> {
        for (pattern, value) in &self.entries {
            if pattern == name {
                return Some(value);
            }
        }
        for (pattern, value) in &self.entries {
            if pattern != "default" && string_match(name, pattern) {
                return Some(value);
            }
        }
        self.entries
            .iter()
            .find(|(pattern, _)| pattern == "default")
            .map(|(_, value)| value)
    }
}

impl<T: FromStr> PatternMap<T> {
    /// Parse a `pattern: value; pattern: value` string
    pub fn parse(spec: &str) -> Result<Self> {
        let mut entries = Vec::new();
        for item in spec.split(';') {
            let item = item.trim();
            if item.is_empty() {
                continue;
            }
            let (pattern, value) = item.split_once(':').ok_or_else(|| {
                Error::new(ErrorKind::InvalidValue, format!("invalid map entry: {}", item))
            })?;
            let value = value.trim().parse::<T>().map_err(|_| {
                Error::new(ErrorKind::InvalidValue, format!("invalid map value in: {}", item))
            })?;
            entries.push((pattern.trim().to_string(), value));
        }
        Ok(Self { entries })
    }
}

impl<'de, T: FromStr> Deserialize<'de> for PatternMap<T> {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        struct MapVisitor<T>(PhantomData<T>);

        impl<'de, T: FromStr> Visitor<'de> for MapVisitor<T> {
            type Value = PatternMap<T>;

            fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str("a 'pattern: value; ...' string")
            }

            fn visit_str<E: de::Error>(self, spec: &str) -> std::result::Result<Self::Value, E> {
                PatternMap::parse(spec).map_err(|e| E::custom(e.text))
            }
        }

        deserializer.deserialize_str(MapVisitor(PhantomData))
    }
}

/// Network engine tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct NetworkConfig {
    /// Host devices left untouched, by name glob
    pub unmanaged_device: Vec<String>,
    /// Host devices left untouched, by `/etc/iproute2/group` name or id
    pub unmanaged_group: Vec<String>,
    #[serde(skip)]
    pub unmanaged_group_ids: Vec<u32>,

    pub device_qdisc: PatternMap<String>,
    pub device_rate: PatternMap<u64>,
    pub default_rate: PatternMap<u64>,
    pub porto_rate: PatternMap<u64>,
    pub container_rate: PatternMap<u64>,
    pub device_quantum: PatternMap<u64>,
    pub htb_rbuffer: PatternMap<u64>,
    pub htb_cbuffer: PatternMap<u64>,

    pub default_qdisc: PatternMap<String>,
    pub default_qdisc_limit: PatternMap<u64>,
    pub default_qdisc_quantum: PatternMap<u64>,

    /// First address of the NAT pool, one per family
    pub nat_first_ipv4: Option<String>,
    pub nat_first_ipv6: Option<String>,
    /// NAT pool size
    pub nat_count: u64,

    /// Per-interface bound on waiting for a router-advertised address
    pub autoconf_timeout_s: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            unmanaged_device: Vec::new(),
            unmanaged_group: Vec::new(),
            unmanaged_group_ids: Vec::new(),
            device_qdisc: PatternMap::default(),
            device_rate: PatternMap::default(),
            default_rate: PatternMap::default(),
            porto_rate: PatternMap::default(),
            container_rate: PatternMap::default(),
            device_quantum: PatternMap::default(),
            htb_rbuffer: PatternMap::default(),
            htb_cbuffer: PatternMap::default(),
            default_qdisc: PatternMap::default(),
            default_qdisc_limit: PatternMap::default(),
            default_qdisc_quantum: PatternMap::default(),
            nat_first_ipv4: None,
            nat_first_ipv6: None,
            nat_count: 0,
            autoconf_timeout_s: 120,
        }
    }
}

/// Task launcher tunables
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ContainerConfig {
    /// Supervisor-side timeout for the whole pid/ack handshake
    pub start_timeout_ms: u64,
    /// IPC sysctls applied inside new IPC namespaces
    pub ipc_sysctl: Vec<SysctlPair>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SysctlPair {
    pub key: String,
    pub val: String,
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 300_000,
            ipc_sysctl: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub network: NetworkConfig,
    pub container: ContainerConfig,
}

/// IPC sysctls isolated by a new IPC namespace; their host values become
/// the container defaults unless the config overrides them.
pub const IPC_SYSCTLS: &[&str] = &[
    "fs.mqueue.queues_max",
    "fs.mqueue.msg_max",
    "fs.mqueue.msgsize_max",
    "fs.mqueue.msg_default",
    "fs.mqueue.msgsize_default",
    "kernel.shmmax",
    "kernel.shmall",
    "kernel.shmmni",
    "kernel.shm_rmid_forced",
    "kernel.msgmax",
    "kernel.msgmni",
    "kernel.msgmnb",
    "kernel.sem",
];

impl Config {
    /// Load and initialize the config from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            Error::from_errno(
                ErrorKind::InvalidData,
                e.raw_os_error().unwrap_or(0),
                format!("cannot read config {}", path.display()),
            )
        })?;
        let mut config: Config = serde_json::from_str(&data)
            .map_err(|e| Error::new(ErrorKind::InvalidData, format!("config: {}", e)))?;
        config.init();
        Ok(config)
    }

    /// Resolve group names and capture host IPC sysctl defaults
    pub fn init(&mut self) {
        let groups = match std::fs::File::open("/etc/iproute2/group") {
            Ok(file) => parse_group_file(file),
            Err(_) => Vec::new(),
        };
        self.network.resolve_unmanaged_groups(&groups);
        self.container.capture_ipc_defaults();
    }
}

impl NetworkConfig {
    /// Turn `unmanaged_group` names into numeric ids using the parsed
    /// `/etc/iproute2/group` table; unknown names are skipped with a warning.
    pub fn resolve_unmanaged_groups(&mut self, groups: &[(u32, String)]) {
        self.unmanaged_group_ids.clear();
        for group in &self.unmanaged_group {
            let id = groups
                .iter()
                .find(|(_, name)| name == group)
                .map(|(id, _)| *id)
                .or_else(|| group.parse::<u32>().ok());
            match id {
                Some(id) => {
                    info!("unmanaged network device group: {}:{}", id, group);
                    self.unmanaged_group_ids.push(id);
                }
                None => warn!("unknown network device group: {}", group),
            }
        }
    }
}

impl ContainerConfig {
    /// Record host values for IPC sysctls the config does not set
    pub fn capture_ipc_defaults(&mut self) {
        for key in IPC_SYSCTLS {
            if self.ipc_sysctl.iter().any(|s| s.key == *key) {
                continue;
            }
            if let Ok(val) = get_sysctl(key) {
                self.ipc_sysctl.push(SysctlPair {
                    key: (*key).to_string(),
                    val,
                });
            }
        }
    }
}

/// Parse `/etc/iproute2/group`: `<id> <name>` lines, `#` comments
pub fn parse_group_file<R: Read>(reader: R) -> Vec<(u32, String)> {
    let mut groups = Vec::new();
    for line in BufReader::new(reader).lines().map_while(|l| l.ok()) {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.split_whitespace();
        if let (Some(id), Some(name)) = (parts.next(), parts.next()) {
            if let Ok(id) = id.parse::<u32>() {
                groups.push((id, name.to_string()));
            }
        }
    }
    groups
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pattern_map_parse_and_lookup() {
        let map: PatternMap<u64> = PatternMap::parse("eth0: 100; eth*: 50; default: 10").unwrap();
        assert_eq!(map.get("eth0"), Some(&100));
        assert_eq!(map.get("eth1"), Some(&50));
        assert_eq!(map.get("wlan0"), Some(&10));
    }

    #[test]
    fn pattern_map_exact_beats_glob_regardless_of_order() {
        let map: PatternMap<u64> = PatternMap::parse("eth*: 50; eth0: 100").unwrap();
        assert_eq!(map.get("eth0"), Some(&100));
    }

    #[test]
    fn pattern_map_empty_has_no_answer() {
        let map: PatternMap<u64> = PatternMap::default();
        assert_eq!(map.get("eth0"), None);
    }

    #[test]
    fn pattern_map_rejects_garbage() {
        assert!(PatternMap::<u64>::parse("eth0 100").is_err());
        assert!(PatternMap::<u64>::parse("eth0: lots").is_err());
    }

    #[test]
    fn group_file_parsing() {
        let data = "# comment\n0\tdefault\n10 fastnet\n\nbad line here\n";
        let groups = parse_group_file(data.as_bytes());
        assert_eq!(
            groups,
            vec![(0, "default".to_string()), (10, "fastnet".to_string())]
        );
    }

    #[test]
    fn unmanaged_group_resolution() {
        let mut cfg = NetworkConfig {
            unmanaged_group: vec!["fastnet".into(), "42".into(), "nope".into()],
            ..Default::default()
        };
        cfg.resolve_unmanaged_groups(&[(10, "fastnet".to_string())]);
        assert_eq!(cfg.unmanaged_group_ids, vec![10, 42]);
    }

    #[test]
    fn config_json_deserializes_maps() {
        let json = r#"{
            "network": {
                "device_rate": "default: 1250000000",
                "unmanaged_device": ["tun*"],
                "nat_first_ipv4": "192.168.100.1",
                "nat_count": 64
            },
            "container": {
                "start_timeout_ms": 10000
            }
        }"#;
        let config: Config = serde_json::from_str(json).unwrap();
        assert_eq!(config.network.device_rate.get("eth0"), Some(&1_250_000_000));
        assert_eq!(config.network.nat_count, 64);
        assert_eq!(config.container.start_timeout_ms, 10_000);
    }

    #[test]
    fn ipc_sysctl_capture_respects_overrides() {
        let mut cfg = ContainerConfig {
            ipc_sysctl: vec![SysctlPair {
                key: "kernel.shmmax".into(),
                val: "1".into(),
            }],
            ..Default::default()
        };
        cfg.capture_ipc_defaults();
        let shmmax: Vec<_> = cfg.ipc_sysctl.iter().filter(|s| s.key == "kernel.shmmax").collect();
        assert_eq!(shmmax.len(), 1);
        assert_eq!(shmmax[0].val, "1");
    }
}
