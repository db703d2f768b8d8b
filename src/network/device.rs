//! Host network device bookkeeping

use crate::config::{NetworkConfig, PatternMap};
use crate::network::netlink::LinkInfo;
use crate::utils::string_match;

/// A link known to a [`crate::network::Network`], reconciled on refresh
#[derive(Debug, Clone)]
pub struct NetworkDevice {
    pub name: String,
    pub kind: String,
    pub index: i32,
    /// ifindex of the lower device for stacked links, 0 otherwise
    pub link: i32,
    pub group: u32,
    pub mtu: u32,
    /// Subject to the HTB class tree; derived once at construction
    pub managed: bool,
    /// The HTB skeleton is installed
    pub prepared: bool,
    /// Refresh-cycle sweep flag
    pub missing: bool,
}

impl NetworkDevice {
    /// Classify a fresh link against the unmanaged patterns and groups
    pub fn new(link: &LinkInfo, cfg: &NetworkConfig) -> Self {
        let mut managed = true;
        for pattern in &cfg.unmanaged_device {
            if string_match(&link.name, pattern) {
                managed = false;
            }
        }
        if cfg.unmanaged_group_ids.contains(&link.group) {
            managed = false;
        }

        Self {
            name: link.name.clone(),
            kind: link.kind.clone(),
            index: link.index,
            link: link.link,
            group: link.group,
            mtu: link.mtu,
            managed,
            prepared: false,
            missing: false,
        }
    }

    pub fn desc(&self) -> String {
        format!("{}:{} ({})", self.index, self.name, self.kind)
    }

    /// Numeric config lookup: exact name, then glob, then `default`
    pub fn get_uint(&self, map: &PatternMap<u64>, def: u64) -> u64 {
        map.get(&self.name).copied().unwrap_or(def)
    }

    /// String config lookup with the same precedence
    pub fn get_string(&self, map: &PatternMap<String>, def: &str) -> String {
        map.get(&self.name).cloned().unwrap_or_else(|| def.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetworkConfig;
    use crate::network::netlink::LinkInfo;

    fn link(name: &str, group: u32) -> LinkInfo {
        LinkInfo {
            index: 2,
            name: name.to_string(),
            kind: "ether".to_string(),
            mtu: 1500,
            group,
            ..Default::default()
        }
    }

    #[test]
    fn devices_are_managed_by_default() {
        let cfg = NetworkConfig::default();
        let dev = NetworkDevice::new(&link("eth0", 0), &cfg);
        assert!(dev.managed);
        assert!(!dev.prepared);
        assert!(!dev.missing);
    }

    #[test]
    fn unmanaged_pattern_wins() {
        let cfg = NetworkConfig {
            unmanaged_device: vec!["tun*".into()],
            ..Default::default()
        };
        assert!(!NetworkDevice::new(&link("tun0", 0), &cfg).managed);
        assert!(NetworkDevice::new(&link("eth0", 0), &cfg).managed);
    }

    #[test]
    fn unmanaged_group_wins() {
        let cfg = NetworkConfig {
            unmanaged_group_ids: vec![7],
            ..Default::default()
        };
        assert!(!NetworkDevice::new(&link("eth0", 7), &cfg).managed);
        assert!(NetworkDevice::new(&link("eth0", 6), &cfg).managed);
    }

    #[test]
    fn config_lookup_with_defaults() {
        let cfg = NetworkConfig::default();
        let dev = NetworkDevice::new(&link("eth0", 0), &cfg);
        let map = PatternMap::parse("eth*: 100").unwrap();
        assert_eq!(dev.get_uint(&map, 7), 100);
        assert_eq!(dev.get_uint(&PatternMap::default(), 7), 7);
        assert_eq!(dev.get_string(&PatternMap::default(), "htb"), "htb");
    }

    #[test]
    fn desc_mentions_index_name_and_kind() {
        let cfg = NetworkConfig::default();
        let dev = NetworkDevice::new(&link("eth0", 0), &cfg);
        assert_eq!(dev.desc(), "2:eth0 (ether)");
    }
}
