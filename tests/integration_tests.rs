//! Integration tests for the network engine
//!
//! Kernel-facing tests require root and a live netlink socket; they are
//! marked with #[ignore] and can be run with:
//!   sudo cargo test -- --ignored

use std::sync::Arc;

use portod::config::{Config, NetworkConfig, PatternMap};
use portod::errors::ErrorKind;
use portod::network::addr::NetAddr;
use portod::network::spec::NetSpec;
use portod::network::tc::{container_class, PORTO_ROOT_CLASS, ROOT_CLASS, ROOT_QDISC};
use portod::network::{NetRegistry, Network};

fn lines(spec: &[&str]) -> Vec<String> {
    spec.iter().map(|s| s.to_string()).collect()
}

#[test]
fn full_spec_parses_every_interface_kind() {
    let spec = NetSpec::parse(
        3,
        &lines(&[
            "steal eth3",
            "macvlan eth0 mv0 bridge 1400 02:aa:bb:cc:dd:ee",
            "ipvlan eth1 iv0 l3",
            "veth veth0 br0",
            "L3 l3dev eth0",
            "NAT nat0",
            "MTU veth0 1400",
            "autoconf mv0",
        ]),
    )
    .unwrap();

    assert!(spec.new_netns);
    assert_eq!(spec.steal.len(), 1);
    assert_eq!(spec.macvlan.len(), 1);
    assert_eq!(spec.ipvlan.len(), 1);
    assert_eq!(spec.veth.len(), 1);
    assert_eq!(spec.l3.len(), 2);
    assert_eq!(spec.autoconf.len(), 1);
    assert_eq!(spec.veth[0].mtu, Some(1400));
    assert_eq!(spec.veth[0].peer, "portove-3-0");
}

#[test]
fn namespace_sources_are_exclusive() {
    for bad in [
        vec!["none", "inherited"],
        vec!["inherited", "veth eth0 br0"],
        vec!["none", "L3"],
        vec!["container x", "macvlan eth0 mv0"],
    ] {
        assert!(
            NetSpec::parse(1, &lines(&bad)).is_err(),
            "accepted {:?}",
            bad
        );
    }
}

#[test]
fn tc_handles_form_the_documented_skeleton() {
    assert_eq!(ROOT_QDISC.to_string(), "1:0");
    assert_eq!(ROOT_CLASS.to_string(), "1:1");
    assert_eq!(PORTO_ROOT_CLASS.to_string(), "1:3");
    // container classes hang under the porto root
    assert_eq!(container_class(4).major(), PORTO_ROOT_CLASS.major());
    assert!(container_class(4).minor() >= 4);
}

#[test]
fn config_defaults_are_usable_without_a_file() {
    let mut config = Config::default();
    config.init();
    assert_eq!(config.network.nat_count, 0);
    assert!(config.container.start_timeout_ms > 0);
    // host IPC defaults were captured for the container namespace
    assert!(!config.container.ipc_sysctl.is_empty());
}

#[test]
fn pattern_map_precedence_matches_device_lookup() {
    let map: PatternMap<u64> =
        PatternMap::parse("eth0: 1; eth*: 2; default: 3").unwrap();
    assert_eq!(map.get("eth0"), Some(&1));
    assert_eq!(map.get("eth9"), Some(&2));
    assert_eq!(map.get("wlan0"), Some(&3));
}

#[test]
fn nat_addresses_offset_from_base() {
    let base = NetAddr::parse("192.168.100.1").unwrap();
    let third = base.add_offset(2);
    assert_eq!(third.to_string(), "192.168.100.3");
    assert_eq!(third.offset_from(&base), 2);
}

#[test]
fn registry_drops_dead_networks() {
    let registry = NetRegistry::new();
    assert!(registry.get(424242).is_none());
    assert!(registry.host().is_none());
}

#[test]
#[ignore = "requires root and a live netlink socket"]
fn host_network_bootstraps() {
    let mut config = Config::default();
    config.init();

    let registry = NetRegistry::new();
    let host = registry
        .init_host_network(Arc::new(config.network.clone()))
        .unwrap();

    assert!(!host.is_managed_namespace());
    assert!(registry.host().is_some());
}

#[test]
#[ignore = "requires root and a live netlink socket"]
fn new_namespace_gets_loopback_only() {
    let cfg = Arc::new(NetworkConfig::default());
    let (net, netns) = Network::connect_new(cfg).unwrap();
    assert!(net.is_managed_namespace());
    assert!(netns.inode().unwrap() > 0);

    // a fresh namespace has no managed devices to track
    net.refresh_devices().unwrap();
    assert!(net.device_names().is_empty());
}

#[test]
#[ignore = "requires root and a live netlink socket"]
fn nat_pool_round_trip_against_host_network() {
    let mut net_cfg = NetworkConfig {
        nat_first_ipv4: Some("192.0.2.1".to_string()),
        nat_count: 2,
        ..Default::default()
    };
    net_cfg.resolve_unmanaged_groups(&[]);

    let net = Network::connect(Arc::new(net_cfg), false).unwrap();
    net.setup_nat().unwrap();

    let first = net.get_nat_address().unwrap();
    let second = net.get_nat_address().unwrap();
    assert_eq!(first[0].to_string(), "192.0.2.1");
    assert_eq!(second[0].to_string(), "192.0.2.2");

    let err = net.get_nat_address().unwrap_err();
    assert_eq!(err.kind, ErrorKind::ResourceNotAvailable);

    net.put_nat_address(&first).unwrap();
    assert_eq!(net.get_nat_address().unwrap()[0].to_string(), "192.0.2.1");
}
