// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use vpnsync_engine as engine;

use engine::testing::fixtures::{
    direct_port, external_network, l3vpn, network, port, router, router_port, subnet,
    with_gateway,
};
use engine::testing::{FallbackFlow, TEST_DPNS, TestBed};
use id::Id;
use model::AddressFamily;
use model::aggregates::{Adjacency, AssociatedSubnetType, SubnetMap, VpnInterface};
use model::neutron::{Port, Subnet, Vpn};
use pretty_assertions::assert_eq;
use std::collections::BTreeSet;
use tracing_test::traced_test;

async fn subnetmap(tb: &TestBed, id: Id<Subnet>) -> SubnetMap {
    tb.engine
        .subnets()
        .get(id)
        .await
        .expect("Should succeed")
        .expect("Subnet aggregate should exist")
}

async fn interface(tb: &TestBed, id: Id<Port>) -> Option<VpnInterface> {
    tb.engine.interfaces().get(id).await.expect("Should succeed")
}

#[tokio::test]
#[traced_test]
async fn port_of_network_in_vpn_joins_the_vpn() {
    let tb = TestBed::new().await;
    let net = network("net-a");
    let s1 = subnet(&net, "subnet-a", "10.0.0.0/24");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(s1.clone());
    tb.settle().await;

    let v1 = l3vpn("vpn-a", "100:1");
    let request = model::neutron::L3vpnRequest {
        network_ids: vec![net.id],
        ..v1.clone()
    };
    let report = tb
        .engine
        .l3vpn()
        .create_l3vpn(vec![request])
        .await
        .expect("Should succeed");
    assert!(report.is_success());
    assert_eq!(subnetmap(&tb, s1.id).await.vpn_id, Some(v1.id));

    let p1 = port("port-a", &net, &[(&s1, "10.0.0.5")]);
    tb.engine.port_events().added(p1.clone());
    tb.settle().await;

    let iface = interface(&tb, p1.id).await.expect("Port should have a VPN interface");
    assert_eq!(
        iface.memberships.into_iter().collect::<Vec<_>>(),
        vec![(v1.id, AssociatedSubnetType::V4Subnet)]
    );
    let adjacencies: Vec<Adjacency> = iface.adjacencies.into_values().collect();
    assert_eq!(
        adjacencies,
        vec![Adjacency::primary(
            "10.0.0.5".parse().expect("Should parse"),
            p1.mac,
            s1.id
        )]
    );
    assert!(subnetmap(&tb, s1.id).await.port_list.contains(&p1.id));

    let instance = tb
        .engine
        .vpns()
        .get_instance(v1.id)
        .await
        .expect("Should succeed")
        .expect("VPN should exist");
    assert_eq!(instance.address_family(), AddressFamily::V4);
}

#[tokio::test]
async fn router_port_binds_ipv6_subnet_to_internal_vpn() {
    let tb = TestBed::new().await;
    let r1 = router("router-b");
    let net = network("net-b");
    let s2 = subnet(&net, "subnet-b", "2001:db8:b::/64");
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(s2.clone());
    tb.settle().await;

    let rp = router_port(&r1, &net, &s2);
    tb.engine.port_events().added(rp.clone());
    tb.settle().await;

    let internal: Id<Vpn> = r1.id.retag();
    let sm = subnetmap(&tb, s2.id).await;
    assert_eq!(sm.vpn_id, Some(internal));
    assert_eq!(sm.router_id, Some(r1.id));
    assert_eq!(sm.router_interface.map(|ri| ri.port_id), Some(rp.id));
    assert_eq!(sm.internet_vpn_id, None);

    let instance = tb
        .engine
        .vpns()
        .get_instance(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN should exist");
    assert!(instance.is_internal());
    assert!(instance.vpn_tag.is_some());
    assert_eq!(instance.address_family(), AddressFamily::V6);

    let iface = interface(&tb, rp.id).await.expect("Router port should have a VPN interface");
    assert!(iface.is_router_interface);
    assert!(iface.is_member_of(internal));
    assert_eq!(
        tb.engine
            .interfaces()
            .router_interfaces(r1.id)
            .await
            .expect("Should succeed"),
        BTreeSet::from([rp.id])
    );
}

#[tokio::test]
#[traced_test]
async fn router_port_waits_for_its_subnet() {
    let tb = TestBed::new().await;
    let r1 = router("router-late");
    let net = network("net-late");
    let sub = subnet(&net, "subnet-late", "10.3.0.0/24");
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;

    let rp = router_port(&r1, &net, &sub);
    tb.engine.port_events().added(rp.clone());
    tb.settle().await;
    assert!(tb.engine.pending().is_pending(sub.id, rp.id));
    assert_eq!(interface(&tb, rp.id).await, None);

    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    assert!(tb.engine.pending().is_empty());

    let internal: Id<Vpn> = r1.id.retag();
    let sm = subnetmap(&tb, sub.id).await;
    assert_eq!(sm.router_id, Some(r1.id));
    assert_eq!(sm.vpn_id, Some(internal));
    assert_eq!(sm.router_interface.map(|ri| ri.port_id), Some(rp.id));
    assert!(sm.port_list.contains(&rp.id));

    let iface = interface(&tb, rp.id).await.expect("Router port should have a VPN interface");
    assert!(iface.is_member_of(internal));
    assert_eq!(
        tb.engine
            .interfaces()
            .router_interfaces(r1.id)
            .await
            .expect("Should succeed"),
        BTreeSet::from([rp.id])
    );
    let instance = tb
        .engine
        .vpns()
        .get_instance(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN should exist");
    assert_eq!(instance.address_family(), AddressFamily::V4);
}

#[tokio::test]
#[traced_test]
async fn external_network_vpn_becomes_internet_vpn_of_ipv6_subnets() {
    let tb = TestBed::new().await;
    let n1 = external_network("ext-c");
    let ext_sub = subnet(&n1, "ext-subnet-c", "172.16.0.0/24");
    tb.engine.network_events().added(n1.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(ext_sub.clone());
    tb.settle().await;

    let r2 = with_gateway(&router("router-c"), &n1, &[(&ext_sub, "172.16.0.2")]);
    tb.engine.router_events().added(r2.clone());
    let net = network("net-c");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    let s3 = subnet(&net, "subnet-c", "2001:db8:c::/64");
    tb.engine.subnet_events().added(s3.clone());
    tb.settle().await;
    let rp = router_port(&r2, &net, &s3);
    tb.engine.port_events().added(rp.clone());
    tb.settle().await;
    assert_eq!(subnetmap(&tb, s3.id).await.internet_vpn_id, None);
    assert!(tb.fib.flows().is_empty());

    let vi1 = l3vpn("vpn-c", "100:3");
    let request = model::neutron::L3vpnRequest {
        network_ids: vec![n1.id],
        ..vi1.clone()
    };
    tb.engine
        .l3vpn()
        .create_l3vpn(vec![request])
        .await
        .expect("Should succeed");
    tb.settle().await;

    let sm = subnetmap(&tb, s3.id).await;
    assert_eq!(sm.vpn_id, Some(r2.id.retag()));
    assert_eq!(sm.internet_vpn_id, Some(vi1.id));

    let instance = tb
        .engine
        .vpns()
        .get_instance(vi1.id)
        .await
        .expect("Should succeed")
        .expect("VPN should exist");
    assert!(instance.is_internet());
    assert_eq!(instance.address_family(), AddressFamily::V6);

    let tag = instance.vpn_tag.expect("VPN should have a tag");
    let expected: Vec<FallbackFlow> = TEST_DPNS
        .iter()
        .map(|dpn| FallbackFlow {
            dpn: *dpn,
            router: r2.id,
            internet_vpn_tag: tag,
            add: true,
        })
        .collect();
    assert_eq!(tb.fib.flows(), expected);

    let iface = interface(&tb, rp.id).await.expect("Router port should have a VPN interface");
    assert_eq!(
        iface.memberships.get(&vi1.id),
        Some(&AssociatedSubnetType::V6Subnet)
    );
    let external = tb
        .engine
        .orchestrator()
        .external_network(n1.id)
        .await
        .expect("Should succeed")
        .expect("External network should exist");
    assert_eq!(external.vpn_id, Some(vi1.id));
    assert!(external.router_ids.contains(&r2.id));
}

#[tokio::test]
async fn direct_ports_are_tracked_without_interface() {
    let tb = TestBed::new().await;
    let net = network("net-d");
    let s1 = subnet(&net, "subnet-d", "10.4.0.0/24");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(s1.clone());
    tb.settle().await;
    let v1 = l3vpn("vpn-d", "100:4");
    tb.engine
        .l3vpn()
        .create_l3vpn(vec![model::neutron::L3vpnRequest {
            network_ids: vec![net.id],
            ..v1
        }])
        .await
        .expect("Should succeed");

    let sriov = direct_port("port-d", &net, &[(&s1, "10.4.0.7")]);
    tb.engine.port_events().added(sriov.clone());
    tb.settle().await;

    let sm = subnetmap(&tb, s1.id).await;
    assert!(sm.direct_port_list.contains(&sriov.id));
    assert!(!sm.port_list.contains(&sriov.id));
    assert_eq!(interface(&tb, sriov.id).await, None);
}

#[tokio::test]
async fn removing_router_port_returns_subnet_to_network_vpn() {
    let tb = TestBed::new().await;
    let r1 = router("router-e");
    let net = network("net-e");
    let s1 = subnet(&net, "subnet-e", "10.5.0.0/24");
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(s1.clone());
    tb.settle().await;
    let rp = router_port(&r1, &net, &s1);
    let vm = port("port-e", &net, &[(&s1, "10.5.0.9")]);
    tb.engine.port_events().added(rp.clone());
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;

    let internal: Id<Vpn> = r1.id.retag();
    assert!(
        interface(&tb, vm.id)
            .await
            .expect("Port should have a VPN interface")
            .is_member_of(internal)
    );

    tb.engine.port_events().removed(rp.clone());
    tb.settle().await;

    let sm = subnetmap(&tb, s1.id).await;
    assert_eq!(sm.router_id, None);
    assert_eq!(sm.router_interface, None);
    assert_eq!(sm.vpn_id, None);
    assert_eq!(interface(&tb, vm.id).await, None);
    assert_eq!(interface(&tb, rp.id).await, None);
    let instance = tb
        .engine
        .vpns()
        .get_instance(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN should exist");
    assert_eq!(instance.address_family(), AddressFamily::empty());
}
