// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use vpnsync_engine as engine;

use engine::testing::TestBed;
use engine::testing::fixtures::{
    ip, l3vpn, network, port, prefix, router, router_port, subnet, with_routes,
};
use engine::{EngineError, EngineResult};
use id::Id;
use model::aggregates::{AdjacencyType, SubnetMap, VpnInstance};
use model::{AddressFamily, IpFamily};
use model::neutron::{L3vpnRequest, Network, Port, Router, Subnet, Vpn};
use pretty_assertions::assert_eq;

async fn subnetmap(tb: &TestBed, id: Id<Subnet>) -> SubnetMap {
    tb.engine
        .subnets()
        .get(id)
        .await
        .expect("Should succeed")
        .expect("Subnet aggregate should exist")
}

async fn instance(tb: &TestBed, id: Id<Vpn>) -> VpnInstance {
    tb.engine
        .vpns()
        .get_instance(id)
        .await
        .expect("Should succeed")
        .expect("VPN should exist")
}

struct Routed {
    router: Router,
    net: Network,
    sub: Subnet,
    router_port: Port,
    vm: Port,
}

/// A router routing one subnet, with one VM on the subnet
async fn routed(tb: &TestBed, name: &str, cidr: &str, vm_ip: &str) -> Routed {
    let router = router(&format!("{name}-router"));
    let net = network(&format!("{name}-net"));
    let sub = subnet(&net, &format!("{name}-subnet"), cidr);
    tb.engine.router_events().added(router.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    let rp = router_port(&router, &net, &sub);
    let vm = port(&format!("{name}-vm"), &net, &[(&sub, vm_ip)]);
    tb.engine.port_events().added(rp.clone());
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;
    Routed {
        router,
        net,
        sub,
        router_port: rp,
        vm,
    }
}

fn with_routers(request: &L3vpnRequest, routers: &[Id<Router>]) -> L3vpnRequest {
    L3vpnRequest {
        router_ids: routers.to_vec(),
        ..request.clone()
    }
}

#[tokio::test]
async fn replayed_events_change_nothing() {
    let tb = TestBed::new().await;
    let topo = routed(&tb, "replay", "10.1.0.0/24", "10.1.0.5").await;
    let before = tb.engine.snapshot().await.expect("Should succeed");
    let writes = tb.store.total_writes();
    assert!(!before.vpn_interfaces.is_empty());

    tb.engine.router_events().added(topo.router.clone());
    tb.engine.network_events().added(topo.net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(topo.sub.clone());
    tb.settle().await;
    tb.engine.port_events().added(topo.router_port.clone());
    tb.engine.port_events().added(topo.vm.clone());
    tb.settle().await;

    assert_eq!(tb.engine.snapshot().await.expect("Should succeed"), before);
    assert_eq!(tb.store.total_writes(), writes);
}

#[tokio::test]
async fn router_belongs_to_a_single_vpn() {
    let tb = TestBed::new().await;
    let topo = routed(&tb, "single", "10.2.0.0/24", "10.2.0.5").await;
    let l3vpn_service = tb.engine.l3vpn();

    let v1 = l3vpn("single-v1", "100:21");
    l3vpn_service
        .create_l3vpn(vec![with_routers(&v1, &[topo.router.id])])
        .await
        .expect("Should succeed");
    tb.settle().await;
    assert_eq!(subnetmap(&tb, topo.sub.id).await.vpn_id, Some(v1.id));
    let before = tb.engine.snapshot().await.expect("Should succeed");

    // creating another VPN with the same router is refused before anything is written
    let v2 = l3vpn("single-v2", "100:22");
    let refused = l3vpn_service
        .create_l3vpn(vec![with_routers(&v2, &[topo.router.id])])
        .await;
    assert_eq!(refused, Err(EngineError::BatchFailed(1)));
    assert_eq!(tb.engine.snapshot().await.expect("Should succeed"), before);

    // so is associating the router to a VPN that exists
    l3vpn_service
        .create_l3vpn(vec![v2.clone()])
        .await
        .expect("Should succeed");
    let before = tb.engine.snapshot().await.expect("Should succeed");
    let refused = l3vpn_service
        .associate_router(v2.id, vec![topo.router.id])
        .await;
    assert_eq!(refused, Err(EngineError::BatchFailed(1)));
    tb.settle().await;
    assert_eq!(tb.engine.snapshot().await.expect("Should succeed"), before);

    let v1_map = tb
        .engine
        .vpns()
        .get_map(v1.id)
        .await
        .expect("Should succeed")
        .expect("VPN map should exist");
    assert!(v1_map.router_ids.contains(&topo.router.id));
    let internal: Id<Vpn> = topo.router.id.retag();
    let internal_map = tb
        .engine
        .vpns()
        .get_map(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN map should exist");
    assert!(!internal_map.router_ids.contains(&topo.router.id));
}

#[tokio::test]
async fn vpn_internal_to_a_router_cannot_become_internet_vpn() {
    let tb = TestBed::new().await;
    let topo = routed(&tb, "internal", "10.3.0.0/24", "10.3.0.5").await;
    let internal: Id<Vpn> = topo.router.id.retag();
    let err = tb
        .engine
        .vpns()
        .set_internet(internal, true)
        .await
        .expect_err("Should be refused");
    assert!(matches!(err, EngineError::Conflict(_)));
    let instance = tb
        .engine
        .vpns()
        .get_instance(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN should exist");
    assert!(instance.is_internal());
}

#[tokio::test]
async fn extra_route_never_shadows_a_fixed_ip() {
    let tb = TestBed::new().await;
    let r1 = with_routes(
        &router("routes-router"),
        &[("10.6.0.5/32", "10.6.0.5"), ("192.168.0.0/24", "10.6.0.5")],
    );
    let net = network("routes-net");
    let sub = subnet(&net, "routes-subnet", "10.6.0.0/24");
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    tb.engine
        .port_events()
        .added(router_port(&r1, &net, &sub));
    tb.settle().await;
    let vm = port("routes-vm", &net, &[(&sub, "10.6.0.5")]);
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;

    let iface = tb
        .engine
        .interfaces()
        .get(vm.id)
        .await
        .expect("Should succeed")
        .expect("Port should have a VPN interface");
    let kinds: Vec<_> = iface
        .adjacencies
        .values()
        .map(|a| (a.ip_prefix, a.adjacency_type))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (prefix("10.6.0.5/32"), AdjacencyType::Primary),
            (prefix("192.168.0.0/24"), AdjacencyType::ExtraRoute),
        ]
    );
    let extra = &iface.adjacencies[&prefix("192.168.0.0/24")];
    assert!(extra.next_hops.contains(&ip("10.6.0.5")));

    // withdrawing the route drops its adjacency
    let plain = with_routes(&r1, &[("10.6.0.5/32", "10.6.0.5")]);
    tb.engine.router_events().updated(r1, plain);
    tb.settle().await;
    let iface = tb
        .engine
        .interfaces()
        .get(vm.id)
        .await
        .expect("Should succeed")
        .expect("Port should have a VPN interface");
    assert_eq!(iface.adjacencies.len(), 1);
    assert!(iface.adjacencies[&prefix("10.6.0.5/32")].is_primary());
}

#[tokio::test]
async fn l3vpn_batches_report_per_item() {
    let tb = TestBed::new().await;
    let service = tb.engine.l3vpn();
    let a = l3vpn("batch-a", "100:31");
    let b = l3vpn("batch-b", "100:31");
    let report = service
        .create_l3vpn(vec![a.clone(), b.clone()])
        .await
        .expect("Should succeed");
    assert_eq!(report.successes, vec![a.id.to_string()]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].0, b.id.to_string());
    assert!(matches!(report.failures[0].1, EngineError::Conflict(_)));

    let again: EngineResult<_> = service.create_l3vpn(vec![a.clone()]).await;
    assert_eq!(again, Err(EngineError::BatchFailed(1)));

    let no_rd = L3vpnRequest {
        route_distinguishers: vec![],
        ..l3vpn("batch-c", "100:32")
    };
    assert_eq!(
        service.create_l3vpn(vec![no_rd]).await,
        Err(EngineError::BatchFailed(1))
    );

    // internal VPNs are not listed
    tb.engine.router_events().added(router("batch-router"));
    tb.settle().await;
    let listed: Vec<Id<Vpn>> = service
        .get_l3vpn(None)
        .await
        .expect("Should succeed")
        .into_iter()
        .map(|v| v.instance.vpn_id)
        .collect();
    assert_eq!(listed, vec![a.id]);
    assert!(matches!(
        service.get_l3vpn(Some(b.id)).await,
        Err(EngineError::NotFound(_))
    ));
}

#[tokio::test]
async fn network_bound_elsewhere_is_not_associated() {
    let tb = TestBed::new().await;
    let topo = routed(&tb, "bound", "10.7.0.0/24", "10.7.0.5").await;
    let service = tb.engine.l3vpn();
    let v1 = l3vpn("bound-v1", "100:41");
    service
        .create_l3vpn(vec![v1.clone()])
        .await
        .expect("Should succeed");

    // the network's subnet is routed by a router
    let refused = service.associate_networks(v1.id, vec![topo.net.id]).await;
    assert_eq!(refused, Err(EngineError::BatchFailed(1)));
    assert_eq!(
        subnetmap(&tb, topo.sub.id).await.vpn_id,
        Some(topo.router.id.retag())
    );

    let other = network("bound-other");
    let other_sub = subnet(&other, "bound-other-subnet", "10.8.0.0/24");
    tb.engine.network_events().added(other.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(other_sub.clone());
    tb.settle().await;
    let report = service
        .associate_networks(v1.id, vec![topo.net.id, other.id])
        .await
        .expect("Should succeed");
    assert_eq!(report.successes, vec![other.id.to_string()]);
    assert_eq!(subnetmap(&tb, other_sub.id).await.vpn_id, Some(v1.id));

    let report = service
        .dissociate_networks(v1.id, vec![other.id])
        .await
        .expect("Should succeed");
    assert!(report.is_success());
    tb.settle().await;
    assert_eq!(subnetmap(&tb, other_sub.id).await.vpn_id, None);
    let map = tb
        .engine
        .vpns()
        .get_map(v1.id)
        .await
        .expect("Should succeed")
        .expect("VPN map should exist");
    assert!(map.network_ids.is_empty());
}

#[tokio::test]
async fn address_family_outlives_one_of_its_subnets() {
    let tb = TestBed::new().await;
    let net = network("family-net");
    let s1 = subnet(&net, "family-subnet-1", "2001:db8:f1::/64");
    let s2 = subnet(&net, "family-subnet-2", "2001:db8:f2::/64");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(s1.clone());
    tb.engine.subnet_events().added(s2.clone());
    tb.settle().await;
    let v1 = l3vpn("family-vpn", "100:81");
    tb.engine
        .l3vpn()
        .create_l3vpn(vec![L3vpnRequest {
            network_ids: vec![net.id],
            ..v1.clone()
        }])
        .await
        .expect("Should succeed");
    let vm = port(
        "family-vm",
        &net,
        &[(&s1, "2001:db8:f1::5"), (&s2, "2001:db8:f2::5")],
    );
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;

    assert_eq!(instance(&tb, v1.id).await.family_refs(IpFamily::V6), 2);

    tb.engine.subnet_events().removed(s1.clone());
    tb.settle().await;
    let vpn = instance(&tb, v1.id).await;
    assert_eq!(vpn.address_family(), AddressFamily::V6);
    assert_eq!(vpn.family_refs(IpFamily::V6), 1);
    let iface = tb
        .engine
        .interfaces()
        .get(vm.id)
        .await
        .expect("Should succeed")
        .expect("Interface should be kept");
    assert!(iface.is_member_of(v1.id));

    tb.engine.subnet_events().removed(s2.clone());
    tb.settle().await;
    assert_eq!(instance(&tb, v1.id).await.address_family(), AddressFamily::empty());
}
