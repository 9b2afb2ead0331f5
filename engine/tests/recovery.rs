// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use vpnsync_engine as engine;

use engine::testing::TestBed;
use engine::testing::fixtures::{l3vpn, network, port, router, router_port, subnet};
use engine::{EngineConfig, EngineConfigBuilder, EngineError, NeutronCache, ResyncReport};
use id::Id;
use model::aggregates::{SubnetMap, VpnBinding, VpnInterface};
use model::neutron::{L3vpnRequest, Port, Router, Subnet, Vpn};
use model::{AddressFamily, IpFamily};
use pretty_assertions::assert_eq;
use std::time::Duration;
use store::LogicalStore;
use tracing_test::traced_test;

async fn subnetmap(tb: &TestBed, id: Id<Subnet>) -> Option<SubnetMap> {
    tb.engine.subnets().get(id).await.expect("Should succeed")
}

async fn vpn_of(tb: &TestBed, id: Id<Subnet>) -> Option<Id<Vpn>> {
    subnetmap(tb, id).await.and_then(|s| s.vpn_id)
}

fn fast_retries() -> EngineConfig {
    EngineConfigBuilder::default()
        .retry_backoff(Duration::from_millis(5))
        .build()
        .expect("Should succeed")
}

#[tokio::test]
#[traced_test]
async fn job_is_retried_after_transient_store_failure() {
    let tb = TestBed::with_config(fast_retries()).await;
    let net = network("retry-net");
    let sub = subnet(&net, "retry-subnet", "10.10.0.0/24");
    tb.engine.network_events().added(net);
    tb.settle().await;

    tb.store.fail_next_commits(1);
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;

    assert!(subnetmap(&tb, sub.id).await.is_some());
    assert_eq!(tb.store.writes("subnetmaps"), 1);
}

#[tokio::test]
async fn replaying_an_abandoned_change_converges() {
    let tb = TestBed::with_config(fast_retries()).await;
    let net = network("abandon-net");
    let sub = subnet(&net, "abandon-subnet", "10.11.0.0/24");
    tb.engine.network_events().added(net);
    tb.settle().await;

    // more failures than attempts
    tb.store.fail_next_commits(10);
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    assert_eq!(subnetmap(&tb, sub.id).await, None);

    tb.store.fail_next_commits(0);
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    assert!(subnetmap(&tb, sub.id).await.is_some());
}

#[tokio::test]
async fn port_waits_for_its_subnet() {
    let tb = TestBed::new().await;
    let net = network("pending-net");
    let sub = subnet(&net, "pending-subnet", "10.12.0.0/24");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;

    let vm = port("pending-vm", &net, &[(&sub, "10.12.0.5")]);
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;
    assert!(tb.engine.pending().is_pending(sub.id, vm.id));
    assert_eq!(tb.store.count(LogicalStore::Operational, "pending-ports"), 1);

    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    let sm = subnetmap(&tb, sub.id).await.expect("Subnet aggregate should exist");
    assert!(sm.port_list.contains(&vm.id));
    assert!(tb.engine.pending().is_empty());
    assert_eq!(tb.store.count(LogicalStore::Operational, "pending-ports"), 0);
}

#[tokio::test]
async fn port_removed_before_its_subnet_is_forgotten() {
    let config = EngineConfigBuilder::default()
        .pending_cache_persist(false)
        .build()
        .expect("Should succeed");
    let tb = TestBed::with_config(config).await;
    let net = network("forget-net");
    let sub = subnet(&net, "forget-subnet", "10.13.0.0/24");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;

    let vm = port("forget-vm", &net, &[(&sub, "10.13.0.5")]);
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;
    assert!(tb.engine.pending().is_pending(sub.id, vm.id));
    assert_eq!(tb.store.count(LogicalStore::Operational, "pending-ports"), 0);

    tb.engine.port_events().removed(vm.clone());
    tb.settle().await;
    assert!(!tb.engine.pending().is_pending(sub.id, vm.id));

    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    let sm = subnetmap(&tb, sub.id).await.expect("Subnet aggregate should exist");
    assert!(sm.port_list.is_empty());
}

#[tokio::test]
#[traced_test]
async fn restart_restores_pending_ports_and_interfaces() {
    let tb = TestBed::new().await;
    let net = network("restart-net");
    let sub = subnet(&net, "restart-subnet", "10.14.0.0/24");
    let later = subnet(&net, "restart-later", "10.15.0.0/24");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    let v1 = l3vpn("restart-vpn", "100:51");
    tb.engine
        .l3vpn()
        .create_l3vpn(vec![L3vpnRequest {
            network_ids: vec![net.id],
            ..v1.clone()
        }])
        .await
        .expect("Should succeed");
    let vm = port("restart-vm", &net, &[(&sub, "10.14.0.5")]);
    let waiting = port("restart-waiting", &net, &[(&later, "10.15.0.5")]);
    tb.engine.port_events().added(vm.clone());
    tb.engine.port_events().added(waiting.clone());
    tb.settle().await;
    assert!(tb.engine.pending().is_pending(later.id, waiting.id));

    // lose the interface, then restart with what Neutron knows
    tb.engine
        .store()
        .delete::<VpnInterface>(&vm.id)
        .await
        .expect("Should succeed");
    let cache = NeutronCache::default();
    cache.networks.upsert(&net);
    cache.subnets.upsert(&sub);
    cache.ports.upsert(&vm);
    cache.ports.upsert(&waiting);
    let restarted = tb.restart(cache, EngineConfig::default()).await;
    assert!(restarted.engine.pending().is_empty());

    let report = restarted.engine.resync().await.expect("Should succeed");
    assert_eq!(
        report,
        ResyncReport {
            pending_restored: 1,
            pending_applied: 0,
            ports_synced: 1,
            ports_unknown: 0,
            routers_rebound: 0,
            vpns_recounted: 0,
        }
    );
    assert!(restarted.engine.pending().is_pending(later.id, waiting.id));
    let iface = restarted
        .engine
        .interfaces()
        .get(vm.id)
        .await
        .expect("Should succeed")
        .expect("Interface should be restored");
    assert!(iface.is_member_of(v1.id));

    restarted.engine.subnet_events().added(later.clone());
    restarted.settle().await;
    let sm = subnetmap(&restarted, later.id)
        .await
        .expect("Subnet aggregate should exist");
    assert!(sm.port_list.contains(&waiting.id));
    assert_eq!(sm.vpn_id, Some(v1.id));
    assert_eq!(
        restarted.store.count(LogicalStore::Operational, "pending-ports"),
        0
    );
}

#[tokio::test]
async fn failed_vpn_deletion_resumes_on_retry() {
    let tb = TestBed::new().await;
    let r1 = router("cascade-router");
    let routed_net = network("cascade-routed");
    let routed_sub = subnet(&routed_net, "cascade-routed-subnet", "10.16.0.0/24");
    let net = network("cascade-net");
    let sub = subnet(&net, "cascade-subnet", "10.17.0.0/24");
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(routed_net.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(routed_sub.clone());
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    tb.engine
        .port_events()
        .added(router_port(&r1, &routed_net, &routed_sub));
    let vm = port("cascade-vm", &net, &[(&sub, "10.17.0.5")]);
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;

    let v1 = l3vpn("cascade-vpn", "100:61");
    tb.engine
        .l3vpn()
        .create_l3vpn(vec![L3vpnRequest {
            router_ids: vec![r1.id],
            network_ids: vec![net.id],
            ..v1.clone()
        }])
        .await
        .expect("Should succeed");
    tb.settle().await;
    let internal: Id<Vpn> = r1.id.retag();
    assert_eq!(
        vpn_of(&tb, routed_sub.id).await,
        Some(v1.id)
    );
    assert_eq!(vpn_of(&tb, sub.id).await, Some(v1.id));

    tb.store.fail_next_commits(1);
    let failed = tb.engine.l3vpn().delete_l3vpn(vec![v1.id]).await;
    assert_eq!(failed, Err(EngineError::BatchFailed(1)));
    tb.settle().await;
    let map = tb
        .engine
        .vpns()
        .get_map(v1.id)
        .await
        .expect("Should succeed")
        .expect("VPN map should be kept");
    assert!(map.router_ids.contains(&r1.id));
    assert!(map.network_ids.contains(&net.id));

    let report = tb
        .engine
        .l3vpn()
        .delete_l3vpn(vec![v1.id])
        .await
        .expect("Should succeed");
    assert!(report.is_success());
    tb.settle().await;

    let vpns = tb.engine.vpns();
    assert_eq!(vpns.get_instance(v1.id).await.expect("Should succeed"), None);
    assert_eq!(vpns.get_map(v1.id).await.expect("Should succeed"), None);
    assert_eq!(
        vpn_of(&tb, routed_sub.id).await,
        Some(internal)
    );
    assert_eq!(vpn_of(&tb, sub.id).await, None);
    assert_eq!(
        tb.engine.interfaces().get(vm.id).await.expect("Should succeed"),
        None
    );
    let internal_map = vpns
        .get_map(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN map should exist");
    assert!(internal_map.router_ids.contains(&r1.id));

    assert_eq!(
        tb.engine.l3vpn().delete_l3vpn(vec![v1.id]).await,
        Err(EngineError::BatchFailed(1))
    );
}

#[tokio::test]
async fn failed_deferral_leaves_no_pending_port() {
    let config = EngineConfigBuilder::default()
        .max_job_retries(0_u32)
        .build()
        .expect("Should succeed");
    let tb = TestBed::with_config(config).await;
    let net = network("deferral-net");
    let sub = subnet(&net, "deferral-subnet", "10.19.0.0/24");
    tb.engine.network_events().added(net.clone());
    tb.settle().await;

    tb.store.fail_next_commits(1);
    let vm = port("deferral-vm", &net, &[(&sub, "10.19.0.5")]);
    tb.engine.port_events().added(vm.clone());
    tb.settle().await;
    assert!(!tb.engine.pending().is_pending(sub.id, vm.id));
    assert_eq!(tb.store.count(LogicalStore::Operational, "pending-ports"), 0);

    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    let sm = subnetmap(&tb, sub.id).await.expect("Subnet aggregate should exist");
    assert!(sm.port_list.is_empty());
}

/// A router in `vpn`, routing one subnet through `router port`
async fn router_in_vpn(tb: &TestBed, name: &str, cidr: &str, rd: &str) -> (Router, Subnet, Port, L3vpnRequest) {
    let r1 = router(&format!("{name}-router"));
    let net = network(&format!("{name}-net"));
    let sub = subnet(&net, &format!("{name}-subnet"), cidr);
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;
    let rp = router_port(&r1, &net, &sub);
    tb.engine.port_events().added(rp.clone());
    tb.settle().await;

    let v1 = l3vpn(&format!("{name}-vpn"), rd);
    tb.engine
        .l3vpn()
        .create_l3vpn(vec![L3vpnRequest {
            router_ids: vec![r1.id],
            ..v1.clone()
        }])
        .await
        .expect("Should succeed");
    tb.settle().await;
    assert_eq!(vpn_of(tb, sub.id).await, Some(v1.id));
    (r1, sub, rp, v1)
}

async fn memberships(tb: &TestBed, port_id: Id<Port>) -> Vec<Id<Vpn>> {
    tb.engine
        .interfaces()
        .get(port_id)
        .await
        .expect("Should succeed")
        .map(|iface| iface.memberships.into_keys().collect())
        .unwrap_or_default()
}

#[tokio::test]
#[traced_test]
async fn interrupted_router_dissociation_is_resumed() {
    let tb = TestBed::new().await;
    let (r1, sub, rp, v1) = router_in_vpn(&tb, "resume", "10.20.0.0/24", "100:71").await;
    let internal: Id<Vpn> = r1.id.retag();

    // the subnet is rebound to the internal VPN, then the next commit fails
    tb.store.fail_commits_after(1, 1);
    let failed = tb.engine.l3vpn().delete_l3vpn(vec![v1.id]).await;
    assert_eq!(failed, Err(EngineError::BatchFailed(1)));
    tb.settle().await;
    assert_eq!(vpn_of(&tb, sub.id).await, Some(internal));
    assert_eq!(memberships(&tb, rp.id).await, vec![v1.id]);

    let report = tb
        .engine
        .l3vpn()
        .delete_l3vpn(vec![v1.id])
        .await
        .expect("Should succeed");
    assert!(report.is_success());
    tb.settle().await;

    assert_eq!(memberships(&tb, rp.id).await, vec![internal]);
    let vpns = tb.engine.vpns();
    assert_eq!(vpns.get_instance(v1.id).await.expect("Should succeed"), None);
    let instance = vpns
        .get_instance(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN should exist");
    assert_eq!(instance.family_refs(IpFamily::V4), 1);
    assert_eq!(instance.address_family(), AddressFamily::V4);
}

#[tokio::test]
async fn resync_drops_memberships_of_a_deleted_vpn() {
    let tb = TestBed::new().await;
    let (r1, sub, rp, v1) = router_in_vpn(&tb, "stale", "10.21.0.0/24", "100:72").await;
    let internal: Id<Vpn> = r1.id.retag();

    // cut short right after the router left the VPN map and the subnet was rebound
    tb.engine
        .vpns()
        .dissociate_router(v1.id, r1.id)
        .await
        .expect("Should succeed");
    tb.engine
        .subnets()
        .bind_vpn(sub.id, VpnBinding::vpn(internal))
        .await
        .expect("Should succeed");
    let report = tb
        .engine
        .l3vpn()
        .delete_l3vpn(vec![v1.id])
        .await
        .expect("Should succeed");
    assert!(report.is_success());
    assert_eq!(memberships(&tb, rp.id).await, vec![v1.id]);

    let report = tb.engine.resync().await.expect("Should succeed");
    assert_eq!(
        report,
        ResyncReport {
            pending_restored: 0,
            pending_applied: 0,
            ports_synced: 1,
            ports_unknown: 0,
            routers_rebound: 0,
            vpns_recounted: 1,
        }
    );
    assert_eq!(memberships(&tb, rp.id).await, vec![internal]);
    let instance = tb
        .engine
        .vpns()
        .get_instance(internal)
        .await
        .expect("Should succeed")
        .expect("Internal VPN should exist");
    assert_eq!(instance.address_family(), AddressFamily::V4);

    // converged: nothing left to do
    let writes = tb.store.total_writes();
    let report = tb.engine.resync().await.expect("Should succeed");
    assert_eq!(report.vpns_recounted, 0);
    assert_eq!(tb.store.total_writes(), writes);
}

#[tokio::test]
async fn resync_records_router_interfaces_missed_before_restart() {
    let tb = TestBed::new().await;
    let r1 = router("missed-router");
    let net = network("missed-net");
    let sub = subnet(&net, "missed-subnet", "10.22.0.0/24");
    tb.engine.router_events().added(r1.clone());
    tb.engine.network_events().added(net.clone());
    tb.settle().await;
    tb.engine.subnet_events().added(sub.clone());
    tb.settle().await;

    // the router port is known to Neutron, but its event never reached the engine
    let rp = router_port(&r1, &net, &sub);
    let cache = NeutronCache::default();
    cache.routers.upsert(&r1);
    cache.networks.upsert(&net);
    cache.subnets.upsert(&sub);
    cache.ports.upsert(&rp);
    let restarted = tb.restart(cache, EngineConfig::default()).await;

    let report = restarted.engine.resync().await.expect("Should succeed");
    assert_eq!(report.routers_rebound, 1);
    assert_eq!(report.ports_synced, 1);
    let sm = subnetmap(&restarted, sub.id)
        .await
        .expect("Subnet aggregate should exist");
    let internal: Id<Vpn> = r1.id.retag();
    assert_eq!(sm.router_id, Some(r1.id));
    assert_eq!(sm.vpn_id, Some(internal));
    assert_eq!(sm.router_interface.map(|ri| ri.port_id), Some(rp.id));
    assert_eq!(memberships(&restarted, rp.id).await, vec![internal]);
}
