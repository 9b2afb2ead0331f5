// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! The engine: wiring of the managers, the event streams and the job queue

use crate::collab::{Collaborators, ELAN_TAG_POOL, VPN_TAG_POOL};
use crate::context::Shared;
use crate::listener::{
    FloatingIpListener, NetworkListener, PortListener, ResourceStream, RouterListener,
    SubnetListener,
};
use crate::{
    EngineConfig, EngineError, EngineResult, FloatingIpSynchronizer, L3vpnService, NeutronCache,
    PendingAssociationCache, RouterAssociationOrchestrator, SubnetAssociationManager,
    VpnInterfaceSynchronizer, VpnLifecycleManager,
};
use id::Id;
use model::aggregates::{
    ExternalNetwork, ExternalSubnet, FloatingIpPortInfo, NatRouter, PendingPortAssociation,
    PortIpMapping, RouterInterfacesMap, RouterPorts, SubnetMap, VpnInstance, VpnInterface, VpnMap,
};
use model::IpFamily;
use model::neutron::{FloatingIp, Network, Port, Router, Subnet, Vpn};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use store::{Datastore, Record};
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("engine", LevelFilter::INFO, &["vpnsync"]);

/// The managers, as handed to event listeners and jobs
#[derive(Clone)]
pub(crate) struct Managers {
    pub(crate) shared: Arc<Shared>,
    pub(crate) subnets: SubnetAssociationManager,
    pub(crate) vpns: VpnLifecycleManager,
    pub(crate) interfaces: VpnInterfaceSynchronizer,
    pub(crate) orchestrator: RouterAssociationOrchestrator,
    pub(crate) floating_ips: FloatingIpSynchronizer,
}

impl Managers {
    fn new(shared: Arc<Shared>) -> Self {
        let subnets = SubnetAssociationManager::new(shared.clone());
        let vpns = VpnLifecycleManager::new(shared.clone());
        let interfaces = VpnInterfaceSynchronizer::new(shared.clone());
        let orchestrator = RouterAssociationOrchestrator::new(
            shared.clone(),
            subnets.clone(),
            vpns.clone(),
            interfaces.clone(),
        );
        let floating_ips = FloatingIpSynchronizer::new(shared.clone());
        Self {
            shared,
            subnets,
            vpns,
            interfaces,
            orchestrator,
            floating_ips,
        }
    }
}

/// What [`Engine::resync`] did
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResyncReport {
    /// Pending associations reloaded from the operational store
    pub pending_restored: usize,
    /// Pending associations whose subnet exists, applied right away
    pub pending_applied: usize,
    pub ports_synced: usize,
    /// Ports of bound subnets missing from the Neutron cache
    pub ports_unknown: usize,
    /// Router interfaces whose subnet did not record them
    pub routers_rebound: usize,
    /// VPNs whose address family did not match their bound subnets
    pub vpns_recounted: usize,
}

/// Every aggregate of the datastore, in key order
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Snapshot {
    pub subnetmaps: Vec<SubnetMap>,
    pub vpn_instances: Vec<VpnInstance>,
    pub vpn_maps: Vec<VpnMap>,
    pub vpn_interfaces: Vec<VpnInterface>,
    pub port_ips: Vec<PortIpMapping>,
    pub router_interfaces: Vec<RouterInterfacesMap>,
    pub nat_routers: Vec<NatRouter>,
    pub external_networks: Vec<ExternalNetwork>,
    pub external_subnets: Vec<ExternalSubnet>,
    pub floating_ip_ports: Vec<FloatingIpPortInfo>,
    pub router_ports: Vec<RouterPorts>,
    pub pending_ports: Vec<PendingPortAssociation>,
}

pub struct Engine {
    managers: Managers,
    l3vpn: L3vpnService,
    networks: ResourceStream<Network>,
    subnet_events: ResourceStream<Subnet>,
    ports: ResourceStream<Port>,
    routers: ResourceStream<Router>,
    floating_ip_events: ResourceStream<FloatingIp>,
}

impl Engine {
    /// Create an engine with an empty Neutron cache
    pub async fn new(
        store: Arc<dyn Datastore>,
        collab: Collaborators,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        Self::with_cache(store, collab, NeutronCache::default(), config).await
    }

    /// Create an engine. The tag pools are created and the event streams spawned.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub async fn with_cache(
        store: Arc<dyn Datastore>,
        collab: Collaborators,
        cache: NeutronCache,
        config: EngineConfig,
    ) -> EngineResult<Self> {
        let (low, high) = config.vpn_tag_range;
        collab.allocator.create_pool(VPN_TAG_POOL, low, high).await?;
        let (low, high) = config.elan_tag_range;
        collab.allocator.create_pool(ELAN_TAG_POOL, low, high).await?;
        info!("Starting engine: {config}");

        let shared = Arc::new(Shared::new(store, collab, cache, config));
        let managers = Managers::new(shared);
        let l3vpn = L3vpnService::new(managers.vpns.clone(), managers.orchestrator.clone());
        Ok(Self {
            networks: ResourceStream::spawn(Arc::new(NetworkListener::new(managers.clone()))),
            subnet_events: ResourceStream::spawn(Arc::new(SubnetListener::new(managers.clone()))),
            ports: ResourceStream::spawn(Arc::new(PortListener::new(managers.clone()))),
            routers: ResourceStream::spawn(Arc::new(RouterListener::new(managers.clone()))),
            floating_ip_events: ResourceStream::spawn(Arc::new(FloatingIpListener::new(
                managers.clone(),
            ))),
            managers,
            l3vpn,
        })
    }

    pub fn network_events(&self) -> &ResourceStream<Network> {
        &self.networks
    }
    pub fn subnet_events(&self) -> &ResourceStream<Subnet> {
        &self.subnet_events
    }
    pub fn port_events(&self) -> &ResourceStream<Port> {
        &self.ports
    }
    pub fn router_events(&self) -> &ResourceStream<Router> {
        &self.routers
    }
    pub fn floating_ip_events(&self) -> &ResourceStream<FloatingIp> {
        &self.floating_ip_events
    }

    pub fn subnets(&self) -> &SubnetAssociationManager {
        &self.managers.subnets
    }
    pub fn vpns(&self) -> &VpnLifecycleManager {
        &self.managers.vpns
    }
    pub fn interfaces(&self) -> &VpnInterfaceSynchronizer {
        &self.managers.interfaces
    }
    pub fn orchestrator(&self) -> &RouterAssociationOrchestrator {
        &self.managers.orchestrator
    }
    pub fn floating_ips(&self) -> &FloatingIpSynchronizer {
        &self.managers.floating_ips
    }
    pub fn l3vpn(&self) -> &L3vpnService {
        &self.l3vpn
    }
    pub fn cache(&self) -> &NeutronCache {
        &self.managers.shared.cache
    }
    pub fn pending(&self) -> &PendingAssociationCache {
        &self.managers.shared.pending
    }
    pub fn store(&self) -> &Arc<dyn Datastore> {
        &self.managers.shared.store
    }
    pub fn config(&self) -> &EngineConfig {
        &self.managers.shared.config
    }

    pub async fn snapshot(&self) -> EngineResult<Snapshot> {
        let store = self.managers.shared.store.as_ref();
        Ok(Snapshot {
            subnetmaps: store.read_all().await?,
            vpn_instances: store.read_all().await?,
            vpn_maps: store.read_all().await?,
            vpn_interfaces: store.read_all().await?,
            port_ips: store.read_all().await?,
            router_interfaces: store.read_all().await?,
            nat_routers: store.read_all().await?,
            external_networks: store.read_all().await?,
            external_subnets: store.read_all().await?,
            floating_ip_ports: store.read_all().await?,
            router_ports: store.read_all().await?,
            pending_ports: store.read_all().await?,
        })
    }

    fn busy(&self) -> usize {
        self.networks.outstanding()
            + self.subnet_events.outstanding()
            + self.ports.outstanding()
            + self.routers.outstanding()
            + self.floating_ip_events.outstanding()
            + self.managers.shared.jobs.outstanding()
    }

    /// Wait until every delivered change has been handled and every job it caused has
    /// finished, including jobs queued by other jobs
    pub async fn settle(&self) {
        loop {
            self.networks.wait_idle().await;
            self.subnet_events.wait_idle().await;
            self.ports.wait_idle().await;
            self.routers.wait_idle().await;
            self.floating_ip_events.wait_idle().await;
            self.managers.shared.jobs.wait_idle().await;
            if self.busy() == 0 {
                return;
            }
        }
    }

    /// Converge after a restart or an interrupted flow: reload the pending associations
    /// persisted in the operational store, record the router interfaces of existing subnets,
    /// re-derive the VPN interfaces of the ports of every VPN-bound subnet and of every port
    /// that has one, then recount the address families of the VPNs.
    /// The Neutron cache is expected to be populated.
    pub async fn resync(&self) -> EngineResult<ResyncReport> {
        let shared = &self.managers.shared;
        let store = shared.store.as_ref();
        let mut report = ResyncReport::default();

        for entry in store.read_all::<PendingPortAssociation>().await? {
            if self.managers.subnets.get(entry.subnet_id).await?.is_some() {
                let (port, direct) = if entry.direct {
                    (None, Some(entry.port_id))
                } else {
                    (Some(entry.port_id), None)
                };
                self.managers
                    .subnets
                    .attach_port(entry.subnet_id, port, direct)
                    .await?;
                store.delete::<PendingPortAssociation>(&entry.key()).await?;
                report.pending_applied += 1;
            } else if !shared.pending.is_pending(entry.subnet_id, entry.port_id) {
                shared.pending.restore([entry]);
                report.pending_restored += 1;
            }
        }

        report.routers_rebound = self.rebind_router_interfaces().await?;

        let mut visited = BTreeSet::new();
        let subnetmaps = store.read_all::<SubnetMap>().await?;
        for subnetmap in subnetmaps.iter().filter(|sm| sm.vpn_id.is_some()) {
            let router_port = subnetmap.router_interface.map(|ri| ri.port_id);
            let ports = router_port
                .into_iter()
                .chain(subnetmap.port_list.iter().copied().filter(|p| Some(*p) != router_port));
            for port_id in ports {
                if !visited.insert(port_id) {
                    continue;
                }
                match shared.cache.ports.get(port_id) {
                    Some(port) => {
                        self.managers.interfaces.reconcile_port(&port).await?;
                        report.ports_synced += 1;
                    }
                    None => {
                        debug!("Port {port_id} of subnet {} is not known", subnetmap.subnet_id);
                        report.ports_unknown += 1;
                    }
                }
            }
        }
        // interfaces left behind in VPNs their subnets no longer belong to
        for iface in store.read_all::<VpnInterface>().await? {
            if !visited.insert(iface.port_id) {
                continue;
            }
            match shared.cache.ports.get(iface.port_id) {
                Some(port) => {
                    self.managers.interfaces.reconcile_port(&port).await?;
                    report.ports_synced += 1;
                }
                None => report.ports_unknown += 1,
            }
        }

        let mut refs: BTreeMap<Id<Vpn>, Vec<(IpFamily, Id<Subnet>)>> = BTreeMap::new();
        for sm in &subnetmaps {
            if let Some(vpn_id) = sm.vpn_id {
                refs.entry(vpn_id).or_default().push((sm.family(), sm.subnet_id));
            }
            if let Some(internet) = sm.internet_vpn_id {
                refs.entry(internet).or_default().push((IpFamily::V6, sm.subnet_id));
            }
        }
        for instance in self.managers.vpns.instances().await? {
            let counted = refs.remove(&instance.vpn_id).unwrap_or_default();
            if self
                .managers
                .vpns
                .recount_address_family(instance.vpn_id, counted)
                .await?
            {
                report.vpns_recounted += 1;
            }
        }
        info!("Resync done: {report:?}");
        Ok(report)
    }

    /// Record the router interfaces known to the Neutron cache on their subnets, when the
    /// subnet aggregate exists but does not list them. Returns how many were recorded.
    async fn rebind_router_interfaces(&self) -> EngineResult<usize> {
        let m = &self.managers;
        let mut rebound = 0;
        for port in m.shared.cache.ports.find(Port::is_router_interface) {
            let Some(router) = port
                .device::<Router>()
                .and_then(|id| m.shared.cache.routers.get(id))
            else {
                debug!("Router of interface {} is not known", port.id);
                continue;
            };
            for subnet_id in port.subnets() {
                let Some(subnetmap) = m.subnets.get(subnet_id).await? else {
                    continue;
                };
                if subnetmap.router_interface.map(|ri| ri.port_id) == Some(port.id) {
                    continue;
                }
                m.subnets.attach_port(subnet_id, Some(port.id), None).await?;
                match m
                    .orchestrator
                    .add_subnet_to_router(&router, &port, subnet_id)
                    .await
                {
                    Ok(()) => rebound += 1,
                    Err(EngineError::Conflict(reason)) => {
                        warn!("Not routing subnet {subnet_id} through router {}: {reason}", router.id);
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        Ok(rebound)
    }
}

#[cfg(test)]
mod tests {
    use crate::testing::TestBed;
    use crate::testing::fixtures::{network, subnet};
    use crate::{EngineConfigBuilder, EngineError, LockKey};
    use model::aggregates::VpnBinding;
    use std::time::Duration;

    #[tokio::test]
    async fn bounded_lock_timeout_is_returned() {
        let config = EngineConfigBuilder::default()
            .lock_timeout(Duration::from_millis(20))
            .build()
            .expect("Should succeed");
        let tb = TestBed::with_config(config).await;
        let net = network("net-lock");
        let sub = subnet(&net, "sub-lock", "10.9.0.0/24");
        tb.engine.network_events().added(net);
        tb.engine.subnet_events().added(sub.clone());
        tb.settle().await;

        let shared = &tb.engine.managers.shared;
        let guard = shared
            .lock(LockKey::Subnet(sub.id))
            .await
            .expect("Should succeed");
        let err = tb
            .engine
            .subnets()
            .bind_vpn(sub.id, VpnBinding::vpn(id::Id::from_name("vpn-lock")))
            .await
            .expect_err("Should time out");
        assert!(matches!(err, EngineError::LockTimeout(_)));
        drop(guard);

        let bound = tb
            .engine
            .subnets()
            .bind_vpn(sub.id, VpnBinding::vpn(id::Id::from_name("vpn-lock")))
            .await
            .expect("Should succeed");
        assert_eq!(bound.vpn_id, Some(id::Id::from_name("vpn-lock")));
    }

    #[tokio::test]
    async fn job_hitting_a_held_lock_is_retried() {
        let config = EngineConfigBuilder::default()
            .lock_timeout(Duration::from_millis(20))
            .build()
            .expect("Should succeed");
        let tb = TestBed::with_config(config).await;
        let net = network("net-retry");
        let sub = subnet(&net, "sub-retry", "10.9.1.0/24");
        tb.engine.network_events().added(net);
        tb.settle().await;

        let guard = tb
            .engine
            .managers
            .shared
            .lock(LockKey::Subnet(sub.id))
            .await
            .expect("Should succeed");
        tb.engine.subnet_events().added(sub.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(guard);
        tb.settle().await;

        assert!(
            tb.engine
                .subnets()
                .get(sub.id)
                .await
                .expect("Should succeed")
                .is_some()
        );
    }
}
