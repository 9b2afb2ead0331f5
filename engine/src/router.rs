// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Flows spanning several aggregate families: router and network association to VPNs and
//! subnet moves between VPNs.
//!
//! The orchestrator holds no lock itself. Each step is a call into a manager, which locks what
//! it owns for the duration of the call. When a subnet changes VPN, its aggregate is updated
//! first, then the interface of the router port of the subnet, synchronously. The interfaces of
//! the other ports of the subnet are then updated by jobs queued under their port key.

use crate::context::Shared;
use crate::keys::job_key;
use crate::vpn::Dissociator;
use crate::{
    EngineError, EngineResult, SubnetAssociationManager, VpnInterfaceSynchronizer,
    VpnLifecycleManager,
};
use async_trait::async_trait;
use id::Id;
use model::IpFamily;
use model::aggregates::{RouterInterfaceInfo, SubnetMap, Unbind, VpnBinding};
use model::neutron::{Network, Port, Router, Subnet, Vpn};
use std::sync::Arc;
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("router", LevelFilter::INFO, &["router", "vpnsync"]);

/// Interface update of a port, queued under the port key
#[derive(Clone)]
enum PortJob {
    Move {
        interfaces: VpnInterfaceSynchronizer,
        shared: Arc<Shared>,
        port_id: Id<Port>,
        subnet_id: Id<Subnet>,
        old_vpns: Vec<Id<Vpn>>,
        purge_learnt: bool,
    },
    Withdraw {
        interfaces: VpnInterfaceSynchronizer,
        port_id: Id<Port>,
        vpn_id: Id<Vpn>,
        internet_vpn_id: Option<Id<Vpn>>,
        subnetmap: SubnetMap,
    },
}

impl PortJob {
    async fn run(self) -> EngineResult<()> {
        match self {
            PortJob::Move {
                interfaces,
                shared,
                port_id,
                subnet_id,
                old_vpns,
                purge_learnt,
            } => {
                let Some(port) = shared.cache.ports.get(port_id) else {
                    debug!("Port {port_id} is gone, nothing to move");
                    return Ok(());
                };
                interfaces
                    .move_interface(&port, subnet_id, &old_vpns, purge_learnt)
                    .await?;
            }
            PortJob::Withdraw {
                interfaces,
                port_id,
                vpn_id,
                internet_vpn_id,
                subnetmap,
            } => {
                interfaces
                    .withdraw_subnet_from_interface(vpn_id, internet_vpn_id, port_id, &subnetmap)
                    .await?;
            }
        }
        Ok(())
    }
}

#[derive(Clone)]
pub struct RouterAssociationOrchestrator {
    pub(crate) shared: Arc<Shared>,
    pub(crate) subnets: SubnetAssociationManager,
    pub(crate) vpns: VpnLifecycleManager,
    pub(crate) interfaces: VpnInterfaceSynchronizer,
}

impl RouterAssociationOrchestrator {
    pub(crate) fn new(
        shared: Arc<Shared>,
        subnets: SubnetAssociationManager,
        vpns: VpnLifecycleManager,
        interfaces: VpnInterfaceSynchronizer,
    ) -> Self {
        Self {
            shared,
            subnets,
            vpns,
            interfaces,
        }
    }

    pub(crate) fn router(&self, router_id: Id<Router>) -> EngineResult<Router> {
        self.shared
            .cache
            .routers
            .get(router_id)
            .ok_or_else(|| EngineError::not_found(format!("router {router_id}")))
    }

    /// Count or discount a subnet in the address family of a VPN. Discounting in a VPN that
    /// is already gone is not an error.
    pub(crate) async fn account(
        &self,
        vpn_id: Id<Vpn>,
        family: IpFamily,
        subnet_id: Id<Subnet>,
        add: bool,
    ) -> EngineResult<()> {
        match self
            .vpns
            .update_address_family(vpn_id, family, subnet_id, add)
            .await
        {
            Ok(_) => Ok(()),
            Err(EngineError::NotFound(what)) if !add => {
                debug!("Not discounting subnet {subnet_id}: {what} not found");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Update the interfaces of the ports of a subnet after its bindings changed: the router
    /// port first and synchronously, then the other ports through the job queue.
    pub(crate) async fn refresh_subnet_ports(
        &self,
        subnetmap: &SubnetMap,
        old_vpns: &[Id<Vpn>],
        purge_learnt: bool,
    ) -> EngineResult<()> {
        let router_port = subnetmap.router_interface.map(|ri| ri.port_id);
        if let Some(port_id) = router_port {
            match self.shared.cache.ports.get(port_id) {
                Some(port) => {
                    self.interfaces
                        .move_interface(&port, subnetmap.subnet_id, old_vpns, purge_learnt)
                        .await?;
                }
                None => warn!(
                    "Router port {port_id} of subnet {} is not known",
                    subnetmap.subnet_id
                ),
            }
        }
        for port_id in subnetmap
            .port_list
            .iter()
            .filter(|p| Some(**p) != router_port)
        {
            let job = PortJob::Move {
                interfaces: self.interfaces.clone(),
                shared: self.shared.clone(),
                port_id: *port_id,
                subnet_id: subnetmap.subnet_id,
                old_vpns: old_vpns.to_vec(),
                purge_learnt,
            };
            self.shared
                .submit(job_key::port(*port_id), "move-interface", job, PortJob::run);
        }
        Ok(())
    }

    /// Withdraw a subnet from the interfaces of its ports, the router port first
    pub(crate) async fn withdraw_subnet_ports(&self, subnetmap: &SubnetMap) -> EngineResult<()> {
        let Some(vpn_id) = subnetmap.vpn_id else {
            return Ok(());
        };
        let router_port = subnetmap.router_interface.map(|ri| ri.port_id);
        if let Some(port_id) = router_port {
            self.interfaces
                .withdraw_subnet_from_interface(
                    vpn_id,
                    subnetmap.internet_vpn_id,
                    port_id,
                    subnetmap,
                )
                .await?;
        }
        for port_id in subnetmap
            .port_list
            .iter()
            .filter(|p| Some(**p) != router_port)
        {
            let job = PortJob::Withdraw {
                interfaces: self.interfaces.clone(),
                port_id: *port_id,
                vpn_id,
                internet_vpn_id: subnetmap.internet_vpn_id,
                subnetmap: subnetmap.clone(),
            };
            self.shared
                .submit(job_key::port(*port_id), "withdraw-subnet", job, PortJob::run);
        }
        Ok(())
    }

    /// Bind a subnet with no VPN and populate the interfaces of its ports
    async fn bind_subnet(&self, subnet_id: Id<Subnet>, binding: VpnBinding) -> EngineResult<SubnetMap> {
        let subnetmap = self.subnets.bind_vpn(subnet_id, binding).await?;
        if let Some(vpn_id) = subnetmap.vpn_id {
            self.account(vpn_id, subnetmap.family(), subnet_id, true).await?;
        }
        if let Some(internet) = subnetmap.internet_vpn_id {
            self.account(internet, IpFamily::V6, subnet_id, true).await?;
        }
        self.refresh_subnet_ports(&subnetmap, &[], false).await?;
        info!("Bound subnet {subnet_id} to VPN {:?}", subnetmap.vpn_id);
        Ok(subnetmap)
    }

    /// Move a subnet from `old_vpn_id` to `new_vpn_id`. The subnet aggregate and the address
    /// families are updated first, then the interfaces of the ports. Learnt VIPs of the old VPN
    /// are purged unless the subnet is being associated to an external VPN.
    pub async fn move_subnet_between_vpns(
        &self,
        old_vpn_id: Id<Vpn>,
        new_vpn_id: Id<Vpn>,
        subnet_id: Id<Subnet>,
        is_being_associated: bool,
    ) -> EngineResult<SubnetMap> {
        let subnetmap = self
            .subnets
            .bind_vpn(subnet_id, VpnBinding::vpn(new_vpn_id))
            .await?;
        self.complete_move(old_vpn_id, &subnetmap, is_being_associated)
            .await?;
        info!("Moved subnet {subnet_id} from VPN {old_vpn_id} to VPN {new_vpn_id}");
        Ok(subnetmap)
    }

    /// Second half of a move, once `subnetmap` is bound to its new VPN: address families, then
    /// interfaces. Every step converges when repeated.
    async fn complete_move(
        &self,
        old_vpn_id: Id<Vpn>,
        subnetmap: &SubnetMap,
        is_being_associated: bool,
    ) -> EngineResult<()> {
        let subnet_id = subnetmap.subnet_id;
        self.account(old_vpn_id, subnetmap.family(), subnet_id, false)
            .await?;
        if let Some(new_vpn_id) = subnetmap.vpn_id {
            self.account(new_vpn_id, subnetmap.family(), subnet_id, true)
                .await?;
        }
        self.refresh_subnet_ports(subnetmap, &[old_vpn_id], !is_being_associated)
            .await
    }

    /// Route a subnet of a router to `vpn_id`, and to the internet VPN if it is an IPv6 subnet
    async fn route_subnet(
        &self,
        subnetmap: &SubnetMap,
        router_id: Id<Router>,
        vpn_id: Id<Vpn>,
        internet: Option<Id<Vpn>>,
    ) -> EngineResult<()> {
        let internet = internet.filter(|_| subnetmap.is_ipv6());
        let routed = match subnetmap.vpn_id {
            Some(current) if current == vpn_id => subnetmap.clone(),
            Some(current) => {
                self.move_subnet_between_vpns(current, vpn_id, subnetmap.subnet_id, true)
                    .await?
            }
            None => {
                let mut binding = VpnBinding::vpn(vpn_id).router(router_id);
                if let Some(internet) = internet {
                    binding = binding.internet(internet);
                }
                self.bind_subnet(subnetmap.subnet_id, binding).await?
            }
        };
        if let Some(internet) = internet
            && routed.internet_vpn_id != Some(internet)
        {
            self.update_vpn_internet_for_subnet(subnetmap.subnet_id, internet, true)
                .await?;
        }
        Ok(())
    }

    /// The VPN the subnets of a router are routed to: its external VPN if any, else the VPN
    /// internal to it
    async fn target_vpn(&self, router_id: Id<Router>) -> EngineResult<Id<Vpn>> {
        Ok(self
            .vpns
            .external_vpn_of_router(router_id)
            .await?
            .unwrap_or_else(|| router_id.retag()))
    }

    /// Create the VPN internal to a router and route the router's subnets to it. IPv6 subnets
    /// are also routed to the internet VPN of the router's external network, if there is one.
    pub async fn associate_router_to_internal_vpn(&self, router: &Router) -> EngineResult<()> {
        self.vpns.create_internal_vpn(router).await?;
        if let Some(external) = self.vpns.external_vpn_of_router(router.id).await? {
            debug!("Router {} is associated to VPN {external}", router.id);
            return Ok(());
        }
        let internal: Id<Vpn> = router.id.retag();
        let internet = self.internet_vpn_of_router(router).await?;
        for subnetmap in self.subnets.subnets_of_router(router.id).await? {
            self.route_subnet(&subnetmap, router.id, internal, internet)
                .await?;
        }
        Ok(())
    }

    /// A router port was added on a subnet: the router now routes the subnet
    pub async fn add_subnet_to_router(
        &self,
        router: &Router,
        port: &Port,
        subnet_id: Id<Subnet>,
    ) -> EngineResult<()> {
        let Some(subnetmap) = self.subnets.get(subnet_id).await? else {
            return Err(EngineError::Dependency(format!("subnet {subnet_id}")));
        };
        let fixed_ip = port.fixed_ip_in(subnet_id).ok_or_else(|| {
            EngineError::not_found(format!("IP of port {} in subnet {subnet_id}", port.id))
        })?;
        let internal: Id<Vpn> = router.id.retag();
        let target = self.target_vpn(router.id).await?;
        if let Some(current) = subnetmap.vpn_id
            && current != target
            && current != internal
            && subnetmap.router_id != Some(router.id)
        {
            return Err(EngineError::conflict(format!(
                "subnet {subnet_id} is associated to VPN {current} through its network"
            )));
        }
        self.vpns.create_internal_vpn(router).await?;
        let info = RouterInterfaceInfo {
            port_id: port.id,
            fixed_ip,
            mac: port.mac,
        };
        let subnetmap = self
            .subnets
            .set_router_interface(subnet_id, router.id, info)
            .await?;
        self.update_nat_router_subnet(router.id, subnet_id, true)
            .await?;
        let internet = self.internet_vpn_of_router(router).await?;
        self.route_subnet(&subnetmap, router.id, target, internet)
            .await?;
        info!("Router {} now routes subnet {subnet_id}", router.id);
        Ok(())
    }

    /// A router port was removed from a subnet: the subnet leaves the router's VPN, and goes
    /// back to its network's VPN if the network is associated to one
    pub async fn remove_subnet_from_router(
        &self,
        router_id: Id<Router>,
        subnet_id: Id<Subnet>,
    ) -> EngineResult<()> {
        let Some(subnetmap) = self.subnets.get(subnet_id).await? else {
            debug!("Subnet {subnet_id} is gone");
            return Ok(());
        };
        if subnetmap.router_id != Some(router_id) {
            debug!("Subnet {subnet_id} is not routed by router {router_id}");
            return Ok(());
        }
        if let Some(vpn_id) = subnetmap.vpn_id {
            self.account(vpn_id, subnetmap.family(), subnet_id, false)
                .await?;
        }
        if let Some(internet) = subnetmap.internet_vpn_id {
            self.account(internet, IpFamily::V6, subnet_id, false)
                .await?;
        }
        let unbound = self
            .subnets
            .unbind_vpn(subnet_id, Unbind::ROUTER | Unbind::VPN | Unbind::INTERNET_VPN)
            .await?;
        self.withdraw_subnet_ports(&subnetmap).await?;
        self.update_nat_router_subnet(router_id, subnet_id, false)
            .await?;
        info!("Router {router_id} no longer routes subnet {subnet_id}");

        if let Some(network_id) = unbound.network_id
            && let Some(vpn_id) = self.vpns.vpn_of_network(network_id).await?
        {
            self.bind_subnet(subnet_id, VpnBinding::vpn(vpn_id)).await?;
        }
        Ok(())
    }

    /// Associate a router to an external VPN and move all of its subnets there
    pub async fn associate_router_to_vpn(&self, vpn_id: Id<Vpn>, router_id: Id<Router>) -> EngineResult<()> {
        let router = self.router(router_id)?;
        let internal: Id<Vpn> = router_id.retag();
        let subnets = self.subnets.subnets_of_router(router_id).await?;
        if let Some(sm) = subnets
            .iter()
            .find(|sm| sm.vpn_id.is_some_and(|v| v != internal && v != vpn_id))
        {
            return Err(EngineError::conflict(format!(
                "subnet {} of router {router_id} is bound to another VPN",
                sm.subnet_id
            )));
        }
        self.vpns.create_internal_vpn(&router).await?;
        self.vpns.associate_router(vpn_id, router_id).await?;
        let internet = self.internet_vpn_of_router(&router).await?;
        for subnetmap in &subnets {
            self.route_subnet(subnetmap, router_id, vpn_id, internet)
                .await?;
        }
        info!("Router {router_id} and its {} subnets are in VPN {vpn_id}", subnets.len());
        Ok(())
    }

    /// Dissociate a router from an external VPN, moving its subnets back to its internal VPN.
    /// The router leaves the VPN map last, so an interrupted dissociation is resumed by the
    /// next one.
    pub async fn dissociate_router_from_vpn(
        &self,
        vpn_id: Id<Vpn>,
        router_id: Id<Router>,
    ) -> EngineResult<()> {
        let internal: Id<Vpn> = router_id.retag();
        let internal_exists = self.vpns.get_instance(internal).await?.is_some();
        let associated = self
            .vpns
            .get_map(vpn_id)
            .await?
            .is_some_and(|m| m.router_ids.contains(&router_id));
        for subnetmap in self.subnets.subnets_of_router(router_id).await? {
            match subnetmap.vpn_id {
                Some(current) if current == vpn_id && internal_exists => {
                    self.move_subnet_between_vpns(vpn_id, internal, subnetmap.subnet_id, false)
                        .await?;
                }
                Some(current) if current == vpn_id => {
                    self.account(vpn_id, subnetmap.family(), subnetmap.subnet_id, false)
                        .await?;
                    self.withdraw_subnet_ports(&subnetmap).await?;
                    self.subnets
                        .unbind_vpn(subnetmap.subnet_id, Unbind::VPN)
                        .await?;
                }
                Some(current) if current == internal && associated => {
                    // rebound by an attempt that stopped before the interfaces were moved
                    self.complete_move(vpn_id, &subnetmap, false).await?;
                }
                _ => {}
            }
        }
        self.vpns.dissociate_router(vpn_id, router_id).await?;
        info!("Router {router_id} left VPN {vpn_id}");
        Ok(())
    }

    /// Associate a network to a VPN. The subnets of an internal network are bound to the VPN;
    /// an external network turns the VPN into an internet VPN for the IPv6 subnets of the routers
    /// gatewaying to it.
    pub async fn associate_network_to_vpn(
        &self,
        vpn_id: Id<Vpn>,
        network_id: Id<Network>,
    ) -> EngineResult<()> {
        let network = self
            .shared
            .cache
            .networks
            .get(network_id)
            .ok_or_else(|| EngineError::not_found(format!("network {network_id}")))?;
        if network.external {
            return self.associate_external_network(vpn_id, &network).await;
        }
        let subnets = self.subnets.subnets_of_network(network_id).await?;
        for sm in &subnets {
            if let Some(router_id) = sm.router_id {
                return Err(EngineError::conflict(format!(
                    "subnet {} of network {network_id} is routed by router {router_id}",
                    sm.subnet_id
                )));
            }
            if let Some(other) = sm.vpn_id.filter(|v| *v != vpn_id) {
                return Err(EngineError::conflict(format!(
                    "subnet {} of network {network_id} is bound to VPN {other}",
                    sm.subnet_id
                )));
            }
        }
        self.vpns.associate_network(vpn_id, network_id).await?;
        for sm in subnets.iter().filter(|sm| sm.vpn_id.is_none()) {
            self.bind_subnet(sm.subnet_id, VpnBinding::vpn(vpn_id)).await?;
        }
        Ok(())
    }

    pub async fn dissociate_network_from_vpn(
        &self,
        vpn_id: Id<Vpn>,
        network_id: Id<Network>,
    ) -> EngineResult<()> {
        self.vpns.dissociate_network(vpn_id, network_id).await?;
        if self.external_network(network_id).await?.is_some() {
            return self.dissociate_external_network(vpn_id, network_id).await;
        }
        for subnetmap in self.subnets.subnets_of_network(network_id).await? {
            if subnetmap.vpn_id != Some(vpn_id) || subnetmap.router_id.is_some() {
                continue;
            }
            self.account(vpn_id, subnetmap.family(), subnetmap.subnet_id, false)
                .await?;
            self.subnets
                .unbind_vpn(subnetmap.subnet_id, Unbind::VPN)
                .await?;
            self.withdraw_subnet_ports(&subnetmap).await?;
        }
        info!("Network {network_id} left VPN {vpn_id}");
        Ok(())
    }

    /// A new subnet of a network associated to a VPN joins the VPN. Subnets of external
    /// networks and routed subnets are left alone.
    pub async fn bind_subnet_to_network_vpn(
        &self,
        subnet_id: Id<Subnet>,
        network_id: Id<Network>,
    ) -> EngineResult<()> {
        let Some(vpn_id) = self.vpns.vpn_of_network(network_id).await? else {
            return Ok(());
        };
        let subnetmap = self
            .subnets
            .get(subnet_id)
            .await?
            .ok_or_else(|| EngineError::Dependency(format!("subnet {subnet_id}")))?;
        if subnetmap.external || subnetmap.vpn_id.is_some() || subnetmap.router_id.is_some() {
            return Ok(());
        }
        self.bind_subnet(subnet_id, VpnBinding::vpn(vpn_id)).await?;
        Ok(())
    }

    /// A subnet was removed: it is withdrawn from its VPNs and its aggregates deleted
    pub async fn remove_subnet(&self, subnet_id: Id<Subnet>) -> EngineResult<()> {
        if let Some(subnetmap) = self.subnets.get(subnet_id).await? {
            if let Some(vpn_id) = subnetmap.vpn_id {
                self.account(vpn_id, subnetmap.family(), subnet_id, false)
                    .await?;
            }
            if let Some(internet) = subnetmap.internet_vpn_id {
                self.account(internet, IpFamily::V6, subnet_id, false)
                    .await?;
            }
            self.withdraw_subnet_ports(&subnetmap).await?;
            if let Some(router_id) = subnetmap.router_id {
                self.update_nat_router_subnet(router_id, subnet_id, false)
                    .await?;
            }
            self.subnets.destroy_subnet_aggregate(subnet_id).await?;
        }
        self.delete_external_subnet(subnet_id).await
    }

    /// A router was removed: it leaves its external VPN and its external network, its subnets
    /// are unrouted and its internal VPN deleted
    pub async fn remove_router(&self, router: &Router) -> EngineResult<()> {
        if let Some(external) = self.vpns.external_vpn_of_router(router.id).await? {
            self.dissociate_router_from_vpn(external, router.id).await?;
        }
        if let Some(network_id) = router.external_network() {
            self.remove_external_network_from_router(router.id, network_id)
                .await?;
        }
        for subnetmap in self.subnets.subnets_of_router(router.id).await? {
            self.remove_subnet_from_router(router.id, subnetmap.subnet_id)
                .await?;
        }
        self.vpns.remove_vpn_nodes(router.id.retag()).await?;
        info!("Removed router {}", router.id);
        Ok(())
    }
}

#[async_trait]
impl Dissociator for RouterAssociationOrchestrator {
    async fn dissociate_router(&self, vpn_id: Id<Vpn>, router_id: Id<Router>) -> EngineResult<()> {
        self.dissociate_router_from_vpn(vpn_id, router_id).await
    }

    async fn dissociate_network(&self, vpn_id: Id<Vpn>, network_id: Id<Network>) -> EngineResult<()> {
        self.dissociate_network_from_vpn(vpn_id, network_id).await
    }
}
