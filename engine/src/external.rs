// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! External networks: router gateways, the NAT aggregates of external networks and subnets,
//! and the IPv6 internet VPN fallback.

use crate::{EngineError, EngineResult, LockKey, RouterAssociationOrchestrator};
use id::Id;
use model::IpFamily;
use model::aggregates::{ExternalIp, ExternalNetwork, ExternalSubnet, NatRouter, Unbind, VpnBinding};
use model::neutron::{Network, Router, Subnet, Vpn};
use std::collections::BTreeSet;
use store::Datastore;
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("nat", LevelFilter::INFO, &["nat", "router", "vpnsync"]);

impl RouterAssociationOrchestrator {
    fn store(&self) -> &dyn Datastore {
        self.shared.store.as_ref()
    }

    pub async fn external_network(&self, network_id: Id<Network>) -> EngineResult<Option<ExternalNetwork>> {
        Ok(self.store().read::<ExternalNetwork>(&network_id).await?)
    }

    /// The internet VPN an external network is associated to
    pub async fn internet_vpn_of_network(&self, network_id: Id<Network>) -> EngineResult<Option<Id<Vpn>>> {
        let Some(vpn_id) = self.vpns.vpn_of_network(network_id).await? else {
            return Ok(None);
        };
        Ok(self
            .vpns
            .get_instance(vpn_id)
            .await?
            .filter(model::aggregates::VpnInstance::is_internet)
            .map(|_| vpn_id))
    }

    /// The internet VPN of the external network a router gateways to
    pub async fn internet_vpn_of_router(&self, router: &Router) -> EngineResult<Option<Id<Vpn>>> {
        match router.external_network() {
            Some(network_id) => self.internet_vpn_of_network(network_id).await,
            None => Ok(None),
        }
    }

    /// Routers whose gateway is on `network_id`, as recorded and as currently known
    async fn gatewaying_routers(&self, network_id: Id<Network>) -> EngineResult<BTreeSet<Id<Router>>> {
        let mut routers: BTreeSet<Id<Router>> = self
            .external_network(network_id)
            .await?
            .map(|e| e.router_ids)
            .unwrap_or_default();
        routers.extend(
            self.shared
                .cache
                .routers
                .find(|r| r.external_network() == Some(network_id))
                .iter()
                .map(|r| r.id),
        );
        Ok(routers)
    }

    /// Route (or unroute) an IPv6 subnet to an internet VPN. IPv4 subnets are left alone.
    pub async fn update_vpn_internet_for_subnet(
        &self,
        subnet_id: Id<Subnet>,
        internet_vpn_id: Id<Vpn>,
        add: bool,
    ) -> EngineResult<()> {
        let subnetmap = self
            .subnets
            .get(subnet_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("subnet {subnet_id}")))?;
        if !subnetmap.is_ipv6() {
            debug!("Subnet {subnet_id} is not IPv6, no internet VPN");
            return Ok(());
        }
        if add {
            if subnetmap.internet_vpn_id == Some(internet_vpn_id) {
                return Ok(());
            }
            let previous = subnetmap.internet_vpn_id;
            let subnetmap = self
                .subnets
                .bind_vpn(subnet_id, VpnBinding::default().internet(internet_vpn_id))
                .await?;
            if let Some(previous) = previous {
                self.account(previous, IpFamily::V6, subnet_id, false)
                    .await?;
            }
            self.account(internet_vpn_id, IpFamily::V6, subnet_id, true)
                .await?;
            let old: Vec<Id<Vpn>> = previous.into_iter().collect();
            self.refresh_subnet_ports(&subnetmap, &old, false).await?;
            info!("Subnet {subnet_id} routed to internet VPN {internet_vpn_id}");
        } else {
            if subnetmap.internet_vpn_id != Some(internet_vpn_id) {
                return Ok(());
            }
            let subnetmap = self
                .subnets
                .unbind_vpn(subnet_id, Unbind::INTERNET_VPN)
                .await?;
            self.account(internet_vpn_id, IpFamily::V6, subnet_id, false)
                .await?;
            self.refresh_subnet_ports(&subnetmap, &[internet_vpn_id], true)
                .await?;
            info!("Subnet {subnet_id} no longer routed to internet VPN {internet_vpn_id}");
        }
        Ok(())
    }

    /// Program (or remove) the IPv6 fallback to the internet VPN on every dataplane node the
    /// router spans
    pub async fn program_v6_internet_fallback_flow(
        &self,
        router_id: Id<Router>,
        internet_vpn_id: Id<Vpn>,
        add: bool,
    ) -> EngineResult<()> {
        let Some(tag) = self
            .vpns
            .get_instance(internet_vpn_id)
            .await?
            .and_then(|i| i.vpn_tag)
        else {
            warn!("Internet VPN {internet_vpn_id} has no tag, no fallback for router {router_id}");
            return Ok(());
        };
        let fib = &self.shared.collab.fib;
        for dpn in fib.router_dpns(router_id).await? {
            fib.program_v6_internet_fallback(dpn, router_id, tag, add)
                .await?;
        }
        debug!(
            "{} IPv6 internet fallback of router {router_id} to VPN {internet_vpn_id}",
            if add { "Programmed" } else { "Removed" }
        );
        Ok(())
    }

    /// Route the IPv6 subnets of a router to an internet VPN, or stop doing so
    async fn update_router_internet(
        &self,
        router_id: Id<Router>,
        internet_vpn_id: Id<Vpn>,
        add: bool,
    ) -> EngineResult<()> {
        let mut any_v6 = false;
        for subnetmap in self.subnets.subnets_of_router(router_id).await? {
            if !subnetmap.is_ipv6() {
                continue;
            }
            any_v6 = true;
            self.update_vpn_internet_for_subnet(subnetmap.subnet_id, internet_vpn_id, add)
                .await?;
        }
        if any_v6 {
            self.program_v6_internet_fallback_flow(router_id, internet_vpn_id, add)
                .await?;
        }
        Ok(())
    }

    /// The router has a gateway: record it in the NAT aggregates and route its IPv6 subnets to
    /// the internet VPN of the external network, if any
    pub async fn add_external_network_to_router(&self, router: &Router) -> EngineResult<()> {
        let Some(gateway) = &router.gateway else {
            return Ok(());
        };
        let network_id = gateway.network_id;
        let subnet_ids: BTreeSet<Id<Subnet>> = self
            .subnets
            .subnets_of_router(router.id)
            .await?
            .into_iter()
            .map(|sm| sm.subnet_id)
            .collect();
        {
            let _guard = self.shared.lock(LockKey::Router(router.id)).await?;
            let existing = self.store().read::<NatRouter>(&router.id).await?;
            let ext_gw_mac = match existing.as_ref().and_then(|n| n.ext_gw_mac) {
                Some(mac) => Some(mac),
                None => self.resolve_gateway_mac(router).await,
            };
            let nat = NatRouter {
                router_id: router.id,
                network_id,
                enable_snat: gateway.enable_snat,
                external_ips: gateway
                    .external_fixed_ips
                    .iter()
                    .map(|f| ExternalIp {
                        ip: f.ip,
                        subnet_id: f.subnet_id,
                    })
                    .collect(),
                subnet_ids,
                ext_gw_mac,
            };
            if existing.as_ref() != Some(&nat) {
                self.store().put(nat).await?;
                info!("Router {} gateways to external network {network_id}", router.id);
            }
        }
        self.update_external_network_router(network_id, router.id, true)
            .await?;
        for fixed in &gateway.external_fixed_ips {
            self.update_external_subnet_router(fixed.subnet_id, network_id, router.id, true)
                .await?;
        }
        if let Some(internet) = self.internet_vpn_of_network(network_id).await? {
            self.update_router_internet(router.id, internet, true)
                .await?;
        }
        Ok(())
    }

    /// The router no longer gateways to `network_id`
    pub async fn remove_external_network_from_router(
        &self,
        router_id: Id<Router>,
        network_id: Id<Network>,
    ) -> EngineResult<()> {
        {
            let _guard = self.shared.lock(LockKey::Router(router_id)).await?;
            if let Some(nat) = self.store().read::<NatRouter>(&router_id).await?
                && nat.network_id == network_id
            {
                self.store().delete::<NatRouter>(&router_id).await?;
                info!("Router {router_id} no longer gateways to {network_id}");
            }
        }
        self.update_external_network_router(network_id, router_id, false)
            .await?;
        let subnets: Vec<Id<Subnet>> = self
            .store()
            .read_all::<ExternalSubnet>()
            .await?
            .into_iter()
            .filter(|s| s.network_id == network_id && s.router_ids.contains(&router_id))
            .map(|s| s.subnet_id)
            .collect();
        for subnet_id in subnets {
            self.update_external_subnet_router(subnet_id, network_id, router_id, false)
                .await?;
        }
        if let Some(internet) = self.internet_vpn_of_network(network_id).await? {
            self.update_router_internet(router_id, internet, false)
                .await?;
        }
        Ok(())
    }

    async fn resolve_gateway_mac(&self, router: &Router) -> Option<mac_address::MacAddress> {
        let gateway = router.gateway.as_ref()?;
        for fixed in &gateway.external_fixed_ips {
            let Some(gateway_ip) = self
                .shared
                .cache
                .subnets
                .get(fixed.subnet_id)
                .and_then(|s| s.gateway_ip)
            else {
                continue;
            };
            match self.shared.collab.gw_mac.resolve(router.id, gateway_ip).await {
                Ok(Some(mac)) => return Some(mac),
                Ok(None) => debug!("No MAC for gateway {gateway_ip} of router {}", router.id),
                Err(e) => warn!(
                    "Failed to resolve gateway {gateway_ip} of router {}: {e}",
                    router.id
                ),
            }
        }
        None
    }

    /// Keep the routers of the internal subnets of a NAT router in sync with the router
    pub(crate) async fn update_nat_router_subnet(
        &self,
        router_id: Id<Router>,
        subnet_id: Id<Subnet>,
        add: bool,
    ) -> EngineResult<()> {
        let _guard = self.shared.lock(LockKey::Router(router_id)).await?;
        let Some(mut nat) = self.store().read::<NatRouter>(&router_id).await? else {
            return Ok(());
        };
        let changed = if add {
            nat.subnet_ids.insert(subnet_id)
        } else {
            nat.subnet_ids.remove(&subnet_id)
        };
        if changed {
            self.store().put(nat).await?;
        }
        Ok(())
    }

    async fn update_external_network_router(
        &self,
        network_id: Id<Network>,
        router_id: Id<Router>,
        add: bool,
    ) -> EngineResult<()> {
        let vpn_id = self.vpns.vpn_of_network(network_id).await?;
        let _guard = self.shared.lock(LockKey::Network(network_id)).await?;
        let mut external = match self.external_network(network_id).await? {
            Some(external) => external,
            None if add => ExternalNetwork {
                network_id,
                vpn_id,
                router_ids: BTreeSet::new(),
            },
            None => return Ok(()),
        };
        let changed = if add {
            external.router_ids.insert(router_id)
        } else {
            external.router_ids.remove(&router_id)
        };
        if changed {
            self.store().put(external).await?;
        }
        Ok(())
    }

    async fn update_external_subnet_router(
        &self,
        subnet_id: Id<Subnet>,
        network_id: Id<Network>,
        router_id: Id<Router>,
        add: bool,
    ) -> EngineResult<()> {
        let vpn_id = self
            .external_network(network_id)
            .await?
            .and_then(|e| e.vpn_id);
        let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
        let mut external = match self.store().read::<ExternalSubnet>(&subnet_id).await? {
            Some(external) => external,
            None if add => ExternalSubnet {
                subnet_id,
                network_id,
                vpn_id,
                router_ids: BTreeSet::new(),
            },
            None => return Ok(()),
        };
        let changed = if add {
            external.router_ids.insert(router_id)
        } else {
            external.router_ids.remove(&router_id)
        };
        if changed {
            self.store().put(external).await?;
        }
        Ok(())
    }

    /// Record the VPN of an external network on its aggregate and those of its subnets
    async fn set_external_network_vpn(
        &self,
        network_id: Id<Network>,
        vpn_id: Option<Id<Vpn>>,
    ) -> EngineResult<()> {
        {
            let _guard = self.shared.lock(LockKey::Network(network_id)).await?;
            let mut external = self
                .external_network(network_id)
                .await?
                .unwrap_or_else(|| ExternalNetwork {
                    network_id,
                    vpn_id: None,
                    router_ids: BTreeSet::new(),
                });
            if external.vpn_id != vpn_id {
                external.vpn_id = vpn_id;
                self.store().put(external).await?;
            }
        }
        let subnets: Vec<Id<Subnet>> = self
            .store()
            .read_all::<ExternalSubnet>()
            .await?
            .into_iter()
            .filter(|s| s.network_id == network_id && s.vpn_id != vpn_id)
            .map(|s| s.subnet_id)
            .collect();
        for subnet_id in subnets {
            let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
            if let Some(mut external) = self.store().read::<ExternalSubnet>(&subnet_id).await? {
                external.vpn_id = vpn_id;
                self.store().put(external).await?;
            }
        }
        Ok(())
    }

    /// Associating an external network to a VPN makes it an internet VPN, to which the IPv6
    /// subnets behind the routers gatewaying to the network are routed
    pub(crate) async fn associate_external_network(
        &self,
        vpn_id: Id<Vpn>,
        network: &Network,
    ) -> EngineResult<()> {
        self.vpns.associate_network(vpn_id, network.id).await?;
        self.vpns.set_internet(vpn_id, true).await?;
        self.set_external_network_vpn(network.id, Some(vpn_id))
            .await?;
        for router_id in self.gatewaying_routers(network.id).await? {
            self.update_router_internet(router_id, vpn_id, true).await?;
        }
        info!("External network {} is now served by internet VPN {vpn_id}", network.id);
        Ok(())
    }

    pub(crate) async fn dissociate_external_network(
        &self,
        vpn_id: Id<Vpn>,
        network_id: Id<Network>,
    ) -> EngineResult<()> {
        self.set_external_network_vpn(network_id, None).await?;
        for router_id in self.gatewaying_routers(network_id).await? {
            self.update_router_internet(router_id, vpn_id, false)
                .await?;
        }
        let still_external = self
            .store()
            .read_all::<ExternalNetwork>()
            .await?
            .iter()
            .any(|e| e.vpn_id == Some(vpn_id));
        if !still_external && self.vpns.get_instance(vpn_id).await?.is_some() {
            self.vpns.set_internet(vpn_id, false).await?;
        }
        info!("External network {network_id} left internet VPN {vpn_id}");
        Ok(())
    }

    /// Create the NAT aggregate of an external network
    pub async fn create_external_network(&self, network: &Network) -> EngineResult<()> {
        if !network.external {
            return Ok(());
        }
        let vpn_id = self.vpns.vpn_of_network(network.id).await?;
        let router_ids = self.gatewaying_routers(network.id).await?;
        let _guard = self.shared.lock(LockKey::Network(network.id)).await?;
        if self.external_network(network.id).await?.is_some() {
            return Ok(());
        }
        self.store()
            .put(ExternalNetwork {
                network_id: network.id,
                vpn_id,
                router_ids,
            })
            .await?;
        info!("Created external network {}", network.id);
        Ok(())
    }

    pub async fn delete_external_network(&self, network_id: Id<Network>) -> EngineResult<()> {
        let _guard = self.shared.lock(LockKey::Network(network_id)).await?;
        if self.external_network(network_id).await?.is_some() {
            self.store().delete::<ExternalNetwork>(&network_id).await?;
            info!("Deleted external network {network_id}");
        }
        Ok(())
    }

    /// Create the NAT aggregate of a subnet of an external network
    pub async fn create_external_subnet(&self, subnet: &Subnet) -> EngineResult<()> {
        let vpn_id = self
            .external_network(subnet.network_id)
            .await?
            .and_then(|e| e.vpn_id);
        let router_ids: BTreeSet<Id<Router>> = self
            .shared
            .cache
            .routers
            .find(|r| {
                r.gateway
                    .as_ref()
                    .is_some_and(|g| g.external_fixed_ips.iter().any(|f| f.subnet_id == subnet.id))
            })
            .iter()
            .map(|r| r.id)
            .collect();
        let _guard = self.shared.lock(LockKey::Subnet(subnet.id)).await?;
        if self.store().exists::<ExternalSubnet>(&subnet.id).await? {
            return Ok(());
        }
        self.store()
            .put(ExternalSubnet {
                subnet_id: subnet.id,
                network_id: subnet.network_id,
                vpn_id,
                router_ids,
            })
            .await?;
        info!("Created external subnet {}", subnet.id);
        Ok(())
    }

    pub async fn delete_external_subnet(&self, subnet_id: Id<Subnet>) -> EngineResult<()> {
        let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
        if self.store().exists::<ExternalSubnet>(&subnet_id).await? {
            self.store().delete::<ExternalSubnet>(&subnet_id).await?;
            info!("Deleted external subnet {subnet_id}");
        }
        Ok(())
    }
}
