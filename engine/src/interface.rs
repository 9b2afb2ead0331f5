// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Owner of the per-port VPN interfaces, their adjacencies and the port-IP mappings written
//! alongside them.
//!
//! Interface critical sections take the blocking port lock and never nest another lock: the
//! router interfaces map is updated once the port lock is released.

use crate::context::Shared;
use crate::{EngineResult, LockKey};
use id::Id;
use ipnet::IpNet;
use model::IpFamily;
use model::aggregates::{
    Adjacency, AssociatedSubnetType, LearntVip, PortIpMapping, RouterInterfacesMap, SubnetMap,
    VpnInterface, VpnIpKey,
};
use model::neutron::{Port, Route, Router, Subnet, Vpn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use store::{Datastore, Record, Transaction};
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("interface", LevelFilter::INFO, &["interface", "vpnsync"]);

/// What a port contributes to the VPNs its subnets are bound to
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ComputedInterface {
    /// Adjacencies of the interface, starting from the existing ones. Unique per prefix.
    pub adjacencies: BTreeMap<IpNet, Adjacency>,
    pub vpns: BTreeMap<Id<Vpn>, AssociatedSubnetType>,
    pub port_ips: Vec<PortIpMapping>,
    /// Routers of the bound subnets
    pub routers: BTreeSet<Id<Router>>,
}

impl ComputedInterface {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.vpns.is_empty()
    }
}

#[derive(Clone)]
pub struct VpnInterfaceSynchronizer {
    shared: Arc<Shared>,
}

impl VpnInterfaceSynchronizer {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn store(&self) -> &dyn Datastore {
        self.shared.store.as_ref()
    }

    pub async fn get(&self, port_id: Id<Port>) -> EngineResult<Option<VpnInterface>> {
        Ok(self.store().read::<VpnInterface>(&port_id).await?)
    }

    /// Adjacencies of `port` for every fixed IP whose subnet is bound to a VPN, plus the extra
    /// routes of the subnet's router going through that IP. Router interfaces get no extra route.
    pub async fn compute_adjacencies(
        &self,
        port: &Port,
        is_router_interface: bool,
        existing: Option<&VpnInterface>,
    ) -> EngineResult<ComputedInterface> {
        let mut scratch = existing
            .cloned()
            .unwrap_or_else(|| VpnInterface::new(port.id, port.network_id, is_router_interface));
        let mut computed = ComputedInterface::default();
        let mut extra: BTreeMap<IpNet, BTreeSet<_>> = BTreeMap::new();

        for fixed in &port.fixed_ips {
            let Some(subnetmap) = self.store().read::<SubnetMap>(&fixed.subnet_id).await? else {
                debug!("Subnet {} of port {} has no aggregate", fixed.subnet_id, port.id);
                continue;
            };
            let Some(vpn_id) = subnetmap.vpn_id else {
                continue;
            };
            let family = IpFamily::of(&fixed.ip);
            merge_membership(&mut computed.vpns, vpn_id, family);
            if let Some(internet) = subnetmap.internet_vpn_id {
                merge_membership(&mut computed.vpns, internet, IpFamily::V6);
            }
            scratch.merge_adjacencies([Adjacency::primary(fixed.ip, port.mac, fixed.subnet_id)]);
            computed.port_ips.push(PortIpMapping {
                vpn_id,
                ip: fixed.ip,
                port_id: port.id,
                mac: port.mac,
                subnet_id: fixed.subnet_id,
            });

            let Some(router_id) = subnetmap.router_id else {
                continue;
            };
            computed.routers.insert(router_id);
            if is_router_interface {
                continue;
            }
            let Some(router) = self.shared.cache.routers.get(router_id) else {
                debug!("Router {router_id} not known, no extra routes for port {}", port.id);
                continue;
            };
            for route in router.routes_via(fixed.ip) {
                extra
                    .entry(route.destination)
                    .or_default()
                    .insert(route.nexthop);
            }
        }

        let extra_routes = extra
            .into_iter()
            .filter(|(dest, _)| {
                let clash = scratch
                    .adjacencies
                    .get(dest)
                    .is_some_and(Adjacency::is_primary);
                if clash {
                    warn!("Extra route {dest} shadows a fixed IP of port {}", port.id);
                }
                !clash
            })
            .map(|(dest, hops)| Adjacency::extra_route(dest, hops))
            .collect::<Vec<_>>();
        scratch.merge_adjacencies(extra_routes);
        computed.adjacencies = scratch.adjacencies;
        Ok(computed)
    }

    /// Create the interface of a port or merge new memberships and adjacencies into it.
    /// Memberships not listed are kept.
    pub async fn write_vpn_interface(
        &self,
        port: &Port,
        is_router_interface: bool,
        computed: &ComputedInterface,
    ) -> EngineResult<Option<VpnInterface>> {
        let written = {
            let _guard = self.shared.lock_blocking(LockKey::Interface(port.id)).await;
            let existing = self.get(port.id).await?;
            self.write_locked(
                port,
                is_router_interface,
                existing.clone(),
                existing.as_ref(),
                computed,
                &[],
            )
            .await?
        };
        self.register_router_interfaces(port.id, &computed.routers).await?;
        Ok(written)
    }

    /// Recompute and write the interface of a port from the current subnet bindings
    pub async fn sync_port(&self, port: &Port) -> EngineResult<Option<VpnInterface>> {
        let (written, routers) = {
            let _guard = self.shared.lock_blocking(LockKey::Interface(port.id)).await;
            let existing = self.get(port.id).await?;
            let computed = self
                .compute_adjacencies(port, port.is_router_interface(), existing.as_ref())
                .await?;
            let written = self
                .write_locked(
                    port,
                    port.is_router_interface(),
                    existing.clone(),
                    existing.as_ref(),
                    &computed,
                    &[],
                )
                .await?;
            (written, computed.routers)
        };
        self.register_router_interfaces(port.id, &routers).await?;
        Ok(written)
    }

    /// Recompute the interface of a port from the current subnet bindings. Unlike
    /// [`Self::sync_port`], memberships no bound subnet accounts for are dropped, along with
    /// their port-IP mappings and learnt VIPs.
    pub async fn reconcile_port(&self, port: &Port) -> EngineResult<Option<VpnInterface>> {
        let (written, routers, dropped, existed) = {
            let _guard = self.shared.lock_blocking(LockKey::Interface(port.id)).await;
            let existing = self.get(port.id).await?;
            let computed = self
                .compute_adjacencies(port, port.is_router_interface(), existing.as_ref())
                .await?;
            let mut dropped = vec![];
            let mut stale = vec![];
            let pruned = existing.clone().map(|mut iface| {
                iface.memberships.retain(|vpn, _| {
                    let keep = computed.vpns.contains_key(vpn);
                    if !keep {
                        dropped.push(*vpn);
                    }
                    keep
                });
                for (vpn, stype) in &mut iface.memberships {
                    if let Some(derived) = computed.vpns.get(vpn) {
                        *stype = *derived;
                    }
                }
                for vpn in &dropped {
                    stale.extend(iface.primary_adjacencies().map(|a| VpnIpKey {
                        vpn_id: *vpn,
                        ip: a.ip_prefix.addr(),
                    }));
                }
                iface
            });
            if !dropped.is_empty() {
                info!("Dropping stale memberships of port {} in {dropped:?}", port.id);
            }
            let written = self
                .write_locked(
                    port,
                    port.is_router_interface(),
                    pruned,
                    existing.as_ref(),
                    &computed,
                    &stale,
                )
                .await?;
            (written, computed.routers, dropped, existing.is_some())
        };
        if written.is_none() && existed {
            for map in self.store().read_all::<RouterInterfacesMap>().await? {
                if map.interfaces.contains(&port.id) {
                    self.remove_router_interface(map.router_id, port.id).await?;
                }
            }
        } else {
            self.register_router_interfaces(port.id, &routers).await?;
        }
        for vpn in dropped {
            self.purge_learnt_vips(vpn, port.id).await;
        }
        Ok(written)
    }

    /// Move the interface of a port whose subnet changed VPN: memberships to `old_vpns` are
    /// stripped and the interface recomputed, in a single transaction.
    pub async fn move_interface(
        &self,
        port: &Port,
        subnet_id: Id<Subnet>,
        old_vpns: &[Id<Vpn>],
        purge_learnt: bool,
    ) -> EngineResult<Option<VpnInterface>> {
        let (written, routers) = {
            let _guard = self.shared.lock_blocking(LockKey::Interface(port.id)).await;
            let existing = self.get(port.id).await?;
            let mut stale = vec![];
            let stripped = existing.clone().map(|mut iface| {
                for vpn in old_vpns {
                    if iface.remove_membership(*vpn) {
                        stale.extend(
                            iface
                                .primary_adjacencies()
                                .filter(|a| a.subnet_id == Some(subnet_id))
                                .map(|a| VpnIpKey {
                                    vpn_id: *vpn,
                                    ip: a.ip_prefix.addr(),
                                }),
                        );
                    }
                }
                iface
            });
            let computed = self
                .compute_adjacencies(port, port.is_router_interface(), stripped.as_ref())
                .await?;
            let written = self
                .write_locked(
                    port,
                    port.is_router_interface(),
                    stripped,
                    existing.as_ref(),
                    &computed,
                    &stale,
                )
                .await?;
            (written, computed.routers)
        };
        self.register_router_interfaces(port.id, &routers).await?;
        if purge_learnt {
            for vpn in old_vpns {
                if !written.as_ref().is_some_and(|i| i.is_member_of(*vpn)) {
                    self.purge_learnt_vips(*vpn, port.id).await;
                }
            }
        }
        debug!("Moved interface of port {} out of {old_vpns:?}", port.id);
        Ok(written)
    }

    /// Merge `computed` into `base` and write the result with the port lock held, diffing
    /// against `existing`. `stale` port-IP mappings are deleted in the same transaction.
    /// An interface left with no membership is deleted.
    async fn write_locked(
        &self,
        port: &Port,
        is_router_interface: bool,
        base: Option<VpnInterface>,
        existing: Option<&VpnInterface>,
        computed: &ComputedInterface,
        stale: &[VpnIpKey],
    ) -> EngineResult<Option<VpnInterface>> {
        let mut tx = Transaction::new();
        for key in stale {
            if self.store().exists::<PortIpMapping>(key).await? {
                tx.delete::<PortIpMapping>(key);
            }
        }

        let mut iface = base
            .unwrap_or_else(|| VpnInterface::new(port.id, port.network_id, is_router_interface));
        iface.is_router_interface = is_router_interface;
        iface.merge_memberships(computed.vpns.iter().map(|(v, t)| (*v, *t)));
        iface.adjacencies.clone_from(&computed.adjacencies);

        let result = if iface.memberships.is_empty() {
            if existing.is_some() {
                tx.delete::<VpnInterface>(&port.id);
                info!("Deleting VPN interface of port {}", port.id);
            }
            None
        } else {
            if existing != Some(&iface) {
                debug!(
                    "Writing VPN interface of port {} in {:?}",
                    port.id,
                    iface.memberships.keys().collect::<Vec<_>>()
                );
                tx.put(iface.clone());
            }
            for mapping in &computed.port_ips {
                let current = self.store().read::<PortIpMapping>(&mapping.key()).await?;
                if current.as_ref() != Some(mapping) {
                    tx.put(mapping.clone());
                }
            }
            Some(iface)
        };
        if !tx.is_empty() {
            self.store().submit(tx).await?;
        }
        Ok(result)
    }

    /// Remove the adjacencies `subnetmap` owns from the interface of `port_id`. The interface
    /// is deleted when nothing else keeps it in a VPN.
    pub async fn withdraw_subnet_from_interface(
        &self,
        vpn_id: Id<Vpn>,
        internet_vpn_id: Option<Id<Vpn>>,
        port_id: Id<Port>,
        subnetmap: &SubnetMap,
    ) -> EngineResult<Option<VpnInterface>> {
        let vpns: Vec<Id<Vpn>> = [Some(vpn_id), internet_vpn_id].into_iter().flatten().collect();
        let (result, orphaned, left) = {
            let _guard = self.shared.lock_blocking(LockKey::Interface(port_id)).await;
            let Some(mut iface) = self.get(port_id).await? else {
                debug!("Port {port_id} has no VPN interface");
                return Ok(None);
            };
            let mut bound = BTreeMap::new();
            for other in iface.subnets() {
                if other == subnetmap.subnet_id {
                    continue;
                }
                if let Some(sm) = self.store().read::<SubnetMap>(&other).await? {
                    let in_vpns: BTreeSet<Id<Vpn>> =
                        [sm.vpn_id, sm.internet_vpn_id].into_iter().flatten().collect();
                    bound.insert(other, in_vpns);
                }
            }
            let before = iface.clone();
            let withdrawal =
                iface.withdraw_subnet(subnetmap.subnet_id, subnetmap.family(), &vpns, &bound);
            let mut tx = Transaction::new();
            for adj in withdrawal.removed.iter().filter(|a| a.is_primary()) {
                for vpn in &vpns {
                    let key = VpnIpKey {
                        vpn_id: *vpn,
                        ip: adj.ip_prefix.addr(),
                    };
                    if self.store().exists::<PortIpMapping>(&key).await? {
                        tx.delete::<PortIpMapping>(&key);
                    }
                }
            }
            let left: Vec<Id<Vpn>> = vpns
                .iter()
                .filter(|v| withdrawal.orphaned || !iface.is_member_of(**v))
                .copied()
                .collect();
            let result = if withdrawal.orphaned {
                tx.delete::<VpnInterface>(&port_id);
                None
            } else {
                if iface != before {
                    tx.put(iface.clone());
                }
                Some(iface)
            };
            if !tx.is_empty() {
                self.store().submit(tx).await?;
            }
            (result, withdrawal.orphaned, left)
        };
        if orphaned {
            info!(
                "Deleted VPN interface of port {port_id} after withdrawing subnet {}",
                subnetmap.subnet_id
            );
            if let Some(router_id) = subnetmap.router_id {
                self.remove_router_interface(router_id, port_id).await?;
            }
        }
        for vpn in left {
            self.purge_learnt_vips(vpn, port_id).await;
        }
        Ok(result)
    }

    /// Strip the membership to `vpn_id` from an interface, or delete it outright if no VPN is
    /// given. The interface is deleted with its last membership. Returns whether it was deleted.
    pub async fn delete_vpn_interface(
        &self,
        port_id: Id<Port>,
        vpn_id: Option<Id<Vpn>>,
    ) -> EngineResult<bool> {
        let (deleted, left) = {
            let _guard = self.shared.lock_blocking(LockKey::Interface(port_id)).await;
            let Some(mut iface) = self.get(port_id).await? else {
                return Ok(false);
            };
            let left: Vec<Id<Vpn>> = match vpn_id {
                Some(vpn) if iface.remove_membership(vpn) => vec![vpn],
                Some(_) => return Ok(false),
                None => std::mem::take(&mut iface.memberships).into_keys().collect(),
            };
            let mut tx = Transaction::new();
            for adj in iface.primary_adjacencies() {
                for vpn in &left {
                    let key = VpnIpKey {
                        vpn_id: *vpn,
                        ip: adj.ip_prefix.addr(),
                    };
                    if self.store().exists::<PortIpMapping>(&key).await? {
                        tx.delete::<PortIpMapping>(&key);
                    }
                }
            }
            let deleted = iface.memberships.is_empty();
            if deleted {
                tx.delete::<VpnInterface>(&port_id);
            } else {
                tx.put(iface);
            }
            self.store().submit(tx).await?;
            (deleted, left)
        };
        if deleted {
            info!("Deleted VPN interface of port {port_id}");
            for map in self.store().read_all::<RouterInterfacesMap>().await? {
                if map.interfaces.contains(&port_id) {
                    self.remove_router_interface(map.router_id, port_id).await?;
                }
            }
        }
        for vpn in left {
            self.purge_learnt_vips(vpn, port_id).await;
        }
        Ok(deleted)
    }

    /// Add or remove the next hops of static routes of a router on the interfaces of the ports
    /// owning them in `vpn_id`
    pub async fn update_extra_routes(
        &self,
        vpn_id: Id<Vpn>,
        routes: &[Route],
        add: bool,
    ) -> EngineResult<()> {
        for route in routes {
            let key = VpnIpKey {
                vpn_id,
                ip: route.nexthop,
            };
            let Some(mapping) = self.store().read::<PortIpMapping>(&key).await? else {
                debug!(
                    "Next hop {} of route {} is not a port of VPN {vpn_id}",
                    route.nexthop, route.destination
                );
                continue;
            };
            let _guard = self
                .shared
                .lock_blocking(LockKey::Interface(mapping.port_id))
                .await;
            let Some(mut iface) = self.get(mapping.port_id).await? else {
                continue;
            };
            if iface.is_router_interface {
                continue;
            }
            if iface
                .adjacencies
                .get(&route.destination)
                .is_some_and(Adjacency::is_primary)
            {
                warn!(
                    "Extra route {} shadows a fixed IP of port {}",
                    route.destination, mapping.port_id
                );
                continue;
            }
            let changed = if add {
                iface.merge_adjacencies([Adjacency::extra_route(
                    route.destination,
                    BTreeSet::from([route.nexthop]),
                )])
            } else {
                iface.remove_extra_route_hops(route.destination, &[route.nexthop])
            };
            if changed {
                debug!(
                    "{} extra route {} via {} on port {}",
                    if add { "Added" } else { "Removed" },
                    route.destination,
                    route.nexthop,
                    mapping.port_id
                );
                self.store().put(iface).await?;
            }
        }
        Ok(())
    }

    /// Ports of the subnets routed by `router_id` that have a VPN interface
    pub async fn router_interfaces(&self, router_id: Id<Router>) -> EngineResult<BTreeSet<Id<Port>>> {
        Ok(self
            .store()
            .read::<RouterInterfacesMap>(&router_id)
            .await?
            .map(|m| m.interfaces)
            .unwrap_or_default())
    }

    async fn register_router_interfaces(
        &self,
        port_id: Id<Port>,
        routers: &BTreeSet<Id<Router>>,
    ) -> EngineResult<()> {
        for router_id in routers {
            self.add_router_interface(*router_id, port_id).await?;
        }
        Ok(())
    }

    pub async fn add_router_interface(&self, router_id: Id<Router>, port_id: Id<Port>) -> EngineResult<()> {
        let _guard = self.shared.lock(LockKey::Router(router_id)).await?;
        let mut map = self
            .store()
            .read::<RouterInterfacesMap>(&router_id)
            .await?
            .unwrap_or_else(|| RouterInterfacesMap::new(router_id));
        if map.interfaces.insert(port_id) {
            debug!("Port {port_id} is now an interface of router {router_id}");
            self.store().put(map).await?;
        }
        Ok(())
    }

    pub async fn remove_router_interface(
        &self,
        router_id: Id<Router>,
        port_id: Id<Port>,
    ) -> EngineResult<()> {
        let _guard = self.shared.lock(LockKey::Router(router_id)).await?;
        let Some(mut map) = self.store().read::<RouterInterfacesMap>(&router_id).await? else {
            return Ok(());
        };
        if !map.interfaces.remove(&port_id) {
            return Ok(());
        }
        if map.interfaces.is_empty() {
            self.store().delete::<RouterInterfacesMap>(&router_id).await?;
        } else {
            self.store().put(map).await?;
        }
        debug!("Port {port_id} is no longer an interface of router {router_id}");
        Ok(())
    }

    /// Remove the VIPs learnt behind a port in a VPN. Failures are logged, not propagated.
    pub async fn purge_learnt_vips(&self, vpn_id: Id<Vpn>, port_id: Id<Port>) {
        let purge = async {
            let learnt: Vec<LearntVip> = self
                .store()
                .read_all::<LearntVip>()
                .await?
                .into_iter()
                .filter(|v| v.vpn_id == vpn_id && v.port_id == port_id)
                .collect();
            if learnt.is_empty() {
                return Ok(0);
            }
            let mut tx = Transaction::new();
            for vip in &learnt {
                tx.delete::<LearntVip>(&vip.key());
            }
            self.store().submit(tx).await.map(|()| learnt.len())
        };
        match purge.await {
            Ok(0) => {}
            Ok(n) => debug!("Purged {n} learnt VIPs of port {port_id} in VPN {vpn_id}"),
            Err(e) => warn!("Failed to purge learnt VIPs of port {port_id} in VPN {vpn_id}: {e}"),
        }
    }
}

fn merge_membership(
    vpns: &mut BTreeMap<Id<Vpn>, AssociatedSubnetType>,
    vpn: Id<Vpn>,
    family: IpFamily,
) {
    vpns.entry(vpn)
        .and_modify(|t| *t = t.with(family))
        .or_insert_with(|| AssociatedSubnetType::of(family));
}
