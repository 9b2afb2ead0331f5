// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Owner of the subnet aggregates ([`SubnetMap`]).
//!
//! Every mutation is a read-modify-write cycle under the subnet's lock.

use crate::context::Shared;
use crate::{EngineError, EngineResult, LockKey};
use id::Id;
use model::aggregates::{PendingPortAssociation, RouterInterfaceInfo, SubnetMap, Unbind, VpnBinding};
use model::neutron::{Network, Port, Router, Subnet};
use std::collections::BTreeSet;
use std::sync::Arc;
use store::{Datastore, Record, Transaction};
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("subnet", LevelFilter::INFO, &["subnet", "vpnsync"]);

#[derive(Clone)]
pub struct SubnetAssociationManager {
    shared: Arc<Shared>,
}

impl SubnetAssociationManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn store(&self) -> &dyn Datastore {
        self.shared.store.as_ref()
    }

    pub async fn get(&self, subnet_id: Id<Subnet>) -> EngineResult<Option<SubnetMap>> {
        Ok(self.store().read::<SubnetMap>(&subnet_id).await?)
    }

    /// Create the aggregate of a subnet. Creating an existing aggregate is a no-op.
    /// Ports that referenced the subnet before it existed are attached in the same transaction.
    pub async fn create_subnet_aggregate(
        &self,
        subnet: &Subnet,
        network: &Network,
    ) -> EngineResult<Option<SubnetMap>> {
        let _guard = self.shared.lock(LockKey::Subnet(subnet.id)).await?;
        if self.get(subnet.id).await?.is_some() {
            warn!("Subnet aggregate {} already exists", subnet.id);
            return Ok(None);
        }
        let mut subnetmap = SubnetMap::new(subnet, network);
        let pending = self.shared.pending.drain(subnet.id);
        let mut tx = Transaction::new();
        for entry in &pending {
            if entry.direct {
                subnetmap.attach_direct_port(entry.port_id);
            } else {
                subnetmap.attach_port(entry.port_id);
            }
            if self.shared.config.pending_cache_persist {
                tx.delete::<PendingPortAssociation>(&entry.key());
            }
        }
        tx.put(subnetmap.clone());
        if let Err(e) = self.store().submit(tx).await {
            self.shared.pending.restore(pending);
            return Err(e.into());
        }
        info!(
            "Created subnet aggregate {} ({}) with {} pending ports",
            subnet.id,
            subnet.cidr,
            pending.len()
        );
        Ok(Some(subnetmap))
    }

    async fn modify<F>(&self, subnet_id: Id<Subnet>, f: F) -> EngineResult<SubnetMap>
    where
        F: FnOnce(&mut SubnetMap) -> EngineResult<bool> + Send,
    {
        let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
        let mut subnetmap = self
            .get(subnet_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("subnet {subnet_id}")))?;
        if f(&mut subnetmap)? {
            self.store().put(subnetmap.clone()).await?;
        }
        Ok(subnetmap)
    }

    /// Upsert the given bindings
    pub async fn bind_vpn(&self, subnet_id: Id<Subnet>, binding: VpnBinding) -> EngineResult<SubnetMap> {
        self.modify(subnet_id, |sm| Ok(sm.bind(binding)?)).await
    }

    /// Clear the requested bindings. Ports stay attached.
    pub async fn unbind_vpn(&self, subnet_id: Id<Subnet>, what: Unbind) -> EngineResult<SubnetMap> {
        debug!("Unbinding {what:?} from subnet {subnet_id}");
        self.modify(subnet_id, |sm| Ok(sm.unbind(what))).await
    }

    /// Record the router port of a subnet along with its router
    pub async fn set_router_interface(
        &self,
        subnet_id: Id<Subnet>,
        router_id: Id<Router>,
        info: RouterInterfaceInfo,
    ) -> EngineResult<SubnetMap> {
        self.modify(subnet_id, |sm| {
            let changed = sm.router_interface != Some(info);
            sm.router_interface = Some(info);
            Ok(sm.bind(VpnBinding::default().router(router_id))? || changed)
        })
        .await
    }

    /// Refresh the network attributes copied into the aggregate
    pub async fn update_network_attributes(
        &self,
        subnet_id: Id<Subnet>,
        network: &Network,
    ) -> EngineResult<SubnetMap> {
        self.modify(subnet_id, |sm| {
            let before = (sm.network_type, sm.segmentation_id, sm.external);
            sm.network_type = network.network_type;
            sm.segmentation_id = network.segmentation_id;
            sm.external = network.external;
            Ok(before != (sm.network_type, sm.segmentation_id, sm.external))
        })
        .await
    }

    /// Attach a port, or a direct port, to a subnet. If the subnet aggregate does not exist
    /// yet, the association is deferred until it does and `None` is returned.
    pub async fn attach_port(
        &self,
        subnet_id: Id<Subnet>,
        port_id: Option<Id<Port>>,
        direct_port_id: Option<Id<Port>>,
    ) -> EngineResult<Option<SubnetMap>> {
        let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
        let Some(mut subnetmap) = self.get(subnet_id).await? else {
            let waiting: Vec<PendingPortAssociation> = [(port_id, false), (direct_port_id, true)]
                .into_iter()
                .filter_map(|(port, direct)| {
                    port.map(|port_id| PendingPortAssociation {
                        subnet_id,
                        port_id,
                        direct,
                    })
                })
                .collect();
            if self.shared.config.pending_cache_persist {
                let mut tx = Transaction::new();
                for entry in &waiting {
                    tx.put(*entry);
                }
                self.store().submit(tx).await?;
            }
            // deposited only once persisted
            for entry in waiting {
                self.shared
                    .pending
                    .deposit(entry.subnet_id, entry.port_id, entry.direct);
            }
            return Ok(None);
        };
        let mut changed = false;
        if let Some(port) = port_id {
            changed |= subnetmap.attach_port(port);
        }
        if let Some(port) = direct_port_id {
            changed |= subnetmap.attach_direct_port(port);
        }
        if changed {
            debug!("Attached ports {port_id:?}/{direct_port_id:?} to subnet {subnet_id}");
            self.store().put(subnetmap.clone()).await?;
        }
        Ok(Some(subnetmap))
    }

    /// Detach a port from a subnet, or stop waiting for the subnet if it does not exist
    pub async fn detach_port(
        &self,
        subnet_id: Id<Subnet>,
        port_id: Id<Port>,
    ) -> EngineResult<Option<SubnetMap>> {
        let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
        let Some(mut subnetmap) = self.get(subnet_id).await? else {
            let forgotten = self.shared.pending.forget(subnet_id, port_id);
            if self.shared.config.pending_cache_persist {
                let mut tx = Transaction::new();
                for entry in &forgotten {
                    tx.delete::<PendingPortAssociation>(&entry.key());
                }
                if let Err(e) = self.store().submit(tx).await {
                    self.shared.pending.restore(forgotten);
                    return Err(e.into());
                }
            }
            return Ok(None);
        };
        if subnetmap.detach_port(port_id) {
            debug!("Detached port {port_id} from subnet {subnet_id}");
            self.store().put(subnetmap.clone()).await?;
        }
        Ok(Some(subnetmap))
    }

    /// Detach every port of a subnet. Returns the ports that were attached.
    pub async fn detach_all(&self, subnet_id: Id<Subnet>) -> EngineResult<BTreeSet<Id<Port>>> {
        let mut detached = BTreeSet::new();
        self.modify(subnet_id, |sm| {
            detached = sm.detach_all();
            Ok(!detached.is_empty())
        })
        .await?;
        Ok(detached)
    }

    /// Delete the aggregate. Dependents must have been detached before.
    pub async fn destroy_subnet_aggregate(&self, subnet_id: Id<Subnet>) -> EngineResult<Option<SubnetMap>> {
        let _guard = self.shared.lock(LockKey::Subnet(subnet_id)).await?;
        let Some(subnetmap) = self.get(subnet_id).await? else {
            debug!("Subnet aggregate {subnet_id} already deleted");
            return Ok(None);
        };
        if !subnetmap.port_list.is_empty() {
            warn!(
                "Deleting subnet aggregate {subnet_id} with {} ports still attached",
                subnetmap.port_list.len()
            );
        }
        let mut tx = Transaction::new();
        tx.delete::<SubnetMap>(&subnet_id);
        for entry in self.shared.pending.drain(subnet_id) {
            if self.shared.config.pending_cache_persist {
                tx.delete::<PendingPortAssociation>(&entry.key());
            }
        }
        self.store().submit(tx).await?;
        info!("Deleted subnet aggregate {subnet_id}");
        Ok(Some(subnetmap))
    }

    /// Aggregates of the subnets routed by `router`
    pub async fn subnets_of_router(&self, router_id: Id<Router>) -> EngineResult<Vec<SubnetMap>> {
        Ok(self
            .store()
            .read_all::<SubnetMap>()
            .await?
            .into_iter()
            .filter(|sm| sm.router_id == Some(router_id))
            .collect())
    }

    /// Aggregates of the subnets of `network`
    pub async fn subnets_of_network(&self, network_id: Id<Network>) -> EngineResult<Vec<SubnetMap>> {
        Ok(self
            .store()
            .read_all::<SubnetMap>()
            .await?
            .into_iter()
            .filter(|sm| sm.network_id == Some(network_id))
            .collect())
    }
}
