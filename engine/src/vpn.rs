// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Owner of the VPN aggregates ([`VpnInstance`] and [`VpnMap`]).
//!
//! A router belongs to exactly one VPN map: the map of the VPN internal to the router, or that
//! of the external VPN it is associated to. Association moves it from the former to the latter
//! in a single transaction, under the router lock and then both VPN locks.

use crate::collab::VPN_TAG_POOL;
use crate::context::Shared;
use crate::{EngineError, EngineResult, LockKey};
use async_trait::async_trait;
use derive_builder::Builder;
use id::Id;
use model::aggregates::{VpnInstance, VpnMap};
use model::neutron::{L3vpnRequest, Network, Router, Subnet, Tenant, Vpn};
use model::{AddressFamily, IpFamily};
use std::sync::Arc;
use store::{Datastore, Transaction};
use tracectl::trace_target;
use tracing::{debug, info, warn};

trace_target!("vpn", LevelFilter::INFO, &["vpn", "vpnsync"]);

/// Attributes of a VPN instance to create or update
#[derive(Builder, Debug, Clone, PartialEq, Eq)]
#[builder(setter(into))]
pub struct VpnParams {
    pub vpn_id: Id<Vpn>,
    #[builder(default)]
    pub name: String,
    #[builder(default)]
    pub tenant_id: Option<Id<Tenant>>,
    #[builder(default)]
    pub route_distinguishers: Vec<String>,
    #[builder(default)]
    pub import_rts: Vec<String>,
    #[builder(default)]
    pub export_rts: Vec<String>,
    #[builder(default)]
    pub is_l2: bool,
    #[builder(default)]
    pub l3vni: Option<u32>,
    #[builder(default)]
    pub family_hint: AddressFamily,
}

impl From<&L3vpnRequest> for VpnParams {
    fn from(req: &L3vpnRequest) -> Self {
        Self {
            vpn_id: req.id,
            name: req.name.clone(),
            tenant_id: req.tenant_id,
            route_distinguishers: req.route_distinguishers.clone(),
            import_rts: req.import_rts.clone(),
            export_rts: req.export_rts.clone(),
            is_l2: false,
            l3vni: req.l3vni,
            family_hint: AddressFamily::empty(),
        }
    }
}

/// Undoes the associations of a VPN, on behalf of [`VpnLifecycleManager::delete_vpn`]
#[async_trait]
pub trait Dissociator: Send + Sync {
    async fn dissociate_router(&self, vpn_id: Id<Vpn>, router_id: Id<Router>) -> EngineResult<()>;
    async fn dissociate_network(&self, vpn_id: Id<Vpn>, network_id: Id<Network>) -> EngineResult<()>;
}

#[derive(Clone)]
pub struct VpnLifecycleManager {
    shared: Arc<Shared>,
}

impl VpnLifecycleManager {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    fn store(&self) -> &dyn Datastore {
        self.shared.store.as_ref()
    }

    pub async fn get_instance(&self, vpn_id: Id<Vpn>) -> EngineResult<Option<VpnInstance>> {
        Ok(self.store().read::<VpnInstance>(&vpn_id).await?)
    }

    pub async fn get_map(&self, vpn_id: Id<Vpn>) -> EngineResult<Option<VpnMap>> {
        Ok(self.store().read::<VpnMap>(&vpn_id).await?)
    }

    pub async fn instances(&self) -> EngineResult<Vec<VpnInstance>> {
        Ok(self.store().read_all::<VpnInstance>().await?)
    }

    pub async fn maps(&self) -> EngineResult<Vec<VpnMap>> {
        Ok(self.store().read_all::<VpnMap>().await?)
    }

    async fn allocate_tag(&self, vpn_id: Id<Vpn>) -> EngineResult<u32> {
        self.shared
            .collab
            .allocator
            .allocate_id(VPN_TAG_POOL, &vpn_id.to_string())
            .await
    }

    /// Create a VPN instance and its map, or update the attributes of an existing instance.
    /// Route targets are merged and the BGP VPN type follows the presence of RDs.
    pub async fn create_or_update_vpn_instance(&self, params: &VpnParams) -> EngineResult<VpnInstance> {
        let vpn_id = params.vpn_id;
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let existing = self.get_instance(vpn_id).await?;
        let mut instance = existing
            .clone()
            .unwrap_or_else(|| VpnInstance::new(vpn_id, &params.name));
        instance.configure(
            &params.route_distinguishers,
            &params.import_rts,
            &params.export_rts,
        );
        instance.is_l2 = params.is_l2;
        instance.l3vni = params.l3vni;
        instance.requested_family = params.family_hint;
        if instance.vpn_tag.is_none() {
            instance.vpn_tag = Some(self.allocate_tag(vpn_id).await?);
        }

        let mut tx = Transaction::new();
        if existing.as_ref() != Some(&instance) {
            tx.put(instance.clone());
        }
        if self.get_map(vpn_id).await?.is_none() {
            tx.put(VpnMap::new(vpn_id, &params.name, params.tenant_id));
        }
        self.store().submit(tx).await?;
        if existing.is_none() {
            info!(
                "Created VPN {vpn_id} '{}' type {} tag {:?}",
                instance.name, instance.bgpvpn_type, instance.vpn_tag
            );
        } else {
            debug!("Updated VPN {vpn_id}");
        }
        Ok(instance)
    }

    /// The VPN of the router's map, internal or external
    pub async fn vpn_of_router(&self, router_id: Id<Router>) -> EngineResult<Option<Id<Vpn>>> {
        Ok(self
            .maps()
            .await?
            .into_iter()
            .find(|m| m.router_ids.contains(&router_id))
            .map(|m| m.vpn_id))
    }

    /// The external VPN a router is associated to
    pub async fn external_vpn_of_router(&self, router_id: Id<Router>) -> EngineResult<Option<Id<Vpn>>> {
        Ok(self
            .maps()
            .await?
            .into_iter()
            .find(|m| m.router_ids.contains(&router_id) && !m.is_internal_to(router_id))
            .map(|m| m.vpn_id))
    }

    pub async fn vpn_of_network(&self, network_id: Id<Network>) -> EngineResult<Option<Id<Vpn>>> {
        Ok(self
            .maps()
            .await?
            .into_iter()
            .find(|m| m.network_ids.contains(&network_id))
            .map(|m| m.vpn_id))
    }

    /// Create the VPN internal to a router. The router joins the internal map unless it is
    /// associated to an external VPN already.
    pub async fn create_internal_vpn(&self, router: &Router) -> EngineResult<VpnInstance> {
        let vpn_id: Id<Vpn> = router.id.retag();
        let _router_guard = self.shared.lock(LockKey::Router(router.id)).await?;
        let external = self.external_vpn_of_router(router.id).await?;
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;

        let mut tx = Transaction::new();
        let instance = match self.get_instance(vpn_id).await? {
            Some(instance) => instance,
            None => {
                let mut instance = VpnInstance::internal(router);
                instance.vpn_tag = Some(self.allocate_tag(vpn_id).await?);
                tx.put(instance.clone());
                instance
            }
        };
        if self.get_map(vpn_id).await?.is_none() {
            let mut map = VpnMap::internal(router);
            if external.is_some() {
                map.remove_router(router.id);
            }
            tx.put(map);
        }
        if !tx.is_empty() {
            self.store().submit(tx).await?;
            info!("Created internal VPN of router {}", router.id);
        }
        Ok(instance)
    }

    /// Associate a router to an external VPN. The router leaves its internal VPN map.
    pub async fn associate_router(&self, vpn_id: Id<Vpn>, router_id: Id<Router>) -> EngineResult<()> {
        let internal_id: Id<Vpn> = router_id.retag();
        if vpn_id == internal_id {
            return Err(EngineError::conflict(format!(
                "VPN {vpn_id} is internal to router {router_id}"
            )));
        }
        let _router_guard = self.shared.lock(LockKey::Router(router_id)).await?;
        if let Some(other) = self.external_vpn_of_router(router_id).await? {
            if other == vpn_id {
                debug!("Router {router_id} already associated to VPN {vpn_id}");
                return Ok(());
            }
            return Err(EngineError::conflict(format!(
                "router {router_id} is already associated to VPN {other}"
            )));
        }
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let _internal_guard = self.shared.lock(LockKey::Vpn(internal_id)).await?;
        let mut map = self
            .get_map(vpn_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("VPN {vpn_id}")))?;
        map.add_router(router_id);

        let mut tx = Transaction::new();
        tx.put(map);
        if let Some(mut internal) = self.get_map(internal_id).await?
            && internal.remove_router(router_id)
        {
            tx.put(internal);
        }
        self.store().submit(tx).await?;
        info!("Associated router {router_id} to VPN {vpn_id}");
        Ok(())
    }

    /// Dissociate a router from an external VPN. The router returns to its internal VPN map.
    pub async fn dissociate_router(&self, vpn_id: Id<Vpn>, router_id: Id<Router>) -> EngineResult<bool> {
        let internal_id: Id<Vpn> = router_id.retag();
        let _router_guard = self.shared.lock(LockKey::Router(router_id)).await?;
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let _internal_guard = self.shared.lock(LockKey::Vpn(internal_id)).await?;
        let Some(mut map) = self.get_map(vpn_id).await? else {
            return Ok(false);
        };
        if !map.remove_router(router_id) {
            debug!("Router {router_id} is not associated to VPN {vpn_id}");
            return Ok(false);
        }
        let mut tx = Transaction::new();
        tx.put(map);
        if let Some(mut internal) = self.get_map(internal_id).await?
            && internal.add_router(router_id)
        {
            tx.put(internal);
        }
        self.store().submit(tx).await?;
        info!("Dissociated router {router_id} from VPN {vpn_id}");
        Ok(true)
    }

    pub async fn associate_network(&self, vpn_id: Id<Vpn>, network_id: Id<Network>) -> EngineResult<()> {
        let _network_guard = self.shared.lock(LockKey::Network(network_id)).await?;
        if let Some(other) = self.vpn_of_network(network_id).await? {
            if other == vpn_id {
                return Ok(());
            }
            return Err(EngineError::conflict(format!(
                "network {network_id} is already associated to VPN {other}"
            )));
        }
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let mut map = self
            .get_map(vpn_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("VPN {vpn_id}")))?;
        map.add_network(network_id);
        self.store().put(map).await?;
        info!("Associated network {network_id} to VPN {vpn_id}");
        Ok(())
    }

    pub async fn dissociate_network(&self, vpn_id: Id<Vpn>, network_id: Id<Network>) -> EngineResult<bool> {
        let _network_guard = self.shared.lock(LockKey::Network(network_id)).await?;
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let Some(mut map) = self.get_map(vpn_id).await? else {
            return Ok(false);
        };
        if !map.remove_network(network_id) {
            return Ok(false);
        }
        self.store().put(map).await?;
        info!("Dissociated network {network_id} from VPN {vpn_id}");
        Ok(true)
    }

    /// Count (or stop counting) `subnet` as a contributor of `family` to the VPN.
    /// Returns the resulting address family of the VPN.
    pub async fn update_address_family(
        &self,
        vpn_id: Id<Vpn>,
        family: IpFamily,
        subnet_id: Id<Subnet>,
        add: bool,
    ) -> EngineResult<AddressFamily> {
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let mut instance = self
            .get_instance(vpn_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("VPN {vpn_id}")))?;
        let before = instance.clone();
        let flipped = if add {
            instance.add_family_ref(family, subnet_id)
        } else {
            instance.remove_family_ref(family, subnet_id)
        };
        if flipped {
            info!(
                "VPN {vpn_id} address family is now {}",
                instance.address_family()
            );
        }
        if instance != before {
            self.store().put(instance.clone()).await?;
        }
        Ok(instance.address_family())
    }

    /// Replace the subnets counted in the address families of a VPN. Returns whether the
    /// count was off.
    pub async fn recount_address_family(
        &self,
        vpn_id: Id<Vpn>,
        refs: impl IntoIterator<Item = (IpFamily, Id<Subnet>)> + Send,
    ) -> EngineResult<bool> {
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let Some(mut instance) = self.get_instance(vpn_id).await? else {
            return Ok(false);
        };
        if !instance.set_family_refs(refs) {
            return Ok(false);
        }
        self.store().put(instance.clone()).await?;
        warn!(
            "Recounted address family of VPN {vpn_id}: {}",
            instance.address_family()
        );
        Ok(true)
    }

    /// Turn a BGP VPN into an internet VPN or back
    pub async fn set_internet(&self, vpn_id: Id<Vpn>, internet: bool) -> EngineResult<VpnInstance> {
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let mut instance = self
            .get_instance(vpn_id)
            .await?
            .ok_or_else(|| EngineError::not_found(format!("VPN {vpn_id}")))?;
        if instance.is_internal() && internet {
            return Err(EngineError::conflict(format!(
                "internal VPN {vpn_id} cannot become an internet VPN"
            )));
        }
        if instance.set_internet(internet) {
            self.store().put(instance.clone()).await?;
            info!("VPN {vpn_id} is now of type {}", instance.bgpvpn_type);
        }
        Ok(instance)
    }

    /// Delete a VPN after undoing all of its associations. If some dissociation fails, the
    /// remaining associations are kept and deleting again resumes from there.
    pub async fn delete_vpn(&self, vpn_id: Id<Vpn>, dissociator: &dyn Dissociator) -> EngineResult<()> {
        if let Some(map) = self.get_map(vpn_id).await? {
            for router_id in &map.router_ids {
                if !map.is_internal_to(*router_id) {
                    dissociator.dissociate_router(vpn_id, *router_id).await?;
                }
            }
            for network_id in &map.network_ids {
                dissociator.dissociate_network(vpn_id, *network_id).await?;
            }
        }
        self.remove_vpn_nodes(vpn_id).await
    }

    /// Delete the map and instance of a VPN, releasing its tag. Maps of external VPNs must
    /// have no association left.
    pub async fn remove_vpn_nodes(&self, vpn_id: Id<Vpn>) -> EngineResult<()> {
        let _guard = self.shared.lock(LockKey::Vpn(vpn_id)).await?;
        let map = self.get_map(vpn_id).await?;
        let instance = self.get_instance(vpn_id).await?;
        if map.is_none() && instance.is_none() {
            debug!("VPN {vpn_id} already deleted");
            return Ok(());
        }
        let internal = instance.as_ref().is_some_and(VpnInstance::is_internal);
        if let Some(map) = &map
            && !internal
            && !map.is_deletable()
        {
            return Err(EngineError::conflict(format!(
                "VPN {vpn_id} still has {} routers and {} networks",
                map.router_ids.len(),
                map.network_ids.len()
            )));
        }
        let mut tx = Transaction::new();
        tx.delete::<VpnMap>(&vpn_id).delete::<VpnInstance>(&vpn_id);
        self.store().submit(tx).await?;
        if let Some(tag) = instance.and_then(|i| i.vpn_tag) {
            if let Err(e) = self
                .shared
                .collab
                .allocator
                .release_id(VPN_TAG_POOL, &vpn_id.to_string())
                .await
            {
                warn!("Failed to release tag {tag} of VPN {vpn_id}: {e}");
            }
        }
        info!("Deleted VPN {vpn_id}");
        Ok(())
    }
}
