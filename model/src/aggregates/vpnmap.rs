// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Associations of a VPN with routers and networks

use crate::neutron::{Network, Router, Tenant, Vpn};
use id::Id;
use serde::Serialize;
use std::collections::BTreeSet;
use store::{LogicalStore, Record};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VpnMap {
    pub vpn_id: Id<Vpn>,
    pub name: String,
    pub tenant_id: Option<Id<Tenant>>,
    pub router_ids: BTreeSet<Id<Router>>,
    pub network_ids: BTreeSet<Id<Network>>,
}

impl VpnMap {
    #[must_use]
    pub fn new(vpn_id: Id<Vpn>, name: &str, tenant_id: Option<Id<Tenant>>) -> Self {
        Self {
            vpn_id,
            name: name.to_owned(),
            tenant_id,
            router_ids: BTreeSet::new(),
            network_ids: BTreeSet::new(),
        }
    }

    /// The map of the VPN internal to a router. It shares the router's identity.
    #[must_use]
    pub fn internal(router: &Router) -> Self {
        let mut map = Self::new(router.id.retag(), &router.name, Some(router.tenant_id));
        map.router_ids.insert(router.id);
        map
    }

    #[must_use]
    pub fn is_internal_to(&self, router_id: Id<Router>) -> bool {
        self.vpn_id == router_id.retag()
    }

    pub fn add_router(&mut self, router_id: Id<Router>) -> bool {
        self.router_ids.insert(router_id)
    }

    pub fn remove_router(&mut self, router_id: Id<Router>) -> bool {
        self.router_ids.remove(&router_id)
    }

    pub fn add_network(&mut self, network_id: Id<Network>) -> bool {
        self.network_ids.insert(network_id)
    }

    pub fn remove_network(&mut self, network_id: Id<Network>) -> bool {
        self.network_ids.remove(&network_id)
    }

    /// A map with no router and no network can be deleted
    #[must_use]
    pub fn is_deletable(&self) -> bool {
        self.router_ids.is_empty() && self.network_ids.is_empty()
    }
}

impl Record for VpnMap {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "vpnmaps";
    type Key = Id<Vpn>;
    fn key(&self) -> Id<Vpn> {
        self.vpn_id
    }
}
