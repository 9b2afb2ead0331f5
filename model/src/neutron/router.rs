// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::{FixedIp, Network, Tenant};
use id::Id;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// A static route of a router
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Route {
    pub destination: IpNet,
    pub nexthop: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalGateway {
    pub network_id: Id<Network>,
    #[serde(default)]
    pub external_fixed_ips: Vec<FixedIp>,
    #[serde(default = "enabled")]
    pub enable_snat: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Router {
    pub id: Id<Router>,
    #[serde(default)]
    pub name: String,
    pub tenant_id: Id<Tenant>,
    #[serde(default)]
    pub routes: Vec<Route>,
    #[serde(default)]
    pub gateway: Option<ExternalGateway>,
}

impl Router {
    #[must_use]
    pub fn external_network(&self) -> Option<Id<Network>> {
        self.gateway.as_ref().map(|gw| gw.network_id)
    }

    /// Routes whose next hop is `nexthop`
    pub fn routes_via(&self, nexthop: IpAddr) -> impl Iterator<Item = &Route> {
        self.routes.iter().filter(move |r| r.nexthop == nexthop)
    }
}
