// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::{Network, Port, Router, Tenant};
use id::Id;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FloatingIp {
    pub id: Id<FloatingIp>,
    pub tenant_id: Id<Tenant>,
    pub floating_network_id: Id<Network>,
    pub floating_ip_address: IpAddr,
    #[serde(default)]
    pub port_id: Option<Id<Port>>,
    #[serde(default)]
    pub fixed_ip_address: Option<IpAddr>,
    #[serde(default)]
    pub router_id: Option<Id<Router>>,
}

impl FloatingIp {
    /// The fixed port and IP this floating IP is associated to, with its router
    #[must_use]
    pub fn association(&self) -> Option<(Id<Router>, Id<Port>, IpAddr)> {
        Some((self.router_id?, self.port_id?, self.fixed_ip_address?))
    }
}
