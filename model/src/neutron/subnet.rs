// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::{Network, Tenant};
use crate::IpFamily;
use id::Id;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subnet {
    pub id: Id<Subnet>,
    #[serde(default)]
    pub name: String,
    pub network_id: Id<Network>,
    pub tenant_id: Id<Tenant>,
    pub cidr: IpNet,
    #[serde(default)]
    pub gateway_ip: Option<IpAddr>,
}

impl Subnet {
    #[must_use]
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.cidr.addr())
    }
}
