// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Which port owns an IP in a VPN

use crate::neutron::{Port, Subnet, Vpn};
use id::Id;
use mac_address::MacAddress;
use serde::Serialize;
use std::fmt::Display;
use std::net::IpAddr;
use store::{LogicalStore, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VpnIpKey {
    pub vpn_id: Id<Vpn>,
    pub ip: IpAddr,
}

impl Display for VpnIpKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.vpn_id, self.ip)
    }
}

/// A fixed IP of a port in a VPN, written along with its primary adjacency
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortIpMapping {
    pub vpn_id: Id<Vpn>,
    pub ip: IpAddr,
    pub port_id: Id<Port>,
    pub mac: MacAddress,
    pub subnet_id: Id<Subnet>,
}

impl Record for PortIpMapping {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "port-ip-mappings";
    type Key = VpnIpKey;
    fn key(&self) -> VpnIpKey {
        VpnIpKey {
            vpn_id: self.vpn_id,
            ip: self.ip,
        }
    }
}

/// A virtual IP learnt by the dataplane behind a port
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LearntVip {
    pub vpn_id: Id<Vpn>,
    pub ip: IpAddr,
    pub port_id: Id<Port>,
}

impl Record for LearntVip {
    const STORE: LogicalStore = LogicalStore::Operational;
    const TREE: &'static str = "learnt-vips";
    type Key = VpnIpKey;
    fn key(&self) -> VpnIpKey {
        VpnIpKey {
            vpn_id: self.vpn_id,
            ip: self.ip,
        }
    }
}
