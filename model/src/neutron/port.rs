// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

use super::{Network, Subnet, Tenant};
use id::Id;
use mac_address::MacAddress;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// Well-known values of [`Port::device_owner`] and [`Port::device_id`]
pub mod device_owner {
    pub const ROUTER_INTERFACE: &str = "network:router_interface";
    pub const ROUTER_GATEWAY: &str = "network:router_gateway";
    pub const FLOATING_IP: &str = "network:floatingip";
    pub const DHCP: &str = "network:dhcp";
    /// device id of floating-IP ports not yet bound to their floating IP
    pub const PENDING_DEVICE_ID: &str = "PENDING";
}

/// How the port is bound to its host. Direct ports bypass the virtual switch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum VnicType {
    #[default]
    Normal,
    Direct,
    DirectPhysical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FixedIp {
    pub subnet_id: Id<Subnet>,
    pub ip: IpAddr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    pub id: Id<Port>,
    #[serde(default)]
    pub name: String,
    pub network_id: Id<Network>,
    pub tenant_id: Id<Tenant>,
    pub mac: MacAddress,
    #[serde(default)]
    pub fixed_ips: Vec<FixedIp>,
    #[serde(default)]
    pub device_owner: String,
    #[serde(default)]
    pub device_id: String,
    #[serde(default)]
    pub vnic_type: VnicType,
}

impl Port {
    #[must_use]
    pub fn is_router_interface(&self) -> bool {
        self.device_owner == device_owner::ROUTER_INTERFACE
    }
    #[must_use]
    pub fn is_router_gateway(&self) -> bool {
        self.device_owner == device_owner::ROUTER_GATEWAY
    }
    #[must_use]
    pub fn is_floating_ip(&self) -> bool {
        self.device_owner == device_owner::FLOATING_IP
    }
    #[must_use]
    pub fn is_dhcp(&self) -> bool {
        self.device_owner == device_owner::DHCP
    }
    /// Direct ports are tracked in their subnets but get no VPN interface
    #[must_use]
    pub fn is_direct(&self) -> bool {
        matches!(self.vnic_type, VnicType::Direct | VnicType::DirectPhysical)
    }
    #[must_use]
    pub fn has_pending_device(&self) -> bool {
        self.device_id.eq_ignore_ascii_case(device_owner::PENDING_DEVICE_ID)
    }
    /// The device id parsed as an identifier, if it is one
    #[must_use]
    pub fn device<T>(&self) -> Option<Id<T>> {
        Id::try_from(self.device_id.as_str()).ok()
    }
    #[must_use]
    pub fn fixed_ip_in(&self, subnet_id: Id<Subnet>) -> Option<IpAddr> {
        self.fixed_ips
            .iter()
            .find(|f| f.subnet_id == subnet_id)
            .map(|f| f.ip)
    }
    /// Distinct subnets the port has fixed IPs in, in order of appearance
    pub fn subnets(&self) -> impl Iterator<Item = Id<Subnet>> + '_ {
        self.fixed_ips
            .iter()
            .enumerate()
            .filter(|(n, f)| !self.fixed_ips[..*n].iter().any(|o| o.subnet_id == f.subnet_id))
            .map(|(_, f)| f.subnet_id)
    }
}
