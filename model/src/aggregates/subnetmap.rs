// SPDX-License-Identifier: Apache-2.0
// Copyright Open Network Fabric Authors

//! Derived view of one subnet: where it is routed and which ports live in it.

use crate::IpFamily;
use crate::neutron::{Network, NetworkType, Port, Router, Subnet, Tenant, Vpn};
use crate::{ModelError, ModelResult};
use bitflags::bitflags;
use id::Id;
use ipnet::IpNet;
use mac_address::MacAddress;
use serde::Serialize;
use std::collections::BTreeSet;
use std::net::IpAddr;
use store::{LogicalStore, Record};
use tracing::debug;

/// The router port connecting a subnet to its router
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RouterInterfaceInfo {
    pub port_id: Id<Port>,
    pub fixed_ip: IpAddr,
    pub mac: MacAddress,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubnetMap {
    pub subnet_id: Id<Subnet>,
    pub network_id: Option<Id<Network>>,
    pub tenant_id: Id<Tenant>,
    pub cidr: IpNet,
    pub network_type: NetworkType,
    pub segmentation_id: Option<u32>,
    pub external: bool,
    pub router_id: Option<Id<Router>>,
    pub router_interface: Option<RouterInterfaceInfo>,
    pub vpn_id: Option<Id<Vpn>>,
    pub internet_vpn_id: Option<Id<Vpn>>, /* IPv6 only */
    pub port_list: BTreeSet<Id<Port>>,
    pub direct_port_list: BTreeSet<Id<Port>>,
}

/// Bindings to upsert on a subnet. Fields left to `None` are not modified.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VpnBinding {
    pub router_id: Option<Id<Router>>,
    pub vpn_id: Option<Id<Vpn>>,
    pub internet_vpn_id: Option<Id<Vpn>>,
}

impl VpnBinding {
    #[must_use]
    pub fn vpn(vpn_id: Id<Vpn>) -> Self {
        Self {
            vpn_id: Some(vpn_id),
            ..Self::default()
        }
    }
    #[must_use]
    pub fn router(mut self, router_id: Id<Router>) -> Self {
        self.router_id = Some(router_id);
        self
    }
    #[must_use]
    pub fn internet(mut self, internet_vpn_id: Id<Vpn>) -> Self {
        self.internet_vpn_id = Some(internet_vpn_id);
        self
    }
}

bitflags! {
    /// Bindings to clear on a subnet
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Unbind: u8 {
        const ROUTER = 0b0001;
        const VPN = 0b0010;
        const INTERNET_VPN = 0b0100;
        const NETWORK = 0b1000;
    }
}

impl SubnetMap {
    #[must_use]
    pub fn new(subnet: &Subnet, network: &Network) -> Self {
        Self {
            subnet_id: subnet.id,
            network_id: Some(subnet.network_id),
            tenant_id: subnet.tenant_id,
            cidr: subnet.cidr,
            network_type: network.network_type,
            segmentation_id: network.segmentation_id,
            external: network.external,
            router_id: None,
            router_interface: None,
            vpn_id: None,
            internet_vpn_id: None,
            port_list: BTreeSet::new(),
            direct_port_list: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn family(&self) -> IpFamily {
        IpFamily::of(&self.cidr.addr())
    }

    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.family() == IpFamily::V6
    }

    /// Every VPN the subnet is currently routed through
    pub fn vpns(&self) -> impl Iterator<Item = Id<Vpn>> {
        self.vpn_id.into_iter().chain(self.internet_vpn_id)
    }

    /// Upsert the non-empty fields of `binding`. Returns whether something changed.
    pub fn bind(&mut self, binding: VpnBinding) -> ModelResult<bool> {
        if binding.internet_vpn_id.is_some() && !self.is_ipv6() {
            return Err(ModelError::InternetVpnOnIpv4(self.subnet_id));
        }
        let before = (self.router_id, self.vpn_id, self.internet_vpn_id);
        self.router_id = binding.router_id.or(self.router_id);
        self.vpn_id = binding.vpn_id.or(self.vpn_id);
        self.internet_vpn_id = binding.internet_vpn_id.or(self.internet_vpn_id);
        let changed = before != (self.router_id, self.vpn_id, self.internet_vpn_id);
        if changed {
            debug!(
                "Subnet {} bound: router={:?} vpn={:?} internet-vpn={:?}",
                self.subnet_id, self.router_id, self.vpn_id, self.internet_vpn_id
            );
        }
        Ok(changed)
    }

    /// Clear the requested bindings. Ports are left untouched.
    pub fn unbind(&mut self, what: Unbind) -> bool {
        let before = self.clone();
        if what.contains(Unbind::ROUTER) {
            self.router_id = None;
            self.router_interface = None;
        }
        if what.contains(Unbind::VPN) {
            self.vpn_id = None;
        }
        if what.contains(Unbind::INTERNET_VPN) {
            self.internet_vpn_id = None;
        }
        if what.contains(Unbind::NETWORK) {
            self.network_id = None;
        }
        *self != before
    }

    pub fn attach_port(&mut self, port_id: Id<Port>) -> bool {
        self.port_list.insert(port_id)
    }

    pub fn attach_direct_port(&mut self, port_id: Id<Port>) -> bool {
        self.direct_port_list.insert(port_id)
    }

    pub fn detach_port(&mut self, port_id: Id<Port>) -> bool {
        let removed = self.port_list.remove(&port_id);
        self.direct_port_list.remove(&port_id) || removed
    }

    /// Detach every port, returning the ones that were attached
    pub fn detach_all(&mut self) -> BTreeSet<Id<Port>> {
        let mut ports = std::mem::take(&mut self.port_list);
        ports.append(&mut self.direct_port_list);
        ports
    }
}

impl Record for SubnetMap {
    const STORE: LogicalStore = LogicalStore::Configuration;
    const TREE: &'static str = "subnetmaps";
    type Key = Id<Subnet>;
    fn key(&self) -> Id<Subnet> {
        self.subnet_id
    }
}

#[cfg(test)]
mod tests {
    use super::{SubnetMap, Unbind, VpnBinding};
    use crate::ModelError;
    use crate::neutron::{Network, NetworkType, Subnet};
    use id::Id;
    use pretty_assertions::assert_eq;

    fn subnetmap(cidr: &str) -> SubnetMap {
        let network = Network {
            id: Id::new(),
            name: "net".to_string(),
            tenant_id: Id::new(),
            network_type: NetworkType::Vxlan,
            segmentation_id: Some(1000),
            external: false,
        };
        let subnet = Subnet {
            id: Id::new(),
            name: "sub".to_string(),
            network_id: network.id,
            tenant_id: network.tenant_id,
            cidr: cidr.parse().expect("Should parse"),
            gateway_ip: None,
        };
        SubnetMap::new(&subnet, &network)
    }

    #[test]
    fn bind_upserts_only_given_fields() {
        let mut sm = subnetmap("10.0.0.0/24");
        let router = Id::new();
        let vpn = Id::new();
        assert!(sm.bind(VpnBinding::vpn(vpn).router(router)).expect("Should succeed"));
        assert!(!sm.bind(VpnBinding::default()).expect("Should succeed"));
        assert_eq!(sm.router_id, Some(router));
        assert_eq!(sm.vpn_id, Some(vpn));
    }

    #[test]
    fn internet_vpn_is_ipv6_only() {
        let mut sm = subnetmap("10.0.0.0/24");
        let res = sm.bind(VpnBinding::default().internet(Id::new()));
        assert_eq!(res, Err(ModelError::InternetVpnOnIpv4(sm.subnet_id)));
        assert_eq!(sm.internet_vpn_id, None);

        let mut sm = subnetmap("2001:db8::/64");
        let vpn = Id::new();
        let inet = Id::new();
        sm.bind(VpnBinding::vpn(vpn).internet(inet))
            .expect("Should succeed");
        assert_eq!(sm.vpns().collect::<Vec<_>>(), vec![vpn, inet]);
    }

    #[test]
    fn unbind_keeps_ports() {
        let mut sm = subnetmap("10.0.0.0/24");
        let port = Id::new();
        assert!(sm.attach_port(port));
        assert!(!sm.attach_port(port));
        sm.bind(VpnBinding::vpn(Id::new()).router(Id::new()))
            .expect("Should succeed");
        assert!(sm.unbind(Unbind::VPN | Unbind::ROUTER));
        assert!(!sm.unbind(Unbind::VPN));
        assert_eq!(sm.vpn_id, None);
        assert_eq!(sm.router_id, None);
        assert!(sm.port_list.contains(&port));
    }

    #[test]
    fn detach_all() {
        let mut sm = subnetmap("10.0.0.0/24");
        let (p1, p2) = (Id::new(), Id::new());
        sm.attach_port(p1);
        sm.attach_direct_port(p2);
        assert!(sm.detach_port(p2));
        assert!(!sm.detach_port(p2));
        sm.attach_direct_port(p2);
        let all = sm.detach_all();
        assert_eq!(all.len(), 2);
        assert!(sm.port_list.is_empty() && sm.direct_port_list.is_empty());
    }
}
